//! Payout calculator: pure money arithmetic.
//!
//! Amounts are always recomputed from the stored purchase amount and the
//! current template, never taken from the caller.

use crate::error::{Error, Result};
use crate::state::{GuaranteeTemplate, PayoutAmount, PayoutType};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::Serialize;

/// Round to cents, half away from zero.
pub fn round_money(amount: Decimal) -> Decimal {
    amount.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero)
}

/// Refund / credit amount: purchase × percent, or the fixed amount capped
/// at the purchase.
pub fn calculate_payout_amount(purchase_amount: Decimal, template: &GuaranteeTemplate) -> Decimal {
    match template.payout_amount {
        PayoutAmount::Percent => round_money(purchase_amount * template.refund_or_credit_percent),
        PayoutAmount::Fixed(amount) => round_money(amount.min(purchase_amount)),
    }
}

/// Rollover amount: payout amount × bonus multiplier.
pub fn calculate_rollover_credit(
    purchase_amount: Decimal,
    template: &GuaranteeTemplate,
) -> Decimal {
    round_money(
        calculate_payout_amount(purchase_amount, template) * template.rollover_bonus_multiplier,
    )
}

/// Amount a given payout type pays out.
pub fn amount_for(
    payout_type: PayoutType,
    purchase_amount: Decimal,
    template: &GuaranteeTemplate,
) -> Decimal {
    if payout_type.is_rollover() {
        calculate_rollover_credit(purchase_amount, template)
    } else {
        calculate_payout_amount(purchase_amount, template)
    }
}

/// Integer cents for the gateway.
pub fn to_minor_units(amount: Decimal) -> Result<i64> {
    (round_money(amount) * Decimal::ONE_HUNDRED)
        .to_i64()
        .ok_or_else(|| Error::InvalidArgument(format!("Amount {} is out of range", amount)))
}

/// "$500.00"
pub fn format_money(amount: Decimal) -> String {
    format!("${:.2}", round_money(amount))
}

/// Deterministic gateway idempotency key for one payout of one instance.
pub fn idempotency_key(instance_id: &str, payout_type: PayoutType) -> String {
    let material = format!("guarantee:{}:{}", instance_id, payout_type);
    hex::encode(crate::sha256_digest(material.as_bytes()))
}

/// What one menu entry would pay right now.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PayoutQuote {
    pub payout_type: PayoutType,
    pub label: String,
    pub amount: Decimal,
    /// Set for rollover types.
    pub bonus_multiplier: Option<Decimal>,
}

/// Quotes for every payout type the template offers, in menu order.
pub fn quote_menu(purchase_amount: Decimal, template: &GuaranteeTemplate) -> Vec<PayoutQuote> {
    template
        .payout_types
        .iter()
        .map(|&payout_type| PayoutQuote {
            payout_type,
            label: payout_type.label().to_string(),
            amount: amount_for(payout_type, purchase_amount, template),
            bonus_multiplier: payout_type
                .is_rollover()
                .then_some(template.rollover_bonus_multiplier),
        })
        .collect()
}
