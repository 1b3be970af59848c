//! Resolution coordinator: turns a client's payout choice into exactly one
//! side effect and one terminal status.
//!
//! Per request:
//! 1. validate: instance exists, email matches, status is `conditions_met`,
//!    payout type is on the template's menu
//! 2. take the resolution claim (conditional write; a loser sees `InvalidState`)
//! 3. run the branch: gateway call and side record, idempotency-keyed
//! 4. compare-and-set the instance to its terminal status under the claim
//!
//! A failure before step 4 releases the claim and leaves the instance at
//! `conditions_met`, so the same request can be retried. Side records are
//! written before the instance, so a crash in between leaves at most an
//! unused side record which the retry picks up again.

use super::payout::{
    calculate_payout_amount, calculate_rollover_credit, format_money, idempotency_key,
    to_minor_units,
};
use super::GuaranteeEngine;
use crate::clock::Clock;
use crate::error::{Error, Result};
use crate::gateway::{require_id, PaymentGateway, RefundRequest, SubscriptionRequest};
use crate::state::{
    ClientSubscription, DiscountCode, GuaranteeInstance, GuaranteeStatus, GuaranteeTemplate,
    PayoutReceipt, PayoutType, StatusTransition, SubscriptionStatus,
};
use crate::storage::GuaranteeRepository;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::collections::BTreeMap;

/// What the client received.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PayoutOutcome {
    RefundIssued {
        refund_id: String,
        amount: Decimal,
    },
    CreditIssued {
        discount_code: String,
        discount_code_id: String,
        amount: Decimal,
    },
    RolloverUpsellApplied {
        discount_code: String,
        discount_code_id: String,
        credit_amount: Decimal,
        bonus_multiplier: Decimal,
    },
    RolloverContinuityApplied {
        subscription_id: String,
        stripe_subscription_id: String,
        credit_amount: Decimal,
        plan_name: String,
        amount_per_interval: Decimal,
    },
}

impl PayoutOutcome {
    pub fn payout_type(&self) -> PayoutType {
        match self {
            PayoutOutcome::RefundIssued { .. } => PayoutType::Refund,
            PayoutOutcome::CreditIssued { .. } => PayoutType::Credit,
            PayoutOutcome::RolloverUpsellApplied { .. } => PayoutType::RolloverUpsell,
            PayoutOutcome::RolloverContinuityApplied { .. } => PayoutType::RolloverContinuity,
        }
    }

    pub fn status(&self) -> GuaranteeStatus {
        self.payout_type().resolved_status()
    }

    /// Client-facing confirmation.
    pub fn message(&self) -> String {
        match self {
            PayoutOutcome::RefundIssued { amount, .. } => format!(
                "Your refund of {} has been processed.",
                format_money(*amount)
            ),
            PayoutOutcome::CreditIssued {
                discount_code,
                amount,
                ..
            } => format!(
                "Your credit of {} has been issued. Use code {} on your next purchase.",
                format_money(*amount),
                discount_code
            ),
            PayoutOutcome::RolloverUpsellApplied {
                discount_code,
                credit_amount,
                ..
            } => format!(
                "Your credit of {} has been issued! Use code {} toward your upgrade.",
                format_money(*credit_amount),
                discount_code
            ),
            PayoutOutcome::RolloverContinuityApplied {
                credit_amount,
                plan_name,
                ..
            } => format!(
                "Your {} credit has been applied to your {} subscription. You'll pay $0 until the credit is exhausted.",
                format_money(*credit_amount),
                plan_name
            ),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PayoutResolution {
    /// Instance as committed.
    pub instance: GuaranteeInstance,
    pub outcome: PayoutOutcome,
}

/// A branch's result, ready to commit.
struct Settlement {
    transition: StatusTransition,
    outcome: PayoutOutcome,
}

fn not_claimable(status: GuaranteeStatus) -> Error {
    Error::InvalidState(format!(
        "Payout can only be chosen when status is conditions_met. Current: {}",
        status
    ))
}

fn plan_not_synced() -> Error {
    Error::Precondition(
        "Continuity plan not found or not synced to the payment processor".to_string(),
    )
}

/// Alphanumeric part of an id, upper-cased.
fn code_suffix(id: &str, len: usize) -> String {
    id.chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .take(len)
        .collect::<String>()
        .to_uppercase()
}

impl<R, G, C> GuaranteeEngine<R, G, C>
where
    R: GuaranteeRepository,
    G: PaymentGateway,
    C: Clock,
{
    /// Resolve a `conditions_met` guarantee with the client's chosen payout.
    pub fn choose_payout(
        &self,
        instance_id: &str,
        payout_type: PayoutType,
        client_email: &str,
    ) -> Result<PayoutResolution> {
        let instance = self.require_instance(instance_id)?;
        self.authorize_client(&instance, client_email)?;
        if instance.status != GuaranteeStatus::ConditionsMet {
            tracing::warn!(instance_id, status = %instance.status, "payout chosen in wrong status");
            return Err(not_claimable(instance.status));
        }
        let template = self.require_template(&instance)?;
        if !template.offers(payout_type) {
            return Err(Error::InvalidArgument(format!(
                "Payout type {} is not offered by this guarantee",
                payout_type
            )));
        }

        let token = crate::new_id();
        let now = self.now();
        let ttl = self.settings.claim_ttl;
        if !self
            .repo
            .claim_resolution(&instance.id, &token, payout_type, now, ttl)?
        {
            return Err(self.claim_conflict(&instance.id, payout_type));
        }
        tracing::info!(instance_id, payout_type = %payout_type, "resolution claimed");

        let settlement = match self.settle(&instance, &template, payout_type, now) {
            Ok(settlement) => settlement,
            Err(e) => {
                tracing::warn!(
                    instance_id,
                    payout_type = %payout_type,
                    error = %e,
                    "payout failed, guarantee left at conditions_met"
                );
                self.release(&instance.id, &token);
                return Err(e);
            }
        };

        let transition = settlement.transition.under_claim(token.as_str());
        let committed = match self
            .repo
            .transition_status(&instance.id, &transition, self.now(), ttl)
        {
            Ok(committed) => committed,
            Err(e) => {
                tracing::error!(instance_id, error = %e, "failed to commit payout");
                self.release(&instance.id, &token);
                return Err(e);
            }
        };
        if !committed {
            tracing::error!(instance_id, "resolution claim lost before commit");
            return Err(self.claim_conflict(&instance.id, payout_type));
        }

        let instance = self.require_instance(&instance.id)?;
        tracing::info!(
            instance_id,
            payout_type = %payout_type,
            status = %instance.status,
            "guarantee resolved"
        );
        Ok(PayoutResolution {
            instance,
            outcome: settlement.outcome,
        })
    }

    /// Error for a request that lost the claim race, or that asked for a
    /// different payout than an abandoned claim had started.
    fn claim_conflict(&self, instance_id: &str, payout_type: PayoutType) -> Error {
        let now = self.now();
        match self.repo.load_instance(instance_id) {
            Ok(Some(current)) if current.status != GuaranteeStatus::ConditionsMet => {
                not_claimable(current.status)
            }
            Ok(Some(current)) => match &current.claim {
                Some(claim)
                    if claim.payout_type != payout_type
                        && !claim.is_live(now, self.settings.claim_ttl) =>
                {
                    tracing::warn!(
                        instance_id,
                        started = %claim.payout_type,
                        requested = %payout_type,
                        "abandoned payout blocks a different payout type"
                    );
                    Error::InvalidState(format!(
                        "A {} payout was already started for this guarantee. Retry it or ask an admin to resolve the guarantee",
                        claim.payout_type
                    ))
                }
                _ => Error::InvalidState(
                    "A payout for this guarantee is already being processed".to_string(),
                ),
            },
            Ok(None) => Error::NotFound(format!("Guarantee instance {} not found", instance_id)),
            Err(e) => e,
        }
    }

    fn release(&self, instance_id: &str, token: &str) {
        if let Err(e) = self.repo.release_claim(instance_id, token, self.now()) {
            // Left to expire after the claim TTL.
            tracing::warn!(instance_id, error = %e, "failed to release resolution claim");
        }
    }

    fn settle(
        &self,
        instance: &GuaranteeInstance,
        template: &GuaranteeTemplate,
        payout_type: PayoutType,
        now: DateTime<Utc>,
    ) -> Result<Settlement> {
        match payout_type {
            PayoutType::Refund => self.settle_refund(instance, template, now),
            PayoutType::Credit => self.settle_credit(instance, template, now),
            PayoutType::RolloverUpsell => self.settle_rollover_upsell(instance, template, now),
            PayoutType::RolloverContinuity => {
                self.settle_rollover_continuity(instance, template, now)
            }
        }
    }

    fn settle_refund(
        &self,
        instance: &GuaranteeInstance,
        template: &GuaranteeTemplate,
        now: DateTime<Utc>,
    ) -> Result<Settlement> {
        let order = match instance.order_id.as_deref() {
            Some(order_id) => self.repo.load_order(order_id)?,
            None => None,
        };
        let Some((order_id, reference)) = order
            .as_ref()
            .and_then(|o| o.payment_reference().map(|r| (o.id.clone(), r.to_string())))
        else {
            return Err(Error::Precondition(
                "No payment reference to refund for this guarantee".to_string(),
            ));
        };

        let amount = calculate_payout_amount(instance.purchase_amount, template);
        let receipt = self.gateway.create_refund(&RefundRequest {
            payment_reference: reference,
            amount_minor: to_minor_units(amount)?,
            currency: self.settings.currency.clone(),
            idempotency_key: idempotency_key(&instance.id, PayoutType::Refund),
        })?;
        require_id(self.gateway.gateway_id(), "refund", &receipt.id)?;
        tracing::info!(
            instance_id = %instance.id,
            refund_id = %receipt.id,
            amount = %amount,
            "refund created"
        );

        self.repo.mark_order_refunded(&order_id)?;

        Ok(Settlement {
            transition: StatusTransition::new(
                GuaranteeStatus::ConditionsMet,
                GuaranteeStatus::RefundIssued,
            )
            .resolved(
                now,
                format!("Client chose refund. {} refunded.", format_money(amount)),
            )
            .with_payout(
                PayoutType::Refund,
                PayoutReceipt::Refund {
                    stripe_refund_id: receipt.id.clone(),
                },
            ),
            outcome: PayoutOutcome::RefundIssued {
                refund_id: receipt.id,
                amount,
            },
        })
    }

    fn settle_credit(
        &self,
        instance: &GuaranteeInstance,
        template: &GuaranteeTemplate,
        now: DateTime<Utc>,
    ) -> Result<Settlement> {
        let amount = calculate_payout_amount(instance.purchase_amount, template);
        let code = self.issue_discount_code(
            instance,
            &self.settings.credit_code_prefix,
            amount,
            None,
            now,
        )?;

        Ok(Settlement {
            transition: StatusTransition::new(
                GuaranteeStatus::ConditionsMet,
                GuaranteeStatus::CreditIssued,
            )
            .resolved(
                now,
                format!(
                    "Client chose credit. {} issued as code {}.",
                    format_money(code.discount_value),
                    code.code
                ),
            )
            .with_payout(
                PayoutType::Credit,
                PayoutReceipt::DiscountCode {
                    discount_code_id: code.id.clone(),
                },
            ),
            outcome: PayoutOutcome::CreditIssued {
                discount_code: code.code,
                discount_code_id: code.id,
                amount: code.discount_value,
            },
        })
    }

    fn settle_rollover_upsell(
        &self,
        instance: &GuaranteeInstance,
        template: &GuaranteeTemplate,
        now: DateTime<Utc>,
    ) -> Result<Settlement> {
        let amount = calculate_rollover_credit(instance.purchase_amount, template);
        // No product restriction on the code itself; the intended services
        // ride along for the redemption-time check.
        let code = self.issue_discount_code(
            instance,
            &self.settings.upsell_code_prefix,
            amount,
            template.rollover_upsell_service_ids.clone(),
            now,
        )?;
        let multiplier = template.rollover_bonus_multiplier.normalize();

        Ok(Settlement {
            transition: StatusTransition::new(
                GuaranteeStatus::ConditionsMet,
                GuaranteeStatus::RolloverUpsellApplied,
            )
            .resolved(
                now,
                format!(
                    "Client chose upsell rollover. {} credit ({}x multiplier) issued as code {}.",
                    format_money(code.discount_value),
                    multiplier,
                    code.code
                ),
            )
            .with_payout(
                PayoutType::RolloverUpsell,
                PayoutReceipt::DiscountCode {
                    discount_code_id: code.id.clone(),
                },
            )
            .with_rollover_credit(code.discount_value),
            outcome: PayoutOutcome::RolloverUpsellApplied {
                discount_code: code.code,
                discount_code_id: code.id,
                credit_amount: code.discount_value,
                bonus_multiplier: multiplier,
            },
        })
    }

    fn settle_rollover_continuity(
        &self,
        instance: &GuaranteeInstance,
        template: &GuaranteeTemplate,
        now: DateTime<Utc>,
    ) -> Result<Settlement> {
        let plan_id = template
            .rollover_continuity_plan_id
            .as_deref()
            .filter(|id| !id.trim().is_empty())
            .ok_or_else(|| {
                Error::Precondition(
                    "No continuity plan configured for this guarantee template".to_string(),
                )
            })?;
        let plan = self.repo.load_plan(plan_id)?.ok_or_else(plan_not_synced)?;
        let price_id = plan.synced_price_id().ok_or_else(plan_not_synced)?.to_string();

        let amount = calculate_rollover_credit(instance.purchase_amount, template);
        let gateway_id = self.gateway.gateway_id();

        let customer = self
            .gateway
            .find_or_create_customer(&instance.client_email, instance.client_name.as_deref())?;
        require_id(gateway_id, "customer", &customer.id)?;

        let mut metadata = BTreeMap::new();
        metadata.insert("guarantee_instance_id".to_string(), instance.id.clone());
        metadata.insert("continuity_plan_id".to_string(), plan.id.clone());
        let external = self.gateway.create_subscription(&SubscriptionRequest {
            customer_id: customer.id.clone(),
            price_id,
            trial_days: plan.trial_days,
            credit_amount_minor: to_minor_units(amount)?,
            currency: plan.currency.clone(),
            metadata,
            idempotency_key: idempotency_key(&instance.id, PayoutType::RolloverContinuity),
        })?;
        require_id(gateway_id, "subscription", &external.id)?;
        tracing::info!(
            instance_id = %instance.id,
            stripe_subscription_id = %external.id,
            plan_id = %plan.id,
            credit = %amount,
            "continuity subscription created"
        );

        let subscription = match self.repo.find_subscription_by_external_id(&external.id)? {
            Some(existing) => existing,
            None => self.repo.insert_subscription(ClientSubscription {
                id: crate::new_id(),
                continuity_plan_id: plan.id.clone(),
                client_email: instance.client_email.clone(),
                client_name: instance.client_name.clone(),
                order_id: instance.order_id.clone(),
                guarantee_instance_id: Some(instance.id.clone()),
                stripe_customer_id: customer.id,
                stripe_subscription_id: external.id.clone(),
                status: SubscriptionStatus::from_external(&external.status),
                current_period_start: external.current_period_start,
                current_period_end: external.current_period_end,
                credit_remaining: amount,
                credit_total: amount,
                created_at: now,
            })?,
        };

        Ok(Settlement {
            transition: StatusTransition::new(
                GuaranteeStatus::ConditionsMet,
                GuaranteeStatus::RolloverContinuityApplied,
            )
            .resolved(
                now,
                format!(
                    "Client chose continuity rollover. {} credit applied to {} subscription.",
                    format_money(amount),
                    plan.name
                ),
            )
            .with_payout(
                PayoutType::RolloverContinuity,
                PayoutReceipt::Subscription {
                    subscription_id: subscription.id.clone(),
                },
            )
            .with_rollover_credit(amount),
            outcome: PayoutOutcome::RolloverContinuityApplied {
                subscription_id: subscription.id,
                stripe_subscription_id: external.id,
                credit_amount: amount,
                plan_name: plan.name,
                amount_per_interval: plan.amount_per_interval,
            },
        })
    }

    /// Mint a single-use code for `instance`, or hand back the one an earlier
    /// attempt minted but never committed.
    fn issue_discount_code(
        &self,
        instance: &GuaranteeInstance,
        prefix: &str,
        amount: Decimal,
        intended_service_ids: Option<Vec<String>>,
        now: DateTime<Utc>,
    ) -> Result<DiscountCode> {
        let candidates = [
            format!("{}-{}", prefix, code_suffix(&instance.id, 8)),
            format!("{}-{}", prefix, code_suffix(&instance.id, usize::MAX)),
        ];
        for code in candidates {
            match self.repo.find_discount_code(&code)? {
                Some(existing) if existing.guarantee_instance_id.as_deref() == Some(&instance.id) => {
                    if existing.discount_value != amount {
                        tracing::warn!(
                            instance_id = %instance.id,
                            code = %existing.code,
                            minted = %existing.discount_value,
                            computed = %amount,
                            "reusing discount code minted with a different value"
                        );
                    }
                    tracing::info!(instance_id = %instance.id, code = %existing.code, "reusing discount code");
                    return Ok(existing);
                }
                // Short code already belongs to another guarantee
                Some(_) => continue,
                None => {
                    let minted = self.repo.insert_discount_code(DiscountCode {
                        id: crate::new_id(),
                        code,
                        discount_value: amount,
                        max_uses: 1,
                        times_used: 0,
                        applicable_product_ids: None,
                        intended_service_ids,
                        guarantee_instance_id: Some(instance.id.clone()),
                        is_active: true,
                        created_at: now,
                    })?;
                    tracing::info!(
                        instance_id = %instance.id,
                        code = %minted.code,
                        amount = %amount,
                        "discount code minted"
                    );
                    return Ok(minted);
                }
            }
        }
        Err(Error::InvalidState(format!(
            "No free discount code for guarantee {}",
            instance.id
        )))
    }
}
