//! Guarantee templates: the configuration blueprint each instance references.

use crate::error::{Error, Result};
use crate::state::instance::GuaranteeStatus;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

/// The mutually exclusive resolutions a client may pick once conditions are met.
#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PayoutType {
    /// Money back through the payment processor.
    Refund,
    /// Single-use store credit code worth the payout amount.
    Credit,
    /// Single-use credit code worth the rollover amount, meant for an upgrade.
    RolloverUpsell,
    /// Rollover amount applied as balance on a new continuity subscription.
    RolloverContinuity,
}

impl PayoutType {
    pub const ALL: [PayoutType; 4] = [
        PayoutType::Refund,
        PayoutType::Credit,
        PayoutType::RolloverUpsell,
        PayoutType::RolloverContinuity,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            PayoutType::Refund => "refund",
            PayoutType::Credit => "credit",
            PayoutType::RolloverUpsell => "rollover_upsell",
            PayoutType::RolloverContinuity => "rollover_continuity",
        }
    }

    /// Terminal status an instance lands in after this payout succeeds.
    pub fn resolved_status(&self) -> GuaranteeStatus {
        match self {
            PayoutType::Refund => GuaranteeStatus::RefundIssued,
            PayoutType::Credit => GuaranteeStatus::CreditIssued,
            PayoutType::RolloverUpsell => GuaranteeStatus::RolloverUpsellApplied,
            PayoutType::RolloverContinuity => GuaranteeStatus::RolloverContinuityApplied,
        }
    }

    /// Rollovers pay the multiplied amount.
    pub fn is_rollover(&self) -> bool {
        matches!(
            self,
            PayoutType::RolloverUpsell | PayoutType::RolloverContinuity
        )
    }

    pub fn label(&self) -> &'static str {
        match self {
            PayoutType::Refund => "Refund (money back)",
            PayoutType::Credit => "Credit (toward future purchase)",
            PayoutType::RolloverUpsell => "Rollover to Upsell (one-time credit)",
            PayoutType::RolloverContinuity => "Rollover to Continuity (subscription credit)",
        }
    }
}

impl fmt::Display for PayoutType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PayoutType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "refund" => Ok(PayoutType::Refund),
            "credit" => Ok(PayoutType::Credit),
            "rollover_upsell" => Ok(PayoutType::RolloverUpsell),
            "rollover_continuity" => Ok(PayoutType::RolloverContinuity),
            other => Err(Error::InvalidArgument(format!(
                "Invalid payout_type '{}'. Must be one of: refund, credit, rollover_upsell, rollover_continuity",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum GuaranteeType {
    /// Client must meet every required condition.
    #[default]
    Conditional,
    /// No questions asked: conditions are informational only.
    Unconditional,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum VerificationMethod {
    #[default]
    AdminVerified,
    ClientSelfReport,
}

/// One contractual condition as configured on the template.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuaranteeCondition {
    /// Slug unique within the template, e.g. "attend-sessions"
    pub id: String,
    pub label: String,
    #[serde(default)]
    pub verification_method: VerificationMethod,
    #[serde(default = "default_true")]
    pub required: bool,
}

/// Longest guarantee window a template may configure (ten years).
pub const MAX_DURATION_DAYS: u32 = 3650;

/// How the base payout is derived from the purchase amount.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PayoutAmount {
    /// purchase × `refund_or_credit_percent`; a full refund is percent 1.
    #[default]
    Percent,
    /// A flat amount, capped at the purchase amount.
    Fixed(Decimal),
}

/// Template aggregate.
///
/// Instances reference a template by id and read it at evaluation and
/// resolution time, so a template edit affects future evaluations of
/// in-flight instances but never rewrites an already resolved one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuaranteeTemplate {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub guarantee_type: GuaranteeType,
    /// Window length; `expires_at = starts_at + duration_days`.
    pub duration_days: u32,
    #[serde(default)]
    pub conditions: Vec<GuaranteeCondition>,
    /// Payout menu offered to the client.
    pub payout_types: Vec<PayoutType>,
    pub default_payout_type: PayoutType,
    /// Fraction of the purchase price payable (0.5 = half).
    pub refund_or_credit_percent: Decimal,
    #[serde(default)]
    pub payout_amount: PayoutAmount,
    /// Amplifies rollover credit versus plain credit; at least 1.
    #[serde(default = "default_multiplier")]
    pub rollover_bonus_multiplier: Decimal,
    #[serde(default)]
    pub rollover_upsell_service_ids: Option<Vec<String>>,
    #[serde(default)]
    pub rollover_continuity_plan_id: Option<String>,
    #[serde(default = "default_true")]
    pub is_active: bool,
}

fn default_true() -> bool {
    true
}

fn default_multiplier() -> Decimal {
    Decimal::ONE
}

impl GuaranteeTemplate {
    /// True if `payout_type` is on this template's menu.
    pub fn offers(&self, payout_type: PayoutType) -> bool {
        self.payout_types.contains(&payout_type)
    }

    pub fn is_unconditional(&self) -> bool {
        self.guarantee_type == GuaranteeType::Unconditional
    }

    /// Structural checks applied before a template is stored.
    pub fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() || self.name.trim().is_empty() {
            return Err(Error::InvalidArgument(
                "Template id and name are required".to_string(),
            ));
        }
        if self.duration_days == 0 || self.duration_days > MAX_DURATION_DAYS {
            return Err(Error::InvalidArgument(format!(
                "duration_days must be between 1 and {}, got {}",
                MAX_DURATION_DAYS, self.duration_days
            )));
        }
        if self.payout_types.is_empty() {
            return Err(Error::InvalidArgument(
                "Template must offer at least one payout type".to_string(),
            ));
        }
        if !self.offers(self.default_payout_type) {
            return Err(Error::InvalidArgument(format!(
                "default_payout_type {} is not in the payout menu",
                self.default_payout_type
            )));
        }
        if self.refund_or_credit_percent <= Decimal::ZERO
            || self.refund_or_credit_percent > Decimal::ONE
        {
            return Err(Error::InvalidArgument(format!(
                "refund_or_credit_percent must be in (0, 1], got {}",
                self.refund_or_credit_percent
            )));
        }
        if let PayoutAmount::Fixed(amount) = self.payout_amount {
            if amount <= Decimal::ZERO {
                return Err(Error::InvalidArgument(format!(
                    "Fixed payout amount must be positive, got {}",
                    amount
                )));
            }
        }
        if self.rollover_bonus_multiplier < Decimal::ONE {
            return Err(Error::InvalidArgument(format!(
                "rollover_bonus_multiplier must be >= 1, got {}",
                self.rollover_bonus_multiplier
            )));
        }
        let mut seen = HashSet::new();
        for condition in &self.conditions {
            if condition.id.trim().is_empty() || condition.label.trim().is_empty() {
                return Err(Error::InvalidArgument(
                    "Every condition needs a non-empty id and label".to_string(),
                ));
            }
            if !seen.insert(condition.id.as_str()) {
                return Err(Error::InvalidArgument(format!(
                    "Duplicate condition id '{}'",
                    condition.id
                )));
            }
        }
        Ok(())
    }
}
