//! Guarantee instance aggregate and its status state machine.
//!
//! ```text
//! active ──► conditions_met ──► refund_issued | credit_issued
//!   │              │            rollover_upsell_applied | rollover_continuity_applied
//!   │              └──► voided | expired (admin)
//!   └──► expired | voided
//! ```
//!
//! Invariants:
//! - `resolved_at.is_some()` implies a terminal status, and a resolved
//!   instance never changes again
//! - at most one payout receipt, matching `payout_type`
//! - a live resolution claim blocks every transition not presenting its token

use crate::error::{Error, Result};
use crate::state::template::{GuaranteeCondition, PayoutType};
use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GuaranteeStatus {
    Active,
    ConditionsMet,
    RefundIssued,
    CreditIssued,
    RolloverUpsellApplied,
    RolloverContinuityApplied,
    Expired,
    Voided,
}

impl GuaranteeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            GuaranteeStatus::Active => "active",
            GuaranteeStatus::ConditionsMet => "conditions_met",
            GuaranteeStatus::RefundIssued => "refund_issued",
            GuaranteeStatus::CreditIssued => "credit_issued",
            GuaranteeStatus::RolloverUpsellApplied => "rollover_upsell_applied",
            GuaranteeStatus::RolloverContinuityApplied => "rollover_continuity_applied",
            GuaranteeStatus::Expired => "expired",
            GuaranteeStatus::Voided => "voided",
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            GuaranteeStatus::Active => "Active",
            GuaranteeStatus::ConditionsMet => "Conditions Met - Awaiting Client Choice",
            GuaranteeStatus::RefundIssued => "Refund Issued",
            GuaranteeStatus::CreditIssued => "Credit Issued",
            GuaranteeStatus::RolloverUpsellApplied => "Upsell Credit Applied",
            GuaranteeStatus::RolloverContinuityApplied => "Continuity Credit Applied",
            GuaranteeStatus::Expired => "Expired",
            GuaranteeStatus::Voided => "Voided",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !self.is_open()
    }

    /// Active or conditions_met: milestones may still change.
    pub fn is_open(&self) -> bool {
        matches!(self, GuaranteeStatus::Active | GuaranteeStatus::ConditionsMet)
    }

    /// Edges of the state machine.
    pub fn can_transition_to(&self, next: GuaranteeStatus) -> bool {
        use GuaranteeStatus::*;
        match (self, next) {
            (Active, ConditionsMet) | (Active, Expired) | (Active, Voided) => true,
            (ConditionsMet, RefundIssued)
            | (ConditionsMet, CreditIssued)
            | (ConditionsMet, RolloverUpsellApplied)
            | (ConditionsMet, RolloverContinuityApplied)
            | (ConditionsMet, Voided)
            | (ConditionsMet, Expired) => true,
            _ => false,
        }
    }
}

impl fmt::Display for GuaranteeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for GuaranteeStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "active" => Ok(GuaranteeStatus::Active),
            "conditions_met" => Ok(GuaranteeStatus::ConditionsMet),
            "refund_issued" => Ok(GuaranteeStatus::RefundIssued),
            "credit_issued" => Ok(GuaranteeStatus::CreditIssued),
            "rollover_upsell_applied" => Ok(GuaranteeStatus::RolloverUpsellApplied),
            "rollover_continuity_applied" => Ok(GuaranteeStatus::RolloverContinuityApplied),
            "expired" => Ok(GuaranteeStatus::Expired),
            "voided" => Ok(GuaranteeStatus::Voided),
            other => Err(Error::InvalidArgument(format!(
                "Unknown guarantee status '{}'",
                other
            ))),
        }
    }
}

/// Side-effect receipt; the variant always matches the chosen payout type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PayoutReceipt {
    Refund { stripe_refund_id: String },
    DiscountCode { discount_code_id: String },
    Subscription { subscription_id: String },
}

/// Lease taken by a payout resolution before it calls the gateway.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolutionClaim {
    pub token: String,
    pub payout_type: PayoutType,
    pub claimed_at: DateTime<Utc>,
}

impl ResolutionClaim {
    /// A claim older than `ttl` belongs to a request that died mid-flight.
    pub fn is_live(&self, now: DateTime<Utc>, ttl: Duration) -> bool {
        self.claimed_at
            .checked_add_signed(ttl)
            .map_or(true, |deadline| now < deadline)
    }
}

/// Conditional update applied by `GuaranteeRepository::transition_status`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusTransition {
    pub expected: GuaranteeStatus,
    pub next: GuaranteeStatus,
    pub resolved_at: Option<DateTime<Utc>>,
    pub resolution_notes: Option<String>,
    pub payout_type: Option<PayoutType>,
    pub receipt: Option<PayoutReceipt>,
    pub rollover_credit_amount: Option<Decimal>,
    /// Token of the resolution claim this write is made under, if any.
    pub claim_token: Option<String>,
}

impl StatusTransition {
    pub fn new(expected: GuaranteeStatus, next: GuaranteeStatus) -> Self {
        StatusTransition {
            expected,
            next,
            resolved_at: None,
            resolution_notes: None,
            payout_type: None,
            receipt: None,
            rollover_credit_amount: None,
            claim_token: None,
        }
    }

    pub fn resolved(mut self, at: DateTime<Utc>, notes: impl Into<String>) -> Self {
        self.resolved_at = Some(at);
        self.resolution_notes = Some(notes.into());
        self
    }

    pub fn with_payout(mut self, payout_type: PayoutType, receipt: PayoutReceipt) -> Self {
        self.payout_type = Some(payout_type);
        self.receipt = Some(receipt);
        self
    }

    pub fn with_rollover_credit(mut self, amount: Decimal) -> Self {
        self.rollover_credit_amount = Some(amount);
        self
    }

    pub fn under_claim(mut self, token: impl Into<String>) -> Self {
        self.claim_token = Some(token.into());
        self
    }
}

/// Guarantee instance aggregate: one client's conditional promise for one purchase.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuaranteeInstance {
    pub id: String,
    pub guarantee_template_id: String,
    pub order_id: Option<String>,
    pub order_item_id: Option<String>,
    /// Authorization key for every client-initiated action.
    pub client_email: String,
    pub client_name: Option<String>,
    pub purchase_amount: Decimal,
    pub status: GuaranteeStatus,
    /// Template conditions as they were when the guarantee was issued.
    pub conditions_snapshot: Vec<GuaranteeCondition>,
    pub starts_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub resolution_notes: Option<String>,
    pub payout_type: Option<PayoutType>,
    pub receipt: Option<PayoutReceipt>,
    pub rollover_credit_amount: Option<Decimal>,
    pub claim: Option<ResolutionClaim>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl GuaranteeInstance {
    /// Case-insensitive possession-of-email check.
    pub fn is_owned_by(&self, email: &str) -> bool {
        let email = email.trim();
        !email.is_empty() && self.client_email.trim().eq_ignore_ascii_case(email)
    }

    pub fn is_resolved(&self) -> bool {
        self.resolved_at.is_some()
    }

    /// Strictly past the deadline.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }

    /// Whole days left in the window, rounded up, never negative.
    pub fn days_remaining(&self, now: DateTime<Utc>) -> i64 {
        let secs = (self.expires_at - now).num_seconds();
        if secs <= 0 {
            return 0;
        }
        (secs + 86_399) / 86_400
    }

    pub fn stripe_refund_id(&self) -> Option<&str> {
        match &self.receipt {
            Some(PayoutReceipt::Refund { stripe_refund_id }) => Some(stripe_refund_id),
            _ => None,
        }
    }

    pub fn discount_code_id(&self) -> Option<&str> {
        match &self.receipt {
            Some(PayoutReceipt::DiscountCode { discount_code_id }) => Some(discount_code_id),
            _ => None,
        }
    }

    pub fn subscription_id(&self) -> Option<&str> {
        match &self.receipt {
            Some(PayoutReceipt::Subscription { subscription_id }) => Some(subscription_id),
            _ => None,
        }
    }

    pub fn has_live_claim(&self, now: DateTime<Utc>, ttl: Duration) -> bool {
        self.claim
            .as_ref()
            .map(|c| c.is_live(now, ttl))
            .unwrap_or(false)
    }

    /// Take the resolution claim. Succeeds only from `conditions_met` with no
    /// live claim held by someone else. A stale claim is only taken over for
    /// the same payout type, since its side effect may already have happened.
    pub fn try_claim(
        &mut self,
        token: &str,
        payout_type: PayoutType,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> bool {
        if self.status != GuaranteeStatus::ConditionsMet || self.is_resolved() {
            return false;
        }
        if let Some(claim) = &self.claim {
            if claim.is_live(now, ttl) || claim.payout_type != payout_type {
                return false;
            }
        }
        self.claim = Some(ResolutionClaim {
            token: token.to_string(),
            payout_type,
            claimed_at: now,
        });
        self.updated_at = now;
        true
    }

    /// Drop the claim if `token` still owns it.
    pub fn release_claim(&mut self, token: &str, now: DateTime<Utc>) -> bool {
        match &self.claim {
            Some(claim) if claim.token == token => {
                self.claim = None;
                self.updated_at = now;
                true
            }
            _ => false,
        }
    }

    /// Compare-and-set on `status`. Returns false, leaving `self` untouched,
    /// when the expected status, the claim, or the edge does not hold.
    pub fn apply_transition(
        &mut self,
        t: &StatusTransition,
        now: DateTime<Utc>,
        claim_ttl: Duration,
    ) -> bool {
        if self.status != t.expected || self.is_resolved() {
            return false;
        }
        if !t.expected.can_transition_to(t.next) {
            return false;
        }
        if t.next.is_terminal() && t.resolved_at.is_none() {
            return false;
        }
        match (&self.claim, &t.claim_token) {
            (Some(claim), Some(token)) if claim.token != *token => return false,
            (None, Some(_)) => return false,
            (Some(claim), None) if claim.is_live(now, claim_ttl) => return false,
            _ => {}
        }

        self.status = t.next;
        if t.next.is_terminal() {
            self.resolved_at = t.resolved_at;
            self.claim = None;
        }
        if let Some(notes) = &t.resolution_notes {
            self.resolution_notes = Some(notes.clone());
        }
        if let Some(payout_type) = t.payout_type {
            self.payout_type = Some(payout_type);
        }
        if let Some(receipt) = &t.receipt {
            self.receipt = Some(receipt.clone());
        }
        if let Some(amount) = t.rollover_credit_amount {
            self.rollover_credit_amount = Some(amount);
        }
        self.updated_at = now;
        true
    }
}
