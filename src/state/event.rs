//! Journal entries: every persisted row change, in commit order.
//!
//! Each event carries the full row after the write, so replaying a journal
//! onto a snapshot is a sequence of upserts.

use crate::state::continuity::{ClientSubscription, ContinuityPlan};
use crate::state::instance::GuaranteeInstance;
use crate::state::milestone::GuaranteeMilestone;
use crate::state::order::{DiscountCode, Order};
use crate::state::template::GuaranteeTemplate;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LedgerEvent {
    TemplateSaved(GuaranteeTemplate),
    PlanSaved(ContinuityPlan),
    OrderSaved(Order),
    InstanceSaved(GuaranteeInstance),
    MilestoneSaved(GuaranteeMilestone),
    DiscountCodeSaved(DiscountCode),
    SubscriptionSaved(ClientSubscription),
}

impl LedgerEvent {
    /// Short name for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            LedgerEvent::TemplateSaved(_) => "template_saved",
            LedgerEvent::PlanSaved(_) => "plan_saved",
            LedgerEvent::OrderSaved(_) => "order_saved",
            LedgerEvent::InstanceSaved(_) => "instance_saved",
            LedgerEvent::MilestoneSaved(_) => "milestone_saved",
            LedgerEvent::DiscountCodeSaved(_) => "discount_code_saved",
            LedgerEvent::SubscriptionSaved(_) => "subscription_saved",
        }
    }
}

/// One journal record. `seq` is 0-based and gapless.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JournalEntry {
    pub seq: u64,
    pub recorded_at: DateTime<Utc>,
    pub event: LedgerEvent,
}
