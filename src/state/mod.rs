pub mod continuity;
pub mod event;
pub mod instance;
pub mod milestone;
pub mod order;
pub mod template;

pub use continuity::{BillingInterval, ClientSubscription, ContinuityPlan, SubscriptionStatus};
pub use event::{JournalEntry, LedgerEvent};
pub use instance::{
    GuaranteeInstance, GuaranteeStatus, PayoutReceipt, ResolutionClaim, StatusTransition,
};
pub use milestone::{GuaranteeMilestone, MilestoneStatus};
pub use order::{DiscountCode, Order, OrderStatus};
pub use template::{
    GuaranteeCondition, GuaranteeTemplate, GuaranteeType, PayoutAmount, PayoutType,
    VerificationMethod,
};

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Every row the engine reads or writes, keyed by id.
///
/// State is fully reconstructible by replaying the journal from genesis.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct State {
    pub templates: HashMap<String, GuaranteeTemplate>,
    pub plans: HashMap<String, ContinuityPlan>,
    pub orders: HashMap<String, Order>,
    pub instances: HashMap<String, GuaranteeInstance>,
    pub milestones: HashMap<String, GuaranteeMilestone>,
    /// Discount codes indexed by id
    pub discount_codes: HashMap<String, DiscountCode>,
    pub subscriptions: HashMap<String, ClientSubscription>,
}

impl State {
    /// Create empty genesis state
    pub fn new() -> Self {
        State::default()
    }

    /// Upsert the row carried by `event`.
    pub fn apply_event(&mut self, event: &LedgerEvent) {
        match event {
            LedgerEvent::TemplateSaved(t) => {
                self.templates.insert(t.id.clone(), t.clone());
            }
            LedgerEvent::PlanSaved(p) => {
                self.plans.insert(p.id.clone(), p.clone());
            }
            LedgerEvent::OrderSaved(o) => {
                self.orders.insert(o.id.clone(), o.clone());
            }
            LedgerEvent::InstanceSaved(g) => {
                self.instances.insert(g.id.clone(), g.clone());
            }
            LedgerEvent::MilestoneSaved(m) => {
                self.milestones.insert(m.id.clone(), m.clone());
            }
            LedgerEvent::DiscountCodeSaved(d) => {
                self.discount_codes.insert(d.id.clone(), d.clone());
            }
            LedgerEvent::SubscriptionSaved(s) => {
                self.subscriptions.insert(s.id.clone(), s.clone());
            }
        }
    }

    pub fn get_template(&self, id: &str) -> Option<&GuaranteeTemplate> {
        self.templates.get(id)
    }

    pub fn get_plan(&self, id: &str) -> Option<&ContinuityPlan> {
        self.plans.get(id)
    }

    pub fn get_order(&self, id: &str) -> Option<&Order> {
        self.orders.get(id)
    }

    pub fn get_instance(&self, id: &str) -> Option<&GuaranteeInstance> {
        self.instances.get(id)
    }

    pub fn get_instance_mut(&mut self, id: &str) -> Option<&mut GuaranteeInstance> {
        self.instances.get_mut(id)
    }

    /// Milestones of one instance in template order.
    pub fn milestones_for(&self, instance_id: &str) -> Vec<&GuaranteeMilestone> {
        let mut out: Vec<&GuaranteeMilestone> = self
            .milestones
            .values()
            .filter(|m| m.guarantee_instance_id == instance_id)
            .collect();
        out.sort_by(|a, b| a.position.cmp(&b.position).then_with(|| a.id.cmp(&b.id)));
        out
    }

    /// Milestone by id or condition slug, scoped to one instance.
    pub fn find_milestone(&self, instance_id: &str, reference: &str) -> Option<&GuaranteeMilestone> {
        self.milestones
            .values()
            .find(|m| m.guarantee_instance_id == instance_id && m.matches(reference))
    }

    pub fn find_discount_code(&self, code: &str) -> Option<&DiscountCode> {
        self.discount_codes
            .values()
            .find(|d| d.code.eq_ignore_ascii_case(code))
    }

    pub fn get_subscription(&self, id: &str) -> Option<&ClientSubscription> {
        self.subscriptions.get(id)
    }

    /// Local subscription row for a processor subscription id.
    pub fn find_subscription_by_external_id(
        &self,
        external_id: &str,
    ) -> Option<&ClientSubscription> {
        self.subscriptions
            .values()
            .find(|s| s.stripe_subscription_id == external_id)
    }

    /// Instances with `status`, oldest first.
    pub fn instances_with_status(&self, status: GuaranteeStatus) -> Vec<&GuaranteeInstance> {
        let mut out: Vec<&GuaranteeInstance> = self
            .instances
            .values()
            .filter(|g| g.status == status)
            .collect();
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        out
    }
}
