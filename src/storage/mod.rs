pub mod file;
pub mod ledger;
pub mod memory;

pub use file::FileStorage;
pub use ledger::Ledger;
pub use memory::MemoryStorage;

use crate::error::Result;
use crate::state::{
    ClientSubscription, ContinuityPlan, DiscountCode, GuaranteeInstance, GuaranteeMilestone,
    GuaranteeStatus, GuaranteeTemplate, JournalEntry, Order, PayoutType, State, StatusTransition,
};
use chrono::{DateTime, Duration, Utc};

/// Storage abstraction for the append-only journal and state snapshots.
///
/// Implementations must preserve:
/// - Append-only semantics for the journal
/// - Atomic snapshot writes (crash-safe)
/// - Deterministic replay from the journal
pub trait Storage: Send {
    /// Append one entry to the journal (append-only, durable before ack)
    fn append_entry(&mut self, entry: &JournalEntry) -> Result<()>;

    /// Load the latest snapshot with the sequence number of the first entry it does NOT cover
    ///
    /// Returns `None` if no snapshot exists (genesis state).
    fn load_state(&self) -> Result<Option<(State, u64)>>;

    /// Persist a snapshot covering entries `0..next_seq` atomically
    fn persist_state(&mut self, state: &State, next_seq: u64) -> Result<()>;

    /// Load journal entries starting from `from_seq` (inclusive)
    fn load_entries_from(&self, from_seq: u64) -> Result<Vec<JournalEntry>>;
}

/// Persistence contract of the engine.
///
/// Every method is a single-row or small-batch operation. The status writes
/// (`claim_resolution`, `transition_status`) are conditional: they evaluate
/// their precondition and write under one lock, so concurrent callers racing
/// on the same instance see exactly one winner.
pub trait GuaranteeRepository: Send + Sync {
    fn save_template(&self, template: GuaranteeTemplate) -> Result<()>;
    fn load_template(&self, id: &str) -> Result<Option<GuaranteeTemplate>>;

    fn save_plan(&self, plan: ContinuityPlan) -> Result<()>;
    fn load_plan(&self, id: &str) -> Result<Option<ContinuityPlan>>;

    fn save_order(&self, order: Order) -> Result<()>;
    fn load_order(&self, id: &str) -> Result<Option<Order>>;
    fn mark_order_refunded(&self, id: &str) -> Result<()>;

    /// Insert a new instance together with its seeded milestones. Fails on a duplicate id.
    fn insert_instance(
        &self,
        instance: GuaranteeInstance,
        milestones: Vec<GuaranteeMilestone>,
    ) -> Result<()>;
    fn load_instance(&self, id: &str) -> Result<Option<GuaranteeInstance>>;
    /// All instances, or those with `status`, oldest first.
    fn list_instances(&self, status: Option<GuaranteeStatus>) -> Result<Vec<GuaranteeInstance>>;

    fn load_milestones(&self, instance_id: &str) -> Result<Vec<GuaranteeMilestone>>;
    /// Milestone by id or condition slug within one instance.
    fn load_milestone(&self, instance_id: &str, reference: &str)
        -> Result<Option<GuaranteeMilestone>>;
    /// Write a milestone row. Fails with `InvalidState` if its instance is terminal.
    fn save_milestone(&self, milestone: GuaranteeMilestone) -> Result<()>;

    /// Take the per-instance resolution claim. False if the instance is not
    /// `conditions_met` or another live claim exists.
    fn claim_resolution(
        &self,
        id: &str,
        token: &str,
        payout_type: PayoutType,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> Result<bool>;
    fn release_claim(&self, id: &str, token: &str, now: DateTime<Utc>) -> Result<bool>;

    /// Compare-and-set on status. False means nothing was written.
    fn transition_status(
        &self,
        id: &str,
        transition: &StatusTransition,
        now: DateTime<Utc>,
        claim_ttl: Duration,
    ) -> Result<bool>;

    fn find_discount_code(&self, code: &str) -> Result<Option<DiscountCode>>;
    /// Insert a discount code. Fails on a duplicate code string.
    fn insert_discount_code(&self, code: DiscountCode) -> Result<DiscountCode>;

    fn find_subscription_by_external_id(
        &self,
        external_id: &str,
    ) -> Result<Option<ClientSubscription>>;
    fn insert_subscription(&self, subscription: ClientSubscription) -> Result<ClientSubscription>;
}
