//! `Ledger`: the repository implementation over any `Storage` backend.
//!
//! The in-memory `State` is the read model. Every write is checked and
//! applied under one mutex, appended to the journal, then snapshotted. A
//! write whose journal append fails leaves the state untouched.

use crate::error::{Error, Result};
use crate::replay::replay_to_tip;
use crate::state::{
    ClientSubscription, ContinuityPlan, DiscountCode, GuaranteeInstance, GuaranteeMilestone,
    GuaranteeStatus, GuaranteeTemplate, JournalEntry, LedgerEvent, Order, PayoutType, State,
    StatusTransition,
};
use crate::storage::{GuaranteeRepository, Storage};
use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;

struct Inner<S: Storage> {
    state: State,
    storage: S,
    next_seq: u64,
}

impl<S: Storage> Inner<S> {
    /// Journal then apply each of `events`; snapshot afterwards.
    ///
    /// An event is applied only once its entry is durable, so the read model
    /// never runs ahead of the journal even if a later append fails.
    fn commit(&mut self, events: Vec<LedgerEvent>) -> Result<()> {
        let start = self.next_seq;
        for event in events {
            let entry = JournalEntry {
                seq: self.next_seq,
                recorded_at: Utc::now(),
                event,
            };
            self.storage.append_entry(&entry)?;
            tracing::debug!(seq = entry.seq, kind = entry.event.kind(), "journal entry appended");
            self.state.apply_event(&entry.event);
            self.next_seq += 1;
        }
        if self.next_seq == start {
            return Ok(());
        }

        // The journal is authoritative; a failed snapshot only costs replay time.
        if let Err(e) = self.storage.persist_state(&self.state, self.next_seq) {
            tracing::warn!(error = %e, next_seq = self.next_seq, "snapshot write failed");
        }
        Ok(())
    }
}

pub struct Ledger<S: Storage> {
    inner: Mutex<Inner<S>>,
}

impl<S: Storage> Ledger<S> {
    /// Open a ledger, recovering state from the snapshot plus journal tail.
    pub fn open(storage: S) -> Result<Self> {
        let (state, next_seq) = replay_to_tip(&storage)?;
        tracing::debug!(next_seq, instances = state.instances.len(), "ledger opened");
        Ok(Ledger {
            inner: Mutex::new(Inner {
                state,
                storage,
                next_seq,
            }),
        })
    }

    /// Copy of the current read model.
    pub fn snapshot(&self) -> State {
        self.inner.lock().state.clone()
    }

    /// Seq the next journal entry will carry.
    pub fn next_seq(&self) -> u64 {
        self.inner.lock().next_seq
    }

    /// Run `f` against the backend (e.g. to inject failures in tests).
    pub fn with_storage<T>(&self, f: impl FnOnce(&mut S) -> T) -> T {
        f(&mut self.inner.lock().storage)
    }

    fn read<T>(&self, f: impl FnOnce(&State) -> T) -> T {
        f(&self.inner.lock().state)
    }
}

impl<S: Storage> GuaranteeRepository for Ledger<S> {
    fn save_template(&self, template: GuaranteeTemplate) -> Result<()> {
        self.inner
            .lock()
            .commit(vec![LedgerEvent::TemplateSaved(template)])
    }

    fn load_template(&self, id: &str) -> Result<Option<GuaranteeTemplate>> {
        Ok(self.read(|s| s.get_template(id).cloned()))
    }

    fn save_plan(&self, plan: ContinuityPlan) -> Result<()> {
        self.inner.lock().commit(vec![LedgerEvent::PlanSaved(plan)])
    }

    fn load_plan(&self, id: &str) -> Result<Option<ContinuityPlan>> {
        Ok(self.read(|s| s.get_plan(id).cloned()))
    }

    fn save_order(&self, order: Order) -> Result<()> {
        self.inner.lock().commit(vec![LedgerEvent::OrderSaved(order)])
    }

    fn load_order(&self, id: &str) -> Result<Option<Order>> {
        Ok(self.read(|s| s.get_order(id).cloned()))
    }

    fn mark_order_refunded(&self, id: &str) -> Result<()> {
        let mut inner = self.inner.lock();
        let mut order = inner
            .state
            .get_order(id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("Order {} not found", id)))?;
        order.mark_refunded();
        inner.commit(vec![LedgerEvent::OrderSaved(order)])
    }

    fn insert_instance(
        &self,
        instance: GuaranteeInstance,
        milestones: Vec<GuaranteeMilestone>,
    ) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.state.get_instance(&instance.id).is_some() {
            return Err(Error::InvalidArgument(format!(
                "Guarantee instance {} already exists",
                instance.id
            )));
        }
        let mut events = Vec::with_capacity(milestones.len() + 1);
        events.push(LedgerEvent::InstanceSaved(instance));
        events.extend(milestones.into_iter().map(LedgerEvent::MilestoneSaved));
        inner.commit(events)
    }

    fn load_instance(&self, id: &str) -> Result<Option<GuaranteeInstance>> {
        Ok(self.read(|s| s.get_instance(id).cloned()))
    }

    fn list_instances(&self, status: Option<GuaranteeStatus>) -> Result<Vec<GuaranteeInstance>> {
        Ok(self.read(|s| match status {
            Some(status) => s
                .instances_with_status(status)
                .into_iter()
                .cloned()
                .collect(),
            None => {
                let mut all: Vec<GuaranteeInstance> = s.instances.values().cloned().collect();
                all.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
                all
            }
        }))
    }

    fn load_milestones(&self, instance_id: &str) -> Result<Vec<GuaranteeMilestone>> {
        Ok(self.read(|s| s.milestones_for(instance_id).into_iter().cloned().collect()))
    }

    fn load_milestone(
        &self,
        instance_id: &str,
        reference: &str,
    ) -> Result<Option<GuaranteeMilestone>> {
        Ok(self.read(|s| s.find_milestone(instance_id, reference).cloned()))
    }

    fn save_milestone(&self, milestone: GuaranteeMilestone) -> Result<()> {
        let mut inner = self.inner.lock();
        let status = inner
            .state
            .get_instance(&milestone.guarantee_instance_id)
            .map(|g| g.status)
            .ok_or_else(|| {
                Error::NotFound(format!(
                    "Guarantee instance {} not found",
                    milestone.guarantee_instance_id
                ))
            })?;
        if status.is_terminal() {
            return Err(Error::InvalidState(format!(
                "Cannot update milestones on a guarantee with status: {}",
                status
            )));
        }
        inner.commit(vec![LedgerEvent::MilestoneSaved(milestone)])
    }

    fn claim_resolution(
        &self,
        id: &str,
        token: &str,
        payout_type: PayoutType,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> Result<bool> {
        let mut inner = self.inner.lock();
        let mut instance = match inner.state.get_instance(id) {
            Some(g) => g.clone(),
            None => return Err(Error::NotFound(format!("Guarantee instance {} not found", id))),
        };
        if !instance.try_claim(token, payout_type, now, ttl) {
            return Ok(false);
        }
        inner.commit(vec![LedgerEvent::InstanceSaved(instance)])?;
        Ok(true)
    }

    fn release_claim(&self, id: &str, token: &str, now: DateTime<Utc>) -> Result<bool> {
        let mut inner = self.inner.lock();
        let mut instance = match inner.state.get_instance(id) {
            Some(g) => g.clone(),
            None => return Err(Error::NotFound(format!("Guarantee instance {} not found", id))),
        };
        if !instance.release_claim(token, now) {
            return Ok(false);
        }
        inner.commit(vec![LedgerEvent::InstanceSaved(instance)])?;
        Ok(true)
    }

    fn transition_status(
        &self,
        id: &str,
        transition: &StatusTransition,
        now: DateTime<Utc>,
        claim_ttl: Duration,
    ) -> Result<bool> {
        let mut inner = self.inner.lock();
        let mut instance = match inner.state.get_instance(id) {
            Some(g) => g.clone(),
            None => return Err(Error::NotFound(format!("Guarantee instance {} not found", id))),
        };
        if !instance.apply_transition(transition, now, claim_ttl) {
            return Ok(false);
        }
        inner.commit(vec![LedgerEvent::InstanceSaved(instance)])?;
        Ok(true)
    }

    fn find_discount_code(&self, code: &str) -> Result<Option<DiscountCode>> {
        Ok(self.read(|s| s.find_discount_code(code).cloned()))
    }

    fn insert_discount_code(&self, code: DiscountCode) -> Result<DiscountCode> {
        let mut inner = self.inner.lock();
        if inner.state.find_discount_code(&code.code).is_some() {
            return Err(Error::InvalidArgument(format!(
                "Discount code {} already exists",
                code.code
            )));
        }
        inner.commit(vec![LedgerEvent::DiscountCodeSaved(code.clone())])?;
        Ok(code)
    }

    fn find_subscription_by_external_id(
        &self,
        external_id: &str,
    ) -> Result<Option<ClientSubscription>> {
        Ok(self.read(|s| s.find_subscription_by_external_id(external_id).cloned()))
    }

    fn insert_subscription(&self, subscription: ClientSubscription) -> Result<ClientSubscription> {
        let mut inner = self.inner.lock();
        if inner.state.get_subscription(&subscription.id).is_some() {
            return Err(Error::InvalidArgument(format!(
                "Subscription {} already exists",
                subscription.id
            )));
        }
        inner.commit(vec![LedgerEvent::SubscriptionSaved(subscription.clone())])?;
        Ok(subscription)
    }
}
