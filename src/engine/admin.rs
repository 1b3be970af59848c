//! Admin surface: catalog registration, issuance, on-demand evaluation, the
//! expiry sweep, manual override, and the client-facing guarantee view.

use super::evaluator::{evaluate, Evaluation};
use super::payout::{quote_menu, to_minor_units, PayoutQuote};
use super::GuaranteeEngine;
use crate::clock::Clock;
use crate::error::{Error, Result};
use crate::gateway::{require_id, PaymentGateway, PriceRequest};
use crate::state::{
    ContinuityPlan, GuaranteeInstance, GuaranteeMilestone, GuaranteeStatus, GuaranteeTemplate,
    Order, StatusTransition,
};
use crate::storage::GuaranteeRepository;
use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Bounded re-reads when an evaluation loses a status race.
const EVALUATE_ATTEMPTS: usize = 3;

const EXPIRED_NOTE: &str = "Guarantee window expired with unmet conditions.";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssueRequest {
    #[serde(default)]
    pub order_id: Option<String>,
    #[serde(default)]
    pub order_item_id: Option<String>,
    pub client_email: String,
    #[serde(default)]
    pub client_name: Option<String>,
    pub purchase_amount: Decimal,
    /// Defaults to now.
    #[serde(default)]
    pub starts_at: Option<DateTime<Utc>>,
}

/// Terminal statuses an operator may force.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ManualResolution {
    Voided,
    Expired,
}

impl ManualResolution {
    pub fn status(&self) -> GuaranteeStatus {
        match self {
            ManualResolution::Voided => GuaranteeStatus::Voided,
            ManualResolution::Expired => GuaranteeStatus::Expired,
        }
    }
}

impl fmt::Display for ManualResolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.status().as_str())
    }
}

impl FromStr for ManualResolution {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "voided" => Ok(ManualResolution::Voided),
            "expired" => Ok(ManualResolution::Expired),
            _ => Err(Error::InvalidArgument(
                "Invalid resolution. Must be one of: voided, expired".to_string(),
            )),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SweepFailure {
    pub instance_id: String,
    pub error: String,
}

/// Outcome of one `sweep_expired` pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    /// Active instances found past their deadline.
    pub checked: usize,
    pub expired: Vec<String>,
    pub failed: Vec<SweepFailure>,
}

/// What a client sees when opening their guarantee link.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GuaranteeView {
    pub instance: GuaranteeInstance,
    pub template_name: String,
    pub status_label: String,
    pub milestones: Vec<GuaranteeMilestone>,
    pub days_remaining: i64,
    pub quotes: Vec<PayoutQuote>,
    pub message: String,
}

fn validate_plan(plan: &ContinuityPlan) -> Result<()> {
    if plan.id.trim().is_empty() || plan.name.trim().is_empty() {
        return Err(Error::InvalidArgument(
            "Plan id and name are required".to_string(),
        ));
    }
    if plan.amount_per_interval <= Decimal::ZERO {
        return Err(Error::InvalidArgument(format!(
            "amount_per_interval must be positive, got {}",
            plan.amount_per_interval
        )));
    }
    if plan.billing_interval_count == 0 {
        return Err(Error::InvalidArgument(
            "billing_interval_count must be at least 1".to_string(),
        ));
    }
    Ok(())
}

impl<R, G, C> GuaranteeEngine<R, G, C>
where
    R: GuaranteeRepository,
    G: PaymentGateway,
    C: Clock,
{
    pub fn register_template(&self, template: GuaranteeTemplate) -> Result<()> {
        template.validate()?;
        let id = template.id.clone();
        self.repo.save_template(template)?;
        tracing::info!(template_id = %id, "guarantee template saved");
        Ok(())
    }

    pub fn register_plan(&self, plan: ContinuityPlan) -> Result<()> {
        validate_plan(&plan)?;
        let id = plan.id.clone();
        self.repo.save_plan(plan)?;
        tracing::info!(plan_id = %id, "continuity plan saved");
        Ok(())
    }

    pub fn register_order(&self, order: Order) -> Result<()> {
        if order.id.trim().is_empty() || order.client_email.trim().is_empty() {
            return Err(Error::InvalidArgument(
                "Order id and client email are required".to_string(),
            ));
        }
        if order.total_amount < Decimal::ZERO {
            return Err(Error::InvalidArgument(
                "Order total cannot be negative".to_string(),
            ));
        }
        let id = order.id.clone();
        self.repo.save_order(order)?;
        tracing::info!(order_id = %id, "order saved");
        Ok(())
    }

    /// Register a recurring price for `plan_id` with the processor. A plan
    /// that already carries a price reference is returned unchanged.
    pub fn sync_continuity_plan(&self, plan_id: &str) -> Result<ContinuityPlan> {
        let mut plan = self
            .repo
            .load_plan(plan_id)?
            .ok_or_else(|| Error::NotFound(format!("Continuity plan {} not found", plan_id)))?;
        if plan.synced_price_id().is_some() {
            return Ok(plan);
        }

        let price = self.gateway.create_price(&PriceRequest {
            product_name: plan.name.clone(),
            amount_minor: to_minor_units(plan.amount_per_interval)?,
            currency: plan.currency.clone(),
            interval: plan.billing_interval,
            interval_count: plan.billing_interval_count,
        })?;
        require_id(self.gateway.gateway_id(), "price", &price.id)?;

        plan.stripe_product_id = Some(price.product_id);
        plan.stripe_price_id = Some(price.id);
        self.repo.save_plan(plan.clone())?;
        tracing::info!(plan_id, price_id = ?plan.stripe_price_id, "continuity plan synced");
        Ok(plan)
    }

    /// Create an `active` instance from a template and seed its milestones.
    pub fn issue_guarantee(
        &self,
        template_id: &str,
        request: IssueRequest,
    ) -> Result<(GuaranteeInstance, Vec<GuaranteeMilestone>)> {
        let client_email = request.client_email.trim().to_string();
        if client_email.is_empty() {
            return Err(Error::InvalidArgument("Client email is required".to_string()));
        }
        if request.purchase_amount <= Decimal::ZERO {
            return Err(Error::InvalidArgument(format!(
                "purchase_amount must be positive, got {}",
                request.purchase_amount
            )));
        }
        let template = self
            .repo
            .load_template(template_id)?
            .ok_or_else(|| {
                Error::NotFound(format!("Guarantee template {} not found", template_id))
            })?;
        if !template.is_active {
            return Err(Error::Precondition(format!(
                "Guarantee template {} is inactive",
                template_id
            )));
        }
        if let Some(order_id) = request.order_id.as_deref() {
            if self.repo.load_order(order_id)?.is_none() {
                return Err(Error::NotFound(format!("Order {} not found", order_id)));
            }
        }

        let now = self.now();
        let starts_at = request.starts_at.unwrap_or(now);
        let expires_at = starts_at
            .checked_add_signed(Duration::days(i64::from(template.duration_days)))
            .ok_or_else(|| {
                Error::InvalidArgument(format!(
                    "Guarantee window of {} days from {} is out of range",
                    template.duration_days, starts_at
                ))
            })?;
        let id = crate::new_id();
        let milestones: Vec<GuaranteeMilestone> = template
            .conditions
            .iter()
            .enumerate()
            .map(|(position, condition)| {
                GuaranteeMilestone::seeded(crate::new_id(), id.clone(), condition, position as u32)
            })
            .collect();
        let instance = GuaranteeInstance {
            id,
            guarantee_template_id: template.id.clone(),
            order_id: request.order_id,
            order_item_id: request.order_item_id,
            client_email,
            client_name: request.client_name.filter(|n| !n.trim().is_empty()),
            purchase_amount: request.purchase_amount,
            status: GuaranteeStatus::Active,
            conditions_snapshot: template.conditions.clone(),
            starts_at,
            expires_at,
            resolved_at: None,
            resolution_notes: None,
            payout_type: None,
            receipt: None,
            rollover_credit_amount: None,
            claim: None,
            created_at: now,
            updated_at: now,
        };
        self.repo
            .insert_instance(instance.clone(), milestones.clone())?;

        tracing::info!(
            instance_id = %instance.id,
            template_id,
            expires_at = %instance.expires_at,
            milestones = milestones.len(),
            "guarantee issued"
        );
        Ok((instance, milestones))
    }

    /// Evaluate and persist any resulting transition.
    ///
    /// A terminal instance comes back unchanged. If another writer moves the
    /// instance between the read and the compare-and-set, it is re-read and
    /// evaluated again.
    pub fn evaluate_now(&self, instance_id: &str) -> Result<(GuaranteeInstance, Evaluation)> {
        for _ in 0..EVALUATE_ATTEMPTS {
            let instance = self.require_instance(instance_id)?;
            let template = self.require_template(&instance)?;
            let milestones = self.repo.load_milestones(instance_id)?;
            let now = self.now();

            let evaluation = evaluate(&instance, &template, &milestones, now);
            if !evaluation.is_transition() {
                return Ok((instance, evaluation));
            }

            let mut transition = StatusTransition::new(evaluation.current, evaluation.target);
            if evaluation.target == GuaranteeStatus::Expired {
                transition = transition.resolved(now, EXPIRED_NOTE);
            }
            if self
                .repo
                .transition_status(instance_id, &transition, now, self.settings.claim_ttl)?
            {
                tracing::info!(
                    instance_id,
                    from = %evaluation.current,
                    to = %evaluation.target,
                    "guarantee evaluated"
                );
                return Ok((self.require_instance(instance_id)?, evaluation));
            }
            tracing::debug!(instance_id, "status changed during evaluation, re-reading");
        }
        Err(Error::InvalidState(format!(
            "Guarantee {} kept changing during evaluation",
            instance_id
        )))
    }

    /// Expire every active instance past its deadline.
    pub fn sweep_expired(&self) -> Result<SweepReport> {
        let now = self.now();
        let due: Vec<GuaranteeInstance> = self
            .repo
            .list_instances(Some(GuaranteeStatus::Active))?
            .into_iter()
            .filter(|g| g.is_expired_at(now))
            .collect();

        let mut report = SweepReport {
            checked: due.len(),
            ..SweepReport::default()
        };
        for instance in due {
            match self.evaluate_now(&instance.id) {
                Ok((after, _)) if after.status == GuaranteeStatus::Expired => {
                    report.expired.push(after.id)
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(instance_id = %instance.id, error = %e, "sweep failed for instance");
                    report.failed.push(SweepFailure {
                        instance_id: instance.id,
                        error: e.to_string(),
                    });
                }
            }
        }

        tracing::info!(
            checked = report.checked,
            expired = report.expired.len(),
            failed = report.failed.len(),
            "expiry sweep finished"
        );
        Ok(report)
    }

    /// Force `voided` or `expired`. No money moves.
    pub fn resolve_manually(
        &self,
        instance_id: &str,
        resolution: ManualResolution,
        notes: &str,
    ) -> Result<GuaranteeInstance> {
        let instance = self.require_instance(instance_id)?;
        if instance.status.is_terminal() {
            return Err(Error::InvalidState(format!(
                "Cannot resolve guarantee with status: {}",
                instance.status
            )));
        }

        let now = self.now();
        let notes = match notes.trim() {
            "" => format!("Manually {} by admin.", resolution),
            trimmed => trimmed.to_string(),
        };
        let transition =
            StatusTransition::new(instance.status, resolution.status()).resolved(now, notes);
        if !self
            .repo
            .transition_status(instance_id, &transition, now, self.settings.claim_ttl)?
        {
            let current = self.require_instance(instance_id)?;
            if current.status == instance.status && current.has_live_claim(now, self.settings.claim_ttl) {
                return Err(Error::InvalidState(
                    "A payout for this guarantee is already being processed".to_string(),
                ));
            }
            return Err(Error::InvalidState(format!(
                "Cannot resolve guarantee with status: {}",
                current.status
            )));
        }

        tracing::info!(instance_id, resolution = %resolution, "guarantee resolved manually");
        self.require_instance(instance_id)
    }

    /// Client view of one guarantee. Opening it evaluates the instance.
    pub fn view_guarantee(&self, instance_id: &str, client_email: &str) -> Result<GuaranteeView> {
        let instance = self.require_instance(instance_id)?;
        self.authorize_client(&instance, client_email)?;

        let (instance, evaluation) = self.evaluate_now(instance_id)?;
        let template = self.require_template(&instance)?;
        let milestones = self.repo.load_milestones(instance_id)?;

        Ok(GuaranteeView {
            template_name: template.name.clone(),
            status_label: instance.status.label().to_string(),
            days_remaining: instance.days_remaining(self.now()),
            quotes: quote_menu(instance.purchase_amount, &template),
            message: evaluation.message(),
            milestones,
            instance,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::fixtures::*;
    use crate::state::{MilestoneStatus, PayoutType};
    use rust_decimal_macros::dec;

    fn request(email: &str, amount: Decimal) -> IssueRequest {
        IssueRequest {
            order_id: None,
            order_item_id: None,
            client_email: email.to_string(),
            client_name: None,
            purchase_amount: amount,
            starts_at: None,
        }
    }

    #[test]
    fn test_issue_seeds_milestones() {
        let engine = engine();
        let (g, milestones) = engine
            .issue_guarantee("tpl-results", request("a@x.com", dec!(1000)))
            .unwrap();
        assert_eq!(g.status, GuaranteeStatus::Active);
        assert_eq!(g.expires_at, start() + Duration::days(90));
        assert_eq!(g.conditions_snapshot.len(), 3);
        assert_eq!(milestones.len(), 3);
        assert!(milestones.iter().all(|m| m.status == MilestoneStatus::Pending));
        assert_eq!(milestones[0].condition_id, "attend-sessions");
        assert_eq!(milestones[2].position, 2);
        assert_eq!(engine.repo().load_milestones(&g.id).unwrap(), milestones);
    }

    #[test]
    fn test_issue_rejections() {
        let engine = engine();
        let err = engine
            .issue_guarantee("tpl-results", request(" ", dec!(1000)))
            .unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));

        let err = engine
            .issue_guarantee("tpl-results", request("a@x.com", dec!(0)))
            .unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));

        let err = engine
            .issue_guarantee("nope", request("a@x.com", dec!(10)))
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));

        let mut req = request("a@x.com", dec!(10));
        req.order_id = Some("order-missing".to_string());
        let err = engine.issue_guarantee("tpl-results", req).unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));

        let mut inactive = template();
        inactive.is_active = false;
        engine.register_template(inactive).unwrap();
        let err = engine
            .issue_guarantee("tpl-results", request("a@x.com", dec!(10)))
            .unwrap_err();
        assert!(matches!(err, Error::Precondition(_)));
    }

    #[test]
    fn test_issue_rejects_window_past_calendar_end() {
        let engine = engine();
        let mut long = template();
        long.duration_days = u32::MAX;
        assert!(matches!(
            engine.register_template(long).unwrap_err(),
            Error::InvalidArgument(_)
        ));

        let mut req = request("a@x.com", dec!(10));
        req.starts_at = Some(DateTime::<Utc>::MAX_UTC - Duration::days(1));
        let err = engine.issue_guarantee("tpl-results", req).unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
        assert!(engine.repo().snapshot().instances.is_empty());
    }

    #[test]
    fn test_register_rejects_invalid_rows() {
        let engine = engine();
        let mut t = template();
        t.refund_or_credit_percent = dec!(1.5);
        assert!(engine.register_template(t).is_err());

        let mut p = plan();
        p.amount_per_interval = dec!(0);
        assert!(engine.register_plan(p).is_err());

        let mut o = order();
        o.client_email = String::new();
        assert!(engine.register_order(o).is_err());
    }

    #[test]
    fn test_evaluate_now_persists_and_is_idempotent() {
        let engine = engine();
        let g = issue(&engine);

        let (after, evaluation) = engine.evaluate_now(&g.id).unwrap();
        assert_eq!(after.status, GuaranteeStatus::Active);
        assert_eq!(evaluation.outstanding.len(), 2);
        assert_eq!(evaluation.message(), "2 condition(s) still outstanding.");

        let met = issue_met(&engine);
        assert_eq!(met.status, GuaranteeStatus::ConditionsMet);
        assert!(met.resolved_at.is_none());

        let (again, evaluation) = engine.evaluate_now(&met.id).unwrap();
        assert_eq!(again, met);
        assert!(!evaluation.is_transition());
    }

    #[test]
    fn test_evaluate_now_expires_past_deadline() {
        let engine = engine();
        let g = issue(&engine);
        for condition in ["attend-sessions", "submit-homework", "join-community"] {
            engine
                .verify_milestone(&g.id, condition, MilestoneStatus::Verified, None, None)
                .unwrap();
        }
        engine.clock().advance(Duration::days(91));

        let (after, evaluation) = engine.evaluate_now(&g.id).unwrap();
        assert_eq!(after.status, GuaranteeStatus::Expired);
        assert_eq!(after.resolved_at, Some(start() + Duration::days(91)));
        assert_eq!(after.resolution_notes.as_deref(), Some(EXPIRED_NOTE));
        assert_eq!(evaluation.message(), "Guarantee has expired. Window closed.");

        // Terminal: evaluating again is a no-op
        let (again, _) = engine.evaluate_now(&g.id).unwrap();
        assert_eq!(again, after);
    }

    #[test]
    fn test_sweep_expires_only_overdue_active() {
        let engine = engine();
        let overdue = issue(&engine);
        let met = issue_met(&engine);
        engine.clock().advance(Duration::days(30));
        let fresh = issue(&engine);
        engine.clock().advance(Duration::days(61));

        let report = engine.sweep_expired().unwrap();
        assert_eq!(report.checked, 1);
        assert_eq!(report.expired, vec![overdue.id.clone()]);
        assert!(report.failed.is_empty());

        let status = |id: &str| engine.repo().load_instance(id).unwrap().unwrap().status;
        assert_eq!(status(&met.id), GuaranteeStatus::ConditionsMet);
        assert_eq!(status(&fresh.id), GuaranteeStatus::Active);

        let report = engine.sweep_expired().unwrap();
        assert_eq!(report.checked, 0);
    }

    #[test]
    fn test_resolve_manually() {
        let engine = engine();
        let g = issue_met(&engine);
        let voided = engine
            .resolve_manually(&g.id, ManualResolution::Voided, "  ")
            .unwrap();
        assert_eq!(voided.status, GuaranteeStatus::Voided);
        assert_eq!(voided.resolution_notes.as_deref(), Some("Manually voided by admin."));
        assert!(voided.payout_type.is_none());

        let err = engine
            .resolve_manually(&g.id, ManualResolution::Expired, "again")
            .unwrap_err();
        assert_eq!(
            err,
            Error::InvalidState("Cannot resolve guarantee with status: voided".to_string())
        );
        let err = engine
            .choose_payout(&g.id, PayoutType::Refund, "a@x.com")
            .unwrap_err();
        assert!(matches!(err, Error::InvalidState(_)));
    }

    #[test]
    fn test_resolve_manually_blocked_by_live_claim() {
        let engine = engine();
        let g = issue_met(&engine);
        let ttl = engine.settings().claim_ttl;
        engine
            .repo()
            .claim_resolution(&g.id, "in-flight", PayoutType::Credit, start(), ttl)
            .unwrap();

        let err = engine
            .resolve_manually(&g.id, ManualResolution::Voided, "dispute")
            .unwrap_err();
        assert_eq!(
            err,
            Error::InvalidState("A payout for this guarantee is already being processed".to_string())
        );
    }

    #[test]
    fn test_manual_resolution_parse() {
        assert_eq!("Voided".parse::<ManualResolution>().unwrap(), ManualResolution::Voided);
        assert_eq!("expired".parse::<ManualResolution>().unwrap(), ManualResolution::Expired);
        assert!("refunded".parse::<ManualResolution>().is_err());
    }

    #[test]
    fn test_view_evaluates_and_quotes() {
        let engine = engine();
        let g = issue(&engine);
        engine
            .verify_milestone(&g.id, "attend-sessions", MilestoneStatus::Verified, None, None)
            .unwrap();
        engine
            .verify_milestone(&g.id, "submit-homework", MilestoneStatus::Verified, None, None)
            .unwrap();
        engine.clock().advance(Duration::hours(36));

        let view = engine.view_guarantee(&g.id, "A@X.COM").unwrap();
        assert_eq!(view.instance.status, GuaranteeStatus::ConditionsMet);
        assert_eq!(view.status_label, "Conditions Met - Awaiting Client Choice");
        assert_eq!(view.template_name, "Results Guarantee");
        assert_eq!(view.days_remaining, 89);
        assert_eq!(view.milestones.len(), 3);
        let amounts: Vec<Decimal> = view.quotes.iter().map(|q| q.amount).collect();
        assert_eq!(amounts, vec![dec!(500), dec!(500), dec!(750), dec!(750)]);

        let err = engine.view_guarantee(&g.id, "b@x.com").unwrap_err();
        assert!(matches!(err, Error::Unauthorized(_)));
    }

    #[test]
    fn test_sync_plan_once() {
        let engine = engine();
        let synced = engine.sync_continuity_plan("plan-club").unwrap();
        let price_id = synced.stripe_price_id.clone().unwrap();
        assert!(synced.stripe_product_id.is_some());

        let again = engine.sync_continuity_plan("plan-club").unwrap();
        assert_eq!(again.stripe_price_id, Some(price_id));
        assert!(engine.sync_continuity_plan("plan-missing").is_err());
    }
}
