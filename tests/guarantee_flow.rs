use chrono::{DateTime, Duration, TimeZone, Utc};
use guarantee_engine::clock::FixedClock;
use guarantee_engine::engine::payout::idempotency_key;
use guarantee_engine::engine::{EngineSettings, GuaranteeEngine, IssueRequest, PayoutOutcome};
use guarantee_engine::error::Error;
use guarantee_engine::gateway::{GatewayOp, PaymentGateway, RefundRequest, SandboxGateway};
use guarantee_engine::state::{
    BillingInterval, ContinuityPlan, GuaranteeCondition, GuaranteeInstance, GuaranteeStatus,
    GuaranteeTemplate, GuaranteeType, MilestoneStatus, Order, OrderStatus, PayoutAmount,
    PayoutType, VerificationMethod,
};
use guarantee_engine::storage::{FileStorage, GuaranteeRepository, Ledger, MemoryStorage, Storage};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::sync::{Arc, Barrier};
use std::thread;
use tempfile::TempDir;

type MemEngine = GuaranteeEngine<Ledger<MemoryStorage>, SandboxGateway, FixedClock>;
type FileEngine = GuaranteeEngine<Ledger<FileStorage>, SandboxGateway, FixedClock>;

fn start() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 2, 12, 0, 0).unwrap()
}

fn template() -> GuaranteeTemplate {
    GuaranteeTemplate {
        id: "tpl-launch".to_string(),
        name: "Launch Guarantee".to_string(),
        description: Some("Hit every milestone or get paid back".to_string()),
        guarantee_type: GuaranteeType::Conditional,
        duration_days: 60,
        conditions: vec![
            GuaranteeCondition {
                id: "kickoff".to_string(),
                label: "Attend kickoff call".to_string(),
                verification_method: VerificationMethod::AdminVerified,
                required: true,
            },
            GuaranteeCondition {
                id: "weekly-reports".to_string(),
                label: "Send weekly progress reports".to_string(),
                verification_method: VerificationMethod::ClientSelfReport,
                required: true,
            },
        ],
        payout_types: PayoutType::ALL.to_vec(),
        default_payout_type: PayoutType::Credit,
        refund_or_credit_percent: dec!(0.5),
        payout_amount: PayoutAmount::Percent,
        rollover_bonus_multiplier: dec!(1.5),
        rollover_upsell_service_ids: None,
        rollover_continuity_plan_id: Some("plan-inner-circle".to_string()),
        is_active: true,
    }
}

fn plan() -> ContinuityPlan {
    ContinuityPlan {
        id: "plan-inner-circle".to_string(),
        name: "Inner Circle".to_string(),
        description: None,
        billing_interval: BillingInterval::Month,
        billing_interval_count: 1,
        amount_per_interval: dec!(149),
        currency: "usd".to_string(),
        trial_days: 14,
        stripe_product_id: None,
        stripe_price_id: None,
        is_active: true,
    }
}

fn order() -> Order {
    Order {
        id: "ord-100".to_string(),
        client_email: "a@x.com".to_string(),
        total_amount: dec!(1000),
        status: OrderStatus::Paid,
        stripe_payment_intent_id: Some("pi_launch".to_string()),
    }
}

fn seed<R: GuaranteeRepository>(engine: &GuaranteeEngine<R, SandboxGateway, FixedClock>) {
    engine.register_template(template()).unwrap();
    engine.register_plan(plan()).unwrap();
    engine.register_order(order()).unwrap();
    engine.sync_continuity_plan("plan-inner-circle").unwrap();
}

fn mem_engine() -> MemEngine {
    let engine = GuaranteeEngine::new(
        Ledger::open(MemoryStorage::new()).unwrap(),
        SandboxGateway::new(),
        FixedClock::new(start()),
        EngineSettings::default(),
    );
    seed(&engine);
    engine
}

fn open_file_engine(dir: &TempDir, now: DateTime<Utc>) -> FileEngine {
    let storage = FileStorage::with_paths(
        dir.path().join("journal.log"),
        dir.path().join("state.bin"),
    );
    GuaranteeEngine::new(
        Ledger::open(storage).unwrap(),
        SandboxGateway::open(dir.path().join("gateway.json")).unwrap(),
        FixedClock::new(now),
        EngineSettings::default(),
    )
}

fn issue<R: GuaranteeRepository>(
    engine: &GuaranteeEngine<R, SandboxGateway, FixedClock>,
    amount: Decimal,
) -> GuaranteeInstance {
    engine
        .issue_guarantee(
            "tpl-launch",
            IssueRequest {
                order_id: Some("ord-100".to_string()),
                order_item_id: None,
                client_email: "a@x.com".to_string(),
                client_name: Some("Ada".to_string()),
                purchase_amount: amount,
                starts_at: None,
            },
        )
        .unwrap()
        .0
}

/// Verify every milestone and evaluate.
fn meet_conditions<R: GuaranteeRepository>(
    engine: &GuaranteeEngine<R, SandboxGateway, FixedClock>,
    instance_id: &str,
) -> GuaranteeInstance {
    for condition in ["kickoff", "weekly-reports"] {
        engine
            .verify_milestone(
                instance_id,
                condition,
                MilestoneStatus::Verified,
                None,
                Some("ops"),
            )
            .unwrap();
    }
    let (instance, _) = engine.evaluate_now(instance_id).unwrap();
    assert_eq!(instance.status, GuaranteeStatus::ConditionsMet);
    instance
}

/// Scenario A: $1000 at 50% refunds $500.00
#[test]
fn test_refund_half_of_purchase() {
    let engine = mem_engine();
    let g = issue(&engine, dec!(1000));
    meet_conditions(&engine, &g.id);

    let r = engine.choose_payout(&g.id, PayoutType::Refund, "a@x.com").unwrap();
    assert_eq!(
        r.outcome,
        PayoutOutcome::RefundIssued {
            refund_id: r.instance.stripe_refund_id().unwrap().to_string(),
            amount: dec!(500.00),
        }
    );
    assert_eq!(engine.gateway().refunds()[0].amount_minor, 50_000);
    assert_eq!(
        engine.repo().load_order("ord-100").unwrap().unwrap().status,
        OrderStatus::Refunded
    );
}

/// Scenario B: rollover at 1.5x of the $500 payout credits $750.00
#[test]
fn test_continuity_rollover_credit() {
    let engine = mem_engine();
    let g = issue(&engine, dec!(1000));
    meet_conditions(&engine, &g.id);

    let r = engine
        .choose_payout(&g.id, PayoutType::RolloverContinuity, "a@x.com")
        .unwrap();
    assert_eq!(r.instance.rollover_credit_amount, Some(dec!(750.00)));
    assert_eq!(
        r.outcome.message(),
        "Your $750.00 credit has been applied to your Inner Circle subscription. You'll pay $0 until the credit is exhausted."
    );

    let subs = engine.gateway().subscriptions();
    assert_eq!(subs.len(), 1);
    assert_eq!(subs[0].status, "trialing");
    assert_eq!(
        subs[0].current_period_end - subs[0].current_period_start,
        Duration::days(14)
    );
    assert_eq!(subs[0].metadata.get("guarantee_instance_id"), Some(&g.id));
}

/// Scenario C
#[test]
fn test_payout_rejected_while_active() {
    let engine = mem_engine();
    let g = issue(&engine, dec!(1000));
    let err = engine
        .choose_payout(&g.id, PayoutType::Refund, "a@x.com")
        .unwrap_err();
    assert_eq!(
        err,
        Error::InvalidState(
            "Payout can only be chosen when status is conditions_met. Current: active".to_string()
        )
    );
}

/// Scenario D
#[test]
fn test_email_match_is_case_insensitive() {
    let engine = mem_engine();
    let g = issue(&engine, dec!(1000));
    meet_conditions(&engine, &g.id);
    let r = engine.choose_payout(&g.id, PayoutType::Credit, "A@x.com").unwrap();
    assert_eq!(r.instance.status, GuaranteeStatus::CreditIssued);
}

/// Scenario E
#[test]
fn test_continuity_without_plan_is_precondition() {
    let engine = mem_engine();
    let mut t = template();
    t.rollover_continuity_plan_id = None;
    engine.register_template(t).unwrap();
    let g = issue(&engine, dec!(1000));
    meet_conditions(&engine, &g.id);

    let err = engine
        .choose_payout(&g.id, PayoutType::RolloverContinuity, "a@x.com")
        .unwrap_err();
    assert!(matches!(err, Error::Precondition(_)));
    assert!(engine.gateway().subscriptions().is_empty());
}

#[test]
fn test_concurrent_choices_resolve_once() {
    let engine = Arc::new(mem_engine());
    let g = issue(engine.as_ref(), dec!(1000));
    meet_conditions(engine.as_ref(), &g.id);

    let threads = 8;
    let barrier = Arc::new(Barrier::new(threads));
    let handles: Vec<_> = (0..threads)
        .map(|i| {
            let engine = Arc::clone(&engine);
            let barrier = Arc::clone(&barrier);
            let id = g.id.clone();
            let payout_type = PayoutType::ALL[i % PayoutType::ALL.len()];
            thread::spawn(move || {
                barrier.wait();
                engine.choose_payout(&id, payout_type, "a@x.com")
            })
        })
        .collect();
    let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    let winners: Vec<_> = results.iter().filter_map(|r| r.as_ref().ok()).collect();
    assert_eq!(winners.len(), 1);
    for result in &results {
        if let Err(e) = result {
            assert!(matches!(e, Error::InvalidState(_)), "unexpected error {:?}", e);
        }
    }

    let side_effects = engine.gateway().refunds().len()
        + engine.gateway().subscriptions().len()
        + engine.repo().snapshot().discount_codes.len();
    assert_eq!(side_effects, 1);

    let stored = engine.repo().load_instance(&g.id).unwrap().unwrap();
    assert_eq!(stored.status, winners[0].outcome.status());
    assert!(stored.claim.is_none());
}

#[test]
fn test_expiry_wins_over_verified_milestones() {
    let engine = mem_engine();
    let g = issue(&engine, dec!(1000));
    for condition in ["kickoff", "weekly-reports"] {
        engine
            .verify_milestone(&g.id, condition, MilestoneStatus::Verified, None, None)
            .unwrap();
    }
    engine.clock().set(g.expires_at + Duration::seconds(1));

    let (after, _) = engine.evaluate_now(&g.id).unwrap();
    assert_eq!(after.status, GuaranteeStatus::Expired);
    assert!(after.resolved_at.is_some());

    let err = engine
        .verify_milestone(&g.id, "kickoff", MilestoneStatus::Failed, None, None)
        .unwrap_err();
    assert!(matches!(err, Error::InvalidState(_)));
}

#[test]
fn test_failed_refund_then_retry() {
    let engine = mem_engine();
    let g = issue(&engine, dec!(1000));
    meet_conditions(&engine, &g.id);

    engine.gateway().fail_next(GatewayOp::Refund);
    let err = engine
        .choose_payout(&g.id, PayoutType::Refund, "a@x.com")
        .unwrap_err();
    assert!(err.is_retryable());
    assert!(engine.gateway().refunds().is_empty());

    let r = engine.choose_payout(&g.id, PayoutType::Refund, "a@x.com").unwrap();
    assert_eq!(r.instance.status, GuaranteeStatus::RefundIssued);
    assert_eq!(engine.gateway().refunds().len(), 1);
}

#[test]
fn test_refund_after_lost_commit_is_not_duplicated() {
    let engine = mem_engine();
    let g = issue(&engine, dec!(1000));
    meet_conditions(&engine, &g.id);

    // An earlier attempt reached the processor and died before committing.
    let earlier = engine
        .gateway()
        .create_refund(&RefundRequest {
            payment_reference: "pi_launch".to_string(),
            amount_minor: 50_000,
            currency: "usd".to_string(),
            idempotency_key: idempotency_key(&g.id, PayoutType::Refund),
        })
        .unwrap();

    let r = engine.choose_payout(&g.id, PayoutType::Refund, "a@x.com").unwrap();
    assert_eq!(r.instance.stripe_refund_id(), Some(earlier.id.as_str()));
    assert_eq!(engine.gateway().refunds().len(), 1);
}

#[test]
fn test_storage_failure_on_claim_is_retryable() {
    let engine = mem_engine();
    let g = issue(&engine, dec!(1000));
    meet_conditions(&engine, &g.id);

    engine.repo().with_storage(|s| s.fail_next_append());
    let err = engine
        .choose_payout(&g.id, PayoutType::Credit, "a@x.com")
        .unwrap_err();
    assert!(matches!(err, Error::Storage(_)));
    let stored = engine.repo().load_instance(&g.id).unwrap().unwrap();
    assert_eq!(stored.status, GuaranteeStatus::ConditionsMet);
    assert!(stored.claim.is_none());

    engine.choose_payout(&g.id, PayoutType::Credit, "a@x.com").unwrap();
}

#[test]
fn test_resolved_guarantee_survives_restart() {
    let dir = TempDir::new().unwrap();
    let (id, refund_id) = {
        let engine = open_file_engine(&dir, start());
        seed(&engine);
        let g = issue(&engine, dec!(1000));
        meet_conditions(&engine, &g.id);
        let r = engine.choose_payout(&g.id, PayoutType::Refund, "a@x.com").unwrap();
        (g.id, r.instance.stripe_refund_id().unwrap().to_string())
    };

    let engine = open_file_engine(&dir, start() + Duration::days(1));
    let stored = engine.repo().load_instance(&id).unwrap().unwrap();
    assert_eq!(stored.status, GuaranteeStatus::RefundIssued);
    assert_eq!(stored.stripe_refund_id(), Some(refund_id.as_str()));
    assert_eq!(engine.repo().load_milestones(&id).unwrap().len(), 2);
    assert_eq!(engine.gateway().refunds().len(), 1);

    let err = engine
        .choose_payout(&id, PayoutType::Refund, "a@x.com")
        .unwrap_err();
    assert_eq!(
        err.to_string(),
        "Payout can only be chosen when status is conditions_met. Current: refund_issued"
    );
}

#[test]
fn test_journal_replays_without_snapshot() {
    let dir = TempDir::new().unwrap();
    let id = {
        let engine = open_file_engine(&dir, start());
        seed(&engine);
        let g = issue(&engine, dec!(250));
        meet_conditions(&engine, &g.id);
        g.id
    };
    std::fs::remove_file(dir.path().join("state.bin")).unwrap();

    let storage = FileStorage::with_paths(
        dir.path().join("journal.log"),
        dir.path().join("state.bin"),
    );
    assert!(storage.load_state().unwrap().is_none());
    let engine = open_file_engine(&dir, start());
    let stored = engine.repo().load_instance(&id).unwrap().unwrap();
    assert_eq!(stored.status, GuaranteeStatus::ConditionsMet);
    let plan = engine.repo().load_plan("plan-inner-circle").unwrap().unwrap();
    assert!(plan.synced_price_id().is_some());
}
