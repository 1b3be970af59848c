//! Request/response payloads and thin handlers for the external interfaces.
//!
//! Handlers take string-typed inputs as they arrive over the wire, parse
//! them, and call into the engine. Any transport (HTTP, CLI) serializes the
//! returned DTOs, or an `ErrorResponse` built from the error.

use crate::clock::Clock;
use crate::engine::{
    GuaranteeEngine, ManualResolution, OutstandingCondition, PayoutOutcome, PayoutResolution,
};
use crate::error::{Error, Result};
use crate::gateway::PaymentGateway;
use crate::state::{
    GuaranteeInstance, GuaranteeMilestone, GuaranteeStatus, MilestoneStatus, PayoutType,
};
use crate::storage::GuaranteeRepository;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Admin verdict on one milestone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerifyMilestoneRequest {
    pub status: String,
    #[serde(default)]
    pub admin_notes: Option<String>,
    #[serde(default)]
    pub verified_by: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmitEvidenceRequest {
    pub client_email: String,
    pub evidence: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolveRequest {
    pub resolution: String,
    #[serde(default)]
    pub notes: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChoosePayoutRequest {
    pub payout_type: String,
    pub client_email: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EvaluateResponse {
    pub instance: GuaranteeInstance,
    /// Status after evaluation.
    pub result: GuaranteeStatus,
    pub message: String,
    pub outstanding: Vec<OutstandingCondition>,
}

/// Result of a client's payout choice. Which optional fields are set
/// depends on `result`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PayoutResponse {
    pub success: bool,
    pub result: GuaranteeStatus,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refund_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refund_amount: Option<Decimal>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub discount_code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub credit_amount: Option<Decimal>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bonus_multiplier: Option<Decimal>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subscription_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub plan_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub amount_per_interval: Option<Decimal>,
}

impl From<&PayoutResolution> for PayoutResponse {
    fn from(resolution: &PayoutResolution) -> Self {
        let mut response = PayoutResponse {
            success: true,
            result: resolution.outcome.status(),
            message: resolution.outcome.message(),
            refund_id: None,
            refund_amount: None,
            discount_code: None,
            credit_amount: None,
            bonus_multiplier: None,
            subscription_id: None,
            plan_name: None,
            amount_per_interval: None,
        };
        match &resolution.outcome {
            PayoutOutcome::RefundIssued { refund_id, amount } => {
                response.refund_id = Some(refund_id.clone());
                response.refund_amount = Some(*amount);
            }
            PayoutOutcome::CreditIssued {
                discount_code,
                amount,
                ..
            } => {
                response.discount_code = Some(discount_code.clone());
                response.credit_amount = Some(*amount);
            }
            PayoutOutcome::RolloverUpsellApplied {
                discount_code,
                credit_amount,
                bonus_multiplier,
                ..
            } => {
                response.discount_code = Some(discount_code.clone());
                response.credit_amount = Some(*credit_amount);
                response.bonus_multiplier = Some(*bonus_multiplier);
            }
            PayoutOutcome::RolloverContinuityApplied {
                subscription_id,
                credit_amount,
                plan_name,
                amount_per_interval,
                ..
            } => {
                response.subscription_id = Some(subscription_id.clone());
                response.credit_amount = Some(*credit_amount);
                response.plan_name = Some(plan_name.clone());
                response.amount_per_interval = Some(*amount_per_interval);
            }
        }
        response
    }
}

/// Error body. `retryable` tells the client whether the same request may be
/// sent again as-is.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub kind: String,
    pub retryable: bool,
}

impl From<&Error> for ErrorResponse {
    fn from(e: &Error) -> Self {
        ErrorResponse {
            error: e.to_string(),
            kind: e.kind().to_string(),
            retryable: e.is_retryable(),
        }
    }
}

fn parse_verdict(status: &str) -> Result<MilestoneStatus> {
    match status.parse::<MilestoneStatus>() {
        Ok(MilestoneStatus::Pending) | Err(_) => Err(Error::InvalidArgument(
            "Invalid status. Must be one of: verified, failed, waived".to_string(),
        )),
        Ok(status) => Ok(status),
    }
}

pub fn verify_milestone<R, G, C>(
    engine: &GuaranteeEngine<R, G, C>,
    instance_id: &str,
    milestone_ref: &str,
    request: &VerifyMilestoneRequest,
) -> Result<GuaranteeMilestone>
where
    R: GuaranteeRepository,
    G: PaymentGateway,
    C: Clock,
{
    let status = parse_verdict(&request.status)?;
    engine.verify_milestone(
        instance_id,
        milestone_ref,
        status,
        request.admin_notes.clone(),
        request.verified_by.as_deref(),
    )
}

pub fn submit_evidence<R, G, C>(
    engine: &GuaranteeEngine<R, G, C>,
    instance_id: &str,
    milestone_ref: &str,
    request: &SubmitEvidenceRequest,
) -> Result<GuaranteeMilestone>
where
    R: GuaranteeRepository,
    G: PaymentGateway,
    C: Clock,
{
    engine.submit_milestone_evidence(
        instance_id,
        milestone_ref,
        &request.client_email,
        &request.evidence,
    )
}

pub fn evaluate<R, G, C>(
    engine: &GuaranteeEngine<R, G, C>,
    instance_id: &str,
) -> Result<EvaluateResponse>
where
    R: GuaranteeRepository,
    G: PaymentGateway,
    C: Clock,
{
    let (instance, evaluation) = engine.evaluate_now(instance_id)?;
    Ok(EvaluateResponse {
        result: instance.status,
        message: evaluation.message(),
        outstanding: evaluation.outstanding,
        instance,
    })
}

pub fn resolve<R, G, C>(
    engine: &GuaranteeEngine<R, G, C>,
    instance_id: &str,
    request: &ResolveRequest,
) -> Result<GuaranteeInstance>
where
    R: GuaranteeRepository,
    G: PaymentGateway,
    C: Clock,
{
    let resolution: ManualResolution = request.resolution.parse()?;
    engine.resolve_manually(
        instance_id,
        resolution,
        request.notes.as_deref().unwrap_or_default(),
    )
}

pub fn choose_payout<R, G, C>(
    engine: &GuaranteeEngine<R, G, C>,
    instance_id: &str,
    request: &ChoosePayoutRequest,
) -> Result<PayoutResponse>
where
    R: GuaranteeRepository,
    G: PaymentGateway,
    C: Clock,
{
    let payout_type: PayoutType = request.payout_type.parse()?;
    let resolution = engine.choose_payout(instance_id, payout_type, &request.client_email)?;
    Ok(PayoutResponse::from(&resolution))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::fixtures::*;
    use crate::gateway::GatewayOp;
    use rust_decimal_macros::dec;

    #[test]
    fn test_verify_rejects_pending_and_garbage() {
        let engine = engine();
        let g = issue(&engine);
        for status in ["pending", "done"] {
            let request = VerifyMilestoneRequest {
                status: status.to_string(),
                admin_notes: None,
                verified_by: None,
            };
            let err = verify_milestone(&engine, &g.id, "attend-sessions", &request).unwrap_err();
            assert_eq!(
                err,
                Error::InvalidArgument(
                    "Invalid status. Must be one of: verified, failed, waived".to_string()
                )
            );
        }
    }

    #[test]
    fn test_choose_payout_parses_type() {
        let engine = engine();
        let g = issue_met(&engine);
        let request = ChoosePayoutRequest {
            payout_type: "cash".to_string(),
            client_email: "a@x.com".to_string(),
        };
        let err = choose_payout(&engine, &g.id, &request).unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }

    #[test]
    fn test_upsell_response_json() {
        let engine = engine();
        let g = issue_met(&engine);
        let request: ChoosePayoutRequest = serde_json::from_str(
            r#"{"payout_type": "rollover_upsell", "client_email": "A@x.com"}"#,
        )
        .unwrap();
        let response = choose_payout(&engine, &g.id, &request).unwrap();
        assert_eq!(response.result, GuaranteeStatus::RolloverUpsellApplied);
        assert_eq!(response.credit_amount, Some(dec!(750)));

        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json["result"], "rollover_upsell_applied");
        assert_eq!(json["success"], true);
        assert!(json.get("refund_id").is_none());
        assert!(json["discount_code"].as_str().unwrap().starts_with("UPSELL-"));
    }

    #[test]
    fn test_evaluate_and_resolve() {
        let engine = engine();
        let g = issue(&engine);
        let response = evaluate(&engine, &g.id).unwrap();
        assert_eq!(response.result, GuaranteeStatus::Active);
        assert_eq!(response.outstanding.len(), 2);

        let request = ResolveRequest {
            resolution: "voided".to_string(),
            notes: Some("chargeback".to_string()),
        };
        let voided = resolve(&engine, &g.id, &request).unwrap();
        assert_eq!(voided.status, GuaranteeStatus::Voided);
        assert_eq!(voided.resolution_notes.as_deref(), Some("chargeback"));

        let bad = ResolveRequest {
            resolution: "refunded".to_string(),
            notes: None,
        };
        assert!(matches!(
            resolve(&engine, &g.id, &bad).unwrap_err(),
            Error::InvalidArgument(_)
        ));
    }

    #[test]
    fn test_error_response_marks_retryable() {
        let engine = engine();
        let g = issue_met(&engine);
        engine.gateway().fail_next(GatewayOp::Refund);
        let request = ChoosePayoutRequest {
            payout_type: "refund".to_string(),
            client_email: "a@x.com".to_string(),
        };
        let err = choose_payout(&engine, &g.id, &request).unwrap_err();
        let body = ErrorResponse::from(&err);
        assert_eq!(body.kind, "external_service");
        assert!(body.retryable);

        let err = choose_payout(&engine, "missing", &request).unwrap_err();
        let body = ErrorResponse::from(&err);
        assert_eq!(body.kind, "not_found");
        assert!(!body.retryable);
    }
}
