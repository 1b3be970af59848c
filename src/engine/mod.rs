//! Guarantee engine: milestone tracking, evaluation, payout resolution and
//! the admin override path, over a repository, a payment gateway and a clock.

pub mod admin;
pub mod evaluator;
pub mod payout;
pub mod resolution;
pub mod tracker;

pub use admin::{GuaranteeView, IssueRequest, ManualResolution, SweepFailure, SweepReport};
pub use evaluator::{evaluate, Evaluation, EvaluationReason, OutstandingCondition};
pub use payout::{calculate_payout_amount, calculate_rollover_credit, PayoutQuote};
pub use resolution::{PayoutOutcome, PayoutResolution};

use crate::clock::Clock;
use crate::error::{Error, Result};
use crate::gateway::PaymentGateway;
use crate::state::{GuaranteeInstance, GuaranteeTemplate};
use crate::storage::GuaranteeRepository;
use chrono::{DateTime, Duration, Utc};

/// Tunables handed to the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineSettings {
    /// Lease length of a payout resolution claim.
    pub claim_ttl: Duration,
    /// Currency for gateway refunds.
    pub currency: String,
    pub credit_code_prefix: String,
    pub upsell_code_prefix: String,
}

impl Default for EngineSettings {
    fn default() -> Self {
        EngineSettings {
            claim_ttl: Duration::seconds(300),
            currency: "usd".to_string(),
            credit_code_prefix: "GUAR".to_string(),
            upsell_code_prefix: "UPSELL".to_string(),
        }
    }
}

/// Entry point for every guarantee operation.
///
/// Holds no per-instance state of its own: all coordination happens through
/// the repository's conditional writes, so any number of engines may share
/// one repository.
pub struct GuaranteeEngine<R, G, C>
where
    R: GuaranteeRepository,
    G: PaymentGateway,
    C: Clock,
{
    repo: R,
    gateway: G,
    clock: C,
    settings: EngineSettings,
}

impl<R, G, C> GuaranteeEngine<R, G, C>
where
    R: GuaranteeRepository,
    G: PaymentGateway,
    C: Clock,
{
    pub fn new(repo: R, gateway: G, clock: C, settings: EngineSettings) -> Self {
        GuaranteeEngine {
            repo,
            gateway,
            clock,
            settings,
        }
    }

    pub fn repo(&self) -> &R {
        &self.repo
    }

    pub fn gateway(&self) -> &G {
        &self.gateway
    }

    pub fn clock(&self) -> &C {
        &self.clock
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    fn require_instance(&self, id: &str) -> Result<GuaranteeInstance> {
        self.repo
            .load_instance(id)?
            .ok_or_else(|| Error::NotFound(format!("Guarantee instance {} not found", id)))
    }

    fn require_template(&self, instance: &GuaranteeInstance) -> Result<GuaranteeTemplate> {
        self.repo
            .load_template(&instance.guarantee_template_id)?
            .ok_or_else(|| {
                Error::NotFound(format!(
                    "Guarantee template {} not found",
                    instance.guarantee_template_id
                ))
            })
    }

    /// Possession-of-email check for client-initiated actions.
    fn authorize_client(&self, instance: &GuaranteeInstance, client_email: &str) -> Result<()> {
        if client_email.trim().is_empty() {
            return Err(Error::InvalidArgument("Client email is required".to_string()));
        }
        if !instance.is_owned_by(client_email) {
            tracing::warn!(instance_id = %instance.id, "client email mismatch");
            return Err(Error::Unauthorized(
                "Client email does not match this guarantee".to_string(),
            ));
        }
        Ok(())
    }
}
