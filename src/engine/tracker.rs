//! Milestone tracker: admin verification and client self-report evidence.
//!
//! Neither operation re-evaluates the instance; callers follow up with
//! `evaluate_now` when they want the status to move.

use super::GuaranteeEngine;
use crate::clock::Clock;
use crate::error::{Error, Result};
use crate::gateway::PaymentGateway;
use crate::state::{GuaranteeInstance, GuaranteeMilestone, MilestoneStatus, VerificationMethod};
use crate::storage::GuaranteeRepository;

fn ensure_open(instance: &GuaranteeInstance) -> Result<()> {
    if instance.status.is_terminal() {
        return Err(Error::InvalidState(format!(
            "Cannot update milestones on a guarantee with status: {}",
            instance.status
        )));
    }
    Ok(())
}

impl<R, G, C> GuaranteeEngine<R, G, C>
where
    R: GuaranteeRepository,
    G: PaymentGateway,
    C: Clock,
{
    fn require_milestone(&self, instance_id: &str, reference: &str) -> Result<GuaranteeMilestone> {
        self.repo
            .load_milestone(instance_id, reference)?
            .ok_or_else(|| {
                Error::NotFound(format!(
                    "Milestone {} not found on guarantee {}",
                    reference, instance_id
                ))
            })
    }

    /// Record an admin verdict on one milestone.
    ///
    /// `reference` is the milestone id or its condition slug.
    pub fn verify_milestone(
        &self,
        instance_id: &str,
        reference: &str,
        status: MilestoneStatus,
        notes: Option<String>,
        verified_by: Option<&str>,
    ) -> Result<GuaranteeMilestone> {
        if status == MilestoneStatus::Pending {
            return Err(Error::InvalidArgument(
                "Invalid status. Must be one of: verified, failed, waived".to_string(),
            ));
        }
        let instance = self.require_instance(instance_id)?;
        ensure_open(&instance)?;

        let mut milestone = self.require_milestone(instance_id, reference)?;
        let notes = notes.filter(|n| !n.trim().is_empty());
        milestone.record_verification(status, notes, verified_by.map(str::to_string), self.now());
        // The repository re-checks terminality under its own lock.
        self.repo.save_milestone(milestone.clone())?;

        tracing::info!(
            instance_id,
            condition_id = %milestone.condition_id,
            status = %status,
            "milestone verified"
        );
        Ok(milestone)
    }

    /// Attach client evidence to a self-reported milestone. Status is unchanged.
    pub fn submit_milestone_evidence(
        &self,
        instance_id: &str,
        reference: &str,
        client_email: &str,
        evidence: &str,
    ) -> Result<GuaranteeMilestone> {
        let instance = self.require_instance(instance_id)?;
        self.authorize_client(&instance, client_email)?;
        ensure_open(&instance)?;

        let evidence = evidence.trim();
        if evidence.is_empty() {
            return Err(Error::InvalidArgument("Client evidence is required".to_string()));
        }

        let mut milestone = self.require_milestone(instance_id, reference)?;
        if milestone.verification_method != VerificationMethod::ClientSelfReport {
            return Err(Error::InvalidArgument(format!(
                "Condition {} is verified by an admin and does not accept client evidence",
                milestone.condition_id
            )));
        }
        milestone.record_evidence(evidence.to_string(), self.now());
        self.repo.save_milestone(milestone.clone())?;

        tracing::info!(
            instance_id,
            condition_id = %milestone.condition_id,
            "client evidence submitted"
        );
        Ok(milestone)
    }
}

#[cfg(test)]
mod tests {
    use crate::engine::fixtures::*;
    use crate::engine::ManualResolution;
    use crate::error::Error;
    use crate::state::MilestoneStatus;
    use crate::storage::GuaranteeRepository;

    #[test]
    fn test_verify_by_condition_slug() {
        let engine = engine();
        let g = issue(&engine);
        let m = engine
            .verify_milestone(
                &g.id,
                "attend-sessions",
                MilestoneStatus::Verified,
                Some("All six attended".to_string()),
                Some("coach"),
            )
            .unwrap();
        assert_eq!(m.status, MilestoneStatus::Verified);
        assert_eq!(m.verified_by.as_deref(), Some("coach"));
        assert_eq!(m.verified_at, Some(start()));

        // Verification alone does not move the instance
        let reloaded = engine.repo().load_instance(&g.id).unwrap().unwrap();
        assert_eq!(reloaded.status, g.status);
    }

    #[test]
    fn test_verify_rejects_pending_and_unknown() {
        let engine = engine();
        let g = issue(&engine);
        let err = engine
            .verify_milestone(&g.id, "attend-sessions", MilestoneStatus::Pending, None, None)
            .unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));

        let err = engine
            .verify_milestone(&g.id, "nope", MilestoneStatus::Verified, None, None)
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));

        let err = engine
            .verify_milestone("missing", "attend-sessions", MilestoneStatus::Verified, None, None)
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[test]
    fn test_verify_on_terminal_instance_fails() {
        let engine = engine();
        let g = issue(&engine);
        engine
            .resolve_manually(&g.id, ManualResolution::Voided, "dispute")
            .unwrap();
        let err = engine
            .verify_milestone(&g.id, "attend-sessions", MilestoneStatus::Verified, None, None)
            .unwrap_err();
        assert_eq!(
            err,
            Error::InvalidState(
                "Cannot update milestones on a guarantee with status: voided".to_string()
            )
        );
    }

    #[test]
    fn test_evidence_only_on_self_report() {
        let engine = engine();
        let g = issue(&engine);

        let m = engine
            .submit_milestone_evidence(&g.id, "submit-homework", "A@X.com", "link to homework")
            .unwrap();
        assert_eq!(m.client_evidence.as_deref(), Some("link to homework"));
        assert_eq!(m.status, MilestoneStatus::Pending);

        let err = engine
            .submit_milestone_evidence(&g.id, "attend-sessions", "a@x.com", "I came")
            .unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));

        let err = engine
            .submit_milestone_evidence(&g.id, "submit-homework", "b@x.com", "mine")
            .unwrap_err();
        assert!(matches!(err, Error::Unauthorized(_)));

        let err = engine
            .submit_milestone_evidence(&g.id, "submit-homework", "a@x.com", "   ")
            .unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }
}
