//! Condition evaluator.
//!
//! Pure: decides the status an instance should be in given its milestones
//! and the current time. Persisting the outcome is the caller's job.
//!
//! Rules, first match wins:
//! 1. terminal instance: unchanged
//! 2. `active` and past `expires_at`: `expired`
//! 3. `conditions_met`: unchanged (never demoted)
//! 4. unconditional template, or no blocking milestone: `conditions_met`
//! 5. otherwise `active`

use crate::state::{
    GuaranteeInstance, GuaranteeMilestone, GuaranteeStatus, GuaranteeTemplate, MilestoneStatus,
};
use chrono::{DateTime, Utc};
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EvaluationReason {
    AlreadyResolved,
    Expired,
    AlreadyMet,
    Unconditional,
    AllRequiredSatisfied,
    ConditionsOutstanding,
}

/// A required milestone still blocking the guarantee.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OutstandingCondition {
    pub condition_id: String,
    pub label: String,
    pub status: MilestoneStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Evaluation {
    pub current: GuaranteeStatus,
    pub target: GuaranteeStatus,
    pub reason: EvaluationReason,
    pub outstanding: Vec<OutstandingCondition>,
}

impl Evaluation {
    /// True if persisting this evaluation changes the instance.
    pub fn is_transition(&self) -> bool {
        self.current != self.target
    }

    pub fn message(&self) -> String {
        match self.reason {
            EvaluationReason::AlreadyResolved => {
                format!("Guarantee already resolved ({}).", self.current)
            }
            EvaluationReason::Expired => "Guarantee has expired. Window closed.".to_string(),
            EvaluationReason::AlreadyMet | EvaluationReason::AllRequiredSatisfied => {
                "Conditions met. Client should choose their payout preference.".to_string()
            }
            EvaluationReason::Unconditional => {
                "Unconditional guarantee. Client should choose their payout preference."
                    .to_string()
            }
            EvaluationReason::ConditionsOutstanding => {
                format!("{} condition(s) still outstanding.", self.outstanding.len())
            }
        }
    }
}

fn outstanding(milestones: &[GuaranteeMilestone]) -> Vec<OutstandingCondition> {
    milestones
        .iter()
        .filter(|m| m.is_blocking())
        .map(|m| OutstandingCondition {
            condition_id: m.condition_id.clone(),
            label: m.condition_label.clone(),
            status: m.status,
        })
        .collect()
}

pub fn evaluate(
    instance: &GuaranteeInstance,
    template: &GuaranteeTemplate,
    milestones: &[GuaranteeMilestone],
    now: DateTime<Utc>,
) -> Evaluation {
    let current = instance.status;
    let blocking = outstanding(milestones);
    let decide = |target: GuaranteeStatus,
                  reason: EvaluationReason,
                  outstanding: Vec<OutstandingCondition>| Evaluation {
        current,
        target,
        reason,
        outstanding,
    };

    if current.is_terminal() || instance.is_resolved() {
        return decide(current, EvaluationReason::AlreadyResolved, Vec::new());
    }
    if current == GuaranteeStatus::Active && instance.is_expired_at(now) {
        return decide(GuaranteeStatus::Expired, EvaluationReason::Expired, blocking);
    }
    if current == GuaranteeStatus::ConditionsMet {
        return decide(current, EvaluationReason::AlreadyMet, Vec::new());
    }
    if template.is_unconditional() {
        return decide(
            GuaranteeStatus::ConditionsMet,
            EvaluationReason::Unconditional,
            Vec::new(),
        );
    }
    if blocking.is_empty() {
        return decide(
            GuaranteeStatus::ConditionsMet,
            EvaluationReason::AllRequiredSatisfied,
            Vec::new(),
        );
    }
    decide(current, EvaluationReason::ConditionsOutstanding, blocking)
}
