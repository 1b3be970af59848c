use crate::error::{Error, Result};
use crate::state::template::{GuaranteeCondition, VerificationMethod};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Verification status of one contractual condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MilestoneStatus {
    Pending,
    Verified,
    Failed,
    Waived,
}

impl MilestoneStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MilestoneStatus::Pending => "pending",
            MilestoneStatus::Verified => "verified",
            MilestoneStatus::Failed => "failed",
            MilestoneStatus::Waived => "waived",
        }
    }

    /// Verified and waived both count toward "conditions met".
    pub fn is_satisfied(&self) -> bool {
        matches!(self, MilestoneStatus::Verified | MilestoneStatus::Waived)
    }
}

impl fmt::Display for MilestoneStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MilestoneStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "pending" => Ok(MilestoneStatus::Pending),
            "verified" | "met" => Ok(MilestoneStatus::Verified),
            "failed" | "not_met" => Ok(MilestoneStatus::Failed),
            "waived" => Ok(MilestoneStatus::Waived),
            other => Err(Error::InvalidArgument(format!(
                "Invalid milestone status '{}'. Must be one of: verified, failed, waived",
                other
            ))),
        }
    }
}

/// Milestone aggregate: one row per condition per guarantee instance.
///
/// Identity: `id`; also addressable by `(guarantee_instance_id, condition_id)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuaranteeMilestone {
    pub id: String,
    pub guarantee_instance_id: String,
    pub condition_id: String,
    pub condition_label: String,
    pub required: bool,
    pub verification_method: VerificationMethod,
    /// Order of the condition on the template.
    pub position: u32,
    pub status: MilestoneStatus,
    pub admin_notes: Option<String>,
    pub verified_by: Option<String>,
    pub verified_at: Option<DateTime<Utc>>,
    pub client_evidence: Option<String>,
    pub client_submitted_at: Option<DateTime<Utc>>,
}

impl GuaranteeMilestone {
    /// Seed a pending milestone for `condition`.
    pub fn seeded(
        id: String,
        guarantee_instance_id: String,
        condition: &GuaranteeCondition,
        position: u32,
    ) -> Self {
        GuaranteeMilestone {
            id,
            guarantee_instance_id,
            condition_id: condition.id.clone(),
            condition_label: condition.label.clone(),
            required: condition.required,
            verification_method: condition.verification_method,
            position,
            status: MilestoneStatus::Pending,
            admin_notes: None,
            verified_by: None,
            verified_at: None,
            client_evidence: None,
            client_submitted_at: None,
        }
    }

    pub fn is_satisfied(&self) -> bool {
        self.status.is_satisfied()
    }

    /// Required and not yet satisfied.
    pub fn is_blocking(&self) -> bool {
        self.required && !self.is_satisfied()
    }

    /// True if `reference` is this milestone's id or its condition slug.
    pub fn matches(&self, reference: &str) -> bool {
        self.id == reference || self.condition_id == reference
    }

    pub fn record_verification(
        &mut self,
        status: MilestoneStatus,
        notes: Option<String>,
        verified_by: Option<String>,
        at: DateTime<Utc>,
    ) {
        self.status = status;
        self.admin_notes = notes;
        self.verified_by = verified_by;
        self.verified_at = Some(at);
    }

    pub fn record_evidence(&mut self, evidence: String, at: DateTime<Utc>) {
        self.client_evidence = Some(evidence);
        self.client_submitted_at = Some(at);
    }
}
