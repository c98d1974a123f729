//! Submission data model: statuses, attachments and processing results.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle status of a submission.
///
/// Transitions only move forward: `pending → processing → {completed, failed}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubmissionStatus {
    /// Admitted and waiting in the queue.
    Pending,
    /// Holding the processing slot.
    Processing,
    /// Analysis finished with a result.
    Completed,
    /// Analysis failed, stalled, or panicked.
    Failed,
}

impl SubmissionStatus {
    /// Check if this status allows transitioning to another status.
    pub fn can_transition_to(&self, target: SubmissionStatus) -> bool {
        use SubmissionStatus::*;

        matches!(
            (self, target),
            (Pending, Processing) | (Processing, Completed) | (Processing, Failed)
        )
    }

    /// Completed and failed submissions never change again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl std::fmt::Display for SubmissionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for SubmissionStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "processing" => Ok(Self::Processing),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("Unknown submission status: {}", s)),
        }
    }
}

/// A file extracted from the source message and stored externally.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Attachment {
    pub filename: String,
    pub mime_type: String,
    /// Opaque pointer to the stored bytes (a file name under the uploads dir
    /// for the local store).
    pub storage_reference: String,
    pub size_bytes: u64,
}

/// Outcome of a successful analysis run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessingResult {
    /// Full accumulated narrative; equals the last streamed progress text.
    pub reasoning: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub people_count: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub receipt_total: Option<Decimal>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub per_person_cost: Option<Decimal>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subsidy_per_person: Option<Decimal>,
    pub final_payout: Decimal,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<String>,
}

impl ProcessingResult {
    /// A result carrying only the narrative and the payout.
    pub fn new(reasoning: impl Into<String>, final_payout: Decimal) -> Self {
        Self {
            reasoning: reasoning.into(),
            people_count: None,
            receipt_total: None,
            per_person_cost: None,
            subsidy_per_person: None,
            final_payout,
            confidence: None,
        }
    }
}

/// Everything needed to admit a submission, before id and status exist.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmissionIntake {
    pub sender_address: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_name: Option<String>,
    #[serde(default)]
    pub subject: String,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
}

/// One admitted unit of work.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Submission {
    pub id: Uuid,
    pub sender_address: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_name: Option<String>,
    pub subject: String,
    pub body: String,
    pub attachments: Vec<Attachment>,
    pub status: SubmissionStatus,
    pub received_at: DateTime<Utc>,
    /// When the submission claimed the processing slot.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    /// Set exactly once, on the first terminal transition.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processed_at: Option<DateTime<Utc>>,
    /// Present iff status is `completed`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processing_result: Option<ProcessingResult>,
    /// Present iff status is `failed`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Submission {
    /// Build a fresh pending submission from an intake.
    pub fn admit(intake: SubmissionIntake) -> Self {
        Self {
            id: Uuid::new_v4(),
            sender_address: intake.sender_address,
            sender_name: intake.sender_name,
            subject: intake.subject,
            body: intake.body,
            attachments: intake.attachments,
            status: SubmissionStatus::Pending,
            received_at: Utc::now(),
            started_at: None,
            processed_at: None,
            processing_result: None,
            error: None,
        }
    }
}
