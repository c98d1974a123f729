//! Event kinds published by the pipeline.
//!
//! Serialized as `{"event": "<name>", "data": <payload>}` so a realtime
//! transport can forward them verbatim.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::submissions::model::{ProcessingResult, Submission};

/// Discriminant of [`PipelineEvent`], used to subscribe to a single kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    NewSubmission,
    ProcessingStarted,
    ProcessingUpdate,
    ProcessingComplete,
    ProcessingFailed,
    InitialData,
}

impl EventKind {
    /// Wire name of the event (matches the serde tag).
    pub fn name(&self) -> &'static str {
        match self {
            Self::NewSubmission => "new-submission",
            Self::ProcessingStarted => "processing-started",
            Self::ProcessingUpdate => "processing-update",
            Self::ProcessingComplete => "processing-complete",
            Self::ProcessingFailed => "processing-failed",
            Self::InitialData => "initial-data",
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Everything observers can learn about the pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum PipelineEvent {
    /// A submission was admitted into the queue.
    NewSubmission(Submission),
    /// The processing slot was claimed for `id`.
    ProcessingStarted { id: Uuid },
    /// Cumulative progress text for `id`. Only ever grows.
    ProcessingUpdate { id: Uuid, text: String },
    /// Terminal success.
    ProcessingComplete { id: Uuid, result: ProcessingResult },
    /// Terminal failure.
    ProcessingFailed { id: Uuid, error: String },
    /// Snapshot sent once to each newly connected observer.
    InitialData { submissions: Vec<Submission> },
}

impl PipelineEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::NewSubmission(_) => EventKind::NewSubmission,
            Self::ProcessingStarted { .. } => EventKind::ProcessingStarted,
            Self::ProcessingUpdate { .. } => EventKind::ProcessingUpdate,
            Self::ProcessingComplete { .. } => EventKind::ProcessingComplete,
            Self::ProcessingFailed { .. } => EventKind::ProcessingFailed,
            Self::InitialData { .. } => EventKind::InitialData,
        }
    }

    /// The submission this event is about, if it concerns exactly one.
    pub fn submission_id(&self) -> Option<Uuid> {
        match self {
            Self::NewSubmission(submission) => Some(submission.id),
            Self::ProcessingStarted { id }
            | Self::ProcessingUpdate { id, .. }
            | Self::ProcessingComplete { id, .. }
            | Self::ProcessingFailed { id, .. } => Some(*id),
            Self::InitialData { .. } => None,
        }
    }

    /// Whether this event ends a submission's lifecycle.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::ProcessingComplete { .. } | Self::ProcessingFailed { .. }
        )
    }
}
