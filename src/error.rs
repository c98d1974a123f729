//! Error types for the intake pipeline.

use std::time::Duration;

use uuid::Uuid;

use crate::submissions::model::SubmissionStatus;

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Source error: {0}")]
    Source(#[from] SourceError),

    #[error("Attachment error: {0}")]
    Attachment(#[from] AttachmentError),

    #[error("Transition error: {0}")]
    Transition(#[from] TransitionError),

    #[error("Processing error: {0}")]
    Processing(#[from] ProcessingError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Failed to load env file: {0}")]
    EnvFile(#[from] dotenvy::Error),
}

/// Errors talking to the external message source (mailbox, network).
///
/// Transient: a failed tick is logged and retried on the next one.
#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("Request to message source failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("Message source returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Message source authentication failed: {0}")]
    Auth(String),

    #[error("Failed to decode message source payload: {0}")]
    Decode(String),

    #[error("Message {0} not found at source")]
    NotFound(String),
}

/// Per-attachment extraction failure.
#[derive(Debug, thiserror::Error)]
pub enum AttachmentError {
    #[error("Failed to fetch attachment {filename}: {source}")]
    Fetch {
        filename: String,
        #[source]
        source: SourceError,
    },

    #[error("Failed to store attachment {filename}: {source}")]
    Store {
        filename: String,
        #[source]
        source: std::io::Error,
    },
}

/// Repository contract violations. These are programming errors: the
/// repository rejects them without touching state.
#[derive(Debug, thiserror::Error)]
pub enum TransitionError {
    #[error("Submission {id} not found")]
    NotFound { id: Uuid },

    #[error("Submission {id} is {from}, cannot transition to {to}")]
    InvalidTransition {
        id: Uuid,
        from: SubmissionStatus,
        to: SubmissionStatus,
    },

    #[error("Cannot start {id}: submission {holder} is already processing")]
    SlotBusy { id: Uuid, holder: Uuid },

    #[error("Transition of {id} to {to} must go through complete_with/fail_with")]
    RequiresPayload { id: Uuid, to: SubmissionStatus },

    #[error("Submission {id} does not hold the processing slot")]
    NotSlotHolder { id: Uuid },

    #[error("Progress text for {id} must extend the previous update")]
    ProgressRegressed { id: Uuid },
}

/// Errors surfaced by a pluggable analysis procedure.
#[derive(Debug, Clone, thiserror::Error)]
pub enum AnalysisError {
    #[error("Analysis failed: {0}")]
    Failed(String),

    #[error("Analysis cancelled")]
    Cancelled,
}

/// Errors that end a processing run in the `failed` state.
#[derive(Debug, thiserror::Error)]
pub enum ProcessingError {
    #[error("Processing of {id} stalled after {after:?}")]
    Stalled { id: Uuid, after: Duration },

    #[error(transparent)]
    Analysis(#[from] AnalysisError),

    #[error("Analysis of {id} panicked: {reason}")]
    Panicked { id: Uuid, reason: String },
}

/// Result type alias for the pipeline.
pub type Result<T> = std::result::Result<T, Error>;
