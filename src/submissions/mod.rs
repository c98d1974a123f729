pub mod model;
pub mod repository;

pub use model::{Attachment, ProcessingResult, Submission, SubmissionIntake, SubmissionStatus};
pub use repository::{QueueStats, SubmissionRepository};
