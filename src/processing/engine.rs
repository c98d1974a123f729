//! Sequential processing engine.
//!
//! One submission at a time: each tick claims the oldest pending submission
//! (if the slot is free), runs the analyzer on its own task under a hard
//! time limit, and records the outcome. The slot is released on every path,
//! including analyzer errors, panics and stalls.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, error, info, warn};

use super::analysis::{Analyzer, ProgressSink};
use crate::error::{ProcessingError, TransitionError};
use crate::events::bus::panic_message;
use crate::scheduler::Tick;
use crate::submissions::model::{ProcessingResult, Submission};
use crate::submissions::repository::SubmissionRepository;

/// What a single `process_next` call did.
#[derive(Debug)]
pub enum ProcessOutcome {
    /// Nothing pending, or the slot was already held.
    Idle,
    Completed(Submission),
    Failed(Submission),
}

pub struct ProcessingEngine {
    repo: Arc<SubmissionRepository>,
    analyzer: Arc<dyn Analyzer>,
    max_processing: Duration,
}

impl ProcessingEngine {
    pub fn new(
        repo: Arc<SubmissionRepository>,
        analyzer: Arc<dyn Analyzer>,
        max_processing: Duration,
    ) -> Self {
        Self {
            repo,
            analyzer,
            max_processing,
        }
    }

    /// Claim and fully process the next pending submission.
    ///
    /// Returns `Err` only if the repository rejects the engine's own
    /// transitions, which means the slot bookkeeping is broken.
    pub async fn process_next(&self) -> Result<ProcessOutcome, TransitionError> {
        let Some(submission) = self.repo.claim_next().await else {
            return Ok(ProcessOutcome::Idle);
        };
        let id = submission.id;

        info!(
            submission_id = %id,
            analyzer = self.analyzer.name(),
            "Starting analysis"
        );

        match self.run_analysis(submission).await {
            Ok((result, streamed)) => {
                self.publish_final_text(id, &result, &streamed).await;
                let completed = self.repo.complete_with(id, result).await?;
                Ok(ProcessOutcome::Completed(completed))
            }
            Err(e) => {
                warn!(submission_id = %id, error = %e, "Analysis did not complete");
                let failed = self.repo.fail_with(id, e.to_string()).await?;
                Ok(ProcessOutcome::Failed(failed))
            }
        }
    }

    /// Run the analyzer on its own task so a stall can be aborted and a
    /// panic can be contained.
    async fn run_analysis(
        &self,
        submission: Submission,
    ) -> Result<(ProcessingResult, String), ProcessingError> {
        let id = submission.id;
        let analyzer = Arc::clone(&self.analyzer);
        let mut sink = ProgressSink::new(Arc::clone(&self.repo), id);

        let mut handle = tokio::spawn(async move {
            let result = analyzer.analyze(&submission, &mut sink).await;
            (result, sink.into_text())
        });

        match tokio::time::timeout(self.max_processing, &mut handle).await {
            Ok(Ok((Ok(result), streamed))) => Ok((result, streamed)),
            Ok(Ok((Err(e), _))) => Err(e.into()),
            Ok(Err(join_error)) => {
                let reason = if join_error.is_panic() {
                    panic_message(join_error.into_panic().as_ref())
                } else {
                    join_error.to_string()
                };
                error!(submission_id = %id, reason = %reason, "Analysis task panicked");
                Err(ProcessingError::Panicked { id, reason })
            }
            Err(_) => {
                handle.abort();
                Err(ProcessingError::Stalled {
                    id,
                    after: self.max_processing,
                })
            }
        }
    }

    /// Make sure the last `processing-update` carries the full reasoning.
    async fn publish_final_text(&self, id: uuid::Uuid, result: &ProcessingResult, streamed: &str) {
        if result.reasoning == streamed {
            return;
        }
        if !result.reasoning.starts_with(streamed) {
            warn!(
                submission_id = %id,
                "Analyzer reasoning does not extend its streamed text"
            );
            return;
        }
        if let Err(e) = self.repo.report_progress(id, result.reasoning.clone()).await {
            warn!(submission_id = %id, error = %e, "Could not publish final progress text");
        }
    }
}

#[async_trait]
impl Tick for ProcessingEngine {
    fn name(&self) -> &str {
        "processing"
    }

    async fn tick(&self) {
        match self.process_next().await {
            Ok(ProcessOutcome::Idle) => debug!("No submission to process"),
            Ok(ProcessOutcome::Completed(_)) => {}
            Ok(ProcessOutcome::Failed(submission)) => {
                debug!(submission_id = %submission.id, "Processing tick ended in failure");
            }
            Err(e) => error!(error = %e, "Processing tick rejected by repository"),
        }
    }
}
