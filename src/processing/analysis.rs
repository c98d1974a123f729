//! Pluggable analysis procedures.
//!
//! An [`Analyzer`] turns a claimed submission into a [`ProcessingResult`],
//! streaming cumulative progress through a [`ProgressSink`] as it goes.
//! The sink reports through the repository, so updates from a run that has
//! already been force-failed are refused and the run stops early.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rust_decimal::Decimal;
use tracing::debug;
use uuid::Uuid;

use crate::error::AnalysisError;
use crate::submissions::model::{ProcessingResult, Submission};
use crate::submissions::repository::SubmissionRepository;

/// Cumulative progress text for one processing run.
pub struct ProgressSink {
    repo: Arc<SubmissionRepository>,
    id: Uuid,
    text: String,
}

impl ProgressSink {
    pub fn new(repo: Arc<SubmissionRepository>, id: Uuid) -> Self {
        Self {
            repo,
            id,
            text: String::new(),
        }
    }

    /// Everything published so far.
    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn into_text(self) -> String {
        self.text
    }

    /// Append `chunk` and publish the whole text as a `processing-update`.
    ///
    /// Fails with [`AnalysisError::Cancelled`] once this run no longer holds
    /// the processing slot.
    pub async fn append(&mut self, chunk: &str) -> Result<(), AnalysisError> {
        let mut next = String::with_capacity(self.text.len() + chunk.len());
        next.push_str(&self.text);
        next.push_str(chunk);

        match self.repo.report_progress(self.id, next.clone()).await {
            Ok(()) => {
                self.text = next;
                Ok(())
            }
            Err(e) => {
                debug!(submission_id = %self.id, error = %e, "Progress refused, cancelling run");
                Err(AnalysisError::Cancelled)
            }
        }
    }
}

/// Analysis procedure run by the processing engine.
#[async_trait]
pub trait Analyzer: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &str;

    /// Analyze `submission`. The returned `reasoning` should equal the final
    /// text pushed through `progress`.
    async fn analyze(
        &self,
        submission: &Submission,
        progress: &mut ProgressSink,
    ) -> Result<ProcessingResult, AnalysisError>;
}

/// Placeholder analyzer: streams a fixed narrative word by word.
///
/// Does not inspect attachments. Every figure is zero.
#[derive(Debug, Clone)]
pub struct NarrativeAnalyzer {
    chunk_delay: Duration,
}

impl NarrativeAnalyzer {
    pub fn new(chunk_delay: Duration) -> Self {
        Self { chunk_delay }
    }

    pub fn narrative(submission: &Submission) -> String {
        format!(
            "Analyzing submission from {}...\n\
             Checking receipt image...\n\
             Identifying number of people in photo...\n\
             Calculating subsidy...\n\
             \n\
             Receipt total: $0.00\n\
             People count: Unable to determine\n\
             Per person cost: $0.00\n\
             Subsidy (50%): $0.00\n\
             \n\
             FINAL PAYOUT: $0.00",
            submission.sender_address
        )
    }
}

impl Default for NarrativeAnalyzer {
    fn default() -> Self {
        Self::new(Duration::from_millis(200))
    }
}

#[async_trait]
impl Analyzer for NarrativeAnalyzer {
    fn name(&self) -> &str {
        "narrative"
    }

    async fn analyze(
        &self,
        submission: &Submission,
        progress: &mut ProgressSink,
    ) -> Result<ProcessingResult, AnalysisError> {
        let narrative = Self::narrative(submission);

        for (i, word) in narrative.split(' ').enumerate() {
            tokio::time::sleep(self.chunk_delay).await;
            if i == 0 {
                progress.append(word).await?;
            } else {
                progress.append(&format!(" {word}")).await?;
            }
        }

        Ok(ProcessingResult::new(narrative, Decimal::ZERO))
    }
}
