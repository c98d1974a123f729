//! Submission repository, the single mutation gateway for queue state.
//!
//! Submissions live in an id-indexed map with a separate insertion-order
//! index. The processing slot lives next to them under the same lock, so
//! every mutation (and the event it publishes) completes before the next one
//! starts. Swapping in durable storage only changes `Inner`.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::RwLock;
use tracing::{debug, error, info};
use uuid::Uuid;

use super::model::{ProcessingResult, Submission, SubmissionIntake, SubmissionStatus};
use crate::error::TransitionError;
use crate::events::{EventBus, PipelineEvent, SubscriptionId};

/// Per-status counts, used by the health endpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub pending: usize,
    pub processing: usize,
    pub completed: usize,
    pub failed: usize,
    pub total: usize,
}

/// The submission currently holding the processing slot.
#[derive(Debug)]
struct Slot {
    id: Uuid,
    /// Last cumulative progress text published for `id`.
    progress: String,
}

#[derive(Debug, Default)]
struct Inner {
    by_id: HashMap<Uuid, Submission>,
    order: Vec<Uuid>,
    slot: Option<Slot>,
}

impl Inner {
    fn ordered(&self) -> impl Iterator<Item = &Submission> {
        self.order.iter().filter_map(|id| self.by_id.get(id))
    }

    fn first_pending(&self) -> Option<Uuid> {
        self.ordered()
            .find(|s| s.status == SubmissionStatus::Pending)
            .map(|s| s.id)
    }

    /// Move `id` into `processing` and take the slot. Callers have already
    /// checked that the slot is free and the submission is pending.
    fn start(&mut self, id: Uuid) -> Option<Submission> {
        let submission = self.by_id.get_mut(&id)?;
        submission.status = SubmissionStatus::Processing;
        submission.started_at = Some(Utc::now());
        self.slot = Some(Slot {
            id,
            progress: String::new(),
        });
        Some(submission.clone())
    }

    /// Validate a terminal transition for `id` and release the slot.
    fn finish(
        &mut self,
        id: Uuid,
        to: SubmissionStatus,
    ) -> Result<&mut Submission, TransitionError> {
        let from = self
            .by_id
            .get(&id)
            .map(|s| s.status)
            .ok_or(TransitionError::NotFound { id })?;
        if !from.can_transition_to(to) {
            return Err(TransitionError::InvalidTransition { id, from, to });
        }
        if self.slot.as_ref().is_some_and(|slot| slot.id == id) {
            self.slot = None;
        }
        self.by_id
            .get_mut(&id)
            .ok_or(TransitionError::NotFound { id })
    }
}

/// In-memory ordered submission store with a single processing slot.
pub struct SubmissionRepository {
    inner: RwLock<Inner>,
    bus: Arc<EventBus>,
}

impl SubmissionRepository {
    pub fn new(bus: Arc<EventBus>) -> Arc<Self> {
        Arc::new(Self {
            inner: RwLock::new(Inner::default()),
            bus,
        })
    }

    /// The bus this repository announces mutations on.
    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    /// Admit a new pending submission and announce it.
    pub async fn add(&self, intake: SubmissionIntake) -> Submission {
        let submission = Submission::admit(intake);

        let mut inner = self.inner.write().await;
        inner.order.push(submission.id);
        inner.by_id.insert(submission.id, submission.clone());

        info!(
            submission_id = %submission.id,
            sender = %submission.sender_address,
            subject = %submission.subject,
            attachments = submission.attachments.len(),
            "New submission added"
        );

        self.bus
            .publish(PipelineEvent::NewSubmission(submission.clone()));
        submission
    }

    /// All submissions in insertion order.
    pub async fn list(&self) -> Vec<Submission> {
        self.inner.read().await.ordered().cloned().collect()
    }

    pub async fn get(&self, id: Uuid) -> Option<Submission> {
        self.inner.read().await.by_id.get(&id).cloned()
    }

    /// The oldest pending submission, if any.
    pub async fn next_pending(&self) -> Option<Submission> {
        let inner = self.inner.read().await;
        inner
            .first_pending()
            .and_then(|id| inner.by_id.get(&id).cloned())
    }

    /// Id of the submission holding the processing slot.
    pub async fn processing_id(&self) -> Option<Uuid> {
        self.inner.read().await.slot.as_ref().map(|s| s.id)
    }

    pub async fn stats(&self) -> QueueStats {
        let inner = self.inner.read().await;
        let mut stats = QueueStats::default();
        for submission in inner.ordered() {
            match submission.status {
                SubmissionStatus::Pending => stats.pending += 1,
                SubmissionStatus::Processing => stats.processing += 1,
                SubmissionStatus::Completed => stats.completed += 1,
                SubmissionStatus::Failed => stats.failed += 1,
            }
            stats.total += 1;
        }
        stats
    }

    /// Move a submission along the state machine.
    ///
    /// Only `processing` can be reached here; terminal states need a payload
    /// and go through [`complete_with`](Self::complete_with) or
    /// [`fail_with`](Self::fail_with).
    pub async fn transition_to(
        &self,
        id: Uuid,
        to: SubmissionStatus,
    ) -> Result<Submission, TransitionError> {
        let mut inner = self.inner.write().await;

        let result = Self::check_start(&inner, id, to).and_then(|()| {
            inner
                .start(id)
                .ok_or(TransitionError::NotFound { id })
        });

        match result {
            Ok(submission) => {
                info!(submission_id = %id, "Submission processing started");
                self.bus.publish(PipelineEvent::ProcessingStarted { id });
                Ok(submission)
            }
            Err(e) => {
                error!(submission_id = %id, error = %e, "Rejected submission transition");
                Err(e)
            }
        }
    }

    /// Atomically pick the oldest pending submission and move it to
    /// `processing`, unless the slot is already held.
    pub async fn claim_next(&self) -> Option<Submission> {
        let mut inner = self.inner.write().await;

        if let Some(slot) = &inner.slot {
            debug!(holder = %slot.id, "Processing slot busy, not claiming");
            return None;
        }

        let id = inner.first_pending()?;
        let submission = inner.start(id)?;

        info!(submission_id = %id, "Claimed submission for processing");
        self.bus.publish(PipelineEvent::ProcessingStarted { id });
        Some(submission)
    }

    /// Publish cumulative progress text for the submission holding the slot.
    ///
    /// `text` must extend the previously reported text; updates from a
    /// submission that no longer holds the slot are rejected.
    pub async fn report_progress(&self, id: Uuid, text: String) -> Result<(), TransitionError> {
        let mut inner = self.inner.write().await;

        let slot = match inner.slot.as_mut() {
            Some(slot) if slot.id == id => slot,
            _ => return Err(TransitionError::NotSlotHolder { id }),
        };
        if !text.starts_with(slot.progress.as_str()) {
            return Err(TransitionError::ProgressRegressed { id });
        }

        slot.progress.clone_from(&text);
        self.bus
            .publish(PipelineEvent::ProcessingUpdate { id, text });
        Ok(())
    }

    /// Record a successful result. The submission must be `processing`.
    pub async fn complete_with(
        &self,
        id: Uuid,
        result: ProcessingResult,
    ) -> Result<Submission, TransitionError> {
        let mut inner = self.inner.write().await;

        let submission = match inner.finish(id, SubmissionStatus::Completed) {
            Ok(submission) => submission,
            Err(e) => {
                error!(submission_id = %id, error = %e, "Rejected completion");
                return Err(e);
            }
        };

        submission.status = SubmissionStatus::Completed;
        submission.processing_result = Some(result.clone());
        submission.processed_at = Some(Utc::now());
        let completed = submission.clone();

        info!(
            submission_id = %id,
            final_payout = %result.final_payout,
            "Completed processing"
        );
        self.bus
            .publish(PipelineEvent::ProcessingComplete { id, result });
        Ok(completed)
    }

    /// Record a failure. The submission must be `processing`.
    pub async fn fail_with(
        &self,
        id: Uuid,
        error: impl Into<String>,
    ) -> Result<Submission, TransitionError> {
        let error = error.into();
        let mut inner = self.inner.write().await;

        let submission = match inner.finish(id, SubmissionStatus::Failed) {
            Ok(submission) => submission,
            Err(e) => {
                error!(submission_id = %id, error = %e, "Rejected failure transition");
                return Err(e);
            }
        };

        submission.status = SubmissionStatus::Failed;
        submission.error = Some(error.clone());
        submission.processed_at = Some(Utc::now());
        let failed = submission.clone();

        info!(submission_id = %id, error = %error, "Submission failed");
        self.bus
            .publish(PipelineEvent::ProcessingFailed { id, error });
        Ok(failed)
    }

    /// Build the `initial-data` snapshot and register `handler` for every
    /// later event, with no mutation in between.
    pub async fn snapshot_and_subscribe<F>(&self, handler: F) -> (PipelineEvent, SubscriptionId)
    where
        F: Fn(&PipelineEvent) + Send + Sync + 'static,
    {
        // Mutations publish under the write lock, so holding the read lock
        // keeps the snapshot and the subscription point consistent.
        let inner = self.inner.read().await;
        let snapshot = PipelineEvent::InitialData {
            submissions: inner.ordered().cloned().collect(),
        };
        let subscription = self.bus.subscribe_all(handler);
        (snapshot, subscription)
    }

    fn check_start(inner: &Inner, id: Uuid, to: SubmissionStatus) -> Result<(), TransitionError> {
        let from = inner
            .by_id
            .get(&id)
            .map(|s| s.status)
            .ok_or(TransitionError::NotFound { id })?;
        if !from.can_transition_to(to) {
            return Err(TransitionError::InvalidTransition { id, from, to });
        }
        if to.is_terminal() {
            return Err(TransitionError::RequiresPayload { id, to });
        }
        if let Some(slot) = &inner.slot {
            return Err(TransitionError::SlotBusy {
                id,
                holder: slot.id,
            });
        }
        Ok(())
    }
}
