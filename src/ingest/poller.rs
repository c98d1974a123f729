//! Ingestion poller. Bridges an external mailbox into the submission queue.
//!
//! Each tick:
//! 1. Lists candidate message ids from the source
//! 2. Skips ids already admitted
//! 3. Fetches the message and its attachments, stores them, parses the sender
//! 4. Admits the submission, then marks the id as seen
//!
//! Marking happens only after admission, so a message that fails before
//! that point is retried on the next tick.

use std::collections::HashSet;
use std::sync::{Arc, LazyLock};

use async_trait::async_trait;
use regex::Regex;
use tracing::{debug, error, info, warn};

use super::dedup::Deduplicator;
use super::source::{AttachmentStore, MessageSource, SourceAttachment};
use crate::error::{AttachmentError, SourceError};
use crate::scheduler::Tick;
use crate::submissions::model::{Attachment, Submission, SubmissionIntake};
use crate::submissions::repository::SubmissionRepository;

/// First `<...>` pair in a `From` header.
static ANGLE_ADDRESS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<([^<>]*)>").expect("angle address pattern is valid"));

/// What to do when some attachments of a message fail to extract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AttachmentPolicy {
    /// Admit the submission with the attachments that succeeded.
    #[default]
    AdmitPartial,
    /// Leave the message unadmitted and retry it next tick.
    RequireAll,
}

impl std::str::FromStr for AttachmentPolicy {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "partial" | "admit_partial" => Ok(Self::AdmitPartial),
            "all" | "require_all" => Ok(Self::RequireAll),
            other => Err(format!("Unknown attachment policy: {}", other)),
        }
    }
}

/// Counts from a single poll cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PollReport {
    /// Ids returned by the source, including duplicates.
    pub candidates: usize,
    pub admitted: usize,
    /// Already seen, or listed twice in this cycle.
    pub skipped: usize,
    /// Left unadmitted; retried next cycle.
    pub failed: usize,
}

/// Split a `Display Name <address>` header into address and optional name.
///
/// Without an angle-bracket pair the whole value is the address.
pub fn parse_sender(header: &str) -> (String, Option<String>) {
    let header = header.trim();

    let Some(caps) = ANGLE_ADDRESS.captures(header) else {
        return (header.to_string(), None);
    };
    let (Some(whole), Some(address)) = (caps.get(0), caps.get(1)) else {
        return (header.to_string(), None);
    };

    let address = address.as_str().trim();
    if address.is_empty() {
        return (header.to_string(), None);
    }

    let name = header[..whole.start()]
        .trim()
        .trim_matches('"')
        .trim();
    let name = (!name.is_empty()).then(|| name.to_string());

    (address.to_string(), name)
}

/// Polls a [`MessageSource`] and admits new messages as submissions.
pub struct IngestionPoller {
    source: Arc<dyn MessageSource>,
    store: Arc<dyn AttachmentStore>,
    dedup: Arc<Deduplicator>,
    repo: Arc<SubmissionRepository>,
    filter: String,
    policy: AttachmentPolicy,
}

impl IngestionPoller {
    pub fn new(
        source: Arc<dyn MessageSource>,
        store: Arc<dyn AttachmentStore>,
        dedup: Arc<Deduplicator>,
        repo: Arc<SubmissionRepository>,
        filter: impl Into<String>,
    ) -> Self {
        Self {
            source,
            store,
            dedup,
            repo,
            filter: filter.into(),
            policy: AttachmentPolicy::default(),
        }
    }

    pub fn with_policy(mut self, policy: AttachmentPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Run one poll cycle.
    ///
    /// Fails only if the candidate list can't be fetched; per-message
    /// failures are logged and counted.
    pub async fn poll_once(&self) -> Result<PollReport, SourceError> {
        debug!(source = self.source.name(), filter = %self.filter, "Checking for new messages");

        let candidates = self.source.list_candidate_ids(&self.filter).await?;
        let mut report = PollReport {
            candidates: candidates.len(),
            ..Default::default()
        };
        let mut attempted: HashSet<&str> = HashSet::new();

        for external_id in &candidates {
            if self.dedup.has_seen(external_id) || !attempted.insert(external_id.as_str()) {
                debug!(external_id = %external_id, "Skipping already seen message");
                report.skipped += 1;
                continue;
            }

            match self.admit(external_id).await {
                Ok(submission) => {
                    self.dedup.mark_seen(external_id.as_str());
                    debug!(
                        external_id = %external_id,
                        submission_id = %submission.id,
                        "Admitted message"
                    );
                    report.admitted += 1;
                }
                Err(e) => {
                    warn!(external_id = %external_id, error = %e, "Message not admitted, will retry");
                    report.failed += 1;
                }
            }
        }

        Ok(report)
    }

    async fn admit(&self, external_id: &str) -> crate::error::Result<Submission> {
        let message = self.source.fetch_message(external_id).await?;
        info!(external_id = %external_id, from = %message.sender_header, "New message");

        // Every attachment is downloaded before any is stored, so a message
        // rejected under `RequireAll` leaves nothing on disk.
        let mut fetched = Vec::with_capacity(message.attachments.len());
        for listed in &message.attachments {
            match self.fetch_attachment(external_id, listed).await {
                Ok(bytes) => fetched.push((listed, bytes)),
                Err(e) if self.policy == AttachmentPolicy::RequireAll => return Err(e.into()),
                Err(e) => warn!(external_id = %external_id, error = %e, "Dropping attachment"),
            }
        }

        let mut attachments = Vec::with_capacity(fetched.len());
        for (listed, bytes) in fetched {
            match self.store_attachment(listed, &bytes).await {
                Ok(attachment) => {
                    debug!(filename = %attachment.filename, "Stored attachment");
                    attachments.push(attachment);
                }
                Err(e) if self.policy == AttachmentPolicy::RequireAll => {
                    self.discard(&attachments).await;
                    return Err(e.into());
                }
                Err(e) => warn!(external_id = %external_id, error = %e, "Dropping attachment"),
            }
        }

        let (sender_address, sender_name) = parse_sender(&message.sender_header);
        let intake = SubmissionIntake {
            sender_address,
            sender_name,
            subject: message.subject,
            body: message.body,
            attachments,
        };

        Ok(self.repo.add(intake).await)
    }

    async fn fetch_attachment(
        &self,
        external_id: &str,
        listed: &SourceAttachment,
    ) -> Result<Vec<u8>, AttachmentError> {
        self.source
            .fetch_attachment_bytes(external_id, &listed.attachment_ref)
            .await
            .map_err(|source| AttachmentError::Fetch {
                filename: listed.filename.clone(),
                source,
            })
    }

    async fn store_attachment(
        &self,
        listed: &SourceAttachment,
        bytes: &[u8],
    ) -> Result<Attachment, AttachmentError> {
        let storage_reference = self
            .store
            .store(&listed.filename, bytes)
            .await
            .map_err(|source| AttachmentError::Store {
                filename: listed.filename.clone(),
                source,
            })?;

        Ok(Attachment {
            filename: listed.filename.clone(),
            mime_type: listed.mime_type.clone(),
            storage_reference,
            size_bytes: bytes.len() as u64,
        })
    }

    /// Remove attachments stored for a message that was not admitted.
    async fn discard(&self, attachments: &[Attachment]) {
        for attachment in attachments {
            if let Err(e) = self.store.remove(&attachment.storage_reference).await {
                warn!(
                    reference = %attachment.storage_reference,
                    error = %e,
                    "Failed to remove orphaned attachment"
                );
            }
        }
    }
}

#[async_trait]
impl Tick for IngestionPoller {
    fn name(&self) -> &str {
        "ingestion"
    }

    async fn tick(&self) {
        match self.poll_once().await {
            Ok(report) if report.admitted > 0 || report.failed > 0 => {
                info!(
                    admitted = report.admitted,
                    failed = report.failed,
                    skipped = report.skipped,
                    "Ingestion poll finished"
                );
            }
            Ok(_) => {}
            Err(e) => error!(source = self.source.name(), "Error polling messages: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventBus;
    use crate::ingest::source::SourceMessage;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    // ── parse_sender ────────────────────────────────────────────

    #[test]
    fn sender_with_display_name() {
        assert_eq!(
            parse_sender("Alice Smith <alice@example.com>"),
            ("alice@example.com".to_string(), Some("Alice Smith".to_string()))
        );
    }

    #[test]
    fn sender_with_quoted_name() {
        assert_eq!(
            parse_sender("\"Smith, Alice\" <alice@example.com>"),
            ("alice@example.com".to_string(), Some("Smith, Alice".to_string()))
        );
    }

    #[test]
    fn bare_address_has_no_name() {
        assert_eq!(
            parse_sender("a@x.com"),
            ("a@x.com".to_string(), None)
        );
        assert_eq!(
            parse_sender("  a@x.com "),
            ("a@x.com".to_string(), None)
        );
    }

    #[test]
    fn brackets_without_name() {
        assert_eq!(parse_sender("<a@x.com>"), ("a@x.com".to_string(), None));
    }

    #[test]
    fn first_bracket_pair_wins() {
        let (address, name) = parse_sender("Bob <bob@x.com> <other@y.com>");
        assert_eq!(address, "bob@x.com");
        assert_eq!(name.as_deref(), Some("Bob"));
    }

    #[test]
    fn empty_brackets_fall_back_to_whole_value() {
        assert_eq!(parse_sender("Nobody <>"), ("Nobody <>".to_string(), None));
    }

    #[test]
    fn policy_parses() {
        assert_eq!("partial".parse::<AttachmentPolicy>(), Ok(AttachmentPolicy::AdmitPartial));
        assert_eq!("ALL".parse::<AttachmentPolicy>(), Ok(AttachmentPolicy::RequireAll));
        assert!("sometimes".parse::<AttachmentPolicy>().is_err());
    }

    // ── poll cycle ──────────────────────────────────────────────

    #[derive(Default)]
    struct FakeSource {
        ids: Mutex<Vec<String>>,
        messages: Mutex<HashMap<String, SourceMessage>>,
        broken_attachments: Mutex<HashSet<String>>,
        unavailable: Mutex<HashSet<String>>,
        list_fails: Mutex<bool>,
        fetches: AtomicUsize,
    }

    impl FakeSource {
        fn with_message(self, id: &str, from: &str, attachments: &[&str]) -> Self {
            let message = SourceMessage {
                external_id: id.into(),
                sender_header: from.into(),
                subject: format!("Receipt {id}"),
                body: "see attached".into(),
                attachments: attachments
                    .iter()
                    .map(|name| SourceAttachment {
                        attachment_ref: format!("ref-{name}"),
                        filename: (*name).into(),
                        mime_type: "image/jpeg".into(),
                        size_bytes: 3,
                    })
                    .collect(),
            };
            self.messages.lock().unwrap().insert(id.into(), message);
            self
        }

        fn listing(self, ids: &[&str]) -> Self {
            *self.ids.lock().unwrap() = ids.iter().map(|s| s.to_string()).collect();
            self
        }
    }

    #[async_trait]
    impl MessageSource for FakeSource {
        fn name(&self) -> &str {
            "fake"
        }

        async fn list_candidate_ids(&self, filter: &str) -> Result<Vec<String>, SourceError> {
            assert_eq!(filter, "to:inbox@x.com");
            if *self.list_fails.lock().unwrap() {
                return Err(SourceError::Status {
                    status: 503,
                    body: "unavailable".into(),
                });
            }
            Ok(self.ids.lock().unwrap().clone())
        }

        async fn fetch_message(&self, external_id: &str) -> Result<SourceMessage, SourceError> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            if self.unavailable.lock().unwrap().contains(external_id) {
                return Err(SourceError::Status {
                    status: 500,
                    body: "oops".into(),
                });
            }
            self.messages
                .lock()
                .unwrap()
                .get(external_id)
                .cloned()
                .ok_or_else(|| SourceError::NotFound(external_id.into()))
        }

        async fn fetch_attachment_bytes(
            &self,
            _external_id: &str,
            attachment_ref: &str,
        ) -> Result<Vec<u8>, SourceError> {
            if self.broken_attachments.lock().unwrap().contains(attachment_ref) {
                return Err(SourceError::Decode("bad attachment".into()));
            }
            Ok(b"abc".to_vec())
        }
    }

    #[derive(Default)]
    struct MemoryStore {
        stored: Mutex<Vec<String>>,
        /// Filenames whose store call fails.
        rejects: Mutex<HashSet<String>>,
        writes: AtomicUsize,
    }

    #[async_trait]
    impl AttachmentStore for MemoryStore {
        async fn store(&self, filename: &str, _bytes: &[u8]) -> Result<String, std::io::Error> {
            self.writes.fetch_add(1, Ordering::SeqCst);
            if self.rejects.lock().unwrap().contains(filename) {
                return Err(std::io::Error::other("disk full"));
            }
            let reference = format!("stored_{filename}");
            self.stored.lock().unwrap().push(reference.clone());
            Ok(reference)
        }

        async fn remove(&self, storage_reference: &str) -> Result<(), std::io::Error> {
            self.stored.lock().unwrap().retain(|r| r != storage_reference);
            Ok(())
        }
    }

    fn poller(source: Arc<FakeSource>) -> (IngestionPoller, Arc<SubmissionRepository>) {
        let (poller, repo, _) = poller_with_store(source);
        (poller, repo)
    }

    fn poller_with_store(
        source: Arc<FakeSource>,
    ) -> (IngestionPoller, Arc<SubmissionRepository>, Arc<MemoryStore>) {
        let repo = SubmissionRepository::new(EventBus::new());
        let store = Arc::new(MemoryStore::default());
        let poller = IngestionPoller::new(
            source,
            Arc::clone(&store) as Arc<dyn AttachmentStore>,
            Arc::new(Deduplicator::new()),
            Arc::clone(&repo),
            "to:inbox@x.com",
        );
        (poller, repo, store)
    }

    #[tokio::test]
    async fn admits_new_message_with_parsed_sender() {
        let source = Arc::new(
            FakeSource::default()
                .with_message("E1", "Alice <a@x.com>", &["receipt.jpg"])
                .listing(&["E1"]),
        );
        let (poller, repo) = poller(source);

        let report = poller.poll_once().await.unwrap();
        assert_eq!(report.admitted, 1);

        let list = repo.list().await;
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].sender_address, "a@x.com");
        assert_eq!(list[0].sender_name.as_deref(), Some("Alice"));
        assert_eq!(list[0].subject, "Receipt E1");
        assert_eq!(list[0].attachments.len(), 1);
        assert_eq!(list[0].attachments[0].storage_reference, "stored_receipt.jpg");
        assert_eq!(list[0].attachments[0].size_bytes, 3);
    }

    #[tokio::test]
    async fn duplicate_ids_within_and_across_ticks_admit_once() {
        let source = Arc::new(
            FakeSource::default()
                .with_message("E1", "a@x.com", &[])
                .listing(&["E1", "E1"]),
        );
        let (poller, repo) = poller(Arc::clone(&source));

        let first = poller.poll_once().await.unwrap();
        assert_eq!(first.candidates, 2);
        assert_eq!(first.admitted, 1);
        assert_eq!(first.skipped, 1);

        let second = poller.poll_once().await.unwrap();
        assert_eq!(second.admitted, 0);
        assert_eq!(second.skipped, 2);

        assert_eq!(repo.list().await.len(), 1);
        assert_eq!(source.fetches.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn fetch_failure_is_retried_next_tick() {
        let source = Arc::new(
            FakeSource::default()
                .with_message("E1", "a@x.com", &[])
                .with_message("E2", "b@x.com", &[])
                .listing(&["E1", "E2"]),
        );
        source.unavailable.lock().unwrap().insert("E1".into());
        let (poller, repo) = poller(Arc::clone(&source));

        let report = poller.poll_once().await.unwrap();
        assert_eq!(report.admitted, 1);
        assert_eq!(report.failed, 1);
        assert_eq!(repo.list().await[0].sender_address, "b@x.com");

        source.unavailable.lock().unwrap().clear();
        let report = poller.poll_once().await.unwrap();
        assert_eq!(report.admitted, 1);
        assert_eq!(report.skipped, 1);

        let senders: Vec<String> = repo
            .list()
            .await
            .into_iter()
            .map(|s| s.sender_address)
            .collect();
        assert_eq!(senders, vec!["b@x.com", "a@x.com"]);
    }

    #[tokio::test]
    async fn list_failure_is_an_error_and_admits_nothing() {
        let source = Arc::new(FakeSource::default().with_message("E1", "a@x.com", &[]).listing(&["E1"]));
        *source.list_fails.lock().unwrap() = true;
        let (poller, repo) = poller(Arc::clone(&source));

        assert!(poller.poll_once().await.is_err());
        // Tick swallows and logs the error.
        poller.tick().await;
        assert!(repo.list().await.is_empty());

        *source.list_fails.lock().unwrap() = false;
        assert_eq!(poller.poll_once().await.unwrap().admitted, 1);
    }

    #[tokio::test]
    async fn partial_attachments_are_admitted_by_default() {
        let source = Arc::new(
            FakeSource::default()
                .with_message("E1", "a@x.com", &["good.jpg", "bad.jpg", "also-good.png"])
                .listing(&["E1"]),
        );
        source
            .broken_attachments
            .lock()
            .unwrap()
            .insert("ref-bad.jpg".into());
        let (poller, repo) = poller(source);

        let report = poller.poll_once().await.unwrap();
        assert_eq!(report.admitted, 1);

        let names: Vec<String> = repo.list().await[0]
            .attachments
            .iter()
            .map(|a| a.filename.clone())
            .collect();
        assert_eq!(names, vec!["good.jpg", "also-good.png"]);
    }

    #[tokio::test]
    async fn require_all_policy_leaves_message_unadmitted() {
        let source = Arc::new(
            FakeSource::default()
                .with_message("E1", "a@x.com", &["good.jpg", "bad.jpg"])
                .listing(&["E1"]),
        );
        source
            .broken_attachments
            .lock()
            .unwrap()
            .insert("ref-bad.jpg".into());
        let (poller, repo) = poller(Arc::clone(&source));
        let poller = poller.with_policy(AttachmentPolicy::RequireAll);

        let report = poller.poll_once().await.unwrap();
        assert_eq!(report.failed, 1);
        assert!(repo.list().await.is_empty());

        source.broken_attachments.lock().unwrap().clear();
        let report = poller.poll_once().await.unwrap();
        assert_eq!(report.admitted, 1);
        assert_eq!(repo.list().await[0].attachments.len(), 2);
    }

    #[tokio::test]
    async fn require_all_fetch_failure_stores_nothing_across_retries() {
        let source = Arc::new(
            FakeSource::default()
                .with_message("E1", "a@x.com", &["good.jpg", "bad.jpg"])
                .listing(&["E1"]),
        );
        source
            .broken_attachments
            .lock()
            .unwrap()
            .insert("ref-bad.jpg".into());
        let (poller, repo, store) = poller_with_store(Arc::clone(&source));
        let poller = poller.with_policy(AttachmentPolicy::RequireAll);

        for _ in 0..3 {
            let report = poller.poll_once().await.unwrap();
            assert_eq!(report.admitted, 0);
            assert_eq!(report.failed, 1);
        }

        assert!(repo.list().await.is_empty());
        assert!(store.stored.lock().unwrap().is_empty());
        assert_eq!(store.writes.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn require_all_store_failure_removes_earlier_attachments() {
        let source = Arc::new(
            FakeSource::default()
                .with_message("E1", "a@x.com", &["first.jpg", "second.jpg"])
                .listing(&["E1"]),
        );
        let (poller, repo, store) = poller_with_store(Arc::clone(&source));
        let poller = poller.with_policy(AttachmentPolicy::RequireAll);
        store.rejects.lock().unwrap().insert("second.jpg".into());

        let report = poller.poll_once().await.unwrap();
        assert_eq!(report.failed, 1);
        assert!(repo.list().await.is_empty());
        assert!(store.stored.lock().unwrap().is_empty());

        store.rejects.lock().unwrap().clear();
        let report = poller.poll_once().await.unwrap();
        assert_eq!(report.admitted, 1);
        assert_eq!(
            *store.stored.lock().unwrap(),
            vec!["stored_first.jpg", "stored_second.jpg"]
        );
    }

    #[tokio::test]
    async fn partial_policy_keeps_attachments_that_stored() {
        let source = Arc::new(
            FakeSource::default()
                .with_message("E1", "a@x.com", &["first.jpg", "second.jpg"])
                .listing(&["E1"]),
        );
        let (poller, repo, store) = poller_with_store(source);
        store.rejects.lock().unwrap().insert("first.jpg".into());

        assert_eq!(poller.poll_once().await.unwrap().admitted, 1);
        let attachments = &repo.list().await[0].attachments;
        assert_eq!(attachments.len(), 1);
        assert_eq!(attachments[0].filename, "second.jpg");
        assert_eq!(*store.stored.lock().unwrap(), vec!["stored_second.jpg"]);
    }
}
