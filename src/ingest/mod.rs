//! Mailbox ingestion: sources, attachment storage, dedup and the poller.

pub mod dedup;
pub mod gmail;
pub mod poller;
pub mod source;
pub mod storage;

pub use dedup::Deduplicator;
pub use gmail::GmailSource;
pub use poller::{AttachmentPolicy, IngestionPoller, PollReport};
pub use source::{AttachmentStore, MessageSource, SourceAttachment, SourceMessage};
pub use storage::LocalAttachmentStore;
