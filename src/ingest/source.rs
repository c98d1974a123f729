//! Collaborator contracts for the external mailbox and attachment storage.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::SourceError;

/// Attachment metadata as listed by the source, before the bytes are fetched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceAttachment {
    /// Source-side handle used to fetch the bytes.
    pub attachment_ref: String,
    pub filename: String,
    pub mime_type: String,
    pub size_bytes: u64,
}

/// A fully fetched external message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceMessage {
    pub external_id: String,
    /// Raw `From` header, e.g. `Alice Smith <alice@example.com>`.
    pub sender_header: String,
    pub subject: String,
    pub body: String,
    pub attachments: Vec<SourceAttachment>,
}

/// An external message source (a mailbox).
#[async_trait]
pub trait MessageSource: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &str;

    /// Bounded list of message ids matching `filter`.
    async fn list_candidate_ids(&self, filter: &str) -> Result<Vec<String>, SourceError>;

    async fn fetch_message(&self, external_id: &str) -> Result<SourceMessage, SourceError>;

    async fn fetch_attachment_bytes(
        &self,
        external_id: &str,
        attachment_ref: &str,
    ) -> Result<Vec<u8>, SourceError>;
}

/// Persists attachment bytes and hands back a storage reference.
#[async_trait]
pub trait AttachmentStore: Send + Sync {
    async fn store(&self, filename: &str, bytes: &[u8]) -> Result<String, std::io::Error>;

    /// Delete a previously stored attachment by its reference.
    async fn remove(&self, storage_reference: &str) -> Result<(), std::io::Error>;
}
