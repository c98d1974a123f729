//! Gmail REST message source.
//!
//! Authenticates with a long-lived OAuth refresh token and reads messages
//! through the Gmail v1 API. Read-only: messages are never modified at the
//! source, so deduplication is tracked locally.

use std::time::Duration;

use async_trait::async_trait;
use base64::Engine as _;
use base64::alphabet;
use base64::engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info};

use super::source::{MessageSource, SourceAttachment, SourceMessage};
use crate::config::GmailConfig;
use crate::error::SourceError;

const DEFAULT_API_BASE: &str = "https://gmail.googleapis.com/gmail/v1/users/me";
const DEFAULT_TOKEN_URL: &str = "https://oauth2.googleapis.com/token";

/// Refresh the access token this long before Google says it expires.
const TOKEN_EXPIRY_MARGIN: Duration = Duration::from_secs(60);

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Gmail encodes bodies as URL-safe base64, with or without padding.
const GMAIL_BASE64: GeneralPurpose = GeneralPurpose::new(
    &alphabet::URL_SAFE,
    GeneralPurposeConfig::new().with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

// ── Wire types ──────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct ListResponse {
    #[serde(default)]
    messages: Vec<MessageRef>,
}

#[derive(Debug, Deserialize)]
struct MessageRef {
    id: String,
}

#[derive(Debug, Deserialize)]
struct GmailMessage {
    id: String,
    #[serde(default)]
    payload: Option<MessagePart>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MessagePart {
    #[serde(default)]
    mime_type: Option<String>,
    #[serde(default)]
    filename: Option<String>,
    #[serde(default)]
    headers: Vec<Header>,
    #[serde(default)]
    body: Option<PartBody>,
    #[serde(default)]
    parts: Vec<MessagePart>,
}

#[derive(Debug, Deserialize)]
struct Header {
    name: String,
    value: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PartBody {
    #[serde(default)]
    attachment_id: Option<String>,
    #[serde(default)]
    size: Option<u64>,
    #[serde(default)]
    data: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AttachmentBody {
    #[serde(default)]
    data: Option<String>,
}

struct AccessToken {
    value: SecretString,
    refresh_at: Instant,
}

// ── Source ──────────────────────────────────────────────────────────

/// Reads an inbox through the Gmail API.
pub struct GmailSource {
    http: reqwest::Client,
    config: GmailConfig,
    api_base: String,
    token_url: String,
    token: Mutex<Option<AccessToken>>,
}

impl GmailSource {
    pub fn new(config: GmailConfig) -> Result<Self, SourceError> {
        Self::with_endpoints(config, DEFAULT_API_BASE, DEFAULT_TOKEN_URL)
    }

    /// Point the source at alternative endpoints (used by tests).
    pub fn with_endpoints(
        config: GmailConfig,
        api_base: impl Into<String>,
        token_url: impl Into<String>,
    ) -> Result<Self, SourceError> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;

        Ok(Self {
            http,
            config,
            api_base: api_base.into().trim_end_matches('/').to_string(),
            token_url: token_url.into(),
            token: Mutex::new(None),
        })
    }

    /// `to:<inbox>`, the filter used for candidate listing.
    pub fn inbox_filter(&self) -> String {
        format!("to:{}", self.config.address)
    }

    async fn access_token(&self) -> Result<SecretString, SourceError> {
        let mut cached = self.token.lock().await;
        if let Some(token) = cached.as_ref() {
            if Instant::now() < token.refresh_at {
                return Ok(token.value.clone());
            }
        }

        let response = self
            .http
            .post(&self.token_url)
            .form(&[
                ("client_id", self.config.client_id.as_str()),
                ("client_secret", self.config.client_secret.expose_secret()),
                ("refresh_token", self.config.refresh_token.expose_secret()),
                ("grant_type", "refresh_token"),
            ])
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(SourceError::Auth(format!("token endpoint returned {status}: {body}")));
        }

        let token: TokenResponse = response
            .json()
            .await
            .map_err(|e| SourceError::Auth(format!("invalid token response: {e}")))?;

        let lifetime = Duration::from_secs(token.expires_in.unwrap_or(3600));
        let refresh_at = Instant::now() + lifetime.saturating_sub(TOKEN_EXPIRY_MARGIN);
        let value = SecretString::from(token.access_token);

        info!(expires_in = ?lifetime, "Refreshed Gmail access token");
        *cached = Some(AccessToken {
            value: value.clone(),
            refresh_at,
        });
        Ok(value)
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        url: &str,
        query: &[(&str, String)],
    ) -> Result<T, SourceError> {
        let token = self.access_token().await?;
        let response = self
            .http
            .get(url)
            .bearer_auth(token.expose_secret())
            .query(query)
            .send()
            .await?;

        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(SourceError::NotFound(url.to_string()));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SourceError::Status {
                status: status.as_u16(),
                body,
            });
        }

        response
            .json()
            .await
            .map_err(|e| SourceError::Decode(e.to_string()))
    }
}

#[async_trait]
impl MessageSource for GmailSource {
    fn name(&self) -> &str {
        "gmail"
    }

    async fn list_candidate_ids(&self, filter: &str) -> Result<Vec<String>, SourceError> {
        let url = format!("{}/messages", self.api_base);
        let list: ListResponse = self
            .get_json(
                &url,
                &[
                    ("q", filter.to_string()),
                    ("maxResults", self.config.max_results.to_string()),
                ],
            )
            .await?;

        debug!(count = list.messages.len(), "Listed Gmail messages");
        Ok(list.messages.into_iter().map(|m| m.id).collect())
    }

    async fn fetch_message(&self, external_id: &str) -> Result<SourceMessage, SourceError> {
        let url = format!("{}/messages/{}", self.api_base, external_id);
        let message: GmailMessage = self.get_json(&url, &[]).await?;
        to_source_message(message)
    }

    async fn fetch_attachment_bytes(
        &self,
        external_id: &str,
        attachment_ref: &str,
    ) -> Result<Vec<u8>, SourceError> {
        let url = format!(
            "{}/messages/{}/attachments/{}",
            self.api_base, external_id, attachment_ref
        );
        let body: AttachmentBody = self.get_json(&url, &[]).await?;
        let data = body
            .data
            .ok_or_else(|| SourceError::Decode(format!("attachment {attachment_ref} has no data")))?;
        decode_base64url(&data)
    }
}

// ── Payload parsing ─────────────────────────────────────────────────

fn to_source_message(message: GmailMessage) -> Result<SourceMessage, SourceError> {
    let payload = message.payload.unwrap_or_default();

    let header = |name: &str| {
        payload
            .headers
            .iter()
            .find(|h| h.name.eq_ignore_ascii_case(name))
            .map(|h| h.value.clone())
            .unwrap_or_default()
    };
    let sender_header = header("From");
    let subject = header("Subject");

    let body = extract_body(&payload)?;
    let mut attachments = Vec::new();
    collect_attachments(&payload, &mut attachments);

    Ok(SourceMessage {
        external_id: message.id,
        sender_header,
        subject,
        body,
        attachments,
    })
}

/// Inline body data plus every nested `text/plain` part, in order.
fn extract_body(part: &MessagePart) -> Result<String, SourceError> {
    let mut body = String::new();

    if let Some(data) = part.body.as_ref().and_then(|b| b.data.as_deref()) {
        body.push_str(&decode_text(data)?);
    }

    for child in &part.parts {
        let inline = child.body.as_ref().and_then(|b| b.data.as_deref());
        match (child.mime_type.as_deref(), inline) {
            (Some("text/plain"), Some(data)) => body.push_str(&decode_text(data)?),
            _ if !child.parts.is_empty() => body.push_str(&extract_body(child)?),
            _ => {}
        }
    }

    Ok(body)
}

/// Every part (at any depth) that has both a filename and an attachment id.
fn collect_attachments(part: &MessagePart, out: &mut Vec<SourceAttachment>) {
    for child in &part.parts {
        let filename = child.filename.as_deref().filter(|f| !f.is_empty());
        let attachment_id = child.body.as_ref().and_then(|b| b.attachment_id.as_deref());

        if let (Some(filename), Some(attachment_id)) = (filename, attachment_id) {
            out.push(SourceAttachment {
                attachment_ref: attachment_id.to_string(),
                filename: filename.to_string(),
                mime_type: child
                    .mime_type
                    .clone()
                    .unwrap_or_else(|| "application/octet-stream".to_string()),
                size_bytes: child.body.as_ref().and_then(|b| b.size).unwrap_or(0),
            });
        }

        collect_attachments(child, out);
    }
}

fn decode_text(data: &str) -> Result<String, SourceError> {
    let bytes = decode_base64url(data)?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

/// Decode Gmail's URL-safe base64.
pub fn decode_base64url(data: &str) -> Result<Vec<u8>, SourceError> {
    GMAIL_BASE64
        .decode(data.trim())
        .map_err(|e| SourceError::Decode(e.to_string()))
}
