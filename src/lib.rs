//! Receipt intake: mailbox ingestion and sequential analysis of submissions.

pub mod config;
pub mod error;
pub mod events;
pub mod ingest;
pub mod processing;
pub mod scheduler;
pub mod server;
pub mod submissions;
