use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;
use std::collections::BTreeSet;

use crate::email::message::OutgoingMessage;

/// Label carried by messages that sit in the provider's inbox.
pub const INBOX_LABEL: &str = "INBOX";

/// A message as returned by the provider.
#[derive(Debug, Clone)]
pub struct FetchedMessage {
    /// Full transport-encoded message bytes
    pub raw: Vec<u8>,
    /// RFC 5322 Message-ID, without angle brackets
    pub message_id: Option<String>,
    /// Opaque conversation id assigned by the provider
    pub thread_id: Option<String>,
    /// Prior message ids of the conversation, oldest first
    pub references: Vec<String>,
}

/// One row of a remote listing
#[derive(Debug, Clone, Serialize)]
pub struct Envelope {
    pub id: String,
    pub date: String,
    pub subject: String,
}

/// Capability interface of the remote mailbox.
/// The remote is the source of truth for delivery and label state.
#[async_trait]
pub trait RemoteMailbox: Send + Sync {
    /// Address the mailbox sends as.
    fn address(&self) -> &str;

    /// Submit a message for delivery. Returns the provider message id.
    async fn send(&self, message: &OutgoingMessage) -> Result<String>;

    /// Fetch one message by provider id.
    async fn fetch(&self, id: &str) -> Result<FetchedMessage>;

    /// Search the inbox, newest first, at most `max_results` rows.
    async fn list(&self, query: Option<&str>, max_results: usize) -> Result<Vec<Envelope>>;

    /// Current labels of a message.
    async fn get_labels(&self, id: &str) -> Result<BTreeSet<String>>;

    /// Remove one label. Returns the labels left on the message.
    async fn remove_label(&self, id: &str, label: &str) -> Result<BTreeSet<String>>;
}
