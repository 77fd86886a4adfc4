use anyhow::anyhow;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use crate::email::message::{split_addresses, OutgoingMessage, RenderedMessage};
use crate::email::provider::{Envelope, FetchedMessage, RemoteMailbox, INBOX_LABEL};
use crate::email::threading::{ReplyThreading, ThreadInfo};
use crate::error::{MirrorError, PipelineError, Result};
use crate::storage::folder::{Folder, ItemId};
use crate::storage::mirror::LocalMirrorStore;

const DEFAULT_LIST_LIMIT: usize = 20;

/// What happened to the local copy after the remote action succeeded.
#[derive(Debug)]
pub enum MirrorOutcome {
    Persisted(PathBuf),
    Failed(MirrorError),
}

impl MirrorOutcome {
    pub fn is_persisted(&self) -> bool {
        matches!(self, MirrorOutcome::Persisted(_))
    }

    pub fn failure(&self) -> Option<&MirrorError> {
        match self {
            MirrorOutcome::Persisted(_) => None,
            MirrorOutcome::Failed(err) => Some(err),
        }
    }
}

impl From<std::result::Result<PathBuf, MirrorError>> for MirrorOutcome {
    fn from(result: std::result::Result<PathBuf, MirrorError>) -> Self {
        match result {
            Ok(path) => MirrorOutcome::Persisted(path),
            Err(err) => MirrorOutcome::Failed(err),
        }
    }
}

impl fmt::Display for MirrorOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MirrorOutcome::Persisted(path) => write!(f, "mirrored at {}", path.display()),
            MirrorOutcome::Failed(err) => write!(f, "local mirror failed: {}", err),
        }
    }
}

/// A message to send. Recipient fields are comma-separated lists.
#[derive(Debug, Clone, Default)]
pub struct NewMessage {
    pub to: String,
    pub cc: String,
    pub bcc: String,
    pub subject: String,
    pub body: String,
    pub threading: ReplyThreading,
}

impl NewMessage {
    pub fn new(to: impl Into<String>, subject: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            to: to.into(),
            subject: subject.into(),
            body: body.into(),
            ..Default::default()
        }
    }
}

#[derive(Debug)]
pub struct SendReceipt {
    /// Provider message id
    pub message_id: String,
    pub mirror: MirrorOutcome,
}

#[derive(Debug)]
pub struct FetchReceipt {
    pub message_id: String,
    pub message: RenderedMessage,
    pub mirror: MirrorOutcome,
}

#[derive(Debug)]
pub struct ArchiveReceipt {
    pub message_id: String,
    pub mirror: MirrorOutcome,
}

#[derive(Debug)]
pub struct ReplyReceipt {
    /// Mirror copy of the message replied to
    pub original: MirrorOutcome,
    pub sent: SendReceipt,
}

impl SendReceipt {
    /// Remote send succeeded but the `sent` copy was not stored
    pub fn is_partial(&self) -> bool {
        !self.mirror.is_persisted()
    }
}

impl FetchReceipt {
    pub fn is_partial(&self) -> bool {
        !self.mirror.is_persisted()
    }
}

impl ArchiveReceipt {
    pub fn is_partial(&self) -> bool {
        !self.mirror.is_persisted()
    }
}

impl fmt::Display for SendReceipt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Email sent successfully. Message ID: {}", self.message_id)?;
        if let Some(err) = self.mirror.failure() {
            write!(f, "\nWarning: email sent but failed to store locally: {}", err)?;
        }
        Ok(())
    }
}

impl fmt::Display for FetchReceipt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)?;
        if let Some(err) = self.mirror.failure() {
            write!(f, "\nWarning: email retrieved but failed to store locally: {}", err)?;
        }
        Ok(())
    }
}

impl fmt::Display for ArchiveReceipt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Email {} archived successfully", self.message_id)?;
        if let Some(err) = self.mirror.failure() {
            write!(f, "\nWarning: email archived remotely but failed to move locally: {}", err)?;
        }
        Ok(())
    }
}

impl fmt::Display for ReplyReceipt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Reply sent. {}", self.sent)?;
        if let Some(err) = self.original.failure() {
            write!(f, "\nWarning: original message not stored locally: {}", err)?;
        }
        Ok(())
    }
}

/// Orchestrates every mutating mailbox operation: the remote action first,
/// then its local mirror counterpart.
///
/// The remote mailbox is authoritative. A remote failure is returned as an
/// error and the mirror is left alone; a mirror failure after a remote
/// success never turns the operation into an error, it is reported in the
/// receipt instead. Nothing is retried or rolled back.
pub struct MirrorPipeline {
    remote: Arc<dyn RemoteMailbox>,
    mirror: Arc<LocalMirrorStore>,
    list_limit: usize,
}

impl MirrorPipeline {
    pub fn new(remote: Arc<dyn RemoteMailbox>, mirror: Arc<LocalMirrorStore>) -> Self {
        Self {
            remote,
            mirror,
            list_limit: DEFAULT_LIST_LIMIT,
        }
    }

    pub fn with_list_limit(mut self, limit: usize) -> Self {
        self.list_limit = limit;
        self
    }

    pub fn mirror(&self) -> &LocalMirrorStore {
        &self.mirror
    }

    /// Send a message and keep a copy in `sent`.
    pub async fn send(&self, message: NewMessage) -> Result<SendReceipt> {
        let outgoing = OutgoingMessage {
            from: self.remote.address().to_string(),
            to: split_addresses(&message.to),
            cc: split_addresses(&message.cc),
            bcc: split_addresses(&message.bcc),
            subject: message.subject,
            body: message.body,
            thread_id: message.threading.thread_id,
            in_reply_to: message.threading.in_reply_to,
            references: message.threading.references,
        };

        let message_id = self
            .remote
            .send(&outgoing)
            .await
            .map_err(|e| PipelineError::remote("send", e))?;
        tracing::info!("Message {} sent to {}", message_id, message.to);

        let mirror = self.mirror_sent(&outgoing, &message_id).await;
        if let Some(err) = mirror.failure() {
            tracing::warn!("Message {} sent but not mirrored: {}", message_id, err);
        }

        Ok(SendReceipt { message_id, mirror })
    }

    async fn mirror_sent(&self, outgoing: &OutgoingMessage, message_id: &str) -> MirrorOutcome {
        let item = match ItemId::for_message(message_id) {
            Ok(item) => item,
            Err(err) => return MirrorOutcome::Failed(err),
        };
        let content = match outgoing.mirror_copy(&outgoing.message_id_for(message_id)) {
            Ok(content) => content,
            Err(err) => return MirrorOutcome::Failed(MirrorError::storage(item.as_str(), err)),
        };
        self.mirror
            .save(Folder::Sent, &item, &content)
            .await
            .map(|saved| saved.location)
            .into()
    }

    /// Fetch a message, keep a copy in `inbox`, and render it.
    ///
    /// The rendering is returned even when the copy could not be stored.
    pub async fn fetch(&self, id: &str) -> Result<FetchReceipt> {
        let (item, fetched, mirror) = self.fetch_and_mirror(id).await?;

        let mut message = RenderedMessage::render(&fetched.raw, fetched.thread_id.as_deref());
        if fetched.message_id.is_some() {
            message.message_id = fetched.message_id.clone();
        }

        Ok(FetchReceipt {
            message_id: item.remote_id().to_string(),
            message,
            mirror,
        })
    }

    async fn fetch_and_mirror(&self, id: &str) -> Result<(ItemId, FetchedMessage, MirrorOutcome)> {
        let item = ItemId::for_message(id)?;

        let fetched = self
            .remote
            .fetch(item.remote_id())
            .await
            .map_err(|e| PipelineError::remote("fetch", e))?;
        tracing::info!("Fetched message {} ({} bytes)", item.remote_id(), fetched.raw.len());

        let mirror: MirrorOutcome = self
            .mirror
            .save(Folder::Inbox, &item, &fetched.raw)
            .await
            .map(|saved| saved.location)
            .into();
        if let Some(err) = mirror.failure() {
            tracing::warn!("Message {} fetched but not mirrored: {}", item.remote_id(), err);
        }

        Ok((item, fetched, mirror))
    }

    /// Archive a message remotely, then move its copy from `inbox` to `archive`.
    pub async fn archive(&self, id: &str) -> Result<ArchiveReceipt> {
        let item = ItemId::for_message(id)?;
        let remote_id = item.remote_id();

        let labels = self
            .remote
            .get_labels(remote_id)
            .await
            .map_err(|e| PipelineError::remote("get_labels", e))?;
        if !labels.contains(INBOX_LABEL) {
            return Err(PipelineError::NotInInbox(remote_id.to_string()));
        }

        let updated = self
            .remote
            .remove_label(remote_id, INBOX_LABEL)
            .await
            .map_err(|e| PipelineError::remote("remove_label", e))?;
        if updated.contains(INBOX_LABEL) {
            return Err(PipelineError::remote(
                "remove_label",
                anyhow!("{} label still present on {}", INBOX_LABEL, remote_id),
            ));
        }
        tracing::info!("Message {} archived", remote_id);

        let mirror: MirrorOutcome = self
            .mirror
            .move_item(Folder::Inbox, Folder::Archive, &item)
            .await
            .into();
        if let Some(err) = mirror.failure() {
            tracing::warn!("Message {} archived but not moved locally: {}", remote_id, err);
        }

        Ok(ArchiveReceipt {
            message_id: remote_id.to_string(),
            mirror,
        })
    }

    /// Reply to the sender of `id`, threaded when the provider supplied a
    /// thread id.
    pub async fn reply(&self, id: &str, body: impl Into<String>) -> Result<ReplyReceipt> {
        let (item, fetched, original) = self.fetch_and_mirror(id).await?;
        let thread = ThreadInfo::resolve(&fetched).map_err(|source| PipelineError::Unreadable {
            id: item.remote_id().to_string(),
            source,
        })?;

        let message = NewMessage {
            to: thread.sender.clone(),
            subject: thread.reply_subject(),
            body: body.into(),
            threading: thread.reply_threading(),
            ..Default::default()
        };
        let sent = self.send(message).await?;

        Ok(ReplyReceipt { original, sent })
    }

    /// Search the remote inbox. Never touches the mirror.
    pub async fn list(&self, query: Option<&str>, max_results: Option<usize>) -> Result<Vec<Envelope>> {
        self.remote
            .list(query, max_results.unwrap_or(self.list_limit))
            .await
            .map_err(|e| PipelineError::remote("list", e))
    }
}
