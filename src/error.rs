use std::path::PathBuf;
use thiserror::Error;

use crate::storage::folder::Folder;

/// Failures of the local mirror store.
#[derive(Error, Debug)]
pub enum MirrorError {
    /// The folder name is not one of `inbox`, `sent` or `archive`.
    #[error("Invalid folder '{0}'. Must be 'inbox', 'sent', or 'archive'")]
    InvalidFolder(String),

    #[error("Invalid item id '{id}': {reason}")]
    InvalidId { id: String, reason: &'static str },

    #[error("Item {id} not found in {folder}")]
    NotFound { folder: Folder, id: String },

    /// A move target is already occupied. Moves never overwrite.
    #[error("Item {id} already exists in {folder}")]
    AlreadyExists { folder: Folder, id: String },

    #[error("Storage failure at '{path}': {source}")]
    Storage {
        path: PathBuf,
        source: std::io::Error,
    },
}

impl MirrorError {
    pub fn storage(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Storage {
            path: path.into(),
            source,
        }
    }
}

/// Failures of a pipeline operation that leave the remote mailbox unchanged,
/// or that happen before the remote is contacted.
///
/// A mirror failure *after* a successful remote action is not an error: it is
/// reported inside the operation's receipt.
#[derive(Error, Debug)]
pub enum PipelineError {
    /// Caller-supplied data was rejected before any I/O.
    #[error(transparent)]
    Mirror(#[from] MirrorError),

    #[error("Remote {operation} failed: {source:#}")]
    Remote {
        operation: &'static str,
        source: anyhow::Error,
    },

    #[error("Message {0} is not in inbox")]
    NotInInbox(String),

    /// The message was fetched (and possibly mirrored) but its headers are
    /// unusable for a reply. Nothing was sent.
    #[error("Message {id} cannot be replied to: {source:#}")]
    Unreadable { id: String, source: anyhow::Error },
}

impl PipelineError {
    pub fn remote(operation: &'static str, source: anyhow::Error) -> Self {
        Self::Remote { operation, source }
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;
