//! Mail client core that keeps a durable local mirror of every message it
//! sends, fetches or archives.
//!
//! The remote mailbox is reached through [`email::provider::RemoteMailbox`];
//! the mirror lives in [`storage::mirror::LocalMirrorStore`] and the two are
//! kept in step by [`storage::pipeline::MirrorPipeline`].

pub mod config;
pub mod email;
pub mod error;
pub mod storage;

pub use error::{MirrorError, PipelineError};
pub use storage::folder::{Folder, ItemId};
pub use storage::mirror::LocalMirrorStore;
pub use storage::pipeline::{MirrorOutcome, MirrorPipeline, NewMessage};
