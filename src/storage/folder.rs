use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::MirrorError;

/// Suffix carried by every mirrored item.
pub const ITEM_SUFFIX: &str = ".eml";

/// One of the three mirror folders. The set is closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Folder {
    Inbox,
    Sent,
    Archive,
}

impl Folder {
    pub const ALL: [Folder; 3] = [Folder::Inbox, Folder::Sent, Folder::Archive];

    /// Directory name under the mirror root
    pub fn as_str(&self) -> &'static str {
        match self {
            Folder::Inbox => "inbox",
            Folder::Sent => "sent",
            Folder::Archive => "archive",
        }
    }
}

impl fmt::Display for Folder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Folder {
    type Err = MirrorError;

    fn from_str(name: &str) -> Result<Self, Self::Err> {
        match name {
            "inbox" => Ok(Folder::Inbox),
            "sent" => Ok(Folder::Sent),
            "archive" => Ok(Folder::Archive),
            other => Err(MirrorError::InvalidFolder(other.to_string())),
        }
    }
}

/// Validate a raw item identifier without touching storage.
pub fn validate_id(id: &str) -> Result<(), MirrorError> {
    let reject = |reason| {
        Err(MirrorError::InvalidId {
            id: id.to_string(),
            reason,
        })
    };

    if id.is_empty() {
        return reject("id cannot be empty");
    }
    if !id.ends_with(ITEM_SUFFIX) || id.len() == ITEM_SUFFIX.len() {
        return reject("id must end with .eml extension");
    }
    if id.contains('/') || id.contains('\\') {
        return reject("id cannot contain path separators");
    }
    Ok(())
}

/// A validated mirror item identifier, e.g. `18c2f0a1b2.eml`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct ItemId(String);

impl ItemId {
    pub fn parse(id: impl Into<String>) -> Result<Self, MirrorError> {
        let id = id.into();
        validate_id(&id)?;
        Ok(Self(id))
    }

    /// Item id for a provider message id. An id already carrying the suffix
    /// is taken as is.
    pub fn for_message(remote_id: &str) -> Result<Self, MirrorError> {
        if remote_id.ends_with(ITEM_SUFFIX) {
            Self::parse(remote_id)
        } else {
            Self::parse(format!("{remote_id}{ITEM_SUFFIX}"))
        }
    }

    /// The provider message id this item mirrors.
    pub fn remote_id(&self) -> &str {
        self.0.strip_suffix(ITEM_SUFFIX).unwrap_or(&self.0)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for ItemId {
    type Err = MirrorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl AsRef<str> for ItemId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
