//! Reply threading: derive what a reply needs from the message it answers.

use anyhow::{Context, Result};
use mailparse::MailHeaderMap;

use crate::email::message::{bare_address, parse_message_ids};
use crate::email::provider::FetchedMessage;

const REPLY_PREFIX: &str = "Re: ";

/// Fields of a fetched message relevant to replying.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ThreadInfo {
    pub message_id: Option<String>,
    pub thread_id: Option<String>,
    pub references: Vec<String>,
    /// Bare address of the original sender
    pub sender: String,
    pub subject: String,
}

/// What to pass to `send` so the reply lands in the right conversation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplyThreading {
    pub thread_id: Option<String>,
    pub in_reply_to: Option<String>,
    pub references: Vec<String>,
}

impl ThreadInfo {
    /// Provider-supplied metadata wins over what the headers say.
    pub fn resolve(fetched: &FetchedMessage) -> Result<Self> {
        let (headers, _) =
            mailparse::parse_headers(&fetched.raw).context("Failed to parse message headers")?;

        let message_id = fetched.message_id.clone().or_else(|| {
            headers
                .get_first_value("Message-ID")
                .and_then(|v| parse_message_ids(&v).into_iter().next())
        });

        let references = if fetched.references.is_empty() {
            headers
                .get_first_value("References")
                .map(|v| parse_message_ids(&v))
                .unwrap_or_default()
        } else {
            fetched.references.clone()
        };

        let from = headers.get_first_value("From").unwrap_or_default();

        Ok(Self {
            message_id,
            thread_id: fetched.thread_id.clone(),
            references,
            sender: bare_address(&from),
            subject: headers.get_first_value("Subject").unwrap_or_default(),
        })
    }

    pub fn reply_subject(&self) -> String {
        reply_subject(&self.subject)
    }

    /// Without a thread id the reply goes out as a new conversation.
    pub fn reply_threading(&self) -> ReplyThreading {
        let Some(thread_id) = &self.thread_id else {
            return ReplyThreading::default();
        };

        let mut references = self.references.clone();
        if let Some(parent) = &self.message_id {
            if !references.contains(parent) {
                references.push(parent.clone());
            }
        }

        ReplyThreading {
            thread_id: Some(thread_id.clone()),
            in_reply_to: self.message_id.clone(),
            references,
        }
    }
}

/// Prefix `Re: ` unless already present. Only the exact-case prefix counts.
pub fn reply_subject(subject: &str) -> String {
    if subject.starts_with(REPLY_PREFIX.trim_end()) {
        subject.to_string()
    } else {
        format!("{REPLY_PREFIX}{subject}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fetched(raw: &str, thread_id: Option<&str>) -> FetchedMessage {
        FetchedMessage {
            raw: raw.as_bytes().to_vec(),
            message_id: None,
            thread_id: thread_id.map(str::to_string),
            references: Vec::new(),
        }
    }

    #[test]
    fn test_reply_subject() {
        assert_eq!(reply_subject("TEST EMAIL"), "Re: TEST EMAIL");
        assert_eq!(reply_subject("Re: TEST EMAIL"), "Re: TEST EMAIL");
        // Other spellings are not recognized
        assert_eq!(reply_subject("RE: TEST EMAIL"), "Re: RE: TEST EMAIL");
        assert_eq!(reply_subject("re: TEST EMAIL"), "Re: re: TEST EMAIL");
        assert_eq!(reply_subject(""), "Re: ");
    }

    #[test]
    fn test_resolve_from_headers() {
        let raw = "From: \"Ben\" <ben@example.com>\r\n\
Subject: TEST EMAIL\r\n\
Message-ID: <m2@example.com>\r\n\
References: <m0@example.com> <m1@example.com>\r\n\
\r\n\
body\r\n";
        let info = ThreadInfo::resolve(&fetched(raw, Some("t-1"))).unwrap();
        assert_eq!(info.sender, "ben@example.com");
        assert_eq!(info.subject, "TEST EMAIL");
        assert_eq!(info.message_id.as_deref(), Some("m2@example.com"));

        let threading = info.reply_threading();
        assert_eq!(threading.thread_id.as_deref(), Some("t-1"));
        assert_eq!(threading.in_reply_to.as_deref(), Some("m2@example.com"));
        assert_eq!(
            threading.references,
            vec!["m0@example.com", "m1@example.com", "m2@example.com"]
        );
    }

    #[test]
    fn test_provider_metadata_wins() {
        let raw = "From: ben@example.com\r\nMessage-ID: <header@example.com>\r\n\r\nx";
        let mut msg = fetched(raw, Some("t-9"));
        msg.message_id = Some("provider@example.com".to_string());
        msg.references = vec!["provider@example.com".to_string()];

        let threading = ThreadInfo::resolve(&msg).unwrap().reply_threading();
        assert_eq!(threading.in_reply_to.as_deref(), Some("provider@example.com"));
        // Parent is not appended twice
        assert_eq!(threading.references, vec!["provider@example.com"]);
    }

    #[test]
    fn test_missing_thread_id_is_unthreaded() {
        let raw = "From: ben@example.com\r\nMessage-ID: <m2@example.com>\r\n\r\nx";
        let info = ThreadInfo::resolve(&fetched(raw, None)).unwrap();
        assert_eq!(info.reply_threading(), ReplyThreading::default());
        assert_eq!(info.sender, "ben@example.com");
    }
}
