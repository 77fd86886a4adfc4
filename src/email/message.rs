use anyhow::{Context, Result};
use mail_builder::MessageBuilder;
use mailparse::{MailAddr, MailHeader, MailHeaderMap, ParsedMail};
use serde::Serialize;
use std::fmt;

/// An outgoing message before it is handed to the remote mailbox.
#[derive(Debug, Clone, Default)]
pub struct OutgoingMessage {
    pub from: String,
    pub to: Vec<String>,
    pub cc: Vec<String>,
    pub bcc: Vec<String>,
    pub subject: String,
    pub body: String,
    pub thread_id: Option<String>,
    pub in_reply_to: Option<String>,
    pub references: Vec<String>,
}

impl OutgoingMessage {
    /// Every envelope recipient (to, cc and bcc)
    pub fn recipients(&self) -> impl Iterator<Item = &str> {
        self.to
            .iter()
            .chain(&self.cc)
            .chain(&self.bcc)
            .map(String::as_str)
    }

    /// Message-ID header value for a provider id, e.g. `3f2a..@example.com`
    pub fn message_id_for(&self, id: &str) -> String {
        let domain = self
            .from
            .rsplit_once('@')
            .map(|(_, domain)| domain.trim_end_matches('>'))
            .filter(|domain| !domain.is_empty())
            .unwrap_or("localhost");
        format!("{}@{}", id, domain)
    }

    /// RFC 5322 bytes for the wire. Bcc recipients are not written as a header.
    pub fn to_mime(&self, message_id: &str) -> std::io::Result<Vec<u8>> {
        self.build(message_id, false)
    }

    /// RFC 5322 bytes kept in the `sent` mirror folder, Bcc header included.
    pub fn mirror_copy(&self, message_id: &str) -> std::io::Result<Vec<u8>> {
        self.build(message_id, true)
    }

    fn build(&self, message_id: &str, with_bcc: bool) -> std::io::Result<Vec<u8>> {
        let mut builder = MessageBuilder::new()
            .from(self.from.as_str())
            .to(as_strs(&self.to))
            .subject(self.subject.as_str())
            .message_id(message_id)
            .text_body(self.body.as_str());

        if !self.cc.is_empty() {
            builder = builder.cc(as_strs(&self.cc));
        }
        if with_bcc && !self.bcc.is_empty() {
            builder = builder.bcc(as_strs(&self.bcc));
        }
        if let Some(parent) = &self.in_reply_to {
            builder = builder.in_reply_to(parent.as_str());
        }
        if !self.references.is_empty() {
            builder = builder.references(as_strs(&self.references));
        }

        builder.write_to_vec()
    }
}

fn as_strs(values: &[String]) -> Vec<&str> {
    values.iter().map(String::as_str).collect()
}

/// Split a comma-separated address list, dropping empty entries.
pub fn split_addresses(list: &str) -> Vec<String> {
    list.split(',')
        .map(str::trim)
        .filter(|addr| !addr.is_empty())
        .map(str::to_string)
        .collect()
}

/// `ben@example.com` out of `"Ben" <ben@example.com>`. Unparseable input is
/// returned trimmed.
pub fn bare_address(value: &str) -> String {
    let first = mailparse::addrparse(value).ok().and_then(|list| {
        list.iter().find_map(|addr| match addr {
            MailAddr::Single(info) => Some(info.addr.clone()),
            MailAddr::Group(group) => group.addrs.first().map(|info| info.addr.clone()),
        })
    });
    first.unwrap_or_else(|| value.trim().to_string())
}

/// Message ids found in a `Message-ID`, `In-Reply-To` or `References` value,
/// without angle brackets.
pub fn parse_message_ids(value: &str) -> Vec<String> {
    value
        .split(|c: char| c.is_whitespace() || c == ',')
        .map(|token| token.trim_start_matches('<').trim_end_matches('>'))
        .filter(|token| !token.is_empty())
        .map(str::to_string)
        .collect()
}

/// Human-readable view of a fetched message.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RenderedMessage {
    pub from: String,
    pub to: String,
    pub subject: String,
    pub message_id: Option<String>,
    pub thread_id: Option<String>,
    pub references: Vec<String>,
    pub body: String,
}

impl RenderedMessage {
    pub fn parse(raw: &[u8], thread_id: Option<&str>) -> Result<Self> {
        let parsed = mailparse::parse_mail(raw).context("Failed to parse fetched message")?;

        let mut texts = Vec::new();
        collect_plain_text(&parsed, &mut texts)?;

        Ok(Self::from_headers(&parsed.headers, thread_id, texts.join("\n")))
    }

    /// Like [`RenderedMessage::parse`], but a body that cannot be decoded is
    /// shown undecoded instead of failing.
    pub fn render(raw: &[u8], thread_id: Option<&str>) -> Self {
        Self::parse(raw, thread_id).unwrap_or_else(|err| {
            tracing::warn!("Showing undecoded message body: {:#}", err);
            let (headers, offset) = mailparse::parse_headers(raw).unwrap_or_default();
            let body = String::from_utf8_lossy(raw.get(offset..).unwrap_or_default());
            Self::from_headers(&headers, thread_id, body.into_owned())
        })
    }

    fn from_headers(headers: &[MailHeader<'_>], thread_id: Option<&str>, body: String) -> Self {
        let header = |name: &str| headers.get_first_value(name).unwrap_or_default();
        Self {
            from: header("From"),
            to: header("To"),
            subject: header("Subject"),
            message_id: parse_message_ids(&header("Message-ID")).into_iter().next(),
            thread_id: thread_id.map(str::to_string),
            references: parse_message_ids(&header("References")),
            body,
        }
    }
}

fn collect_plain_text(part: &ParsedMail<'_>, out: &mut Vec<String>) -> Result<()> {
    if part.subparts.is_empty() {
        if part.ctype.mimetype.eq_ignore_ascii_case("text/plain") {
            out.push(part.get_body().context("Failed to decode text part")?);
        }
        return Ok(());
    }
    for sub in &part.subparts {
        collect_plain_text(sub, out)?;
    }
    Ok(())
}

impl fmt::Display for RenderedMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "From: {}", self.from)?;
        writeln!(f, "Subject: {}", self.subject)?;
        writeln!(f, "To: {}", self.to)?;
        if let Some(id) = &self.message_id {
            writeln!(f, "Message-ID: {}", id)?;
        }
        if let Some(thread) = &self.thread_id {
            writeln!(f, "Thread-ID: {}", thread)?;
        }
        if !self.references.is_empty() {
            writeln!(f, "References: {}", self.references.join(" "))?;
        }
        write!(f, "\nBody:\n{}", self.body)
    }
}
