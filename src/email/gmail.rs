use anyhow::{bail, Context, Result};
use async_imap::types::{Fetch, Flag};
use async_imap::Session;
use async_native_tls::TlsStream;
use async_trait::async_trait;
use futures::TryStreamExt;
use lettre::address::{Address, Envelope};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Tokio1Executor};
use mailparse::MailHeaderMap;
use std::collections::BTreeSet;
use tokio::net::TcpStream;
use tokio::sync::{Mutex, MutexGuard};
use tokio_util::compat::{Compat, TokioAsyncReadCompatExt};

use super::message::{bare_address, parse_message_ids, OutgoingMessage};
use super::provider::{Envelope as ListedMessage, FetchedMessage, RemoteMailbox, INBOX_LABEL};
use crate::config::{ImapConfig, SmtpConfig};

use futures::io::{AsyncRead, AsyncWrite};
use std::pin::Pin;
use std::task::{Context as TaskContext, Poll};

/// Wrapper for either TLS or Plain IMAP stream
enum StreamWrapper {
    Tls(TlsStream<Compat<TcpStream>>),
    Plain(Compat<TcpStream>),
}

impl AsyncRead for StreamWrapper {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &mut [u8],
    ) -> Poll<std::io::Result<usize>> {
        match self.get_mut() {
            StreamWrapper::Tls(s) => Pin::new(s).poll_read(cx, buf),
            StreamWrapper::Plain(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for StreamWrapper {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match self.get_mut() {
            StreamWrapper::Tls(s) => Pin::new(s).poll_write(cx, buf),
            StreamWrapper::Plain(s) => Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            StreamWrapper::Tls(s) => Pin::new(s).poll_flush(cx),
            StreamWrapper::Plain(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_close(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            StreamWrapper::Tls(s) => Pin::new(s).poll_close(cx),
            StreamWrapper::Plain(s) => Pin::new(s).poll_close(cx),
        }
    }
}

impl std::fmt::Debug for StreamWrapper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StreamWrapper::Tls(_) => write!(f, "StreamWrapper::Tls"),
            StreamWrapper::Plain(_) => write!(f, "StreamWrapper::Plain"),
        }
    }
}

unsafe impl Send for StreamWrapper {}
impl Unpin for StreamWrapper {}

type ImapSession = Session<StreamWrapper>;

/// Gmail mailbox over IMAP (reads, labels) and SMTP (submission).
///
/// Message ids are UIDs in the all-mail mailbox, which holds every message
/// regardless of labels. Sent messages are identified by the local part of
/// the Message-ID minted at submission until the provider assigns a UID.
/// The inbox label maps to presence in the inbox mailbox; expunging the
/// inbox copy is how Gmail IMAP archives.
pub struct GmailMailbox {
    imap: ImapConfig,
    smtp: AsyncSmtpTransport<Tokio1Executor>,
    session: Mutex<Option<ImapSession>>,
}

impl GmailMailbox {
    pub fn new(imap: ImapConfig, smtp: &SmtpConfig) -> Result<Self> {
        imap.validate()?;
        let builder = if smtp.starttls {
            AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&smtp.host)
        } else {
            AsyncSmtpTransport::<Tokio1Executor>::relay(&smtp.host)
        }
        .context("Failed to configure SMTP relay")?;

        let transport = builder
            .port(smtp.port)
            .credentials(Credentials::new(imap.address.clone(), imap.password.clone()))
            .build();

        Ok(Self {
            imap,
            smtp: transport,
            session: Mutex::new(None),
        })
    }

    /// Live IMAP session, reconnecting when the NOOP check fails.
    async fn session(&self) -> Result<MutexGuard<'_, Option<ImapSession>>> {
        let mut guard = self.session.lock().await;

        let needs_reconnect = match guard.as_mut() {
            Some(session) => session.noop().await.is_err(),
            None => true,
        };

        if needs_reconnect {
            tracing::info!("Reconnecting IMAP session...");
            *guard = Some(self.connect().await?);
        }

        Ok(guard)
    }

    /// Establish a new IMAP connection
    async fn connect(&self) -> Result<ImapSession> {
        tracing::info!("Connecting to IMAP {}:{}", self.imap.host, self.imap.port);

        let tcp = TcpStream::connect((self.imap.host.as_str(), self.imap.port))
            .await
            .context("Failed to connect to IMAP server")?;

        let stream = if self.imap.port == 993 {
            let tls = async_native_tls::TlsConnector::new();
            let tls_stream = tls
                .connect(&self.imap.host, tcp.compat())
                .await
                .context("TLS handshake failed")?;
            StreamWrapper::Tls(tls_stream)
        } else {
            tracing::info!("Using plain IMAP");
            StreamWrapper::Plain(tcp.compat())
        };

        let client = async_imap::Client::new(stream);
        let session = client
            .login(&self.imap.address, &self.imap.password)
            .await
            .map_err(|(err, _)| err)
            .context("IMAP login failed")?;

        tracing::info!("IMAP login successful for {}", self.imap.address);
        Ok(session)
    }

    /// All-mail UID for a message id: either the UID itself or the local part
    /// of a Message-ID we minted when sending.
    async fn resolve_uid(&self, session: &mut ImapSession, id: &str) -> Result<u32> {
        session
            .select(&self.imap.all_mail)
            .await
            .with_context(|| format!("Failed to SELECT {}", self.imap.all_mail))?;

        if let Ok(uid) = id.parse::<u32>() {
            return Ok(uid);
        }

        let uids = session
            .uid_search(format!("HEADER Message-ID \"<{}@\"", quote(id)))
            .await
            .context("IMAP UID SEARCH failed")?;
        uids.into_iter()
            .max()
            .with_context(|| format!("Message {} not found", id))
    }

    async fn fetch_one(&self, session: &mut ImapSession, uid: u32, query: &str) -> Result<Fetch> {
        let fetches: Vec<Fetch> = session
            .uid_fetch(uid.to_string(), query)
            .await
            .context("IMAP UID FETCH failed")?
            .try_collect()
            .await
            .context("Error fetching message")?;

        fetches
            .into_iter()
            .find(|f| f.uid == Some(uid))
            .with_context(|| format!("Message {} not found", uid))
    }

    /// Inbox UIDs of the message with the given Message-ID
    async fn inbox_uids(&self, session: &mut ImapSession, message_id: &str) -> Result<Vec<u32>> {
        session
            .select(&self.imap.inbox)
            .await
            .with_context(|| format!("Failed to SELECT {}", self.imap.inbox))?;

        let uids = session
            .uid_search(format!("HEADER Message-ID \"{}\"", quote(message_id)))
            .await
            .context("IMAP UID SEARCH failed")?;
        let mut uids: Vec<u32> = uids.into_iter().collect();
        uids.sort_unstable();
        Ok(uids)
    }

    async fn labels(&self, session: &mut ImapSession, id: &str) -> Result<BTreeSet<String>> {
        let uid = self.resolve_uid(session, id).await?;
        let fetch = self.fetch_one(session, uid, "(UID FLAGS RFC822.HEADER)").await?;

        let mut labels: BTreeSet<String> = fetch.flags().map(flag_label).collect();
        let message_id = header_message_id(fetch.header().unwrap_or_default())?;
        drop(fetch);

        if let Some(message_id) = message_id {
            if !self.inbox_uids(session, &message_id).await?.is_empty() {
                labels.insert(INBOX_LABEL.to_string());
            }
        }
        Ok(labels)
    }
}

#[async_trait]
impl RemoteMailbox for GmailMailbox {
    fn address(&self) -> &str {
        &self.imap.address
    }

    async fn send(&self, message: &OutgoingMessage) -> Result<String> {
        let id = uuid::Uuid::new_v4().simple().to_string();
        let raw = message
            .to_mime(&message.message_id_for(&id))
            .context("Failed to build MIME message")?;

        let from: Address = bare_address(&message.from)
            .parse()
            .with_context(|| format!("Invalid sender address {}", message.from))?;
        let recipients = message
            .recipients()
            .map(|r| {
                bare_address(r)
                    .parse::<Address>()
                    .with_context(|| format!("Invalid recipient address {}", r))
            })
            .collect::<Result<Vec<_>>>()?;
        let envelope = Envelope::new(Some(from), recipients).context("Invalid SMTP envelope")?;

        self.smtp
            .send_raw(&envelope, &raw)
            .await
            .context("SMTP submission failed")?;

        tracing::info!("Message {} submitted for {}", id, message.to.join(", "));
        Ok(id)
    }

    async fn fetch(&self, id: &str) -> Result<FetchedMessage> {
        let mut guard = self.session().await?;
        let session = guard.as_mut().context("No IMAP session")?;

        let uid = self.resolve_uid(session, id).await?;
        let fetch = self.fetch_one(session, uid, "(UID BODY.PEEK[])").await?;
        let raw = fetch
            .body()
            .with_context(|| format!("No message body for {}", id))?
            .to_vec();

        let (headers, _) = mailparse::parse_headers(&raw).context("Failed to parse headers")?;
        let message_id = headers
            .get_first_value("Message-ID")
            .and_then(|v| parse_message_ids(&v).into_iter().next());
        let references = headers
            .get_first_value("References")
            .map(|v| parse_message_ids(&v))
            .unwrap_or_default();
        // Root of the reference chain stands in for a conversation id
        let thread_id = references.first().cloned().or_else(|| message_id.clone());

        tracing::debug!("Fetched message {} ({} bytes)", id, raw.len());
        Ok(FetchedMessage {
            raw,
            message_id,
            thread_id,
            references,
        })
    }

    async fn list(&self, query: Option<&str>, max_results: usize) -> Result<Vec<ListedMessage>> {
        let mut guard = self.session().await?;
        let session = guard.as_mut().context("No IMAP session")?;

        session
            .select(&self.imap.inbox)
            .await
            .with_context(|| format!("Failed to SELECT {}", self.imap.inbox))?;
        let found = session
            .uid_search(search_criteria(query))
            .await
            .context("IMAP UID SEARCH failed")?;

        let mut uids: Vec<u32> = found.into_iter().collect();
        uids.sort_unstable_by(|a, b| b.cmp(a));
        uids.truncate(max_results);
        if uids.is_empty() {
            return Ok(Vec::new());
        }

        let set = uids.iter().map(u32::to_string).collect::<Vec<_>>().join(",");
        let mut fetches: Vec<Fetch> = session
            .uid_fetch(set, "(UID RFC822.HEADER)")
            .await
            .context("IMAP UID FETCH failed")?
            .try_collect()
            .await
            .context("Error fetching headers")?;
        fetches.sort_by(|a, b| b.uid.cmp(&a.uid));

        let mut rows = Vec::new();
        for fetch in &fetches {
            let (headers, _) = mailparse::parse_headers(fetch.header().unwrap_or_default())
                .context("Failed to parse headers")?;
            let subject = headers
                .get_first_value("Subject")
                .unwrap_or_else(|| "No Subject".to_string());
            let date = headers.get_first_value("Date").unwrap_or_default();
            let message_id = headers
                .get_first_value("Message-ID")
                .and_then(|v| parse_message_ids(&v).into_iter().next());
            rows.push((message_id, date, subject));
        }
        drop(fetches);

        session
            .select(&self.imap.all_mail)
            .await
            .with_context(|| format!("Failed to SELECT {}", self.imap.all_mail))?;

        let mut envelopes = Vec::new();
        for (message_id, date, subject) in rows {
            let Some(message_id) = message_id else {
                tracing::warn!("Skipping inbox message without Message-ID: {}", subject);
                continue;
            };
            let uids = session
                .uid_search(format!("HEADER Message-ID \"{}\"", quote(&message_id)))
                .await
                .context("IMAP UID SEARCH failed")?;
            match uids.into_iter().max() {
                Some(uid) => envelopes.push(ListedMessage {
                    id: uid.to_string(),
                    date,
                    subject,
                }),
                None => tracing::warn!("{} is missing from {}", message_id, self.imap.all_mail),
            }
        }

        Ok(envelopes)
    }

    async fn get_labels(&self, id: &str) -> Result<BTreeSet<String>> {
        let mut guard = self.session().await?;
        let session = guard.as_mut().context("No IMAP session")?;
        self.labels(session, id).await
    }

    async fn remove_label(&self, id: &str, label: &str) -> Result<BTreeSet<String>> {
        if label != INBOX_LABEL {
            bail!("Only the {} label can be removed over IMAP", INBOX_LABEL);
        }

        let mut guard = self.session().await?;
        let session = guard.as_mut().context("No IMAP session")?;

        let uid = self.resolve_uid(session, id).await?;
        let fetch = self.fetch_one(session, uid, "(UID RFC822.HEADER)").await?;
        let message_id = header_message_id(fetch.header().unwrap_or_default())?
            .with_context(|| format!("Message {} has no Message-ID", id))?;
        drop(fetch);

        let inbox_uids = self.inbox_uids(session, &message_id).await?;
        if !inbox_uids.is_empty() {
            let set = inbox_uids
                .iter()
                .map(u32::to_string)
                .collect::<Vec<_>>()
                .join(",");

            // Mark the inbox copy deleted
            {
                let store_stream = session
                    .uid_store(set, "+FLAGS (\\Deleted)")
                    .await
                    .context("IMAP UID STORE failed")?;
                tokio::pin!(store_stream);
                while store_stream.try_next().await.context("IMAP UID STORE failed")?.is_some() {}
            }

            // Expunge to drop it from the inbox
            {
                let expunge_stream = session.expunge().await.context("IMAP EXPUNGE failed")?;
                tokio::pin!(expunge_stream);
                while expunge_stream.try_next().await.context("IMAP EXPUNGE failed")?.is_some() {}
            }

            tracing::info!("Message {} removed from {}", id, self.imap.inbox);
        }

        self.labels(session, id).await
    }
}

fn header_message_id(header: &[u8]) -> Result<Option<String>> {
    let (headers, _) = mailparse::parse_headers(header).context("Failed to parse headers")?;
    Ok(headers
        .get_first_value("Message-ID")
        .and_then(|v| parse_message_ids(&v).into_iter().next()))
}

fn flag_label(flag: Flag<'_>) -> String {
    match flag {
        Flag::Custom(name) => name.to_string(),
        system => format!("\\{:?}", system),
    }
}

/// Escape a value for an IMAP quoted string
/// Queries use Gmail search syntax (`subject:TEST`, `from:ben`), passed
/// through the X-GM-RAW extension. No query selects the whole inbox.
fn search_criteria(query: Option<&str>) -> String {
    match query.map(str::trim).filter(|q| !q.is_empty()) {
        Some(query) => format!("X-GM-RAW \"{}\"", quote(query)),
        None => "ALL".to_string(),
    }
}

fn quote(value: &str) -> String {
    value.replace('\\', "\\\\").replace('"', "\\\"")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quote() {
        assert_eq!(quote("plain@example.com"), "plain@example.com");
        assert_eq!(quote("a\"b\\c"), "a\\\"b\\\\c");
    }

    #[test]
    fn test_search_criteria() {
        assert_eq!(search_criteria(None), "ALL");
        assert_eq!(search_criteria(Some("  ")), "ALL");
        assert_eq!(search_criteria(Some("subject:TEST")), "X-GM-RAW \"subject:TEST\"");
        assert_eq!(
            search_criteria(Some("subject:\"TEST EMAIL\"")),
            "X-GM-RAW \"subject:\\\"TEST EMAIL\\\"\""
        );
    }

    #[test]
    fn test_header_message_id() {
        let header = b"Subject: hi\r\nMessage-ID: <abc@example.com>\r\n\r\n";
        assert_eq!(
            header_message_id(header).unwrap().as_deref(),
            Some("abc@example.com")
        );
        assert_eq!(header_message_id(b"Subject: hi\r\n\r\n").unwrap(), None);
    }
}
