use anyhow::Context;
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub mirror: MirrorConfig,
    pub imap: ImapConfig,
    pub smtp: SmtpConfig,
    #[serde(default)]
    pub list: ListConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MirrorConfig {
    /// Directory holding `inbox/`, `sent/` and `archive/`
    pub root: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ImapConfig {
    pub host: String,
    pub port: u16,
    pub address: String,
    pub password: String,
    /// Mailbox whose UIDs serve as message ids
    #[serde(default = "default_all_mail")]
    pub all_mail: String,
    #[serde(default = "default_inbox")]
    pub inbox: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SmtpConfig {
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub starttls: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ListConfig {
    pub max_results: usize,
}

impl Default for ListConfig {
    fn default() -> Self {
        Self { max_results: 20 }
    }
}

impl ImapConfig {
    /// Credentials are only needed once a remote connection is opened, so
    /// mirror-only commands run without them.
    pub fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(!self.address.trim().is_empty(), "EMAIL_ADDRESS is not set");
        Ok(())
    }
}

fn default_all_mail() -> String {
    "[Gmail]/All Mail".to_string()
}

fn default_inbox() -> String {
    "INBOX".to_string()
}

impl AppConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        Ok(Self {
            mirror: MirrorConfig {
                root: PathBuf::from(
                    std::env::var("MAILMIRROR_ROOT").unwrap_or_else(|_| "./mail".to_string()),
                ),
            },
            imap: ImapConfig {
                host: std::env::var("EMAIL_IMAP_HOST")
                    .unwrap_or_else(|_| "imap.gmail.com".to_string()),
                port: std::env::var("EMAIL_IMAP_PORT")
                    .unwrap_or_else(|_| "993".to_string())
                    .parse()
                    .context("EMAIL_IMAP_PORT is not a port number")?,
                address: std::env::var("EMAIL_ADDRESS").unwrap_or_default(),
                password: std::env::var("EMAIL_PASSWORD").unwrap_or_default(),
                all_mail: std::env::var("EMAIL_ALL_MAIL_FOLDER")
                    .unwrap_or_else(|_| default_all_mail()),
                inbox: std::env::var("EMAIL_INBOX_FOLDER").unwrap_or_else(|_| default_inbox()),
            },
            smtp: SmtpConfig {
                host: std::env::var("EMAIL_SMTP_HOST")
                    .unwrap_or_else(|_| "smtp.gmail.com".to_string()),
                port: std::env::var("EMAIL_SMTP_PORT")
                    .unwrap_or_else(|_| "465".to_string())
                    .parse()
                    .context("EMAIL_SMTP_PORT is not a port number")?,
                starttls: std::env::var("EMAIL_SMTP_STARTTLS")
                    .map(|v| matches!(v.as_str(), "1" | "true" | "yes"))
                    .unwrap_or(false),
            },
            list: ListConfig {
                max_results: std::env::var("MAILMIRROR_LIST_MAX")
                    .unwrap_or_else(|_| "20".to_string())
                    .parse()
                    .context("MAILMIRROR_LIST_MAX is not a number")?,
            },
        })
    }

    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        toml::from_str(&text).with_context(|| format!("Invalid config {}", path.display()))
    }
}
