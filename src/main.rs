use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};

use mailmirror::config::AppConfig;
use mailmirror::email::gmail::GmailMailbox;
use mailmirror::email::provider::RemoteMailbox;
use mailmirror::email::threading::ReplyThreading;
use mailmirror::{Folder, ItemId, LocalMirrorStore, MirrorPipeline, NewMessage};

#[derive(Parser)]
#[command(name = "mailmirror", version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// TOML config file. Environment variables are used when absent.
    #[arg(short, long, env = "MAILMIRROR_CONFIG")]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Send a message and mirror it to sent/
    Send {
        #[arg(long)]
        to: String,
        #[arg(long, default_value = "")]
        cc: String,
        #[arg(long, default_value = "")]
        bcc: String,
        #[arg(long)]
        subject: String,
        #[arg(long)]
        body: String,
        #[arg(long)]
        thread_id: Option<String>,
        #[arg(long)]
        in_reply_to: Option<String>,
        #[arg(long, value_delimiter = ',')]
        references: Vec<String>,
    },
    /// Fetch a message, mirror it to inbox/ and print it
    Fetch { id: String },
    /// Archive a message and move its mirror copy to archive/
    Archive { id: String },
    /// Reply to the sender of a message
    Reply {
        id: String,
        #[arg(long)]
        body: String,
    },
    /// Search the remote inbox
    List {
        #[arg(long)]
        query: Option<String>,
        #[arg(long)]
        max: Option<usize>,
        #[arg(long)]
        json: bool,
    },
    /// List items of a mirror folder
    MirrorList { folder: String },
    /// Print a mirrored item
    MirrorRead { folder: String, id: String },
    /// Delete a mirrored item
    MirrorDelete { folder: String, id: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => AppConfig::from_file(path)?,
        None => AppConfig::from_env()?,
    };
    tracing::info!("Mirror root: {}", config.mirror.root.display());

    let mirror = Arc::new(LocalMirrorStore::new(config.mirror.root.clone()));

    match cli.command {
        Commands::MirrorList { folder } => {
            let ids = mirror.list(folder.parse()?).await?;
            if ids.is_empty() {
                println!("No emails found in {}", folder);
            }
            for id in ids {
                println!("{}", id);
            }
        }
        Commands::MirrorRead { folder, id } => {
            let content = mirror.read(folder.parse()?, &ItemId::parse(id.as_str())?).await?;
            println!("{}", String::from_utf8_lossy(&content));
        }
        Commands::MirrorDelete { folder, id } => {
            let folder: Folder = folder.parse()?;
            mirror.delete(folder, &ItemId::parse(id.as_str())?).await?;
            println!("Deleted {} from {}", id, folder);
        }
        Commands::Send {
            to,
            cc,
            bcc,
            subject,
            body,
            thread_id,
            in_reply_to,
            references,
        } => {
            let receipt = connect(&config, mirror)?
                .send(NewMessage {
                    to,
                    cc,
                    bcc,
                    subject,
                    body,
                    threading: ReplyThreading {
                        thread_id,
                        in_reply_to,
                        references,
                    },
                })
                .await?;
            println!("{}", receipt);
        }
        Commands::Fetch { id } => println!("{}", connect(&config, mirror)?.fetch(&id).await?),
        Commands::Archive { id } => println!("{}", connect(&config, mirror)?.archive(&id).await?),
        Commands::Reply { id, body } => {
            println!("{}", connect(&config, mirror)?.reply(&id, body).await?)
        }
        Commands::List { query, max, json } => {
            let rows = connect(&config, mirror)?.list(query.as_deref(), max).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&rows)?);
            } else if rows.is_empty() {
                println!("No emails found");
            } else {
                for row in rows {
                    println!("{}:{}:{}", row.id, row.date, row.subject);
                }
            }
        }
    }

    Ok(())
}

/// Mirror-only commands never reach this, so they need no credentials.
fn connect(config: &AppConfig, mirror: Arc<LocalMirrorStore>) -> anyhow::Result<MirrorPipeline> {
    let remote: Arc<dyn RemoteMailbox> =
        Arc::new(GmailMailbox::new(config.imap.clone(), &config.smtp)?);
    tracing::info!("Mailbox: {}", remote.address());
    Ok(MirrorPipeline::new(remote, mirror).with_list_limit(config.list.max_results))
}
