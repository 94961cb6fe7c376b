//! Whisperline CLI tool
//!
//! A command-line client for end-to-end encrypted chat through a
//! Whisperline relay.

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;
use whisperline::keystore::IDENTITY_FILE;
use whisperline::store::StoreEvent;
use whisperline::{ChatClient, ClientConfig, Message, MessageStatus};

/// How long `send` waits for the broker's echo
const ECHO_WAIT: Duration = Duration::from_secs(5);

/// Whisperline: end-to-end encrypted chat
#[derive(Parser)]
#[command(name = "whisperline")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Local user id
    #[arg(short, long)]
    user: String,

    /// Config file (default: <data dir>/whisperline/config.json)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Broker WebSocket URL
    #[arg(long)]
    broker_url: Option<String>,

    /// REST API base URL
    #[arg(long)]
    api_url: Option<String>,

    /// Directory holding the key stores
    #[arg(long)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the identity key pair and publish its public key
    Init {
        /// Replace an existing identity
        #[arg(short, long)]
        force: bool,
    },

    /// Display your key fingerprint
    Identity {
        /// Also print the public key as JWK
        #[arg(long)]
        jwk: bool,
    },

    /// Start an interactive conversation with a peer
    Chat {
        /// Peer user id
        peer: String,
    },

    /// Send one message and exit
    Send {
        /// Peer user id
        peer: String,

        /// Message text
        text: String,
    },

    /// Print the stored conversation with a peer
    History {
        /// Peer user id
        peer: String,
    },

    /// Delete the local identity and cached contact keys
    Reset {
        /// Confirm the deletion
        #[arg(long)]
        yes: bool,
    },
}

impl Cli {
    fn client_config(&self) -> anyhow::Result<ClientConfig> {
        let mut config = ClientConfig::load_or_default(self.config.as_deref()).context("loading config")?;
        if let Some(url) = &self.broker_url {
            config.broker_url = url.clone();
        }
        if let Some(url) = &self.api_url {
            config.api_base_url = url.clone();
        }
        if let Some(dir) = &self.data_dir {
            config.data_dir = dir.clone();
        }
        config.validate()?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = cli.client_config()?;
    let client = ChatClient::open(&cli.user, &config)?;

    match cli.command {
        Commands::Init { force } => cmd_init(&client, force).await,
        Commands::Identity { jwk } => cmd_identity(&client, jwk),
        Commands::Chat { peer } => cmd_chat(&client, &peer).await,
        Commands::Send { peer, text } => cmd_send(&client, &peer, &text).await,
        Commands::History { peer } => cmd_history(&client, &peer).await,
        Commands::Reset { yes } => cmd_reset(&client, yes).await,
    }
}

fn has_identity(client: &ChatClient) -> bool {
    client.keys().directory().join(IDENTITY_FILE).exists()
}

fn require_identity(client: &ChatClient) -> anyhow::Result<()> {
    if !has_identity(client) {
        bail!(
            "no identity for {}; run 'whisperline --user {} init' first",
            client.user_id(),
            client.user_id()
        );
    }
    Ok(())
}

fn format_message(own: &str, message: &Message) -> String {
    let who = if message.sender_id == own { "you" } else { message.sender_id.as_str() };
    let mark = match (message.send_failed, message.is_temporary, message.status) {
        (true, _, _) => " [failed]",
        (false, true, _) => " [sending]",
        (false, false, MessageStatus::Read) if message.sender_id == own => " [read]",
        _ => "",
    };
    format!(
        "[{}] {}: {}{}",
        message.created_at.format("%Y-%m-%d %H:%M"),
        who,
        message.plaintext,
        mark
    )
}

async fn cmd_init(client: &ChatClient, force: bool) -> anyhow::Result<()> {
    if has_identity(client) {
        if !force {
            bail!("identity already exists for {}; use --force to replace it", client.user_id());
        }
        client.keys().wipe_identity()?;
    }

    let identity = client.initialize().await?;

    println!("Identity created successfully!");
    println!();
    println!("Fingerprint (compare with your peers out of band):");
    println!("{}", identity.public_key().fingerprint());
    println!();
    println!("Keys saved in: {}", client.keys().directory().display());
    Ok(())
}

fn cmd_identity(client: &ChatClient, jwk: bool) -> anyhow::Result<()> {
    require_identity(client)?;
    let identity = client.keys().ensure_identity()?;

    println!("User:        {}", client.user_id());
    println!("Fingerprint: {}", identity.public_key().fingerprint());
    println!("Key size:    {} bits", identity.public_key().bits());
    if jwk {
        println!("{}", serde_json::to_string_pretty(&identity.public_key().to_jwk())?);
    }
    Ok(())
}

async fn cmd_send(client: &ChatClient, peer: &str, text: &str) -> anyhow::Result<()> {
    require_identity(client)?;
    client.connect().await.context("connecting to broker")?;

    let mut events = client.messages().subscribe();
    let local_id = client.messages().send(peer, text).await?;

    let confirmed = tokio::time::timeout(ECHO_WAIT, async {
        loop {
            match events.recv().await {
                Ok(StoreEvent::MessageConfirmed { temp_id, message_id, .. }) if temp_id == local_id => {
                    return Some(message_id);
                }
                Ok(_) | Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => return None,
            }
        }
    })
    .await
    .ok()
    .flatten();

    match confirmed {
        Some(id) => println!("Sent ({id})"),
        None => println!("Sent; no confirmation from the broker yet"),
    }
    client.disconnect().await;
    Ok(())
}

async fn cmd_history(client: &ChatClient, peer: &str) -> anyhow::Result<()> {
    require_identity(client)?;
    client.keys().ensure_identity()?;

    let store = client.messages();
    store.load_history(peer).await.context("fetching history")?;
    let messages = store.messages_for_peer(peer);
    if messages.is_empty() {
        println!("No messages with {peer}.");
    }
    for message in &messages {
        println!("{}", format_message(client.user_id(), message));
    }
    Ok(())
}

async fn cmd_chat(client: &ChatClient, peer: &str) -> anyhow::Result<()> {
    require_identity(client)?;
    client.connect().await.context("connecting to broker")?;

    let store = client.messages();
    let mut events = store.subscribe();
    if let Err(e) = store.select_peer(peer).await {
        eprintln!("Could not load history: {e}");
    }

    println!("=== Conversation with {peer} ===");
    for message in store.messages_for_peer(peer) {
        println!("{}", format_message(client.user_id(), &message));
    }
    println!();
    println!("Type a message and press enter. /retry resends failed messages, /quit exits.");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                let line = line.trim();
                match line {
                    "" => continue,
                    "/quit" => break,
                    "/retry" => {
                        let failed: Vec<String> = store
                            .messages_for_peer(peer)
                            .into_iter()
                            .filter(|m| m.send_failed)
                            .map(|m| m.id)
                            .collect();
                        for id in failed {
                            if let Err(e) = store.resend(peer, &id).await {
                                eprintln!("Retry failed: {e}");
                            }
                        }
                    }
                    text => {
                        if let Err(e) = store.send(peer, text).await {
                            eprintln!("Not sent: {e}");
                        }
                    }
                }
            }
            event = events.recv() => {
                match event {
                    Ok(StoreEvent::MessageAdded { conversation, message_id }) if conversation == peer => {
                        let shown = store
                            .messages_for_peer(peer)
                            .into_iter()
                            .find(|m| m.id == message_id && m.sender_id != client.user_id());
                        if let Some(message) = shown {
                            println!("{}", format_message(client.user_id(), &message));
                        }
                    }
                    Ok(StoreEvent::StatusChanged { conversation, message_id, status: MessageStatus::Read })
                        if conversation == peer =>
                    {
                        let own = store
                            .messages_for_peer(peer)
                            .into_iter()
                            .any(|m| m.id == message_id && m.sender_id == client.user_id());
                        if own {
                            println!("  (read by {peer})");
                        }
                    }
                    Ok(_) | Err(RecvError::Lagged(_)) => {}
                    Err(RecvError::Closed) => break,
                }
            }
        }
    }

    client.disconnect().await;
    println!("Goodbye!");
    Ok(())
}

async fn cmd_reset(client: &ChatClient, yes: bool) -> anyhow::Result<()> {
    if !yes {
        bail!("this deletes the identity of {}; rerun with --yes to confirm", client.user_id());
    }
    client.reset().await?;
    println!("Identity and contact keys for {} deleted.", client.user_id());
    println!("Messages encrypted for the old key can no longer be read.");
    Ok(())
}
