/// Replay captured push events into an on-device store
///
/// Reads newline-delimited JSON push events (`{"event": ..., "data": ...}`)
/// and applies them through a sync session backed by SQLite, then prints the
/// resulting conversation list. Useful to reproduce a user's cache state
/// from a captured socket log.
///
/// Usage:
/// ```bash
/// cargo run --bin chat-sync-replay -- --events session.ndjson --user <uuid>
/// ```
///
/// Options:
/// - `--events <path>`: NDJSON file with one push event per line (required)
/// - `--user <uuid>`: local user id (default: `CHAT_SYNC_LOCAL_USER`)
/// - `--database-url <url>`: overrides `CHAT_SYNC_DATABASE_URL`
use anyhow::{Context, Result};
use chat_sync::history::HttpHistoryClient;
use chat_sync::logging::init_tracing;
use chat_sync::store::SqliteStore;
use chat_sync::transport::ChannelTransport;
use chat_sync::{ApplyOutcome, SyncConfig, SyncSession};
use event_schema::PushEvent;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Default)]
struct ReplayArgs {
    events: Option<String>,
    user: Option<Uuid>,
    database_url: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let args = parse_args()?;
    let mut config = SyncConfig::from_env().context("Invalid sync configuration")?;
    if let Some(url) = args.database_url {
        config.database_url = url;
    }

    let events_path = args
        .events
        .context("--events is required (see --help)")?;
    let local_user = match args.user {
        Some(user) => user,
        None => std::env::var("CHAT_SYNC_LOCAL_USER")
            .context("--user or CHAT_SYNC_LOCAL_USER is required")?
            .parse()
            .context("Invalid UUID in CHAT_SYNC_LOCAL_USER")?,
    };

    info!(
        events = %events_path,
        database_url = %config.database_url,
        local_user = %local_user,
        "Starting replay"
    );

    let store = Arc::new(
        SqliteStore::connect(&config.database_url)
            .await
            .context("Failed to open on-device store")?,
    );
    let transport = Arc::new(ChannelTransport::new());
    // pagination is not used during replay
    let history = Arc::new(HttpHistoryClient::new("http://localhost"));

    let session = SyncSession::init(config, local_user, store, transport, history)
        .await
        .context("Failed to start sync session")?;

    let raw = tokio::fs::read_to_string(&events_path)
        .await
        .with_context(|| format!("Failed to read {}", events_path))?;

    let mut tally: BTreeMap<String, usize> = BTreeMap::new();
    for (line_no, line) in raw.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let event: PushEvent = match serde_json::from_str(line) {
            Ok(event) => event,
            Err(e) => {
                warn!(line = line_no + 1, error = %e, "Skipping undecodable event");
                *tally.entry("undecodable".to_string()).or_default() += 1;
                continue;
            }
        };

        let outcome = session.apply_event(event).await?;
        *tally.entry(outcome_label(outcome).to_string()).or_default() += 1;
    }

    println!("Outcomes:");
    for (label, count) in &tally {
        println!("  {:<22} {}", label, count);
    }

    println!();
    println!("Conversations (unread total {}):", session.projection().unread_total());
    for conversation in session.projection().conversations() {
        println!(
            "  {}  unread={:<4} cursor={:<6} messages={:<4} last={}",
            conversation.id,
            conversation.unread_count,
            session
                .cursor(conversation.id)
                .map(|c| c.to_string())
                .unwrap_or_else(|| "-".to_string()),
            session.projection().messages(conversation.id).len(),
            conversation.last_message.as_deref().unwrap_or("")
        );
    }

    session.close().await;
    Ok(())
}

fn outcome_label(outcome: ApplyOutcome) -> &'static str {
    match outcome {
        ApplyOutcome::Applied => "applied",
        ApplyOutcome::AppliedNotPersisted => "applied_not_persisted",
        ApplyOutcome::Duplicate => "duplicate",
        ApplyOutcome::Unmatched => "unmatched",
        ApplyOutcome::Transient => "transient",
        ApplyOutcome::Deferred => "deferred",
        ApplyOutcome::Invalid => "invalid",
    }
}

fn parse_args() -> Result<ReplayArgs> {
    let mut parsed = ReplayArgs::default();
    let args: Vec<String> = std::env::args().collect();

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--events" | "--user" | "--database-url" if i + 1 >= args.len() => {
                anyhow::bail!("{} requires a value", args[i]);
            }
            "--events" => {
                parsed.events = Some(args[i + 1].clone());
                i += 2;
            }
            "--user" => {
                parsed.user =
                    Some(Uuid::parse_str(&args[i + 1]).context("Invalid UUID for --user")?);
                i += 2;
            }
            "--database-url" => {
                parsed.database_url = Some(args[i + 1].clone());
                i += 2;
            }
            "--help" | "-h" => {
                print_help();
                std::process::exit(0);
            }
            _ => {
                anyhow::bail!("Unknown argument: {}", args[i]);
            }
        }
    }

    Ok(parsed)
}

fn print_help() {
    println!("Chat sync replay");
    println!();
    println!("USAGE:");
    println!("    chat-sync-replay --events <path> [--user <uuid>] [--database-url <url>]");
    println!();
    println!("OPTIONS:");
    println!("    --events <path>         NDJSON file with one push event per line");
    println!("    --user <uuid>           Local user id (default: CHAT_SYNC_LOCAL_USER)");
    println!("    --database-url <url>    Overrides CHAT_SYNC_DATABASE_URL");
    println!("    -h, --help              Print this help");
}
