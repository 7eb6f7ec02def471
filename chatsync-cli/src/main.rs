use anyhow::{Context, Result};
use chatsync_core::config::Config;
use chatsync_core::core_model::{
    ConversationKey, Diff, DiffOp, Direction, Message, MessageRecord, RawEvent, SourceFilter, Timestamp,
    UserId,
};
use chatsync_core::core_source::InMemoryMessageStore;
use chatsync_core::core_store::ConversationStore;
use chatsync_core::core_sync::{ConversationListener, SyncEngine, SyncError};
use chatsync_core::logging::{init_logging_with_config, LogConfig};
use chatsync_core::metrics::init_metrics;
use clap::Parser;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Parser, Debug)]
#[command(name = "chatsync")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Override the log level (trace, debug, info, warn, error)
    #[arg(short, long)]
    log_level: Option<String>,

    /// Enable JSON formatted logging
    #[arg(long)]
    json_logs: bool,

    /// TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Parser, Debug)]
enum Command {
    /// Apply a recorded change log (one JSON event per line) and print the
    /// resulting conversation
    Replay {
        /// Path to the JSONL event log
        file: PathBuf,

        /// User whose point of view the transcript is printed from
        #[arg(long)]
        local_user: String,

        #[arg(long)]
        peer: String,

        /// Print the final conversation as JSON instead of a transcript
        #[arg(long)]
        json: bool,

        /// Also print the diff produced by each event
        #[arg(long)]
        diffs: bool,
    },

    /// Run two simulated users exchanging messages through the engine
    Demo {
        /// Messages each side sends
        #[arg(short, long, default_value_t = 5)]
        messages: usize,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = Config::load(args.config.as_deref()).context("loading configuration")?;
    if let Some(level) = &args.log_level {
        config.logging.level = level.to_lowercase();
    }
    if args.json_logs {
        config.logging.json_format = true;
    }

    init_logging_with_config(LogConfig::from_settings(&config.logging)?)?;
    if config.metrics.enabled {
        init_metrics();
    }

    match args.command {
        Some(Command::Replay {
            file,
            local_user,
            peer,
            json,
            diffs,
        }) => replay(&file, local_user.into(), peer.into(), json, diffs)?,
        Some(Command::Demo { messages }) => demo(&config, messages).await?,
        None => {
            info!("No command specified. Use --help for usage information.");
        }
    }

    Ok(())
}

#[derive(Debug, Default, PartialEq, Eq)]
struct ReplayStats {
    applied: usize,
    no_ops: usize,
    rejected: usize,
}

/// Apply every event of a JSONL log to a fresh conversation, passing each
/// non-empty diff to `on_diff` with its line number
fn replay_log(
    contents: &str,
    key: ConversationKey,
    mut on_diff: impl FnMut(usize, &Diff),
) -> (ConversationStore, ReplayStats) {
    let mut store = ConversationStore::new(key);
    let mut stats = ReplayStats::default();

    for (line_no, line) in contents.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let event: RawEvent = match serde_json::from_str(line) {
            Ok(event) => event,
            Err(e) => {
                warn!(line = line_no + 1, error = %e, "Skipping unparseable event");
                stats.rejected += 1;
                continue;
            }
        };

        match store.apply(&event) {
            Ok(diff) if diff.is_empty() => stats.no_ops += 1,
            Ok(diff) => {
                debug!(line = line_no + 1, ops = diff.len(), "Applied");
                on_diff(line_no + 1, &diff);
                stats.applied += 1;
            }
            Err(e) => {
                warn!(line = line_no + 1, error = %e, "Rejected event");
                stats.rejected += 1;
            }
        }
    }

    (store, stats)
}

fn replay(path: &Path, local_user: UserId, peer: UserId, json: bool, show_diffs: bool) -> Result<()> {
    let key = ConversationKey::new(local_user.clone(), peer)
        .context("local user and peer must be different")?;
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;

    let (store, stats) = replay_log(&contents, key, |line, diff| {
        if show_diffs {
            for op in diff.ops() {
                println!("line {:>4}: {}", line, describe_op(op));
            }
        }
    });
    info!(
        applied = stats.applied,
        no_ops = stats.no_ops,
        rejected = stats.rejected,
        messages = store.len(),
        "Replay finished"
    );

    if json {
        println!("{}", serde_json::to_string_pretty(store.messages())?);
    } else {
        for message in store.messages() {
            println!("{}", format_line(message, &local_user));
        }
    }
    Ok(())
}

fn describe_op(op: &DiffOp) -> String {
    match op {
        DiffOp::Insert { index, message } => format!("insert @{} {}", index, message.id),
        DiffOp::Update { index, message } => format!("update @{} {}", index, message.id),
        DiffOp::Remove { index } => format!("remove @{}", index),
    }
}

/// Chat-style timestamp, e.g. `Mar 05, 2024 - 02:30 PM` (UTC)
fn format_sent_at(message: &Message) -> String {
    i64::try_from(message.sent_at.as_millis())
        .ok()
        .and_then(chrono::DateTime::<chrono::Utc>::from_timestamp_millis)
        .map(|dt| dt.format("%b %d, %Y - %I:%M %p").to_string())
        .unwrap_or_else(|| message.sent_at.to_string())
}

fn format_line(message: &Message, local_user: &UserId) -> String {
    let arrow = match message.direction(local_user) {
        Direction::Sent => ">>",
        Direction::Received => "<<",
    };
    format!(
        "[{}] {} {}: {}",
        format_sent_at(message),
        arrow,
        message.sender_id,
        message.body
    )
}

/// Prints what one simulated user would see
struct TranscriptListener {
    user: UserId,
    seen: AtomicUsize,
}

impl ConversationListener for TranscriptListener {
    fn on_snapshot(&self, messages: &[Message]) {
        info!(user = %self.user, messages = messages.len(), "Initial snapshot");
    }

    fn on_diff(&self, diff: &Diff) {
        for op in diff.ops() {
            match op {
                DiffOp::Insert { index, message } => {
                    self.seen.fetch_add(1, Ordering::SeqCst);
                    println!("{:>5} @{:<3} {}", self.user.as_str(), index, format_line(message, &self.user));
                }
                other => debug!(user = %self.user, op = ?other, "Conversation changed"),
            }
        }
    }

    fn on_source_error(&self, error: &SyncError) {
        warn!(user = %self.user, error = %error, "Source error");
    }
}

async fn wait_for_inserts(views: &[&Arc<TranscriptListener>], expected: usize) -> Result<()> {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while views.iter().any(|v| v.seen.load(Ordering::SeqCst) < expected) {
        if tokio::time::Instant::now() >= deadline {
            anyhow::bail!("demo did not converge within 10s");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    Ok(())
}

async fn demo(config: &Config, messages: usize) -> Result<()> {
    let store = Arc::new(InMemoryMessageStore::with_config(&config.sync));
    let alice = SyncEngine::with_backend("alice".into(), store.clone(), config.sync.clone());
    let bob = SyncEngine::with_backend("bob".into(), store.clone(), config.sync.clone());
    let key = ConversationKey::new("alice".into(), "bob".into()).context("demo users")?;

    let alice_handle = alice.open(key.clone()).await?;
    let bob_handle = bob.open(key).await?;

    let alice_view = Arc::new(TranscriptListener {
        user: "alice".into(),
        seen: AtomicUsize::new(0),
    });
    let bob_view = Arc::new(TranscriptListener {
        user: "bob".into(),
        seen: AtomicUsize::new(0),
    });
    alice.subscribe(&alice_handle, alice_view.clone()).await?;
    bob.subscribe(&bob_handle, bob_view.clone()).await?;

    for i in 0..messages {
        alice.send(&alice_handle, &format!("ping {}", i)).await?;
        bob.send(&bob_handle, &format!("pong {}", i)).await?;
    }

    let mut expected = 2 * messages;
    wait_for_inserts(&[&alice_view, &bob_view], expected).await?;

    // Reconnect replays everything alice already has; nothing new shows up
    let outgoing = SourceFilter::new("alice".into(), "bob".into());
    store.disconnect(&outgoing, "demo reconnect").await;
    store.reconnect(&outgoing).await;

    // A late record from bob, older than everything else, lands at the top
    info!("Delivering a late, out-of-order message");
    store
        .insert_record(
            "late-from-bob",
            MessageRecord::new("bob".into(), "alice".into(), "(sent earlier, delivered late)", Timestamp(1)),
        )
        .await;
    expected += 1;
    wait_for_inserts(&[&alice_view, &bob_view], expected).await?;

    let alice_final = alice.snapshot(&alice_handle).await?;
    let bob_final = bob.snapshot(&bob_handle).await?;
    info!(
        messages = alice_final.len(),
        converged = alice_final == bob_final,
        "Demo finished"
    );

    alice.shutdown().await;
    bob.shutdown().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> ConversationKey {
        ConversationKey::new("alice".into(), "bob".into()).unwrap()
    }

    #[test]
    fn test_replay_log_counts() {
        let log = r#"
{"kind":"ADDED","recordId":"m2","record":{"senderId":"bob","receiverId":"alice","message":"hi","timestamp":2000}}
{"kind":"ADDED","recordId":"m1","record":{"senderId":"alice","receiverId":"bob","message":"hello","timestamp":1000}}
{"kind":"ADDED","recordId":"m1","record":{"senderId":"alice","receiverId":"bob","message":"hello","timestamp":1000}}
{"kind":"ADDED","recordId":"m3","record":{"senderId":"alice","receiverId":"bob"}}
not json
"#;
        let mut inserts = Vec::new();
        let (store, stats) = replay_log(log, key(), |line, diff| inserts.push((line, diff.ops()[0].index())));

        assert_eq!(
            stats,
            ReplayStats {
                applied: 2,
                no_ops: 1,
                rejected: 2
            }
        );
        let ids: Vec<&str> = store.messages().iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["m1", "m2"]);
        // m1 landed in front of m2
        assert_eq!(inserts, vec![(2, 0), (3, 0)]);
    }

    #[test]
    fn test_format_line() {
        // 2024-03-05 14:30:00 UTC
        let message = MessageRecord::new("alice".into(), "bob".into(), "hello", Timestamp(1_709_649_000_000))
            .to_message(&"m1".into())
            .unwrap();

        assert_eq!(
            format_line(&message, &"alice".into()),
            "[Mar 05, 2024 - 02:30 PM] >> alice: hello"
        );
        assert!(format_line(&message, &"bob".into()).contains("<< alice"));
    }

    #[test]
    fn test_format_out_of_range_time_falls_back() {
        let message = MessageRecord::new("alice".into(), "bob".into(), "hi", Timestamp(u64::MAX))
            .to_message(&"m1".into())
            .unwrap();
        assert!(format_line(&message, &"alice".into()).starts_with(&format!("[{}]", u64::MAX)));
    }

    #[test]
    fn test_replay_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.jsonl");
        std::fs::write(
            &path,
            r#"{"kind":"ADDED","recordId":"m1","record":{"senderId":"alice","receiverId":"bob","message":"hello","timestamp":1}}"#,
        )
        .unwrap();

        assert!(replay(&path, "alice".into(), "bob".into(), true, false).is_ok());
        assert!(replay(&path, "alice".into(), "bob".into(), false, true).is_ok());
        assert!(replay(&path, "alice".into(), "alice".into(), false, false).is_err());
    }
}
