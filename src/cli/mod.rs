//! Command-line interface parsing and handling.

use std::error::Error;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use crate::compress::{compress_transcript, fallback_handoff, TranscriptMessage};
use crate::core::config::{default_state_path, Config};
use crate::core::oauth::{resource_origin, LoopbackBrowser};
use crate::core::storage::{JsonFileStore, KvStore};
use crate::granola::bridge::GranolaBridge;
use crate::mcp::transport::HttpRpcClient;
use crate::memory::{HandoffLog, MemoryKind, MemoryLog};

const OPENAI_API_KEY_STORAGE_KEY: &str = "openai_api_key";

#[derive(Parser)]
#[command(name = "notula")]
#[command(about = "Capture chat memory and ground conversations in your Granola meeting notes")]
#[command(
    long_about = "Notula connects to the Granola MCP service to list your meetings, fetch \
their notes, and ground free-form questions in that context. It also keeps a local FIFO \
memory of conversation snippets and can compress transcripts into structured handoffs.\n\n\
Authentication:\n\
  Use 'notula auth' to sign in to Granola via your browser. The access token is kept in a \
local state file and expires server-side; notula re-authenticates when needed.\n\n\
Environment Variables:\n\
  OPENAI_API_KEY    API key for 'notula handoff' transcript compression\n\
  RUST_LOG          Log filter, e.g. notula=debug"
)]
pub struct Args {
    #[command(subcommand)]
    pub command: Commands,

    /// Override the Granola MCP endpoint
    #[arg(long, global = true, value_name = "URL")]
    pub endpoint: Option<String>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Sign in to Granola via the browser
    Auth,
    /// Forget the stored Granola credential
    Deauth,
    /// Show authentication and cache status
    Status,
    /// List meetings with their notes (fetches and refreshes the cache)
    Meetings {
        /// Start of the date range (YYYY-MM-DD, default: 30 days ago)
        #[arg(long, value_name = "DATE")]
        from: Option<String>,
        /// End of the date range (YYYY-MM-DD, default: today)
        #[arg(long, value_name = "DATE")]
        to: Option<String>,
        /// Print the cached snapshot without a network call
        #[arg(long)]
        cached: bool,
    },
    /// Print one meeting's full notes payload
    Meeting {
        /// Meeting id as shown by 'notula meetings'
        id: String,
    },
    /// Ground a question in your meeting notes and print the composed prompt
    Ask {
        /// The question to ground
        #[arg(trailing_var_arg = true, required = true)]
        query: Vec<String>,
    },
    /// Manage local conversation memories
    Memo {
        #[command(subcommand)]
        action: MemoAction,
    },
    /// Compress a transcript file into a context handoff
    Handoff {
        /// JSON file with [{"role": "user"|"assistant", "content": "..."}]
        transcript: PathBuf,
    },
}

#[derive(Subcommand)]
pub enum MemoAction {
    /// Save a memory
    Add {
        #[arg(trailing_var_arg = true, required = true)]
        text: Vec<String>,
    },
    /// List saved memories
    List,
    /// Delete a memory by id
    Rm { id: String },
}

pub fn main() -> Result<(), Box<dyn Error>> {
    tokio::runtime::Runtime::new()?.block_on(async_main())
}

async fn async_main() -> Result<(), Box<dyn Error>> {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .try_init();

    let args = Args::parse();
    let config = Config::load()?;
    let endpoint = args.endpoint.unwrap_or_else(|| config.mcp_endpoint.clone());

    let store: Arc<dyn KvStore> = Arc::new(JsonFileStore::new(default_state_path()));
    let transport = Arc::new(HttpRpcClient::new(&endpoint)?);
    let bridge = GranolaBridge::new(transport, store.clone(), resource_origin(&endpoint));

    match args.command {
        Commands::Auth => {
            let browser = LoopbackBrowser::bind().await?;
            let result = bridge.authenticate(&browser).await;
            if result.success {
                println!("✅ Signed in to Granola.");
            } else {
                eprintln!(
                    "❌ Authentication failed: {}",
                    result.error.unwrap_or_default()
                );
                std::process::exit(1);
            }
        }
        Commands::Deauth => {
            let result = bridge.deauthenticate();
            if result.success {
                println!("✅ Granola credential removed.");
            } else {
                eprintln!("❌ {}", result.error.unwrap_or_default());
                std::process::exit(1);
            }
        }
        Commands::Status => {
            let status = bridge.check_auth();
            if status.authenticated {
                println!("Granola: authenticated");
            } else {
                println!("Granola: not authenticated (run 'notula auth')");
            }
            let snapshot = bridge.cached_meetings();
            match snapshot.cached_at {
                Some(cached_at) => println!(
                    "Meetings cache: {} meetings, fetched {}",
                    snapshot.meetings.len(),
                    format_timestamp(cached_at)
                ),
                None => println!("Meetings cache: empty"),
            }
        }
        Commands::Meetings { from, to, cached } => {
            if cached {
                let snapshot = bridge.cached_meetings();
                if snapshot.meetings.is_empty() {
                    println!("No cached meetings. Run 'notula meetings' to fetch.");
                } else {
                    print_meetings(&snapshot.meetings);
                }
                return Ok(());
            }
            let date_from = parse_date_arg(from.as_deref())?;
            let date_to = parse_date_arg(to.as_deref())?;
            let outcome = bridge.fetch_and_cache_meetings(date_from, date_to).await;
            if let Some(error) = outcome.error {
                eprintln!("❌ {error}");
                std::process::exit(1);
            }
            if outcome.meetings.is_empty() {
                println!("No meetings found in the requested range.");
            } else {
                print_meetings(&outcome.meetings);
            }
        }
        Commands::Meeting { id } => {
            let detail = bridge.meeting_detail(&id).await;
            match detail.meeting {
                Some(text) => println!("{text}"),
                None => {
                    eprintln!("❌ {}", detail.error.unwrap_or_default());
                    std::process::exit(1);
                }
            }
        }
        Commands::Ask { query } => {
            let browser = LoopbackBrowser::bind().await?;
            let prompt = bridge.grounded_prompt(&query.join(" "), &browser).await;
            match prompt.composed_prompt {
                Some(composed) => println!("{composed}"),
                None => {
                    eprintln!("❌ {}", prompt.error.unwrap_or_default());
                    std::process::exit(1);
                }
            }
        }
        Commands::Memo { action } => run_memo(action, store)?,
        Commands::Handoff { transcript } => {
            run_handoff(transcript, store, &config).await?;
        }
    }
    Ok(())
}

fn run_memo(action: MemoAction, store: Arc<dyn KvStore>) -> Result<(), Box<dyn Error>> {
    let memories = MemoryLog::new(store);
    match action {
        MemoAction::Add { text } => {
            let entry = memories.save(&text.join(" "), MemoryKind::User, None)?;
            println!("✓ Saved memory {}", entry.id);
        }
        MemoAction::List => {
            let entries = memories.list()?;
            if entries.is_empty() {
                println!("No memories saved yet.");
            }
            for entry in entries {
                println!(
                    "{}  {}  {}",
                    entry.id,
                    format_timestamp(entry.timestamp),
                    entry.text
                );
            }
        }
        MemoAction::Rm { id } => {
            memories.delete(&id)?;
            println!("✓ Deleted memory {id}");
        }
    }
    Ok(())
}

async fn run_handoff(
    transcript_path: PathBuf,
    store: Arc<dyn KvStore>,
    config: &Config,
) -> Result<(), Box<dyn Error>> {
    let raw = std::fs::read_to_string(&transcript_path)?;
    let messages: Vec<TranscriptMessage> = serde_json::from_str(&raw)?;
    if messages.is_empty() {
        return Err("transcript file contains no messages".into());
    }

    let api_key = match std::env::var("OPENAI_API_KEY") {
        Ok(key) if !key.trim().is_empty() => key.trim().to_string(),
        _ => store
            .get(OPENAI_API_KEY_STORAGE_KEY)?
            .filter(|key| !key.trim().is_empty())
            .ok_or("OPENAI_API_KEY is required for transcript compression")?,
    };

    let http = reqwest::Client::new();
    let document = match compress_transcript(
        &http,
        &config.openai_api_url,
        &api_key,
        &config.compression_model,
        &messages,
    )
    .await
    {
        Ok(compressed) => compressed,
        Err(error) => {
            eprintln!("⚠ Compression failed ({error}); saving the raw transcript instead.");
            fallback_handoff(&messages, &error)
        }
    };

    let handoffs = HandoffLog::new(store);
    let handoff = handoffs.save(&document, messages.len(), "transcript")?;
    println!("✓ Saved handoff \"{}\" ({} messages)", handoff.title, handoff.message_count);
    Ok(())
}

fn print_meetings(meetings: &[crate::granola::records::MeetingRecord]) {
    for meeting in meetings {
        let attendees = if meeting.attendees.is_empty() {
            String::new()
        } else {
            format!("  [{}]", meeting.attendees.join(", "))
        };
        println!(
            "{}  {}  {}{}",
            meeting.id, meeting.date, meeting.title, attendees
        );
        if !meeting.content.is_empty() {
            for line in meeting.content.lines().take(3) {
                println!("    {line}");
            }
        }
    }
}

fn parse_date_arg(value: Option<&str>) -> Result<Option<NaiveDate>, Box<dyn Error>> {
    value
        .map(|raw| {
            NaiveDate::parse_from_str(raw, "%Y-%m-%d")
                .map_err(|err| format!("invalid date '{raw}': {err}").into())
        })
        .transpose()
}

fn format_timestamp(epoch_ms: i64) -> String {
    chrono::DateTime::from_timestamp_millis(epoch_ms)
        .map(|timestamp| timestamp.format("%Y-%m-%d %H:%M UTC").to_string())
        .unwrap_or_else(|| epoch_ms.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn date_arguments_parse_and_reject() {
        assert_eq!(parse_date_arg(None).expect("none is fine"), None);
        assert_eq!(
            parse_date_arg(Some("2024-04-01")).expect("valid date"),
            NaiveDate::from_ymd_opt(2024, 4, 1)
        );
        assert!(parse_date_arg(Some("04/01/2024")).is_err());
    }

    #[test]
    fn cli_parses_meetings_flags() {
        let args = Args::try_parse_from([
            "notula", "meetings", "--from", "2024-04-01", "--to", "2024-04-30",
        ])
        .expect("args should parse");
        match args.command {
            Commands::Meetings { from, to, cached } => {
                assert_eq!(from.as_deref(), Some("2024-04-01"));
                assert_eq!(to.as_deref(), Some("2024-04-30"));
                assert!(!cached);
            }
            _ => panic!("expected meetings command"),
        }
    }

    #[test]
    fn cli_collects_trailing_query_words() {
        let args = Args::try_parse_from(["notula", "ask", "what", "did", "we", "decide"])
            .expect("args should parse");
        match args.command {
            Commands::Ask { query } => assert_eq!(query.join(" "), "what did we decide"),
            _ => panic!("expected ask command"),
        }
    }
}
