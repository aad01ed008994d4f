use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use serde_json::{Map, Value};
use std::path::PathBuf;
use tokio::sync::mpsc::{self, UnboundedSender};
use tokio::task::JoinHandle;

use dashsync::cache::{Layout, Notice, NoticeLevel, DEFAULT_PROBE_BYTES};
use dashsync::config::Config;
use dashsync::dashboard::Dashboard;
use dashsync::logging;

#[derive(Parser, Debug)]
#[command(name = "dashsync")]
#[command(about = "Encrypted local mirror of a remote dashboard dataset")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/dashsync/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Also log to stderr
  #[arg(short, long)]
  verbose: bool,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Load the dataset, from cache when it is fresh
  Load {
    /// Skip the cache and refetch
    #[arg(short, long)]
    force: bool,
  },
  /// Show cache state
  Status,
  /// Clear the cache and re-enable caching
  Clear,
  /// Update one row and patch the cache
  Patch {
    table: String,
    id: String,
    /// JSON object of fields to set
    json: String,
  },
  /// Delete one row and patch the cache
  Delete { table: String, id: String },
}

/// Ids are numbers on most tables; anything that is not JSON is a string id.
fn parse_id(raw: &str) -> Value {
  serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

fn parse_patch(raw: &str) -> Result<Map<String, Value>> {
  match serde_json::from_str::<Value>(raw) {
    Ok(Value::Object(map)) => Ok(map),
    Ok(_) => Err(eyre!("Patch must be a JSON object")),
    Err(e) => Err(eyre!("Failed to parse patch: {}", e)),
  }
}

fn notice_line(notice: &Notice) -> String {
  let label = match notice.level {
    NoticeLevel::Info => "info",
    NoticeLevel::Warning => "warning",
    NoticeLevel::Error => "error",
  };
  format!("[{}] {}", label, notice.message)
}

/// Print cache notices to stderr until every sender is dropped.
fn spawn_notice_printer() -> (UnboundedSender<Notice>, JoinHandle<usize>) {
  let (tx, mut rx) = mpsc::unbounded_channel::<Notice>();
  let printer = tokio::spawn(async move {
    let mut printed = 0;
    while let Some(notice) = rx.recv().await {
      eprintln!("{}", notice_line(&notice));
      printed += 1;
    }
    printed
  });
  (tx, printer)
}

/// Wait for the printer to drain. A panicked or cancelled printer is
/// logged; it never fails the command that already ran.
async fn finish_printer(printer: JoinHandle<usize>) -> Option<usize> {
  match printer.await {
    Ok(printed) => Some(printed),
    Err(e) => {
      tracing::warn!(error = %e, "notice printer task failed");
      None
    }
  }
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();
  let _guard = logging::init(args.verbose)?;

  // Load configuration
  let config = Config::load(args.config.as_deref())?;

  let (tx, printer) = spawn_notice_printer();

  let dashboard = Dashboard::new(&config, Some(tx))?;

  match args.command {
    Command::Load { force } => {
      let outcome = dashboard.load(force).await?;
      println!(
        "{} rows, {} sidecar rows from {:?} (fetched {})",
        outcome.dataset.dataset.len(),
        outcome.dataset.sidecar.len(),
        outcome.source,
        outcome.fetched_at.to_rfc3339()
      );
    }
    Command::Status => {
      let status = dashboard.status().await;
      println!("caching:  {:?}", status.state);
      println!("failures: {}", status.counter.consecutive_failures);
      match status.layout {
        Ok(Layout::Empty) => println!("layout:   empty"),
        Ok(Layout::Single { bytes }) => println!("layout:   single value, {} bytes", bytes),
        Ok(Layout::Chunked(index)) => println!(
          "layout:   {} chunks, {} bytes, written {}",
          index.total_chunks,
          index.total_size,
          index.created_at.to_rfc3339()
        ),
        Err(e) => println!("layout:   unreadable ({})", e),
      }
      if let Some(bytes) = status.in_memory_bytes {
        println!("dataset:  {} bytes", bytes);
      }
      match dashboard.probe(DEFAULT_PROBE_BYTES) {
        Ok(true) => println!("headroom: at least {} bytes", DEFAULT_PROBE_BYTES),
        Ok(false) => println!("headroom: less than {} bytes", DEFAULT_PROBE_BYTES),
        Err(e) => println!("headroom: unknown ({})", e),
      }
    }
    Command::Clear => {
      dashboard.clear_cache().await?;
      println!("cache cleared");
    }
    Command::Patch { table, id, json } => {
      let role = dashboard.role_of(&table)?;
      let patch = parse_patch(&json)?;
      // Patch the cache copy only when a dataset is loaded.
      dashboard.load(false).await?;
      let cached = dashboard.update_record(role, &parse_id(&id), patch).await?;
      println!("updated {} {}{}", table, id, if cached { "" } else { " (not in cache)" });
    }
    Command::Delete { table, id } => {
      let role = dashboard.role_of(&table)?;
      dashboard.load(false).await?;
      let cached = dashboard.delete_record(role, &parse_id(&id)).await?;
      println!("deleted {} {}{}", table, id, if cached { "" } else { " (not in cache)" });
    }
  }

  drop(dashboard);
  finish_printer(printer).await;

  Ok(())
}
