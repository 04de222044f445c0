//! export_sessions - print stored presence sessions

use anyhow::{anyhow, Result};
use clap::Parser;
use std::path::PathBuf;

use ipmas::storage::summarize_sessions;
use ipmas::{to_iso8601, SessionStore, SqliteSessionStore};

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Path to the session database.
    #[arg(long, env = "IPMAS_DB_PATH", default_value = "data/attendance.db")]
    db_path: PathBuf,
    /// Output format (summary|json).
    #[arg(long, default_value = "summary", value_name = "FORMAT")]
    format: String,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    let args = Args::parse();

    if !args.db_path.exists() {
        return Err(anyhow!("database {} does not exist", args.db_path.display()));
    }
    let mut store = SqliteSessionStore::open(&args.db_path)?;
    let sessions = store.read_all()?;

    match args.format.as_str() {
        "json" => {
            println!("{}", serde_json::to_string_pretty(&sessions)?);
        }
        "summary" => {
            let summary = summarize_sessions(&sessions);
            if summary.is_empty() {
                println!("no sessions recorded");
                return Ok(());
            }
            println!(
                "{:<20} {:<28} {:>6} {:>12} {:<28} {}",
                "identity", "first entry", "exits", "outside (s)", "final exit", "status"
            );
            for row in summary {
                println!(
                    "{:<20} {:<28} {:>6} {:>12.1} {:<28} {}",
                    row.identity,
                    to_iso8601(row.first_entry),
                    row.exit_count,
                    row.total_outside_s,
                    row.final_exit.map(to_iso8601).unwrap_or_else(|| "-".to_string()),
                    row.status.as_str()
                );
            }
        }
        other => return Err(anyhow!("unknown format '{}' (use summary or json)", other)),
    }
    Ok(())
}
