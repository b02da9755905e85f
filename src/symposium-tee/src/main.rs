//! symposium-tee: a transparent proxy that logs every message it relays.
//!
//! ```bash
//! symposium-acp run --proxy 'symposium-tee --log-file /tmp/acp.jsons' --agent 'elizacp acp'
//! ```

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use serde::Serialize;
use symposium_conductor::proxy::{Direction, Observer};
use symposium_conductor::{Message, TransparentProxy};

#[derive(Parser, Debug)]
#[command(name = "symposium-tee")]
#[command(about = "Transparent ACP proxy that logs every message it relays")]
struct Cli {
    /// File to append the message log to, one JSON object per line.
    #[arg(long, default_value = "symposium-tee.jsons")]
    log_file: PathBuf,

    /// Enable logging to stderr. Accepts a level or a RUST_LOG-style filter string.
    #[arg(long)]
    log: Option<String>,
}

#[derive(Serialize)]
struct LogEntry<'a> {
    timestamp: String,
    direction: &'static str,
    message: &'a Message,
}

/// Appends each observed message to a file.
struct FileLog {
    out: BufWriter<File>,
}

impl FileLog {
    fn new(file: File) -> Self {
        FileLog {
            out: BufWriter::new(file),
        }
    }
}

impl Observer for FileLog {
    fn observe(&mut self, direction: Direction, message: &Message) {
        let entry = LogEntry {
            timestamp: chrono::Utc::now().to_rfc3339(),
            direction: match direction {
                Direction::Incoming => "incoming",
                Direction::Outgoing => "outgoing",
            },
            message,
        };
        let result = serde_json::to_writer(&mut self.out, &entry)
            .map_err(std::io::Error::from)
            .and_then(|()| self.out.write_all(b"\n"))
            .and_then(|()| self.out.flush());
        if let Err(error) = result {
            tracing::warn!(%error, "failed to write message log");
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Some(filter) = &cli.log {
        use tracing_subscriber::EnvFilter;
        tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::new(filter))
            .with_writer(std::io::stderr)
            .init();
    }

    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&cli.log_file)
        .with_context(|| format!("cannot open {}", cli.log_file.display()))?;
    tracing::info!(log_file = %cli.log_file.display(), "tee started");

    TransparentProxy::new()
        .with_observer(FileLog::new(file))
        .serve_stdio()
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};
    use symposium_conductor::Id;

    #[test]
    fn test_file_log_writes_one_line_per_message() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tee.jsons");
        let mut log = FileLog::new(File::create(&path).unwrap());

        let ping = Message::request(Id::Number(1), "ping", Some(json!({})));
        log.observe(Direction::Incoming, &ping);
        log.observe(
            Direction::Outgoing,
            &Message::response(Id::Number(1), Ok(json!({"pong": true}))),
        );

        let contents = std::fs::read_to_string(&path).unwrap();
        let entries: Vec<Value> = contents
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0]["direction"], "incoming");
        assert_eq!(entries[0]["message"]["method"], "ping");
        assert_eq!(entries[1]["direction"], "outgoing");
        assert_eq!(entries[1]["message"]["result"], json!({"pong": true}));
    }

    #[test]
    fn test_parse_defaults() {
        let cli = Cli::try_parse_from(["symposium-tee"]).unwrap();
        assert_eq!(cli.log_file, PathBuf::from("symposium-tee.jsons"));
        assert!(cli.log.is_none());
    }
}
