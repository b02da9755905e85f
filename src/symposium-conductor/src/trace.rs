//! Message trace files (`.jsons`: one JSON object per line).

use std::fs::File;
use std::path::{Path, PathBuf};

use futures::channel::mpsc;
use futures::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedWrite, LinesCodec};

use crate::error::ConductorError;
use crate::jsonrpc::Message;
use crate::pending::Peer;

#[derive(Serialize)]
struct TraceEntry<'a> {
    timestamp: String,
    from: String,
    to: String,
    message: &'a Message,
}

/// A trace file that has been created but not started yet.
pub struct TraceWriter {
    path: PathBuf,
    file: File,
}

impl TraceWriter {
    pub fn create(path: impl AsRef<Path>) -> Result<Self, ConductorError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = File::create(&path)?;
        Ok(TraceWriter { path, file })
    }

    /// A fresh `<timestamp>.jsons` file inside `dir`.
    pub fn in_dir(dir: impl AsRef<Path>) -> Result<Self, ConductorError> {
        let timestamp = chrono::Utc::now().format("%Y%m%d-%H%M%S");
        Self::create(dir.as_ref().join(format!("{timestamp}.jsons")))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Spawn the task that appends entries to the file. Entries queued
    /// together are written with a single flush.
    pub fn start(self) -> TraceSink {
        let TraceWriter { path, file } = self;
        let (tx, mut rx) = mpsc::unbounded::<String>();
        let task_path = path.clone();
        let task = tokio::spawn(async move {
            let mut sink = FramedWrite::new(tokio::fs::File::from_std(file), LinesCodec::new());
            while let Some(line) = rx.next().await {
                let mut result = sink.feed(line).await;
                while result.is_ok() {
                    match rx.try_next() {
                        Ok(Some(line)) => result = sink.feed(line).await,
                        _ => break,
                    }
                }
                if let Err(error) = result.and(SinkExt::<String>::flush(&mut sink).await) {
                    tracing::warn!(path = %task_path.display(), %error, "failed to write trace entries");
                    break;
                }
            }
            let _ = SinkExt::<String>::close(&mut sink).await;
        });
        TraceSink { path, tx, task }
    }
}

/// Handle to a running trace file writer.
pub struct TraceSink {
    path: PathBuf,
    tx: mpsc::UnboundedSender<String>,
    task: JoinHandle<()>,
}

impl TraceSink {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn record(&self, from: &Peer, to: &Peer, message: &Message) {
        let entry = TraceEntry {
            timestamp: chrono::Utc::now().to_rfc3339(),
            from: from.to_string(),
            to: to.to_string(),
            message,
        };
        match serde_json::to_string(&entry) {
            Ok(line) => {
                if self.tx.unbounded_send(line).is_err() {
                    tracing::debug!(path = %self.path.display(), "trace writer has stopped");
                }
            }
            Err(error) => tracing::warn!(%error, "failed to serialize trace entry"),
        }
    }

    /// Write out everything recorded so far and close the file.
    pub async fn finish(self) {
        let TraceSink { tx, task, .. } = self;
        tx.close_channel();
        let _ = task.await;
    }
}
