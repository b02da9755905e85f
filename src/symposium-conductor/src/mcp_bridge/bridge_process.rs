//! The bridge process: `mcp --port N`.
//!
//! The agent spawns this as an ordinary stdio MCP server. It connects to
//! the conductor's listener and copies complete newline-terminated JSON
//! records in both directions.

use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec};

use crate::error::ConductorError;

/// Connect to the conductor on `port` and relay stdio until either side closes.
pub async fn run_bridge(port: u16) -> Result<(), ConductorError> {
    let stream = TcpStream::connect(("127.0.0.1", port))
        .await
        .map_err(|e| ConductorError::bridge(format!("failed to connect to port {port}: {e}")))?;
    tracing::info!(port, "bridge connected to conductor");
    let (socket_read, socket_write) = stream.into_split();
    relay(tokio::io::stdin(), tokio::io::stdout(), socket_read, socket_write).await
}

/// Copy records `local_read -> remote_write` and `remote_read -> local_write`.
///
/// Returns once either input reaches end of stream.
pub async fn relay(
    local_read: impl AsyncRead + Unpin,
    local_write: impl AsyncWrite + Unpin,
    remote_read: impl AsyncRead + Unpin,
    remote_write: impl AsyncWrite + Unpin,
) -> Result<(), ConductorError> {
    tokio::select! {
        result = pump(local_read, remote_write, "stdin") => result,
        result = pump(remote_read, local_write, "socket") => result,
    }
}

async fn pump(
    reader: impl AsyncRead + Unpin,
    writer: impl AsyncWrite + Unpin,
    source: &'static str,
) -> Result<(), ConductorError> {
    let mut lines = FramedRead::new(reader, LinesCodec::new());
    let mut sink = FramedWrite::new(writer, LinesCodec::new());
    while let Some(line) = lines.next().await {
        let line = line.map_err(|e| ConductorError::bridge(format!("reading {source}: {e}")))?;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match serde_json::from_str::<serde_json::Value>(line) {
            Ok(serde_json::Value::Object(_)) => {}
            Ok(_) | Err(_) => {
                tracing::warn!(source, record = line, "dropping malformed record");
                continue;
            }
        }
        sink.send(line)
            .await
            .map_err(|e| ConductorError::bridge(format!("forwarding from {source}: {e}")))?;
    }
    tracing::debug!(source, "bridge input closed");
    Ok(())
}
