//! Transport links: ordered, newline-framed JSON-RPC channels.
//!
//! Each link is a pair of byte streams. Incoming bytes are decoded with a
//! [`LinesCodec`] (partial reads are buffered until a full record arrives)
//! and outgoing messages are written by a dedicated writer task so that a
//! slow peer never blocks the conductor's central loop.

use std::pin::Pin;

use futures::channel::mpsc;
use futures::{SinkExt, Stream, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::Child;
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec, LinesCodecError};

use crate::error::ConductorError;
use crate::jsonrpc::Message;

pub type BoxRead = Pin<Box<dyn AsyncRead + Send>>;
pub type BoxWrite = Pin<Box<dyn AsyncWrite + Send>>;

/// A component after it has been started: its byte streams plus the child
/// process backing it, if any.
pub struct Connected {
    pub reader: BoxRead,
    pub writer: BoxWrite,
    pub child: Option<Child>,
}

/// Something the conductor can talk JSON-RPC to: a spawned process, stdio,
/// or an in-process pair of streams.
pub trait Component: Send + 'static {
    /// Human-readable description used in logs and traces.
    fn describe(&self) -> String;

    /// Start the component and return its streams.
    fn connect(self: Box<Self>) -> Result<Connected, ConductorError>;
}

pub type DynComponent = Box<dyn Component>;

/// A component backed by an arbitrary reader/writer pair.
///
/// Used for in-process components, most notably in tests together with
/// [`tokio::io::duplex`].
pub struct ByteStreams {
    label: String,
    reader: BoxRead,
    writer: BoxWrite,
}

impl ByteStreams {
    pub fn new(
        writer: impl AsyncWrite + Send + 'static,
        reader: impl AsyncRead + Send + 'static,
    ) -> Self {
        ByteStreams {
            label: "byte-streams".to_string(),
            reader: Box::pin(reader),
            writer: Box::pin(writer),
        }
    }

    pub fn named(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }
}

impl Component for ByteStreams {
    fn describe(&self) -> String {
        self.label.clone()
    }

    fn connect(self: Box<Self>) -> Result<Connected, ConductorError> {
        let ByteStreams { reader, writer, .. } = *self;
        Ok(Connected {
            reader,
            writer,
            child: None,
        })
    }
}

/// The current process's stdin/stdout.
#[derive(Debug, Default, Clone, Copy)]
pub struct Stdio;

impl Stdio {
    pub fn new() -> Self {
        Stdio
    }
}

impl Component for Stdio {
    fn describe(&self) -> String {
        "stdio".to_string()
    }

    fn connect(self: Box<Self>) -> Result<Connected, ConductorError> {
        Ok(Connected {
            reader: Box::pin(tokio::io::stdin()),
            writer: Box::pin(tokio::io::stdout()),
            child: None,
        })
    }
}

/// Decode newline-delimited JSON-RPC messages from `reader`.
///
/// Records that fail to parse are yielded as [`ConductorError::Protocol`]
/// and the stream continues; an I/O error ends it.
pub fn incoming(
    reader: impl AsyncRead + Send + 'static,
) -> impl Stream<Item = Result<Message, ConductorError>> + Send {
    FramedRead::new(reader, LinesCodec::new())
        .take_while(|line| futures::future::ready(!matches!(line, Err(LinesCodecError::Io(_)))))
        .filter_map(|line| async move {
            match line {
                Ok(line) if line.trim().is_empty() => None,
                Ok(line) => Some(Message::parse(line.trim())),
                Err(error) => Some(Err(ConductorError::protocol(error))),
            }
        })
}

/// Sending half of a link. Cloning is cheap; messages are written in the
/// order they were sent.
#[derive(Clone, Debug)]
pub struct LinkSender {
    label: String,
    tx: mpsc::UnboundedSender<Message>,
}

impl LinkSender {
    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn send(&self, message: Message) -> Result<(), ConductorError> {
        self.tx
            .unbounded_send(message)
            .map_err(|_| ConductorError::process(format!("link to {} is closed", self.label)))
    }

    pub fn close(&self) {
        self.tx.close_channel();
    }
}

/// Spawn the writer task for a link. The task ends (after flushing) once
/// every [`LinkSender`] is dropped or closed.
pub fn spawn_writer(
    writer: impl AsyncWrite + Send + 'static,
    label: impl Into<String>,
) -> (LinkSender, JoinHandle<()>) {
    let label = label.into();
    let (tx, mut rx) = mpsc::unbounded::<Message>();
    let task_label = label.clone();
    let task = tokio::spawn(async move {
        let mut sink = FramedWrite::new(Box::pin(writer), LinesCodec::new());
        while let Some(message) = rx.next().await {
            if let Err(error) = sink.send(message.to_line()).await {
                tracing::warn!(link = %task_label, %error, "failed to write message");
                break;
            }
        }
        let _ = SinkExt::<String>::close(&mut sink).await;
        tracing::trace!(link = %task_label, "writer finished");
    });
    (LinkSender { label, tx }, task)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jsonrpc::Id;
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn test_partial_records_are_buffered() {
        let (mut write_end, read_end) = tokio::io::duplex(1024);
        let mut messages = Box::pin(incoming(read_end));

        write_end.write_all(br#"{"jsonrpc":"2.0","id":1,"#).await.unwrap();
        write_end.write_all(b"\"method\":\"ping\"}\n\n").await.unwrap();
        write_end.write_all(b"garbage\n").await.unwrap();
        write_end
            .write_all(b"{\"jsonrpc\":\"2.0\",\"method\":\"note\"}\n")
            .await
            .unwrap();
        drop(write_end);

        let first = messages.next().await.unwrap().unwrap();
        assert_eq!(first.id, Some(Id::Number(1)));
        assert!(matches!(
            messages.next().await,
            Some(Err(ConductorError::Protocol(_)))
        ));
        let third = messages.next().await.unwrap().unwrap();
        assert_eq!(third.method(), Some("note"));
        assert!(messages.next().await.is_none());
    }

    #[tokio::test]
    async fn test_writer_preserves_order() {
        let (write_end, read_end) = tokio::io::duplex(1024);
        let (sender, task) = spawn_writer(write_end, "test");
        for i in 0..5 {
            sender
                .send(Message::notification(format!("n{i}"), None))
                .unwrap();
        }
        drop(sender);
        task.await.unwrap();

        let methods: Vec<String> = incoming(read_end)
            .map(|m| m.unwrap().method.unwrap())
            .collect()
            .await;
        assert_eq!(methods, ["n0", "n1", "n2", "n3", "n4"]);
    }
}
