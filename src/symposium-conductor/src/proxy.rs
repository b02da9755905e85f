//! The transparent proxy: the identity element of a chain.
//!
//! Everything from the predecessor is re-emitted as the matching outbound
//! envelope with its payload untouched, and everything delivered in an
//! inbound envelope is handed to the predecessor unwrapped. Inserting a
//! transparent proxy anywhere in a chain changes nothing either end can
//! observe. Real proxies start from this behavior and only deviate for the
//! messages they care about.

use futures::StreamExt;
use fxhash::FxHashSet;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::capabilities::{set_features, set_role, Role};
use crate::envelope::{Envelope, InnerMessage};
use crate::error::ConductorError;
use crate::jsonrpc::{Id, Message, MessageKind};
use crate::transport::{incoming, spawn_writer};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Received from the conductor.
    Incoming,
    /// Sent back to the conductor.
    Outgoing,
}

/// Sees every message a [`TransparentProxy`] handles.
pub trait Observer: Send {
    fn observe(&mut self, direction: Direction, message: &Message);
}

impl Observer for () {
    fn observe(&mut self, _direction: Direction, _message: &Message) {}
}

impl<F> Observer for F
where
    F: FnMut(Direction, &Message) + Send,
{
    fn observe(&mut self, direction: Direction, message: &Message) {
        self(direction, message)
    }
}

pub struct TransparentProxy<O = ()> {
    observer: O,
    features: Vec<String>,
    /// Ids of `initialize` requests whose responses still need the proxy role.
    initializing: FxHashSet<Id>,
}

impl TransparentProxy {
    pub fn new() -> Self {
        TransparentProxy {
            observer: (),
            features: Vec::new(),
            initializing: FxHashSet::default(),
        }
    }
}

impl Default for TransparentProxy {
    fn default() -> Self {
        Self::new()
    }
}

impl<O: Observer> TransparentProxy<O> {
    pub fn with_observer<P: Observer>(self, observer: P) -> TransparentProxy<P> {
        TransparentProxy {
            observer,
            features: self.features,
            initializing: self.initializing,
        }
    }

    /// Declare an internal feature (e.g. `session_history`) in the
    /// `initialize` response.
    pub fn feature(mut self, name: impl Into<String>) -> Self {
        self.features.push(name.into());
        self
    }

    /// The message this proxy sends back for one message from the conductor.
    pub fn pass_through(&mut self, mut message: Message) -> Result<Message, ConductorError> {
        match Envelope::parse(&message)? {
            Some(Envelope::ReceiveRequest { id, inner }) => return Ok(inner.into_request(id)),
            Some(Envelope::ReceiveNotification { inner }) => return Ok(inner.into_notification()),
            Some(Envelope::SendRequest { .. } | Envelope::SendNotification { .. }) => {
                return Err(ConductorError::protocol(
                    "outbound envelopes are never sent to a proxy",
                ))
            }
            None => {}
        }

        if message.is_response() {
            let is_initialize = message
                .id
                .as_ref()
                .is_some_and(|id| self.initializing.remove(id));
            if is_initialize {
                if let Some(result) = message.result.as_mut() {
                    set_role(result, Role::Proxy);
                    if !self.features.is_empty() {
                        set_features(result, self.features.iter().map(String::as_str));
                    }
                }
            }
            return Ok(message);
        }

        let inner = InnerMessage::from_message(&message)
            .ok_or_else(|| ConductorError::protocol("message has no method"))?;
        match message.kind() {
            MessageKind::Request { id, method } => {
                if method == "initialize" {
                    self.initializing.insert(id.clone());
                }
                Ok(Envelope::SendRequest {
                    id: id.clone(),
                    inner,
                }
                .into_message())
            }
            _ => Ok(Envelope::SendNotification { inner }.into_message()),
        }
    }

    /// Serve the conductor over a pair of byte streams until it hangs up.
    pub async fn serve(
        mut self,
        reader: impl AsyncRead + Send + 'static,
        writer: impl AsyncWrite + Send + 'static,
    ) -> Result<(), ConductorError> {
        let (sender, writer_task) = spawn_writer(writer, "conductor");
        let mut messages = Box::pin(incoming(reader));

        while let Some(message) = messages.next().await {
            let message = match message {
                Ok(message) => message,
                Err(error) => {
                    tracing::warn!(%error, "dropping malformed message");
                    continue;
                }
            };
            self.observer.observe(Direction::Incoming, &message);
            match self.pass_through(message) {
                Ok(reply) => {
                    self.observer.observe(Direction::Outgoing, &reply);
                    sender.send(reply)?;
                }
                Err(error) => tracing::warn!(%error, "cannot pass message through"),
            }
        }

        drop(sender);
        let _ = writer_task.await;
        Ok(())
    }

    pub async fn serve_stdio(self) -> Result<(), ConductorError> {
        self.serve(tokio::io::stdin(), tokio::io::stdout()).await
    }
}
