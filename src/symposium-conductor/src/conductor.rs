//! # Conductor: proxy chain orchestration
//!
//! The conductor sits between an editor and a chain of components:
//!
//! ```text
//! Editor <-ACP-> Conductor <-ACP-> [Proxy 0] ... [Proxy n-1] [Agent]
//! ```
//!
//! Every component talks only to the conductor. The editor and the agent
//! see ordinary ACP traffic; proxies reach their successor through the
//! `_proxy/successor/*` envelope methods (see [`crate::envelope`]).
//!
//! ## Message routing
//!
//! One reader task per link feeds the central loop in [`ConductorHandler`],
//! which owns every routing table and processes events one at a time:
//!
//! - editor request: forwarded to component 0 under a fresh local id;
//! - outbound envelope from component `i`: unwrapped and forwarded to
//!   component `i + 1`;
//! - plain request or notification from component `i`: addressed to its
//!   predecessor, so it goes to the editor when `i == 0` and is wrapped in
//!   an inbound envelope for component `i - 1` otherwise;
//! - response: resolved through the pending table of the peer it came from
//!   and delivered to whoever issued the request, under their own id.
//!
//! Each link has its own writer task, so per-link order is preserved and a
//! slow peer never blocks the loop.
//!
//! ## Initialization
//!
//! `initialize` is tagged on its way down (see [`crate::capabilities`]).
//! Editor traffic other than `initialize` is held until link 0 answers, and
//! the whole exchange is bounded by [`Conductor::initialize_timeout`].
//!
//! ## Failure
//!
//! A component closing its output or exiting ends the chain: every pending
//! editor request gets a `-32000` error, all components are terminated and
//! [`Conductor::run`] returns [`ConductorError::Process`].

use std::path::Path;
use std::time::Duration;

use futures::channel::mpsc;
use futures::{Stream, StreamExt};
use fxhash::FxHashSet;
use serde_json::{json, Value};
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::capabilities::{tag_initialize, Negotiator, SESSION_HISTORY};
use crate::chain::{Chain, ChainDescriptor, ChainEvent};
use crate::envelope::{
    BridgeDirection, BridgeEnvelope, Envelope, InnerMessage, MCP_CLIENT_TO_SERVER, MCP_DISCONNECT,
};
use crate::error::ConductorError;
use crate::history::{self, HistoryEntry};
use crate::jsonrpc::{ErrorObject, Id, Message, MessageKind};
use crate::mcp_bridge::{BridgeEvent, BridgeManager};
use crate::pending::{PendingEntry, PendingTable, Peer, ResponseAction};
use crate::trace::{TraceSink, TraceWriter};
use crate::transport::{incoming, spawn_writer, Component, Connected, LinkSender};

pub const DEFAULT_INITIALIZE_TIMEOUT: Duration = Duration::from_secs(120);

const INBOX_CAPACITY: usize = 128;

/// Builder and entry point for running a proxy chain.
pub struct Conductor {
    name: String,
    descriptor: ChainDescriptor,
    conductor_command: Option<Vec<String>>,
    initialize_timeout: Duration,
    trace: Option<TraceWriter>,
}

impl Conductor {
    pub fn new(name: impl Into<String>, descriptor: ChainDescriptor) -> Self {
        Conductor {
            name: name.into(),
            descriptor,
            conductor_command: None,
            initialize_timeout: DEFAULT_INITIALIZE_TIMEOUT,
            trace: None,
        }
    }

    /// Command line that starts this program. MCP bridges are declared to
    /// the agent as `<command> mcp --port N`. Defaults to the current
    /// executable.
    pub fn conductor_command(mut self, command: Vec<String>) -> Self {
        self.conductor_command = Some(command);
        self
    }

    pub fn initialize_timeout(mut self, timeout: Duration) -> Self {
        self.initialize_timeout = timeout;
        self
    }

    /// Record every routed message to `path`.
    pub fn trace_to_path(mut self, path: impl AsRef<Path>) -> Result<Self, ConductorError> {
        self.trace = Some(TraceWriter::create(path)?);
        Ok(self)
    }

    pub fn trace_to(mut self, trace: TraceWriter) -> Self {
        self.trace = Some(trace);
        self
    }

    /// Start the chain and serve `editor` until it disconnects or the chain
    /// fails.
    pub async fn run(self, editor: impl Component) -> Result<(), ConductorError> {
        let Conductor {
            name,
            descriptor,
            conductor_command,
            initialize_timeout,
            trace,
        } = self;
        let conductor_command = conductor_command.unwrap_or_else(default_conductor_command);

        let editor_description = editor.describe();
        let Connected { reader, writer, .. } = Box::new(editor).connect()?;
        let (editor_sender, editor_writer) = spawn_writer(writer, "editor");

        info!(conductor = %name, editor = %editor_description, components = descriptor.len(), "starting chain");
        let (chain_tx, chain_rx) = mpsc::channel(INBOX_CAPACITY);
        let chain = match Chain::start(descriptor, chain_tx).await {
            Ok(chain) => chain,
            Err(error) => {
                editor_sender.close();
                let _ = editor_writer.await;
                return Err(error);
            }
        };

        let (bridge_tx, bridge_rx) = mpsc::channel(INBOX_CAPACITY);
        let handler = ConductorHandler {
            name,
            tables: (0..chain.len())
                .map(|index| PendingTable::new(Peer::Component(index)))
                .collect(),
            negotiator: Negotiator::new(chain.len()),
            chain,
            editor: editor_sender,
            editor_table: PendingTable::new(Peer::Editor),
            initialize_timeout,
            negotiation_deadline: None,
            bridges: BridgeManager::new(conductor_command, bridge_tx),
            cancelled: CancelMarks::default(),
            priming: FxHashSet::default(),
            trace: trace.map(TraceWriter::start),
        };

        let result = handler.run(incoming(reader), chain_rx, bridge_rx).await;
        let _ = editor_writer.await;
        result
    }
}

fn default_conductor_command() -> Vec<String> {
    match std::env::current_exe() {
        Ok(exe) => vec![exe.display().to_string()],
        Err(error) => {
            warn!(%error, "cannot determine the current executable; MCP bridging is unavailable");
            Vec::new()
        }
    }
}

fn inner_session_id(inner: &InnerMessage) -> Option<String> {
    inner
        .params
        .as_ref()?
        .get("sessionId")?
        .as_str()
        .map(str::to_string)
}

async fn expire(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Links the conductor sent `session/cancel` directly, so that the copy
/// their predecessor forwards is absorbed instead of delivered twice.
///
/// A mark is consumed by that forwarded copy, or dropped when the link is
/// sent a new request for the session.
#[derive(Debug, Default)]
struct CancelMarks {
    marks: FxHashSet<(usize, String)>,
}

impl CancelMarks {
    fn mark(&mut self, link: usize, session_id: &str) {
        self.marks.insert((link, session_id.to_string()));
    }

    /// True if a forwarded cancel for `link` duplicates a direct one.
    fn absorb(&mut self, link: usize, session_id: &str) -> bool {
        self.marks.remove(&(link, session_id.to_string()))
    }

    fn clear(&mut self, link: usize, session_id: &str) {
        self.marks.remove(&(link, session_id.to_string()));
    }
}

/// Owns the running chain and every routing table.
struct ConductorHandler {
    name: String,
    chain: Chain,
    editor: LinkSender,

    /// Requests sent to each component, by chain index.
    tables: Vec<PendingTable>,

    /// Requests component 0 sent to the editor.
    editor_table: PendingTable,

    negotiator: Negotiator,
    initialize_timeout: Duration,
    negotiation_deadline: Option<Instant>,

    bridges: BridgeManager,

    cancelled: CancelMarks,

    /// Sessions whose history is being replayed.
    priming: FxHashSet<String>,

    trace: Option<TraceSink>,
}

impl ConductorHandler {
    async fn run(
        mut self,
        editor_messages: impl Stream<Item = Result<Message, ConductorError>>,
        mut chain_events: mpsc::Receiver<ChainEvent>,
        mut bridge_events: mpsc::Receiver<BridgeEvent>,
    ) -> Result<(), ConductorError> {
        let mut editor_messages = std::pin::pin!(editor_messages);

        let outcome = loop {
            let step = tokio::select! {
                message = editor_messages.next() => match message {
                    Some(Ok(message)) => self.route_from_editor(message).await,
                    Some(Err(error @ ConductorError::InvalidRequest(_))) => {
                        warn!(%error, "rejecting request from editor");
                        self.send_to(&Peer::Editor, Message::error_response(Id::Null, &error))
                    }
                    Some(Err(error)) => {
                        warn!(%error, "dropping malformed message from editor");
                        Ok(())
                    }
                    None => {
                        info!("editor disconnected");
                        break Ok(());
                    }
                },
                Some(event) = chain_events.next() => self.handle_chain_event(event).await,
                Some(event) = bridge_events.next() => self.handle_bridge_event(event).await,
                () = expire(self.negotiation_deadline) => Err(ConductorError::Timeout(format!(
                    "initialization did not complete within {:?}",
                    self.initialize_timeout
                ))),
            };

            if let Err(error) = step {
                if error.is_fatal() {
                    break Err(error);
                }
                warn!(%error, "error while routing");
            }
        };

        if let Err(error) = &outcome {
            tracing::error!(conductor = %self.name, %error, "chain failed");
            self.fail_pending(error);
        }
        self.shutdown().await;
        outcome
    }

    // ====
    // Editor side
    // ====

    async fn route_from_editor(&mut self, message: Message) -> Result<(), ConductorError> {
        self.trace_in(&Peer::Editor, &message);
        if message.is_response() {
            return self.resolve_response(Peer::Editor, message).await;
        }

        let is_initialize = message.method() == Some("initialize");
        if !self.negotiator.is_settled() {
            if !is_initialize {
                debug!(method = ?message.method(), "holding editor message until initialization completes");
                self.negotiator.defer(message);
                return Ok(());
            }
            if self.negotiation_deadline.is_none() {
                self.negotiation_deadline = Some(Instant::now() + self.initialize_timeout);
            }
        }

        self.forward_from_editor(message).await
    }

    async fn forward_from_editor(&mut self, message: Message) -> Result<(), ConductorError> {
        let Some(inner) = InnerMessage::from_message(&message) else {
            return Ok(());
        };
        match message.id {
            Some(id) => {
                self.send_downstream_request(0, Peer::Editor, id, inner)
                    .await
            }
            None if inner.method == "session/cancel" => self.cancel_session(inner),
            None => self.send_downstream_notification(0, inner),
        }
    }

    /// Forward the editor's `session/cancel` to component 0 and deliver it
    /// directly to every other link doing work for that session.
    fn cancel_session(&mut self, inner: InnerMessage) -> Result<(), ConductorError> {
        let Some(session_id) = inner_session_id(&inner) else {
            return self.send_downstream_notification(0, inner);
        };
        info!(%session_id, "cancelling session");

        self.send_component(0, inner.clone().into_notification())?;

        let holders: Vec<usize> = (1..self.tables.len())
            .filter(|&index| self.tables[index].has_session(&session_id))
            .collect();
        for index in holders {
            self.cancelled.mark(index, &session_id);
            self.send_component(index, inner.clone().into_notification())?;
        }

        // Tool calls in flight through bridges of this session.
        let mut calls = Vec::new();
        for connection in self.bridges.connections_for_session(&session_id) {
            let Some(table) = self.tables.get(connection.owner) else {
                continue;
            };
            for entry in table.entries() {
                if entry.origin == Peer::Bridge(connection.id) {
                    calls.push((connection.owner, connection.token, connection.id, entry.local_id));
                }
            }
        }
        calls.sort();
        for (owner, token, connection, request_id) in calls {
            debug!(%token, %connection, request_id, "cancelling bridged tool call");
            let cancelled = BridgeEnvelope {
                direction: BridgeDirection::ClientToServer,
                token,
                connection_id: Some(connection),
                message: InnerMessage::new(
                    "notifications/cancelled",
                    Some(json!({"requestId": request_id, "reason": "session cancelled"})),
                ),
            }
            .into_inner();
            self.send_component(
                owner,
                Envelope::ReceiveNotification { inner: cancelled }.into_message(),
            )?;
        }
        Ok(())
    }

    // ====
    // Chain side
    // ====

    async fn handle_chain_event(&mut self, event: ChainEvent) -> Result<(), ConductorError> {
        match event {
            ChainEvent::Message { index, message } => self.route_from_component(index, message).await,
            ChainEvent::Malformed { index, error } => {
                warn!(component_index = index, %error, "dropping malformed message from component");
                match error {
                    ConductorError::InvalidRequest(_) => {
                        self.send_component(index, Message::error_response(Id::Null, &error))
                    }
                    _ => Ok(()),
                }
            }
            ChainEvent::Closed { index } => Err(ConductorError::process(format!(
                "component {index} (`{}`) closed its output",
                self.describe(index)
            ))),
            ChainEvent::Exited { index, status } => Err(ConductorError::process(format!(
                "component {index} (`{}`) exited: {status}",
                self.describe(index)
            ))),
        }
    }

    async fn route_from_component(
        &mut self,
        index: usize,
        message: Message,
    ) -> Result<(), ConductorError> {
        self.trace_in(&Peer::Component(index), &message);
        if message.is_response() {
            return self
                .resolve_response(Peer::Component(index), message)
                .await;
        }

        match Envelope::parse(&message) {
            Err(error) => self.reject(index, message.id, error),
            Ok(Some(Envelope::SendRequest { id, inner })) => {
                self.route_outbound(index, Some(id), inner).await
            }
            Ok(Some(Envelope::SendNotification { inner })) => {
                self.route_outbound(index, None, inner).await
            }
            Ok(Some(Envelope::ReceiveRequest { .. } | Envelope::ReceiveNotification { .. })) => {
                self.reject(
                    index,
                    message.id,
                    ConductorError::protocol("inbound envelopes are only sent by the conductor"),
                )
            }
            Ok(None) => self.route_upstream(index, message),
        }
    }

    /// Answer a request from component `index` with an error.
    fn reject(
        &mut self,
        index: usize,
        id: Option<Id>,
        error: ConductorError,
    ) -> Result<(), ConductorError> {
        warn!(component_index = index, %error, "rejecting message");
        match id {
            Some(id) => self.send_component(index, Message::error_response(id, &error)),
            None => Ok(()),
        }
    }

    /// An outbound envelope from component `index`.
    async fn route_outbound(
        &mut self,
        index: usize,
        id: Option<Id>,
        inner: InnerMessage,
    ) -> Result<(), ConductorError> {
        if self.chain.is_agent(index) {
            return self.reject(index, id, ConductorError::protocol("the agent has no successor"));
        }

        match BridgeEnvelope::parse(&inner) {
            Err(error) => return self.reject(index, id, error),
            Ok(Some(bridge)) if bridge.direction == BridgeDirection::ServerToClient => {
                return self.route_to_bridge(index, id, bridge).await;
            }
            Ok(_) => {}
        }

        match id {
            Some(id) => {
                self.send_downstream_request(index + 1, Peer::Component(index), id, inner)
                    .await
            }
            None => self.send_downstream_notification(index + 1, inner),
        }
    }

    /// A plain request or notification from component `index`, addressed
    /// to its predecessor.
    fn route_upstream(&mut self, index: usize, message: Message) -> Result<(), ConductorError> {
        let Some(inner) = InnerMessage::from_message(&message) else {
            return Ok(());
        };
        let session_id = inner_session_id(&inner);

        if self.chain.is_agent(index) && inner.method == "session/update" {
            if let Some(session_id) = &session_id {
                if self.priming.contains(session_id) {
                    debug!(%session_id, "suppressing update produced by history priming");
                    return Ok(());
                }
            }
        }

        let mut target = index.checked_sub(1);

        // An agent speaking MCP over ACP itself addresses the owning proxy directly.
        if inner.method == MCP_CLIENT_TO_SERVER {
            if let Ok(Some(bridge)) = BridgeEnvelope::parse(&inner) {
                if let Some(owner) = self
                    .bridges
                    .owner(&bridge.token)
                    .filter(|&owner| owner < index)
                {
                    target = Some(owner);
                }
            }
        }

        match (target, message.id) {
            (None, Some(id)) => {
                let local_id = self.editor_table.insert(
                    Peer::Component(index),
                    id,
                    inner.method.clone(),
                    session_id,
                    ResponseAction::Relay,
                );
                self.send_to(&Peer::Editor, inner.into_request(local_id))
            }
            (None, None) => self.send_to(&Peer::Editor, inner.into_notification()),
            (Some(target), Some(id)) => {
                let local_id = self.tables[target].insert(
                    Peer::Component(index),
                    id,
                    inner.method.clone(),
                    session_id,
                    ResponseAction::Relay,
                );
                self.send_component(
                    target,
                    Envelope::ReceiveRequest { id: local_id, inner }.into_message(),
                )
            }
            (Some(target), None) => {
                self.send_component(target, Envelope::ReceiveNotification { inner }.into_message())
            }
        }
    }

    /// Send a request to component `target` on behalf of `origin`.
    async fn send_downstream_request(
        &mut self,
        target: usize,
        origin: Peer,
        origin_id: Id,
        mut inner: InnerMessage,
    ) -> Result<(), ConductorError> {
        let session_id = inner_session_id(&inner);
        if let Some(session_id) = &session_id {
            self.cancelled.clear(target, session_id);
        }

        let mut action = ResponseAction::Relay;
        match inner.method.as_str() {
            "initialize" => {
                tag_initialize(&mut inner.params, self.chain.is_agent(target));
                action = ResponseAction::Negotiate {
                    component_index: target,
                };
            }
            "session/new" => {
                if let (Peer::Component(index), Some(params)) = (&origin, &inner.params) {
                    self.bridges.claim_tokens(params, *index);
                }
                if self.chain.is_agent(target) {
                    match self.prepare_session_new(&mut inner.params).await {
                        Ok(prepared) => action = prepared,
                        Err(error) => {
                            warn!(%origin, %error, "rejecting session/new");
                            return self.deliver_response(
                                &origin,
                                origin_id,
                                Err(error.to_error_object()),
                            );
                        }
                    }
                }
            }
            _ => {}
        }

        let local_id =
            self.tables[target].insert(origin, origin_id, inner.method.clone(), session_id, action);
        self.send_component(target, inner.into_request(local_id))
    }

    fn send_downstream_notification(
        &mut self,
        target: usize,
        inner: InnerMessage,
    ) -> Result<(), ConductorError> {
        if inner.method == "session/cancel" {
            if let Some(session_id) = inner_session_id(&inner) {
                if self.cancelled.absorb(target, &session_id) {
                    debug!(component_index = target, %session_id, "absorbing duplicate session/cancel");
                    return Ok(());
                }
            }
        }
        self.send_component(target, inner.into_notification())
    }

    /// Apply history priming and MCP bridging to a `session/new` about to
    /// reach the agent.
    async fn prepare_session_new(
        &mut self,
        params: &mut Option<Value>,
    ) -> Result<ResponseAction, ConductorError> {
        let Some(params) = params.as_mut() else {
            return Ok(ResponseAction::Relay);
        };
        let adaptations = self.negotiator.adaptations();
        let agent_has_history = self
            .negotiator
            .record_for(self.chain.agent_index())
            .is_some_and(|record| record.has_internal(SESSION_HISTORY));

        let mut priming = None;
        if history::has_history(params) && !agent_has_history {
            let history = history::take_history(params);
            if adaptations.prime_history {
                priming = history.filter(|entries| !entries.is_empty());
            } else {
                warn!("agent cannot replay session history, dropping it");
            }
        }

        let bridges = if adaptations.bridge_mcp {
            self.bridges.rewrite_session_new(params).await?
        } else {
            Vec::new()
        };

        Ok(ResponseAction::SessionCreated { bridges, priming })
    }

    // ====
    // Responses
    // ====

    async fn resolve_response(&mut self, from: Peer, message: Message) -> Result<(), ConductorError> {
        let Some(id) = message.id.clone() else {
            return Ok(());
        };
        let entry = match &from {
            Peer::Editor => self.editor_table.take(&id),
            Peer::Component(index) => self.tables.get_mut(*index).and_then(|table| table.take(&id)),
            Peer::Bridge(connection) => self
                .bridges
                .connection_mut(connection)
                .and_then(|connection| connection.pending.take(&id)),
            Peer::Conductor => None,
        };
        let Some(entry) = entry else {
            let error = ConductorError::Routing {
                peer: from.to_string(),
                id,
            };
            debug!(%error, "ignoring response");
            return Ok(());
        };
        self.complete(entry, message.outcome()).await
    }

    async fn complete(
        &mut self,
        entry: PendingEntry,
        outcome: Result<Value, ErrorObject>,
    ) -> Result<(), ConductorError> {
        let PendingEntry {
            origin,
            origin_id,
            action,
            ..
        } = entry;

        match action {
            ResponseAction::Relay => self.deliver_response(&origin, origin_id, outcome),

            ResponseAction::Negotiate { component_index } => {
                let result = match outcome {
                    Ok(result) => result,
                    Err(error) => return self.deliver_response(&origin, origin_id, Err(error)),
                };
                if let Err(error) = self.negotiator.record(component_index, &result) {
                    self.deliver_response(&origin, origin_id, Err(error.to_error_object()))?;
                    return Err(error);
                }
                if component_index != 0 || origin != Peer::Editor {
                    return self.deliver_response(&origin, origin_id, Ok(result));
                }

                let result = self.negotiator.settle(result);
                self.negotiation_deadline = None;
                self.deliver_response(&origin, origin_id, Ok(result))?;
                for message in self.negotiator.take_deferred() {
                    self.forward_from_editor(message).await?;
                }
                Ok(())
            }

            ResponseAction::SessionCreated { bridges, priming } => {
                let session_id = match &outcome {
                    Ok(result) => result
                        .get("sessionId")
                        .and_then(Value::as_str)
                        .map(str::to_string),
                    Err(_) => {
                        for registration in &bridges {
                            self.bridges.teardown(registration);
                        }
                        None
                    }
                };
                let Some(session_id) = session_id else {
                    return self.deliver_response(&origin, origin_id, outcome);
                };
                self.bridges.bind_session(&bridges, &session_id);
                match priming {
                    Some(history) => {
                        self.start_priming(origin, origin_id, outcome, session_id, &history)
                    }
                    None => self.deliver_response(&origin, origin_id, outcome),
                }
            }

            ResponseAction::Priming {
                release_to,
                held,
                session_id,
            } => {
                self.priming.remove(&session_id);
                match outcome {
                    Ok(_) => debug!(%session_id, "history priming complete"),
                    Err(error) => warn!(%session_id, ?error, "history priming prompt failed"),
                }
                self.send_to(&release_to, *held)
            }
        }
    }

    /// Replay `history` into the new session, holding the `session/new`
    /// response until the agent has answered the synthetic prompt.
    fn start_priming(
        &mut self,
        origin: Peer,
        origin_id: Id,
        outcome: Result<Value, ErrorObject>,
        session_id: String,
        history: &[HistoryEntry],
    ) -> Result<(), ConductorError> {
        let agent = self.chain.agent_index();
        info!(%session_id, entries = history.len(), "priming session history");
        self.priming.insert(session_id.clone());

        let params = history::priming_prompt(&session_id, history);
        let local_id = self.tables[agent].insert(
            Peer::Conductor,
            Id::Number(0),
            "session/prompt",
            Some(session_id.clone()),
            ResponseAction::Priming {
                release_to: origin,
                held: Box::new(Message::response(origin_id, outcome)),
                session_id,
            },
        );
        self.send_component(agent, Message::request(local_id, "session/prompt", Some(params)))
    }

    fn deliver_response(
        &mut self,
        origin: &Peer,
        origin_id: Id,
        outcome: Result<Value, ErrorObject>,
    ) -> Result<(), ConductorError> {
        self.send_to(origin, Message::response(origin_id, outcome))
    }

    // ====
    // Bridges
    // ====

    async fn handle_bridge_event(&mut self, event: BridgeEvent) -> Result<(), ConductorError> {
        match event {
            BridgeEvent::Connected {
                registration,
                connection,
                sender,
            } => {
                self.bridges.connected(&registration, connection, sender);
                Ok(())
            }
            BridgeEvent::Message {
                connection,
                message,
            } => self.route_from_bridge(connection, message).await,
            BridgeEvent::Malformed { connection, error } => {
                warn!(%connection, %error, "dropping malformed bridge record");
                Ok(())
            }
            BridgeEvent::Disconnected { connection } => self.bridge_disconnected(connection),
        }
    }

    /// Direction A: the agent's MCP client talking to a proxy's server.
    async fn route_from_bridge(
        &mut self,
        connection: Uuid,
        message: Message,
    ) -> Result<(), ConductorError> {
        let peer = Peer::Bridge(connection);
        self.trace_in(&peer, &message);
        if message.is_response() {
            return self.resolve_response(peer, message).await;
        }

        let Some(live) = self.bridges.connection(&connection) else {
            warn!(%connection, "message from unknown bridge connection");
            return Ok(());
        };
        let (owner, token) = (live.owner, live.token);
        let session_id = self.bridges.session_of(live).map(str::to_string);

        let Some(inner) = InnerMessage::from_message(&message) else {
            return Ok(());
        };
        let method = inner.method.clone();
        let inner = BridgeEnvelope {
            direction: BridgeDirection::ClientToServer,
            token,
            connection_id: Some(connection),
            message: inner,
        }
        .into_inner();

        match message.id {
            Some(id) => {
                let local_id =
                    self.tables[owner].insert(peer, id, method, session_id, ResponseAction::Relay);
                self.send_component(
                    owner,
                    Envelope::ReceiveRequest { id: local_id, inner }.into_message(),
                )
            }
            None => self.send_component(owner, Envelope::ReceiveNotification { inner }.into_message()),
        }
    }

    /// Direction B: the owning proxy talking to the agent's MCP client.
    async fn route_to_bridge(
        &mut self,
        index: usize,
        id: Option<Id>,
        bridge: BridgeEnvelope,
    ) -> Result<(), ConductorError> {
        let token = bridge.token;
        if self.bridges.owner(&token) != Some(index) {
            return self.reject(
                index,
                id,
                ConductorError::protocol(format!("component {index} does not own MCP server {token}")),
            );
        }

        if !self.negotiator.adaptations().bridge_mcp {
            // The agent speaks MCP over ACP itself.
            let agent = self.chain.agent_index();
            let inner = bridge.into_inner();
            return match id {
                Some(id) => {
                    self.send_downstream_request(agent, Peer::Component(index), id, inner)
                        .await
                }
                None => self.send_downstream_notification(agent, inner),
            };
        }

        let connection = match self.bridges.target(&token, bridge.connection_id) {
            Ok(connection) => connection,
            Err(error) => return self.reject(index, id, error),
        };
        let message = match (id, self.bridges.connection_mut(&connection)) {
            (Some(id), Some(live)) => {
                let local_id = live.pending.insert(
                    Peer::Component(index),
                    id,
                    bridge.message.method.clone(),
                    None,
                    ResponseAction::Relay,
                );
                bridge.message.into_request(local_id)
            }
            _ => bridge.message.into_notification(),
        };
        self.send_to(&Peer::Bridge(connection), message)
    }

    /// Fail what was waiting on a closed bridge connection and tell the owner.
    fn bridge_disconnected(&mut self, connection: Uuid) -> Result<(), ConductorError> {
        let Some(closed) = self.bridges.disconnected(&connection) else {
            return Ok(());
        };
        let error = ConductorError::bridge(format!(
            "bridge connection {connection} for MCP server {} closed",
            closed.token
        ));
        let mut pending = closed.pending;
        for entry in pending.drain() {
            self.deliver_response(&entry.origin, entry.origin_id, Err(error.to_error_object()))?;
        }

        // Requests from the closed client can no longer be answered.
        let abandoned = self.tables[closed.owner].drain_origin(&Peer::Bridge(connection));
        if !abandoned.is_empty() {
            debug!(%connection, count = abandoned.len(), "dropping requests from closed bridge");
        }

        let notice = InnerMessage::new(
            MCP_DISCONNECT,
            Some(json!({ "token": closed.token, "connectionId": connection })),
        );
        self.send_component(
            closed.owner,
            Envelope::ReceiveNotification { inner: notice }.into_message(),
        )
    }

    // ====
    // Sending
    // ====

    fn send_component(&mut self, index: usize, message: Message) -> Result<(), ConductorError> {
        self.trace_out(&Peer::Component(index), &message);
        self.chain.send(index, message)
    }

    fn send_to(&mut self, peer: &Peer, message: Message) -> Result<(), ConductorError> {
        match peer {
            Peer::Component(index) => self.send_component(*index, message),
            Peer::Editor => {
                self.trace_out(peer, &message);
                if let Err(error) = self.editor.send(message) {
                    warn!(%error, "editor is gone");
                }
                Ok(())
            }
            Peer::Bridge(connection) => {
                self.trace_out(peer, &message);
                match self.bridges.connection(connection) {
                    Some(live) => {
                        if let Err(error) = live.send(message) {
                            debug!(%connection, %error, "bridge connection is gone");
                        }
                        Ok(())
                    }
                    None => {
                        debug!(%connection, "dropping message for a closed bridge connection");
                        Ok(())
                    }
                }
            }
            Peer::Conductor => {
                debug!("discarding response to a conductor-issued request");
                Ok(())
            }
        }
    }

    fn trace_in(&mut self, from: &Peer, message: &Message) {
        if let Some(trace) = &self.trace {
            trace.record(from, &Peer::Conductor, message);
        }
    }

    fn trace_out(&mut self, to: &Peer, message: &Message) {
        if let Some(trace) = &self.trace {
            trace.record(&Peer::Conductor, to, message);
        }
    }

    fn describe(&self, index: usize) -> &str {
        self.chain.description(index).unwrap_or("unknown")
    }

    // ====
    // Teardown
    // ====

    /// Answer every editor request that can no longer complete.
    fn fail_pending(&mut self, error: &ConductorError) {
        let error = error.to_error_object();
        let mut ids: Vec<Id> = Vec::new();
        for table in &mut self.tables {
            for entry in table.drain() {
                if let Some(id) = entry.editor_request_id() {
                    ids.push(id.clone());
                }
            }
        }
        for message in self.negotiator.take_deferred() {
            if let MessageKind::Request { id, .. } = message.kind() {
                ids.push(id.clone());
            }
        }

        for id in ids {
            self.send_to(&Peer::Editor, Message::response(id, Err(error.clone())))
                .ok();
        }
    }

    async fn shutdown(mut self) {
        info!(conductor = %self.name, "shutting down chain");
        self.bridges.shutdown();
        self.chain.shutdown().await;
        self.editor.close();
        if let Some(trace) = self.trace.take() {
            trace.finish().await;
        }
    }
}
