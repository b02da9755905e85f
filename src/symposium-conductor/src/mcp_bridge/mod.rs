//! MCP-over-ACP bridging.
//!
//! Proxies declare their MCP servers with a placeholder URL `acp:<uuid>`.
//! An agent that cannot speak MCP over ACP never sees that URL: each
//! declaration is rewritten into a stdio server that runs the conductor's
//! own `mcp --port N` subcommand, which connects back to a listener owned
//! by this module. Traffic on that connection is then routed to the proxy
//! that owns the token.

mod bridge_process;

pub use bridge_process::{relay, run_bridge};

use fxhash::{FxHashMap, FxHashSet};
use futures::channel::mpsc;
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::{JoinHandle, JoinSet};
use uuid::Uuid;

use crate::error::ConductorError;
use crate::jsonrpc::Message;
use crate::pending::{PendingTable, Peer};
use crate::transport::{incoming, spawn_writer, LinkSender};

pub const ACP_SCHEME: &str = "acp:";

/// Attempts at finding a port that was not handed out before.
const PORT_ATTEMPTS: usize = 16;

/// Token of an `acp:<uuid>` URL.
pub fn parse_acp_url(url: &str) -> Option<Uuid> {
    url.strip_prefix(ACP_SCHEME)?.parse().ok()
}

/// Every `acp:` token declared in `session/new` params, in declaration order.
pub fn declared_tokens(params: &Value) -> Vec<Uuid> {
    let Some(servers) = params.get("mcpServers").and_then(Value::as_array) else {
        return Vec::new();
    };
    servers
        .iter()
        .filter_map(|server| server.get("url")?.as_str())
        .filter_map(parse_acp_url)
        .collect()
}

/// Activity on a bridge listener, reported to the conductor.
///
/// Every accepted connection gets its own id, so several bridge processes
/// (or a reconnecting one) never share routing state.
#[derive(Debug)]
pub enum BridgeEvent {
    Connected {
        registration: Uuid,
        connection: Uuid,
        sender: LinkSender,
    },
    Message {
        connection: Uuid,
        message: Message,
    },
    Malformed {
        connection: Uuid,
        error: ConductorError,
    },
    Disconnected {
        connection: Uuid,
    },
}

/// One bridged MCP server declaration in one `session/new`.
#[derive(Debug)]
pub struct BridgeRegistration {
    pub id: Uuid,
    pub token: Uuid,
    /// Chain index of the proxy that declared the server.
    pub owner: usize,
    pub name: String,
    pub port: u16,
    pub session_id: Option<String>,
    listener_task: JoinHandle<()>,
}

impl Drop for BridgeRegistration {
    fn drop(&mut self) {
        self.listener_task.abort();
    }
}

/// A live connection from a bridge process.
#[derive(Debug)]
pub struct BridgeConnection {
    pub id: Uuid,
    pub registration: Uuid,
    pub token: Uuid,
    pub owner: usize,
    /// Requests sent to the bridge (server-to-client requests from the owner).
    pub pending: PendingTable,
    sender: LinkSender,
}

impl BridgeConnection {
    pub fn send(&self, message: Message) -> Result<(), ConductorError> {
        self.sender.send(message)
    }
}

/// Allocates bridge ports and owns every registration and connection.
pub struct BridgeManager {
    conductor_command: Vec<String>,
    used_ports: FxHashSet<u16>,
    owners: FxHashMap<Uuid, usize>,
    registrations: FxHashMap<Uuid, BridgeRegistration>,
    connections: FxHashMap<Uuid, BridgeConnection>,
    events: mpsc::Sender<BridgeEvent>,
}

impl BridgeManager {
    /// `conductor_command` is the command line that runs this program; the
    /// bridge is started as `<conductor_command> mcp --port N`.
    pub fn new(conductor_command: Vec<String>, events: mpsc::Sender<BridgeEvent>) -> Self {
        BridgeManager {
            conductor_command,
            used_ports: FxHashSet::default(),
            owners: FxHashMap::default(),
            registrations: FxHashMap::default(),
            connections: FxHashMap::default(),
            events,
        }
    }

    /// Record `link` as the owner of every token in `params` that has not
    /// been seen yet.
    pub fn claim_tokens(&mut self, params: &Value, link: usize) {
        for token in declared_tokens(params) {
            self.owners.entry(token).or_insert_with(|| {
                tracing::debug!(%token, owner = link, "MCP server token claimed");
                link
            });
        }
    }

    pub fn owner(&self, token: &Uuid) -> Option<usize> {
        self.owners.get(token).copied()
    }

    pub fn get(&self, registration: &Uuid) -> Option<&BridgeRegistration> {
        self.registrations.get(registration)
    }

    pub fn registrations_for<'a>(
        &'a self,
        token: &'a Uuid,
    ) -> impl Iterator<Item = &'a BridgeRegistration> + 'a {
        self.registrations
            .values()
            .filter(move |registration| registration.token == *token)
    }

    pub fn connection(&self, connection: &Uuid) -> Option<&BridgeConnection> {
        self.connections.get(connection)
    }

    pub fn connection_mut(&mut self, connection: &Uuid) -> Option<&mut BridgeConnection> {
        self.connections.get_mut(connection)
    }

    /// Session the connection's registration is bound to, once known.
    pub fn session_of(&self, connection: &BridgeConnection) -> Option<&str> {
        self.registrations
            .get(&connection.registration)?
            .session_id
            .as_deref()
    }

    pub fn len(&self) -> usize {
        self.registrations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registrations.is_empty()
    }

    /// Live connections whose registration is bound to `session_id`.
    pub fn connections_for_session<'a>(
        &'a self,
        session_id: &'a str,
    ) -> impl Iterator<Item = &'a BridgeConnection> + 'a {
        self.connections
            .values()
            .filter(move |connection| self.session_of(connection) == Some(session_id))
    }

    /// The connection a server-to-client message for `token` goes to.
    ///
    /// An explicit connection id must belong to `token`. Without one, the
    /// token must have exactly one live connection.
    pub fn target(&self, token: &Uuid, connection: Option<Uuid>) -> Result<Uuid, ConductorError> {
        if let Some(connection) = connection {
            return match self.connections.get(&connection) {
                Some(live) if live.token == *token => Ok(connection),
                _ => Err(ConductorError::bridge(format!(
                    "MCP server {token} has no bridge connection {connection}"
                ))),
            };
        }
        let mut live = self
            .connections
            .values()
            .filter(|connection| connection.token == *token);
        match (live.next(), live.next()) {
            (Some(connection), None) => Ok(connection.id),
            (None, _) => Err(ConductorError::bridge(format!(
                "MCP server {token} has no bridge connection"
            ))),
            (Some(_), Some(_)) => Err(ConductorError::protocol(format!(
                "MCP server {token} has several bridge connections; `connectionId` is required"
            ))),
        }
    }

    /// Bind a listener on a port never handed out before by this manager.
    async fn allocate_listener(&mut self) -> Result<(TcpListener, u16), ConductorError> {
        for _ in 0..PORT_ATTEMPTS {
            let listener = TcpListener::bind(("127.0.0.1", 0))
                .await
                .map_err(|e| ConductorError::bridge(format!("failed to bind bridge listener: {e}")))?;
            let port = listener
                .local_addr()
                .map_err(|e| ConductorError::bridge(format!("failed to read bridge address: {e}")))?
                .port();
            if self.used_ports.insert(port) {
                return Ok((listener, port));
            }
            tracing::debug!(port, "port was handed out before, retrying");
        }
        Err(ConductorError::bridge("could not allocate an unused bridge port"))
    }

    fn check_command(&self) -> Result<(), ConductorError> {
        let program = self
            .conductor_command
            .first()
            .ok_or_else(|| ConductorError::bridge("no conductor command configured for MCP bridges"))?;
        which::which(program).map_err(|e| {
            ConductorError::bridge(format!("cannot run bridge command `{program}`: {e}"))
        })?;
        Ok(())
    }

    /// Create a registration for one declaration of `token` and start
    /// accepting bridge connections for it. Returns the registration id and
    /// the port the bridge must connect to.
    pub async fn register(
        &mut self,
        token: Uuid,
        owner: usize,
        name: String,
    ) -> Result<(Uuid, u16), ConductorError> {
        self.check_command()?;
        let (listener, port) = self.allocate_listener().await?;
        let id = Uuid::new_v4();
        let listener_task = tokio::spawn(serve(listener, id, token, self.events.clone()));
        tracing::info!(%token, registration = %id, owner, %name, port, "registered MCP bridge");
        self.registrations.insert(
            id,
            BridgeRegistration {
                id,
                token,
                owner,
                name,
                port,
                session_id: None,
                listener_task,
            },
        );
        Ok((id, port))
    }

    /// The stdio declaration that replaces an `acp:` server.
    pub fn stdio_declaration(&self, name: &str, port: u16) -> Value {
        let (command, base_args) = match self.conductor_command.split_first() {
            Some((command, args)) => (command.clone(), args.to_vec()),
            None => (String::new(), Vec::new()),
        };
        let mut args = base_args;
        args.extend(["mcp".to_string(), "--port".to_string(), port.to_string()]);
        json!({
            "name": name,
            "command": command,
            "args": args,
            "env": [],
        })
    }

    /// Register a bridge for every `acp:` server in `session/new` params and
    /// rewrite the declarations in place. Returns the new registration ids.
    ///
    /// On failure, registrations created by this call are torn down and
    /// `params` must not be forwarded.
    pub async fn rewrite_session_new(
        &mut self,
        params: &mut Value,
    ) -> Result<Vec<Uuid>, ConductorError> {
        let mut created = Vec::new();
        match self.rewrite_servers(params, &mut created).await {
            Ok(()) => Ok(created),
            Err(error) => {
                for registration in created {
                    self.teardown(&registration);
                }
                Err(error)
            }
        }
    }

    async fn rewrite_servers(
        &mut self,
        params: &mut Value,
        created: &mut Vec<Uuid>,
    ) -> Result<(), ConductorError> {
        let Some(servers) = params.get_mut("mcpServers").and_then(Value::as_array_mut) else {
            return Ok(());
        };
        for server in servers.iter_mut() {
            let Some(url) = server.get("url").and_then(Value::as_str) else {
                continue;
            };
            if !url.starts_with(ACP_SCHEME) {
                continue;
            }
            let token = parse_acp_url(url)
                .ok_or_else(|| ConductorError::bridge(format!("invalid MCP server URL `{url}`")))?;
            let owner = self
                .owner(&token)
                .ok_or_else(|| ConductorError::bridge(format!("no proxy owns MCP server `{url}`")))?;
            let name = server
                .get("name")
                .and_then(Value::as_str)
                .unwrap_or("mcp")
                .to_string();

            let (registration, port) = self.register(token, owner, name.clone()).await?;
            created.push(registration);
            *server = self.stdio_declaration(&name, port);
        }
        Ok(())
    }

    pub fn bind_session(&mut self, registrations: &[Uuid], session_id: &str) {
        for id in registrations {
            if let Some(registration) = self.registrations.get_mut(id) {
                registration.session_id = Some(session_id.to_string());
            }
        }
    }

    pub fn connected(&mut self, registration: &Uuid, connection: Uuid, sender: LinkSender) {
        let Some(BridgeRegistration { token, owner, .. }) = self.registrations.get(registration)
        else {
            sender.close();
            return;
        };
        tracing::debug!(%token, %connection, "bridge connection established");
        self.connections.insert(
            connection,
            BridgeConnection {
                id: connection,
                registration: *registration,
                token: *token,
                owner: *owner,
                pending: PendingTable::new(Peer::Bridge(connection)),
                sender,
            },
        );
    }

    /// Forget `connection` and hand it back so the requests that were
    /// waiting on it can be failed.
    pub fn disconnected(&mut self, connection: &Uuid) -> Option<BridgeConnection> {
        let removed = self.connections.remove(connection)?;
        tracing::debug!(token = %removed.token, %connection, "bridge connection dropped");
        removed.sender.close();
        Some(removed)
    }

    /// Remove a registration, its listener and its connections. The token's
    /// owner is forgotten once no registration declares it any more.
    pub fn teardown(&mut self, id: &Uuid) -> Option<BridgeRegistration> {
        let registration = self.registrations.remove(id)?;
        tracing::debug!(token = %registration.token, port = registration.port, "tearing down MCP bridge");
        self.connections.retain(|_, connection| {
            if connection.registration == *id {
                connection.sender.close();
                false
            } else {
                true
            }
        });
        if self.registrations_for(&registration.token).next().is_none() {
            self.owners.remove(&registration.token);
        }
        Some(registration)
    }

    /// Tear down every registration.
    pub fn shutdown(&mut self) {
        let ids: Vec<Uuid> = self.registrations.keys().copied().collect();
        for id in ids {
            self.teardown(&id);
        }
    }
}

/// Accept bridge connections for one registration. Each connection is
/// served by its own task; all of them end with the listener.
async fn serve(
    listener: TcpListener,
    registration: Uuid,
    token: Uuid,
    events: mpsc::Sender<BridgeEvent>,
) {
    let mut connections = JoinSet::new();
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(accepted) => accepted,
                    Err(error) => {
                        tracing::warn!(%token, %error, "bridge listener failed");
                        return;
                    }
                };
                let connection = Uuid::new_v4();
                tracing::debug!(%token, %connection, %peer, "bridge process connected");
                connections.spawn(serve_connection(stream, registration, connection, events.clone()));
            }
            Some(_) = connections.join_next() => {}
        }
    }
}

async fn serve_connection(
    stream: TcpStream,
    registration: Uuid,
    connection: Uuid,
    mut events: mpsc::Sender<BridgeEvent>,
) {
    let (read_half, write_half) = stream.into_split();
    let (sender, _writer) = spawn_writer(write_half, format!("bridge({connection})"));
    let connected = BridgeEvent::Connected {
        registration,
        connection,
        sender,
    };
    if events.send(connected).await.is_err() {
        return;
    }

    let mut messages = Box::pin(incoming(read_half));
    while let Some(message) = messages.next().await {
        let event = match message {
            Ok(message) => BridgeEvent::Message { connection, message },
            Err(error) => BridgeEvent::Malformed { connection, error },
        };
        if events.send(event).await.is_err() {
            return;
        }
    }

    let _ = events.send(BridgeEvent::Disconnected { connection }).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

    fn manager() -> (BridgeManager, mpsc::Receiver<BridgeEvent>) {
        let (tx, rx) = mpsc::channel(16);
        let exe = std::env::current_exe().unwrap();
        (
            BridgeManager::new(vec![exe.display().to_string()], tx),
            rx,
        )
    }

    #[test]
    fn test_declared_tokens() {
        let token = Uuid::new_v4();
        let params = json!({
            "mcpServers": [
                {"name": "a", "url": format!("acp:{token}")},
                {"name": "b", "url": "http://localhost:1234"},
                {"name": "c", "url": "acp:not-a-uuid"},
                {"name": "d", "command": "tool", "args": [], "env": []}
            ]
        });
        assert_eq!(declared_tokens(&params), vec![token]);
    }

    /// Connect to `port` and wait for the manager to learn about it.
    async fn accept(
        manager: &mut BridgeManager,
        events: &mut mpsc::Receiver<BridgeEvent>,
        port: u16,
    ) -> (Uuid, TcpStream) {
        let stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        let Some(BridgeEvent::Connected {
            registration,
            connection,
            sender,
        }) = events.next().await
        else {
            panic!("expected a connection event");
        };
        manager.connected(&registration, connection, sender);
        (connection, stream)
    }

    fn declared_port(params: &Value, index: usize) -> u16 {
        params["mcpServers"][index]["args"]
            .as_array()
            .and_then(|args| args.last())
            .and_then(Value::as_str)
            .and_then(|port| port.parse().ok())
            .unwrap()
    }

    #[tokio::test]
    async fn test_rewrite_and_relay() {
        let (mut manager, mut events) = manager();
        let token = Uuid::new_v4();
        let mut params = json!({
            "cwd": "/",
            "mcpServers": [{"name": "ferris", "type": "http", "url": format!("acp:{token}"), "headers": []}]
        });
        manager.claim_tokens(&params, 0);
        let registrations = manager.rewrite_session_new(&mut params).await.unwrap();
        assert_eq!(registrations.len(), 1);

        let server = &params["mcpServers"][0];
        assert_eq!(server["name"], "ferris");
        assert_eq!(server["env"], json!([]));
        let args: Vec<&str> = server["args"]
            .as_array()
            .unwrap()
            .iter()
            .map(|a| a.as_str().unwrap())
            .collect();
        assert_eq!(&args[..2], ["mcp", "--port"]);
        let port: u16 = args[2].parse().unwrap();
        let registration = manager.get(&registrations[0]).unwrap();
        assert_eq!((registration.token, registration.port), (token, port));

        let (connection, stream) = accept(&mut manager, &mut events, port).await;
        let (read_half, mut write_half) = stream.into_split();
        write_half
            .write_all(b"{\"jsonrpc\":\"2.0\",\"id\":1,\"method\":\"tools/list\"}\n")
            .await
            .unwrap();
        let Some(BridgeEvent::Message { connection: from, message }) = events.next().await else {
            panic!("expected a message event");
        };
        assert_eq!(from, connection);
        assert_eq!(message.method(), Some("tools/list"));

        assert_eq!(manager.target(&token, None).unwrap(), connection);
        manager
            .connection(&connection)
            .unwrap()
            .send(Message::notification("notifications/progress", None))
            .unwrap();
        let mut lines = BufReader::new(read_half).lines();
        let line = lines.next_line().await.unwrap().unwrap();
        assert_eq!(line, r#"{"jsonrpc":"2.0","method":"notifications/progress"}"#);

        drop(write_half);
        drop(lines);
        assert!(matches!(
            events.next().await,
            Some(BridgeEvent::Disconnected { connection: gone }) if gone == connection
        ));
        assert!(manager.disconnected(&connection).unwrap().pending.is_empty());
        assert!(manager.connection(&connection).is_none());
        assert!(manager.get(&registrations[0]).is_some());
    }

    #[tokio::test]
    async fn test_each_session_gets_its_own_bridge() {
        let (mut manager, mut events) = manager();
        let token = Uuid::new_v4();
        let declaration = json!({"mcpServers": [{"name": "tools", "url": format!("acp:{token}")}]});
        manager.claim_tokens(&declaration, 0);

        let mut first = declaration.clone();
        let first_ids = manager.rewrite_session_new(&mut first).await.unwrap();
        manager.bind_session(&first_ids, "session-1");
        let mut second = declaration.clone();
        let second_ids = manager.rewrite_session_new(&mut second).await.unwrap();
        manager.bind_session(&second_ids, "session-2");

        let (first_port, second_port) = (declared_port(&first, 0), declared_port(&second, 0));
        assert_ne!(first_port, second_port);
        assert_eq!(manager.len(), 2);

        // The first session's bridge stays connected while the second one is served.
        let (first_connection, _first_stream) = accept(&mut manager, &mut events, first_port).await;
        let (second_connection, mut second_stream) =
            accept(&mut manager, &mut events, second_port).await;
        second_stream
            .write_all(b"{\"jsonrpc\":\"2.0\",\"id\":1,\"method\":\"tools/list\"}\n")
            .await
            .unwrap();
        let Some(BridgeEvent::Message { connection, .. }) = events.next().await else {
            panic!("expected a message event");
        };
        assert_eq!(connection, second_connection);

        let sessions: Vec<Option<&str>> = [first_connection, second_connection]
            .iter()
            .map(|id| manager.session_of(manager.connection(id).unwrap()))
            .collect();
        assert_eq!(sessions, [Some("session-1"), Some("session-2")]);
        assert_eq!(
            manager
                .connections_for_session("session-2")
                .map(|connection| connection.id)
                .collect::<Vec<_>>(),
            vec![second_connection]
        );

        // Two live connections for one token: the caller has to pick.
        assert!(matches!(
            manager.target(&token, None),
            Err(ConductorError::Protocol(_))
        ));
        assert_eq!(
            manager.target(&token, Some(first_connection)).unwrap(),
            first_connection
        );
        assert!(manager.target(&Uuid::new_v4(), Some(first_connection)).is_err());
    }

    #[tokio::test]
    async fn test_unowned_token_fails_and_leaves_nothing_behind() {
        let (mut manager, _events) = manager();
        let owned = Uuid::new_v4();
        let unowned = Uuid::new_v4();
        let mut params = json!({
            "mcpServers": [
                {"name": "a", "url": format!("acp:{owned}")},
                {"name": "b", "url": format!("acp:{unowned}")}
            ]
        });
        manager.claim_tokens(&json!({"mcpServers": [{"name": "a", "url": format!("acp:{owned}")}]}), 0);
        let error = manager.rewrite_session_new(&mut params).await.unwrap_err();
        assert!(matches!(error, ConductorError::Bridge(_)));
        assert!(manager.is_empty());
        assert_eq!(manager.owner(&owned), None);
    }

    #[tokio::test]
    async fn test_owner_is_kept_while_a_registration_remains() {
        let (mut manager, _events) = manager();
        let token = Uuid::new_v4();
        manager.claim_tokens(&json!({"mcpServers": [{"name": "t", "url": format!("acp:{token}")}]}), 2);
        let (a, _) = manager.register(token, 2, "t".into()).await.unwrap();
        let (b, _) = manager.register(token, 2, "t".into()).await.unwrap();

        manager.teardown(&a);
        assert_eq!(manager.owner(&token), Some(2));
        manager.teardown(&b);
        assert_eq!(manager.owner(&token), None);
    }

    #[tokio::test]
    async fn test_missing_bridge_command() {
        let (tx, _rx) = mpsc::channel(1);
        let mut manager = BridgeManager::new(vec!["/nonexistent/conductor".to_string()], tx);
        let error = manager
            .register(Uuid::new_v4(), 0, "x".to_string())
            .await
            .unwrap_err();
        assert!(matches!(error, ConductorError::Bridge(_)));
    }

    #[tokio::test]
    async fn test_ports_are_not_reused() {
        let (mut manager, _events) = manager();
        let (a, port_a) = manager.register(Uuid::new_v4(), 0, "a".into()).await.unwrap();
        manager.teardown(&a);
        let (_, port_b) = manager.register(Uuid::new_v4(), 0, "b".into()).await.unwrap();
        assert_ne!(port_a, port_b);
    }
}
