//! Chain descriptors and the processes backing a running chain.

use std::collections::BTreeMap;
use std::fmt;
use std::process::Stdio as ProcessStdio;

use futures::channel::{mpsc, oneshot};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;

use crate::error::ConductorError;
use crate::jsonrpc::Message;
use crate::transport::{incoming, spawn_writer, BoxRead, Component, Connected, DynComponent, LinkSender};

/// A resolved, runnable command: what an external resolver produces for a
/// component identifier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpawnSpec {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

impl SpawnSpec {
    pub fn new(command: impl Into<String>) -> Self {
        SpawnSpec {
            command: command.into(),
            args: Vec::new(),
            env: BTreeMap::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }
}

impl fmt::Display for SpawnSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.command)?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

impl Component for SpawnSpec {
    fn describe(&self) -> String {
        self.to_string()
    }

    fn connect(self: Box<Self>) -> Result<Connected, ConductorError> {
        let mut child = Command::new(&self.command)
            .args(&self.args)
            .envs(&self.env)
            .stdin(ProcessStdio::piped())
            .stdout(ProcessStdio::piped())
            .stderr(ProcessStdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ConductorError::process(format!("failed to spawn `{self}`: {e}")))?;

        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            return Err(ConductorError::process(format!(
                "`{self}` was spawned without piped stdio"
            )));
        };

        Ok(Connected {
            reader: Box::pin(stdout),
            writer: Box::pin(stdin),
            child: Some(child),
        })
    }
}

/// Ordered proxies followed by exactly one terminal agent.
///
/// The descriptor is consumed by [`Chain::start`]; there is no way to
/// modify a chain once it runs.
pub struct ChainDescriptor {
    proxies: Vec<DynComponent>,
    agent: DynComponent,
}

impl ChainDescriptor {
    pub fn new(agent: impl Component) -> Self {
        ChainDescriptor {
            proxies: Vec::new(),
            agent: Box::new(agent),
        }
    }

    /// Append a proxy. Proxies are chained in the order they are added.
    pub fn proxy(mut self, proxy: impl Component) -> Self {
        self.proxies.push(Box::new(proxy));
        self
    }

    pub fn with_proxies(mut self, proxies: impl IntoIterator<Item = DynComponent>) -> Self {
        self.proxies.extend(proxies);
        self
    }

    /// Build from already-resolved spawn specs.
    pub fn from_specs(proxies: Vec<SpawnSpec>, agent: SpawnSpec) -> Self {
        ChainDescriptor::new(agent)
            .with_proxies(proxies.into_iter().map(|p| Box::new(p) as DynComponent))
    }

    /// Number of components, agent included.
    pub fn len(&self) -> usize {
        self.proxies.len() + 1
    }

    pub fn is_empty(&self) -> bool {
        false
    }
}

/// Something that happened on one component of a running chain.
#[derive(Debug)]
pub enum ChainEvent {
    /// A well-formed message arrived from the component.
    Message { index: usize, message: Message },
    /// A record from the component could not be parsed.
    Malformed { index: usize, error: ConductorError },
    /// The component closed its output stream.
    Closed { index: usize },
    /// The component's process exited on its own.
    Exited { index: usize, status: String },
}

/// Handle on one spawned process. Killing is requested through a channel
/// so the watcher task remains the only owner of the [`Child`].
struct ProcessHandle {
    kill_tx: Option<oneshot::Sender<()>>,
    watcher: JoinHandle<()>,
}

impl ProcessHandle {
    /// Watch `child`, reporting an exit the conductor did not ask for.
    fn watch(mut child: Child, index: usize, mut events: mpsc::Sender<ChainEvent>) -> Self {
        let (kill_tx, kill_rx) = oneshot::channel::<()>();
        let watcher = tokio::spawn(async move {
            let exited = tokio::select! {
                status = child.wait() => Some(status),
                _ = kill_rx => None,
            };
            let status = match exited {
                Some(Ok(status)) => status.to_string(),
                Some(Err(e)) => format!("failed to wait for process: {e}"),
                None => {
                    if let Err(error) = child.kill().await {
                        tracing::warn!(component_index = index, %error, "failed to kill component process");
                    }
                    return;
                }
            };
            let _ = events.send(ChainEvent::Exited { index, status }).await;
        });
        ProcessHandle {
            kill_tx: Some(kill_tx),
            watcher,
        }
    }

    async fn terminate(mut self) {
        if let Some(kill_tx) = self.kill_tx.take() {
            // The receiver is gone if the watcher already saw the exit.
            let _ = kill_tx.send(());
        }
        let _ = self.watcher.await;
    }
}

/// One started component of the chain.
struct ChainLink {
    description: String,
    sender: LinkSender,
    reader_task: JoinHandle<()>,
    writer_task: JoinHandle<()>,
    process: Option<ProcessHandle>,
}

/// Every component of a running chain, proxies first and the agent last.
///
/// The chain exclusively owns the component processes; [`Chain::shutdown`]
/// terminates all of them.
pub struct Chain {
    links: Vec<ChainLink>,
}

impl Chain {
    /// Spawn every component in order and start relaying what they send to
    /// `events`.
    ///
    /// Fails fast on the first spawn failure; components spawned before it
    /// are terminated.
    pub async fn start(
        descriptor: ChainDescriptor,
        events: mpsc::Sender<ChainEvent>,
    ) -> Result<Chain, ConductorError> {
        let ChainDescriptor { proxies, agent } = descriptor;
        let mut chain = Chain {
            links: Vec::with_capacity(proxies.len() + 1),
        };

        for (index, component) in proxies.into_iter().chain(Some(agent)).enumerate() {
            let description = component.describe();
            tracing::info!(component_index = index, %description, "starting component");

            let Connected {
                reader,
                writer,
                child,
            } = match component.connect() {
                Ok(connected) => connected,
                Err(error) => {
                    tracing::error!(component_index = index, %description, %error, "failed to start component");
                    chain.shutdown().await;
                    return Err(error);
                }
            };

            let (sender, writer_task) = spawn_writer(writer, format!("component({index})"));
            let reader_task = tokio::spawn(read_component(index, reader, events.clone()));
            let process = child.map(|child| ProcessHandle::watch(child, index, events.clone()));

            chain.links.push(ChainLink {
                description,
                sender,
                reader_task,
                writer_task,
                process,
            });
        }

        Ok(chain)
    }

    pub fn len(&self) -> usize {
        self.links.len()
    }

    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }

    /// Index of the terminal agent.
    pub fn agent_index(&self) -> usize {
        self.links.len().saturating_sub(1)
    }

    pub fn is_agent(&self, index: usize) -> bool {
        index == self.agent_index()
    }

    pub fn description(&self, index: usize) -> Option<&str> {
        self.links.get(index).map(|link| link.description.as_str())
    }

    pub fn send(&self, index: usize, message: Message) -> Result<(), ConductorError> {
        match self.links.get(index) {
            Some(link) => link.sender.send(message),
            None => Err(ConductorError::protocol(format!(
                "no component at index {index}"
            ))),
        }
    }

    /// Terminate every component. In-flight messages are abandoned.
    pub async fn shutdown(self) {
        for (index, link) in self.links.into_iter().enumerate() {
            tracing::debug!(component_index = index, description = %link.description, "terminating component");
            link.reader_task.abort();
            link.sender.close();
            if let Some(process) = link.process {
                process.terminate().await;
            }
            let _ = link.writer_task.await;
        }
    }
}

async fn read_component(index: usize, reader: BoxRead, mut events: mpsc::Sender<ChainEvent>) {
    let mut messages = Box::pin(incoming(reader));
    while let Some(message) = messages.next().await {
        let event = match message {
            Ok(message) => ChainEvent::Message { index, message },
            Err(error) => ChainEvent::Malformed { index, error },
        };
        if events.send(event).await.is_err() {
            return;
        }
    }
    let _ = events.send(ChainEvent::Closed { index }).await;
}
