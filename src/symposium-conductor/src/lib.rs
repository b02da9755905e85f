//! Symposium conductor: runs a chain of ACP proxies between an editor and an agent.
//!
//! ```text
//! Editor <-> Conductor <-> Proxy 0 <-> ... <-> Proxy n-1 <-> Agent
//! ```
//!
//! Neither the editor nor the agent can tell the chain is there. The
//! conductor spawns every component, negotiates capabilities across the
//! chain, remaps request ids hop by hop, and bridges proxy-provided MCP
//! servers to agents that can only launch stdio servers.
//!
//! ```no_run
//! # async fn example() -> Result<(), symposium_conductor::ConductorError> {
//! use symposium_conductor::{ChainDescriptor, Conductor, SpawnSpec, Stdio};
//!
//! let chain = ChainDescriptor::from_specs(
//!     vec![SpawnSpec::new("symposium-tee").arg("--log-file").arg("/tmp/acp.log")],
//!     SpawnSpec::new("elizacp").arg("acp"),
//! );
//! Conductor::new("symposium", chain).run(Stdio::new()).await
//! # }
//! ```

pub mod capabilities;
pub mod chain;
pub mod conductor;
pub mod envelope;
pub mod error;
pub mod history;
pub mod jsonrpc;
pub mod mcp_bridge;
pub mod pending;
pub mod proxy;
pub mod resolver;
pub mod trace;
pub mod transport;

pub use capabilities::{Adaptations, CapabilityRecord, Negotiator, Role};
pub use chain::{Chain, ChainDescriptor, ChainEvent, SpawnSpec};
pub use conductor::{Conductor, DEFAULT_INITIALIZE_TIMEOUT};
pub use envelope::{BridgeEnvelope, Envelope, InnerMessage};
pub use error::ConductorError;
pub use jsonrpc::{ErrorObject, Id, Message};
pub use mcp_bridge::run_bridge;
pub use pending::{PendingTable, Peer};
pub use proxy::TransparentProxy;
pub use resolver::{Resolver, StaticResolver};
pub use trace::{TraceSink, TraceWriter};
pub use transport::{ByteStreams, Component, DynComponent, Stdio};
