//! Symposium ACP: run a proxy chain between an editor on stdio and an agent.
//!
//! ```bash
//! symposium-acp run --proxy defaults --agent 'npx -y @zed-industries/claude-code-acp'
//! symposium-acp run --proxy sparkle --agent '{"command":"elizacp","args":["acp"]}'
//! ```
//!
//! Proxies are chained in the order given. The `mcp` subcommand is the
//! bridge process the conductor declares to agents that cannot speak MCP
//! over ACP themselves.

pub mod resolver;

use std::path::PathBuf;
use std::time::Duration;

use symposium_conductor::{ChainDescriptor, Conductor, ConductorError, Resolver, TraceWriter};

pub use resolver::{expand_proxy_names, CommandResolver, KNOWN_PROXIES};

/// Shared configuration for Symposium proxy chains.
#[derive(Debug, Clone)]
pub struct SymposiumConfig {
    name: String,
    /// Ordered list of proxy names to include in the chain.
    proxy_names: Vec<String>,
    trace_dir: Option<PathBuf>,
    initialize_timeout: Option<Duration>,
}

impl SymposiumConfig {
    /// Create from a list of proxy names. `defaults` is expanded.
    pub fn from_proxy_names(names: Vec<String>) -> Self {
        SymposiumConfig {
            name: "symposium".to_string(),
            proxy_names: expand_proxy_names(&names),
            trace_dir: None,
            initialize_timeout: None,
        }
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Set the trace directory.
    pub fn trace_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.trace_dir = Some(dir.into());
        self
    }

    pub fn initialize_timeout(mut self, timeout: Duration) -> Self {
        self.initialize_timeout = Some(timeout);
        self
    }

    pub fn proxy_names(&self) -> &[String] {
        &self.proxy_names
    }

    /// Resolve the configured proxies, in order, followed by `agent`.
    pub fn descriptor(
        &self,
        resolver: &impl Resolver,
        agent: &str,
    ) -> Result<ChainDescriptor, ConductorError> {
        resolver.resolve_chain(&self.proxy_names, agent)
    }

    /// Build a conductor for `agent` with tracing and other settings applied.
    pub fn build(&self, resolver: &impl Resolver, agent: &str) -> Result<Conductor, ConductorError> {
        let descriptor = self.descriptor(resolver, agent)?;
        let mut conductor = Conductor::new(self.name.clone(), descriptor);

        if let Some(timeout) = self.initialize_timeout {
            conductor = conductor.initialize_timeout(timeout);
        }

        if let Some(dir) = &self.trace_dir {
            let trace = TraceWriter::in_dir(dir)?;
            tracing::info!("Tracing to {}", trace.path().display());
            conductor = conductor.trace_to(trace);
        }

        Ok(conductor)
    }
}

/// Install a stderr subscriber. stdout carries protocol traffic.
///
/// `filter` is a level or a RUST_LOG-style filter string; without one,
/// `RUST_LOG` is honored if set and logging stays off otherwise.
pub fn setup_logging(filter: Option<&str>) {
    use tracing_subscriber::EnvFilter;

    let filter = match filter {
        Some(filter) => EnvFilter::new(filter),
        None if std::env::var_os("RUST_LOG").is_some() => EnvFilter::from_default_env(),
        None => return,
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}
