//! Symposium ACP - Main entry point

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use symposium_acp::{setup_logging, CommandResolver, SymposiumConfig};
use symposium_conductor::Stdio;

#[derive(Parser, Debug)]
#[command(name = "symposium-acp")]
#[command(about = "Symposium ACP conductor - runs proxy chains between an editor and an agent")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a proxy chain between the editor on stdio and an agent
    Run {
        #[command(flatten)]
        proxy_opts: ProxyOptions,

        /// Agent specification: a JSON spawn spec or a command line.
        #[arg(long)]
        agent: String,

        /// Seconds to wait for the chain to finish initializing.
        #[arg(long, value_name = "SECS")]
        init_timeout: Option<u64>,

        /// Conductor name used in logs.
        #[arg(long, default_value = "symposium")]
        name: String,
    },

    /// Bridge an agent's stdio MCP client to the conductor listening on PORT
    Mcp {
        #[arg(long)]
        port: u16,

        /// Enable logging to stderr.
        #[arg(long)]
        log: Option<String>,
    },
}

/// Shared proxy configuration options
#[derive(Args, Debug)]
struct ProxyOptions {
    /// Proxy to include in the chain (can be specified multiple times).
    /// Order matters - proxies are chained in the order specified.
    ///
    /// Known proxies: sparkle, ferris, cargo. Anything else is resolved as
    /// a JSON spawn spec or a command line.
    ///
    /// Special value "defaults" expands to all known proxies.
    #[arg(long = "proxy", value_name = "NAME")]
    proxies: Vec<String>,

    /// Enable trace logging to the specified directory.
    /// Traces are written as timestamped .jsons files.
    #[arg(long)]
    trace_dir: Option<PathBuf>,

    /// Enable logging to stderr. Accepts a level (error, warn, info, debug, trace)
    /// or a RUST_LOG-style filter string (e.g., "symposium_conductor=debug").
    #[arg(long)]
    log: Option<String>,
}

impl ProxyOptions {
    fn into_config(self) -> SymposiumConfig {
        let mut config = SymposiumConfig::from_proxy_names(self.proxies);
        if let Some(trace_dir) = self.trace_dir {
            config = config.trace_dir(trace_dir);
        }
        config
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Run {
            proxy_opts,
            agent,
            init_timeout,
            name,
        } => {
            setup_logging(proxy_opts.log.as_deref());
            let mut config = proxy_opts.into_config().name(name);
            if let Some(secs) = init_timeout {
                config = config.initialize_timeout(Duration::from_secs(secs));
            }

            tracing::debug!(proxies = ?config.proxy_names(), %agent, "starting chain");
            let conductor = config.build(&CommandResolver::new(), &agent)?;
            conductor.run(Stdio::new()).await?;
        }

        Command::Mcp { port, log } => {
            setup_logging(log.as_deref());
            symposium_conductor::run_bridge(port).await?;
        }
    }

    Ok(())
}
