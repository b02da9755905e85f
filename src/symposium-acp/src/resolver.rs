//! Resolving `--proxy` and `--agent` values into spawn specs.

use std::collections::BTreeMap;

use symposium_conductor::{ConductorError, Resolver, SpawnSpec};

/// Known proxy/extension names that can be configured.
pub const KNOWN_PROXIES: &[&str] = &["sparkle", "ferris", "cargo"];

/// Expand proxy names, handling "defaults" expansion.
///
/// `defaults` is replaced in place by every known proxy, so
/// `foo defaults bar` becomes `foo sparkle ferris cargo bar`.
pub fn expand_proxy_names(names: &[String]) -> Vec<String> {
    let mut result = Vec::new();
    for name in names {
        if name == "defaults" {
            result.extend(KNOWN_PROXIES.iter().map(|s| s.to_string()));
        } else {
            result.push(name.clone());
        }
    }
    result
}

/// Resolves known proxy names, JSON spawn specs and shell-style command lines.
///
/// ```text
/// sparkle                                   known name
/// {"command":"npx","args":["-y","agent"]}   JSON spec
/// elizacp --deterministic acp               command line
/// ```
#[derive(Debug, Clone)]
pub struct CommandResolver {
    known: BTreeMap<String, SpawnSpec>,
}

impl CommandResolver {
    pub fn new() -> Self {
        let known = BTreeMap::from([
            ("sparkle".to_string(), SpawnSpec::new("sparkle-mcp").arg("--acp")),
            ("ferris".to_string(), SpawnSpec::new("symposium-ferris")),
            ("cargo".to_string(), SpawnSpec::new("symposium-cargo")),
        ]);
        CommandResolver { known }
    }

    /// Register or replace a known name.
    pub fn with(mut self, name: impl Into<String>, spec: SpawnSpec) -> Self {
        self.known.insert(name.into(), spec);
        self
    }
}

impl Default for CommandResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl Resolver for CommandResolver {
    fn resolve(&self, id: &str) -> Result<SpawnSpec, ConductorError> {
        let resolution_error = |message: String| ConductorError::Resolution {
            id: id.to_string(),
            message,
        };

        if let Some(spec) = self.known.get(id) {
            return Ok(spec.clone());
        }

        let trimmed = id.trim();
        if trimmed.starts_with('{') {
            return serde_json::from_str(trimmed)
                .map_err(|e| resolution_error(format!("invalid JSON spec: {e}")));
        }

        let words =
            shell_words::split(trimmed).map_err(|e| resolution_error(e.to_string()))?;
        let Some((command, args)) = words.split_first() else {
            return Err(resolution_error("empty command".to_string()));
        };
        Ok(SpawnSpec {
            command: command.clone(),
            args: args.to_vec(),
            env: BTreeMap::new(),
        })
    }
}
