//! Turning component identifiers into runnable commands.
//!
//! The conductor itself only ever sees resolved [`SpawnSpec`]s. Where the
//! identifiers come from (command line, configuration files, a registry)
//! is up to the [`Resolver`] implementation.

use std::collections::BTreeMap;

use crate::chain::{ChainDescriptor, SpawnSpec};
use crate::error::ConductorError;

pub trait Resolver {
    fn resolve(&self, id: &str) -> Result<SpawnSpec, ConductorError>;

    /// Resolve every proxy, in order, and the agent.
    fn resolve_chain(&self, proxies: &[String], agent: &str) -> Result<ChainDescriptor, ConductorError> {
        let proxies = proxies
            .iter()
            .map(|id| self.resolve(id))
            .collect::<Result<Vec<_>, _>>()?;
        let agent = self.resolve(agent)?;
        Ok(ChainDescriptor::from_specs(proxies, agent))
    }
}

/// A fixed table of identifiers.
#[derive(Debug, Clone, Default)]
pub struct StaticResolver {
    specs: BTreeMap<String, SpawnSpec>,
}

impl StaticResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, id: impl Into<String>, spec: SpawnSpec) -> Self {
        self.specs.insert(id.into(), spec);
        self
    }
}

impl Resolver for StaticResolver {
    fn resolve(&self, id: &str) -> Result<SpawnSpec, ConductorError> {
        self.specs
            .get(id)
            .cloned()
            .ok_or_else(|| ConductorError::Resolution {
                id: id.to_string(),
                message: "unknown component".to_string(),
            })
    }
}
