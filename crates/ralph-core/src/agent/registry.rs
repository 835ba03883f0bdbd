//! Agent plugin registry: a typed factory map from plugin name to
//! constructor.
//!
//! Workers each get a freshly constructed agent instance; the registry is
//! consulted once per worker at provisioning time. An unknown plugin name
//! is a configuration error and fatal at initialization.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{Result, bail};

use crate::config::AgentConfig;

use super::{Agent, CommandAgent};

/// Constructor for a named agent plugin.
pub type AgentFactory = fn(&AgentConfig) -> Result<Arc<dyn Agent>>;

/// Named collection of agent constructors.
#[derive(Default)]
pub struct AgentRegistry {
    factories: BTreeMap<String, AgentFactory>,
}

fn command_factory(config: &AgentConfig) -> Result<Arc<dyn Agent>> {
    Ok(Arc::new(CommandAgent::from_config(config)))
}

impl AgentRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry with the built-in plugins registered.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register("command", command_factory);
        registry
    }

    /// Register (or replace) a factory under a name.
    pub fn register(&mut self, name: impl Into<String>, factory: AgentFactory) {
        self.factories.insert(name.into(), factory);
    }

    /// Construct an agent instance for the configured plugin.
    pub fn create(&self, config: &AgentConfig) -> Result<Arc<dyn Agent>> {
        match self.factories.get(&config.plugin) {
            Some(factory) => factory(config),
            None => bail!(
                "unknown agent plugin {:?} (registered: {})",
                config.plugin,
                self.list().join(", ")
            ),
        }
    }

    /// Registered plugin names, sorted.
    pub fn list(&self) -> Vec<&str> {
        self.factories.keys().map(String::as_str).collect()
    }
}

impl std::fmt::Debug for AgentRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentRegistry")
            .field("plugins", &self.list())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtins_include_command() {
        let registry = AgentRegistry::with_builtins();
        assert_eq!(registry.list(), vec!["command"]);

        let agent = registry.create(&AgentConfig::default()).unwrap();
        assert_eq!(agent.name(), "command");
    }

    #[test]
    fn unknown_plugin_is_fatal() {
        let registry = AgentRegistry::with_builtins();
        let config = AgentConfig {
            plugin: "made-up".to_string(),
            ..AgentConfig::default()
        };
        let err = match registry.create(&config) {
            Ok(_) => panic!("expected unknown plugin to be rejected"),
            Err(err) => err,
        };
        assert!(err.to_string().contains("unknown agent plugin"));
        assert!(err.to_string().contains("command"));
    }

    #[test]
    fn custom_factory_can_be_registered() {
        let mut registry = AgentRegistry::new();
        registry.register("command", |config| {
            Ok(Arc::new(CommandAgent::from_config(config)))
        });
        assert!(registry.create(&AgentConfig::default()).is_ok());
    }
}
