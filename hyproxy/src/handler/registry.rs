//! Handler construction from configuration.
//!
//! Handlers are statically compiled; the registry is a pure dispatch table
//! from type name to factory function. Construction failures are fatal at
//! startup.

use std::collections::HashMap;
use std::sync::Arc;

use crate::config::HandlerConfig;
use crate::error::HandlerError;
use crate::handler::{Chain, Handler};
use crate::Result;

/// Factory building a handler from its opaque JSON config blob.
pub type HandlerFactory = fn(serde_json::Value) -> Result<Arc<dyn Handler>>;

/// Name → factory dispatch table.
pub struct Registry {
    factories: HashMap<&'static str, HandlerFactory>,
}

impl Registry {
    /// An empty registry, useful for tests.
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// A registry with every built-in handler registered.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register("logsni", crate::handler::LogSniHandler::factory);
        registry.register("simple-router", crate::handler::SimpleRouterHandler::factory);
        registry.register("sni-router", crate::handler::SniRouterHandler::factory);
        registry.register("forwarder", crate::handler::ForwarderHandler::factory);
        registry.register("terminator", crate::terminator::TerminatorHandler::factory);
        registry
    }

    /// Adds a handler factory under `name`, replacing any previous entry.
    pub fn register(&mut self, name: &'static str, factory: HandlerFactory) {
        self.factories.insert(name, factory);
    }

    /// Builds a chain from handler configurations, in order. Unknown types
    /// and factory failures abort construction.
    pub fn build_chain(&self, configs: &[HandlerConfig]) -> Result<Chain> {
        let mut handlers = Vec::with_capacity(configs.len());
        for cfg in configs {
            let factory =
                self.factories
                    .get(cfg.handler_type.as_str())
                    .ok_or_else(|| HandlerError::UnknownType {
                        name: cfg.handler_type.clone(),
                    })?;
            handlers.push(factory(cfg.config.clone())?);
        }
        Ok(Chain::new(handlers))
    }

    /// All registered handler names, sorted.
    pub fn names(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.factories.keys().copied().collect();
        names.sort_unstable();
        names
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::HyproxyError;
    use crate::handler::Action;
    use crate::proxy::session::Context;
    use async_trait::async_trait;

    struct Noop;

    #[async_trait]
    impl Handler for Noop {
        fn name(&self) -> &'static str {
            "noop"
        }
        async fn on_connect(&self, _ctx: &Arc<Context>) -> Result<Action> {
            Ok(Action::Continue)
        }
    }

    fn noop_factory(_cfg: serde_json::Value) -> Result<Arc<dyn Handler>> {
        Ok(Arc::new(Noop))
    }

    fn handler_config(name: &str) -> HandlerConfig {
        HandlerConfig {
            handler_type: name.to_owned(),
            config: serde_json::Value::Null,
        }
    }

    #[test]
    fn unknown_type_fails() {
        let registry = Registry::new();
        let err = registry
            .build_chain(&[handler_config("nonexistent")])
            .unwrap_err();
        assert!(matches!(
            err,
            HyproxyError::Handler(HandlerError::UnknownType { .. })
        ));
    }

    #[test]
    fn builds_in_order() {
        let mut registry = Registry::new();
        registry.register("noop", noop_factory);

        let chain = registry
            .build_chain(&[handler_config("noop"), handler_config("noop")])
            .unwrap();
        assert_eq!(chain.handlers().len(), 2);
    }

    #[test]
    fn builtins_present() {
        let registry = Registry::with_builtins();
        let names = registry.names();
        for expected in [
            "forwarder",
            "logsni",
            "simple-router",
            "sni-router",
            "terminator",
        ] {
            assert!(names.contains(&expected), "missing builtin {expected}");
        }
    }
}
