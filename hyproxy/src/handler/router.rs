//! Backend selection handlers.
//!
//! Routers write the `backend` context key and continue; a downstream
//! terminal handler (forwarder or terminator) acts on it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::error::HandlerError;
use crate::handler::{Action, Handler};
use crate::proxy::session::{Context, KEY_BACKEND};
use crate::Result;

/// One routing target: a single address or a round-robin pool.
///
/// Selection is an atomic counter modulo pool size, which is fair under
/// concurrent connections.
struct BackendPool {
    addrs: Vec<String>,
    next: AtomicUsize,
}

impl BackendPool {
    fn new(addrs: Vec<String>) -> std::result::Result<Self, HandlerError> {
        if addrs.is_empty() || addrs.iter().any(|a| a.is_empty()) {
            return Err(HandlerError::InvalidConfig {
                reason: "backend list must be non-empty addresses".into(),
            });
        }
        Ok(Self {
            addrs,
            next: AtomicUsize::new(0),
        })
    }

    fn pick(&self) -> &str {
        let i = self.next.fetch_add(1, Ordering::Relaxed) % self.addrs.len();
        &self.addrs[i]
    }
}

/// A backend in config form: `"host:port"` or `["host:port", ...]`.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum BackendSpec {
    One(String),
    Many(Vec<String>),
}

impl BackendSpec {
    fn into_pool(self) -> std::result::Result<BackendPool, HandlerError> {
        match self {
            BackendSpec::One(addr) => BackendPool::new(vec![addr]),
            BackendSpec::Many(addrs) => BackendPool::new(addrs),
        }
    }
}

#[derive(Debug, Deserialize)]
struct SimpleRouterConfig {
    backend: BackendSpec,
}

/// Routes every connection to a configured backend (or round-robins over a
/// list of them).
pub struct SimpleRouterHandler {
    pool: BackendPool,
}

impl SimpleRouterHandler {
    pub fn factory(config: serde_json::Value) -> Result<Arc<dyn Handler>> {
        let cfg: SimpleRouterConfig = serde_json::from_value(config)?;
        Ok(Arc::new(SimpleRouterHandler {
            pool: cfg.backend.into_pool()?,
        }))
    }
}

#[async_trait]
impl Handler for SimpleRouterHandler {
    fn name(&self) -> &'static str {
        "simple-router"
    }

    async fn on_connect(&self, ctx: &Arc<Context>) -> Result<Action> {
        let backend = self.pool.pick();
        debug!("[simple-router] {} → {}", ctx.client_addr, backend);
        ctx.set(KEY_BACKEND, backend.to_owned());
        Ok(Action::Continue)
    }
}

#[derive(Debug, Deserialize)]
struct SniRouterConfig {
    routes: HashMap<String, BackendSpec>,
}

/// Routes by the connection's SNI; hostnames not present in the route table
/// are dropped.
pub struct SniRouterHandler {
    routes: HashMap<String, BackendPool>,
}

impl SniRouterHandler {
    pub fn factory(config: serde_json::Value) -> Result<Arc<dyn Handler>> {
        let cfg: SniRouterConfig = serde_json::from_value(config)?;
        let mut routes = HashMap::with_capacity(cfg.routes.len());
        for (sni, spec) in cfg.routes {
            routes.insert(sni, spec.into_pool()?);
        }
        Ok(Arc::new(SniRouterHandler { routes }))
    }
}

#[async_trait]
impl Handler for SniRouterHandler {
    fn name(&self) -> &'static str {
        "sni-router"
    }

    async fn on_connect(&self, ctx: &Arc<Context>) -> Result<Action> {
        let sni = ctx
            .hello
            .as_ref()
            .map(|h| h.sni.as_str())
            .unwrap_or_default();

        match self.routes.get(sni) {
            Some(pool) => {
                let backend = pool.pick();
                debug!("[sni-router] {} ({}) → {}", ctx.client_addr, sni, backend);
                ctx.set(KEY_BACKEND, backend.to_owned());
                Ok(Action::Continue)
            }
            None => {
                warn!("[sni-router] no route for SNI {:?}, dropping", sni);
                Ok(Action::Drop)
            }
        }
    }
}
