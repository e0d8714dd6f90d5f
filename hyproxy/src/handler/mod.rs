//! The per-connection handler chain.
//!
//! Handlers run in configuration order on connect, per inbound datagram,
//! and on teardown. A handler either passes the event on (`Continue`),
//! claims it (`Handled`), or rejects it (`Drop`). A connection no handler
//! claims is not a valid connection, so an all-`Continue` chain drops.

mod forwarder;
mod logsni;
mod registry;
mod router;

pub use forwarder::ForwarderHandler;
pub use logsni::LogSniHandler;
pub use registry::Registry;
pub use router::{SimpleRouterHandler, SniRouterHandler};

use std::sync::Arc;

use async_trait::async_trait;
use tracing::warn;

use crate::proxy::session::Context;
use crate::Result;

/// Result action from a handler hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Pass control to the next handler in the chain
    Continue,
    /// The handler has fully processed the event (e.g. forwarded it)
    Handled,
    /// Discard the connection or packet
    Drop,
}

/// Packet flow direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Client to proxy
    Inbound,
    /// Backend to client
    Outbound,
}

/// A connection-lifecycle handler.
///
/// An `Err` from `on_connect`/`on_packet` is equivalent to `Drop` with a
/// logged reason. `on_disconnect` cannot fail and is called on every
/// handler regardless of earlier results.
#[async_trait]
pub trait Handler: Send + Sync {
    /// Handler name for logging and configuration.
    fn name(&self) -> &'static str;

    /// Called once when a new connection is established (first Initial with
    /// a parsed ClientHello). Routers set context values here; terminal
    /// handlers claim the connection.
    async fn on_connect(&self, ctx: &Arc<Context>) -> Result<Action>;

    /// Called for each datagram after the connection is established.
    async fn on_packet(&self, ctx: &Arc<Context>, packet: &[u8], dir: Direction) -> Result<Action> {
        let _ = (ctx, packet, dir);
        Ok(Action::Continue)
    }

    /// Called when the connection ends. Used for cleanup.
    async fn on_disconnect(&self, ctx: &Arc<Context>) {
        let _ = ctx;
    }

    /// Called once at proxy shutdown, after all sessions are gone.
    async fn shutdown(&self) {}
}

/// An ordered, immutable list of handlers.
pub struct Chain {
    handlers: Vec<Arc<dyn Handler>>,
}

impl std::fmt::Debug for Chain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Chain")
            .field("handlers", &self.handlers.iter().map(|h| h.name()).collect::<Vec<_>>())
            .finish()
    }
}

impl Chain {
    pub fn new(handlers: Vec<Arc<dyn Handler>>) -> Self {
        Self { handlers }
    }

    /// Runs `on_connect` left to right, stopping at the first handler that
    /// does not `Continue`. An unclaimed connection drops.
    pub async fn on_connect(&self, ctx: &Arc<Context>) -> Action {
        for handler in &self.handlers {
            match handler.on_connect(ctx).await {
                Ok(Action::Continue) => continue,
                Ok(action) => return action,
                Err(e) => {
                    warn!("{}: connect rejected: {}", handler.name(), e);
                    return Action::Drop;
                }
            }
        }
        Action::Drop
    }

    /// Runs `on_packet` left to right with the same stop semantics as
    /// `on_connect`.
    pub async fn on_packet(&self, ctx: &Arc<Context>, packet: &[u8], dir: Direction) -> Action {
        for handler in &self.handlers {
            match handler.on_packet(ctx, packet, dir).await {
                Ok(Action::Continue) => continue,
                Ok(action) => return action,
                Err(e) => {
                    warn!("{}: packet dropped: {}", handler.name(), e);
                    return Action::Drop;
                }
            }
        }
        Action::Drop
    }

    /// Notifies every handler of disconnection, in chain order.
    pub async fn on_disconnect(&self, ctx: &Arc<Context>) {
        for handler in &self.handlers {
            handler.on_disconnect(ctx).await;
        }
    }

    /// Runs every handler's shutdown hook, in chain order.
    pub async fn shutdown(&self) {
        for handler in &self.handlers {
            handler.shutdown().await;
        }
    }

    pub fn handlers(&self) -> &[Arc<dyn Handler>] {
        &self.handlers
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}
