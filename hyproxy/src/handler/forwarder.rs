//! Transparent UDP forwarder.
//!
//! The terminal handler of a forwarding chain: on connect it opens a
//! connected UDP socket toward the backend selected by the routers, replays
//! the client's first datagram, and starts the backend→client relay. Every
//! subsequent inbound datagram the chain hands it is written straight
//! through. Any I/O error on either direction closes the flow; the demux
//! sweeper then tears the session down.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::constants::{IDLE_TIMEOUT, UDP_BUFFER_SIZE};
use crate::error::HandlerError;
use crate::handler::{Action, Direction, Handler};
use crate::proxy::session::{Context, KEY_BACKEND};
use crate::Result;

/// Context key under which the forwarder stores its flow state.
const KEY_FLOW: &str = "forwarder.flow";

/// One live forward flow: the connected backend socket and the relay task.
struct Flow {
    backend: Arc<UdpSocket>,
    relay: JoinHandle<()>,
}

impl Drop for Flow {
    fn drop(&mut self) {
        self.relay.abort();
    }
}

fn default_idle_timeout_s() -> u64 {
    IDLE_TIMEOUT.as_secs()
}

#[derive(Debug, Deserialize)]
struct ForwarderConfig {
    #[serde(default = "default_idle_timeout_s")]
    idle_timeout_s: u64,
}

impl Default for ForwarderConfig {
    fn default() -> Self {
        Self {
            idle_timeout_s: default_idle_timeout_s(),
        }
    }
}

/// Bidirectional datagram relay between a client and its routed backend.
pub struct ForwarderHandler {
    idle_timeout: Duration,
}

impl ForwarderHandler {
    pub fn factory(config: serde_json::Value) -> Result<Arc<dyn Handler>> {
        let cfg: ForwarderConfig = if config.is_null() {
            ForwarderConfig::default()
        } else {
            serde_json::from_value(config)?
        };
        Ok(Arc::new(ForwarderHandler {
            idle_timeout: Duration::from_secs(cfg.idle_timeout_s),
        }))
    }

    async fn resolve(backend: &str) -> Result<SocketAddr> {
        tokio::net::lookup_host(backend)
            .await
            .ok()
            .and_then(|mut addrs| addrs.next())
            .ok_or_else(|| {
                HandlerError::BackendUnreachable {
                    address: backend.to_owned(),
                    reason: "address resolution failed".into(),
                }
                .into()
            })
    }

    /// Relays datagrams from the backend socket to the client through the
    /// public listener socket. Exits when the flow has been idle in both
    /// directions for the idle timeout, or on any I/O error.
    fn spawn_relay(&self, ctx: Arc<Context>, backend: Arc<UdpSocket>) -> JoinHandle<()> {
        let idle_timeout = self.idle_timeout;
        tokio::spawn(async move {
            let mut buf = vec![0u8; UDP_BUFFER_SIZE];
            loop {
                match tokio::time::timeout(idle_timeout, backend.recv(&mut buf)).await {
                    Ok(Ok(n)) => {
                        if let Err(e) = ctx.socket.send_to(&buf[..n], ctx.client_addr).await {
                            debug!("[forwarder] client write failed for {}: {}", ctx.client_addr, e);
                            break;
                        }
                        ctx.touch();
                    }
                    Ok(Err(e)) => {
                        debug!("[forwarder] backend read failed for {}: {}", ctx.client_addr, e);
                        break;
                    }
                    Err(_) => {
                        // No backend traffic for a full window; only give up
                        // if the client has been quiet too.
                        if ctx.idle_duration() >= idle_timeout {
                            debug!("[forwarder] {} idle, closing", ctx.client_addr);
                            break;
                        }
                    }
                }
            }
            ctx.close();
        })
    }
}

#[async_trait]
impl Handler for ForwarderHandler {
    fn name(&self) -> &'static str {
        "forwarder"
    }

    async fn on_connect(&self, ctx: &Arc<Context>) -> Result<Action> {
        let backend = ctx.get_string(KEY_BACKEND);
        if backend.is_empty() {
            return Err(HandlerError::NoBackend.into());
        }

        let backend_addr = Self::resolve(&backend).await?;
        let bind_addr: SocketAddr = if backend_addr.is_ipv6() {
            "[::]:0".parse().unwrap()
        } else {
            "0.0.0.0:0".parse().unwrap()
        };

        let socket = UdpSocket::bind(bind_addr).await?;
        socket
            .connect(backend_addr)
            .await
            .map_err(|e| HandlerError::BackendUnreachable {
                address: backend.clone(),
                reason: e.to_string(),
            })?;
        let socket = Arc::new(socket);

        // Replay the datagram that created the session
        if let Some(initial) = &ctx.initial_packet {
            socket.send(initial).await?;
        }

        let relay = self.spawn_relay(ctx.clone(), socket.clone());
        ctx.set(
            KEY_FLOW,
            Arc::new(Flow {
                backend: socket,
                relay,
            }),
        );

        info!("[forwarder] {} → {}", ctx.client_addr, backend_addr);
        Ok(Action::Handled)
    }

    async fn on_packet(&self, ctx: &Arc<Context>, packet: &[u8], dir: Direction) -> Result<Action> {
        if dir != Direction::Inbound {
            return Ok(Action::Continue);
        }

        let Some(flow) = ctx.get::<Arc<Flow>>(KEY_FLOW) else {
            return Ok(Action::Drop);
        };

        if ctx.is_closed() {
            return Ok(Action::Drop);
        }

        if let Err(e) = flow.backend.send(packet).await {
            warn!("[forwarder] backend write failed for {}: {}", ctx.client_addr, e);
            ctx.close();
            return Ok(Action::Drop);
        }

        Ok(Action::Handled)
    }

    async fn on_disconnect(&self, ctx: &Arc<Context>) {
        if let Some(flow) = ctx.get::<Arc<Flow>>(KEY_FLOW) {
            flow.relay.abort();
            debug!("[forwarder] flow closed for {}", ctx.client_addr);
        }
    }
}
