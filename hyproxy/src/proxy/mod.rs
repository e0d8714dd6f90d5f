//! Connection demultiplexer.
//!
//! One public UDP socket serves every client. The first Initial from a new
//! (address, DCID) pair is decrypted and its ClientHello parsed, a session
//! is created, and the handler chain decides its fate. Later datagrams are
//! matched back to their session and run through the chain per packet. A
//! background sweeper evicts idle and dead sessions.

pub mod bufpool;
pub mod session;

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::config::ProxyConfig;
use crate::constants::SWEEP_INTERVAL;
use crate::handler::{Action, Chain, Direction, Registry};
use crate::quic::{decrypt_initial, parse_client_hello, parse_dcid, PacketType};
use crate::Result;

use self::bufpool::BufferPool;
use self::session::{Context, Session, SessionKey, KEY_ALPN, KEY_SNI};

/// The public-endpoint demultiplexer and session table.
pub struct Proxy {
    socket: Arc<UdpSocket>,
    chain: Chain,
    idle_timeout: Duration,

    /// (client address, DCID) → session; insertions on first Initial
    sessions: DashMap<SessionKey, Arc<Session>>,
    /// Address fallback for short-header packets and rotated CIDs;
    /// first session per address wins
    by_addr: DashMap<SocketAddr, Arc<Session>>,

    next_id: AtomicU64,
    pool: BufferPool,
    shutdown: watch::Sender<bool>,
}

impl Proxy {
    /// Binds the public socket and assembles the proxy.
    pub async fn bind(listen: &str, chain: Chain, idle_timeout: Duration) -> Result<Self> {
        let socket = UdpSocket::bind(listen).await?;
        info!("listening on {}", socket.local_addr()?);

        let (shutdown, _) = watch::channel(false);
        Ok(Self {
            socket: Arc::new(socket),
            chain,
            idle_timeout,
            sessions: DashMap::new(),
            by_addr: DashMap::new(),
            next_id: AtomicU64::new(1),
            pool: BufferPool::default(),
            shutdown,
        })
    }

    /// Builds the chain from configuration and binds.
    pub async fn from_config(config: &ProxyConfig, registry: &Registry) -> Result<Self> {
        let chain = registry.build_chain(&config.handlers)?;
        Self::bind(
            &config.listen,
            chain,
            Duration::from_secs(config.idle_timeout_s),
        )
        .await
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Runs the receive loop until [`Proxy::shutdown`] is called. On return
    /// every session has been torn down and handler shutdown hooks have run.
    pub async fn run(self: Arc<Self>) -> Result<()> {
        let sweeper = {
            let proxy = Arc::clone(&self);
            tokio::spawn(async move { proxy.sweep_loop().await })
        };

        let mut shutdown_rx = self.shutdown.subscribe();
        loop {
            if *shutdown_rx.borrow() {
                break;
            }
            let mut buf = self.pool.get();
            tokio::select! {
                received = self.socket.recv_from(&mut buf) => {
                    match received {
                        Ok((len, src)) => self.handle_datagram(&buf[..len], src).await,
                        Err(e) => {
                            warn!("recv error: {}", e);
                            continue;
                        }
                    }
                    self.pool.put(buf);
                }
                _ = shutdown_rx.changed() => break,
            }
        }

        sweeper.abort();
        self.teardown_all().await;
        self.chain.shutdown().await;
        info!("proxy stopped");
        Ok(())
    }

    /// Signals the receive loop to stop. `run` completes the teardown.
    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
    }

    async fn handle_datagram(&self, data: &[u8], src: SocketAddr) {
        let Some(class) = PacketType::classify(data) else {
            return;
        };
        let dcid = match class {
            PacketType::Short => None,
            _ => parse_dcid(data),
        };

        // Exact key first, then the by-address fallback: short headers carry
        // no readable DCID, and long headers rotate to the server-chosen CID
        // after the first flight.
        let existing = dcid
            .as_ref()
            .and_then(|dcid| {
                self.sessions.get(&SessionKey {
                    addr: src,
                    dcid: dcid.clone(),
                })
            })
            .map(|entry| entry.value().clone())
            .or_else(|| self.by_addr.get(&src).map(|entry| entry.value().clone()));

        if let Some(session) = existing {
            if session.is_closed() {
                return;
            }
            session.touch();
            let action = self
                .chain
                .on_packet(&session.ctx, data, Direction::Inbound)
                .await;
            if action == Action::Drop {
                self.teardown(&session).await;
            }
            return;
        }

        // No session: only a decryptable Initial may create one
        if class != PacketType::Initial {
            return;
        }
        let Some(dcid) = dcid else {
            return;
        };

        let initial = match decrypt_initial(data) {
            Ok(initial) => initial,
            Err(e) => {
                debug!("initial from {} dropped: {}", src, e);
                return;
            }
        };
        let hello = match parse_client_hello(&initial.payload) {
            Ok(hello) => hello,
            Err(e) => {
                debug!("client hello from {} dropped: {}", src, e);
                return;
            }
        };

        let mut ctx = Context::new(src, Arc::clone(&self.socket));
        ctx.initial_packet = Some(data.to_vec());
        ctx.set(KEY_SNI, hello.sni.clone());
        if let Some(alpn) = hello.alpn.first() {
            ctx.set(KEY_ALPN, alpn.clone());
        }
        ctx.hello = Some(hello);
        let ctx = Arc::new(ctx);

        let key = SessionKey {
            addr: src,
            dcid: dcid.clone(),
        };
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let session = Arc::new(Session::new(id, key.clone(), Arc::clone(&ctx)));

        self.sessions.insert(key, Arc::clone(&session));
        self.by_addr
            .entry(src)
            .or_insert_with(|| Arc::clone(&session));

        info!(
            "session {}: {} sni={:?} dcid={}",
            id,
            src,
            session.ctx.hello.as_ref().map(|h| h.sni.as_str()).unwrap_or(""),
            &dcid[..dcid.len().min(8)],
        );

        if self.chain.on_connect(&ctx).await == Action::Drop {
            debug!("session {} dropped by chain", id);
            self.teardown(&session).await;
        }
    }

    /// Removes a session from both tables and fires `on_disconnect` exactly
    /// once, on whichever caller actually removed it.
    async fn teardown(&self, session: &Arc<Session>) {
        let Some((_, removed)) = self.sessions.remove(&session.key) else {
            return;
        };
        self.by_addr
            .remove_if(&session.key.addr, |_, s| Arc::ptr_eq(s, session));

        removed.ctx.close();
        self.chain.on_disconnect(&removed.ctx).await;
        debug!("session {} closed", removed.id);
    }

    async fn teardown_all(&self) {
        let sessions: Vec<_> = self
            .sessions
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        for session in sessions {
            self.teardown(&session).await;
        }
    }

    /// Periodically evicts sessions that died or went idle.
    async fn sweep_loop(self: Arc<Self>) {
        let interval = SWEEP_INTERVAL.min(self.idle_timeout / 2).max(Duration::from_millis(250));
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            let expired: Vec<_> = self
                .sessions
                .iter()
                .filter(|entry| {
                    entry.value().is_closed() || entry.value().idle_duration() >= self.idle_timeout
                })
                .map(|entry| Arc::clone(entry.value()))
                .collect();

            for session in expired {
                debug!(
                    "session {} evicted (idle {:?})",
                    session.id,
                    session.idle_duration()
                );
                self.teardown(&session).await;
            }
        }
    }
}
