//! Per-connection session state and the typed handler context.

use std::any::Any;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, LazyLock, RwLock};
use std::time::{Duration, Instant};

use tokio::net::UdpSocket;

use crate::quic::ClientHello;

/// Well-known context key: the routing target, `host:port`.
pub const KEY_BACKEND: &str = "backend";
/// Well-known context key: the connection's SNI.
pub const KEY_SNI: &str = "sni";
/// Well-known context key: the connection's first offered ALPN.
pub const KEY_ALPN: &str = "alpn";

/// Process-wide monotonic epoch for session activity stamps.
static EPOCH: LazyLock<Instant> = LazyLock::new(Instant::now);

fn now_millis() -> u64 {
    EPOCH.elapsed().as_millis() as u64
}

/// Shared per-connection state handed to every handler hook.
///
/// The value map is string-keyed and type-opaque; handlers communicate
/// through it (routers write `backend`, the forwarder reads it). Reads and
/// writes may happen concurrently; last write wins.
///
/// The context also carries the connection's liveness: the forwarder's
/// relay task touches it on backend traffic and closes it on failure, and
/// the demux sweeper acts on both.
pub struct Context {
    /// The client's source address on the public socket
    pub client_addr: SocketAddr,
    /// The public listener socket, used to send datagrams back to the client
    pub socket: Arc<UdpSocket>,
    /// The raw first datagram, stored for DCID extraction and replay
    pub initial_packet: Option<Vec<u8>>,
    /// The parsed ClientHello, when the Initial decrypted cleanly
    pub hello: Option<ClientHello>,

    values: RwLock<HashMap<String, Box<dyn Any + Send + Sync>>>,
    /// Milliseconds against the process epoch; only ever increases
    last_activity: AtomicU64,
    closed: AtomicBool,
}

impl Context {
    pub fn new(client_addr: SocketAddr, socket: Arc<UdpSocket>) -> Self {
        Self {
            client_addr,
            socket,
            initial_packet: None,
            hello: None,
            values: RwLock::new(HashMap::new()),
            last_activity: AtomicU64::new(now_millis()),
            closed: AtomicBool::new(false),
        }
    }

    /// Stores a value under `key`, replacing any previous value.
    pub fn set<T: Any + Send + Sync>(&self, key: &str, value: T) {
        self.values
            .write()
            .expect("context lock poisoned")
            .insert(key.to_owned(), Box::new(value));
    }

    /// Type-safe retrieval: returns a clone of the value if `key` exists and
    /// holds a `T`.
    pub fn get<T: Any + Send + Sync + Clone>(&self, key: &str) -> Option<T> {
        self.values
            .read()
            .expect("context lock poisoned")
            .get(key)
            .and_then(|v| v.downcast_ref::<T>())
            .cloned()
    }

    /// Untyped string read: returns the empty string when the key is missing
    /// or holds a different type.
    pub fn get_string(&self, key: &str) -> String {
        self.get::<String>(key).unwrap_or_default()
    }

    /// Records activity now. Monotonic: a stale touch never moves the stamp
    /// backwards.
    pub fn touch(&self) {
        self.last_activity.fetch_max(now_millis(), Ordering::Relaxed);
    }

    /// Raw activity stamp in epoch milliseconds.
    pub fn last_activity(&self) -> u64 {
        self.last_activity.load(Ordering::Relaxed)
    }

    /// Time since the last recorded activity.
    pub fn idle_duration(&self) -> Duration {
        Duration::from_millis(now_millis().saturating_sub(self.last_activity()))
    }

    /// Marks the connection dead so the sweeper evicts it on its next pass.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Relaxed);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Relaxed)
    }
}

/// One session per (client address, initial DCID).
pub struct Session {
    /// Immutable session id, unique for the lifetime of the proxy
    pub id: u64,
    /// The demux table key this session lives under
    pub key: SessionKey,
    pub ctx: Arc<Context>,
    created: Instant,
}

impl Session {
    pub fn new(id: u64, key: SessionKey, ctx: Arc<Context>) -> Self {
        Self {
            id,
            key,
            ctx,
            created: Instant::now(),
        }
    }

    pub fn touch(&self) {
        self.ctx.touch();
    }

    pub fn idle_duration(&self) -> Duration {
        self.ctx.idle_duration()
    }

    pub fn is_closed(&self) -> bool {
        self.ctx.is_closed()
    }

    pub fn age(&self) -> Duration {
        self.created.elapsed()
    }
}

/// Session table key: client address plus the hex DCID of the first Initial.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionKey {
    pub addr: SocketAddr,
    pub dcid: String,
}
