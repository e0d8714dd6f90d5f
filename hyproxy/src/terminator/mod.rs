//! TLS-terminating handler.
//!
//! Runs an internal QUIC listener with the proxy's own certificate. The
//! outer chain redirects a routed connection here by rewriting its
//! `backend` to the internal address; the forwarder then relays the
//! client's datagrams into the listener. When quinn accepts the connection,
//! the DCID latched by the tracker correlates it back to the backend the
//! routers chose, the terminator dials that backend as a QUIC client, and
//! the application streams are bridged in cleartext.

pub mod dcid;
pub mod session;

pub use dcid::DcidTracker;
pub use session::{BridgeConfig, TerminatorSession};

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use quinn::{Connection, Endpoint, IdleTimeout, TokioRuntime, TransportConfig, VarInt};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use serde::Deserialize;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::constants::{DEFAULT_LOG_MAX_PACKET_SIZE, DIAL_TIMEOUT, IDLE_TIMEOUT};
use crate::crypto::NoVerifier;
use crate::error::{HandlerError, HyproxyError};
use crate::handler::{Action, Handler};
use crate::proxy::session::{Context, KEY_BACKEND};
use crate::quic::parse_dcid;
use crate::Result;

/// Application close code: the accepted connection could not be correlated.
const CLOSE_NO_CORRELATION: u32 = 0x01;
/// Application close code: the backend could not be dialed.
const CLOSE_BACKEND_UNREACHABLE: u32 = 0x02;

fn default_listen() -> String {
    "auto".to_string()
}

fn default_alpn() -> Vec<String> {
    vec!["hytale".to_string()]
}

fn default_max_packet_size() -> usize {
    DEFAULT_LOG_MAX_PACKET_SIZE
}

/// Terminator handler configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct TerminatorConfig {
    /// Internal listener address; "auto" or empty binds an ephemeral
    /// localhost port
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Path to the TLS certificate chain (PEM)
    pub cert: String,
    /// Path to the TLS private key (PEM)
    pub key: String,
    /// ALPN protocols the internal listener accepts. rustls offers no
    /// per-ClientHello config hook, so the original's offer-mirroring is
    /// approximated by configuration; the negotiated protocol is still
    /// forwarded to the backend verbatim.
    #[serde(default = "default_alpn")]
    pub alpn: Vec<String>,
    /// Present the same certificate as a client certificate to backends
    #[serde(default)]
    pub backend_mtls: bool,

    /// Client→backend packets to log (0 = disabled)
    #[serde(default)]
    pub log_client_packets: u64,
    /// Backend→client packets to log (0 = disabled)
    #[serde(default)]
    pub log_server_packets: u64,
    /// Client packets to skip before logging
    #[serde(default)]
    pub skip_client_packets: u64,
    /// Server packets to skip before logging
    #[serde(default)]
    pub skip_server_packets: u64,
    /// Packets larger than this are forwarded un-logged
    #[serde(default = "default_max_packet_size")]
    pub max_packet_size: usize,
}

impl TerminatorConfig {
    fn bridge_config(&self) -> BridgeConfig {
        BridgeConfig {
            log_client_packets: self.log_client_packets,
            log_server_packets: self.log_server_packets,
            skip_client_packets: self.skip_client_packets,
            skip_server_packets: self.skip_server_packets,
            max_packet_size: self.max_packet_size,
        }
    }
}

/// Terminates QUIC connections and bridges them to backends.
pub struct TerminatorHandler {
    config: TerminatorConfig,
    endpoint: Endpoint,
    client_endpoint: Endpoint,
    tracker: Arc<DcidTracker>,
    internal_addr: SocketAddr,

    certs: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,

    /// DCID (hex) → backend address; one-shot entries written by
    /// `on_connect` and taken by the accept path
    backends: DashMap<String, String>,

    sessions: DashMap<u64, Arc<TerminatorSession>>,
    session_count: AtomicU64,
    accept_task: std::sync::Mutex<Option<JoinHandle<()>>>,
}

/// Transport tuning shared by both sides of the terminator.
fn transport_config() -> TransportConfig {
    let mut transport = TransportConfig::default();
    transport.max_idle_timeout(Some(
        IdleTimeout::try_from(IDLE_TIMEOUT).expect("idle timeout within range"),
    ));
    transport
}

fn load_certs(path: &str) -> Result<Vec<CertificateDer<'static>>> {
    let file = std::fs::File::open(path).map_err(|e| {
        HyproxyError::config_error(format!("Failed to open cert file {path:?}: {e}"))
    })?;
    let mut reader = std::io::BufReader::new(file);
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| HyproxyError::config_error(format!("Failed to parse certificates: {e}")))?;
    if certs.is_empty() {
        return Err(HyproxyError::config_error(format!(
            "No certificates found in {path:?}"
        )));
    }
    Ok(certs)
}

fn load_key(path: &str) -> Result<PrivateKeyDer<'static>> {
    let file = std::fs::File::open(path).map_err(|e| {
        HyproxyError::config_error(format!("Failed to open key file {path:?}: {e}"))
    })?;
    let mut reader = std::io::BufReader::new(file);
    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| HyproxyError::config_error(format!("Failed to parse private key: {e}")))?
        .ok_or_else(|| HyproxyError::config_error(format!("No private key found in {path:?}")))
}

fn resolve_listen(listen: &str) -> Result<SocketAddr> {
    let addr = match listen {
        "" | "auto" => "127.0.0.1:0".to_string(),
        addr if addr.starts_with(':') => format!("0.0.0.0{addr}"),
        addr => addr.to_string(),
    };
    addr.parse()
        .map_err(|e| HyproxyError::config_error(format!("Invalid listen address {listen:?}: {e}")))
}

impl TerminatorHandler {
    /// Registry entry point.
    pub fn factory(config: serde_json::Value) -> Result<Arc<dyn Handler>> {
        let config: TerminatorConfig = serde_json::from_value(config)?;
        Ok(Self::new(config)?)
    }

    /// Builds the handler, binds the internal listener, and starts its
    /// accept loop. Must be called within a Tokio runtime.
    pub fn new(config: TerminatorConfig) -> Result<Arc<TerminatorHandler>> {
        let certs = load_certs(&config.cert)?;
        let key = load_key(&config.key)?;
        if config.backend_mtls {
            info!("[terminator] backend mTLS enabled");
        }

        let mut server_crypto = rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs.clone(), key.clone_key())
            .map_err(|e| HyproxyError::config_error(format!("Invalid TLS configuration: {e}")))?;
        server_crypto.alpn_protocols = config.alpn.iter().map(|p| p.as_bytes().to_vec()).collect();

        let server_crypto = quinn::crypto::rustls::QuicServerConfig::try_from(server_crypto)
            .map_err(|e| {
                HyproxyError::config_error(format!("Failed to create QUIC server crypto: {e}"))
            })?;
        let mut server_config = quinn::ServerConfig::with_crypto(Arc::new(server_crypto));
        server_config.transport_config(Arc::new(transport_config()));

        // The internal listener sits on a tracker-wrapped socket so the
        // first DCID per remote address is retrievable at accept time.
        let udp = std::net::UdpSocket::bind(resolve_listen(&config.listen)?)?;
        udp.set_nonblocking(true)?;
        let runtime: Arc<dyn quinn::Runtime> = Arc::new(TokioRuntime);
        let tracker = Arc::new(DcidTracker::new(runtime.wrap_udp_socket(udp)?));

        let endpoint = Endpoint::new_with_abstract_socket(
            quinn::EndpointConfig::default(),
            Some(server_config),
            Arc::clone(&tracker) as Arc<dyn quinn::AsyncUdpSocket>,
            runtime,
        )?;
        let internal_addr = endpoint.local_addr()?;

        let client_endpoint = Endpoint::client("0.0.0.0:0".parse().unwrap())?;

        let handler = Arc::new(TerminatorHandler {
            config,
            endpoint,
            client_endpoint,
            tracker,
            internal_addr,
            certs,
            key,
            backends: DashMap::new(),
            sessions: DashMap::new(),
            session_count: AtomicU64::new(0),
            accept_task: std::sync::Mutex::new(None),
        });

        info!("[terminator] internal listener on {}", internal_addr);

        let accept = {
            let handler = Arc::clone(&handler);
            tokio::spawn(async move { handler.accept_loop().await })
        };
        *handler.accept_task.lock().expect("accept task lock") = Some(accept);

        Ok(handler)
    }

    /// The internal listener's address; the outer forwarder redirects
    /// terminated connections here.
    pub fn internal_addr(&self) -> SocketAddr {
        self.internal_addr
    }

    /// Registers a backend for a DCID. One-shot: taken by the accept path.
    pub fn register_backend(&self, dcid: String, backend: String) {
        self.backends.insert(dcid, backend);
    }

    /// Removes a registration that never completed correlation.
    pub fn unregister_backend(&self, dcid: &str) {
        self.backends.remove(dcid);
    }

    #[cfg(test)]
    fn registered_backend(&self, dcid: &str) -> Option<String> {
        self.backends.get(dcid).map(|entry| entry.value().clone())
    }

    async fn accept_loop(self: Arc<Self>) {
        debug!("[terminator] accept loop started");
        while let Some(incoming) = self.endpoint.accept().await {
            let handler = Arc::clone(&self);
            tokio::spawn(async move {
                let remote = incoming.remote_address();
                match incoming.await {
                    Ok(conn) => handler.handle_connection(conn).await,
                    Err(e) => debug!("[terminator] handshake from {} failed: {}", remote, e),
                }
            });
        }
        debug!("[terminator] accept loop ended");
    }

    /// Correlates an accepted connection to its pre-registered backend and
    /// bridges them.
    async fn handle_connection(self: Arc<Self>, client: Connection) {
        let remote = client.remote_address();

        let Some(dcid) = self.tracker.get(remote) else {
            warn!("[terminator] no DCID mapping for {}", remote);
            client.close(VarInt::from_u32(CLOSE_NO_CORRELATION), b"no dcid mapping");
            return;
        };

        let Some((_, backend)) = self.backends.remove(&dcid) else {
            warn!(
                "[terminator] no backend for DCID {}",
                &dcid[..dcid.len().min(8)]
            );
            self.tracker.remove(remote);
            client.close(VarInt::from_u32(CLOSE_NO_CORRELATION), b"no backend");
            return;
        };

        // Single-shot correlation: both entries are gone from here on
        self.tracker.remove(remote);

        let (sni, alpn) = handshake_identity(&client);

        let server = match self.dial_backend(&backend, &sni, alpn.as_deref()).await {
            Ok(conn) => conn,
            Err(e) => {
                warn!("[terminator] dial backend {} failed: {}", backend, e);
                client.close(
                    VarInt::from_u32(CLOSE_BACKEND_UNREACHABLE),
                    b"backend unreachable",
                );
                return;
            }
        };

        if client.close_reason().is_some() {
            server.close(VarInt::from_u32(0), b"client gone");
            return;
        }

        let id = self.session_count.fetch_add(1, Ordering::Relaxed) + 1;
        let session = TerminatorSession::new(id, client, server, self.config.bridge_config());
        self.sessions.insert(id, Arc::clone(&session));

        info!(
            "[terminator] session {}: {} ↔ {} (ALPN={})",
            id,
            sni,
            backend,
            alpn.as_deref().unwrap_or("")
        );

        session.bridge().await;

        self.sessions.remove(&id);
        info!("[terminator] session {} closed", id);
    }

    /// Dials the backend as a QUIC client: verification disabled, SNI
    /// passed through, ALPN pinned to the negotiated protocol, optional
    /// client certificate.
    async fn dial_backend(
        &self,
        backend: &str,
        sni: &str,
        alpn: Option<&str>,
    ) -> Result<Connection> {
        let addr = tokio::net::lookup_host(backend)
            .await
            .ok()
            .and_then(|mut addrs| addrs.next())
            .ok_or_else(|| HandlerError::BackendUnreachable {
                address: backend.to_owned(),
                reason: "address resolution failed".into(),
            })?;

        let builder = rustls::ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(NoVerifier::new()));
        let mut client_crypto = if self.config.backend_mtls {
            builder
                .with_client_auth_cert(self.certs.clone(), self.key.clone_key())
                .map_err(|e| {
                    HyproxyError::config_error(format!("Invalid client certificate: {e}"))
                })?
        } else {
            builder.with_no_client_auth()
        };
        if let Some(alpn) = alpn {
            client_crypto.alpn_protocols = vec![alpn.as_bytes().to_vec()];
        }

        let client_crypto =
            quinn::crypto::rustls::QuicClientConfig::try_from(client_crypto).map_err(|e| {
                HyproxyError::config_error(format!("Failed to create QUIC client crypto: {e}"))
            })?;
        let mut client_config = quinn::ClientConfig::new(Arc::new(client_crypto));
        client_config.transport_config(Arc::new(transport_config()));

        // rustls needs a syntactically valid server name even with
        // verification off; fall back to the backend host when the client
        // sent no SNI.
        let server_name = if sni.is_empty() {
            backend.rsplit_once(':').map(|(host, _)| host).unwrap_or("localhost")
        } else {
            sni
        };

        let connecting = self
            .client_endpoint
            .connect_with(client_config, addr, server_name)
            .map_err(|e| HandlerError::BackendUnreachable {
                address: backend.to_owned(),
                reason: e.to_string(),
            })?;

        let connection = tokio::time::timeout(DIAL_TIMEOUT, connecting)
            .await
            .map_err(|_| HandlerError::BackendUnreachable {
                address: backend.to_owned(),
                reason: format!("dial timed out after {}s", DIAL_TIMEOUT.as_secs()),
            })?
            .map_err(|e| HandlerError::BackendUnreachable {
                address: backend.to_owned(),
                reason: e.to_string(),
            })?;

        Ok(connection)
    }
}

/// SNI and negotiated ALPN from an accepted connection's TLS state.
fn handshake_identity(conn: &Connection) -> (String, Option<String>) {
    let Some(data) = conn.handshake_data() else {
        return (String::new(), None);
    };
    match data.downcast::<quinn::crypto::rustls::HandshakeData>() {
        Ok(data) => (
            data.server_name.unwrap_or_default(),
            data.protocol
                .and_then(|p| String::from_utf8(p).ok()),
        ),
        Err(_) => (String::new(), None),
    }
}

#[async_trait]
impl Handler for TerminatorHandler {
    fn name(&self) -> &'static str {
        "terminator"
    }

    /// Stores the DCID → backend mapping and redirects the connection into
    /// the internal listener.
    async fn on_connect(&self, ctx: &Arc<Context>) -> Result<Action> {
        let backend = ctx.get_string(KEY_BACKEND);
        if backend.is_empty() {
            return Err(HandlerError::NoBackend.into());
        }

        let dcid = ctx
            .initial_packet
            .as_deref()
            .and_then(parse_dcid)
            .ok_or(HandlerError::NoDcid)?;

        self.register_backend(dcid.clone(), backend.clone());

        let sni = ctx
            .hello
            .as_ref()
            .map(|h| h.sni.as_str())
            .unwrap_or_default();
        info!(
            "[terminator] {} (dcid={}) → {} (via {})",
            sni,
            &dcid[..dcid.len().min(8)],
            backend,
            self.internal_addr
        );

        ctx.set(KEY_BACKEND, self.internal_addr.to_string());
        Ok(Action::Continue)
    }

    /// Cleans up the registration when the connection never reached the
    /// internal listener.
    async fn on_disconnect(&self, ctx: &Arc<Context>) {
        if let Some(dcid) = ctx.initial_packet.as_deref().and_then(parse_dcid) {
            self.unregister_backend(&dcid);
        }
    }

    async fn shutdown(&self) {
        self.endpoint.close(VarInt::from_u32(0), b"shutdown");
        self.client_endpoint.close(VarInt::from_u32(0), b"shutdown");

        for session in self.sessions.iter() {
            session.close();
        }

        let task = self.accept_task.lock().expect("accept task lock").take();
        if let Some(task) = task {
            let _ = tokio::time::timeout(std::time::Duration::from_secs(5), task).await;
        }
        let _ = tokio::time::timeout(
            std::time::Duration::from_secs(5),
            self.endpoint.wait_idle(),
        )
        .await;
        debug!("[terminator] shut down");
    }
}
