//! QUIC echo server for manual testing: accepts any connection with a
//! self-signed certificate and echoes every bidirectional stream.

use std::net::SocketAddr;
use std::sync::Arc;

use clap::Parser;
use quinn::{Endpoint, IdleTimeout, ServerConfig, TransportConfig};
use rustls::pki_types::{CertificateDer, PrivatePkcs8KeyDer};
use tracing::{error, info, warn};

use hyproxy::utils::tracing::log_subscriber;
use hyproxy::{HyproxyError, Result};

const PROTOCOL: &str = "quic-echo";

#[derive(Parser)]
#[command(name = "hyproxy-echo", about = "QUIC echo server")]
struct Cli {
    /// Listen address
    #[arg(long, default_value = "127.0.0.1:4433")]
    listen: SocketAddr,
    /// ALPN protocols to accept
    #[arg(long, default_values_t = vec![PROTOCOL.to_string(), "hytale".to_string()])]
    alpn: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let _logger = tracing::subscriber::set_default(log_subscriber("info"));
    let cli = Cli::parse();

    let endpoint = Endpoint::server(server_config(&cli.alpn)?, cli.listen)?;
    info!("Echo server listening on {}", endpoint.local_addr()?);
    info!("Protocols: {}", cli.alpn.join(", "));

    loop {
        tokio::select! {
            incoming = endpoint.accept() => {
                let Some(incoming) = incoming else { break };
                tokio::spawn(async move {
                    match incoming.await {
                        Ok(conn) => handle_connection(conn).await,
                        Err(e) => warn!("Handshake failed: {}", e),
                    }
                });
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down...");
                endpoint.close(0u32.into(), b"bye");
                break;
            }
        }
    }

    endpoint.wait_idle().await;
    Ok(())
}

async fn handle_connection(conn: quinn::Connection) {
    info!("Connection from {}", conn.remote_address());

    loop {
        match conn.accept_bi().await {
            Ok((send, recv)) => {
                tokio::spawn(handle_stream(send, recv));
            }
            Err(e) => {
                info!("Connection {} closed: {}", conn.remote_address(), e);
                return;
            }
        }
    }
}

async fn handle_stream(mut send: quinn::SendStream, mut recv: quinn::RecvStream) {
    let id = recv.id();
    info!("Stream {} opened", id);

    match tokio::io::copy(&mut recv, &mut send).await {
        Ok(n) => {
            let _ = send.finish();
            info!("Stream {} closed (echoed {} bytes)", id, n);
        }
        Err(e) => error!("Stream {} error: {}", id, e),
    }
}

/// Builds a server config around a freshly generated self-signed
/// certificate.
fn server_config(alpn: &[String]) -> Result<ServerConfig> {
    let cert = rcgen::generate_simple_self_signed(vec![
        "localhost".to_string(),
        "echo.local".to_string(),
    ])
    .map_err(|e| HyproxyError::config_error(format!("Failed to generate certificate: {e}")))?;

    let cert_der = CertificateDer::from(cert.cert);
    let key_der = PrivatePkcs8KeyDer::from(cert.key_pair.serialize_der());

    let mut crypto = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(vec![cert_der], key_der.into())
        .map_err(|e| HyproxyError::config_error(format!("Invalid TLS configuration: {e}")))?;
    crypto.alpn_protocols = alpn.iter().map(|p| p.as_bytes().to_vec()).collect();

    let crypto = quinn::crypto::rustls::QuicServerConfig::try_from(crypto)
        .map_err(|e| HyproxyError::config_error(format!("Failed to create QUIC crypto: {e}")))?;
    let mut config = ServerConfig::with_crypto(Arc::new(crypto));

    let mut transport = TransportConfig::default();
    transport.max_idle_timeout(Some(
        IdleTimeout::try_from(std::time::Duration::from_secs(60)).expect("valid idle timeout"),
    ));
    config.transport_config(Arc::new(transport));

    Ok(config)
}
