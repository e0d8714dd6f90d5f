//! Shared scaffolding for end-to-end tests: real quinn backends, an
//! insecure client endpoint, and a proxy bootstrapped from JSON handler
//! configuration.
#![allow(dead_code)] // not every test binary uses every helper

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use quinn::{ClientConfig, Endpoint, IdleTimeout, ServerConfig, TransportConfig};
use rustls::pki_types::{CertificateDer, PrivatePkcs8KeyDer};

use hyproxy::crypto::NoVerifier;
use hyproxy::{Proxy, ProxyConfig, Registry};

/// Builds a quinn server config with a fresh self-signed certificate.
pub fn server_config(alpn: &[&str]) -> ServerConfig {
    let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
    let cert_der = CertificateDer::from(cert.cert);
    let key_der = PrivatePkcs8KeyDer::from(cert.key_pair.serialize_der());

    let mut crypto = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(vec![cert_der], key_der.into())
        .unwrap();
    crypto.alpn_protocols = alpn.iter().map(|p| p.as_bytes().to_vec()).collect();

    let mut config = ServerConfig::with_crypto(Arc::new(
        quinn::crypto::rustls::QuicServerConfig::try_from(crypto).unwrap(),
    ));
    config.transport_config(Arc::new(transport_config()));
    config
}

/// Client config that accepts any certificate.
pub fn insecure_client_config(alpn: &[&str]) -> ClientConfig {
    let mut crypto = rustls::ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(NoVerifier::new()))
        .with_no_client_auth();
    crypto.alpn_protocols = alpn.iter().map(|p| p.as_bytes().to_vec()).collect();

    let mut config = ClientConfig::new(Arc::new(
        quinn::crypto::rustls::QuicClientConfig::try_from(crypto).unwrap(),
    ));
    config.transport_config(Arc::new(transport_config()));
    config
}

fn transport_config() -> TransportConfig {
    let mut transport = TransportConfig::default();
    transport.max_idle_timeout(Some(
        IdleTimeout::try_from(Duration::from_secs(10)).unwrap(),
    ));
    transport
}

pub fn client_endpoint() -> Endpoint {
    Endpoint::client("127.0.0.1:0".parse().unwrap()).unwrap()
}

/// Starts a backend that echoes every bidirectional stream.
pub fn spawn_echo_backend(alpn: &'static [&'static str]) -> SocketAddr {
    spawn_backend(alpn, None)
}

/// Starts a backend that reads a whole stream and answers `tag:data`,
/// letting tests tell backends apart.
pub fn spawn_tag_backend(alpn: &'static [&'static str], tag: &'static str) -> SocketAddr {
    spawn_backend(alpn, Some(tag))
}

fn spawn_backend(alpn: &'static [&'static str], tag: Option<&'static str>) -> SocketAddr {
    let endpoint = Endpoint::server(server_config(alpn), "127.0.0.1:0".parse().unwrap()).unwrap();
    let addr = endpoint.local_addr().unwrap();

    tokio::spawn(async move {
        while let Some(incoming) = endpoint.accept().await {
            tokio::spawn(async move {
                let Ok(conn) = incoming.await else { return };
                loop {
                    let Ok((mut send, mut recv)) = conn.accept_bi().await else {
                        return;
                    };
                    tokio::spawn(async move {
                        match tag {
                            Some(tag) => {
                                let Ok(data) = recv.read_to_end(1024 * 1024).await else {
                                    return;
                                };
                                let mut reply = tag.as_bytes().to_vec();
                                reply.push(b':');
                                reply.extend_from_slice(&data);
                                let _ = send.write_all(&reply).await;
                                let _ = send.finish();
                            }
                            None => {
                                let _ = tokio::io::copy(&mut recv, &mut send).await;
                                let _ = send.finish();
                            }
                        }
                    });
                }
            });
        }
    });

    addr
}

/// Builds and runs a proxy from a JSON handler list. Returns the proxy,
/// its public address, and the run task.
pub async fn start_proxy(
    handlers: serde_json::Value,
    idle_timeout_s: u64,
) -> (Arc<Proxy>, SocketAddr, tokio::task::JoinHandle<()>) {
    let config = ProxyConfig {
        listen: "127.0.0.1:0".to_string(),
        log_level: "info".to_string(),
        idle_timeout_s,
        handlers: serde_json::from_value(handlers).unwrap(),
    };

    let registry = Registry::with_builtins();
    let proxy = Arc::new(Proxy::from_config(&config, &registry).await.unwrap());
    let addr = proxy.local_addr().unwrap();

    let runner = {
        let proxy = Arc::clone(&proxy);
        tokio::spawn(async move {
            proxy.run().await.unwrap();
        })
    };

    (proxy, addr, runner)
}

/// Writes a self-signed certificate and key to unique temp paths.
pub fn write_cert(tag: &str) -> (PathBuf, PathBuf) {
    let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
    let dir = std::env::temp_dir();
    let cert_path = dir.join(format!("hyproxy-e2e-{tag}-{}.crt", std::process::id()));
    let key_path = dir.join(format!("hyproxy-e2e-{tag}-{}.key", std::process::id()));
    std::fs::write(&cert_path, cert.cert.pem()).unwrap();
    std::fs::write(&key_path, cert.key_pair.serialize_pem()).unwrap();
    (cert_path, key_path)
}
