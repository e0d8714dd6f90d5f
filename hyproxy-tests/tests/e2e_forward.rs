//! End-to-end tests for the transparent forwarding path.

mod common;

use std::time::Duration;

use serde_json::json;

use common::{client_endpoint, insecure_client_config, spawn_echo_backend, spawn_tag_backend, start_proxy};

const ALPN: &[&str] = &["hytale"];

#[tokio::test]
async fn simple_forward_roundtrip() {
    let backend = spawn_echo_backend(ALPN);
    let (proxy, addr, runner) = start_proxy(
        json!([
            { "type": "simple-router", "config": { "backend": backend.to_string() } },
            { "type": "forwarder" }
        ]),
        30,
    )
    .await;

    let client = client_endpoint();
    let conn = client
        .connect_with(insecure_client_config(ALPN), addr, "localhost")
        .unwrap()
        .await
        .expect("connect through proxy");

    let (mut send, mut recv) = conn.open_bi().await.unwrap();
    send.write_all(b"hello").await.unwrap();
    send.finish().unwrap();

    let echoed = recv.read_to_end(1024).await.unwrap();
    assert_eq!(echoed, b"hello");

    conn.close(0u32.into(), b"done");
    proxy.shutdown();
    runner.await.unwrap();
}

#[tokio::test]
async fn sni_routing_reaches_intended_backend() {
    let play = spawn_tag_backend(ALPN, "play");
    let lobby = spawn_tag_backend(ALPN, "lobby");

    let (proxy, addr, runner) = start_proxy(
        json!([
            { "type": "logsni" },
            {
                "type": "sni-router",
                "config": {
                    "routes": {
                        "play.example.com": play.to_string(),
                        "lobby.example.com": lobby.to_string()
                    }
                }
            },
            { "type": "forwarder" }
        ]),
        30,
    )
    .await;

    let client = client_endpoint();

    for (sni, expected) in [
        ("play.example.com", "play:ping"),
        ("lobby.example.com", "lobby:ping"),
    ] {
        let conn = client
            .connect_with(insecure_client_config(ALPN), addr, sni)
            .unwrap()
            .await
            .unwrap_or_else(|e| panic!("connect with SNI {sni}: {e}"));

        let (mut send, mut recv) = conn.open_bi().await.unwrap();
        send.write_all(b"ping").await.unwrap();
        send.finish().unwrap();

        let reply = recv.read_to_end(1024).await.unwrap();
        assert_eq!(reply, expected.as_bytes(), "SNI {sni}");
        conn.close(0u32.into(), b"done");
    }

    proxy.shutdown();
    runner.await.unwrap();
}

#[tokio::test]
async fn unknown_sni_gets_no_response() {
    let play = spawn_tag_backend(ALPN, "play");

    let (proxy, addr, runner) = start_proxy(
        json!([
            {
                "type": "sni-router",
                "config": { "routes": { "play.example.com": play.to_string() } }
            },
            { "type": "forwarder" }
        ]),
        30,
    )
    .await;

    let client = client_endpoint();
    let connecting = client
        .connect_with(insecure_client_config(ALPN), addr, "x.example.com")
        .unwrap();

    // The proxy drops the Initial on the floor; the handshake cannot
    // complete.
    let result = tokio::time::timeout(Duration::from_secs(2), connecting).await;
    assert!(
        match &result {
            Err(_elapsed) => true,
            Ok(Err(_)) => true,
            Ok(Ok(_)) => false,
        },
        "expected no connection for unknown SNI"
    );
    assert_eq!(proxy.session_count(), 0);

    proxy.shutdown();
    runner.await.unwrap();
}

#[tokio::test]
async fn empty_chain_drops_everything() {
    let (proxy, addr, runner) = start_proxy(json!([]), 30).await;

    let client = client_endpoint();
    let connecting = client
        .connect_with(insecure_client_config(ALPN), addr, "localhost")
        .unwrap();

    let result = tokio::time::timeout(Duration::from_secs(2), connecting).await;
    assert!(matches!(result, Err(_) | Ok(Err(_))));
    assert_eq!(proxy.session_count(), 0);

    proxy.shutdown();
    runner.await.unwrap();
}

#[tokio::test]
async fn idle_session_is_evicted() {
    let backend = spawn_echo_backend(ALPN);
    let (proxy, addr, runner) = start_proxy(
        json!([
            { "type": "simple-router", "config": { "backend": backend.to_string() } },
            { "type": "forwarder", "config": { "idle_timeout_s": 1 } }
        ]),
        1,
    )
    .await;

    let client = client_endpoint();
    let conn = client
        .connect_with(insecure_client_config(ALPN), addr, "localhost")
        .unwrap()
        .await
        .expect("connect through proxy");

    assert_eq!(proxy.session_count(), 1);

    // Fall silent for twice the idle timeout
    tokio::time::sleep(Duration::from_millis(2500)).await;
    assert_eq!(proxy.session_count(), 0);

    // Datagrams that are not a fresh Initial create no new state
    let raw = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
    raw.send_to(&[0x40u8; 64], addr).await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(proxy.session_count(), 0);

    conn.close(0u32.into(), b"done");
    proxy.shutdown();
    runner.await.unwrap();
}
