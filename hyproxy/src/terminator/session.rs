//! Stream bridging for terminated connections.
//!
//! Every bidirectional stream the client opens gets a matching stream to
//! the backend and two pump tasks. With packet logging enabled, a pump
//! decodes the framed protocol and re-emits each frame byte-identically;
//! otherwise it is a plain byte copy.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use quinn::{Connection, RecvStream, SendStream, VarInt};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::protocol::{ConnectPacket, DisconnectPacket, Packet, PacketReader, PacketWriter};
use crate::protocol::{PACKET_CONNECT, PACKET_DISCONNECT};
use crate::Result;

/// Per-direction packet logging settings.
#[derive(Debug, Clone, Copy)]
pub struct BridgeConfig {
    /// Client→backend packets to log (0 disables decoding entirely)
    pub log_client_packets: u64,
    /// Backend→client packets to log
    pub log_server_packets: u64,
    /// Client packets to skip before logging starts
    pub skip_client_packets: u64,
    /// Server packets to skip before logging starts
    pub skip_server_packets: u64,
    /// Frames larger than this are forwarded without being logged
    pub max_packet_size: usize,
}

/// One terminated client connection bridged to its backend connection.
pub struct TerminatorSession {
    pub id: u64,
    client: Connection,
    server: Connection,
    config: BridgeConfig,
    client_seen: Arc<AtomicU64>,
    server_seen: Arc<AtomicU64>,
}

impl TerminatorSession {
    pub fn new(id: u64, client: Connection, server: Connection, config: BridgeConfig) -> Arc<Self> {
        Arc::new(Self {
            id,
            client,
            server,
            config,
            client_seen: Arc::new(AtomicU64::new(0)),
            server_seen: Arc::new(AtomicU64::new(0)),
        })
    }

    /// Accepts client streams and bridges them until either connection
    /// closes. Blocks for the life of the session.
    pub async fn bridge(self: &Arc<Self>) {
        let mut pumps = JoinSet::new();

        loop {
            tokio::select! {
                accepted = self.client.accept_bi() => {
                    let (client_send, client_recv) = match accepted {
                        Ok(streams) => streams,
                        Err(e) => {
                            debug!("session {}: client connection ended: {}", self.id, e);
                            self.server.close(VarInt::from_u32(0), b"client closed");
                            break;
                        }
                    };

                    let (server_send, server_recv) = match self.server.open_bi().await {
                        Ok(streams) => streams,
                        Err(e) => {
                            warn!("session {}: backend stream open failed: {}", self.id, e);
                            self.client.close(VarInt::from_u32(0), b"backend closed");
                            break;
                        }
                    };

                    let session = Arc::clone(self);
                    pumps.spawn(async move {
                        session
                            .pump(
                                client_recv,
                                server_send,
                                "client",
                                Arc::clone(&session.client_seen),
                                session.config.skip_client_packets,
                                session.config.log_client_packets,
                            )
                            .await;
                    });

                    let session = Arc::clone(self);
                    pumps.spawn(async move {
                        session
                            .pump(
                                server_recv,
                                client_send,
                                "server",
                                Arc::clone(&session.server_seen),
                                session.config.skip_server_packets,
                                session.config.log_server_packets,
                            )
                            .await;
                    });
                }
                _ = self.server.closed() => {
                    debug!("session {}: backend connection ended", self.id);
                    self.client.close(VarInt::from_u32(0), b"backend closed");
                    break;
                }
            }
        }

        while pumps.join_next().await.is_some() {}
    }

    /// Closes both sides immediately.
    pub fn close(&self) {
        self.client.close(VarInt::from_u32(0), b"shutdown");
        self.server.close(VarInt::from_u32(0), b"shutdown");
    }

    async fn pump(
        &self,
        recv: RecvStream,
        send: SendStream,
        label: &'static str,
        seen: Arc<AtomicU64>,
        skip: u64,
        log_count: u64,
    ) {
        let result = if log_count == 0 {
            Self::pump_raw(recv, send).await
        } else {
            self.pump_frames(recv, send, label, seen, skip, log_count)
                .await
        };

        if let Err(e) = result {
            debug!("session {}: {} pump ended: {}", self.id, label, e);
        }
    }

    /// Plain byte copy; used whenever logging is off for a direction.
    async fn pump_raw(mut recv: RecvStream, mut send: SendStream) -> Result<()> {
        tokio::io::copy(&mut recv, &mut send).await?;
        let _ = send.finish();
        Ok(())
    }

    /// Frame-aware copy: decodes each packet, logs the configured window,
    /// and re-emits the frame unchanged.
    async fn pump_frames(
        &self,
        recv: RecvStream,
        send: SendStream,
        label: &'static str,
        seen: Arc<AtomicU64>,
        skip: u64,
        log_count: u64,
    ) -> Result<()> {
        let mut reader = PacketReader::new(recv);
        let mut writer = PacketWriter::new(send);

        loop {
            match reader.read_packet_ref().await? {
                Some((id, data)) => {
                    let n = seen.fetch_add(1, Ordering::Relaxed);
                    if n >= skip && n < skip + log_count {
                        if data.len() <= self.config.max_packet_size {
                            self.log_packet(label, n, id, data);
                        } else {
                            debug!(
                                "session {}: {} packet {} oversized ({} bytes), not logged",
                                self.id,
                                label,
                                n,
                                data.len()
                            );
                        }
                    }
                    writer.write(id, data).await?;
                }
                None => break,
            }
        }

        let mut send = writer.into_inner();
        let _ = send.finish();
        Ok(())
    }

    fn log_packet(&self, label: &'static str, n: u64, id: u32, data: &[u8]) {
        let name = Packet::name(id);
        let name = if name.is_empty() { "?" } else { name };
        info!(
            "session {}: {} #{} {:#010x} {} ({} bytes)",
            self.id,
            label,
            n,
            id,
            name,
            data.len()
        );

        match id {
            PACKET_CONNECT => match crate::protocol::decompress(data)
                .map_err(crate::error::HyproxyError::from)
                .and_then(|raw| ConnectPacket::parse(&raw).map_err(Into::into))
            {
                Ok(connect) => info!(
                    "session {}: connect user={:?} uuid={} lang={:?} hash={}",
                    self.id,
                    connect.username,
                    connect.uuid_string(),
                    connect.language,
                    &connect.protocol_hash_hex()[..16],
                ),
                Err(e) => debug!("session {}: connect packet undecodable: {}", self.id, e),
            },
            PACKET_DISCONNECT => {
                let reason = DisconnectPacket::parse(data).reason;
                info!("session {}: disconnect reason={:?}", self.id, reason);
            }
            _ => {}
        }
    }
}
