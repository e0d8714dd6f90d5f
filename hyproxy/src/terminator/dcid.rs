//! DCID-latching UDP socket for the terminator's internal listener.
//!
//! The terminator needs to correlate an accepted quinn connection (known by
//! remote address) with the session the outer handler chain saw (known by
//! the DCID of the client's first Initial). This wrapper sits under the
//! quinn endpoint and records the first DCID observed per remote address.
//! First write wins: QUIC peers rotate connection ids during the handshake,
//! and only the first one matches what `on_connect` extracted.

use std::io::{self, IoSliceMut};
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use dashmap::DashMap;
use quinn::udp::{RecvMeta, Transmit};
use quinn::{AsyncUdpSocket, UdpPoller};

use crate::quic::parse_dcid;

/// Wraps the runtime's UDP socket, latching `remote address → DCID hex`.
#[derive(Debug)]
pub struct DcidTracker {
    inner: Arc<dyn AsyncUdpSocket>,
    by_addr: DashMap<SocketAddr, String>,
}

impl DcidTracker {
    pub fn new(inner: Arc<dyn AsyncUdpSocket>) -> Self {
        Self {
            inner,
            by_addr: DashMap::new(),
        }
    }

    /// The DCID latched for a remote address, if any.
    pub fn get(&self, addr: SocketAddr) -> Option<String> {
        self.by_addr.get(&addr).map(|entry| entry.value().clone())
    }

    /// Removes the mapping for a remote address.
    pub fn remove(&self, addr: SocketAddr) {
        self.by_addr.remove(&addr);
    }

    pub fn len(&self) -> usize {
        self.by_addr.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_addr.is_empty()
    }

    /// Records the DCID of a received datagram, first write wins.
    fn latch(&self, addr: SocketAddr, datagram: &[u8]) {
        if let Some(dcid) = parse_dcid(datagram) {
            self.by_addr.entry(addr).or_insert(dcid);
        }
    }
}

impl AsyncUdpSocket for DcidTracker {
    fn create_io_poller(self: Arc<Self>) -> Pin<Box<dyn UdpPoller>> {
        self.inner.clone().create_io_poller()
    }

    fn try_send(&self, transmit: &Transmit<'_>) -> io::Result<()> {
        self.inner.try_send(transmit)
    }

    fn poll_recv(
        &self,
        cx: &mut Context<'_>,
        bufs: &mut [IoSliceMut<'_>],
        meta: &mut [RecvMeta],
    ) -> Poll<io::Result<usize>> {
        let count = std::task::ready!(self.inner.poll_recv(cx, bufs, meta))?;
        for i in 0..count {
            // With GRO a single entry can carry several datagrams back to
            // back; the first stride is enough to see the long header.
            let first = meta[i].stride.min(meta[i].len).min(bufs[i].len());
            self.latch(meta[i].addr, &bufs[i][..first]);
        }
        Poll::Ready(Ok(count))
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.local_addr()
    }

    fn max_transmit_segments(&self) -> usize {
        self.inner.max_transmit_segments()
    }

    fn max_receive_segments(&self) -> usize {
        self.inner.max_receive_segments()
    }

    fn may_fragment(&self) -> bool {
        self.inner.may_fragment()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn initial_packet(dcid: &[u8]) -> Vec<u8> {
        let mut packet = vec![0xC0, 0x00, 0x00, 0x00, 0x01];
        packet.push(dcid.len() as u8);
        packet.extend_from_slice(dcid);
        packet.push(0x00);
        packet.extend_from_slice(&[0u8; 64]);
        packet
    }

    fn tracker() -> DcidTracker {
        // Latch logic does not touch the inner socket; wrap a throwaway.
        let socket = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        socket.set_nonblocking(true).unwrap();
        let runtime: Arc<dyn quinn::Runtime> = Arc::new(quinn::TokioRuntime);
        DcidTracker::new(runtime.wrap_udp_socket(socket).unwrap())
    }

    #[tokio::test]
    async fn first_dcid_wins() {
        let tracker = tracker();
        let addr: SocketAddr = "10.0.0.1:5000".parse().unwrap();

        tracker.latch(addr, &initial_packet(&[0xAA, 0xBB]));
        tracker.latch(addr, &initial_packet(&[0xCC, 0xDD]));

        assert_eq!(tracker.get(addr).as_deref(), Some("aabb"));
    }

    #[tokio::test]
    async fn short_header_not_latched() {
        let tracker = tracker();
        let addr: SocketAddr = "10.0.0.1:5000".parse().unwrap();

        tracker.latch(addr, &[0x40u8; 64]);
        assert_eq!(tracker.get(addr), None);
        assert!(tracker.is_empty());
    }

    #[tokio::test]
    async fn remove_clears_entry() {
        let tracker = tracker();
        let addr: SocketAddr = "10.0.0.1:5000".parse().unwrap();

        tracker.latch(addr, &initial_packet(&[0x01, 0x02, 0x03, 0x04]));
        assert_eq!(tracker.len(), 1);

        tracker.remove(addr);
        assert_eq!(tracker.get(addr), None);
        assert!(tracker.is_empty());
    }

    #[tokio::test]
    async fn distinct_addresses_tracked_separately() {
        let tracker = tracker();
        let a: SocketAddr = "10.0.0.1:5000".parse().unwrap();
        let b: SocketAddr = "10.0.0.2:6000".parse().unwrap();

        tracker.latch(a, &initial_packet(&[0x11]));
        tracker.latch(b, &initial_packet(&[0x22]));

        assert_eq!(tracker.get(a).as_deref(), Some("11"));
        assert_eq!(tracker.get(b).as_deref(), Some("22"));
    }
}
