use std::collections::VecDeque;
use std::net::SocketAddr;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::Mutex;

use crate::signaling::DatagramSocket;

/// Datagram boundary double: records everything sent and serves injected
/// datagrams through `poll_incoming`.
pub struct TrackingDatagramSocket {
    sent: Mutex<Vec<(SocketAddr, Bytes)>>,
    inbound: std::sync::Mutex<VecDeque<(SocketAddr, Bytes)>>,
}

impl TrackingDatagramSocket {
    pub fn new() -> TrackingDatagramSocket {
        TrackingDatagramSocket {
            sent: Mutex::new(Vec::new()),
            inbound: std::sync::Mutex::new(VecDeque::new()),
        }
    }

    /// Makes a datagram available to the next `poll_incoming` call.
    pub async fn inject(&self, src: SocketAddr, bytes: Bytes) {
        self.inbound.lock().expect("inbound lock poisoned").push_back((src, bytes));
    }

    /// Drains and returns everything sent so far.
    pub async fn take_sent(&self) -> Vec<(SocketAddr, Bytes)> {
        std::mem::take(&mut *self.sent.lock().await)
    }
}

impl Default for TrackingDatagramSocket {
    fn default() -> TrackingDatagramSocket {
        TrackingDatagramSocket::new()
    }
}

#[async_trait]
impl DatagramSocket for TrackingDatagramSocket {
    async fn send_datagram(&self, bytes: Bytes, dest: SocketAddr) -> anyhow::Result<()> {
        self.sent.lock().await.push((dest, bytes));
        Ok(())
    }

    fn poll_incoming(&self) -> Vec<(SocketAddr, Bytes)> {
        self.inbound.lock().expect("inbound lock poisoned").drain(..).collect()
    }
}
