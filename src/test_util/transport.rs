use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::datagram::DatagramSocket;

/// A [DatagramSocket] that records every outbound datagram instead of touching the network,
///  for asserting on the exact wire traffic a test produced.
#[derive(Debug)]
pub struct RecordingDatagramSocket {
    local_addr: SocketAddr,
    broadcast_enabled: AtomicBool,
    sent: Mutex<Vec<(SocketAddr, Vec<u8>)>>,
}

impl RecordingDatagramSocket {
    pub fn new() -> RecordingDatagramSocket {
        RecordingDatagramSocket {
            local_addr: SocketAddr::from(([127, 0, 0, 1], 7777)),
            broadcast_enabled: AtomicBool::new(false),
            sent: Mutex::new(Vec::new()),
        }
    }

    /// Remove and return everything sent so far.
    pub fn take_sent(&self) -> Vec<(SocketAddr, Vec<u8>)> {
        std::mem::take(&mut self.sent.lock().unwrap())
    }

    pub fn num_sent(&self) -> usize {
        self.sent.lock().unwrap().len()
    }

    pub fn is_broadcast_enabled(&self) -> bool {
        self.broadcast_enabled.load(Ordering::SeqCst)
    }

    pub fn assert_nothing_sent(&self) {
        let sent = self.sent.lock().unwrap();
        assert!(sent.is_empty(), "expected no datagrams, but found {:?}", sent);
    }
}

impl Default for RecordingDatagramSocket {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DatagramSocket for RecordingDatagramSocket {
    async fn send_datagram(&self, to: SocketAddr, buf: &[u8]) {
        self.sent.lock().unwrap().push((to, buf.to_vec()));
    }

    fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    fn set_broadcast(&self, enabled: bool) -> anyhow::Result<()> {
        self.broadcast_enabled.store(enabled, Ordering::SeqCst);
        Ok(())
    }
}
