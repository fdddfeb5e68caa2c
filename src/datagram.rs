use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use tokio::net::UdpSocket;
use tracing::{error, trace};

/// This is an abstraction for sending a datagram on a UDP socket, introduced to facilitate
///  mocking the I/O part away for testing.
///
/// Send failures are logged and swallowed: UDP gives no delivery guarantee anyway, and the
///  retransmission machinery treats a failed send exactly like a lost datagram.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait DatagramSocket: Send + Sync + 'static {
    async fn send_datagram(&self, to: SocketAddr, buf: &[u8]);

    fn local_addr(&self) -> SocketAddr;

    fn set_broadcast(&self, enabled: bool) -> anyhow::Result<()>;
}

#[async_trait]
impl DatagramSocket for Arc<UdpSocket> {
    async fn send_datagram(&self, to: SocketAddr, buf: &[u8]) {
        trace!("UDP socket: sending datagram to {:?}", to);

        if let Err(e) = self.send_to(buf, to).await {
            error!("error sending UDP datagram to {:?}: {}", to, e);
        }
    }

    fn local_addr(&self) -> SocketAddr {
        self.as_ref().local_addr()
            .expect("UdpSocket should have an initialized local addr")
    }

    fn set_broadcast(&self, enabled: bool) -> anyhow::Result<()> {
        self.as_ref().set_broadcast(enabled)?;
        Ok(())
    }
}
