use std::net::SocketAddr;
use std::time::Duration;

use anyhow::bail;

/// Tuning knobs for a [crate::MessageSocket] and the streams it owns. Most applications should
///  start from [SocketConfig::default_ipv4] and only adjust the bind address.
pub struct SocketConfig {
    /// The local address the UDP socket binds to. Servers bind the well-known port they are
    ///  reachable on; clients usually bind port 0 and let the OS pick.
    pub self_addr: SocketAddr,

    /// Serialization version handed to the registry for all traffic this socket originates.
    ///  Inbound streams are decoded with version 0 since the framing carries no version field.
    pub protocol_version: u8,

    /// This is the payload size inside UDP datagrams that the protocol assumes. Since frames
    ///  are never fragmented at the protocol level, this size (and the implied packet size)
    ///  must be supported by all network links between the peers.
    ///
    /// In an ideal world, we would configure the MTU (or even discover it) and derive the
    ///  payload size from that, but there is some uncertainty involved (e.g. optional IP
    ///  headers that may be introduced by some network hardware). Therefore the responsibility
    ///  of determining UDP payload size stays with the application rather than this crate
    ///  making assumptions on its own.
    ///
    /// With full Ethernet frames and no optional IP headers, this payload is
    ///  `1500 - 20 - 8 = 1472` for IPV4. Choosing the value too big causes datagrams to be
    ///  dropped; choosing it too small wastes bandwidth and splits pending items across more
    ///  retransmission frames than necessary.
    pub max_datagram_bytes: usize,

    /// Initial retry interval for unacknowledged frames.
    pub min_retry_interval: Duration,

    /// Upper bound for the retry interval.
    pub max_retry_interval: Duration,

    /// Linear increment applied to the retry interval after every retransmission.
    pub retry_interval_step: Duration,

    /// Consecutive unacknowledged send attempts before a peer is declared dead and the stream
    ///  ends unilaterally.
    pub max_send_attempts: u32,

    /// Attempt bound applied once a stream is closing locally - there is no point in pushing
    ///  a close handshake against a dead peer for the full ladder.
    pub max_send_attempts_closing: u32,
}

impl SocketConfig {
    pub fn default_ipv4(self_addr: SocketAddr) -> SocketConfig {
        SocketConfig {
            self_addr,
            protocol_version: 0,
            max_datagram_bytes: 1472,
            min_retry_interval: Duration::from_millis(500),
            max_retry_interval: Duration::from_millis(3000),
            retry_interval_step: Duration::from_millis(500),
            max_send_attempts: 10,
            max_send_attempts_closing: 5,
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_datagram_bytes < 16 {
            bail!("datagram payload size is too small to hold a frame header and a terminator");
        }
        if self.min_retry_interval.is_zero() {
            bail!("the retry interval must not be zero");
        }
        if self.max_retry_interval < self.min_retry_interval {
            bail!("the maximum retry interval must not be smaller than the initial one");
        }
        if self.max_send_attempts == 0 || self.max_send_attempts_closing == 0 {
            bail!("at least one send attempt is required");
        }
        if self.max_send_attempts_closing > self.max_send_attempts {
            bail!("the attempt bound while closing must not exceed the regular attempt bound");
        }
        Ok(())
    }
}
