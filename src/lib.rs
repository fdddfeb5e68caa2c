//! Reliable, ordered delivery of typed messages over UDP.
//!
//! This crate layers a connection-oriented, message-based protocol on top of plain UDP
//!  datagrams. It trades TCP's machinery (byte streams, windowed flow control, kernel
//!  connection state) for a much smaller protocol that moves whole application messages and
//!  keeps per-connection state minimal.
//!
//! ## Design goals
//!
//! * The abstraction is sending / receiving *typed messages* (defined-length values known to a
//!   serialization registry) as opposed to streams of bytes
//! * One local UDP socket serves either role:
//!   * as a client with a single outbound connection, or
//!   * as a server accepting many inbound connections, keyed by the remote address
//!   * the two modes are disjoint per socket - a connecting socket does not accept
//! * Messages on a connection are delivered reliably and in order; the wire level is
//!   at-least-once, with duplicates discarded by the receiver, so the application sees each
//!   message exactly once
//! * Acknowledgements are piggybacked: every outbound frame carries the highest sequence
//!   number observed from the peer, so a busy connection sends no dedicated ack traffic
//! * Near-simultaneous state changes are coalesced into a single datagram - enqueue several
//!   messages in one scheduler tick, get one frame
//! * Retransmission uses a bounded linear back-off; a peer that stays silent through the whole
//!   ladder is declared dead and the connection is torn down locally
//! * Connection setup is a single message: the first item on a new inbound stream is handed to
//!   an application callback that accepts (returning per-connection user data) or rejects
//! * Graceful shutdown drains pending messages before signalling close, and degrades to a
//!   unilateral teardown if the peer stops responding
//! * Connectionless messages ride on the same socket for discovery-style traffic, including
//!   local-network broadcast
//!
//! ## Wire format
//!
//! Every datagram starts with a one-byte tag; all protocol integers are in network byte
//!  order (BE):
//!
//! ```ascii
//! 0:    tag (u8): 0 = GENERAL, 1 = STREAM
//! 1..:  payload
//! ```
//!
//! A GENERAL payload is a single registry-encoded message; the encoding is self-describing,
//!  starting with the message's type id.
//!
//! A STREAM payload is one frame of a reliable connection:
//!
//! ```ascii
//! 0:  ack (u16): highest sequence number observed from the peer, or FFFF once the
//!      sender has torn the connection down - the receiver must end its side immediately
//! 2:  repeated:
//!       seq (u16): 0 terminates the item list; FFFF terminates it *and* signals that
//!        the sender is closing with no further items beyond those already in this frame
//!       item:      registry-encoded message, present iff seq is neither 0 nor FFFF
//! ```
//!
//! Sequence numbers start at 1 and increase monotonically; 0 and FFFF are reserved. The close
//!  sentinel is only written after the *complete* pending queue fitted into the frame, so it
//!  is a true end-of-stream marker and never overtakes data.
//!
//! ## Retransmission
//!
//! A frame containing unacknowledged items (or the close sentinel) is re-sent until the peer
//!  acknowledges it, with the retry interval growing linearly from 500ms to a 3s cap. After
//!  ten unacknowledged attempts (five while closing, a single one after the peer announced its
//!  own close) the connection ends unilaterally and the application is notified exactly once.

pub mod config;
pub mod datagram;
pub mod frame;
pub mod oracle;
pub mod socket;
pub mod stream;
pub mod test_util;

pub use config::SocketConfig;
pub use oracle::{Message, MessageOracle, MessageTypeId};
pub use socket::MessageSocket;
pub use stream::Stream;
