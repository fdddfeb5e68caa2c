use std::cmp::min;
use std::collections::VecDeque;
use std::fmt::{Debug, Formatter};
use std::mem::size_of;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::{Buf, BufMut, BytesMut};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, trace, warn};

use crate::config::SocketConfig;
use crate::datagram::DatagramSocket;
use crate::frame::{FrameTag, ACK_STREAM_ENDED, SEQ_CLOSE, SEQ_END_OF_ITEMS};
use crate::oracle::{Message, MessageOracle};

/// One message enqueued on a stream. It lives here from the enqueue call until the peer
///  acknowledges its sequence number (or the stream ends and discards it).
#[derive(Debug)]
pub struct StreamItem {
    pub seq: u16,
    pub item: Box<dyn Message>,
}

/// One-shot notification that a stream has reached its terminal state.
pub type CloseCallback = Box<dyn FnOnce() + Send + Sync + 'static>;

struct StreamInner {
    myself: Weak<RwLock<StreamInner>>,
    config: Arc<SocketConfig>,
    remote: SocketAddr,
    version: u8,
    transport: Arc<dyn DatagramSocket>,
    oracle: Arc<dyn MessageOracle>,

    /// last assigned outbound sequence number; the next item gets `local_seq + 1`
    local_seq: u16,
    /// highest sequence number observed from the peer, piggybacked as the ack on every
    ///  outbound frame; [SEQ_CLOSE] once the peer announced its close
    remote_seq: u16,
    pending: VecDeque<StreamItem>,

    /// coalesced send: set while a send is scheduled for the next scheduler tick, so any
    ///  number of near-simultaneous state changes produce a single datagram
    send_task: Option<JoinHandle<()>>,
    retry_task: Option<JoinHandle<()>>,
    retry_interval: Duration,
    /// consecutive send attempts without observing any traffic from the peer
    attempts: u32,
    max_attempts: u32,

    closing: bool,
    ended: bool,
    on_close: Option<CloseCallback>,
}

impl StreamInner {
    fn schedule_send(&mut self) {
        if self.ended || self.send_task.is_some() {
            return;
        }
        let Some(inner_arc) = self.myself.upgrade() else {
            return;
        };

        self.send_task = Some(tokio::spawn(async move {
            // let the current scheduler tick finish so all state changes coalesce into one frame
            tokio::task::yield_now().await;

            let mut inner = inner_arc.write().await;
            inner.send_task = None;
            inner.do_send().await;
        }));
    }

    fn arm_retry(&mut self) {
        if let Some(handle) = self.retry_task.take() {
            handle.abort();
        }
        let Some(inner_arc) = self.myself.upgrade() else {
            return;
        };

        let delay = self.retry_interval;
        self.retry_task = Some(tokio::spawn(async move {
            time::sleep(delay).await;

            let mut inner = inner_arc.write().await;
            inner.retry_task = None;
            inner.do_send().await;
        }));

        self.retry_interval = min(
            self.retry_interval + self.config.retry_interval_step,
            self.config.max_retry_interval,
        );
    }

    fn cancel_retry(&mut self) {
        if let Some(handle) = self.retry_task.take() {
            handle.abort();
        }
    }

    async fn do_send(&mut self) {
        if self.ended {
            return;
        }

        self.attempts += 1;
        if self.attempts > self.max_attempts {
            debug!("peer {:?} did not respond to {} consecutive sends - ending stream", self.remote, self.max_attempts);
            self.end();
            return;
        }

        let mut buf = BytesMut::with_capacity(self.config.max_datagram_bytes);
        self.ser_frame(&mut buf);
        trace!("sending stream frame to {:?}: {:?}", self.remote, buf.as_ref());
        self.transport.send_datagram(self.remote, &buf).await;

        if !self.pending.is_empty() || self.closing {
            self.arm_retry();
        }
        else {
            // a pure ack needs no retransmission, and it is not an 'attempt' the peer must answer
            self.attempts = 0;
        }
    }

    /// Write one complete frame: tag, cumulative ack, as many pending items as fit, and the
    ///  terminator - the close sentinel if this stream is closing *and* the whole pending
    ///  queue fitted, the regular end-of-items marker otherwise.
    fn ser_frame(&self, buf: &mut BytesMut) {
        FrameTag::Stream.ser(buf);
        buf.put_u16(self.remote_seq);

        let mut all_items_fitted = true;
        for item in &self.pending {
            // mark / revert: an item that does not encode (or does not fit) is rolled back
            //  completely and stays pending; the truncated frame is still valid
            let mark = buf.len();
            buf.put_u16(item.seq);

            match self.oracle.encode(self.version, item.item.as_ref(), buf) {
                Ok(()) if buf.len() + size_of::<u16>() <= self.config.max_datagram_bytes => {}
                Ok(()) => {
                    trace!("frame for {:?} is full - deferring items from #{}", self.remote, item.seq);
                    buf.truncate(mark);
                    all_items_fitted = false;
                    break;
                }
                Err(e) => {
                    warn!("failed to encode item #{} for {:?} - keeping it pending: {}", item.seq, self.remote, e);
                    buf.truncate(mark);
                    all_items_fitted = false;
                    break;
                }
            }
        }

        if self.closing && all_items_fitted {
            buf.put_u16(SEQ_CLOSE);
        }
        else {
            buf.put_u16(SEQ_END_OF_ITEMS);
        }
    }

    /// Consume one inbound frame body (everything after the tag byte), returning the newly
    ///  arrived items in sequence order for the caller to dispatch.
    fn on_frame(&mut self, mut frame: &[u8]) -> Vec<Box<dyn Message>> {
        let mut delivered = Vec::new();
        if self.ended {
            return delivered;
        }

        let ack = match frame.try_get_u16() {
            Ok(ack) => ack,
            Err(_) => {
                warn!("stream frame from {:?} is too short for an ack - dropping", self.remote);
                return delivered;
            }
        };

        while let Some(front) = self.pending.front() {
            if front.seq > ack {
                break;
            }
            trace!("item #{} acknowledged by {:?}", front.seq, self.remote);
            self.pending.pop_front();
        }

        // any traffic from the peer proves it is alive
        self.attempts = 0;

        if ack == ACK_STREAM_ENDED {
            debug!("peer {:?} confirmed the close - ending stream", self.remote);
            self.end();
            return delivered;
        }

        self.retry_interval = self.config.min_retry_interval;
        self.cancel_retry();
        if !self.pending.is_empty() || self.closing {
            // the peer is reachable: re-send whatever it has not acknowledged without
            //  waiting out the back-off ladder
            self.schedule_send();
        }

        loop {
            let seq = match frame.try_get_u16() {
                Ok(seq) => seq,
                Err(_) => {
                    warn!("stream frame from {:?} ended without a terminator - dropping the rest", self.remote);
                    break;
                }
            };

            if seq == SEQ_END_OF_ITEMS {
                break;
            }
            if seq == SEQ_CLOSE {
                if self.remote_seq != SEQ_CLOSE {
                    debug!("peer {:?} is closing the stream", self.remote);
                    self.remote_seq = SEQ_CLOSE;
                    self.closing = true;
                    self.max_attempts = 1;
                    // the confirming ack must go out even if this frame carried no new items
                    self.schedule_send();
                }
                break;
            }

            let item = match self.oracle.decode(self.version, &mut frame) {
                Ok(item) => item,
                Err(e) => {
                    warn!("undecodable item #{} from {:?} - dropping the rest of the frame: {}", seq, self.remote, e);
                    break;
                }
            };

            if seq > self.remote_seq {
                self.schedule_send();
                self.remote_seq = seq;
                delivered.push(item);
            }
            else {
                trace!("duplicate item #{} from {:?} - discarding", seq, self.remote);
            }
        }

        delivered
    }

    fn end(&mut self) {
        if self.ended {
            return;
        }
        debug!("stream to {:?} has ended", self.remote);

        self.ended = true;
        self.closing = true;
        if let Some(handle) = self.send_task.take() {
            handle.abort();
        }
        if let Some(handle) = self.retry_task.take() {
            handle.abort();
        }
        self.pending.clear();

        if let Some(on_close) = self.on_close.take() {
            on_close();
        }
    }
}

/// A reliable, ordered channel to one specific remote address, layered on unreliable
///  datagrams.
///
/// All near-simultaneous state changes (enqueues, piggybacked acks, the close marker) are
///  coalesced into a single frame on the next scheduler tick; unacknowledged frames are
///  retransmitted with a linear back-off until the peer answers or the attempt bound declares
///  it dead.
pub struct Stream {
    config: Arc<SocketConfig>,
    remote: SocketAddr,
    version: u8,
    inner: Arc<RwLock<StreamInner>>,
}

impl Debug for Stream {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Stream{{remote:{:?}}}", &self.remote)
    }
}

impl Stream {
    pub(crate) fn new(
        config: Arc<SocketConfig>,
        version: u8,
        remote: SocketAddr,
        transport: Arc<dyn DatagramSocket>,
        oracle: Arc<dyn MessageOracle>,
    ) -> Stream {
        let inner = Arc::new_cyclic(|myself| RwLock::new(StreamInner {
            myself: myself.clone(),
            config: config.clone(),
            remote,
            version,
            transport,
            oracle,
            local_seq: 0,
            remote_seq: 0,
            pending: VecDeque::new(),
            send_task: None,
            retry_task: None,
            retry_interval: config.min_retry_interval,
            attempts: 0,
            max_attempts: config.max_send_attempts,
            closing: false,
            ended: false,
            on_close: None,
        }));

        Stream {
            config,
            remote,
            version,
            inner,
        }
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote
    }

    pub fn version(&self) -> u8 {
        self.version
    }

    /// Assign the next sequence number to `item` and queue it for reliable delivery. On a
    ///  closing stream this is a no-op: the peer was already promised that the close marker
    ///  is the end of the stream.
    pub async fn enqueue(&self, item: Box<dyn Message>) {
        let mut inner = self.inner.write().await;
        if inner.closing {
            debug!("enqueue on closing stream to {:?} - discarding {:?}", self.remote, item.message_type());
            return;
        }

        inner.local_seq += 1;
        let seq = inner.local_seq;
        trace!("enqueueing item #{} for {:?}", seq, self.remote);
        inner.pending.push_back(StreamItem { seq, item });
        inner.schedule_send();
    }

    /// Initiate a graceful shutdown: everything already enqueued is still delivered, followed
    ///  by the close marker; once the peer confirms, the stream ends. Idempotent.
    pub async fn close(&self) {
        let mut inner = self.inner.write().await;
        if inner.closing {
            return;
        }
        debug!("closing stream to {:?}", self.remote);

        inner.closing = true;
        inner.max_attempts = min(inner.max_attempts, self.config.max_send_attempts_closing);
        inner.schedule_send();
    }

    /// Tear the stream down locally, without further protocol traffic: cancels all scheduled
    ///  work and fires the close notification exactly once.
    pub async fn end(&self) {
        self.inner.write().await.end();
    }

    pub async fn is_closing(&self) -> bool {
        self.inner.read().await.closing
    }

    pub async fn is_ended(&self) -> bool {
        self.inner.read().await.ended
    }

    pub(crate) async fn set_on_close(&self, on_close: CloseCallback) {
        let mut inner = self.inner.write().await;
        if inner.ended {
            // the stream died before the callback was installed - still notify exactly once
            on_close();
            return;
        }
        inner.on_close = Some(on_close);
    }

    pub(crate) async fn on_frame(&self, frame: &[u8]) -> Vec<Box<dyn Message>> {
        self.inner.write().await.on_frame(frame)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::message::{BrokenMessage, PingMessage, TestOracle, TextMessage};
    use crate::test_util::transport::RecordingDatagramSocket;
    use crate::datagram::MockDatagramSocket;
    use rstest::rstest;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::runtime::Builder;

    fn peer() -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], 9999))
    }

    fn test_config() -> Arc<SocketConfig> {
        Arc::new(SocketConfig::default_ipv4(SocketAddr::from(([127, 0, 0, 1], 0))))
    }

    fn small_config(max_datagram_bytes: usize) -> Arc<SocketConfig> {
        let mut config = SocketConfig::default_ipv4(SocketAddr::from(([127, 0, 0, 1], 0)));
        config.max_datagram_bytes = max_datagram_bytes;
        Arc::new(config)
    }

    fn recording_stream(config: Arc<SocketConfig>) -> (Stream, Arc<RecordingDatagramSocket>) {
        let transport = Arc::new(RecordingDatagramSocket::new());
        let stream = Stream::new(config, 0, peer(), transport.clone(), Arc::new(TestOracle));
        (stream, transport)
    }

    async fn install_close_counter(stream: &Stream) -> Arc<AtomicU32> {
        let counter = Arc::new(AtomicU32::new(0));
        let cloned = counter.clone();
        stream.set_on_close(Box::new(move || {
            cloned.fetch_add(1, Ordering::SeqCst);
        })).await;
        counter
    }

    /// the body of a stream frame (without the datagram tag), as fed to [Stream::on_frame]
    fn frame_body(ack: u16, items: &[(u16, &str)], terminator: u16) -> Vec<u8> {
        let mut buf = BytesMut::new();
        buf.put_u16(ack);
        for (seq, text) in items {
            buf.put_u16(*seq);
            TestOracle.encode(0, &TextMessage { text: text.to_string() }, &mut buf).unwrap();
        }
        buf.put_u16(terminator);
        buf.to_vec()
    }

    /// a complete expected outbound datagram, including the tag
    fn datagram(ack: u16, items: &[(u16, &str)], terminator: u16) -> Vec<u8> {
        let mut buf = vec![FrameTag::Stream.into()];
        buf.extend_from_slice(&frame_body(ack, items, terminator));
        buf
    }

    fn texts(items: &[Box<dyn Message>]) -> Vec<String> {
        items.iter()
            .map(|m| m.as_any().downcast_ref::<TextMessage>().unwrap().text.clone())
            .collect()
    }

    fn paused_rt() -> tokio::runtime::Runtime {
        Builder::new_current_thread()
            .enable_all()
            .start_paused(true)
            .build()
            .unwrap()
    }

    /// one sleep long enough for scheduled coalesced sends to run, short enough not to
    ///  trigger the first retry
    async fn tick() {
        time::sleep(Duration::from_millis(1)).await;
    }

    #[test]
    fn test_enqueue_coalesces_into_single_frame() {
        let rt = paused_rt();
        rt.block_on(async move {
            let (stream, transport) = recording_stream(test_config());

            stream.enqueue(TextMessage::boxed("a")).await;
            stream.enqueue(TextMessage::boxed("b")).await;
            stream.enqueue(TextMessage::boxed("c")).await;
            tick().await;

            assert_eq!(
                transport.take_sent(),
                vec![(peer(), datagram(0, &[(1, "a"), (2, "b"), (3, "c")], SEQ_END_OF_ITEMS))],
            );
        });
    }

    #[test]
    fn test_enqueue_and_close_coalesce_with_sentinel() {
        let expected = datagram(0, &[(1, "a"), (2, "b")], SEQ_CLOSE);

        let mut transport = MockDatagramSocket::new();
        transport.expect_send_datagram()
            .withf(move |to, buf| *to == peer() && buf == expected.as_slice())
            .times(1)
            .return_const(());

        let rt = paused_rt();
        rt.block_on(async move {
            let stream = Stream::new(test_config(), 0, peer(), Arc::new(transport), Arc::new(TestOracle));

            stream.enqueue(TextMessage::boxed("a")).await;
            stream.enqueue(TextMessage::boxed("b")).await;
            stream.close().await;
            tick().await;

            assert_eq!(stream.inner.read().await.max_attempts, 5);
        });
    }

    #[test]
    fn test_enqueue_on_closing_stream_is_discarded() {
        let rt = paused_rt();
        rt.block_on(async move {
            let (stream, transport) = recording_stream(test_config());

            stream.close().await;
            stream.enqueue(TextMessage::boxed("late")).await;
            tick().await;

            assert_eq!(
                transport.take_sent(),
                vec![(peer(), datagram(0, &[], SEQ_CLOSE))],
            );
            assert_eq!(stream.inner.read().await.local_seq, 0);
        });
    }

    #[rstest]
    #[case::nothing_acked(0, vec![1, 2, 3])]
    #[case::first_acked(1, vec![2, 3])]
    #[case::all_acked(3, vec![])]
    #[case::ack_beyond_pending(9, vec![])]
    fn test_receive_ack_removes_pending(#[case] ack: u16, #[case] expected_pending: Vec<u16>) {
        let rt = paused_rt();
        rt.block_on(async move {
            let (stream, transport) = recording_stream(test_config());

            stream.enqueue(TextMessage::boxed("a")).await;
            stream.enqueue(TextMessage::boxed("b")).await;
            stream.enqueue(TextMessage::boxed("c")).await;
            tick().await;
            transport.take_sent();

            let delivered = stream.on_frame(&frame_body(ack, &[], SEQ_END_OF_ITEMS)).await;
            assert!(delivered.is_empty());

            let inner = stream.inner.read().await;
            let pending_seqs: Vec<u16> = inner.pending.iter().map(|i| i.seq).collect();
            assert_eq!(pending_seqs, expected_pending);
            assert_eq!(inner.attempts, 0);
        });
    }

    #[test]
    fn test_receive_delivers_in_order_and_drops_duplicates() {
        let rt = paused_rt();
        rt.block_on(async move {
            let (stream, _transport) = recording_stream(test_config());

            let first = stream.on_frame(&frame_body(0, &[(1, "a"), (2, "b")], SEQ_END_OF_ITEMS)).await;
            assert_eq!(texts(&first), vec!["a", "b"]);

            // the retransmitted frame must not be delivered again
            let second = stream.on_frame(&frame_body(0, &[(1, "a"), (2, "b")], SEQ_END_OF_ITEMS)).await;
            assert!(second.is_empty());

            // a frame overlapping old and new items delivers only the new ones
            let third = stream.on_frame(&frame_body(0, &[(2, "b"), (3, "c")], SEQ_END_OF_ITEMS)).await;
            assert_eq!(texts(&third), vec!["c"]);

            assert_eq!(stream.inner.read().await.remote_seq, 3);
        });
    }

    #[test]
    fn test_receive_schedules_pure_ack() {
        let rt = paused_rt();
        rt.block_on(async move {
            let (stream, transport) = recording_stream(test_config());

            stream.on_frame(&frame_body(0, &[(1, "a"), (2, "b")], SEQ_END_OF_ITEMS)).await;
            tick().await;

            assert_eq!(
                transport.take_sent(),
                vec![(peer(), datagram(2, &[], SEQ_END_OF_ITEMS))],
            );

            // a pure ack is not retransmitted
            time::sleep(Duration::from_secs(10)).await;
            transport.assert_nothing_sent();
        });
    }

    #[test]
    fn test_receive_duplicate_frame_has_no_side_effect_beyond_redundant_ack() {
        let rt = paused_rt();
        rt.block_on(async move {
            let (stream, transport) = recording_stream(test_config());

            stream.on_frame(&frame_body(0, &[(1, "a")], SEQ_END_OF_ITEMS)).await;
            tick().await;
            transport.take_sent();

            let delivered = stream.on_frame(&frame_body(0, &[(1, "a")], SEQ_END_OF_ITEMS)).await;
            assert!(delivered.is_empty());
            tick().await;

            // no new item, no ack to carry: the duplicate triggers nothing
            transport.assert_nothing_sent();
            assert_eq!(stream.inner.read().await.remote_seq, 1);
        });
    }

    #[test]
    fn test_retransmission_backoff_ladder() {
        let rt = paused_rt();
        rt.block_on(async move {
            let (stream, transport) = recording_stream(test_config());

            stream.enqueue(TextMessage::boxed("a")).await;
            tick().await;
            assert_eq!(transport.num_sent(), 1);

            // first retry after 500ms
            time::sleep(Duration::from_millis(490)).await;
            assert_eq!(transport.num_sent(), 1);
            time::sleep(Duration::from_millis(20)).await;
            assert_eq!(transport.num_sent(), 2);

            // second retry 1000ms later
            time::sleep(Duration::from_millis(980)).await;
            assert_eq!(transport.num_sent(), 2);
            time::sleep(Duration::from_millis(40)).await;
            assert_eq!(transport.num_sent(), 3);

            // third retry 1500ms later
            time::sleep(Duration::from_millis(1540)).await;
            assert_eq!(transport.num_sent(), 4);

            for (to, frame) in transport.take_sent() {
                assert_eq!(to, peer());
                assert_eq!(frame, datagram(0, &[(1, "a")], SEQ_END_OF_ITEMS));
            }
        });
    }

    #[test]
    fn test_receive_resets_backoff_and_resends_unacked() {
        let rt = paused_rt();
        rt.block_on(async move {
            let (stream, transport) = recording_stream(test_config());

            stream.enqueue(TextMessage::boxed("a")).await;
            stream.enqueue(TextMessage::boxed("b")).await;
            tick().await;
            // ride the ladder up: retries at +500ms and +1000ms
            time::sleep(Duration::from_millis(1600)).await;
            assert_eq!(transport.take_sent().len(), 3);

            // a partial ack proves the peer is alive: the rest goes out immediately...
            stream.on_frame(&frame_body(1, &[], SEQ_END_OF_ITEMS)).await;
            tick().await;
            assert_eq!(
                transport.take_sent(),
                vec![(peer(), datagram(0, &[(2, "b")], SEQ_END_OF_ITEMS))],
            );

            // ...and the back-off starts over at the initial interval
            time::sleep(Duration::from_millis(520)).await;
            assert_eq!(
                transport.take_sent(),
                vec![(peer(), datagram(0, &[(2, "b")], SEQ_END_OF_ITEMS))],
            );
        });
    }

    #[test]
    fn test_unreachable_peer_ends_stream_after_attempt_bound() {
        let rt = paused_rt();
        rt.block_on(async move {
            let (stream, transport) = recording_stream(test_config());
            let close_counter = install_close_counter(&stream).await;

            stream.enqueue(TextMessage::boxed("a")).await;
            time::sleep(Duration::from_secs(60)).await;

            // 10 attempts: the initial send plus 9 retries, then the stream gives up
            assert_eq!(transport.num_sent(), 10);
            assert!(stream.is_ended().await);
            assert_eq!(close_counter.load(Ordering::SeqCst), 1);

            // ended means silent: no further retries ever
            transport.take_sent();
            time::sleep(Duration::from_secs(60)).await;
            transport.assert_nothing_sent();
        });
    }

    #[test]
    fn test_close_is_idempotent() {
        let rt = paused_rt();
        rt.block_on(async move {
            let (stream, transport) = recording_stream(test_config());

            stream.close().await;
            stream.close().await;
            tick().await;

            assert_eq!(
                transport.take_sent(),
                vec![(peer(), datagram(0, &[], SEQ_CLOSE))],
            );
            assert_eq!(stream.inner.read().await.max_attempts, 5);
        });
    }

    #[test]
    fn test_close_handshake_initiator_side() {
        let rt = paused_rt();
        rt.block_on(async move {
            let (stream, transport) = recording_stream(test_config());
            let close_counter = install_close_counter(&stream).await;

            stream.enqueue(TextMessage::boxed("a")).await;
            stream.close().await;
            tick().await;
            assert_eq!(
                transport.take_sent(),
                vec![(peer(), datagram(0, &[(1, "a")], SEQ_CLOSE))],
            );

            // the peer acks the data but not yet the close: the sentinel stays pending
            stream.on_frame(&frame_body(1, &[], SEQ_END_OF_ITEMS)).await;
            tick().await;
            assert_eq!(
                transport.take_sent(),
                vec![(peer(), datagram(0, &[], SEQ_CLOSE))],
            );
            assert!(!stream.is_ended().await);
            assert_eq!(close_counter.load(Ordering::SeqCst), 0);

            // the peer confirms the close: the stream ends immediately
            stream.on_frame(&frame_body(ACK_STREAM_ENDED, &[], SEQ_END_OF_ITEMS)).await;
            assert!(stream.is_ended().await);
            assert_eq!(close_counter.load(Ordering::SeqCst), 1);
        });
    }

    #[test]
    fn test_close_handshake_receiving_side() {
        let rt = paused_rt();
        rt.block_on(async move {
            let (stream, transport) = recording_stream(test_config());
            let close_counter = install_close_counter(&stream).await;

            let delivered = stream.on_frame(&frame_body(0, &[(1, "a")], SEQ_CLOSE)).await;
            assert_eq!(texts(&delivered), vec!["a"]);

            {
                let inner = stream.inner.read().await;
                assert!(inner.closing);
                assert_eq!(inner.remote_seq, SEQ_CLOSE);
                assert_eq!(inner.max_attempts, 1);
            }

            // the confirm carries the torn-down marker as its ack
            tick().await;
            assert_eq!(
                transport.take_sent(),
                vec![(peer(), datagram(ACK_STREAM_ENDED, &[], SEQ_CLOSE))],
            );

            // with the peer gone silent, the single-attempt bound ends the stream
            time::sleep(Duration::from_secs(10)).await;
            assert!(stream.is_ended().await);
            assert_eq!(close_counter.load(Ordering::SeqCst), 1);
        });
    }

    #[test]
    fn test_remote_close_in_duplicate_frame_is_still_confirmed() {
        let rt = paused_rt();
        rt.block_on(async move {
            let (stream, transport) = recording_stream(test_config());

            stream.on_frame(&frame_body(0, &[(1, "a")], SEQ_END_OF_ITEMS)).await;
            tick().await;
            transport.take_sent();

            // the close arrives in a frame whose items are all duplicates
            let delivered = stream.on_frame(&frame_body(0, &[(1, "a")], SEQ_CLOSE)).await;
            assert!(delivered.is_empty());
            tick().await;

            assert_eq!(
                transport.take_sent(),
                vec![(peer(), datagram(ACK_STREAM_ENDED, &[], SEQ_CLOSE))],
            );
        });
    }

    #[test]
    fn test_ended_ack_ends_stream_exactly_once() {
        let rt = paused_rt();
        rt.block_on(async move {
            let (stream, _transport) = recording_stream(test_config());
            let close_counter = install_close_counter(&stream).await;

            stream.on_frame(&frame_body(ACK_STREAM_ENDED, &[], SEQ_END_OF_ITEMS)).await;
            assert!(stream.is_ended().await);

            // a duplicate of the teardown frame is ignored
            let delivered = stream.on_frame(&frame_body(ACK_STREAM_ENDED, &[], SEQ_END_OF_ITEMS)).await;
            assert!(delivered.is_empty());
            assert_eq!(close_counter.load(Ordering::SeqCst), 1);
        });
    }

    #[test]
    fn test_end_cancels_all_scheduled_work() {
        let rt = paused_rt();
        rt.block_on(async move {
            let (stream, transport) = recording_stream(test_config());
            let close_counter = install_close_counter(&stream).await;

            stream.enqueue(TextMessage::boxed("a")).await;
            tick().await;
            assert_eq!(transport.num_sent(), 1);

            stream.end().await;
            stream.end().await;
            assert_eq!(close_counter.load(Ordering::SeqCst), 1);

            transport.take_sent();
            time::sleep(Duration::from_secs(60)).await;
            transport.assert_nothing_sent();
        });
    }

    #[test]
    fn test_frame_is_truncated_at_datagram_capacity() {
        let rt = paused_rt();
        rt.block_on(async move {
            // tag (1) + ack (2) + terminator (2) leave room for exactly two items of
            //  2 (seq) + 8 (type id) + 1 (varint len) + 4 (text) = 15 bytes each
            let (stream, transport) = recording_stream(small_config(35));

            stream.enqueue(TextMessage::boxed("aaaa")).await;
            stream.enqueue(TextMessage::boxed("bbbb")).await;
            stream.enqueue(TextMessage::boxed("cccc")).await;
            tick().await;

            assert_eq!(
                transport.take_sent(),
                vec![(peer(), datagram(0, &[(1, "aaaa"), (2, "bbbb")], SEQ_END_OF_ITEMS))],
            );

            // once the first two are acked, the remainder goes out
            stream.on_frame(&frame_body(2, &[], SEQ_END_OF_ITEMS)).await;
            tick().await;
            assert_eq!(
                transport.take_sent(),
                vec![(peer(), datagram(0, &[(3, "cccc")], SEQ_END_OF_ITEMS))],
            );
        });
    }

    #[test]
    fn test_close_sentinel_is_withheld_until_all_pending_items_fit() {
        let rt = paused_rt();
        rt.block_on(async move {
            let (stream, transport) = recording_stream(small_config(35));

            stream.enqueue(TextMessage::boxed("aaaa")).await;
            stream.enqueue(TextMessage::boxed("bbbb")).await;
            stream.enqueue(TextMessage::boxed("cccc")).await;
            stream.close().await;
            tick().await;

            // the queue did not fit completely, so the sentinel must wait
            assert_eq!(
                transport.take_sent(),
                vec![(peer(), datagram(0, &[(1, "aaaa"), (2, "bbbb")], SEQ_END_OF_ITEMS))],
            );

            stream.on_frame(&frame_body(2, &[], SEQ_END_OF_ITEMS)).await;
            tick().await;
            assert_eq!(
                transport.take_sent(),
                vec![(peer(), datagram(0, &[(3, "cccc")], SEQ_CLOSE))],
            );
        });
    }

    #[test]
    fn test_unencodable_item_is_rolled_back_and_stays_pending() {
        let rt = paused_rt();
        rt.block_on(async move {
            let (stream, transport) = recording_stream(test_config());

            stream.enqueue(TextMessage::boxed("a")).await;
            stream.enqueue(Box::new(BrokenMessage)).await;
            stream.enqueue(TextMessage::boxed("c")).await;
            tick().await;

            // the frame is truncated cleanly before the failing item
            assert_eq!(
                transport.take_sent(),
                vec![(peer(), datagram(0, &[(1, "a")], SEQ_END_OF_ITEMS))],
            );
            assert_eq!(stream.inner.read().await.pending.len(), 3);
        });
    }

    #[rstest]
    #[case::empty(vec![])]
    #[case::ack_only(vec![0, 2])]
    #[case::missing_terminator(frame_body(0, &[(1, "a")], SEQ_END_OF_ITEMS)[..8].to_vec())]
    fn test_malformed_frame_is_dropped_without_state_damage(#[case] frame: Vec<u8>) {
        let rt = paused_rt();
        rt.block_on(async move {
            let (stream, _transport) = recording_stream(test_config());

            stream.on_frame(&frame).await;

            let inner = stream.inner.read().await;
            assert!(!inner.ended);
            assert_eq!(inner.remote_seq, 0);
        });
    }

    #[test]
    fn test_fixed_payload_items_round_trip_through_frames() {
        let rt = paused_rt();
        rt.block_on(async move {
            let (a, transport) = recording_stream(test_config());
            let b = {
                let (stream, _) = recording_stream(test_config());
                stream
            };

            a.enqueue(PingMessage::boxed(7)).await;
            a.enqueue(PingMessage::boxed(8)).await;
            tick().await;

            let (_, sent) = transport.take_sent().remove(0);
            let delivered = b.on_frame(&sent[1..]).await;

            let counters: Vec<u32> = delivered.iter()
                .map(|m| m.as_any().downcast_ref::<PingMessage>().unwrap().counter)
                .collect();
            assert_eq!(counters, vec![7, 8]);
        });
    }
}
