use std::any::Any;
use std::collections::hash_map::Entry;
use std::fmt::{Debug, Formatter};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{anyhow, bail};
use async_trait::async_trait;
use bytes::BytesMut;
use rustc_hash::FxHashMap;
use tokio::net::UdpSocket;
use tokio::sync::{Notify, RwLock};
use tracing::{debug, error, info, span, trace, warn, Level};
use uuid::Uuid;

use crate::config::SocketConfig;
use crate::datagram::DatagramSocket;
use crate::frame::FrameTag;
use crate::oracle::{Message, MessageOracle, MessageTypeId};
use crate::stream::Stream;

/// Per-connection application state, produced by the connect handler when it accepts an
///  inbound stream and handed back on every subsequent message and on close.
pub type UserData = Arc<dyn Any + Send + Sync>;

/// Handles connectionless messages (tag `GENERAL`), outside any stream.
#[async_trait]
pub trait GeneralMessageHandler: Send + Sync + 'static {
    async fn on_message(&self, from: SocketAddr, msg: Box<dyn Message>);
}

/// Inspects the first message of a new inbound stream. Returning user data accepts the
///  connection; returning `None` rejects it and the provisional stream is closed gracefully.
///
/// The handler may suspend (e.g. for an authentication lookup); the socket stays re-entrant
///  for further datagrams from the same remote while the decision is pending.
#[async_trait]
pub trait ConnectHandler: Send + Sync + 'static {
    async fn on_connect(&self, from: SocketAddr, msg: Box<dyn Message>) -> Option<UserData>;
}

/// Handles messages on established streams. `user_data` is what the connect handler returned
///  for inbound streams, and `None` on the client side of an outbound stream.
#[async_trait]
pub trait StreamMessageHandler: Send + Sync + 'static {
    async fn on_message(&self, from: SocketAddr, user_data: Option<&UserData>, msg: Box<dyn Message>);
}

/// Notified once per accepted inbound stream.
#[async_trait]
pub trait StreamOpenHandler: Send + Sync + 'static {
    async fn on_open(&self, remote: SocketAddr, user_data: &UserData);
}

/// Notified once per registered stream (inbound or the outbound one) that has ended, whether
///  by graceful handshake or because the peer was declared dead.
#[async_trait]
pub trait StreamCloseHandler: Send + Sync + 'static {
    async fn on_close(&self, remote: SocketAddr, user_data: Option<UserData>);
}

struct ServerStreamEntry {
    stream: Arc<Stream>,
    user_data: UserData,
}

struct SocketShared {
    config: Arc<SocketConfig>,
    oracle: Arc<dyn MessageOracle>,
    receive_socket: Arc<UdpSocket>,
    transport: Arc<dyn DatagramSocket>,

    general_handlers: RwLock<FxHashMap<MessageTypeId, Arc<dyn GeneralMessageHandler>>>,
    connect_handlers: RwLock<FxHashMap<MessageTypeId, Arc<dyn ConnectHandler>>>,
    stream_handlers: RwLock<FxHashMap<MessageTypeId, Arc<dyn StreamMessageHandler>>>,
    open_handler: RwLock<Option<Arc<dyn StreamOpenHandler>>>,
    close_handler: RwLock<Option<Arc<dyn StreamCloseHandler>>>,

    /// the single outbound stream (client mode)
    client_stream: RwLock<Option<Arc<Stream>>>,
    /// inbound streams keyed by remote address (server mode); `None` until [MessageSocket::listen]
    server_streams: RwLock<Option<FxHashMap<SocketAddr, ServerStreamEntry>>>,

    closing: AtomicBool,
    drained: Notify,
}

/// The place where all parts of the protocol come together: one UDP endpoint whose inbound
///  datagrams are dispatched to connectionless handlers, to existing streams, or into the
///  accept flow for new inbound connections - and an API for application code to register
///  handlers, connect outward and send messages.
pub struct MessageSocket {
    shared: Arc<SocketShared>,
}

impl Debug for MessageSocket {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "MessageSocket{{self_addr:{:?}}}", self.local_addr())
    }
}

impl MessageSocket {
    pub async fn new(config: Arc<SocketConfig>, oracle: Arc<dyn MessageOracle>) -> anyhow::Result<MessageSocket> {
        config.validate()?;

        let receive_socket = Arc::new(UdpSocket::bind(config.self_addr).await?);
        info!("bound socket to {:?}", DatagramSocket::local_addr(&receive_socket));

        let transport: Arc<dyn DatagramSocket> = Arc::new(receive_socket.clone());
        Ok(Self::with_parts(config, oracle, receive_socket, transport))
    }

    fn with_parts(
        config: Arc<SocketConfig>,
        oracle: Arc<dyn MessageOracle>,
        receive_socket: Arc<UdpSocket>,
        transport: Arc<dyn DatagramSocket>,
    ) -> MessageSocket {
        MessageSocket {
            shared: Arc::new(SocketShared {
                config,
                oracle,
                receive_socket,
                transport,
                general_handlers: Default::default(),
                connect_handlers: Default::default(),
                stream_handlers: Default::default(),
                open_handler: Default::default(),
                close_handler: Default::default(),
                client_stream: Default::default(),
                server_streams: Default::default(),
                closing: AtomicBool::new(false),
                drained: Notify::new(),
            }),
        }
    }

    pub fn local_addr(&self) -> SocketAddr {
        DatagramSocket::local_addr(&self.shared.receive_socket)
    }

    /// Install the handler for connectionless messages of the given type. There is exactly
    ///  one handler per type; a second registration is a programming error.
    pub async fn register_general(&self, msg_type: MessageTypeId, handler: Arc<dyn GeneralMessageHandler>) -> anyhow::Result<()> {
        match self.shared.general_handlers.write().await.entry(msg_type) {
            Entry::Occupied(_) => {
                Err(anyhow!("registering a second general handler for message type {:?}", msg_type))
            }
            Entry::Vacant(e) => {
                let _ = e.insert(handler);
                Ok(())
            }
        }
    }

    /// Install the accept/reject decision for inbound streams whose first message has the
    ///  given type.
    pub async fn register_connect(&self, msg_type: MessageTypeId, handler: Arc<dyn ConnectHandler>) {
        if self.shared.connect_handlers.write().await.insert(msg_type, handler).is_some() {
            warn!("registering a second connect handler for message type {:?}, replacing the first", msg_type);
        }
    }

    /// Install the handler for stream messages of the given type.
    pub async fn register_stream(&self, msg_type: MessageTypeId, handler: Arc<dyn StreamMessageHandler>) {
        if self.shared.stream_handlers.write().await.insert(msg_type, handler).is_some() {
            warn!("registering a second stream handler for message type {:?}, replacing the first", msg_type);
        }
    }

    pub async fn register_open(&self, handler: Arc<dyn StreamOpenHandler>) -> anyhow::Result<()> {
        let mut guard = self.shared.open_handler.write().await;
        if guard.is_some() {
            bail!("registering a second open handler");
        }
        *guard = Some(handler);
        Ok(())
    }

    pub async fn register_close(&self, handler: Arc<dyn StreamCloseHandler>) -> anyhow::Result<()> {
        let mut guard = self.shared.close_handler.write().await;
        if guard.is_some() {
            bail!("registering a second close handler");
        }
        *guard = Some(handler);
        Ok(())
    }

    /// Switch on server-side acceptance of inbound streams. Broadcast sending is enabled on
    ///  a best-effort basis where platform policy allows it.
    pub async fn listen(&self) -> anyhow::Result<()> {
        if self.shared.client_stream.read().await.is_some() {
            bail!("socket has an outbound stream - client and server mode are disjoint");
        }

        let mut guard = self.shared.server_streams.write().await;
        if guard.is_none() {
            info!("listening for inbound streams on {:?}", self.local_addr());
            *guard = Some(FxHashMap::default());

            if let Err(e) = self.shared.transport.set_broadcast(true) {
                warn!("could not enable broadcast on {:?}: {}", self.local_addr(), e);
            }
        }
        Ok(())
    }

    /// Open the single outbound stream of this socket. `connect_msg` becomes the stream's
    ///  first item, which the peer treats as the connect request.
    pub async fn connect(&self, to: SocketAddr, connect_msg: Box<dyn Message>) -> anyhow::Result<Arc<Stream>> {
        if self.shared.closing.load(Ordering::SeqCst) {
            bail!("socket is closing");
        }
        if self.shared.server_streams.read().await.is_some() {
            bail!("socket is listening - client and server mode are disjoint");
        }

        let stream = {
            let mut guard = self.shared.client_stream.write().await;
            if guard.is_some() {
                bail!("socket already has an outbound stream");
            }

            let stream = Arc::new(Stream::new(
                self.shared.config.clone(),
                self.shared.config.protocol_version,
                to,
                self.shared.transport.clone(),
                self.shared.oracle.clone(),
            ));
            *guard = Some(stream.clone());
            stream
        };
        self.shared.install_close_hook(&stream).await;

        info!("connecting to {:?}", to);
        stream.enqueue(connect_msg).await;
        Ok(stream)
    }

    /// The registered inbound stream for `remote`, if there is one - e.g. for the server side
    ///  of a connection to push messages of its own.
    pub async fn stream_for(&self, remote: SocketAddr) -> Option<Arc<Stream>> {
        self.shared.server_streams.read().await
            .as_ref()
            .and_then(|map| map.get(&remote))
            .map(|entry| entry.stream.clone())
    }

    /// Send a single connectionless message, outside any stream and without any delivery
    ///  guarantee beyond UDP's.
    pub async fn send(&self, to: SocketAddr, msg: &dyn Message) -> anyhow::Result<()> {
        trace!("sending connectionless {:?} to {:?}", msg.message_type(), to);

        let mut buf = BytesMut::new();
        FrameTag::General.ser(&mut buf);
        self.shared.oracle.encode(self.shared.config.protocol_version, msg, &mut buf)?;

        self.shared.transport.send_datagram(to, &buf).await;
        Ok(())
    }

    /// Send a connectionless message to the local-network broadcast address. Requires the
    ///  transport to be in broadcast-enabled mode (see [MessageSocket::listen]).
    pub async fn broadcast(&self, port: u16, msg: &dyn Message) -> anyhow::Result<()> {
        self.send(SocketAddr::from(([255, 255, 255, 255], port)), msg).await
    }

    /// Initiate a graceful shutdown of every stream this socket owns. Idempotent. The receive
    ///  loop keeps running until the last stream has ended, so close handshakes can complete.
    pub async fn close(&self) {
        if self.shared.closing.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("closing socket {:?}", self.local_addr());

        let client = self.shared.client_stream.read().await.clone();
        if let Some(stream) = client {
            stream.close().await;
        }

        let server: Vec<Arc<Stream>> = self.shared.server_streams.read().await
            .as_ref()
            .map(|map| map.values().map(|e| e.stream.clone()).collect())
            .unwrap_or_default();
        for stream in server {
            stream.close().await;
        }

        self.shared.check_drained().await;
    }

    /// Read datagrams and dispatch them until the socket is closed and drained. This is the
    ///  socket's engine; applications run it in a task of its own.
    pub async fn recv_loop(&self) {
        self.shared.recv_loop().await
    }
}

impl SocketShared {
    async fn recv_loop(self: &Arc<Self>) {
        info!("starting receive loop");

        let mut buf = vec![0u8; self.config.max_datagram_bytes + 1];
        loop {
            let (num_read, from) = tokio::select! {
                _ = self.drained.notified() => {
                    info!("socket closed and all streams ended - shutting down receive loop");
                    return;
                }
                result = self.receive_socket.recv_from(&mut buf) => match result {
                    Ok(x) => x,
                    Err(e) => {
                        error!("socket error: {}", e);
                        continue;
                    }
                }
            };

            let correlation_id = Uuid::new_v4();
            let span = span!(Level::TRACE, "datagram_received", ?correlation_id);
            let _entered = span.enter();

            if num_read > self.config.max_datagram_bytes {
                warn!("received a datagram exceeding the configured size of {} bytes - skipping", self.config.max_datagram_bytes);
                continue;
            }

            self.on_datagram(from, &buf[..num_read]).await;
        }
    }

    async fn on_datagram(self: &Arc<Self>, from: SocketAddr, datagram: &[u8]) {
        trace!("received datagram from {:?}: {:?}", from, datagram);

        let mut parse_buf = datagram;
        let tag = match FrameTag::deser(&mut parse_buf) {
            Ok(tag) => tag,
            Err(_) => {
                warn!("received datagram with an invalid tag from {:?} - discarding", from);
                return;
            }
        };

        match tag {
            FrameTag::General => self.on_general_datagram(from, parse_buf).await,
            FrameTag::Stream => self.on_stream_datagram(from, parse_buf).await,
        }
    }

    async fn on_general_datagram(&self, from: SocketAddr, mut parse_buf: &[u8]) {
        let msg = match self.oracle.decode(self.config.protocol_version, &mut parse_buf) {
            Ok(msg) => msg,
            Err(e) => {
                warn!("received an undecodable connectionless message from {:?} - discarding: {}", from, e);
                return;
            }
        };

        let handler = self.general_handlers.read().await
            .get(&msg.message_type())
            .cloned();
        match handler {
            Some(handler) => handler.on_message(from, msg).await,
            None => {
                warn!("received connectionless message of type {:?} from {:?} for which there is no handler - ignoring", msg.message_type(), from);
            }
        }
    }

    async fn on_stream_datagram(self: &Arc<Self>, from: SocketAddr, frame: &[u8]) {
        // client mode: all stream traffic belongs to the single outbound stream
        let client = self.client_stream.read().await.clone();
        if let Some(stream) = client {
            if stream.remote_addr() == from {
                let items = stream.on_frame(frame).await;
                self.dispatch_stream_items(from, None, items).await;
            }
            else {
                warn!("received stream datagram from {:?} but the outbound stream is to {:?} - discarding", from, stream.remote_addr());
            }
            return;
        }

        // server mode: route by remote address
        let existing = {
            let guard = self.server_streams.read().await;
            match guard.as_ref() {
                None => {
                    warn!("received stream datagram from {:?} but the socket is not listening - discarding", from);
                    return;
                }
                Some(map) => map.get(&from)
                    .map(|entry| (entry.stream.clone(), entry.user_data.clone())),
            }
        };

        if let Some((stream, user_data)) = existing {
            let items = stream.on_frame(frame).await;
            self.dispatch_stream_items(from, Some(user_data), items).await;
            return;
        }

        if self.closing.load(Ordering::SeqCst) {
            debug!("ignoring a new connection attempt from {:?} on a closing socket", from);
            return;
        }

        self.on_new_connection(from, frame).await;
    }

    /// First stream datagram from an unknown remote: run the connect protocol. The
    ///  provisional stream stays outside the stream map until the (possibly suspending)
    ///  connect handler has decided, and is committed only if no competing stream for the
    ///  same remote won the race in the meantime.
    async fn on_new_connection(self: &Arc<Self>, from: SocketAddr, frame: &[u8]) {
        debug!("new inbound stream from {:?}", from);

        // the serialization version is not part of the framing, so inbound streams decode
        //  with version 0
        let stream = Arc::new(Stream::new(
            self.config.clone(),
            0,
            from,
            self.transport.clone(),
            self.oracle.clone(),
        ));
        self.install_close_hook(&stream).await;

        let mut items = stream.on_frame(frame).await;
        if items.is_empty() {
            debug!("first datagram from {:?} carried no items - ignoring the connection attempt", from);
            stream.end().await;
            return;
        }
        let first = items.remove(0);
        let rest = items;

        let handler = self.connect_handlers.read().await
            .get(&first.message_type())
            .cloned();
        let Some(handler) = handler else {
            error!("no connect handler for first message of type {:?} from {:?} - rejecting the connection", first.message_type(), from);
            stream.close().await;
            return;
        };

        // run the handler in a task of its own so the receive loop stays responsive while
        //  the decision is pending
        let shared = self.clone();
        tokio::spawn(async move {
            let user_data = handler.on_connect(from, first).await;
            shared.finish_accept(from, stream, user_data, rest).await;
        });
    }

    async fn finish_accept(&self, from: SocketAddr, stream: Arc<Stream>, user_data: Option<UserData>, rest: Vec<Box<dyn Message>>) {
        let Some(user_data) = user_data else {
            debug!("connection from {:?} rejected by the connect handler", from);
            stream.close().await;
            return;
        };

        if self.closing.load(Ordering::SeqCst) {
            debug!("socket began closing while the connection from {:?} was being accepted - releasing it", from);
            stream.end().await;
            return;
        }

        let lost_the_race = {
            let mut guard = self.server_streams.write().await;
            match guard.as_mut() {
                None => true,
                Some(map) => {
                    if map.contains_key(&from) {
                        true
                    }
                    else {
                        map.insert(from, ServerStreamEntry { stream: stream.clone(), user_data: user_data.clone() });
                        false
                    }
                }
            }
        };
        if lost_the_race {
            // another stream for this remote was registered while the handler was pending;
            //  release this one silently
            debug!("a concurrent connection from {:?} was accepted first - releasing this one", from);
            stream.end().await;
            return;
        }

        info!("accepted inbound stream from {:?}", from);
        let open_handler = self.open_handler.read().await.clone();
        if let Some(handler) = open_handler {
            handler.on_open(from, &user_data).await;
        }

        self.dispatch_stream_items(from, Some(user_data), rest).await;
    }

    async fn dispatch_stream_items(&self, from: SocketAddr, user_data: Option<UserData>, items: Vec<Box<dyn Message>>) {
        for item in items {
            let handler = self.stream_handlers.read().await
                .get(&item.message_type())
                .cloned();
            match handler {
                Some(handler) => handler.on_message(from, user_data.as_ref(), item).await,
                None => {
                    warn!("received stream message of type {:?} from {:?} for which there is no handler - ignoring", item.message_type(), from);
                }
            }
        }
    }

    /// Wire a stream's one-shot close notification back to this socket, for eviction and the
    ///  application-level close event.
    async fn install_close_hook(self: &Arc<Self>, stream: &Arc<Stream>) {
        let shared = Arc::downgrade(self);
        let stream_ref = Arc::downgrade(stream);
        let remote = stream.remote_addr();

        stream.set_on_close(Box::new(move || {
            // decouple from the stream's internal lock: eviction happens in a task of its own
            tokio::spawn(async move {
                if let (Some(shared), Some(stream)) = (shared.upgrade(), stream_ref.upgrade()) {
                    shared.on_stream_ended(remote, stream).await;
                }
            });
        })).await;
    }

    async fn on_stream_ended(&self, remote: SocketAddr, stream: Arc<Stream>) {
        debug!("stream to {:?} ended", remote);

        // `Some(user_data)` once a *registered* stream was evicted; provisional streams that
        //  lost an accept race die silently
        let mut evicted: Option<Option<UserData>> = None;

        {
            let mut guard = self.client_stream.write().await;
            if let Some(current) = guard.as_ref() {
                if Arc::ptr_eq(current, &stream) {
                    *guard = None;
                    evicted = Some(None);
                }
            }
        }

        if evicted.is_none() {
            let mut guard = self.server_streams.write().await;
            if let Some(map) = guard.as_mut() {
                if let Entry::Occupied(e) = map.entry(remote) {
                    // a replacement stream may have been registered for this remote in the
                    //  meantime; only evict if the entry still references the ended one
                    if Arc::ptr_eq(&e.get().stream, &stream) {
                        let entry = e.remove();
                        evicted = Some(Some(entry.user_data));
                    }
                }
            }
        }

        let Some(user_data) = evicted else {
            trace!("an unregistered stream to {:?} ended", remote);
            return;
        };

        let close_handler = self.close_handler.read().await.clone();
        if let Some(handler) = close_handler {
            handler.on_close(remote, user_data).await;
        }

        self.check_drained().await;
    }

    /// Once the socket is closing and the last stream has ended, the receive loop is released.
    async fn check_drained(&self) {
        if !self.closing.load(Ordering::SeqCst) {
            return;
        }

        let has_client = self.client_stream.read().await.is_some();
        let has_server = self.server_streams.read().await
            .as_ref()
            .map(|map| !map.is_empty())
            .unwrap_or(false);

        if !has_client && !has_server {
            self.drained.notify_one();
        }
    }
}
