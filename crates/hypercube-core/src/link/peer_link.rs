//! One persistent connection to a peer server.
//!
//! A link is either *inbound* (built over an accepted socket) or *outbound*
//! (dials a target descriptor). Both roles share the same contract:
//!
//! - `request` allocates a correlation id, waits for the matching reply and
//!   fails with `RequestTimeout` or `SocketClosed`;
//! - `send` enqueues a message and resolves once the transport took it;
//! - `close` stops the heartbeat and the socket, optionally announcing the
//!   close to the peer first.
//!
//! Outgoing frames go through a strict FIFO queue drained by one send task.
//! Only the head is ever in flight; a failed write retries the head in place
//! and gives up by force-closing the link.
//!
//! Lifecycle changes are reported as [`LinkEvent`]s on the channel given in
//! [`LinkEnv`].

use super::builtins;
use super::handler::Dispatch;
use super::heartbeat::{HeartbeatMonitor, Pinger, TimeoutHandler};
use super::protocol::{
    close_code, close_payload, lowercase_keys, native, read_frame, Envelope, Frame, FrameKind,
    FrameWriter, MessageId, StreamWriter,
};
use super::request::RemoteRequest;
use crate::config::{LinkConfig, LinkOptions};
use crate::context::{MeshContext, WeakMeshContext};
use crate::edge::EdgeClients;
use crate::retry::{retry_async, RetryPolicy};
use crate::server::ServerDescriptor;
use crate::session::SessionToken;
use crate::{MeshError, Result};
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch, Notify};
use tracing::{debug, info, warn};

pub type BoxedReader = Box<dyn AsyncRead + Unpin + Send>;
pub type BoxedWriter = Box<dyn FrameWriter>;
type SharedWriter = Arc<tokio::sync::Mutex<BoxedWriter>>;

static NEXT_LINK_ID: AtomicU64 = AtomicU64::new(1);

type EventFn = fn(PeerLink) -> LinkEvent;

const INBOUND_CLOSED: &[EventFn] = &[LinkEvent::Destroy];
const OUTBOUND_CLOSED: &[EventFn] = &[LinkEvent::Disconnect, LinkEvent::Drop, LinkEvent::Destroy];
const CONNECT_FAILED: &[EventFn] = &[LinkEvent::Drop, LinkEvent::Destroy];

/// Opens the transport of an outbound link.
#[async_trait::async_trait]
pub trait Dialer: Send + Sync + 'static {
    async fn dial(
        &self,
        target: &ServerDescriptor,
        timeout: Duration,
    ) -> Result<(BoxedReader, BoxedWriter)>;
}

/// Dials `host:remotePort` over TCP.
pub struct TcpDialer;

#[async_trait::async_trait]
impl Dialer for TcpDialer {
    async fn dial(
        &self,
        target: &ServerDescriptor,
        timeout: Duration,
    ) -> Result<(BoxedReader, BoxedWriter)> {
        let addr = target.remote_addr()?;
        let stream = tokio::time::timeout(timeout, TcpStream::connect(&addr))
            .await
            .map_err(|_| MeshError::Io {
                message: format!("connect to {} timed out after {:?}", addr, timeout),
                source: None,
            })??;
        stream.set_nodelay(true)?;
        let (reader, writer) = stream.into_split();
        Ok((Box::new(reader), Box::new(StreamWriter::new(writer))))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkRole {
    Inbound,
    Outbound,
}

impl std::fmt::Display for LinkRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LinkRole::Inbound => write!(f, "inbound"),
            LinkRole::Outbound => write!(f, "outbound"),
        }
    }
}

/// `INIT -> CONNECTING -> CONNECTED`; `CLOSED` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkPhase {
    Init,
    Connecting,
    Connected,
    Closed,
}

impl std::fmt::Display for LinkPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LinkPhase::Init => write!(f, "INIT"),
            LinkPhase::Connecting => write!(f, "CONNECTING"),
            LinkPhase::Connected => write!(f, "CONNECTED"),
            LinkPhase::Closed => write!(f, "CLOSED"),
        }
    }
}

/// Lifecycle notifications of a link.
#[derive(Debug, Clone)]
pub enum LinkEvent {
    /// An inbound link was built over an accepted socket.
    Open(PeerLink),
    /// The peer of an inbound link announced itself. Emitted once.
    Init(PeerLink),
    /// The transport went away.
    Disconnect(PeerLink),
    /// The peer left for good or could not be reached.
    Drop(PeerLink),
    /// The link is finished and must leave the pool.
    Destroy(PeerLink),
}

impl LinkEvent {
    pub fn link(&self) -> &PeerLink {
        match self {
            LinkEvent::Open(link)
            | LinkEvent::Init(link)
            | LinkEvent::Disconnect(link)
            | LinkEvent::Drop(link)
            | LinkEvent::Destroy(link) => link,
        }
    }
}

/// Everything a link needs from the process it lives in.
#[derive(Clone)]
pub struct LinkEnv {
    pub local: ServerDescriptor,
    pub options: LinkOptions,
    pub dispatch: Option<Arc<dyn Dispatch>>,
    pub edge: Option<Arc<dyn EdgeClients>>,
    pub dialer: Arc<dyn Dialer>,
    pub events: Option<mpsc::UnboundedSender<LinkEvent>>,
    pub(crate) context: Option<WeakMeshContext>,
}

impl LinkEnv {
    pub fn new(local: ServerDescriptor) -> Self {
        Self {
            local,
            options: LinkOptions::default(),
            dispatch: None,
            edge: None,
            dialer: Arc::new(TcpDialer),
            events: None,
            context: None,
        }
    }

    pub fn with_options(mut self, options: LinkOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_dispatch(mut self, dispatch: Arc<dyn Dispatch>) -> Self {
        self.dispatch = Some(dispatch);
        self
    }

    pub fn with_edge(mut self, edge: Arc<dyn EdgeClients>) -> Self {
        self.edge = Some(edge);
        self
    }

    pub fn with_dialer(mut self, dialer: Arc<dyn Dialer>) -> Self {
        self.dialer = dialer;
        self
    }

    pub fn with_events(mut self, events: mpsc::UnboundedSender<LinkEvent>) -> Self {
        self.events = Some(events);
        self
    }
}

struct SendEntry {
    seq: u64,
    frame: Frame,
    done: Option<oneshot::Sender<Result<()>>>,
    failures: u32,
}

impl SendEntry {
    fn complete(mut self, result: Result<()>) {
        if let Some(done) = self.done.take() {
            let _ = done.send(result);
        }
    }
}

/// Live transport of one connection generation. Dropping it stops the
/// generation's read and send tasks.
struct Connection {
    generation: u64,
    writer: SharedWriter,
    heartbeat: HeartbeatMonitor,
    wake: Arc<Notify>,
    _shutdown: watch::Sender<bool>,
}

struct LinkState {
    phase: LinkPhase,
    peer: Option<ServerDescriptor>,
    queue: VecDeque<SendEntry>,
    pending: HashMap<String, oneshot::Sender<Result<Value>>>,
    counter: u32,
    seq: u64,
    waiters: Vec<oneshot::Sender<Result<()>>>,
    init_emitted: bool,
    /// Closed by us or by the peer; no new traffic is accepted.
    closing: bool,
    close_started: bool,
    conn: Option<Connection>,
    generation: u64,
}

struct LinkInner {
    link_id: u64,
    role: LinkRole,
    target: Option<ServerDescriptor>,
    env: LinkEnv,
    state: Mutex<LinkState>,
}

/// Handle to one peer connection. Clones share the link.
#[derive(Clone)]
pub struct PeerLink {
    inner: Arc<LinkInner>,
}

impl std::fmt::Debug for PeerLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerLink")
            .field("link_id", &self.inner.link_id)
            .field("role", &self.inner.role)
            .field("phase", &self.phase())
            .finish()
    }
}

impl PeerLink {
    fn build(role: LinkRole, target: Option<ServerDescriptor>, env: LinkEnv, phase: LinkPhase) -> Self {
        Self {
            inner: Arc::new(LinkInner {
                link_id: NEXT_LINK_ID.fetch_add(1, Ordering::Relaxed),
                role,
                target: target.clone(),
                env,
                state: Mutex::new(LinkState {
                    phase,
                    peer: target,
                    queue: VecDeque::new(),
                    pending: HashMap::new(),
                    counter: 0,
                    seq: 0,
                    waiters: Vec::new(),
                    init_emitted: false,
                    closing: false,
                    close_started: false,
                    conn: None,
                    generation: 0,
                }),
            }),
        }
    }

    /// Inbound link over an accepted socket.
    pub fn accept<S>(stream: S, env: LinkEnv) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        Self::accept_parts(Box::new(reader), Box::new(StreamWriter::new(writer)), env)
    }

    /// Inbound link over an already split transport.
    pub fn accept_parts(reader: BoxedReader, writer: BoxedWriter, env: LinkEnv) -> Self {
        let link = Self::build(LinkRole::Inbound, None, env, LinkPhase::Connected);
        {
            let mut state = link.lock();
            link.attach(&mut state, reader, writer);
        }
        debug!("Accepted {}", link.describe());
        link.emit(LinkEvent::Open);
        link
    }

    /// Outbound link to `target`. Connecting starts in the background; the
    /// link is usable at once and queues traffic until connected.
    pub fn connect_to(target: ServerDescriptor, env: LinkEnv) -> Self {
        let link = Self::build(LinkRole::Outbound, Some(target), env, LinkPhase::Init);
        link.spawn_connect();
        link
    }

    fn lock(&self) -> MutexGuard<'_, LinkState> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn link_id(&self) -> u64 {
        self.inner.link_id
    }

    pub fn role(&self) -> LinkRole {
        self.inner.role
    }

    pub fn phase(&self) -> LinkPhase {
        self.lock().phase
    }

    /// The peer's descriptor: the target of an outbound link, or what an
    /// inbound peer announced.
    pub fn peer(&self) -> Option<ServerDescriptor> {
        self.lock().peer.clone()
    }

    pub fn is_closed(&self) -> bool {
        let state = self.lock();
        state.phase == LinkPhase::Closed || state.closing
    }

    /// Requests still waiting for a reply.
    pub fn pending_requests(&self) -> usize {
        self.lock().pending.len()
    }

    /// Messages not yet taken by the transport.
    pub fn queued_messages(&self) -> usize {
        self.lock().queue.len()
    }

    pub fn ptr_eq(&self, other: &PeerLink) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn local(&self) -> &ServerDescriptor {
        &self.inner.env.local
    }

    /// The mesh this link belongs to.
    pub fn context(&self) -> Result<MeshContext> {
        self.inner
            .env
            .context
            .as_ref()
            .and_then(WeakMeshContext::upgrade)
            .ok_or(MeshError::Detached)
    }

    fn describe(&self) -> String {
        let peer = self
            .lock()
            .peer
            .as_ref()
            .map(ServerDescriptor::key)
            .unwrap_or_else(|| "?".to_string());
        format!("{} link {} ({})", self.inner.role, self.inner.link_id, peer)
    }

    fn closed_events(&self) -> &'static [EventFn] {
        match self.inner.role {
            LinkRole::Inbound => INBOUND_CLOSED,
            LinkRole::Outbound => OUTBOUND_CLOSED,
        }
    }

    fn emit(&self, make: EventFn) {
        if let Some(events) = &self.inner.env.events {
            let _ = events.send(make(self.clone()));
        }
    }

    // ========================================
    // Public contract
    // ========================================

    /// Send `action` and wait for the correlated reply.
    pub async fn request(
        &self,
        action: &str,
        payload: Value,
        session: Option<&SessionToken>,
    ) -> Result<Value> {
        let (tx, rx) = oneshot::channel();
        let key = {
            let mut state = self.lock();
            if state.phase == LinkPhase::Closed || state.closing {
                return Err(MeshError::SocketClosed);
            }
            let key = self.next_request_id(&mut state);
            state.pending.insert(key.clone(), tx);
            key
        };

        let queued = self
            .encode(MessageId::Str(key.clone()), action, payload, session)
            .and_then(|frame| self.enqueue(frame));
        if let Err(e) = queued {
            self.lock().pending.remove(&key);
            return Err(e);
        }

        let timeout = self.inner.env.options.request_timeout;
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(MeshError::SocketClosed),
            Err(_) => {
                self.lock().pending.remove(&key);
                debug!("Request {} [{}] timed out", action, key);
                Err(MeshError::RequestTimeout(timeout))
            }
        }
    }

    /// Enqueue a message; resolves once the transport accepted it.
    pub async fn send(
        &self,
        action: &str,
        payload: Value,
        session: Option<&SessionToken>,
        id: MessageId,
    ) -> Result<()> {
        let frame = self.encode(id, action, payload, session)?;
        let ack = self.enqueue(frame)?;
        ack.await.unwrap_or(Err(MeshError::SocketClosed))
    }

    /// Fire-and-forget shorthand for [`PeerLink::send`].
    pub async fn push(&self, action: &str, payload: Value, session: Option<&SessionToken>) -> Result<()> {
        self.send(action, payload, session, MessageId::default()).await
    }

    /// Close the link for good. With `force`, the peer is told first with a
    /// `_close` notification carrying `payload`.
    pub async fn close(&self, force: bool, payload: Option<Value>) {
        let transport = {
            let mut state = self.lock();
            if state.phase == LinkPhase::Closed || state.close_started {
                return;
            }
            state.close_started = true;
            state.closing = true;
            state
                .conn
                .as_ref()
                .map(|conn| (conn.writer.clone(), conn.heartbeat.clone()))
        };

        if let Some((writer, heartbeat)) = transport {
            heartbeat.close();
            if force {
                self.notify_close(&writer, payload.unwrap_or_else(|| Value::Object(Default::default())))
                    .await;
            }
            if let Ok(mut writer) =
                tokio::time::timeout(LinkConfig::CLOSE_NOTIFY_TIMEOUT, writer.lock()).await
            {
                writer.shutdown().await;
            }
        }

        info!("Closed {}", self.describe());
        self.finalize(|| MeshError::SocketClosed, self.closed_events());
    }

    /// Re-arm an outbound link after a `Disconnect`.
    pub async fn reconnect(&self) -> Result<()> {
        if self.inner.role == LinkRole::Inbound {
            return Err(MeshError::invalid_params("inbound links cannot reconnect"));
        }
        debug!("Reconnecting {}", self.describe());
        self.connect().await
    }

    // ========================================
    // Outgoing path
    // ========================================

    fn next_request_id(&self, state: &mut LinkState) -> String {
        let prefix = self.inner.env.local.key();
        for _ in 0..LinkConfig::MAX_REQUEST_COUNTER {
            state.counter = if state.counter >= LinkConfig::MAX_REQUEST_COUNTER {
                1
            } else {
                state.counter + 1
            };
            let id = format!("{}#{}", prefix, state.counter);
            if !state.pending.contains_key(&id) {
                return id;
            }
        }
        format!("{}#{}", prefix, state.counter)
    }

    fn encode(
        &self,
        id: MessageId,
        action: &str,
        payload: Value,
        session: Option<&SessionToken>,
    ) -> Result<Frame> {
        let options = &self.inner.env.options;
        let payload = if options.lowercase_messages
            && action != native::SYNC_SESSION
            && action != native::SAVE_SESSION
        {
            lowercase_keys(payload)
        } else {
            payload
        };
        let envelope = Envelope {
            id,
            action: action.to_string(),
            payload,
            origin: Some(self.inner.env.local.group.clone()),
            session: session.and_then(SessionToken::to_wire),
        };
        let text = serde_json::to_string(&envelope)?;
        Ok(Frame::data(options.codec.encode(&text)?))
    }

    fn enqueue(&self, frame: Frame) -> Result<oneshot::Receiver<Result<()>>> {
        let (tx, rx) = oneshot::channel();
        let (wake, connect) = {
            let mut state = self.lock();
            if state.phase == LinkPhase::Closed || state.closing {
                return Err(MeshError::SocketClosed);
            }
            state.seq += 1;
            let entry = SendEntry {
                seq: state.seq,
                frame,
                done: Some(tx),
                failures: 0,
            };
            state.queue.push_back(entry);
            (
                state.conn.as_ref().map(|conn| conn.wake.clone()),
                self.inner.role == LinkRole::Outbound && state.phase == LinkPhase::Init,
            )
        };
        if let Some(wake) = wake {
            wake.notify_one();
        }
        if connect {
            self.spawn_connect();
        }
        Ok(rx)
    }

    async fn notify_close(&self, writer: &SharedWriter, payload: Value) {
        let frame = match self.encode(MessageId::default(), native::CLOSE_SOCKET, payload, None) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("Could not encode close notification: {}", e);
                return;
            }
        };
        let notify = async { writer.lock().await.write(&frame).await };
        match tokio::time::timeout(LinkConfig::CLOSE_NOTIFY_TIMEOUT, notify).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!("Close notification not delivered: {}", e),
            Err(_) => debug!("Close notification timed out"),
        }
    }

    // ========================================
    // Connection management
    // ========================================

    fn spawn_connect(&self) {
        let link = self.clone();
        tokio::spawn(async move {
            if let Err(e) = link.connect().await {
                debug!("Connect of {} ended: {}", link.describe(), e);
            }
        });
    }

    /// Bring an outbound link to `CONNECTED`. Callers arriving while an
    /// attempt is in flight wait for that attempt.
    async fn connect(&self) -> Result<()> {
        let Some(target) = self.inner.target.clone() else {
            return Ok(());
        };
        let hello = self.encode(
            MessageId::default(),
            native::SERVER_INFO,
            serde_json::to_value(&self.inner.env.local)?,
            None,
        )?;

        let waiter = {
            let mut state = self.lock();
            if state.closing {
                return Err(MeshError::SocketClosed);
            }
            match state.phase {
                LinkPhase::Closed => return Err(MeshError::SocketClosed),
                LinkPhase::Connected => return Ok(()),
                LinkPhase::Connecting => {
                    let (tx, rx) = oneshot::channel();
                    state.waiters.push(tx);
                    Some(rx)
                }
                LinkPhase::Init => {
                    state.phase = LinkPhase::Connecting;
                    None
                }
            }
        };
        if let Some(rx) = waiter {
            return rx.await.unwrap_or(Err(MeshError::SocketClosed));
        }

        let options = &self.inner.env.options;
        let policy = RetryPolicy::for_connect(options);
        let dialer = self.inner.env.dialer.clone();
        let connect_timeout = options.connect_timeout;
        let (result, stats) = retry_async(
            &policy,
            || {
                let dialer = dialer.clone();
                let target = target.clone();
                async move { dialer.dial(&target, connect_timeout).await }
            },
            MeshError::is_retryable,
        )
        .await;

        match result {
            Ok((reader, writer)) => {
                let waiters = {
                    let mut state = self.lock();
                    if state.phase == LinkPhase::Closed || state.closing {
                        return Err(MeshError::SocketClosed);
                    }
                    state.seq += 1;
                    let hello = SendEntry {
                        seq: state.seq,
                        frame: hello,
                        done: None,
                        failures: 0,
                    };
                    // The identity announcement goes ahead of anything already queued.
                    state.queue.push_front(hello);
                    state.phase = LinkPhase::Connected;
                    self.attach(&mut state, reader, writer);
                    std::mem::take(&mut state.waiters)
                };
                info!(
                    "Connected {} after {} attempt(s)",
                    self.describe(),
                    stats.attempts
                );
                for waiter in waiters {
                    let _ = waiter.send(Ok(()));
                }
                Ok(())
            }
            Err(e) => {
                warn!("Could not connect to {}: {}", target, e);
                let attempts = stats.attempts;
                let fail = || MeshError::InitFail {
                    group: target.group.clone(),
                    id: target.id.clone(),
                    attempts,
                };
                self.finalize(&fail, CONNECT_FAILED);
                Err(fail())
            }
        }
    }

    /// Install a new transport generation and start its tasks.
    fn attach(&self, state: &mut LinkState, reader: BoxedReader, writer: BoxedWriter) {
        let writer: SharedWriter = Arc::new(tokio::sync::Mutex::new(writer));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let heartbeat = self.heartbeat_for(writer.clone());
        let wake = Arc::new(Notify::new());

        state.generation += 1;
        let generation = state.generation;
        state.conn = Some(Connection {
            generation,
            writer,
            heartbeat: heartbeat.clone(),
            wake: wake.clone(),
            _shutdown: shutdown_tx,
        });

        tokio::spawn(self.clone().read_loop(reader, generation, shutdown_rx.clone()));
        tokio::spawn(self.clone().send_loop(generation, wake, shutdown_rx));
        heartbeat.start();
    }

    fn heartbeat_for(&self, writer: SharedWriter) -> HeartbeatMonitor {
        let pinger: Pinger = Arc::new(move || {
            let writer = writer.clone();
            Box::pin(async move { writer.lock().await.write(&Frame::ping()).await })
        });
        let weak = Arc::downgrade(&self.inner);
        let on_timeout: TimeoutHandler = Arc::new(move || {
            let Some(inner) = weak.upgrade() else {
                return;
            };
            let link = PeerLink { inner };
            warn!("Heartbeat timeout on {}", link.describe());
            tokio::spawn(async move {
                let payload = close_payload(close_code::HEARTBEAT_TIMEOUT, "heartbeat_timeout");
                link.close(true, Some(payload)).await;
            });
        });
        let options = &self.inner.env.options;
        HeartbeatMonitor::new(options.heartbeat_interval, options.ping_timeout, pinger, on_timeout)
    }

    /// Drain the send queue of one transport generation.
    async fn send_loop(self, generation: u64, wake: Arc<Notify>, mut shutdown: watch::Receiver<bool>) {
        let max_retries = self.inner.env.options.max_send_retries;
        loop {
            let next = {
                let state = self.lock();
                match &state.conn {
                    Some(conn) if conn.generation == generation => state
                        .queue
                        .front()
                        .map(|head| (head.seq, head.frame.clone(), conn.writer.clone(), conn.heartbeat.clone())),
                    _ => return,
                }
            };

            let Some((seq, frame, writer, heartbeat)) = next else {
                tokio::select! {
                    _ = wake.notified() => {}
                    _ = shutdown.changed() => return,
                }
                continue;
            };

            heartbeat.reset();
            let result = writer.lock().await.write(&frame).await;

            let give_up = {
                let mut state = self.lock();
                let Some(pos) = state.queue.iter().position(|entry| entry.seq == seq) else {
                    continue;
                };
                match result {
                    Ok(()) => {
                        if let Some(entry) = state.queue.remove(pos) {
                            entry.complete(Ok(()));
                        }
                        false
                    }
                    Err(ref e) => {
                        let entry = &mut state.queue[pos];
                        entry.failures += 1;
                        debug!("Write attempt {} failed: {}", entry.failures, e);
                        entry.failures > max_retries
                    }
                }
            };

            if give_up {
                warn!("Giving up on {} after repeated write failures", self.describe());
                self.close(true, None).await;
                return;
            }
            if result.is_err() {
                tokio::task::yield_now().await;
            }
        }
    }

    // ========================================
    // Incoming path
    // ========================================

    async fn read_loop(self, mut reader: BoxedReader, generation: u64, mut shutdown: watch::Receiver<bool>) {
        let reason = loop {
            let frame = tokio::select! {
                result = read_frame(&mut reader) => result,
                _ = shutdown.changed() => return,
            };
            match frame {
                Ok(Some(frame)) => self.on_frame(frame, generation).await,
                Ok(None) => break "peer closed the connection".to_string(),
                Err(e) => break e.to_string(),
            }
        };
        self.on_transport_lost(generation, &reason);
    }

    async fn on_frame(&self, frame: Frame, generation: u64) {
        let transport = {
            let state = self.lock();
            match &state.conn {
                Some(conn) if conn.generation == generation => {
                    Some((conn.writer.clone(), conn.heartbeat.clone()))
                }
                _ => None,
            }
        };
        let Some((writer, heartbeat)) = transport else {
            return;
        };

        // Any frame proves the peer is alive.
        heartbeat.on_pong();
        match frame.kind {
            FrameKind::Ping => {
                if let Err(e) = writer.lock().await.write(&Frame::pong()).await {
                    debug!("Pong not delivered: {}", e);
                }
            }
            FrameKind::Pong => {}
            FrameKind::Data => self.on_data(&frame.body),
        }
    }

    fn on_data(&self, body: &[u8]) {
        let text = match self.inner.env.options.codec.decode(body) {
            Ok(text) => text,
            Err(e) => {
                warn!("Dropping undecodable frame on {}: {}", self.describe(), e);
                return;
            }
        };
        let envelope = match Envelope::parse(&text) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!("Dropping malformed message on {}: {}", self.describe(), e);
                return;
            }
        };

        if let Some(key) = envelope.id.as_key() {
            let waiter = self.lock().pending.remove(key);
            if let Some(waiter) = waiter {
                let result = if envelope.action == native::ERROR {
                    Err(MeshError::Remote {
                        payload: envelope.payload,
                    })
                } else {
                    Ok(envelope.payload)
                };
                let _ = waiter.send(result);
                return;
            }
            if key.starts_with(&format!("{}#", self.inner.env.local.key())) {
                debug!("Late reply {} [{}] dropped", envelope.action, key);
                return;
            }
        }

        match envelope.action.as_str() {
            native::SERVER_INFO => self.on_server_info(envelope.payload),
            native::CLOSE_SOCKET => self.on_close_notice(envelope.payload),
            native::ERROR => debug!("Uncorrelated error reply dropped: {}", envelope.payload),
            _ => self.dispatch(envelope),
        }
    }

    fn on_server_info(&self, payload: Value) {
        if self.inner.role == LinkRole::Outbound {
            debug!("Ignoring identity announcement on {}", self.describe());
            return;
        }
        let peer: ServerDescriptor = match serde_json::from_value(payload) {
            Ok(peer) => peer,
            Err(e) => {
                warn!("Invalid identity announcement: {}", e);
                return;
            }
        };
        let first = {
            let mut state = self.lock();
            if state.peer.is_none() {
                state.peer = Some(peer);
            }
            !std::mem::replace(&mut state.init_emitted, true)
        };
        if first {
            info!("Peer announced on {}", self.describe());
            self.emit(LinkEvent::Init);
        }
    }

    fn on_close_notice(&self, payload: Value) {
        info!("{} closed by peer: {}", self.describe(), payload);
        match self.inner.role {
            LinkRole::Inbound => self.emit(LinkEvent::Drop),
            LinkRole::Outbound => {
                let heartbeat = {
                    let mut state = self.lock();
                    state.closing = true;
                    state.conn.as_ref().map(|conn| conn.heartbeat.clone())
                };
                if let Some(heartbeat) = heartbeat {
                    heartbeat.close();
                }
            }
        }
    }

    fn dispatch(&self, envelope: Envelope) {
        let Envelope {
            id,
            action,
            payload,
            origin,
            session,
        } = envelope;
        let session = session.map(SessionToken::from_wire).unwrap_or_default();
        let req = RemoteRequest::new(self.clone(), id, action, payload, origin, session);
        let env = &self.inner.env;

        if native::is_edge_action(req.action()) {
            let edge = env.edge.clone();
            tokio::spawn(async move {
                let result = match edge {
                    Some(edge) => builtins::serve(edge.as_ref(), &req).await,
                    None => Err(MeshError::InvalidFunction {
                        action: req.action().to_string(),
                    }),
                };
                req.finish(result).await;
            });
            return;
        }

        match env.dispatch.clone() {
            Some(dispatch) if dispatch.handles(req.action()) => {
                tokio::spawn(async move {
                    let result = dispatch.dispatch(req.clone()).await;
                    req.finish(result).await;
                });
            }
            _ => {
                warn!("No handler for [{}] on {}", req.action(), self.describe());
                tokio::spawn(async move {
                    let err = MeshError::InvalidFunction {
                        action: req.action().to_string(),
                    };
                    req.error(err).await;
                });
            }
        }
    }

    fn on_transport_lost(&self, generation: u64, reason: &str) {
        let (conn, terminal) = {
            let mut state = self.lock();
            if !matches!(&state.conn, Some(conn) if conn.generation == generation) {
                return;
            }
            let conn = state.conn.take();
            let terminal = self.inner.role == LinkRole::Inbound || state.closing;
            if !terminal {
                state.phase = LinkPhase::Init;
            }
            (conn, terminal)
        };
        if let Some(conn) = conn {
            conn.heartbeat.close();
        }

        if terminal {
            info!("{} finished: {}", self.describe(), reason);
            self.finalize(|| MeshError::SocketClosed, self.closed_events());
            return;
        }

        info!("{} lost its transport: {}", self.describe(), reason);
        self.emit(LinkEvent::Disconnect);
        if self.queued_messages() > 0 {
            self.spawn_connect();
        }
    }

    /// Move to `CLOSED`, reject everything in flight and report `events`.
    /// Runs at most once.
    fn finalize(&self, reason: impl Fn() -> MeshError, events: &[EventFn]) {
        let (queue, pending, waiters, conn) = {
            let mut state = self.lock();
            if state.phase == LinkPhase::Closed {
                return;
            }
            state.phase = LinkPhase::Closed;
            state.closing = true;
            (
                std::mem::take(&mut state.queue),
                std::mem::take(&mut state.pending),
                std::mem::take(&mut state.waiters),
                state.conn.take(),
            )
        };
        if let Some(conn) = conn {
            conn.heartbeat.close();
        }

        if !queue.is_empty() || !pending.is_empty() {
            debug!(
                "Rejecting {} queued and {} pending on {}",
                queue.len(),
                pending.len(),
                self.describe()
            );
        }
        for entry in queue {
            entry.complete(Err(reason()));
        }
        for (_, waiter) in pending {
            let _ = waiter.send(Err(reason()));
        }
        for waiter in waiters {
            let _ = waiter.send(Err(reason()));
        }
        for make in events {
            self.emit(*make);
        }
    }
}
