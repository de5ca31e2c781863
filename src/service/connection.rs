//! # Connection
//!
//! One encrypted, message-oriented session over any byte stream.
//!
//! A connection owns two tasks once started:
//! - the **reader** decodes frames, answers handshake and latency messages itself,
//!   and runs the immediate phase of every other message's handler;
//! - the **update** task ticks at a fixed period, running queued deferred phases
//!   with `&mut S`, then periodic tasks, then flushing the outbound queue.
//!
//! ```text
//! Connecting -> Handshaking -> Running -> ShuttingDown -> Closed
//! ```
//!
//! [`ConnectionHandle`] is the cheap, clonable, session-free view of a connection
//! that handlers receive; [`Connection`] additionally owns the session value and
//! the task handles.

use crate::config::ConnectionConfig;
use crate::core::codec::PacketCodec;
use crate::core::packet::Packet;
use crate::core::wire::{peek_type_id, WireCodec};
use crate::error::{ProtocolError, Result};
use crate::protocol::dispatcher::{Dispatcher, Executable};
use crate::protocol::handshake::{Handshake, HandshakeState, HandshakeStep, Role};
use crate::protocol::message::MessageInstance;
use crate::protocol::registry::{builtin, TypeRegistry};
use crate::utils::crypto::SessionCipher;
use crate::utils::metrics::global_metrics;
use crate::utils::ping::PingTracker;
use crate::utils::timeout::{with_timeout_error, SHUTDOWN_TIMEOUT};
use futures::{SinkExt, StreamExt};
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard};
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Lifecycle of a connection; only ever moves forward
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ConnectionState {
    /// Constructed, not started
    Connecting,
    /// Tasks running, session key not yet installed
    Handshaking,
    Running,
    ShuttingDown,
    Closed,
}

/// Work repeated on every update tick
pub type PeriodicTask<S> = Box<dyn FnMut(&mut S, &ConnectionHandle) -> Result<()> + Send>;

/// Work run once when the update task exits
pub type ShutdownHook<S> = Box<dyn FnOnce(&mut S, &ConnectionHandle) + Send>;

type DeferredTask<S> = Box<dyn Executable<S>>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

struct Outbound {
    queue: VecDeque<MessageInstance>,
    closed: bool,
}

struct Shared {
    id: u64,
    role: Role,
    peer_addr: Option<SocketAddr>,
    registry: Arc<TypeRegistry>,
    config: ConnectionConfig,
    outbound: Mutex<Outbound>,
    cipher: RwLock<SessionCipher>,
    handshake: Mutex<Handshake>,
    handshake_state: watch::Sender<HandshakeState>,
    state: watch::Sender<ConnectionState>,
    shutdown: CancellationToken,
    pings: Mutex<PingTracker>,
    epoch: Instant,
}

/// Session-free view of a connection, safe to clone into handlers and tasks
#[derive(Clone)]
pub struct ConnectionHandle {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("id", &self.shared.id)
            .field("role", &self.shared.role)
            .field("peer_addr", &self.shared.peer_addr)
            .field("state", &self.state())
            .finish()
    }
}

impl ConnectionHandle {
    fn new(
        role: Role,
        peer_addr: Option<SocketAddr>,
        registry: Arc<TypeRegistry>,
        config: ConnectionConfig,
    ) -> Result<Self> {
        let mut handshake = Handshake::new(role);
        let hello = handshake.public_key_message(&registry)?;
        let (handshake_state, _) = watch::channel(handshake.state());
        let (state, _) = watch::channel(ConnectionState::Connecting);
        let pings = PingTracker::new(config.ping_samples);

        Ok(Self {
            shared: Arc::new(Shared {
                id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
                role,
                peer_addr,
                registry,
                config,
                outbound: Mutex::new(Outbound {
                    queue: VecDeque::from([hello]),
                    closed: false,
                }),
                cipher: RwLock::new(SessionCipher::NoKey),
                handshake: Mutex::new(handshake),
                handshake_state,
                state,
                shutdown: CancellationToken::new(),
                pings: Mutex::new(pings),
                epoch: Instant::now(),
            }),
        })
    }

    /// A handle not bound to any stream. Queued messages stay queued; useful for
    /// exercising handlers in isolation.
    pub fn detached(
        role: Role,
        registry: Arc<TypeRegistry>,
        config: ConnectionConfig,
    ) -> Result<Self> {
        Self::new(role, None, registry, config)
    }

    pub fn id(&self) -> u64 {
        self.shared.id
    }

    pub fn role(&self) -> Role {
        self.shared.role
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.shared.peer_addr
    }

    pub fn registry(&self) -> &Arc<TypeRegistry> {
        &self.shared.registry
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.shared.config
    }

    pub fn state(&self) -> ConnectionState {
        *self.shared.state.borrow()
    }

    pub fn handshake_state(&self) -> HandshakeState {
        *self.shared.handshake_state.borrow()
    }

    pub fn is_secure(&self) -> bool {
        self.handshake_state() == HandshakeState::Secure
    }

    /// Time since the connection was constructed
    pub fn age(&self) -> Duration {
        self.shared.epoch.elapsed()
    }

    /// Append a message to the outbound queue.
    ///
    /// Fails with `IncompleteMessage` if an argument is unset and with
    /// `QueueClosed` once shutdown has begun.
    pub fn queue_message(&self, message: MessageInstance) -> Result<()> {
        message.ensure_complete()?;
        let mut outbound = lock(&self.shared.outbound);
        if outbound.closed {
            return Err(ProtocolError::QueueClosed);
        }
        outbound.queue.push_back(message);
        Ok(())
    }

    /// Messages waiting for the next flush
    pub fn queued_len(&self) -> usize {
        lock(&self.shared.outbound).queue.len()
    }

    /// Rolling mean round-trip time, `None` before the first pong
    pub fn average_ping_nanos(&self) -> Option<u64> {
        lock(&self.shared.pings).average_nanos()
    }

    /// Begin shutdown. Idempotent and callable from any thread.
    pub fn shutdown(&self) {
        let initiated = self.shared.state.send_if_modified(|state| {
            if *state >= ConnectionState::ShuttingDown {
                false
            } else {
                *state = ConnectionState::ShuttingDown;
                true
            }
        });
        if !initiated {
            return;
        }
        lock(&self.shared.outbound).closed = true;
        self.shared.shutdown.cancel();
        info!(connection = self.id(), "Connection shutting down");
    }

    /// Wait until the session key is installed.
    ///
    /// Fails with `Timeout` when `timeout` elapses first and with
    /// `ConnectionClosed` when the connection goes down first.
    pub async fn wait_secure(&self, timeout: Duration) -> Result<()> {
        let mut handshake = self.shared.handshake_state.subscribe();
        let mut state = self.shared.state.subscribe();
        let secured = async {
            tokio::select! {
                biased;
                secured = handshake.wait_for(|s| *s == HandshakeState::Secure) => {
                    secured.map(|_| ()).map_err(|_| ProtocolError::ConnectionClosed)
                }
                _ = state.wait_for(|s| *s >= ConnectionState::ShuttingDown) => {
                    Err(ProtocolError::ConnectionClosed)
                }
            }
        };
        with_timeout_error(secured, timeout).await
    }

    /// Resolves once both tasks have stopped and hooks have run
    pub async fn closed(&self) {
        let mut state = self.shared.state.subscribe();
        let _ = state.wait_for(|s| *s == ConnectionState::Closed).await;
    }

    fn advance(&self, next: ConnectionState) {
        self.shared.state.send_if_modified(|state| {
            if *state < next {
                *state = next;
                true
            } else {
                false
            }
        });
    }

    fn read_cipher(&self) -> RwLockReadGuard<'_, SessionCipher> {
        self.shared
            .cipher
            .read()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn is_cancelled(&self) -> bool {
        self.shared.shutdown.is_cancelled()
    }

    /// Queue a protocol-generated message; a closed queue is not an error here
    fn queue_reply(&self, message: MessageInstance) -> Result<()> {
        match self.queue_message(message) {
            Err(ProtocolError::QueueClosed) => Ok(()),
            other => other,
        }
    }

    fn queue_front(&self, message: MessageInstance) {
        let mut outbound = lock(&self.shared.outbound);
        if !outbound.closed {
            outbound.queue.push_front(message);
        }
    }

    /// Pop the longest deliverable prefix of the queue.
    ///
    /// Without a session key the prefix stops at the first message carrying an
    /// encrypted argument, so nothing overtakes it.
    fn take_deliverable(&self) -> Vec<MessageInstance> {
        let keyed = self.read_cipher().is_keyed();
        let mut outbound = lock(&self.shared.outbound);
        let mut batch = Vec::with_capacity(outbound.queue.len());
        while let Some(front) = outbound.queue.front() {
            if !keyed && front.spec().has_encrypted_arguments() {
                break;
            }
            if let Some(message) = outbound.queue.pop_front() {
                batch.push(message);
            }
        }
        batch
    }

    fn clock_nanos(&self) -> i64 {
        i64::try_from(self.shared.epoch.elapsed().as_nanos()).unwrap_or(i64::MAX)
    }

    fn send_ping(&self) -> Result<()> {
        let ping = self
            .registry()
            .instance(builtin::PING)?
            .with(builtin::ARG_SENT_AT, self.clock_nanos())?;
        self.queue_reply(ping)
    }

    fn answer_ping(&self, ping: &MessageInstance) -> Result<()> {
        let pong = self
            .registry()
            .instance(builtin::PONG)?
            .with(builtin::ARG_SENT_AT, ping.int64(builtin::ARG_SENT_AT)?)?;
        self.queue_reply(pong)
    }

    fn record_pong(&self, pong: &MessageInstance) -> Result<()> {
        let sent_at = pong.int64(builtin::ARG_SENT_AT)?;
        let now = self.clock_nanos();
        if !(0..=now).contains(&sent_at) {
            debug!(connection = self.id(), sent_at, "Ignoring pong with a foreign timestamp");
            return Ok(());
        }
        lock(&self.shared.pings).record((now - sent_at) as u64);
        Ok(())
    }

    fn queue_invalid_notice(&self, name: &str, id: i16) -> Result<()> {
        let notice = self
            .registry()
            .instance(builtin::INVALID_MESSAGE)?
            .with(builtin::ARG_MESSAGE_NAME, name)?
            .with(builtin::ARG_MESSAGE_ID, id)?;
        self.queue_reply(notice)
    }

    fn on_public_key(&self, message: &MessageInstance) -> Result<()> {
        let (step, state) = {
            let mut handshake = lock(&self.shared.handshake);
            let step = handshake.on_public_key(message, &self.shared.registry);
            (step, handshake.state())
        };
        self.apply_handshake_step(step, state)
    }

    fn on_session_key(&self, message: &MessageInstance) -> Result<()> {
        let (step, state) = {
            let mut handshake = lock(&self.shared.handshake);
            let step = handshake.on_session_key(message);
            (step, handshake.state())
        };
        self.apply_handshake_step(step, state)
    }

    fn apply_handshake_step(&self, step: Result<HandshakeStep>, state: HandshakeState) -> Result<()> {
        let step = match step {
            Ok(step) => step,
            Err(e) => {
                global_metrics().handshake_failed();
                error!(connection = self.id(), role = ?self.role(), error = %e, "Handshake failed");
                return Err(e);
            }
        };

        if let HandshakeStep::Established { cipher, reply } = step {
            // the reply must be queued before the key is visible to the flusher
            if let Some(reply) = reply {
                self.queue_front(reply);
            }
            *self
                .shared
                .cipher
                .write()
                .unwrap_or_else(PoisonError::into_inner) = cipher;
            self.shared.handshake_state.send_replace(state);
            self.advance(ConnectionState::Running);
            global_metrics().handshake_success();
            info!(connection = self.id(), role = ?self.role(), "Session secured");
        } else {
            self.shared.handshake_state.send_replace(state);
        }
        Ok(())
    }
}

struct Extensions<S> {
    tasks: Mutex<Vec<PeriodicTask<S>>>,
    hooks: Mutex<Vec<ShutdownHook<S>>>,
}

impl<S> Extensions<S> {
    fn take_tasks(&self) -> Vec<PeriodicTask<S>> {
        std::mem::take(&mut *lock(&self.tasks))
    }

    fn take_hooks(&self) -> Vec<ShutdownHook<S>> {
        std::mem::take(&mut *lock(&self.hooks))
    }
}

/// A connection together with its session value `S`
pub struct Connection<S> {
    handle: ConnectionHandle,
    dispatcher: Arc<Dispatcher<S>>,
    extensions: Arc<Extensions<S>>,
    session: Mutex<Option<S>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl<S> Connection<S> {
    pub fn handle(&self) -> &ConnectionHandle {
        &self.handle
    }

    pub fn id(&self) -> u64 {
        self.handle.id()
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.handle.peer_addr()
    }

    pub fn state(&self) -> ConnectionState {
        self.handle.state()
    }

    pub fn handshake_state(&self) -> HandshakeState {
        self.handle.handshake_state()
    }

    pub fn queue_message(&self, message: MessageInstance) -> Result<()> {
        self.handle.queue_message(message)
    }

    pub fn average_ping_nanos(&self) -> Option<u64> {
        self.handle.average_ping_nanos()
    }

    pub async fn wait_secure(&self, timeout: Duration) -> Result<()> {
        self.handle.wait_secure(timeout).await
    }

    pub async fn closed(&self) {
        self.handle.closed().await
    }

    /// Run `task` with the session on every update tick
    pub fn add_periodic_task<F>(&self, task: F)
    where
        F: FnMut(&mut S, &ConnectionHandle) -> Result<()> + Send + 'static,
    {
        lock(&self.extensions.tasks).push(Box::new(task));
    }

    /// Run `hook` with the session once, when the connection stops
    pub fn add_shutdown_hook<F>(&self, hook: F)
    where
        F: FnOnce(&mut S, &ConnectionHandle) + Send + 'static,
    {
        if self.state() == ConnectionState::Closed {
            debug!(connection = self.id(), "Shutdown hook added after close will not run");
        }
        lock(&self.extensions.hooks).push(Box::new(hook));
    }

    /// Begin shutdown. Idempotent. A connection that was never started runs its
    /// shutdown hooks here and closes immediately.
    pub fn shutdown(&self) {
        self.handle.shutdown();
        let unstarted = lock(&self.session).take();
        if let Some(mut session) = unstarted {
            for hook in self.extensions.take_hooks() {
                hook(&mut session, &self.handle);
            }
            self.handle.advance(ConnectionState::Closed);
        }
    }

    /// Wait for the reader and update tasks to finish
    pub async fn join(&self) {
        let tasks = std::mem::take(&mut *lock(&self.tasks));
        for task in tasks {
            if let Err(e) = task.await {
                warn!(connection = self.id(), error = %e, "Connection task panicked");
            }
        }
    }
}

impl<S: Send + 'static> Connection<S> {
    /// Construct a connection; generates the key pair and queues `PublicKey`
    pub fn new(
        role: Role,
        peer_addr: Option<SocketAddr>,
        registry: Arc<TypeRegistry>,
        dispatcher: Arc<Dispatcher<S>>,
        config: ConnectionConfig,
        session: S,
    ) -> Result<Self> {
        let handle = ConnectionHandle::new(role, peer_addr, registry, config)?;
        debug!(connection = handle.id(), ?role, ?peer_addr, "Connection created");
        Ok(Self {
            handle,
            dispatcher,
            extensions: Arc::new(Extensions {
                tasks: Mutex::new(Vec::new()),
                hooks: Mutex::new(Vec::new()),
            }),
            session: Mutex::new(Some(session)),
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Spawn the reader and update tasks over `stream`. Must be called from
    /// within a tokio runtime, at most once.
    #[instrument(skip(self, stream), fields(connection = self.id(), role = ?self.handle.role()))]
    pub fn start<T>(&self, stream: T) -> Result<()>
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        let mut slot = lock(&self.session);
        if self.state() >= ConnectionState::ShuttingDown {
            return Err(ProtocolError::ConnectionClosed);
        }
        let session = slot
            .take()
            .ok_or_else(|| ProtocolError::Custom("Connection already started".into()))?;
        if let Err(e) = self.handle.send_ping() {
            *slot = Some(session);
            return Err(e);
        }

        let max_payload = self.handle.config().max_payload_size;
        let (reader, writer) = tokio::io::split(stream);
        let frames_in = FramedRead::new(reader, PacketCodec::with_max_payload(max_payload));
        let frames_out = FramedWrite::new(writer, PacketCodec::with_max_payload(max_payload));
        let codec = WireCodec::new(Arc::clone(self.handle.registry()));
        let (deferred_tx, deferred_rx) = mpsc::unbounded_channel();

        self.handle.advance(ConnectionState::Handshaking);
        global_metrics().connection_established();

        let reader_task = tokio::spawn(read_loop(
            self.handle.clone(),
            Arc::clone(&self.dispatcher),
            codec.clone(),
            frames_in,
            deferred_tx,
        ));
        let update_task = tokio::spawn(update_loop(
            self.handle.clone(),
            codec,
            session,
            deferred_rx,
            Arc::clone(&self.extensions),
            frames_out,
        ));
        lock(&self.tasks).extend([reader_task, update_task]);

        debug!("Connection started");
        Ok(())
    }
}

impl<S> Drop for Connection<S> {
    fn drop(&mut self) {
        self.handle.shutdown();
    }
}

async fn read_loop<S, R>(
    handle: ConnectionHandle,
    dispatcher: Arc<Dispatcher<S>>,
    codec: WireCodec,
    mut frames: FramedRead<R, PacketCodec>,
    deferred: mpsc::UnboundedSender<DeferredTask<S>>,
) where
    S: 'static,
    R: AsyncRead + Unpin,
{
    let token = handle.shared.shutdown.clone();
    let mut invalid = 0u32;

    loop {
        let frame = tokio::select! {
            biased;
            _ = token.cancelled() => break,
            frame = frames.next() => frame,
        };

        match frame {
            Some(Ok(packet)) => {
                let keep_reading = on_payload(
                    &handle,
                    &dispatcher,
                    &codec,
                    &deferred,
                    &packet.payload,
                    &mut invalid,
                );
                if !keep_reading {
                    break;
                }
            }
            Some(Err(e)) => {
                warn!(connection = handle.id(), error = %e, "Stream error; dropping connection");
                global_metrics().connection_error();
                break;
            }
            None => {
                debug!(connection = handle.id(), "Peer closed the stream");
                break;
            }
        }
    }

    handle.shutdown();
}

/// Decode and route one payload. Returns whether the reader should continue.
fn on_payload<S: 'static>(
    handle: &ConnectionHandle,
    dispatcher: &Dispatcher<S>,
    codec: &WireCodec,
    deferred: &mpsc::UnboundedSender<DeferredTask<S>>,
    payload: &[u8],
    invalid: &mut u32,
) -> bool {
    let decoded = {
        let cipher = handle.read_cipher();
        codec.decode(payload, &cipher)
    };

    let message = match decoded {
        Ok(message) => message,
        Err(e) if !e.is_decode_error() => {
            error!(connection = handle.id(), error = %e, "Unrecoverable decode failure");
            global_metrics().connection_error();
            return false;
        }
        Err(e) => {
            *invalid += 1;
            global_metrics().invalid_message();
            let type_id = peek_type_id(payload).unwrap_or(builtin::INVALID_MESSAGE_ID);
            warn!(
                connection = handle.id(),
                type_id,
                consecutive = *invalid,
                error = %e,
                "Discarding undecodable message"
            );

            let name = handle
                .registry()
                .lookup_id(type_id)
                .map(|spec| spec.name.clone())
                .unwrap_or_default();
            if let Err(e) = handle.queue_invalid_notice(&name, type_id) {
                debug!(connection = handle.id(), error = %e, "Could not queue invalid-message notice");
            }

            if *invalid >= handle.config().max_invalid_messages {
                warn!(connection = handle.id(), "Too many invalid messages; dropping connection");
                global_metrics().connection_error();
                return false;
            }
            return true;
        }
    };

    *invalid = 0;
    global_metrics().message_received(payload.len() as u64);

    match on_message(handle, dispatcher, deferred, message) {
        Ok(()) => !handle.is_cancelled(),
        Err(e) => {
            error!(connection = handle.id(), error = %e, "Fatal protocol error");
            global_metrics().connection_error();
            false
        }
    }
}

fn on_message<S: 'static>(
    handle: &ConnectionHandle,
    dispatcher: &Dispatcher<S>,
    deferred: &mpsc::UnboundedSender<DeferredTask<S>>,
    message: MessageInstance,
) -> Result<()> {
    match message.type_id() {
        builtin::PUBLIC_KEY_ID => handle.on_public_key(&message),
        builtin::SESSION_KEY_ID => handle.on_session_key(&message),
        builtin::PING_ID => handle.answer_ping(&message),
        builtin::PONG_ID => handle.record_pong(&message),
        _ => dispatch(handle, dispatcher, deferred, message),
    }
}

fn dispatch<S: 'static>(
    handle: &ConnectionHandle,
    dispatcher: &Dispatcher<S>,
    deferred: &mpsc::UnboundedSender<DeferredTask<S>>,
    message: MessageInstance,
) -> Result<()> {
    let type_id = message.type_id();
    let is_notice = type_id == builtin::INVALID_MESSAGE_ID;
    if is_notice {
        warn!(
            connection = handle.id(),
            rejected = message.string(builtin::ARG_MESSAGE_NAME).unwrap_or_default(),
            rejected_id = message.int16(builtin::ARG_MESSAGE_ID).unwrap_or_default(),
            "Peer rejected a message"
        );
    }

    let Some(factory) = dispatcher.resolve(message.name()) else {
        if !is_notice {
            global_metrics().unresolved_message();
            debug!(connection = handle.id(), message = message.name(), "No handler registered");
            handle.queue_invalid_notice(message.name(), type_id)?;
        }
        return Ok(());
    };

    let name = message.name().to_string();
    let mut executable = match factory.create(message) {
        Ok(executable) => executable,
        Err(e @ ProtocolError::DisabledMessage(_)) => return Err(e),
        Err(e) => {
            warn!(connection = handle.id(), message = %name, error = %e, "Handler rejected message");
            return Ok(());
        }
    };

    match executable.immediate(handle) {
        Ok(()) => {}
        Err(e @ ProtocolError::DisabledMessage(_)) => return Err(e),
        Err(e) => {
            warn!(connection = handle.id(), message = %name, error = %e, "Immediate phase failed");
            return Ok(());
        }
    }

    deferred
        .send(executable)
        .map_err(|_| ProtocolError::ConnectionClosed)
}

async fn update_loop<S, W>(
    handle: ConnectionHandle,
    codec: WireCodec,
    mut session: S,
    mut deferred: mpsc::UnboundedReceiver<DeferredTask<S>>,
    extensions: Arc<Extensions<S>>,
    mut frames: FramedWrite<W, PacketCodec>,
) where
    S: Send + 'static,
    W: AsyncWrite + Unpin,
{
    let config = handle.config().clone();
    let token = handle.shared.shutdown.clone();
    let mut ticker = tokio::time::interval(config.update_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut tasks: Vec<PeriodicTask<S>> = Vec::new();
    let mut last_ping = Instant::now();

    loop {
        tokio::select! {
            biased;
            _ = token.cancelled() => break,
            _ = ticker.tick() => {}
        }

        run_deferred(&handle, &mut session, &mut deferred);

        tasks.extend(extensions.take_tasks());
        for task in tasks.iter_mut() {
            if let Err(e) = task(&mut session, &handle) {
                warn!(connection = handle.id(), error = %e, "Periodic task failed");
            }
        }

        if !config.ping_interval.is_zero() && last_ping.elapsed() >= config.ping_interval {
            last_ping = Instant::now();
            if let Err(e) = handle.send_ping() {
                debug!(connection = handle.id(), error = %e, "Could not queue ping");
            }
        }

        if let Err(e) = flush(&handle, &codec, &mut frames).await {
            warn!(connection = handle.id(), error = %e, "Write failed; dropping connection");
            global_metrics().connection_error();
            break;
        }
    }

    handle.shutdown();
    // the reader may have handed over work just before it stopped
    run_deferred(&handle, &mut session, &mut deferred);
    for hook in extensions.take_hooks() {
        hook(&mut session, &handle);
    }

    // messages queued before shutdown began still go out
    let drained = tokio::time::timeout(SHUTDOWN_TIMEOUT, async {
        flush(&handle, &codec, &mut frames).await?;
        frames.close().await
    })
    .await;
    if let Ok(Err(e)) = drained {
        debug!(connection = handle.id(), error = %e, "Final flush failed");
    }

    handle.advance(ConnectionState::Closed);
    global_metrics().connection_closed();
    info!(connection = handle.id(), "Connection closed");
}

fn run_deferred<S>(
    handle: &ConnectionHandle,
    session: &mut S,
    deferred: &mut mpsc::UnboundedReceiver<DeferredTask<S>>,
) {
    while let Ok(executable) = deferred.try_recv() {
        global_metrics().deferred_task_run();
        if let Err(e) = executable.deferred(session, handle) {
            warn!(connection = handle.id(), error = %e, "Deferred phase failed");
        }
    }
}

async fn flush<W>(
    handle: &ConnectionHandle,
    codec: &WireCodec,
    frames: &mut FramedWrite<W, PacketCodec>,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let batch = handle.take_deliverable();
    if batch.is_empty() {
        return Ok(());
    }

    let max_payload = handle.config().max_payload_size;
    for message in batch {
        let encoded = {
            let cipher = handle.read_cipher();
            codec.encode(&message, &cipher)
        };
        let payload = match encoded {
            Ok(payload) if payload.len() <= max_payload => payload,
            Ok(payload) => {
                error!(
                    connection = handle.id(),
                    message = message.name(),
                    size = payload.len(),
                    "Dropping oversized message"
                );
                continue;
            }
            Err(e) => {
                error!(
                    connection = handle.id(),
                    message = message.name(),
                    error = %e,
                    "Dropping unencodable message"
                );
                continue;
            }
        };
        global_metrics().message_sent(payload.len() as u64);
        frames.feed(Packet::new(payload.to_vec())).await?;
    }
    frames.flush().await
}
