//! Transport: one endpoint of one duplex peer connection.
//!
//! A [`Transport`] owns a TCP stream split into halves. The read half is
//! driven by a dedicated read-loop task that de-frames records, answers
//! acknowledgement requests, applies meta records (acknowledge, name
//! assignment, closing notice) and stores channel values. The write half sits
//! behind an async mutex so that the write-gate decision and the socket write
//! happen atomically with respect to other senders.
//!
//! State machine: `Idle → Connecting → Open → Closing → Closed`. Inbound
//! transports start directly in `Open`. `Closed` is terminal.
//!
//! Flow control: when a channel record is sent with `ack_required` the write
//! gate closes until the peer's acknowledgement arrives. While the gate is
//! closed, application writes are queued (buffering enabled) or rejected
//! with [`WireError::Unavailable`]. Meta records always bypass the gate.

use crate::codec::{Codec, FrameDecoder};
use crate::error::{is_transient_io, WireError, WireResult};
use crate::message::{self, Message, Meta, IMAGE, NAME_CONN};
use crate::retry::{retry_async, RetryOutcome};
use bytes::Bytes;
use chanlink_types::TransportConfig;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, watch, Notify};
use tracing::{debug, info, warn};

/// Lifecycle state of a transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportState {
    Idle,
    Connecting,
    Open,
    Closing,
    Closed,
}

impl std::fmt::Display for TransportState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Connecting => write!(f, "connecting"),
            Self::Open => write!(f, "open"),
            Self::Closing => write!(f, "closing"),
            Self::Closed => write!(f, "closed"),
        }
    }
}

/// Which side initiated the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    /// This process dialed out.
    Local,
    /// The peer dialed in and a hub accepted it.
    Remote,
}

/// Events published by a transport's read loop.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// A channel value arrived.
    Message { channel: String, data: Bytes },
    /// The peer assigned this connection a name.
    NameAssigned(String),
    /// The peer acknowledged the last ack-required write.
    WriteAvailable,
    /// The transport reached `Closed`.
    Closed,
}

/// Handler invoked on the read-loop task.
///
/// Handlers must not block: the read loop does not process further records
/// until the handler returns.
pub trait ChannelHandler: Send + Sync + 'static {
    /// A value arrived on the channel the handler was registered for.
    fn on_message(&self, transport: &Transport, channel: &str, data: &Bytes);

    /// The transport closed.
    fn on_close(&self, _transport: &Transport) {}
}

impl<F> ChannelHandler for F
where
    F: Fn(&Transport, &str, &Bytes) + Send + Sync + 'static,
{
    fn on_message(&self, transport: &Transport, channel: &str, data: &Bytes) {
        self(transport, channel, data)
    }
}

/// Point-in-time description of a transport.
#[derive(Debug, Clone, Serialize)]
pub struct TransportInfo {
    pub id: String,
    pub name: Option<String>,
    pub direction: Option<Direction>,
    pub peer_addr: Option<SocketAddr>,
    pub state: TransportState,
    pub connected_at: Option<DateTime<Utc>>,
}

/// State guarded by the per-transport mutex.
struct Shared {
    name: Option<String>,
    direction: Option<Direction>,
    peer_addr: Option<SocketAddr>,
    connected_at: Option<DateTime<Utc>>,
    channels: HashMap<String, Bytes>,
    /// Per-channel receive counters, used by `wait_for_new_value`.
    versions: HashMap<String, u64>,
    write_available: bool,
    pending: VecDeque<Queued>,
    handlers: HashMap<String, Arc<dyn ChannelHandler>>,
}

/// A write held back by the gate, already framed.
struct Queued {
    frame: Vec<u8>,
    ack_required: bool,
}

type WriterGuard<'a> = tokio::sync::MutexGuard<'a, Option<OwnedWriteHalf>>;

struct Inner {
    id: String,
    config: TransportConfig,
    codec: Codec,
    shared: Mutex<Shared>,
    writer: tokio::sync::Mutex<Option<OwnedWriteHalf>>,
    state: watch::Sender<TransportState>,
    shutdown: watch::Sender<bool>,
    changed: Notify,
    events: broadcast::Sender<TransportEvent>,
}

/// One endpoint of a duplex peer connection. Cloning yields another handle
/// to the same endpoint.
#[derive(Clone)]
pub struct Transport {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let shared = self.lock();
        f.debug_struct("Transport")
            .field("id", &self.inner.id)
            .field("name", &shared.name)
            .field("direction", &shared.direction)
            .field("peer_addr", &shared.peer_addr)
            .field("state", &*self.inner.state.borrow())
            .finish()
    }
}

impl Transport {
    /// Create an idle outbound transport.
    pub fn new(config: TransportConfig) -> Self {
        Self::build(config, None)
    }

    /// Create an idle outbound transport that announces `name` to the peer
    /// as soon as the connection opens.
    pub fn named(name: impl Into<String>, config: TransportConfig) -> Self {
        Self::build(config, Some(name.into()))
    }

    /// Wrap a socket accepted by a listener. The transport starts `Open`.
    pub async fn accept(stream: TcpStream, peer_addr: SocketAddr, config: TransportConfig) -> Self {
        let transport = Self::build(config, None);
        transport.open(stream, peer_addr, Direction::Remote).await;
        transport
    }

    fn build(config: TransportConfig, name: Option<String>) -> Self {
        let (state, _) = watch::channel(TransportState::Idle);
        let (shutdown, _) = watch::channel(false);
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        Self {
            inner: Arc::new(Inner {
                id: uuid::Uuid::new_v4().to_string(),
                codec: Codec::from_config(&config),
                config,
                shared: Mutex::new(Shared {
                    name,
                    direction: None,
                    peer_addr: None,
                    connected_at: None,
                    channels: HashMap::new(),
                    versions: HashMap::new(),
                    write_available: true,
                    pending: VecDeque::new(),
                    handlers: HashMap::new(),
                }),
                writer: tokio::sync::Mutex::new(None),
                state,
                shutdown,
                changed: Notify::new(),
                events,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Shared> {
        self.inner.shared.lock().unwrap_or_else(|e| e.into_inner())
    }

    // -----------------------------------------------------------------------
    // Connection establishment
    // -----------------------------------------------------------------------

    /// Connect to `address:port`.
    ///
    /// Refused connections, timeouts and resolution failures are retried
    /// according to the configured policy; any other error is returned
    /// immediately and leaves the transport `Closed`. If the transport was
    /// created with [`Transport::named`], the name is announced right after
    /// the connection opens.
    pub async fn connect(&self, address: &str, port: u16) -> WireResult<()> {
        let mut from_idle = false;
        self.inner.state.send_if_modified(|state| {
            from_idle = *state == TransportState::Idle;
            if from_idle {
                *state = TransportState::Connecting;
            }
            from_idle
        });
        if !from_idle {
            return Err(WireError::InvalidState {
                current: self.state(),
                operation: "connect",
            });
        }

        let target = format!("{address}:{port}");
        info!(id = %self.inner.id, target = %target, "CL: connecting");

        let timeout = self.inner.config.connect_timeout();
        let mut shutdown = self.inner.shutdown.subscribe();
        let outcome = tokio::select! {
            outcome = retry_async(
                &self.inner.config.connect_retry,
                || connect_once(&target, timeout),
                is_transient_io,
            ) => outcome,
            _ = async { let _ = shutdown.wait_for(|stop| *stop).await; } => {
                debug!(id = %self.inner.id, "CL: connect cancelled by close");
                self.mark_closed();
                return Err(WireError::ConnectionClosed);
            }
        };

        match outcome {
            RetryOutcome::Success {
                result: (stream, addr),
                attempts,
            } => {
                debug!(id = %self.inner.id, %addr, attempts, "CL: connected");
                self.open(stream, addr, Direction::Local).await;
                if let Some(name) = self.name() {
                    self.send(Message::name_assignment(&name)).await?;
                }
                Ok(())
            }
            RetryOutcome::Fatal { error, .. } => {
                warn!(id = %self.inner.id, target = %target, error = %error, "CL: connect failed");
                self.mark_closed();
                Err(WireError::Io(error))
            }
            RetryOutcome::Exhausted {
                last_error,
                attempts,
            } => {
                self.mark_closed();
                Err(WireError::RetriesExhausted {
                    target,
                    attempts,
                    source: last_error,
                })
            }
        }
    }

    async fn open(&self, stream: TcpStream, peer_addr: SocketAddr, direction: Direction) {
        if let Err(e) = stream.set_nodelay(true) {
            debug!(id = %self.inner.id, error = %e, "CL: set_nodelay failed");
        }
        let (reader, writer) = stream.into_split();
        *self.inner.writer.lock().await = Some(writer);
        {
            let mut shared = self.lock();
            shared.direction = Some(direction);
            shared.peer_addr = Some(peer_addr);
            shared.connected_at = Some(Utc::now());
        }
        self.inner.state.send_replace(TransportState::Open);
        self.inner.changed.notify_waiters();

        info!(
            id = %self.inner.id,
            peer = %peer_addr,
            direction = ?direction,
            "CL: transport open"
        );

        let transport = self.clone();
        tokio::spawn(async move {
            transport.read_loop(reader).await;
        });
    }

    /// Set the local name and announce it to the peer.
    pub async fn assign_name(&self, name: impl Into<String>) -> WireResult<()> {
        let name = name.into();
        self.lock().name = Some(name.clone());
        self.inner.changed.notify_waiters();
        self.send(Message::name_assignment(&name)).await
    }

    // -----------------------------------------------------------------------
    // Writing
    // -----------------------------------------------------------------------

    /// Send `data` on `channel`.
    pub async fn write(&self, channel: &str, data: impl Into<Bytes>) -> WireResult<()> {
        check_channel(channel)?;
        self.send(Message::data(channel, data)).await
    }

    /// Send `data` on `channel` and close the write gate until the peer
    /// acknowledges it.
    pub async fn write_acked(&self, channel: &str, data: impl Into<Bytes>) -> WireResult<()> {
        check_channel(channel)?;
        let mut msg = Message::data(channel, data);
        msg.ack_required = true;
        self.send(msg).await
    }

    /// Send a bulk payload on the reserved image channel. Always
    /// acknowledged, so at most one bulk payload is in flight.
    pub async fn write_image(&self, data: impl Into<Bytes>) -> WireResult<()> {
        self.send(Message::image(data)).await
    }

    /// Wait until the write gate opens and the queue is drained, then write.
    pub async fn write_when_ready(&self, channel: &str, data: impl Into<Bytes>) -> WireResult<()> {
        check_channel(channel)?;
        self.wait_for_ready().await?;
        self.write(channel, data).await
    }

    async fn send(&self, msg: Message) -> WireResult<()> {
        let writer = self.inner.writer.lock().await;
        self.send_locked(writer, msg).await
    }

    /// Gate decision and socket write under the writer lock. Meta records
    /// bypass the gate and may still go out while `Closing`.
    async fn send_locked(
        &self,
        mut writer: WriterGuard<'_>,
        mut msg: Message,
    ) -> WireResult<()> {
        let control = msg.is_control();
        if self.inner.config.require_ack && !control {
            msg.ack_required = true;
        }
        // Oversized records fail here, before the gate can close.
        let frame = self.inner.codec.encode(&msg)?;

        match self.state() {
            TransportState::Open => {}
            TransportState::Closing if control => {}
            TransportState::Idle | TransportState::Connecting => {
                return Err(WireError::NotConnected)
            }
            TransportState::Closing | TransportState::Closed => {
                return Err(WireError::ConnectionClosed)
            }
        }
        if writer.is_none() {
            return Err(WireError::ConnectionClosed);
        }

        if !control {
            let mut shared = self.lock();
            if !shared.write_available || !shared.pending.is_empty() {
                if !self.inner.config.buffer_enabled {
                    return Err(WireError::Unavailable);
                }
                debug!(
                    id = %self.inner.id,
                    channel = %msg.channel,
                    queued = shared.pending.len() + 1,
                    "CL: write gate closed, queueing"
                );
                shared.pending.push_back(Queued {
                    frame,
                    ack_required: msg.ack_required,
                });
                return Ok(());
            }
            if msg.ack_required {
                shared.write_available = false;
            }
        }

        self.write_frame(&mut writer, &frame).await
    }

    /// Write one frame within the I/O timeout. A failed or stalled write
    /// releases the socket and shuts the transport down.
    async fn write_frame(
        &self,
        writer: &mut Option<OwnedWriteHalf>,
        frame: &[u8],
    ) -> WireResult<()> {
        let Some(stream) = writer.as_mut() else {
            return Err(WireError::ConnectionClosed);
        };
        let io_timeout = self.inner.config.io_timeout();
        let written = tokio::time::timeout(io_timeout, async {
            stream.write_all(frame).await?;
            stream.flush().await
        })
        .await
        .unwrap_or_else(|_| {
            Err(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                format!("write stalled for {io_timeout:?}"),
            ))
        });

        if let Err(e) = written {
            warn!(id = %self.inner.id, error = %e, bytes = frame.len(), "CL: write failed, closing");
            writer.take();
            self.inner.shutdown.send_replace(true);
            return Err(WireError::Io(e));
        }
        // The read loop finished while this write held the socket.
        if self.state() == TransportState::Closed {
            writer.take();
        }
        Ok(())
    }

    /// Send queued writes, oldest first, while the gate stays open.
    async fn flush_pending(&self) -> WireResult<()> {
        if self.lock().pending.is_empty() {
            return Ok(());
        }
        let mut writer = self.inner.writer.lock().await;
        if writer.is_none() {
            return Ok(());
        }
        let mut sent = 0usize;
        loop {
            let frame = {
                let mut shared = self.lock();
                if !shared.write_available {
                    break;
                }
                let Some(queued) = shared.pending.pop_front() else {
                    break;
                };
                if queued.ack_required {
                    shared.write_available = false;
                }
                queued.frame
            };
            self.write_frame(&mut writer, &frame).await?;
            sent += 1;
        }
        if sent > 0 {
            debug!(id = %self.inner.id, sent, "CL: flushed queued writes");
            self.inner.changed.notify_waiters();
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Read loop
    // -----------------------------------------------------------------------

    async fn read_loop(self, mut reader: OwnedReadHalf) {
        let mut shutdown = self.inner.shutdown.subscribe();
        let mut decoder = self.inner.codec.frame_decoder();
        let mut buf = vec![0u8; self.inner.config.read_buffer_size.max(1)];
        let io_timeout = self.inner.config.io_timeout();

        let reason = loop {
            if *shutdown.borrow_and_update() {
                break "local close";
            }

            tokio::select! {
                _ = shutdown.changed() => continue,
                read = tokio::time::timeout(io_timeout, reader.read(&mut buf)) => match read {
                    // Timeout: fall through to the pending flush.
                    Err(_) => {}
                    Ok(Ok(0)) => break "peer disconnected",
                    Ok(Ok(n)) => {
                        decoder.extend(&buf[..n]);
                        match self.drain_records(&mut decoder).await {
                            Ok(false) => {}
                            Ok(true) => break "closing notice",
                            Err(e) => {
                                warn!(id = %self.inner.id, error = %e, "CL: closing after error");
                                break "protocol error";
                            }
                        }
                    }
                    Ok(Err(e)) => {
                        debug!(id = %self.inner.id, error = %e, "CL: read failed");
                        break "read error";
                    }
                },
            }

            if let Err(e) = self.flush_pending().await {
                debug!(id = %self.inner.id, error = %e, "CL: flush failed");
                break "write error";
            }
        };

        drop(reader);
        self.finish(reason).await;
    }

    /// Handle every complete record. Returns `true` once a closing notice
    /// is seen.
    async fn drain_records(&self, decoder: &mut FrameDecoder) -> WireResult<bool> {
        while let Some(record) = decoder.next_record()? {
            let msg = match self.inner.codec.decode(&record) {
                Ok(msg) => msg,
                Err(e) => {
                    debug!(id = %self.inner.id, error = %e, "CL: dropping malformed record");
                    continue;
                }
            };
            if self.handle_message(msg).await? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    async fn handle_message(&self, msg: Message) -> WireResult<bool> {
        // The peer learns the value landed before it becomes visible here.
        if msg.ack_required {
            self.send(Message::ack()).await?;
        }

        match msg.meta {
            Meta::Acknowledge => {
                self.lock().write_available = true;
                self.inner.changed.notify_waiters();
                let _ = self.inner.events.send(TransportEvent::WriteAvailable);
            }
            Meta::Closing => {
                info!(id = %self.inner.id, "CL: peer sent closing notice");
                return Ok(true);
            }
            Meta::NameAssignment => {
                if msg.channel != NAME_CONN {
                    return Err(WireError::Protocol(format!(
                        "name assignment on channel '{}'",
                        msg.channel
                    )));
                }
                let name = String::from_utf8_lossy(&msg.data).into_owned();
                debug!(id = %self.inner.id, name = %name, "CL: peer assigned name");
                self.lock().name = Some(name.clone());
                self.inner.changed.notify_waiters();
                let _ = self.inner.events.send(TransportEvent::NameAssigned(name));
            }
            Meta::None => {
                if msg.channel.is_empty() {
                    debug!(id = %self.inner.id, "CL: dropping record without channel");
                } else {
                    self.store(msg.channel, msg.data);
                }
            }
        }
        Ok(false)
    }

    fn store(&self, channel: String, data: Bytes) {
        let handler = {
            let mut shared = self.lock();
            shared.channels.insert(channel.clone(), data.clone());
            *shared.versions.entry(channel.clone()).or_insert(0) += 1;
            shared.handlers.get(&channel).cloned()
        };
        self.inner.changed.notify_waiters();
        if let Some(handler) = handler {
            handler.on_message(self, &channel, &data);
        }
        let _ = self
            .inner
            .events
            .send(TransportEvent::Message { channel, data });
    }

    async fn finish(&self, reason: &str) {
        // A writer stuck on the socket releases it when its write times out.
        if let Ok(mut writer) = self.inner.writer.try_lock() {
            writer.take();
        }
        self.inner.shutdown.send_replace(true);
        self.mark_closed();

        let handlers: Vec<Arc<dyn ChannelHandler>> =
            self.lock().handlers.values().cloned().collect();
        for handler in handlers {
            handler.on_close(self);
        }
        let _ = self.inner.events.send(TransportEvent::Closed);
        info!(id = %self.inner.id, reason, "CL: transport closed");
    }

    fn mark_closed(&self) {
        self.inner.state.send_replace(TransportState::Closed);
        self.inner.changed.notify_waiters();
    }

    // -----------------------------------------------------------------------
    // Closing
    // -----------------------------------------------------------------------

    /// Close the connection. Idempotent.
    ///
    /// An open transport first sends a closing notice to the peer (failures
    /// are ignored), then waits for its read loop to release the socket.
    pub async fn close(&self) {
        let mut previous = TransportState::Closed;
        self.inner.state.send_if_modified(|state| {
            previous = *state;
            match *state {
                TransportState::Open => {
                    *state = TransportState::Closing;
                    true
                }
                TransportState::Idle => {
                    *state = TransportState::Closed;
                    true
                }
                _ => false,
            }
        });

        match previous {
            TransportState::Idle => {
                self.inner.shutdown.send_replace(true);
                self.inner.changed.notify_waiters();
                return;
            }
            TransportState::Open => {
                self.inner.changed.notify_waiters();
                self.send_closing_notice().await;
                self.inner.shutdown.send_replace(true);
            }
            TransportState::Connecting => {
                self.inner.shutdown.send_replace(true);
            }
            TransportState::Closing | TransportState::Closed => {}
        }
        self.wait_for_close().await;
    }

    /// Best effort: skipped if another write holds the socket for longer
    /// than the I/O timeout.
    async fn send_closing_notice(&self) {
        let io_timeout = self.inner.config.io_timeout();
        let sent = match tokio::time::timeout(io_timeout, self.inner.writer.lock()).await {
            Ok(writer) => self.send_locked(writer, Message::closing()).await,
            Err(_) => Err(WireError::Unavailable),
        };
        if let Err(e) = sent {
            debug!(id = %self.inner.id, error = %e, "CL: closing notice not delivered");
        }
    }

    // -----------------------------------------------------------------------
    // Reading
    // -----------------------------------------------------------------------

    /// Last value received on `channel`. Does not consume it.
    pub fn get(&self, channel: &str) -> Option<Bytes> {
        self.lock().channels.get(channel).cloned()
    }

    /// Last bulk payload received.
    pub fn get_image(&self) -> Option<Bytes> {
        self.get(IMAGE)
    }

    /// Names of every channel that has received a value.
    pub fn channel_names(&self) -> Vec<String> {
        self.lock().channels.keys().cloned().collect()
    }

    /// Invoke `handler` for every value arriving on `channel`, replacing any
    /// handler registered before.
    pub fn register_callback<H: ChannelHandler>(&self, channel: &str, handler: H) {
        self.lock()
            .handlers
            .insert(channel.to_string(), Arc::new(handler));
    }

    pub fn remove_callback(&self, channel: &str) -> bool {
        self.lock().handlers.remove(channel).is_some()
    }

    /// Subscribe to this transport's event stream.
    pub fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.inner.events.subscribe()
    }

    // -----------------------------------------------------------------------
    // Waiting
    // -----------------------------------------------------------------------

    async fn wait_until<T>(&self, mut check: impl FnMut(&Shared) -> Option<T>) -> WireResult<T> {
        loop {
            let notified = self.inner.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(value) = check(&self.lock()) {
                return Ok(value);
            }
            if self.state() == TransportState::Closed {
                return Err(WireError::ConnectionClosed);
            }
            notified.await;
        }
    }

    /// Wait until `channel` holds a value and return it.
    pub async fn wait_for_channel(&self, channel: &str) -> WireResult<Bytes> {
        self.wait_until(|shared| shared.channels.get(channel).cloned())
            .await
    }

    /// Wait for a value on `channel` that arrives after this call.
    pub async fn wait_for_new_value(&self, channel: &str) -> WireResult<Bytes> {
        let seen = self.lock().versions.get(channel).copied().unwrap_or(0);
        self.wait_until(|shared| {
            let version = shared.versions.get(channel).copied().unwrap_or(0);
            if version > seen {
                shared.channels.get(channel).cloned()
            } else {
                None
            }
        })
        .await
    }

    /// Wait until the connection has a name.
    pub async fn wait_for_name(&self) -> WireResult<String> {
        self.wait_until(|shared| shared.name.clone()).await
    }

    /// Wait until the write gate is open and no writes are queued.
    pub async fn wait_for_ready(&self) -> WireResult<()> {
        self.wait_until(|shared| (shared.write_available && shared.pending.is_empty()).then_some(()))
            .await
    }

    /// Wait until the transport is open.
    pub async fn wait_for_open(&self) -> WireResult<()> {
        let mut rx = self.inner.state.subscribe();
        let state = rx
            .wait_for(|s| !matches!(s, TransportState::Idle | TransportState::Connecting))
            .await
            .map(|s| *s)
            .unwrap_or(TransportState::Closed);
        match state {
            TransportState::Open => Ok(()),
            _ => Err(WireError::ConnectionClosed),
        }
    }

    /// Wait until the transport reaches `Closed`.
    pub async fn wait_for_close(&self) {
        let mut rx = self.inner.state.subscribe();
        let _ = rx.wait_for(|s| *s == TransportState::Closed).await;
    }

    /// [`Transport::wait_for_close`] bounded by `timeout`. Returns whether
    /// the transport closed in time.
    pub async fn wait_for_close_timeout(&self, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, self.wait_for_close())
            .await
            .is_ok()
    }

    // -----------------------------------------------------------------------
    // Accessors
    // -----------------------------------------------------------------------

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn name(&self) -> Option<String> {
        self.lock().name.clone()
    }

    pub fn direction(&self) -> Option<Direction> {
        self.lock().direction
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.lock().peer_addr
    }

    pub fn state(&self) -> TransportState {
        *self.inner.state.borrow()
    }

    /// The connection is open for traffic.
    pub fn is_open(&self) -> bool {
        self.state() == TransportState::Open
    }

    /// The transport is closing or closed.
    pub fn is_stopped(&self) -> bool {
        matches!(
            self.state(),
            TransportState::Closing | TransportState::Closed
        )
    }

    /// The write gate is open.
    pub fn can_write(&self) -> bool {
        self.is_open() && self.lock().write_available
    }

    /// Writes queued behind the write gate.
    pub fn pending_len(&self) -> usize {
        self.lock().pending.len()
    }

    pub fn config(&self) -> &TransportConfig {
        &self.inner.config
    }

    pub fn info(&self) -> TransportInfo {
        let shared = self.lock();
        TransportInfo {
            id: self.inner.id.clone(),
            name: shared.name.clone(),
            direction: shared.direction,
            peer_addr: shared.peer_addr,
            state: self.state(),
            connected_at: shared.connected_at,
        }
    }
}

fn check_channel(channel: &str) -> WireResult<()> {
    message::validate_channel(channel).map_err(|reason| WireError::InvalidChannel {
        channel: channel.to_string(),
        reason,
    })
}

/// One connect attempt: resolve, then try each address in turn.
async fn connect_once(
    target: &str,
    timeout: Duration,
) -> std::io::Result<(TcpStream, SocketAddr)> {
    use std::io::{Error, ErrorKind};

    let addrs: Vec<SocketAddr> = tokio::net::lookup_host(target)
        .await
        .map_err(|e| Error::new(ErrorKind::NotFound, format!("resolve {target}: {e}")))?
        .collect();
    if addrs.is_empty() {
        return Err(Error::new(
            ErrorKind::NotFound,
            format!("resolve {target}: no addresses"),
        ));
    }

    let mut last_error = None;
    for addr in addrs {
        match tokio::time::timeout(timeout, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => return Ok((stream, addr)),
            Ok(Err(e)) => last_error = Some(e),
            Err(_) => {
                last_error = Some(Error::new(
                    ErrorKind::TimedOut,
                    format!("connect to {addr} timed out"),
                ))
            }
        }
    }
    Err(last_error.unwrap_or_else(|| Error::from(ErrorKind::NotFound)))
}
