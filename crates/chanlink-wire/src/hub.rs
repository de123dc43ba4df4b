//! Hub listens for peers, dials peers, and fans channel traffic out over
//! every connection it owns.

use crate::error::{WireError, WireResult};
use crate::transport::{Direction, Transport, TransportInfo};
use bytes::Bytes;
use chanlink_types::HubConfig;
use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

/// Per-transport failures collected by a fan-out write.
pub type FanOutErrors = Vec<(SocketAddr, WireError)>;

/// Which transports a fan-out operation touches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Selector<'a> {
    All,
    Name(&'a str),
    Direction(Direction),
}

impl Selector<'_> {
    fn matches(&self, transport: &Transport) -> bool {
        match self {
            Selector::All => true,
            Selector::Name(name) => transport.name().as_deref() == Some(*name),
            Selector::Direction(direction) => transport.direction() == Some(*direction),
        }
    }
}

struct HubInner {
    config: HubConfig,
    local_addr: SocketAddr,
    transports: RwLock<Vec<Transport>>,
    seen: Mutex<HashSet<SocketAddr>>,
    stopped: AtomicBool,
    shutdown: watch::Sender<bool>,
    changed: Notify,
    accept_task: Mutex<Option<JoinHandle<()>>>,
}

/// Connection manager. Cloning yields another handle to the same hub.
#[derive(Clone)]
pub struct Hub {
    inner: Arc<HubInner>,
}

impl std::fmt::Debug for Hub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Hub")
            .field("local_addr", &self.inner.local_addr)
            .field("transports", &self.transport_count())
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

impl Hub {
    /// Bind the listening socket and start accepting peers.
    pub async fn start(config: HubConfig) -> WireResult<Self> {
        let listener = bind_listener(&config).await?;
        let local_addr = listener.local_addr()?;

        info!(addr = %local_addr, "CL: hub listening");

        let (shutdown, _) = watch::channel(false);
        let hub = Self {
            inner: Arc::new(HubInner {
                config,
                local_addr,
                transports: RwLock::new(Vec::new()),
                seen: Mutex::new(HashSet::new()),
                stopped: AtomicBool::new(false),
                shutdown,
                changed: Notify::new(),
                accept_task: Mutex::new(None),
            }),
        };

        let accept_hub = hub.clone();
        let task = tokio::spawn(async move {
            accept_hub.accept_loop(listener).await;
        });
        *hub.inner
            .accept_task
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some(task);

        Ok(hub)
    }

    async fn accept_loop(self, listener: TcpListener) {
        let mut shutdown = self.inner.shutdown.subscribe();
        let io_timeout = self.inner.config.transport.io_timeout();

        loop {
            if *shutdown.borrow_and_update() {
                break;
            }
            tokio::select! {
                _ = shutdown.changed() => continue,
                accepted = tokio::time::timeout(io_timeout, listener.accept()) => match accepted {
                    Err(_) => continue,
                    Ok(Ok((stream, addr))) => {
                        self.register_inbound(stream, addr).await;
                    }
                    Ok(Err(e)) => {
                        error!(error = %e, "CL: accept failed, closing hub");
                        self.inner.stopped.store(true, Ordering::SeqCst);
                        self.inner.changed.notify_waiters();
                        self.close_transports().await;
                        break;
                    }
                },
            }
        }

        drop(listener);
        debug!(addr = %self.inner.local_addr, "CL: accept loop stopped");
    }

    /// Wrap an accepted socket, unless its remote address was seen before.
    pub(crate) async fn register_inbound(
        &self,
        stream: TcpStream,
        addr: SocketAddr,
    ) -> Option<Transport> {
        let fresh = self
            .inner
            .seen
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(addr);
        if !fresh {
            debug!(peer = %addr, "CL: ignoring duplicate inbound connection");
            return None;
        }

        debug!(peer = %addr, "CL: accepted connection");
        let transport = Transport::accept(stream, addr, self.inner.config.transport.clone()).await;
        self.push(transport.clone());
        if self.is_stopped() {
            transport.close().await;
        }
        Some(transport)
    }

    fn push(&self, transport: Transport) {
        self.inner
            .transports
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(transport);
        self.inner.changed.notify_waiters();
    }

    /// Dial a peer and announce ourselves to it as `name`.
    pub async fn connect(&self, name: &str, address: &str, port: u16) -> WireResult<Transport> {
        if self.is_stopped() {
            return Err(WireError::ConnectionClosed);
        }
        let transport = Transport::named(name, self.inner.config.transport.clone());
        self.push(transport.clone());
        transport.connect(address, port).await?;
        Ok(transport)
    }

    // -----------------------------------------------------------------------
    // Collection
    // -----------------------------------------------------------------------

    /// Snapshot of every transport, in the order they were added.
    pub fn transports(&self) -> Vec<Transport> {
        self.inner
            .transports
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn connections(&self) -> Vec<TransportInfo> {
        self.transports().iter().map(Transport::info).collect()
    }

    pub fn transport_count(&self) -> usize {
        self.inner
            .transports
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    /// Open transports matching `selector`.
    pub fn select(&self, selector: Selector<'_>) -> Vec<Transport> {
        self.transports()
            .into_iter()
            .filter(|t| t.is_open() && selector.matches(t))
            .collect()
    }

    /// Wait until the hub owns at least one transport and return the first.
    pub async fn wait_for_transport(&self) -> WireResult<Transport> {
        let mut transports = self.wait_for_transport_count(1).await?;
        Ok(transports.swap_remove(0))
    }

    /// Wait until the hub owns at least `count` transports.
    pub async fn wait_for_transport_count(&self, count: usize) -> WireResult<Vec<Transport>> {
        loop {
            let notified = self.inner.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let transports = self.transports();
            if transports.len() >= count {
                return Ok(transports);
            }
            if self.is_stopped() {
                return Err(WireError::ConnectionClosed);
            }
            notified.await;
        }
    }

    // -----------------------------------------------------------------------
    // Fan-out writes
    // -----------------------------------------------------------------------

    /// Write to every open transport matching `selector`.
    pub async fn write_to(
        &self,
        selector: Selector<'_>,
        channel: &str,
        data: impl Into<Bytes>,
    ) -> FanOutErrors {
        let data = data.into();
        let mut errors = Vec::new();
        for transport in self.select(selector) {
            if let Err(e) = transport.write(channel, data.clone()).await {
                errors.push((addr_of(&transport), e));
            }
        }
        errors
    }

    pub async fn write_all(&self, channel: &str, data: impl Into<Bytes>) -> FanOutErrors {
        self.write_to(Selector::All, channel, data).await
    }

    pub async fn write_to_name(
        &self,
        name: &str,
        channel: &str,
        data: impl Into<Bytes>,
    ) -> FanOutErrors {
        self.write_to(Selector::Name(name), channel, data).await
    }

    /// Write to transports this hub dialed.
    pub async fn write_to_local(&self, channel: &str, data: impl Into<Bytes>) -> FanOutErrors {
        self.write_to(Selector::Direction(Direction::Local), channel, data)
            .await
    }

    /// Write to transports this hub accepted.
    pub async fn write_to_remote(&self, channel: &str, data: impl Into<Bytes>) -> FanOutErrors {
        self.write_to(Selector::Direction(Direction::Remote), channel, data)
            .await
    }

    pub async fn write_image_to(&self, selector: Selector<'_>, data: impl Into<Bytes>) -> FanOutErrors {
        let data = data.into();
        let mut errors = Vec::new();
        for transport in self.select(selector) {
            if let Err(e) = transport.write_image(data.clone()).await {
                errors.push((addr_of(&transport), e));
            }
        }
        errors
    }

    pub async fn write_image_all(&self, data: impl Into<Bytes>) -> FanOutErrors {
        self.write_image_to(Selector::All, data).await
    }

    pub async fn write_image_to_name(&self, name: &str, data: impl Into<Bytes>) -> FanOutErrors {
        self.write_image_to(Selector::Name(name), data).await
    }

    pub async fn write_image_to_local(&self, data: impl Into<Bytes>) -> FanOutErrors {
        self.write_image_to(Selector::Direction(Direction::Local), data)
            .await
    }

    pub async fn write_image_to_remote(&self, data: impl Into<Bytes>) -> FanOutErrors {
        self.write_image_to(Selector::Direction(Direction::Remote), data)
            .await
    }

    /// Every open transport has its write gate open.
    pub fn can_write_all(&self) -> bool {
        self.select(Selector::All).iter().all(Transport::can_write)
    }

    pub async fn write_all_when_ready(&self, channel: &str, data: impl Into<Bytes>) -> FanOutErrors {
        self.write_when_ready_to(Selector::All, channel, data.into())
            .await
    }

    pub async fn write_to_name_when_ready(
        &self,
        name: &str,
        channel: &str,
        data: impl Into<Bytes>,
    ) -> FanOutErrors {
        self.write_when_ready_to(Selector::Name(name), channel, data.into())
            .await
    }

    async fn write_when_ready_to(
        &self,
        selector: Selector<'_>,
        channel: &str,
        data: Bytes,
    ) -> FanOutErrors {
        let mut errors = Vec::new();
        for transport in self.select(selector) {
            if let Err(e) = transport.write_when_ready(channel, data.clone()).await {
                errors.push((addr_of(&transport), e));
            }
        }
        errors
    }

    /// Wait until every open transport is ready to write. Transports that
    /// close while waiting are reported and skipped.
    pub async fn wait_for_all_ready(&self) -> FanOutErrors {
        let mut errors = Vec::new();
        for transport in self.select(Selector::All) {
            if let Err(e) = transport.wait_for_ready().await {
                errors.push((addr_of(&transport), e));
            }
        }
        errors
    }

    // -----------------------------------------------------------------------
    // Fan-out reads
    // -----------------------------------------------------------------------

    /// Last value of `channel` on every transport matching `selector` that
    /// has one. Closed transports keep their last values.
    pub fn get_from(&self, selector: Selector<'_>, channel: &str) -> Vec<Bytes> {
        self.transports()
            .iter()
            .filter(|t| selector.matches(t))
            .filter_map(|t| t.get(channel))
            .collect()
    }

    pub fn get_all(&self, channel: &str) -> Vec<Bytes> {
        self.get_from(Selector::All, channel)
    }

    pub fn get_by_name(&self, name: &str, channel: &str) -> Vec<Bytes> {
        self.get_from(Selector::Name(name), channel)
    }

    pub fn get_local(&self, channel: &str) -> Vec<Bytes> {
        self.get_from(Selector::Direction(Direction::Local), channel)
    }

    pub fn get_remote(&self, channel: &str) -> Vec<Bytes> {
        self.get_from(Selector::Direction(Direction::Remote), channel)
    }

    pub fn get_image_all(&self) -> Vec<Bytes> {
        self.transports()
            .iter()
            .filter_map(Transport::get_image)
            .collect()
    }

    /// Wait until every open transport holds a value for `channel`, then
    /// return all values along with the transports that closed first.
    pub async fn wait_for_get_all(&self, channel: &str) -> (Vec<Bytes>, FanOutErrors) {
        let mut errors = Vec::new();
        for transport in self.select(Selector::All) {
            if let Err(e) = transport.wait_for_channel(channel).await {
                errors.push((addr_of(&transport), e));
            }
        }
        (self.get_all(channel), errors)
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    pub fn port(&self) -> u16 {
        self.inner.local_addr.port()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr
    }

    pub fn config(&self) -> &HubConfig {
        &self.inner.config
    }

    pub fn is_open(&self) -> bool {
        !self.is_stopped()
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::SeqCst)
    }

    /// Stop accepting, close every transport and wait for the accept loop
    /// to release the listener. Idempotent.
    pub async fn close(&self) {
        if !self.inner.stopped.swap(true, Ordering::SeqCst) {
            info!(addr = %self.inner.local_addr, "CL: hub closing");
        }
        self.inner.shutdown.send_replace(true);
        self.inner.changed.notify_waiters();

        self.close_transports().await;

        let task = self
            .inner
            .accept_task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }

    async fn close_transports(&self) {
        for transport in self.transports() {
            transport.close().await;
        }
    }
}

fn addr_of(transport: &Transport) -> SocketAddr {
    transport
        .peer_addr()
        .unwrap_or_else(|| SocketAddr::from(([0, 0, 0, 0], 0)))
}

/// Bind `host:port`, moving to the next port on address-in-use when the
/// configuration allows it.
async fn bind_listener(config: &HubConfig) -> WireResult<TcpListener> {
    let first = config.base_port();
    let mut port = first;
    let mut increments = 0u32;
    let bind_timeout = config.transport.io_timeout();

    loop {
        let addr = format!("{}:{}", config.host, port);
        match tokio::time::timeout(bind_timeout, TcpListener::bind(&addr)).await {
            Err(_) => {
                debug!(addr = %addr, "CL: bind timed out, retrying");
            }
            Ok(Ok(listener)) => return Ok(listener),
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::AddrInUse => {
                if !config.auto_port() {
                    return Err(WireError::PortInUse { port, source: e });
                }
                if increments >= config.max_port_retries || port == u16::MAX {
                    return Err(WireError::PortRetriesExhausted { first, last: port });
                }
                increments += 1;
                port += 1;
                debug!(port, "CL: port in use, trying next");
            }
            Ok(Err(e)) => return Err(WireError::Bind { addr, source: e }),
        }
    }
}
