//! Connect-side endpoint and the message client built on it.
//!
//! [`ClientEndpoint`] owns at most one live connection to an address and
//! the retry loop that establishes it. Concurrent `connect` calls share one
//! in-flight attempt. [`IpcMessageClient`] layers one-way `send` and
//! correlated `request` on top, sharing endpoints per address through a
//! [`SharedRegistry`].

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, LazyLock, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures_util::future::{BoxFuture, FutureExt, Shared};
use tokio::io::AsyncReadExt;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::address::{write_frame, BoxReader, IpcStream, SharedWriter, SocketAddress};
use super::deadline::with_timeout;
use super::framing::{Body, Frame, FrameDecoder, MessageId};
use super::registry::{SharedRegistry, SharedResource};
use super::server::READ_CHUNK;
use crate::error::{is_disconnect, IpcError, Result};

/// Pause between failed connection attempts.
pub const CONNECT_RETRY_INTERVAL: Duration = Duration::from_secs(1);

type ConnectOutcome = Shared<BoxFuture<'static, Result<()>>>;

/// One established connection.
struct Connection {
    /// Read half, until a reader takes it.
    reader: Option<BoxReader>,
    writer: SharedWriter,
}

#[derive(Default)]
struct ClientState {
    closing: bool,
    conn: Option<Connection>,
    connecting: Option<ConnectOutcome>,
}

struct EndpointInner {
    address: SocketAddress,
    state: Mutex<ClientState>,
    shutdown: CancellationToken,
    attempts: AtomicUsize,
    /// Serializes reply reading across every request on this endpoint.
    replies: tokio::sync::Mutex<ReplyReader>,
    /// Requests still waiting, and replies read on their behalf.
    outstanding: Mutex<Outstanding>,
    next_mid: AtomicU64,
}

impl EndpointInner {
    fn lock(&self) -> MutexGuard<'_, ClientState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn outstanding(&self) -> MutexGuard<'_, Outstanding> {
        self.outstanding.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Connect-side socket lifecycle for one address.
#[derive(Clone)]
pub struct ClientEndpoint {
    inner: Arc<EndpointInner>,
}

impl std::fmt::Debug for ClientEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientEndpoint")
            .field("address", &self.inner.address)
            .field("connected", &self.connected())
            .finish_non_exhaustive()
    }
}

impl ClientEndpoint {
    /// Endpoint for `address`. Nothing happens until [`ClientEndpoint::connect`].
    pub fn new(address: impl Into<SocketAddress>) -> Self {
        Self {
            inner: Arc::new(EndpointInner {
                address: address.into(),
                state: Mutex::new(ClientState::default()),
                shutdown: CancellationToken::new(),
                attempts: AtomicUsize::new(0),
                replies: tokio::sync::Mutex::new(ReplyReader::default()),
                outstanding: Mutex::new(Outstanding::default()),
                next_mid: AtomicU64::new(u64::from(rand::random::<u32>())),
            }),
        }
    }

    /// Target address.
    pub fn address(&self) -> &SocketAddress {
        &self.inner.address
    }

    /// Connect, retrying every [`CONNECT_RETRY_INTERVAL`] until `timeout`
    /// passes (forever when `None`).
    ///
    /// Callers arriving while an attempt is in flight share its outcome;
    /// the first caller's timeout applies. Returns immediately when already
    /// connected.
    pub async fn connect(&self, timeout: Option<Duration>) -> Result<()> {
        let outcome = {
            let mut state = self.inner.lock();
            if state.closing {
                return Err(IpcError::Closing);
            }
            if state.conn.is_some() {
                return Ok(());
            }
            if let Some(outcome) = &state.connecting {
                outcome.clone()
            } else {
                let task = tokio::spawn(connect_loop(Arc::clone(&self.inner), timeout));
                let outcome = async move {
                    task.await.unwrap_or_else(|e| {
                        Err(IpcError::Io(Arc::new(std::io::Error::other(e.to_string()))))
                    })
                }
                .boxed()
                .shared();
                state.connecting = Some(outcome.clone());
                outcome
            }
        };
        outcome.await
    }

    /// True while a connection is established.
    pub fn connected(&self) -> bool {
        self.inner.lock().conn.is_some()
    }

    /// True once [`ClientEndpoint::close`] has been called.
    pub fn is_closing(&self) -> bool {
        self.inner.lock().closing
    }

    /// Number of socket connect attempts made so far.
    pub fn connect_attempts(&self) -> usize {
        self.inner.attempts.load(Ordering::SeqCst)
    }

    pub(crate) fn writer(&self) -> Option<SharedWriter> {
        self.inner.lock().conn.as_ref().map(|c| Arc::clone(&c.writer))
    }

    /// Take the read half of the current connection. Only one reader may
    /// own it; later calls return `None` until the next connection.
    pub(crate) fn take_reader(&self) -> Option<BoxReader> {
        self.inner.lock().conn.as_mut().and_then(|c| c.reader.take())
    }

    /// Forget the current connection after the peer went away, so the next
    /// `connect` opens a fresh one.
    pub(crate) fn mark_closed(&self) {
        if self.inner.lock().conn.take().is_some() {
            log::trace!("[IpcClient] Connection to {} closed by peer", self.inner.address);
        }
    }

    /// Drop the connection and abort any in-flight attempt. Idempotent.
    pub fn close(&self) {
        let mut state = self.inner.lock();
        if state.closing {
            return;
        }
        state.closing = true;
        state.conn = None;
        state.connecting = None;
        self.inner.shutdown.cancel();
        log::debug!("[IpcClient] Closing connection to {}", self.inner.address);
    }
}

impl SharedResource for ClientEndpoint {
    fn shutdown(&self) {
        self.close();
    }
}

/// The retry loop behind a shared connect outcome.
async fn connect_loop(inner: Arc<EndpointInner>, timeout: Option<Duration>) -> Result<()> {
    let deadline = timeout.map(|t| Instant::now() + t);

    let result = loop {
        if inner.lock().closing {
            break Err(IpcError::Closing);
        }

        inner.attempts.fetch_add(1, Ordering::SeqCst);
        match IpcStream::connect(&inner.address).await {
            Ok(stream) => {
                let (reader, writer) = stream.into_split();
                let mut state = inner.lock();
                if state.closing {
                    break Err(IpcError::Closing);
                }
                state.conn = Some(Connection {
                    reader: Some(reader),
                    writer: Arc::new(tokio::sync::Mutex::new(writer)),
                });
                state.connecting = None;
                drop(state);
                log::debug!("[IpcClient] Connected to {}", inner.address);
                return Ok(());
            }
            Err(e) => {
                if deadline.is_some_and(|d| Instant::now() >= d) {
                    log::debug!("[IpcClient] Giving up connecting to {}: {e}", inner.address);
                    break Err(e.into());
                }
                log::trace!(
                    "[IpcClient] Could not connect to {}: {e}; retrying in {:?}",
                    inner.address,
                    CONNECT_RETRY_INTERVAL
                );
                tokio::select! {
                    () = inner.shutdown.cancelled() => break Err(IpcError::Closing),
                    () = tokio::time::sleep(CONNECT_RETRY_INTERVAL) => {}
                }
            }
        }
    };

    inner.lock().connecting = None;
    result
}

// ─── Message client ────────────────────────────────────────────────────────

static MESSAGE_CLIENTS: LazyLock<Arc<SharedRegistry<ClientEndpoint>>> =
    LazyLock::new(|| Arc::new(SharedRegistry::new()));

/// Reply-reading state shared by every request on one endpoint.
#[derive(Default)]
struct ReplyReader {
    reader: Option<BoxReader>,
    decoder: FrameDecoder,
}

#[derive(Debug, Default)]
struct Outstanding {
    awaiting: HashSet<MessageId>,
    /// Replies that arrived for another waiter.
    stash: HashMap<MessageId, Body>,
}

/// Registers a request as awaiting its reply; forgets it when dropped, so a
/// reply that arrives after a timeout is discarded instead of kept.
struct AwaitingReply<'a> {
    inner: &'a EndpointInner,
    mid: MessageId,
}

impl<'a> AwaitingReply<'a> {
    fn new(inner: &'a EndpointInner, mid: MessageId) -> Self {
        inner.outstanding().awaiting.insert(mid);
        Self { inner, mid }
    }
}

impl Drop for AwaitingReply<'_> {
    fn drop(&mut self) {
        let mut outstanding = self.inner.outstanding();
        outstanding.awaiting.remove(&self.mid);
        outstanding.stash.remove(&self.mid);
    }
}

/// Sends one-way messages and correlated requests to an [`IpcServer`].
///
/// Clients for the same address share one connection; it is closed when the
/// last client is closed or dropped.
///
/// [`IpcServer`]: super::server::IpcServer
pub struct IpcMessageClient {
    endpoint: Arc<ClientEndpoint>,
    registry: Arc<SharedRegistry<ClientEndpoint>>,
    released: AtomicBool,
}

impl std::fmt::Debug for IpcMessageClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IpcMessageClient")
            .field("endpoint", &self.endpoint)
            .finish_non_exhaustive()
    }
}

impl IpcMessageClient {
    /// Client for `address`, sharing the process-wide connection registry.
    pub fn new(address: impl Into<SocketAddress>) -> Self {
        Self::with_registry(address, Arc::clone(&MESSAGE_CLIENTS))
    }

    /// Client sharing connections through `registry` instead of the
    /// process-wide one.
    pub fn with_registry(address: impl Into<SocketAddress>, registry: Arc<SharedRegistry<ClientEndpoint>>) -> Self {
        let address = address.into();
        let endpoint = registry.acquire(&address, || ClientEndpoint::new(address.clone()));
        Self {
            endpoint,
            registry,
            released: AtomicBool::new(false),
        }
    }

    /// The shared endpoint.
    pub fn endpoint(&self) -> &ClientEndpoint {
        &self.endpoint
    }

    /// See [`ClientEndpoint::connect`].
    pub async fn connect(&self, timeout: Option<Duration>) -> Result<()> {
        self.endpoint.connect(timeout).await
    }

    /// True while the shared connection is established.
    pub fn connected(&self) -> bool {
        self.endpoint.connected()
    }

    /// Send `msg` without waiting for any answer.
    ///
    /// Connects first if needed; only that connect is retried, never the
    /// write itself.
    pub async fn send(&self, msg: impl Into<Body>) -> Result<()> {
        self.write(&Frame::new(msg)).await
    }

    /// Send `msg` with a fresh correlation id and wait for the reply.
    pub async fn request(&self, msg: impl Into<Body>, timeout: Option<Duration>) -> Result<Body> {
        let mid = self.endpoint.inner.next_mid.fetch_add(1, Ordering::Relaxed);
        let _awaiting = AwaitingReply::new(&self.endpoint.inner, mid);
        self.write(&Frame::with_mid(mid, msg)).await?;

        with_timeout(self.await_reply(mid), timeout).await?
    }

    async fn write(&self, frame: &Frame) -> Result<()> {
        if !self.endpoint.connected() {
            self.endpoint.connect(None).await?;
        }
        let bytes = frame.encode()?;
        let writer = self.endpoint.writer().ok_or(IpcError::StreamClosed)?;
        if let Err(e) = write_frame(&writer, &bytes).await {
            if is_disconnect(&e) {
                self.endpoint.mark_closed();
            }
            return Err(e.into());
        }
        Ok(())
    }

    async fn await_reply(&self, mid: MessageId) -> Result<Body> {
        let inner = &self.endpoint.inner;
        let mut replies = inner.replies.lock().await;
        if let Some(body) = inner.outstanding().stash.remove(&mid) {
            return Ok(body);
        }

        let mut buf = vec![0u8; READ_CHUNK];
        loop {
            if replies.reader.is_none() {
                replies.reader = self.endpoint.take_reader();
                replies.decoder.reset();
            }
            let Some(reader) = replies.reader.as_mut() else {
                return Err(IpcError::StreamClosed);
            };

            let n = match reader.read(&mut buf).await {
                Ok(0) => 0,
                Ok(n) => n,
                Err(e) if is_disconnect(&e) => 0,
                Err(e) => return Err(e.into()),
            };
            if n == 0 {
                replies.reader = None;
                self.endpoint.mark_closed();
                return Err(IpcError::StreamClosed);
            }

            let mut found = None;
            for frame in replies.decoder.feed(&buf[..n])? {
                match frame.head.mid {
                    Some(m) if m == mid => found = Some(frame.body),
                    Some(m) => {
                        let mut outstanding = inner.outstanding();
                        if outstanding.awaiting.contains(&m) {
                            outstanding.stash.insert(m, frame.body);
                        } else {
                            log::trace!(
                                "[IpcClient] Discarding reply {m} from {}: nobody is waiting",
                                self.endpoint.address()
                            );
                        }
                    }
                    None => log::trace!("[IpcClient] Ignoring uncorrelated frame from {}", self.endpoint.address()),
                }
            }
            if let Some(body) = found {
                return Ok(body);
            }
        }
    }

    /// Release this client's share of the connection. Idempotent.
    ///
    /// The connection itself closes once every client sharing it is closed.
    pub fn close(&self) {
        if self.released.swap(true, Ordering::SeqCst) {
            return;
        }
        let address = self.endpoint.address().clone();
        self.registry.release(&address, &self.endpoint);
    }
}

impl Drop for IpcMessageClient {
    fn drop(&mut self) {
        self.close();
    }
}
