//! Subscriber side of publish/subscribe.
//!
//! Many [`Subscriber`] handles pointed at the same publisher share one
//! [`SubscriberService`], which owns the single physical connection and the
//! only read loop on it:
//!
//! ```text
//!                     ┌──────────────── SubscriberService ───────────────┐
//! Publisher ══════════╪═► read loop (gate) ─► FrameDecoder ─► fan-out ───┼─► queue ─► Subscriber A
//!                     │                                             └────┼─► queue ─► Subscriber B
//!                     └──────────────────────────────────────────────────┘
//! ```
//!
//! The read loop runs while at least one handle is registered. It polls with
//! a deadline so that an idle loop notices when everyone has left, and keeps
//! its in-flight socket read across polls so no bytes are lost. A peer
//! closing the stream is fanned out as an end-of-stream marker; any other
//! failure is fanned out unchanged to every handle.

use std::collections::HashMap;
use std::future::Future;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, LazyLock, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures_util::future::{BoxFuture, FutureExt};
use tokio::io::AsyncReadExt;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::address::{BoxReader, SocketAddress};
use super::client::{ClientEndpoint, CONNECT_RETRY_INTERVAL};
use super::deadline::{with_timeout, Elapsed, PendingOp};
use super::framing::{Body, FrameDecoder};
use super::registry::{SharedRegistry, SharedResource};
use super::server::READ_CHUNK;
use crate::config::IpcConfig;
use crate::error::{is_disconnect, IpcError, Result};

/// Identity of one registered handle.
pub type SubscriberId = Uuid;

/// Callback invoked for every message in callback mode.
pub type MessageCallback = Arc<dyn Fn(Body) -> BoxFuture<'static, ()> + Send + Sync>;

/// Wrap an async closure as a [`MessageCallback`].
pub fn callback<F, Fut>(f: F) -> MessageCallback
where
    F: Fn(Body) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Arc::new(move |body: Body| f(body).boxed())
}

/// One item in a handle's queue.
#[derive(Debug, Clone)]
enum Delivery {
    Message(Body),
    /// The publisher closed the stream.
    Closed,
    /// The read loop failed; carries the original error.
    Failed(IpcError),
}

type ReadOutcome = (BoxReader, io::Result<Vec<u8>>);

/// State owned by whoever holds the read gate.
#[derive(Default)]
struct ReadState {
    decoder: FrameDecoder,
    /// Read half between reads.
    reader: Option<BoxReader>,
    /// Socket read that outlived the previous poll.
    pending: Option<PendingOp<BoxFuture<'static, ReadOutcome>>>,
}

/// Read one chunk, handing the reader back with the result.
fn read_chunk(mut reader: BoxReader) -> BoxFuture<'static, ReadOutcome> {
    async move {
        let mut buf = vec![0u8; READ_CHUNK];
        let result = reader.read(&mut buf).await.map(|n| {
            buf.truncate(n);
            buf
        });
        (reader, result)
    }
    .boxed()
}

/// One physical connection to a publisher, shared by many [`Subscriber`]s.
pub struct SubscriberService {
    client: ClientEndpoint,
    config: IpcConfig,
    handlers: Mutex<HashMap<SubscriberId, UnboundedSender<Delivery>>>,
    /// At most one read loop at a time; acquired with `try_lock` only.
    gate: tokio::sync::Mutex<ReadState>,
    /// Mirrors the gate for diagnostics, which must never take it.
    reading: AtomicBool,
    shutdown: CancellationToken,
}

impl std::fmt::Debug for SubscriberService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriberService")
            .field("address", self.client.address())
            .field("subscribers", &self.subscriber_count())
            .field("reading", &self.is_reading())
            .finish_non_exhaustive()
    }
}

impl SubscriberService {
    /// Service for `address`. Nothing connects until a handle reads.
    pub fn new(address: impl Into<SocketAddress>, config: IpcConfig) -> Self {
        Self {
            client: ClientEndpoint::new(address),
            config,
            handlers: Mutex::new(HashMap::new()),
            gate: tokio::sync::Mutex::new(ReadState::default()),
            reading: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
        }
    }

    fn handlers(&self) -> MutexGuard<'_, HashMap<SubscriberId, UnboundedSender<Delivery>>> {
        self.handlers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Publisher address.
    pub fn address(&self) -> &SocketAddress {
        self.client.address()
    }

    /// The underlying connection.
    pub fn endpoint(&self) -> &ClientEndpoint {
        &self.client
    }

    /// Number of registered handles.
    pub fn subscriber_count(&self) -> usize {
        self.handlers().len()
    }

    /// True while a read loop holds the gate.
    pub fn is_reading(&self) -> bool {
        self.reading.load(Ordering::SeqCst)
    }

    fn subscribe(&self, id: SubscriberId, tx: UnboundedSender<Delivery>) {
        self.handlers().entry(id).or_insert(tx);
    }

    fn unsubscribe(&self, id: SubscriberId) {
        self.handlers().remove(&id);
    }

    fn fan_out(&self, delivery: &Delivery) {
        for tx in self.handlers().values() {
            // A receiver that is gone is about to unsubscribe.
            let _ = tx.send(delivery.clone());
        }
    }

    /// Connect if needed, then drive one read pass.
    ///
    /// Returns early if no handle is registered or the service is closing.
    async fn read(&self, timeout: Option<Duration>) {
        loop {
            if self.subscriber_count() == 0 || self.shutdown.is_cancelled() {
                return;
            }
            if self.client.connected() {
                break;
            }
            match self.client.connect(Some(self.config.connect_timeout())).await {
                Ok(()) => break,
                Err(IpcError::Closing) => return,
                Err(e) => {
                    log::trace!(
                        "[Subscriber] Could not connect to {}: {e}; retrying",
                        self.client.address()
                    );
                    tokio::select! {
                        () = self.shutdown.cancelled() => return,
                        () = tokio::time::sleep(CONNECT_RETRY_INTERVAL) => {}
                    }
                }
            }
        }
        self.drive(timeout).await;
    }

    /// Run read passes while there is someone to read for. Returns
    /// immediately if another caller holds the gate.
    async fn drive(&self, timeout: Option<Duration>) {
        loop {
            let Ok(state) = self.gate.try_lock() else {
                return;
            };
            self.read_pass(state, timeout).await;

            // A handle that registered while the gate was being released
            // could not start its own pass.
            if self.subscriber_count() == 0 || self.shutdown.is_cancelled() || !self.client.connected() {
                return;
            }
        }
    }

    /// One read loop, holding the gate until it returns.
    async fn read_pass(&self, mut state: tokio::sync::MutexGuard<'_, ReadState>, timeout: Option<Duration>) {
        let poll = timeout.unwrap_or_else(|| self.config.poll_interval());
        let address = self.client.address().clone();
        self.reading.store(true, Ordering::SeqCst);
        log::trace!("[Subscriber] Read loop on {address} starting");
        scopeguard::defer! {
            self.reading.store(false, Ordering::SeqCst);
            log::trace!("[Subscriber] Read loop on {address} stopping");
        }

        loop {
            if self.subscriber_count() == 0 || self.shutdown.is_cancelled() {
                break;
            }

            if state.pending.is_none() {
                let reader = match state.reader.take() {
                    Some(reader) => reader,
                    None => {
                        let Some(reader) = self.client.take_reader() else {
                            // Not connected; the next read() reconnects.
                            break;
                        };
                        state.decoder.reset();
                        reader
                    }
                };
                state.pending = Some(PendingOp::new(read_chunk(reader)));
            }

            let Some(armed) = state.pending.as_mut().and_then(|op| op.arm(Some(poll))) else {
                state.pending = None;
                continue;
            };
            let outcome = tokio::select! {
                () = self.shutdown.cancelled() => break,
                outcome = armed => outcome,
            };

            let (reader, result) = match outcome {
                // Nobody may be listening any more; check and keep the same read.
                Err(Elapsed) => continue,
                Ok(done) => done,
            };
            state.pending = None;

            match result {
                Ok(bytes) if bytes.is_empty() => {
                    log::debug!("[Subscriber] Publisher at {address} closed the stream");
                    self.client.mark_closed();
                    self.fan_out(&Delivery::Closed);
                    break;
                }
                Ok(bytes) => match state.decoder.feed_bodies(&bytes) {
                    Ok(bodies) => {
                        state.reader = Some(reader);
                        for body in bodies {
                            self.fan_out(&Delivery::Message(body));
                        }
                    }
                    Err(e) => {
                        log::error!("[Subscriber] Undecodable data from {address}: {e}");
                        self.client.mark_closed();
                        self.fan_out(&Delivery::Failed(e));
                        break;
                    }
                },
                Err(e) if e.raw_os_error() == Some(0) => {
                    log::trace!("[Subscriber] Spurious error with errno 0 on {address}: {e}");
                    state.reader = Some(reader);
                }
                Err(e) if is_disconnect(&e) => {
                    log::debug!("[Subscriber] Connection to {address} lost: {e}");
                    self.client.mark_closed();
                    self.fan_out(&Delivery::Closed);
                    break;
                }
                Err(e) => {
                    log::error!("[Subscriber] Exception occurred while reading from {address}: {e}");
                    self.client.mark_closed();
                    self.fan_out(&Delivery::Failed(e.into()));
                    break;
                }
            }
        }
    }

    /// Close the connection and stop the read loop. Idempotent.
    pub fn close(&self) {
        if self.shutdown.is_cancelled() {
            return;
        }
        self.shutdown.cancel();
        self.client.close();

        // A read left pending by an idle loop may have failed meanwhile.
        if let Ok(mut state) = self.gate.try_lock() {
            if let Some(mut op) = state.pending.take() {
                if let Some((_reader, Err(e))) = op.now_or_never() {
                    if !is_disconnect(&e) {
                        log::error!(
                            "[Subscriber] Pending read on {} failed: {e}",
                            self.client.address()
                        );
                    }
                }
            }
            state.reader = None;
        }
    }
}

impl SharedResource for SubscriberService {
    fn shutdown(&self) {
        self.close();
    }
}

static SUBSCRIBER_SERVICES: LazyLock<Arc<SharedRegistry<SubscriberService>>> =
    LazyLock::new(|| Arc::new(SharedRegistry::new()));

/// A logical consumer of a publisher's messages.
///
/// Each handle has its own ordered queue; handles for the same address
/// share one connection. Dropping a handle unsubscribes it.
pub struct Subscriber {
    service: Arc<SubscriberService>,
    registry: Arc<SharedRegistry<SubscriberService>>,
    id: SubscriberId,
    tx: UnboundedSender<Delivery>,
    rx: tokio::sync::Mutex<UnboundedReceiver<Delivery>>,
    released: AtomicBool,
}

impl std::fmt::Debug for Subscriber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscriber")
            .field("id", &self.id)
            .field("service", &self.service)
            .finish_non_exhaustive()
    }
}

impl Subscriber {
    /// Handle on the process-wide service for `address`.
    ///
    /// `config` only applies if this is the first handle for the address.
    pub fn new(address: impl Into<SocketAddress>, config: &IpcConfig) -> Self {
        Self::with_registry(address, config, Arc::clone(&SUBSCRIBER_SERVICES))
    }

    /// Handle on the service for `address` held in `registry`.
    pub fn with_registry(
        address: impl Into<SocketAddress>,
        config: &IpcConfig,
        registry: Arc<SharedRegistry<SubscriberService>>,
    ) -> Self {
        let address = address.into();
        let service = registry.acquire(&address, || SubscriberService::new(address.clone(), config.clone()));
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            service,
            registry,
            id: Uuid::new_v4(),
            tx,
            rx: tokio::sync::Mutex::new(rx),
            released: AtomicBool::new(false),
        }
    }

    /// This handle's identity.
    pub fn id(&self) -> SubscriberId {
        self.id
    }

    /// The shared service behind this handle.
    pub fn service(&self) -> &Arc<SubscriberService> {
        &self.service
    }

    /// Connect the shared connection without reading.
    pub async fn connect(&self, timeout: Option<Duration>) -> Result<()> {
        self.service.client.connect(timeout).await
    }

    /// True while the shared connection is established.
    pub fn connected(&self) -> bool {
        self.service.client.connected()
    }

    /// Handles currently registered on the shared service.
    pub fn subscriber_count(&self) -> usize {
        self.service.subscriber_count()
    }

    /// True while the shared read loop is running.
    pub fn is_reading(&self) -> bool {
        self.service.is_reading()
    }

    /// Register and wait for messages.
    ///
    /// Without a callback, returns the next message. With one, hands every
    /// message to a spawned call of `callback` and keeps going. Either way,
    /// `Ok(None)` means the publisher closed the stream and a read loop
    /// failure is returned as the original error. `timeout` bounds each
    /// wait for the next message; expiry yields [`IpcError::Timeout`].
    pub async fn read_async(
        &self,
        callback: Option<&MessageCallback>,
        timeout: Option<Duration>,
    ) -> Result<Option<Body>> {
        if self.released.load(Ordering::SeqCst) {
            return Err(IpcError::Closing);
        }
        self.service.subscribe(self.id, self.tx.clone());

        let service = Arc::clone(&self.service);
        tokio::spawn(async move { service.read(timeout).await });

        let mut rx = self.rx.lock().await;
        loop {
            let Some(delivery) = with_timeout(rx.recv(), timeout).await? else {
                return Ok(None);
            };
            match delivery {
                Delivery::Closed => return Ok(None),
                Delivery::Failed(e) => return Err(e),
                Delivery::Message(body) => match callback {
                    Some(callback) => {
                        tokio::spawn(callback(body));
                    }
                    None => return Ok(Some(body)),
                },
            }
        }
    }

    /// Next message; `Ok(None)` on timeout or end of stream.
    pub async fn next_message(&self, timeout: Option<Duration>) -> Result<Option<Body>> {
        match self.read_async(None, timeout).await {
            Err(IpcError::Timeout) => Ok(None),
            other => other,
        }
    }

    /// Feed every message to `callback` until the stream ends, a wait times
    /// out or the read loop fails.
    pub async fn for_each(&self, callback: &MessageCallback, timeout: Option<Duration>) -> Result<()> {
        match self.read_async(Some(callback), timeout).await {
            Ok(_) | Err(IpcError::Timeout) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Unsubscribe and release this handle's share of the connection.
    /// Idempotent. The connection closes once every handle is closed.
    pub fn close(&self) {
        if self.released.swap(true, Ordering::SeqCst) {
            return;
        }
        self.service.unsubscribe(self.id);
        let address = self.service.address().clone();
        self.registry.release(&address, &self.service);
    }
}

impl Drop for Subscriber {
    fn drop(&mut self) {
        self.close();
    }
}

/// A [`Subscriber`] with its own single-threaded runtime, for callers that
/// are not async.
///
/// Work only progresses inside [`BlockingSubscriber::read_sync`].
pub struct BlockingSubscriber {
    inner: Subscriber,
    runtime: tokio::runtime::Runtime,
}

impl std::fmt::Debug for BlockingSubscriber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockingSubscriber")
            .field("inner", &self.inner)
            .finish_non_exhaustive()
    }
}

impl BlockingSubscriber {
    /// Handle for `address` on a private runtime and service registry.
    pub fn new(address: impl Into<SocketAddress>, config: &IpcConfig) -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        // Connections are bound to the runtime that opened them.
        let inner = Subscriber::with_registry(address, config, Arc::new(SharedRegistry::new()));
        Ok(Self { inner, runtime })
    }

    /// Block until the next message. `Ok(None)` on timeout or end of stream.
    pub fn read_sync(&self, timeout: Option<Duration>) -> Result<Option<Body>> {
        self.runtime.block_on(self.inner.next_message(timeout))
    }

    /// Block until connected.
    pub fn connect(&self, timeout: Option<Duration>) -> Result<()> {
        self.runtime.block_on(self.inner.connect(timeout))
    }

    /// The wrapped async handle.
    pub fn subscriber(&self) -> &Subscriber {
        &self.inner
    }
}

impl Drop for BlockingSubscriber {
    fn drop(&mut self) {
        let _guard = self.runtime.enter();
        self.inner.close();
    }
}
