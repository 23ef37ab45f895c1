//! Accept-side endpoint and the request/reply message server.
//!
//! [`Listener`] owns the bind/accept/close lifecycle and hands every
//! accepted connection to a [`ConnectionHandler`]. [`IpcServer`] is the
//! message server built on it: each connection gets its own read loop that
//! decodes frames and dispatches every body to the [`PayloadHandler`] on a
//! separate task, so a slow handler never holds up decoding.
//!
//! ```text
//! Listener ──accept──► ConnectionHandler::on_connection
//!                         └─ IpcServer: spawn read loop
//!                               ├─ frame 1 ─► spawn handler(body, reply)
//!                               └─ frame 2 ─► spawn handler(body, reply)
//! ```

use std::future::Future;
use std::io;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncReadExt;
use tokio_util::sync::CancellationToken;

use super::address::{write_frame, BoxReader, IpcListener, IpcStream, SharedWriter, SocketAddress};
use super::framing::{Body, Frame, FrameDecoder, MessageId};
use crate::error::{is_disconnect, IpcError, Result};

/// Size of each socket read.
pub(crate) const READ_CHUNK: usize = 64 * 1024;

/// Pause after a failed accept before trying again.
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

// ─── Listener ──────────────────────────────────────────────────────────────

/// Receives connections accepted by a [`Listener`].
pub(crate) trait ConnectionHandler: Send + Sync + 'static {
    /// Take ownership of a freshly accepted connection. Must not block.
    ///
    /// `shutdown` is cancelled when the listener closes.
    fn on_connection(&self, stream: IpcStream, peer: String, shutdown: CancellationToken);
}

/// Bound socket, shared with the accept loop. Emptied by [`Listener::close`].
type SocketSlot = Arc<Mutex<Option<IpcListener>>>;

#[derive(Debug, Default)]
struct ListenerState {
    started: bool,
    closing: bool,
    socket: Option<SocketSlot>,
    shutdown: CancellationToken,
}

/// Bind/accept/close lifecycle shared by the message server and the publisher.
#[derive(Debug)]
pub(crate) struct Listener {
    address: SocketAddress,
    label: &'static str,
    state: Mutex<ListenerState>,
}

impl Listener {
    pub(crate) fn new(address: SocketAddress, label: &'static str) -> Self {
        Self {
            address,
            label,
            state: Mutex::new(ListenerState::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ListenerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn address(&self) -> &SocketAddress {
        &self.address
    }

    /// Bind the address and start accepting.
    ///
    /// Idempotent after the first success. Returns once the socket is bound.
    /// Must be called from within a Tokio runtime.
    pub(crate) fn start(&self, handler: Arc<dyn ConnectionHandler>) -> Result<()> {
        let mut state = self.lock();
        if state.closing {
            return Err(IpcError::Closing);
        }
        if state.started {
            return Ok(());
        }

        log::trace!("{} Binding to socket: {}", self.label, self.address);
        let socket: SocketSlot = Arc::new(Mutex::new(Some(IpcListener::bind(&self.address)?)));

        tokio::spawn(accept_loop(
            Arc::clone(&socket),
            handler,
            state.shutdown.clone(),
            self.address.clone(),
            self.label,
        ));
        state.started = true;
        state.socket = Some(socket);

        log::info!("{} Listening on {}", self.label, self.address);
        Ok(())
    }

    /// Stop accepting and release the socket.
    ///
    /// The socket is closed before this returns, so the address can be bound
    /// again right away. Returns `false` if the listener was already closed.
    pub(crate) fn close(&self) -> bool {
        let mut state = self.lock();
        if state.closing {
            return false;
        }
        state.closing = true;
        if let Some(socket) = state.socket.take() {
            drop(socket.lock().unwrap_or_else(PoisonError::into_inner).take());
        }
        state.shutdown.cancel();
        log::debug!("{} Closing listener on {}", self.label, self.address);
        true
    }

    pub(crate) fn is_started(&self) -> bool {
        self.lock().started
    }

    pub(crate) fn is_closing(&self) -> bool {
        self.lock().closing
    }
}

/// Poll the shared socket. Yields `None` once the socket has been released.
///
/// The slot is only locked for the duration of one poll, so `close` never
/// waits on a pending accept.
fn poll_accept(socket: &SocketSlot, cx: &mut Context<'_>) -> Poll<Option<io::Result<(IpcStream, String)>>> {
    match socket.lock().unwrap_or_else(PoisonError::into_inner).as_ref() {
        Some(listener) => listener.poll_accept(cx).map(Some),
        None => Poll::Ready(None),
    }
}

/// Accept loop. Runs as a tokio task until the shutdown token fires or the
/// socket is released.
async fn accept_loop(
    socket: SocketSlot,
    handler: Arc<dyn ConnectionHandler>,
    shutdown: CancellationToken,
    address: SocketAddress,
    label: &'static str,
) {
    loop {
        let accepted = tokio::select! {
            () = shutdown.cancelled() => break,
            accepted = std::future::poll_fn(|cx| poll_accept(&socket, cx)) => accepted,
        };
        let Some(accepted) = accepted else {
            break;
        };

        match accepted {
            Ok((stream, peer)) => {
                log::trace!("{label} Handling connection to address: {peer}");
                handler.on_connection(stream, peer, shutdown.child_token());
            }
            Err(e) => {
                // Keep listening; a failed accept only affects that one peer.
                log::error!("{label} Accept error on {address}: {e}");
                tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
            }
        }
    }
    log::debug!("{label} Accept loop on {address} stopped");
}

// ─── Message server ────────────────────────────────────────────────────────

/// Receives every message body decoded by an [`IpcServer`].
///
/// Implemented for any `Fn(Body, ReplySender) -> impl Future<Output = ()>`.
#[async_trait]
pub trait PayloadHandler: Send + Sync + 'static {
    /// Handle one message. `reply` answers the sender when the request
    /// carried a correlation id and does nothing otherwise.
    async fn handle(&self, body: Body, reply: ReplySender);
}

#[async_trait]
impl<F, Fut> PayloadHandler for F
where
    F: Fn(Body, ReplySender) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    async fn handle(&self, body: Body, reply: ReplySender) {
        (self)(body, reply).await;
    }
}

/// Sends a correlated reply on the connection a request arrived on.
#[derive(Clone)]
pub struct ReplySender {
    mid: Option<MessageId>,
    writer: SharedWriter,
}

impl std::fmt::Debug for ReplySender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplySender")
            .field("mid", &self.mid)
            .finish_non_exhaustive()
    }
}

impl ReplySender {
    pub(crate) fn new(mid: Option<MessageId>, writer: SharedWriter) -> Self {
        Self { mid, writer }
    }

    /// True when the request had no `mid`, so [`ReplySender::send`] does nothing.
    pub fn is_noop(&self) -> bool {
        self.mid.is_none()
    }

    /// Correlation id the reply will carry.
    pub fn mid(&self) -> Option<MessageId> {
        self.mid
    }

    /// Write `msg` back as `{head: {mid}, body: msg}`.
    pub async fn send(&self, msg: impl Into<Body>) -> Result<()> {
        let Some(mid) = self.mid else {
            return Ok(());
        };
        let bytes = Frame::with_mid(mid, msg).encode()?;
        write_frame(&self.writer, &bytes).await?;
        Ok(())
    }
}

/// Dispatches decoded frames from every accepted connection.
struct Dispatch {
    address: SocketAddress,
    handler: Arc<dyn PayloadHandler>,
}

impl ConnectionHandler for Dispatch {
    fn on_connection(&self, stream: IpcStream, peer: String, shutdown: CancellationToken) {
        let (reader, writer) = stream.into_split();
        let writer: SharedWriter = Arc::new(tokio::sync::Mutex::new(writer));
        tokio::spawn(handle_stream(
            self.address.clone(),
            Arc::clone(&self.handler),
            reader,
            writer,
            peer,
            shutdown,
        ));
    }
}

/// Per-connection read loop.
async fn handle_stream(
    address: SocketAddress,
    handler: Arc<dyn PayloadHandler>,
    mut reader: BoxReader,
    writer: SharedWriter,
    peer: String,
    shutdown: CancellationToken,
) {
    let mut decoder = FrameDecoder::new();
    let mut buf = vec![0u8; READ_CHUNK];

    loop {
        let read = tokio::select! {
            () = shutdown.cancelled() => break,
            read = reader.read(&mut buf) => read,
        };

        match read {
            Ok(0) => {
                log::trace!("[IpcServer] Client {peer} disconnected from IPC {address}");
                break;
            }
            Ok(n) => match decoder.feed(&buf[..n]) {
                Ok(frames) => {
                    for frame in frames {
                        let reply = ReplySender::new(frame.head.mid, Arc::clone(&writer));
                        let handler = Arc::clone(&handler);
                        tokio::spawn(async move {
                            handler.handle(frame.body, reply).await;
                        });
                    }
                }
                Err(e) => {
                    log::error!("[IpcServer] Frame decode error from {peer}: {e}");
                    break;
                }
            },
            // On occasion a read fails with errno 0; it is spurious.
            Err(e) if e.raw_os_error() == Some(0) => {
                log::trace!("[IpcServer] Spurious error with errno 0 from {peer}: {e}");
            }
            Err(e) if is_disconnect(&e) => {
                log::trace!("[IpcServer] Client {peer} disconnected from IPC {address}: {e}");
                break;
            }
            Err(e) => {
                log::error!("[IpcServer] Exception occurred while handling stream from {peer}: {e}");
                break;
            }
        }
    }
}

/// Request/reply capable message server.
///
/// ```ignore
/// let server = IpcServer::new(path, |body: Body, reply: ReplySender| async move {
///     let _ = reply.send(body).await; // echo
/// });
/// server.start()?;
/// ```
pub struct IpcServer {
    listener: Listener,
    dispatch: Arc<Dispatch>,
}

impl std::fmt::Debug for IpcServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IpcServer")
            .field("address", self.listener.address())
            .field("started", &self.listener.is_started())
            .finish_non_exhaustive()
    }
}

impl IpcServer {
    /// Create a server for `address`. Nothing is bound until [`IpcServer::start`].
    pub fn new(address: impl Into<SocketAddress>, handler: impl PayloadHandler) -> Self {
        let address = address.into();
        Self {
            listener: Listener::new(address.clone(), "[IpcServer]"),
            dispatch: Arc::new(Dispatch {
                address,
                handler: Arc::new(handler),
            }),
        }
    }

    /// Bind and start accepting. Idempotent; must run inside a Tokio runtime.
    pub fn start(&self) -> Result<()> {
        let handler: Arc<dyn ConnectionHandler> = Arc::clone(&self.dispatch) as Arc<dyn ConnectionHandler>;
        self.listener.start(handler)
    }

    /// Stop accepting and end every connection loop. Idempotent.
    pub fn close(&self) {
        self.listener.close();
    }

    /// Bound address.
    pub fn address(&self) -> &SocketAddress {
        self.listener.address()
    }

    /// True once [`IpcServer::close`] has been called.
    pub fn is_closing(&self) -> bool {
        self.listener.is_closing()
    }
}

impl Drop for IpcServer {
    fn drop(&mut self) {
        self.close();
    }
}
