//! Fan-out server.
//!
//! Every accepted connection joins the publisher's stream set. Each member
//! gets its own writer task fed by an unbounded queue, so a slow or dead
//! peer never holds up delivery to the others:
//!
//! ```text
//! publish(msg) ── encode once ──┬─► queue ─► writer task ─► peer 1
//!                               ├─► queue ─► writer task ─► peer 2
//!                               └─► queue ─► writer task ─► peer N
//! ```
//!
//! A member leaves the set when its peer disconnects, when a write fails,
//! or when its queued bytes would exceed the configured write buffer.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio_util::sync::CancellationToken;

use super::address::{BoxReader, BoxWriter, IpcStream, SocketAddress};
use super::framing::{Body, Frame};
use super::server::{ConnectionHandler, Listener};
use crate::config::IpcConfig;
use crate::error::{is_disconnect, IpcError, Result};

type StreamId = u64;

/// One member of the stream set.
struct Member {
    peer: String,
    tx: UnboundedSender<Bytes>,
    /// Bytes queued but not yet written.
    pending: Arc<AtomicUsize>,
    cancel: CancellationToken,
}

/// The publisher's live connections.
struct StreamSet {
    address: SocketAddress,
    members: Mutex<HashMap<StreamId, Member>>,
    next_id: AtomicU64,
    write_buffer: Option<usize>,
    closed: AtomicBool,
}

impl StreamSet {
    fn lock(&self) -> MutexGuard<'_, HashMap<StreamId, Member>> {
        self.members.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Drop `id` from the set and stop its tasks. No-op if already gone.
    fn remove(&self, id: StreamId, reason: &str) {
        let member = self.lock().remove(&id);
        if let Some(member) = member {
            member.cancel.cancel();
            log::debug!("[Publisher] Removed subscriber {} on {}: {reason}", member.peer, self.address);
        }
    }
}

/// Adds accepted connections to the stream set.
struct Acceptor {
    set: Arc<StreamSet>,
}

impl ConnectionHandler for Acceptor {
    fn on_connection(&self, stream: IpcStream, peer: String, shutdown: CancellationToken) {
        let set = &self.set;
        if set.closed.load(Ordering::SeqCst) {
            return;
        }

        let id = set.next_id.fetch_add(1, Ordering::Relaxed);
        let (reader, writer) = stream.into_split();
        let (tx, rx) = mpsc::unbounded_channel();
        let pending = Arc::new(AtomicUsize::new(0));

        set.lock().insert(
            id,
            Member {
                peer: peer.clone(),
                tx,
                pending: Arc::clone(&pending),
                cancel: shutdown.clone(),
            },
        );
        log::trace!("[Publisher] Subscriber {peer} joined {}", set.address);

        tokio::spawn(write_loop(id, Arc::clone(set), writer, rx, pending, shutdown.clone()));
        tokio::spawn(watch_loop(id, Arc::clone(set), reader, shutdown));
    }
}

/// Drains one member's queue onto its socket.
async fn write_loop(
    id: StreamId,
    set: Arc<StreamSet>,
    mut writer: BoxWriter,
    mut rx: UnboundedReceiver<Bytes>,
    pending: Arc<AtomicUsize>,
    cancel: CancellationToken,
) {
    loop {
        let bytes = tokio::select! {
            () = cancel.cancelled() => break,
            bytes = rx.recv() => match bytes {
                Some(bytes) => bytes,
                None => break,
            },
        };

        let written = async {
            writer.write_all(&bytes).await?;
            writer.flush().await
        }
        .await;
        pending.fetch_sub(bytes.len(), Ordering::SeqCst);

        if let Err(e) = written {
            if is_disconnect(&e) {
                set.remove(id, "stream closed");
            } else {
                log::error!("[Publisher] Exception occurred in publish for {}: {e}", set.address);
                set.remove(id, "write failed");
            }
            break;
        }
    }
    let _ = writer.shutdown().await;
}

/// Watches the read half for the peer going away.
///
/// Subscribers never send anything meaningful; anything read is discarded.
async fn watch_loop(id: StreamId, set: Arc<StreamSet>, mut reader: BoxReader, cancel: CancellationToken) {
    let mut buf = [0u8; 1024];
    loop {
        let read = tokio::select! {
            () = cancel.cancelled() => return,
            read = reader.read(&mut buf) => read,
        };
        match read {
            Ok(0) => {
                set.remove(id, "peer disconnected");
                return;
            }
            Ok(_) => {}
            Err(e) if e.raw_os_error() == Some(0) => {}
            Err(e) => {
                set.remove(id, &e.to_string());
                return;
            }
        }
    }
}

/// Broadcasts every published message to all connected subscribers.
pub struct IpcPublisher {
    listener: Listener,
    set: Arc<StreamSet>,
}

impl std::fmt::Debug for IpcPublisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IpcPublisher")
            .field("address", self.listener.address())
            .field("streams", &self.stream_count())
            .finish_non_exhaustive()
    }
}

impl IpcPublisher {
    /// Publisher for `address` using `config.ipc_write_buffer` as the
    /// per-connection buffer bound. Nothing is bound until [`IpcPublisher::start`].
    pub fn new(address: impl Into<SocketAddress>, config: &IpcConfig) -> Self {
        let address = address.into();
        Self {
            listener: Listener::new(address.clone(), "[Publisher]"),
            set: Arc::new(StreamSet {
                address,
                members: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(0),
                write_buffer: config.write_buffer_limit(),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Bind and start accepting subscribers. Idempotent.
    pub fn start(&self) -> Result<()> {
        if self.set.closed.load(Ordering::SeqCst) {
            return Err(IpcError::Closing);
        }
        self.listener.start(Arc::new(Acceptor {
            set: Arc::clone(&self.set),
        }))
    }

    /// Bound address.
    pub fn address(&self) -> &SocketAddress {
        self.listener.address()
    }

    /// Number of connected subscribers.
    pub fn stream_count(&self) -> usize {
        self.set.lock().len()
    }

    /// Queue `msg` for every connected subscriber.
    ///
    /// The message is framed once. Returns the number of streams it was
    /// queued on; streams that are gone or over their buffer bound are
    /// removed instead. Does nothing when no one is connected.
    pub fn publish(&self, msg: impl Into<Body>) -> Result<usize> {
        if self.set.lock().is_empty() {
            return Ok(0);
        }

        let bytes = Frame::new(msg).encode()?;
        let mut dropped = Vec::new();
        let mut queued = 0;
        {
            let members = self.set.lock();
            for (id, member) in members.iter() {
                let backlog = member.pending.load(Ordering::SeqCst);
                if self.set.write_buffer.is_some_and(|limit| backlog + bytes.len() > limit) {
                    dropped.push((*id, "write buffer full"));
                    continue;
                }
                member.pending.fetch_add(bytes.len(), Ordering::SeqCst);
                if member.tx.send(bytes.clone()).is_err() {
                    member.pending.fetch_sub(bytes.len(), Ordering::SeqCst);
                    dropped.push((*id, "stream closed"));
                    continue;
                }
                queued += 1;
            }
        }

        for (id, reason) in dropped {
            self.set.remove(id, reason);
        }
        Ok(queued)
    }

    /// Close every subscriber stream, then the listening socket. Idempotent.
    pub fn close(&self) {
        if self.set.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let members: Vec<Member> = self.set.lock().drain().map(|(_, m)| m).collect();
        for member in members {
            member.cancel.cancel();
        }
        self.listener.close();
    }
}

impl Drop for IpcPublisher {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::framing::FrameDecoder;
    use serde_json::json;
    use std::time::Duration;

    fn sock(tmp: &tempfile::TempDir, name: &str) -> SocketAddress {
        SocketAddress::from(tmp.path().join(name))
    }

    async fn wait_for(mut cond: impl FnMut() -> bool) {
        for _ in 0..200 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("Condition not met in time");
    }

    async fn read_bodies(reader: &mut BoxReader, count: usize) -> Vec<serde_json::Value> {
        let mut decoder = FrameDecoder::new();
        let mut out = Vec::new();
        let mut buf = vec![0u8; 4096];
        while out.len() < count {
            let n = tokio::time::timeout(Duration::from_secs(2), reader.read(&mut buf))
                .await
                .expect("Timed out reading")
                .expect("Read failed");
            assert_ne!(n, 0, "publisher closed the stream");
            for body in decoder.feed_bodies(&buf[..n]).unwrap() {
                out.push(body.decode().unwrap());
            }
        }
        out
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_is_noop() {
        let tmp = tempfile::TempDir::new().unwrap();
        let publisher = IpcPublisher::new(sock(&tmp, "empty.sock"), &IpcConfig::default());
        publisher.start().unwrap();
        assert_eq!(publisher.publish(json!({"n": 1})).unwrap(), 0);
    }

    #[tokio::test]
    async fn test_closed_stream_removed_others_still_served() {
        let tmp = tempfile::TempDir::new().unwrap();
        let addr = sock(&tmp, "fanout.sock");
        let publisher = IpcPublisher::new(addr.clone(), &IpcConfig::default());
        publisher.start().unwrap();

        let mut peers = Vec::new();
        for _ in 0..3 {
            peers.push(IpcStream::connect(&addr).await.unwrap().into_split());
        }
        wait_for(|| publisher.stream_count() == 3).await;

        // One subscriber goes away before anything is published.
        drop(peers.pop());

        for n in 0..5 {
            publisher.publish(json!({"n": n})).unwrap();
        }
        wait_for(|| publisher.stream_count() == 2).await;

        let expected: Vec<_> = (0..5).map(|n| json!({"n": n})).collect();
        for (reader, _writer) in &mut peers {
            assert_eq!(read_bodies(reader, 5).await, expected);
        }
    }

    #[tokio::test]
    async fn test_write_buffer_overflow_drops_stream() {
        let tmp = tempfile::TempDir::new().unwrap();
        let addr = sock(&tmp, "bounded.sock");
        let config = IpcConfig {
            ipc_write_buffer: 64,
            ..IpcConfig::default()
        };
        let publisher = IpcPublisher::new(addr.clone(), &config);
        publisher.start().unwrap();

        let (mut reader, _writer) = IpcStream::connect(&addr).await.unwrap().into_split();
        wait_for(|| publisher.stream_count() == 1).await;

        assert_eq!(publisher.publish(json!("small")).unwrap(), 1);
        assert_eq!(read_bodies(&mut reader, 1).await, vec![json!("small")]);

        // Larger than the whole buffer: the stream cannot take it.
        assert_eq!(publisher.publish(json!("x".repeat(200))).unwrap(), 0);
        assert_eq!(publisher.stream_count(), 0);
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_disconnects_peers() {
        let tmp = tempfile::TempDir::new().unwrap();
        let addr = sock(&tmp, "close.sock");
        let publisher = IpcPublisher::new(addr.clone(), &IpcConfig::default());
        publisher.start().unwrap();

        let (mut reader, _writer) = IpcStream::connect(&addr).await.unwrap().into_split();
        wait_for(|| publisher.stream_count() == 1).await;

        publisher.close();
        publisher.close();
        assert_eq!(publisher.stream_count(), 0);
        assert!(matches!(publisher.start(), Err(IpcError::Closing)));

        let mut buf = [0u8; 8];
        let n = tokio::time::timeout(Duration::from_secs(2), reader.read(&mut buf))
            .await
            .expect("Timed out")
            .unwrap_or(0);
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn test_close_releases_port_for_immediate_rebind() {
        let port = std::net::TcpListener::bind("127.0.0.1:0").unwrap().local_addr().unwrap().port();
        let addr = SocketAddress::Port(port);

        let first = IpcPublisher::new(addr.clone(), &IpcConfig::default());
        first.start().unwrap();
        first.close();

        let second = IpcPublisher::new(addr.clone(), &IpcConfig::default());
        second.start().unwrap();
        let (mut reader, _writer) = IpcStream::connect(&addr).await.unwrap().into_split();
        wait_for(|| second.stream_count() == 1).await;

        assert_eq!(second.publish(json!("again")).unwrap(), 1);
        assert_eq!(read_bodies(&mut reader, 1).await, vec![json!("again")]);
    }
}
