//! Socket addressing and the stream/listener types built on it.
//!
//! An address is either a filesystem path (Unix domain socket) or a port
//! number, in which case the transport falls back to loopback TCP.

use std::fmt;
use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpSocket, TcpStream, UnixListener, UnixStream};

use crate::error::{IpcError, Result};

/// Backlog passed to `listen(2)` for TCP endpoints.
const LISTEN_BACKLOG: u32 = 128;

/// sun_path is 104 on macOS, 108 on Linux; use conservative limit
const MAX_SOCKET_PATH: usize = 104;

/// Boxed read half of a connection.
pub type BoxReader = Box<dyn AsyncRead + Send + Unpin>;
/// Boxed write half of a connection.
pub type BoxWriter = Box<dyn AsyncWrite + Send + Unpin>;
/// Write half shared by everything that answers on one connection.
pub(crate) type SharedWriter = Arc<tokio::sync::Mutex<BoxWriter>>;

/// Write one encoded frame, holding the writer lock for the whole frame so
/// concurrent writers never interleave bytes.
pub(crate) async fn write_frame(writer: &SharedWriter, bytes: &[u8]) -> io::Result<()> {
    let mut w = writer.lock().await;
    w.write_all(bytes).await?;
    w.flush().await
}

/// Identifies one logical transport endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SocketAddress {
    /// Unix domain socket at this path.
    Path(PathBuf),
    /// TCP on `127.0.0.1:<port>`.
    Port(u16),
}

impl SocketAddress {
    fn loopback(port: u16) -> SocketAddr {
        SocketAddr::from((Ipv4Addr::LOCALHOST, port))
    }
}

impl fmt::Display for SocketAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SocketAddress::Path(path) => write!(f, "{}", path.display()),
            SocketAddress::Port(port) => write!(f, "127.0.0.1:{port}"),
        }
    }
}

impl FromStr for SocketAddress {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        if !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit()) {
            if let Ok(port) = s.parse::<u16>() {
                return Ok(SocketAddress::Port(port));
            }
        }
        Ok(SocketAddress::Path(PathBuf::from(s)))
    }
}

impl From<u16> for SocketAddress {
    fn from(port: u16) -> Self {
        SocketAddress::Port(port)
    }
}

impl From<PathBuf> for SocketAddress {
    fn from(path: PathBuf) -> Self {
        SocketAddress::Path(path)
    }
}

impl From<&Path> for SocketAddress {
    fn from(path: &Path) -> Self {
        SocketAddress::Path(path.to_path_buf())
    }
}

/// An open duplex byte stream to a peer.
#[derive(Debug)]
pub enum IpcStream {
    /// Unix domain socket connection.
    Unix(UnixStream),
    /// Loopback TCP connection.
    Tcp(TcpStream),
}

impl IpcStream {
    /// Open a connection to `address`.
    pub async fn connect(address: &SocketAddress) -> io::Result<Self> {
        match address {
            SocketAddress::Path(path) => Ok(IpcStream::Unix(UnixStream::connect(path).await?)),
            SocketAddress::Port(port) => {
                let stream = TcpStream::connect(SocketAddress::loopback(*port)).await?;
                stream.set_nodelay(true)?;
                Ok(IpcStream::Tcp(stream))
            }
        }
    }

    /// Split into independently owned read and write halves.
    pub fn into_split(self) -> (BoxReader, BoxWriter) {
        match self {
            IpcStream::Unix(stream) => {
                let (r, w) = stream.into_split();
                (Box::new(r), Box::new(w))
            }
            IpcStream::Tcp(stream) => {
                let (r, w) = stream.into_split();
                (Box::new(r), Box::new(w))
            }
        }
    }
}

/// Bound listening socket.
#[derive(Debug)]
pub(crate) enum IpcListener {
    Unix(UnixListener),
    Tcp(TcpListener),
}

impl IpcListener {
    /// Bind `address`. Must be called from within a Tokio runtime.
    ///
    /// For paths: validates the length, removes a stale socket file,
    /// creates the parent directory and restricts the socket to 0600.
    pub(crate) fn bind(address: &SocketAddress) -> Result<Self> {
        let bind_err = |e: io::Error| IpcError::Bind {
            address: address.to_string(),
            reason: e.to_string(),
        };

        match address {
            SocketAddress::Path(path) => {
                let path_len = path.as_os_str().len();
                if path_len >= MAX_SOCKET_PATH {
                    return Err(IpcError::Bind {
                        address: address.to_string(),
                        reason: format!(
                            "socket path too long ({path_len} bytes, max {})",
                            MAX_SOCKET_PATH - 1
                        ),
                    });
                }

                remove_stale_socket(path).map_err(bind_err)?;

                if let Some(parent) = path.parent() {
                    if !parent.as_os_str().is_empty() {
                        std::fs::create_dir_all(parent).map_err(bind_err)?;
                    }
                }

                let listener = std::os::unix::net::UnixListener::bind(path).map_err(bind_err)?;

                {
                    use std::os::unix::fs::PermissionsExt;
                    let perms = std::fs::Permissions::from_mode(0o600);
                    std::fs::set_permissions(path, perms).map_err(bind_err)?;
                }

                listener.set_nonblocking(true).map_err(bind_err)?;
                Ok(IpcListener::Unix(UnixListener::from_std(listener).map_err(bind_err)?))
            }
            SocketAddress::Port(port) => {
                let socket = TcpSocket::new_v4().map_err(bind_err)?;
                socket.set_reuseaddr(true).map_err(bind_err)?;
                socket.bind(SocketAddress::loopback(*port)).map_err(bind_err)?;
                Ok(IpcListener::Tcp(socket.listen(LISTEN_BACKLOG).map_err(bind_err)?))
            }
        }
    }

    /// Poll for the next connection. Yields the stream and a printable peer label.
    pub(crate) fn poll_accept(&self, cx: &mut Context<'_>) -> Poll<io::Result<(IpcStream, String)>> {
        match self {
            IpcListener::Unix(listener) => listener.poll_accept(cx).map_ok(|(stream, addr)| {
                let label = addr
                    .as_pathname()
                    .map_or_else(|| "unix:unnamed".to_string(), |p| format!("unix:{}", p.display()));
                (IpcStream::Unix(stream), label)
            }),
            IpcListener::Tcp(listener) => listener.poll_accept(cx).map(|accepted| {
                let (stream, addr) = accepted?;
                stream.set_nodelay(true)?;
                Ok((IpcStream::Tcp(stream), addr.to_string()))
            }),
        }
    }

    /// Wait for the next connection.
    #[cfg(test)]
    pub(crate) async fn accept(&self) -> io::Result<(IpcStream, String)> {
        std::future::poll_fn(|cx| self.poll_accept(cx)).await
    }
}

/// Remove a leftover socket file from a previous run.
///
/// Anything at the path that is not a socket is left alone so the bind
/// fails loudly instead of deleting a user's file.
fn remove_stale_socket(path: &Path) -> io::Result<()> {
    use std::os::unix::fs::FileTypeExt;

    match std::fs::symlink_metadata(path) {
        Ok(meta) if meta.file_type().is_socket() => std::fs::remove_file(path),
        Ok(_) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[test]
    fn test_parse_port_and_path() {
        assert_eq!("4506".parse::<SocketAddress>().unwrap(), SocketAddress::Port(4506));
        assert_eq!(
            "/var/run/ipc.sock".parse::<SocketAddress>().unwrap(),
            SocketAddress::Path(PathBuf::from("/var/run/ipc.sock"))
        );
        // Out of u16 range stays a path
        assert_eq!(
            "99999".parse::<SocketAddress>().unwrap(),
            SocketAddress::Path(PathBuf::from("99999"))
        );
    }

    #[test]
    fn test_display() {
        assert_eq!(SocketAddress::Port(80).to_string(), "127.0.0.1:80");
        assert_eq!(SocketAddress::from(Path::new("/tmp/a.sock")).to_string(), "/tmp/a.sock");
    }

    #[tokio::test]
    async fn test_unix_bind_accept_connect() {
        let tmp = tempfile::TempDir::new().unwrap();
        let addr = SocketAddress::from(tmp.path().join("nested").join("test.sock"));

        let listener = IpcListener::bind(&addr).unwrap();
        let client = tokio::spawn({
            let addr = addr.clone();
            async move {
                let (_r, mut w) = IpcStream::connect(&addr).await.unwrap().into_split();
                w.write_all(b"ping").await.unwrap();
            }
        });

        let (stream, _peer) = listener.accept().await.unwrap();
        let (mut r, _w) = stream.into_split();
        let mut buf = [0u8; 4];
        r.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
        client.await.unwrap();
    }

    #[tokio::test]
    async fn test_stale_socket_file_replaced() {
        let tmp = tempfile::TempDir::new().unwrap();
        let addr = SocketAddress::from(tmp.path().join("stale.sock"));

        let first = IpcListener::bind(&addr).unwrap();
        drop(first);
        // The file is still on disk; binding again must succeed.
        assert!(IpcListener::bind(&addr).is_ok());
    }

    #[tokio::test]
    async fn test_socket_path_length_validation() {
        let tmp = tempfile::TempDir::new().unwrap();
        let long_name = "a".repeat(200);
        let addr = SocketAddress::from(tmp.path().join(long_name).join("test.sock"));

        let err = IpcListener::bind(&addr).unwrap_err();
        assert!(err.to_string().contains("too long"), "unexpected error: {err}");
    }

    #[tokio::test]
    async fn test_tcp_loopback_round_trip() {
        // Port 0 lets the OS pick a free port.
        let listener = IpcListener::bind(&SocketAddress::Port(0)).unwrap();
        let port = match &listener {
            IpcListener::Tcp(l) => l.local_addr().unwrap().port(),
            IpcListener::Unix(_) => unreachable!(),
        };

        let client = tokio::spawn(async move {
            let (_r, mut w) = IpcStream::connect(&SocketAddress::Port(port)).await.unwrap().into_split();
            w.write_all(b"tcp").await.unwrap();
        });

        let (stream, peer) = listener.accept().await.unwrap();
        assert!(peer.starts_with("127.0.0.1:"));
        let (mut r, _w) = stream.into_split();
        let mut buf = [0u8; 3];
        r.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"tcp");
        client.await.unwrap();
    }
}
