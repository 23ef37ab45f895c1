//! Error type shared by every transport component.
//!
//! `IpcError` is `Clone` so a single failure observed by the subscriber
//! read loop can be handed, unchanged, to every registered consumer.

use std::io;
use std::sync::Arc;

use crate::ipc::deadline::Elapsed;

/// Result alias used throughout the crate.
pub type Result<T, E = IpcError> = std::result::Result<T, E>;

/// Failure kinds surfaced by the transport.
#[derive(Debug, Clone, thiserror::Error)]
pub enum IpcError {
    /// A deadline elapsed before the operation finished.
    #[error("operation timed out")]
    Timeout,

    /// The peer closed the stream.
    #[error("stream closed by peer")]
    StreamClosed,

    /// The endpoint was closed locally while the operation was pending.
    #[error("endpoint is closing")]
    Closing,

    /// Bytes on the wire could not be decoded into a frame.
    #[error("frame decode error: {0}")]
    Decode(String),

    /// A message could not be encoded into a frame.
    #[error("frame encode error: {0}")]
    Encode(String),

    /// A frame header announced a payload above the size limit.
    #[error("frame too large: {size} bytes (max {max})")]
    FrameTooLarge {
        /// Announced payload size.
        size: usize,
        /// Configured limit.
        max: usize,
    },

    /// The listening socket could not be set up.
    #[error("failed to bind {address}: {reason}")]
    Bind {
        /// Address that was being bound.
        address: String,
        /// Human readable cause.
        reason: String,
    },

    /// Any other socket level failure.
    #[error("I/O error: {0}")]
    Io(#[source] Arc<io::Error>),
}

impl IpcError {
    /// True when the error only means the peer went away.
    pub fn is_stream_closed(&self) -> bool {
        match self {
            IpcError::StreamClosed => true,
            IpcError::Io(e) => is_disconnect(e),
            _ => false,
        }
    }

    /// True for deadline expiry.
    pub fn is_timeout(&self) -> bool {
        matches!(self, IpcError::Timeout)
    }
}

impl From<io::Error> for IpcError {
    fn from(e: io::Error) -> Self {
        if e.kind() == io::ErrorKind::UnexpectedEof {
            return IpcError::StreamClosed;
        }
        IpcError::Io(Arc::new(e))
    }
}

impl From<Elapsed> for IpcError {
    fn from(_: Elapsed) -> Self {
        IpcError::Timeout
    }
}

/// Error kinds that only mean the remote end hung up.
pub(crate) fn is_disconnect(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::UnexpectedEof
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disconnect_kinds_count_as_stream_closed() {
        let err = IpcError::from(io::Error::from(io::ErrorKind::BrokenPipe));
        assert!(err.is_stream_closed());
        assert!(IpcError::from(io::Error::from(io::ErrorKind::UnexpectedEof)).is_stream_closed());
        assert!(!IpcError::from(io::Error::from(io::ErrorKind::PermissionDenied)).is_stream_closed());
    }

    #[test]
    fn test_clone_keeps_source() {
        let err = IpcError::from(io::Error::new(io::ErrorKind::Other, "boom"));
        let copy = err.clone();
        assert_eq!(copy.to_string(), "I/O error: boom");
        assert!(std::error::Error::source(&copy).is_some());
    }
}
