//! ipcbus - local inter-process messaging.
//!
//! Three patterns over Unix domain sockets (loopback TCP for numeric
//! addresses):
//!
//! - **One-way send** - [`IpcMessageClient::send`] to an [`IpcServer`]
//! - **Request/reply** - [`IpcMessageClient::request`], answered through
//!   the server's [`ReplySender`]
//! - **Publish/subscribe** - [`IpcPublisher`] fans out to every connected
//!   [`Subscriber`]; subscribers to the same address share one connection
//!
//! # Modules
//!
//! - [`ipc`] - Transport: framing, endpoints, server, publisher, subscriber
//! - [`config`] - Tuning knobs
//! - [`error`] - Error type

pub mod config;
pub mod error;
pub mod ipc;

// Re-export commonly used types
pub use config::IpcConfig;
pub use error::{IpcError, Result};
pub use ipc::{
    Body, BlockingSubscriber, Frame, IpcMessageClient, IpcPublisher, IpcServer, ReplySender, SocketAddress,
    Subscriber,
};
