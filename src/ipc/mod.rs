//! Local socket transport.
//!
//! Moves framed messages between processes on one host over Unix domain
//! sockets, or loopback TCP when the address is a port number.
//!
//! # Architecture
//!
//! ```text
//! Server process                              Client process
//! ┌──────────────────────┐                   ┌──────────────────────────┐
//! │ IpcServer            │◄── send/request ──│ IpcMessageClient         │
//! │  Listener            │─── reply (mid) ──►│  ClientEndpoint (shared) │
//! │  read loop per conn  │                   └──────────────────────────┘
//! └──────────────────────┘
//! ┌──────────────────────┐                   ┌──────────────────────────┐
//! │ IpcPublisher         │                   │ SubscriberService        │
//! │  Listener            │════ frames ══════►│  one connection, one     │
//! │  writer task per     │                   │  read loop, fan-out to   │
//! │  subscriber stream   │                   │  Subscriber handles      │
//! └──────────────────────┘                   └──────────────────────────┘
//! ```
//!
//! # Wire Protocol
//!
//! Length-prefixed MessagePack frames: `[u32 LE length][{head, body}]`.
//!
//! See [`framing`] for the codec.

pub mod address;
pub mod client;
pub mod deadline;
pub mod framing;
pub mod publisher;
pub mod registry;
pub mod server;
pub mod subscriber;

pub use address::{IpcStream, SocketAddress};
pub use client::{ClientEndpoint, IpcMessageClient};
pub use deadline::{PendingOp, Phase};
pub use framing::{Body, Frame, FrameDecoder, Head, MessageId};
pub use publisher::IpcPublisher;
pub use registry::{SharedRegistry, SharedResource};
pub use server::{IpcServer, PayloadHandler, ReplySender};
pub use subscriber::{callback, BlockingSubscriber, MessageCallback, Subscriber, SubscriberService};
