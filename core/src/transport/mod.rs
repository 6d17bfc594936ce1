//! Transport bindings
//!
//! A transport carries [`ClientMessage`]s to a log and [`ServerMessage`]s
//! back. Two in-process bindings ship with the crate:
//!
//! - [`broker`]: every replica talks to one relay that owns the log.
//! - [`mesh`]: peers in a room; whoever is already present answers
//!   snapshot requests and stamps sequence ids from its own clock.
//!
//! ```text
//!   Session ── send(ClientMessage) ──▶ Transport ──▶ log / peers
//!      ▲                                  │
//!      └──── next_event() ◀── Opened / Message(ServerMessage) / Closed
//! ```

pub mod broker;
pub mod mesh;

use async_trait::async_trait;

use crate::error::Result;
use crate::protocol::{ClientMessage, ServerMessage};

pub use broker::{Broker, BrokerTransport};
pub use mesh::{MeshRoom, MeshTransport};

/// Something that happened on the wire
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Opened,
    Message(ServerMessage),
    Closed,
}

/// Connection to a log
#[async_trait]
pub trait Transport: Send {
    /// Open the connection; `Opened` is reported through `next_event`
    async fn connect(&mut self) -> Result<()>;

    /// Close the connection. No `Closed` event follows a local close.
    async fn close(&mut self);

    fn is_open(&self) -> bool;

    /// Fire-and-forget send; fails when not connected
    async fn send(&mut self, message: ClientMessage) -> Result<()>;

    /// Next event, pending while closed
    ///
    /// Must be cancel-safe: it is polled inside `tokio::select!`.
    async fn next_event(&mut self) -> Option<TransportEvent>;
}
