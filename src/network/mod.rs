//! Network Module Implementation
//!
//! Core networking for the object server: per-connection async I/O, the
//! chunked input buffer, and the protocol framers that turn byte streams
//! into application messages.
//!
//! # Components
//!
//! - `TcpConnection`: one accepted (or dialed) socket with its reader and
//!   writer tasks
//! - `ChunkyInputStream`: resumable chunked input with line-oriented reads
//! - `framer`: decoder/encoder state machines for each wire protocol
//!
//! Everything a connection does beyond raw I/O happens through the
//! `MessageHandler` installed by the port's `MessageHandlerFactory`.

pub use chunk_stream::ChunkyInputStream;
pub use connection::TcpConnection;

pub mod framer;

mod chunk_stream;
mod connection;

use std::sync::Arc;

use crate::AppError;

use framer::{InboundMessage, OutboundMessage};

/// A logical connection as the rest of the system sees it: a TCP connection,
/// an RTCP session, or an HTTP long-poll session.  `send` never blocks; it
/// enqueues and the I/O machinery flushes.  Safe to call from any task.
pub trait Connection: Send + Sync {
    fn id(&self) -> u64;

    /// Queue a message for delivery.  Messages sent after close are dropped.
    fn send(&self, message: OutboundMessage);

    /// Shut the connection down.  Queued messages are still flushed; the
    /// handler's `connection_died` fires exactly once.
    fn close(&self);

    fn is_open(&self) -> bool;

    /// Short printable tag for log lines.
    fn label(&self) -> String;
}

/// Implemented by whoever consumes a connection's messages: the application
/// itself, or a session layer wrapping the application.
pub trait MessageHandler: Send + Sync {
    fn receive_msg(&self, connection: &Arc<dyn Connection>, message: InboundMessage);

    fn connection_died(&self, connection: &Arc<dyn Connection>, reason: &AppError);
}

/// Provides a message handler for each new connection on a port.  A failed
/// outbound connect calls this with `None` so the requester learns the
/// attempt came to nothing.
pub trait MessageHandlerFactory: Send + Sync {
    fn provide_handler(
        &self,
        connection: Option<&Arc<dyn Connection>>,
    ) -> Option<Arc<dyn MessageHandler>>;
}
