//! Session layer: the durable logical connections multiplexed over
//! disposable TCP connections.
//!
//! An RTCP session survives TCP connection loss outright; an HTTP session
//! stitches a message stream out of a series of short-lived long-poll
//! requests; a WebSocket port needs only its handshake handled before the
//! plain message stream takes over.  Each port's handler factory wraps the
//! application-level factory behind the appropriate reattachment logic.

pub use http::HttpSessionConnection;
pub use http_handler::{HttpHandlerFactory, SessionUri, UriVerb};
pub use registry::SessionRegistry;
pub use rtcp::RtcpSessionConnection;
pub use rtcp_handler::RtcpHandlerFactory;
pub use websocket::WebsocketHandlerFactory;

mod http;
mod http_handler;
mod registry;
mod rtcp;
mod rtcp_handler;
mod websocket;
