//! Protocol framers: per-connection state machines converting raw bytes into
//! discrete application messages and application messages back into bytes.
//!
//! Every decoder is resumable: when the buffered bytes do not yet contain a
//! complete message, `receive_bytes` returns whatever complete messages it
//! did extract and parsing continues from exactly the same point on the next
//! call.  Decode state and encode state are separate objects so the socket
//! write half never touches parser state.

pub use http::{HttpError, HttpFrameDecoder, HttpFrameEncoder, HttpOptionsReply, HttpRequest};
pub(crate) use http::percent_decode;
pub use json::{JsonFrameDecoder, JsonFrameEncoder};
pub use rtcp::{RtcpFrameDecoder, RtcpFrameEncoder, RtcpRequest, RtcpVerb};
pub use websocket::{
    WebsocketFrameDecoder, WebsocketFrameEncoder, WebsocketRequest, WsHandshake,
};

mod http;
mod json;
mod rtcp;
mod websocket;

use serde_json::Value;

use crate::service::Protocol;
use crate::AppResult;

/// A fully framed inbound item, as delivered to a connection's message
/// handler.  The variant depends on the wire protocol of the port.
#[derive(Debug)]
pub enum InboundMessage {
    /// A parsed application message.
    Json(Value),
    /// A complete HTTP request (HTTP and pre-handshake WebSocket ports).
    Http(HttpRequest),
    /// A WebSocket upgrade request awaiting its handshake reply.
    Websocket(WebsocketRequest),
    /// A complete RTCP request.
    Rtcp(RtcpRequest),
    /// A JSON syntax error, surfaced only when debug replies are enabled.
    Problem(String),
}

/// An outbound item accepted by `Connection::send`.  Which variants a given
/// port can actually write is up to its encoder; the rest are rejected as
/// unwritable.
#[derive(Debug, Clone)]
pub enum OutboundMessage {
    /// An application message, encoded canonically by the framer.
    Json(Value),
    /// Pre-formatted protocol text (RTCP reply lines, HTTP reply bodies).
    Text(String),
    HttpError(HttpError),
    HttpOptions(HttpOptionsReply),
    WsHandshake(WsHandshake),
}

/// Knobs shared by the text-protocol decoders.
#[derive(Debug, Clone)]
pub struct FramerConfig {
    pub max_msg_length: usize,
    pub debug_replies: bool,
}

impl Default for FramerConfig {
    fn default() -> Self {
        FramerConfig {
            max_msg_length: 1024 * 1024,
            debug_replies: false,
        }
    }
}

pub trait FrameDecoder: Send {
    /// Feed newly arrived bytes and extract every complete message they
    /// finish.  An empty `data` slice re-drives parsing of already-buffered
    /// bytes.  An error is fatal to the connection.
    fn receive_bytes(&mut self, data: &[u8]) -> AppResult<Vec<InboundMessage>>;
}

pub trait FrameEncoder: Send + Sync {
    /// Serialize one outbound message into the exact bytes to write.
    fn produce_bytes(&self, message: &OutboundMessage) -> AppResult<Vec<u8>>;
}

/// Build the decoder for a connection on a port speaking `protocol`.
pub fn decoder_for(protocol: Protocol, cfg: FramerConfig) -> Box<dyn FrameDecoder> {
    match protocol {
        Protocol::Json => Box::new(JsonFrameDecoder::new(cfg)),
        Protocol::Http => Box::new(HttpFrameDecoder::new(cfg)),
        Protocol::Websocket => Box::new(WebsocketFrameDecoder::new(cfg)),
        Protocol::Rtcp => Box::new(RtcpFrameDecoder::new(cfg)),
    }
}

/// Build the encoder for a connection on a port speaking `protocol`.
/// `host_addr` and `root_uri` matter only to WebSocket handshake replies.
pub fn encoder_for(protocol: Protocol, host_addr: &str, root_uri: &str) -> Box<dyn FrameEncoder> {
    match protocol {
        Protocol::Json => Box::new(JsonFrameEncoder),
        Protocol::Http => Box::new(HttpFrameEncoder),
        Protocol::Websocket => Box::new(WebsocketFrameEncoder::new(host_addr, root_uri)),
        Protocol::Rtcp => Box::new(RtcpFrameEncoder),
    }
}
