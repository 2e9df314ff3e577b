use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;

use crate::network::chunk_stream::ChunkyInputStream;
use crate::{AppError, AppResult};

use super::http::error_reply;
use super::json::drive_json_lines;
use super::{FrameDecoder, FrameEncoder, FramerConfig, HttpRequest, InboundMessage, OutboundMessage};

/// A WebSocket upgrade request: the HTTP-shaped header block plus, for the
/// legacy handshake generation, the 8 challenge bytes that follow it.
#[derive(Debug)]
pub struct WebsocketRequest {
    pub request: HttpRequest,
    pub crazy_key: Option<Vec<u8>>,
}

impl WebsocketRequest {
    pub fn method(&self) -> Option<&str> {
        self.request.method()
    }

    pub fn uri(&self) -> Option<&str> {
        self.request.uri()
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.request.header(name)
    }
}

/// A computed handshake reply awaiting serialization.  `version` 0 is the
/// legacy hixie-76 style challenge response, `version` 6 the
/// Sec-WebSocket-Accept style.
#[derive(Debug, Clone)]
pub struct WsHandshake {
    pub version: u8,
    pub bytes: Vec<u8>,
}

#[derive(Debug, PartialEq)]
enum WsParseStage {
    Start,
    Headers,
    Handshake,
    Messages,
}

/// Decoder for WebSocket connections: an HTTP-style upgrade request, a
/// version-specific handshake, then JSON message blocks carried in
/// 0x00/0xFF frames.
pub struct WebsocketFrameDecoder {
    input: ChunkyInputStream,
    stage: WsParseStage,
    request: HttpRequest,
    msg_buffer: String,
    cfg: FramerConfig,
}

impl WebsocketFrameDecoder {
    pub fn new(cfg: FramerConfig) -> WebsocketFrameDecoder {
        WebsocketFrameDecoder {
            input: ChunkyInputStream::new(),
            stage: WsParseStage::Start,
            request: HttpRequest::new(),
            msg_buffer: String::with_capacity(1000),
            cfg,
        }
    }
}

impl FrameDecoder for WebsocketFrameDecoder {
    fn receive_bytes(&mut self, data: &[u8]) -> AppResult<Vec<InboundMessage>> {
        self.input.add_buffer(data);
        let mut out = Vec::new();

        loop {
            match self.stage {
                WsParseStage::Start => {
                    let line = match self.input.read_ascii_line()? {
                        Some(line) => line,
                        None => return Ok(out),
                    };
                    if !line.is_empty() {
                        self.request.parse_start_line(&line);
                        self.stage = WsParseStage::Headers;
                    }
                }
                WsParseStage::Headers => {
                    let line = match self.input.read_ascii_line()? {
                        Some(line) => line,
                        None => return Ok(out),
                    };
                    if line.is_empty() {
                        self.stage = WsParseStage::Handshake;
                    } else {
                        self.request.parse_header_line(&line);
                    }
                }
                WsParseStage::Handshake => {
                    let crazy_key = if self.request.header("sec-websocket-key1").is_some() {
                        match self.input.read_bytes(8) {
                            Some(key) => Some(key),
                            None => return Ok(out),
                        }
                    } else {
                        None
                    };
                    let request = std::mem::take(&mut self.request);
                    out.push(InboundMessage::Websocket(WebsocketRequest {
                        request,
                        crazy_key,
                    }));
                    self.input.enable_websocket_framing();
                    self.stage = WsParseStage::Messages;
                }
                WsParseStage::Messages => {
                    drive_json_lines(&mut self.input, &mut self.msg_buffer, &self.cfg, &mut out)?;
                    return Ok(out);
                }
            }
        }
    }
}

/// Encoder for WebSocket connections: JSON messages go out in 0x00/0xFF
/// frames; handshake replies and upgrade failures go out as raw HTTP.
pub struct WebsocketFrameEncoder {
    /// Host address (with port) of the connection point, for the legacy
    /// handshake's Location header.
    host_addr: String,
    /// The host address stripped of its port.
    host_name: String,
    socket_uri: String,
}

impl WebsocketFrameEncoder {
    pub fn new(host_addr: &str, root_uri: &str) -> WebsocketFrameEncoder {
        let host_name = match host_addr.find(':') {
            Some(colon) => host_addr[..colon].to_string(),
            None => host_addr.to_string(),
        };
        let socket_uri = if root_uri.starts_with('/') {
            root_uri.to_string()
        } else {
            format!("/{}", root_uri)
        };
        WebsocketFrameEncoder {
            host_addr: host_addr.to_string(),
            host_name,
            socket_uri,
        }
    }

    fn frame_text(text: &str) -> Vec<u8> {
        let payload = text.as_bytes();
        let mut frame = Vec::with_capacity(payload.len() + 2);
        frame.push(0x00);
        frame.extend_from_slice(payload);
        frame.push(0xFF);
        frame
    }
}

impl FrameEncoder for WebsocketFrameEncoder {
    fn produce_bytes(&self, message: &OutboundMessage) -> AppResult<Vec<u8>> {
        match message {
            OutboundMessage::Json(value) => Ok(Self::frame_text(&value.to_string())),
            OutboundMessage::Text(text) => Ok(Self::frame_text(text)),
            OutboundMessage::WsHandshake(handshake) => match handshake.version {
                0 => {
                    let header = format!(
                        "HTTP/1.1 101 WebSocket Protocol Handshake\r\n\
                         Upgrade: WebSocket\r\n\
                         Connection: Upgrade\r\n\
                         Sec-WebSocket-Origin: http://{}\r\n\
                         Sec-WebSocket-Location: ws://{}{}\r\n\
                         Sec-WebSocket-Protocol: *\r\n\r\n",
                        self.host_name, self.host_addr, self.socket_uri
                    );
                    let mut reply = header.into_bytes();
                    reply.extend_from_slice(&handshake.bytes);
                    Ok(reply)
                }
                6 => {
                    let header = format!(
                        "HTTP/1.1 101 Switching Protocols\r\n\
                         Upgrade: Websocket\r\n\
                         Connection: Upgrade\r\n\
                         Sec-WebSocket-Accept: {}\r\n\r\n",
                        BASE64.encode(&handshake.bytes)
                    );
                    Ok(header.into_bytes())
                }
                version => Err(AppError::HandshakeFailed(format!(
                    "unsupported WebSocket version {}",
                    version
                ))),
            },
            OutboundMessage::HttpError(error) => Ok(error_reply(error).into_bytes()),
            other => Err(AppError::UnwritableMessage(format!("{:?}", other))),
        }
    }
}
