use std::collections::HashMap;

use crate::network::chunk_stream::ChunkyInputStream;
use crate::{AppError, AppResult};

use super::{FrameDecoder, FrameEncoder, FramerConfig, InboundMessage, OutboundMessage};

/// An HTTP request descriptor, filled in line by line as the request is
/// received.
#[derive(Debug, Default)]
pub struct HttpRequest {
    method: Option<String>,
    uri: Option<String>,
    headers: HashMap<String, String>,
    content_length: usize,
    non_persistent: bool,
    url_encoded: bool,
    content: Option<String>,
}

impl HttpRequest {
    pub fn new() -> HttpRequest {
        HttpRequest::default()
    }

    pub fn method(&self) -> Option<&str> {
        self.method.as_deref()
    }

    pub fn uri(&self) -> Option<&str> {
        self.uri.as_deref()
    }

    /// Header value by lower-cased name.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(|v| v.as_str())
    }

    pub fn content(&self) -> Option<&str> {
        self.content.as_deref()
    }

    pub fn content_length(&self) -> usize {
        self.content_length
    }

    /// True if a header line said "Connection: close".
    pub fn is_non_persistent(&self) -> bool {
        self.non_persistent
    }

    pub(crate) fn parse_start_line(&mut self, line: &str) {
        let line = line.trim();
        if let Some(method_end) = line.find(' ') {
            self.method = Some(line[..method_end].to_string());
            let rest = &line[method_end + 1..];
            if let Some(uri_end) = rest.find(' ') {
                self.uri = Some(rest[..uri_end].to_lowercase());
            }
        }
    }

    pub(crate) fn parse_header_line(&mut self, line: &str) {
        let line = line.trim();
        if let Some(colon) = line.find(':') {
            if colon == 0 || colon >= line.len() - 1 {
                return;
            }
            let name = line[..colon].trim().to_lowercase();
            let value = line[colon + 1..].trim().to_string();
            match name.as_str() {
                "content-length" => {
                    self.content_length = value.parse().unwrap_or(0);
                }
                "connection" => {
                    self.non_persistent = value.eq_ignore_ascii_case("close");
                }
                "content-type" => {
                    self.url_encoded =
                        value.eq_ignore_ascii_case("application/x-www-form-urlencoded");
                }
                _ => {}
            }
            self.headers.insert(name, value);
        }
    }

    pub(crate) fn set_content(&mut self, content: String) {
        if self.url_encoded {
            self.content = Some(percent_decode(&content));
        } else {
            self.content = Some(content);
        }
    }
}

/// Decode application/x-www-form-urlencoded escapes.  Stray '%' runs that
/// are not valid escapes pass through untouched.
pub(crate) fn percent_decode(text: &str) -> String {
    let bytes = text.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            b'%' if i + 2 < bytes.len() => {
                let decoded = std::str::from_utf8(&bytes[i + 1..i + 3])
                    .ok()
                    .and_then(|hex| u8::from_str_radix(hex, 16).ok());
                if let Some(b) = decoded {
                    out.push(b);
                    i += 3;
                } else {
                    out.push(b'%');
                    i += 1;
                }
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

#[derive(Debug, PartialEq)]
enum HttpParseStage {
    Start,
    Headers,
    Body,
}

/// Three-stage HTTP/1.1 request decoder: request line, headers, then a body
/// of exactly Content-Length bytes.  After a complete request the decoder
/// resets so the same connection can carry the next pipelined request.
/// Chunked transfer coding is not supported.
pub struct HttpFrameDecoder {
    input: ChunkyInputStream,
    stage: HttpParseStage,
    request: HttpRequest,
    cfg: FramerConfig,
}

impl HttpFrameDecoder {
    pub fn new(cfg: FramerConfig) -> HttpFrameDecoder {
        HttpFrameDecoder {
            input: ChunkyInputStream::new(),
            stage: HttpParseStage::Start,
            request: HttpRequest::new(),
            cfg,
        }
    }
}

impl FrameDecoder for HttpFrameDecoder {
    fn receive_bytes(&mut self, data: &[u8]) -> AppResult<Vec<InboundMessage>> {
        self.input.add_buffer(data);
        let mut out = Vec::new();

        loop {
            match self.stage {
                HttpParseStage::Start => {
                    let line = match self.input.read_ascii_line()? {
                        Some(line) => line,
                        None => return Ok(out),
                    };
                    if !line.is_empty() {
                        self.request.parse_start_line(&line);
                        self.stage = HttpParseStage::Headers;
                    }
                }
                HttpParseStage::Headers => {
                    let line = match self.input.read_ascii_line()? {
                        Some(line) => line,
                        None => return Ok(out),
                    };
                    if line.is_empty() {
                        self.stage = HttpParseStage::Body;
                    } else {
                        self.request.parse_header_line(&line);
                    }
                }
                HttpParseStage::Body => {
                    let body_len = self.request.content_length();
                    if body_len > self.cfg.max_msg_length {
                        return Err(AppError::MessageTooLarge(format!(
                            "message too large: {} > {}",
                            body_len, self.cfg.max_msg_length
                        )));
                    }
                    if body_len > 0 {
                        if self.input.available() < body_len {
                            return Ok(out);
                        }
                        self.input.update_useful_byte_count(body_len);
                        let body = self
                            .input
                            .read_bytes(body_len)
                            .expect("availability just checked");
                        let content = String::from_utf8(body).map_err(|_| AppError::BadUtf8)?;
                        self.request.set_content(content);
                    }
                    let request = std::mem::take(&mut self.request);
                    out.push(InboundMessage::Http(request));
                    self.stage = HttpParseStage::Start;
                }
            }
        }
    }
}

/// A structured HTTP error reply: status code, reason phrase, and body.
#[derive(Debug, Clone)]
pub struct HttpError {
    pub code: u16,
    pub reason: String,
    pub body: String,
}

impl HttpError {
    pub fn new(code: u16, reason: &str, body: impl Into<String>) -> HttpError {
        HttpError {
            code,
            reason: reason.to_string(),
            body: body.into(),
        }
    }
}

/// Reply to a CORS preflight OPTIONS request.  Carries the header names the
/// client asked permission for, if any.
#[derive(Debug, Clone, Default)]
pub struct HttpOptionsReply {
    pub allow_headers: Option<String>,
}

impl HttpOptionsReply {
    pub fn for_request(request: &HttpRequest) -> HttpOptionsReply {
        HttpOptionsReply {
            allow_headers: request
                .header("access-control-request-headers")
                .map(|h| h.to_string()),
        }
    }

    fn headers_header(&self) -> String {
        match &self.allow_headers {
            Some(headers) => format!("Access-Control-Allow-Headers: {}\r\n", headers),
            None => String::new(),
        }
    }
}

/// Encoder synthesizing full HTTP/1.1 replies.  Replies always carry
/// `Access-Control-Allow-Origin: *` so browser clients can reach the server
/// cross-origin.
pub struct HttpFrameEncoder;

impl FrameEncoder for HttpFrameEncoder {
    fn produce_bytes(&self, message: &OutboundMessage) -> AppResult<Vec<u8>> {
        let reply = match message {
            OutboundMessage::Text(body) => plain_reply(body),
            OutboundMessage::Json(value) => plain_reply(&value.to_string()),
            OutboundMessage::HttpError(error) => error_reply(error),
            OutboundMessage::HttpOptions(options) => {
                format!(
                    "HTTP/1.1 200 OK\r\n\
                     Access-Control-Allow-Origin: *\r\n\
                     Access-Control-Max-Age: 31536000\r\n\
                     Access-Control-Allow-Methods: GET, POST, OPTIONS\r\n\
                     {}Content-Type: text/plain\r\n\
                     Content-Length: 0\r\n\
                     \r\n",
                    options.headers_header()
                )
            }
            other => {
                return Err(AppError::UnwritableMessage(format!("{:?}", other)));
            }
        };
        Ok(reply.into_bytes())
    }
}

fn plain_reply(body: &str) -> String {
    format!(
        "HTTP/1.1 200 OK\r\n\
         Cache-Control: no-cache\r\n\
         Access-Control-Allow-Origin: *\r\n\
         Content-Type: text/plain; charset=UTF-8\r\n\
         Content-Length: {}\r\n\
         \r\n\
         {}",
        body.len(),
        body
    )
}

pub(crate) fn error_reply(error: &HttpError) -> String {
    format!(
        "HTTP/1.1 {} {}\r\n\
         Access-Control-Allow-Origin: *\r\n\
         Content-Length: {}\r\n\
         \r\n\
         {}",
        error.code,
        error.reason,
        error.body.len(),
        error.body
    )
}
