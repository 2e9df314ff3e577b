// Copyright 2025 the portico authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::sync::Arc;

use sha1::{Digest, Sha1};
use tracing::{debug, info};

use crate::network::framer::{
    HttpError, InboundMessage, OutboundMessage, WebsocketRequest, WsHandshake,
};
use crate::network::{Connection, MessageHandler, MessageHandlerFactory};
use crate::AppError;

const MAGIC_WS_HANDSHAKE_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Message handler factory for WebSocket ports: validates and answers the
/// version-appropriate connection handshake, then hands the JSON message
/// stream straight through to the application-level handler.
pub struct WebsocketHandlerFactory {
    inner: Arc<dyn MessageHandlerFactory>,
    socket_uri: String,
}

impl WebsocketHandlerFactory {
    pub fn new(inner: Arc<dyn MessageHandlerFactory>, root_uri: &str) -> WebsocketHandlerFactory {
        let socket_uri = format!("/{}", root_uri.trim_matches('/'));
        WebsocketHandlerFactory { inner, socket_uri }
    }
}

impl MessageHandlerFactory for WebsocketHandlerFactory {
    fn provide_handler(
        &self,
        connection: Option<&Arc<dyn Connection>>,
    ) -> Option<Arc<dyn MessageHandler>> {
        let inner_handler = self.inner.provide_handler(connection)?;
        Some(Arc::new(WebsocketMessageHandler {
            inner_handler,
            socket_uri: self.socket_uri.clone(),
        }))
    }
}

struct WebsocketMessageHandler {
    inner_handler: Arc<dyn MessageHandler>,
    socket_uri: String,
}

impl WebsocketMessageHandler {
    fn do_connection_handshake(&self, connection: &Arc<dyn Connection>, request: WebsocketRequest) {
        let key = request.header("sec-websocket-key");
        let key1 = request.header("sec-websocket-key1");
        let key2 = request.header("sec-websocket-key2");

        if !request
            .method()
            .map(|m| m.eq_ignore_ascii_case("GET"))
            .unwrap_or(false)
        {
            self.send_error(connection, "WebSocket connection start requires GET");
        } else if !request
            .uri()
            .map(|u| u.eq_ignore_ascii_case(&self.socket_uri))
            .unwrap_or(false)
        {
            self.send_error(connection, "Invalid WebSocket endpoint URI");
        } else if !request
            .header("upgrade")
            .map(|u| u.eq_ignore_ascii_case("WebSocket"))
            .unwrap_or(false)
        {
            self.send_error(connection, "Invalid WebSocket Upgrade header");
        } else if !connection_header_has_upgrade(&request) {
            self.send_error(connection, "Invalid WebSocket Connection header");
        } else if let Some(key) = key {
            connection.send(OutboundMessage::WsHandshake(generate_handshake6(key)));
        } else if request.crazy_key.is_none() {
            self.send_error(connection, "Invalid WebSocket client token");
        } else {
            match (key1, key2) {
                (Some(key1), Some(key2)) => {
                    let crazy_key = request.crazy_key.as_deref().unwrap_or(&[]);
                    debug!("crazy key = {:02x?}", crazy_key);
                    connection.send(OutboundMessage::WsHandshake(generate_handshake0(
                        key1, key2, crazy_key,
                    )));
                }
                _ => self.send_error(connection, "Invalid WebSocket key header"),
            }
        }
    }

    /// A failed upgrade is fatal to the connection: send a proper HTTP error
    /// reply, then drop it.
    fn send_error(&self, connection: &Arc<dyn Connection>, problem: &str) {
        info!(
            "{} received invalid WebSocket connection startup: {}",
            connection.label(),
            problem
        );
        connection.send(OutboundMessage::HttpError(HttpError::new(
            400,
            "Bad Request",
            make_error_reply(problem),
        )));
        connection.close();
    }
}

impl MessageHandler for WebsocketMessageHandler {
    fn receive_msg(&self, connection: &Arc<dyn Connection>, message: InboundMessage) {
        match message {
            InboundMessage::Websocket(request) => {
                self.do_connection_handshake(connection, request)
            }
            other => self.inner_handler.receive_msg(connection, other),
        }
    }

    fn connection_died(&self, connection: &Arc<dyn Connection>, reason: &AppError) {
        self.inner_handler.connection_died(connection, reason);
    }
}

fn connection_header_has_upgrade(request: &WebsocketRequest) -> bool {
    request
        .header("connection")
        .map(|value| value.split(',').any(|v| v.trim() == "Upgrade"))
        .unwrap_or(false)
}

fn make_error_reply(problem: &str) -> String {
    format!(
        "<!DOCTYPE HTML PUBLIC \"-//IETF//DTD HTML 2.0//EN\">\n\
         <html><head>\n\
         <title>400 Bad Request</title>\n\
         </head><body>\n\
         <h1>Bad Request</h1>\n\
         <p>WebSocket connection setup failed: {}.</p>\n\
         </body></html>\n\n",
        problem
    )
}

/// Decode one of the legacy handshake's number-and-spaces keys: concatenate
/// the digits, then divide by the space count.
fn insane_key_decode(key: &str) -> u32 {
    let mut space_count: u64 = 0;
    let mut num: u64 = 0;
    for c in key.chars() {
        if c.is_ascii_digit() {
            num = num.wrapping_mul(10).wrapping_add(c as u64 - '0' as u64);
        } else if c == ' ' {
            space_count += 1;
        }
    }
    num.checked_div(space_count).unwrap_or(0) as u32
}

/// The legacy (version 0) challenge response: MD5 over the two decoded key
/// numbers (big-endian) and the 8 challenge bytes.
fn generate_handshake0(key1: &str, key2: &str, crazy_key: &[u8]) -> WsHandshake {
    let mut input = Vec::with_capacity(16);
    input.extend_from_slice(&insane_key_decode(key1).to_be_bytes());
    input.extend_from_slice(&insane_key_decode(key2).to_be_bytes());
    input.extend_from_slice(crazy_key);
    let digest = md5::compute(&input);
    WsHandshake {
        version: 0,
        bytes: digest.0.to_vec(),
    }
}

/// The modern (version 6 style) response: SHA-1 over the client key and the
/// magic GUID, sent back base64-encoded as Sec-WebSocket-Accept.
fn generate_handshake6(key: &str) -> WsHandshake {
    let mut sha1 = Sha1::new();
    sha1.update(key.as_bytes());
    sha1.update(MAGIC_WS_HANDSHAKE_GUID.as_bytes());
    WsHandshake {
        version: 6,
        bytes: sha1.finalize().to_vec(),
    }
}

#[cfg(test)]
mod tests {
    use base64::engine::general_purpose::STANDARD as BASE64;
    use base64::Engine;

    use crate::network::framer::HttpRequest;
    use crate::session::testing::{MockConnection, RecordingApp, RecordingAppFactory};

    use super::*;

    fn upgrade_request(headers: &[(&str, &str)], crazy_key: Option<&[u8]>) -> WebsocketRequest {
        let mut request = HttpRequest::new();
        request.parse_start_line("GET /game HTTP/1.1");
        for (name, value) in headers {
            request.parse_header_line(&format!("{}: {}", name, value));
        }
        WebsocketRequest {
            request,
            crazy_key: crazy_key.map(|k| k.to_vec()),
        }
    }

    fn handler_for_test() -> (Arc<dyn MessageHandler>, Arc<MockConnection>, Arc<dyn Connection>) {
        let app = RecordingApp::new();
        let factory = WebsocketHandlerFactory::new(RecordingAppFactory::new(app), "game");
        let mock = MockConnection::new(1);
        let conn: Arc<dyn Connection> = mock.clone();
        let handler = factory.provide_handler(Some(&conn)).unwrap();
        (handler, mock, conn)
    }

    #[test]
    fn modern_handshake_computes_rfc_accept_value() {
        let (handler, mock, conn) = handler_for_test();
        let request = upgrade_request(
            &[
                ("Upgrade", "websocket"),
                ("Connection", "keep-alive, Upgrade"),
                ("Sec-WebSocket-Key", "dGhlIHNhbXBsZSBub25jZQ=="),
            ],
            None,
        );
        handler.receive_msg(&conn, InboundMessage::Websocket(request));

        let sent = mock.sent.lock();
        match sent.first() {
            Some(OutboundMessage::WsHandshake(hs)) => {
                assert_eq!(hs.version, 6);
                assert_eq!(BASE64.encode(&hs.bytes), "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=");
            }
            other => panic!("expected handshake, got {:?}", other),
        }
    }

    #[test]
    fn legacy_handshake_produces_md5_digest() {
        let (handler, mock, conn) = handler_for_test();
        let request = upgrade_request(
            &[
                ("Upgrade", "WebSocket"),
                ("Connection", "Upgrade"),
                ("Sec-WebSocket-Key1", "4 @1  46546xW%0l 1 5"),
                ("Sec-WebSocket-Key2", "12998 5 Y3 1  .P00"),
            ],
            Some(b"12345678"),
        );
        handler.receive_msg(&conn, InboundMessage::Websocket(request));

        let sent = mock.sent.lock();
        match sent.first() {
            Some(OutboundMessage::WsHandshake(hs)) => {
                assert_eq!(hs.version, 0);
                assert_eq!(hs.bytes.len(), 16);
            }
            other => panic!("expected handshake, got {:?}", other),
        }
    }

    #[test]
    fn non_get_method_fails_upgrade_and_closes() {
        let (handler, mock, conn) = handler_for_test();
        let mut http = HttpRequest::new();
        http.parse_start_line("POST /game HTTP/1.1");
        http.parse_header_line("Upgrade: WebSocket");
        http.parse_header_line("Connection: Upgrade");
        let request = WebsocketRequest {
            request: http,
            crazy_key: None,
        };
        handler.receive_msg(&conn, InboundMessage::Websocket(request));

        assert!(!mock.is_open());
        let sent = mock.sent.lock();
        assert!(matches!(
            sent.first(),
            Some(OutboundMessage::HttpError(e)) if e.code == 400
        ));
    }

    #[test]
    fn wrong_uri_fails_upgrade() {
        let app = RecordingApp::new();
        let factory = WebsocketHandlerFactory::new(RecordingAppFactory::new(app), "game");
        let mock = MockConnection::new(1);
        let conn: Arc<dyn Connection> = mock.clone();
        let handler = factory.provide_handler(Some(&conn)).unwrap();

        let mut http = HttpRequest::new();
        http.parse_start_line("GET /other HTTP/1.1");
        http.parse_header_line("Upgrade: WebSocket");
        http.parse_header_line("Connection: Upgrade");
        handler.receive_msg(
            &conn,
            InboundMessage::Websocket(WebsocketRequest {
                request: http,
                crazy_key: None,
            }),
        );
        assert!(!mock.is_open());
    }

    #[test]
    fn insane_key_decode_divides_digits_by_spaces() {
        // digits 4146546015, 5 spaces
        assert_eq!(insane_key_decode("4 @1  46546xW%0l 1 5"), 829309203);
        // digits 1299853100, 5 spaces
        assert_eq!(insane_key_decode("12998 5 Y3 1  .P00"), 259970620);
        // no spaces: degenerate, decodes to 0 rather than dividing by zero
        assert_eq!(insane_key_decode("123"), 0);
    }
}
