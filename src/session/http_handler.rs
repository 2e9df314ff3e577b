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

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use rand::rngs::OsRng;
use rand::RngCore;
use serde_json::{json, Value};
use tracing::{error, info, warn};

use crate::network::framer::{
    HttpError, HttpOptionsReply, HttpRequest, InboundMessage, OutboundMessage,
};
use crate::network::{Connection, MessageHandler, MessageHandlerFactory};
use crate::service::SessionConfig;
use crate::utils::Timer;
use crate::AppError;

use super::http::HttpSessionConnection;
use super::registry::SessionRegistry;

/// Verb encoded in an HTTP session URI.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UriVerb {
    Connect,
    Select,
    Xmit,
    Disconnect,
}

/// The parsed fragments of an HTTP session URI.  Recognized forms:
///
/// ```text
/// /ROOT/connect
/// /ROOT/connect/RANDOMCRUDTHATISIGNORED
/// /ROOT/select/SESSIONID/SEQUENCENUMBER
/// /ROOT/xmit/SESSIONID/SEQUENCENUMBER
/// /ROOT/disconnect/SESSIONID
/// ```
#[derive(Debug)]
pub struct SessionUri {
    pub verb: UriVerb,
    pub session_id: u64,
    pub sequence_number: i64,
}

impl SessionUri {
    /// Parse a URI string; `None` if it is not a well-formed session URI
    /// under `root_uri`.
    pub fn parse(uri: &str, root_uri: &str) -> Option<SessionUri> {
        let root = format!("/{}/", root_uri.trim_matches('/'));
        let mut rest = uri.strip_prefix(root.as_str())?;
        if let Some(stripped) = rest.strip_suffix('/') {
            rest = stripped;
        }
        if rest == "connect" || rest.starts_with("connect/") {
            return Some(SessionUri {
                verb: UriVerb::Connect,
                session_id: 0,
                sequence_number: 0,
            });
        }
        let mut parts = rest.split('/');
        let verb = match parts.next()? {
            "select" => UriVerb::Select,
            "xmit" => UriVerb::Xmit,
            "disconnect" => UriVerb::Disconnect,
            _ => return None,
        };
        let session_id: u64 = parts.next()?.parse().ok()?;
        let sequence_number: i64 = match verb {
            UriVerb::Disconnect => 0,
            _ => parts.next()?.parse().ok()?,
        };
        if parts.next().is_some() {
            return None;
        }
        Some(SessionUri {
            verb,
            session_id,
            sequence_number,
        })
    }
}

pub(crate) fn make_connect_reply(session_id: u64) -> String {
    format!("{}\n", json!({"sessionid": session_id.to_string()}))
}

pub(crate) fn make_select_reply(seq_number: i64, msgs: &[Value]) -> String {
    format!("{}\n", json!({"seq": seq_number, "msgs": msgs}))
}

pub(crate) fn make_xmit_reply(seq_number: i64) -> String {
    format!("{}\n", json!({"seq": seq_number}))
}

pub(crate) fn make_sequence_error_reply(error_tag: &str) -> String {
    format!("{}\n", json!({"error": error_tag}))
}

fn make_disconnect_reply() -> String {
    format!("{}\n", json!({"end": true}))
}

fn make_bad_url_reply(uri: &str) -> String {
    format!("Bad URL: {}\n", uri)
}

/// Extract the JSON message bundle from an /xmit/ POST body.  Some browsers
/// wrap the bundle in a form field, so a leading field name and '=' are
/// stripped (percent-decoding first when the payload looks escaped).
pub(crate) fn post_body_unpacker(body: &str) -> Vec<Value> {
    let mut body = body.to_string();
    if let Some(junk_mark) = body.find('=') {
        if body[junk_mark + 1..].starts_with('%') {
            body = crate::network::framer::percent_decode(&body);
        }
        if let Some(start_of_message) = body.find('{') {
            if start_of_message > junk_mark {
                body = body[junk_mark + 1..].to_string();
            }
        }
    }
    let mut messages = Vec::new();
    let mut stream = serde_json::Deserializer::from_str(&body).into_iter::<Value>();
    loop {
        match stream.next() {
            Some(Ok(value)) => messages.push(value),
            Some(Err(err)) => {
                warn!("syntax error in JSON message: {}", err);
                break;
            }
            None => break,
        }
    }
    messages
}

/// Shared state behind every HTTP port handler: the session tables, the
/// wrapped application factory, and the long-poll timing knobs.
pub struct HttpCore {
    inner: Arc<dyn MessageHandlerFactory>,
    sessions: SessionRegistry<HttpSessionConnection>,
    select_timeout: Duration,
    session_timeout: Duration,
    timer: Timer,
    connection_id_gen: Arc<AtomicU64>,
    root_uri: String,
    weak_self: Weak<HttpCore>,
}

impl HttpCore {
    pub(crate) fn remove_session(&self, session_id: u64) {
        self.sessions.remove(&session_id.to_string());
    }

    fn get_session(&self, session_id: u64) -> Option<Arc<HttpSessionConnection>> {
        self.sessions.get(&session_id.to_string())
    }

    fn associate_tcp_connection(
        &self,
        session: &Arc<HttpSessionConnection>,
        connection: &Arc<dyn Connection>,
    ) {
        if let Some(known) = self.sessions.by_connection(connection.id()) {
            known.dissociate_tcp_connection(connection.id());
        }
        self.sessions.bind_connection(connection.id(), session.clone());
        session.associate_tcp_connection(connection.clone());
    }

    /// GET /connect/: create a new session and tell the client its ID.
    fn do_connect(&self, connection: &Arc<dyn Connection>) {
        let session_id = OsRng.next_u64();
        let id = self.connection_id_gen.fetch_add(1, Ordering::Relaxed);
        let session = HttpSessionConnection::new(
            id,
            session_id,
            self.weak_self.clone(),
            self.timer.clone(),
            self.select_timeout,
            self.session_timeout,
        );
        self.sessions.add(&session_id.to_string(), session.clone());
        session.provide_handler_from(&self.inner);
        self.associate_tcp_connection(&session, connection);
        info!("{} connect over {}", session.label(), connection.label());
        connection.send(OutboundMessage::Text(make_connect_reply(session_id)));
    }

    /// GET /select/: poll for messages from the server to the client.
    fn do_select(&self, connection: &Arc<dyn Connection>, uri: &SessionUri, non_persistent: bool) {
        match self.get_session(uri.session_id) {
            Some(session) => {
                self.associate_tcp_connection(&session, connection);
                session.select_messages(connection, uri.sequence_number, non_persistent);
            }
            None => {
                error!("got select with invalid session {}", uri.session_id);
                connection.send(OutboundMessage::Text(make_sequence_error_reply(
                    "sessionIDError",
                )));
            }
        }
    }

    /// POST /xmit/: deliver a bundle of messages from the client.
    fn do_xmit(&self, connection: &Arc<dyn Connection>, uri: &SessionUri, body: &str) {
        match self.get_session(uri.session_id) {
            Some(session) => {
                self.associate_tcp_connection(&session, connection);
                let messages = post_body_unpacker(body);
                session.receive_message(connection, uri.sequence_number, messages);
            }
            None => {
                error!("got xmit with invalid session {}", uri.session_id);
                connection.send(OutboundMessage::Text(make_sequence_error_reply(
                    "sessionIDError",
                )));
            }
        }
    }

    /// GET /disconnect/: explicit session termination by the client.
    fn do_disconnect(&self, connection: &Arc<dyn Connection>, uri: &SessionUri) {
        let session = self.get_session(uri.session_id);
        if let Some(session) = &session {
            self.associate_tcp_connection(session, connection);
            session.note_client_activity();
        }
        match session {
            Some(session) => {
                connection.send(OutboundMessage::Text(make_disconnect_reply()));
                session.close();
            }
            None => {
                error!("got disconnect with invalid session {}", uri.session_id);
                connection.send(OutboundMessage::Text(make_sequence_error_reply(
                    "sessionIDError",
                )));
            }
        }
    }

    fn do_bad_uri(&self, connection: &Arc<dyn Connection>, uri: &str) {
        info!("{} received invalid URI in HTTP request {}", connection.label(), uri);
        connection.send(OutboundMessage::HttpError(HttpError::new(
            404,
            "Not Found",
            make_bad_url_reply(uri),
        )));
    }

    pub(crate) fn tcp_connection_died(&self, connection: &Arc<dyn Connection>) {
        if let Some(session) = self.sessions.unbind_connection(connection.id()) {
            session.dissociate_tcp_connection(connection.id());
        }
    }

    #[cfg(test)]
    pub(crate) fn session_count(&self) -> usize {
        self.sessions.session_count()
    }
}

/// Message handler factory for HTTP ports: wraps the application-level
/// factory so that the short-lived HTTP connections are stitched into
/// long-lived sessions keyed by the IDs carried in the request URIs.
pub struct HttpHandlerFactory {
    core: Arc<HttpCore>,
}

impl HttpHandlerFactory {
    pub fn new(
        inner: Arc<dyn MessageHandlerFactory>,
        session_cfg: &SessionConfig,
        root_uri: &str,
        timer: Timer,
        connection_id_gen: Arc<AtomicU64>,
    ) -> HttpHandlerFactory {
        HttpHandlerFactory {
            core: Arc::new_cyclic(|weak| HttpCore {
                inner,
                sessions: SessionRegistry::new(),
                select_timeout: Duration::from_secs(session_cfg.select_timeout_secs),
                session_timeout: Duration::from_secs(session_cfg.inactivity_timeout_secs),
                timer,
                connection_id_gen,
                root_uri: root_uri.trim_matches('/').to_string(),
                weak_self: weak.clone(),
            }),
        }
    }

    #[cfg(test)]
    pub(crate) fn core(&self) -> &Arc<HttpCore> {
        &self.core
    }
}

impl MessageHandlerFactory for HttpHandlerFactory {
    fn provide_handler(
        &self,
        connection: Option<&Arc<dyn Connection>>,
    ) -> Option<Arc<dyn MessageHandler>> {
        connection.map(|_| {
            let handler: Arc<dyn MessageHandler> = Arc::new(HttpMessageHandler {
                core: self.core.clone(),
            });
            handler
        })
    }
}

/// Per-TCP-connection handler for an HTTP port, dispatching each request by
/// method and session URI.
pub struct HttpMessageHandler {
    core: Arc<HttpCore>,
}

impl HttpMessageHandler {
    fn process_get(&self, connection: &Arc<dyn Connection>, request: &HttpRequest) {
        let uri = request.uri().unwrap_or("");
        match SessionUri::parse(uri, &self.core.root_uri) {
            Some(parsed) => match parsed.verb {
                UriVerb::Connect => self.core.do_connect(connection),
                UriVerb::Select => {
                    self.core
                        .do_select(connection, &parsed, request.is_non_persistent())
                }
                UriVerb::Disconnect => self.core.do_disconnect(connection, &parsed),
                // message delivery arrives by POST
                UriVerb::Xmit => self.core.do_bad_uri(connection, uri),
            },
            None => self.core.do_bad_uri(connection, uri),
        }
    }

    fn process_post(&self, connection: &Arc<dyn Connection>, request: &HttpRequest) {
        let uri = request.uri().unwrap_or("");
        match SessionUri::parse(uri, &self.core.root_uri) {
            Some(parsed) if parsed.verb == UriVerb::Xmit => {
                self.core
                    .do_xmit(connection, &parsed, request.content().unwrap_or(""));
            }
            _ => self.core.do_bad_uri(connection, uri),
        }
    }
}

impl MessageHandler for HttpMessageHandler {
    fn receive_msg(&self, connection: &Arc<dyn Connection>, message: InboundMessage) {
        let request = match message {
            InboundMessage::Http(request) => request,
            other => {
                warn!(
                    "{} unexpected message on HTTP port: {:?}",
                    connection.label(),
                    other
                );
                return;
            }
        };
        match request.method() {
            Some(method) if method.eq_ignore_ascii_case("GET") => {
                self.process_get(connection, &request)
            }
            Some(method) if method.eq_ignore_ascii_case("POST") => {
                self.process_post(connection, &request)
            }
            Some(method) if method.eq_ignore_ascii_case("OPTIONS") => {
                connection.send(OutboundMessage::HttpOptions(HttpOptionsReply::for_request(
                    &request,
                )));
            }
            method => {
                // unsupported method is fatal to this connection
                let method = method.unwrap_or("<none>").to_string();
                error!("{} unsupported HTTP method {}", connection.label(), method);
                connection.send(OutboundMessage::HttpError(HttpError::new(
                    405,
                    "Method Not Allowed",
                    format!("method {} not supported\n", method),
                )));
                connection.close();
            }
        }
    }

    fn connection_died(&self, connection: &Arc<dyn Connection>, _reason: &AppError) {
        self.core.tcp_connection_died(connection);
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use crate::session::testing::{MockConnection, RecordingApp, RecordingAppFactory};

    use super::*;

    fn test_factory(app: &Arc<RecordingApp>, session_cfg: &SessionConfig) -> HttpHandlerFactory {
        HttpHandlerFactory::new(
            RecordingAppFactory::new(app.clone()),
            session_cfg,
            "portico",
            Timer::new(),
            Arc::new(AtomicU64::new(500)),
        )
    }

    fn get(handler: &Arc<dyn MessageHandler>, conn: &Arc<dyn Connection>, uri: &str) {
        let mut request = HttpRequest::new();
        request.parse_start_line(&format!("GET {} HTTP/1.1", uri));
        handler.receive_msg(conn, InboundMessage::Http(request));
    }

    fn post(handler: &Arc<dyn MessageHandler>, conn: &Arc<dyn Connection>, uri: &str, body: &str) {
        let mut request = HttpRequest::new();
        request.parse_start_line(&format!("POST {} HTTP/1.1", uri));
        request.parse_header_line(&format!("Content-Length: {}", body.len()));
        request.set_content(body.to_string());
        handler.receive_msg(conn, InboundMessage::Http(request));
    }

    fn connect_session(
        factory: &HttpHandlerFactory,
        conn_id: u64,
    ) -> (Arc<dyn MessageHandler>, Arc<dyn Connection>, Arc<MockConnection>, u64) {
        let mock = MockConnection::new(conn_id);
        let conn: Arc<dyn Connection> = mock.clone();
        let handler = factory.provide_handler(Some(&conn)).unwrap();
        get(&handler, &conn, "/portico/connect");
        let reply = mock.sent_text().first().cloned().expect("connect reply");
        let parsed: Value = serde_json::from_str(reply.trim()).unwrap();
        let session_id: u64 = parsed["sessionid"].as_str().unwrap().parse().unwrap();
        (handler, conn, mock, session_id)
    }

    #[test]
    fn session_uri_parses_all_verbs() {
        let uri = SessionUri::parse("/portico/connect", "portico").unwrap();
        assert_eq!(uri.verb, UriVerb::Connect);

        let uri = SessionUri::parse("/portico/select/123/4", "portico").unwrap();
        assert_eq!(uri.verb, UriVerb::Select);
        assert_eq!(uri.session_id, 123);
        assert_eq!(uri.sequence_number, 4);

        let uri = SessionUri::parse("/portico/xmit/9/1", "portico").unwrap();
        assert_eq!(uri.verb, UriVerb::Xmit);

        let uri = SessionUri::parse("/portico/disconnect/9", "portico").unwrap();
        assert_eq!(uri.verb, UriVerb::Disconnect);
    }

    #[test]
    fn session_uri_rejects_malformed() {
        assert!(SessionUri::parse("/other/connect", "portico").is_none());
        assert!(SessionUri::parse("/portico/select/abc/1", "portico").is_none());
        assert!(SessionUri::parse("/portico/select/1", "portico").is_none());
        assert!(SessionUri::parse("/portico/bogus/1/2", "portico").is_none());
    }

    #[tokio::test]
    async fn connect_then_xmit_delivers_messages() {
        let app = RecordingApp::new();
        let factory = test_factory(&app, &SessionConfig::default());
        let (handler, conn, mock, session_id) = connect_session(&factory, 1);

        post(
            &handler,
            &conn,
            &format!("/portico/xmit/{}/1", session_id),
            "{\"op\":\"hello\"}",
        );
        assert_eq!(*app.received.lock(), vec![json!({"op":"hello"})]);
        let replies = mock.sent_text();
        let xmit_reply: Value = serde_json::from_str(replies.last().unwrap().trim()).unwrap();
        assert_eq!(xmit_reply["seq"], json!(2));
    }

    #[tokio::test]
    async fn xmit_with_wrong_seq_is_rejected() {
        let app = RecordingApp::new();
        let factory = test_factory(&app, &SessionConfig::default());
        let (handler, conn, mock, session_id) = connect_session(&factory, 1);

        post(
            &handler,
            &conn,
            &format!("/portico/xmit/{}/5", session_id),
            "{\"op\":\"hello\"}",
        );
        assert_eq!(app.received_count(), 0);
        let reply = mock.sent_text().last().cloned().unwrap();
        assert!(reply.contains("sequenceError"));
    }

    #[tokio::test]
    async fn select_returns_queued_messages_immediately() {
        let app = RecordingApp::new();
        let factory = test_factory(&app, &SessionConfig::default());
        let (handler, conn, mock, session_id) = connect_session(&factory, 1);

        let session = factory.core().get_session(session_id).unwrap();
        session.send(OutboundMessage::Json(json!({"n":1})));
        session.send(OutboundMessage::Json(json!({"n":2})));

        get(&handler, &conn, &format!("/portico/select/{}/1", session_id));
        let reply: Value =
            serde_json::from_str(mock.sent_text().last().unwrap().trim()).unwrap();
        assert_eq!(reply["seq"], json!(2));
        assert_eq!(reply["msgs"], json!([{"n":1},{"n":2}]));
    }

    #[tokio::test]
    async fn parked_select_is_answered_by_later_send() {
        let app = RecordingApp::new();
        let factory = test_factory(&app, &SessionConfig::default());
        let (handler, conn, mock, session_id) = connect_session(&factory, 1);

        get(&handler, &conn, &format!("/portico/select/{}/1", session_id));
        // no reply yet: the select is parked
        assert_eq!(mock.sent_text().len(), 1);

        let session = factory.core().get_session(session_id).unwrap();
        session.send(OutboundMessage::Json(json!({"later": true})));

        let reply: Value =
            serde_json::from_str(mock.sent_text().last().unwrap().trim()).unwrap();
        assert_eq!(reply["msgs"], json!([{"later": true}]));
    }

    #[tokio::test(start_paused = true)]
    async fn parked_select_times_out_with_empty_reply() {
        let app = RecordingApp::new();
        let session_cfg = SessionConfig {
            select_timeout_secs: 4,
            ..SessionConfig::default()
        };
        let factory = test_factory(&app, &session_cfg);
        let (handler, conn, mock, session_id) = connect_session(&factory, 1);

        get(&handler, &conn, &format!("/portico/select/{}/1", session_id));
        tokio::time::sleep(Duration::from_secs(8)).await;

        let reply: Value =
            serde_json::from_str(mock.sent_text().last().unwrap().trim()).unwrap();
        assert_eq!(reply["msgs"], json!([]));
        assert_eq!(reply["seq"], json!(2));
    }

    #[tokio::test]
    async fn disconnect_closes_session_and_notifies_once() {
        let app = RecordingApp::new();
        let factory = test_factory(&app, &SessionConfig::default());
        let (handler, conn, mock, session_id) = connect_session(&factory, 1);

        get(&handler, &conn, &format!("/portico/disconnect/{}", session_id));
        assert_eq!(factory.core().session_count(), 0);
        assert_eq!(app.death_count(), 1);
        let replies = mock.sent_text();
        assert!(replies.iter().any(|r| r.contains("\"end\":true")));
    }

    #[tokio::test]
    async fn select_with_unknown_session_is_an_id_error() {
        let app = RecordingApp::new();
        let factory = test_factory(&app, &SessionConfig::default());
        let mock = MockConnection::new(9);
        let conn: Arc<dyn Connection> = mock.clone();
        let handler = factory.provide_handler(Some(&conn)).unwrap();

        get(&handler, &conn, "/portico/select/424242/1");
        assert!(mock.sent_text()[0].contains("sessionIDError"));
    }

    #[tokio::test]
    async fn unsupported_method_gets_405_and_close() {
        let app = RecordingApp::new();
        let factory = test_factory(&app, &SessionConfig::default());
        let mock = MockConnection::new(9);
        let conn: Arc<dyn Connection> = mock.clone();
        let handler = factory.provide_handler(Some(&conn)).unwrap();

        let mut request = HttpRequest::new();
        request.parse_start_line("PUT /portico/connect HTTP/1.1");
        handler.receive_msg(&conn, InboundMessage::Http(request));

        assert!(!mock.is_open());
        let sent = mock.sent.lock();
        assert!(matches!(
            sent.first(),
            Some(OutboundMessage::HttpError(e)) if e.code == 405
        ));
    }

    #[test]
    fn post_body_unpacker_strips_form_junk() {
        let messages = post_body_unpacker("field={\"a\":1}");
        assert_eq!(messages, vec![json!({"a":1})]);

        let messages = post_body_unpacker("{\"a\":1} {\"b\":2}");
        assert_eq!(messages, vec![json!({"a":1}), json!({"b":2})]);

        let messages = post_body_unpacker("field=%7B%22a%22%3A1%7D");
        assert_eq!(messages, vec![json!({"a":1})]);
    }
}
