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

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use rand::rngs::OsRng;
use rand::RngCore;
use tracing::{debug, error, info, warn};

use crate::network::framer::{InboundMessage, OutboundMessage, RtcpRequest, RtcpVerb};
use crate::network::{Connection, MessageHandler, MessageHandlerFactory};
use crate::service::SessionConfig;
use crate::utils::{Timeout, Timer};
use crate::AppError;

use super::registry::SessionRegistry;
use super::rtcp::RtcpSessionConnection;

/// Request line for an 'ack' reply, acknowledging client messages received.
pub(crate) fn make_ack(client_seq_num: u64) -> String {
    format!("ack {}\n", client_seq_num)
}

/// Request line for an 'error' reply.
pub(crate) fn make_error_reply(error_tag: &str) -> String {
    format!("error {}\n", error_tag)
}

/// A message delivery: sequence numbers on the request line, then the
/// pre-encoded message and the blank-line terminator.
pub(crate) fn make_message(server_seq_num: u64, client_seq_num: u64, message: &str) -> String {
    format!("{} {}\n{}\n\n", server_seq_num, client_seq_num, message)
}

fn make_resume_reply(session_id: &str, client_seq_num: u64) -> String {
    format!("resume {} {}\n", session_id, client_seq_num)
}

fn make_start_reply(session_id: &str) -> String {
    format!("start {}\n", session_id)
}

/// Shared state behind every RTCP port handler: the session tables, the
/// wrapped application factory, and the session timing knobs.
pub struct RtcpCore {
    inner: Arc<dyn MessageHandlerFactory>,
    sessions: SessionRegistry<RtcpSessionConnection>,
    inactivity_timeout: Duration,
    disconnected_timeout: Duration,
    startup_grace: Duration,
    backlog_limit: usize,
    timer: Timer,
    connection_id_gen: Arc<AtomicU64>,
    weak_self: Weak<RtcpCore>,
}

impl RtcpCore {
    fn create_session(&self) -> Arc<RtcpSessionConnection> {
        // an unguessable swiss number; knowing it is what authenticates
        // reattachment
        let session_id = format!("{}", OsRng.next_u64());
        let id = self.connection_id_gen.fetch_add(1, Ordering::Relaxed);
        let session = RtcpSessionConnection::new(
            id,
            session_id,
            self.weak_self.clone(),
            self.timer.clone(),
            self.inactivity_timeout,
            self.disconnected_timeout,
            self.backlog_limit,
        );
        self.sessions.add(session.session_id(), session.clone());
        session.provide_handler_from(&self.inner);
        session
    }

    pub(crate) fn remove_session(&self, session_id: &str) {
        self.sessions.remove(session_id);
    }

    fn acquire_tcp_connection(
        &self,
        session: &Arc<RtcpSessionConnection>,
        connection: &Arc<dyn Connection>,
    ) {
        self.sessions.bind_connection(connection.id(), session.clone());
        session.acquire_tcp_connection(connection.clone());
    }

    /// Handle an RTCP 'start' request, creating a new session.
    fn do_start(&self, connection: &Arc<dyn Connection>) {
        let reply = if self.sessions.by_connection(connection.id()).is_some() {
            make_error_reply("sessionInProgress")
        } else {
            let session = self.create_session();
            self.acquire_tcp_connection(&session, connection);
            info!("{} start {}", session.label(), session.session_id());
            make_start_reply(session.session_id())
        };
        send_with_log(connection, reply);
    }

    /// Handle an RTCP 'resume' request.  A session ID the registry does not
    /// know starts a brand-new session instead of erring, so a client can
    /// recover from total server state loss without a separate error path.
    fn do_resume(
        &self,
        connection: &Arc<dyn Connection>,
        session_id: &str,
        client_recv_seq_num: u64,
    ) {
        if self.sessions.by_connection(connection.id()).is_some() {
            send_with_log(connection, make_error_reply("sessionInProgress"));
            return;
        }
        match self.sessions.get(session_id) {
            Some(session) => {
                self.acquire_tcp_connection(&session, connection);
                info!("{} resume {}", session.label(), session.session_id());
                send_with_log(
                    connection,
                    make_resume_reply(session.session_id(), session.client_send_seq_num()),
                );
                session.replay_unacknowledged_messages(client_recv_seq_num);
            }
            None => {
                let session = self.create_session();
                self.acquire_tcp_connection(&session, connection);
                info!(
                    "{} resume of unknown session {}, starting fresh",
                    session.label(),
                    session_id
                );
                send_with_log(connection, make_start_reply(session.session_id()));
            }
        }
    }

    /// Handle an RTCP 'ack' request, keeping the session alive and updating
    /// our picture of which messages the client has received.
    fn do_ack(&self, connection: &Arc<dyn Connection>, client_recv_seq_num: u64) {
        match self.sessions.by_connection(connection.id()) {
            Some(session) => session.client_ack(client_recv_seq_num),
            None => send_with_log(connection, make_error_reply("noSession")),
        }
    }

    /// Handle a message delivery, passing the bundle to the session.
    fn do_message(&self, connection: &Arc<dyn Connection>, request: RtcpRequest) {
        match self.sessions.by_connection(connection.id()) {
            Some(session) => session.receive_message(request),
            None => send_with_log(connection, make_error_reply("noSession")),
        }
    }

    /// Handle an RTCP 'end' request: explicit session termination.
    fn do_end(&self, connection: &Arc<dyn Connection>) {
        match self.sessions.by_connection(connection.id()) {
            Some(session) => session.close(),
            None => error!(
                "got RTCP end request on connection with no associated session {}",
                connection.label()
            ),
        }
    }

    /// Handle an RTCP 'error' request, which just announces a client error.
    fn do_error(&self, connection: &Arc<dyn Connection>, error_tag: &str) {
        info!("{} received error request {}", connection.label(), error_tag);
    }

    pub(crate) fn tcp_connection_died(&self, connection: &Arc<dyn Connection>) {
        if let Some(session) = self.sessions.unbind_connection(connection.id()) {
            session.lose_tcp_connection(connection.id());
        }
    }

    #[cfg(test)]
    pub(crate) fn session_count(&self) -> usize {
        self.sessions.session_count()
    }
}

fn send_with_log(connection: &Arc<dyn Connection>, msg: String) {
    debug!("{} <| {}", connection.label(), msg.trim());
    connection.send(OutboundMessage::Text(msg));
}

/// Message handler factory for RTCP ports: wraps the application-level
/// factory so that each TCP connection gets a handler that speaks the
/// session protocol, and each session re-delivers the application messages
/// carried inside it.
pub struct RtcpHandlerFactory {
    core: Arc<RtcpCore>,
}

impl RtcpHandlerFactory {
    pub fn new(
        inner: Arc<dyn MessageHandlerFactory>,
        session_cfg: &SessionConfig,
        timer: Timer,
        connection_id_gen: Arc<AtomicU64>,
    ) -> RtcpHandlerFactory {
        RtcpHandlerFactory {
            core: Arc::new_cyclic(|weak| RtcpCore {
                inner,
                sessions: SessionRegistry::new(),
                inactivity_timeout: Duration::from_secs(session_cfg.inactivity_timeout_secs),
                disconnected_timeout: Duration::from_secs(session_cfg.disconnected_timeout_secs),
                startup_grace: Duration::from_secs(session_cfg.startup_grace_secs),
                backlog_limit: session_cfg.backlog_limit_bytes,
                timer,
                connection_id_gen,
                weak_self: weak.clone(),
            }),
        }
    }

    #[cfg(test)]
    pub(crate) fn core(&self) -> &Arc<RtcpCore> {
        &self.core
    }
}

impl MessageHandlerFactory for RtcpHandlerFactory {
    fn provide_handler(
        &self,
        connection: Option<&Arc<dyn Connection>>,
    ) -> Option<Arc<dyn MessageHandler>> {
        connection.map(|connection| {
            let handler: Arc<dyn MessageHandler> =
                Arc::new(RtcpMessageHandler::new(connection.clone(), self.core.clone()));
            handler
        })
    }
}

/// Per-TCP-connection handler for an RTCP port: dispatches request verbs to
/// the core and kicks off connections that sit silent through the startup
/// grace period.
pub struct RtcpMessageHandler {
    core: Arc<RtcpCore>,
    startup_timeout: Mutex<Option<Timeout>>,
    startup_timeout_tripped: Arc<AtomicBool>,
}

impl RtcpMessageHandler {
    fn new(connection: Arc<dyn Connection>, core: Arc<RtcpCore>) -> RtcpMessageHandler {
        let tripped = Arc::new(AtomicBool::new(false));
        let tripped_for_timer = tripped.clone();
        let timeout = core.timer.after(core.startup_grace, move || {
            if !tripped_for_timer.swap(true, Ordering::AcqRel) {
                info!("{} startup timeout, closing idle connection", connection.label());
                connection.close();
            }
        });
        RtcpMessageHandler {
            core,
            startup_timeout: Mutex::new(Some(timeout)),
            startup_timeout_tripped: tripped,
        }
    }
}

impl MessageHandler for RtcpMessageHandler {
    fn receive_msg(&self, connection: &Arc<dyn Connection>, message: InboundMessage) {
        if self.startup_timeout_tripped.load(Ordering::Acquire) {
            // they were kicked off for inactivity, so ignore the message
            return;
        }
        if let Some(timeout) = self.startup_timeout.lock().take() {
            timeout.cancel();
        }

        match message {
            InboundMessage::Rtcp(request) => {
                debug!("{} {:?}", connection.label(), request.verb());
                match request.verb() {
                    RtcpVerb::Start => self.core.do_start(connection),
                    RtcpVerb::Resume => {
                        let session_id = request.session_id().unwrap_or_default().to_string();
                        self.core
                            .do_resume(connection, &session_id, request.client_recv_seq_num());
                    }
                    RtcpVerb::Ack => self.core.do_ack(connection, request.client_recv_seq_num()),
                    RtcpVerb::Message => self.core.do_message(connection, request),
                    RtcpVerb::End => self.core.do_end(connection),
                    RtcpVerb::Error => self
                        .core
                        .do_error(connection, request.error().unwrap_or("unknown")),
                }
            }
            other => warn!(
                "{} unexpected message on RTCP port: {:?}",
                connection.label(),
                other
            ),
        }
    }

    fn connection_died(&self, connection: &Arc<dyn Connection>, _reason: &AppError) {
        // gratuitous TCP drops are normal in the RTCP world; the session
        // just waits for a reattach
        self.core.tcp_connection_died(connection);
    }
}
