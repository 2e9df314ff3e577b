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

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::{debug, error, info};

use crate::network::framer::{InboundMessage, OutboundMessage, RtcpRequest};
use crate::network::{Connection, MessageHandler, MessageHandlerFactory};
use crate::utils::{TickClock, Timeout, Timer};
use crate::AppError;

use super::rtcp_handler::{make_ack, make_error_reply, make_message, RtcpCore};

struct QueuedMessage {
    seq_num: u64,
    /// Encoded message text, retained until the client acknowledges it.
    text: String,
}

struct SessionState {
    /// Sequence number of the last client-to-server bundle accepted here.
    client_send_seq_num: u64,
    /// Sequence number of the last server-to-client message sent from here.
    server_send_seq_num: u64,
    /// Outgoing messages not yet acknowledged by the client.
    queue: VecDeque<QueuedMessage>,
    /// Total encoded size of the unacknowledged queue, in bytes.
    backlog: usize,
    closing: bool,
    /// TCP connection currently carrying this session, if any.
    live: Option<Arc<dyn Connection>>,
    disconnected_timeout: Option<Timeout>,
    last_activity: Instant,
}

/// A logical connection that virtualizes a continuous message session out of
/// a series of potentially transient TCP connections.
pub struct RtcpSessionConnection {
    id: u64,
    /// Session ID: a swiss number authenticating the client's reattach
    /// requests.
    session_id: String,
    core: Weak<RtcpCore>,
    /// The application-level handler consuming this session's messages.
    handler: OnceLock<Arc<dyn MessageHandler>>,
    state: Mutex<SessionState>,
    died: AtomicBool,
    inactivity_clock: Mutex<Option<TickClock>>,
    inactivity_timeout: Duration,
    disconnected_timeout: Duration,
    backlog_limit: usize,
    timer: Timer,
    weak_self: Weak<RtcpSessionConnection>,
}

impl RtcpSessionConnection {
    pub(crate) fn new(
        id: u64,
        session_id: String,
        core: Weak<RtcpCore>,
        timer: Timer,
        inactivity_timeout: Duration,
        disconnected_timeout: Duration,
        backlog_limit: usize,
    ) -> Arc<RtcpSessionConnection> {
        let session = Arc::new_cyclic(|weak: &Weak<RtcpSessionConnection>| {
            RtcpSessionConnection {
                id,
                session_id,
                core,
                handler: OnceLock::new(),
                state: Mutex::new(SessionState {
                    client_send_seq_num: 0,
                    server_send_seq_num: 0,
                    queue: VecDeque::new(),
                    backlog: 0,
                    closing: false,
                    live: None,
                    disconnected_timeout: None,
                    last_activity: Instant::now(),
                }),
                died: AtomicBool::new(false),
                inactivity_clock: Mutex::new(None),
                inactivity_timeout,
                disconnected_timeout,
                backlog_limit,
                timer,
                weak_self: weak.clone(),
            }
        });
        info!("RTCP({}) new session {}", session.id, session.session_id);

        let weak = session.weak_self.clone();
        let tick_interval = inactivity_timeout / 2 + Duration::from_secs(1);
        let clock = session.timer.every(tick_interval, move || {
            if let Some(session) = weak.upgrade() {
                session.notice_inactivity_tick();
            }
        });
        *session.inactivity_clock.lock() = Some(clock);
        session
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// The sequence number of the most recent client-to-server bundle
    /// accepted by this session.
    pub fn client_send_seq_num(&self) -> u64 {
        self.state.lock().client_send_seq_num
    }

    /// Number of unacknowledged outbound messages currently queued.
    pub fn queued_message_count(&self) -> usize {
        self.state.lock().queue.len()
    }

    /// Total encoded size of the unacknowledged queue, in bytes.
    pub fn backlog(&self) -> usize {
        self.state.lock().backlog
    }

    /// Printable tag, computed from already-locked state.
    fn label_with(&self, state: &SessionState) -> String {
        let tag = match &state.live {
            Some(live) => live.label(),
            None => "*".to_string(),
        };
        format!("RTCP({},{})", self.id, tag)
    }

    /// Ask the wrapped application factory for this session's handler.
    pub(crate) fn provide_handler_from(&self, inner: &Arc<dyn MessageHandlerFactory>) {
        let as_dyn: Arc<dyn Connection> = match self.weak_self.upgrade() {
            Some(me) => me,
            None => return,
        };
        if let Some(handler) = inner.provide_handler(Some(&as_dyn)) {
            let _ = self.handler.set(handler);
        } else {
            error!("RTCP({}) application refused a handler, closing", self.id);
            self.close();
        }
    }

    /// Associate a TCP connection with this session, displacing any previous
    /// one and cancelling a pending disconnect timer.
    pub(crate) fn acquire_tcp_connection(&self, connection: Arc<dyn Connection>) {
        let previous = {
            let mut state = self.state.lock();
            if let Some(timeout) = state.disconnected_timeout.take() {
                timeout.cancel();
            }
            debug!("acquire {} for {}", connection.label(), self.label_with(&state));
            state.live.replace(connection)
        };
        if let Some(previous) = previous {
            previous.close();
        }
    }

    /// Handle loss of an underlying TCP connection: note the disconnect and
    /// give the client the disconnected-timeout interval to come back.
    pub(crate) fn lose_tcp_connection(&self, connection_id: u64) {
        let mut state = self.state.lock();
        let carried_here = state
            .live
            .as_ref()
            .map(|live| live.id() == connection_id)
            .unwrap_or(false);
        if !carried_here {
            return;
        }
        state.live = None;
        if !state.closing {
            state.last_activity = Instant::now();
        }
        info!(
            "{} lost TCP connection {}",
            self.label_with(&state),
            connection_id
        );
        let weak = self.weak_self.clone();
        state.disconnected_timeout = Some(self.timer.after(self.disconnected_timeout, move || {
            if let Some(session) = weak.upgrade() {
                session.notice_disconnected_timeout();
            }
        }));
    }

    /// Accept an 'ack' from the client: discard what it acknowledges, and if
    /// the client has been quiet a while, answer with a fresh ack of our own
    /// to keep its retransmission logic calibrated.
    pub(crate) fn client_ack(&self, client_recv_seq_num: u64) {
        let reply = {
            let mut state = self.state.lock();
            let time_inactive = state.last_activity.elapsed();
            if !state.closing {
                state.last_activity = Instant::now();
            }
            let label = self.label_with(&state);
            debug!("{} ack {}", label, client_recv_seq_num);
            Self::discard_acknowledged_messages(&mut state, client_recv_seq_num, &label);
            if time_inactive > self.inactivity_timeout / 4 {
                state
                    .live
                    .clone()
                    .map(|live| (live, make_ack(state.client_send_seq_num)))
            } else {
                None
            }
        };
        if let Some((live, ack)) = reply {
            live.send(OutboundMessage::Text(ack));
        }
    }

    /// Accept a message bundle delivered from the client.  A sequence gap
    /// gets a sequenceError reply and delivers nothing.
    pub(crate) fn receive_message(&self, mut request: RtcpRequest) {
        let delivery = {
            let mut state = self.state.lock();
            if !state.closing {
                state.last_activity = Instant::now();
            }
            let label = self.label_with(&state);
            if request.client_send_seq_num() != state.client_send_seq_num + 1 {
                error!(
                    "{} expected client seq # {}, got {}",
                    label,
                    state.client_send_seq_num + 1,
                    request.client_send_seq_num()
                );
                Err(state.live.clone())
            } else {
                Self::discard_acknowledged_messages(
                    &mut state,
                    request.client_recv_seq_num(),
                    &label,
                );
                state.client_send_seq_num += 1;
                Ok(())
            }
        };
        match delivery {
            Err(live) => {
                if let Some(live) = live {
                    live.send(OutboundMessage::Text(make_error_reply("sequenceError")));
                }
            }
            Ok(()) => {
                // deliver outside the state lock so handlers can send freely
                if let Some(handler) = self.handler.get() {
                    let as_dyn: Arc<dyn Connection> = match self.weak_self.upgrade() {
                        Some(me) => me,
                        None => return,
                    };
                    while let Some(message) = request.next_message() {
                        handler.receive_msg(&as_dyn, InboundMessage::Json(message));
                    }
                }
            }
        }
    }

    /// Resend every queued message the client has not yet acknowledged, in
    /// original order, on the (newly attached) live connection.
    pub(crate) fn replay_unacknowledged_messages(&self, client_recv_seq_num: u64) {
        let mut state = self.state.lock();
        let label = self.label_with(&state);
        Self::discard_acknowledged_messages(&mut state, client_recv_seq_num, &label);
        let live = match state.live.clone() {
            Some(live) => live,
            None => return,
        };
        let client_seq = state.client_send_seq_num;
        for elem in &state.queue {
            debug!("{} resend {}", label, elem.seq_num);
            live.send(OutboundMessage::Text(make_message(
                elem.seq_num,
                client_seq,
                &elem.text,
            )));
        }
    }

    /// Drop retained copies of messages the client has acknowledged.
    fn discard_acknowledged_messages(state: &mut SessionState, seq_num: u64, label: &str) {
        while let Some(peek) = state.queue.front() {
            if peek.seq_num > seq_num {
                break;
            }
            state.backlog -= peek.text.len();
            state.queue.pop_front();
        }
        debug!("{} queue backlog decreased to {}", label, state.backlog);
    }

    fn notice_inactivity_tick(&self) {
        let action = {
            let state = self.state.lock();
            if state.closing {
                return;
            }
            let time_inactive = state.last_activity.elapsed();
            if time_inactive > self.inactivity_timeout {
                Some(None)
            } else if time_inactive > self.inactivity_timeout / 2 {
                debug!("{} tick: RTCP session acking", self.label_with(&state));
                Some(
                    state
                        .live
                        .clone()
                        .map(|live| (live, make_ack(state.client_send_seq_num))),
                )
            } else {
                debug!("{} tick: RTCP session waiting", self.label_with(&state));
                None
            }
        };
        match action {
            Some(None) => {
                info!("RTCP({}) tick: RTCP session timeout", self.id);
                self.close();
            }
            Some(Some((live, ack))) => {
                live.send(OutboundMessage::Text(ack));
            }
            None => {}
        }
    }

    /// Disconnect timer fired.  A session that reattached between the fire
    /// and now is left alone.
    fn notice_disconnected_timeout(&self) {
        let abandoned = {
            let state = self.state.lock();
            !state.closing && state.live.is_none()
        };
        if abandoned {
            info!("RTCP({}): disconnected session timeout", self.id);
            self.close();
        }
    }
}

impl Connection for RtcpSessionConnection {
    fn id(&self) -> u64 {
        self.id
    }

    /// Send an application message: assign the next sequence number, queue
    /// it for retransmission until acknowledged, and transmit it now if a
    /// TCP connection is attached.  Exceeding the backlog ceiling is fatal
    /// to the whole session.
    fn send(&self, message: OutboundMessage) {
        let text = match &message {
            OutboundMessage::Json(value) => value.to_string(),
            other => {
                error!("RTCP({}) invalid message type: {:?}", self.id, other);
                return;
            }
        };
        let outcome = {
            let mut state = self.state.lock();
            if state.closing {
                return;
            }
            state.server_send_seq_num += 1;
            let seq = state.server_send_seq_num;
            state.backlog += text.len();
            debug!(
                "{} queue backlog increased to {}",
                self.label_with(&state),
                state.backlog
            );
            state.queue.push_back(QueuedMessage {
                seq_num: seq,
                text: text.clone(),
            });
            if state.backlog > self.backlog_limit {
                Err(())
            } else {
                Ok(state
                    .live
                    .clone()
                    .map(|live| (live, make_message(seq, state.client_send_seq_num, &text))))
            }
        };
        match outcome {
            Err(()) => {
                info!("RTCP({}) queue backlog limit exceeded", self.id);
                self.close();
            }
            Ok(Some((live, wire))) => {
                live.send(OutboundMessage::Text(wire));
            }
            Ok(None) => {
                // disconnected: held in queue for replay upon reattachment
            }
        }
    }

    /// Shut down the whole logical session: unregister, stop the inactivity
    /// clock, drop the live TCP connection, and tell the application, once.
    fn close(&self) {
        let live = {
            let mut state = self.state.lock();
            if state.closing {
                return;
            }
            state.closing = true;
            if let Some(timeout) = state.disconnected_timeout.take() {
                timeout.cancel();
            }
            state.live.take()
        };
        if let Some(core) = self.core.upgrade() {
            core.remove_session(&self.session_id);
        }
        if let Some(clock) = self.inactivity_clock.lock().take() {
            clock.stop();
        }
        if let Some(live) = live {
            live.close();
        }
        if !self.died.swap(true, Ordering::AcqRel) {
            if let (Some(handler), Some(me)) = (self.handler.get(), self.weak_self.upgrade()) {
                let as_dyn: Arc<dyn Connection> = me;
                handler.connection_died(
                    &as_dyn,
                    &AppError::SessionClosed("normal RTCP session close".to_string()),
                );
            }
        }
    }

    fn is_open(&self) -> bool {
        !self.state.lock().closing
    }

    fn label(&self) -> String {
        let state = self.state.lock();
        self.label_with(&state)
    }
}
