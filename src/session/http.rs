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
use serde_json::Value;
use tokio::time::Instant;
use tracing::{debug, error, info};

use crate::network::framer::{InboundMessage, OutboundMessage};
use crate::network::{Connection, MessageHandler, MessageHandlerFactory};
use crate::utils::{TickClock, Timer};
use crate::AppError;

use super::http_handler::{make_select_reply, make_sequence_error_reply, make_xmit_reply, HttpCore};

struct HttpState {
    /// Sequence number the next /select/ request must present; bumped every
    /// time a reply batch (including an empty timeout batch) goes out.
    select_seq_num: i64,
    /// Sequence number the next /xmit/ request must present.
    xmit_seq_num: i64,
    /// Outgoing messages awaiting retrieval by the client.
    queue: VecDeque<Value>,
    closing: bool,
    /// TCP connection with a select pending on it, if any.
    downstream: Option<Arc<dyn Connection>>,
    downstream_non_persistent: bool,
    /// When the pending select started waiting, if one is pending.
    select_wait_start: Option<Instant>,
    last_activity: Instant,
    /// Every TCP connection currently associated with this session, for
    /// cleanup at close.
    connections: Vec<Arc<dyn Connection>>,
}

/// A logical connection that virtualizes a continuous message session out of
/// a series of transient HTTP requests: /xmit/ POSTs carry client messages
/// in, pending /select/ GETs carry server messages out.
pub struct HttpSessionConnection {
    id: u64,
    session_id: u64,
    core: Weak<HttpCore>,
    handler: OnceLock<Arc<dyn MessageHandler>>,
    state: Mutex<HttpState>,
    died: AtomicBool,
    select_clock: Mutex<Option<TickClock>>,
    inactivity_clock: Mutex<Option<TickClock>>,
    select_timeout: Duration,
    session_timeout: Duration,
    weak_self: Weak<HttpSessionConnection>,
}

impl HttpSessionConnection {
    pub(crate) fn new(
        id: u64,
        session_id: u64,
        core: Weak<HttpCore>,
        timer: Timer,
        select_timeout: Duration,
        session_timeout: Duration,
    ) -> Arc<HttpSessionConnection> {
        let session = Arc::new_cyclic(|weak: &Weak<HttpSessionConnection>| HttpSessionConnection {
            id,
            session_id,
            core,
            handler: OnceLock::new(),
            state: Mutex::new(HttpState {
                select_seq_num: 1,
                xmit_seq_num: 1,
                queue: VecDeque::new(),
                closing: false,
                downstream: None,
                downstream_non_persistent: false,
                select_wait_start: None,
                last_activity: Instant::now(),
                connections: Vec::new(),
            }),
            died: AtomicBool::new(false),
            select_clock: Mutex::new(None),
            inactivity_clock: Mutex::new(None),
            select_timeout,
            session_timeout,
            weak_self: weak.clone(),
        });
        info!("{} new session", session.label());

        let weak = session.weak_self.clone();
        let select_tick = (select_timeout + Duration::from_secs(1)) / 4;
        *session.select_clock.lock() = Some(timer.every(select_tick, move || {
            if let Some(session) = weak.upgrade() {
                session.notice_select_tick();
            }
        }));
        let weak = session.weak_self.clone();
        let inactivity_tick = session_timeout + Duration::from_secs(1);
        *session.inactivity_clock.lock() = Some(timer.every(inactivity_tick, move || {
            if let Some(session) = weak.upgrade() {
                session.notice_inactivity_tick();
            }
        }));
        session
    }

    pub fn session_id(&self) -> u64 {
        self.session_id
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
            error!("{} application refused a handler, closing", self.label());
            self.close();
        }
    }

    /// Take note of another TCP connection carrying requests for this
    /// session.
    pub(crate) fn associate_tcp_connection(&self, connection: Arc<dyn Connection>) {
        let mut state = self.state.lock();
        if !state.connections.iter().any(|c| c.id() == connection.id()) {
            state.connections.push(connection);
        }
        debug!(
            "associate connection with HTTP({}), count={}",
            self.session_id,
            state.connections.len()
        );
    }

    /// Handle loss of an underlying TCP connection.  Routine in the HTTP
    /// world; only mildly interesting if a select was pending on it.
    pub(crate) fn dissociate_tcp_connection(&self, connection_id: u64) {
        let mut state = self.state.lock();
        state.connections.retain(|c| c.id() != connection_id);
        let had_pending_select = state
            .downstream
            .as_ref()
            .map(|d| d.id() == connection_id)
            .unwrap_or(false);
        if had_pending_select {
            Self::clear_downstream(&mut state);
            if !state.closing {
                state.last_activity = Instant::now();
            }
            info!("HTTP({}) lost connection with pending select", self.session_id);
        }
    }

    fn clear_downstream(state: &mut HttpState) {
        state.downstream = None;
        state.downstream_non_persistent = false;
        state.select_wait_start = None;
    }

    pub(crate) fn note_client_activity(&self) {
        let mut state = self.state.lock();
        if !state.closing {
            state.last_activity = Instant::now();
        }
    }

    /// Handle a /select/ request polling for outbound traffic.  Queued
    /// messages are sent at once; otherwise the request parks until a
    /// message or the select timeout arrives.  Returns true if a reply was
    /// sent.
    pub(crate) fn select_messages(
        &self,
        downstream: &Arc<dyn Connection>,
        sequence_number: i64,
        non_persistent: bool,
    ) -> bool {
        enum SelectOutcome {
            Reply(String),
            CloseDownstream,
            Parked,
        }
        let outcome = {
            let mut state = self.state.lock();
            if !state.closing {
                state.last_activity = Instant::now();
            }
            if sequence_number != state.select_seq_num {
                error!(
                    "HTTP({}) expected select seq # {}, got {}",
                    self.session_id, state.select_seq_num, sequence_number
                );
                SelectOutcome::Reply(make_sequence_error_reply("sequenceError"))
            } else if !state.queue.is_empty() {
                let msgs: Vec<Value> = state.queue.drain(..).collect();
                state.select_seq_num += 1;
                SelectOutcome::Reply(make_select_reply(state.select_seq_num, &msgs))
            } else if state.closing {
                SelectOutcome::CloseDownstream
            } else {
                state.downstream = Some(downstream.clone());
                state.downstream_non_persistent = non_persistent;
                state.select_wait_start = Some(Instant::now());
                SelectOutcome::Parked
            }
        };
        match outcome {
            SelectOutcome::Reply(reply) => {
                downstream.send(OutboundMessage::Text(reply));
                true
            }
            SelectOutcome::CloseDownstream => {
                downstream.close();
                false
            }
            SelectOutcome::Parked => false,
        }
    }

    /// Handle an /xmit/ request delivering a bundle of messages.  The reply
    /// acknowledges the next expected sequence number, or reports the
    /// sequence error.
    pub(crate) fn receive_message(
        &self,
        connection: &Arc<dyn Connection>,
        sequence_number: i64,
        messages: Vec<Value>,
    ) {
        if self.state.lock().closing {
            connection.close();
            return;
        }
        let accepted = {
            let mut state = self.state.lock();
            state.last_activity = Instant::now();
            if sequence_number != state.xmit_seq_num {
                error!(
                    "HTTP({}) expected xmit seq # {}, got {}",
                    self.session_id, state.xmit_seq_num, sequence_number
                );
                None
            } else {
                state.xmit_seq_num += 1;
                Some(state.xmit_seq_num)
            }
        };
        match accepted {
            None => {
                connection.send(OutboundMessage::Text(make_sequence_error_reply(
                    "sequenceError",
                )));
            }
            Some(next_seq) => {
                connection.send(OutboundMessage::Text(make_xmit_reply(next_seq)));
                if let (Some(handler), Some(me)) = (self.handler.get(), self.weak_self.upgrade()) {
                    let as_dyn: Arc<dyn Connection> = me;
                    for message in messages {
                        handler.receive_msg(&as_dyn, InboundMessage::Json(message));
                    }
                }
            }
        }
    }

    /// Select timeout check: a pending select that has waited too long gets
    /// an empty reply so the client's poll loop keeps turning.
    fn notice_select_tick(&self) {
        let reply = {
            let mut state = self.state.lock();
            match state.select_wait_start {
                Some(started) if started.elapsed() > self.select_timeout => {
                    state.select_seq_num += 1;
                    let reply = make_select_reply(state.select_seq_num, &[]);
                    let downstream = state.downstream.clone();
                    let non_persistent = state.downstream_non_persistent;
                    Self::clear_downstream(&mut state);
                    if !state.closing {
                        state.last_activity = Instant::now();
                    }
                    downstream.map(|d| (d, reply, non_persistent))
                }
                _ => None,
            }
        };
        if let Some((downstream, reply, non_persistent)) = reply {
            downstream.send(OutboundMessage::Text(reply));
            if non_persistent {
                downstream.close();
            }
        }
    }

    /// Inactivity check: a session with no pending select and no client
    /// traffic for too long is presumed dead.
    fn notice_inactivity_tick(&self) {
        let expired = {
            let state = self.state.lock();
            !state.closing
                && state.select_wait_start.is_none()
                && state.last_activity.elapsed() > self.session_timeout
        };
        if expired {
            info!("HTTP({}) tick: HTTP session timeout", self.session_id);
            self.close();
        } else {
            debug!("HTTP({}) tick: HTTP session waiting", self.session_id);
        }
    }
}

impl Connection for HttpSessionConnection {
    fn id(&self) -> u64 {
        self.id
    }

    /// Send a message to the client: through the pending select if one is
    /// parked, onto the queue otherwise.
    fn send(&self, message: OutboundMessage) {
        let value = match message {
            OutboundMessage::Json(value) => value,
            other => {
                error!("HTTP({}) invalid message type: {:?}", self.session_id, other);
                return;
            }
        };
        let immediate = {
            let mut state = self.state.lock();
            if state.closing {
                return;
            }
            match state.downstream.clone() {
                Some(downstream) => {
                    state.select_seq_num += 1;
                    let reply = make_select_reply(state.select_seq_num, &[value]);
                    let non_persistent = state.downstream_non_persistent;
                    Self::clear_downstream(&mut state);
                    state.last_activity = Instant::now();
                    Some((downstream, reply, non_persistent))
                }
                None => {
                    state.queue.push_back(value);
                    None
                }
            }
        };
        if let Some((downstream, reply, non_persistent)) = immediate {
            downstream.send(OutboundMessage::Text(reply));
            if non_persistent {
                downstream.close();
            }
        }
    }

    /// Shut the session down: close every associated TCP connection, answer
    /// a pending select with the end-of-session reply, and tell the
    /// application, once.
    fn close(&self) {
        let (to_close, downstream) = {
            let mut state = self.state.lock();
            if state.closing {
                return;
            }
            state.closing = true;
            let downstream = state.downstream.clone();
            Self::clear_downstream(&mut state);
            let downstream_id = downstream.as_ref().map(|d| d.id());
            let to_close: Vec<Arc<dyn Connection>> = state
                .connections
                .drain(..)
                .filter(|c| Some(c.id()) != downstream_id)
                .collect();
            (to_close, downstream)
        };
        for connection in to_close {
            connection.close();
        }
        if let Some(core) = self.core.upgrade() {
            core.remove_session(self.session_id);
        }
        if let Some(clock) = self.select_clock.lock().take() {
            clock.stop();
        }
        if let Some(clock) = self.inactivity_clock.lock().take() {
            clock.stop();
        }
        if let Some(downstream) = downstream {
            // end-of-session marker so the parked poll returns cleanly
            downstream.send(OutboundMessage::Text(make_select_reply(-1, &[])));
            downstream.close();
        }
        if !self.died.swap(true, Ordering::AcqRel) {
            if let (Some(handler), Some(me)) = (self.handler.get(), self.weak_self.upgrade()) {
                let as_dyn: Arc<dyn Connection> = me;
                handler.connection_died(
                    &as_dyn,
                    &AppError::SessionClosed("normal HTTP session close".to_string()),
                );
            }
        }
    }

    fn is_open(&self) -> bool {
        !self.state.lock().closing
    }

    fn label(&self) -> String {
        format!("HTTP({},{})", self.id, self.session_id)
    }
}
