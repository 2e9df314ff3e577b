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

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, error, warn};

use crate::network::framer::InboundMessage;
use crate::network::{Connection, MessageHandler, MessageHandlerFactory};
use crate::service::DispatcherConfig;
use crate::AppError;

/// Handler for one message verb: gets the originating connection (to reply
/// on) and the parsed message.
pub type VerbHandler = Box<dyn Fn(&Arc<dyn Connection>, &Value) + Send + Sync>;

/// Handler invoked when a connection or session dies.
pub type DeathHandler = Box<dyn Fn(&Arc<dyn Connection>, &AppError) + Send + Sync>;

struct DeliveredMessage {
    connection: Arc<dyn Connection>,
    message: Value,
}

/// Routes delivered application messages to handlers registered by verb tag.
/// The registry is populated at startup and immutable afterwards; delivery
/// runs on a small worker pool so slow application logic never stalls
/// connection I/O.
pub struct MessageDispatcher {
    handlers: HashMap<String, VerbHandler>,
    death_handler: Option<DeathHandler>,
    tag_field: String,
}

impl MessageDispatcher {
    pub fn builder() -> MessageDispatcherBuilder {
        MessageDispatcherBuilder {
            handlers: HashMap::new(),
            death_handler: None,
            tag_field: "op".to_string(),
        }
    }

    fn dispatch(&self, connection: &Arc<dyn Connection>, message: &Value) {
        let tag = message
            .get(&self.tag_field)
            .and_then(|v| v.as_str())
            .unwrap_or("");
        match self.handlers.get(tag) {
            Some(handler) => handler(connection, message),
            None => warn!(
                "{} no handler registered for verb {:?}",
                connection.label(),
                tag
            ),
        }
    }
}

pub struct MessageDispatcherBuilder {
    handlers: HashMap<String, VerbHandler>,
    death_handler: Option<DeathHandler>,
    tag_field: String,
}

impl MessageDispatcherBuilder {
    /// Register a handler for one message verb.  Re-registering a verb
    /// replaces the earlier handler.
    pub fn register(
        mut self,
        verb: &str,
        handler: impl Fn(&Arc<dyn Connection>, &Value) + Send + Sync + 'static,
    ) -> Self {
        self.handlers.insert(verb.to_string(), Box::new(handler));
        self
    }

    /// Register the handler notified when a connection or session dies.
    pub fn on_connection_died(
        mut self,
        handler: impl Fn(&Arc<dyn Connection>, &AppError) + Send + Sync + 'static,
    ) -> Self {
        self.death_handler = Some(Box::new(handler));
        self
    }

    /// Message field carrying the verb tag.  Default "op".
    pub fn tag_field(mut self, field: &str) -> Self {
        self.tag_field = field.to_string();
        self
    }

    pub fn build(self) -> Arc<MessageDispatcher> {
        Arc::new(MessageDispatcher {
            handlers: self.handlers,
            death_handler: self.death_handler,
            tag_field: self.tag_field,
        })
    }
}

/// The application-level handler factory: messages delivered by any
/// connection or session are queued to the dispatcher's worker pool.
pub struct DispatchHandlerFactory {
    dispatcher: Arc<MessageDispatcher>,
    delivery_tx: async_channel::Sender<DeliveredMessage>,
}

impl DispatchHandlerFactory {
    pub fn new(dispatcher: Arc<MessageDispatcher>, cfg: &DispatcherConfig) -> Arc<Self> {
        let (delivery_tx, delivery_rx) =
            async_channel::bounded::<DeliveredMessage>(cfg.channel_capacity);
        let num_workers = cfg.effective_workers();
        for i in 0..num_workers {
            let rx = delivery_rx.clone();
            let dispatcher = dispatcher.clone();
            tokio::spawn(async move {
                debug!("message dispatch worker {} started", i);
                while let Ok(delivered) = rx.recv().await {
                    dispatcher.dispatch(&delivered.connection, &delivered.message);
                }
                debug!("message dispatch worker {} exited", i);
            });
        }
        Arc::new(DispatchHandlerFactory {
            dispatcher,
            delivery_tx,
        })
    }
}

impl MessageHandlerFactory for DispatchHandlerFactory {
    fn provide_handler(
        &self,
        connection: Option<&Arc<dyn Connection>>,
    ) -> Option<Arc<dyn MessageHandler>> {
        connection?;
        Some(Arc::new(DispatchHandler {
            dispatcher: self.dispatcher.clone(),
            delivery_tx: self.delivery_tx.clone(),
        }))
    }
}

struct DispatchHandler {
    dispatcher: Arc<MessageDispatcher>,
    delivery_tx: async_channel::Sender<DeliveredMessage>,
}

impl MessageHandler for DispatchHandler {
    fn receive_msg(&self, connection: &Arc<dyn Connection>, message: InboundMessage) {
        match message {
            InboundMessage::Json(value) => {
                let delivered = DeliveredMessage {
                    connection: connection.clone(),
                    message: value,
                };
                if self.delivery_tx.try_send(delivered).is_err() {
                    // the application is not draining its queue
                    error!("{} dispatch queue full, dropping message", connection.label());
                }
            }
            InboundMessage::Problem(problem) => {
                warn!("{} message parse problem: {}", connection.label(), problem);
            }
            other => {
                warn!(
                    "{} protocol message reached application layer: {:?}",
                    connection.label(),
                    other
                );
            }
        }
    }

    fn connection_died(&self, connection: &Arc<dyn Connection>, reason: &AppError) {
        debug!("{} died: {}", connection.label(), reason);
        if let Some(death_handler) = &self.dispatcher.death_handler {
            death_handler(connection, reason);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use serde_json::json;

    use crate::session::testing::MockConnection;

    use super::*;

    #[tokio::test]
    async fn registered_verb_handler_runs_on_worker() {
        let hits = Arc::new(AtomicUsize::new(0));
        let hits_clone = hits.clone();
        let dispatcher = MessageDispatcher::builder()
            .register("ping", move |conn, _msg| {
                hits_clone.fetch_add(1, Ordering::SeqCst);
                conn.send(crate::network::framer::OutboundMessage::Json(
                    json!({"op":"pong"}),
                ));
            })
            .build();
        let factory = DispatchHandlerFactory::new(dispatcher.clone(), &DispatcherConfig::default());

        let mock = MockConnection::new(1);
        let conn: Arc<dyn Connection> = mock.clone();
        let handler = factory.provide_handler(Some(&conn)).unwrap();
        handler.receive_msg(&conn, InboundMessage::Json(json!({"op":"ping"})));

        // delivery is asynchronous through the worker pool
        for _ in 0..100 {
            if hits.load(Ordering::SeqCst) > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(mock.sent.lock().len(), 1);
    }

    #[tokio::test]
    async fn unknown_verb_is_dropped_quietly() {
        let dispatcher = MessageDispatcher::builder().build();
        let factory = DispatchHandlerFactory::new(dispatcher.clone(), &DispatcherConfig::default());
        let mock = MockConnection::new(1);
        let conn: Arc<dyn Connection> = mock.clone();
        let handler = factory.provide_handler(Some(&conn)).unwrap();
        handler.receive_msg(&conn, InboundMessage::Json(json!({"op":"nope"})));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(mock.sent.lock().is_empty());
    }
}
