use std::net::SocketAddr;
use std::sync::atomic::AtomicU64;
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, Semaphore};
use tracing::{error, info};

use crate::network::framer::{decoder_for, encoder_for, FramerConfig};
use crate::network::{MessageHandlerFactory, TcpConnection};
use crate::request::{DispatchHandlerFactory, MessageDispatcher};
use crate::service::{ListenerConfig, PortServer, Protocol, ServerConfig};
use crate::session::{HttpHandlerFactory, RtcpHandlerFactory, WebsocketHandlerFactory};
use crate::utils::Timer;
use crate::AppError::IllegalStateError;
use crate::AppResult;

/// Top-level facade wiring listeners, connections, framers and sessions
/// together.  Owns the runtime-wide context the rest of the system needs:
/// configuration, the timer service, connection ID generation, and the
/// shutdown broadcast.  A process may run several independent runtimes.
pub struct ServerRuntime {
    config: Arc<ServerConfig>,
    timer: Timer,
    connection_id_gen: Arc<AtomicU64>,
    notify_shutdown: broadcast::Sender<()>,
}

impl ServerRuntime {
    pub fn new(config: Arc<ServerConfig>) -> ServerRuntime {
        let (notify_shutdown, _) = broadcast::channel(1);
        ServerRuntime {
            config,
            timer: Timer::new(),
            connection_id_gen: Arc::new(AtomicU64::new(1)),
            notify_shutdown,
        }
    }

    pub fn config(&self) -> &Arc<ServerConfig> {
        &self.config
    }

    pub fn timer(&self) -> &Timer {
        &self.timer
    }

    /// Build the application-level factory for a dispatcher-driven server.
    pub fn dispatch_factory(&self, dispatcher: Arc<MessageDispatcher>) -> Arc<dyn MessageHandlerFactory> {
        DispatchHandlerFactory::new(dispatcher, &self.config.dispatcher)
    }

    /// Wrap the application factory in the session/handshake layer the
    /// port's protocol calls for.
    fn wrap_factory(
        &self,
        listener_cfg: &ListenerConfig,
        app_factory: Arc<dyn MessageHandlerFactory>,
    ) -> Arc<dyn MessageHandlerFactory> {
        match listener_cfg.protocol {
            Protocol::Json => app_factory,
            Protocol::Http => Arc::new(HttpHandlerFactory::new(
                app_factory,
                &self.config.session,
                &listener_cfg.root_uri,
                self.timer.clone(),
                self.connection_id_gen.clone(),
            )),
            Protocol::Websocket => {
                Arc::new(WebsocketHandlerFactory::new(app_factory, &listener_cfg.root_uri))
            }
            Protocol::Rtcp => Arc::new(RtcpHandlerFactory::new(
                app_factory,
                &self.config.session,
                self.timer.clone(),
                self.connection_id_gen.clone(),
            )),
        }
    }

    /// Begin listening for inbound connections on one configured port.
    /// Returns the bound address (useful when the config asked for port 0).
    pub async fn listen(
        &self,
        listener_cfg: &ListenerConfig,
        app_factory: Arc<dyn MessageHandlerFactory>,
    ) -> AppResult<SocketAddr> {
        if listener_cfg.secure {
            // TLS wrapping is an external collaborator; without key material
            // a secure listener cannot start (the rest of the server still can)
            return Err(IllegalStateError(format!(
                "listener {} requests TLS but no key material is configured",
                listener_cfg.label
            )));
        }
        let bind_result = TcpListener::bind(&listener_cfg.addr).await;
        let listener = match bind_result {
            Ok(listener) => listener,
            Err(err) => {
                let error_msg = format!(
                    "Failed to bind listener {} to address: {} - Error: {}",
                    listener_cfg.label, listener_cfg.addr, err
                );
                error!(error_msg);
                return Err(IllegalStateError(error_msg));
            }
        };
        let bound_addr = listener.local_addr()?;
        info!(
            "listener {} bound to {} for listening",
            listener_cfg.label, bound_addr
        );

        let handler_factory = self.wrap_factory(listener_cfg, app_factory);
        let server = PortServer::new(
            listener,
            listener_cfg.clone(),
            self.config.clone(),
            Arc::new(Semaphore::new(self.config.network.max_connection)),
            self.notify_shutdown.clone(),
            handler_factory,
            self.connection_id_gen.clone(),
        );
        let label = listener_cfg.label.clone();
        tokio::spawn(async move {
            if let Err(err) = server.run().await {
                error!(cause = %err, "listener {} failed to accept", label);
            }
        });
        Ok(bound_addr)
    }

    /// Start every listener in the configuration.  Individual listener
    /// failures are logged and tolerated; it is fatal only when nothing at
    /// all could be started.
    pub async fn start_from_config(
        &self,
        app_factory: Arc<dyn MessageHandlerFactory>,
    ) -> AppResult<Vec<SocketAddr>> {
        let mut bound = Vec::new();
        for listener_cfg in &self.config.listeners {
            match self.listen(listener_cfg, app_factory.clone()).await {
                Ok(addr) => bound.push(addr),
                Err(err) => error!("listener {} not started: {}", listener_cfg.label, err),
            }
        }
        if bound.is_empty() && !self.config.listeners.is_empty() {
            return Err(IllegalStateError(
                "no configured listener could be started".to_string(),
            ));
        }
        Ok(bound)
    }

    /// Make an outbound connection to another host.  A failed attempt is
    /// reported by handing the factory no connection rather than by erring;
    /// retry policy belongs to the caller.
    pub fn connect(
        &self,
        remote_addr: &str,
        protocol: Protocol,
        handler_factory: Arc<dyn MessageHandlerFactory>,
    ) {
        let remote_addr = remote_addr.to_string();
        let framer_cfg = FramerConfig {
            max_msg_length: self.config.general.max_msg_length,
            debug_replies: self.config.general.debug_replies,
        };
        let read_buffer_size = self.config.network.conn_read_buffer_size;
        let connection_id_gen = self.connection_id_gen.clone();
        tokio::spawn(async move {
            info!("connecting to {}", remote_addr);
            match TcpStream::connect(&remote_addr).await {
                Ok(socket) => {
                    let id = connection_id_gen.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                    let decoder = decoder_for(protocol, framer_cfg);
                    let encoder = encoder_for(protocol, &remote_addr, "");
                    TcpConnection::spawn(
                        id,
                        socket,
                        decoder,
                        encoder,
                        &handler_factory,
                        read_buffer_size,
                    );
                }
                Err(err) => {
                    error!("unable to connect to {}: {}", remote_addr, err);
                    handler_factory.provide_handler(None);
                }
            }
        });
    }

    /// Signal every listener and connection handler to shut down.
    pub fn shutdown(&self) {
        let _ = self.notify_shutdown.send(());
    }
}
