use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, Semaphore};
use tokio::time::{self, Duration};
use tracing::{debug, error, info};

use crate::network::framer::{decoder_for, encoder_for, FramerConfig};
use crate::network::{MessageHandlerFactory, TcpConnection};
use crate::service::{ListenerConfig, ServerConfig};
use crate::AppError;
use crate::AppResult;

use super::Shutdown;

/// Accept loop for one listening port.  Each accepted socket becomes a
/// `TcpConnection` wired to a fresh decoder/encoder pair for the port's
/// protocol and a handler from the port's (possibly session-wrapping)
/// handler factory.
pub struct PortServer {
    listener: TcpListener,
    listener_cfg: ListenerConfig,
    config: Arc<ServerConfig>,
    limit_connections: Arc<Semaphore>,
    notify_shutdown: broadcast::Sender<()>,
    handler_factory: Arc<dyn MessageHandlerFactory>,
    connection_id_gen: Arc<AtomicU64>,
}

impl PortServer {
    pub fn new(
        listener: TcpListener,
        listener_cfg: ListenerConfig,
        config: Arc<ServerConfig>,
        limit_connections: Arc<Semaphore>,
        notify_shutdown: broadcast::Sender<()>,
        handler_factory: Arc<dyn MessageHandlerFactory>,
        connection_id_gen: Arc<AtomicU64>,
    ) -> Self {
        PortServer {
            listener,
            listener_cfg,
            config,
            limit_connections,
            notify_shutdown,
            handler_factory,
            connection_id_gen,
        }
    }

    /// Accept connections until shutdown.  A connection slot is held for the
    /// whole life of each connection; accept errors back off exponentially
    /// and give up only when persistent.
    pub async fn run(&self) -> AppResult<()> {
        let mut shutdown = Shutdown::new(self.notify_shutdown.subscribe());
        let framer_cfg = FramerConfig {
            max_msg_length: self.config.general.max_msg_length,
            debug_replies: self.config.general.debug_replies,
        };
        info!(
            "listener {} serving {:?} on {}",
            self.listener_cfg.label, self.listener_cfg.protocol, self.listener_cfg.addr
        );

        loop {
            let permit = self
                .limit_connections
                .clone()
                .acquire_owned()
                .await
                .expect("connection semaphore closed");

            let socket = tokio::select! {
                socket = self.accept() => socket?,
                _ = shutdown.recv() => {
                    debug!("listener {} got shutdown signal", self.listener_cfg.label);
                    return Ok(());
                }
            };

            debug!("listener {} accepted connection", self.listener_cfg.label);
            let connection_id = self.connection_id_gen.fetch_add(1, Ordering::Relaxed);
            let decoder = decoder_for(self.listener_cfg.protocol, framer_cfg.clone());
            let encoder = encoder_for(
                self.listener_cfg.protocol,
                &self.listener_cfg.addr,
                &self.listener_cfg.root_uri,
            );
            let connection = TcpConnection::spawn(
                connection_id,
                socket,
                decoder,
                encoder,
                &self.handler_factory,
                self.config.network.conn_read_buffer_size,
            );
            // tie the slot to the connection's lifetime
            tokio::spawn(async move {
                connection.closed().await;
                drop(permit);
            });
        }
    }

    async fn accept(&self) -> AppResult<TcpStream> {
        let mut backoff = 1;

        loop {
            match self.listener.accept().await {
                Ok((socket, _)) => return Ok(socket),
                Err(err) => {
                    if backoff > 64 {
                        return Err(AppError::Accept(format!(
                            "accept on {} failed: {}",
                            self.listener_cfg.addr, err
                        )));
                    }
                    error!(
                        "listener {} accept error (retrying in {}s): {}",
                        self.listener_cfg.label, backoff, err
                    );
                }
            }

            time::sleep(Duration::from_secs(backoff)).await;
            backoff *= 2;
        }
    }
}

impl Drop for PortServer {
    fn drop(&mut self) {
        debug!("listener {} dropped", self.listener_cfg.label);
    }
}
