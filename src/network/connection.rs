use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufWriter};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::{watch, Notify};
use tracing::{debug, error, info};

use crate::network::framer::{FrameDecoder, FrameEncoder, OutboundMessage};
use crate::network::{Connection, MessageHandler, MessageHandlerFactory};
use crate::AppError;

enum WriterOp {
    Msg(OutboundMessage),
    /// End-of-stream marker: flush whatever is queued, then shut the socket
    /// down.  Everything behind it has already been written.
    Close,
}

/// One TCP socket and its I/O machinery.  A reader task feeds the decoder
/// and hands complete messages to the connection's handler; a writer task
/// drains the outbound queue through the encoder.  All mutation of socket
/// state happens on those two tasks; everyone else interacts through the
/// queue, so `send` is safe from any task and never blocks.
pub struct TcpConnection {
    id: u64,
    remote_addr: String,
    outbound_tx: UnboundedSender<WriterOp>,
    open: AtomicBool,
    died: AtomicBool,
    close_notify: Arc<Notify>,
    closed_watch: watch::Sender<bool>,
}

impl TcpConnection {
    /// Wire up a fresh socket: build the connection, ask the port's factory
    /// for a handler, and spawn the reader and writer tasks.
    pub fn spawn(
        id: u64,
        socket: TcpStream,
        decoder: Box<dyn FrameDecoder>,
        encoder: Box<dyn FrameEncoder>,
        handler_factory: &Arc<dyn MessageHandlerFactory>,
        read_buffer_size: usize,
    ) -> Arc<TcpConnection> {
        let remote_addr = socket
            .peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| "?".to_string());
        let (reader, writer) = socket.into_split();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();

        let (closed_watch, _) = watch::channel(false);
        let connection = Arc::new(TcpConnection {
            id,
            remote_addr,
            outbound_tx,
            open: AtomicBool::new(true),
            died: AtomicBool::new(false),
            close_notify: Arc::new(Notify::new()),
            closed_watch,
        });
        info!("{} new connection from {}", connection.label(), connection.remote_addr);

        let as_dyn: Arc<dyn Connection> = connection.clone();
        let handler = match handler_factory.provide_handler(Some(&as_dyn)) {
            Some(handler) => handler,
            None => {
                error!("{} no handler provided, dropping connection", connection.label());
                connection.close();
                let _ = connection.closed_watch.send(true);
                return connection;
            }
        };

        tokio::spawn(Self::write_loop(
            connection.clone(),
            BufWriter::new(writer),
            encoder,
            outbound_rx,
        ));
        tokio::spawn(Self::read_loop(
            connection.clone(),
            reader,
            decoder,
            handler,
            read_buffer_size,
        ));
        connection
    }

    async fn write_loop(
        connection: Arc<TcpConnection>,
        mut writer: BufWriter<OwnedWriteHalf>,
        encoder: Box<dyn FrameEncoder>,
        mut outbound_rx: UnboundedReceiver<WriterOp>,
    ) {
        while let Some(op) = outbound_rx.recv().await {
            match op {
                WriterOp::Msg(message) => {
                    let bytes = match encoder.produce_bytes(&message) {
                        Ok(bytes) => bytes,
                        Err(err) => {
                            error!("{} cannot encode message: {}", connection.label(), err);
                            continue;
                        }
                    };
                    let write_result = async {
                        writer.write_all(&bytes).await?;
                        writer.flush().await
                    }
                    .await;
                    if let Err(err) = write_result {
                        info!("{} write failed: {}", connection.label(), err);
                        break;
                    }
                }
                WriterOp::Close => {
                    let _ = writer.flush().await;
                    let _ = writer.shutdown().await;
                    break;
                }
            }
        }
        // Wake the reader so the death notification goes out even when the
        // peer never sends the closing FIN.
        connection.open.store(false, Ordering::Release);
        connection.close_notify.notify_one();
        debug!("{} writer exited", connection.label());
    }

    async fn read_loop(
        connection: Arc<TcpConnection>,
        mut reader: OwnedReadHalf,
        mut decoder: Box<dyn FrameDecoder>,
        handler: Arc<dyn MessageHandler>,
        read_buffer_size: usize,
    ) {
        let as_dyn: Arc<dyn Connection> = connection.clone();
        let mut buffer = BytesMut::with_capacity(read_buffer_size);
        let reason = loop {
            let read = tokio::select! {
                read = reader.read_buf(&mut buffer) => read,
                _ = connection.close_notify.notified() => {
                    break AppError::normal_close();
                }
            };
            match read {
                Ok(0) => {
                    // peer closed; anything mid-frame just never completed
                    break AppError::ConnectionClosed("remote disconnect".to_string());
                }
                Ok(_) => {
                    match decoder.receive_bytes(&buffer) {
                        Ok(messages) => {
                            buffer.clear();
                            for message in messages {
                                handler.receive_msg(&as_dyn, message);
                            }
                        }
                        Err(err) => {
                            // framing errors are fatal to this connection only
                            info!("{} framing error: {}", connection.label(), err);
                            break err;
                        }
                    }
                }
                Err(err) => {
                    info!("{} read failed: {}", connection.label(), err);
                    break AppError::IoError(err);
                }
            }
        };
        connection.shut_down_queue();
        if !connection.died.swap(true, Ordering::AcqRel) {
            handler.connection_died(&as_dyn, &reason);
        }
        let _ = connection.closed_watch.send(true);
        debug!("{} reader exited: {}", connection.label(), reason);
    }

    /// Completes once the connection has fully shut down and its death
    /// notification has gone out.
    pub async fn closed(&self) {
        let mut rx = self.closed_watch.subscribe();
        while !*rx.borrow() {
            if rx.changed().await.is_err() {
                break;
            }
        }
    }

    fn shut_down_queue(&self) {
        if self.open.swap(false, Ordering::AcqRel) {
            let _ = self.outbound_tx.send(WriterOp::Close);
        }
    }
}

impl Connection for TcpConnection {
    fn id(&self) -> u64 {
        self.id
    }

    fn send(&self, message: OutboundMessage) {
        if self.open.load(Ordering::Acquire) {
            // failure means the writer is already gone; the message would
            // have been dropped by the close anyway
            let _ = self.outbound_tx.send(WriterOp::Msg(message));
        } else {
            debug!("{} dropping message sent after close", self.label());
        }
    }

    fn close(&self) {
        if self.open.swap(false, Ordering::AcqRel) {
            debug!("{} close", self.label());
            if self.outbound_tx.send(WriterOp::Close).is_err() {
                // writer already gone, wake the reader directly
                self.close_notify.notify_one();
            }
        }
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    fn label(&self) -> String {
        format!("TCP({})", self.id)
    }
}

impl std::fmt::Debug for TcpConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpConnection")
            .field("id", &self.id)
            .field("remote_addr", &self.remote_addr)
            .field("open", &self.open.load(Ordering::Relaxed))
            .finish()
    }
}
