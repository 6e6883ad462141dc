//! Message connections from launchers and function workers
//!
//! Each connection is owned by exactly one I/O worker and moves through
//! `Created → Running → Closing → Closed`. The handshake must complete
//! before any data message is accepted; everything after it is a stream of
//! fixed-size frames processed strictly FIFO.
//!
//! Writes go through an unbounded per-connection queue drained by a writer
//! task, so any thread holding a [`ConnectionHandle`] can send without
//! touching the connection's reader.

use bytes::Bytes;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::Engine;
use crate::error::{LumenError, Result};
use crate::protocol::{Message, MESSAGE_SIZE};

/// Connection lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Created,
    Running,
    Closing,
    Closed,
}

/// Who the peer turned out to be, decided by its handshake
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionIdentity {
    Launcher { func_id: u16 },
    FuncWorker { func_id: u16, client_id: u16 },
}

pub(crate) enum WriteOp {
    Frame(Box<Message>),
    FrameWithPayload(Box<Message>, Bytes),
    Close,
}

/// Cloneable write-side handle to a connection
#[derive(Clone)]
pub struct ConnectionHandle {
    id: u64,
    tx: mpsc::UnboundedSender<WriteOp>,
}

impl ConnectionHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn send_message(&self, mut message: Message) -> Result<()> {
        message.fill_send_timestamp();
        self.tx
            .send(WriteOp::Frame(Box::new(message)))
            .map_err(|_| LumenError::ConnectionClosed)
    }

    /// Send a frame followed by a trailing payload (handshake responses
    /// carry the function config this way)
    pub fn send_message_with_payload(&self, mut message: Message, payload: Bytes) -> Result<()> {
        message.fill_send_timestamp();
        self.tx
            .send(WriteOp::FrameWithPayload(Box::new(message), payload))
            .map_err(|_| LumenError::ConnectionClosed)
    }

    pub fn schedule_close(&self) {
        let _ = self.tx.send(WriteOp::Close);
    }
}

#[cfg(test)]
impl ConnectionHandle {
    /// Handle with a detached queue, for tests that never drain writes
    pub(crate) fn new_for_test(id: u64) -> (Self, mpsc::UnboundedReceiver<WriteOp>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { id, tx }, rx)
    }
}

/// Drive one message connection to completion.
///
/// Runs on the I/O worker that owns the connection; state transitions never
/// happen cross-thread.
pub async fn run_message_connection<S>(engine: Arc<Engine>, stream: S, id: u64)
where
    S: AsyncRead + AsyncWrite + 'static,
{
    let (mut reader, mut writer) = tokio::io::split(stream);
    let (tx, mut rx) = mpsc::unbounded_channel();
    let handle = ConnectionHandle { id, tx };
    debug!(conn_id = id, state = ?ConnectionState::Created, "New message connection");

    let writer_task = tokio::task::spawn_local(async move {
        while let Some(op) = rx.recv().await {
            let result = match op {
                WriteOp::Frame(message) => writer.write_all(&message.encode()).await,
                WriteOp::FrameWithPayload(message, payload) => {
                    match writer.write_all(&message.encode()).await {
                        Ok(()) => writer.write_all(&payload).await,
                        Err(e) => Err(e),
                    }
                }
                WriteOp::Close => break,
            };
            if let Err(e) = result {
                debug!(error = %e, "Connection write failed");
                break;
            }
        }
        let _ = writer.shutdown().await;
    });

    // Handshake first; data messages are not accepted before it completes
    let identity = match read_frame(&mut reader).await {
        Ok(message) => match engine.on_new_handshake(&handle, &message) {
            Ok((identity, response, payload)) => {
                if handle.send_message_with_payload(response, payload).is_err() {
                    None
                } else {
                    debug!(
                        conn_id = id,
                        ?identity,
                        state = ?ConnectionState::Running,
                        "Handshake done"
                    );
                    Some(identity)
                }
            }
            Err(e) => {
                warn!(conn_id = id, error = %e, "Handshake rejected; closing connection");
                None
            }
        },
        Err(e) => {
            warn!(conn_id = id, error = %e, "Connection closed before handshake");
            None
        }
    };

    if let Some(identity) = identity {
        loop {
            match read_frame(&mut reader).await {
                Ok(message) => engine.on_recv_message(identity, &handle, &message),
                Err(LumenError::ConnectionClosed) => {
                    info!(conn_id = id, "Connection closed by peer");
                    break;
                }
                Err(e) => {
                    warn!(conn_id = id, error = %e, "Connection read failed");
                    break;
                }
            }
        }
        debug!(conn_id = id, state = ?ConnectionState::Closing, "Connection closing");
        engine.on_connection_close(identity);
    }

    handle.schedule_close();
    drop(handle);
    let _ = writer_task.await;
    debug!(conn_id = id, state = ?ConnectionState::Closed, "Connection closed");
}

async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Message> {
    let mut frame = [0u8; MESSAGE_SIZE];
    match reader.read_exact(&mut frame).await {
        Ok(_) => Message::decode(&frame),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            Err(LumenError::ConnectionClosed)
        }
        Err(e) => Err(e.into()),
    }
}
