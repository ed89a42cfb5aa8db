//! Worker-side messenger session.

use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio::time::{timeout, timeout_at, Instant};
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::{Result, WorkerError};
use crate::slice::{Slice, SliceAnalytics};

use super::{decode, encode, Message, MessengerConfig};

type WireSink = SplitSink<Framed<TcpStream, LengthDelimitedCodec>, bytes::Bytes>;
type WireStream = SplitStream<Framed<TcpStream, LengthDelimitedCodec>>;

/// The worker's long-lived session with its execution controller.
///
/// Established once during worker initialization; failure to establish it
/// is fatal to startup. Inbound slice assignments are an unbounded
/// suspension point, outbound completion reports are bounded by the
/// action deadline.
#[derive(Debug)]
pub struct WorkerMessenger {
    worker_id: String,
    config: MessengerConfig,
    outbound: Mutex<WireSink>,
    slices: Mutex<mpsc::UnboundedReceiver<Slice>>,
    acks: Mutex<mpsc::UnboundedReceiver<Uuid>>,
    cancel: CancellationToken,
}

impl WorkerMessenger {
    /// Connect to the controller and perform the identifying handshake.
    pub async fn connect(addr: &str, worker_id: &str, config: MessengerConfig) -> Result<Self> {
        let stream = TcpStream::connect(addr).await.map_err(|e| {
            WorkerError::Connection(format!(
                "failed to connect to execution controller at {addr}: {e}"
            ))
        })?;
        let mut framed = Framed::new(stream, LengthDelimitedCodec::new());

        framed
            .send(encode(&Message::Handshake {
                worker_id: worker_id.to_string(),
            })?)
            .await
            .map_err(|e| WorkerError::Connection(format!("handshake failed: {e}")))?;

        let deadline = config.deadline();
        let reply = timeout(deadline, framed.next())
            .await
            .map_err(|_| WorkerError::ActionTimeout(deadline.as_millis()))?;
        match reply {
            Some(Ok(frame)) => match decode(&frame)? {
                Message::HandshakeAck => {}
                other => {
                    return Err(WorkerError::Connection(format!(
                        "unexpected handshake reply: {other:?}"
                    )))
                }
            },
            Some(Err(e)) => {
                return Err(WorkerError::Connection(format!("handshake failed: {e}")))
            }
            None => {
                return Err(WorkerError::Connection(
                    "controller closed the connection during handshake".into(),
                ))
            }
        }

        let (sink, stream) = framed.split();
        let (slice_tx, slice_rx) = mpsc::unbounded_channel();
        let (ack_tx, ack_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();

        tokio::spawn(read_loop(
            stream,
            slice_tx,
            ack_tx,
            cancel.clone(),
            worker_id.to_string(),
        ));

        tracing::info!(worker_id, addr, "connected to execution controller");

        Ok(Self {
            worker_id: worker_id.to_string(),
            config,
            outbound: Mutex::new(sink),
            slices: Mutex::new(slice_rx),
            acks: Mutex::new(ack_rx),
            cancel,
        })
    }

    /// Block until the controller assigns the next slice. Callers must not
    /// invoke this while a slice is already in flight.
    pub async fn wait_for_slice(&self) -> Result<Slice> {
        let mut slices = self.slices.lock().await;
        slices.recv().await.ok_or_else(|| {
            WorkerError::Connection("connection to execution controller closed".into())
        })
    }

    /// Report a slice's completion (successful or not) and wait for the
    /// controller's acknowledgement under the action deadline.
    pub async fn send_slice_complete(
        &self,
        slice: &Slice,
        error: Option<String>,
        analytics: Option<SliceAnalytics>,
    ) -> Result<()> {
        let message = Message::SliceComplete {
            worker_id: self.worker_id.clone(),
            slice: slice.clone(),
            error,
            analytics,
        };
        {
            let mut outbound = self.outbound.lock().await;
            outbound.send(encode(&message)?).await.map_err(|e| {
                WorkerError::Connection(format!("failed to send slice completion: {e}"))
            })?;
        }

        // One absolute deadline for the whole wait; stale acks spend it
        // rather than resetting it.
        let deadline = self.config.deadline();
        let expires_at = Instant::now() + deadline;
        let mut acks = self.acks.lock().await;
        loop {
            match timeout_at(expires_at, acks.recv()).await {
                Err(_) => return Err(WorkerError::ActionTimeout(deadline.as_millis())),
                Ok(None) => {
                    return Err(WorkerError::Connection(
                        "connection to execution controller closed".into(),
                    ))
                }
                Ok(Some(slice_id)) if slice_id == slice.slice_id => return Ok(()),
                // Stale ack from an abandoned action.
                Ok(Some(_)) => continue,
            }
        }
    }

    /// Detach listeners and close the session. Safe to call repeatedly.
    pub async fn close(&self) {
        self.cancel.cancel();
        let mut outbound = self.outbound.lock().await;
        let _ = outbound.close().await;
    }
}

async fn read_loop(
    mut stream: WireStream,
    slice_tx: mpsc::UnboundedSender<Slice>,
    ack_tx: mpsc::UnboundedSender<Uuid>,
    cancel: CancellationToken,
    worker_id: String,
) {
    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => break,
            frame = stream.next() => frame,
        };
        match frame {
            Some(Ok(frame)) => match decode(&frame) {
                Ok(Message::NewSlice { slice }) => {
                    if slice_tx.send(slice).is_err() {
                        break;
                    }
                }
                Ok(Message::SliceCompleteAck { slice_id }) => {
                    if ack_tx.send(slice_id).is_err() {
                        break;
                    }
                }
                Ok(other) => {
                    tracing::warn!(worker_id, message = ?other, "unexpected message from controller");
                }
                Err(e) => {
                    tracing::warn!(worker_id, error = %e, "undecodable frame from controller");
                }
            },
            Some(Err(e)) => {
                tracing::warn!(worker_id, error = %e, "messenger read error");
                break;
            }
            None => break,
        }
    }
    tracing::debug!(worker_id, "messenger read loop finished");
}
