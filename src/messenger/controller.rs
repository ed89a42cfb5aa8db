//! Controller-side messenger: accepts worker sessions, dispatches slice
//! assignments, and collects completion reports. The execution controller
//! proper runs this; the integration tests use it as the controller stand-in.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};
use tokio::time::timeout;
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tokio_util::sync::CancellationToken;

use crate::error::{Result, WorkerError};
use crate::slice::Slice;

use super::{decode, encode, Message, MessengerConfig, SliceCompletion};

struct Session {
    outbound: mpsc::UnboundedSender<Message>,
    completions: Mutex<mpsc::UnboundedReceiver<SliceCompletion>>,
    /// Set while a dispatched slice has not yet been reported complete.
    /// Complements the worker-side single-slot invariant from this end.
    in_flight: AtomicBool,
}

type Sessions = Arc<Mutex<HashMap<String, Arc<Session>>>>;

pub struct ControllerMessenger {
    config: MessengerConfig,
    local_addr: SocketAddr,
    sessions: Sessions,
    cancel: CancellationToken,
}

impl ControllerMessenger {
    /// Bind the listener and start accepting worker sessions.
    pub async fn bind(addr: &str, config: MessengerConfig) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| WorkerError::Connection(format!("failed to bind {addr}: {e}")))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| WorkerError::Connection(e.to_string()))?;

        let sessions: Sessions = Arc::new(Mutex::new(HashMap::new()));
        let cancel = CancellationToken::new();

        tokio::spawn(accept_loop(listener, sessions.clone(), cancel.clone()));

        tracing::info!(addr = %local_addr, "controller messenger listening");

        Ok(Self {
            config,
            local_addr,
            sessions,
            cancel,
        })
    }

    /// Address the listener actually bound to (useful with port 0).
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub async fn connected_workers(&self) -> Vec<String> {
        self.sessions.lock().await.keys().cloned().collect()
    }

    /// Wait until a worker with the given id has completed its handshake.
    pub async fn wait_for_worker(&self, worker_id: &str, deadline: Duration) -> Result<()> {
        let poll = async {
            loop {
                if self.sessions.lock().await.contains_key(worker_id) {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        };
        timeout(deadline, poll)
            .await
            .map_err(|_| WorkerError::ActionTimeout(deadline.as_millis()))
    }

    /// Dispatch a slice to a worker. Fails if the worker has no session or
    /// already has an unacknowledged slice in flight.
    pub async fn send_new_slice(&self, worker_id: &str, slice: &Slice) -> Result<()> {
        let session = self.session(worker_id).await?;
        if session.in_flight.swap(true, Ordering::SeqCst) {
            return Err(WorkerError::WorkerBusy(worker_id.to_string()));
        }
        let sent = session.outbound.send(Message::NewSlice {
            slice: slice.clone(),
        });
        if sent.is_err() {
            session.in_flight.store(false, Ordering::SeqCst);
            return Err(WorkerError::Connection(format!(
                "session with worker {worker_id} closed"
            )));
        }
        Ok(())
    }

    /// Wait for the next slice-completion report from a worker. The
    /// deadline defaults to the session's action deadline.
    pub async fn on_slice_complete(
        &self,
        worker_id: &str,
        deadline: Option<Duration>,
    ) -> Result<SliceCompletion> {
        let session = self.session(worker_id).await?;
        let deadline = deadline.unwrap_or_else(|| self.config.deadline());
        let mut completions = session.completions.lock().await;
        match timeout(deadline, completions.recv()).await {
            Err(_) => Err(WorkerError::ActionTimeout(deadline.as_millis())),
            Ok(None) => Err(WorkerError::Connection(format!(
                "session with worker {worker_id} closed"
            ))),
            Ok(Some(completion)) => Ok(completion),
        }
    }

    pub async fn close(&self) {
        self.cancel.cancel();
        self.sessions.lock().await.clear();
    }

    async fn session(&self, worker_id: &str) -> Result<Arc<Session>> {
        self.sessions
            .lock()
            .await
            .get(worker_id)
            .cloned()
            .ok_or_else(|| {
                WorkerError::Connection(format!("no active session for worker {worker_id}"))
            })
    }
}

async fn accept_loop(listener: TcpListener, sessions: Sessions, cancel: CancellationToken) {
    loop {
        let accepted = tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => accepted,
        };
        match accepted {
            Ok((stream, peer)) => {
                tracing::debug!(peer = %peer, "worker connecting");
                tokio::spawn(session_loop(stream, sessions.clone(), cancel.child_token()));
            }
            Err(e) => {
                tracing::warn!(error = %e, "accept failed");
            }
        }
    }
}

async fn session_loop(stream: TcpStream, sessions: Sessions, cancel: CancellationToken) {
    let mut framed = Framed::new(stream, LengthDelimitedCodec::new());

    // The first frame must identify the worker.
    let worker_id = match framed.next().await {
        Some(Ok(frame)) => match decode(&frame) {
            Ok(Message::Handshake { worker_id }) => worker_id,
            Ok(other) => {
                tracing::warn!(message = ?other, "expected handshake, dropping connection");
                return;
            }
            Err(e) => {
                tracing::warn!(error = %e, "undecodable handshake, dropping connection");
                return;
            }
        },
        _ => return,
    };

    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel();
    let (completion_tx, completion_rx) = mpsc::unbounded_channel();
    let session = Arc::new(Session {
        outbound: outbound_tx,
        completions: Mutex::new(completion_rx),
        in_flight: AtomicBool::new(false),
    });
    if sessions
        .lock()
        .await
        .insert(worker_id.clone(), session.clone())
        .is_some()
    {
        tracing::warn!(worker_id, "replacing existing session for worker");
    }

    match encode(&Message::HandshakeAck) {
        Ok(frame) => {
            if framed.send(frame).await.is_err() {
                sessions.lock().await.remove(&worker_id);
                return;
            }
        }
        Err(_) => return,
    }
    tracing::info!(worker_id, "worker session established");

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            outbound = outbound_rx.recv() => {
                let Some(message) = outbound else { break };
                let Ok(frame) = encode(&message) else { break };
                if framed.send(frame).await.is_err() {
                    break;
                }
            }
            inbound = framed.next() => {
                match inbound {
                    Some(Ok(frame)) => match decode(&frame) {
                        Ok(Message::SliceComplete { worker_id: reporter, slice, error, analytics }) => {
                            let slice_id = slice.slice_id;
                            session.in_flight.store(false, Ordering::SeqCst);
                            let _ = completion_tx.send(SliceCompletion {
                                worker_id: reporter,
                                slice,
                                error,
                                analytics,
                            });
                            match encode(&Message::SliceCompleteAck { slice_id }) {
                                Ok(frame) => {
                                    if framed.send(frame).await.is_err() {
                                        break;
                                    }
                                }
                                Err(_) => break,
                            }
                        }
                        Ok(other) => {
                            tracing::warn!(worker_id, message = ?other, "unexpected message from worker");
                        }
                        Err(e) => {
                            tracing::warn!(worker_id, error = %e, "undecodable frame from worker");
                        }
                    },
                    Some(Err(e)) => {
                        tracing::warn!(worker_id, error = %e, "session read error");
                        break;
                    }
                    None => break,
                }
            }
        }
    }

    sessions.lock().await.remove(&worker_id);
    tracing::debug!(worker_id, "worker session closed");
}
