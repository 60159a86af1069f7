//! Per-connection session.
//!
//! A session owns exactly one reader task and one writer task. The writer
//! drains a single-producer channel and is the only code that touches the
//! write half, which gives per-session total write order without
//! user-visible locks. The reader yields raw frames until cancellation or
//! peer close and reports at most one classified error before closing its
//! error stream.
//!
//! State machine: `None` until a streaming connect is accepted, then
//! `OnPublish` or `OnSubscribe` (through a transient `Ready` while the
//! bind is validated), and `Closed` terminally on peer close, I/O error
//! or broker shutdown. The bound topic/fragment set is immutable once the
//! connect completes.

use std::net::SocketAddr;
use std::sync::Mutex as StdMutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;

use quiver_wire::{Frame, Message, SessionType};

use crate::error::BrokerError;
use crate::transport::codec;

// Bound on waiting for writer-queue capacity; a peer that has not
// drained 64 frames in this long is treated as gone.
const WRITE_ENQUEUE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    None,
    Ready,
    OnPublish,
    OnSubscribe,
    Closed,
}

#[derive(Debug, Clone)]
pub struct Binding {
    pub session_type: SessionType,
    pub topic: String,
    pub fragment_ids: Vec<u32>,
}

#[derive(Debug)]
pub struct Session {
    id: u64,
    peer: SocketAddr,
    state: StdMutex<SessionState>,
    binding: StdMutex<Option<Binding>>,
    writer_tx: mpsc::Sender<Message>,
    cancel_tx: watch::Sender<bool>,
    read_timeout: Duration,
    max_frame_bytes: usize,
}

/// Read half handed back by [`Session::open`]; consumed by
/// [`SessionReader::continuous_read`].
pub struct SessionReader {
    session: Arc<Session>,
    read_half: OwnedReadHalf,
}

impl Session {
    /// Split the connection and start the writer task.
    pub fn open(
        id: u64,
        stream: TcpStream,
        read_timeout: Duration,
        max_frame_bytes: usize,
    ) -> anyhow::Result<(Arc<Session>, SessionReader)> {
        let peer = stream.peer_addr()?;
        let (read_half, write_half) = stream.into_split();
        let (writer_tx, writer_rx) = mpsc::channel(64);
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let session = Arc::new(Session {
            id,
            peer,
            state: StdMutex::new(SessionState::None),
            binding: StdMutex::new(None),
            writer_tx,
            cancel_tx,
            read_timeout,
            max_frame_bytes,
        });
        tokio::spawn(run_writer_loop(id, write_half, writer_rx, cancel_rx));
        let reader = SessionReader {
            session: Arc::clone(&session),
            read_half,
        };
        Ok((session, reader))
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock().expect("session state lock")
    }

    /// Apply a state transition, rejecting anything the machine does not
    /// allow. `Closed` is terminal and idempotent.
    pub fn set_state(&self, next: SessionState) -> Result<(), BrokerError> {
        let mut state = self.state.lock().expect("session state lock");
        let allowed = matches!(
            (*state, next),
            (SessionState::None, SessionState::Ready)
                | (SessionState::None, SessionState::OnPublish)
                | (SessionState::None, SessionState::OnSubscribe)
                | (SessionState::Ready, SessionState::OnPublish)
                | (SessionState::Ready, SessionState::OnSubscribe)
                | (_, SessionState::Closed)
        );
        if !allowed {
            return Err(BrokerError::InvalidStateForOp {
                op: "set_state",
                state: *state,
            });
        }
        *state = next;
        Ok(())
    }

    /// Record the connect-time bind. The set is immutable afterwards.
    pub fn bind(&self, binding: Binding) {
        *self.binding.lock().expect("session binding lock") = Some(binding);
    }

    pub fn binding(&self) -> Option<Binding> {
        self.binding.lock().expect("session binding lock").clone()
    }

    pub fn session_type(&self) -> Option<SessionType> {
        self.binding().map(|binding| binding.session_type)
    }

    pub fn topics(&self) -> Vec<String> {
        self.binding()
            .map(|binding| vec![binding.topic])
            .unwrap_or_default()
    }

    pub fn fragment_ids(&self, topic: &str) -> Vec<u32> {
        self.binding()
            .filter(|binding| binding.topic == topic)
            .map(|binding| binding.fragment_ids)
            .unwrap_or_default()
    }

    /// Enqueue a message on the writer channel. Write order follows
    /// enqueue order. A session that is already cancelled, or whose
    /// writer queue stays full past the enqueue deadline (a stalled
    /// peer), reports `SocketClosed` instead of wedging the caller.
    pub async fn write(&self, message: Message) -> Result<(), BrokerError> {
        let mut cancel_rx = self.cancel_tx.subscribe();
        if *cancel_rx.borrow() {
            return Err(BrokerError::SocketClosed);
        }
        tokio::select! {
            result = self.writer_tx.send(message) => {
                result.map_err(|_| BrokerError::SocketClosed)
            }
            _ = cancel_rx.changed() => Err(BrokerError::SocketClosed),
            _ = tokio::time::sleep(WRITE_ENQUEUE_TIMEOUT) => Err(BrokerError::SocketClosed),
        }
    }

    pub fn is_closed(&self) -> bool {
        *self.cancel_tx.borrow()
    }

    /// Cancellation scope for tasks tied to this session.
    pub fn cancelled(&self) -> watch::Receiver<bool> {
        self.cancel_tx.subscribe()
    }

    /// Idempotent. Cancels the reader, the writer and any fetch loop
    /// parked on the notifier for this session.
    pub fn close(&self) {
        let mut state = self.state.lock().expect("session state lock");
        *state = SessionState::Closed;
        drop(state);
        let _ = self.cancel_tx.send(true);
    }
}

impl SessionReader {
    /// Start the continuous read task. The frame stream closes cleanly on
    /// peer FIN; the error stream emits at most one classified error.
    pub fn continuous_read(self) -> (mpsc::Receiver<Frame>, mpsc::Receiver<BrokerError>) {
        let (frame_tx, frame_rx) = mpsc::channel(1);
        let (err_tx, err_rx) = mpsc::channel(1);
        tokio::spawn(run_read_loop(
            self.session,
            self.read_half,
            frame_tx,
            err_tx,
        ));
        (frame_rx, err_rx)
    }
}

async fn run_read_loop(
    session: Arc<Session>,
    mut read_half: OwnedReadHalf,
    frame_tx: mpsc::Sender<Frame>,
    err_tx: mpsc::Sender<BrokerError>,
) {
    let mut cancel_rx = session.cancelled();
    loop {
        tokio::select! {
            changed = cancel_rx.changed() => {
                if changed.is_err() || *cancel_rx.borrow() {
                    break;
                }
            }
            result = timeout(
                session.read_timeout,
                codec::read_frame(&mut read_half, session.max_frame_bytes),
            ) => {
                match result {
                    // The configured read deadline passed without a frame.
                    Err(_) => {
                        tracing::debug!(session = session.id, "session read timed out");
                        let _ = err_tx.send(BrokerError::SocketClosed).await;
                        break;
                    }
                    Ok(Ok(Some(frame))) => {
                        if frame_tx.send(frame).await.is_err() {
                            break;
                        }
                    }
                    // Peer finished cleanly.
                    Ok(Ok(None)) => break,
                    Ok(Err(err)) => {
                        let classified = if err.downcast_ref::<std::io::Error>().is_some() {
                            BrokerError::SocketClosed
                        } else {
                            BrokerError::Unhandled(err)
                        };
                        let _ = err_tx.send(classified).await;
                        break;
                    }
                }
            }
        }
    }
}

async fn run_writer_loop(
    session_id: u64,
    mut write_half: OwnedWriteHalf,
    mut writer_rx: mpsc::Receiver<Message>,
    mut cancel_rx: watch::Receiver<bool>,
) {
    loop {
        // Biased toward the queue so acks enqueued just before a close
        // still reach the peer; cancellation is honored once idle.
        tokio::select! {
            biased;
            message = writer_rx.recv() => {
                let Some(message) = message else { break };
                if let Err(err) = codec::write_message(&mut write_half, &message).await {
                    tracing::info!(session = session_id, error = %err, "session write failed");
                    break;
                }
            }
            changed = cancel_rx.changed() => {
                if changed.is_err() || *cancel_rx.borrow() {
                    break;
                }
            }
        }
    }
    let _ = write_half.shutdown().await;
}
