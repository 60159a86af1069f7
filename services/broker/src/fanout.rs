//! Event fan-out.
//!
//! One task per accepted connection. For each session the fan-out builds
//! the typed pipeline: the reader's frame stream is decoded by a
//! `Versatile` pipe, routed by category through a `Selector` into the two
//! per-session service channels, and every error source (reader, decode,
//! both services) is folded by a `Merge` pipe into the broker-wide
//! session error stream, tagged with the session handle.
//!
//! Teardown follows channel closure: the reader exiting closes the frame
//! stream, the pipes drain and drop the service channels, the service
//! handlers finalize their per-fragment state, and only then is the
//! session closed and removed from the registry.

use quiver_wire::{Category, Frame, Message};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};

use crate::config::BrokerConfig;
use crate::error::{BrokerError, SessionError};
use crate::pipeline::{PipelineBuilder, Selector, Versatile};
use crate::services;
use crate::session::Session;
use crate::session_manager::SessionManager;

static SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// Immutable handles shared by every session task.
pub struct BrokerShared {
    pub config: BrokerConfig,
    pub core: Arc<quiver_broker::Broker>,
    pub sessions: Arc<SessionManager>,
    /// This broker's address as registered in coordination.
    pub advertised_addr: String,
}

/// Accept connections until the broker scope is cancelled.
pub async fn run_accept_loop(
    listener: TcpListener,
    shared: Arc<BrokerShared>,
    errors: mpsc::Sender<SessionError>,
    mut cancel_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            changed = cancel_rx.changed() => {
                if changed.is_err() || *cancel_rx.borrow() {
                    break;
                }
            }
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer)) => {
                        tracing::debug!(%peer, "connection accepted");
                        let shared = Arc::clone(&shared);
                        let errors = errors.clone();
                        tokio::spawn(async move {
                            if let Err(err) = handle_session(stream, shared, errors).await {
                                tracing::warn!(%peer, error = %err, "session setup failed");
                            }
                        });
                    }
                    Err(err) => {
                        tracing::warn!(error = %err, "accept failed");
                    }
                }
            }
        }
    }
    tracing::debug!("accept loop stopped");
}

async fn handle_session(
    stream: TcpStream,
    shared: Arc<BrokerShared>,
    broker_errors: mpsc::Sender<SessionError>,
) -> anyhow::Result<()> {
    let session_id = SESSION_ID.fetch_add(1, Ordering::Relaxed);
    let (session, reader) = Session::open(
        session_id,
        stream,
        shared.config.session_read_timeout(),
        shared.config.max_frame_bytes,
    )?;
    shared.sessions.add(Arc::clone(&session));

    // The service channels exist before the read starts, so no frame can
    // arrive with nobody listening.
    let (tx_tx, tx_rx) = mpsc::channel::<Message>(1);
    let (stream_tx, stream_rx) = mpsc::channel::<Message>(1);
    let (svc_err_tx, svc_err_rx) = mpsc::channel::<BrokerError>(1);
    let (message_tx, message_rx) = mpsc::channel::<Message>(1);
    let (decode_err_tx, decode_err_rx) = mpsc::channel::<BrokerError>(1);
    let (merged_err_tx, mut merged_err_rx) = mpsc::channel::<BrokerError>(1);

    let transaction = tokio::spawn(services::transaction::run(
        Arc::clone(&session),
        tx_rx,
        Arc::clone(&shared),
        svc_err_tx.clone(),
    ));
    let streaming = tokio::spawn(services::stream::run(
        Arc::clone(&session),
        stream_rx,
        Arc::clone(&shared),
        svc_err_tx,
    ));

    let (frame_rx, read_err_rx) = reader.continuous_read();
    let pipeline = PipelineBuilder::new()
        .versatile(
            Versatile::new(|frame: Frame| {
                Message::decode(frame)
                    .map_err(|err| BrokerError::Unhandled(anyhow::anyhow!(err)))
            }),
            frame_rx,
            message_tx,
            decode_err_tx,
        )
        .selector(
            Selector::new()
                .case(
                    "transaction",
                    |message: &Message| message.category() == Category::Transaction,
                    tx_tx,
                )
                .case(
                    "streaming",
                    |message: &Message| message.category() == Category::Streaming,
                    stream_tx,
                ),
            message_rx,
        )
        .merge(vec![read_err_rx, decode_err_rx, svc_err_rx], merged_err_tx)
        .build();

    // Tag merged errors with the session handle for the supervisor.
    let forwarder = {
        let session = Arc::clone(&session);
        tokio::spawn(async move {
            while let Some(error) = merged_err_rx.recv().await {
                if broker_errors
                    .send(SessionError {
                        session: Arc::clone(&session),
                        error,
                    })
                    .await
                    .is_err()
                {
                    break;
                }
            }
        })
    };

    // Service handlers exit once their channels drain; that is the signal
    // the session is done.
    let _ = transaction.await;
    let _ = streaming.await;
    pipeline.join().await;
    let _ = forwarder.await;

    session.close();
    shared.sessions.remove(session.id());
    tracing::debug!(session = session.id(), "session finished");
    Ok(())
}
