//! Stream service: the publisher and subscriber data paths.
//!
//! Phase 1 of every streaming session is a `ConnectRequest` binding the
//! session to one topic and a fixed fragment set. Phase 2 depends on the
//! session type: publishers send `PutRequest` batches that the broker
//! core commits and acknowledges with assigned offsets; subscribers send
//! one `FetchRequest` per bound fragment, each starting a tail loop that
//! streams contiguous records and parks on the notifier once caught up.
//!
//! The fetch loop is deliberately conservative about gaps: a record whose
//! sequence number is not exactly `last_seen + 1` (possible after a topic
//! deletion raced a recreate) ends the stream instead of silently
//! skipping, so the subscriber can reconnect from a fresh offset.

use quiver_wire::{FetchItem, Message, PutOffset, PutRecord, SessionType};
use std::collections::BTreeMap;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::error::BrokerError;
use crate::fanout::BrokerShared;
use crate::session::{Binding, Session, SessionState};

pub async fn run(
    session: Arc<Session>,
    mut frames: mpsc::Receiver<Message>,
    shared: Arc<BrokerShared>,
    errors: mpsc::Sender<BrokerError>,
) {
    let Some(binding) = connect_phase(&session, &mut frames, &shared, &errors).await else {
        return;
    };

    let mut fetch_tasks = Vec::new();
    let mut fetching: HashSet<u32> = HashSet::new();

    while let Some(frame) = frames.recv().await {
        match frame {
            Message::PutRequest { records } => {
                match handle_put(&session, &binding, &shared, records).await {
                    Ok(response) => {
                        if session.write(response).await.is_err() {
                            break;
                        }
                    }
                    Err(err) => {
                        if errors.send(err).await.is_err() {
                            break;
                        }
                    }
                }
            }
            Message::FetchRequest(request) => {
                if let Err(err) = validate_fetch(&session, &binding, &fetching, request.fragment) {
                    if errors.send(err).await.is_err() {
                        break;
                    }
                    continue;
                }
                fetching.insert(request.fragment);
                let task = tokio::spawn(fetch_loop(
                    Arc::clone(&session),
                    Arc::clone(&shared),
                    binding.topic.clone(),
                    request,
                    errors.clone(),
                ));
                fetch_tasks.push(task);
            }
            Message::ConnectRequest(_) => {
                let err = BrokerError::InvalidStateForOp {
                    op: "connect",
                    state: session.state(),
                };
                if errors.send(err).await.is_err() {
                    break;
                }
            }
            other => {
                tracing::warn!(frame_type = other.frame_type(), "unexpected streaming frame");
            }
        }
    }

    // Inbound channel closed: the reader is gone. Drain the fetch loops,
    // then release everything this session bound.
    session.close();
    shared.core.notifier().cancel_session(session.id());
    for task in fetch_tasks {
        let _ = task.await;
    }
    finalize_binding(&shared, &binding).await;
    if let Err(err) = shared.core.flush_offsets().await {
        tracing::warn!(session = session.id(), error = %err, "session-close offset flush failed");
    }
}

/// First frame must be a connect. A failed connect acks the client and
/// closes the session; the caller skips phase 2 entirely.
async fn connect_phase(
    session: &Arc<Session>,
    frames: &mut mpsc::Receiver<Message>,
    shared: &Arc<BrokerShared>,
    errors: &mpsc::Sender<BrokerError>,
) -> Option<Binding> {
    let first = frames.recv().await?;
    let request = match first {
        Message::ConnectRequest(request) => request,
        other => {
            tracing::debug!(
                session = session.id(),
                frame_type = other.frame_type(),
                "streaming frame before connect"
            );
            let _ = errors.send(BrokerError::NotConnected).await;
            return None;
        }
    };

    match do_connect(session, shared, request).await {
        Ok(binding) => {
            if session.write(Message::ConnectResponse {}).await.is_err() {
                return None;
            }
            Some(binding)
        }
        Err(err) => {
            // Connect failures are terminal for the session: ack directly,
            // then close, instead of leaving a half-bound session around.
            if let Some(code) = err.ack_code() {
                let _ = session
                    .write(Message::ErrorAck {
                        code,
                        msg: err.to_string(),
                    })
                    .await;
            }
            session.close();
            None
        }
    }
}

async fn do_connect(
    session: &Arc<Session>,
    shared: &Arc<BrokerShared>,
    request: quiver_wire::ConnectRequest,
) -> Result<Binding, BrokerError> {
    if session.state() != SessionState::None {
        return Err(BrokerError::InvalidStateForOp {
            op: "connect",
            state: session.state(),
        });
    }
    session.set_state(SessionState::Ready)?;

    let topic = shared.core.describe_topic(&request.topic).await?;
    if request.fragment_ids.is_empty() {
        return Err(BrokerError::InvalidSessionType(
            "connect must bind at least one fragment".to_string(),
        ));
    }
    for fragment in &request.fragment_ids {
        if *fragment >= topic.num_fragments {
            return Err(BrokerError::InvalidSessionType(format!(
                "fragment {fragment} is out of range for topic {} ({} fragments)",
                request.topic, topic.num_fragments
            )));
        }
    }

    let (publishers, subscribers) = match request.session_type {
        SessionType::Publisher => (1, 0),
        SessionType::Subscriber => (0, 1),
    };
    for fragment in &request.fragment_ids {
        shared
            .core
            .adjust_session_counters(&request.topic, *fragment, publishers, subscribers)
            .await?;
        if request.session_type == SessionType::Publisher {
            shared
                .core
                .register_fragment_host(&request.topic, *fragment, &shared.advertised_addr)
                .await?;
        }
    }

    let next = match request.session_type {
        SessionType::Publisher => SessionState::OnPublish,
        SessionType::Subscriber => SessionState::OnSubscribe,
    };
    session.set_state(next)?;
    let binding = Binding {
        session_type: request.session_type,
        topic: request.topic,
        fragment_ids: request.fragment_ids,
    };
    session.bind(binding.clone());
    tracing::debug!(
        session = session.id(),
        topic = %binding.topic,
        session_type = ?binding.session_type,
        fragments = ?binding.fragment_ids,
        "session connected"
    );
    Ok(binding)
}

/// Undo the connect-time counter increments.
async fn finalize_binding(shared: &Arc<BrokerShared>, binding: &Binding) {
    let (publishers, subscribers) = match binding.session_type {
        SessionType::Publisher => (-1, 0),
        SessionType::Subscriber => (0, -1),
    };
    for fragment in &binding.fragment_ids {
        if let Err(err) = shared
            .core
            .adjust_session_counters(&binding.topic, *fragment, publishers, subscribers)
            .await
        {
            tracing::debug!(
                topic = %binding.topic,
                fragment,
                error = %err,
                "counter decrement skipped"
            );
        }
    }
}

async fn handle_put(
    session: &Arc<Session>,
    binding: &Binding,
    shared: &Arc<BrokerShared>,
    records: Vec<PutRecord>,
) -> Result<Message, BrokerError> {
    if session.state() != SessionState::OnPublish {
        return Err(BrokerError::InvalidStateForOp {
            op: "put",
            state: session.state(),
        });
    }

    // Group by fragment, preserving each fragment's arrival order.
    let mut groups: BTreeMap<u32, Vec<usize>> = BTreeMap::new();
    for (index, record) in records.iter().enumerate() {
        if !binding.fragment_ids.contains(&record.fragment) {
            return Err(BrokerError::InvalidStateForOp {
                op: "put to unbound fragment",
                state: session.state(),
            });
        }
        if record.node_id.len() != quiver_wire::NODE_ID_LEN {
            return Err(BrokerError::Unhandled(anyhow::anyhow!(
                "record node id must be {} bytes, got {}",
                quiver_wire::NODE_ID_LEN,
                record.node_id.len()
            )));
        }
        groups.entry(record.fragment).or_default().push(index);
    }

    let mut offsets: Vec<Option<PutOffset>> = vec![None; records.len()];
    for (fragment, indexes) in groups {
        let batch: Vec<(&[u8], bytes::Bytes)> = indexes
            .iter()
            .map(|index| {
                let record = &records[*index];
                (record.node_id.as_slice(), record.data.clone())
            })
            .collect();
        let seqs = shared.core.append(&binding.topic, fragment, &batch).await?;
        for (index, seq) in indexes.into_iter().zip(seqs) {
            offsets[index] = Some(PutOffset { fragment, seq });
        }
    }

    Ok(Message::PutResponse {
        offsets: offsets.into_iter().flatten().collect(),
    })
}

fn validate_fetch(
    session: &Arc<Session>,
    binding: &Binding,
    fetching: &HashSet<u32>,
    fragment: u32,
) -> Result<(), BrokerError> {
    if session.state() != SessionState::OnSubscribe {
        return Err(BrokerError::InvalidStateForOp {
            op: "fetch",
            state: session.state(),
        });
    }
    if !binding.fragment_ids.contains(&fragment) {
        return Err(BrokerError::InvalidStateForOp {
            op: "fetch on unbound fragment",
            state: session.state(),
        });
    }
    if fetching.contains(&fragment) {
        return Err(BrokerError::InvalidStateForOp {
            op: "duplicate fetch on fragment",
            state: session.state(),
        });
    }
    Ok(())
}

/// Tail one fragment from `start_offset`, blocking on the notifier once
/// caught up. Exits cleanly on session cancellation, peer close or a
/// sequence gap.
async fn fetch_loop(
    session: Arc<Session>,
    shared: Arc<BrokerShared>,
    topic: String,
    request: quiver_wire::FetchRequest,
    errors: mpsc::Sender<BrokerError>,
) {
    if let Err(err) = fetch_fragment(&session, &shared, &topic, request).await {
        let _ = errors.send(err).await;
    }
}

async fn fetch_fragment(
    session: &Arc<Session>,
    shared: &Arc<BrokerShared>,
    topic: &str,
    request: quiver_wire::FetchRequest,
) -> Result<(), BrokerError> {
    let fragment = request.fragment;
    let last = shared.core.last_offset(topic, fragment).await?;
    if request.start_offset > last + 1 {
        return Err(BrokerError::InvalidStartOffset {
            topic: topic.to_string(),
            fragment,
            start_offset: request.start_offset,
            last_offset: last,
        });
    }

    // Offset 0 means "from the beginning"; the first record is seq 1.
    let mut last_seen = request.start_offset.saturating_sub(1);
    let batch_size = request.batch_size.max(1) as usize;
    let flush_interval = (request.flush_interval_ms > 0)
        .then(|| Duration::from_millis(request.flush_interval_ms));
    let mut pending: Vec<FetchItem> = Vec::new();
    let mut deadline: Option<Instant> = None;
    let mut cancel_rx = session.cancelled();

    loop {
        if *cancel_rx.borrow() {
            return Ok(());
        }
        // Tail snapshot first, then a storage snapshot at least as new:
        // every offset up to `tail` is visible to this scan.
        let tail = shared.core.last_offset(topic, fragment).await?;
        let mut cursor = shared.core.scan(topic, fragment, last_seen + 1)?;

        while cursor.valid() {
            let record = match cursor.record() {
                Some(record) => record?,
                None => break,
            };
            if record.seq != last_seen + 1 {
                // Gap in the sequence space: end the stream rather than
                // skip records the subscriber will never know about.
                tracing::warn!(
                    session = session.id(),
                    topic,
                    fragment,
                    expected = last_seen + 1,
                    found = record.seq,
                    "sequence gap ends fetch stream"
                );
                flush(session, &mut pending, tail).await?;
                return Ok(());
            }
            last_seen = record.seq;
            pending.push(FetchItem {
                fragment,
                seq: record.seq,
                node_id: record.node_id,
                data: record.payload,
            });
            if deadline.is_none() {
                deadline = flush_interval.map(|interval| Instant::now() + interval);
            }
            let deadline_hit = deadline.is_some_and(|at| Instant::now() >= at);
            if pending.len() >= batch_size || deadline_hit {
                flush(session, &mut pending, tail).await?;
                deadline = None;
            }
            cursor.next()?;
        }

        // Always drain before blocking so a partially filled batch is not
        // held hostage by an idle fragment.
        flush(session, &mut pending, tail).await?;
        deadline = None;

        if last_seen >= tail {
            let wakeup =
                shared
                    .core
                    .notifier()
                    .register(session.id(), topic, fragment, last_seen);
            tokio::select! {
                changed = cancel_rx.changed() => {
                    if changed.is_err() || *cancel_rx.borrow() {
                        return Ok(());
                    }
                }
                woken = wakeup => {
                    if woken.is_err() {
                        // Waiter was cancelled with the session.
                        return Ok(());
                    }
                }
            }
        }
    }
}

async fn flush(
    session: &Arc<Session>,
    pending: &mut Vec<FetchItem>,
    last_offset: u64,
) -> Result<(), BrokerError> {
    if pending.is_empty() {
        return Ok(());
    }
    let items = std::mem::take(pending);
    metrics::counter!("quiver_fetch_records_delivered_total").increment(items.len() as u64);
    session
        .write(Message::FetchResponse { items, last_offset })
        .await
}
