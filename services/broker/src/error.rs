//! Broker error taxonomy.
//!
//! Every failure the broker can produce is one tagged variant. Four
//! marker predicates drive handling at the supervisor: client-visible
//! errors are acked to the offending session, broadcastable errors go to
//! every live session, session-closeable errors cancel the session, and
//! broker-stoppable errors initiate shutdown. A variant can carry any
//! combination, so producers never decide policy — they classify and
//! emit.

use quiver_broker::CoreError;
use quiver_wire::ErrorCode;
use std::sync::Arc;

use crate::session::{Session, SessionState};

#[derive(thiserror::Error, Debug)]
pub enum BrokerError {
    #[error("socket closed")]
    SocketClosed,
    #[error("topic {0} does not exist")]
    TopicNotExists(String),
    #[error("topic {0} already exists")]
    TopicAlreadyExists(String),
    #[error(
        "start offset {start_offset} is beyond last offset {last_offset} \
         of {topic}:{fragment}"
    )]
    InvalidStartOffset {
        topic: String,
        fragment: u32,
        start_offset: u64,
        last_offset: u64,
    },
    #[error("operation {op} is invalid in session state {state:?}")]
    InvalidStateForOp { op: &'static str, state: SessionState },
    #[error("session is not connected")]
    NotConnected,
    #[error("sequence out of order on {topic}:{fragment}: expected {expected}, got {got}")]
    SeqOutOfOrder {
        topic: String,
        fragment: u32,
        expected: u64,
        got: u64,
    },
    #[error("invalid session type: {0}")]
    InvalidSessionType(String),
    #[error("coordination unavailable: {0}")]
    CoordinationUnavailable(String),
    #[error("store io: {0}")]
    StoreIo(String),
    #[error("store full")]
    StoreFull,
    #[error("unhandled error: {0}")]
    Unhandled(#[from] anyhow::Error),
}

impl BrokerError {
    /// Errors the offending client is told about via an `ErrorAck`.
    pub fn client_visible(&self) -> bool {
        self.ack_code().is_some()
    }

    /// Errors every connected client is told about.
    pub fn broadcastable(&self) -> bool {
        matches!(
            self,
            BrokerError::CoordinationUnavailable(_)
                | BrokerError::StoreIo(_)
                | BrokerError::StoreFull
        )
    }

    /// Errors that terminate the producing session.
    pub fn session_closeable(&self) -> bool {
        matches!(
            self,
            BrokerError::SocketClosed
                | BrokerError::InvalidStartOffset { .. }
                | BrokerError::InvalidStateForOp { .. }
                | BrokerError::NotConnected
                | BrokerError::SeqOutOfOrder { .. }
                | BrokerError::InvalidSessionType(_)
                | BrokerError::Unhandled(_)
        )
    }

    /// Errors that take the whole broker down.
    pub fn broker_stoppable(&self) -> bool {
        matches!(self, BrokerError::StoreIo(_) | BrokerError::StoreFull)
    }

    /// The wire code for client-visible errors, `None` otherwise.
    pub fn ack_code(&self) -> Option<ErrorCode> {
        match self {
            BrokerError::TopicNotExists(_) => Some(ErrorCode::TopicNotExists),
            BrokerError::TopicAlreadyExists(_) => Some(ErrorCode::TopicAlreadyExists),
            BrokerError::InvalidStartOffset { .. } => Some(ErrorCode::InvalidStartOffset),
            BrokerError::InvalidStateForOp { .. } => Some(ErrorCode::InvalidStateForOp),
            BrokerError::NotConnected => Some(ErrorCode::NotConnected),
            BrokerError::SeqOutOfOrder { .. } => Some(ErrorCode::SeqOutOfOrder),
            BrokerError::InvalidSessionType(_) => Some(ErrorCode::InvalidSessionType),
            BrokerError::SocketClosed
            | BrokerError::CoordinationUnavailable(_)
            | BrokerError::StoreIo(_)
            | BrokerError::StoreFull
            | BrokerError::Unhandled(_) => None,
        }
    }

    /// The code used when this error is broadcast to all sessions.
    pub fn broadcast_code(&self) -> ErrorCode {
        match self {
            BrokerError::CoordinationUnavailable(_) => ErrorCode::CoordinationUnavailable,
            BrokerError::StoreFull => ErrorCode::StoreFull,
            BrokerError::StoreIo(_) => ErrorCode::StoreIo,
            _ => ErrorCode::UnhandledError,
        }
    }
}

impl From<CoreError> for BrokerError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::TopicNotExists(name) => BrokerError::TopicNotExists(name),
            CoreError::TopicAlreadyExists(name) => BrokerError::TopicAlreadyExists(name),
            CoreError::InvalidTopicName(name) => {
                BrokerError::Unhandled(anyhow::anyhow!("invalid topic name {name:?}"))
            }
            CoreError::CoordinationUnavailable(reason) => {
                BrokerError::CoordinationUnavailable(reason)
            }
            CoreError::Storage(quiver_storage::StorageError::Full) => BrokerError::StoreFull,
            CoreError::Storage(err) => BrokerError::StoreIo(err.to_string()),
        }
    }
}

impl From<quiver_storage::StorageError> for BrokerError {
    fn from(err: quiver_storage::StorageError) -> Self {
        match err {
            quiver_storage::StorageError::Full => BrokerError::StoreFull,
            other => BrokerError::StoreIo(other.to_string()),
        }
    }
}

/// An error bound to the session that produced it, as carried on the
/// merged session error stream.
#[derive(Debug)]
pub struct SessionError {
    pub session: Arc<Session>,
    pub error: BrokerError,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn marker_predicates_match_the_taxonomy() {
        let socket = BrokerError::SocketClosed;
        assert!(!socket.client_visible());
        assert!(socket.session_closeable());
        assert!(!socket.broker_stoppable());

        let missing = BrokerError::TopicNotExists("t".into());
        assert!(missing.client_visible());
        assert!(!missing.session_closeable());

        let offset = BrokerError::InvalidStartOffset {
            topic: "t".into(),
            fragment: 0,
            start_offset: 10,
            last_offset: 3,
        };
        assert!(offset.client_visible());
        assert!(offset.session_closeable());
        assert!(!offset.broker_stoppable());

        let store = BrokerError::StoreFull;
        assert!(!store.client_visible());
        assert!(store.broadcastable());
        assert!(store.broker_stoppable());

        let coordination = BrokerError::CoordinationUnavailable("gone".into());
        assert!(coordination.broadcastable());
        assert!(!coordination.session_closeable());
        assert!(!coordination.broker_stoppable());

        let unhandled = BrokerError::Unhandled(anyhow::anyhow!("boom"));
        assert!(!unhandled.client_visible());
        assert!(unhandled.session_closeable());
    }

    #[test]
    fn ack_codes_cover_client_visible_variants() {
        assert_eq!(
            BrokerError::NotConnected.ack_code(),
            Some(ErrorCode::NotConnected)
        );
        assert_eq!(
            BrokerError::TopicAlreadyExists("t".into()).ack_code(),
            Some(ErrorCode::TopicAlreadyExists)
        );
        assert_eq!(BrokerError::SocketClosed.ack_code(), None);
    }
}
