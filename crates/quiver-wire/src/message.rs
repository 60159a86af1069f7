//! Protocol messages carried inside frames.
//!
//! Every message serializes to a self-describing JSON payload; the frame's
//! type byte selects the variant and its high bit selects the category
//! (transaction vs streaming). `encode`/`decode` enforce that the frame type
//! and the payload variant agree, so a mislabeled frame never silently
//! decodes as a different message.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::{Category, Error, Frame, Result};

mod frame_type {
    pub const CREATE_TOPIC_REQUEST: u8 = 0x01;
    pub const CREATE_TOPIC_RESPONSE: u8 = 0x02;
    pub const DELETE_TOPIC_REQUEST: u8 = 0x03;
    pub const DELETE_TOPIC_RESPONSE: u8 = 0x04;
    pub const DESCRIBE_TOPIC_REQUEST: u8 = 0x05;
    pub const DESCRIBE_TOPIC_RESPONSE: u8 = 0x06;
    pub const LIST_TOPICS_REQUEST: u8 = 0x07;
    pub const LIST_TOPICS_RESPONSE: u8 = 0x08;
    pub const HEARTBEAT_REQUEST: u8 = 0x09;
    pub const HEARTBEAT_RESPONSE: u8 = 0x0A;
    pub const DISCOVER_BROKER_REQUEST: u8 = 0x0B;
    pub const DISCOVER_BROKER_RESPONSE: u8 = 0x0C;
    pub const ERROR_ACK: u8 = 0x0D;

    pub const CONNECT_REQUEST: u8 = 0x80;
    pub const CONNECT_RESPONSE: u8 = 0x81;
    pub const PUT_REQUEST: u8 = 0x82;
    pub const PUT_RESPONSE: u8 = 0x83;
    pub const FETCH_REQUEST: u8 = 0x84;
    pub const FETCH_RESPONSE: u8 = 0x85;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionType {
    Publisher,
    Subscriber,
}

/// Classified error codes surfaced to clients in `ErrorAck` frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    SocketClosed,
    TopicNotExists,
    TopicAlreadyExists,
    InvalidStartOffset,
    InvalidStateForOp,
    NotConnected,
    SeqOutOfOrder,
    InvalidSessionType,
    CoordinationUnavailable,
    StoreIo,
    StoreFull,
    UnhandledError,
}

/// One record in a `PutRequest`. The broker assigns the sequence number;
/// producers never send absolute offsets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PutRecord {
    pub fragment: u32,
    pub node_id: Vec<u8>,
    pub data: Bytes,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PutOffset {
    pub fragment: u32,
    pub seq: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchItem {
    pub fragment: u32,
    pub seq: u64,
    pub node_id: Vec<u8>,
    pub data: Bytes,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectRequest {
    pub session_type: SessionType,
    pub topic: String,
    pub fragment_ids: Vec<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchRequest {
    pub fragment: u32,
    pub start_offset: u64,
    pub batch_size: u32,
    pub flush_interval_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Message {
    CreateTopicRequest {
        name: String,
        description: String,
        num_fragments: u32,
        replication_factor: u32,
    },
    CreateTopicResponse {},
    DeleteTopicRequest {
        name: String,
    },
    DeleteTopicResponse {},
    DescribeTopicRequest {
        name: String,
    },
    DescribeTopicResponse {
        description: String,
        num_fragments: u32,
        replication_factor: u32,
        num_publishers: u64,
        num_subscribers: u64,
    },
    ListTopicsRequest {},
    ListTopicsResponse {
        names: Vec<String>,
    },
    HeartbeatRequest {
        echo: String,
        ts: u64,
    },
    HeartbeatResponse {
        echo: String,
        ts: u64,
    },
    DiscoverBrokerRequest {
        topic: String,
        fragment: u32,
    },
    DiscoverBrokerResponse {
        host: String,
        port: u16,
    },
    ErrorAck {
        code: ErrorCode,
        msg: String,
    },
    ConnectRequest(ConnectRequest),
    ConnectResponse {},
    PutRequest {
        records: Vec<PutRecord>,
    },
    PutResponse {
        offsets: Vec<PutOffset>,
    },
    FetchRequest(FetchRequest),
    FetchResponse {
        items: Vec<FetchItem>,
        last_offset: u64,
    },
}

impl Message {
    pub fn frame_type(&self) -> u8 {
        match self {
            Message::CreateTopicRequest { .. } => frame_type::CREATE_TOPIC_REQUEST,
            Message::CreateTopicResponse {} => frame_type::CREATE_TOPIC_RESPONSE,
            Message::DeleteTopicRequest { .. } => frame_type::DELETE_TOPIC_REQUEST,
            Message::DeleteTopicResponse {} => frame_type::DELETE_TOPIC_RESPONSE,
            Message::DescribeTopicRequest { .. } => frame_type::DESCRIBE_TOPIC_REQUEST,
            Message::DescribeTopicResponse { .. } => frame_type::DESCRIBE_TOPIC_RESPONSE,
            Message::ListTopicsRequest {} => frame_type::LIST_TOPICS_REQUEST,
            Message::ListTopicsResponse { .. } => frame_type::LIST_TOPICS_RESPONSE,
            Message::HeartbeatRequest { .. } => frame_type::HEARTBEAT_REQUEST,
            Message::HeartbeatResponse { .. } => frame_type::HEARTBEAT_RESPONSE,
            Message::DiscoverBrokerRequest { .. } => frame_type::DISCOVER_BROKER_REQUEST,
            Message::DiscoverBrokerResponse { .. } => frame_type::DISCOVER_BROKER_RESPONSE,
            Message::ErrorAck { .. } => frame_type::ERROR_ACK,
            Message::ConnectRequest(_) => frame_type::CONNECT_REQUEST,
            Message::ConnectResponse {} => frame_type::CONNECT_RESPONSE,
            Message::PutRequest { .. } => frame_type::PUT_REQUEST,
            Message::PutResponse { .. } => frame_type::PUT_RESPONSE,
            Message::FetchRequest(_) => frame_type::FETCH_REQUEST,
            Message::FetchResponse { .. } => frame_type::FETCH_RESPONSE,
        }
    }

    pub fn category(&self) -> Category {
        Category::of(self.frame_type())
    }

    pub fn encode(&self) -> Result<Frame> {
        let payload = serde_json::to_vec(self)?;
        Frame::new(self.frame_type(), Bytes::from(payload))
    }

    pub fn decode(frame: Frame) -> Result<Self> {
        let known = matches!(
            frame.header.frame_type,
            frame_type::CREATE_TOPIC_REQUEST..=frame_type::ERROR_ACK
                | frame_type::CONNECT_REQUEST..=frame_type::FETCH_RESPONSE
        );
        if !known {
            return Err(Error::UnknownType(frame.header.frame_type));
        }
        let message: Message = serde_json::from_slice(&frame.payload)?;
        if message.frame_type() != frame.header.frame_type {
            return Err(Error::TypeMismatch {
                expected: message.frame_type(),
                got: frame.header.frame_type,
            });
        }
        Ok(message)
    }
}
