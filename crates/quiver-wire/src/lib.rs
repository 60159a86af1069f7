// Wire format for framing protocol messages on the network.
use bytes::{Buf, Bytes, BytesMut};

pub mod message;

pub use message::{
    ConnectRequest, ErrorCode, FetchItem, FetchRequest, Message, PutOffset, PutRecord, SessionType,
};

pub const MAGIC: u8 = 0x18;

/// Opaque client identifiers carried on every record are exactly this long.
pub const NODE_ID_LEN: usize = 24;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("invalid magic number {0:#04x}")]
    InvalidMagic(u8),
    #[error("frame too large")]
    FrameTooLarge,
    #[error("incomplete frame")]
    Incomplete,
    #[error("unknown message type {0:#04x}")]
    UnknownType(u8),
    #[error("message type {expected:#04x} does not match frame type {got:#04x}")]
    TypeMismatch { expected: u8, got: u8 },
    #[error("malformed payload: {0}")]
    MalformedPayload(#[from] serde_json::Error),
}

/// Frame category, derived from the high bit of the type byte.
/// `0x00..=0x7F` carries transactional control traffic, `0x80..=0xFF`
/// carries streaming data traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Category {
    Transaction,
    Streaming,
}

impl Category {
    pub fn of(frame_type: u8) -> Self {
        if frame_type & 0x80 == 0 {
            Category::Transaction
        } else {
            Category::Streaming
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub magic: u8,
    pub frame_type: u8,
    pub length: u32,
}

impl FrameHeader {
    pub const LEN: usize = 6;

    pub fn new(frame_type: u8, length: u32) -> Self {
        Self {
            magic: MAGIC,
            frame_type,
            length,
        }
    }

    pub fn category(&self) -> Category {
        Category::of(self.frame_type)
    }

    pub fn encode_into(&self, buf: &mut [u8; Self::LEN]) {
        buf[0] = self.magic;
        buf[1] = self.frame_type;
        buf[2..6].copy_from_slice(&self.length.to_be_bytes());
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        let mut header = [0u8; Self::LEN];
        self.encode_into(&mut header);
        buf.extend_from_slice(&header);
    }

    pub fn decode(mut buf: Bytes) -> Result<Self> {
        // Validate the magic before trusting the length.
        if buf.remaining() < Self::LEN {
            return Err(Error::Incomplete);
        }
        let magic = buf.get_u8();
        if magic != MAGIC {
            return Err(Error::InvalidMagic(magic));
        }
        let frame_type = buf.get_u8();
        let length = buf.get_u32();
        Ok(Self {
            magic,
            frame_type,
            length,
        })
    }
}

/// Frame containing a header and payload.
///
/// ```
/// use bytes::Bytes;
/// use quiver_wire::Frame;
///
/// let frame = Frame::new(0x09, Bytes::from_static(b"{}")).expect("frame");
/// let encoded = frame.encode();
/// let decoded = Frame::decode(encoded).expect("decode");
/// assert_eq!(decoded.payload, Bytes::from_static(b"{}"));
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub header: FrameHeader,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(frame_type: u8, payload: Bytes) -> Result<Self> {
        // Keep length within the on-wire u32 size.
        if payload.len() > u32::MAX as usize {
            return Err(Error::FrameTooLarge);
        }
        Ok(Self {
            header: FrameHeader::new(frame_type, payload.len() as u32),
            payload,
        })
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(FrameHeader::LEN + self.payload.len());
        self.header.encode(&mut buf);
        buf.extend_from_slice(&self.payload);
        buf.freeze()
    }

    pub fn decode(input: Bytes) -> Result<Self> {
        // Split header and payload based on the declared length.
        if input.len() < FrameHeader::LEN {
            return Err(Error::Incomplete);
        }
        let header = FrameHeader::decode(input.slice(0..FrameHeader::LEN))?;
        let length = header.length as usize;
        if input.len() < FrameHeader::LEN + length {
            return Err(Error::Incomplete);
        }
        let payload = input.slice(FrameHeader::LEN..FrameHeader::LEN + length);
        Ok(Self { header, payload })
    }
}
