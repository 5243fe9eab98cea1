//! Binary frame codec for the sync and awareness protocols.
//!
//! Wire format (lib0 variable-length integers, y-protocols compatible):
//! ```text
//! ┌────────────┬──────────────────────────────────────────────┐
//! │ msg_type   │ body                                         │
//! │ varuint    │                                              │
//! ├────────────┼──────────────────────────────────────────────┤
//! │ 0 (sync)   │ varuint sync_type │ varUint8Array payload    │
//! │            │ 0 = step1 (state vector)                     │
//! │            │ 1 = step2 (missing updates)                  │
//! │            │ 2 = update                                   │
//! ├────────────┼──────────────────────────────────────────────┤
//! │ 1 (aware)  │ varUint8Array awareness update               │
//! └────────────┴──────────────────────────────────────────────┘
//! ```
//!
//! Payload bytes are opaque here; the replica engine and the awareness
//! tracker own their meaning.

use yrs::encoding::read::{Cursor, Read};
use yrs::encoding::write::Write;

use crate::awareness::AwarenessError;
use crate::replica::EngineError;

/// Leading tag of every frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    /// Sync handshake and document updates
    Sync = 0,
    /// Ephemeral presence
    Awareness = 1,
}

impl TryFrom<u32> for MessageType {
    type Error = ProtocolError;

    fn try_from(tag: u32) -> Result<Self, Self::Error> {
        match tag {
            0 => Ok(Self::Sync),
            1 => Ok(Self::Awareness),
            other => Err(ProtocolError::UnknownMessageType(other)),
        }
    }
}

const SYNC_STEP1: u32 = 0;
const SYNC_STEP2: u32 = 1;
const SYNC_UPDATE: u32 = 2;

/// Sub-message carried by a sync frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncMessage {
    /// Sender's state vector; the receiver answers with `Step2`.
    Step1(Vec<u8>),
    /// Updates the receiver was missing.
    Step2(Vec<u8>),
    /// Incremental update.
    Update(Vec<u8>),
}

/// One decoded protocol frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Sync(SyncMessage),
    Awareness(Vec<u8>),
}

impl Frame {
    pub fn message_type(&self) -> MessageType {
        match self {
            Frame::Sync(_) => MessageType::Sync,
            Frame::Awareness(_) => MessageType::Awareness,
        }
    }

    /// Serialize to the binary wire format.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.write_var(self.message_type() as u32);
        match self {
            Frame::Sync(msg) => {
                let (sync_type, payload) = match msg {
                    SyncMessage::Step1(p) => (SYNC_STEP1, p),
                    SyncMessage::Step2(p) => (SYNC_STEP2, p),
                    SyncMessage::Update(p) => (SYNC_UPDATE, p),
                };
                buf.write_var(sync_type);
                buf.write_buf(payload);
            }
            Frame::Awareness(update) => buf.write_buf(update),
        }
        buf
    }

    /// Deserialize from the binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let mut cursor = Cursor::new(bytes);
        let tag: u32 = cursor.read_var().map_err(decode_error)?;
        match MessageType::try_from(tag)? {
            MessageType::Sync => {
                let sync_type: u32 = cursor.read_var().map_err(decode_error)?;
                let payload = cursor.read_buf().map_err(decode_error)?.to_vec();
                match sync_type {
                    SYNC_STEP1 => Ok(Frame::Sync(SyncMessage::Step1(payload))),
                    SYNC_STEP2 => Ok(Frame::Sync(SyncMessage::Step2(payload))),
                    SYNC_UPDATE => Ok(Frame::Sync(SyncMessage::Update(payload))),
                    other => Err(ProtocolError::UnknownSyncType(other)),
                }
            }
            MessageType::Awareness => {
                let update = cursor.read_buf().map_err(decode_error)?.to_vec();
                Ok(Frame::Awareness(update))
            }
        }
    }

    /// Handshake sent when a session starts: the replica's state vector.
    pub fn sync_step1(state_vector: Vec<u8>) -> Self {
        Frame::Sync(SyncMessage::Step1(state_vector))
    }

    pub fn sync_step2(diff: Vec<u8>) -> Self {
        Frame::Sync(SyncMessage::Step2(diff))
    }

    pub fn update(update: Vec<u8>) -> Self {
        Frame::Sync(SyncMessage::Update(update))
    }
}

fn decode_error(e: yrs::encoding::read::Error) -> ProtocolError {
    ProtocolError::Decode(e.to_string())
}

/// Protocol errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("Malformed frame: {0}")]
    Decode(String),
    #[error("Unknown message type: {0}")]
    UnknownMessageType(u32),
    #[error("Unknown sync message type: {0}")]
    UnknownSyncType(u32),
    #[error("Session is closed")]
    SessionClosed,
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error(transparent)]
    Awareness(#[from] AwarenessError),
}
