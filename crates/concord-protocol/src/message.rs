//! Protocol messages and the framed codec
//!
//! Every frame is bincode-serialized and validated with CRC32.
//!
//! Format: [message_type:1][length:4][payload:N][crc32:4]

use crate::error::{ProtocolError, Result};
use crate::ids::{NodeId, TxnId};
use crate::operation::Payload;
use crate::types::{Decision, Vote};
use crc32fast::Hasher;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Protocol version
pub const PROTOCOL_VERSION: u32 = 1;

/// Upper bound on a single frame payload
pub const MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

const HEADER_LEN: usize = 5;
const CRC_LEN: usize = 4;

/// Message type tags
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Prepare = 0x01,
    Vote = 0x02,
    Commit = 0x03,
    Abort = 0x04,
    Ack = 0x05,
    StatusQuery = 0x10,
    StatusReply = 0x11,
    Ping = 0x20,
    Pong = 0x21,
}

impl TryFrom<u8> for MessageType {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0x01 => Ok(Self::Prepare),
            0x02 => Ok(Self::Vote),
            0x03 => Ok(Self::Commit),
            0x04 => Ok(Self::Abort),
            0x05 => Ok(Self::Ack),
            0x10 => Ok(Self::StatusQuery),
            0x11 => Ok(Self::StatusReply),
            0x20 => Ok(Self::Ping),
            0x21 => Ok(Self::Pong),
            other => Err(ProtocolError::UnknownType(other)),
        }
    }
}

/// Commit protocol messages
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProtocolMessage {
    /// Phase 1 request carrying the participant's branch
    Prepare {
        txn: TxnId,
        payload: Payload,
        deadline_ms: u64,
    },

    /// Participant's answer to PREPARE
    Vote { txn: TxnId, vote: Vote },

    /// Phase 2 commit decision
    Commit { txn: TxnId },

    /// Phase 2 abort decision
    Abort { txn: TxnId },

    /// Participant applied the decision
    Ack { txn: TxnId, decision: Decision },

    /// In-doubt participant asking for the decision
    StatusQuery { txn: TxnId },

    /// Coordinator's answer; `None` while still collecting votes
    StatusReply {
        txn: TxnId,
        decision: Option<Decision>,
    },

    /// Liveness probe
    Ping { seq: u64 },

    /// Liveness probe response
    Pong { seq: u64 },
}

impl ProtocolMessage {
    /// Get message type
    pub fn message_type(&self) -> MessageType {
        match self {
            Self::Prepare { .. } => MessageType::Prepare,
            Self::Vote { .. } => MessageType::Vote,
            Self::Commit { .. } => MessageType::Commit,
            Self::Abort { .. } => MessageType::Abort,
            Self::Ack { .. } => MessageType::Ack,
            Self::StatusQuery { .. } => MessageType::StatusQuery,
            Self::StatusReply { .. } => MessageType::StatusReply,
            Self::Ping { .. } => MessageType::Ping,
            Self::Pong { .. } => MessageType::Pong,
        }
    }

    /// Transaction this message refers to, if any
    pub fn txn(&self) -> Option<TxnId> {
        match self {
            Self::Prepare { txn, .. }
            | Self::Vote { txn, .. }
            | Self::Commit { txn }
            | Self::Abort { txn }
            | Self::Ack { txn, .. }
            | Self::StatusQuery { txn }
            | Self::StatusReply { txn, .. } => Some(*txn),
            Self::Ping { .. } | Self::Pong { .. } => None,
        }
    }

    /// Decision message for a transaction
    pub fn decision(txn: TxnId, decision: Decision) -> Self {
        match decision {
            Decision::Commit => Self::Commit { txn },
            Decision::Abort => Self::Abort { txn },
        }
    }
}

/// A message addressed from one role to another
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub from: NodeId,
    pub to: NodeId,
    pub message: ProtocolMessage,
}

impl Envelope {
    pub fn new(from: NodeId, to: NodeId, message: ProtocolMessage) -> Self {
        Self { from, to, message }
    }

    /// Build the response to this envelope
    pub fn reply(&self, message: ProtocolMessage) -> Self {
        Self {
            from: self.to.clone(),
            to: self.from.clone(),
            message,
        }
    }

    /// Encode envelope to bytes
    pub fn encode(&self) -> Result<Vec<u8>> {
        let payload = bincode::serialize(self)
            .map_err(|e| ProtocolError::codec(format!("Serialization failed: {}", e)))?;
        if payload.len() > MAX_FRAME_BYTES {
            return Err(ProtocolError::TooLarge(payload.len()));
        }

        let mut buf = Vec::with_capacity(HEADER_LEN + payload.len() + CRC_LEN);
        buf.push(self.message.message_type() as u8);
        buf.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        buf.extend_from_slice(&payload);

        // CRC32 of type + length + payload
        let mut hasher = Hasher::new();
        hasher.update(&buf);
        let crc = hasher.finalize();
        buf.extend_from_slice(&crc.to_le_bytes());

        Ok(buf)
    }

    /// Decode envelope from bytes
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < HEADER_LEN + CRC_LEN {
            return Err(ProtocolError::malformed("Message too short"));
        }

        let crc_offset = buf.len() - CRC_LEN;
        let stored_crc = le_u32(&buf[crc_offset..]);

        let mut hasher = Hasher::new();
        hasher.update(&buf[..crc_offset]);
        let computed_crc = hasher.finalize();

        if stored_crc != computed_crc {
            return Err(ProtocolError::CrcMismatch {
                expected: stored_crc,
                actual: computed_crc,
            });
        }

        let msg_type = MessageType::try_from(buf[0])?;
        let length = le_u32(&buf[1..HEADER_LEN]) as usize;
        if buf.len() != HEADER_LEN + length + CRC_LEN {
            return Err(ProtocolError::malformed("Length does not match frame"));
        }

        let envelope: Envelope = bincode::deserialize(&buf[HEADER_LEN..HEADER_LEN + length])
            .map_err(|e| ProtocolError::codec(format!("Deserialization failed: {}", e)))?;

        if envelope.message.message_type() != msg_type {
            return Err(ProtocolError::malformed(format!(
                "Type tag {:?} does not match payload {:?}",
                msg_type,
                envelope.message.message_type()
            )));
        }

        Ok(envelope)
    }

    /// Write envelope to async stream
    pub async fn write_to<W: AsyncWrite + Unpin>(&self, writer: &mut W) -> Result<()> {
        let buf = self.encode()?;
        writer.write_all(&buf).await?;
        writer.flush().await?;
        Ok(())
    }

    /// Read envelope from async stream
    pub async fn read_from<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Self> {
        let mut header = [0u8; HEADER_LEN];
        reader.read_exact(&mut header).await?;

        let length = le_u32(&header[1..]) as usize;
        if length > MAX_FRAME_BYTES {
            return Err(ProtocolError::TooLarge(length));
        }

        let mut full_buf = vec![0u8; HEADER_LEN + length + CRC_LEN];
        full_buf[..HEADER_LEN].copy_from_slice(&header);
        reader.read_exact(&mut full_buf[HEADER_LEN..]).await?;

        Self::decode(&full_buf)
    }
}

fn le_u32(bytes: &[u8]) -> u32 {
    u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operation::Operation;

    fn envelope(message: ProtocolMessage) -> Envelope {
        Envelope::new(NodeId::from("coordinator"), NodeId::from("p1"), message)
    }

    #[test]
    fn test_prepare_encode_decode() {
        let env = envelope(ProtocolMessage::Prepare {
            txn: TxnId::new(1, 7),
            payload: vec![Operation::put("k", b"v".to_vec()), Operation::delete("old")],
            deadline_ms: 5_000,
        });

        let encoded = env.encode().unwrap();
        assert_eq!(encoded[0], MessageType::Prepare as u8);

        let decoded = Envelope::decode(&encoded).unwrap();
        assert_eq!(decoded, env);
    }

    #[test]
    fn test_crc_validation() {
        let env = envelope(ProtocolMessage::Ping { seq: 123 });
        let mut encoded = env.encode().unwrap();

        // Corrupt the payload
        encoded[6] ^= 0xFF;

        let result = Envelope::decode(&encoded);
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("CRC"));
    }

    #[test]
    fn test_short_frame_rejected() {
        let result = Envelope::decode(&[0x01, 0, 0]);
        assert!(matches!(result, Err(ProtocolError::Malformed(_))));
    }

    #[test]
    fn test_unknown_type_rejected() {
        assert!(MessageType::try_from(0x7F).is_err());
        assert_eq!(MessageType::try_from(0x05).unwrap(), MessageType::Ack);
    }

    #[test]
    fn test_reply_swaps_addresses() {
        let env = envelope(ProtocolMessage::StatusQuery {
            txn: TxnId::new(0, 1),
        });
        let reply = env.reply(ProtocolMessage::StatusReply {
            txn: TxnId::new(0, 1),
            decision: Some(Decision::Abort),
        });
        assert_eq!(reply.from.as_str(), "p1");
        assert_eq!(reply.to.as_str(), "coordinator");
        assert_eq!(reply.message.txn(), Some(TxnId::new(0, 1)));
    }

    #[test]
    fn test_decision_message() {
        let txn = TxnId::new(0, 9);
        assert_eq!(
            ProtocolMessage::decision(txn, Decision::Commit),
            ProtocolMessage::Commit { txn }
        );
        assert_eq!(
            ProtocolMessage::decision(txn, Decision::Abort),
            ProtocolMessage::Abort { txn }
        );
    }

    #[tokio::test]
    async fn test_stream_round_trip() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        let env = envelope(ProtocolMessage::Vote {
            txn: TxnId::new(2, 3),
            vote: Vote::Commit,
        });

        env.write_to(&mut client).await.unwrap();
        let read = Envelope::read_from(&mut server).await.unwrap();
        assert_eq!(read, env);
    }
}
