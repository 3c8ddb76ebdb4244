//! Election Protocol Messages
//!
//! Every RPC is one request frame answered by one response frame on a fresh
//! TCP connection. Frames are a big-endian `u32` length followed by a bincode
//! payload.

use bincode::{Decode, Encode};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::ConsensusError;

/// Protocol version for compatibility checking
pub const ELECTION_PROTOCOL_VERSION: u8 = 1;

/// Upper bound on a frame payload; election messages are tiny
pub const MAX_FRAME_SIZE: u32 = 64 * 1024;

/// Messages exchanged between election nodes
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub enum RaftMessage {
    /// Candidate asks for a vote in `term`
    RequestVote {
        version: u8,
        term: u64,
        candidate_id: String,
    },

    /// Answer to RequestVote
    Vote { term: u64, granted: bool },

    /// Leader asserts its leadership for `term`
    Heartbeat {
        version: u8,
        term: u64,
        leader_id: String,
    },

    /// Answer to Heartbeat
    HeartbeatAck { term: u64, success: bool },
}

impl RaftMessage {
    /// Encode message to bytes using bincode
    pub fn encode(&self) -> Result<Vec<u8>, bincode::error::EncodeError> {
        bincode::encode_to_vec(self, bincode::config::standard())
    }

    /// Decode message from bytes using bincode
    pub fn decode(data: &[u8]) -> Result<Self, bincode::error::DecodeError> {
        bincode::decode_from_slice(data, bincode::config::standard()).map(|(msg, _)| msg)
    }

    /// Get the message type name for logging
    pub fn type_name(&self) -> &'static str {
        match self {
            RaftMessage::RequestVote { .. } => "RequestVote",
            RaftMessage::Vote { .. } => "Vote",
            RaftMessage::Heartbeat { .. } => "Heartbeat",
            RaftMessage::HeartbeatAck { .. } => "HeartbeatAck",
        }
    }
}

/// Frame a message with length prefix for TCP transmission
pub fn frame_message(msg: &RaftMessage) -> Result<Vec<u8>, bincode::error::EncodeError> {
    let payload = msg.encode()?;
    let len = payload.len() as u32;

    let mut frame = Vec::with_capacity(4 + payload.len());
    frame.extend_from_slice(&len.to_be_bytes());
    frame.extend_from_slice(&payload);

    Ok(frame)
}

/// Read frame length from bytes (returns None if not enough data)
pub fn read_frame_length(data: &[u8]) -> Option<u32> {
    if data.len() < 4 {
        return None;
    }
    Some(u32::from_be_bytes([data[0], data[1], data[2], data[3]]))
}

/// Read one complete frame from a stream
pub async fn read_message<R>(reader: &mut R) -> Result<RaftMessage, ConsensusError>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; 4];
    reader.read_exact(&mut header).await?;

    let len = read_frame_length(&header).unwrap_or(0);
    if len > MAX_FRAME_SIZE {
        return Err(ConsensusError::Protocol(format!(
            "frame of {} bytes exceeds limit {}",
            len, MAX_FRAME_SIZE
        )));
    }

    let mut payload = vec![0u8; len as usize];
    reader.read_exact(&mut payload).await?;

    RaftMessage::decode(&payload)
        .map_err(|e| ConsensusError::Protocol(format!("Decode error: {}", e)))
}

/// Write one framed message to a stream
pub async fn write_message<W>(writer: &mut W, msg: &RaftMessage) -> Result<(), ConsensusError>
where
    W: AsyncWrite + Unpin,
{
    let frame = frame_message(msg)
        .map_err(|e| ConsensusError::Protocol(format!("Encode error: {}", e)))?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}
