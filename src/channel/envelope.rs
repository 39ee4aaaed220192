// Wire format for channel messages: length-prefixed JSON envelopes

use crate::error::{Result, VigilError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Practical cap on a single framed message. Oversized payloads are
/// rejected rather than buffered, since the transport is a byte stream.
pub const MAX_FRAME_LEN: usize = 64 * 1024;

/// Length prefix: 4 bytes, big-endian
const LEN_PREFIX: usize = 4;

/// Envelope kinds carried on a channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EnvelopeKind {
    Heartbeat,
    Command,
    StatusUpdate,
    Ack,
    Error,
}

impl std::fmt::Display for EnvelopeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EnvelopeKind::Heartbeat => write!(f, "heartbeat"),
            EnvelopeKind::Command => write!(f, "command"),
            EnvelopeKind::StatusUpdate => write!(f, "status-update"),
            EnvelopeKind::Ack => write!(f, "ack"),
            EnvelopeKind::Error => write!(f, "error"),
        }
    }
}

/// A single message on a channel. Ids are monotonic per sender.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub id: u64,
    pub kind: EnvelopeKind,
    pub payload: Vec<u8>,
    pub sent_at: DateTime<Utc>,
}

impl Envelope {
    pub fn new(id: u64, kind: EnvelopeKind, payload: Vec<u8>) -> Self {
        Self {
            id,
            kind,
            payload,
            sent_at: Utc::now(),
        }
    }

    pub fn is_heartbeat(&self) -> bool {
        self.kind == EnvelopeKind::Heartbeat
    }
}

/// Monotonic id source for one sender
#[derive(Debug, Default)]
pub struct Sequencer(AtomicU64);

impl Sequencer {
    pub fn new() -> Self {
        Self(AtomicU64::new(1))
    }

    pub fn next(&self) -> u64 {
        self.0.fetch_add(1, Ordering::SeqCst)
    }
}

/// Serialize an envelope and check it against the frame cap.
///
/// The returned buffer includes the length prefix.
pub fn encode_frame(envelope: &Envelope) -> Result<Vec<u8>> {
    let body = serde_json::to_vec(envelope)
        .map_err(|e| VigilError::Serialization(format!("Failed to serialize envelope: {}", e)))?;

    if body.len() > MAX_FRAME_LEN {
        return Err(VigilError::FrameTooLarge(body.len(), MAX_FRAME_LEN));
    }

    let mut frame = Vec::with_capacity(LEN_PREFIX + body.len());
    frame.extend_from_slice(&(body.len() as u32).to_be_bytes());
    frame.extend_from_slice(&body);
    Ok(frame)
}

/// Cheap pre-send check so callers can reject oversized payloads
/// before they reach a queue.
pub fn validate_size(envelope: &Envelope) -> Result<()> {
    encode_frame(envelope).map(|_| ())
}

/// Write one complete frame. A message is not considered sent until
/// the whole frame is flushed.
pub async fn write_frame<W>(writer: &mut W, envelope: &Envelope) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let frame = encode_frame(envelope)?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one complete frame, reassembling partial reads.
///
/// Returns `Ok(None)` on a clean peer close. A length prefix above the
/// frame cap is a protocol error: the stream can no longer be trusted
/// to be in sync, so the caller must drop the connection.
pub async fn read_frame<R>(reader: &mut R) -> Result<Option<Envelope>>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; LEN_PREFIX];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_LEN {
        return Err(VigilError::FrameTooLarge(len, MAX_FRAME_LEN));
    }

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;

    serde_json::from_slice(&body)
        .map(Some)
        .map_err(|e| VigilError::Deserialization(format!("Malformed envelope: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sequencer_is_monotonic() {
        let seq = Sequencer::new();
        let a = seq.next();
        let b = seq.next();
        let c = seq.next();
        assert!(a < b && b < c);
    }

    #[test]
    fn test_encode_rejects_oversized_payload() {
        let envelope = Envelope::new(1, EnvelopeKind::Command, vec![0u8; MAX_FRAME_LEN + 1]);
        match encode_frame(&envelope) {
            Err(VigilError::FrameTooLarge(_, cap)) => assert_eq!(cap, MAX_FRAME_LEN),
            other => panic!("Expected FrameTooLarge, got: {:?}", other.map(|v| v.len())),
        }
    }

    #[test]
    fn test_validate_size_accepts_small_payload() {
        let envelope = Envelope::new(1, EnvelopeKind::Heartbeat, Vec::new());
        assert!(validate_size(&envelope).is_ok());
    }

    #[tokio::test]
    async fn test_frame_round_trip() {
        let envelope = Envelope::new(42, EnvelopeKind::Command, b"block example.com".to_vec());

        let (mut client, mut server) = tokio::io::duplex(MAX_FRAME_LEN * 2);
        write_frame(&mut client, &envelope).await.unwrap();

        let received = read_frame(&mut server).await.unwrap().unwrap();
        assert_eq!(received.id, envelope.id);
        assert_eq!(received.kind, envelope.kind);
        assert_eq!(received.payload, envelope.payload);
    }

    #[tokio::test]
    async fn test_read_frame_clean_close() {
        let (client, mut server) = tokio::io::duplex(64);
        drop(client);
        assert!(read_frame(&mut server).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_read_frame_rejects_oversized_prefix() {
        let (mut client, mut server) = tokio::io::duplex(64);
        let bogus = ((MAX_FRAME_LEN + 1) as u32).to_be_bytes();
        tokio::io::AsyncWriteExt::write_all(&mut client, &bogus)
            .await
            .unwrap();

        match read_frame(&mut server).await {
            Err(VigilError::FrameTooLarge(len, _)) => assert_eq!(len, MAX_FRAME_LEN + 1),
            other => panic!("Expected FrameTooLarge, got: {:?}", other.is_ok()),
        }
    }

    #[tokio::test]
    async fn test_frames_preserve_send_order() {
        let (mut client, mut server) = tokio::io::duplex(MAX_FRAME_LEN);
        for id in 1..=5u64 {
            let envelope = Envelope::new(id, EnvelopeKind::StatusUpdate, vec![id as u8]);
            write_frame(&mut client, &envelope).await.unwrap();
        }

        for id in 1..=5u64 {
            let received = read_frame(&mut server).await.unwrap().unwrap();
            assert_eq!(received.id, id);
        }
    }
}
