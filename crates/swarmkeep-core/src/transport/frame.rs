//! Wire framing for the TCP transport.
//!
//! Every [`Message`] travels as a 4-byte big-endian length prefix followed
//! by its UTF-8 JSON encoding.
//!
//! ```text
//! [u32 BE: len][UTF-8 JSON bytes of len]
//! ```

use super::Message;
use crate::config::CommunicationConfig;
use crate::{Result, SwarmError};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// Read a length-prefixed frame from an async reader.
///
/// Returns `None` on clean EOF (peer closed connection).
pub async fn read_frame<R: AsyncReadExt + Unpin>(reader: &mut R) -> Result<Option<Vec<u8>>> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let len = u32::from_be_bytes(len_buf) as usize;

    if len > CommunicationConfig::MAX_MESSAGE_SIZE {
        return Err(SwarmError::Validation {
            field: "frame".to_string(),
            message: format!(
                "message size {} exceeds maximum {}",
                len,
                CommunicationConfig::MAX_MESSAGE_SIZE
            ),
        });
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;

    Ok(Some(payload))
}

/// Write a length-prefixed frame to an async writer.
pub async fn write_frame<W: AsyncWriteExt + Unpin>(writer: &mut W, payload: &[u8]) -> Result<()> {
    let len = u32::try_from(payload.len()).map_err(|_| SwarmError::Validation {
        field: "frame".to_string(),
        message: format!("message size {} does not fit a frame header", payload.len()),
    })?;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Read and decode the next message, `None` on clean EOF.
pub async fn read_message<R: AsyncReadExt + Unpin>(reader: &mut R) -> Result<Option<Message>> {
    match read_frame(reader).await? {
        Some(frame) => {
            let message = serde_json::from_slice(&frame).map_err(|e| SwarmError::Json {
                message: format!("Failed to parse message frame: {}", e),
                source: Some(e),
            })?;
            Ok(Some(message))
        }
        None => Ok(None),
    }
}

/// Encode and write a message.
pub async fn write_message<W: AsyncWriteExt + Unpin>(writer: &mut W, message: &Message) -> Result<()> {
    let payload = serde_json::to_vec(message)?;
    write_frame(writer, &payload).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_message_read_write_roundtrip() {
        let message = Message::to_client("consume_testdata", json!({"uid": 1}), "worker-1");
        let mut buf = Vec::new();

        write_message(&mut buf, &message).await.unwrap();

        let mut cursor = std::io::Cursor::new(buf);
        let read_back = read_message(&mut cursor).await.unwrap();

        assert_eq!(read_back, Some(message));
    }

    #[tokio::test]
    async fn test_frame_read_empty_stream_returns_none() {
        let mut cursor = std::io::Cursor::new(Vec::<u8>::new());
        let result = read_frame(&mut cursor).await.unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn test_frame_read_oversized_returns_error() {
        let huge_len: u32 = (CommunicationConfig::MAX_MESSAGE_SIZE + 1) as u32;
        let mut buf = Vec::new();
        buf.extend_from_slice(&huge_len.to_be_bytes());
        buf.extend_from_slice(&[0u8; 8]);

        let mut cursor = std::io::Cursor::new(buf);
        let result = read_frame(&mut cursor).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_invalid_json_frame_is_rejected() {
        let mut buf = Vec::new();
        write_frame(&mut buf, b"not valid json").await.unwrap();

        let mut cursor = std::io::Cursor::new(buf);
        match read_message(&mut cursor).await {
            Err(SwarmError::Json { .. }) => {}
            other => panic!("Expected Json error, got: {:?}", other),
        }
    }
}
