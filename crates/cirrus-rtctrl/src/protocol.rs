//! Generic-mode wire protocol
//!
//! Invocations and replies cross the sandbox connection as sequential JSON
//! values with no length framing. The decoder is incremental: it buffers
//! raw bytes and yields every complete frame, leaving a trailing partial
//! frame in place for the next read.

use crate::error::{Result, RtctrlError};
use bytes::{Buf, BytesMut};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncWrite, AsyncWriteExt};

/// Request frame pushed to a sandbox
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvocationFrame {
    pub requestid: String,
    pub version: String,
    #[serde(rename = "accessKey", skip_serializing_if = "Option::is_none")]
    pub access_key: Option<String>,
    #[serde(rename = "secretKey", skip_serializing_if = "Option::is_none")]
    pub secret_key: Option<String>,
    #[serde(rename = "securityToken", skip_serializing_if = "Option::is_none")]
    pub security_token: Option<String>,
    #[serde(rename = "clientContext", skip_serializing_if = "Option::is_none")]
    pub client_context: Option<String>,
    #[serde(rename = "eventObject")]
    pub event_object: serde_json::Value,
}

/// Reply frame read back from a sandbox
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseFrame {
    pub requestid: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Serialize one frame onto the sandbox connection
pub async fn write_frame<W, T>(writer: &mut W, frame: &T) -> Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let payload = serde_json::to_vec(frame)?;
    writer.write_all(&payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Incremental decoder for a stream of back-to-back JSON frames
pub struct FrameDecoder {
    buf: BytesMut,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self {
            buf: BytesMut::with_capacity(8 * 1024),
        }
    }

    /// Append raw bytes and return every frame completed by them.
    ///
    /// A syntax error is a transport-level fault: the connection carries
    /// nothing recoverable after a corrupt frame.
    pub fn feed(&mut self, data: &[u8]) -> Result<Vec<ResponseFrame>> {
        self.buf.extend_from_slice(data);
        let mut frames = Vec::new();

        loop {
            let mut iter =
                serde_json::Deserializer::from_slice(&self.buf).into_iter::<ResponseFrame>();
            match iter.next() {
                Some(Ok(frame)) => {
                    let consumed = iter.byte_offset();
                    self.buf.advance(consumed);
                    frames.push(frame);
                }
                Some(Err(e)) if e.is_eof() => break,
                Some(Err(e)) => return Err(RtctrlError::Decode(e)),
                None => break,
            }
        }
        Ok(frames)
    }

    /// Bytes held for a not-yet-complete frame
    pub fn pending(&self) -> usize {
        self.buf.len()
    }
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_back_to_back_frames() {
        let mut decoder = FrameDecoder::new();
        let wire = concat!(
            r#"{"requestid":"a","success":true,"result":{"n":1}}"#,
            r#"{"requestid":"b","success":false,"error":"boom"}"#,
        );
        let frames = decoder.feed(wire.as_bytes()).unwrap();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].requestid, "a");
        assert!(frames[0].success);
        assert_eq!(frames[1].error.as_deref(), Some("boom"));
        assert_eq!(decoder.pending(), 0);
    }

    #[test]
    fn test_decode_across_partial_reads() {
        let mut decoder = FrameDecoder::new();
        let wire = br#"{"requestid":"a","success":true}"#;
        let (head, tail) = wire.split_at(10);

        assert!(decoder.feed(head).unwrap().is_empty());
        assert!(decoder.pending() > 0);

        let frames = decoder.feed(tail).unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].requestid, "a");
    }

    #[test]
    fn test_corrupt_frame_is_a_transport_fault() {
        let mut decoder = FrameDecoder::new();
        let err = decoder.feed(b"not json at all").unwrap_err();
        assert!(matches!(err, RtctrlError::Decode(_)));
    }

    #[tokio::test]
    async fn test_write_frame_round_trip() {
        let frame = InvocationFrame {
            requestid: "req-1".to_string(),
            version: "1".to_string(),
            access_key: None,
            secret_key: None,
            security_token: None,
            client_context: Some("ctx".to_string()),
            event_object: serde_json::json!({"key": "value"}),
        };
        let mut wire = Vec::new();
        write_frame(&mut wire, &frame).await.unwrap();

        let decoded: InvocationFrame = serde_json::from_slice(&wire).unwrap();
        assert_eq!(decoded.requestid, "req-1");
        assert_eq!(decoded.client_context.as_deref(), Some("ctx"));
        // Credentials are omitted from the wire when absent
        assert!(!String::from_utf8(wire).unwrap().contains("accessKey"));
    }
}
