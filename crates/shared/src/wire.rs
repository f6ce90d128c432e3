use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Upper bound on a single frame's payload size. Frames past this are
/// rejected before the read buffer is even allocated.
pub const MAX_FRAME_BYTES: u32 = 64 * 1024 * 1024;

/// Self-describing value graph carried by requests/responses. Byte strings
/// are a distinct variant from text strings so binary arguments round-trip
/// without a lossy UTF-8 detour.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Str(String),
    Bytes(Vec<u8>),
    Seq(Vec<Value>),
    Map(Vec<(String, Value)>),
}

impl Value {
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Int(n)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(s)
    }
}

/// Encodes a value with the wire codec (not yet length-framed).
pub fn encode_value(value: &Value) -> Result<Vec<u8>, WireError> {
    postcard::to_allocvec(value).map_err(WireError::Codec)
}

/// Decodes a value previously produced by [`encode_value`].
pub fn decode_value(bytes: &[u8]) -> Result<Value, WireError> {
    postcard::from_bytes(bytes).map_err(WireError::Codec)
}

/// Writes one length-framed message: a 4-byte big-endian length prefix
/// followed by `payload`. No other delimiters, no in-band escaping.
pub async fn send_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    payload: &[u8],
) -> Result<(), WireError> {
    let len = u32::try_from(payload.len()).map_err(|_| WireError::FrameTooLarge {
        len: payload.len() as u64,
        max: MAX_FRAME_BYTES,
    })?;
    if len > MAX_FRAME_BYTES {
        return Err(WireError::FrameTooLarge {
            len: len as u64,
            max: MAX_FRAME_BYTES,
        });
    }

    writer.write_u32(len).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Reads one length-framed message, looping until the prefixed length is
/// satisfied. A zero-length read before the frame completes is reported as
/// [`WireError::UnexpectedEof`], never as a truncated response.
pub async fn recv_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Vec<u8>, WireError> {
    let len = match reader.read_u32().await {
        Ok(len) => len,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(WireError::UnexpectedEof);
        }
        Err(e) => return Err(e.into()),
    };

    if len > MAX_FRAME_BYTES {
        return Err(WireError::FrameTooLarge {
            len: len as u64,
            max: MAX_FRAME_BYTES,
        });
    }

    let mut buf = vec![0u8; len as usize];
    match reader.read_exact(&mut buf).await {
        Ok(_) => Ok(buf),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Err(WireError::UnexpectedEof),
        Err(e) => Err(e.into()),
    }
}

#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("codec error: {0}")]
    Codec(#[from] postcard::Error),
    #[error("frame of {len} bytes exceeds the {max} byte limit")]
    FrameTooLarge { len: u64, max: u32 },
    #[error("connection closed before frame was complete")]
    UnexpectedEof,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn value_round_trips_through_the_codec() {
        let value = Value::Map(vec![
            ("a".to_string(), Value::Int(1)),
            ("b".to_string(), Value::Str("hi".to_string())),
            ("c".to_string(), Value::Bytes(vec![0xde, 0xad, 0xbe, 0xef])),
            ("d".to_string(), Value::Seq(vec![Value::Bool(true), Value::Null])),
        ]);

        let encoded = encode_value(&value).unwrap();
        let decoded = decode_value(&encoded).unwrap();
        assert_eq!(value, decoded);
    }

    #[test]
    fn bytes_and_str_are_distinct_wire_types() {
        let as_bytes = encode_value(&Value::Bytes(vec![104, 105])).unwrap();
        let as_str = encode_value(&Value::Str("hi".to_string())).unwrap();
        assert_ne!(as_bytes, as_str);

        assert_eq!(decode_value(&as_bytes).unwrap(), Value::Bytes(vec![104, 105]));
        assert_eq!(decode_value(&as_str).unwrap(), Value::Str("hi".to_string()));
    }

    #[tokio::test]
    async fn frame_round_trips_over_an_in_memory_pipe() {
        let (mut client, mut server) = tokio::io::duplex(4096);

        let payload = encode_value(&Value::Str("ping".to_string())).unwrap();
        send_frame(&mut client, &payload).await.unwrap();

        let received = recv_frame(&mut server).await.unwrap();
        assert_eq!(decode_value(&received).unwrap(), Value::Str("ping".to_string()));
    }

    #[tokio::test]
    async fn recv_fails_on_truncated_frame() {
        let (mut client, mut server) = tokio::io::duplex(4096);
        client.write_u32(10).await.unwrap();
        client.write_all(&[1, 2, 3]).await.unwrap();
        drop(client);

        let err = recv_frame(&mut server).await.unwrap_err();
        assert!(matches!(err, WireError::UnexpectedEof));
    }

    #[tokio::test]
    async fn recv_rejects_oversize_frame() {
        let (mut client, mut server) = tokio::io::duplex(4096);
        client.write_u32(MAX_FRAME_BYTES + 1).await.unwrap();

        let err = recv_frame(&mut server).await.unwrap_err();
        assert!(matches!(err, WireError::FrameTooLarge { .. }));
    }
}
