//! Binary RPC wire format.
//!
//! Every message is a length-prefixed protobuf frame:
//!
//! ```text
//! [u32 BE: len][protobuf bytes of len]
//! ```
//!
//! Clients send [`CallFrame`]s and the server answers each with a
//! [`ReplyFrame`] carrying the same `id`. Replies may arrive in any order, so
//! one connection can carry many calls at once.

use super::status::{Code, RpcStatus};
use crate::config::RpcConfig;
use crate::{Result, TwinportError};
use prost::Message;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// A procedure invocation.
#[derive(Clone, PartialEq, Message)]
pub struct CallFrame {
    #[prost(uint64, tag = "1")]
    pub id: u64,
    /// Fully qualified procedure name, e.g. `/api.TestServices/SayHello`.
    #[prost(string, tag = "2")]
    pub method: String,
    /// Protobuf-encoded request message.
    #[prost(bytes = "vec", tag = "3")]
    pub payload: Vec<u8>,
    /// Remaining time budget of the caller; zero means "server default".
    #[prost(uint64, tag = "4")]
    pub timeout_millis: u64,
}

/// The answer to one [`CallFrame`].
#[derive(Clone, PartialEq, Message)]
pub struct ReplyFrame {
    #[prost(uint64, tag = "1")]
    pub id: u64,
    #[prost(int32, tag = "2")]
    pub code: i32,
    #[prost(string, tag = "3")]
    pub message: String,
    /// Protobuf-encoded response message, empty unless `code` is OK.
    #[prost(bytes = "vec", tag = "4")]
    pub payload: Vec<u8>,
}

impl CallFrame {
    pub fn new(id: u64, method: impl Into<String>, payload: Vec<u8>, timeout: Duration) -> Self {
        Self {
            id,
            method: method.into(),
            payload,
            timeout_millis: timeout.as_millis().min(u64::MAX as u128) as u64,
        }
    }

    /// Timeout requested by the caller, if any.
    pub fn timeout(&self) -> Option<Duration> {
        (self.timeout_millis > 0).then(|| Duration::from_millis(self.timeout_millis))
    }
}

impl ReplyFrame {
    pub fn success(id: u64, payload: Vec<u8>) -> Self {
        Self {
            id,
            code: Code::Ok.as_i32(),
            message: String::new(),
            payload,
        }
    }

    pub fn failure(id: u64, status: RpcStatus) -> Self {
        Self {
            id,
            code: status.code.as_i32(),
            message: status.message,
            payload: Vec::new(),
        }
    }

    /// Split into the response payload or the failure status.
    pub fn into_result(self) -> std::result::Result<Vec<u8>, RpcStatus> {
        match Code::from_i32(self.code) {
            Code::Ok => Ok(self.payload),
            code => Err(RpcStatus::new(code, self.message)),
        }
    }
}

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

    if len > RpcConfig::MAX_FRAME_SIZE {
        return Err(TwinportError::Frame {
            message: format!(
                "frame size {} exceeds maximum {}",
                len,
                RpcConfig::MAX_FRAME_SIZE
            ),
        });
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;

    Ok(Some(payload))
}

/// Write a length-prefixed frame to an async writer.
pub async fn write_frame<W: AsyncWriteExt + Unpin>(writer: &mut W, payload: &[u8]) -> Result<()> {
    if payload.len() > RpcConfig::MAX_FRAME_SIZE {
        return Err(TwinportError::Frame {
            message: format!(
                "frame size {} exceeds maximum {}",
                payload.len(),
                RpcConfig::MAX_FRAME_SIZE
            ),
        });
    }
    let len = payload.len() as u32;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Encode and write one protobuf message as a frame.
pub async fn write_message<W, M>(writer: &mut W, message: &M) -> Result<()>
where
    W: AsyncWriteExt + Unpin,
    M: Message,
{
    write_frame(writer, &message.encode_to_vec()).await
}
