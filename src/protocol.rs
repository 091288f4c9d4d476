//! Wire protocol — length-framed JSON request/reply
//!
//! Every message is a UTF-8 JSON object preceded by a 4-byte big-endian
//! payload length. Oversize and zero-length frames are protocol errors
//! that end the session without a reply.

use serde::Deserialize;
use serde_json::{json, Value};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Largest accepted payload.
pub const MAX_FRAME_BYTES: usize = 1024 * 1024;

#[derive(Debug, Error)]
pub enum FrameError {
    /// The peer closed the connection between frames.
    #[error("connection closed")]
    Closed,
    #[error("zero-length frame")]
    Empty,
    #[error("frame of {0} bytes exceeds the {MAX_FRAME_BYTES} byte limit")]
    Oversize(usize),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Read one complete frame.
pub async fn read_frame<R>(reader: &mut R) -> Result<Vec<u8>, FrameError>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    if let Err(e) = reader.read_exact(&mut len_buf).await {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            return Err(FrameError::Closed);
        }
        return Err(FrameError::Io(e));
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    if len == 0 {
        return Err(FrameError::Empty);
    }
    if len > MAX_FRAME_BYTES {
        return Err(FrameError::Oversize(len));
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    Ok(payload)
}

/// Write one complete frame.
pub async fn write_frame<W>(writer: &mut W, payload: &[u8]) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin,
{
    if payload.is_empty() {
        return Err(FrameError::Empty);
    }
    if payload.len() > MAX_FRAME_BYTES {
        return Err(FrameError::Oversize(payload.len()));
    }
    writer.write_all(&(payload.len() as u32).to_be_bytes()).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}

// --- Command parameters ---

#[derive(Debug, Deserialize)]
pub struct LoginParams {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Deserialize)]
pub struct PidParams {
    pub pid: i32,
}

#[derive(Debug, Deserialize)]
pub struct AdjustPriorityParams {
    pub pid: i32,
    pub priority: i32,
    #[serde(default)]
    pub policy: i32,
}

#[derive(Debug, Deserialize)]
pub struct CreateGroupParams {
    pub name: String,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Deserialize)]
pub struct GroupIdParams {
    pub group_id: i32,
}

#[derive(Debug, Deserialize)]
pub struct RenameGroupParams {
    pub group_id: i32,
    pub name: String,
}

#[derive(Debug, Deserialize)]
pub struct GroupMemberParams {
    pub pid: i32,
    pub group_id: i32,
}

// --- Reply envelopes ---

/// Success reply: `command` and `status` plus command-specific fields.
pub fn success(command: &str, fields: Value) -> Value {
    let mut reply = json!({
        "command": command,
        "status": "success",
    });
    if let (Some(reply_map), Value::Object(extra)) = (reply.as_object_mut(), fields) {
        for (key, value) in extra {
            reply_map.insert(key, value);
        }
    }
    reply
}

/// Error reply with a human-readable message.
pub fn error(command: &str, message: impl Into<String>) -> Value {
    json!({
        "command": command,
        "status": "error",
        "message": message.into(),
    })
}
