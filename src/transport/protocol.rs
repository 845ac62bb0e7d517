//! Worker protocol: message types and their framing.
//!
//! Each message is one JSON document behind a 4-byte big-endian length. A
//! worker connection carries exactly two frames, the job in and the outcome
//! out.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::queue::JobId;

/// Largest frame either side will accept (64 MiB).
pub const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

/// Sent from the coordinator to a freshly spawned worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessInput<J> {
    pub job_id: JobId,
    /// What to run and with which arguments.
    pub job: J,
}

/// Sent from the worker back to the coordinator, once, before it exits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessOutput<T> {
    pub job_id: JobId,
    pub outcome: Outcome<T>,
}

/// Tagged job result.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Outcome<T> {
    /// The job returned a value.
    Ok { value: T },
    /// The job returned an error or panicked.
    Error { message: String },
}

/// Failure to move one frame across a worker pipe.
#[derive(Debug, Error)]
pub enum FrameError {
    /// The pipe broke or closed before a whole frame went through
    #[error("Pipe error: {0}")]
    Io(#[from] std::io::Error),

    /// Length prefix over [`MAX_FRAME_LEN`]
    #[error("Frame of {0} bytes exceeds the {MAX_FRAME_LEN} byte limit")]
    TooLarge(usize),

    /// A whole frame arrived but is not the expected message
    #[error("Malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// Encode `message` and write it as one frame.
pub async fn write_frame<W, M>(writer: &mut W, message: &M) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin,
    M: Serialize + ?Sized,
{
    let payload = serde_json::to_vec(message)?;
    let len = u32::try_from(payload.len())
        .ok()
        .filter(|_| payload.len() <= MAX_FRAME_LEN)
        .ok_or(FrameError::TooLarge(payload.len()))?;

    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(&payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one frame and decode it as `M`.
pub async fn read_frame<R, M>(reader: &mut R) -> Result<M, FrameError>
where
    R: AsyncRead + Unpin,
    M: DeserializeOwned,
{
    let len = reader.read_u32().await? as usize;
    if len > MAX_FRAME_LEN {
        return Err(FrameError::TooLarge(len));
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    Ok(serde_json::from_slice(&payload)?)
}
