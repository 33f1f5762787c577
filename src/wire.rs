//! Envelopes exchanged with the backend services and the framing used to
//! stream them over a byte-stream connection.
//!
//! Every envelope is written as a 4-byte big-endian payload length followed by
//! the bincode encoding of the envelope. Any number of request/response pairs
//! may follow each other on one connection.

use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::Arc;

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Error, Result};

pub type ParentId = i32;
pub type ChildId = i32;

/// Opaque correlation metadata. Copied verbatim, never interpreted.
pub type Headers = HashMap<String, String>;

/// Upper bound on a single frame, to refuse absurd lengths from a corrupt
/// stream before allocating for them.
pub const MAX_FRAME_LEN: usize = 256 * 1024 * 1024;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListParentsRequest {
    pub limit: i32,
    pub headers: Headers,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListParentsResponse {
    pub ids: Vec<ParentId>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListChildrenRequest {
    pub limit: i32,
    pub parent_ids: Vec<ParentId>,
    pub headers: Headers,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListChildrenResponse {
    pub children_by_parent: HashMap<ParentId, Vec<ChildId>>,
}

/// Ties a request envelope to the response envelope it is answered with.
pub trait Call: Serialize + DeserializeOwned + Debug + Send + Sync + 'static {
    type Response: Serialize + DeserializeOwned + Debug + Send + Sync + 'static;

    /// Name used in logs and spans.
    const NAME: &'static str;

    fn headers(&self) -> &Headers;
}

impl Call for ListParentsRequest {
    type Response = ListParentsResponse;
    const NAME: &'static str = "list_parents";

    fn headers(&self) -> &Headers {
        &self.headers
    }
}

impl Call for ListChildrenRequest {
    type Response = ListChildrenResponse;
    const NAME: &'static str = "list_children";

    fn headers(&self) -> &Headers {
        &self.headers
    }
}

/// Serializes `msg` into a complete frame, length prefix included.
pub fn encode<T: Serialize>(msg: &T) -> Result<Vec<u8>> {
    let payload = bincode::serialize(msg).map_err(|e| Error::Encode(Arc::new(e)))?;
    if payload.len() > MAX_FRAME_LEN {
        return Err(Error::Encode(Arc::new(frame_too_large(payload.len()))));
    }
    let mut frame = Vec::with_capacity(4 + payload.len());
    frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    frame.extend_from_slice(&payload);
    Ok(frame)
}

/// Decodes a frame payload (without its length prefix).
pub fn decode<T: DeserializeOwned>(payload: &[u8]) -> Result<T> {
    bincode::deserialize(payload).map_err(|e| Error::Decode(Arc::new(e)))
}

/// Writes one envelope and flushes it.
pub async fn write_frame<W, T>(writer: &mut W, msg: &T) -> Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let frame = encode(msg)?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

/// Reads one envelope.
///
/// Returns `Ok(None)` when the stream ends cleanly on a frame boundary. A
/// stream that ends inside a frame is [`Error::ConnectionClosed`].
pub async fn read_frame<R, T>(reader: &mut R) -> Result<Option<T>>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let mut len_buf = [0u8; 4];
    if reader.read(&mut len_buf[..1]).await? == 0 {
        return Ok(None);
    }
    reader.read_exact(&mut len_buf[1..]).await?;

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_LEN {
        return Err(Error::Decode(Arc::new(frame_too_large(len))));
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    decode(&payload).map(Some)
}

fn frame_too_large(len: usize) -> bincode::Error {
    Box::new(bincode::ErrorKind::Custom(format!(
        "frame of {} bytes exceeds limit of {} bytes",
        len, MAX_FRAME_LEN
    )))
}
