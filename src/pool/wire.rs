//! Framing between the server and its worker processes.
//!
//! ```text
//! +-----+--------------+--------------+-------------+------------+
//! | tag | meta_len u32 | data_len u32 | meta (JSON) | data (raw) |
//! +-----+--------------+--------------+-------------+------------+
//! ```
//!
//! Lengths are big-endian. Request and response bytes travel untouched in
//! `data`; everything else goes through `meta`.

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::io::{self, Read, Write};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub(crate) const MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;
const HEADER_LEN: usize = 9;

#[derive(Debug, Error)]
pub(crate) enum WireError {
    #[error("worker socket: {0}")]
    Io(#[from] io::Error),

    #[error("unknown frame tag {0}")]
    UnknownTag(u8),

    #[error("frame of {0} bytes exceeds the limit")]
    TooLarge(usize),

    #[error("bad frame metadata: {0}")]
    Meta(#[from] serde_json::Error),

    #[error("expected a {expected:?} frame, got {got:?}")]
    Unexpected { expected: Tag, got: Tag },
}

impl From<WireError> for io::Error {
    fn from(err: WireError) -> Self {
        match err {
            WireError::Io(err) => err,
            other => io::Error::new(io::ErrorKind::InvalidData, other),
        }
    }
}

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Tag {
    Hello = 1,
    Ping = 2,
    Pong = 3,
    Job = 4,
    Outcome = 5,
    Chunk = 6,
    End = 7,
    Cancel = 8,
}

impl Tag {
    #[rustfmt::skip]
    const fn from_u8(value: u8) -> Result<Self, WireError> {
        Ok(match value {
            1 => Tag::Hello,
            2 => Tag::Ping,
            3 => Tag::Pong,
            4 => Tag::Job,
            5 => Tag::Outcome,
            6 => Tag::Chunk,
            7 => Tag::End,
            8 => Tag::Cancel,
            _ => return Err(WireError::UnknownTag(value)),
        })
    }
}

/// First frame a worker sends after connecting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct Hello {
    pub worker: usize,
    pub pid: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub(crate) enum JobMode {
    Batch,
    Stream,
}

/// Metadata of a [`Tag::Job`] frame; `data` holds the raw request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct JobMeta {
    pub id: u64,
    pub mode: JobMode,
    /// [`Route::key`](crate::router::Route::key) of the matched route.
    pub route: String,
    pub captures: Vec<String>,
    /// Whether the serialized response may keep the connection open.
    pub keep_alive: bool,
}

/// Metadata of a [`Tag::Cancel`] frame.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub(crate) struct CancelMeta {
    pub job: u64,
}

/// Metadata of a [`Tag::Outcome`] frame.
///
/// `Reply` and `Early` carry the serialized response in `data`. A stream job
/// answers `Streaming` and then sends chunks until [`End`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub(crate) enum Outcome {
    Reply { keep_alive: bool },
    Early { keep_alive: bool },
    Streaming,
    NotFound { message: String },
    Fault { message: String },
}

/// Metadata of a [`Tag::End`] frame.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub(crate) struct End {
    pub cancelled: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Frame {
    pub tag: Tag,
    pub meta: Vec<u8>,
    pub data: Vec<u8>,
}

impl Frame {
    /// A frame with neither metadata nor data.
    #[inline]
    pub(crate) fn bare(tag: Tag) -> Self {
        Self {
            tag,
            meta: Vec::new(),
            data: Vec::new(),
        }
    }

    #[inline]
    pub(crate) fn data(tag: Tag, data: Vec<u8>) -> Self {
        Self {
            tag,
            meta: Vec::new(),
            data,
        }
    }

    pub(crate) fn with_meta<M: Serialize>(tag: Tag, meta: &M, data: Vec<u8>) -> Result<Self, WireError> {
        Ok(Self {
            tag,
            meta: serde_json::to_vec(meta)?,
            data,
        })
    }

    #[inline]
    pub(crate) fn meta<M: DeserializeOwned>(&self) -> Result<M, WireError> {
        Ok(serde_json::from_slice(&self.meta)?)
    }

    /// Fails unless the frame carries `expected`.
    #[inline]
    pub(crate) fn expect(self, expected: Tag) -> Result<Self, WireError> {
        match self.tag == expected {
            true => Ok(self),
            false => Err(WireError::Unexpected {
                expected,
                got: self.tag,
            }),
        }
    }

    /// Fails with [`WireError::TooLarge`] when the peer would refuse the frame.
    #[inline]
    pub(crate) fn check_size(&self) -> Result<(), WireError> {
        within_limit(self.meta.len() + self.data.len())
    }

    pub(crate) fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_LEN + self.meta.len() + self.data.len());
        out.push(self.tag as u8);
        out.extend_from_slice(&(self.meta.len() as u32).to_be_bytes());
        out.extend_from_slice(&(self.data.len() as u32).to_be_bytes());
        out.extend_from_slice(&self.meta);
        out.extend_from_slice(&self.data);
        out
    }
}

#[inline]
fn decode_header(header: [u8; HEADER_LEN]) -> Result<(Tag, usize, usize), WireError> {
    let tag = Tag::from_u8(header[0])?;
    let meta_len = u32::from_be_bytes([header[1], header[2], header[3], header[4]]) as usize;
    let data_len = u32::from_be_bytes([header[5], header[6], header[7], header[8]]) as usize;

    within_limit(meta_len + data_len)?;
    Ok((tag, meta_len, data_len))
}

#[inline]
const fn within_limit(total: usize) -> Result<(), WireError> {
    match total > MAX_FRAME_SIZE {
        true => Err(WireError::TooLarge(total)),
        false => Ok(()),
    }
}

pub(crate) async fn read_frame<R>(reader: &mut R) -> Result<Frame, WireError>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0; HEADER_LEN];
    reader.read_exact(&mut header).await?;
    let (tag, meta_len, data_len) = decode_header(header)?;

    let mut meta = vec![0; meta_len];
    reader.read_exact(&mut meta).await?;
    let mut data = vec![0; data_len];
    reader.read_exact(&mut data).await?;

    Ok(Frame { tag, meta, data })
}

pub(crate) async fn write_frame<W>(writer: &mut W, frame: &Frame) -> Result<(), WireError>
where
    W: AsyncWrite + Unpin,
{
    frame.check_size()?;
    writer.write_all(&frame.encode()).await?;
    writer.flush().await?;
    Ok(())
}

pub(crate) fn read_frame_blocking<R: Read>(reader: &mut R) -> Result<Frame, WireError> {
    let mut header = [0; HEADER_LEN];
    reader.read_exact(&mut header)?;
    let (tag, meta_len, data_len) = decode_header(header)?;

    let mut meta = vec![0; meta_len];
    reader.read_exact(&mut meta)?;
    let mut data = vec![0; data_len];
    reader.read_exact(&mut data)?;

    Ok(Frame { tag, meta, data })
}

pub(crate) fn write_frame_blocking<W: Write>(writer: &mut W, frame: &Frame) -> Result<(), WireError> {
    frame.check_size()?;
    writer.write_all(&frame.encode())?;
    writer.flush()?;
    Ok(())
}
