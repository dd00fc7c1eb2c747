//! Length-prefixed text framing for the control socket.
//!
//! Every message is a 4-byte big-endian length followed by that many bytes of UTF-8.
//! The daemon side runs on tokio (`Framed` + `LengthDelimitedCodec`); the operator client
//! uses plain blocking std sockets.

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use std::io::{self, Read, Write};
use tokio::net::UnixStream;
use tokio_util::codec::{Framed, LengthDelimitedCodec};

/// Upper bound on a single frame (16 MiB).
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

const PREFIX_LEN: usize = 4;

#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("connection closed by peer")]
    ConnectionClosed,
    #[error("frame too large: {size} bytes (max: {max})")]
    FrameTooLarge { size: usize, max: usize },
    #[error("frame payload is not valid UTF-8")]
    InvalidUtf8,
    #[error("I/O error: {0}")]
    Io(io::Error),
}

impl From<io::Error> for ChannelError {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::UnexpectedEof => ChannelError::ConnectionClosed,
            _ => ChannelError::Io(err),
        }
    }
}

fn check_len(size: usize) -> Result<(), ChannelError> {
    if size > MAX_FRAME_SIZE {
        return Err(ChannelError::FrameTooLarge {
            size,
            max: MAX_FRAME_SIZE,
        });
    }
    Ok(())
}

/// Write one frame. Prefix and payload go out in a single buffer.
pub fn write_message<W: Write>(w: &mut W, text: &str) -> Result<(), ChannelError> {
    let payload = text.as_bytes();
    check_len(payload.len())?;
    let mut buf = Vec::with_capacity(PREFIX_LEN + payload.len());
    buf.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    buf.extend_from_slice(payload);
    w.write_all(&buf)?;
    w.flush()?;
    Ok(())
}

/// Read one frame. `Ok(None)` means the peer closed cleanly between frames.
pub fn read_message<R: Read>(r: &mut R) -> Result<Option<String>, ChannelError> {
    let mut prefix = [0u8; PREFIX_LEN];
    let mut filled = 0;
    while filled < PREFIX_LEN {
        match r.read(&mut prefix[filled..]) {
            Ok(0) if filled == 0 => return Ok(None),
            Ok(0) => return Err(ChannelError::ConnectionClosed),
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
    let len = u32::from_be_bytes(prefix) as usize;
    check_len(len)?;
    let mut payload = vec![0u8; len];
    r.read_exact(&mut payload)?;
    String::from_utf8(payload)
        .map(Some)
        .map_err(|_| ChannelError::InvalidUtf8)
}

pub fn frame_codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .length_field_length(PREFIX_LEN)
        .big_endian()
        .max_frame_length(MAX_FRAME_SIZE)
        .new_codec()
}

/// Daemon side of one accepted control session.
pub struct ServerConn {
    framed: Framed<UnixStream, LengthDelimitedCodec>,
}

impl ServerConn {
    pub fn new(stream: UnixStream) -> Self {
        Self {
            framed: Framed::new(stream, frame_codec()),
        }
    }

    /// Next request frame, `Ok(None)` on clean close. Cancel safe.
    pub async fn recv(&mut self) -> Result<Option<String>, ChannelError> {
        match self.framed.next().await {
            None => Ok(None),
            Some(Err(e)) if e.kind() == io::ErrorKind::InvalidData => {
                Err(ChannelError::FrameTooLarge {
                    size: MAX_FRAME_SIZE + 1,
                    max: MAX_FRAME_SIZE,
                })
            }
            Some(Err(e)) => Err(e.into()),
            Some(Ok(frame)) => String::from_utf8(frame.to_vec())
                .map(Some)
                .map_err(|_| ChannelError::InvalidUtf8),
        }
    }

    pub async fn send(&mut self, text: &str) -> Result<(), ChannelError> {
        check_len(text.len())?;
        self.framed
            .send(Bytes::copy_from_slice(text.as_bytes()))
            .await?;
        Ok(())
    }
}
