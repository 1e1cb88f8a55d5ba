//! File transfer over a [`Stream`].
//!
//! Every message is a small text header followed by raw bytes:
//!
//! ```text
//! ACTION\nfilename\nlength\n<length bytes>
//! ```
//!
//! where `ACTION` is one of `REQUEST`, `DENY` or `DATA`.  A client sends
//! `REQUEST` with an empty body; the server answers `DATA` with the file
//! contents, or `DENY` if it will not serve the file.

use std::path::{Component, Path};
use std::time::Duration;

use thiserror::Error;
use tokio::time::Instant;

use crate::error::StreamError;
use crate::stream::Stream;

/// Longest header accepted before the decoder gives up on a peer.
pub const MAX_HEADER_LEN: usize = 4096;

/// Errors from the file-transfer layer.
#[derive(Debug, Error)]
pub enum TransferError {
    #[error(transparent)]
    Stream(#[from] StreamError),

    #[error("unknown action `{0}`")]
    BadAction(String),

    #[error("bad length field `{0}`")]
    BadLength(String),

    #[error("filename is not valid UTF-8")]
    BadFilename,

    #[error("message header longer than {MAX_HEADER_LEN} bytes")]
    HeaderTooLong,

    /// The stream closed in the middle of a message.
    #[error("stream closed after {buffered} bytes of an incomplete message")]
    Incomplete { buffered: usize },

    #[error("no complete message within {0:?}")]
    TimedOut(Duration),

    #[error("server refused `{0}`")]
    Denied(String),

    #[error("expected {expected} but received {got}")]
    Unexpected { expected: Action, got: Action },

    #[error("file I/O failed: {0}")]
    Io(#[from] std::io::Error),
}

/// Message kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Request,
    Deny,
    Data,
}

impl Action {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Request => "REQUEST",
            Self::Deny => "DENY",
            Self::Data => "DATA",
        }
    }

    fn parse(tag: &[u8]) -> Result<Self, TransferError> {
        match tag {
            b"REQUEST" => Ok(Self::Request),
            b"DENY" => Ok(Self::Deny),
            b"DATA" => Ok(Self::Data),
            other => Err(TransferError::BadAction(
                String::from_utf8_lossy(other).into_owned(),
            )),
        }
    }
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One framed message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub action: Action,
    pub filename: String,
    pub data: Vec<u8>,
}

impl Message {
    pub fn request(filename: impl Into<String>) -> Self {
        Self {
            action: Action::Request,
            filename: filename.into(),
            data: Vec::new(),
        }
    }

    pub fn deny(filename: impl Into<String>) -> Self {
        Self {
            action: Action::Deny,
            filename: filename.into(),
            data: Vec::new(),
        }
    }

    pub fn data(filename: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            action: Action::Data,
            filename: filename.into(),
            data,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let header = format!("{}\n{}\n{}\n", self.action, self.filename, self.data.len());
        let mut out = Vec::with_capacity(header.len() + self.data.len());
        out.extend_from_slice(header.as_bytes());
        out.extend_from_slice(&self.data);
        out
    }
}

/// Incremental decoder: feed it whatever `Stream::recv` returns.
#[derive(Debug, Default)]
pub struct MessageDecoder {
    buf: Vec<u8>,
}

impl MessageDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Bytes buffered but not yet returned as a message.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Pop the next complete message, if one has fully arrived.
    pub fn try_decode(&mut self) -> Result<Option<Message>, TransferError> {
        let mut fields = [0usize; 3];
        let mut start = 0;
        for field in &mut fields {
            match self.buf[start..].iter().position(|&b| b == b'\n') {
                Some(i) => {
                    *field = start + i;
                    start += i + 1;
                }
                None if self.buf.len() > MAX_HEADER_LEN => {
                    return Err(TransferError::HeaderTooLong)
                }
                None => return Ok(None),
            }
        }
        let [action_end, name_end, len_end] = fields;
        let header_len = len_end + 1;

        let action = Action::parse(&self.buf[..action_end])?;
        let filename = std::str::from_utf8(&self.buf[action_end + 1..name_end])
            .map_err(|_| TransferError::BadFilename)?
            .to_owned();
        let len_field = &self.buf[name_end + 1..len_end];
        let length: usize = std::str::from_utf8(len_field)
            .ok()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| {
                TransferError::BadLength(String::from_utf8_lossy(len_field).into_owned())
            })?;

        if self.buf.len() < header_len + length {
            return Ok(None);
        }
        let data = self.buf[header_len..header_len + length].to_vec();
        self.buf.drain(..header_len + length);
        Ok(Some(Message {
            action,
            filename,
            data,
        }))
    }
}

/// Queue `message` on `stream`, waiting for buffer space as needed.
pub async fn send_message(stream: &Stream, message: &Message) -> Result<(), TransferError> {
    log::debug!(
        "[transfer] → {} {} ({} bytes)",
        message.action,
        message.filename,
        message.data.len()
    );
    stream.send_all(&message.encode()).await?;
    Ok(())
}

/// Read from `stream` until one whole message has arrived.
pub async fn recv_message(
    stream: &Stream,
    decoder: &mut MessageDecoder,
    limit: Duration,
) -> Result<Message, TransferError> {
    let deadline = Instant::now() + limit;
    loop {
        if let Some(message) = decoder.try_decode()? {
            log::debug!(
                "[transfer] ← {} {} ({} bytes)",
                message.action,
                message.filename,
                message.data.len()
            );
            return Ok(message);
        }
        let chunk = stream.recv();
        if !chunk.is_empty() {
            decoder.push(&chunk);
            continue;
        }
        if stream.state().is_finished() {
            return Err(TransferError::Incomplete {
                buffered: decoder.buffered(),
            });
        }
        if tokio::time::timeout_at(deadline, stream.readable()).await.is_err() {
            return Err(TransferError::TimedOut(limit));
        }
    }
}

/// Ask the server for `filename` and return its contents.
pub async fn fetch_file(
    stream: &Stream,
    filename: &str,
    limit: Duration,
) -> Result<Vec<u8>, TransferError> {
    send_message(stream, &Message::request(filename)).await?;
    let mut decoder = MessageDecoder::new();
    let reply = recv_message(stream, &mut decoder, limit).await?;
    match reply.action {
        Action::Data => Ok(reply.data),
        Action::Deny => Err(TransferError::Denied(reply.filename)),
        got => Err(TransferError::Unexpected {
            expected: Action::Data,
            got,
        }),
    }
}

/// What the server did with one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Served {
    Sent { filename: String, bytes: usize },
    Denied { filename: String },
}

/// Wait for one `REQUEST` and answer it from files under `root`.
///
/// Names that would escape `root` (absolute paths, `..`) and unreadable
/// files are answered with `DENY`.
pub async fn serve_request(
    stream: &Stream,
    root: &Path,
    limit: Duration,
) -> Result<Served, TransferError> {
    let mut decoder = MessageDecoder::new();
    let request = recv_message(stream, &mut decoder, limit).await?;
    if request.action != Action::Request {
        return Err(TransferError::Unexpected {
            expected: Action::Request,
            got: request.action,
        });
    }
    let filename = request.filename;

    let contents = match confined(root, &filename) {
        Some(path) => tokio::fs::read(&path).await.ok(),
        None => None,
    };
    match contents {
        Some(bytes) => {
            let sent = bytes.len();
            send_message(stream, &Message::data(filename.clone(), bytes)).await?;
            log::info!("[transfer] served {filename} ({sent} bytes)");
            Ok(Served::Sent {
                filename,
                bytes: sent,
            })
        }
        None => {
            send_message(stream, &Message::deny(filename.clone())).await?;
            log::warn!("[transfer] denied {filename}");
            Ok(Served::Denied { filename })
        }
    }
}

fn confined(root: &Path, filename: &str) -> Option<std::path::PathBuf> {
    let relative = Path::new(filename);
    let plain = relative.components().all(|c| matches!(c, Component::Normal(_)));
    (plain && !filename.is_empty()).then(|| root.join(relative))
}
