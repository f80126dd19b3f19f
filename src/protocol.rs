//! Protocol Definition Module
//!
//! This module defines the stream-level file transfer protocol:
//! - Fixed-width command frames identifying the operation on a stream
//! - Size frames announcing a download's length (or an error marker)
//! - The acknowledgment token that releases a bulk transfer
//! - Filename encoding and validation
//!
//! ## Protocol Overview
//!
//! Every operation runs on its own bidirectional QUIC stream. The stream
//! itself is the only framing for bulk data: end-of-stream marks the end of a
//! listing, an upload or a download.
//!
//! ```text
//! Client                                 Server
//!   |                                      |
//!   |-- "LIST\0\0\0\0\0\0" [FIN] --------->|
//!   |<------- "a.txt (12 bytes)\n" [FIN] --|
//!   |                                      |
//!   |-- "UP\0\0..." name bytes [FIN] ----->|
//!   |                                      |
//!   |-- "DOWN\0\0..." name --------------->|
//!   |<------------ "12              " -----|   (20 bytes)
//!   |-- "READY" [FIN] -------------------->|
//!   |<------------------ file bytes [FIN] -|
//! ```
//!
//! ## Filename Field
//!
//! The filename is written as a 2-byte big-endian length followed by the
//! UTF-8 name. [`FilenameFraming::Raw`] writes the bare name for legacy
//! peers, which then have to guess where the name ends.

use std::fmt;
use std::io;
use std::str::FromStr;

use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Width of a command frame in bytes
pub const COMMAND_FRAME_LEN: usize = 10;

/// Width of a size frame in bytes
pub const SIZE_FRAME_LEN: usize = 20;

/// Marker carried by a size frame when the requested file is unavailable
pub const ERROR_MARKER: &str = "ERROR";

/// Token a downloader sends once it is ready to receive content
pub const ACK_TOKEN: &[u8; 5] = b"READY";

/// Longest filename accepted on the wire (bytes)
pub const MAX_FILENAME_LEN: usize = 255;

/// Chunk size for file transfers (64 KB)
pub const CHUNK_SIZE: usize = 64 * 1024;

/// Default application protocol identifier negotiated via ALPN
pub const DEFAULT_ALPN: &str = "quic-example";

/// Application error code a responder resets a stream with when it abandons a request
pub const STREAM_ABORT_CODE: u32 = 1;

/// Protocol errors
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Invalid command tag: {0}")]
    InvalidCommand(String),

    #[error("Malformed frame: {0}")]
    MalformedFrame(String),

    #[error("Invalid filename: {0}")]
    InvalidFilename(String),
}

/// Operations a stream can carry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Upload,
    Download,
    List,
}

impl Command {
    /// Wire mnemonic of the command
    pub fn tag(&self) -> &'static str {
        match self {
            Command::Upload => "UP",
            Command::Download => "DOWN",
            Command::List => "LIST",
        }
    }

    /// Encode the command as its fixed-width frame
    pub fn frame(&self) -> [u8; COMMAND_FRAME_LEN] {
        let mut frame = [0u8; COMMAND_FRAME_LEN];
        let tag = self.tag().as_bytes();
        frame[..tag.len()].copy_from_slice(tag);
        frame
    }

    /// Decode a command frame received from a peer
    pub fn from_frame(frame: &[u8]) -> Result<Self, ProtocolError> {
        let end = frame.iter().position(|b| *b == 0).unwrap_or(frame.len());
        let tag = std::str::from_utf8(&frame[..end])
            .map_err(|_| ProtocolError::MalformedFrame("command tag is not ASCII".to_string()))?;
        tag.parse()
    }
}

impl FromStr for Command {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "UP" => Ok(Command::Upload),
            "DOWN" => Ok(Command::Download),
            "LIST" => Ok(Command::List),
            other => Err(ProtocolError::MalformedFrame(format!(
                "unknown command tag {:?}",
                other
            ))),
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

/// How the filename is delimited from what follows it on a stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FilenameFraming {
    /// 2-byte big-endian length, then the name
    #[default]
    LengthPrefixed,
    /// Bare name bytes with no delimiter
    Raw,
}

/// Encode an arbitrary tag into a zero-padded command frame.
///
/// Tags that are empty or do not fit in the frame are a configuration error.
pub fn encode_command(tag: &str) -> Result<[u8; COMMAND_FRAME_LEN], ProtocolError> {
    let bytes = tag.as_bytes();
    if bytes.is_empty() || bytes.len() > COMMAND_FRAME_LEN {
        return Err(ProtocolError::InvalidCommand(format!(
            "tag {:?} must be 1..={} bytes",
            tag, COMMAND_FRAME_LEN
        )));
    }

    let mut frame = [0u8; COMMAND_FRAME_LEN];
    frame[..bytes.len()].copy_from_slice(bytes);
    Ok(frame)
}

/// Decode a size frame into `(size, is_error)`.
///
/// Surrounding whitespace is ignored. A frame containing the `ERROR` marker
/// yields `(0, true)`.
pub fn decode_size(bytes: &[u8]) -> Result<(u64, bool), ProtocolError> {
    let text = String::from_utf8_lossy(bytes);
    let trimmed = text.trim_matches(|c: char| c.is_ascii_whitespace() || c == '\0');

    if trimmed.contains(ERROR_MARKER) {
        return Ok((0, true));
    }

    trimmed
        .parse::<u64>()
        .map(|size| (size, false))
        .map_err(|e| ProtocolError::MalformedFrame(format!("size frame {:?}: {}", trimmed, e)))
}

/// Encode a file size as a space-padded size frame
pub fn encode_size(size: u64) -> [u8; SIZE_FRAME_LEN] {
    // u64::MAX has 20 digits, so the number always fits
    pad_size_frame(&size.to_string())
}

/// Size frame telling the downloader the file is unavailable
pub fn encode_error_frame() -> [u8; SIZE_FRAME_LEN] {
    pad_size_frame(ERROR_MARKER)
}

fn pad_size_frame(text: &str) -> [u8; SIZE_FRAME_LEN] {
    let mut frame = [b' '; SIZE_FRAME_LEN];
    frame[..text.len()].copy_from_slice(text.as_bytes());
    frame
}

/// Encode a filename field using the given framing
pub fn encode_filename(name: &str, framing: FilenameFraming) -> Result<Vec<u8>, ProtocolError> {
    let bytes = name.as_bytes();
    if bytes.len() > MAX_FILENAME_LEN {
        return Err(ProtocolError::InvalidFilename(format!(
            "{} bytes exceeds maximum of {}",
            bytes.len(),
            MAX_FILENAME_LEN
        )));
    }

    match framing {
        FilenameFraming::LengthPrefixed => {
            let mut field = Vec::with_capacity(2 + bytes.len());
            field.extend_from_slice(&(bytes.len() as u16).to_be_bytes());
            field.extend_from_slice(bytes);
            Ok(field)
        }
        FilenameFraming::Raw => Ok(bytes.to_vec()),
    }
}

/// Read a length-prefixed filename field
pub async fn read_filename<R>(reader: &mut R) -> Result<String, ProtocolError>
where
    R: AsyncRead + Unpin,
{
    let len = reader.read_u16().await? as usize;
    if len == 0 || len > MAX_FILENAME_LEN {
        return Err(ProtocolError::InvalidFilename(format!(
            "length {} out of range",
            len
        )));
    }

    let mut name = vec![0u8; len];
    reader.read_exact(&mut name).await?;

    String::from_utf8(name)
        .map_err(|_| ProtocolError::InvalidFilename("filename is not UTF-8".to_string()))
}

/// Read one size frame.
///
/// Stops after [`SIZE_FRAME_LEN`] bytes or at end-of-stream, whichever
/// comes first, and returns what was read.
pub async fn read_size_frame<R>(reader: &mut R) -> Result<Vec<u8>, ProtocolError>
where
    R: AsyncRead + Unpin,
{
    let mut frame = vec![0u8; SIZE_FRAME_LEN];
    let mut filled = 0;

    while filled < SIZE_FRAME_LEN {
        let n = reader.read(&mut frame[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }

    frame.truncate(filled);
    Ok(frame)
}

/// Streaming SHA-256 over transferred content
pub struct StreamingHasher {
    hasher: Sha256,
    bytes_processed: u64,
}

impl StreamingHasher {
    pub fn new() -> Self {
        Self {
            hasher: Sha256::new(),
            bytes_processed: 0,
        }
    }

    pub fn update(&mut self, data: &[u8]) {
        self.hasher.update(data);
        self.bytes_processed += data.len() as u64;
    }

    pub fn finalize(self) -> String {
        hex::encode(self.hasher.finalize())
    }

    pub fn bytes_processed(&self) -> u64 {
        self.bytes_processed
    }
}

impl Default for StreamingHasher {
    fn default() -> Self {
        Self::new()
    }
}

/// Validate filename to prevent directory traversal and framing confusion
///
/// # Security
/// Names end up joined onto a storage directory on both ends, and listings
/// are newline separated, so both path tricks and control characters are
/// refused.
pub fn validate_filename(filename: &str) -> Result<String, ProtocolError> {
    if filename.is_empty() {
        return Err(ProtocolError::InvalidFilename("Empty filename".to_string()));
    }

    if filename.len() > MAX_FILENAME_LEN {
        return Err(ProtocolError::InvalidFilename(format!(
            "Filename longer than {} bytes",
            MAX_FILENAME_LEN
        )));
    }

    if filename.contains(['\n', '\r', '\0']) {
        return Err(ProtocolError::InvalidFilename(
            "Control characters not allowed".to_string(),
        ));
    }

    if filename.contains("..") {
        return Err(ProtocolError::InvalidFilename(
            "Path traversal detected".to_string(),
        ));
    }

    if filename.starts_with('/') || filename.starts_with('\\') {
        return Err(ProtocolError::InvalidFilename(
            "Absolute paths not allowed".to_string(),
        ));
    }

    let normalized = filename.replace('\\', "/");

    for component in normalized.split('/') {
        if component.is_empty() {
            return Err(ProtocolError::InvalidFilename(
                "Invalid path format".to_string(),
            ));
        }
        if component.starts_with('.') {
            return Err(ProtocolError::InvalidFilename(
                "Hidden files not allowed".to_string(),
            ));
        }
    }

    Ok(normalized)
}
