//! Checksummed length-prefixed frames shared by journal segments and
//! checkpoints.
//!
//! Layout: `len: u32 LE | crc32c(body): u32 LE | body`.

use crc::{CRC_32_ISCSI, Crc};
use std::io::{self, Read};

const CASTAGNOLI: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

pub const FRAME_HEADER_LEN: usize = 8;

/// Upper bound on a journal frame body. Writers refuse anything larger, so
/// a larger length on read can only come from damaged bytes.
pub const MAX_FRAME_LEN: usize = 256 * 1024 * 1024;

/// Upper bound on a checkpoint body: whatever the length field can hold.
pub const MAX_CHECKPOINT_LEN: usize = u32::MAX as usize;

#[derive(Debug)]
pub enum FrameError {
    /// The input ended in the middle of a frame.
    Torn,
    /// A complete frame failed validation.
    Corrupt(String),
    /// A body handed to [`encode`] is over the limit.
    TooLarge { len: usize, limit: usize },
    Io(io::Error),
}

impl std::fmt::Display for FrameError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FrameError::Torn => write!(f, "torn frame"),
            FrameError::Corrupt(msg) => write!(f, "{}", msg),
            FrameError::TooLarge { len, limit } => {
                write!(f, "frame body of {} bytes exceeds the {} byte limit", len, limit)
            }
            FrameError::Io(e) => write!(f, "{}", e),
        }
    }
}

pub fn checksum(body: &[u8]) -> u32 {
    CASTAGNOLI.checksum(body)
}

/// Frames `body`, refusing bodies that a reader with the same `limit` would
/// reject.
pub fn encode(body: &[u8], limit: usize) -> Result<Vec<u8>, FrameError> {
    let too_large = || FrameError::TooLarge {
        len: body.len(),
        limit,
    };
    if body.len() > limit {
        return Err(too_large());
    }
    let len = u32::try_from(body.len()).map_err(|_| too_large())?;

    let mut frame = Vec::with_capacity(FRAME_HEADER_LEN + body.len());
    frame.extend_from_slice(&len.to_le_bytes());
    frame.extend_from_slice(&checksum(body).to_le_bytes());
    frame.extend_from_slice(body);
    Ok(frame)
}

fn parse_header(header: &[u8; FRAME_HEADER_LEN], limit: usize) -> Result<(usize, u32), FrameError> {
    let len = u32::from_le_bytes([header[0], header[1], header[2], header[3]]) as usize;
    let expected = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);
    if len > limit {
        return Err(FrameError::Corrupt(format!("frame length {} exceeds limit", len)));
    }
    Ok((len, expected))
}

fn verify(body: &[u8], expected: u32) -> Result<(), FrameError> {
    let actual = checksum(body);
    if actual != expected {
        return Err(FrameError::Corrupt(format!(
            "checksum mismatch: stored {:#010x}, computed {:#010x}",
            expected, actual
        )));
    }
    Ok(())
}

/// Reads the next frame body. `Ok(None)` on a clean end of input.
pub fn read<R: Read + ?Sized>(reader: &mut R, limit: usize) -> Result<Option<Vec<u8>>, FrameError> {
    let mut header = [0u8; FRAME_HEADER_LEN];
    match read_fully(reader, &mut header).map_err(FrameError::Io)? {
        0 => return Ok(None),
        n if n < FRAME_HEADER_LEN => return Err(FrameError::Torn),
        _ => {}
    }

    let (len, expected) = parse_header(&header, limit)?;

    let mut body = vec![0u8; len];
    if read_fully(reader, &mut body).map_err(FrameError::Io)? < len {
        return Err(FrameError::Torn);
    }
    verify(&body, expected)?;
    Ok(Some(body))
}

/// Decodes a buffer that must hold exactly one frame. The length field is
/// checked against the buffer before anything is copied.
pub fn decode_exact(bytes: &[u8], limit: usize) -> Result<Vec<u8>, FrameError> {
    let Some((header, rest)) = bytes.split_first_chunk::<FRAME_HEADER_LEN>() else {
        return Err(FrameError::Torn);
    };
    let (len, expected) = parse_header(header, limit)?;
    if rest.len() < len {
        return Err(FrameError::Torn);
    }
    if rest.len() > len {
        return Err(FrameError::Corrupt(format!(
            "{} trailing bytes after frame",
            rest.len() - len
        )));
    }
    verify(rest, expected)?;
    Ok(rest.to_vec())
}

fn read_fully<R: Read + ?Sized>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}
