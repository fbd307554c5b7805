//! Mesh framing: little-endian length + crc32c header ahead of each
//! CBOR envelope.

use std::io::{Read, Write};

use crc32c::crc32c;
use thiserror::Error;

pub const FRAME_HEADER_LEN: usize = 8;

/// Upper bound on one framed message. Sync responses carry full value
/// payloads, so this is sized generously.
pub const MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("frame length invalid: {reason}")]
    LengthInvalid { reason: &'static str },
    #[error("frame too large: max {max_bytes} got {got_bytes}")]
    TooLarge { max_bytes: usize, got_bytes: usize },
    #[error("frame crc mismatch: expected {expected} got {got}")]
    CrcMismatch { expected: u32, got: u32 },
}

pub struct FrameReader<R> {
    reader: R,
    max_bytes: usize,
}

impl<R: Read> FrameReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            max_bytes: MAX_FRAME_BYTES,
        }
    }

    /// Read one frame body. `Ok(None)` is a clean end of stream.
    pub fn read_next(&mut self) -> Result<Option<Vec<u8>>, FrameError> {
        let mut header = [0u8; FRAME_HEADER_LEN];
        let mut read = 0usize;
        while read < header.len() {
            let n = self.reader.read(&mut header[read..])?;
            if n == 0 {
                if read == 0 {
                    return Ok(None);
                }
                return Err(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "frame header truncated",
                )
                .into());
            }
            read += n;
        }

        let length = u32::from_le_bytes([header[0], header[1], header[2], header[3]]) as usize;
        if length == 0 {
            return Err(FrameError::LengthInvalid {
                reason: "frame length cannot be zero",
            });
        }
        if length > self.max_bytes {
            return Err(FrameError::TooLarge {
                max_bytes: self.max_bytes,
                got_bytes: length,
            });
        }
        let expected_crc = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);

        let mut body = vec![0u8; length];
        let mut filled = 0usize;
        while filled < length {
            let n = self.reader.read(&mut body[filled..])?;
            if n == 0 {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "frame body truncated",
                )
                .into());
            }
            filled += n;
        }

        let got_crc = crc32c(&body);
        if got_crc != expected_crc {
            return Err(FrameError::CrcMismatch {
                expected: expected_crc,
                got: got_crc,
            });
        }

        Ok(Some(body))
    }
}

pub struct FrameWriter<W> {
    writer: W,
    max_bytes: usize,
}

impl<W: Write> FrameWriter<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer,
            max_bytes: MAX_FRAME_BYTES,
        }
    }

    pub fn write_frame(&mut self, payload: &[u8]) -> Result<(), FrameError> {
        let frame = encode_frame(payload, self.max_bytes)?;
        self.writer.write_all(&frame)?;
        self.writer.flush()?;
        Ok(())
    }
}

pub fn encode_frame(payload: &[u8], max_bytes: usize) -> Result<Vec<u8>, FrameError> {
    if payload.len() > max_bytes {
        return Err(FrameError::TooLarge {
            max_bytes,
            got_bytes: payload.len(),
        });
    }
    let length = u32::try_from(payload.len()).map_err(|_| FrameError::LengthInvalid {
        reason: "frame length exceeds u32",
    })?;

    let mut buf = Vec::with_capacity(FRAME_HEADER_LEN + payload.len());
    buf.extend_from_slice(&length.to_le_bytes());
    buf.extend_from_slice(&crc32c(payload).to_le_bytes());
    buf.extend_from_slice(payload);
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn roundtrip_validates_crc() {
        let frame = encode_frame(b"publication", MAX_FRAME_BYTES).unwrap();
        let mut reader = FrameReader::new(Cursor::new(frame));
        assert_eq!(reader.read_next().unwrap().unwrap(), b"publication");
        assert!(reader.read_next().unwrap().is_none());
    }

    #[test]
    fn corrupt_body_is_rejected() {
        let mut frame = encode_frame(b"payload", MAX_FRAME_BYTES).unwrap();
        let last = frame.len() - 1;
        frame[last] ^= 0xff;
        let mut reader = FrameReader::new(Cursor::new(frame));
        assert!(matches!(
            reader.read_next(),
            Err(FrameError::CrcMismatch { .. })
        ));
    }

    #[test]
    fn oversize_frame_is_rejected_both_ways() {
        let payload = vec![0u8; 32];
        assert!(matches!(
            encode_frame(&payload, 16),
            Err(FrameError::TooLarge { .. })
        ));

        let frame = encode_frame(&payload, MAX_FRAME_BYTES).unwrap();
        let mut reader = FrameReader::new(Cursor::new(frame));
        reader.max_bytes = 16;
        assert!(matches!(
            reader.read_next(),
            Err(FrameError::TooLarge { .. })
        ));
    }

    #[test]
    fn truncated_header_is_io_error() {
        let frame = encode_frame(b"xy", MAX_FRAME_BYTES).unwrap();
        let mut reader = FrameReader::new(Cursor::new(frame[..4].to_vec()));
        assert!(matches!(reader.read_next(), Err(FrameError::Io(_))));
    }
}
