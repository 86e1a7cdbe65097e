//! Incremental decoder for `Transfer-Encoding: chunked` bodies.

use thiserror::Error;

use crate::http::find;

// Longest size or trailer line accepted before the framing is declared broken.
const MAX_LINE_LENGTH: usize = 1024;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChunkError {
    #[error("invalid chunk size line")]
    InvalidSize,
    #[error("chunk data not followed by CRLF")]
    MissingDelimiter,
    #[error("chunk trailer line too long")]
    TrailerTooLong,
    #[error("decoded body exceeds {0} bytes")]
    TooLarge(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Size,
    Data(usize),
    DataEnd,
    Trailer,
    Done,
}

/// Decoding state that survives between reads.
#[derive(Debug)]
pub struct ChunkedDecoder {
    stage: Stage,
    body: Vec<u8>,
}

impl Default for ChunkedDecoder {
    fn default() -> Self {
        Self {
            stage: Stage::Size,
            body: Vec::new(),
        }
    }
}

impl ChunkedDecoder {
    pub fn is_done(&self) -> bool {
        self.stage == Stage::Done
    }

    /// Consume as much of `input` as can be decoded right now. Bytes after the terminating empty
    /// line are left in `input`. Returns true once the whole body has been decoded.
    pub fn decode(&mut self, input: &mut Vec<u8>, limit: usize) -> Result<bool, ChunkError> {
        let mut pos = 0;
        let result = loop {
            let pending = &input[pos..];
            match self.stage {
                Stage::Size => {
                    let line_end = match find(b"\r\n", pending) {
                        Some(line_end) => line_end,
                        None if pending.len() > MAX_LINE_LENGTH => {
                            break Err(ChunkError::InvalidSize)
                        }
                        None => break Ok(false),
                    };
                    let size = match parse_size(&pending[..line_end]) {
                        Ok(size) => size,
                        Err(e) => break Err(e),
                    };
                    pos += line_end + 2;
                    if size == 0 {
                        self.stage = Stage::Trailer;
                    } else if self.body.len().saturating_add(size) > limit {
                        break Err(ChunkError::TooLarge(limit));
                    } else {
                        self.stage = Stage::Data(size);
                    }
                }
                Stage::Data(remaining) => {
                    let available = pending.len().min(remaining);
                    if available == 0 {
                        break Ok(false);
                    }
                    self.body.extend_from_slice(&pending[..available]);
                    pos += available;
                    self.stage = if available == remaining {
                        Stage::DataEnd
                    } else {
                        Stage::Data(remaining - available)
                    };
                }
                Stage::DataEnd => {
                    if pending.len() < 2 {
                        break Ok(false);
                    }
                    if !pending.starts_with(b"\r\n") {
                        break Err(ChunkError::MissingDelimiter);
                    }
                    pos += 2;
                    self.stage = Stage::Size;
                }
                Stage::Trailer => {
                    // trailer fields are skipped up to the empty line
                    let line_end = match find(b"\r\n", pending) {
                        Some(line_end) => line_end,
                        None if pending.len() > MAX_LINE_LENGTH => {
                            break Err(ChunkError::TrailerTooLong)
                        }
                        None => break Ok(false),
                    };
                    pos += line_end + 2;
                    if line_end == 0 {
                        self.stage = Stage::Done;
                    }
                }
                Stage::Done => break Ok(true),
            }
        };
        input.drain(..pos);
        result
    }

    pub fn take_body(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.body)
    }
}

/// Parse a hex chunk size, ignoring chunk extensions after `;`.
fn parse_size(line: &[u8]) -> Result<usize, ChunkError> {
    let digits = line.split(|&b| b == b';').next().unwrap_or(line);
    let digits = std::str::from_utf8(digits)
        .map_err(|_| ChunkError::InvalidSize)?
        .trim();
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(ChunkError::InvalidSize);
    }
    usize::from_str_radix(digits, 16).map_err(|_| ChunkError::InvalidSize)
}
