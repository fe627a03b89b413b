//! Incremental frame decoding.
//!
//! A frame is a varint length prefix followed by that many bytes of body
//! (type-id plus payload).  The decoder accepts arbitrary byte chunks and
//! yields complete frame bodies; the length prefix itself is read
//! incrementally, so a frame split at any byte boundary decodes the same.

use crate::WireError;
use crate::varint;

/// Streaming frame decoder with a receive byte-budget.
///
/// A length prefix announcing more than `budget` bytes is a protocol error;
/// the budget is the local receive-queue size, which bounds the memory one
/// peer can make us commit.
pub struct FrameDecoder {
    budget: usize,
    buf: Vec<u8>,
    pos: usize,
}

impl FrameDecoder {
    pub fn new(budget: usize) -> Self {
        FrameDecoder { budget, buf: Vec::new(), pos: 0 }
    }

    /// Append received bytes.
    pub fn extend(&mut self, chunk: &[u8]) {
        // Drop consumed bytes before growing, keeping the buffer bounded.
        if self.pos > 0 && self.pos == self.buf.len() {
            self.buf.clear();
            self.pos = 0;
        } else if self.pos > self.budget {
            self.buf.drain(..self.pos);
            self.pos = 0;
        }
        self.buf.extend_from_slice(chunk);
    }

    /// Try to produce the next complete frame body.
    ///
    /// Returns `Ok(None)` when more bytes are needed.
    pub fn next_frame(&mut self) -> Result<Option<Vec<u8>>, WireError> {
        let pending = &self.buf[self.pos..];
        let Some(prefix_len) = varint::complete_len(pending) else {
            if pending.len() >= varint::MAX_LEN {
                return Err(WireError::VarintOverflow);
            }
            return Ok(None);
        };
        let (body_len, _) = varint::get_u64(pending)?;
        let body_len = usize::try_from(body_len).map_err(|_| WireError::VarintOverflow)?;
        if body_len > self.budget {
            return Err(WireError::FrameTooLarge { len: body_len, budget: self.budget });
        }
        if pending.len() < prefix_len + body_len {
            return Ok(None);
        }
        let body = pending[prefix_len..prefix_len + body_len].to_vec();
        self.pos += prefix_len + body_len;
        Ok(Some(body))
    }
}
