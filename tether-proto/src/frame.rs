use thiserror::Error;

/// Longest record a stream peer may send before we give up on it.
pub const MAX_LINE_LEN: usize = 64 * 1024;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LineError {
    #[error("record of at least {0} bytes exceeds max {MAX_LINE_LEN}")]
    TooLong(usize),
}

/// Terminate an encoded message for a stream transport. Encoded JSON never
/// contains a raw newline, so the terminator is unambiguous.
pub fn encode_line(payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len() + 1);
    out.extend_from_slice(payload);
    out.push(b'\n');
    out
}

/// Splits a byte stream into newline-delimited records.
#[derive(Debug, Default)]
pub struct LineDecoder {
    buf: Vec<u8>,
    read_idx: usize,
}

impl LineDecoder {
    pub fn new() -> Self {
        Self {
            buf: Vec::new(),
            read_idx: 0,
        }
    }

    pub fn push(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// The next complete record without its terminator (a trailing `\r` is
    /// also stripped). Empty records are returned as empty vectors.
    pub fn next_line(&mut self) -> Result<Option<Vec<u8>>, LineError> {
        let pending = &self.buf[self.read_idx..];
        let Some(pos) = pending.iter().position(|b| *b == b'\n') else {
            if pending.len() > MAX_LINE_LEN {
                return Err(LineError::TooLong(pending.len()));
            }
            return Ok(None);
        };
        if pos > MAX_LINE_LEN {
            return Err(LineError::TooLong(pos));
        }

        let mut line = pending[..pos].to_vec();
        if line.last() == Some(&b'\r') {
            line.pop();
        }
        self.read_idx += pos + 1;

        if self.read_idx == self.buf.len() {
            self.buf.clear();
            self.read_idx = 0;
        } else if self.read_idx > 64 * 1024 {
            self.buf.drain(0..self.read_idx);
            self.read_idx = 0;
        }

        Ok(Some(line))
    }

    pub fn take_buffered_len(&self) -> usize {
        self.buf.len() - self.read_idx
    }
}
