//! Line framing for the modem's ASCII serial dialect.
//!
//! Every frame on the wire is a line of text terminated by a carriage return:
//! ```text
//! ┌─────────────────────────────┬──────┐
//! │ AT response or radio frame  │ '\r' │
//! └─────────────────────────────┴──────┘
//! ```
//! Radio frames start with `(`. A `(` arriving while bytes are already
//! buffered also closes the pending line, so one lost terminator costs at
//! most one frame.

use bytes::{Buf, Bytes, BytesMut};

/// Line terminator.
pub const FRAME_END: u8 = b'\r';

/// Marker opening a radio frame.
pub const FRAME_START: u8 = b'(';

/// Escape sequence switching the modem to command mode. Sent without terminator.
pub const COMMAND_ESCAPE: &[u8] = b"+++";

/// Appends the line terminator to `payload`.
#[must_use]
pub fn encode(payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(payload.len() + 1);
    buf.extend_from_slice(payload);
    buf.extend_from_slice(&[FRAME_END]);
    buf.freeze()
}

/// Line decoder that handles partial data.
#[derive(Debug, Default)]
pub struct LineDecoder {
    buffer: BytesMut,
    line: BytesMut,
}

impl LineDecoder {
    /// Creates a new line decoder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds data into the decoder.
    pub fn feed(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Returns the next complete line, or `None` if more data is needed.
    ///
    /// Newlines are dropped and empty lines are skipped.
    pub fn decode(&mut self) -> Option<String> {
        while self.buffer.has_remaining() {
            let byte = self.buffer[0];
            match byte {
                FRAME_END => {
                    self.buffer.advance(1);
                    // A "\r\n" pair leaves nothing behind
                    while self.buffer.first() == Some(&b'\n') {
                        self.buffer.advance(1);
                    }
                    if !self.line.is_empty() {
                        return Some(self.take_line());
                    }
                }
                FRAME_START if !self.line.is_empty() => {
                    // Leave the '(' in place; it opens the next line.
                    return Some(self.take_line());
                }
                b'\n' => self.buffer.advance(1),
                _ => {
                    self.line.extend_from_slice(&[byte]);
                    self.buffer.advance(1);
                }
            }
        }
        None
    }

    fn take_line(&mut self) -> String {
        let line = self.line.split();
        String::from_utf8_lossy(&line).into_owned()
    }

    /// Returns the number of bytes buffered, including a partial line.
    #[must_use]
    pub fn buffered(&self) -> usize {
        self.buffer.len() + self.line.len()
    }

    /// Clears the internal buffers.
    pub fn clear(&mut self) {
        self.buffer.clear();
        self.line.clear();
    }
}
