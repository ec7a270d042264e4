//! Incremental framing codec for the helper channel.
//!
//! The helper writes a stream of JSON objects on its stdout; this codec
//! splits the byte stream back into frames without assuming reads align
//! with frame boundaries. Two framings are supported: newline-delimited
//! text and a big-endian `u32` length prefix.

use bytes::{Buf, Bytes, BytesMut};
use ofmux_config::Framing;

use crate::error::ProtocolError;

/// Upper bound on a single frame; anything larger is a protocol fault.
pub(crate) const MAX_FRAME_LENGTH: usize = 16 * 1024 * 1024;

/// Stateful frame splitter over an append-only byte buffer.
#[derive(Debug)]
pub(crate) struct FrameCodec {
    framing: Framing,
    buffer: BytesMut,
}

impl FrameCodec {
    pub(crate) fn new(framing: Framing) -> Self {
        Self {
            framing,
            buffer: BytesMut::with_capacity(8 * 1024),
        }
    }

    /// Appends raw bytes read from the helper.
    pub(crate) fn push(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Extracts the next complete frame, if one is buffered.
    ///
    /// # Errors
    ///
    /// Returns a [`ProtocolError`] when a frame exceeds
    /// [`MAX_FRAME_LENGTH`]; the stream cannot be resynchronised after
    /// that.
    pub(crate) fn next_frame(&mut self) -> Result<Option<Bytes>, ProtocolError> {
        match self.framing {
            Framing::LineDelimited => self.next_line(),
            Framing::LengthPrefixed => self.next_prefixed(),
        }
    }

    fn next_line(&mut self) -> Result<Option<Bytes>, ProtocolError> {
        loop {
            let Some(position) = self.buffer.iter().position(|byte| *byte == b'\n') else {
                if self.buffer.len() > MAX_FRAME_LENGTH {
                    return Err(ProtocolError::OversizedFrame {
                        length: self.buffer.len(),
                    });
                }
                return Ok(None);
            };
            let mut line = self.buffer.split_to(position + 1);
            line.truncate(position);
            // Tolerate carriage returns and NUL terminators around the
            // payload; some helper builds pad frames with them.
            let frame = trim_frame(line.freeze());
            if frame.is_empty() {
                continue;
            }
            return Ok(Some(frame));
        }
    }

    fn next_prefixed(&mut self) -> Result<Option<Bytes>, ProtocolError> {
        if self.buffer.len() < 4 {
            return Ok(None);
        }
        let mut length_bytes = [0u8; 4];
        length_bytes.copy_from_slice(&self.buffer[..4]);
        let length = u32::from_be_bytes(length_bytes) as usize;
        if length > MAX_FRAME_LENGTH {
            return Err(ProtocolError::OversizedFrame { length });
        }
        if self.buffer.len() < 4 + length {
            return Ok(None);
        }
        self.buffer.advance(4);
        Ok(Some(self.buffer.split_to(length).freeze()))
    }
}

/// Strips padding bytes from both ends of a frame.
fn trim_frame(frame: Bytes) -> Bytes {
    let start = frame
        .iter()
        .position(|byte| !matches!(byte, b'\0' | b'\r' | b' ' | b'\t'))
        .unwrap_or(frame.len());
    let end = frame
        .iter()
        .rposition(|byte| !matches!(byte, b'\0' | b'\r' | b' ' | b'\t'))
        .map_or(start, |position| position + 1);
    frame.slice(start..end)
}

/// Wraps an encoded JSON payload in the configured framing.
pub(crate) fn encode(framing: Framing, payload: &[u8]) -> Vec<u8> {
    match framing {
        Framing::LineDelimited => {
            let mut frame = Vec::with_capacity(payload.len() + 1);
            frame.extend_from_slice(payload);
            frame.push(b'\n');
            frame
        }
        Framing::LengthPrefixed => {
            let mut frame = Vec::with_capacity(payload.len() + 4);
            let length = u32::try_from(payload.len()).unwrap_or(u32::MAX);
            frame.extend_from_slice(&length.to_be_bytes());
            frame.extend_from_slice(payload);
            frame
        }
    }
}
