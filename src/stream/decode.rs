//! Incremental text event-stream framing.
//!
//! The transport delivers raw bytes in arbitrary chunks. The decoder buffers
//! a trailing partial line across reads, splits on newline boundaries, and
//! treats only `data:`-prefixed lines as event payloads. Every other line
//! (blank separators, comments, other field names) is ignored, which keeps
//! the framing forward-compatible.

/// Prefix introducing an event payload line.
pub const DATA_PREFIX: &str = "data:";
/// Sentinel payload denoting end of the logical event stream.
pub const END_OF_STREAM: &str = "[DONE]";

/// One decoded frame.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Frame {
    /// Raw payload text of a `data:` line; JSON parsing happens upstream.
    Payload(String),
    /// The end-of-stream sentinel was seen.
    EndOfStream,
}

/// Stateful line decoder; one instance per stream session.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: Vec<u8>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds a chunk of bytes and returns the frames completed by it.
    ///
    /// Buffering is byte-wise, so a multi-byte UTF-8 character split across
    /// chunks reassembles once its line completes. Invalid UTF-8 inside a
    /// complete line is replaced rather than failing; the decoder itself
    /// never errors.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<Frame> {
        self.buffer.extend_from_slice(chunk);

        let mut frames = Vec::new();
        while let Some(newline) = self.buffer.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=newline).collect();
            let line = String::from_utf8_lossy(&line);
            if let Some(frame) = decode_line(line.trim_end_matches(['\n', '\r'])) {
                frames.push(frame);
            }
        }
        frames
    }

    /// Number of buffered bytes awaiting a newline.
    pub fn pending_len(&self) -> usize {
        self.buffer.len()
    }
}

fn decode_line(line: &str) -> Option<Frame> {
    let payload = line.strip_prefix(DATA_PREFIX)?;
    let payload = payload.strip_prefix(' ').unwrap_or(payload);
    if payload == END_OF_STREAM {
        Some(Frame::EndOfStream)
    } else {
        Some(Frame::Payload(payload.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::{Frame, FrameDecoder};

    #[test]
    fn decodes_complete_data_lines() {
        let mut decoder = FrameDecoder::new();
        let frames = decoder.feed(b"data: {\"id\":\"1\"}\n\ndata: {\"id\":\"2\"}\n");
        assert_eq!(
            frames,
            vec![
                Frame::Payload("{\"id\":\"1\"}".to_string()),
                Frame::Payload("{\"id\":\"2\"}".to_string()),
            ]
        );
        assert_eq!(decoder.pending_len(), 0);
    }

    #[test]
    fn buffers_partial_line_across_chunks() {
        let mut decoder = FrameDecoder::new();
        assert!(decoder.feed(b"data: {\"id\":").is_empty());
        assert!(decoder.pending_len() > 0);

        let frames = decoder.feed(b"\"split\"}\n");
        assert_eq!(frames, vec![Frame::Payload("{\"id\":\"split\"}".to_string())]);
    }

    #[test]
    fn multibyte_character_split_across_chunks_stays_intact() {
        let mut decoder = FrameDecoder::new();
        let bytes = "data: {\"id\":\"caf\u{e9}\"}\n".as_bytes();
        // Splits between the two bytes of the "é" sequence.
        let mid = bytes.len() - 4;
        assert!(decoder.feed(&bytes[..mid]).is_empty());
        assert_eq!(decoder.pending_len(), mid);

        let frames = decoder.feed(&bytes[mid..]);
        assert_eq!(
            frames,
            vec![Frame::Payload("{\"id\":\"caf\u{e9}\"}".to_string())]
        );
    }

    #[test]
    fn ignores_unrecognized_lines() {
        let mut decoder = FrameDecoder::new();
        let frames = decoder.feed(b": comment\nretry: 5000\nevent: named\n\ndata: x\n");
        assert_eq!(frames, vec![Frame::Payload("x".to_string())]);
    }

    #[test]
    fn tolerates_carriage_returns() {
        let mut decoder = FrameDecoder::new();
        let frames = decoder.feed(b"data: one\r\ndata: two\r\n");
        assert_eq!(
            frames,
            vec![
                Frame::Payload("one".to_string()),
                Frame::Payload("two".to_string()),
            ]
        );
    }

    #[test]
    fn sentinel_is_never_a_payload() {
        let mut decoder = FrameDecoder::new();
        let frames = decoder.feed(b"data: [DONE]\n");
        assert_eq!(frames, vec![Frame::EndOfStream]);
    }

    #[test]
    fn prefix_without_space_is_accepted() {
        let mut decoder = FrameDecoder::new();
        let frames = decoder.feed(b"data:{\"id\":\"1\"}\n");
        assert_eq!(frames, vec![Frame::Payload("{\"id\":\"1\"}".to_string())]);
    }
}
