//! Frame decoding for the search result stream.
//!
//! The server speaks a server-sent-event dialect: frames are separated by a blank line, each
//! frame has an optional `event:` line and one or more `data:` lines.  The data of a frame is
//! either a JSON [`SearchResult`] or the sentinel `[DONE]`.
//!
//! [`FrameDecoder`] knows nothing about the transport.  Bytes go in, in whatever chunks the
//! network produced; complete frames come out.  Nothing is parsed until its frame boundary has
//! been seen, so a result split across chunks decodes exactly once.

use crate::error::{Error, Result};
use crate::types::SearchResult;

/// The data that ends a result stream.  Matched exactly against the trimmed frame data.
pub const DONE_SENTINEL: &str = "[DONE]";

/// One delimited frame, before its data is interpreted.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawFrame {
    /// Value of the `event:` line, if any.
    pub event: Option<String>,
    /// All `data:` lines, joined with `\n`.
    pub data: String,
}

/// An interpreted frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Result(SearchResult),
    Done,
}

/// Interpret a frame's data.
pub fn parse_frame(raw: &RawFrame) -> Result<Frame> {
    let data = raw.data.trim();
    if data == DONE_SENTINEL {
        return Ok(Frame::Done);
    }
    serde_json::from_str::<SearchResult>(data)
        .map(Frame::Result)
        .map_err(|e| {
            Error::serialization(
                format!("Failed to parse result frame {data:?}: {e}"),
                Some(Box::new(e)),
            )
        })
}

/// Incremental splitter from byte chunks to [`RawFrame`]s.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: Vec<u8>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one chunk and return every frame it completed.
    ///
    /// Frames whose text is not valid UTF-8 are reported as errors in place; decoding
    /// continues with the next frame.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Result<RawFrame>> {
        // Carriage returns carry no meaning in this protocol; dropping them makes `\r\n\r\n`
        // an ordinary blank-line separator even when it straddles chunks.
        self.buffer
            .extend(chunk.iter().copied().filter(|&b| b != b'\r'));

        let mut frames = Vec::new();
        while let Some(end) = find_separator(&self.buffer) {
            let rest = self.buffer.split_off(end + 2);
            let mut block = std::mem::replace(&mut self.buffer, rest);
            block.truncate(end);
            if let Some(frame) = decode_block(&block) {
                frames.push(frame);
            }
        }
        frames
    }

    /// Flush a final frame that the stream ended without terminating.
    pub fn finish(&mut self) -> Option<Result<RawFrame>> {
        let block = std::mem::take(&mut self.buffer);
        decode_block(&block)
    }

    /// Bytes buffered while waiting for a frame boundary.
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }
}

fn find_separator(buffer: &[u8]) -> Option<usize> {
    buffer.windows(2).position(|w| w == b"\n\n")
}

/// Decode one frame's bytes.  Returns `None` for frames with no data (keep-alives, comments).
fn decode_block(block: &[u8]) -> Option<Result<RawFrame>> {
    let text = match std::str::from_utf8(block) {
        Ok(text) => text,
        Err(e) => return Some(Err(Error::from(e))),
    };

    let mut frame = RawFrame::default();
    let mut data_lines: Vec<&str> = Vec::new();
    for line in text.split('\n') {
        if line.is_empty() || line.starts_with(':') {
            continue;
        }
        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        match field {
            "event" => frame.event = Some(value.to_string()),
            "data" => data_lines.push(value),
            _ => {}
        }
    }
    if data_lines.is_empty() {
        return None;
    }
    frame.data = data_lines.join("\n");
    Some(Ok(frame))
}

#[cfg(test)]
mod tests {
    use super::*;

    const RESULT: &str = r#"{"score":0.9,"user":{"_id":"u1","name":"Ada"},"description":"backend"}"#;

    fn frames(decoder: &mut FrameDecoder, chunk: &str) -> Vec<RawFrame> {
        decoder
            .push(chunk.as_bytes())
            .into_iter()
            .map(|f| f.unwrap())
            .collect()
    }

    #[test]
    fn single_frame() {
        let mut decoder = FrameDecoder::new();
        let out = frames(&mut decoder, &format!("data: {RESULT}\n\n"));
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].data, RESULT);
        assert_eq!(decoder.pending(), 0);
    }

    #[test]
    fn event_line_is_captured() {
        let mut decoder = FrameDecoder::new();
        let out = frames(&mut decoder, &format!("event:result\ndata:{RESULT}\n\n"));
        assert_eq!(out[0].event.as_deref(), Some("result"));
        assert_eq!(out[0].data, RESULT);
    }

    #[test]
    fn result_split_across_chunks() {
        let mut decoder = FrameDecoder::new();
        let text = format!("data: {RESULT}\n\n");
        let (a, b) = text.split_at(25);
        assert!(frames(&mut decoder, a).is_empty());
        let out = frames(&mut decoder, b);
        assert_eq!(out.len(), 1);
        assert!(matches!(parse_frame(&out[0]), Ok(Frame::Result(r)) if r.user.id == "u1"));
    }

    #[test]
    fn every_split_point_yields_the_same_frames() {
        let text = format!("event: result\ndata: {RESULT}\n\ndata: [DONE]\n\n");
        let bytes = text.as_bytes();
        for cut in 0..=bytes.len() {
            let mut decoder = FrameDecoder::new();
            let mut out: Vec<RawFrame> = decoder
                .push(&bytes[..cut])
                .into_iter()
                .map(|f| f.unwrap())
                .collect();
            out.extend(decoder.push(&bytes[cut..]).into_iter().map(|f| f.unwrap()));
            assert_eq!(out.len(), 2, "cut at {cut}");
            assert_eq!(out[0].data, RESULT);
            assert_eq!(parse_frame(&out[1]).unwrap(), Frame::Done);
        }
    }

    #[test]
    fn byte_at_a_time_with_crlf_and_multibyte() {
        let text = "data: {\"score\":1,\"user\":{\"_id\":\"u\",\"name\":\"Zoë\"}}\r\n\r\n";
        let mut decoder = FrameDecoder::new();
        let mut out = Vec::new();
        for b in text.as_bytes() {
            out.extend(decoder.push(std::slice::from_ref(b)));
        }
        assert_eq!(out.len(), 1);
        let frame = out.pop().unwrap().unwrap();
        match parse_frame(&frame).unwrap() {
            Frame::Result(r) => assert_eq!(r.user.name, "Zoë"),
            Frame::Done => panic!("expected a result"),
        }
    }

    #[test]
    fn comments_and_empty_frames_are_skipped() {
        let mut decoder = FrameDecoder::new();
        let out = frames(&mut decoder, ": keep-alive\n\nevent: ping\n\ndata: [DONE]\n\n");
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].data, DONE_SENTINEL);
    }

    #[test]
    fn multi_line_data_is_joined() {
        let mut decoder = FrameDecoder::new();
        let out = frames(&mut decoder, "data: {\"score\":0.5,\ndata: \"user\":{\"_id\":\"u\"}}\n\n");
        assert_eq!(out[0].data, "{\"score\":0.5,\n\"user\":{\"_id\":\"u\"}}");
        assert!(matches!(parse_frame(&out[0]), Ok(Frame::Result(_))));
    }

    #[test]
    fn sentinel_is_exact() {
        let done = RawFrame {
            event: None,
            data: " [DONE] ".to_string(),
        };
        assert_eq!(parse_frame(&done).unwrap(), Frame::Done);
        let not_done = RawFrame {
            event: None,
            data: "[DONE] and more".to_string(),
        };
        assert!(parse_frame(&not_done).is_err());
    }

    #[test]
    fn malformed_json_is_an_error() {
        let frame = RawFrame {
            event: None,
            data: "{\"score\":".to_string(),
        };
        assert!(parse_frame(&frame).is_err());
    }

    #[test]
    fn unterminated_trailing_frame_flushes() {
        let mut decoder = FrameDecoder::new();
        assert!(decoder.push(b"data: [DONE]").is_empty());
        let frame = decoder.finish().unwrap().unwrap();
        assert_eq!(frame.data, DONE_SENTINEL);
        assert!(decoder.finish().is_none());
    }

    #[test]
    fn invalid_utf8_frame_does_not_poison_the_next() {
        let mut decoder = FrameDecoder::new();
        let mut input = b"data: \xff\xfe\n\n".to_vec();
        input.extend_from_slice(b"data: [DONE]\n\n");
        let out = decoder.push(&input);
        assert_eq!(out.len(), 2);
        assert!(out[0].is_err());
        assert_eq!(out[1].as_ref().unwrap().data, DONE_SENTINEL);
    }
}
