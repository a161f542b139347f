//! Reply chunker: splits a reply into platform-sized messages.
//!
//! Text chunks come first, in order, followed by one message per media blob.
//! Concatenating the text chunks reproduces the input exactly; nothing is
//! trimmed or inserted at the split points.

use gemcord_core::channel::OutboundPayload;
use gemcord_core::media::MediaBlob;

/// Separators tried in order of preference. A split lands right after one.
const SEPARATORS: &[&str] = &["\n\n", "\n", ". ", "! ", "? ", " ", "\t"];

const FENCE: &str = "```";

/// Split `text` and `media` into outbound payloads of at most `max_len` characters.
pub fn chunk(text: impl Into<String>, media: Vec<MediaBlob>, max_len: usize) -> ReplyChunks {
    let text = text.into();
    let fences = fence_spans(&text);
    ReplyChunks {
        text,
        pos: 0,
        fences,
        max_len: max_len.max(1),
        media: media.into_iter(),
    }
}

/// A lazy, single-pass sequence of reply chunks.
#[derive(Debug)]
pub struct ReplyChunks {
    text: String,
    pos: usize,
    /// Byte ranges of fenced code blocks, opening fence to end of closing fence line
    fences: Vec<(usize, usize)>,
    max_len: usize,
    media: std::vec::IntoIter<MediaBlob>,
}

impl ReplyChunks {
    fn inside_fence(&self, at: usize) -> bool {
        self.fences.iter().any(|&(start, end)| start < at && at < end)
    }

    /// Byte offset where the next text chunk ends.
    fn next_split(&self) -> usize {
        let rest = &self.text[self.pos..];
        let window_len = match rest.char_indices().nth(self.max_len) {
            Some((idx, _)) => idx,
            None => return self.text.len(),
        };
        let window = &rest[..window_len];

        for sep in SEPARATORS {
            let candidate = window
                .rmatch_indices(sep)
                .map(|(i, _)| i + sep.len())
                .find(|&rel| rel > 0 && !self.inside_fence(self.pos + rel));
            if let Some(rel) = candidate {
                return self.pos + rel;
            }
        }

        let hard = self.pos + window_len;
        if !self.inside_fence(hard) {
            return hard;
        }

        // A single code block longer than the limit: break it between lines.
        match window.rfind('\n') {
            Some(i) => self.pos + i + 1,
            None => hard,
        }
    }
}

impl Iterator for ReplyChunks {
    type Item = OutboundPayload;

    fn next(&mut self) -> Option<Self::Item> {
        if self.pos < self.text.len() {
            let end = self.next_split();
            let piece = self.text[self.pos..end].to_string();
            self.pos = end;
            return Some(OutboundPayload::Text(piece));
        }
        self.media.next().map(OutboundPayload::Media)
    }
}

/// Locate fenced code blocks. An unclosed fence runs to the end of the text;
/// a fence opened and closed on one line is not a block.
fn fence_spans(text: &str) -> Vec<(usize, usize)> {
    let mut spans = Vec::new();
    let mut open: Option<usize> = None;
    let mut line_start = 0;

    for line in text.split_inclusive('\n') {
        let line_end = line_start + line.len();
        let trimmed = line.trim_start();
        if trimmed.starts_with(FENCE) {
            match open.take() {
                Some(start) => spans.push((start, line_end)),
                // Opens and closes on the same line.
                None if trimmed[FENCE.len()..].contains(FENCE) => {}
                None => open = Some(line_start),
            }
        }
        line_start = line_end;
    }

    if let Some(start) = open {
        spans.push((start, text.len()));
    }
    spans
}
