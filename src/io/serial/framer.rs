// src/io/serial/framer.rs
//
// Frame extraction for controller output.
// The controller interleaves two grammars on one stream: brace-balanced JSON
// objects and human-readable blocks wrapped in a banner and a closing rule.

use serde::Serialize;

// =============================================================================
// Framing Constants
// =============================================================================

/// Banner that opens a human-readable block.
pub const BLOCK_START_MARKER: &[u8] = b"====== SENT DATA ======";
/// Rule that closes a block. Only counts when followed by optional whitespace and a newline.
pub const BLOCK_END_RULE: &[u8] = b"========================";
/// Default ceiling for unconsumed bytes held by a FrameExtractor.
pub const DEFAULT_BUFFER_CEILING: usize = 50_000;
/// Longest a block may grow without its closing rule before its banner is dropped.
pub const MAX_BLOCK_LEN: usize = 4_096;

const JSON_OPEN: u8 = b'{';
const JSON_CLOSE: u8 = b'}';
const QUOTE: u8 = b'"';
const BACKSLASH: u8 = b'\\';

// =============================================================================
// Types
// =============================================================================

/// Which grammar produced a frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FrameKind {
    Json,
    Block,
}

/// A complete, trimmed unit of device output
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Frame {
    pub kind: FrameKind,
    pub text: String,
}

impl Frame {
    pub fn as_str(&self) -> &str {
        &self.text
    }
}

/// Location of a closed frame in the buffer (`end` is exclusive)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Span {
    start: usize,
    end: usize,
}

// =============================================================================
// Internal Grammar Trait
// =============================================================================

trait Grammar {
    /// First offset where a frame of this grammar opens.
    fn find_start(&self, buf: &[u8]) -> Option<usize>;
    /// Last offset where a frame of this grammar opens.
    fn find_last_start(&self, buf: &[u8]) -> Option<usize>;
    /// Exclusive end of the frame that opens at `start`, if it has closed.
    fn find_end(&self, buf: &[u8], start: usize) -> Option<usize>;

    fn find_span(&self, buf: &[u8]) -> Option<Span> {
        let start = self.find_start(buf)?;
        let end = self.find_end(buf, start)?;
        Some(Span { start, end })
    }
}

// =============================================================================
// JSON Grammar
// =============================================================================

struct JsonGrammar;

impl Grammar for JsonGrammar {
    fn find_start(&self, buf: &[u8]) -> Option<usize> {
        buf.iter().position(|&b| b == JSON_OPEN)
    }

    fn find_last_start(&self, buf: &[u8]) -> Option<usize> {
        buf.iter().rposition(|&b| b == JSON_OPEN)
    }

    fn find_end(&self, buf: &[u8], start: usize) -> Option<usize> {
        let mut depth: i64 = 0;
        let mut in_string = false;
        let mut escaped = false;

        for (i, &byte) in buf.iter().enumerate().skip(start) {
            if escaped {
                escaped = false;
                continue;
            }
            match byte {
                BACKSLASH => escaped = true,
                QUOTE => in_string = !in_string,
                JSON_OPEN if !in_string => depth += 1,
                JSON_CLOSE if !in_string => {
                    depth -= 1;
                    if depth == 0 {
                        return Some(i + 1);
                    }
                }
                _ => {}
            }
        }

        None
    }
}

// =============================================================================
// Block Grammar
// =============================================================================

struct BlockGrammar;

impl Grammar for BlockGrammar {
    fn find_start(&self, buf: &[u8]) -> Option<usize> {
        find_subslice(buf, BLOCK_START_MARKER)
    }

    fn find_last_start(&self, buf: &[u8]) -> Option<usize> {
        rfind_subslice(buf, BLOCK_START_MARKER)
    }

    fn find_end(&self, buf: &[u8], start: usize) -> Option<usize> {
        let mut from = start + BLOCK_START_MARKER.len();

        while from < buf.len() {
            let rule_at = from + find_subslice(&buf[from..], BLOCK_END_RULE)?;
            let after_rule = rule_at + BLOCK_END_RULE.len();

            // The frame ends after the last newline of the whitespace run
            let ws_len = buf[after_rule..]
                .iter()
                .take_while(|b| b.is_ascii_whitespace())
                .count();
            if let Some(nl) = buf[after_rule..after_rule + ws_len]
                .iter()
                .rposition(|&b| b == b'\n')
            {
                return Some(after_rule + nl + 1);
            }

            from = rule_at + 1;
        }

        None
    }
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

fn rfind_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).rposition(|w| w == needle)
}

// =============================================================================
// Buffer Guard
// =============================================================================

/// Bounds the bytes a FrameExtractor may hold while no frame closes.
///
/// Over the ceiling, the buffer is cut back to the last place a frame could
/// open (block banner or `{`). If even that tail is over the ceiling, or no
/// such place exists, the buffer is cleared. Older partial data is lost.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferGuard {
    ceiling: usize,
}

impl Default for BufferGuard {
    fn default() -> Self {
        BufferGuard::new(DEFAULT_BUFFER_CEILING)
    }
}

impl BufferGuard {
    pub fn new(ceiling: usize) -> Self {
        BufferGuard {
            ceiling: ceiling.max(1),
        }
    }

    pub fn ceiling(&self) -> usize {
        self.ceiling
    }

    /// Apply the ceiling to `buffer`. Returns the number of bytes discarded.
    pub fn enforce(&self, buffer: &mut Vec<u8>) -> usize {
        if buffer.len() <= self.ceiling {
            return 0;
        }

        let before = buffer.len();
        let last_start = [
            BlockGrammar.find_last_start(buffer),
            JsonGrammar.find_last_start(buffer),
        ]
        .into_iter()
        .flatten()
        .max();

        match last_start {
            Some(pos) if before - pos <= self.ceiling => {
                buffer.drain(..pos);
            }
            _ => buffer.clear(),
        }

        before - buffer.len()
    }
}

// =============================================================================
// Public FrameExtractor
// =============================================================================

/// Stateful frame extractor for streaming controller output.
///
/// Bytes are pushed with [`FrameExtractor::feed`]; every frame that closes is
/// returned in the order its closing delimiter appears. Incomplete data stays
/// buffered for the next call.
///
/// A buffered block banner takes priority over braces: while a block is open,
/// only JSON objects that close ahead of the banner are extracted, so braces
/// inside block text are never read as JSON. The hold ends when the block
/// closes, when another banner arrives, or once the block passes
/// [`MAX_BLOCK_LEN`] bytes without its closing rule.
#[derive(Debug, Default)]
pub struct FrameExtractor {
    buffer: Vec<u8>,
    guard: BufferGuard,
}

impl FrameExtractor {
    pub fn new() -> Self {
        FrameExtractor::default()
    }

    pub fn with_guard(guard: BufferGuard) -> Self {
        FrameExtractor {
            buffer: Vec::new(),
            guard,
        }
    }

    /// Feed a chunk of raw bytes.
    /// Returns all frames completed by this chunk.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<Frame> {
        self.buffer.extend_from_slice(chunk);

        let mut frames = Vec::new();
        loop {
            if let Some((kind, span)) = self.next_span() {
                let text = String::from_utf8_lossy(&self.buffer[span.start..span.end])
                    .trim()
                    .to_string();
                // Bytes ahead of the frame belong to no frame and go with it
                self.buffer.drain(..span.end);
                if !text.is_empty() {
                    frames.push(Frame { kind, text });
                }
            } else if !self.drop_stale_block() {
                break;
            }
        }

        let discarded = self.guard.enforce(&mut self.buffer);
        if discarded > 0 {
            tlog!(
                "[framer] Buffer over {} bytes, discarded {} bytes (kept {})",
                self.guard.ceiling(),
                discarded,
                self.buffer.len()
            );
        }

        frames
    }

    /// Number of bytes waiting for a frame to close.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Drop all buffered bytes.
    pub fn clear(&mut self) {
        self.buffer.clear();
    }

    fn next_span(&self) -> Option<(FrameKind, Span)> {
        let buf = self.buffer.as_slice();
        let block_start = BlockGrammar.find_start(buf);

        let json_region = &buf[..block_start.unwrap_or(buf.len())];
        if let Some(span) = JsonGrammar.find_span(json_region) {
            return Some((FrameKind::Json, span));
        }

        // A block has to close before the next banner opens
        let start = block_start?;
        let limit = next_banner(buf, start).unwrap_or(buf.len());
        let end = BlockGrammar.find_end(&buf[..limit], start)?;
        Some((FrameKind::Block, Span { start, end }))
    }

    /// Drop an open banner that will never close: another banner followed it,
    /// or the block outgrew MAX_BLOCK_LEN. Returns whether one was dropped.
    fn drop_stale_block(&mut self) -> bool {
        let Some(start) = BlockGrammar.find_start(&self.buffer) else {
            return false;
        };
        let superseded = next_banner(&self.buffer, start).is_some();
        if !superseded && self.buffer.len() - start <= MAX_BLOCK_LEN {
            return false;
        }

        tlog!(
            "[framer] Dropping unterminated block ({} bytes buffered, {})",
            self.buffer.len() - start,
            if superseded { "new banner" } else { "over block limit" }
        );
        self.buffer.drain(..start + BLOCK_START_MARKER.len());
        true
    }
}

/// Start of the banner after the one at `start`
fn next_banner(buf: &[u8], start: usize) -> Option<usize> {
    let from = start + BLOCK_START_MARKER.len();
    BlockGrammar.find_start(&buf[from..]).map(|pos| from + pos)
}
