// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Child stream capture: line scanning, ANSI extraction, and chunking.
//!
//! Bytes accumulate per stream; complete lines (CRLF normalized to LF)
//! become chunks as they arrive, partial data is flushed on a cadence or
//! when the buffer overflows.

use std::sync::OnceLock;

use regex::Regex;

/// Per-chunk payload ceiling; anything longer continues in the next chunk.
pub const MAX_CHUNK_BYTES: usize = 10_000;

/// Binary heuristic: this share of non-printable bytes in the first KiB
/// flags the chunk.
const BINARY_RATIO: f64 = 0.30;
const BINARY_PROBE_BYTES: usize = 1024;

// CSI: ESC [ parameters intermediates final-byte. The pattern is constant,
// so the parse cannot fail at runtime.
#[allow(clippy::unwrap_used)]
fn csi_regex() -> &'static Regex {
    static CSI: OnceLock<Regex> = OnceLock::new();
    CSI.get_or_init(|| Regex::new(r"\x1b\[[0-9;:?]*[ -/]*[@-~]").unwrap())
}

/// One sanitized chunk ready to frame as `terminal:output`.
#[derive(Debug, Clone, PartialEq)]
pub struct ScannedChunk {
    pub data: String,
    pub ansi_codes: Option<String>,
    pub is_blank: bool,
    pub is_binary: bool,
}

/// Whether raw bytes look like binary content.
fn looks_binary(raw: &[u8]) -> bool {
    if raw.contains(&0) {
        return true;
    }
    let probe = &raw[..raw.len().min(BINARY_PROBE_BYTES)];
    if probe.is_empty() {
        return false;
    }
    let non_printable = probe
        .iter()
        .filter(|&&b| (b < 0x20 && b != b'\t' && b != b'\n' && b != b'\r') || b == 0x7f)
        .count();
    (non_printable as f64) / (probe.len() as f64) >= BINARY_RATIO
}

/// Sanitize one raw line (no trailing newline): extract CSI sequences,
/// scrub control characters other than TAB and CR, and flag binary data.
fn sanitize(raw: &[u8]) -> (String, Option<String>, bool) {
    let is_binary = looks_binary(raw);
    let text = String::from_utf8_lossy(raw);

    let mut ansi = String::new();
    for m in csi_regex().find_iter(&text) {
        ansi.push_str(m.as_str());
    }
    let stripped = csi_regex().replace_all(&text, "");

    let clean: String = stripped
        .chars()
        .filter(|&c| c == '\t' || c == '\r' || !(c.is_control() || c == '\u{0}'))
        .collect();

    (clean, (!ansi.is_empty()).then_some(ansi), is_binary)
}

/// Split sanitized text into chunks no larger than [`MAX_CHUNK_BYTES`],
/// breaking on char boundaries. ANSI codes ride on the first piece.
fn clamp(text: String, ansi: Option<String>, is_binary: bool, newline: bool) -> Vec<ScannedChunk> {
    let is_blank = text.trim().is_empty();
    let mut pieces: Vec<String> = vec![];
    let mut current = String::new();
    for c in text.chars() {
        if current.len() + c.len_utf8() > MAX_CHUNK_BYTES {
            pieces.push(std::mem::take(&mut current));
        }
        current.push(c);
    }
    pieces.push(current);

    let last = pieces.len() - 1;
    pieces
        .into_iter()
        .enumerate()
        .map(|(i, mut data)| {
            if newline && i == last {
                data.push('\n');
            }
            ScannedChunk {
                data,
                ansi_codes: if i == 0 { ansi.clone() } else { None },
                is_blank,
                is_binary,
            }
        })
        .collect()
}

/// Per-stream scanner: buffers raw bytes, yields sanitized chunks.
pub struct LineScanner {
    buf: Vec<u8>,
    overflow: usize,
}

impl LineScanner {
    pub fn new(overflow: usize) -> Self {
        Self { buf: Vec::new(), overflow }
    }

    /// Feed raw bytes; returns chunks for every complete line, plus an
    /// overflow flush of the remainder when the buffer grows past bound.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<ScannedChunk> {
        self.buf.extend_from_slice(bytes);
        let mut out = vec![];
        while let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
            let mut line: Vec<u8> = self.buf.drain(..=pos).collect();
            line.pop(); // the \n
            if line.last() == Some(&b'\r') {
                line.pop(); // CRLF → LF
            }
            let (text, ansi, is_binary) = sanitize(&line);
            out.extend(clamp(text, ansi, is_binary, true));
        }
        if self.buf.len() >= self.overflow {
            out.extend(self.flush());
        }
        out
    }

    /// Cadence flush: emit buffered partial data without a newline.
    pub fn flush(&mut self) -> Vec<ScannedChunk> {
        if self.buf.is_empty() {
            return vec![];
        }
        let raw = std::mem::take(&mut self.buf);
        let (text, ansi, is_binary) = sanitize(&raw);
        if text.is_empty() && ansi.is_none() {
            return vec![];
        }
        clamp(text, ansi, is_binary, false)
    }

    pub fn buffered(&self) -> usize {
        self.buf.len()
    }
}

#[cfg(test)]
#[path = "stream_tests.rs"]
mod tests;
