//! Incremental decoder for the completion gateway's SSE body
//!
//! Each `data: ` line carries a JSON object; the text fragment lives at
//! `candidates[0].content.parts[0].text`. Lines that are not `data: ` lines,
//! are not JSON or carry no text are skipped.

use serde_json::Value;

#[derive(Debug, Clone, PartialEq)]
pub enum SseItem {
    Text(String),
    Done,
}

#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed raw body bytes; returns the items completed by this chunk
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<SseItem> {
        self.buffer.extend_from_slice(bytes);
        let mut items = Vec::new();

        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            if let Some(item) = parse_line(&String::from_utf8_lossy(&line)) {
                items.push(item);
            }
        }
        items
    }

    /// Flush a trailing line without a newline
    pub fn finish(&mut self) -> Option<SseItem> {
        let rest = std::mem::take(&mut self.buffer);
        parse_line(&String::from_utf8_lossy(&rest))
    }
}

pub fn parse_line(line: &str) -> Option<SseItem> {
    let data = line.trim_end_matches(['\r', '\n']).strip_prefix("data: ")?.trim();
    if data.is_empty() {
        return None;
    }
    if data == "[DONE]" {
        return Some(SseItem::Done);
    }

    let parsed: Value = serde_json::from_str(data).ok()?;
    let text = parsed
        .get("candidates")?
        .get(0)?
        .get("content")?
        .get("parts")?
        .get(0)?
        .get("text")?
        .as_str()?;

    if text.is_empty() {
        None
    } else {
        Some(SseItem::Text(text.to_string()))
    }
}
