mod ansi;

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use crate::session::SessionId;

const DEFAULT_SCROLLBACK_LINES: usize = 2000;

/// Terminal surface that receives batched output
pub trait RenderSink: Send + Sync {
    fn write(&self, id: SessionId, data: &[u8]);

    /// Forget everything held for a removed session
    fn release(&self, id: SessionId);
}

/// Plain-text scrollback for one session
#[derive(Debug, Default)]
struct Scrollback {
    lines: VecDeque<String>,
    /// Current line, not yet terminated
    partial: String,
    /// Incomplete UTF-8 sequence carried to the next write
    carry: Vec<u8>,
    /// A write ended on \r; resolved by the next character
    pending_cr: bool,
}

impl Scrollback {
    fn push_bytes(&mut self, data: &[u8], max_lines: usize) {
        let mut bytes = std::mem::take(&mut self.carry);
        bytes.extend_from_slice(data);

        let text = decode_utf8(&bytes, &mut self.carry);
        self.push_text(&ansi::strip(&text), max_lines);
    }

    fn push_text(&mut self, text: &str, max_lines: usize) {
        let mut chars = text.chars().peekable();
        while let Some(c) = chars.next() {
            if std::mem::take(&mut self.pending_cr) && c != '\n' {
                self.partial.clear();
            }
            match c {
                '\n' => {
                    let line = std::mem::take(&mut self.partial);
                    self.lines.push_back(line);
                    while self.lines.len() > max_lines {
                        self.lines.pop_front();
                    }
                }
                // bare carriage return rewinds the line; \r\n is a plain newline
                '\r' => match chars.peek().copied() {
                    Some('\n') => {}
                    Some(_) => self.partial.clear(),
                    None => self.pending_cr = true,
                },
                '\x08' => {
                    self.partial.pop();
                }
                '\t' => self.partial.push_str("    "),
                c => self.partial.push(c),
            }
        }
    }

    fn tail(&self, height: usize) -> Vec<String> {
        let mut out: Vec<String> = self
            .lines
            .iter()
            .rev()
            .take(height.saturating_sub(1))
            .rev()
            .cloned()
            .collect();
        out.push(self.partial.clone());
        out
    }
}

/// Decode as much valid UTF-8 as possible. Invalid bytes become U+FFFD; an
/// incomplete trailing sequence is moved into `carry`.
fn decode_utf8(mut bytes: &[u8], carry: &mut Vec<u8>) -> String {
    let mut out = String::with_capacity(bytes.len());
    loop {
        match std::str::from_utf8(bytes) {
            Ok(valid) => {
                out.push_str(valid);
                return out;
            }
            Err(err) => {
                let (valid, rest) = bytes.split_at(err.valid_up_to());
                out.push_str(&String::from_utf8_lossy(valid));
                match err.error_len() {
                    Some(len) => {
                        out.push(char::REPLACEMENT_CHARACTER);
                        bytes = &rest[len..];
                    }
                    None => {
                        carry.extend_from_slice(rest);
                        return out;
                    }
                }
            }
        }
    }
}

/// Rendering sink backing the TUI: one bounded scrollback per session
pub struct TerminalView {
    screens: Mutex<HashMap<SessionId, Scrollback>>,
    max_lines: usize,
}

impl TerminalView {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_SCROLLBACK_LINES)
    }

    pub fn with_capacity(max_lines: usize) -> Self {
        Self {
            screens: Mutex::new(HashMap::new()),
            max_lines: max_lines.max(1),
        }
    }

    /// Last `height` rows for a session, the unterminated line last
    pub fn tail(&self, id: SessionId, height: usize) -> Vec<String> {
        let screens = match self.screens.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        screens
            .get(&id)
            .map(|s| s.tail(height))
            .unwrap_or_default()
    }
}

impl Default for TerminalView {
    fn default() -> Self {
        Self::new()
    }
}

impl RenderSink for TerminalView {
    fn write(&self, id: SessionId, data: &[u8]) {
        let mut screens = match self.screens.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        screens
            .entry(id)
            .or_default()
            .push_bytes(data, self.max_lines);
    }

    fn release(&self, id: SessionId) {
        let mut screens = match self.screens.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        screens.remove(&id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lines_and_partial() {
        let view = TerminalView::new();
        let id = SessionId::new();
        view.write(id, b"first\r\nsecond\r\n$ ");
        assert_eq!(view.tail(id, 10), vec!["first", "second", "$ "]);
    }

    #[test]
    fn test_utf8_split_across_writes() {
        let view = TerminalView::new();
        let id = SessionId::new();
        let text = "héllo ✓\n".as_bytes();
        // split inside the three-byte check mark
        let cut = text.len() - 3;
        view.write(id, &text[..cut]);
        view.write(id, &text[cut..]);
        assert_eq!(view.tail(id, 2), vec!["héllo ✓", ""]);
    }

    #[test]
    fn test_invalid_bytes_are_replaced() {
        let mut carry = Vec::new();
        let out = decode_utf8(b"a\xffb", &mut carry);
        assert_eq!(out, "a\u{FFFD}b");
        assert!(carry.is_empty());
    }

    #[test]
    fn test_carriage_return_and_backspace() {
        let view = TerminalView::new();
        let id = SessionId::new();
        view.write(id, b"progress 10%\rprogress 99%\n");
        view.write(id, b"typo\x08\x08po");
        assert_eq!(view.tail(id, 5), vec!["progress 99%", "typo"]);
    }

    #[test]
    fn test_scrollback_is_bounded_and_released() {
        let view = TerminalView::with_capacity(3);
        let id = SessionId::new();
        for i in 0..10 {
            view.write(id, format!("line {}\n", i).as_bytes());
        }
        assert_eq!(view.tail(id, 10), vec!["line 7", "line 8", "line 9", ""]);

        view.release(id);
        assert!(view.tail(id, 10).is_empty());
    }
}
