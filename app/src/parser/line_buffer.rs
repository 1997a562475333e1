/// Longest partial line kept before it is forced out as a line of its own.
const MAX_PENDING_BYTES: usize = 64 * 1024;

/// Splits a byte stream into lines.
///
/// Both `\n` and `\r` end a line, so progress-bar redraws come out as
/// separate lines; `\r\n` counts once. Bytes are held until a terminator
/// arrives, which keeps multi-byte UTF-8 sequences split across reads intact.
#[derive(Debug, Default)]
pub struct LineBuffer {
    pending: Vec<u8>,
    last_was_cr: bool,
}

impl LineBuffer {
    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        let mut lines = Vec::new();
        for &byte in bytes {
            match byte {
                b'\n' if self.last_was_cr && self.pending.is_empty() => {
                    self.last_was_cr = false;
                }
                b'\n' | b'\r' => {
                    lines.push(self.take_line());
                    self.last_was_cr = byte == b'\r';
                }
                _ => {
                    self.last_was_cr = false;
                    self.pending.push(byte);
                    if self.pending.len() >= MAX_PENDING_BYTES {
                        lines.push(self.take_prefix(char_boundary(&self.pending)));
                    }
                }
            }
        }
        lines
    }

    /// The unterminated tail, decoded lossily.
    pub fn pending(&self) -> String {
        String::from_utf8_lossy(&self.pending).into_owned()
    }

    pub fn flush(&mut self) -> Option<String> {
        self.last_was_cr = false;
        if self.pending.is_empty() {
            None
        } else {
            Some(self.take_line())
        }
    }

    fn take_line(&mut self) -> String {
        let line = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        line
    }

    /// Takes the first `len` bytes as a line and keeps the rest pending.
    fn take_prefix(&mut self, len: usize) -> String {
        let rest = self.pending.split_off(len);
        let line = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending = rest;
        line
    }
}

/// Length of `bytes` without a trailing incomplete UTF-8 sequence.
fn char_boundary(bytes: &[u8]) -> usize {
    let len = bytes.len();
    for start in (len.saturating_sub(4)..len).rev() {
        let byte = bytes[start];
        if byte & 0xC0 == 0x80 {
            continue;
        }
        let width = match byte {
            0xC0..=0xDF => 2,
            0xE0..=0xEF => 3,
            0xF0..=0xF7 => 4,
            _ => 1,
        };
        return if start > 0 && start + width > len {
            start
        } else {
            len
        };
    }
    len
}
