//! Incremental interpretation of the engine's console output.
//!
//! The engine is a third-party process that prints free text. Chunks arrive
//! unaligned, stdout and stderr interleave arbitrarily, and any marker may be
//! missing from a given run. Nothing here is ever an error: text that does
//! not match is simply ignored.

mod extract;
mod line_buffer;

pub use extract::{
    detect_load_outcome, extract_progress, extract_service_url, read_progress, LoadOutcome,
    ProgressReading, UrlPattern, DEFAULT_URL_PATTERNS,
};
pub use line_buffer::LineBuffer;

use easel_process::StreamKind;
use url::Url;

/// What one chunk of output revealed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedOutput {
    /// Lines completed by this chunk, in order.
    pub lines: Vec<String>,
    /// Latest progress fraction in `[0, 1]`.
    pub progress: Option<f64>,
    pub service_url: Option<Url>,
    pub load_outcome: Option<LoadOutcome>,
}

/// Per-stream buffering in front of the extraction functions.
///
/// URL and load markers are only matched on complete lines so a URL split
/// across reads is never reported truncated. Progress also looks at the
/// pending partial line because progress bars redraw without a newline.
///
/// Once a `Total progress:` bar has been seen in a run, unlabelled per-step
/// bars are ignored until [`reset`](Self::reset), so a finished step never
/// reads as a finished generation.
#[derive(Debug)]
pub struct OutputParser {
    stdout: LineBuffer,
    stderr: LineBuffer,
    patterns: Vec<UrlPattern>,
    labelled_seen: bool,
}

impl OutputParser {
    pub fn new(patterns: Vec<UrlPattern>) -> Self {
        Self {
            stdout: LineBuffer::default(),
            stderr: LineBuffer::default(),
            patterns,
            labelled_seen: false,
        }
    }

    pub fn feed(&mut self, stream: StreamKind, bytes: &[u8]) -> ParsedOutput {
        let buffer = match stream {
            StreamKind::Stdout => &mut self.stdout,
            StreamKind::Stderr => &mut self.stderr,
        };
        let lines = buffer.push(bytes);
        let pending = buffer.pending();

        let mut parsed = self.interpret(lines);
        if let Some(progress) = self.progress_in(&pending) {
            parsed.progress = Some(progress);
        }
        parsed
    }

    /// Emits the partial line still buffered for `stream`. Called when the
    /// process exits so the last unterminated line is not lost.
    pub fn flush(&mut self, stream: StreamKind) -> ParsedOutput {
        let line = match stream {
            StreamKind::Stdout => self.stdout.flush(),
            StreamKind::Stderr => self.stderr.flush(),
        };
        self.interpret(line.into_iter().collect())
    }

    pub fn reset(&mut self) {
        self.stdout = LineBuffer::default();
        self.stderr = LineBuffer::default();
        self.labelled_seen = false;
    }

    pub fn set_patterns(&mut self, patterns: Vec<UrlPattern>) {
        self.patterns = patterns;
    }

    fn progress_in(&mut self, text: &str) -> Option<f64> {
        let reading = read_progress(text)?;
        if reading.labelled {
            self.labelled_seen = true;
        } else if self.labelled_seen {
            return None;
        }
        Some(reading.fraction)
    }

    fn interpret(&mut self, lines: Vec<String>) -> ParsedOutput {
        if lines.is_empty() {
            return ParsedOutput::default();
        }
        let text = lines.join("\n");
        ParsedOutput {
            progress: self.progress_in(&text),
            service_url: extract_service_url(&text, &self.patterns),
            load_outcome: detect_load_outcome(&text),
            lines,
        }
    }
}

impl Default for OutputParser {
    fn default() -> Self {
        Self::new(UrlPattern::defaults())
    }
}
