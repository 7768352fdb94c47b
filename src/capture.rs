//! Output capture for lambda steps
//!
//! Design:
//! 1. Each open lambda step gets a fresh line recorder
//! 2. A write lands in the innermost recorder only, never in ancestors
//! 3. Every write is also appended to the whole-test buffer of its stream
//! 4. On step close the recorder's lines become marker sub-steps

use std::io::{self, Write};

/// Prefix for marker steps built from stdout lines
pub const STDOUT_GLYPH: &str = "▸";
/// Prefix for marker steps built from stderr lines
pub const STDERR_GLYPH: &str = "◂";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stream {
    Stdout,
    Stderr,
}

impl Stream {
    fn index(self) -> usize {
        match self {
            Stream::Stdout => 0,
            Stream::Stderr => 1,
        }
    }

    pub fn glyph(self) -> &'static str {
        match self {
            Stream::Stdout => STDOUT_GLYPH,
            Stream::Stderr => STDERR_GLYPH,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Stream::Stdout => "stdout",
            Stream::Stderr => "stderr",
        }
    }
}

/// One completed line, in the order lines were completed across streams
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapturedLine {
    pub stream: Stream,
    pub text: String,
}

impl CapturedLine {
    /// Marker step name, or `None` for blank lines
    pub fn marker_name(&self) -> Option<String> {
        if self.text.trim().is_empty() {
            None
        } else {
            Some(format!("{} {}", self.stream.glyph(), self.text))
        }
    }
}

/// Line recorder for one open step
#[derive(Debug, Default)]
struct StepLines {
    /// Bytes of the current unterminated line, per stream
    partial: [Vec<u8>; 2],
    lines: Vec<CapturedLine>,
}

impl StepLines {
    fn push(&mut self, stream: Stream, bytes: &[u8]) {
        let mut rest = bytes;
        while let Some(pos) = rest.iter().position(|&b| b == b'\n') {
            self.partial[stream.index()].extend_from_slice(&rest[..pos]);
            self.complete(stream);
            rest = &rest[pos + 1..];
        }
        self.partial[stream.index()].extend_from_slice(rest);
    }

    fn complete(&mut self, stream: Stream) {
        let raw = std::mem::take(&mut self.partial[stream.index()]);
        let text = String::from_utf8_lossy(&raw).trim_end_matches('\r').to_string();
        self.lines.push(CapturedLine { stream, text });
    }

    fn finish(mut self) -> Vec<CapturedLine> {
        for stream in [Stream::Stdout, Stream::Stderr] {
            if !self.partial[stream.index()].is_empty() {
                self.complete(stream);
            }
        }
        self.lines
    }
}

/// Per-test capture state: whole-test buffers plus a recorder per open step
#[derive(Debug)]
pub struct OutputCapture {
    test_output: [Vec<u8>; 2],
    steps: Vec<StepLines>,
    echo: bool,
}

impl OutputCapture {
    /// `echo` forwards every write to the real console as well
    pub fn new(echo: bool) -> Self {
        Self {
            test_output: [Vec::new(), Vec::new()],
            steps: Vec::new(),
            echo,
        }
    }

    /// Start a fresh recorder for a newly opened lambda step
    pub fn begin_step(&mut self) {
        self.steps.push(StepLines::default());
    }

    /// Close the innermost recorder and return its lines in order
    pub fn end_step(&mut self) -> Vec<CapturedLine> {
        self.steps.pop().map(StepLines::finish).unwrap_or_default()
    }

    /// Number of open recorders
    pub fn depth(&self) -> usize {
        self.steps.len()
    }

    pub fn write(&mut self, stream: Stream, bytes: &[u8]) {
        self.test_output[stream.index()].extend_from_slice(bytes);
        if let Some(step) = self.steps.last_mut() {
            step.push(stream, bytes);
        }
        if self.echo {
            // Console echo is best effort
            let _ = match stream {
                Stream::Stdout => io::stdout().write_all(bytes),
                Stream::Stderr => io::stderr().write_all(bytes),
            };
        }
    }

    pub fn flush(&mut self, stream: Stream) -> io::Result<()> {
        if !self.echo {
            return Ok(());
        }
        match stream {
            Stream::Stdout => io::stdout().flush(),
            Stream::Stderr => io::stderr().flush(),
        }
    }

    /// Everything written to `stream` during the test
    pub fn test_output(&self, stream: Stream) -> String {
        String::from_utf8_lossy(&self.test_output[stream.index()]).into_owned()
    }

    pub fn writer(&mut self, stream: Stream) -> CaptureWriter<'_> {
        CaptureWriter {
            capture: self,
            stream,
        }
    }
}

/// `io::Write` sink feeding an `OutputCapture`
pub struct CaptureWriter<'a> {
    capture: &'a mut OutputCapture,
    stream: Stream,
}

impl Write for CaptureWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.capture.write(self.stream, buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.capture.flush(self.stream)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(lines: &[CapturedLine]) -> Vec<String> {
        lines.iter().filter_map(CapturedLine::marker_name).collect()
    }

    #[test]
    fn test_blank_lines_dropped_order_kept() {
        let mut cap = OutputCapture::new(false);
        cap.begin_step();
        write!(cap.writer(Stream::Stdout), "line1\n\nline2\n").unwrap();
        let lines = cap.end_step();

        assert_eq!(names(&lines), vec!["▸ line1", "▸ line2"]);
    }

    #[test]
    fn test_partial_line_flushed_on_close() {
        let mut cap = OutputCapture::new(false);
        cap.begin_step();
        cap.write(Stream::Stdout, b"validating input");
        assert_eq!(names(&cap.end_step()), vec!["▸ validating input"]);
    }

    #[test]
    fn test_line_split_across_writes() {
        let mut cap = OutputCapture::new(false);
        cap.begin_step();
        cap.write(Stream::Stdout, b"hel");
        cap.write(Stream::Stdout, b"lo\r\nwor");
        cap.write(Stream::Stdout, b"ld\n");
        assert_eq!(names(&cap.end_step()), vec!["▸ hello", "▸ world"]);
    }

    #[test]
    fn test_interleaved_streams_keep_order() {
        let mut cap = OutputCapture::new(false);
        cap.begin_step();
        cap.write(Stream::Stdout, b"one\n");
        cap.write(Stream::Stderr, b"two\n");
        cap.write(Stream::Stdout, b"three\n");
        assert_eq!(names(&cap.end_step()), vec!["▸ one", "◂ two", "▸ three"]);
    }

    #[test]
    fn test_writes_reach_innermost_step_only() {
        let mut cap = OutputCapture::new(false);
        cap.begin_step();
        cap.write(Stream::Stdout, b"outer\n");
        cap.begin_step();
        cap.write(Stream::Stdout, b"inner\n");
        let inner = cap.end_step();
        let outer = cap.end_step();

        assert_eq!(names(&inner), vec!["▸ inner"]);
        assert_eq!(names(&outer), vec!["▸ outer"]);
        assert_eq!(cap.test_output(Stream::Stdout), "outer\ninner\n");
    }

    #[test]
    fn test_test_buffer_collects_without_open_step() {
        let mut cap = OutputCapture::new(false);
        cap.write(Stream::Stderr, b"warning\n");
        assert_eq!(cap.test_output(Stream::Stderr), "warning\n");
        assert!(cap.end_step().is_empty());
    }

    #[test]
    fn test_no_truncation() {
        let mut cap = OutputCapture::new(false);
        cap.begin_step();
        let long = "x".repeat(10_000);
        cap.write(Stream::Stdout, long.as_bytes());
        let lines = cap.end_step();
        assert_eq!(lines[0].text.len(), 10_000);
    }
}
