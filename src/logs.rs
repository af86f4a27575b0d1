//! Bounded per-app output buffers

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

/// Which stream a captured line came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogStream {
    Build,
    Stdout,
    Stderr,
}

/// One captured output line, tagged with its app and stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogLine {
    pub app: String,
    pub stream: LogStream,
    pub text: String,
}

impl fmt::Display for LogLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.stream {
            LogStream::Stdout => write!(f, "[{}] {}", self.app, self.text),
            LogStream::Stderr => write!(f, "[{} ERROR] {}", self.app, self.text),
            LogStream::Build => write!(f, "[{} build] {}", self.app, self.text),
        }
    }
}

/// FIFO ring of output lines; the oldest line is evicted once full.
#[derive(Debug)]
pub struct LogBuffer {
    capacity: usize,
    lines: VecDeque<LogLine>,
}

/// Log buffer shared between the output readers and the control API
pub type SharedLogBuffer = Arc<Mutex<LogBuffer>>;

impl LogBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            lines: VecDeque::with_capacity(capacity.min(1024)),
        }
    }

    pub fn shared(capacity: usize) -> SharedLogBuffer {
        Arc::new(Mutex::new(Self::new(capacity)))
    }

    pub fn push(&mut self, line: LogLine) {
        while self.lines.len() >= self.capacity {
            self.lines.pop_front();
        }
        self.lines.push_back(line);
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn lines(&self) -> impl Iterator<Item = &LogLine> {
        self.lines.iter()
    }

    /// Join all lines with newlines and keep the last `max_chars` characters.
    pub fn tail(&self, max_chars: usize) -> String {
        let joined = self
            .lines
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join("\n");

        let total = joined.chars().count();
        if total <= max_chars {
            return joined;
        }
        joined.chars().skip(total - max_chars).collect()
    }
}
