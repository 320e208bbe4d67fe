use std::time::Duration;

use tokio::time::Instant;

use weaver_core::event::EventKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputKind {
    Stdout,
    Stderr,
}

#[derive(Default)]
struct Buffer {
    text: String,
    /// When the oldest unreleased text arrived.
    since: Option<Instant>,
}

/// Rate limiter for one node's CLI output.
///
/// Stdout and stderr share one window: at most one `cli_output` or
/// `cli_error` event leaves per window. Text arriving inside a window is
/// concatenated per kind, and the kind holding the oldest text goes first
/// when the window closes.
pub struct OutputCoalescer {
    window: Duration,
    last_emit: Option<Instant>,
    stdout: Buffer,
    stderr: Buffer,
}

impl OutputCoalescer {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            last_emit: None,
            stdout: Buffer::default(),
            stderr: Buffer::default(),
        }
    }

    /// Buffer a chunk, returning an event when the window is already open.
    pub fn push(&mut self, kind: OutputKind, text: &str, now: Instant) -> Option<EventKind> {
        let buffer = self.buffer(kind);
        buffer.text.push_str(text);
        buffer.since.get_or_insert(now);
        self.release(now)
    }

    /// Instant at which buffered text becomes due, if any is buffered.
    pub fn next_deadline(&self) -> Option<Instant> {
        if self.is_empty() {
            return None;
        }
        self.last_emit.map(|t| t + self.window)
    }

    /// Release one buffer if the window has closed.
    pub fn flush_due(&mut self, now: Instant) -> Vec<EventKind> {
        self.release(now).into_iter().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.stdout.text.is_empty() && self.stderr.text.is_empty()
    }

    fn release(&mut self, now: Instant) -> Option<EventKind> {
        if self.last_emit.is_some_and(|t| now < t + self.window) {
            return None;
        }
        let kind = match (self.stdout.since, self.stderr.since) {
            (Some(out), Some(err)) if err < out => OutputKind::Stderr,
            (Some(_), _) => OutputKind::Stdout,
            (None, Some(_)) => OutputKind::Stderr,
            (None, None) => return None,
        };
        self.last_emit = Some(now);
        let buffer = self.buffer(kind);
        buffer.since = None;
        let text = std::mem::take(&mut buffer.text);
        Some(match kind {
            OutputKind::Stdout => EventKind::CliOutput { text },
            OutputKind::Stderr => EventKind::CliError { text },
        })
    }

    fn buffer(&mut self, kind: OutputKind) -> &mut Buffer {
        match kind {
            OutputKind::Stdout => &mut self.stdout,
            OutputKind::Stderr => &mut self.stderr,
        }
    }
}
