//! The single on-screen transcript line.
//!
//! A user line auto-clears after a quiet period; any newer line supersedes
//! the old one and restarts the timer, so only the last write's deadline is
//! ever live. Times are passed in so the logic runs on a fake clock in tests.

use std::time::{Duration, Instant};

use crate::ipc::events::TranscriptEvent;

pub const USER_PREFIX: &str = "You: ";

#[derive(Debug)]
pub struct TranscriptDisplay {
    line: Option<String>,
    deadline: Option<Instant>,
    clear_after: Duration,
    seq: u64,
}

impl TranscriptDisplay {
    pub fn new(clear_after: Duration) -> Self {
        Self {
            line: None,
            deadline: None,
            clear_after,
            seq: 0,
        }
    }

    /// Show transcribed user speech as `You: <text>`, clearing after the
    /// configured delay.
    pub fn show_user(&mut self, text: &str, now: Instant) -> TranscriptEvent {
        self.set(format!("{USER_PREFIX}{}", text.trim()), Some(now + self.clear_after))
    }

    /// Show a line that stays until replaced or cleared (status and errors).
    pub fn show_sticky(&mut self, line: impl Into<String>) -> TranscriptEvent {
        self.set(line.into(), None)
    }

    /// Clear the line if its deadline has passed.
    pub fn expire(&mut self, now: Instant) -> Option<TranscriptEvent> {
        match self.deadline {
            Some(deadline) if now >= deadline => self.clear(),
            _ => None,
        }
    }

    /// Clear immediately. `None` if nothing was shown.
    pub fn clear(&mut self) -> Option<TranscriptEvent> {
        self.deadline = None;
        self.line.take()?;
        Some(self.event())
    }

    pub fn current(&self) -> Option<&str> {
        self.line.as_deref()
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    fn set(&mut self, line: String, deadline: Option<Instant>) -> TranscriptEvent {
        self.line = Some(line);
        self.deadline = deadline;
        self.event()
    }

    fn event(&mut self) -> TranscriptEvent {
        self.seq += 1;
        TranscriptEvent {
            seq: self.seq,
            text: self.line.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FIVE: Duration = Duration::from_secs(5);

    #[test]
    fn user_line_clears_after_delay() {
        let t0 = Instant::now();
        let mut t = TranscriptDisplay::new(FIVE);
        let ev = t.show_user("hello", t0);
        assert_eq!(ev.text.as_deref(), Some("You: hello"));

        assert!(t.expire(t0 + Duration::from_millis(4_999)).is_none());
        let cleared = t.expire(t0 + FIVE).unwrap();
        assert_eq!(cleared.text, None);
        assert!(cleared.seq > ev.seq);
        assert!(t.current().is_none());
    }

    #[test]
    fn newer_line_restarts_the_timer() {
        let t0 = Instant::now();
        let mut t = TranscriptDisplay::new(FIVE);
        t.show_user("A", t0);
        t.show_user("B", t0 + Duration::from_secs(2));

        // A's deadline passes without clearing B.
        assert!(t.expire(t0 + Duration::from_secs(5)).is_none());
        assert_eq!(t.current(), Some("You: B"));
        assert!(t.expire(t0 + Duration::from_secs(7)).is_some());
    }

    #[test]
    fn sticky_lines_never_expire() {
        let t0 = Instant::now();
        let mut t = TranscriptDisplay::new(FIVE);
        t.show_user("hi", t0);
        t.show_sticky("Camera permission denied.");
        assert!(t.expire(t0 + Duration::from_secs(60)).is_none());
        assert_eq!(t.current(), Some("Camera permission denied."));
    }

    #[test]
    fn clearing_an_empty_line_emits_nothing() {
        let mut t = TranscriptDisplay::new(FIVE);
        assert!(t.clear().is_none());
    }
}
