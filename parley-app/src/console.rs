//! One-line terminal view: bars, status label, transcript line and flags.
//!
//! Logs go to stderr, so stdout belongs to this view. The line is redrawn in
//! place with a carriage return.

use std::io::{self, Write};
use std::time::{Duration, Instant};

use parley_core::{
    render::{render_ascii, status_label, Visualizer},
    FeedbackState, LiveClient,
};
use tokio::sync::watch;

const REDRAW: Duration = Duration::from_millis(100);

pub struct Console {
    visualizer: Visualizer,
    color: bool,
}

impl Console {
    pub fn new(color: bool) -> Self {
        Self {
            visualizer: Visualizer::new(),
            color,
        }
    }

    pub fn compose(
        &self,
        feedback: &FeedbackState,
        transcript: Option<&str>,
        now: Instant,
    ) -> String {
        let frame = self.visualizer.frame_for(feedback, now);
        let mut line = format!(
            "{}  {}",
            render_ascii(&frame, self.color),
            status_label(feedback)
        );
        if let Some(text) = transcript {
            line.push_str("  | ");
            line.push_str(text);
        }
        if feedback.muted {
            line.push_str("  [muted]");
        }
        if feedback.camera_active {
            line.push_str("  [camera]");
        }
        line
    }

    fn draw(&self, line: &str) -> io::Result<()> {
        let mut out = io::stdout().lock();
        write!(out, "\r{line}\x1b[K")?;
        out.flush()
    }
}

/// Redraw until `shutdown` flips to `true`.
pub async fn run(client: LiveClient, console: Console, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(REDRAW);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
        let transcript = client.transcript();
        let line = console.compose(&client.feedback(), transcript.as_deref(), Instant::now());
        if let Err(e) = console.draw(&line) {
            tracing::warn!("console redraw failed: {e}");
            break;
        }
    }
    let _ = console.draw("");
    println!();
}
