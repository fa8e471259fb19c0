//! Five-bar voice visualizer.
//!
//! Each redraw maps the feedback flags to one of four modes:
//!
//! | Mode | Heights | Colour |
//! |------|---------|--------|
//! | Speaking (model) | uniform random 20–100 % | blue, glowing |
//! | Listening (user) | uniform random 15–55 % | green, glowing |
//! | Idle | `15 + 5·sin(t/500 ms + i)` | gray |
//! | Inactive | flat 10 % | dark gray |
//!
//! Model speech wins over user speech. The only state is the origin of the
//! breathing phase; a frame can always be produced.

use std::time::Instant;

use rand::Rng;

use crate::ipc::events::{FeedbackState, SessionStatus};

pub const BAR_COUNT: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rgb(pub u8, pub u8, pub u8);

impl Rgb {
    pub const SPEAKING: Rgb = Rgb(0x60, 0xA5, 0xFA);
    pub const LISTENING: Rgb = Rgb(0x34, 0xD3, 0x99);
    pub const IDLE: Rgb = Rgb(0x55, 0x55, 0x55);
    pub const INACTIVE: Rgb = Rgb(0x4B, 0x55, 0x63);

    pub fn hex(self) -> String {
        format!("#{:02X}{:02X}{:02X}", self.0, self.1, self.2)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BarMode {
    Inactive,
    Speaking,
    Listening,
    Idle,
}

impl BarMode {
    pub fn select(active: bool, model_speaking: bool, user_speaking: bool) -> Self {
        match (active, model_speaking, user_speaking) {
            (false, _, _) => Self::Inactive,
            (true, true, _) => Self::Speaking,
            (true, false, true) => Self::Listening,
            (true, false, false) => Self::Idle,
        }
    }

    pub fn color(self) -> Rgb {
        match self {
            Self::Inactive => Rgb::INACTIVE,
            Self::Speaking => Rgb::SPEAKING,
            Self::Listening => Rgb::LISTENING,
            Self::Idle => Rgb::IDLE,
        }
    }

    pub fn glows(self) -> bool {
        matches!(self, Self::Speaking | Self::Listening)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Bar {
    /// Height as a percentage of the available space.
    pub height_pct: f32,
    pub color: Rgb,
    pub glow: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct VisualFrame {
    pub mode: BarMode,
    pub bars: [Bar; BAR_COUNT],
}

#[derive(Debug, Clone)]
pub struct Visualizer {
    origin: Instant,
}

impl Default for Visualizer {
    fn default() -> Self {
        Self::new()
    }
}

impl Visualizer {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }

    pub fn with_origin(origin: Instant) -> Self {
        Self { origin }
    }

    pub fn frame<R: Rng + ?Sized>(
        &self,
        active: bool,
        model_speaking: bool,
        user_speaking: bool,
        now: Instant,
        rng: &mut R,
    ) -> VisualFrame {
        let mode = BarMode::select(active, model_speaking, user_speaking);
        let phase = now.saturating_duration_since(self.origin).as_secs_f64() * 1_000.0 / 500.0;
        let bars = std::array::from_fn(|i| {
            let height_pct = match mode {
                BarMode::Inactive => 10.0,
                BarMode::Speaking => 20.0 + rng.gen::<f32>() * 80.0,
                BarMode::Listening => 15.0 + rng.gen::<f32>() * 40.0,
                BarMode::Idle => (15.0 + (phase + i as f64).sin() * 5.0) as f32,
            };
            Bar {
                height_pct,
                color: mode.color(),
                glow: mode.glows(),
            }
        });
        VisualFrame { mode, bars }
    }

    /// Frame for a feedback snapshot, using the thread-local RNG.
    pub fn frame_for(&self, state: &FeedbackState, now: Instant) -> VisualFrame {
        self.frame(
            state.is_active(),
            state.model_speaking,
            state.user_speaking,
            now,
            &mut rand::thread_rng(),
        )
    }
}

/// Headline shown above the bars.
pub fn status_label(state: &FeedbackState) -> &'static str {
    match state.status {
        SessionStatus::Connected if state.model_speaking => "Speaking...",
        SessionStatus::Connected if state.user_speaking => "Listening...",
        SessionStatus::Connected if state.camera_active => "Watching...",
        SessionStatus::Connected => "I'm here.",
        SessionStatus::Connecting => "Establishing secure connection...",
        SessionStatus::Error => "Something went wrong. Press s to try again.",
        SessionStatus::Disconnected => "Press s to start a conversation.",
    }
}

const LEVELS: [char; 8] = ['▁', '▂', '▃', '▄', '▅', '▆', '▇', '█'];

/// Draw a frame as one line of block characters. With `ansi`, bars are
/// coloured with 24-bit escapes and glowing bars are bold.
pub fn render_ascii(frame: &VisualFrame, ansi: bool) -> String {
    let mut out = String::new();
    for (i, bar) in frame.bars.iter().enumerate() {
        if i > 0 {
            out.push(' ');
        }
        let level = ((bar.height_pct.clamp(0.0, 100.0) / 100.0) * (LEVELS.len() - 1) as f32)
            .round() as usize;
        let glyph = LEVELS[level.min(LEVELS.len() - 1)];
        if ansi {
            let Rgb(r, g, b) = bar.color;
            let bold = if bar.glow { "\x1b[1m" } else { "" };
            out.push_str(&format!("{bold}\x1b[38;2;{r};{g};{b}m{glyph}{glyph}\x1b[0m"));
        } else {
            out.push(glyph);
            out.push(glyph);
        }
    }
    out
}
