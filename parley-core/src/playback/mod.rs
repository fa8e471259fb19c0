//! Gapless playback scheduling.
//!
//! ## Cursor model
//!
//! ```text
//! device clock ─────────────────────────────────────────────►
//!               [ seg 1 ][ seg 2 ][ seg 3 ]
//!               ^start   ^cursor after 1   ^cursor after 3
//! ```
//!
//! Each segment starts at `max(cursor, now)` and pushes the cursor to its end,
//! so segments play in the order they were scheduled no matter how long each
//! one took to decode. `interrupt()` drops the cursor to zero so the next
//! segment starts immediately.
//!
//! The scheduler is plain data; the device it feeds is behind `OutputSink`,
//! which lets the whole thing run in tests on a hand-driven clock.

use std::collections::HashSet;

use tracing::debug;

use crate::codec::DecodedAudio;
use crate::error::Result;

/// Default tolerance of the end-of-speech heuristic, in seconds.
pub const SPEAKING_EPSILON_SECS: f64 = 0.1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SegmentId(pub u64);

/// A decoded segment placed on the device timeline.
#[derive(Debug, Clone)]
pub struct ScheduledSegment {
    pub id: SegmentId,
    /// Device time (seconds) at which the first frame plays.
    pub start_time: f64,
    pub audio: DecodedAudio,
}

/// Where a segment landed.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Placement {
    pub id: SegmentId,
    pub start_time: f64,
    pub end_time: f64,
}

/// What happens to audio already handed to the device when the remote side
/// signals an interruption.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InterruptPolicy {
    /// Only the cursor resets; queued and playing segments run to completion.
    #[default]
    ContinueQueued,
    /// Unfinished segments are cancelled at the device as well.
    DropQueued,
}

impl InterruptPolicy {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "continue" | "continue_queued" => Some(Self::ContinueQueued),
            "drop" | "drop_queued" | "truncate" => Some(Self::DropQueued),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::ContinueQueued => "continue_queued",
            Self::DropQueued => "drop_queued",
        }
    }
}

/// How "model is speaking" is derived.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionTracking {
    /// The device reports each finished segment.
    Exact,
    /// Only the cursor is known; speech is considered over once the device
    /// clock is within epsilon of the cursor. Can be off by up to epsilon.
    Heuristic,
}

/// The output device context.
///
/// Times are seconds on the device clock, which starts at zero when the
/// context is created and stands still while suspended.
pub trait OutputSink: Send + Sync {
    fn current_time(&self) -> f64;

    fn sample_rate(&self) -> u32;

    /// Queue a segment to start at `segment.start_time`. A start time in the
    /// past plays immediately.
    fn enqueue(&self, segment: ScheduledSegment) -> Result<()>;

    /// Cancel every segment that has not finished. Returns the cancelled ids.
    fn cancel_pending(&self) -> Vec<SegmentId>;

    /// Ids of segments that finished since the last call.
    fn drain_finished(&self) -> Vec<SegmentId>;

    /// Whether `drain_finished` is meaningful for this device.
    fn reports_completion(&self) -> bool;

    fn suspend(&self) -> Result<()>;

    fn resume(&self) -> Result<()>;
}

#[derive(Debug, Clone)]
pub struct PlaybackScheduler {
    cursor: f64,
    next_id: u64,
    tracking: CompletionTracking,
    epsilon: f64,
    /// Segments scheduled since the last interrupt that have not finished.
    outstanding: HashSet<SegmentId>,
    speaking: bool,
}

impl PlaybackScheduler {
    pub fn new(tracking: CompletionTracking) -> Self {
        Self {
            cursor: 0.0,
            next_id: 0,
            tracking,
            epsilon: SPEAKING_EPSILON_SECS,
            outstanding: HashSet::new(),
            speaking: false,
        }
    }

    pub fn with_epsilon(mut self, epsilon: f64) -> Self {
        self.epsilon = epsilon.max(0.0);
        self
    }

    /// Place a segment of `duration` seconds given the current device time.
    pub fn schedule_segment(&mut self, duration: f64, current_device_time: f64) -> Placement {
        let start_time = self.cursor.max(current_device_time);
        let end_time = start_time + duration.max(0.0);
        self.cursor = end_time;

        let id = SegmentId(self.next_id);
        self.next_id += 1;
        self.outstanding.insert(id);
        self.speaking = true;

        Placement {
            id,
            start_time,
            end_time,
        }
    }

    /// Reset the cursor so the next segment begins immediately.
    pub fn interrupt(&mut self) {
        debug!(cursor = self.cursor, "playback interrupted");
        self.cursor = 0.0;
        self.outstanding.clear();
        self.speaking = false;
    }

    /// Record a finished segment; returns whether the model is still speaking.
    ///
    /// Ids scheduled before the last interrupt are ignored.
    pub fn on_segment_finished(&mut self, id: SegmentId, now: f64) -> bool {
        if !self.outstanding.remove(&id) {
            return self.speaking;
        }
        self.speaking = match self.tracking {
            CompletionTracking::Exact => !self.outstanding.is_empty(),
            CompletionTracking::Heuristic => now < self.cursor - self.epsilon,
        };
        self.speaking
    }

    /// Epsilon heuristic, usable without completion reports.
    pub fn heuristic_speaking(&self, now: f64) -> bool {
        now < self.cursor - self.epsilon
    }

    pub fn is_speaking(&self) -> bool {
        self.speaking
    }

    pub fn cursor(&self) -> f64 {
        self.cursor
    }

    pub fn outstanding(&self) -> usize {
        self.outstanding.len()
    }

    pub fn tracking(&self) -> CompletionTracking {
        self.tracking
    }
}

/// Scheduler bound to a device.
pub struct Playback {
    sink: std::sync::Arc<dyn OutputSink>,
    scheduler: PlaybackScheduler,
    policy: InterruptPolicy,
}

impl Playback {
    pub fn new(sink: std::sync::Arc<dyn OutputSink>, policy: InterruptPolicy, epsilon: f64) -> Self {
        let tracking = if sink.reports_completion() {
            CompletionTracking::Exact
        } else {
            CompletionTracking::Heuristic
        };
        Self {
            sink,
            scheduler: PlaybackScheduler::new(tracking).with_epsilon(epsilon),
            policy,
        }
    }

    /// Place `audio` after everything already scheduled and hand it to the device.
    pub fn play(&mut self, audio: DecodedAudio) -> Result<Placement> {
        let now = self.sink.current_time();
        let placement = self.scheduler.schedule_segment(audio.duration_secs(), now);
        self.sink.enqueue(ScheduledSegment {
            id: placement.id,
            start_time: placement.start_time,
            audio,
        })?;
        debug!(
            segment = placement.id.0,
            start = placement.start_time,
            end = placement.end_time,
            now,
            "segment scheduled"
        );
        Ok(placement)
    }

    pub fn interrupt(&mut self) {
        self.scheduler.interrupt();
        if self.policy == InterruptPolicy::DropQueued {
            let cancelled = self.sink.cancel_pending();
            debug!(cancelled = cancelled.len(), "queued playback dropped");
        }
    }

    /// Fold device completion reports into the speaking flag.
    pub fn poll(&mut self) -> bool {
        let now = self.sink.current_time();
        if self.scheduler.tracking() == CompletionTracking::Heuristic {
            if self.scheduler.is_speaking() && !self.scheduler.heuristic_speaking(now) {
                self.scheduler.speaking = false;
                self.scheduler.outstanding.clear();
            }
            return self.scheduler.is_speaking();
        }
        for id in self.sink.drain_finished() {
            self.scheduler.on_segment_finished(id, now);
        }
        self.scheduler.is_speaking()
    }

    pub fn scheduler(&self) -> &PlaybackScheduler {
        &self.scheduler
    }

    pub fn sink(&self) -> &std::sync::Arc<dyn OutputSink> {
        &self.sink
    }
}
