use std::sync::atomic::{AtomicUsize, Ordering};

use serde::Serialize;

/// Counters shared by the capture loop, the snapshot loop, the forwarder and
/// the event driver.
#[derive(Default)]
pub struct SessionDiagnostics {
    pub windows_captured: AtomicUsize,
    pub windows_speech: AtomicUsize,
    pub windows_muted: AtomicUsize,
    pub frames_captured: AtomicUsize,
    pub sends_ok: AtomicUsize,
    pub sends_dropped: AtomicUsize,
    pub sends_failed: AtomicUsize,
    pub segments_scheduled: AtomicUsize,
    pub segments_skipped: AtomicUsize,
    pub interruptions: AtomicUsize,
}

impl SessionDiagnostics {
    pub fn reset(&self) {
        for counter in self.counters() {
            counter.store(0, Ordering::Relaxed);
        }
    }

    pub fn snapshot(&self) -> DiagnosticsSnapshot {
        DiagnosticsSnapshot {
            windows_captured: self.windows_captured.load(Ordering::Relaxed),
            windows_speech: self.windows_speech.load(Ordering::Relaxed),
            windows_muted: self.windows_muted.load(Ordering::Relaxed),
            frames_captured: self.frames_captured.load(Ordering::Relaxed),
            sends_ok: self.sends_ok.load(Ordering::Relaxed),
            sends_dropped: self.sends_dropped.load(Ordering::Relaxed),
            sends_failed: self.sends_failed.load(Ordering::Relaxed),
            segments_scheduled: self.segments_scheduled.load(Ordering::Relaxed),
            segments_skipped: self.segments_skipped.load(Ordering::Relaxed),
            interruptions: self.interruptions.load(Ordering::Relaxed),
        }
    }

    pub(crate) fn bump(counter: &AtomicUsize) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn counters(&self) -> [&AtomicUsize; 10] {
        [
            &self.windows_captured,
            &self.windows_speech,
            &self.windows_muted,
            &self.frames_captured,
            &self.sends_ok,
            &self.sends_dropped,
            &self.sends_failed,
            &self.segments_scheduled,
            &self.segments_skipped,
            &self.interruptions,
        ]
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DiagnosticsSnapshot {
    pub windows_captured: usize,
    pub windows_speech: usize,
    pub windows_muted: usize,
    pub frames_captured: usize,
    pub sends_ok: usize,
    pub sends_dropped: usize,
    pub sends_failed: usize,
    pub segments_scheduled: usize,
    pub segments_skipped: usize,
    pub interruptions: usize,
}
