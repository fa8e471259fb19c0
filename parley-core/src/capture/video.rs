//! Periodic camera snapshots.
//!
//! Every `interval` the loop grabs one frame, JPEG-encodes it and submits it
//! as an `image/jpeg` realtime input. There is no delta encoding: each tick
//! sends a full still. The loop sleeps in short slices so a cleared running
//! flag is noticed within a few tens of milliseconds, and it re-checks the
//! flag after encoding so nothing is submitted once teardown has begun.

use std::path::{Path, PathBuf};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::{Duration, Instant};

use ::image::imageops::FilterType;
use tracing::{debug, info, warn};

use crate::codec::image::{jpeg_blob, RgbFrame};
use crate::error::{ParleyError, Result};
use crate::session::outbound::OutboundQueue;
use crate::session::transport::RealtimeInput;

const SLEEP_SLICE: Duration = Duration::from_millis(20);

/// A camera, or anything that can stand in for one.
pub trait FrameSource: Send {
    fn grab(&mut self) -> Result<RgbFrame>;

    /// Release the device. Further grabs fail.
    fn stop(&mut self);
}

/// A "camera" that re-reads an image file on every grab, so the file can be
/// replaced while the session runs.
pub struct StillImageSource {
    path: PathBuf,
    max_width: u32,
    max_height: u32,
    stopped: bool,
}

impl StillImageSource {
    /// Open the source, checking the file decodes. Frames larger than
    /// `max_width`×`max_height` are scaled down, keeping their aspect ratio.
    pub fn open(path: &Path, max_width: u32, max_height: u32) -> Result<Self> {
        let mut source = Self {
            path: path.to_path_buf(),
            max_width: max_width.max(1),
            max_height: max_height.max(1),
            stopped: false,
        };
        let probe = source.grab()?;
        info!(
            path = %path.display(),
            width = probe.width,
            height = probe.height,
            "still image camera opened"
        );
        Ok(source)
    }
}

impl FrameSource for StillImageSource {
    fn grab(&mut self) -> Result<RgbFrame> {
        if self.stopped {
            return Err(ParleyError::Camera("camera stopped".into()));
        }
        let img = ::image::open(&self.path).map_err(|e| match e {
            ::image::ImageError::IoError(io) => {
                ParleyError::from_device_failure("camera", io.to_string())
            }
            other => ParleyError::Camera(other.to_string()),
        })?;
        let img = if img.width() > self.max_width || img.height() > self.max_height {
            img.resize(self.max_width, self.max_height, FilterType::Triangle)
        } else {
            img
        };
        Ok(RgbFrame::from(img.to_rgb8()))
    }

    fn stop(&mut self) {
        self.stopped = true;
    }
}

pub struct SnapshotContext {
    pub source: Box<dyn FrameSource>,
    pub queue: OutboundQueue,
    pub running: Arc<AtomicBool>,
    pub interval: Duration,
    pub jpeg_quality: u8,
}

/// Run the snapshot loop until `ctx.running` clears. Releases the source on exit.
pub fn run_snapshots(mut ctx: SnapshotContext) {
    info!(interval_ms = ctx.interval.as_millis() as u64, "snapshot loop started");
    let mut sent = 0usize;

    while ctx.running.load(Ordering::Acquire) {
        let tick = Instant::now();

        match ctx
            .source
            .grab()
            .and_then(|frame| jpeg_blob(&frame, ctx.jpeg_quality))
        {
            Ok(blob) => {
                if !ctx.running.load(Ordering::Acquire) {
                    break;
                }
                let bytes = blob.data.len();
                match ctx.queue.submit(RealtimeInput::image(blob)) {
                    Ok(seq) => {
                        sent += 1;
                        debug!(seq, base64_len = bytes, "snapshot queued");
                    }
                    Err(ParleyError::NotConnected) => break,
                    Err(_) => {}
                }
            }
            Err(e) => warn!("snapshot skipped: {e}"),
        }

        while ctx.running.load(Ordering::Acquire) && tick.elapsed() < ctx.interval {
            std::thread::sleep(SLEEP_SLICE.min(ctx.interval.saturating_sub(tick.elapsed())));
        }
    }

    ctx.source.stop();
    info!(sent, "snapshot loop stopped");
}
