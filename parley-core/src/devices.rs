//! Where the session gets its microphone, camera and speakers from.

use std::path::PathBuf;
use std::sync::Arc;

use crate::audio::{wav::WavMicrophone, MicrophoneStream};
use crate::capture::video::{FrameSource, StillImageSource};
use crate::error::{ParleyError, Result};
use crate::playback::OutputSink;

pub trait MediaDevices: Send + Sync {
    /// Create the output device context.
    fn open_output(&self, preferred_rate: u32) -> Result<Arc<dyn OutputSink>>;

    /// Open the microphone. Called on the capture thread, which also drops it.
    fn open_microphone(&self, preferred_device: Option<&str>) -> Result<Box<dyn MicrophoneStream>>;

    fn open_camera(&self, width: u32, height: u32) -> Result<Box<dyn FrameSource>>;
}

/// Host devices: cpal for audio, optionally a WAV file in place of the
/// microphone and a still image in place of the camera.
#[derive(Debug, Clone, Default)]
pub struct SystemDevices {
    pub mic_wav: Option<PathBuf>,
    pub camera_image: Option<PathBuf>,
}

impl MediaDevices for SystemDevices {
    fn open_output(&self, preferred_rate: u32) -> Result<Arc<dyn OutputSink>> {
        let output = crate::audio::output::CpalOutput::open(preferred_rate)?;
        Ok(Arc::new(output))
    }

    fn open_microphone(&self, preferred_device: Option<&str>) -> Result<Box<dyn MicrophoneStream>> {
        match &self.mic_wav {
            Some(path) => Ok(Box::new(WavMicrophone::open(path)?)),
            None => Ok(Box::new(crate::audio::CpalMicrophone::open(preferred_device)?)),
        }
    }

    fn open_camera(&self, width: u32, height: u32) -> Result<Box<dyn FrameSource>> {
        match &self.camera_image {
            Some(path) => Ok(Box::new(StillImageSource::open(path, width, height)?)),
            None => Err(ParleyError::Camera(
                "no camera source configured (use --camera-image)".into(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn camera_without_source_is_unavailable() {
        let devices = SystemDevices::default();
        let err = devices.open_camera(1920, 1080).err().unwrap();
        assert!(matches!(err, ParleyError::Camera(_)));
        assert!(!err.is_permission());
    }

    #[test]
    fn wav_microphone_is_used_when_configured() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mic.wav");
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: 16_000,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut writer = hound::WavWriter::create(&path, spec).unwrap();
        for _ in 0..160 {
            writer.write_sample(0i16).unwrap();
        }
        writer.finalize().unwrap();

        let devices = SystemDevices {
            mic_wav: Some(path),
            camera_image: None,
        };
        let mic = devices.open_microphone(Some("ignored")).unwrap();
        assert_eq!(mic.sample_rate(), 16_000);
    }
}
