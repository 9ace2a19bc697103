use serde::{Deserialize, Serialize};

use crate::MediaError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioFormat {
    pub sample_rate: u32,
    pub channels: u8,
    /// Samples per captured frame.
    pub frame_samples: usize,
}

impl AudioFormat {
    pub fn frame_ms(&self) -> f64 {
        crate::pcm::duration_ms(self.frame_samples, self.sample_rate)
    }
}

/// Microphone capture settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CaptureConfig {
    pub sample_rate: u32,
    pub frame_samples: usize,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            sample_rate: 16_000,
            frame_samples: 4096,
        }
    }
}

impl CaptureConfig {
    pub fn format(&self) -> AudioFormat {
        AudioFormat {
            sample_rate: self.sample_rate,
            channels: 1,
            frame_samples: self.frame_samples,
        }
    }

    pub fn validate(&self) -> Result<(), MediaError> {
        if self.sample_rate < 8_000 || self.sample_rate > 48_000 {
            return Err(MediaError::Config(format!(
                "capture sample rate {} outside 8000..=48000",
                self.sample_rate
            )));
        }
        if self.frame_samples == 0 {
            return Err(MediaError::Config("capture frame size must be > 0".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_capture_frame_is_256ms() {
        let format = CaptureConfig::default().format();
        assert_eq!(format.channels, 1);
        assert!((format.frame_ms() - 256.0).abs() < f64::EPSILON);
    }

    #[test]
    fn rejects_zero_frame_size() {
        let config = CaptureConfig {
            frame_samples: 0,
            ..CaptureConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
