//! Process-wide exclusive claims on the microphone and speaker.
//!
//! A lease is released when dropped, so every exit path of a pipeline
//! (stop, error, panic unwind) hands the device back.

use std::sync::atomic::{AtomicBool, Ordering};

use crate::MediaError;

static MICROPHONE: AtomicBool = AtomicBool::new(false);
static SPEAKER: AtomicBool = AtomicBool::new(false);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceKind {
    Microphone,
    Speaker,
}

impl DeviceKind {
    fn flag(self) -> &'static AtomicBool {
        match self {
            Self::Microphone => &MICROPHONE,
            Self::Speaker => &SPEAKER,
        }
    }

    fn name(self) -> &'static str {
        match self {
            Self::Microphone => "microphone",
            Self::Speaker => "speaker",
        }
    }
}

#[derive(Debug)]
pub struct DeviceLease {
    kind: DeviceKind,
}

impl DeviceLease {
    pub fn acquire(kind: DeviceKind) -> Result<Self, MediaError> {
        kind.flag()
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| MediaError::DeviceBusy(kind.name()))?;
        tracing::debug!(device = kind.name(), "device lease acquired");
        Ok(Self { kind })
    }

    pub fn is_held(kind: DeviceKind) -> bool {
        kind.flag().load(Ordering::Acquire)
    }
}

impl Drop for DeviceLease {
    fn drop(&mut self) {
        self.kind.flag().store(false, Ordering::Release);
        tracing::debug!(device = self.kind.name(), "device lease released");
    }
}
