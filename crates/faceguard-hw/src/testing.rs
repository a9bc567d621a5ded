//! In-memory capture backend for exercising camera consumers without hardware.

use crate::device::{CameraError, CaptureDevice, DeviceBackend, DeviceSettings};
use crate::frame::{Frame, PixelFormat};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Scriptable in-memory camera.
#[derive(Clone, Default)]
pub struct FakeBackend {
    pub opens: Arc<AtomicUsize>,
    pub teardowns: Arc<AtomicUsize>,
    pub reads: Arc<AtomicUsize>,
    pub fail_open: Arc<AtomicBool>,
    pub fail_reads: Arc<AtomicBool>,
    /// The next N reads fail, then reads recover on their own.
    pub failing_reads: Arc<AtomicUsize>,
    /// Milliseconds every `open` blocks before answering, like a slow driver.
    pub open_delay_ms: Arc<AtomicU64>,
    sequence: Arc<AtomicU32>,
}

pub struct FakeDevice {
    backend: FakeBackend,
    settings: DeviceSettings,
}

impl DeviceBackend for FakeBackend {
    fn open(&self, settings: &DeviceSettings) -> Result<Box<dyn CaptureDevice>, CameraError> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        let delay = self.open_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            std::thread::sleep(Duration::from_millis(delay));
        }
        if self.fail_open.load(Ordering::SeqCst) {
            return Err(CameraError::DeviceNotFound(format!("fake{}", settings.index)));
        }
        Ok(Box::new(FakeDevice {
            backend: self.clone(),
            settings: settings.clone(),
        }))
    }
}

impl CaptureDevice for FakeDevice {
    fn read_frame(&mut self) -> Result<Frame, CameraError> {
        self.backend.reads.fetch_add(1, Ordering::SeqCst);
        let scripted = self
            .backend
            .failing_reads
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if scripted || self.backend.fail_reads.load(Ordering::SeqCst) {
            return Err(CameraError::CaptureFailed("scripted failure".into()));
        }
        let (w, h) = (self.settings.width, self.settings.height);
        let data = (0..w * h).map(|i| (i % w * 16) as u8).collect();
        let mut frame = Frame::new(data, w, h, PixelFormat::Gray8);
        frame.sequence = self.backend.sequence.fetch_add(1, Ordering::SeqCst);
        Ok(frame)
    }

    fn geometry(&self) -> (u32, u32, u32) {
        (self.settings.width, self.settings.height, self.settings.fps)
    }

    fn name(&self) -> &str {
        "fake camera"
    }
}

impl Drop for FakeDevice {
    fn drop(&mut self) {
        self.backend.teardowns.fetch_add(1, Ordering::SeqCst);
    }
}
