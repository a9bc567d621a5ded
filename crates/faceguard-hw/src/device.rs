//! Device handle abstraction shared by the real V4L2 backend and test fakes.

use crate::frame::Frame;
use serde::Serialize;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CameraError {
    #[error("device not found: {0}")]
    DeviceNotFound(String),
    #[error("capture failed: {0}")]
    CaptureFailed(String),
    #[error("device busy")]
    DeviceBusy,
    #[error("format negotiation failed: {0}")]
    FormatNegotiationFailed(String),
    #[error("streaming not supported")]
    StreamingNotSupported,
    #[error("device is not open")]
    NotOpen,
    #[error("device returned an empty frame")]
    EmptyFrame,
}

/// Requested capture configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceSettings {
    /// Camera index; `/dev/video{index}` for the V4L2 backend.
    pub index: u32,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    /// Image controls as a fraction of the driver's range (0.0–1.0).
    pub brightness: f32,
    pub contrast: f32,
    pub saturation: f32,
    /// Number of driver-side capture buffers. Kept small so reads return
    /// recent frames instead of draining a backlog.
    pub buffer_count: u32,
}

impl Default for DeviceSettings {
    fn default() -> Self {
        Self {
            index: 0,
            width: 640,
            height: 480,
            fps: 30,
            brightness: 0.5,
            contrast: 0.5,
            saturation: 0.5,
            buffer_count: 2,
        }
    }
}

/// Info about an open or discovered capture device.
#[derive(Debug, Clone, Serialize)]
pub struct DeviceInfo {
    pub index: u32,
    pub name: String,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
}

/// An opened, configured capture device.
pub trait CaptureDevice: Send {
    /// Read one frame. Blocking is bounded by the implementation.
    fn read_frame(&mut self) -> Result<Frame, CameraError>;

    /// Negotiated (width, height, fps).
    fn geometry(&self) -> (u32, u32, u32);

    fn name(&self) -> &str;
}

/// Opens capture devices. The manager owns one backend and calls it for
/// every (re)open attempt.
pub trait DeviceBackend: Send + Sync {
    fn open(&self, settings: &DeviceSettings) -> Result<Box<dyn CaptureDevice>, CameraError>;
}

/// Exclusive handle to the physical camera.
pub struct DeviceHandle {
    pub index: u32,
    pub is_open: bool,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    device: Option<Box<dyn CaptureDevice>>,
}

impl DeviceHandle {
    /// Open and configure the device described by `settings`.
    pub fn open(backend: &dyn DeviceBackend, settings: &DeviceSettings) -> Result<Self, CameraError> {
        let device = backend.open(settings)?;
        let (width, height, fps) = device.geometry();
        tracing::debug!(index = settings.index, name = device.name(), width, height, fps, "device handle opened");
        Ok(Self {
            index: settings.index,
            is_open: true,
            width,
            height,
            fps,
            device: Some(device),
        })
    }

    /// Read a frame; empty frames are reported as [`CameraError::EmptyFrame`].
    pub fn read(&mut self) -> Result<Frame, CameraError> {
        let device = match self.device.as_mut() {
            Some(d) if self.is_open => d,
            _ => return Err(CameraError::NotOpen),
        };
        let frame = device.read_frame()?;
        if frame.is_empty() {
            return Err(CameraError::EmptyFrame);
        }
        Ok(frame)
    }

    /// Close the underlying device. Safe to call more than once.
    pub fn release(&mut self) {
        if let Some(device) = self.device.take() {
            tracing::debug!(index = self.index, name = device.name(), "device handle released");
        }
        self.is_open = false;
    }

    pub fn info(&self) -> DeviceInfo {
        DeviceInfo {
            index: self.index,
            name: self.device.as_ref().map(|d| d.name().to_string()).unwrap_or_default(),
            width: self.width,
            height: self.height,
            fps: self.fps,
        }
    }
}

impl Drop for DeviceHandle {
    fn drop(&mut self) {
        self.release();
    }
}
