//! V4L2 camera capture via the `v4l` crate.

use crate::device::{CameraError, CaptureDevice, DeviceBackend, DeviceInfo, DeviceSettings};
use crate::frame::{self, Frame, PixelFormat};
use std::path::Path;
use std::time::{Duration, Instant};
use v4l::buffer::Type as BufType;
use v4l::control::{Control, Value};
use v4l::io::traits::CaptureStream;
use v4l::prelude::*;
use v4l::video::capture::Parameters;
use v4l::video::Capture;
use v4l::FourCC;

const V4L2_CID_BRIGHTNESS: u32 = 0x0098_0900;
const V4L2_CID_CONTRAST: u32 = 0x0098_0901;
const V4L2_CID_SATURATION: u32 = 0x0098_0902;

/// Upper bound on a single buffer dequeue.
const DEQUEUE_TIMEOUT: Duration = Duration::from_millis(500);

/// Pixel format negotiated with the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireFormat {
    /// YUYV 4:2:2 packed, converted to RGB.
    Yuyv,
    /// 8-bit grayscale.
    Grey,
    /// 16-bit little-endian grayscale, downscaled to 8-bit.
    Y16,
}

/// Opens `/dev/video{index}` devices.
#[derive(Debug, Default, Clone, Copy)]
pub struct V4lBackend;

impl DeviceBackend for V4lBackend {
    fn open(&self, settings: &DeviceSettings) -> Result<Box<dyn CaptureDevice>, CameraError> {
        Ok(Box::new(Camera::open(settings)?))
    }
}

/// V4L2 camera device.
pub struct Camera {
    device: Device,
    stream: Option<MmapStream<'static>>,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub device_path: String,
    pub fourcc: FourCC,
    name: String,
    wire_format: WireFormat,
    buffer_count: u32,
}

impl Camera {
    /// Open and configure the device described by `settings`.
    pub fn open(settings: &DeviceSettings) -> Result<Self, CameraError> {
        let device_path = format!("/dev/video{}", settings.index);
        if !Path::new(&device_path).exists() {
            return Err(CameraError::DeviceNotFound(device_path));
        }

        let device = Device::with_path(&device_path).map_err(|e| {
            if e.to_string().contains("busy") || e.to_string().contains("EBUSY") {
                CameraError::DeviceBusy
            } else {
                CameraError::DeviceNotFound(format!("{device_path}: {e}"))
            }
        })?;

        let caps = device.query_caps().map_err(|e| {
            CameraError::CaptureFailed(format!("failed to query capabilities: {e}"))
        })?;
        if !caps.capabilities.contains(v4l::capability::Flags::VIDEO_CAPTURE) {
            return Err(CameraError::StreamingNotSupported);
        }

        let mut fmt = device.format().map_err(|e| {
            CameraError::FormatNegotiationFailed(format!("failed to get format: {e}"))
        })?;
        fmt.fourcc = FourCC::new(b"YUYV");
        fmt.width = settings.width;
        fmt.height = settings.height;

        let negotiated = device.set_format(&fmt).map_err(|e| {
            CameraError::FormatNegotiationFailed(format!("failed to set format: {e}"))
        })?;

        let fourcc = negotiated.fourcc;
        let wire_format = if fourcc == FourCC::new(b"YUYV") {
            WireFormat::Yuyv
        } else if fourcc == FourCC::new(b"GREY") {
            WireFormat::Grey
        } else if fourcc == FourCC::new(b"Y16 ") || fourcc == FourCC::new(b"Y16\0") {
            WireFormat::Y16
        } else {
            return Err(CameraError::FormatNegotiationFailed(format!(
                "unsupported pixel format: {fourcc:?} (need YUYV, GREY, or Y16)"
            )));
        };

        let fps = match device.set_params(&Parameters::with_fps(settings.fps)) {
            Ok(params) if params.interval.numerator > 0 => {
                params.interval.denominator / params.interval.numerator
            }
            Ok(_) => settings.fps,
            Err(e) => {
                tracing::debug!(error = %e, fps = settings.fps, "frame rate not configurable");
                settings.fps
            }
        };

        apply_image_controls(&device, settings);

        tracing::info!(
            device = %device_path,
            card = %caps.card,
            width = negotiated.width,
            height = negotiated.height,
            fps,
            fourcc = ?fourcc,
            "camera configured"
        );

        Ok(Self {
            device,
            stream: None,
            width: negotiated.width,
            height: negotiated.height,
            fps,
            device_path,
            fourcc,
            name: caps.card,
            wire_format,
            buffer_count: settings.buffer_count.max(1),
        })
    }

    fn stream(&mut self) -> Result<&mut MmapStream<'static>, CameraError> {
        if self.stream.is_none() {
            let mut stream = MmapStream::with_buffers(&self.device, BufType::VideoCapture, self.buffer_count)
                .map_err(|e| CameraError::CaptureFailed(format!("failed to create mmap stream: {e}")))?;
            stream.set_timeout(DEQUEUE_TIMEOUT);
            self.stream = Some(stream);
        }
        self.stream
            .as_mut()
            .ok_or_else(|| CameraError::CaptureFailed("stream unavailable".into()))
    }

    /// Convert a raw buffer according to the negotiated format.
    fn convert(&self, buf: &[u8]) -> Result<(Vec<u8>, PixelFormat), CameraError> {
        let pixels = (self.width * self.height) as usize;

        match self.wire_format {
            WireFormat::Grey => {
                if buf.len() < pixels {
                    return Err(CameraError::CaptureFailed(format!(
                        "GREY buffer too short: expected {pixels}, got {}",
                        buf.len()
                    )));
                }
                Ok((buf[..pixels].to_vec(), PixelFormat::Gray8))
            }
            WireFormat::Y16 => {
                let expected_bytes = pixels * 2;
                if buf.len() < expected_bytes {
                    return Err(CameraError::CaptureFailed(format!(
                        "Y16 buffer too short: expected {expected_bytes}, got {}",
                        buf.len()
                    )));
                }
                // Keep the high byte of each little-endian sample.
                let gray = buf[..expected_bytes].chunks_exact(2).map(|s| s[1]).collect();
                Ok((gray, PixelFormat::Gray8))
            }
            WireFormat::Yuyv => frame::yuyv_to_rgb(buf, self.width, self.height)
                .map(|rgb| (rgb, PixelFormat::Rgb8))
                .map_err(|e| CameraError::CaptureFailed(format!("YUYV conversion failed: {e}"))),
        }
    }

    /// List available V4L2 video capture devices.
    pub fn list_devices() -> Vec<DeviceInfo> {
        let mut devices = Vec::new();

        for index in 0..16u32 {
            let path = format!("/dev/video{index}");
            if !Path::new(&path).exists() {
                continue;
            }
            let Ok(dev) = Device::with_path(&path) else {
                continue;
            };
            let Ok(caps) = dev.query_caps() else {
                continue;
            };
            if !caps.capabilities.contains(v4l::capability::Flags::VIDEO_CAPTURE) {
                continue;
            }
            let (width, height) = dev.format().map(|f| (f.width, f.height)).unwrap_or((0, 0));
            devices.push(DeviceInfo {
                index,
                name: caps.card.clone(),
                width,
                height,
                fps: 0,
            });
        }

        devices
    }
}

impl CaptureDevice for Camera {
    fn read_frame(&mut self) -> Result<Frame, CameraError> {
        let (raw, sequence) = {
            let stream = self.stream()?;
            let (buf, meta) = stream
                .next()
                .map_err(|e| CameraError::CaptureFailed(format!("failed to dequeue buffer: {e}")))?;
            let used = (meta.bytesused as usize).min(buf.len());
            let used = if used == 0 { buf.len() } else { used };
            (buf[..used].to_vec(), meta.sequence)
        };
        if raw.is_empty() {
            return Err(CameraError::EmptyFrame);
        }

        let (data, format) = self.convert(&raw)?;
        Ok(Frame {
            data,
            width: self.width,
            height: self.height,
            format,
            captured_at: Instant::now(),
            sequence,
        })
    }

    fn geometry(&self) -> (u32, u32, u32) {
        (self.width, self.height, self.fps)
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Set brightness/contrast/saturation to a fraction of each control's range.
/// Drivers that lack a control are skipped.
fn apply_image_controls(device: &Device, settings: &DeviceSettings) {
    let Ok(descriptions) = device.query_controls() else {
        tracing::debug!("driver does not report controls");
        return;
    };

    for (id, fraction, label) in [
        (V4L2_CID_BRIGHTNESS, settings.brightness, "brightness"),
        (V4L2_CID_CONTRAST, settings.contrast, "contrast"),
        (V4L2_CID_SATURATION, settings.saturation, "saturation"),
    ] {
        let Some(desc) = descriptions.iter().find(|d| d.id == id) else {
            continue;
        };
        let span = (desc.maximum - desc.minimum) as f64;
        let value = desc.minimum + (span * fraction.clamp(0.0, 1.0) as f64).round() as i64;
        if let Err(e) = device.set_control(Control {
            id,
            value: Value::Integer(value),
        }) {
            tracing::debug!(control = label, value, error = %e, "failed to set control");
        }
    }
}
