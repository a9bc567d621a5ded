//! faceguard-hw: Camera capture and shared camera ownership.
//!
//! Provides the V4L2 capture backend, frame conversion and enhancement,
//! and the [`CameraResourceManager`] that arbitrates the single physical
//! camera between consumers.

pub mod camera;
pub mod device;
pub mod enhance;
pub mod frame;
pub mod manager;

pub use camera::{Camera, V4lBackend};
pub use device::{CameraError, CaptureDevice, DeviceBackend, DeviceHandle, DeviceInfo, DeviceSettings};
pub use enhance::FrameEnhancer;
pub use frame::{Frame, PixelFormat};
pub use manager::{CameraResourceManager, CameraState, ManagerConfig};

#[cfg(any(test, feature = "testing"))]
pub mod testing;
