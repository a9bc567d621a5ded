//! faceguard: camera-driven face recognition access control.
//!
//! Wires the shared camera ([`faceguard_hw::CameraResourceManager`]), the
//! recognition pipeline and the access log together: configuration loading,
//! the periodic [`RecognitionCoordinator`] and the [`AccessRecorder`].

pub mod access;
pub mod config;
pub mod coordinator;

pub use access::{AccessRecorder, RecorderStats};
pub use config::{Config, ConfigError, MatcherKind};
pub use coordinator::{
    CoordinatorConfig, CoordinatorError, CoordinatorEvent, CoordinatorState, CoordinatorStats, RecognitionCoordinator,
};
