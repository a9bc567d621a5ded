use crate::coordinator::CoordinatorConfig;
use faceguard_core::recognition::{MAX_TOLERANCE, MIN_TOLERANCE};
use faceguard_core::{CosineMatcher, EuclideanMatcher, FaceAnalyzer, RecognitionError, RecognitionPipeline};
use faceguard_hw::{DeviceSettings, FrameEnhancer, ManagerConfig};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("cannot parse {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Application configuration.
///
/// Built from defaults, then an optional TOML file, then `FACEGUARD_*`
/// environment variables.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub camera: CameraConfig,
    pub enhance: EnhanceConfig,
    pub recognition: RecognitionConfig,
    pub storage: StorageConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CameraConfig {
    /// `/dev/video<index>`.
    pub index: u32,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    /// Fractions of each control's range.
    pub brightness: f32,
    pub contrast: f32,
    pub saturation: f32,
    pub buffer_count: u32,
    pub open_attempts: u32,
    pub retry_backoff_ms: u64,
    pub verify_reads: u32,
    pub verify_pause_ms: u64,
    pub frame_reads: u32,
    /// Oldest cached frame still served when a read fails.
    pub stale_after_ms: u64,
}

impl Default for CameraConfig {
    fn default() -> Self {
        let device = DeviceSettings::default();
        Self {
            index: device.index,
            width: device.width,
            height: device.height,
            fps: device.fps,
            brightness: device.brightness,
            contrast: device.contrast,
            saturation: device.saturation,
            buffer_count: device.buffer_count,
            open_attempts: 3,
            retry_backoff_ms: 1000,
            verify_reads: 5,
            verify_pause_ms: 100,
            frame_reads: 2,
            stale_after_ms: 1000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EnhanceConfig {
    pub enabled: bool,
    pub clip_limit: f32,
    pub tile_grid: (u32, u32),
    pub mirror: bool,
}

impl Default for EnhanceConfig {
    fn default() -> Self {
        let enhancer = FrameEnhancer::default();
        Self {
            enabled: true,
            clip_limit: enhancer.clip_limit,
            tile_grid: enhancer.tile_grid,
            mirror: enhancer.mirror,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatcherKind {
    Euclidean,
    Cosine,
}

impl FromStr for MatcherKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "euclidean" => Ok(MatcherKind::Euclidean),
            "cosine" => Ok(MatcherKind::Cosine),
            other => Err(format!("unknown matcher: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RecognitionConfig {
    /// Match distance threshold in [0.1, 1.0]; lower is stricter.
    pub tolerance: f32,
    pub matcher: MatcherKind,
    pub max_faces: usize,
    pub capture_interval_ms: u64,
    pub recognition_interval_ms: u64,
    /// Consecutive empty captures before the camera is reinitialized.
    pub failure_threshold: u32,
    pub settle_delay_ms: u64,
    pub join_timeout_ms: u64,
}

impl Default for RecognitionConfig {
    fn default() -> Self {
        Self {
            tolerance: faceguard_core::recognition::DEFAULT_TOLERANCE,
            matcher: MatcherKind::Euclidean,
            max_faces: faceguard_core::recognition::DEFAULT_MAX_FACES,
            capture_interval_ms: 33,
            recognition_interval_ms: 1000,
            failure_threshold: 5,
            settle_delay_ms: 500,
            join_timeout_ms: 3000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StorageConfig {
    pub db_path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: data_dir().join("faceguard.db"),
        }
    }
}

fn data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("faceguard")
}

fn default_config_path() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".config")
        })
        .join("faceguard")
        .join("config.toml")
}

impl Config {
    /// Load the effective configuration.
    ///
    /// `explicit` (from `--config`) or `FACEGUARD_CONFIG` must exist when
    /// given; otherwise the per-user config file is read if present.
    pub fn load(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        let from_env = std::env::var_os("FACEGUARD_CONFIG").map(PathBuf::from);
        let mut config = match explicit.map(Path::to_path_buf).or(from_env) {
            Some(path) => Self::from_file(&path)?,
            None => {
                let path = default_config_path();
                if path.exists() {
                    Self::from_file(&path)?
                } else {
                    Self::default()
                }
            }
        };
        config.apply_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::from_toml(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        tracing::info!(path = %path.display(), "configuration file loaded");
        Ok(config)
    }

    pub fn from_toml(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    /// Apply `FACEGUARD_*` overrides; `lookup` returns a variable's value.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let get = |key: &str| lookup(key);

        override_parsed(&get, "FACEGUARD_CAMERA_INDEX", &mut self.camera.index);
        override_parsed(&get, "FACEGUARD_CAMERA_WIDTH", &mut self.camera.width);
        override_parsed(&get, "FACEGUARD_CAMERA_HEIGHT", &mut self.camera.height);
        override_parsed(&get, "FACEGUARD_CAMERA_FPS", &mut self.camera.fps);
        override_parsed(&get, "FACEGUARD_OPEN_ATTEMPTS", &mut self.camera.open_attempts);
        override_parsed(&get, "FACEGUARD_RETRY_BACKOFF_MS", &mut self.camera.retry_backoff_ms);
        override_parsed(&get, "FACEGUARD_STALE_AFTER_MS", &mut self.camera.stale_after_ms);
        if let Some(v) = get("FACEGUARD_ENHANCE") {
            self.enhance.enabled = v != "0";
        }
        override_parsed(&get, "FACEGUARD_CLIP_LIMIT", &mut self.enhance.clip_limit);
        override_parsed(&get, "FACEGUARD_TOLERANCE", &mut self.recognition.tolerance);
        override_parsed(&get, "FACEGUARD_MATCHER", &mut self.recognition.matcher);
        override_parsed(&get, "FACEGUARD_MAX_FACES", &mut self.recognition.max_faces);
        override_parsed(
            &get,
            "FACEGUARD_RECOGNITION_INTERVAL_MS",
            &mut self.recognition.recognition_interval_ms,
        );
        override_parsed(&get, "FACEGUARD_FAILURE_THRESHOLD", &mut self.recognition.failure_threshold);
        if let Some(v) = get("FACEGUARD_DB_PATH") {
            self.storage.db_path = PathBuf::from(v);
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::Invalid(msg));
        let c = &self.camera;
        let r = &self.recognition;

        if !(MIN_TOLERANCE..=MAX_TOLERANCE).contains(&r.tolerance) {
            return invalid(format!(
                "recognition.tolerance {} outside [{MIN_TOLERANCE}, {MAX_TOLERANCE}]",
                r.tolerance
            ));
        }
        if c.width == 0 || c.height == 0 || c.fps == 0 {
            return invalid(format!("camera geometry {}x{}@{} must be positive", c.width, c.height, c.fps));
        }
        for (name, value) in [
            ("camera.brightness", c.brightness),
            ("camera.contrast", c.contrast),
            ("camera.saturation", c.saturation),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return invalid(format!("{name} {value} outside [0, 1]"));
            }
        }
        for (name, value) in [
            ("camera.open_attempts", u64::from(c.open_attempts)),
            ("camera.verify_reads", u64::from(c.verify_reads)),
            ("camera.frame_reads", u64::from(c.frame_reads)),
            ("recognition.failure_threshold", u64::from(r.failure_threshold)),
            ("recognition.max_faces", r.max_faces as u64),
            ("recognition.capture_interval_ms", r.capture_interval_ms),
            ("recognition.recognition_interval_ms", r.recognition_interval_ms),
            ("recognition.join_timeout_ms", r.join_timeout_ms),
        ] {
            if value == 0 {
                return invalid(format!("{name} must be positive"));
            }
        }
        if self.enhance.clip_limit <= 0.0 {
            return invalid(format!("enhance.clip_limit {} must be positive", self.enhance.clip_limit));
        }
        if self.enhance.tile_grid.0 == 0 || self.enhance.tile_grid.1 == 0 {
            return invalid("enhance.tile_grid must be positive".to_string());
        }
        Ok(())
    }

    pub fn manager_config(&self) -> ManagerConfig {
        let c = &self.camera;
        let e = &self.enhance;
        ManagerConfig {
            device: DeviceSettings {
                index: c.index,
                width: c.width,
                height: c.height,
                fps: c.fps,
                brightness: c.brightness,
                contrast: c.contrast,
                saturation: c.saturation,
                buffer_count: c.buffer_count,
            },
            open_attempts: c.open_attempts,
            retry_backoff: Duration::from_millis(c.retry_backoff_ms),
            verify_reads: c.verify_reads,
            verify_pause: Duration::from_millis(c.verify_pause_ms),
            frame_reads: c.frame_reads,
            stale_after: Duration::from_millis(c.stale_after_ms),
            enhance: e.enabled,
            enhancer: FrameEnhancer {
                clip_limit: e.clip_limit,
                tile_grid: e.tile_grid,
                mirror: e.mirror,
            },
        }
    }

    pub fn coordinator_config(&self) -> CoordinatorConfig {
        let r = &self.recognition;
        CoordinatorConfig {
            capture_interval: Duration::from_millis(r.capture_interval_ms),
            recognition_interval: Duration::from_millis(r.recognition_interval_ms),
            failure_threshold: r.failure_threshold,
            settle_delay: Duration::from_millis(r.settle_delay_ms),
            join_timeout: Duration::from_millis(r.join_timeout_ms),
            ..CoordinatorConfig::default()
        }
    }

    /// Recognition pipeline over `analyzer` with the configured matcher.
    pub fn pipeline(&self, analyzer: Arc<dyn FaceAnalyzer>) -> Result<RecognitionPipeline, RecognitionError> {
        let r = &self.recognition;
        let pipeline = RecognitionPipeline::new(analyzer, r.tolerance)?.with_max_faces(r.max_faces);
        Ok(match r.matcher {
            MatcherKind::Euclidean => pipeline.with_matcher(EuclideanMatcher),
            MatcherKind::Cosine => pipeline.with_matcher(CosineMatcher),
        })
    }
}

fn override_parsed<T: FromStr>(get: &impl Fn(&str) -> Option<String>, key: &str, target: &mut T) {
    let Some(raw) = get(key) else {
        return;
    };
    match raw.trim().parse() {
        Ok(value) => *target = value,
        Err(_) => tracing::warn!(key, value = %raw, "ignoring unparseable override"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        config.validate().unwrap();
        assert_eq!(config.camera.open_attempts, 3);
        assert_eq!(config.recognition.failure_threshold, 5);
        assert_eq!(config.recognition.join_timeout_ms, 3000);
        assert!(config.storage.db_path.ends_with("faceguard/faceguard.db"));
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = Config::from_toml(
            r#"
            [camera]
            index = 2
            width = 1280
            height = 720

            [recognition]
            tolerance = 0.45
            matcher = "cosine"
            "#,
        )
        .unwrap();
        assert_eq!(config.camera.index, 2);
        assert_eq!(config.camera.width, 1280);
        assert_eq!(config.camera.fps, 30);
        assert_eq!(config.recognition.tolerance, 0.45);
        assert_eq!(config.recognition.matcher, MatcherKind::Cosine);
        assert_eq!(config.enhance, EnhanceConfig::default());
    }

    #[test]
    fn test_unknown_key_rejected() {
        assert!(Config::from_toml("[camera]\nresolution = 3\n").is_err());
    }

    #[test]
    fn test_env_overrides() {
        let vars = env(&[
            ("FACEGUARD_CAMERA_INDEX", "4"),
            ("FACEGUARD_TOLERANCE", "0.5"),
            ("FACEGUARD_ENHANCE", "0"),
            ("FACEGUARD_MATCHER", "Cosine"),
            ("FACEGUARD_DB_PATH", "/var/lib/faceguard/db.sqlite"),
            ("FACEGUARD_CAMERA_FPS", "fast"),
        ]);
        let mut config = Config::default();
        config.apply_overrides(|k| vars.get(k).cloned());

        assert_eq!(config.camera.index, 4);
        assert_eq!(config.recognition.tolerance, 0.5);
        assert!(!config.enhance.enabled);
        assert_eq!(config.recognition.matcher, MatcherKind::Cosine);
        assert_eq!(config.storage.db_path, PathBuf::from("/var/lib/faceguard/db.sqlite"));
        // Unparseable values leave the previous setting alone.
        assert_eq!(config.camera.fps, 30);
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let mut config = Config::default();
        config.recognition.tolerance = 0.05;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let mut config = Config::default();
        config.recognition.tolerance = 1.2;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.camera.width = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.recognition.failure_threshold = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.camera.contrast = 1.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_manager_config_conversion() {
        let mut config = Config::default();
        config.camera.retry_backoff_ms = 250;
        config.enhance.mirror = false;
        let manager = config.manager_config();
        assert_eq!(manager.retry_backoff, Duration::from_millis(250));
        assert_eq!(manager.open_attempts, 3);
        assert_eq!(manager.device.width, 640);
        assert!(!manager.enhancer.mirror);

        let coordinator = config.coordinator_config();
        assert_eq!(coordinator.failure_threshold, 5);
        assert_eq!(coordinator.settle_delay, Duration::from_millis(500));
    }

    struct OneFace;

    impl FaceAnalyzer for OneFace {
        fn detect_and_encode(
            &self,
            _image: &faceguard_core::ImageRef<'_>,
        ) -> Result<Vec<(faceguard_core::BoundingBox, faceguard_core::Embedding)>, faceguard_core::AnalyzerError> {
            let bbox = faceguard_core::BoundingBox {
                x: 0.0,
                y: 0.0,
                width: 4.0,
                height: 4.0,
                confidence: 0.9,
                landmarks: None,
            };
            Ok(vec![(bbox, faceguard_core::Embedding::new(vec![1.0, 0.0]))])
        }
    }

    #[test]
    fn test_pipeline_uses_configured_matcher() {
        let image = faceguard_core::ImageRef {
            data: &[0u8; 16],
            width: 4,
            height: 4,
            channels: 1,
        };
        // Same direction, twice the length: cosine distance 0, euclidean 1.
        let gallery = vec![faceguard_core::GalleryEntry {
            user_id: 1,
            name: "Ana".into(),
            embedding: faceguard_core::Embedding::new(vec![2.0, 0.0]),
        }];

        let mut config = Config::default();
        config.recognition.tolerance = 0.1;
        config.recognition.matcher = MatcherKind::Cosine;
        let cosine = config.pipeline(Arc::new(OneFace)).unwrap();
        assert_eq!(cosine.tolerance(), 0.1);
        cosine.set_gallery(gallery.clone());
        assert!(cosine.recognize(&image).unwrap()[0].is_known());

        config.recognition.matcher = MatcherKind::Euclidean;
        let euclidean = config.pipeline(Arc::new(OneFace)).unwrap();
        euclidean.set_gallery(gallery);
        assert!(!euclidean.recognize(&image).unwrap()[0].is_known());

        config.recognition.tolerance = 3.0;
        assert!(matches!(
            config.pipeline(Arc::new(OneFace)),
            Err(RecognitionError::InvalidTolerance(_))
        ));
    }

    #[test]
    fn test_missing_explicit_file_is_an_error() {
        let err = Config::from_file(Path::new("/nonexistent/faceguard.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }
}
