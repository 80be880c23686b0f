//! System configuration.
//!
//! The on-disk document is JSON. Loading only parses; [`SystemConfig::camera`]
//! validates one camera entry into an immutable [`CameraWorkerConfig`], so a
//! bad entry disables that camera and nothing else.

use std::{
    collections::{BTreeMap, HashSet},
    fs,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use link_core::BackoffPolicy;
use ml_core::Point;
use plc_link::{BitAddress, LinkOptions, PlcError, S7Connector, s7::ISO_TCP_PORT};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use video_ingest::{Resolution, StreamOptions};

use crate::{
    alarm::AlarmKind,
    debounce::DebouncePolicy,
    roi::{RoiError, RoiPolygon},
};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("camera {camera}: {reason}")]
    Invalid { camera: String, reason: String },
    #[error("camera {camera}: model {model:?} is not configured")]
    UnknownModel { camera: String, model: String },
    #[error("camera {camera}: PLC {plc:?} is not configured")]
    UnknownPlc { camera: String, plc: String },
    #[error("camera {camera}: {kind} ROI: {source}")]
    Roi {
        camera: String,
        kind: AlarmKind,
        #[source]
        source: RoiError,
    },
    #[error("camera {camera}: {kind} alarm address: {source}")]
    Address {
        camera: String,
        kind: AlarmKind,
        #[source]
        source: PlcError,
    },
    #[error("camera id {0:?} is used more than once")]
    DuplicateCamera(String),
    #[error("PLC {plc}: {reason}")]
    Plc { plc: String, reason: String },
    #[error("{0}")]
    Setting(String),
}

impl ConfigError {
    fn invalid(camera: &str, reason: impl Into<String>) -> Self {
        ConfigError::Invalid {
            camera: camera.to_string(),
            reason: reason.into(),
        }
    }
}

/// Upper bound on settings given in seconds.
pub const MAX_SETTING_SECS: f64 = 86_400.0;

/// Problem with a seconds-valued setting, if any.
fn check_secs(name: &str, value: f64) -> Option<String> {
    (!(value.is_finite() && (0.0..=MAX_SETTING_SECS).contains(&value)))
        .then(|| format!("{name} must be within 0..={MAX_SETTING_SECS}, got {value}"))
}

/// Seconds setting as a duration, clamped into the accepted range.
fn secs_setting(value: f64) -> Duration {
    let secs = if value.is_finite() {
        value.clamp(0.0, MAX_SETTING_SECS)
    } else {
        0.0
    };
    Duration::from_secs_f64(secs)
}

fn default_true() -> bool {
    true
}

fn default_artifacts_dir() -> PathBuf {
    PathBuf::from("artifacts")
}

fn default_logs_dir() -> PathBuf {
    PathBuf::from("logs")
}

fn default_throttle_secs() -> f64 {
    5.0
}

fn default_snapshot_throttle_secs() -> f64 {
    10.0
}

fn default_startup_wait_ms() -> u64 {
    5_000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemConfig {
    #[serde(default)]
    pub models: BTreeMap<String, ModelConfig>,
    #[serde(default)]
    pub plcs: BTreeMap<String, PlcConfig>,
    #[serde(default)]
    pub cameras: Vec<CameraConfig>,
    #[serde(default = "default_artifacts_dir")]
    pub artifacts_dir: PathBuf,
    #[serde(default = "default_logs_dir")]
    pub logs_dir: PathBuf,
    /// Minimum spacing of audit entries for repeated raises.
    #[serde(default = "default_throttle_secs")]
    pub alert_throttle_secs: f64,
    #[serde(default = "default_snapshot_throttle_secs")]
    pub snapshot_throttle_secs: f64,
    /// How long `run` waits for cameras to connect before reporting.
    #[serde(default = "default_startup_wait_ms")]
    pub startup_wait_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    pub path: PathBuf,
    /// Display name; the map key is used when absent.
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub labels: LabelConfig,
    /// Class names by class id, for models that only emit ids.
    #[serde(default)]
    pub classes: Vec<String>,
    #[serde(default = "ModelConfig::default_min_confidence")]
    pub min_confidence: f32,
    #[serde(default = "ModelConfig::default_input_size")]
    pub input_width: u32,
    #[serde(default = "ModelConfig::default_input_size")]
    pub input_height: u32,
    #[serde(default)]
    pub cpu: bool,
}

impl ModelConfig {
    fn default_min_confidence() -> f32 {
        0.7
    }

    fn default_input_size() -> u32 {
        640
    }
}

/// Scorer labels that feed each alarm.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LabelConfig {
    pub person: String,
    pub coal: String,
}

impl Default for LabelConfig {
    fn default() -> Self {
        Self {
            person: "person".into(),
            coal: "coal".into(),
        }
    }
}

impl LabelConfig {
    pub fn for_kind(&self, kind: AlarmKind) -> &str {
        match kind {
            AlarmKind::Person => &self.person,
            AlarmKind::Coal => &self.coal,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct BackoffConfig {
    pub min_interval_ms: u64,
    pub max_interval_ms: u64,
    pub multiplier: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            min_interval_ms: 500,
            max_interval_ms: 10_000,
            multiplier: 1.5,
        }
    }
}

impl BackoffConfig {
    pub fn policy(&self) -> BackoffPolicy {
        BackoffPolicy {
            min_interval: Duration::from_millis(self.min_interval_ms),
            max_interval: Duration::from_millis(self.max_interval_ms),
            multiplier: self.multiplier,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlcConfig {
    pub host: String,
    #[serde(default = "PlcConfig::default_port")]
    pub port: u16,
    #[serde(default)]
    pub rack: u8,
    #[serde(default = "PlcConfig::default_slot")]
    pub slot: u8,
    #[serde(default = "PlcConfig::default_io_timeout_ms")]
    pub io_timeout_ms: u64,
    #[serde(default = "PlcConfig::default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    /// Idle probe period; 0 disables probing.
    #[serde(default = "PlcConfig::default_health_check_secs")]
    pub health_check_secs: f64,
    #[serde(default)]
    pub backoff: BackoffConfig,
}

impl PlcConfig {
    fn default_port() -> u16 {
        ISO_TCP_PORT
    }

    fn default_slot() -> u8 {
        2
    }

    fn default_io_timeout_ms() -> u64 {
        2_000
    }

    fn default_request_timeout_ms() -> u64 {
        5_000
    }

    fn default_health_check_secs() -> f64 {
        10.0
    }

    pub fn connector(&self) -> S7Connector {
        S7Connector {
            port: self.port,
            io_timeout: Duration::from_millis(self.io_timeout_ms),
            ..S7Connector::new(self.host.clone(), self.rack, self.slot)
        }
    }

    pub fn link_options(&self) -> LinkOptions {
        LinkOptions {
            backoff: self.backoff.policy(),
            health_interval: (self.health_check_secs > 0.0)
                .then(|| secs_setting(self.health_check_secs)),
            probe_address: None,
            request_timeout: Duration::from_millis(self.request_timeout_ms),
            ..LinkOptions::default()
        }
    }

    fn validate(&self, id: &str) -> Result<(), ConfigError> {
        let invalid = |reason: String| ConfigError::Plc {
            plc: id.to_string(),
            reason,
        };
        if self.host.trim().is_empty() {
            return Err(invalid("host is empty".into()));
        }
        if let Some(reason) = check_secs("health_check_secs", self.health_check_secs) {
            return Err(invalid(reason));
        }
        if self.io_timeout_ms == 0 || self.request_timeout_ms == 0 {
            return Err(invalid("timeouts must be positive".into()));
        }
        self.backoff
            .policy()
            .validate()
            .map_err(|err| invalid(err.to_string()))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaptureBackend {
    #[default]
    Ffmpeg,
    Opencv,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureConfig {
    #[serde(default)]
    pub backend: CaptureBackend,
    /// Frames discarded before each kept frame.
    #[serde(default = "CaptureConfig::default_grab_count")]
    pub grab_count: u32,
    /// Reconnect after this long without a frame; 0 disables the check.
    #[serde(default = "CaptureConfig::default_stall_timeout_ms")]
    pub stall_timeout_ms: u64,
    #[serde(default)]
    pub output_width: Option<u32>,
    #[serde(default)]
    pub output_height: Option<u32>,
    #[serde(default)]
    pub use_nvdec: bool,
    #[serde(default)]
    pub backoff: BackoffConfig,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            backend: CaptureBackend::default(),
            grab_count: Self::default_grab_count(),
            stall_timeout_ms: Self::default_stall_timeout_ms(),
            output_width: None,
            output_height: None,
            use_nvdec: false,
            backoff: BackoffConfig::default(),
        }
    }
}

impl CaptureConfig {
    fn default_grab_count() -> u32 {
        1
    }

    fn default_stall_timeout_ms() -> u64 {
        10_000
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoiConfig {
    #[serde(default = "RoiConfig::default_reference")]
    pub reference_resolution: Resolution,
    #[serde(default)]
    pub person: Vec<[f32; 2]>,
    #[serde(default)]
    pub coal: Vec<[f32; 2]>,
}

impl Default for RoiConfig {
    fn default() -> Self {
        Self {
            reference_resolution: Self::default_reference(),
            person: Vec::new(),
            coal: Vec::new(),
        }
    }
}

impl RoiConfig {
    fn default_reference() -> Resolution {
        Resolution::new(1920, 1080)
    }

    fn points(&self, kind: AlarmKind) -> Vec<Point> {
        let raw = match kind {
            AlarmKind::Person => &self.person,
            AlarmKind::Coal => &self.coal,
        };
        raw.iter().map(|&[x, y]| Point::new(x, y)).collect()
    }
}

/// PLC bit an alarm drives.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlcTargetConfig {
    pub plc: String,
    #[serde(default = "PlcTargetConfig::default_db")]
    pub db: u16,
    pub byte: u32,
    pub bit: u8,
}

impl PlcTargetConfig {
    fn default_db() -> u16 {
        300
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersonAlarmConfig {
    #[serde(flatten)]
    pub target: PlcTargetConfig,
    #[serde(default = "PersonAlarmConfig::default_threshold")]
    pub consecutive_threshold: u32,
}

impl PersonAlarmConfig {
    fn default_threshold() -> u32 {
        3
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoalAlarmConfig {
    #[serde(flatten)]
    pub target: PlcTargetConfig,
    /// Percent of the ROI that must be covered.
    #[serde(default = "CoalAlarmConfig::default_threshold")]
    pub ratio_threshold: f32,
}

impl CoalAlarmConfig {
    fn default_threshold() -> f32 {
        73.0
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CameraConfig {
    pub camera_id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// RTSP/HTTP URL, device index or file path.
    pub source: String,
    #[serde(default)]
    pub capture: CaptureConfig,
    pub model: String,
    #[serde(default = "CameraConfig::default_detection_interval_ms")]
    pub detection_interval_ms: u64,
    /// Frames older than this are not scored.
    #[serde(default = "CameraConfig::default_max_frame_age_ms")]
    pub max_frame_age_ms: u64,
    #[serde(default)]
    pub roi: RoiConfig,
    #[serde(default)]
    pub person: Option<PersonAlarmConfig>,
    #[serde(default)]
    pub coal: Option<CoalAlarmConfig>,
}

impl CameraConfig {
    fn default_detection_interval_ms() -> u64 {
        500
    }

    fn default_max_frame_age_ms() -> u64 {
        5_000
    }
}

/// Capture settings after validation.
#[derive(Debug, Clone)]
pub struct CaptureSettings {
    pub backend: CaptureBackend,
    pub output: Option<Resolution>,
    pub use_nvdec: bool,
    pub stream: StreamOptions,
}

/// One alarm of one camera after validation.
#[derive(Debug, Clone)]
pub struct AlarmSpec {
    pub kind: AlarmKind,
    pub roi: RoiPolygon,
    pub policy: DebouncePolicy,
    /// Scorer label that counts towards this alarm.
    pub label: String,
    pub min_confidence: f32,
    pub plc: String,
    pub address: BitAddress,
}

/// Immutable, validated settings for one camera worker.
#[derive(Debug, Clone)]
pub struct CameraWorkerConfig {
    pub camera_id: Arc<str>,
    pub name: String,
    pub source: String,
    pub capture: CaptureSettings,
    pub model: String,
    pub detection_interval: Duration,
    pub max_frame_age: Duration,
    pub alarms: Vec<AlarmSpec>,
    /// Bounded wait for the detection thread on stop.
    pub stop_timeout: Duration,
}

impl SystemConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    /// Spacing of audit entries for repeated raises.
    pub fn alert_throttle(&self) -> Duration {
        secs_setting(self.alert_throttle_secs)
    }

    /// Spacing of snapshots for repeated raises.
    pub fn snapshot_throttle(&self) -> Duration {
        secs_setting(self.snapshot_throttle_secs)
    }

    /// System-level problems: throttles, PLC settings and camera id collisions.
    pub fn validate_shared(&self) -> Vec<ConfigError> {
        let mut errors: Vec<ConfigError> = [
            check_secs("alert_throttle_secs", self.alert_throttle_secs),
            check_secs("snapshot_throttle_secs", self.snapshot_throttle_secs),
        ]
        .into_iter()
        .flatten()
        .map(ConfigError::Setting)
        .collect();
        for (id, plc) in &self.plcs {
            if let Err(err) = plc.validate(id) {
                errors.push(err);
            }
        }
        let mut seen = HashSet::new();
        for camera in &self.cameras {
            if !seen.insert(camera.camera_id.as_str()) {
                errors.push(ConfigError::DuplicateCamera(camera.camera_id.clone()));
            }
        }
        errors
    }

    pub fn enabled_cameras(&self) -> impl Iterator<Item = &CameraConfig> {
        self.cameras.iter().filter(|c| c.enabled)
    }

    /// Validate one camera entry.
    pub fn camera(&self, camera: &CameraConfig) -> Result<CameraWorkerConfig, ConfigError> {
        let id = camera.camera_id.as_str();
        if id.trim().is_empty() {
            return Err(ConfigError::invalid("<unnamed>", "camera_id is empty"));
        }
        if camera.source.trim().is_empty() {
            return Err(ConfigError::invalid(id, "source is empty"));
        }
        let model = self
            .models
            .get(&camera.model)
            .ok_or_else(|| ConfigError::UnknownModel {
                camera: id.to_string(),
                model: camera.model.clone(),
            })?;
        if camera.detection_interval_ms == 0 {
            return Err(ConfigError::invalid(id, "detection_interval_ms must be positive"));
        }
        if camera.max_frame_age_ms == 0 {
            return Err(ConfigError::invalid(id, "max_frame_age_ms must be positive"));
        }
        let backoff = camera.capture.backoff.policy();
        backoff
            .validate()
            .map_err(|reason| ConfigError::invalid(id, format!("capture {reason}")))?;
        let output = match (camera.capture.output_width, camera.capture.output_height) {
            (Some(w), Some(h)) if w > 0 && h > 0 => Some(Resolution::new(w, h)),
            (None, None) => None,
            _ => {
                return Err(ConfigError::invalid(
                    id,
                    "output_width and output_height must be set together and positive",
                ));
            }
        };

        let mut alarms = Vec::new();
        if let Some(person) = &camera.person {
            if person.consecutive_threshold == 0 {
                return Err(ConfigError::invalid(id, "person consecutive_threshold must be >= 1"));
            }
            alarms.push(self.alarm(
                camera,
                model,
                AlarmKind::Person,
                &person.target,
                DebouncePolicy::ConsecutiveCount {
                    threshold: person.consecutive_threshold,
                },
            )?);
        }
        if let Some(coal) = &camera.coal {
            if !(coal.ratio_threshold > 0.0 && coal.ratio_threshold <= 100.0) {
                return Err(ConfigError::invalid(
                    id,
                    format!("coal ratio_threshold must be in (0, 100], got {}", coal.ratio_threshold),
                ));
            }
            alarms.push(self.alarm(
                camera,
                model,
                AlarmKind::Coal,
                &coal.target,
                DebouncePolicy::RatioThreshold {
                    threshold: coal.ratio_threshold / 100.0,
                },
            )?);
        }
        if alarms.is_empty() {
            return Err(ConfigError::invalid(id, "no alarm configured"));
        }

        Ok(CameraWorkerConfig {
            camera_id: Arc::from(id),
            name: camera.name.clone().unwrap_or_else(|| id.to_string()),
            source: camera.source.clone(),
            capture: CaptureSettings {
                backend: camera.capture.backend,
                output,
                use_nvdec: camera.capture.use_nvdec,
                stream: StreamOptions {
                    grab_count: camera.capture.grab_count,
                    backoff,
                    stall_timeout: (camera.capture.stall_timeout_ms > 0)
                        .then(|| Duration::from_millis(camera.capture.stall_timeout_ms)),
                    ..StreamOptions::default()
                },
            },
            model: camera.model.clone(),
            detection_interval: Duration::from_millis(camera.detection_interval_ms),
            max_frame_age: Duration::from_millis(camera.max_frame_age_ms),
            alarms,
            stop_timeout: Duration::from_secs(5),
        })
    }

    fn alarm(
        &self,
        camera: &CameraConfig,
        model: &ModelConfig,
        kind: AlarmKind,
        target: &PlcTargetConfig,
        policy: DebouncePolicy,
    ) -> Result<AlarmSpec, ConfigError> {
        let id = &camera.camera_id;
        if !self.plcs.contains_key(&target.plc) {
            return Err(ConfigError::UnknownPlc {
                camera: id.clone(),
                plc: target.plc.clone(),
            });
        }
        let roi = RoiPolygon::new(camera.roi.points(kind), camera.roi.reference_resolution)
            .map_err(|source| ConfigError::Roi {
                camera: id.clone(),
                kind,
                source,
            })?;
        let address =
            BitAddress::new(target.db, target.byte, target.bit).map_err(|source| {
                ConfigError::Address {
                    camera: id.clone(),
                    kind,
                    source,
                }
            })?;
        Ok(AlarmSpec {
            kind,
            roi,
            policy,
            label: model.labels.for_kind(kind).to_string(),
            min_confidence: model.min_confidence,
            plc: target.plc.clone(),
            address,
        })
    }

    /// Starter configuration for `cameras` cameras on one PLC, two alarm
    /// bits per camera from `DB300.DBX6.0` upwards.
    pub fn sample(cameras: u32) -> Self {
        let mut models = BTreeMap::new();
        models.insert(
            "default".to_string(),
            ModelConfig {
                path: PathBuf::from("models/detector.torchscript"),
                name: Some("YOLO person/coal".into()),
                labels: LabelConfig::default(),
                classes: vec!["person".into(), "coal".into()],
                min_confidence: ModelConfig::default_min_confidence(),
                input_width: ModelConfig::default_input_size(),
                input_height: ModelConfig::default_input_size(),
                cpu: false,
            },
        );
        let mut plcs = BTreeMap::new();
        plcs.insert(
            "plc1".to_string(),
            PlcConfig {
                host: "192.168.0.4".into(),
                port: PlcConfig::default_port(),
                rack: 0,
                slot: PlcConfig::default_slot(),
                io_timeout_ms: PlcConfig::default_io_timeout_ms(),
                request_timeout_ms: PlcConfig::default_request_timeout_ms(),
                health_check_secs: PlcConfig::default_health_check_secs(),
                backoff: BackoffConfig::default(),
            },
        );

        let reference = RoiConfig::default_reference();
        let (w, h) = (reference.width as f32, reference.height as f32);
        let cameras = (1..=cameras)
            .map(|n| {
                let first_bit = (n - 1) * 2;
                let target = |offset: u32| PlcTargetConfig {
                    plc: "plc1".into(),
                    db: PlcTargetConfig::default_db(),
                    byte: 6 + (first_bit + offset) / 8,
                    bit: ((first_bit + offset) % 8) as u8,
                };
                CameraConfig {
                    camera_id: format!("camera_{n}"),
                    name: Some(format!("Camera {n}")),
                    enabled: true,
                    source: format!("rtsp://192.168.0.{}/stream1", 100 + n),
                    capture: CaptureConfig::default(),
                    model: "default".into(),
                    detection_interval_ms: CameraConfig::default_detection_interval_ms(),
                    max_frame_age_ms: CameraConfig::default_max_frame_age_ms(),
                    roi: RoiConfig {
                        reference_resolution: reference,
                        person: vec![
                            [w * 0.25, h * 0.25],
                            [w * 0.75, h * 0.25],
                            [w * 0.75, h * 0.75],
                            [w * 0.25, h * 0.75],
                        ],
                        coal: vec![
                            [w * 0.35, h * 0.50],
                            [w * 0.65, h * 0.50],
                            [w * 0.65, h * 0.90],
                            [w * 0.35, h * 0.90],
                        ],
                    },
                    person: Some(PersonAlarmConfig {
                        target: target(0),
                        consecutive_threshold: PersonAlarmConfig::default_threshold(),
                    }),
                    coal: Some(CoalAlarmConfig {
                        target: target(1),
                        ratio_threshold: CoalAlarmConfig::default_threshold(),
                    }),
                }
            })
            .collect();

        Self {
            models,
            plcs,
            cameras,
            artifacts_dir: default_artifacts_dir(),
            logs_dir: default_logs_dir(),
            alert_throttle_secs: default_throttle_secs(),
            snapshot_throttle_secs: default_snapshot_throttle_secs(),
            startup_wait_ms: default_startup_wait_ms(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"{
        "models": { "yolo": { "path": "m.pt" } },
        "plcs": { "plc1": { "host": "10.0.0.5" } },
        "cameras": [{
            "camera_id": "cam1",
            "source": "rtsp://10.0.0.20/live",
            "model": "yolo",
            "roi": {
                "reference_resolution": { "width": 100, "height": 100 },
                "person": [[0, 0], [100, 0], [100, 100], [0, 100]],
                "coal": [[10, 10], [90, 10], [90, 90]]
            },
            "person": { "plc": "plc1", "byte": 6, "bit": 0 },
            "coal": { "plc": "plc1", "byte": 6, "bit": 1, "ratio_threshold": 50 }
        }]
    }"#;

    #[test]
    fn minimal_document_gets_deployed_defaults() {
        let config = SystemConfig::from_json(MINIMAL).unwrap();
        assert!(config.validate_shared().is_empty());
        let plc = &config.plcs["plc1"];
        assert_eq!((plc.port, plc.rack, plc.slot), (102, 0, 2));

        let camera = config.camera(&config.cameras[0]).unwrap();
        assert_eq!(camera.detection_interval, Duration::from_millis(500));
        assert_eq!(camera.capture.stream.grab_count, 1);
        assert_eq!(camera.capture.stream.backoff, BackoffPolicy::default());
        assert_eq!(camera.alarms.len(), 2);

        let person = &camera.alarms[0];
        assert_eq!(person.kind, AlarmKind::Person);
        assert_eq!(person.policy, DebouncePolicy::ConsecutiveCount { threshold: 3 });
        assert_eq!(person.address.to_string(), "DB300.DBX6.0");
        assert_eq!(person.label, "person");

        let coal = &camera.alarms[1];
        assert_eq!(coal.policy, DebouncePolicy::RatioThreshold { threshold: 0.5 });
        assert_eq!(coal.address.to_string(), "DB300.DBX6.1");
    }

    #[test]
    fn camera_errors_are_specific() {
        let mut config = SystemConfig::from_json(MINIMAL).unwrap();
        let mut camera = config.cameras[0].clone();

        camera.model = "missing".into();
        assert!(matches!(config.camera(&camera), Err(ConfigError::UnknownModel { .. })));

        camera.model = "yolo".into();
        camera.roi.person.truncate(2);
        assert!(matches!(
            config.camera(&camera),
            Err(ConfigError::Roi { kind: AlarmKind::Person, source: RoiError::TooFewPoints(2), .. })
        ));

        camera.roi.person = config.cameras[0].roi.person.clone();
        camera.coal.as_mut().unwrap().target.plc = "plc9".into();
        assert!(matches!(config.camera(&camera), Err(ConfigError::UnknownPlc { .. })));

        camera.coal.as_mut().unwrap().target.plc = "plc1".into();
        camera.person.as_mut().unwrap().target.bit = 9;
        assert!(matches!(config.camera(&camera), Err(ConfigError::Address { .. })));

        config.cameras.push(config.cameras[0].clone());
        assert!(matches!(
            config.validate_shared().as_slice(),
            [ConfigError::DuplicateCamera(id)] if id == "cam1"
        ));
    }

    #[test]
    fn sample_lays_out_two_bits_per_camera() {
        let config = SystemConfig::sample(5);
        let addresses: Vec<String> = config
            .cameras
            .iter()
            .map(|c| config.camera(c).unwrap())
            .flat_map(|c| c.alarms.into_iter().map(|a| a.address.to_string()))
            .collect();
        assert_eq!(
            addresses,
            [
                "DB300.DBX6.0", "DB300.DBX6.1", "DB300.DBX6.2", "DB300.DBX6.3",
                "DB300.DBX6.4", "DB300.DBX6.5", "DB300.DBX6.6", "DB300.DBX6.7",
                "DB300.DBX7.0", "DB300.DBX7.1",
            ]
        );

        let reparsed = SystemConfig::from_json(&config.to_json().unwrap()).unwrap();
        assert_eq!(reparsed.cameras.len(), 5);
        assert!(reparsed.validate_shared().is_empty());
    }

    #[test]
    fn plc_settings_are_checked() {
        let mut config = SystemConfig::from_json(MINIMAL).unwrap();
        config.plcs.get_mut("plc1").unwrap().backoff.multiplier = 0.5;
        assert!(matches!(
            config.validate_shared().as_slice(),
            [ConfigError::Plc { .. }]
        ));
        let link = SystemConfig::from_json(MINIMAL).unwrap().plcs["plc1"].link_options();
        assert_eq!(link.health_interval, Some(Duration::from_secs(10)));
    }

    #[test]
    fn oversized_seconds_are_rejected_without_panicking() {
        let mut config = SystemConfig::from_json(MINIMAL).unwrap();
        config.plcs.get_mut("plc1").unwrap().health_check_secs = 1e20;
        config.alert_throttle_secs = 1e20;
        config.snapshot_throttle_secs = f64::INFINITY;
        let errors = config.validate_shared();
        assert_eq!(errors.len(), 3);
        assert!(errors.iter().any(|e| matches!(e, ConfigError::Plc { .. })));
        assert_eq!(
            errors.iter().filter(|e| matches!(e, ConfigError::Setting(_))).count(),
            2
        );

        let link = config.plcs["plc1"].link_options();
        assert_eq!(
            link.health_interval,
            Some(Duration::from_secs_f64(MAX_SETTING_SECS))
        );
        assert_eq!(config.alert_throttle(), Duration::from_secs_f64(MAX_SETTING_SECS));
        assert_eq!(config.snapshot_throttle(), Duration::ZERO);
    }
}
