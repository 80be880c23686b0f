//! Detection-to-alarm path of the coal facility monitor.
//!
//! Each [`CameraWorker`] scores the newest frame of its camera on a fixed
//! cadence, turns the detections into per-alarm metrics through the ROI
//! geometry in [`roi`], debounces them ([`debounce`]) and keeps the matching
//! PLC bits in line ([`alarm`]). The [`FleetSupervisor`] owns the workers,
//! the shared PLC links and the [`ScorerRegistry`] whose per-instance locks
//! serialise cameras that share a model.

pub mod alarm;
pub mod alert;
pub mod audit;
pub mod config;
pub mod debounce;
pub mod fleet;
pub mod registry;
pub mod roi;
pub mod snapshot;
pub mod stats;
pub mod telemetry;
pub mod worker;

pub use alarm::{AlarmCoordinator, AlarmKind, AlarmOutput, AlarmState, DriveOutcome, Evaluation};
pub use alert::{
    AlarmTransition, AlertDispatcher, AlertEvent, AlertHandler, AlertSink, ChannelSink,
    DeliveryFailure, NullSink,
};
pub use audit::AuditLog;
pub use config::{AlarmSpec, CameraWorkerConfig, ConfigError, SystemConfig};
pub use debounce::{DebouncePolicy, DebounceUpdate, Debouncer};
pub use fleet::{BuildReport, FleetError, FleetSupervisor, StartReport, WatchdogOptions};
pub use registry::{ScorerBinding, ScorerRegistry, UnknownScorer};
pub use roi::{RoiError, RoiPolygon, ScaledRoi};
pub use snapshot::SnapshotWriter;
pub use stats::{InferenceStats, InferenceSummary};
pub use worker::{CameraWorker, CycleSnapshot, CycleStatus, StartError, WorkerDeps, WorkerHealth};
