//! The set of camera workers, the PLC links they share and the scorer
//! registry they are bound to.

use std::{
    collections::{BTreeMap, BTreeSet},
    sync::{Arc, Mutex, PoisonError},
    thread::{self, JoinHandle},
    time::Duration,
};

use chrono::Utc;
use link_core::{JoinError, StopHandle, StopToken, join_within, spawn_thread, stop_pair};
use ml_core::Scorer;
use plc_link::{PlcConnector, PlcLink};
use thiserror::Error;
use tracing::{error, info, warn};
use video_ingest::SourceConnector;

use crate::{
    alarm::AlarmOutput,
    alert::AlertSink,
    config::{CameraWorkerConfig, ConfigError, ModelConfig, PlcConfig, SystemConfig},
    registry::ScorerRegistry,
    worker::{CameraWorker, StartError, WorkerDeps, WorkerHealth},
};

/// Loads the scorer for one configured model.
pub type ScorerFactory<'a> = dyn Fn(&str, &ModelConfig) -> anyhow::Result<Box<dyn Scorer>> + 'a;

/// Builds the video connector for one validated camera.
pub type ConnectorFactory<'a> = dyn Fn(&CameraWorkerConfig) -> Arc<dyn SourceConnector> + 'a;

/// Builds the fieldbus connector for one configured PLC.
pub type PlcFactory<'a> = dyn Fn(&str, &PlcConfig) -> Arc<dyn PlcConnector> + 'a;

#[derive(Debug, Error)]
pub enum FleetError {
    #[error("no camera named {0:?}")]
    UnknownCamera(String),
    #[error("camera {camera}: {source}")]
    Start {
        camera: String,
        #[source]
        source: StartError,
    },
    #[error("camera {camera}: {source}")]
    Stop {
        camera: String,
        #[source]
        source: JoinError,
    },
}

/// Cameras and models that could not be set up from configuration.
#[derive(Debug, Default)]
pub struct BuildReport {
    pub rejected: Vec<ConfigError>,
    /// Models that failed to load, with the loader's message.
    pub failed_models: Vec<(String, String)>,
}

/// Per-camera outcome of [`FleetSupervisor::start_all`].
#[derive(Debug, Default)]
pub struct StartReport {
    pub started: Vec<String>,
    pub failed: Vec<FleetError>,
}

#[derive(Debug, Clone, Copy)]
pub struct WatchdogOptions {
    pub poll_interval: Duration,
    /// A running driver with no cycle for this long is reported as stalled.
    pub stall_after: Duration,
}

impl Default for WatchdogOptions {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            stall_after: Duration::from_secs(30),
        }
    }
}

struct Watchdog {
    stop: StopHandle,
    thread: JoinHandle<()>,
}

pub struct FleetSupervisor {
    registry: Arc<ScorerRegistry>,
    links: BTreeMap<String, Arc<PlcLink>>,
    workers: Arc<BTreeMap<String, Arc<CameraWorker>>>,
    watchdog_options: WatchdogOptions,
    watchdog: Mutex<Option<Watchdog>>,
}

impl FleetSupervisor {
    /// Assemble from ready-made parts. Every worker must already have been
    /// built against `links`.
    pub fn new(
        registry: Arc<ScorerRegistry>,
        links: BTreeMap<String, Arc<PlcLink>>,
        workers: Vec<CameraWorker>,
    ) -> Self {
        Self {
            registry,
            links,
            workers: Arc::new(
                workers
                    .into_iter()
                    .map(|w| (w.id().to_string(), Arc::new(w)))
                    .collect(),
            ),
            watchdog_options: WatchdogOptions::default(),
            watchdog: Mutex::new(None),
        }
    }

    /// Build links, scorers and workers from configuration. A bad camera or
    /// model only removes the cameras that depend on it.
    pub fn from_config(
        config: &SystemConfig,
        load_scorer: &ScorerFactory<'_>,
        make_connector: &ConnectorFactory<'_>,
        make_plc: &PlcFactory<'_>,
        sink: Arc<dyn AlertSink>,
    ) -> (Self, BuildReport) {
        let mut report = BuildReport::default();
        report.rejected.extend(config.validate_shared());
        let mut duplicates = BTreeSet::new();
        let mut bad_plcs = BTreeSet::new();
        for err in &report.rejected {
            match err {
                ConfigError::DuplicateCamera(id) => duplicates.insert(id.clone()),
                ConfigError::Plc { plc, .. } => bad_plcs.insert(plc.clone()),
                _ => false,
            };
        }

        // Cameras addressing a skipped PLC fail worker construction below.
        let mut links = BTreeMap::new();
        for (id, plc) in config.plcs.iter().filter(|(id, _)| !bad_plcs.contains(*id)) {
            let connector = make_plc(id, plc);
            links.insert(
                id.clone(),
                Arc::new(PlcLink::new(id.as_str(), connector, plc.link_options())),
            );
        }

        let mut validated = Vec::new();
        for camera in config.enabled_cameras() {
            if duplicates.contains(&camera.camera_id) {
                continue;
            }
            match config.camera(camera) {
                Ok(worker_config) => validated.push(worker_config),
                Err(err) => {
                    warn!("camera disabled: {err}");
                    report.rejected.push(err);
                }
            }
        }

        // Only load models something uses.
        let wanted: BTreeSet<&str> = validated.iter().map(|c| c.model.as_str()).collect();
        let mut registry = ScorerRegistry::new();
        for id in wanted {
            let Some(model) = config.models.get(id) else {
                continue;
            };
            match load_scorer(id, model) {
                Ok(scorer) => {
                    info!(model = %id, scorer = %scorer.name(), "scorer loaded");
                    registry.insert(id, scorer);
                }
                Err(err) => {
                    error!(model = %id, "failed to load scorer: {err:#}");
                    report.failed_models.push((id.to_string(), format!("{err:#}")));
                }
            }
        }

        let outputs: BTreeMap<String, Arc<dyn AlarmOutput>> = links
            .iter()
            .map(|(id, link)| (id.clone(), link.clone() as Arc<dyn AlarmOutput>))
            .collect();
        let registry = Arc::new(registry);
        let mut workers = Vec::new();
        for worker_config in validated {
            if !registry.contains(&worker_config.model) {
                report.rejected.push(ConfigError::UnknownModel {
                    camera: worker_config.camera_id.to_string(),
                    model: worker_config.model.clone(),
                });
                continue;
            }
            let connector = make_connector(&worker_config);
            let deps = WorkerDeps {
                connector,
                registry: registry.clone(),
                outputs: outputs.clone(),
                sink: sink.clone(),
            };
            match CameraWorker::new(worker_config, deps) {
                Ok(worker) => workers.push(worker),
                Err(err) => report.rejected.push(err),
            }
        }

        (Self::new(registry, links, workers), report)
    }

    pub fn with_watchdog_options(mut self, options: WatchdogOptions) -> Self {
        self.watchdog_options = options;
        self
    }

    pub fn registry(&self) -> &Arc<ScorerRegistry> {
        &self.registry
    }

    pub fn links(&self) -> impl Iterator<Item = &Arc<PlcLink>> {
        self.links.values()
    }

    pub fn link(&self, id: &str) -> Option<&Arc<PlcLink>> {
        self.links.get(id)
    }

    pub fn camera_ids(&self) -> impl Iterator<Item = &str> {
        self.workers.keys().map(String::as_str)
    }

    pub fn worker(&self, id: &str) -> Option<&Arc<CameraWorker>> {
        self.workers.get(id)
    }

    pub fn health(&self) -> BTreeMap<String, WorkerHealth> {
        self.workers
            .iter()
            .map(|(id, worker)| (id.clone(), worker.health()))
            .collect()
    }

    /// Connect every PLC link and start every camera. One camera failing
    /// does not keep the others from starting.
    pub fn start_all(&self) -> StartReport {
        for link in self.links.values() {
            if let Err(err) = link.connect() {
                error!(link = %link.id(), "failed to start PLC link: {err}");
            }
        }
        let mut report = StartReport::default();
        for (id, worker) in self.workers.iter() {
            match worker.start() {
                Ok(()) => report.started.push(id.clone()),
                Err(source) => {
                    error!(camera = %id, "camera failed to start: {source}");
                    report.failed.push(FleetError::Start {
                        camera: id.clone(),
                        source,
                    });
                }
            }
        }
        self.start_watchdog();
        metrics::gauge!("coalguard_cameras_running").set(report.started.len() as f64);
        info!(
            started = report.started.len(),
            failed = report.failed.len(),
            "fleet started"
        );
        report
    }

    /// Stop every camera in parallel, then the PLC links.
    pub fn stop_all(&self) -> Vec<FleetError> {
        self.stop_watchdog();
        let errors: Vec<FleetError> = thread::scope(|scope| {
            let handles: Vec<_> = self
                .workers
                .iter()
                .map(|(id, worker)| (id, scope.spawn(move || worker.stop())))
                .collect();
            handles
                .into_iter()
                .filter_map(|(id, handle)| match handle.join() {
                    Ok(Ok(())) => None,
                    Ok(Err(source)) => Some(FleetError::Stop {
                        camera: id.clone(),
                        source,
                    }),
                    Err(_) => Some(FleetError::Stop {
                        camera: id.clone(),
                        source: JoinError::Panicked {
                            name: format!("stop-{id}"),
                        },
                    }),
                })
                .collect()
        });
        for link in self.links.values() {
            if let Err(err) = link.disconnect() {
                warn!(link = %link.id(), "PLC link did not stop cleanly: {err}");
            }
        }
        for err in &errors {
            warn!("{err}");
        }
        metrics::gauge!("coalguard_cameras_running").set(0.0);
        errors
    }

    pub fn start_camera(&self, id: &str) -> Result<(), FleetError> {
        let worker = self
            .workers
            .get(id)
            .ok_or_else(|| FleetError::UnknownCamera(id.to_string()))?;
        for alarm in &worker.config().alarms {
            if let Some(link) = self.links.get(&alarm.plc) {
                if let Err(err) = link.connect() {
                    error!(link = %link.id(), "failed to start PLC link: {err}");
                }
            }
        }
        worker.start().map_err(|source| FleetError::Start {
            camera: id.to_string(),
            source,
        })
    }

    pub fn stop_camera(&self, id: &str) -> Result<(), FleetError> {
        let worker = self
            .workers
            .get(id)
            .ok_or_else(|| FleetError::UnknownCamera(id.to_string()))?;
        worker.stop().map_err(|source| FleetError::Stop {
            camera: id.to_string(),
            source,
        })
    }

    fn start_watchdog(&self) {
        let mut slot = self.watchdog.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.is_some() {
            return;
        }
        let (stop, token) = stop_pair();
        let workers = self.workers.clone();
        let options = self.watchdog_options;
        match spawn_thread("fleet-watchdog", move || watch(&workers, options, &token)) {
            Ok(thread) => *slot = Some(Watchdog { stop, thread }),
            Err(err) => error!("failed to spawn fleet watchdog: {err}"),
        }
    }

    fn stop_watchdog(&self) {
        let watchdog = self
            .watchdog
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(watchdog) = watchdog {
            watchdog.stop.stop();
            // A restart in progress waits on a worker stop; bound it the same way.
            if let Err(err) = join_within(watchdog.thread, Duration::from_secs(10)) {
                warn!("fleet watchdog did not stop cleanly: {err}");
            }
        }
    }
}

impl Drop for FleetSupervisor {
    fn drop(&mut self) {
        self.stop_watchdog();
    }
}

/// Restart workers whose detection thread died; report stalled ones once.
fn watch(workers: &BTreeMap<String, Arc<CameraWorker>>, options: WatchdogOptions, stop: &StopToken) {
    let mut stalled = BTreeSet::new();
    while !stop.sleep(options.poll_interval) {
        for (id, worker) in workers {
            if worker.driver_died() {
                error!(camera = %id, "detection thread died; restarting camera");
                metrics::counter!("coalguard_worker_restarts_total", "camera" => id.clone()).increment(1);
                if let Err(err) = worker.stop() {
                    warn!(camera = %id, "stop before restart was not clean: {err}");
                }
                if let Err(err) = worker.start() {
                    error!(camera = %id, "restart failed: {err}");
                }
                stalled.remove(id);
                continue;
            }
            let health = worker.health();
            let overdue = health.running
                && health.last_cycle.is_some_and(|last| {
                    (Utc::now() - last)
                        .to_std()
                        .is_ok_and(|gap| gap > options.stall_after)
                });
            if overdue {
                if stalled.insert(id.clone()) {
                    warn!(camera = %id, "detection cycle stalled");
                }
            } else if stalled.remove(id) {
                info!(camera = %id, "detection cycle resumed");
            }
        }
    }
}
