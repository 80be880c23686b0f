//! Per-camera control loop.
//!
//! A [`CameraWorker`] owns one [`ReconnectingStream`] and one detection
//! thread. Capture runs at the source rate; the detection thread wakes on its
//! own cadence, scores the newest frame under the bound scorer's lock and
//! drives each configured alarm through its debouncer and coordinator.

use std::{
    collections::BTreeMap,
    io,
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicI64, Ordering},
    },
    thread::JoinHandle,
    time::Instant,
};

use chrono::{DateTime, TimeZone, Utc};
use crossbeam_channel::{Receiver, RecvTimeoutError, bounded};
use link_core::{ConnectionState, JoinError, StopHandle, StopToken, spawn_thread, stop_pair};
use ml_core::Detection;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, info_span, warn};
use video_ingest::{Frame, ReconnectingStream, Resolution, SourceConnector};

use crate::{
    alarm::{AlarmCoordinator, AlarmKind, AlarmOutput, AlarmState, DriveOutcome, Evaluation},
    alert::AlertSink,
    config::{AlarmSpec, CameraWorkerConfig, ConfigError},
    debounce::{DebouncePolicy, Debouncer},
    registry::{ScorerBinding, ScorerRegistry, UnknownScorer},
    roi::ScaledRoi,
    stats::{InferenceStats, InferenceSummary},
};

/// Collaborators a worker is built against.
pub struct WorkerDeps {
    pub connector: Arc<dyn SourceConnector>,
    pub registry: Arc<ScorerRegistry>,
    /// Alarm outputs keyed by PLC id.
    pub outputs: BTreeMap<String, Arc<dyn AlarmOutput>>,
    pub sink: Arc<dyn AlertSink>,
}

#[derive(Debug, Error)]
pub enum StartError {
    #[error(transparent)]
    UnknownScorer(#[from] UnknownScorer),
    #[error("failed to spawn worker thread: {0}")]
    Spawn(#[from] io::Error),
    #[error("the previous detection thread has not exited yet")]
    StillStopping,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CycleStatus {
    /// A frame was scored and the alarms evaluated.
    Scored,
    /// Nothing captured yet.
    NoFrame,
    /// The newest frame is older than the configured maximum age.
    StaleFrame,
    /// The scorer failed; alarm values were left unchanged.
    ScorerFailed,
}

#[derive(Debug, Clone, Serialize)]
pub struct AlarmSnapshot {
    pub kind: AlarmKind,
    pub state: AlarmState,
    pub metric: f32,
    pub consecutive: u32,
    pub frames_since_change: u64,
    pub last_changed: Option<DateTime<Utc>>,
    /// Whether the PLC bit is known to match `state`.
    pub delivered: bool,
}

/// Outcome of the most recent detection cycle.
#[derive(Debug, Clone, Serialize)]
pub struct CycleSnapshot {
    pub camera: String,
    pub cycle: u64,
    pub at: DateTime<Utc>,
    pub status: CycleStatus,
    pub frame_sequence: Option<u64>,
    /// The frame had already been scored by an earlier cycle.
    pub reused_frame: bool,
    pub detections: usize,
    pub inference_ms: Option<f64>,
    pub wait_ms: Option<f64>,
    pub alarms: Vec<AlarmSnapshot>,
}

#[derive(Debug, Clone, Serialize)]
pub struct WorkerHealth {
    pub running: bool,
    /// Detection thread is still alive.
    pub driver_alive: bool,
    /// A stop timed out and its detection thread has not exited yet.
    pub stopping: bool,
    pub last_cycle: Option<DateTime<Utc>>,
    pub stream: ConnectionState,
    pub frames_captured: u64,
}

/// State the detection thread reads and the accessors publish.
struct Shared {
    snapshot: Mutex<Option<Arc<CycleSnapshot>>>,
    stats: Mutex<InferenceStats>,
    /// Unix millis of the last cycle start, 0 before the first.
    heartbeat: AtomicI64,
}

/// One alarm of the camera: ROI, debouncer and coordinator.
struct AlarmChannel {
    spec: AlarmSpec,
    debouncer: Debouncer,
    coordinator: AlarmCoordinator,
    scaled: Option<(Resolution, ScaledRoi)>,
}

impl AlarmChannel {
    fn roi(&mut self, frame: Resolution) -> &ScaledRoi {
        if self.scaled.as_ref().is_some_and(|(res, _)| *res != frame) {
            self.scaled = None;
        }
        let spec = &self.spec;
        let (_, roi) = self.scaled.get_or_insert_with(|| {
            let scaled = spec.roi.scaled_to(frame);
            if scaled.is_degenerate() {
                warn!(
                    kind = %spec.kind,
                    resolution = %frame,
                    "ROI is degenerate at this resolution; alarm cannot trigger"
                );
            }
            (frame, scaled)
        });
        roi
    }

    /// Per-cycle metric: a person count or a covered fraction.
    fn metric(&mut self, detections: &[Detection], frame: Resolution) -> f32 {
        let label = self.spec.label.clone();
        let min_confidence = self.spec.min_confidence;
        let policy = self.spec.policy;
        let roi = self.roi(frame);
        let relevant = detections
            .iter()
            .filter(|d| d.label == label && d.confidence >= min_confidence);
        match policy {
            DebouncePolicy::ConsecutiveCount { .. } => {
                relevant.filter(|d| roi.contains_centroid(&d.shape)).count() as f32
            }
            DebouncePolicy::RatioThreshold { .. } => {
                roi.mask_fraction(relevant.map(|d| &d.shape), frame)
            }
        }
    }

    fn snapshot(&self) -> AlarmSnapshot {
        AlarmSnapshot {
            kind: self.spec.kind,
            state: self.coordinator.state(),
            metric: self.debouncer.last_metric(),
            consecutive: self.debouncer.consecutive(),
            frames_since_change: self.debouncer.frames_since_change(),
            last_changed: self.debouncer.last_changed(),
            delivered: self.coordinator.is_delivered(),
        }
    }
}

/// Everything the detection thread mutates. Handed back on a clean stop so
/// the next start keeps the confirmed hardware state.
struct Cycle {
    channels: Vec<AlarmChannel>,
    count: u64,
    last_scored: Option<u64>,
}

impl Cycle {
    fn resync(&mut self) {
        for channel in &mut self.channels {
            channel.coordinator.resync();
        }
    }

    fn release(&mut self) {
        for channel in &mut self.channels {
            if let DriveOutcome::Failed(err) = channel.coordinator.release() {
                warn!(
                    kind = %channel.spec.kind,
                    address = %channel.coordinator.address(),
                    "failed to clear alarm bit: {err}"
                );
            }
            channel.debouncer.reset();
        }
    }
}

struct CycleRuntime {
    stop: StopHandle,
    thread: JoinHandle<Cycle>,
    /// Disconnects when the detection thread exits, panics included.
    exited: Receiver<()>,
}

pub struct CameraWorker {
    config: Arc<CameraWorkerConfig>,
    stream: Arc<ReconnectingStream>,
    registry: Arc<ScorerRegistry>,
    outputs: BTreeMap<String, Arc<dyn AlarmOutput>>,
    sink: Arc<dyn AlertSink>,
    shared: Arc<Shared>,
    runtime: Mutex<Option<CycleRuntime>>,
    /// Detection thread of a stop that timed out. Blocks `start` until it exits.
    stopping: Mutex<Option<JoinHandle<Cycle>>>,
    parked: Mutex<Option<Cycle>>,
}

impl CameraWorker {
    /// Fails when an alarm targets a PLC with no output.
    pub fn new(config: CameraWorkerConfig, deps: WorkerDeps) -> Result<Self, ConfigError> {
        for alarm in &config.alarms {
            if !deps.outputs.contains_key(&alarm.plc) {
                return Err(ConfigError::UnknownPlc {
                    camera: config.camera_id.to_string(),
                    plc: alarm.plc.clone(),
                });
            }
        }
        let stream = ReconnectingStream::new(
            config.camera_id.clone(),
            deps.connector,
            config.capture.stream.clone(),
        );
        let worker = Self {
            config: Arc::new(config),
            stream: Arc::new(stream),
            registry: deps.registry,
            outputs: deps.outputs,
            sink: deps.sink,
            shared: Arc::new(Shared {
                snapshot: Mutex::new(None),
                stats: Mutex::new(InferenceStats::default()),
                heartbeat: AtomicI64::new(0),
            }),
            runtime: Mutex::new(None),
            stopping: Mutex::new(None),
            parked: Mutex::new(None),
        };
        *lock(&worker.parked) = Some(worker.build_cycle(false));
        Ok(worker)
    }

    fn build_cycle(&self, unknown_state: bool) -> Cycle {
        let channels = self
            .config
            .alarms
            .iter()
            .filter_map(|spec| {
                let output = self.outputs.get(&spec.plc)?.clone();
                let coordinator = AlarmCoordinator::new(
                    self.config.camera_id.clone(),
                    spec.kind,
                    spec.address,
                    output,
                    self.sink.clone(),
                );
                Some(AlarmChannel {
                    spec: spec.clone(),
                    debouncer: Debouncer::new(spec.policy),
                    coordinator: if unknown_state {
                        coordinator.assume_unknown()
                    } else {
                        coordinator
                    },
                    scaled: None,
                })
            })
            .collect();
        Cycle {
            channels,
            count: 0,
            last_scored: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.config.camera_id
    }

    pub fn config(&self) -> &CameraWorkerConfig {
        &self.config
    }

    /// Bind the scorer, start capture and spawn the detection thread. Fails
    /// with [`StartError::StillStopping`] while a timed-out stop is pending.
    pub fn start(&self) -> Result<(), StartError> {
        let mut runtime = lock(&self.runtime);
        if runtime.is_some() {
            return Ok(());
        }
        if !self.reap_stopping(false) {
            return Err(StartError::StillStopping);
        }
        let binding = self
            .registry
            .bind(&self.config.model, self.config.camera_id.clone())?;
        self.stream.start()?;

        // A cycle lost to a panic left the bits in an unknown state.
        let cycle = lock(&self.parked)
            .take()
            .unwrap_or_else(|| self.build_cycle(true));
        let (stop, token) = stop_pair();
        let (exited_tx, exited) = bounded::<()>(0);
        let driver = Driver {
            config: self.config.clone(),
            stream: self.stream.clone(),
            binding,
            shared: self.shared.clone(),
        };
        let thread = match spawn_thread(self.thread_name(), move || {
            let _exited = exited_tx;
            driver.run(cycle, &token)
        }) {
            Ok(thread) => thread,
            Err(err) => {
                if let Err(stop_err) = self.stream.stop() {
                    warn!(camera = %self.config.camera_id, "capture did not stop cleanly: {stop_err}");
                }
                return Err(err.into());
            }
        };
        *runtime = Some(CycleRuntime {
            stop,
            thread,
            exited,
        });
        info!(
            camera = %self.config.camera_id,
            source = %self.stream.describe(),
            model = %self.config.model,
            "camera worker started"
        );
        Ok(())
    }

    /// Stop detection, clear active alarm bits, then stop capture. Safe to
    /// call at any time; waits at most the configured stop timeout per thread.
    ///
    /// A detection thread that misses the timeout is kept until it exits. It
    /// discards the inference it is blocked in and clears its own bits, and
    /// `start` is refused until then.
    pub fn stop(&self) -> Result<(), JoinError> {
        let exited = {
            let mut runtime = lock(&self.runtime);
            let Some(current) = runtime.take() else {
                return Ok(());
            };
            current.stop.stop();
            *lock(&self.stopping) = Some(current.thread);
            current.exited
        };
        let detection = match exited.recv_timeout(self.config.stop_timeout) {
            Err(RecvTimeoutError::Timeout) => {
                let err = JoinError::Timeout {
                    name: self.thread_name(),
                    timeout: self.config.stop_timeout,
                };
                warn!(camera = %self.config.camera_id, "detection thread did not stop cleanly: {err}");
                Err(err)
            }
            _ if self.reap_stopping(true) => Ok(()),
            _ => Err(JoinError::Panicked {
                name: self.thread_name(),
            }),
        };
        let capture = self.stream.stop();
        info!(camera = %self.config.camera_id, "camera worker stopped");
        detection.and(capture)
    }

    /// Join a detection thread left by `stop` and park its cycle. With
    /// `wait` unset, a thread still running is left alone and `false`
    /// returned. A panicked thread loses its cycle.
    fn reap_stopping(&self, wait: bool) -> bool {
        let mut stopping = lock(&self.stopping);
        let Some(thread) = stopping.take() else {
            return true;
        };
        if !wait && !thread.is_finished() {
            *stopping = Some(thread);
            return false;
        }
        drop(stopping);
        match thread.join() {
            Ok(cycle) => {
                *lock(&self.parked) = Some(cycle);
                true
            }
            Err(_) => {
                warn!(camera = %self.config.camera_id, "detection thread panicked");
                !wait
            }
        }
    }

    fn thread_name(&self) -> String {
        format!("detect-{}", self.config.camera_id)
    }

    /// A timed-out stop is still waiting for its detection thread.
    pub fn is_stopping(&self) -> bool {
        lock(&self.stopping)
            .as_ref()
            .is_some_and(|thread| !thread.is_finished())
    }

    pub fn is_running(&self) -> bool {
        lock(&self.runtime).is_some()
    }

    /// Running, but the detection thread has exited (it only exits on stop,
    /// so this means it panicked).
    pub fn driver_died(&self) -> bool {
        lock(&self.runtime)
            .as_ref()
            .is_some_and(|runtime| runtime.thread.is_finished())
    }

    /// Newest captured frame, for display.
    pub fn latest_frame(&self) -> Option<Arc<Frame>> {
        self.stream.latest_frame()
    }

    pub fn latest_snapshot(&self) -> Option<Arc<CycleSnapshot>> {
        lock(&self.shared.snapshot).clone()
    }

    pub fn stats(&self) -> InferenceSummary {
        lock(&self.shared.stats).summary()
    }

    pub fn stream_state(&self) -> ConnectionState {
        self.stream.state()
    }

    pub fn health(&self) -> WorkerHealth {
        let (running, driver_alive) = match lock(&self.runtime).as_ref() {
            Some(runtime) => (true, !runtime.thread.is_finished()),
            None => (false, false),
        };
        let beat = self.shared.heartbeat.load(Ordering::Relaxed);
        WorkerHealth {
            running,
            driver_alive,
            stopping: self.is_stopping(),
            last_cycle: (beat > 0)
                .then(|| Utc.timestamp_millis_opt(beat).single())
                .flatten(),
            stream: self.stream.state(),
            frames_captured: self.stream.frames_captured(),
        }
    }
}

impl Drop for CameraWorker {
    fn drop(&mut self) {
        if let Err(err) = self.stop() {
            warn!(camera = %self.config.camera_id, "worker did not stop cleanly: {err}");
        }
    }
}

/// Detection thread body.
struct Driver {
    config: Arc<CameraWorkerConfig>,
    stream: Arc<ReconnectingStream>,
    binding: ScorerBinding,
    shared: Arc<Shared>,
}

impl Driver {
    fn run(self, mut cycle: Cycle, stop: &StopToken) -> Cycle {
        let interval = self.config.detection_interval;
        let mut next = Instant::now();
        loop {
            if stop.sleep_until(next) {
                break;
            }
            next += interval;
            let now = Instant::now();
            if next < now {
                // Overran the cadence; skip the missed slots rather than burst.
                next = now + interval;
            }
            let span = info_span!("monitor.cycle", camera = %self.config.camera_id, cycle = cycle.count + 1);
            let _entered = span.enter();
            self.run_once(&mut cycle, stop);
        }
        cycle.release();
        debug!(camera = %self.config.camera_id, "detection loop exited");
        cycle
    }

    fn run_once(&self, cycle: &mut Cycle, stop: &StopToken) {
        let at = Utc::now();
        self.shared
            .heartbeat
            .store(at.timestamp_millis(), Ordering::Relaxed);
        cycle.count += 1;

        let mut snapshot = CycleSnapshot {
            camera: self.config.camera_id.to_string(),
            cycle: cycle.count,
            at,
            status: CycleStatus::Scored,
            frame_sequence: None,
            reused_frame: false,
            detections: 0,
            inference_ms: None,
            wait_ms: None,
            alarms: Vec::new(),
        };

        match self.stream.latest_frame() {
            None => {
                snapshot.status = CycleStatus::NoFrame;
                cycle.resync();
            }
            Some(frame) => {
                snapshot.frame_sequence = Some(frame.sequence);
                let age_ms = frame.age_ms(at.timestamp_millis());
                if age_ms > self.config.max_frame_age.as_millis() as i64 {
                    debug!(camera = %self.config.camera_id, age_ms, "newest frame is stale; skipping detection");
                    snapshot.status = CycleStatus::StaleFrame;
                    cycle.resync();
                } else {
                    snapshot.reused_frame = cycle.last_scored == Some(frame.sequence);
                    cycle.last_scored = Some(frame.sequence);
                    if !self.score(cycle, &frame, at, &mut snapshot, stop) {
                        return;
                    }
                }
            }
        }

        snapshot.alarms = cycle.channels.iter().map(AlarmChannel::snapshot).collect();
        *lock(&self.shared.snapshot) = Some(Arc::new(snapshot));
    }

    /// Returns false when a stop arrived during inference; the result is
    /// then dropped so nothing reaches the PLC after the worker stopped.
    fn score(
        &self,
        cycle: &mut Cycle,
        frame: &Arc<Frame>,
        at: DateTime<Utc>,
        snapshot: &mut CycleSnapshot,
        stop: &StopToken,
    ) -> bool {
        let (result, timing) = self.binding.infer(frame);
        if stop.is_stopped() {
            debug!(camera = %self.config.camera_id, "stopped during inference; result discarded");
            return false;
        }
        snapshot.wait_ms = Some(timing.waited.as_secs_f64() * 1000.0);
        let detections = match result {
            Ok(detections) => {
                let mut stats = lock(&self.shared.stats);
                stats.record(timing.inference);
                metrics::gauge!("coalguard_inference_avg_ms", "camera" => self.config.camera_id.to_string())
                    .set(stats.summary().avg_ms);
                detections
            }
            Err(err) => {
                lock(&self.shared.stats).record_failure();
                metrics::counter!(
                    "coalguard_scorer_failures_total",
                    "camera" => self.config.camera_id.to_string(),
                    "model" => self.binding.model_id().to_string()
                )
                .increment(1);
                warn!(camera = %self.config.camera_id, model = %self.binding.model_id(), "scorer failed: {err}");
                snapshot.status = CycleStatus::ScorerFailed;
                cycle.resync();
                return true;
            }
        };
        snapshot.inference_ms = Some(timing.inference.as_secs_f64() * 1000.0);
        snapshot.detections = detections.len();

        for channel in &mut cycle.channels {
            let metric = channel.metric(&detections, frame.resolution);
            let update = channel.debouncer.observe_at(metric, at);
            let roi = channel.roi(frame.resolution).points().to_vec();
            channel.coordinator.drive(Evaluation {
                value: update.value,
                metric,
                at,
                frame: Some(frame),
                roi: &roi,
            });
        }
        true
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use std::{
        collections::VecDeque,
        sync::atomic::{AtomicUsize, Ordering as AtomicOrdering},
        time::Duration,
    };

    use ml_core::{Point, Scorer, ScorerError, Shape};
    use plc_link::{BitAddress, PlcError};
    use video_ingest::{CaptureError, FrameSource, StreamOptions};

    use super::*;
    use crate::{alert::NullSink, config::CaptureBackend, config::CaptureSettings, roi::RoiPolygon};

    struct StillSource;

    impl FrameSource for StillSource {
        fn read_frame(&mut self) -> Result<Frame, CaptureError> {
            std::thread::sleep(Duration::from_millis(5));
            Ok(Frame::bgr8(vec![0; 100 * 100 * 3], Resolution::new(100, 100)))
        }
    }

    struct StillCamera;

    impl SourceConnector for StillCamera {
        fn connect(&self) -> Result<Box<dyn FrameSource>, CaptureError> {
            Ok(Box::new(StillSource))
        }

        fn describe(&self) -> String {
            "still".into()
        }
    }

    /// Replays scripted outputs, then repeats the last.
    struct Script(VecDeque<Result<Vec<Detection>, ScorerError>>);

    impl Scorer for Script {
        fn infer(&mut self, _frame: &Frame) -> Result<Vec<Detection>, ScorerError> {
            match self.0.len() {
                0 => Ok(Vec::new()),
                1 => match &self.0[0] {
                    Ok(d) => Ok(d.clone()),
                    Err(_) => Err(ScorerError::Inference("scripted".into())),
                },
                _ => self.0.pop_front().unwrap_or(Ok(Vec::new())),
            }
        }

        fn name(&self) -> &str {
            "script"
        }
    }

    /// Sees a person every time, slowly. Counts calls on entry.
    struct Slow {
        delay: Duration,
        calls: Arc<AtomicUsize>,
    }

    impl Scorer for Slow {
        fn infer(&mut self, _frame: &Frame) -> Result<Vec<Detection>, ScorerError> {
            self.calls.fetch_add(1, AtomicOrdering::SeqCst);
            std::thread::sleep(self.delay);
            Ok(vec![person()])
        }

        fn name(&self) -> &str {
            "slow"
        }
    }

    #[derive(Default)]
    struct Bits(Mutex<Vec<bool>>);

    impl AlarmOutput for Bits {
        fn id(&self) -> &str {
            "plc1"
        }

        fn is_connected(&self) -> bool {
            true
        }

        fn epoch(&self) -> u64 {
            1
        }

        fn write_bit(&self, _address: BitAddress, value: bool) -> Result<(), PlcError> {
            self.0.lock().unwrap().push(value);
            Ok(())
        }
    }

    fn person() -> Detection {
        Detection::new("person", 0.9, Shape::from_center(50.0, 50.0, 10.0, 10.0))
    }

    fn config() -> CameraWorkerConfig {
        let square = vec![
            Point::new(0.0, 0.0),
            Point::new(100.0, 0.0),
            Point::new(100.0, 100.0),
            Point::new(0.0, 100.0),
        ];
        CameraWorkerConfig {
            camera_id: "cam1".into(),
            name: "cam1".into(),
            source: "still".into(),
            capture: CaptureSettings {
                backend: CaptureBackend::Ffmpeg,
                output: None,
                use_nvdec: false,
                stream: StreamOptions {
                    stall_timeout: None,
                    ..StreamOptions::default()
                },
            },
            model: "m".into(),
            detection_interval: Duration::from_millis(10),
            max_frame_age: Duration::from_secs(5),
            alarms: vec![AlarmSpec {
                kind: AlarmKind::Person,
                roi: RoiPolygon::new(square, Resolution::new(100, 100)).unwrap(),
                policy: DebouncePolicy::ConsecutiveCount { threshold: 3 },
                label: "person".into(),
                min_confidence: 0.5,
                plc: "plc1".into(),
                address: BitAddress::new(300, 6, 0).unwrap(),
            }],
            stop_timeout: Duration::from_secs(2),
        }
    }

    fn worker(script: Script, bits: &Arc<Bits>) -> CameraWorker {
        worker_with(config(), Box::new(script), bits)
    }

    fn worker_with(config: CameraWorkerConfig, scorer: Box<dyn Scorer>, bits: &Arc<Bits>) -> CameraWorker {
        let mut registry = ScorerRegistry::new();
        registry.insert("m", scorer);
        let mut outputs: BTreeMap<String, Arc<dyn AlarmOutput>> = BTreeMap::new();
        outputs.insert("plc1".into(), bits.clone());
        CameraWorker::new(
            config,
            WorkerDeps {
                connector: Arc::new(StillCamera),
                registry: Arc::new(registry),
                outputs,
                sink: Arc::new(NullSink),
            },
        )
        .unwrap()
    }

    fn wait_for(what: impl Fn() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if what() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        false
    }

    #[test]
    fn missing_output_is_a_config_error() {
        let mut registry = ScorerRegistry::new();
        registry.insert("m", Box::new(Script(VecDeque::new())));
        let err = CameraWorker::new(
            config(),
            WorkerDeps {
                connector: Arc::new(StillCamera),
                registry: Arc::new(registry),
                outputs: BTreeMap::new(),
                sink: Arc::new(NullSink),
            },
        )
        .err()
        .unwrap();
        assert!(matches!(err, ConfigError::UnknownPlc { .. }));
    }

    #[test]
    fn raises_then_releases_on_stop() {
        let bits = Arc::new(Bits::default());
        let worker = worker(Script(VecDeque::from([Ok(vec![person()])])), &bits);
        worker.start().unwrap();
        assert!(wait_for(|| bits.0.lock().unwrap().as_slice() == [true]));
        let snapshot = worker.latest_snapshot().unwrap();
        assert_eq!(snapshot.alarms[0].state, AlarmState::AlarmActive);
        assert!(worker.health().driver_alive);

        worker.stop().unwrap();
        assert_eq!(*bits.0.lock().unwrap(), vec![true, false]);
        assert!(!worker.is_running());
    }

    #[test]
    fn scorer_failure_keeps_alarm_state() {
        let bits = Arc::new(Bits::default());
        let script = Script(VecDeque::from([
            Ok(vec![person()]),
            Ok(vec![person()]),
            Ok(vec![person()]),
            Err(ScorerError::Inference("boom".into())),
        ]));
        let worker = worker(script, &bits);
        worker.start().unwrap();
        assert!(wait_for(|| worker.stats().failures >= 2));
        let snapshot = worker.latest_snapshot().unwrap();
        assert_eq!(snapshot.status, CycleStatus::ScorerFailed);
        assert_eq!(snapshot.alarms[0].state, AlarmState::AlarmActive);
        assert_eq!(*bits.0.lock().unwrap(), vec![true]);
        worker.stop().unwrap();
    }

    #[test]
    fn timed_out_stop_still_clears_the_bit_and_blocks_restart() {
        let bits = Arc::new(Bits::default());
        let calls = Arc::new(AtomicUsize::new(0));
        let mut config = config();
        config.alarms[0].policy = DebouncePolicy::ConsecutiveCount { threshold: 1 };
        config.stop_timeout = Duration::from_millis(100);
        let scorer = Slow {
            delay: Duration::from_millis(400),
            calls: calls.clone(),
        };
        let worker = worker_with(config, Box::new(scorer), &bits);

        worker.start().unwrap();
        assert!(wait_for(|| bits.0.lock().unwrap().as_slice() == [true]));
        // The second inference is now in flight and outlasts the stop timeout.
        assert!(wait_for(|| calls.load(AtomicOrdering::SeqCst) >= 2));
        let err = worker.stop().unwrap_err();
        assert!(matches!(err, JoinError::Timeout { .. }));
        assert!(!worker.is_running());
        assert!(worker.is_stopping());
        assert!(worker.health().stopping);
        assert!(matches!(worker.start(), Err(StartError::StillStopping)));

        // The late result is discarded and the thread clears its own bit.
        assert!(wait_for(|| !worker.is_stopping()));
        assert_eq!(*bits.0.lock().unwrap(), vec![true, false]);
        assert_eq!(calls.load(AtomicOrdering::SeqCst), 2);

        worker.start().unwrap();
        assert!(worker.is_running());
        let _ = worker.stop();
        assert!(wait_for(|| !worker.is_stopping()));
        assert_eq!(*bits.0.lock().unwrap(), vec![true, false]);
    }

    #[test]
    fn health_serializes_with_stream_state() {
        let bits = Arc::new(Bits::default());
        let worker = worker(Script(VecDeque::new()), &bits);
        let json = serde_json::to_value(worker.health()).unwrap();
        assert_eq!(json["stream"], "disconnected");
        assert_eq!(json["running"], false);
        assert_eq!(json["stopping"], false);
    }
}
