//! The long-running `run` command.

use std::{
    sync::{Arc, Once},
    time::Duration,
};

use anyhow::{Context, Result, bail};
use crossbeam_channel::{Receiver, bounded, select};
use ml_core::Scorer;
use monitor::{
    AlertDispatcher, AlertHandler, AuditLog, CameraWorkerConfig, ChannelSink, FleetSupervisor,
    SnapshotWriter, SystemConfig,
    config::{CaptureBackend, ModelConfig, PlcConfig},
    telemetry,
};
use plc_link::PlcConnector;
use tracing::{error, info, warn};
use video_ingest::{FfmpegConnector, FfmpegOptions, SourceConnector};

use crate::cli::GlobalArgs;

const ALERT_QUEUE: usize = 256;
const STATUS_INTERVAL: Duration = Duration::from_secs(30);

pub fn run(args: &GlobalArgs) -> Result<()> {
    let config = SystemConfig::load(&args.config)
        .with_context(|| format!("failed to load {}", args.config.display()))?;
    telemetry::init_metrics(args.metrics_addr).context("failed to install metrics recorder")?;

    let (sink, events) = ChannelSink::bounded(ALERT_QUEUE);
    let handlers: Vec<Box<dyn AlertHandler>> = vec![
        Box::new(AuditLog::new(&config.logs_dir, config.alert_throttle())),
        Box::new(SnapshotWriter::new(&config.artifacts_dir, config.snapshot_throttle())),
    ];
    let dispatcher = AlertDispatcher::spawn(events, handlers).context("failed to start alert dispatcher")?;

    let (fleet, report) = FleetSupervisor::from_config(
        &config,
        &load_scorer,
        &make_connector,
        &make_plc,
        Arc::new(sink),
    );
    for err in &report.rejected {
        error!("configuration: {err}");
    }
    for (model, reason) in &report.failed_models {
        error!(model = %model, "model unavailable: {reason}");
    }
    if fleet.camera_ids().next().is_none() {
        bail!("no camera could be set up from {}", args.config.display());
    }

    let shutdown = shutdown_signal();
    let started = fleet.start_all();
    for err in &started.failed {
        error!("{err}");
    }
    if started.started.is_empty() {
        fleet.stop_all();
        bail!("no camera started");
    }

    loop {
        select! {
            recv(shutdown) -> _ => break,
            default(STATUS_INTERVAL) => log_status(&fleet),
        }
    }

    info!("shutting down");
    for err in fleet.stop_all() {
        warn!("{err}");
    }
    if let Err(err) = dispatcher.shutdown() {
        warn!("alert dispatcher did not stop cleanly: {err}");
    }
    Ok(())
}

/// Receiver that yields once Ctrl+C is pressed.
fn shutdown_signal() -> Receiver<()> {
    static CTRL_HANDLER: Once = Once::new();
    let (tx, rx) = bounded(1);
    CTRL_HANDLER.call_once(move || {
        if let Err(err) = ctrlc::set_handler(move || {
            let _ = tx.try_send(());
        }) {
            warn!("Failed to install Ctrl+C handler: {err}");
        }
    });
    rx
}

fn log_status(fleet: &FleetSupervisor) {
    for id in fleet.camera_ids() {
        let Some(worker) = fleet.worker(id) else {
            continue;
        };
        let health = worker.health();
        let stats = worker.stats();
        let alarms = worker
            .latest_snapshot()
            .map(|snapshot| {
                snapshot
                    .alarms
                    .iter()
                    .map(|a| format!("{}={:?}({:.2})", a.kind, a.state, a.metric))
                    .collect::<Vec<_>>()
                    .join(" ")
            })
            .unwrap_or_default();
        info!(
            camera = %id,
            stream = %health.stream,
            frames = health.frames_captured,
            inference_avg_ms = format!("{:.1}", stats.avg_ms),
            "{alarms}"
        );
    }
    for link in fleet.links() {
        info!(link = %link.id(), state = %link.state(), epoch = link.epoch(), "PLC status");
    }
}

#[cfg(feature = "with-tch")]
fn load_scorer(id: &str, model: &ModelConfig) -> Result<Box<dyn Scorer>> {
    use ml_core::{TorchScorer, TorchScorerOptions, tch::Device};

    let options = TorchScorerOptions {
        device: if model.cpu { Device::Cpu } else { Device::cuda_if_available() },
        input_size: (i64::from(model.input_width), i64::from(model.input_height)),
        confidence_threshold: model.min_confidence,
        labels: model.classes.clone(),
    };
    let name = model.name.clone().unwrap_or_else(|| id.to_string());
    let scorer = TorchScorer::load(name, &model.path, options)
        .with_context(|| format!("failed to load {}", model.path.display()))?;
    Ok(Box::new(scorer))
}

#[cfg(not(feature = "with-tch"))]
fn load_scorer(id: &str, _model: &ModelConfig) -> Result<Box<dyn Scorer>> {
    Err(anyhow::anyhow!("model {id:?}: built without the `with-tch` feature; no scorer backend available"))
}

fn make_connector(camera: &CameraWorkerConfig) -> Arc<dyn SourceConnector> {
    let capture = &camera.capture;
    match capture.backend {
        #[cfg(feature = "opencv")]
        CaptureBackend::Opencv => Arc::new(video_ingest::OpencvConnector::new(
            camera.source.clone(),
            video_ingest::OpencvOptions {
                output: capture.output,
                ..video_ingest::OpencvOptions::default()
            },
        )),
        #[cfg(not(feature = "opencv"))]
        CaptureBackend::Opencv => {
            warn!(camera = %camera.camera_id, "built without OpenCV; using the FFmpeg backend");
            ffmpeg(camera)
        }
        CaptureBackend::Ffmpeg => ffmpeg(camera),
    }
}

fn ffmpeg(camera: &CameraWorkerConfig) -> Arc<dyn SourceConnector> {
    Arc::new(FfmpegConnector::new(
        camera.source.clone(),
        FfmpegOptions {
            output: camera.capture.output,
            use_nvdec: camera.capture.use_nvdec,
            ..FfmpegOptions::default()
        },
    ))
}

fn make_plc(_id: &str, plc: &PlcConfig) -> Arc<dyn PlcConnector> {
    Arc::new(plc.connector())
}
