//! Telemetry helpers for tracing spans, Prometheus metrics and Chrome traces.

use std::{
    collections::HashMap,
    io::{self, Write},
    net::SocketAddr,
    path::{Path, PathBuf},
    sync::OnceLock,
    time::Duration,
};

use link_core::spawn_thread;
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};
use tracing_subscriber::{
    filter::{EnvFilter, filter_fn},
    fmt,
    layer::SubscriberExt,
    prelude::*,
};

static PROM_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

#[derive(Debug, Clone, Default)]
pub struct TelemetryOptions {
    /// Write span timings here for chrome://tracing or Perfetto.
    pub chrome_trace_path: Option<PathBuf>,
    /// Serve `/metrics` on this address.
    pub metrics_addr: Option<SocketAddr>,
}

/// Keeps the subscriber installed; flushes and fixes up the Chrome trace on drop.
pub struct TelemetryGuard {
    _default_guard: tracing::subscriber::DefaultGuard,
    chrome_guard: Option<tracing_chrome::FlushGuard>,
    chrome_trace_path: Option<PathBuf>,
}

/// Install the global metrics recorder.
///
/// With an address, the exporter's own HTTP listener serves `/metrics` and
/// no handle is returned. Without one, the recorder renders on demand
/// through the returned handle.
pub fn init_metrics(addr: Option<SocketAddr>) -> Result<Option<&'static PrometheusHandle>, BuildError> {
    if let Some(addr) = addr {
        PrometheusBuilder::new().with_http_listener(addr).install()?;
        tracing::info!(%addr, "serving Prometheus metrics");
        return Ok(None);
    }
    if let Some(handle) = PROM_HANDLE.get() {
        return Ok(Some(handle));
    }
    let handle = PrometheusBuilder::new().install_recorder()?;
    let upkeep = handle.clone();
    if let Err(err) = spawn_thread("prometheus-upkeep", move || {
        loop {
            std::thread::sleep(Duration::from_secs(5));
            upkeep.run_upkeep();
        }
    }) {
        tracing::warn!("failed to spawn prometheus upkeep thread: {err}");
    }
    Ok(Some(PROM_HANDLE.get_or_init(|| handle)))
}

/// Access the Prometheus handle when installed without a listener.
pub fn prometheus_handle() -> Option<&'static PrometheusHandle> {
    PROM_HANDLE.get()
}

/// Install the tracing subscriber for the calling thread. Threads spawned
/// through [`link_core::spawn_thread`] inherit it.
pub fn enter_runtime(opts: &TelemetryOptions) -> TelemetryGuard {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let (chrome_layer, chrome_guard) = match opts.chrome_trace_path.as_ref() {
        Some(path) => match build_chrome_layer(path) {
            Ok((layer, guard)) => (Some(layer), Some(guard)),
            Err(err) => {
                eprintln!("failed to initialise chrome trace writer at {}: {err}", path.display());
                (None, None)
            }
        },
        None => (None, None),
    };

    let span_only = filter_fn(|metadata| metadata.is_span());
    let default_guard = tracing::subscriber::set_default(
        tracing_subscriber::registry()
            .with(chrome_layer.map(|layer| layer.with_filter(span_only)))
            .with(
                fmt::layer()
                    .with_target(false)
                    .with_timer(fmt::time::uptime())
                    .with_filter(env_filter),
            )
            .with(tracing_error::ErrorLayer::default()),
    );

    TelemetryGuard {
        _default_guard: default_guard,
        chrome_guard,
        chrome_trace_path: opts.chrome_trace_path.clone(),
    }
}

fn build_chrome_layer(
    path: &Path,
) -> io::Result<(
    tracing_chrome::ChromeLayer<tracing_subscriber::Registry>,
    tracing_chrome::FlushGuard,
)> {
    let file = std::fs::File::create(path)?;
    let (layer, guard) = tracing_chrome::ChromeLayerBuilder::new()
        .writer(file)
        .include_args(true)
        .trace_style(tracing_chrome::TraceStyle::Async)
        .build();
    Ok((layer, guard))
}

impl Drop for TelemetryGuard {
    fn drop(&mut self) {
        let Some(guard) = self.chrome_guard.take() else {
            return;
        };
        guard.flush();
        drop(guard);
        if let Some(path) = self.chrome_trace_path.as_ref() {
            if let Err(err) = fix_async_ids(path) {
                tracing::warn!("failed to normalise chrome trace {}: {err}", path.display());
            }
        }
    }
}

/// Rewrite async slices so Perfetto nests them.
///
/// Every `b` gets a fresh id matched to its `e` in LIFO order per original
/// id. Pairs that begin and end on the same thread become plain `B`/`E`
/// durations; cross-thread pairs stay async.
fn fix_async_ids(path: &Path) -> io::Result<()> {
    if !path.is_file() {
        return Ok(());
    }
    let data = std::fs::read(path)?;
    let mut events: Vec<serde_json::Value> =
        serde_json::from_slice(&data).map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;

    struct Open {
        new_id: u64,
        idx: usize,
        tid: u64,
    }
    let mut next_id: u64 = 1;
    let mut open: HashMap<u64, Vec<Open>> = HashMap::new();
    let field = |event: &serde_json::Value, name: &str| event.get(name).and_then(|v| v.as_u64());

    for idx in 0..events.len() {
        let phase = events[idx].get("ph").and_then(|v| v.as_str()).map(str::to_owned);
        let Some(old_id) = field(&events[idx], "id") else {
            continue;
        };
        let tid = field(&events[idx], "tid").unwrap_or(0);
        match phase.as_deref() {
            Some("b") => {
                events[idx]["id"] = next_id.into();
                open.entry(old_id).or_default().push(Open {
                    new_id: next_id,
                    idx,
                    tid,
                });
                next_id += 1;
            }
            Some("e") => {
                let Some(begin) = open.get_mut(&old_id).and_then(Vec::pop) else {
                    events[idx]["id"] = next_id.into();
                    next_id += 1;
                    continue;
                };
                events[idx]["id"] = begin.new_id.into();
                if begin.tid == tid {
                    for (i, ph) in [(begin.idx, "B"), (idx, "E")] {
                        if let Some(obj) = events[i].as_object_mut() {
                            obj.insert("ph".into(), ph.into());
                            obj.remove("id");
                        }
                    }
                }
            }
            _ => {}
        }
    }

    let tmp_path = path.with_extension("json.tmp");
    let mut file = std::fs::File::create(&tmp_path)?;
    serde_json::to_writer(&mut file, &events)?;
    file.write_all(b"\n")?;
    std::fs::rename(tmp_path, path)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn same_thread_async_pairs_become_durations() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trace.json");
        let events = json!([
            { "ph": "b", "id": 7, "tid": 1, "name": "monitor.cycle" },
            { "ph": "b", "id": 7, "tid": 2, "name": "monitor.cycle" },
            { "ph": "e", "id": 7, "tid": 2, "name": "monitor.cycle" },
            { "ph": "e", "id": 7, "tid": 3, "name": "monitor.cycle" },
        ]);
        std::fs::write(&path, events.to_string()).unwrap();

        fix_async_ids(&path).unwrap();
        let fixed: Vec<serde_json::Value> =
            serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        let phases: Vec<_> = fixed.iter().map(|e| e["ph"].as_str().unwrap()).collect();
        assert_eq!(phases, ["b", "B", "E", "e"]);
        assert_eq!(fixed[0]["id"], fixed[3]["id"]);
        assert!(fixed[1].get("id").is_none());
    }
}
