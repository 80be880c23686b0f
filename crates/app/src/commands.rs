//! One-shot subcommands.

use std::{fs, path::Path, sync::Arc, thread, time::Duration};

use anyhow::{Context, Result, anyhow, bail};
use monitor::SystemConfig;
use plc_link::{BitAddress, PlcLink};
use tracing::info;

pub fn check_config(path: &Path) -> Result<()> {
    let config = SystemConfig::load(path)?;
    let mut problems = config.validate_shared();
    let mut ok = 0;
    for camera in &config.cameras {
        if !camera.enabled {
            println!("{:<16} disabled", camera.camera_id);
            continue;
        }
        match config.camera(camera) {
            Ok(worker) => {
                ok += 1;
                let alarms: Vec<String> = worker
                    .alarms
                    .iter()
                    .map(|a| format!("{}@{}:{}", a.kind, a.plc, a.address))
                    .collect();
                println!("{:<16} ok  model={} alarms={}", camera.camera_id, worker.model, alarms.join(","));
            }
            Err(err) => problems.push(err),
        }
    }
    for problem in &problems {
        println!("error: {problem}");
    }
    if problems.is_empty() {
        println!("{ok} camera(s) valid");
        Ok(())
    } else {
        bail!("{} problem(s) in {}", problems.len(), path.display())
    }
}

pub fn sample_config(cameras: u32, output: Option<&Path>) -> Result<()> {
    if cameras == 0 {
        bail!("--cameras must be at least 1");
    }
    let json = SystemConfig::sample(cameras).to_json()?;
    match output {
        Some(path) => {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                fs::create_dir_all(parent)
                    .with_context(|| format!("failed to create {}", parent.display()))?;
            }
            fs::write(path, json + "\n").with_context(|| format!("failed to write {}", path.display()))?;
            info!(path = %path.display(), cameras, "sample configuration written");
        }
        None => println!("{json}"),
    }
    Ok(())
}

pub fn plc_test(
    config_path: &Path,
    plc_id: &str,
    address: &str,
    set: Option<u8>,
    pulse_ms: Option<u64>,
) -> Result<()> {
    let config = SystemConfig::load(config_path)?;
    let plc = config
        .plcs
        .get(plc_id)
        .ok_or_else(|| anyhow!("PLC {plc_id:?} is not configured"))?;
    let address: BitAddress = address.parse()?;
    let value = match set {
        None => None,
        Some(0) => Some(false),
        Some(1) => Some(true),
        Some(other) => bail!("--set takes 0 or 1, got {other}"),
    };

    let link = PlcLink::new(plc_id, Arc::new(plc.connector()), plc.link_options());
    link.connect().context("failed to start PLC link")?;
    let timeout = Duration::from_millis(plc.io_timeout_ms.max(1_000) * 3);
    if !link.wait_connected(timeout) {
        bail!("could not connect to {} within {timeout:?}", link.describe());
    }
    println!("connected to {}", link.describe());

    let before = link.read_bit(address)?;
    println!("{address} = {}", u8::from(before));
    if let Some(value) = value {
        link.write_bit(address, value)?;
        println!("{address} <- {}", u8::from(value));
        if let Some(ms) = pulse_ms {
            thread::sleep(Duration::from_millis(ms));
            link.write_bit(address, before)?;
            println!("{address} <- {} (restored)", u8::from(before));
        }
        println!("{address} = {}", u8::from(link.read_bit(address)?));
    }
    link.disconnect()?;
    Ok(())
}
