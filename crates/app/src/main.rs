mod cli;
mod commands;
mod service;

use clap::Parser;
use monitor::telemetry::{self, TelemetryOptions};

use crate::cli::{Cli, Command};

fn main() {
    if let Err(err) = run() {
        eprintln!("{err:?}");
        std::process::exit(1);
    }
}

fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let _telemetry = telemetry::enter_runtime(&TelemetryOptions {
        chrome_trace_path: cli.global.chrome_trace.clone(),
        metrics_addr: cli.global.metrics_addr,
    });

    match cli.command {
        Command::Run => service::run(&cli.global),
        Command::CheckConfig => commands::check_config(&cli.global.config),
        Command::SampleConfig { cameras, output } => commands::sample_config(cameras, output.as_deref()),
        Command::PlcTest {
            plc,
            address,
            set,
            pulse_ms,
        } => commands::plc_test(&cli.global.config, &plc, &address, set, pulse_ms),
    }
}
