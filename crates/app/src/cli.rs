use std::{net::SocketAddr, path::PathBuf};

use clap::{Args, Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(name = "coal-guard", version, about = "Camera-driven PLC alarms for coal handling areas")]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalArgs,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Args)]
pub struct GlobalArgs {
    /// System configuration file.
    #[arg(long, short, global = true, default_value = "config/system.json")]
    pub config: PathBuf,

    /// Serve Prometheus metrics on this address.
    #[arg(long, global = true)]
    pub metrics_addr: Option<SocketAddr>,

    /// Write a Chrome trace of detection cycles to this file.
    #[arg(long, global = true)]
    pub chrome_trace: Option<PathBuf>,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Start every enabled camera and run until interrupted.
    Run,
    /// Validate the configuration and report per-camera problems.
    CheckConfig,
    /// Write a starter configuration.
    SampleConfig {
        #[arg(long, default_value_t = 4)]
        cameras: u32,
        /// Output file; stdout when omitted.
        #[arg(long, short)]
        output: Option<PathBuf>,
    },
    /// Connect to one PLC and exercise an alarm bit.
    PlcTest {
        /// PLC id from the configuration.
        #[arg(long, default_value = "plc1")]
        plc: String,
        /// Bit address, e.g. DB300.DBX6.0.
        #[arg(long)]
        address: String,
        /// Write this value instead of only reading.
        #[arg(long)]
        set: Option<u8>,
        /// Restore the previous value after this many milliseconds.
        #[arg(long)]
        pulse_ms: Option<u64>,
    },
}
