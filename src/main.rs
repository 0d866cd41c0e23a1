// main.rs — `tilescan` command-line driver.
//
//   tilescan convolve [--input input.txt] [--output output.txt]
//   tilescan scan     [--input input.txt] [--output output.txt]
//
// On success stdout carries a single line, `Total time: X.XXX s`, the sum
// of device-reported dispatch durations. On failure the error and its
// backend code go to stderr, no output file is written and the exit status
// is 1. Diagnostics are logged to stderr, filtered by RUST_LOG.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand, ValueEnum};
use tracing::debug;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Registry};

use tilescan::config::{DEFAULT_SCAN_BLOCK_SIZE, DEFAULT_TILE_SIZE};
use tilescan::gpu::{DeviceProfile, GpuDevice};
use tilescan::job::{self, JobReport};
use tilescan::{CpuDevice, EngineConfig, Error};

/// Tiled convolution and recursive block scan on a compute device.
#[derive(Parser)]
#[command(name = "tilescan")]
#[command(version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Device to run the kernels on
    #[arg(long, global = true, value_enum, default_value_t = DeviceKind::Gpu)]
    device: DeviceKind,

    /// Limits requested from the GPU adapter
    #[arg(long, global = true, value_enum, default_value_t = ProfileArg::Native)]
    profile: ProfileArg,

    /// Recompute on the host and fail if the device result deviates
    #[arg(long, global = true)]
    verify: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Convolve an N×N matrix with an M×M kernel
    Convolve {
        #[arg(short, long, default_value = "input.txt")]
        input: PathBuf,

        #[arg(short, long, default_value = "output.txt")]
        output: PathBuf,

        /// Tile side; each tile is one work group
        #[arg(long = "block-size", default_value_t = DEFAULT_TILE_SIZE)]
        block_size: usize,
    },
    /// Inclusive prefix sum of an N-element array
    Scan {
        #[arg(short, long, default_value = "input.txt")]
        input: PathBuf,

        #[arg(short, long, default_value = "output.txt")]
        output: PathBuf,

        /// Work-group size and per-level shrink factor
        #[arg(long = "block-size", default_value_t = DEFAULT_SCAN_BLOCK_SIZE)]
        block_size: usize,
    },
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
enum DeviceKind {
    /// Simulated accelerator on the CPU thread pool
    Cpu,
    /// wgpu (Vulkan, Metal or DX12)
    Gpu,
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
enum ProfileArg {
    Native,
    Portable,
}

impl From<ProfileArg> for DeviceProfile {
    fn from(p: ProfileArg) -> Self {
        match p {
            ProfileArg::Native => DeviceProfile::Native,
            ProfileArg::Portable => DeviceProfile::Portable,
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_writer(std::io::stderr);
    Registry::default().with(filter).with(fmt_layer).init();
}

fn main() -> ExitCode {
    init_tracing();
    let cli = Cli::parse();

    match run(&cli) {
        Ok(report) => {
            println!("Total time: {:.3} s", report.elapsed.as_secs_f64());
            ExitCode::SUCCESS
        }
        Err(e) => {
            debug!(error = ?e, "job failed");
            match e.code() {
                Some(code) => eprintln!("{e} : {code}"),
                None => eprintln!("{e}"),
            }
            ExitCode::FAILURE
        }
    }
}

fn run(cli: &Cli) -> Result<JobReport, Error> {
    let mut config = EngineConfig { verify: cli.verify, ..EngineConfig::default() };
    match cli.device {
        DeviceKind::Cpu => dispatch(&cli.command, &mut config, &CpuDevice::new()),
        DeviceKind::Gpu => {
            let gpu = GpuDevice::new_with_profile(cli.profile.into())?;
            dispatch(&cli.command, &mut config, &gpu)
        }
    }
}

fn dispatch<D: tilescan::Device>(
    command: &Commands,
    config: &mut EngineConfig,
    device: &D,
) -> Result<JobReport, Error> {
    match command {
        Commands::Convolve { input, output, block_size } => {
            config.tile_size = *block_size;
            job::run_convolution(device, config, input, output)
        }
        Commands::Scan { input, output, block_size } => {
            config.scan_block_size = *block_size;
            job::run_scan(device, config, input, output)
        }
    }
}
