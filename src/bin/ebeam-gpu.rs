//! GPU variant: one worker per adapter, prescan-tuned batching.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Context;
use clap::Parser;

use ebeam::orchestrator::{run_gpu, GpuRunConfig};
use ebeam::output::OutputSink;
use ebeam::SimError;

#[derive(Parser, Debug)]
#[command(name = "ebeam-gpu")]
#[command(about = "Monte Carlo electron-matter interaction simulation on GPU devices")]
struct Args {
    /// Triangle geometry file (.tri)
    geometry: PathBuf,

    /// Primary electrons file (.pri)
    primaries: PathBuf,

    /// Material files, one per material index referenced by the geometry
    #[arg(required = true, num_args = 1..)]
    materials: Vec<PathBuf>,

    /// Terminate electrons below this kinetic energy (eV)
    #[arg(long, default_value_t = 0.0)]
    energy_threshold: f32,

    /// Particle slab capacity per device
    #[arg(long, default_value_t = 1_000_000)]
    capacity: usize,

    /// Pilot population for the prescan
    #[arg(long, default_value_t = 1000)]
    prescan_size: usize,

    /// Headroom fraction of the slab targeted at steady state
    #[arg(long, default_value_t = 0.9)]
    batch_factor: f32,

    /// Master RNG seed
    #[arg(long, default_value_t = 0x14f8214e78c7e39b)]
    seed: u64,

    /// Sort primaries before the run
    #[arg(long, default_value_t = false)]
    sort_primaries: bool,

    /// Output file for detected electrons; stdout when omitted
    #[arg(long)]
    detect_filename: Option<PathBuf>,
}

fn main() -> ExitCode {
    env_logger::init();
    let args = Args::parse();
    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e:#}");
            let code = e
                .downcast_ref::<SimError>()
                .map_or(1, |e| e.exit_code());
            ExitCode::from(code as u8)
        }
    }
}

fn run(args: &Args) -> anyhow::Result<()> {
    let cfg = GpuRunConfig {
        energy_threshold: args.energy_threshold,
        capacity: args.capacity,
        prescan_size: args.prescan_size,
        batch_factor: args.batch_factor,
        seed: args.seed,
        sort_primaries: args.sort_primaries,
    };
    let sink = OutputSink::create(args.detect_filename.as_deref())
        .context("opening detect output")?;
    run_gpu(&args.geometry, &args.primaries, &args.materials, &cfg, &sink)?;
    Ok(())
}
