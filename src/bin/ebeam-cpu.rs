//! CPU variant: one worker per hardware thread, one primary at a time.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Context;
use clap::Parser;

use ebeam::orchestrator::{load_inputs, run_cpu, CpuRunConfig};
use ebeam::output::OutputSink;
use ebeam::SimError;

#[derive(Parser, Debug)]
#[command(name = "ebeam-cpu")]
#[command(about = "Monte Carlo electron-matter interaction simulation on the CPU")]
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

    /// Master RNG seed
    #[arg(long, default_value_t = 0x14f8214e78c7e39b)]
    seed: u64,

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
    let inputs = load_inputs(&args.geometry, &args.primaries, &args.materials, false, 0)?;
    let cfg = CpuRunConfig {
        energy_threshold: args.energy_threshold,
        seed: args.seed,
    };
    let sink = OutputSink::create(args.detect_filename.as_deref())
        .context("opening detect output")?;
    run_cpu(&inputs, &cfg, &sink)?;
    Ok(())
}
