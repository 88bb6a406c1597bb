pub mod driver;
pub mod error;
pub mod geometry;
pub mod gpu;
pub mod loader;
pub mod material;
pub mod orchestrator;
pub mod output;
pub mod particle;
pub mod physics;
pub mod prescan;
pub mod work_pool;

pub use driver::{CpuDriver, Driver};
pub use error::SimError;
pub use geometry::{Triangle, TriangleMesh};
pub use gpu::GpuDriver;
pub use material::{Material, MaterialTables};
pub use orchestrator::{
    load_inputs, run_cpu, run_gpu, CpuRunConfig, GpuRunConfig, Phase, PhaseBroadcast, SimInputs,
};
pub use output::{OutputBuffer, OutputSink};
pub use particle::{Particle, Pixel};
pub use physics::ScatterPhysics;
pub use prescan::BatchPlan;
pub use work_pool::WorkPool;
