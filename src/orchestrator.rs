//! Run orchestration: input loading, phase coordination, worker fleets and
//! the progress probe.
//!
//! The CPU run loads everything up front and spawns one worker per hardware
//! thread. The GPU run spawns one worker per adapter immediately and
//! broadcasts the load progress through [`PhaseBroadcast`]; workers block on
//! the phase they need, worker 0 runs the prescan and publishes the batch
//! plan for the rest.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Condvar, Mutex, OnceLock};
use std::time::{Duration, Instant};

use indicatif::{ProgressBar, ProgressStyle};
use log::{info, warn};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

use crate::driver::{CpuDriver, Driver};
use crate::error::SimError;
use crate::geometry::TriangleMesh;
use crate::gpu::{discover_adapters, GpuDriver};
use crate::loader::{load_pri_file, load_tri_file};
use crate::material::Material;
use crate::output::{OutputBuffer, OutputSink};
use crate::particle::{Particle, Pixel};
use crate::prescan::{derive_plan, run_prescan, BatchPlan};
use crate::work_pool::WorkPool;

/// Slab capacity of each CPU worker; large enough for any single cascade.
const CPU_SLAB_CAPACITY: usize = 1 << 16;

// ---------------------------------------------------------------------------
// Phase broadcast
// ---------------------------------------------------------------------------

/// Load/run phases, broadcast from the orchestrator to the workers. The
/// phase variable only moves forward; `Aborted` is terminal and wakes every
/// waiter so a failed load cannot strand the fleet.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Phase {
    Init,
    GeometryLoaded,
    MaterialsLoaded,
    PrimariesLoaded,
    PrescanDone,
    Aborted,
}

pub struct PhaseBroadcast {
    state: Mutex<Phase>,
    cond: Condvar,
}

impl Default for PhaseBroadcast {
    fn default() -> Self {
        Self::new()
    }
}

impl PhaseBroadcast {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(Phase::Init),
            cond: Condvar::new(),
        }
    }

    /// Advance to `phase` if that is forward progress; never moves backward
    /// and never leaves `Aborted`.
    pub fn advance_to(&self, phase: Phase) {
        let mut cur = self.state.lock().unwrap();
        if *cur != Phase::Aborted && phase > *cur {
            *cur = phase;
            self.cond.notify_all();
        }
    }

    pub fn abort(&self) {
        let mut cur = self.state.lock().unwrap();
        *cur = Phase::Aborted;
        self.cond.notify_all();
    }

    /// Block until `phase` is reached. Returns false if the run was aborted.
    pub fn wait_for(&self, phase: Phase) -> bool {
        let mut cur = self.state.lock().unwrap();
        while *cur < phase && *cur != Phase::Aborted {
            cur = self.cond.wait(cur).unwrap();
        }
        *cur != Phase::Aborted
    }

    pub fn current(&self) -> Phase {
        *self.state.lock().unwrap()
    }
}

// ---------------------------------------------------------------------------
// Input loading
// ---------------------------------------------------------------------------

pub struct SimInputs {
    pub mesh: TriangleMesh,
    pub materials: Vec<Material>,
    pub primaries: Vec<Particle>,
    pub pixels: Vec<Pixel>,
    pub tags: Vec<u32>,
}

/// Load the triangle file and cross-check the referenced material indices
/// against the number of material files supplied.
pub fn load_geometry(path: &Path, material_count: usize) -> Result<TriangleMesh, SimError> {
    info!("loading geometry from {}", path.display());
    let start = Instant::now();
    let mesh = TriangleMesh::new(load_tri_file(path)?)?;
    let needed = mesh.max_material_id().map_or(0, |m| m + 1) as usize;
    if needed > material_count {
        return Err(SimError::InputInconsistent(format!(
            "geometry references {needed} materials, {material_count} provided"
        )));
    }
    if needed < material_count {
        warn!("geometry references {needed} materials, {material_count} provided");
    }
    info!(
        "loaded {} triangles in {:.1?}, bounds {:?} .. {:?}",
        mesh.triangles().len(),
        start.elapsed(),
        mesh.aabb_min(),
        mesh.aabb_max()
    );
    Ok(mesh)
}

pub fn load_materials(paths: &[PathBuf]) -> Result<Vec<Material>, SimError> {
    let start = Instant::now();
    let materials = paths
        .iter()
        .map(|p| Material::load(p))
        .collect::<Result<Vec<_>, _>>()?;
    for m in &materials {
        info!("material {} (barrier {:.2} eV)", m.name, m.barrier());
    }
    info!("loaded {} materials in {:.1?}", materials.len(), start.elapsed());
    Ok(materials)
}

/// Load primaries, optionally sort them, and apply the prescan shuffle so
/// the pilot population samples the whole input. Tag `i` maps to primary
/// `i` in the returned order.
pub fn load_primaries(
    path: &Path,
    mesh: &TriangleMesh,
    sort: bool,
    prescan_size: usize,
) -> Result<(Vec<Particle>, Vec<Pixel>, Vec<u32>), SimError> {
    let start = Instant::now();
    let (mut primaries, mut pixels) = load_pri_file(path, mesh.aabb_min(), mesh.aabb_max())?;
    if sort {
        sort_primaries(&mut primaries, &mut pixels);
    }
    prescan_shuffle(&mut primaries, &mut pixels, prescan_size);
    let tags = (0..primaries.len() as u32).collect();
    info!("loaded {} primaries in {:.1?}", primaries.len(), start.elapsed());
    Ok((primaries, pixels, tags))
}

/// Sequential load of every input; the CPU path needs no phase protocol.
pub fn load_inputs(
    tri_path: &Path,
    pri_path: &Path,
    mat_paths: &[PathBuf],
    sort: bool,
    prescan_size: usize,
) -> Result<SimInputs, SimError> {
    let mesh = load_geometry(tri_path, mat_paths.len())?;
    let materials = load_materials(mat_paths)?;
    let (primaries, pixels, tags) = load_primaries(pri_path, &mesh, sort, prescan_size)?;
    Ok(SimInputs {
        mesh,
        materials,
        primaries,
        pixels,
        tags,
    })
}

/// Pixel-major, then position order; groups electrons of one pixel together.
fn sort_primaries(primaries: &mut Vec<Particle>, pixels: &mut Vec<Pixel>) {
    let mut order: Vec<usize> = (0..primaries.len()).collect();
    order.sort_by(|&a, &b| {
        (pixels[a].x, pixels[a].y)
            .cmp(&(pixels[b].x, pixels[b].y))
            .then(primaries[a].pos.x.total_cmp(&primaries[b].pos.x))
            .then(primaries[a].pos.y.total_cmp(&primaries[b].pos.y))
    });
    *primaries = order.iter().map(|&i| primaries[i]).collect();
    *pixels = order.iter().map(|&i| pixels[i]).collect();
}

/// Move `prescan_size` stride-spaced representatives to the front so the
/// pilot run is unbiased even when the primaries are sorted.
fn prescan_shuffle(primaries: &mut [Particle], pixels: &mut [Pixel], prescan_size: usize) {
    let n = primaries.len();
    if prescan_size == 0 || prescan_size >= n {
        return;
    }
    for i in 0..prescan_size {
        let j = i * n / prescan_size;
        primaries.swap(i, j);
        pixels.swap(i, j);
    }
}

// ---------------------------------------------------------------------------
// Progress probe
// ---------------------------------------------------------------------------

fn progress_bar(total: u64) -> ProgressBar {
    let pb = ProgressBar::new(total);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("[{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} primaries ({percent}%) {msg}")
            .expect("static template")
            .progress_chars("=> "),
    );
    pb
}

fn running_summary(running: &[AtomicU32]) -> String {
    running
        .iter()
        .enumerate()
        .map(|(i, r)| format!("w{i}:{}", r.load(Ordering::Relaxed)))
        .collect::<Vec<_>>()
        .join(" ")
}

// ---------------------------------------------------------------------------
// CPU run
// ---------------------------------------------------------------------------

#[derive(Clone, Debug)]
pub struct CpuRunConfig {
    pub energy_threshold: f32,
    pub seed: u64,
}

pub fn run_cpu(inputs: &SimInputs, cfg: &CpuRunConfig, sink: &OutputSink) -> Result<(), SimError> {
    let pool = WorkPool::new(&inputs.primaries, &inputs.tags);
    let n_workers = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    let mut master = ChaCha8Rng::seed_from_u64(cfg.seed);
    let seeds: Vec<u64> = (0..n_workers).map(|_| master.random()).collect();
    let running: Vec<AtomicU32> = (0..n_workers).map(|_| AtomicU32::new(0)).collect();
    let done = AtomicUsize::new(0);

    info!("creating {n_workers} CPU drivers");
    let start = Instant::now();
    let pb = progress_bar(pool.total() as u64);

    let result = std::thread::scope(|s| {
        let handles: Vec<_> = seeds
            .iter()
            .enumerate()
            .map(|(i, &seed)| {
                let pool = &pool;
                let running = &running[i];
                let done = &done;
                s.spawn(move || {
                    let r = catch_unwind(AssertUnwindSafe(|| {
                        cpu_worker(inputs, cfg, pool, seed, sink, running)
                    }))
                    .unwrap_or_else(|_| Err(SimError::Device("worker panicked".into())));
                    done.fetch_add(1, Ordering::Relaxed);
                    r
                })
            })
            .collect();

        while done.load(Ordering::Relaxed) < n_workers {
            std::thread::sleep(Duration::from_secs(1));
            pb.set_position((pool.total() - pool.primaries_to_go()) as u64);
            pb.set_message(running_summary(&running));
        }

        let mut result = Ok(());
        for h in handles {
            match h.join() {
                Ok(Ok(())) => {}
                Ok(Err(e)) => result = result.and(Err(e)),
                Err(_) => {
                    result = result.and(Err(SimError::Device("worker panicked".into())))
                }
            }
        }
        result
    });
    pb.finish_and_clear();
    info!("simulation finished in {:.1?}", start.elapsed());
    sink.flush()?;
    result
}

fn cpu_worker(
    inputs: &SimInputs,
    cfg: &CpuRunConfig,
    pool: &WorkPool,
    seed: u64,
    sink: &OutputSink,
    running: &AtomicU32,
) -> Result<(), SimError> {
    let mut driver = CpuDriver::new(
        CPU_SLAB_CAPACITY,
        &inputs.mesh,
        &inputs.materials,
        cfg.energy_threshold,
        seed,
    );
    let mut buff = OutputBuffer::new(sink);

    loop {
        let (particles, tags) = pool.get_work(1);
        if particles.is_empty() {
            break;
        }
        driver.push(particles, tags);
        while driver.running() > 0 {
            driver.do_iteration();
            running.store(driver.running(), Ordering::Relaxed);
        }

        let mut io_err = None;
        driver.flush_detected(|p, tag| {
            if io_err.is_none() {
                if let Err(e) = buff.add_record(p, inputs.pixels[tag as usize]) {
                    io_err = Some(e);
                }
            }
        });
        if let Some(e) = io_err {
            return Err(e.into());
        }
    }
    buff.flush()?;
    Ok(())
}

// ---------------------------------------------------------------------------
// GPU run
// ---------------------------------------------------------------------------

#[derive(Clone, Debug)]
pub struct GpuRunConfig {
    pub energy_threshold: f32,
    pub capacity: usize,
    pub prescan_size: usize,
    pub batch_factor: f32,
    pub seed: u64,
    pub sort_primaries: bool,
}

impl GpuRunConfig {
    pub fn validate(&self) -> Result<(), SimError> {
        if self.capacity == 0 {
            return Err(SimError::BadArgs("capacity must be positive".into()));
        }
        if self.prescan_size == 0 {
            return Err(SimError::BadArgs("prescan size must be positive".into()));
        }
        if self.batch_factor <= 0.0 {
            return Err(SimError::BadArgs("batch factor must be positive".into()));
        }
        Ok(())
    }
}

struct GpuShared<'a> {
    cfg: &'a GpuRunConfig,
    phases: &'a PhaseBroadcast,
    mesh: &'a OnceLock<TriangleMesh>,
    materials: &'a OnceLock<Vec<Material>>,
    primaries: &'a OnceLock<(Vec<Particle>, Vec<Pixel>, Vec<u32>)>,
    pool: &'a OnceLock<WorkPool<'a>>,
    plan: &'a OnceLock<BatchPlan>,
    sink: &'a OutputSink,
    seeds: &'a [u64],
    running: &'a [AtomicU32],
    done: &'a AtomicUsize,
}

pub fn run_gpu(
    tri_path: &Path,
    pri_path: &Path,
    mat_paths: &[PathBuf],
    cfg: &GpuRunConfig,
    sink: &OutputSink,
) -> Result<(), SimError> {
    cfg.validate()?;

    let adapters = discover_adapters();
    if adapters.is_empty() {
        return Err(SimError::Device("no usable adapters found".into()));
    }
    for a in &adapters {
        info!("device: {}", a.get_info().name);
    }
    let n_workers = adapters.len();

    let mut master = ChaCha8Rng::seed_from_u64(cfg.seed);
    let seeds: Vec<u64> = (0..n_workers).map(|_| master.random()).collect();
    let running: Vec<AtomicU32> = (0..n_workers).map(|_| AtomicU32::new(0)).collect();
    let done = AtomicUsize::new(0);

    let phases = PhaseBroadcast::new();
    let mesh_cell: OnceLock<TriangleMesh> = OnceLock::new();
    let materials_cell: OnceLock<Vec<Material>> = OnceLock::new();
    let primaries_cell: OnceLock<(Vec<Particle>, Vec<Pixel>, Vec<u32>)> = OnceLock::new();
    let pool_cell: OnceLock<WorkPool> = OnceLock::new();
    let plan_cell: OnceLock<BatchPlan> = OnceLock::new();

    let shared = GpuShared {
        cfg,
        phases: &phases,
        mesh: &mesh_cell,
        materials: &materials_cell,
        primaries: &primaries_cell,
        pool: &pool_cell,
        plan: &plan_cell,
        sink,
        seeds: &seeds,
        running: &running,
        done: &done,
    };

    let start = Instant::now();
    let result = std::thread::scope(|s| {
        let shared = &shared;
        let handles: Vec<_> = adapters
            .into_iter()
            .enumerate()
            .map(|(i, adapter)| {
                s.spawn(move || {
                    let r = catch_unwind(AssertUnwindSafe(|| gpu_worker(i, adapter, shared)))
                        .unwrap_or_else(|_| Err(SimError::Device("worker panicked".into())));
                    if r.is_err() {
                        // A dead worker must not strand the others on a phase.
                        shared.phases.abort();
                    }
                    shared.done.fetch_add(1, Ordering::Relaxed);
                    r
                })
            })
            .collect();

        let load = || -> Result<(), SimError> {
            let mesh = load_geometry(tri_path, mat_paths.len())?;
            let _ = mesh_cell.set(mesh);
            phases.advance_to(Phase::GeometryLoaded);

            let materials = load_materials(mat_paths)?;
            let _ = materials_cell.set(materials);
            phases.advance_to(Phase::MaterialsLoaded);

            let (primaries, pixels, tags) = load_primaries(
                pri_path,
                mesh_cell.get().unwrap(),
                cfg.sort_primaries,
                cfg.prescan_size,
            )?;
            let _ = primaries_cell.set((primaries, pixels, tags));
            let (p, _, t) = primaries_cell.get().unwrap();
            let _ = pool_cell.set(WorkPool::new(p, t));
            phases.advance_to(Phase::PrimariesLoaded);
            Ok(())
        };

        let loaded = load();
        if loaded.is_err() {
            phases.abort();
        } else {
            let pool = pool_cell.get().unwrap();
            let pb = progress_bar(pool.total() as u64);
            while done.load(Ordering::Relaxed) < n_workers {
                std::thread::sleep(Duration::from_secs(1));
                pb.set_position((pool.total() - pool.primaries_to_go()) as u64);
                pb.set_message(running_summary(&running));
            }
            pb.finish_and_clear();
        }

        let mut result = loaded;
        for h in handles {
            match h.join() {
                Ok(Ok(())) => {}
                Ok(Err(e)) => result = result.and(Err(e)),
                Err(_) => {
                    result = result.and(Err(SimError::Device("worker panicked".into())))
                }
            }
        }
        result
    });
    info!("simulation finished in {:.1?}", start.elapsed());
    sink.flush()?;
    result
}

fn gpu_worker(index: usize, adapter: wgpu::Adapter, sh: &GpuShared<'_>) -> Result<(), SimError> {
    if !sh.phases.wait_for(Phase::MaterialsLoaded) {
        return Ok(());
    }
    let mesh = sh.mesh.get().unwrap();
    let materials = sh.materials.get().unwrap();
    let mut driver = GpuDriver::new(
        &adapter,
        sh.cfg.capacity as u32,
        mesh,
        materials,
        sh.cfg.energy_threshold,
        sh.seeds[index],
    )?;

    if !sh.phases.wait_for(Phase::PrimariesLoaded) {
        return Ok(());
    }
    let pool = sh.pool.get().unwrap();
    let pixels = &sh.primaries.get().unwrap().1;
    let mut buff = OutputBuffer::new(sh.sink);
    let mut io_err: Option<std::io::Error> = None;

    // Worker 0 tunes the batch shape on a pilot population; the rest wait
    // for the published plan.
    if index == 0 {
        let stats = run_prescan(&mut driver, pool, sh.cfg.prescan_size);
        let plan = derive_plan(&stats, sh.cfg.capacity, sh.cfg.batch_factor);
        let _ = sh.plan.set(plan);
        driver.flush_detected(|p, tag| {
            if io_err.is_none() {
                if let Err(e) = buff.add_record(p, pixels[tag as usize]) {
                    io_err = Some(e);
                }
            }
        });
        sh.phases.advance_to(Phase::PrescanDone);
    } else if !sh.phases.wait_for(Phase::PrescanDone) {
        return Ok(());
    }
    if let Some(e) = io_err.take() {
        return Err(e.into());
    }
    let plan = *sh.plan.get().unwrap();

    driver.allocate_input_buffers(plan.batch_size);
    driver.push_to_buffer(pool);
    loop {
        driver.buffer_detected();
        driver.push_to_simulation();
        for _ in 0..plan.frame_size {
            driver.do_iteration();
        }
        driver.push_to_buffer(pool);
        driver.sync()?;
        driver.flush_buffered(|p, tag| {
            if io_err.is_none() {
                if let Err(e) = buff.add_record(p, pixels[tag as usize]) {
                    io_err = Some(e);
                }
            }
        });
        if let Some(e) = io_err.take() {
            return Err(e.into());
        }
        sh.running[index].store(driver.running(), Ordering::Relaxed);
        if driver.running() == 0 && driver.staged_len() == 0 && pool.done() {
            break;
        }
    }

    // One more collect/sync pair drains detections from the final frame.
    driver.buffer_detected();
    driver.sync()?;
    driver.flush_buffered(|p, tag| {
        if io_err.is_none() {
            if let Err(e) = buff.add_record(p, pixels[tag as usize]) {
                io_err = Some(e);
            }
        }
    });
    if let Some(e) = io_err.take() {
        return Err(e.into());
    }
    buff.flush()?;
    sh.running[index].store(0, Ordering::Relaxed);
    Ok(())
}
