//! Pilot run that tunes the steady-state batch shape.
//!
//! A small population is simulated to exhaustion while the running and
//! detected counts are sampled per iteration. The sample where the running
//! count peaks gives the cascade depth, which becomes the frame size; the
//! decimated tail of the running curve estimates how many overlapping
//! cohorts the slab hosts at equilibrium, which sizes the batch.

use log::info;

use crate::driver::Driver;
use crate::work_pool::WorkPool;

/// Steady-state tuning derived from a prescan: `frame_size` iterations
/// between drains, `batch_size` particles injected per drain.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BatchPlan {
    pub frame_size: usize,
    pub batch_size: usize,
}

/// Per-iteration `(running, detected)` samples of the pilot population. The
/// first sample records the push itself.
#[derive(Clone, Debug)]
pub struct PrescanStats {
    pub push_size: usize,
    pub samples: Vec<(u32, u32)>,
}

/// Run the pilot population to exhaustion, sampling counts per iteration.
/// Consumes up to `prescan_size` primaries from the pool; their detected
/// records stay in the driver for the caller to flush.
pub fn run_prescan<D: Driver>(
    driver: &mut D,
    pool: &WorkPool,
    prescan_size: usize,
) -> PrescanStats {
    let (particles, tags) = pool.get_work(prescan_size);
    let pushed = driver.push(particles, tags);

    let mut samples = vec![(pushed as u32, 0)];
    while driver.running_count() > 0 {
        driver.do_iteration();
        samples.push((driver.running_count(), driver.detected_count()));
    }

    PrescanStats {
        push_size: pushed,
        samples,
    }
}

/// Derive the batch shape from prescan statistics.
///
/// The peak of the running curve at index `k` puts the cascade depth at
/// `k + 1`. The accumulator doubles the peak-index terms to account for the
/// ramp-up phase and then samples the running curve at whole multiples of the
/// depth; `batch_factor < 1` leaves headroom for variance.
pub fn derive_plan(stats: &PrescanStats, capacity: usize, batch_factor: f32) -> BatchPlan {
    let p = stats.push_size as f32;
    let peak = stats
        .samples
        .iter()
        .enumerate()
        .max_by_key(|(_, s)| s.0)
        .map(|(i, _)| i)
        .unwrap_or(0);
    let k = peak + 1;

    let mut plan = BatchPlan {
        frame_size: k.max(1),
        batch_size: (batch_factor * capacity as f32) as usize,
    };
    if p <= 0.0 || k >= stats.samples.len() {
        info!("degenerate prescan, falling back to {plan:?}");
        return plan;
    }

    let (running_k, detected_k) = stats.samples[k];
    let mut accumulator = 2.0 * running_k as f32 / p + 2.0 * detected_k as f32 / p;
    let mut i = 2 * k;
    while i < stats.samples.len() {
        accumulator += stats.samples[i].0 as f32 / p;
        i += k;
    }

    if accumulator > 0.0 {
        plan.batch_size = (batch_factor * capacity as f32 / accumulator) as usize;
    }
    info!(
        "prescan: cascade depth {}, occupancy estimate {accumulator:.3}, plan {plan:?}",
        plan.frame_size
    );
    plan
}
