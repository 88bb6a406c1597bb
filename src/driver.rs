//! Simulation drivers: a fixed-capacity particle store advanced one physics
//! event per iteration.
//!
//! [`Driver`] is the contract shared by the CPU and GPU drivers, and the
//! surface the prescan controller tunes against. [`CpuDriver`] is the host
//! implementation; the GPU driver in [`crate::gpu`] runs the same per-event
//! semantics in a compute shader.

use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

use crate::geometry::{self, is_detector, Crossing, TriangleMesh};
use crate::particle::Particle;
use crate::physics::{EventKind, ScatterPhysics};

/// Public driver contract.
///
/// `push` injects into empty slots (never beyond capacity, no scattering);
/// `do_iteration` advances every alive slot by exactly one event; detected
/// slots persist until drained by `flush_detected`, terminated slots free up
/// immediately.
pub trait Driver {
    /// Inject up to `particles.len()` particles; returns the number placed.
    fn push(&mut self, particles: &[Particle], tags: &[u32]) -> usize;

    fn do_iteration(&mut self);

    fn running_count(&mut self) -> u32;

    fn detected_count(&mut self) -> u32;

    /// Drain every detected slot through the callback and empty it. Returns
    /// the running count after the drain.
    fn flush_detected<F: FnMut(&Particle, u32)>(&mut self, callback: F) -> u32;
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum SlotState {
    Empty,
    Alive,
    Detected,
}

#[derive(Clone, Copy)]
struct Slot {
    particle: Particle,
    tag: u32,
    material: i32,
    state: SlotState,
}

enum Outcome {
    Continue,
    Terminated,
    Detected,
}

pub struct CpuDriver<'a, P> {
    geometry: &'a TriangleMesh,
    materials: &'a [P],
    energy_threshold: f32,
    rng: ChaCha8Rng,
    slots: Vec<Slot>,
    /// Stack of empty slot indices; low indices are reused first so the
    /// occupied region stays compact.
    free: Vec<u32>,
    /// Secondaries produced this iteration, placed after the scan so every
    /// alive slot sees exactly one event per iteration.
    spawned: Vec<(Particle, i32, u32)>,
    high_water: usize,
    running: u32,
    detected: u32,
}

impl<'a, P: ScatterPhysics> CpuDriver<'a, P> {
    pub fn new(
        capacity: usize,
        geometry: &'a TriangleMesh,
        materials: &'a [P],
        energy_threshold: f32,
        seed: u64,
    ) -> Self {
        assert!(capacity > 0);
        let empty = Slot {
            particle: Particle::new(glam::Vec3::ZERO, glam::Vec3::Z, 0.0),
            tag: 0,
            material: geometry::VACUUM,
            state: SlotState::Empty,
        };
        Self {
            geometry,
            materials,
            energy_threshold,
            rng: ChaCha8Rng::seed_from_u64(seed),
            slots: vec![empty; capacity],
            free: (0..capacity as u32).rev().collect(),
            spawned: Vec::new(),
            high_water: 0,
            running: 0,
            detected: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Current running count without requiring `&mut self`; used by the
    /// progress telemetry.
    pub fn running(&self) -> u32 {
        self.running
    }

    /// Iterate until the population drains.
    pub fn simulate_to_end(&mut self) {
        while self.running > 0 {
            self.advance_all();
        }
    }

    fn advance_all(&mut self) {
        self.spawned.clear();
        for i in 0..self.high_water {
            if self.slots[i].state == SlotState::Alive {
                self.advance(i);
            }
        }
        // Place this iteration's secondaries; drop them when the slab is full
        // rather than growing past capacity. Stillborn secondaries below the
        // termination threshold never occupy a slot.
        while let Some((particle, material, tag)) = self.spawned.pop() {
            if particle.energy < self.energy_threshold || particle.energy <= 0.0 {
                continue;
            }
            let Some(slot) = self.free.pop() else {
                self.spawned.clear();
                break;
            };
            let i = slot as usize;
            self.slots[i] = Slot {
                particle,
                tag,
                material,
                state: SlotState::Alive,
            };
            self.high_water = self.high_water.max(i + 1);
            self.running += 1;
        }
    }

    /// One physics event for slot `i`: the nearer of the next boundary
    /// crossing and the next scattering event.
    fn advance(&mut self, i: usize) {
        let mut s = self.slots[i];
        let p = &mut s.particle;

        let free_path = if s.material >= 0 {
            Some(self.materials[s.material as usize].sample_free_path(p.energy, &mut self.rng))
        } else {
            None
        };
        let max_distance = free_path.as_ref().map_or(f32::INFINITY, |fp| fp.distance);

        let mut outcome = match self.geometry.trace(p.pos, p.dir, max_distance) {
            Some(crossing) => Self::cross_boundary(self.materials, &mut s, crossing, self.geometry),
            None => match free_path {
                Some(fp) if fp.distance.is_finite() => {
                    s.particle.pos += s.particle.dir * fp.distance;
                    let phys = &self.materials[s.material as usize];
                    match fp.kind {
                        EventKind::Elastic => {
                            phys.apply_elastic(&mut s.particle, &mut self.rng);
                        }
                        EventKind::Inelastic => {
                            if let Some(secondary) =
                                phys.apply_inelastic(&mut s.particle, &mut self.rng)
                            {
                                self.spawned.push((secondary, s.material, s.tag));
                            }
                        }
                    }
                    Outcome::Continue
                }
                // Ballistic with nothing ahead: the particle leaves the domain.
                _ => Outcome::Terminated,
            },
        };

        if matches!(outcome, Outcome::Continue)
            && (s.particle.energy < self.energy_threshold || s.particle.energy <= 0.0)
        {
            outcome = Outcome::Terminated;
        }

        match outcome {
            Outcome::Continue => self.slots[i] = s,
            Outcome::Terminated => {
                self.slots[i].state = SlotState::Empty;
                self.free.push(i as u32);
                self.running -= 1;
            }
            Outcome::Detected => {
                s.state = SlotState::Detected;
                self.slots[i] = s;
                self.running -= 1;
                self.detected += 1;
            }
        }
    }

    fn cross_boundary(
        materials: &[P],
        s: &mut Slot,
        crossing: Crossing,
        geometry: &TriangleMesh,
    ) -> Outcome {
        let tri = &geometry.triangles()[crossing.triangle];
        let normal = tri.normal();
        let p = &mut s.particle;
        p.pos += p.dir * crossing.distance;

        let target = if p.dir.dot(normal) >= 0.0 {
            tri.material_out
        } else {
            tri.material_in
        };

        if is_detector(target) {
            return Outcome::Detected;
        }
        if target == geometry::TERMINATOR {
            return Outcome::Terminated;
        }

        let escaping = target == geometry::VACUUM && s.material >= 0;
        let reflect = target == geometry::MIRROR
            || (escaping && !can_reach_vacuum(&materials[s.material as usize], p.energy));
        if reflect {
            p.dir -= 2.0 * p.dir.dot(normal) * normal;
        } else if escaping {
            p.energy -= materials[s.material as usize].barrier();
            s.material = geometry::VACUUM;
        } else if target >= 0 {
            if s.material < 0 {
                p.energy += materials[target as usize].barrier();
            }
            s.material = target;
        }
        // Step off the surface so the next trace does not re-hit it.
        p.pos += p.dir * geometry::RAY_EPS;
        Outcome::Continue
    }
}

fn can_reach_vacuum<P: ScatterPhysics>(phys: &P, energy: f32) -> bool {
    energy >= phys.barrier()
}

impl<'a, P: ScatterPhysics> Driver for CpuDriver<'a, P> {
    fn push(&mut self, particles: &[Particle], tags: &[u32]) -> usize {
        debug_assert_eq!(particles.len(), tags.len());
        let mut pushed = 0;
        for (p, &tag) in particles.iter().zip(tags) {
            let Some(slot) = self.free.pop() else { break };
            let i = slot as usize;
            self.slots[i] = Slot {
                particle: *p,
                tag,
                material: geometry::VACUUM,
                state: SlotState::Alive,
            };
            self.high_water = self.high_water.max(i + 1);
            self.running += 1;
            pushed += 1;
        }
        pushed
    }

    fn do_iteration(&mut self) {
        self.advance_all();
    }

    fn running_count(&mut self) -> u32 {
        self.running
    }

    fn detected_count(&mut self) -> u32 {
        self.detected
    }

    fn flush_detected<F: FnMut(&Particle, u32)>(&mut self, mut callback: F) -> u32 {
        for i in 0..self.high_water {
            if self.slots[i].state == SlotState::Detected {
                callback(&self.slots[i].particle, self.slots[i].tag);
                self.slots[i].state = SlotState::Empty;
                self.free.push(i as u32);
            }
        }
        self.detected = 0;
        self.running
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::{Triangle, DETECTOR_SE, MIRROR, TERMINATOR, VACUUM};
    use crate::material::Material;
    use glam::Vec3;

    fn square_at_z(z: f32, material_in: i32, material_out: i32) -> [Triangle; 2] {
        let a = Vec3::new(-50.0, -50.0, z);
        let b = Vec3::new(50.0, -50.0, z);
        let c = Vec3::new(50.0, 50.0, z);
        let d = Vec3::new(-50.0, 50.0, z);
        [
            Triangle {
                v0: a,
                v1: b,
                v2: c,
                material_in,
                material_out,
            },
            Triangle {
                v0: a,
                v1: c,
                v2: d,
                material_in,
                material_out,
            },
        ]
    }

    fn beam(n: usize, energy: f32) -> (Vec<Particle>, Vec<u32>) {
        let p = (0..n)
            .map(|i| {
                Particle::new(
                    Vec3::new(i as f32 * 0.01, 0.0, 0.0),
                    Vec3::Z,
                    energy,
                )
            })
            .collect();
        let t = (0..n as u32).collect();
        (p, t)
    }

    #[test]
    fn vacuum_beam_reaches_detector() {
        let mesh = TriangleMesh::new(square_at_z(2.0, VACUUM, DETECTOR_SE).to_vec()).unwrap();
        let materials: Vec<Material> = Vec::new();
        let mut d = CpuDriver::new(64, &mesh, &materials, 0.0, 1);

        let (p, t) = beam(10, 500.0);
        assert_eq!(d.push(&p, &t), 10);
        assert_eq!(d.running_count(), 10);

        d.do_iteration();
        assert_eq!(d.running_count(), 0);
        assert_eq!(d.detected_count(), 10);

        let mut flushed = Vec::new();
        let running = d.flush_detected(|p, tag| flushed.push((tag, p.energy, p.pos.z)));
        assert_eq!(running, 0);
        assert_eq!(d.detected_count(), 0);
        assert_eq!(flushed.len(), 10);
        let mut tags: Vec<u32> = flushed.iter().map(|f| f.0).collect();
        tags.sort();
        assert_eq!(tags, (0..10).collect::<Vec<_>>());
        for (_, energy, z) in flushed {
            assert_eq!(energy, 500.0);
            assert!((z - 2.0).abs() < 1e-3);
        }
    }

    #[test]
    fn absorbing_slab_detects_nothing() {
        // Entry plane at z = 1; one inelastic event in material 0 halves the
        // energy, which drops every electron below the 200 eV threshold.
        let mesh = TriangleMesh::new(square_at_z(1.0, VACUUM, 0).to_vec()).unwrap();
        let materials = vec![Material::test_material(0.0, 0.0, 0.1, 0.5)];
        let mut d = CpuDriver::new(2048, &mesh, &materials, 200.0, 2);

        let (p, t) = beam(100, 300.0);
        assert_eq!(d.push(&p, &t), 100);
        for _ in 0..8 {
            d.do_iteration();
            if d.running_count() == 0 {
                break;
            }
        }
        assert_eq!(d.running_count(), 0);
        assert_eq!(d.detected_count(), 0);
    }

    #[test]
    fn mirror_reflects_into_terminator() {
        let mut tris = square_at_z(2.0, VACUUM, MIRROR).to_vec();
        tris.extend(square_at_z(-2.0, TERMINATOR, VACUUM));
        let mesh = TriangleMesh::new(tris).unwrap();
        let materials: Vec<Material> = Vec::new();
        let mut d = CpuDriver::new(8, &mesh, &materials, 0.0, 3);

        let (p, t) = beam(1, 100.0);
        d.push(&p, &t);
        d.do_iteration(); // bounce off the mirror
        assert_eq!(d.running_count(), 1);
        d.do_iteration(); // absorbed below
        assert_eq!(d.running_count(), 0);
        assert_eq!(d.detected_count(), 0);
    }

    #[test]
    fn barrier_energy_restored_on_exit() {
        // Inert slab between z = 1 and z = 3 with a 500 eV barrier, detector
        // behind it. Entering adds the barrier, escaping subtracts it, so the
        // detected energy equals the injection energy.
        let mut tris = square_at_z(1.0, VACUUM, 0).to_vec();
        tris.extend(square_at_z(3.0, 0, VACUUM));
        tris.extend(square_at_z(5.0, VACUUM, DETECTOR_SE));
        let mesh = TriangleMesh::new(tris).unwrap();
        let materials = vec![Material::test_material(500.0, 0.0, 0.0, 0.0)];
        let mut d = CpuDriver::new(8, &mesh, &materials, 0.0, 4);

        let (p, t) = beam(1, 40.0);
        d.push(&p, &t);
        for _ in 0..4 {
            d.do_iteration();
        }
        assert_eq!(d.detected_count(), 1);
        let mut energy = 0.0;
        d.flush_detected(|p, _| energy = p.energy);
        assert!((energy - 40.0).abs() < 1e-3, "detected at {energy} eV");
    }

    #[test]
    fn push_respects_capacity() {
        let mesh = TriangleMesh::new(square_at_z(2.0, VACUUM, DETECTOR_SE).to_vec()).unwrap();
        let materials: Vec<Material> = Vec::new();
        let mut d = CpuDriver::new(4, &mesh, &materials, 0.0, 5);

        let (p, t) = beam(10, 100.0);
        assert_eq!(d.push(&p, &t), 4);
        assert_eq!(d.running_count(), 4);
        assert_eq!(d.push(&p[4..], &t[4..]), 0);
    }

    #[test]
    fn detected_slots_free_up_after_flush() {
        let mesh = TriangleMesh::new(square_at_z(2.0, VACUUM, DETECTOR_SE).to_vec()).unwrap();
        let materials: Vec<Material> = Vec::new();
        let mut d = CpuDriver::new(4, &mesh, &materials, 0.0, 6);

        let (p, t) = beam(4, 100.0);
        d.push(&p, &t);
        d.do_iteration();
        assert_eq!(d.push(&p, &t), 0, "detected slots still occupied");
        d.flush_detected(|_, _| {});
        assert_eq!(d.push(&p, &t), 4, "slots reusable after flush");
    }

    #[test]
    fn cascade_stays_within_capacity() {
        let mesh = TriangleMesh::new(square_at_z(1.0, VACUUM, 0).to_vec()).unwrap();
        // Half the energy to a secondary on every inelastic event: the
        // population doubles until energies decay below threshold.
        let materials = vec![Material::test_material(0.0, 0.0, 0.05, 0.5)];
        let capacity = 16;
        let mut d = CpuDriver::new(capacity, &mesh, &materials, 10.0, 7);

        let (p, t) = beam(2, 5000.0);
        d.push(&p, &t);
        let mut iterations = 0;
        while d.running_count() > 0 {
            d.do_iteration();
            let occupied = d.running_count() + d.detected_count();
            assert!(occupied as usize <= capacity, "slab overflow: {occupied}");
            iterations += 1;
            assert!(iterations < 10_000, "cascade failed to terminate");
        }
    }

    #[test]
    fn create_destroy_cycles_are_clean() {
        let mesh = TriangleMesh::new(square_at_z(2.0, VACUUM, DETECTOR_SE).to_vec()).unwrap();
        let materials = vec![Material::test_material(4.0, 1.0, 1.0, 0.5)];
        for seed in 0..100 {
            let mut d = CpuDriver::new(256, &mesh, &materials, 0.0, seed);
            let (p, t) = beam(4, 100.0);
            d.push(&p, &t);
            d.do_iteration();
        }
    }

    #[test]
    fn simulate_to_end_drains_population() {
        let mesh = TriangleMesh::new(square_at_z(2.0, VACUUM, DETECTOR_SE).to_vec()).unwrap();
        let materials: Vec<Material> = Vec::new();
        let mut d = CpuDriver::new(8, &mesh, &materials, 0.0, 8);
        let (p, t) = beam(5, 100.0);
        d.push(&p, &t);
        d.simulate_to_end();
        assert_eq!(d.running(), 0);
        assert_eq!(d.detected_count(), 5);
    }
}
