//! Per-event scattering physics.
//!
//! The driver is generic over [`ScatterPhysics`] so the event maths inlines
//! into the inner loop and tests can substitute deterministic stubs. The
//! production implementation samples the material tables; the compute shader
//! mirrors the same maths for the GPU driver.

use glam::Vec3;
use rand::Rng;

use crate::material::Material;
use crate::particle::Particle;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventKind {
    Elastic,
    Inelastic,
}

/// Distance to the next scattering event and which channel fires there.
#[derive(Clone, Copy, Debug)]
pub struct FreePath {
    pub distance: f32,
    pub kind: EventKind,
}

pub trait ScatterPhysics {
    fn sample_free_path<R: Rng>(&self, energy: f32, rng: &mut R) -> FreePath;

    fn apply_elastic<R: Rng>(&self, particle: &mut Particle, rng: &mut R);

    /// Apply an inelastic event; returns a spawned secondary if the event
    /// produces one.
    fn apply_inelastic<R: Rng>(&self, particle: &mut Particle, rng: &mut R) -> Option<Particle>;

    /// Vacuum barrier in eV.
    fn barrier(&self) -> f32;
}

impl ScatterPhysics for Material {
    fn sample_free_path<R: Rng>(&self, energy: f32, rng: &mut R) -> FreePath {
        let elastic = self.tables().elastic_imfp_at(energy);
        let inelastic = self.tables().inelastic_imfp_at(energy);
        let total = elastic + inelastic;
        if total <= 0.0 {
            return FreePath {
                distance: f32::INFINITY,
                kind: EventKind::Elastic,
            };
        }
        // Exponential free path; 1 - u keeps ln() away from zero.
        let u: f32 = rng.random();
        let distance = -(1.0 - u).ln() / total;
        let kind = if rng.random::<f32>() * total < elastic {
            EventKind::Elastic
        } else {
            EventKind::Inelastic
        };
        FreePath { distance, kind }
    }

    fn apply_elastic<R: Rng>(&self, particle: &mut Particle, rng: &mut R) {
        let cos_theta = self.tables().sample_elastic(particle.energy, rng.random());
        let phi = rng.random::<f32>() * std::f32::consts::TAU;
        particle.dir = deflect(particle.dir, cos_theta, phi);
    }

    fn apply_inelastic<R: Rng>(&self, particle: &mut Particle, rng: &mut R) -> Option<Particle> {
        let omega = self
            .tables()
            .sample_inelastic(particle.energy, rng.random())
            .min(particle.energy);
        particle.energy -= omega;
        // A secondary only exists when the primary survives the transfer;
        // a full transfer is absorption, not pair production.
        if omega <= 0.0 || particle.energy <= 0.0 {
            return None;
        }
        Some(Particle {
            pos: particle.pos,
            dir: isotropic_direction(rng),
            energy: omega,
        })
    }

    fn barrier(&self) -> f32 {
        self.tables().barrier
    }
}

/// Rotate `dir` by the given scattering angle cosine around a uniformly
/// distributed azimuth. `dir` must be a unit vector.
pub fn deflect(dir: Vec3, cos_theta: f32, phi: f32) -> Vec3 {
    let cos_theta = cos_theta.clamp(-1.0, 1.0);
    let sin_theta = (1.0 - cos_theta * cos_theta).sqrt();
    // Orthonormal frame around dir; pick the helper axis least aligned with it.
    let helper = if dir.x.abs() < 0.5 { Vec3::X } else { Vec3::Y };
    let t1 = dir.cross(helper).normalize();
    let t2 = dir.cross(t1);
    (dir * cos_theta + (t1 * phi.cos() + t2 * phi.sin()) * sin_theta).normalize()
}

/// Uniformly distributed unit vector.
pub fn isotropic_direction<R: Rng>(rng: &mut R) -> Vec3 {
    let cos_theta = 1.0 - 2.0 * rng.random::<f32>();
    let sin_theta = (1.0 - cos_theta * cos_theta).sqrt();
    let phi = rng.random::<f32>() * std::f32::consts::TAU;
    Vec3::new(sin_theta * phi.cos(), sin_theta * phi.sin(), cos_theta)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    #[test]
    fn deflect_preserves_length_and_angle() {
        let mut rng = ChaCha8Rng::seed_from_u64(42);
        for _ in 0..100 {
            let dir = isotropic_direction(&mut rng);
            let cos_theta = 1.0 - 2.0 * rng.random::<f32>();
            let phi = rng.random::<f32>() * std::f32::consts::TAU;
            let out = deflect(dir, cos_theta, phi);
            assert_relative_eq!(out.length(), 1.0, epsilon = 1e-5);
            assert_relative_eq!(out.dot(dir), cos_theta, epsilon = 1e-4);
        }
    }

    #[test]
    fn isotropic_direction_is_unit_and_unbiased() {
        let mut rng = ChaCha8Rng::seed_from_u64(7);
        let mut mean = Vec3::ZERO;
        for _ in 0..4000 {
            let d = isotropic_direction(&mut rng);
            assert_relative_eq!(d.length(), 1.0, epsilon = 1e-5);
            mean += d;
        }
        mean /= 4000.0;
        assert!(mean.length() < 0.05, "directional bias: {mean:?}");
    }

    #[test]
    fn free_path_has_expected_mean() {
        // 1/nm elastic + 1/nm inelastic rates give a 0.5 nm mean free path.
        let m = Material::test_material(0.0, 1.0, 1.0, 0.5);
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        let mut sum = 0.0;
        let mut elastic = 0usize;
        let n = 20_000;
        for _ in 0..n {
            let fp = m.sample_free_path(1000.0, &mut rng);
            sum += fp.distance;
            if fp.kind == EventKind::Elastic {
                elastic += 1;
            }
        }
        let mean = sum / n as f32;
        assert!((mean - 0.5).abs() < 0.02, "mean free path {mean}");
        let frac = elastic as f32 / n as f32;
        assert!((frac - 0.5).abs() < 0.02, "elastic fraction {frac}");
    }

    #[test]
    fn inelastic_event_conserves_energy() {
        let m = Material::test_material(0.0, 1.0, 1.0, 0.25);
        let mut rng = ChaCha8Rng::seed_from_u64(3);
        let mut p = Particle::new(Vec3::ZERO, Vec3::Z, 1000.0);
        let secondary = m.apply_inelastic(&mut p, &mut rng).expect("secondary");
        assert_relative_eq!(p.energy + secondary.energy, 1000.0, epsilon = 1e-3);
        assert_eq!(secondary.pos, p.pos);
    }

    #[test]
    fn zero_rate_material_never_scatters() {
        let m = Material::test_material(0.0, 0.0, 0.0, 0.5);
        let mut rng = ChaCha8Rng::seed_from_u64(9);
        let fp = m.sample_free_path(1000.0, &mut rng);
        assert!(fp.distance.is_infinite());
    }
}
