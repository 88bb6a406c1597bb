//! Electron state shared between the host simulation and device kernels.
//!
//! The host works with [`Particle`] (glam vectors, free functions); the GPU
//! driver stores the same data as [`DeviceParticle`], a 48-byte Pod record
//! that matches the WGSL `Slot` struct layout. Conversion is explicit, there
//! is no implicit sharing between the two views.

use bytemuck::{Pod, Zeroable};
use glam::Vec3;

/// Slot status codes used in the device particle store.
pub mod status {
    /// Slot holds no particle.
    pub const EMPTY: u32 = 0;
    /// Particle in flight.
    pub const ALIVE: u32 = 1;
    /// Particle crossed a detector surface; record persists until flushed.
    pub const DETECTED: u32 = 2;
}

/// An electron in flight: position in nm, unit direction, kinetic energy in eV.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Particle {
    pub pos: Vec3,
    pub dir: Vec3,
    pub energy: f32,
}

impl Particle {
    pub fn new(pos: Vec3, dir: Vec3, energy: f32) -> Self {
        Self {
            pos,
            dir: dir.normalize(),
            energy,
        }
    }
}

/// Pixel coordinate a primary electron belongs to.
///
/// The pixel map is indexed by tag and owned by the orchestrator; detected
/// records are correlated back to pixels after output.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Pixel {
    pub x: i32,
    pub y: i32,
}

/// Device-layout particle slot (matches the WGSL `Slot` struct, 48 bytes).
#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
pub struct DeviceParticle {
    pub pos: [f32; 3],
    pub energy: f32,
    pub dir: [f32; 3],
    pub tag: u32,
    pub material: i32,
    pub status: u32,
    pub rng_state: u32,
    pub _pad: u32,
}

impl DeviceParticle {
    /// Stage a host particle for upload. The push kernel flips the status to
    /// `ALIVE` when the slot enters the simulation.
    pub fn stage(p: &Particle, tag: u32, material: i32, rng_state: u32) -> Self {
        Self {
            pos: p.pos.to_array(),
            energy: p.energy,
            dir: p.dir.to_array(),
            tag,
            material,
            status: status::EMPTY,
            rng_state,
            _pad: 0,
        }
    }

    pub fn to_particle(&self) -> Particle {
        Particle {
            pos: Vec3::from_array(self.pos),
            dir: Vec3::from_array(self.dir),
            energy: self.energy,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_particle_layout_is_48_bytes() {
        assert_eq!(std::mem::size_of::<DeviceParticle>(), 48);
    }

    #[test]
    fn stage_round_trip() {
        let p = Particle::new(Vec3::new(1.0, 2.0, 3.0), Vec3::new(0.0, 0.0, 2.0), 500.0);
        let d = DeviceParticle::stage(&p, 7, -1, 0xdeadbeef);
        assert_eq!(d.tag, 7);
        assert_eq!(d.status, status::EMPTY);
        let back = d.to_particle();
        assert_eq!(back.pos, p.pos);
        assert_eq!(back.dir, Vec3::new(0.0, 0.0, 1.0));
        assert_eq!(back.energy, 500.0);
    }
}
