//! Triangle and primary-electron file loaders.
//!
//! Both formats are flat little-endian record streams:
//!
//! - `.tri`: `(i32 material_in, i32 material_out, 9 x f32 vertices)`,
//!   44 bytes per triangle. Negative material values are the boundary
//!   sentinels from [`crate::geometry`].
//! - `.pri`: `(3 x f32 position, 3 x f32 direction, f32 energy,
//!   2 x i32 pixel)`, 36 bytes per primary.
//!
//! Primaries starting outside the geometry bounding box cannot be simulated
//! and are dropped with a warning.

use std::fs;
use std::path::Path;

use glam::Vec3;
use log::warn;

use crate::error::SimError;
use crate::geometry::Triangle;
use crate::particle::{Particle, Pixel};

const TRI_RECORD: usize = 2 * 4 + 9 * 4;
const PRI_RECORD: usize = 7 * 4 + 2 * 4;

pub fn load_tri_file(path: &Path) -> Result<Vec<Triangle>, SimError> {
    let bytes = fs::read(path)
        .map_err(|_| SimError::InputMissing(format!("geometry file {}", path.display())))?;
    if bytes.is_empty() {
        return Err(SimError::InputMissing(format!(
            "geometry file {} is empty",
            path.display()
        )));
    }
    if bytes.len() % TRI_RECORD != 0 {
        return Err(SimError::InputInconsistent(format!(
            "{}: size {} is not a multiple of the {TRI_RECORD}-byte triangle record",
            path.display(),
            bytes.len()
        )));
    }

    let triangles = bytes
        .chunks_exact(TRI_RECORD)
        .map(|rec| {
            let material_in = read_i32(rec, 0);
            let material_out = read_i32(rec, 4);
            let v = |i: usize| {
                Vec3::new(
                    read_f32(rec, 8 + i * 12),
                    read_f32(rec, 12 + i * 12),
                    read_f32(rec, 16 + i * 12),
                )
            };
            Triangle {
                v0: v(0),
                v1: v(1),
                v2: v(2),
                material_in,
                material_out,
            }
        })
        .collect();
    Ok(triangles)
}

pub fn load_pri_file(
    path: &Path,
    aabb_min: Vec3,
    aabb_max: Vec3,
) -> Result<(Vec<Particle>, Vec<Pixel>), SimError> {
    let bytes = fs::read(path)
        .map_err(|_| SimError::InputMissing(format!("primaries file {}", path.display())))?;
    if bytes.is_empty() {
        return Err(SimError::InputMissing(format!(
            "primaries file {} is empty",
            path.display()
        )));
    }
    if bytes.len() % PRI_RECORD != 0 {
        return Err(SimError::InputInconsistent(format!(
            "{}: size {} is not a multiple of the {PRI_RECORD}-byte primary record",
            path.display(),
            bytes.len()
        )));
    }

    let mut primaries = Vec::with_capacity(bytes.len() / PRI_RECORD);
    let mut pixels = Vec::with_capacity(bytes.len() / PRI_RECORD);
    let mut rejected = 0usize;
    for rec in bytes.chunks_exact(PRI_RECORD) {
        let pos = Vec3::new(read_f32(rec, 0), read_f32(rec, 4), read_f32(rec, 8));
        let dir = Vec3::new(read_f32(rec, 12), read_f32(rec, 16), read_f32(rec, 20));
        let energy = read_f32(rec, 24);
        let pixel = Pixel {
            x: read_i32(rec, 28),
            y: read_i32(rec, 32),
        };
        if pos.cmplt(aabb_min).any() || pos.cmpgt(aabb_max).any() {
            rejected += 1;
            continue;
        }
        primaries.push(Particle::new(pos, dir, energy));
        pixels.push(pixel);
    }
    if rejected > 0 {
        warn!("dropped {rejected} primaries starting outside the geometry bounds");
    }
    if primaries.is_empty() {
        return Err(SimError::InputMissing(format!(
            "primaries file {} has no usable primaries",
            path.display()
        )));
    }
    Ok((primaries, pixels))
}

fn read_f32(rec: &[u8], offset: usize) -> f32 {
    f32::from_le_bytes(rec[offset..offset + 4].try_into().unwrap())
}

fn read_i32(rec: &[u8], offset: usize) -> i32 {
    i32::from_le_bytes(rec[offset..offset + 4].try_into().unwrap())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::{DETECTOR_SE, VACUUM};
    use std::io::Write;

    fn write_tri(buf: &mut Vec<u8>, m_in: i32, m_out: i32, verts: [[f32; 3]; 3]) {
        buf.extend_from_slice(&m_in.to_le_bytes());
        buf.extend_from_slice(&m_out.to_le_bytes());
        for v in verts {
            for c in v {
                buf.extend_from_slice(&c.to_le_bytes());
            }
        }
    }

    fn write_pri(buf: &mut Vec<u8>, pos: [f32; 3], dir: [f32; 3], energy: f32, px: [i32; 2]) {
        for c in pos.into_iter().chain(dir) {
            buf.extend_from_slice(&c.to_le_bytes());
        }
        buf.extend_from_slice(&energy.to_le_bytes());
        for c in px {
            buf.extend_from_slice(&c.to_le_bytes());
        }
    }

    #[test]
    fn tri_round_trip() {
        let mut buf = Vec::new();
        write_tri(
            &mut buf,
            VACUUM,
            DETECTOR_SE,
            [[0.0, 0.0, 1.0], [1.0, 0.0, 1.0], [0.0, 1.0, 1.0]],
        );
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sample.tri");
        fs::File::create(&path).unwrap().write_all(&buf).unwrap();

        let tris = load_tri_file(&path).unwrap();
        assert_eq!(tris.len(), 1);
        assert_eq!(tris[0].material_in, VACUUM);
        assert_eq!(tris[0].material_out, DETECTOR_SE);
        assert_eq!(tris[0].v2, Vec3::new(0.0, 1.0, 1.0));
    }

    #[test]
    fn empty_tri_file_is_missing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.tri");
        fs::File::create(&path).unwrap();
        assert!(matches!(
            load_tri_file(&path),
            Err(SimError::InputMissing(_))
        ));
    }

    #[test]
    fn truncated_tri_file_is_inconsistent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.tri");
        fs::File::create(&path).unwrap().write_all(&[0u8; 10]).unwrap();
        assert!(matches!(
            load_tri_file(&path),
            Err(SimError::InputInconsistent(_))
        ));
    }

    #[test]
    fn pri_round_trip_and_aabb_rejection() {
        let mut buf = Vec::new();
        write_pri(&mut buf, [0.0, 0.0, 0.5], [0.0, 0.0, 1.0], 300.0, [3, 4]);
        write_pri(&mut buf, [99.0, 0.0, 0.5], [0.0, 0.0, 1.0], 300.0, [5, 6]);
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("beam.pri");
        fs::File::create(&path).unwrap().write_all(&buf).unwrap();

        let (primaries, pixels) = load_pri_file(
            &path,
            Vec3::new(-10.0, -10.0, 0.0),
            Vec3::new(10.0, 10.0, 10.0),
        )
        .unwrap();
        assert_eq!(primaries.len(), 1, "out-of-bounds primary dropped");
        assert_eq!(pixels, vec![Pixel { x: 3, y: 4 }]);
        assert_eq!(primaries[0].energy, 300.0);
    }

    #[test]
    fn all_rejected_is_missing() {
        let mut buf = Vec::new();
        write_pri(&mut buf, [99.0, 0.0, 0.0], [0.0, 0.0, 1.0], 300.0, [0, 0]);
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("outside.pri");
        fs::File::create(&path).unwrap().write_all(&buf).unwrap();

        assert!(matches!(
            load_pri_file(&path, Vec3::ZERO, Vec3::ONE),
            Err(SimError::InputMissing(_))
        ));
    }
}
