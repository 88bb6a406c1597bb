//! Triangulated sample geometry and ray traversal.
//!
//! The mesh is an immutable triangle slab with an axis-aligned bounding box.
//! Traversal is a brute-force nearest-crossing scan, which is exact and maps
//! one-to-one onto the traversal loop in the compute shader. Each triangle
//! carries the material on either side; negative material values are boundary
//! sentinels rather than indices into the material table.

use bytemuck::{Pod, Zeroable};
use glam::Vec3;

use crate::error::SimError;

/// Open space; particles fly ballistically and can only leave through a boundary.
pub const VACUUM: i32 = -1;
/// Absorbing boundary; crossing terminates the particle.
pub const TERMINATOR: i32 = -2;
/// Perfect mirror; crossing reflects the particle specularly.
pub const MIRROR: i32 = -3;
/// Secondary-electron detector surface.
pub const DETECTOR_SE: i32 = -4;
/// Backscatter detector surface.
pub const DETECTOR_BSE: i32 = -5;

/// True for either detector flavour.
pub fn is_detector(material: i32) -> bool {
    material == DETECTOR_SE || material == DETECTOR_BSE
}

/// Intersections closer than this along the ray are treated as the surface
/// the particle just left.
pub const RAY_EPS: f32 = 1e-5;

#[derive(Clone, Copy, Debug)]
pub struct Triangle {
    pub v0: Vec3,
    pub v1: Vec3,
    pub v2: Vec3,
    /// Material on the side the normal points away from.
    pub material_in: i32,
    /// Material on the side the normal points into.
    pub material_out: i32,
}

impl Triangle {
    pub fn normal(&self) -> Vec3 {
        (self.v1 - self.v0).cross(self.v2 - self.v0).normalize()
    }

    /// Device-layout copy (matches the WGSL `Tri` struct, 48 bytes).
    pub fn to_device(&self) -> GpuTriangle {
        GpuTriangle {
            v0: self.v0.to_array(),
            material_in: self.material_in,
            v1: self.v1.to_array(),
            material_out: self.material_out,
            v2: self.v2.to_array(),
            _pad: 0,
        }
    }
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
pub struct GpuTriangle {
    pub v0: [f32; 3],
    pub material_in: i32,
    pub v1: [f32; 3],
    pub material_out: i32,
    pub v2: [f32; 3],
    pub _pad: u32,
}

/// Nearest boundary crossing: triangle index and distance along the ray.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Crossing {
    pub triangle: usize,
    pub distance: f32,
}

pub struct TriangleMesh {
    triangles: Vec<Triangle>,
    aabb_min: Vec3,
    aabb_max: Vec3,
}

impl TriangleMesh {
    pub fn new(triangles: Vec<Triangle>) -> Result<Self, SimError> {
        if triangles.is_empty() {
            return Err(SimError::InputMissing("geometry has no triangles".into()));
        }
        let mut aabb_min = Vec3::splat(f32::INFINITY);
        let mut aabb_max = Vec3::splat(f32::NEG_INFINITY);
        for t in &triangles {
            for v in [t.v0, t.v1, t.v2] {
                aabb_min = aabb_min.min(v);
                aabb_max = aabb_max.max(v);
            }
        }
        Ok(Self {
            triangles,
            aabb_min,
            aabb_max,
        })
    }

    pub fn triangles(&self) -> &[Triangle] {
        &self.triangles
    }

    pub fn aabb_min(&self) -> Vec3 {
        self.aabb_min
    }

    pub fn aabb_max(&self) -> Vec3 {
        self.aabb_max
    }

    pub fn contains(&self, p: Vec3) -> bool {
        p.cmpge(self.aabb_min).all() && p.cmple(self.aabb_max).all()
    }

    /// Largest real material index referenced by any triangle, or `None` if
    /// the geometry only uses sentinel materials.
    pub fn max_material_id(&self) -> Option<i32> {
        self.triangles
            .iter()
            .flat_map(|t| [t.material_in, t.material_out])
            .filter(|&m| m >= 0)
            .max()
    }

    /// Nearest crossing within `max_distance`, or `None` if the path is clear.
    pub fn trace(&self, pos: Vec3, dir: Vec3, max_distance: f32) -> Option<Crossing> {
        let mut nearest: Option<Crossing> = None;
        for (i, tri) in self.triangles.iter().enumerate() {
            if let Some(t) = intersect(tri, pos, dir) {
                if t < max_distance && nearest.map_or(true, |c| t < c.distance) {
                    nearest = Some(Crossing {
                        triangle: i,
                        distance: t,
                    });
                }
            }
        }
        nearest
    }

    pub fn to_device(&self) -> Vec<GpuTriangle> {
        self.triangles.iter().map(Triangle::to_device).collect()
    }
}

/// Möller–Trumbore ray/triangle intersection. Returns the distance along the
/// ray, ignoring hits closer than [`RAY_EPS`].
fn intersect(tri: &Triangle, pos: Vec3, dir: Vec3) -> Option<f32> {
    let e1 = tri.v1 - tri.v0;
    let e2 = tri.v2 - tri.v0;
    let p = dir.cross(e2);
    let det = e1.dot(p);
    if det.abs() < 1e-12 {
        return None;
    }
    let inv_det = 1.0 / det;
    let s = pos - tri.v0;
    let u = s.dot(p) * inv_det;
    if !(0.0..=1.0).contains(&u) {
        return None;
    }
    let q = s.cross(e1);
    let v = dir.dot(q) * inv_det;
    if v < 0.0 || u + v > 1.0 {
        return None;
    }
    let t = e2.dot(q) * inv_det;
    if t > RAY_EPS {
        Some(t)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn square_at_z(z: f32, material_in: i32, material_out: i32) -> [Triangle; 2] {
        let a = Vec3::new(-10.0, -10.0, z);
        let b = Vec3::new(10.0, -10.0, z);
        let c = Vec3::new(10.0, 10.0, z);
        let d = Vec3::new(-10.0, 10.0, z);
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

    #[test]
    fn empty_mesh_is_an_error() {
        assert!(matches!(
            TriangleMesh::new(Vec::new()),
            Err(SimError::InputMissing(_))
        ));
    }

    #[test]
    fn aabb_covers_all_vertices() {
        let mesh = TriangleMesh::new(square_at_z(2.0, VACUUM, 0).to_vec()).unwrap();
        assert_eq!(mesh.aabb_min(), Vec3::new(-10.0, -10.0, 2.0));
        assert_eq!(mesh.aabb_max(), Vec3::new(10.0, 10.0, 2.0));
        assert!(mesh.contains(Vec3::new(0.0, 0.0, 2.0)));
        assert!(!mesh.contains(Vec3::new(0.0, 0.0, 3.0)));
    }

    #[test]
    fn trace_finds_nearest_crossing() {
        let mut tris = square_at_z(5.0, VACUUM, 0).to_vec();
        tris.extend(square_at_z(2.0, VACUUM, 0));
        let mesh = TriangleMesh::new(tris).unwrap();

        let hit = mesh
            .trace(Vec3::ZERO, Vec3::Z, f32::INFINITY)
            .expect("beam crosses both planes");
        assert!((hit.distance - 2.0).abs() < 1e-6);
        assert!(hit.triangle >= 2, "nearer plane wins");
    }

    #[test]
    fn trace_respects_max_distance() {
        let mesh = TriangleMesh::new(square_at_z(5.0, VACUUM, 0).to_vec()).unwrap();
        assert!(mesh.trace(Vec3::ZERO, Vec3::Z, 4.0).is_none());
        assert!(mesh.trace(Vec3::ZERO, Vec3::Z, 6.0).is_some());
    }

    #[test]
    fn self_intersection_is_suppressed() {
        let mesh = TriangleMesh::new(square_at_z(1.0, VACUUM, 0).to_vec()).unwrap();
        // A particle sitting just past the surface must not re-hit it.
        let pos = Vec3::new(0.0, 0.0, 1.0 + RAY_EPS * 0.5);
        assert!(mesh.trace(pos, Vec3::Z, f32::INFINITY).is_none());
    }

    #[test]
    fn max_material_ignores_sentinels() {
        let mut tris = square_at_z(1.0, VACUUM, 3).to_vec();
        tris.extend(square_at_z(2.0, DETECTOR_SE, TERMINATOR));
        let mesh = TriangleMesh::new(tris).unwrap();
        assert_eq!(mesh.max_material_id(), Some(3));
    }

    #[test]
    fn detector_sentinels() {
        assert!(is_detector(DETECTOR_SE));
        assert!(is_detector(DETECTOR_BSE));
        assert!(!is_detector(VACUUM));
        assert!(!is_detector(0));
    }

    #[test]
    fn gpu_triangle_layout_is_48_bytes() {
        assert_eq!(std::mem::size_of::<GpuTriangle>(), 48);
    }
}
