//! Material physics tables and the two on-disk material formats.
//!
//! A material is a bundle of energy-indexed scattering tables plus a vacuum
//! barrier in eV. Tables live on a fixed logarithmic energy grid so the same
//! flat record can be sampled on the host and uploaded verbatim as a storage
//! buffer; files using other grid sizes are resampled at load time.
//!
//! Two formats are accepted, dispatched on the filename suffix: filenames
//! ending in `t` use the flat legacy layout, anything else is parsed as the
//! hierarchical self-describing container.

use std::fs;
use std::path::Path;

use bytemuck::{Pod, Zeroable};

use crate::error::SimError;

/// Logarithmic energy bins per table.
pub const ENERGY_BINS: usize = 64;
/// Probability bins per inverse-CDF row.
pub const ICDF_BINS: usize = 64;

/// Flat material record, identical on host and device (WGSL `Mat` struct).
///
/// `elastic_icdf` rows map a uniform deviate to a scattering-angle cosine;
/// `inelastic_icdf` rows map it to an energy loss in eV. Inverse mean free
/// paths are in 1/nm.
#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
pub struct MaterialTables {
    pub log_e_min: f32,
    pub log_e_max: f32,
    /// Vacuum barrier in eV; electrons below it cannot leave the material.
    pub barrier: f32,
    pub _pad: f32,
    pub elastic_imfp: [f32; ENERGY_BINS],
    pub inelastic_imfp: [f32; ENERGY_BINS],
    pub elastic_icdf: [[f32; ICDF_BINS]; ENERGY_BINS],
    pub inelastic_icdf: [[f32; ICDF_BINS]; ENERGY_BINS],
}

impl MaterialTables {
    /// Fractional bin position for an energy, clamped to the table range.
    fn energy_bin(&self, energy: f32) -> f32 {
        let span = self.log_e_max - self.log_e_min;
        if span <= 0.0 {
            return 0.0;
        }
        let t = (energy.max(1e-6).ln() - self.log_e_min) / span;
        t.clamp(0.0, 1.0) * (ENERGY_BINS - 1) as f32
    }

    pub fn elastic_imfp_at(&self, energy: f32) -> f32 {
        interp_1d(&self.elastic_imfp, self.energy_bin(energy))
    }

    pub fn inelastic_imfp_at(&self, energy: f32) -> f32 {
        interp_1d(&self.inelastic_imfp, self.energy_bin(energy))
    }

    /// Scattering-angle cosine for a uniform deviate `u`.
    pub fn sample_elastic(&self, energy: f32, u: f32) -> f32 {
        interp_2d(&self.elastic_icdf, self.energy_bin(energy), u).clamp(-1.0, 1.0)
    }

    /// Energy loss in eV for a uniform deviate `u`.
    pub fn sample_inelastic(&self, energy: f32, u: f32) -> f32 {
        interp_2d(&self.inelastic_icdf, self.energy_bin(energy), u).max(0.0)
    }
}

fn interp_1d(table: &[f32; ENERGY_BINS], bin: f32) -> f32 {
    let i = (bin as usize).min(ENERGY_BINS - 2);
    let frac = bin - i as f32;
    table[i] * (1.0 - frac) + table[i + 1] * frac
}

fn interp_2d(table: &[[f32; ICDF_BINS]; ENERGY_BINS], bin: f32, u: f32) -> f32 {
    let i = (bin as usize).min(ENERGY_BINS - 2);
    let fi = bin - i as f32;
    let p = u.clamp(0.0, 1.0) * (ICDF_BINS - 1) as f32;
    let j = (p as usize).min(ICDF_BINS - 2);
    let fj = p - j as f32;
    let lo = table[i][j] * (1.0 - fj) + table[i][j + 1] * fj;
    let hi = table[i + 1][j] * (1.0 - fj) + table[i + 1][j + 1] * fj;
    lo * (1.0 - fi) + hi * fi
}

/// A loaded material. Host-side owner of the flat table record; the GPU
/// driver uploads `tables()` into its material storage buffer and holds the
/// device copy itself, so dropping a driver releases all device state.
pub struct Material {
    pub name: String,
    tables: Box<MaterialTables>,
}

impl Material {
    pub fn from_tables(name: impl Into<String>, tables: Box<MaterialTables>) -> Self {
        Self {
            name: name.into(),
            tables,
        }
    }

    /// Load a material file, dispatching on the filename suffix.
    pub fn load(path: &Path) -> Result<Self, SimError> {
        let name = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "material".into());
        let bytes = fs::read(path).map_err(|_| {
            SimError::InputMissing(format!("material file {}", path.display()))
        })?;
        if bytes.is_empty() {
            return Err(SimError::InputMissing(format!(
                "material file {} is empty",
                path.display()
            )));
        }
        let legacy = path
            .to_string_lossy()
            .chars()
            .next_back()
            .map_or(false, |c| c == 't');
        let tables = if legacy {
            parse_legacy(&bytes)
        } else {
            parse_hierarchical(&bytes)
        }
        .map_err(|msg| {
            SimError::InputInconsistent(format!("{}: {}", path.display(), msg))
        })?;
        Ok(Self::from_tables(name, tables))
    }

    pub fn tables(&self) -> &MaterialTables {
        &self.tables
    }

    pub fn barrier(&self) -> f32 {
        self.tables.barrier
    }

    /// Whether an electron of this energy can escape into vacuum.
    pub fn can_reach_vacuum(&self, energy: f32) -> bool {
        energy >= self.tables.barrier
    }
}

// ---------------------------------------------------------------------------
// Legacy flat format
//
//   magic "EMAT" | barrier f32 | e_min f32 | e_max f32 | n_energy u32 | n_p u32
//   elastic_imfp [n_energy] | inelastic_imfp [n_energy]
//   elastic_icdf [n_energy * n_p] | inelastic_icdf [n_energy * n_p]
//
// All little-endian. Energies in eV, lengths in 1/nm.
// ---------------------------------------------------------------------------

const LEGACY_MAGIC: &[u8; 4] = b"EMAT";

fn parse_legacy(bytes: &[u8]) -> Result<Box<MaterialTables>, String> {
    let mut r = ByteReader::new(bytes);
    if r.bytes(4)? != LEGACY_MAGIC {
        return Err("bad magic for legacy material".into());
    }
    let barrier = r.f32()?;
    let e_min = r.f32()?;
    let e_max = r.f32()?;
    let n_energy = r.u32()? as usize;
    let n_p = r.u32()? as usize;
    if n_energy < 2 || n_p < 2 {
        return Err(format!("table too small: {n_energy} x {n_p}"));
    }
    if e_min <= 0.0 || e_max <= e_min {
        return Err(format!("bad energy range {e_min}..{e_max}"));
    }

    let elastic_imfp = r.f32_vec(n_energy)?;
    let inelastic_imfp = r.f32_vec(n_energy)?;
    let elastic_icdf = r.f32_vec(n_energy * n_p)?;
    let inelastic_icdf = r.f32_vec(n_energy * n_p)?;

    Ok(build_tables(
        barrier,
        e_min,
        e_max,
        &elastic_imfp,
        &inelastic_imfp,
        &elastic_icdf,
        &inelastic_icdf,
        n_p,
    ))
}

// ---------------------------------------------------------------------------
// Hierarchical self-describing format
//
//   magic "EMH1", then a node stream:
//     0x00 group-start  (name)
//     0x01 group-end
//     0x02 property     (name, unit string, f64 value)
//     0x03 dataset      (name, rank u8, dims u32 x rank, f32 data)
//   Strings are u16 length + UTF-8. Names are joined with '/' into paths.
//
// Required content: properties "barrier", "e_min", "e_max" (unit eV) at the
// root, and datasets "elastic/imfp", "elastic/icdf", "inelastic/imfp",
// "inelastic/icdf".
// ---------------------------------------------------------------------------

const HIER_MAGIC: &[u8; 4] = b"EMH1";

struct Dataset {
    dims: Vec<usize>,
    data: Vec<f32>,
}

fn parse_hierarchical(bytes: &[u8]) -> Result<Box<MaterialTables>, String> {
    let mut r = ByteReader::new(bytes);
    if r.bytes(4)? != HIER_MAGIC {
        return Err("bad magic for hierarchical material".into());
    }

    let mut path: Vec<String> = Vec::new();
    let mut properties: Vec<(String, String, f64)> = Vec::new();
    let mut datasets: Vec<(String, Dataset)> = Vec::new();

    while !r.at_end() {
        match r.u8()? {
            0x00 => path.push(r.string()?),
            0x01 => {
                path.pop().ok_or("unbalanced group end")?;
            }
            0x02 => {
                let name = joined(&path, &r.string()?);
                let unit = r.string()?;
                let value = r.f64()?;
                properties.push((name, unit, value));
            }
            0x03 => {
                let name = joined(&path, &r.string()?);
                let rank = r.u8()? as usize;
                let mut dims = Vec::with_capacity(rank);
                for _ in 0..rank {
                    dims.push(r.u32()? as usize);
                }
                let len = dims.iter().product::<usize>();
                if len == 0 || len > (1 << 26) {
                    return Err(format!("dataset {name} has implausible size {len}"));
                }
                let data = r.f32_vec(len)?;
                datasets.push((name, Dataset { dims, data }));
            }
            tag => return Err(format!("unknown node tag {tag:#x}")),
        }
    }
    if !path.is_empty() {
        return Err("unterminated group".into());
    }

    let property = |name: &str| -> Result<f64, String> {
        properties
            .iter()
            .find(|(n, _, _)| n == name)
            .map(|(_, unit, v)| {
                if unit != "eV" {
                    Err(format!("property {name} has unit {unit}, expected eV"))
                } else {
                    Ok(*v)
                }
            })
            .ok_or_else(|| format!("missing property {name}"))?
    };
    let dataset = |name: &str| -> Result<&Dataset, String> {
        datasets
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, d)| d)
            .ok_or_else(|| format!("missing dataset {name}"))
    };

    let barrier = property("barrier")? as f32;
    let e_min = property("e_min")? as f32;
    let e_max = property("e_max")? as f32;
    if e_min <= 0.0 || e_max <= e_min {
        return Err(format!("bad energy range {e_min}..{e_max}"));
    }

    let el_imfp = dataset("elastic/imfp")?;
    let inel_imfp = dataset("inelastic/imfp")?;
    let el_icdf = dataset("elastic/icdf")?;
    let inel_icdf = dataset("inelastic/icdf")?;

    let n_energy = el_imfp.data.len();
    if n_energy < 2 || inel_imfp.data.len() != n_energy {
        return Err("imfp tables disagree on energy grid".into());
    }
    let check_icdf = |d: &Dataset, which: &str| -> Result<usize, String> {
        match d.dims.as_slice() {
            [rows, cols] if *rows == n_energy && *cols >= 2 => Ok(*cols),
            dims => Err(format!("{which}/icdf has dims {dims:?}")),
        }
    };
    let n_p = check_icdf(el_icdf, "elastic")?;
    if check_icdf(inel_icdf, "inelastic")? != n_p {
        return Err("icdf tables disagree on probability grid".into());
    }

    Ok(build_tables(
        barrier,
        e_min,
        e_max,
        &el_imfp.data,
        &inel_imfp.data,
        &el_icdf.data,
        &inel_icdf.data,
        n_p,
    ))
}

fn joined(path: &[String], name: &str) -> String {
    if path.is_empty() {
        name.to_string()
    } else {
        format!("{}/{}", path.join("/"), name)
    }
}

// ---------------------------------------------------------------------------
// Resampling onto the internal grid
// ---------------------------------------------------------------------------

#[allow(clippy::too_many_arguments)]
fn build_tables(
    barrier: f32,
    e_min: f32,
    e_max: f32,
    elastic_imfp: &[f32],
    inelastic_imfp: &[f32],
    elastic_icdf: &[f32],
    inelastic_icdf: &[f32],
    n_p: usize,
) -> Box<MaterialTables> {
    let mut t: Box<MaterialTables> = bytemuck::zeroed_box();
    t.log_e_min = e_min.ln();
    t.log_e_max = e_max.ln();
    t.barrier = barrier;
    resample_1d(elastic_imfp, &mut t.elastic_imfp);
    resample_1d(inelastic_imfp, &mut t.inelastic_imfp);
    resample_2d(elastic_icdf, n_p, &mut t.elastic_icdf);
    resample_2d(inelastic_icdf, n_p, &mut t.inelastic_icdf);
    t
}

/// Linear resampling in index space; endpoints map to endpoints.
fn resample_1d(src: &[f32], dst: &mut [f32]) {
    let n = src.len();
    let dst_len = dst.len();
    for (i, d) in dst.iter_mut().enumerate() {
        let x = i as f32 / (dst_len - 1).max(1) as f32 * (n - 1) as f32;
        let j = (x as usize).min(n - 2);
        let f = x - j as f32;
        *d = src[j] * (1.0 - f) + src[j + 1] * f;
    }
}

fn resample_2d(src: &[f32], n_p: usize, dst: &mut [[f32; ICDF_BINS]; ENERGY_BINS]) {
    let n_e = src.len() / n_p;
    let mut row = vec![0.0f32; ICDF_BINS];
    let mut rows: Vec<Vec<f32>> = Vec::with_capacity(n_e);
    for e in 0..n_e {
        resample_1d(&src[e * n_p..(e + 1) * n_p], &mut row);
        rows.push(row.clone());
    }
    for (i, d) in dst.iter_mut().enumerate() {
        let x = i as f32 / (ENERGY_BINS - 1) as f32 * (n_e - 1) as f32;
        let j = (x as usize).min(n_e.saturating_sub(2));
        let f = x - j as f32;
        let hi = (j + 1).min(n_e - 1);
        for (k, v) in d.iter_mut().enumerate() {
            *v = rows[j][k] * (1.0 - f) + rows[hi][k] * f;
        }
    }
}

// ---------------------------------------------------------------------------

struct ByteReader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn at_end(&self) -> bool {
        self.pos >= self.bytes.len()
    }

    fn bytes(&mut self, n: usize) -> Result<&'a [u8], String> {
        if self.pos + n > self.bytes.len() {
            return Err("unexpected end of file".into());
        }
        let s = &self.bytes[self.pos..self.pos + n];
        self.pos += n;
        Ok(s)
    }

    fn u8(&mut self) -> Result<u8, String> {
        Ok(self.bytes(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, String> {
        Ok(u16::from_le_bytes(self.bytes(2)?.try_into().unwrap()))
    }

    fn u32(&mut self) -> Result<u32, String> {
        Ok(u32::from_le_bytes(self.bytes(4)?.try_into().unwrap()))
    }

    fn f32(&mut self) -> Result<f32, String> {
        Ok(f32::from_le_bytes(self.bytes(4)?.try_into().unwrap()))
    }

    fn f64(&mut self) -> Result<f64, String> {
        Ok(f64::from_le_bytes(self.bytes(8)?.try_into().unwrap()))
    }

    fn f32_vec(&mut self, n: usize) -> Result<Vec<f32>, String> {
        let raw = self.bytes(n * 4)?;
        Ok(raw
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes(c.try_into().unwrap()))
            .collect())
    }

    fn string(&mut self) -> Result<String, String> {
        let len = self.u16()? as usize;
        let raw = self.bytes(len)?;
        String::from_utf8(raw.to_vec()).map_err(|_| "invalid string".into())
    }
}

#[cfg(test)]
impl Material {
    /// Analytic material for tests: constant mean free paths, isotropic
    /// elastic deflection, fixed fractional energy loss per inelastic event.
    pub fn test_material(
        barrier: f32,
        elastic_mfp: f32,
        inelastic_mfp: f32,
        loss_fraction: f32,
    ) -> Self {
        let mut t: Box<MaterialTables> = bytemuck::zeroed_box();
        t.log_e_min = 1.0f32.ln();
        t.log_e_max = 50e3f32.ln();
        t.barrier = barrier;
        for i in 0..ENERGY_BINS {
            t.elastic_imfp[i] = if elastic_mfp > 0.0 { 1.0 / elastic_mfp } else { 0.0 };
            t.inelastic_imfp[i] = if inelastic_mfp > 0.0 {
                1.0 / inelastic_mfp
            } else {
                0.0
            };
            let e = (t.log_e_min + (t.log_e_max - t.log_e_min) * i as f32 / 63.0).exp();
            for j in 0..ICDF_BINS {
                let u = j as f32 / (ICDF_BINS - 1) as f32;
                t.elastic_icdf[i][j] = 1.0 - 2.0 * u;
                t.inelastic_icdf[i][j] = e * loss_fraction;
            }
        }
        Material::from_tables("test", t)
    }
}
