//! GPU simulation driver using wgpu compute shaders.
//!
//! The particle store lives in a storage buffer of fixed capacity; a shared
//! index buffer carries the free-slot stack and the detected-slot list, and a
//! small atomic counter buffer tracks both. Kernels in
//! `shaders/simulate.wgsl` implement the same per-event physics as the CPU
//! driver.
//!
//! Steady-state operation overlaps compute and transfer: detected records are
//! collected into a staging area and fresh work is uploaded asynchronously
//! while the device iterates, with one synchronisation per frame:
//!
//!   buffer_detected -> push_to_simulation -> iterate x frame_size
//!     -> push_to_buffer -> sync -> flush_buffered

use bytemuck::{Pod, Zeroable};
use wgpu::util::DeviceExt;

use crate::driver::Driver;
use crate::error::SimError;
use crate::geometry::{self, TriangleMesh};
use crate::material::{Material, MaterialTables};
use crate::particle::{DeviceParticle, Particle};
use crate::work_pool::WorkPool;

/// Simple seed mixer using splitmix64.
fn mix_seed(seed: u64) -> u64 {
    let mut z = seed.wrapping_add(0x9e3779b97f4a7c15);
    z = (z ^ (z >> 30)).wrapping_mul(0xbf58476d1ce4e5b9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94d049bb133111eb);
    z ^ (z >> 31)
}

/// Per-slot RNG stream for a staged particle; never zero so xorshift cycles.
fn slot_rng_state(seed: u64, tag: u32) -> u32 {
    (mix_seed(seed ^ tag as u64) as u32) | 1
}

const WORKGROUP: u32 = 64;

fn workgroups(n: u32) -> u32 {
    n.div_ceil(WORKGROUP)
}

#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
struct Uniforms {
    capacity: u32,
    triangle_count: u32,
    material_count: u32,
    push_count: u32,
    seed: u32,
    iteration: u32,
    energy_threshold: f32,
    spawn_capacity: u32,
}

const SLOT_BYTES: u64 = std::mem::size_of::<DeviceParticle>() as u64;
const COUNTER_BYTES: u64 = 16;
const COUNTER_DETECTED_OFFSET: u64 = 4;
const COUNTER_SPAWNED_OFFSET: u64 = 8;

/// List all usable adapters; one worker is spawned per adapter.
pub fn discover_adapters() -> Vec<wgpu::Adapter> {
    let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor {
        backends: wgpu::Backends::all(),
        ..Default::default()
    });
    instance.enumerate_adapters(wgpu::Backends::all())
}

pub struct GpuDriver {
    device: wgpu::Device,
    queue: wgpu::Queue,

    capacity: u32,
    spawn_capacity: u32,
    energy_threshold: f32,
    seed: u64,
    iteration: u32,
    triangle_count: u32,
    material_count: u32,

    slot_buffer: wgpu::Buffer,
    list_buffer: wgpu::Buffer,
    counter_buffer: wgpu::Buffer,
    spawn_buffer: wgpu::Buffer,
    input_buffer: wgpu::Buffer,
    record_buffer: wgpu::Buffer,
    triangle_buffer: wgpu::Buffer,
    material_buffer: wgpu::Buffer,
    uniform_buffer: wgpu::Buffer,
    counter_staging: wgpu::Buffer,
    record_staging: wgpu::Buffer,

    bind_group_layout: wgpu::BindGroupLayout,
    bind_group: wgpu::BindGroup,
    push_pipeline: wgpu::ComputePipeline,
    iterate_pipeline: wgpu::ComputePipeline,
    settle_pipeline: wgpu::ComputePipeline,
    collect_pipeline: wgpu::ComputePipeline,

    /// Host mirror of work reserved from the pool but not yet in a slot.
    staged: Vec<DeviceParticle>,
    batch_size: usize,
    input_capacity: usize,
    /// Counter values as of the last readback.
    free_known: u32,
    detected_known: u32,
    /// Records copied to staging by the last `buffer_detected`.
    staged_records: u32,
    flushable: Vec<DeviceParticle>,
}

impl GpuDriver {
    pub fn new(
        adapter: &wgpu::Adapter,
        capacity: u32,
        geometry: &TriangleMesh,
        materials: &[Material],
        energy_threshold: f32,
        seed: u64,
    ) -> Result<Self, SimError> {
        assert!(capacity > 0);
        let (device, queue) = pollster::block_on(adapter.request_device(&wgpu::DeviceDescriptor {
            label: None,
            required_features: wgpu::Features::empty(),
            required_limits: wgpu::Limits::default(),
            memory_hints: wgpu::MemoryHints::Performance,
            trace: Default::default(),
        }))
        .map_err(|e| SimError::Device(format!("request_device: {e}")))?;

        let spawn_capacity = (capacity / 4).clamp(1024, capacity);

        // Slots rely on buffer zero-initialisation: status 0 is EMPTY.
        let slot_buffer = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("slots"),
            size: capacity as u64 * SLOT_BYTES,
            usage: wgpu::BufferUsages::STORAGE,
            mapped_at_creation: false,
        });

        // Free stack over [0, capacity), detected list over [capacity, 2c).
        let list_init: Vec<u32> = (0..capacity).chain(0..capacity).collect();
        let list_buffer = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("lists"),
            contents: bytemuck::cast_slice(&list_init),
            usage: wgpu::BufferUsages::STORAGE,
        });

        let counter_buffer = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("counters"),
            contents: bytemuck::cast_slice(&[capacity, 0u32, 0u32, 0u32]),
            usage: wgpu::BufferUsages::STORAGE
                | wgpu::BufferUsages::COPY_DST
                | wgpu::BufferUsages::COPY_SRC,
        });

        let spawn_buffer = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("spawned"),
            size: spawn_capacity as u64 * SLOT_BYTES,
            usage: wgpu::BufferUsages::STORAGE,
            mapped_at_creation: false,
        });

        let input_buffer = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("staged_input"),
            size: SLOT_BYTES,
            usage: wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        let record_buffer = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("records"),
            size: capacity as u64 * SLOT_BYTES,
            usage: wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_SRC,
            mapped_at_creation: false,
        });

        let triangles = geometry.to_device();
        let triangle_buffer = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("triangles"),
            contents: bytemuck::cast_slice(&triangles),
            usage: wgpu::BufferUsages::STORAGE,
        });

        // A zeroed placeholder keeps the binding valid for vacuum-only runs.
        let device_materials: Vec<MaterialTables> = if materials.is_empty() {
            vec![Zeroable::zeroed()]
        } else {
            materials.iter().map(|m| *m.tables()).collect()
        };
        let material_buffer = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("materials"),
            contents: bytemuck::cast_slice(&device_materials),
            usage: wgpu::BufferUsages::STORAGE,
        });

        let uniforms = Uniforms {
            capacity,
            triangle_count: triangles.len() as u32,
            material_count: materials.len() as u32,
            push_count: 0,
            seed: mix_seed(seed) as u32,
            iteration: 0,
            energy_threshold,
            spawn_capacity,
        };
        let uniform_buffer = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("uniforms"),
            contents: bytemuck::bytes_of(&uniforms),
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
        });

        let counter_staging = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("counter_staging"),
            size: COUNTER_BYTES,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        let record_staging = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("record_staging"),
            size: capacity as u64 * SLOT_BYTES,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        let shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("simulate"),
            source: wgpu::ShaderSource::Wgsl(include_str!("shaders/simulate.wgsl").into()),
        });

        let storage_rw = |binding| wgpu::BindGroupLayoutEntry {
            binding,
            visibility: wgpu::ShaderStages::COMPUTE,
            ty: wgpu::BindingType::Buffer {
                ty: wgpu::BufferBindingType::Storage { read_only: false },
                has_dynamic_offset: false,
                min_binding_size: None,
            },
            count: None,
        };
        let storage_ro = |binding| wgpu::BindGroupLayoutEntry {
            binding,
            visibility: wgpu::ShaderStages::COMPUTE,
            ty: wgpu::BindingType::Buffer {
                ty: wgpu::BufferBindingType::Storage { read_only: true },
                has_dynamic_offset: false,
                min_binding_size: None,
            },
            count: None,
        };
        let bind_group_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("simulate_layout"),
            entries: &[
                storage_rw(0),
                wgpu::BindGroupLayoutEntry {
                    binding: 1,
                    visibility: wgpu::ShaderStages::COMPUTE,
                    ty: wgpu::BindingType::Buffer {
                        ty: wgpu::BufferBindingType::Uniform,
                        has_dynamic_offset: false,
                        min_binding_size: None,
                    },
                    count: None,
                },
                storage_rw(2),
                storage_rw(3),
                storage_rw(4),
                storage_ro(5),
                storage_rw(6),
                storage_ro(7),
                storage_ro(8),
            ],
        });

        let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("simulate_pipeline_layout"),
            bind_group_layouts: &[&bind_group_layout],
            push_constant_ranges: &[],
        });
        let pipeline = |entry: &str| {
            device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                label: Some(entry),
                layout: Some(&pipeline_layout),
                module: &shader,
                entry_point: Some(entry),
                compilation_options: Default::default(),
                cache: None,
            })
        };
        let push_pipeline = pipeline("push_staged");
        let iterate_pipeline = pipeline("iterate");
        let settle_pipeline = pipeline("settle_spawned");
        let collect_pipeline = pipeline("collect_detected");

        let bind_group = Self::make_bind_group(
            &device,
            &bind_group_layout,
            &slot_buffer,
            &uniform_buffer,
            &list_buffer,
            &counter_buffer,
            &spawn_buffer,
            &input_buffer,
            &record_buffer,
            &triangle_buffer,
            &material_buffer,
        );

        Ok(Self {
            device,
            queue,
            capacity,
            spawn_capacity,
            energy_threshold,
            seed,
            iteration: 0,
            triangle_count: triangles.len() as u32,
            material_count: materials.len() as u32,
            slot_buffer,
            list_buffer,
            counter_buffer,
            spawn_buffer,
            input_buffer,
            record_buffer,
            triangle_buffer,
            material_buffer,
            uniform_buffer,
            counter_staging,
            record_staging,
            bind_group_layout,
            bind_group,
            push_pipeline,
            iterate_pipeline,
            settle_pipeline,
            collect_pipeline,
            staged: Vec::new(),
            batch_size: 1,
            input_capacity: 1,
            free_known: capacity,
            detected_known: 0,
            staged_records: 0,
            flushable: Vec::new(),
        })
    }

    #[allow(clippy::too_many_arguments)]
    fn make_bind_group(
        device: &wgpu::Device,
        layout: &wgpu::BindGroupLayout,
        slots: &wgpu::Buffer,
        uniforms: &wgpu::Buffer,
        lists: &wgpu::Buffer,
        counters: &wgpu::Buffer,
        spawned: &wgpu::Buffer,
        staged: &wgpu::Buffer,
        records: &wgpu::Buffer,
        triangles: &wgpu::Buffer,
        materials: &wgpu::Buffer,
    ) -> wgpu::BindGroup {
        fn entry(binding: u32, buffer: &wgpu::Buffer) -> wgpu::BindGroupEntry<'_> {
            wgpu::BindGroupEntry {
                binding,
                resource: buffer.as_entire_binding(),
            }
        }
        device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("simulate_bind_group"),
            layout,
            entries: &[
                entry(0, slots),
                entry(1, uniforms),
                entry(2, lists),
                entry(3, counters),
                entry(4, spawned),
                entry(5, staged),
                entry(6, records),
                entry(7, triangles),
                entry(8, materials),
            ],
        })
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Running count as of the last readback; loop control and telemetry.
    pub fn running(&self) -> u32 {
        self.capacity - self.free_known - self.detected_known
    }

    pub fn staged_len(&self) -> usize {
        self.staged.len()
    }

    /// Size the input staging region for a batch.
    pub fn allocate_input_buffers(&mut self, batch_size: usize) {
        self.batch_size = batch_size.max(1);
        self.ensure_input_capacity(self.batch_size);
    }

    fn ensure_input_capacity(&mut self, n: usize) {
        if n <= self.input_capacity {
            return;
        }
        self.input_buffer = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("staged_input"),
            size: n as u64 * SLOT_BYTES,
            usage: wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        self.input_capacity = n;
        self.bind_group = Self::make_bind_group(
            &self.device,
            &self.bind_group_layout,
            &self.slot_buffer,
            &self.uniform_buffer,
            &self.list_buffer,
            &self.counter_buffer,
            &self.spawn_buffer,
            &self.input_buffer,
            &self.record_buffer,
            &self.triangle_buffer,
            &self.material_buffer,
        );
    }

    fn write_uniforms(&self, push_count: u32) {
        let uniforms = Uniforms {
            capacity: self.capacity,
            triangle_count: self.triangle_count,
            material_count: self.material_count,
            push_count,
            seed: mix_seed(self.seed ^ self.iteration as u64) as u32,
            iteration: self.iteration,
            energy_threshold: self.energy_threshold,
            spawn_capacity: self.spawn_capacity,
        };
        self.queue
            .write_buffer(&self.uniform_buffer, 0, bytemuck::bytes_of(&uniforms));
    }

    fn dispatch(
        &self,
        label: &str,
        passes: &[(&wgpu::ComputePipeline, u32)],
    ) -> wgpu::CommandBuffer {
        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor { label: Some(label) });
        {
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some(label),
                timestamp_writes: None,
            });
            pass.set_bind_group(0, &self.bind_group, &[]);
            for (pipeline, n) in passes {
                pass.set_pipeline(pipeline);
                pass.dispatch_workgroups(workgroups(*n), 1, 1);
            }
        }
        encoder.finish()
    }

    /// Collect detected slots into the record buffer, free the slots, and
    /// start the asynchronous copy of the records to host-visible staging.
    pub fn buffer_detected(&mut self) {
        self.staged_records = self.detected_known;
        if self.staged_records == 0 {
            return;
        }
        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("buffer_detected"),
            });
        {
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some("collect"),
                timestamp_writes: None,
            });
            pass.set_bind_group(0, &self.bind_group, &[]);
            pass.set_pipeline(&self.collect_pipeline);
            pass.dispatch_workgroups(workgroups(self.staged_records), 1, 1);
        }
        encoder.copy_buffer_to_buffer(
            &self.record_buffer,
            0,
            &self.record_staging,
            0,
            self.staged_records as u64 * SLOT_BYTES,
        );
        self.queue.submit(Some(encoder.finish()));

        // Applied at the next submission: after the collect above has run,
        // before any kernel appends new detections.
        self.queue.write_buffer(
            &self.counter_buffer,
            COUNTER_DETECTED_OFFSET,
            bytemuck::bytes_of(&0u32),
        );
        self.free_known += self.detected_known;
        self.detected_known = 0;
    }

    /// Reserve work from the pool and stage it for a later push. The upload
    /// is asynchronous; the particles enter the simulation at the next
    /// `push_to_simulation`.
    pub fn push_to_buffer(&mut self, pool: &WorkPool) {
        let want = self.batch_size.saturating_sub(self.staged.len());
        if want > 0 {
            let (particles, tags) = pool.get_work(want);
            for (p, &tag) in particles.iter().zip(tags) {
                self.staged.push(DeviceParticle::stage(
                    p,
                    tag,
                    geometry::VACUUM,
                    slot_rng_state(self.seed, tag),
                ));
            }
        }
        if !self.staged.is_empty() {
            self.ensure_input_capacity(self.staged.len());
            self.queue
                .write_buffer(&self.input_buffer, 0, bytemuck::cast_slice(&self.staged));
        }
    }

    /// Complete a previously staged push by moving staged particles into
    /// empty slots. Bounded by the free count, so the capacity invariant
    /// holds even when a cascade filled the slab since staging; the leftover
    /// stays staged for the next frame.
    pub fn push_to_simulation(&mut self) {
        let pushed = (self.staged.len() as u32).min(self.free_known);
        if pushed == 0 {
            return;
        }
        self.write_uniforms(pushed);
        let cmd = self.dispatch("push", &[(&self.push_pipeline, pushed)]);
        self.queue.submit(Some(cmd));
        self.staged.drain(..pushed as usize);
        self.free_known -= pushed;
    }

    /// Wait for the device, then read back counters and the detected records
    /// staged by the last `buffer_detected`.
    pub fn sync(&mut self) -> Result<(), SimError> {
        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor { label: Some("sync") });
        encoder.copy_buffer_to_buffer(
            &self.counter_buffer,
            0,
            &self.counter_staging,
            0,
            COUNTER_BYTES,
        );
        self.queue.submit(Some(encoder.finish()));

        let raw = self.map_read(&self.counter_staging, COUNTER_BYTES)?;
        let counts: &[u32] = bytemuck::cast_slice(&raw);
        self.free_known = counts[0];
        self.detected_known = counts[1];

        if self.staged_records > 0 {
            let raw = self.map_read(
                &self.record_staging,
                self.staged_records as u64 * SLOT_BYTES,
            )?;
            self.flushable
                .extend_from_slice(bytemuck::cast_slice::<u8, DeviceParticle>(&raw));
            self.staged_records = 0;
        }
        Ok(())
    }

    /// Hand the records read back by the last `sync` to the callback.
    pub fn flush_buffered<F: FnMut(&Particle, u32)>(&mut self, mut callback: F) {
        for r in self.flushable.drain(..) {
            callback(&r.to_particle(), r.tag);
        }
    }

    fn map_read(&self, buffer: &wgpu::Buffer, size: u64) -> Result<Vec<u8>, SimError> {
        let slice = buffer.slice(..size);
        let (tx, rx) = std::sync::mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |r| {
            tx.send(r).unwrap();
        });
        self.device
            .poll(wgpu::PollType::Wait)
            .map_err(|e| SimError::Device(format!("device poll: {e}")))?;
        rx.recv()
            .unwrap()
            .map_err(|e| SimError::Device(format!("buffer map: {e}")))?;
        let data = slice.get_mapped_range().to_vec();
        buffer.unmap();
        Ok(data)
    }

    fn read_counters(&mut self) -> Result<(), SimError> {
        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("read_counters"),
            });
        encoder.copy_buffer_to_buffer(
            &self.counter_buffer,
            0,
            &self.counter_staging,
            0,
            COUNTER_BYTES,
        );
        self.queue.submit(Some(encoder.finish()));
        let raw = self.map_read(&self.counter_staging, COUNTER_BYTES)?;
        let counts: &[u32] = bytemuck::cast_slice(&raw);
        self.free_known = counts[0];
        self.detected_known = counts[1];
        Ok(())
    }
}

impl Driver for GpuDriver {
    fn push(&mut self, particles: &[Particle], tags: &[u32]) -> usize {
        debug_assert!(self.staged.is_empty(), "push during a staged pipeline");
        self.read_counters().expect("count readback");
        let n = (particles.len() as u32).min(self.free_known) as usize;
        if n == 0 {
            return 0;
        }
        let upload: Vec<DeviceParticle> = particles[..n]
            .iter()
            .zip(&tags[..n])
            .map(|(p, &tag)| {
                DeviceParticle::stage(p, tag, geometry::VACUUM, slot_rng_state(self.seed, tag))
            })
            .collect();
        self.ensure_input_capacity(n);
        self.queue
            .write_buffer(&self.input_buffer, 0, bytemuck::cast_slice(&upload));
        self.write_uniforms(n as u32);
        let cmd = self.dispatch("push", &[(&self.push_pipeline, n as u32)]);
        self.queue.submit(Some(cmd));
        self.free_known -= n as u32;
        n
    }

    fn do_iteration(&mut self) {
        self.iteration += 1;
        self.queue.write_buffer(
            &self.counter_buffer,
            COUNTER_SPAWNED_OFFSET,
            bytemuck::bytes_of(&0u32),
        );
        self.write_uniforms(0);
        let cmd = self.dispatch(
            "iterate",
            &[
                (&self.iterate_pipeline, self.capacity),
                (&self.settle_pipeline, self.spawn_capacity),
            ],
        );
        self.queue.submit(Some(cmd));
    }

    fn running_count(&mut self) -> u32 {
        self.read_counters().expect("count readback");
        self.running()
    }

    fn detected_count(&mut self) -> u32 {
        self.read_counters().expect("count readback");
        self.detected_known
    }

    fn flush_detected<F: FnMut(&Particle, u32)>(&mut self, callback: F) -> u32 {
        self.read_counters().expect("count readback");
        self.buffer_detected();
        self.sync().expect("detected readback");
        self.flush_buffered(callback);
        self.running()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mix_seed_is_deterministic_and_spreads() {
        assert_eq!(mix_seed(1), mix_seed(1));
        assert_ne!(mix_seed(1), mix_seed(2));
        let a = mix_seed(0);
        let b = mix_seed(1);
        assert!((a ^ b).count_ones() > 8);
    }

    #[test]
    fn slot_rng_state_is_never_zero() {
        for tag in 0..1000 {
            assert_ne!(slot_rng_state(0, tag), 0);
        }
    }

    #[test]
    fn uniforms_match_shader_layout() {
        assert_eq!(std::mem::size_of::<Uniforms>(), 32);
    }

    #[test]
    fn workgroup_rounding() {
        assert_eq!(workgroups(0), 0);
        assert_eq!(workgroups(1), 1);
        assert_eq!(workgroups(64), 1);
        assert_eq!(workgroups(65), 2);
    }
}
