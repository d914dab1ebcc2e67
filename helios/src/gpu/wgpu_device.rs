//! wgpu compute backend.

use std::collections::HashMap;
use std::sync::mpsc;

use bytemuck::{Pod, Zeroable};
use tracing::debug;
use wgpu::util::DeviceExt;

use super::{BufferId, ComputeDevice, DeviceCapabilities, DeviceError};
use crate::config::WarpInterpolation;
use crate::correlation::{TileShift, hann, shift_from_surface};
use crate::sampling::SamplePosition;

/// Must match `Params` in ncc.wgsl (32 bytes).
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct NccParams {
    width: u32,
    height: u32,
    tile_size: u32,
    tile_count: u32,
    surface_size: u32,
    _padding: [u32; 3],
}

/// Must match `Params` in warp.wgsl (16 bytes).
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct WarpParams {
    width: u32,
    height: u32,
    mode: u32,
    _padding: u32,
}

fn storage_entry(binding: u32, read_only: bool) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::COMPUTE,
        ty: wgpu::BindingType::Buffer {
            ty: wgpu::BufferBindingType::Storage { read_only },
            has_dynamic_offset: false,
            min_binding_size: None,
        },
        count: None,
    }
}

fn uniform_entry(binding: u32) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::COMPUTE,
        ty: wgpu::BindingType::Buffer {
            ty: wgpu::BufferBindingType::Uniform,
            has_dynamic_offset: false,
            min_binding_size: None,
        },
        count: None,
    }
}

fn compute_pipeline(
    device: &wgpu::Device,
    label: &str,
    module: &wgpu::ShaderModule,
    layout: &wgpu::BindGroupLayout,
    entry_point: &str,
) -> wgpu::ComputePipeline {
    let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
        label: Some(label),
        bind_group_layouts: &[layout],
        ..Default::default()
    });
    device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
        label: Some(label),
        layout: Some(&pipeline_layout),
        module,
        entry_point: Some(entry_point),
        compilation_options: Default::default(),
        cache: None,
    })
}

#[derive(Debug)]
struct NccPipeline {
    prepare: wgpu::ComputePipeline,
    correlate: wgpu::ComputePipeline,
    layout: wgpu::BindGroupLayout,
}

impl NccPipeline {
    fn new(device: &wgpu::Device) -> Self {
        let module = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("ncc_shader"),
            source: wgpu::ShaderSource::Wgsl(include_str!("shaders/ncc.wgsl").into()),
        });
        let layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("ncc_bind_group_layout"),
            entries: &[
                uniform_entry(0),
                storage_entry(1, true),
                storage_entry(2, true),
                storage_entry(3, true),
                storage_entry(4, true),
                storage_entry(5, false),
                storage_entry(6, false),
                storage_entry(7, false),
            ],
        });
        Self {
            prepare: compute_pipeline(device, "ncc_prepare", &module, &layout, "prepare"),
            correlate: compute_pipeline(device, "ncc_correlate", &module, &layout, "correlate"),
            layout,
        }
    }
}

#[derive(Debug)]
struct WarpPipeline {
    pipeline: wgpu::ComputePipeline,
    layout: wgpu::BindGroupLayout,
}

impl WarpPipeline {
    fn new(device: &wgpu::Device) -> Self {
        let module = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("warp_shader"),
            source: wgpu::ShaderSource::Wgsl(include_str!("shaders/warp.wgsl").into()),
        });
        let layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("warp_bind_group_layout"),
            entries: &[
                uniform_entry(0),
                storage_entry(1, true),
                storage_entry(2, true),
                storage_entry(3, false),
            ],
        });
        Self {
            pipeline: compute_pipeline(device, "warp", &module, &layout, "main"),
            layout,
        }
    }
}

#[derive(Debug)]
struct DeviceBuffer {
    buffer: wgpu::Buffer,
    len: usize,
}

/// [`ComputeDevice`] on a wgpu adapter.
///
/// wgpu does not report total device memory, so the capacity used for
/// budgets is the configured one.
#[derive(Debug)]
pub struct WgpuDevice {
    capabilities: DeviceCapabilities,
    device: wgpu::Device,
    queue: wgpu::Queue,
    ncc: NccPipeline,
    warp: WarpPipeline,
    buffers: HashMap<u64, DeviceBuffer>,
    windows: HashMap<usize, wgpu::Buffer>,
    next_id: u64,
}

impl WgpuDevice {
    pub fn new(device_memory: u64) -> Result<Self, DeviceError> {
        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor {
            backends: wgpu::Backends::all(),
            ..Default::default()
        });

        let adapter = pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions {
            power_preference: wgpu::PowerPreference::HighPerformance,
            compatible_surface: None,
            force_fallback_adapter: false,
        }))
        .map_err(|e| DeviceError::NoAdapter(e.to_string()))?;

        let (device, queue) =
            pollster::block_on(adapter.request_device(&wgpu::DeviceDescriptor::default()))
                .map_err(|e| DeviceError::Backend(format!("failed to create device: {e}")))?;

        let limits = device.limits();
        let max_allocation = (limits.max_storage_buffer_binding_size as u64).min(limits.max_buffer_size);
        let capabilities = DeviceCapabilities {
            name: adapter.get_info().name,
            global_memory: device_memory,
            max_allocation,
        };
        debug!(device = %capabilities.name, max_allocation, "wgpu device created");

        Ok(Self {
            capabilities,
            ncc: NccPipeline::new(&device),
            warp: WarpPipeline::new(&device),
            device,
            queue,
            buffers: HashMap::new(),
            windows: HashMap::new(),
            next_id: 1,
        })
    }

    fn buffer(&self, buffer: BufferId) -> Result<&DeviceBuffer, DeviceError> {
        self.buffers
            .get(&buffer.0)
            .ok_or(DeviceError::InvalidBuffer(buffer))
    }

    fn storage_buffer(&self, label: &str, bytes: u64) -> Result<wgpu::Buffer, DeviceError> {
        if bytes > self.capabilities.max_allocation {
            return Err(DeviceError::OutOfMemory {
                requested: bytes,
                available: self.capabilities.max_allocation,
            });
        }
        Ok(self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some(label),
            size: bytes.max(4),
            usage: wgpu::BufferUsages::STORAGE
                | wgpu::BufferUsages::COPY_SRC
                | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        }))
    }

    fn window(&mut self, tile_size: usize) -> &wgpu::Buffer {
        let device = &self.device;
        self.windows.entry(tile_size).or_insert_with(|| {
            device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some("ncc_window"),
                contents: bytemuck::cast_slice(&hann(tile_size)),
                usage: wgpu::BufferUsages::STORAGE,
            })
        })
    }

    /// Submit `encoder`, copy `source` to a staging buffer and read it back.
    /// Validation and out-of-memory errors of the submission are returned.
    fn submit_and_read(
        &self,
        mut encoder: wgpu::CommandEncoder,
        source: &wgpu::Buffer,
        bytes: u64,
    ) -> Result<Vec<f32>, DeviceError> {
        let staging = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("staging_buffer"),
            size: bytes.max(4),
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        encoder.copy_buffer_to_buffer(source, 0, &staging, 0, bytes);
        self.queue.submit(std::iter::once(encoder.finish()));

        let slice = staging.slice(..bytes);
        let (sender, receiver) = mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = sender.send(result);
        });
        self.device
            .poll(wgpu::PollType::Wait)
            .map_err(|e| DeviceError::Backend(e.to_string()))?;
        receiver
            .recv()
            .map_err(|e| DeviceError::Backend(e.to_string()))?
            .map_err(|e| DeviceError::Backend(e.to_string()))?;

        let data = slice.get_mapped_range();
        let result: Vec<f32> = bytemuck::cast_slice(&data).to_vec();
        drop(data);
        staging.unmap();
        Ok(result)
    }

    fn scoped<R>(
        &self,
        work: impl FnOnce() -> Result<R, DeviceError>,
    ) -> Result<R, DeviceError> {
        self.device.push_error_scope(wgpu::ErrorFilter::OutOfMemory);
        self.device.push_error_scope(wgpu::ErrorFilter::Validation);
        let result = work();
        let validation = pollster::block_on(self.device.pop_error_scope());
        let memory = pollster::block_on(self.device.pop_error_scope());
        if let Some(error) = validation.or(memory) {
            return Err(DeviceError::Backend(error.to_string()));
        }
        result
    }
}

impl ComputeDevice for WgpuDevice {
    fn capabilities(&self) -> &DeviceCapabilities {
        &self.capabilities
    }

    fn supports_tile_size(&self, tile_size: usize) -> bool {
        // Tile pairs for a full dispatch must fit one storage binding.
        let tile_bytes = 2 * (tile_size * tile_size * size_of::<f32>()) as u64;
        (16..=256).contains(&tile_size)
            && tile_size.is_power_of_two()
            && tile_bytes <= self.capabilities.max_allocation
    }

    fn allocate(&mut self, len: usize) -> Result<BufferId, DeviceError> {
        let bytes = (len * size_of::<f32>()) as u64;
        let buffer = self.scoped(|| self.storage_buffer("resident_image", bytes))?;
        let id = self.next_id;
        self.next_id += 1;
        self.buffers.insert(id, DeviceBuffer { buffer, len });
        Ok(BufferId(id))
    }

    fn write(&mut self, buffer: BufferId, data: &[f32]) -> Result<(), DeviceError> {
        let target = self.buffer(buffer)?;
        if target.len != data.len() {
            return Err(DeviceError::LengthMismatch {
                expected: target.len,
                actual: data.len(),
            });
        }
        self.queue
            .write_buffer(&target.buffer, 0, bytemuck::cast_slice(data));
        Ok(())
    }

    fn read(&mut self, buffer: BufferId) -> Result<Vec<f32>, DeviceError> {
        let source = self.buffer(buffer)?;
        let encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("read_encoder"),
            });
        let bytes = (source.len * size_of::<f32>()) as u64;
        self.submit_and_read(encoder, &source.buffer, bytes)
    }

    fn release(&mut self, buffer: BufferId) {
        if let Some(entry) = self.buffers.remove(&buffer.0) {
            entry.buffer.destroy();
        }
    }

    fn correlate_tiles(
        &mut self,
        reference: BufferId,
        target: BufferId,
        width: usize,
        height: usize,
        tile_size: usize,
        positions: &[SamplePosition],
    ) -> Result<Vec<TileShift>, DeviceError> {
        if !self.supports_tile_size(tile_size) {
            return Err(DeviceError::UnsupportedTileSize(tile_size));
        }
        if positions.is_empty() {
            return Ok(Vec::new());
        }
        self.window(tile_size);

        let tile_count = positions.len();
        let area = tile_size * tile_size;
        let surface_size = tile_size / 2;
        let surface_area = surface_size * surface_size;

        let coords: Vec<u32> = positions
            .iter()
            .flat_map(|p| [p.x as u32, p.y as u32])
            .collect();
        let params = NccParams {
            width: width as u32,
            height: height as u32,
            tile_size: tile_size as u32,
            tile_count: tile_count as u32,
            surface_size: surface_size as u32,
            _padding: [0; 3],
        };

        let surface_values = self.scoped(|| {
            let reference = &self.buffer(reference)?.buffer;
            let target = &self.buffer(target)?.buffer;
            let window = self
                .windows
                .get(&tile_size)
                .ok_or(DeviceError::UnsupportedTileSize(tile_size))?;

            let params_buffer = self
                .device
                .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                    label: Some("ncc_params"),
                    contents: bytemuck::bytes_of(&params),
                    usage: wgpu::BufferUsages::UNIFORM,
                });
            let positions_buffer = self
                .device
                .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                    label: Some("ncc_positions"),
                    contents: bytemuck::cast_slice(&coords),
                    usage: wgpu::BufferUsages::STORAGE,
                });
            let tiles = self.storage_buffer("ncc_tiles", (2 * tile_count * area * 4) as u64)?;
            let norms = self.storage_buffer("ncc_norms", (tile_count * 4) as u64)?;
            let surface_bytes = (tile_count * surface_area * 4) as u64;
            let surface = self.storage_buffer("ncc_surface", surface_bytes)?;

            let bind_group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
                label: Some("ncc_bind_group"),
                layout: &self.ncc.layout,
                entries: &[
                    wgpu::BindGroupEntry {
                        binding: 0,
                        resource: params_buffer.as_entire_binding(),
                    },
                    wgpu::BindGroupEntry {
                        binding: 1,
                        resource: positions_buffer.as_entire_binding(),
                    },
                    wgpu::BindGroupEntry {
                        binding: 2,
                        resource: reference.as_entire_binding(),
                    },
                    wgpu::BindGroupEntry {
                        binding: 3,
                        resource: target.as_entire_binding(),
                    },
                    wgpu::BindGroupEntry {
                        binding: 4,
                        resource: window.as_entire_binding(),
                    },
                    wgpu::BindGroupEntry {
                        binding: 5,
                        resource: tiles.as_entire_binding(),
                    },
                    wgpu::BindGroupEntry {
                        binding: 6,
                        resource: norms.as_entire_binding(),
                    },
                    wgpu::BindGroupEntry {
                        binding: 7,
                        resource: surface.as_entire_binding(),
                    },
                ],
            });

            let mut encoder = self
                .device
                .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                    label: Some("ncc_encoder"),
                });
            {
                let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                    label: Some("ncc_pass"),
                    timestamp_writes: None,
                });
                pass.set_bind_group(0, &bind_group, &[]);
                pass.set_pipeline(&self.ncc.prepare);
                pass.dispatch_workgroups(tile_count.div_ceil(64) as u32, 1, 1);
                pass.set_pipeline(&self.ncc.correlate);
                pass.dispatch_workgroups(surface_area.div_ceil(64) as u32, tile_count as u32, 1);
            }

            // Norms and surfaces come back in one readback: copy the norms
            // behind the surfaces in a combined buffer.
            let combined_bytes = surface_bytes + (tile_count * 4) as u64;
            let combined = self.storage_buffer("ncc_readback", combined_bytes)?;
            encoder.copy_buffer_to_buffer(&surface, 0, &combined, 0, surface_bytes);
            encoder.copy_buffer_to_buffer(&norms, 0, &combined, surface_bytes, (tile_count * 4) as u64);
            self.submit_and_read(encoder, &combined, combined_bytes)
        })?;

        let (surfaces, norms) = surface_values.split_at(tile_count * surface_area);
        Ok(surfaces
            .chunks_exact(surface_area)
            .zip(norms)
            .map(|(surface, &norm)| shift_from_surface(surface, surface_size, norm as f64))
            .collect())
    }

    fn warp(
        &mut self,
        buffer: BufferId,
        width: usize,
        height: usize,
        field: &[f32],
        interpolation: WarpInterpolation,
    ) -> Result<Vec<f32>, DeviceError> {
        let pixels = width * height;
        if field.len() != 2 * pixels {
            return Err(DeviceError::LengthMismatch {
                expected: 2 * pixels,
                actual: field.len(),
            });
        }
        let image = self.buffer(buffer)?;
        if image.len != pixels {
            return Err(DeviceError::LengthMismatch {
                expected: pixels,
                actual: image.len,
            });
        }

        let params = WarpParams {
            width: width as u32,
            height: height as u32,
            mode: match interpolation {
                WarpInterpolation::Bilinear => 0,
                WarpInterpolation::Lanczos3 => 1,
            },
            _padding: 0,
        };

        self.scoped(|| {
            let bytes = (pixels * 4) as u64;
            let source = self.storage_buffer("warp_source", bytes)?;
            let field_buffer = self
                .device
                .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                    label: Some("warp_field"),
                    contents: bytemuck::cast_slice(field),
                    usage: wgpu::BufferUsages::STORAGE,
                });
            let params_buffer = self
                .device
                .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                    label: Some("warp_params"),
                    contents: bytemuck::bytes_of(&params),
                    usage: wgpu::BufferUsages::UNIFORM,
                });

            let bind_group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
                label: Some("warp_bind_group"),
                layout: &self.warp.layout,
                entries: &[
                    wgpu::BindGroupEntry {
                        binding: 0,
                        resource: params_buffer.as_entire_binding(),
                    },
                    wgpu::BindGroupEntry {
                        binding: 1,
                        resource: source.as_entire_binding(),
                    },
                    wgpu::BindGroupEntry {
                        binding: 2,
                        resource: field_buffer.as_entire_binding(),
                    },
                    wgpu::BindGroupEntry {
                        binding: 3,
                        resource: image.buffer.as_entire_binding(),
                    },
                ],
            });

            let mut encoder = self
                .device
                .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                    label: Some("warp_encoder"),
                });
            encoder.copy_buffer_to_buffer(&image.buffer, 0, &source, 0, bytes);
            {
                let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                    label: Some("warp_pass"),
                    timestamp_writes: None,
                });
                pass.set_pipeline(&self.warp.pipeline);
                pass.set_bind_group(0, &bind_group, &[]);
                pass.dispatch_workgroups(width.div_ceil(16) as u32, height.div_ceil(16) as u32, 1);
            }
            self.submit_and_read(encoder, &image.buffer, bytes)
        })
    }
}
