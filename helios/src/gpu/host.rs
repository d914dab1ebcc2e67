//! Software compute device.

use std::collections::HashMap;

use super::{BufferId, ComputeDevice, DeviceCapabilities, DeviceError};
use crate::config::{CorrelationConfig, WarpInterpolation};
use crate::correlation::{TileCorrelator, TileShift};
use crate::sampler::extract_tiles;
use crate::sampling::SamplePosition;
use crate::warp::warp_plane;

/// A [`ComputeDevice`] that keeps buffers in host memory and runs the CPU
/// kernels. Results match the CPU path exactly.
///
/// Enforces its nominal memory capacity, so budget and fallback logic
/// behave as on real hardware.
#[derive(Debug)]
pub struct HostDevice {
    capabilities: DeviceCapabilities,
    buffers: HashMap<u64, Vec<f32>>,
    next_id: u64,
    used: u64,
    correlator: TileCorrelator,
}

impl HostDevice {
    pub fn new(global_memory: u64) -> Self {
        Self {
            capabilities: DeviceCapabilities {
                name: "host".to_string(),
                global_memory,
                max_allocation: global_memory / 4,
            },
            buffers: HashMap::new(),
            next_id: 1,
            used: 0,
            correlator: TileCorrelator::new(CorrelationConfig::default()),
        }
    }

    /// Bytes currently allocated.
    pub fn used_memory(&self) -> u64 {
        self.used
    }

    pub fn buffer_count(&self) -> usize {
        self.buffers.len()
    }

    fn buffer(&self, buffer: BufferId) -> Result<&Vec<f32>, DeviceError> {
        self.buffers
            .get(&buffer.0)
            .ok_or(DeviceError::InvalidBuffer(buffer))
    }
}

impl ComputeDevice for HostDevice {
    fn capabilities(&self) -> &DeviceCapabilities {
        &self.capabilities
    }

    fn supports_tile_size(&self, tile_size: usize) -> bool {
        tile_size >= 16 && tile_size.is_power_of_two()
    }

    fn allocate(&mut self, len: usize) -> Result<BufferId, DeviceError> {
        let bytes = (len * size_of::<f32>()) as u64;
        let available = self.capabilities.global_memory.saturating_sub(self.used);
        if bytes > available || bytes > self.capabilities.max_allocation {
            return Err(DeviceError::OutOfMemory {
                requested: bytes,
                available: available.min(self.capabilities.max_allocation),
            });
        }
        let id = self.next_id;
        self.next_id += 1;
        self.used += bytes;
        self.buffers.insert(id, vec![0.0; len]);
        Ok(BufferId(id))
    }

    fn write(&mut self, buffer: BufferId, data: &[f32]) -> Result<(), DeviceError> {
        let target = self
            .buffers
            .get_mut(&buffer.0)
            .ok_or(DeviceError::InvalidBuffer(buffer))?;
        if target.len() != data.len() {
            return Err(DeviceError::LengthMismatch {
                expected: target.len(),
                actual: data.len(),
            });
        }
        target.copy_from_slice(data);
        Ok(())
    }

    fn read(&mut self, buffer: BufferId) -> Result<Vec<f32>, DeviceError> {
        self.buffer(buffer).cloned()
    }

    fn release(&mut self, buffer: BufferId) {
        if let Some(data) = self.buffers.remove(&buffer.0) {
            self.used -= (data.len() * size_of::<f32>()) as u64;
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
        let reference = self.buffer(reference)?;
        let target = self.buffer(target)?;
        for data in [reference, target] {
            if data.len() != width * height {
                return Err(DeviceError::LengthMismatch {
                    expected: width * height,
                    actual: data.len(),
                });
            }
        }

        let references = extract_tiles(reference, width, positions, tile_size);
        let targets = extract_tiles(target, width, positions, tile_size);
        Ok(self.correlator.ncc_batch(&references, &targets, tile_size))
    }

    fn warp(
        &mut self,
        buffer: BufferId,
        width: usize,
        height: usize,
        field: &[f32],
        interpolation: WarpInterpolation,
    ) -> Result<Vec<f32>, DeviceError> {
        let data = self
            .buffers
            .get_mut(&buffer.0)
            .ok_or(DeviceError::InvalidBuffer(buffer))?;
        if data.len() != width * height || field.len() != 2 * width * height {
            return Err(DeviceError::LengthMismatch {
                expected: width * height,
                actual: data.len(),
            });
        }
        let warped = warp_plane(data, width, height, field, interpolation);
        data.copy_from_slice(&warped);
        Ok(warped)
    }
}
