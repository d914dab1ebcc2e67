//! Accelerator access.
//!
//! A [`ComputeDevice`] owns device buffers and runs the two kernels the
//! engine needs: batched NCC over resident images and dense-field warping.
//! [`GpuContext`] serializes every device operation behind one lock; the
//! lock is held by a [`GpuSession`] for one unit of work.
//!
//! Device failures never reach callers of the engine. Call sites log a
//! warning and redo the work on the CPU.
//!
//! ## Components
//!
//! - [`HostDevice`]: software device running the CPU kernels. Always available.
//! - `WgpuDevice`: wgpu compute backend (feature `wgpu`).
//! - [`GpuImageCache`]: resident image buffers keyed by image index.
//! - [`GpuMemoryBudget`]: how many images fit next to the kernel workspace.

mod budget;
mod cache;
mod host;
#[cfg(feature = "wgpu")]
mod wgpu_device;


use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};
use thiserror::Error;
use tracing::debug;

use crate::config::{GpuConfig, WarpInterpolation};
use crate::correlation::TileShift;
use crate::sampling::SamplePosition;

pub use budget::{BYTES_PER_TILE_PIXEL, GpuMemoryBudget};
pub use cache::GpuImageCache;
pub use host::HostDevice;
#[cfg(feature = "wgpu")]
pub use wgpu_device::WgpuDevice;

/// Largest number of tiles dispatched in one kernel call.
pub const MAX_BATCH_TILES: usize = 65_535;

/// Accelerator failure. Converted into a CPU fallback by every caller.
#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("No compatible adapter: {0}")]
    NoAdapter(String),

    #[error("Out of device memory: requested {requested} bytes, {available} available")]
    OutOfMemory { requested: u64, available: u64 },

    #[error("Tile size {0} is not supported by the device")]
    UnsupportedTileSize(usize),

    #[error("Unknown device buffer {0:?}")]
    InvalidBuffer(BufferId),

    #[error("Buffer length mismatch: expected {expected} values, got {actual}")]
    LengthMismatch { expected: usize, actual: usize },

    #[error("Device error: {0}")]
    Backend(String),
}

/// Handle to a device buffer of `f32` values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufferId(pub(crate) u64);

/// Fixed device properties. Budgets are derived from these, never from the
/// momentary free memory, so the same inputs always split into the same
/// batches.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceCapabilities {
    pub name: String,
    /// Global memory in bytes.
    pub global_memory: u64,
    /// Largest single allocation in bytes.
    pub max_allocation: u64,
}

/// An accelerator.
///
/// Buffers hold row-major `f32` images. Implementations need not be
/// thread-safe beyond `Send`; [`GpuContext`] serializes access.
pub trait ComputeDevice: Send + fmt::Debug {
    fn capabilities(&self) -> &DeviceCapabilities;

    fn supports_tile_size(&self, tile_size: usize) -> bool;

    /// Allocate a zeroed buffer of `len` values.
    fn allocate(&mut self, len: usize) -> Result<BufferId, DeviceError>;

    fn write(&mut self, buffer: BufferId, data: &[f32]) -> Result<(), DeviceError>;

    fn read(&mut self, buffer: BufferId) -> Result<Vec<f32>, DeviceError>;

    fn release(&mut self, buffer: BufferId);

    /// NCC of `tile_size` tiles at `positions` between two resident images.
    /// Shifts follow the CPU correlator's convention.
    fn correlate_tiles(
        &mut self,
        reference: BufferId,
        target: BufferId,
        width: usize,
        height: usize,
        tile_size: usize,
        positions: &[SamplePosition],
    ) -> Result<Vec<TileShift>, DeviceError>;

    /// Warp a resident image in place by an interleaved `dx, dy` field and
    /// return the warped pixels.
    fn warp(
        &mut self,
        buffer: BufferId,
        width: usize,
        height: usize,
        field: &[f32],
        interpolation: WarpInterpolation,
    ) -> Result<Vec<f32>, DeviceError>;
}

/// Shared accelerator handle.
pub struct GpuContext {
    config: GpuConfig,
    capabilities: DeviceCapabilities,
    device: Mutex<Box<dyn ComputeDevice>>,
}

impl fmt::Debug for GpuContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GpuContext")
            .field("device", &self.capabilities.name)
            .field("global_memory", &self.capabilities.global_memory)
            .finish()
    }
}

impl GpuContext {
    pub fn new(device: impl ComputeDevice + 'static, config: GpuConfig) -> Arc<Self> {
        let capabilities = device.capabilities().clone();
        debug!(
            device = %capabilities.name,
            global_memory = capabilities.global_memory,
            "Accelerator ready"
        );
        Arc::new(Self {
            config,
            capabilities,
            device: Mutex::new(Box::new(device)),
        })
    }

    /// Context over the software device.
    pub fn host(config: GpuConfig) -> Arc<Self> {
        let device = HostDevice::new(config.device_memory);
        Self::new(device, config)
    }

    /// Context over the first wgpu adapter.
    #[cfg(feature = "wgpu")]
    pub fn wgpu(config: GpuConfig) -> Result<Arc<Self>, DeviceError> {
        let device = WgpuDevice::new(config.device_memory)?;
        Ok(Self::new(device, config))
    }

    pub fn config(&self) -> &GpuConfig {
        &self.config
    }

    pub fn capabilities(&self) -> &DeviceCapabilities {
        &self.capabilities
    }

    /// Acquire the device for one unit of work.
    pub fn session(&self) -> GpuSession<'_> {
        GpuSession {
            context: self,
            device: self.device.lock(),
        }
    }

    /// Run `work` while holding the device lock.
    pub fn execute_with_lock<R>(&self, work: impl FnOnce(&mut GpuSession<'_>) -> R) -> R {
        let mut session = self.session();
        work(&mut session)
    }

    pub(crate) fn try_session(&self) -> Option<GpuSession<'_>> {
        self.device.try_lock().map(|device| GpuSession {
            context: self,
            device,
        })
    }

    /// Tiles per kernel dispatch. Depends only on fixed capacities.
    pub fn batch_size(&self, tile_size: usize) -> usize {
        let caps = &self.capabilities;
        let usable = caps.max_allocation.min(caps.global_memory / 2);
        let per_tile = (tile_size * tile_size) as u64 * BYTES_PER_TILE_PIXEL;
        ((usable / per_tile.max(1)) as usize).clamp(1, MAX_BATCH_TILES)
    }

    /// Memory budget for resident `width × height` images.
    pub fn memory_budget(&self, width: usize, height: usize, tile_size: usize) -> GpuMemoryBudget {
        GpuMemoryBudget::new(
            self.capabilities.global_memory,
            width,
            height,
            tile_size,
            self.config.budget_tiles,
        )
    }

    /// Whether a group of `tiles` tiles of `tile_size` goes to the device.
    pub fn accepts_group(&self, tile_size: usize, tiles: usize) -> bool {
        tiles >= self.config.min_tiles_for_gpu && self.config.supported_tile_sizes.contains(&tile_size)
    }
}

/// Exclusive access to the device. Releases the lock on drop.
pub struct GpuSession<'a> {
    context: &'a GpuContext,
    device: MutexGuard<'a, Box<dyn ComputeDevice>>,
}

impl GpuSession<'_> {
    pub fn context(&self) -> &GpuContext {
        self.context
    }

    /// Group filter combining configuration and device support.
    pub fn accepts_group(&self, tile_size: usize, tiles: usize) -> bool {
        self.context.accepts_group(tile_size, tiles) && self.device.supports_tile_size(tile_size)
    }

    /// Correlate `positions` in device batches.
    pub fn correlate_batched(
        &mut self,
        reference: BufferId,
        target: BufferId,
        width: usize,
        height: usize,
        tile_size: usize,
        positions: &[SamplePosition],
    ) -> Result<Vec<TileShift>, DeviceError> {
        let batch = self.context.batch_size(tile_size);
        debug!(
            tile_size,
            tiles = positions.len(),
            batch,
            "Device tile correlation"
        );
        let mut shifts = Vec::with_capacity(positions.len());
        for chunk in positions.chunks(batch) {
            shifts.extend(self.device.correlate_tiles(
                reference, target, width, height, tile_size, chunk,
            )?);
        }
        Ok(shifts)
    }
}

impl Deref for GpuSession<'_> {
    type Target = dyn ComputeDevice;

    fn deref(&self) -> &Self::Target {
        self.device.as_ref()
    }
}

impl DerefMut for GpuSession<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.device.as_mut()
    }
}
