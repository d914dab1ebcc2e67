//! Device memory budget for resident images.

use tracing::debug;

/// Kernel workspace bytes per tile pixel: input tiles, windowed copies and
/// the correlation surface, with headroom for intermediates.
pub const BYTES_PER_TILE_PIXEL: u64 = 36;

/// Fraction of device memory always kept for kernels.
const MIN_KERNEL_FRACTION: f64 = 0.3;

/// Share of the remaining memory given to resident images.
const IMAGE_FRACTION: f64 = 0.5;

/// How device memory is split between kernel workspace and resident images.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GpuMemoryBudget {
    pub total: u64,
    pub kernel_reserve: u64,
    pub image_memory: u64,
    pub image_bytes: u64,
    pub max_resident_images: usize,
}

impl GpuMemoryBudget {
    pub fn new(total: u64, width: usize, height: usize, tile_size: usize, tiles: usize) -> Self {
        let tile_bytes = tiles as u64 * (tile_size * tile_size) as u64 * BYTES_PER_TILE_PIXEL;
        let kernel_reserve = tile_bytes.max((total as f64 * MIN_KERNEL_FRACTION) as u64);
        let image_memory = (total.saturating_sub(kernel_reserve) as f64 * IMAGE_FRACTION) as u64;
        let image_bytes = (width * height * size_of::<f32>()) as u64;
        let max_resident_images = if image_bytes == 0 {
            0
        } else {
            (image_memory / image_bytes) as usize
        };

        debug!(
            total,
            kernel_reserve, image_memory, max_resident_images, "Device memory budget"
        );

        Self {
            total,
            kernel_reserve,
            image_memory,
            image_bytes,
            max_resident_images,
        }
    }

    /// Whether `count` images can all stay resident.
    pub fn fits(&self, count: usize) -> bool {
        count <= self.max_resident_images
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const GIB: u64 = 1 << 30;

    #[test]
    fn test_reserve_is_at_least_thirty_percent() {
        // 10000 tiles of 32² at 36 bytes is ~368 MB, above 30% of 1 GiB.
        let budget = GpuMemoryBudget::new(GIB, 1024, 1024, 32, 10_000);
        assert_eq!(budget.kernel_reserve, 10_000 * 1024 * 36);

        let small = GpuMemoryBudget::new(GIB, 1024, 1024, 32, 10);
        assert_eq!(small.kernel_reserve, (GIB as f64 * 0.3) as u64);
    }

    #[test]
    fn test_resident_image_count() {
        let budget = GpuMemoryBudget::new(GIB, 1024, 1024, 32, 10);
        // (1 GiB - 0.3 GiB) / 2 = 0.35 GiB; one image is 4 MiB.
        let expected = ((GIB - (GIB as f64 * 0.3) as u64) / 2) / (4 << 20);
        assert_eq!(budget.max_resident_images, expected as usize);
        assert!(budget.fits(expected as usize));
        assert!(!budget.fits(expected as usize + 1));
    }

    #[test]
    fn test_reserve_larger_than_memory_leaves_nothing() {
        let budget = GpuMemoryBudget::new(1 << 20, 64, 64, 128, 10_000);
        assert_eq!(budget.image_memory, 0);
        assert_eq!(budget.max_resident_images, 0);
        assert!(!budget.fits(2));
    }
}
