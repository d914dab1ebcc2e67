use super::SamplePosition;

/// Tiles on a uniform lattice with spacing `increment`, fully inside the image.
pub(crate) fn grid_positions(
    width: usize,
    height: usize,
    tile_size: usize,
    increment: usize,
) -> Vec<SamplePosition> {
    if tile_size == 0 || tile_size > width || tile_size > height {
        return Vec::new();
    }
    let increment = increment.max(1);

    let mut positions = Vec::new();
    for y in (0..=height - tile_size).step_by(increment) {
        for x in (0..=width - tile_size).step_by(increment) {
            positions.push(SamplePosition { x, y, tile_size });
        }
    }
    positions
}
