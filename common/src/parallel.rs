//! Batched parallel helpers on the rayon pool.
//!
//! Work items are split into fixed-size batches up front so that the
//! partitioning depends only on the input length and batch size, never on the
//! number of worker threads.

use rayon::prelude::*;

/// Runs `f` on every batch of `batch_size` items in parallel.
///
/// `f` receives the batch index and the batch slice. Results are returned in
/// batch order.
///
/// # Panics
///
/// Panics if `batch_size` is 0.
pub fn par_for_batches<T, R, F>(items: &[T], batch_size: usize, f: F) -> Vec<R>
where
    T: Sync,
    R: Send,
    F: Fn(usize, &[T]) -> R + Sync,
{
    assert!(batch_size > 0, "batch_size must be > 0");

    items
        .par_chunks(batch_size)
        .enumerate()
        .map(|(index, batch)| f(index, batch))
        .collect()
}

/// Parallel map followed by an associative reduction.
///
/// Returns `identity()` for empty input.
pub fn par_map_reduce<T, R, M, Id, Op>(items: &[T], identity: Id, map: M, reduce: Op) -> R
where
    T: Sync,
    R: Send,
    M: Fn(&T) -> R + Sync + Send,
    Id: Fn() -> R + Sync + Send,
    Op: Fn(R, R) -> R + Sync + Send,
{
    items.par_iter().map(map).reduce(identity, reduce)
}
