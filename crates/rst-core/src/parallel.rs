use std::ops::Range;

use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};
use rayon::prelude::*;
use rayon::{ThreadPool, ThreadPoolBuilder};

use crate::consts::MIN_GUIDED_CHUNK;
use crate::error::{Result, RstError};

/// Build a fixed-size worker pool for one call.
pub fn build_pool(threads: usize) -> Result<ThreadPool> {
    if threads == 0 {
        return Err(RstError::InvalidArgument(
            "thread count must be at least 1".into(),
        ));
    }
    Ok(ThreadPoolBuilder::new().num_threads(threads).build()?)
}

/// Split `0..n_items` into guided chunks: each chunk takes
/// `ceil(remaining / threads)` items, so early chunks are large and later
/// ones shrink towards `min_chunk` to even out data-dependent costs.
pub fn guided_chunks(n_items: usize, threads: usize, min_chunk: usize) -> Vec<Range<usize>> {
    let threads = threads.max(1);
    let min_chunk = min_chunk.max(1);
    let mut chunks = Vec::new();
    let mut start = 0;
    while start < n_items {
        let remaining = n_items - start;
        let size = remaining.div_ceil(threads).max(min_chunk).min(remaining);
        chunks.push(start..start + size);
        start += size;
    }
    chunks
}

/// Draw `n` independent stream seeds from a master generator.
///
/// Seeds are drawn sequentially before any parallel work starts, so the
/// stream assigned to work item `i` is the same for every thread count.
pub fn row_seeds(seed: u64, n: usize) -> Vec<u64> {
    let mut master = StdRng::seed_from_u64(seed);
    (0..n).map(|_| master.next_u64()).collect()
}

/// Accumulate every frame into per-worker buffers with guided chunking.
///
/// Chunk `c` always goes to worker `c % workers`, and each worker walks its
/// chunks in order, so a buffer's contents depend only on `n_frames` and
/// `threads`. Must run inside the pool that sized `threads`. Returns the
/// worker buffers in worker order; the caller merges them sequentially.
pub(crate) fn accumulate_frames<A, F>(
    n_frames: usize,
    threads: usize,
    init: impl Fn() -> A + Sync,
    deposit: F,
) -> Vec<A>
where
    A: Send,
    F: Fn(&mut A, usize) + Sync,
{
    let chunks = guided_chunks(n_frames, threads, MIN_GUIDED_CHUNK);
    let workers = threads.min(chunks.len()).max(1);

    (0..workers)
        .into_par_iter()
        .map(|worker| {
            let mut acc = init();
            for chunk in chunks.iter().skip(worker).step_by(workers) {
                for i in chunk.clone() {
                    deposit(&mut acc, i);
                }
            }
            acc
        })
        .collect()
}
