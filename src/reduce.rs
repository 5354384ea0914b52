//! Deterministic reduction of per-block partial sums.
//!
//! Gradients that many rows contribute to (weights, bias, scene poses) are
//! accumulated into one zeroed partial per block of `rows_per_block` rows.
//! Partials are produced in parallel and then added to the output strictly
//! in block order, so the result does not depend on thread scheduling.

use crate::{device::Stream, types::LaunchConfig};
use rayon::prelude::*;
use std::ops::Range;

/// Blocks whose partials are held in memory at once.
const BLOCKS_PER_WAVE: usize = 64;

/// Runs `block` over `rows` rows in blocks of `launch.rows_per_block` and
/// adds every block's `out.len()`-wide partial into `out`, in block order.
pub(crate) fn reduce_blocks<F>(stream: &Stream, launch: &LaunchConfig, rows: usize, out: &mut [f32], block: F)
where
    F: Fn(Range<usize>, &mut [f32]) + Sync,
{
    let width = out.len();
    let num_blocks = launch.num_blocks(rows);
    if width == 0 || num_blocks == 0 {
        return;
    }

    let mut wave_start = 0;
    while wave_start < num_blocks {
        let wave_end = (wave_start + BLOCKS_PER_WAVE).min(num_blocks);
        let partials: Vec<Vec<f32>> = stream.install(|| {
            (wave_start..wave_end)
                .into_par_iter()
                .map(|blk| {
                    let start = blk * launch.rows_per_block;
                    let end = (start + launch.rows_per_block).min(rows);
                    let mut partial = vec![0.0f32; width];
                    block(start..end, &mut partial);
                    partial
                })
                .collect()
        });
        for partial in &partials {
            for (o, p) in out.iter_mut().zip(partial) {
                *o += p;
            }
        }
        wave_start = wave_end;
    }
}
