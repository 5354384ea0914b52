//! Moves per-point rows into and out of cell-sorted order.
//!
//! With `reverse == false` row `i` of the output is row `idxs[b, i]` of the
//! input; with `reverse == true` row `idxs[b, i]` of the output is row `i` of
//! the input. The two directions are exact inverses, so the backward pass
//! of a reorder is the opposite-direction reorder of its gradients.

use crate::{
    device::Stream,
    error::{Result, SpnError},
    tensor::{BatchView, BatchViewMut},
};
use rayon::prelude::*;

/// Reorders `locs` (`B×N×D`) and optionally `data` (`B×N×C`) by `idxs`
/// (`B×N×1`) into `nlocs` / `ndata`.
///
/// # Errors
/// `idxs` must hold a permutation of `0..N` per batch element: an entry
/// `>= N` yields `IndexOutOfRange`, a repeated entry `InvalidArgument`.
/// Nothing is written when validation fails.
pub fn reorder_data(
    stream: &Stream,
    idxs: BatchView<'_, u32>,
    locs: BatchView<'_, f32>,
    data: Option<BatchView<'_, f32>>,
    mut nlocs: BatchViewMut<'_, f32>,
    ndata: Option<BatchViewMut<'_, f32>>,
    reverse: bool,
) -> Result<()> {
    let batch = locs.batch();
    let n = locs.rows();
    idxs.expect_shape("idxs", Some(batch), Some(n), Some(1))?;
    nlocs.expect_shape("nlocs", Some(batch), Some(n), Some(locs.cols()))?;
    match (&data, &ndata) {
        (Some(data), Some(ndata)) => {
            data.expect_shape("data", Some(batch), Some(n), None)?;
            ndata.expect_shape("ndata", Some(batch), Some(n), Some(data.cols()))?;
        }
        (None, None) => {}
        _ => {
            return Err(SpnError::InvalidArgument(
                "data and ndata must be given together".to_string(),
            ))
        }
    }

    let sources = source_rows(idxs, reverse)?;

    gather_rows(stream, locs, &sources, nlocs.as_mut_slice());
    if let (Some(data), Some(mut ndata)) = (data, ndata) {
        gather_rows(stream, data, &sources, ndata.as_mut_slice());
    }
    Ok(())
}

/// For every output row, the input row it is copied from.
fn source_rows(idxs: BatchView<'_, u32>, reverse: bool) -> Result<Vec<u32>> {
    let n = idxs.rows();
    let mut sources = vec![0u32; idxs.as_slice().len()];
    let mut seen = vec![false; n];
    for b in 0..idxs.batch() {
        seen.fill(false);
        let perm = idxs.batch_slice(b);
        let out = &mut sources[b * n..(b + 1) * n];
        for (i, &j) in perm.iter().enumerate() {
            let j = j as usize;
            if j >= n {
                return Err(SpnError::IndexOutOfRange {
                    tensor: "idxs",
                    index: j as i64,
                    bound: n,
                });
            }
            if seen[j] {
                return Err(SpnError::InvalidArgument(format!(
                    "idxs is not a permutation: {} repeats in batch {}",
                    j, b
                )));
            }
            seen[j] = true;
            if reverse {
                out[j] = i as u32;
            } else {
                out[i] = j as u32;
            }
        }
    }
    Ok(sources)
}

fn gather_rows(stream: &Stream, src: BatchView<'_, f32>, sources: &[u32], dst: &mut [f32]) {
    let cols = src.cols();
    let n = src.rows();
    if cols == 0 || n == 0 {
        return;
    }
    stream.install(|| {
        dst.par_chunks_mut(cols)
            .zip(sources.par_iter())
            .enumerate()
            .for_each(|(flat, (row, &from))| {
                row.copy_from_slice(src.row(flat / n, from as usize));
            });
    });
}
