//! Hash-grid construction: cell assignment followed by a sort on cell ID.
//!
//! After [`hashgrid_order`], `idxs[b, i]` names the original index of the
//! point that comes i-th in cell-sorted order and `cell_ids[b, i]` its cell,
//! so `cell_ids` is non-decreasing within each batch element. The grid is
//! ephemeral: nothing outlives the call except the caller's buffers.
//!
//! A GPU stream runs both the cell assignment and the sort on the device; a
//! CPU stream runs them on its thread pool. Both sorts are stable, so the
//! two devices produce the same permutation for the same cell IDs.

use crate::{
    device::Stream,
    error::{Result, SpnError, ValidationError},
    gpu::OUT_OF_RANGE_CELL,
    sort::{radix_sort_pairs, radixsort_buffer_size, scratch_len},
    tensor::{BatchView, BatchViewMut},
    types::GridGeometry,
};
use log::debug;
use rayon::prelude::*;
use std::time::Instant;

/// Orders the points of `locs` (`B×N×D`) by hash-grid cell.
///
/// `cell_ids` and `idxs` are `B×N×1` outputs; `buffer` is sort scratch of at
/// least [`radixsort_buffer_size`] elements for this stream. On a GPU stream
/// the sort runs in device memory of that size and `buffer` is left
/// untouched. `locs` is never modified.
///
/// # Errors
/// Returns `CellOutOfRange` for the first point (in flat order) whose cell
/// falls outside the grid, `InvalidInput` for non-finite positions and
/// `InvalidShape` when a buffer does not match the batch.
pub fn hashgrid_order(
    stream: &Stream,
    locs: BatchView<'_, f32>,
    grid: &GridGeometry,
    mut cell_ids: BatchViewMut<'_, u32>,
    mut idxs: BatchViewMut<'_, u32>,
    buffer: &mut [u32],
) -> Result<()> {
    let start = Instant::now();
    let batch = locs.batch();
    let n = locs.rows();

    grid.validate()?;
    locs.expect_shape("locs", None, None, Some(grid.ndims))?;
    grid.check_batch(batch)?;
    cell_ids.expect_shape("cell_ids", Some(batch), Some(n), Some(1))?;
    idxs.expect_shape("idxs", Some(batch), Some(n), Some(1))?;
    let required = radixsort_buffer_size(stream, batch, n);
    if buffer.len() < required {
        return Err(SpnError::shape("buffer", format!(">= {}", required), buffer.len()));
    }
    if let Some(pos) = locs.as_slice().iter().position(|v| !v.is_finite()) {
        return Err(ValidationError::InvalidValues(pos / grid.ndims).into());
    }
    if batch == 0 || n == 0 {
        return Ok(());
    }

    match stream.hashgrid_pass() {
        Some(pass) => {
            let result = pollster::block_on(pass.order(locs, grid))?;
            if let Some(flat) = result.first_out_of_range {
                return Err(out_of_range_error(locs, grid, flat));
            }
            cell_ids.as_mut_slice().copy_from_slice(&result.cell_ids);
            idxs.as_mut_slice().copy_from_slice(&result.idxs);
        }
        None => order_on_pool(
            stream,
            locs,
            grid,
            cell_ids.as_mut_slice(),
            idxs.as_mut_slice(),
            buffer,
        )?,
    }

    debug!(
        "Hashgrid order of {}x{} points on {:?} took {:.2} ms",
        batch,
        n,
        stream.device(),
        start.elapsed().as_secs_f32() * 1000.0
    );
    Ok(())
}

/// Host path: cell assignment and per-batch radix sorts on the stream's pool.
fn order_on_pool(
    stream: &Stream,
    locs: BatchView<'_, f32>,
    grid: &GridGeometry,
    cell_ids: &mut [u32],
    idxs: &mut [u32],
    buffer: &mut [u32],
) -> Result<()> {
    let n = locs.rows();
    assign_cells(stream, locs, grid, cell_ids);
    if let Some(flat) = cell_ids.iter().position(|&id| id == OUT_OF_RANGE_CELL) {
        return Err(out_of_range_error(locs, grid, flat));
    }

    stream.install(|| {
        cell_ids
            .par_chunks_mut(n)
            .zip(idxs.par_chunks_mut(n))
            .zip(buffer.par_chunks_mut(scratch_len(n)))
            .try_for_each(|((keys, values), scratch)| {
                for (i, v) in values.iter_mut().enumerate() {
                    *v = i as u32;
                }
                radix_sort_pairs(keys, values, scratch)
            })
    })
}

/// Computes every point's cell ID on the stream's pool, writing
/// [`OUT_OF_RANGE_CELL`] for points outside the grid.
fn assign_cells(stream: &Stream, locs: BatchView<'_, f32>, grid: &GridGeometry, cell_ids: &mut [u32]) {
    let n = locs.rows();
    stream.install(|| {
        cell_ids.par_iter_mut().enumerate().for_each(|(flat, id)| {
            let b = flat / n;
            let coords = grid.cell_coords(b, locs.row(b, flat % n));
            *id = grid.cell_id(b, &coords).unwrap_or(OUT_OF_RANGE_CELL);
        });
    });
}

fn out_of_range_error(locs: BatchView<'_, f32>, grid: &GridGeometry, flat: usize) -> SpnError {
    let n = locs.rows();
    let (batch, point) = (flat / n, flat % n);
    let coords = grid.cell_coords(batch, locs.row(batch, point));
    // A point right on a cell boundary can round differently on the GPU.
    let axis = grid.cell_id(batch, &coords).err().unwrap_or(0);
    SpnError::CellOutOfRange {
        batch,
        point,
        axis,
        cell: coords[axis],
        dim: grid.dims(batch)[axis],
    }
}
