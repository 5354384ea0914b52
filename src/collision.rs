//! Radius neighbor enumeration over a cell-sorted hash grid.
//!
//! [`compute_collisions`] first derives the half-open `[start, end)` range
//! of every cell from the sorted cell IDs, then lets each query scan its
//! own cell and the adjacent ones. Queries are independent and run in
//! parallel; when more candidates are found than a row can hold, the
//! nearest ones are kept, ties going to the lower index. Rows are padded
//! with `-1`.

use crate::{
    device::Stream,
    error::{Result, SpnError},
    tensor::{BatchView, BatchViewMut},
    types::{GridGeometry, MAX_DIMS},
};
use log::debug;
use rayon::prelude::*;

/// Marks unused slots of a neighbor row.
pub const NO_NEIGHBOR: i32 = -1;

/// The query set of a collision pass.
#[derive(Clone, Copy, Debug)]
pub enum Queries<'a> {
    /// The (sorted) source points query themselves.
    Source,
    /// A distinct `B×M×D` set of query positions.
    Points(BatchView<'a, f32>),
}

/// Fills `cell_starts` / `cell_ends` (`B×C×1`, `C >= max_ncells`) from the
/// sorted `cell_ids` (`B×N×1`). Cells without points get `start == end == 0`.
///
/// # Errors
/// Fails with `IndexOutOfRange` for a cell ID beyond its batch element's
/// grid and `InvalidArgument` when the IDs are not sorted.
pub fn compute_cell_bounds(
    grid: &GridGeometry,
    cell_ids: BatchView<'_, u32>,
    cell_starts: &mut BatchViewMut<'_, u32>,
    cell_ends: &mut BatchViewMut<'_, u32>,
) -> Result<()> {
    let batch = cell_ids.batch();
    let n = cell_ids.rows();
    let table = grid.max_ncells(batch);
    cell_ids.expect_shape("cell_ids", None, None, Some(1))?;
    cell_starts.expect_shape("cell_starts", Some(batch), None, Some(1))?;
    cell_ends.expect_shape("cell_ends", Some(batch), Some(cell_starts.rows()), Some(1))?;
    if cell_starts.rows() < table {
        return Err(SpnError::shape(
            "cell_starts",
            format!("{}x>={}x1", batch, table),
            format!("{}x{}x1", batch, cell_starts.rows()),
        ));
    }

    for b in 0..batch {
        let ncells = grid.ncells(b);
        let ids = cell_ids.batch_slice(b);
        for (i, &id) in ids.iter().enumerate() {
            if id as usize >= ncells {
                return Err(SpnError::IndexOutOfRange {
                    tensor: "cell_ids",
                    index: id as i64,
                    bound: ncells,
                });
            }
            if i > 0 && ids[i - 1] > id {
                return Err(SpnError::InvalidArgument(format!(
                    "cell_ids of batch {} are not sorted at position {}",
                    b, i
                )));
            }
        }
    }

    let stride = cell_starts.rows();
    let starts = cell_starts.as_mut_slice();
    let ends = cell_ends.as_mut_slice();
    starts.fill(0);
    ends.fill(0);
    for b in 0..batch {
        let ids = cell_ids.batch_slice(b);
        for (i, &id) in ids.iter().enumerate() {
            let slot = b * stride + id as usize;
            if i == 0 || ids[i - 1] != id {
                starts[slot] = i as u32;
            }
            if i + 1 == n || ids[i + 1] != id {
                ends[slot] = (i + 1) as u32;
            }
        }
    }
    Ok(())
}

/// Lists, for every query, up to `collisions.cols()` source points within
/// `radius`.
///
/// `locs` (`B×N×D`) and `cell_ids` (`B×N×1`) must be in the cell-sorted
/// order produced by [`hashgrid_order`](crate::hashgrid::hashgrid_order) and
/// [`reorder_data`](crate::reorder::reorder_data). Neighbor indices refer to
/// that sorted order. `include_self` only matters for
/// [`Queries::Source`], where it lets a point list itself.
///
/// Truncation to the row width is a documented approximation, never an
/// error: the nearest candidates are kept and the result is identical on
/// every run.
///
/// # Errors
/// `InvalidArgument` if `radius` exceeds the grid's cell edge (the
/// adjacent-cell stencil would miss neighbors), plus the errors of
/// [`compute_cell_bounds`].
#[allow(clippy::too_many_arguments)]
pub fn compute_collisions(
    stream: &Stream,
    queries: Queries<'_>,
    locs: BatchView<'_, f32>,
    grid: &GridGeometry,
    cell_ids: BatchView<'_, u32>,
    mut cell_starts: BatchViewMut<'_, u32>,
    mut cell_ends: BatchViewMut<'_, u32>,
    mut collisions: BatchViewMut<'_, i32>,
    radius: f32,
    include_self: bool,
) -> Result<()> {
    let batch = locs.batch();
    let n = locs.rows();
    let ndims = grid.ndims;

    grid.validate()?;
    grid.check_batch(batch)?;
    locs.expect_shape("locs", None, None, Some(ndims))?;
    cell_ids.expect_shape("cell_ids", Some(batch), Some(n), Some(1))?;
    if !(radius.is_finite() && radius > 0.0) {
        return Err(SpnError::InvalidArgument(format!(
            "radius must be positive and finite, got {}",
            radius
        )));
    }
    if radius > grid.cell_edge {
        return Err(SpnError::InvalidArgument(format!(
            "radius {} exceeds the grid cell edge {}",
            radius, grid.cell_edge
        )));
    }
    let qlocs = match queries {
        Queries::Source => locs,
        Queries::Points(qlocs) => {
            qlocs.expect_shape("qlocs", Some(batch), None, Some(ndims))?;
            qlocs
        }
    };
    let self_query = matches!(queries, Queries::Source);
    let m = qlocs.rows();
    collisions.expect_shape("collisions", Some(batch), Some(m), None)?;
    let max_collisions = collisions.cols();
    if max_collisions == 0 {
        return Err(SpnError::InvalidArgument(
            "collisions must have at least one column".to_string(),
        ));
    }

    compute_cell_bounds(grid, cell_ids, &mut cell_starts, &mut cell_ends)?;
    if batch == 0 || m == 0 {
        return Ok(());
    }

    let stride = cell_starts.rows();
    let starts = cell_starts.as_slice();
    let ends = cell_ends.as_slice();
    let radius_sq = radius * radius;
    let stencil = 3usize.pow(ndims as u32);

    stream.install(|| {
        collisions
            .as_mut_slice()
            .par_chunks_mut(max_collisions)
            .enumerate()
            .for_each_init(Vec::new, |candidates: &mut Vec<(f32, u32)>, (flat, row)| {
                let (b, i) = (flat / m, flat % m);
                let q = qlocs.row(b, i);
                let center = grid.cell_coords(b, q);
                candidates.clear();

                for s in 0..stencil {
                    let mut coords = [0i64; MAX_DIMS];
                    let mut rem = s;
                    for d in (0..ndims).rev() {
                        coords[d] = center[d].saturating_add((rem % 3) as i64 - 1);
                        rem /= 3;
                    }
                    let Ok(cell) = grid.cell_id(b, &coords) else {
                        continue;
                    };
                    let slot = b * stride + cell as usize;
                    for j in starts[slot]..ends[slot] {
                        if self_query && !include_self && j as usize == i {
                            continue;
                        }
                        let p = locs.row(b, j as usize);
                        let dist_sq: f32 = q
                            .iter()
                            .zip(p)
                            .map(|(x, y)| (x - y) * (x - y))
                            .sum();
                        if dist_sq <= radius_sq {
                            candidates.push((dist_sq, j));
                        }
                    }
                }

                candidates.sort_unstable_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)));
                candidates.truncate(max_collisions);
                for (k, slot) in row.iter_mut().enumerate() {
                    *slot = candidates.get(k).map_or(NO_NEIGHBOR, |&(_, j)| j as i32);
                }
            });
    });

    debug!(
        "Collisions for {}x{} queries against {} points (radius {}, max {})",
        batch, m, n, radius, max_collisions
    );
    Ok(())
}
