//! End-to-end neighbor search over unsorted point clouds.

use crate::{
    collision::{compute_collisions, Queries},
    device::Stream,
    error::{Result, SpnError},
    hashgrid::hashgrid_order,
    reorder::reorder_data,
    sort::radixsort_buffer_size,
    tensor::{BatchView, BatchViewMut},
    types::{CollisionConfig, GridGeometry},
};
use log::{debug, info};
use std::time::Instant;

/// Everything produced by [`ParticleCollision::forward`].
///
/// `locs`, `data` and the neighbor indices are in cell-sorted order; `idxs`
/// maps each sorted row back to the caller's original row.
#[derive(Clone, Debug)]
pub struct CollisionOutput {
    /// Sorted positions, `B×N×D`
    pub locs: Vec<f32>,
    /// Sorted per-point data, `B×N×C` (empty when no data was given)
    pub data: Vec<f32>,
    /// Original index of every sorted row, `B×N×1`
    pub idxs: Vec<u32>,
    /// Neighbor lists, `B×M×max_collisions`, padded with `-1`
    pub neighbors: Vec<i32>,
    /// Grid the points were binned into
    pub grid: GridGeometry,
    /// Batch size
    pub batch: usize,
    /// Source points per batch element
    pub num_points: usize,
    /// Queries per batch element
    pub num_queries: usize,
    /// Data channels per point
    pub num_channels: usize,
}

impl CollisionOutput {
    /// View over the sorted positions.
    pub fn locs_view(&self) -> Result<BatchView<'_, f32>> {
        BatchView::new(&self.locs, self.batch, self.num_points, self.grid.ndims)
    }

    /// View over the sorted data.
    pub fn data_view(&self) -> Result<BatchView<'_, f32>> {
        BatchView::new(&self.data, self.batch, self.num_points, self.num_channels)
    }

    /// View over the neighbor lists.
    pub fn neighbors_view(&self) -> Result<BatchView<'_, i32>> {
        let width = if self.batch * self.num_queries == 0 {
            0
        } else {
            self.neighbors.len() / (self.batch * self.num_queries)
        };
        BatchView::new(&self.neighbors, self.batch, self.num_queries, width)
    }

    /// Moves per-point rows (`B×N×C`, sorted order) back to the caller's
    /// original order. This is also how gradients with respect to the sorted
    /// tensors flow back to the unsorted inputs.
    pub fn unsort(
        &self,
        stream: &Stream,
        sorted: BatchView<'_, f32>,
        out: BatchViewMut<'_, f32>,
    ) -> Result<()> {
        let idxs = BatchView::new(&self.idxs, self.batch, self.num_points, 1)?;
        reorder_data(stream, idxs, sorted, None, out, None, true)
    }
}

/// Radius neighbor search that bins, sorts and queries in one call.
#[derive(Clone, Debug, Default)]
pub struct ParticleCollision {
    /// Search configuration
    pub config: CollisionConfig,
}

impl ParticleCollision {
    /// Creates a pipeline from a validated configuration.
    pub fn new(config: CollisionConfig) -> Result<Self> {
        config.validate().map_err(SpnError::InvalidArgument)?;
        Ok(Self { config })
    }

    /// Finds the neighbors of every query within the configured radius.
    ///
    /// With `qlocs == None` the source points query themselves (subject to
    /// `include_self`). The grid is fitted to `locs` with a cell edge of at
    /// least the radius; queries that fall outside it simply find no
    /// neighbors.
    pub fn forward(
        &self,
        stream: &Stream,
        locs: BatchView<'_, f32>,
        data: Option<BatchView<'_, f32>>,
        qlocs: Option<BatchView<'_, f32>>,
    ) -> Result<CollisionOutput> {
        let start = Instant::now();
        let config = &self.config;
        config.validate().map_err(SpnError::InvalidArgument)?;
        locs.expect_shape("locs", None, None, Some(config.ndims))?;
        let batch = locs.batch();
        let n = locs.rows();
        let channels = data.map_or(0, |d| d.cols());
        if let Some(data) = data {
            data.expect_shape("data", Some(batch), Some(n), None)?;
        }

        let grid = GridGeometry::fit(locs, config.radius, config.max_grid_dim)?;
        debug!(
            "Fitted grid: edge {}, dims {:?}",
            grid.cell_edge,
            grid.dims(0)
        );

        let mut cell_ids = vec![0u32; batch * n];
        let mut idxs = vec![0u32; batch * n];
        let mut buffer = vec![0u32; radixsort_buffer_size(stream, batch, n)];
        hashgrid_order(
            stream,
            locs,
            &grid,
            BatchViewMut::new(&mut cell_ids, batch, n, 1)?,
            BatchViewMut::new(&mut idxs, batch, n, 1)?,
            &mut buffer,
        )?;

        let mut sorted_locs = vec![0.0f32; locs.as_slice().len()];
        let mut sorted_data = vec![0.0f32; batch * n * channels];
        let idxs_view = BatchView::new(&idxs, batch, n, 1)?;
        match data {
            Some(data) => reorder_data(
                stream,
                idxs_view,
                locs,
                Some(data),
                BatchViewMut::new(&mut sorted_locs, batch, n, config.ndims)?,
                Some(BatchViewMut::new(&mut sorted_data, batch, n, channels)?),
                false,
            )?,
            None => reorder_data(
                stream,
                idxs_view,
                locs,
                None,
                BatchViewMut::new(&mut sorted_locs, batch, n, config.ndims)?,
                None,
                false,
            )?,
        }

        let m = qlocs.map_or(n, |q| q.rows());
        let table = grid.max_ncells(batch);
        let mut cell_starts = vec![0u32; batch * table];
        let mut cell_ends = vec![0u32; batch * table];
        let mut neighbors = vec![0i32; batch * m * config.max_collisions];
        let queries = match qlocs {
            Some(q) => Queries::Points(q),
            None => Queries::Source,
        };
        compute_collisions(
            stream,
            queries,
            BatchView::new(&sorted_locs, batch, n, config.ndims)?,
            &grid,
            BatchView::new(&cell_ids, batch, n, 1)?,
            BatchViewMut::new(&mut cell_starts, batch, table, 1)?,
            BatchViewMut::new(&mut cell_ends, batch, table, 1)?,
            BatchViewMut::new(&mut neighbors, batch, m, config.max_collisions)?,
            config.radius,
            config.include_self,
        )?;

        info!(
            "Particle collision for {}x{} points took {:.2} ms",
            batch,
            n,
            start.elapsed().as_secs_f32() * 1000.0
        );

        Ok(CollisionOutput {
            locs: sorted_locs,
            data: sorted_data,
            idxs,
            neighbors,
            grid,
            batch,
            num_points: n,
            num_queries: m,
            num_channels: channels,
        })
    }
}
