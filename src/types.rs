//! Parameter objects shared by the operators.
//!
//! These group what would otherwise be long positional argument lists:
//! hash-grid geometry, convolution kernel parameters, collision
//! configuration and the launch configuration derived from a device's
//! shared memory budget.

use crate::error::{Result, SpnError, ValidationError};
use crate::kernels::{KernelCells, KernelFn};
use crate::tensor::BatchView;

/// Largest supported coordinate dimensionality.
pub const MAX_DIMS: usize = 3;

/// Uniform hash-grid geometry.
///
/// `low` and `grid_dims` are either global (`D` entries) or per batch
/// element (`B×D` entries). Cell IDs are row-major with the last axis
/// fastest, so sorting by ID groups points cell by cell.
#[derive(Clone, Debug, PartialEq)]
pub struct GridGeometry {
    /// Lower corner of the grid
    pub low: Vec<f32>,
    /// Cell counts per axis
    pub grid_dims: Vec<u32>,
    /// Edge length of a (cubic) cell
    pub cell_edge: f32,
    /// Coordinate dimensionality
    pub ndims: usize,
}

impl GridGeometry {
    /// Creates and validates a grid geometry.
    pub fn new(low: Vec<f32>, grid_dims: Vec<u32>, ndims: usize, cell_edge: f32) -> Result<Self> {
        let grid = Self {
            low,
            grid_dims,
            cell_edge,
            ndims,
        };
        grid.validate()?;
        Ok(grid)
    }

    /// Checks internal consistency of the geometry.
    pub fn validate(&self) -> Result<()> {
        if self.ndims == 0 || self.ndims > MAX_DIMS {
            return Err(SpnError::InvalidArgument(format!(
                "ndims must be in 1..={}, got {}",
                MAX_DIMS, self.ndims
            )));
        }
        if !(self.cell_edge.is_finite() && self.cell_edge > 0.0) {
            return Err(SpnError::InvalidArgument(format!(
                "cell_edge must be positive and finite, got {}",
                self.cell_edge
            )));
        }
        if self.low.is_empty() || self.low.len() % self.ndims != 0 {
            return Err(SpnError::shape("low", format!("k*{}", self.ndims), self.low.len()));
        }
        if self.grid_dims.len() != self.low.len() {
            return Err(SpnError::shape("grid_dims", self.low.len(), self.grid_dims.len()));
        }
        if self.low.iter().any(|v| !v.is_finite()) {
            return Err(SpnError::InvalidArgument("low must be finite".to_string()));
        }
        for chunk in self.grid_dims.chunks_exact(self.ndims) {
            if chunk.iter().any(|&d| d == 0) {
                return Err(SpnError::InvalidArgument(
                    "grid_dims entries must be positive".to_string(),
                ));
            }
            let ncells = chunk.iter().try_fold(1u64, |acc, &d| acc.checked_mul(d as u64));
            if ncells.map_or(true, |n| n > u32::MAX as u64) {
                return Err(SpnError::InvalidArgument(format!(
                    "grid {:?} has more cells than fit a 32-bit cell ID",
                    chunk
                )));
            }
        }
        Ok(())
    }

    /// Checks that this geometry can serve a batch of `batch` elements.
    pub fn check_batch(&self, batch: usize) -> Result<()> {
        let groups = self.low.len() / self.ndims;
        if groups == 1 || groups == batch {
            Ok(())
        } else {
            Err(SpnError::shape(
                "low",
                format!("{} or {}x{}", self.ndims, batch, self.ndims),
                self.low.len(),
            ))
        }
    }

    fn group(&self, b: usize) -> usize {
        if self.low.len() == self.ndims {
            0
        } else {
            b
        }
    }

    /// Lower corner used by batch element `b`.
    #[inline]
    pub fn low(&self, b: usize) -> &[f32] {
        let g = self.group(b);
        &self.low[g * self.ndims..(g + 1) * self.ndims]
    }

    /// Cell counts used by batch element `b`.
    #[inline]
    pub fn dims(&self, b: usize) -> &[u32] {
        let g = self.group(b);
        &self.grid_dims[g * self.ndims..(g + 1) * self.ndims]
    }

    /// Total cells of batch element `b`.
    pub fn ncells(&self, b: usize) -> usize {
        self.dims(b).iter().map(|&d| d as usize).product()
    }

    /// Largest cell count over a batch; the row width of cell start/end tables.
    pub fn max_ncells(&self, batch: usize) -> usize {
        (0..batch.max(1)).map(|b| self.ncells(b)).max().unwrap_or(0)
    }

    /// Integer cell coordinates of `point` in batch element `b`. May lie
    /// outside the grid.
    #[inline]
    pub fn cell_coords(&self, b: usize, point: &[f32]) -> [i64; MAX_DIMS] {
        let low = self.low(b);
        let mut coords = [0i64; MAX_DIMS];
        for d in 0..self.ndims {
            coords[d] = ((point[d] - low[d]) / self.cell_edge).floor() as i64;
        }
        coords
    }

    /// Row-major cell ID of `coords`, or the first axis that escapes the grid.
    #[inline]
    pub fn cell_id(&self, b: usize, coords: &[i64; MAX_DIMS]) -> std::result::Result<u32, usize> {
        let dims = self.dims(b);
        let mut id: u64 = 0;
        for d in 0..self.ndims {
            if coords[d] < 0 || coords[d] >= dims[d] as i64 {
                return Err(d);
            }
            id = id * dims[d] as u64 + coords[d] as u64;
        }
        Ok(id as u32)
    }

    /// Fits a grid around every batch element of `locs` (`B×N×D`).
    ///
    /// Each element gets its own lower corner and cell counts, centered on
    /// the data with at least half a cell of margin on every side. The cell
    /// edge starts at `cell_edge` and grows uniformly if some element would
    /// need more than `max_grid_dim` cells along an axis. Since the edge
    /// never shrinks below `cell_edge`, a radius query with
    /// `radius <= cell_edge` only needs the adjacent cells.
    pub fn fit(locs: BatchView<'_, f32>, cell_edge: f32, max_grid_dim: u32) -> Result<Self> {
        let ndims = locs.cols();
        if !(cell_edge.is_finite() && cell_edge > 0.0) {
            return Err(SpnError::InvalidArgument(format!(
                "cell_edge must be positive and finite, got {}",
                cell_edge
            )));
        }
        check_max_grid_dim(max_grid_dim, ndims)?;
        if let Some(idx) = locs.as_slice().iter().position(|v| !v.is_finite()) {
            return Err(ValidationError::InvalidValues(idx / ndims.max(1)).into());
        }

        let batch = locs.batch().max(1);
        let mut lower = vec![0.0f32; batch * ndims];
        let mut upper = vec![0.0f32; batch * ndims];
        for b in 0..locs.batch() {
            let lo = &mut lower[b * ndims..(b + 1) * ndims];
            let hi = &mut upper[b * ndims..(b + 1) * ndims];
            if locs.rows() > 0 {
                lo.copy_from_slice(locs.row(b, 0));
                hi.copy_from_slice(locs.row(b, 0));
            }
            for i in 1..locs.rows() {
                for (d, &x) in locs.row(b, i).iter().enumerate() {
                    lo[d] = lo[d].min(x);
                    hi[d] = hi[d].max(x);
                }
            }
        }

        let max_extent = lower
            .iter()
            .zip(upper.iter())
            .map(|(lo, hi)| hi - lo)
            .fold(0.0f32, f32::max);
        let edge = cell_edge.max(max_extent / (max_grid_dim - 2) as f32);

        let mut low = vec![0.0f32; batch * ndims];
        let mut grid_dims = vec![0u32; batch * ndims];
        for k in 0..batch * ndims {
            let extent = upper[k] - lower[k];
            let cells = ((extent / edge).floor() as u64)
                .saturating_add(2)
                .min(max_grid_dim as u64) as u32;
            let center = 0.5 * (lower[k] + upper[k]);
            grid_dims[k] = cells;
            low[k] = center - 0.5 * cells as f32 * edge;
        }

        Self::new(low, grid_dims, ndims, edge)
    }
}

/// Parameters of the point-convolution kernel table.
#[derive(Clone, Debug, PartialEq)]
pub struct KernelParams {
    /// Support radius of the smoothing kernel
    pub radius: f32,
    /// Kernel cells per axis
    pub kernel_size: Vec<u32>,
    /// Spacing between kernel cells per axis
    pub dilation: Vec<f32>,
    /// Average contributions over the query's neighbor count
    pub dis_norm: bool,
    /// Smoothing kernel selector
    pub kernel_fn: KernelFn,
}

impl KernelParams {
    /// Validates against the coordinate dimensionality and lays out the cells.
    pub fn cells(&self, ndims: usize) -> Result<KernelCells> {
        if !(self.radius.is_finite() && self.radius > 0.0) {
            return Err(SpnError::InvalidArgument(format!(
                "radius must be positive and finite, got {}",
                self.radius
            )));
        }
        if self.kernel_size.len() != ndims {
            return Err(SpnError::shape("kernel_size", ndims, self.kernel_size.len()));
        }
        KernelCells::new(&self.kernel_size, &self.dilation)
    }
}

/// Parameters of the SDF convolution kernel table.
#[derive(Clone, Debug, PartialEq)]
pub struct SdfKernelParams {
    /// Kernel cells per axis
    pub kernel_size: Vec<u32>,
    /// Spacing between kernel cells per axis
    pub dilation: Vec<f32>,
    /// Scene distances at or beyond this contribute nothing
    pub max_distance: f32,
}

impl SdfKernelParams {
    /// Validates against the coordinate dimensionality and lays out the cells.
    pub fn cells(&self, ndims: usize) -> Result<KernelCells> {
        if self.max_distance.is_nan() {
            return Err(SpnError::InvalidArgument("max_distance is NaN".to_string()));
        }
        if self.kernel_size.len() != ndims {
            return Err(SpnError::shape("kernel_size", ndims, self.kernel_size.len()));
        }
        KernelCells::new(&self.kernel_size, &self.dilation)
    }
}

/// Configuration for the particle collision pipeline.
#[derive(Clone, Debug)]
pub struct CollisionConfig {
    /// Coordinate dimensionality.
    pub ndims: usize,
    /// Neighbor search radius; also the minimum hash-grid cell edge.
    pub radius: f32,
    /// Upper bound on cells along any axis of the hash grid.
    pub max_grid_dim: u32,
    /// Neighbors kept per query; further candidates are dropped.
    pub max_collisions: usize,
    /// Whether a point lists itself when queries are the source points.
    pub include_self: bool,
}

impl Default for CollisionConfig {
    fn default() -> Self {
        Self {
            ndims: 3,
            radius: 0.1,
            max_grid_dim: 96,
            max_collisions: 128,
            include_self: true,
        }
    }
}

impl CollisionConfig {
    /// Validates the configuration.
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.ndims == 0 || self.ndims > MAX_DIMS {
            return Err(format!("ndims must be in 1..={}, got {}", MAX_DIMS, self.ndims));
        }
        if !(self.radius.is_finite() && self.radius > 0.0) {
            return Err(format!("radius must be positive, got {}", self.radius));
        }
        check_max_grid_dim(self.max_grid_dim, self.ndims).map_err(|e| match e {
            SpnError::InvalidArgument(msg) => msg,
            other => other.to_string(),
        })?;
        if self.max_collisions == 0 {
            return Err("max_collisions must be greater than 0".to_string());
        }
        Ok(())
    }
}

/// Largest per-axis cell count whose `ndims`-th power still fits a 32-bit
/// cell ID.
pub fn max_grid_dim_limit(ndims: usize) -> u32 {
    let max = u32::MAX as u64;
    let ndims = ndims.clamp(1, MAX_DIMS) as u32;
    let mut d = (max as f64).powf(1.0 / ndims as f64) as u64;
    while d > 1 && d.pow(ndims) > max {
        d -= 1;
    }
    while (d + 1).pow(ndims) <= max {
        d += 1;
    }
    d.min(max) as u32
}

fn check_max_grid_dim(max_grid_dim: u32, ndims: usize) -> Result<()> {
    let limit = max_grid_dim_limit(ndims);
    if max_grid_dim < 3 || max_grid_dim > limit {
        return Err(SpnError::InvalidArgument(format!(
            "max_grid_dim must be in 3..={} for {} dimensions, got {}",
            limit, ndims, max_grid_dim
        )));
    }
    Ok(())
}

/// Most rows (queries or points) handled by one block.
pub const MAX_ROWS_PER_BLOCK: usize = 256;

/// How a convolution launch is tiled, derived from the device's per-block
/// shared memory.
///
/// A block stages the launch's read-only tables (weights, bias, scene
/// poses) once and then walks `rows_per_block` rows. Gradient reductions
/// are performed per block and combined in block order, which keeps
/// backward passes deterministic for a given device.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LaunchConfig {
    /// Shared memory available per block
    pub shared_mem_per_block: usize,
    /// Bytes of tables staged per block
    pub staged_bytes: usize,
    /// Rows processed by each block
    pub rows_per_block: usize,
}

impl LaunchConfig {
    /// Sizes a launch that stages `staged_bytes` and needs `bytes_per_row`
    /// of working space per row.
    ///
    /// # Errors
    /// Returns `InsufficientSharedMemory` if not even one row fits next to
    /// the staged tables.
    pub fn new(shared_mem_per_block: usize, staged_bytes: usize, bytes_per_row: usize) -> Result<Self> {
        let bytes_per_row = bytes_per_row.max(1);
        let required = staged_bytes + bytes_per_row;
        if required > shared_mem_per_block {
            return Err(SpnError::InsufficientSharedMemory {
                required,
                available: shared_mem_per_block,
            });
        }
        let rows_per_block =
            ((shared_mem_per_block - staged_bytes) / bytes_per_row).clamp(1, MAX_ROWS_PER_BLOCK);
        Ok(Self {
            shared_mem_per_block,
            staged_bytes,
            rows_per_block,
        })
    }

    /// Launch for a sparse point convolution: the weight table and bias are
    /// staged, each query keeps its position and output row.
    pub fn for_convsp(
        shared_mem_per_block: usize,
        nkernels: usize,
        ncells: usize,
        nchannels: usize,
        ndims: usize,
    ) -> Result<Self> {
        let f = std::mem::size_of::<f32>();
        let staged = (nkernels * ncells * nchannels + nkernels) * f;
        Self::new(shared_mem_per_block, staged, (ndims + nkernels) * f)
    }

    /// Launch for an SDF convolution: weights, bias and every body's pose,
    /// scale and atlas index are staged.
    pub fn for_convsdf(
        shared_mem_per_block: usize,
        nkernels: usize,
        ncells: usize,
        nbodies: usize,
        pose_len: usize,
        ndims: usize,
    ) -> Result<Self> {
        let f = std::mem::size_of::<f32>();
        let staged = (nkernels * ncells + nkernels) * f + nbodies * (pose_len + 2) * f;
        Self::new(shared_mem_per_block, staged, (ndims + nkernels) * f)
    }

    /// Number of blocks needed for `rows` rows.
    pub fn num_blocks(&self, rows: usize) -> usize {
        rows.div_ceil(self.rows_per_block)
    }
}
