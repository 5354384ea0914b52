//! Sparse point convolution over enumerated neighborhoods.
//!
//! Each query `i` owns a neighbor list (indices into the source points,
//! terminated by `-1`). Every kernel cell `c` sits at `qlocs[i] + offset_c`
//! and a neighbor `j` contributes to it with weight `W(|locs[j] - qlocs[i] -
//! offset_c|)`, where `W` is the selected smoothing kernel with support
//! `radius`:
//!
//! ```text
//! out[i, k] = bias[k] + s_i * Σ_j Σ_c W(d_ijc) * Σ_ch weight[k, c, ch] * data[j, ch]
//! ```
//!
//! `s_i` is `1 / count_i` with `dis_norm` and a non-empty list, otherwise 1,
//! so a query without neighbors produces exactly `bias`.
//!
//! The backward pass writes every gradient without shared accumulation:
//! query gradients are computed per query, source gradients by walking the
//! transposed neighbor graph per source point in ascending query order, and
//! weight/bias gradients through block partials reduced in block order.

use crate::{
    device::{device_shared_mem, Stream},
    error::{Result, SpnError},
    kernels::{KernelCells, KernelFn},
    reduce::reduce_blocks,
    tensor::{BatchView, BatchViewMut},
    types::{KernelParams, LaunchConfig, MAX_DIMS},
};
use log::debug;
use rayon::prelude::*;
use std::time::Instant;

/// Read-only tensors of a point convolution.
#[derive(Clone, Copy, Debug)]
pub struct ConvSpInputs<'a> {
    /// Query positions, `B×M×D`
    pub qlocs: BatchView<'a, f32>,
    /// Source positions, `B×N×D`
    pub locs: BatchView<'a, f32>,
    /// Source features, `B×N×C`
    pub data: BatchView<'a, f32>,
    /// Neighbor lists, `B×M×K`, each terminated by `-1`
    pub neighbors: BatchView<'a, i32>,
    /// Weight table, `nkernels×ncells×C`
    pub weight: &'a [f32],
    /// Bias, `nkernels`
    pub bias: &'a [f32],
}

/// Gradient buffers of [`convsp_backward`]. Every buffer is accumulated
/// into, never overwritten.
#[derive(Debug)]
pub struct ConvSpGrads<'a> {
    /// `B×M×D`
    pub dqlocs: BatchViewMut<'a, f32>,
    /// `B×N×D`
    pub dlocs: BatchViewMut<'a, f32>,
    /// `B×N×C`
    pub ddata: BatchViewMut<'a, f32>,
    /// `nkernels×ncells×C`
    pub dweight: &'a mut [f32],
    /// `nkernels`, if the bias gradient is wanted
    pub dbias: Option<&'a mut [f32]>,
}

/// A validated convolution problem.
struct PointConv<'a> {
    inputs: ConvSpInputs<'a>,
    cells: KernelCells,
    kernel_fn: KernelFn,
    radius: f32,
    dis_norm: bool,
    ndims: usize,
    nkernels: usize,
    nchannels: usize,
    launch: LaunchConfig,
}

impl<'a> PointConv<'a> {
    fn new(stream: &Stream, inputs: ConvSpInputs<'a>, params: &KernelParams) -> Result<Self> {
        let ConvSpInputs {
            qlocs,
            locs,
            data,
            neighbors,
            weight,
            bias,
        } = inputs;
        let ndims = locs.cols();
        let batch = locs.batch();
        let n = locs.rows();
        let cells = params.cells(ndims)?;

        qlocs.expect_shape("qlocs", Some(batch), None, Some(ndims))?;
        data.expect_shape("data", Some(batch), Some(n), None)?;
        neighbors.expect_shape("neighbors", Some(batch), Some(qlocs.rows()), None)?;
        let nchannels = data.cols();
        let nkernels = bias.len();
        if nchannels == 0 {
            return Err(SpnError::shape("data", format!("{}x{}x>=1", batch, n), "0 channels"));
        }
        if nkernels == 0 {
            return Err(SpnError::shape("bias", ">= 1", 0));
        }
        let table = nkernels * cells.len() * nchannels;
        if weight.len() != table {
            return Err(SpnError::shape(
                "weight",
                format!("{}x{}x{}", nkernels, cells.len(), nchannels),
                weight.len(),
            ));
        }
        if let Some(&bad) = neighbors
            .as_slice()
            .iter()
            .find(|&&j| j < -1 || j as i64 >= n as i64)
        {
            return Err(SpnError::IndexOutOfRange {
                tensor: "neighbors",
                index: bad as i64,
                bound: n,
            });
        }

        let launch = LaunchConfig::for_convsp(
            device_shared_mem(stream.device()),
            nkernels,
            cells.len(),
            nchannels,
            ndims,
        )?;

        Ok(Self {
            inputs,
            cells,
            kernel_fn: params.kernel_fn,
            radius: params.radius,
            dis_norm: params.dis_norm,
            ndims,
            nkernels,
            nchannels,
            launch,
        })
    }

    /// Neighbor list of query `(b, i)` up to its terminator.
    fn neighbors(&self, b: usize, i: usize) -> &'a [i32] {
        let row = self.inputs.neighbors.row(b, i);
        let count = row.iter().position(|&j| j < 0).unwrap_or(row.len());
        &row[..count]
    }

    fn scale(&self, count: usize) -> f32 {
        if self.dis_norm && count > 0 {
            1.0 / count as f32
        } else {
            1.0
        }
    }

    /// Displacement `p - (q + offset_c)` and its length.
    #[inline]
    fn displacement(&self, q: &[f32], c: usize, p: &[f32]) -> ([f32; MAX_DIMS], f32) {
        let offset = self.cells.offset(c);
        let mut r = [0.0f32; MAX_DIMS];
        let mut dist_sq = 0.0f32;
        for d in 0..self.ndims {
            r[d] = p[d] - q[d] - offset[d];
            dist_sq += r[d] * r[d];
        }
        (r, dist_sq.sqrt())
    }

    /// `Σ_ch weight[k, c, ch] * x[ch]`.
    #[inline]
    fn response(&self, k: usize, c: usize, x: &[f32]) -> f32 {
        let start = (k * self.cells.len() + c) * self.nchannels;
        self.inputs.weight[start..start + self.nchannels]
            .iter()
            .zip(x)
            .map(|(w, v)| w * v)
            .sum()
    }

    /// `Σ_k dout[k] * response(k, c, x)`.
    #[inline]
    fn projected_grad(&self, dout: &[f32], c: usize, x: &[f32]) -> f32 {
        (0..self.nkernels)
            .map(|k| dout[k] * self.response(k, c, x))
            .sum()
    }

    fn forward_row(&self, b: usize, i: usize, out: &mut [f32]) {
        let q = self.inputs.qlocs.row(b, i);
        let nbrs = self.neighbors(b, i);
        out.fill(0.0);
        for &j in nbrs {
            let p = self.inputs.locs.row(b, j as usize);
            let x = self.inputs.data.row(b, j as usize);
            for c in 0..self.cells.len() {
                let (_, dist) = self.displacement(q, c, p);
                let w = self.kernel_fn.value(dist, self.radius);
                if w == 0.0 {
                    continue;
                }
                for (k, o) in out.iter_mut().enumerate() {
                    *o += w * self.response(k, c, x);
                }
            }
        }
        let s = self.scale(nbrs.len());
        for (o, &bias) in out.iter_mut().zip(self.inputs.bias) {
            *o = bias + s * *o;
        }
    }

    /// Accumulates the gradient of query `(b, i)`'s position.
    fn query_grad(&self, b: usize, i: usize, dout: &[f32], dq: &mut [f32]) {
        let q = self.inputs.qlocs.row(b, i);
        let nbrs = self.neighbors(b, i);
        let s = self.scale(nbrs.len());
        for &j in nbrs {
            let p = self.inputs.locs.row(b, j as usize);
            let x = self.inputs.data.row(b, j as usize);
            for c in 0..self.cells.len() {
                let (r, dist) = self.displacement(q, c, p);
                if dist <= 0.0 {
                    continue;
                }
                let dw = self.kernel_fn.derivative(dist, self.radius);
                if dw == 0.0 {
                    continue;
                }
                let g = s * dw * self.projected_grad(dout, c, x) / dist;
                for d in 0..self.ndims {
                    dq[d] -= g * r[d];
                }
            }
        }
    }

    /// Accumulates the position and feature gradients of source `(b, j)`
    /// from every query that lists it.
    fn source_grad(
        &self,
        b: usize,
        j: usize,
        queries: &[u32],
        dout: BatchView<'_, f32>,
        dl: &mut [f32],
        dx: &mut [f32],
    ) {
        let p = self.inputs.locs.row(b, j);
        let x = self.inputs.data.row(b, j);
        for &i in queries {
            let i = i as usize;
            let q = self.inputs.qlocs.row(b, i);
            let s = self.scale(self.neighbors(b, i).len());
            let dout_i = dout.row(b, i);
            for c in 0..self.cells.len() {
                let (r, dist) = self.displacement(q, c, p);
                if dist >= self.radius {
                    continue;
                }
                let w = self.kernel_fn.value(dist, self.radius);
                for (ch, v) in dx.iter_mut().enumerate() {
                    let mut acc = 0.0f32;
                    for (k, &g) in dout_i.iter().enumerate() {
                        acc += g * self.inputs.weight[(k * self.cells.len() + c) * self.nchannels + ch];
                    }
                    *v += s * w * acc;
                }
                if dist > 0.0 {
                    let dw = self.kernel_fn.derivative(dist, self.radius);
                    if dw != 0.0 {
                        let g = s * dw * self.projected_grad(dout_i, c, x) / dist;
                        for d in 0..self.ndims {
                            dl[d] += g * r[d];
                        }
                    }
                }
            }
        }
    }

    /// Weight and bias partial of the flat query rows in `rows`. The partial
    /// holds the weight table followed by the bias.
    fn parameter_partial(&self, rows: std::ops::Range<usize>, dout: BatchView<'_, f32>, partial: &mut [f32]) {
        let m = self.inputs.qlocs.rows();
        let table = self.inputs.weight.len();
        let (dweight, dbias) = partial.split_at_mut(table);
        for flat in rows {
            let (b, i) = (flat / m, flat % m);
            let dout_i = dout.row(b, i);
            for (db, &g) in dbias.iter_mut().zip(dout_i) {
                *db += g;
            }
            let q = self.inputs.qlocs.row(b, i);
            let nbrs = self.neighbors(b, i);
            let s = self.scale(nbrs.len());
            for &j in nbrs {
                let p = self.inputs.locs.row(b, j as usize);
                let x = self.inputs.data.row(b, j as usize);
                for c in 0..self.cells.len() {
                    let (_, dist) = self.displacement(q, c, p);
                    let w = self.kernel_fn.value(dist, self.radius);
                    if w == 0.0 {
                        continue;
                    }
                    for (k, &g) in dout_i.iter().enumerate() {
                        let coef = s * w * g;
                        let start = (k * self.cells.len() + c) * self.nchannels;
                        for (dw, &v) in dweight[start..start + self.nchannels].iter_mut().zip(x) {
                            *dw += coef * v;
                        }
                    }
                }
            }
        }
    }
}

/// Transposed neighbor graph of one batch element in CSR form: the queries
/// listing source `j` are `queries[offsets[j]..offsets[j + 1]]`, ascending.
struct SourceLists {
    offsets: Vec<usize>,
    queries: Vec<u32>,
}

impl SourceLists {
    fn build(conv: &PointConv<'_>, b: usize) -> Self {
        let n = conv.inputs.locs.rows();
        let m = conv.inputs.qlocs.rows();
        let mut offsets = vec![0usize; n + 1];
        for i in 0..m {
            for &j in conv.neighbors(b, i) {
                offsets[j as usize + 1] += 1;
            }
        }
        for j in 0..n {
            offsets[j + 1] += offsets[j];
        }
        let mut fill = offsets.clone();
        let mut queries = vec![0u32; offsets[n]];
        for i in 0..m {
            for &j in conv.neighbors(b, i) {
                queries[fill[j as usize]] = i as u32;
                fill[j as usize] += 1;
            }
        }
        Self { offsets, queries }
    }

    fn of(&self, j: usize) -> &[u32] {
        &self.queries[self.offsets[j]..self.offsets[j + 1]]
    }
}

/// Point convolution forward pass into `out` (`B×M×nkernels`).
///
/// # Errors
/// Shape mismatches, neighbor indices outside `[-1, N)`, an invalid kernel
/// table and a weight table too large for the device's per-block shared
/// memory are all reported before `out` is touched.
pub fn convsp_forward(
    stream: &Stream,
    inputs: ConvSpInputs<'_>,
    params: &KernelParams,
    mut out: BatchViewMut<'_, f32>,
) -> Result<()> {
    let start = Instant::now();
    let conv = PointConv::new(stream, inputs, params)?;
    let m = inputs.qlocs.rows();
    out.expect_shape("out", Some(inputs.qlocs.batch()), Some(m), Some(conv.nkernels))?;
    if out.as_slice().is_empty() {
        return Ok(());
    }

    let rows_per_block = conv.launch.rows_per_block;
    let nkernels = conv.nkernels;
    stream.install(|| {
        out.as_mut_slice()
            .par_chunks_mut(rows_per_block * nkernels)
            .enumerate()
            .for_each(|(blk, block)| {
                for (r, row) in block.chunks_mut(nkernels).enumerate() {
                    let flat = blk * rows_per_block + r;
                    conv.forward_row(flat / m, flat % m, row);
                }
            });
    });

    debug!(
        "convsp forward: {}x{} queries, {} cells, {} rows/block, {:.2} ms",
        inputs.qlocs.batch(),
        m,
        conv.cells.len(),
        rows_per_block,
        start.elapsed().as_secs_f32() * 1000.0
    );
    Ok(())
}

/// Point convolution backward pass. Adds the gradients of
/// `Σ dout * out` into `grads`.
///
/// Position gradients are zero for [`KernelFn::Constant`] and for
/// coincident points (`d == 0`).
pub fn convsp_backward(
    stream: &Stream,
    inputs: ConvSpInputs<'_>,
    params: &KernelParams,
    dout: BatchView<'_, f32>,
    grads: ConvSpGrads<'_>,
) -> Result<()> {
    let start = Instant::now();
    let conv = PointConv::new(stream, inputs, params)?;
    let ConvSpGrads {
        mut dqlocs,
        mut dlocs,
        mut ddata,
        dweight,
        dbias,
    } = grads;
    let batch = inputs.locs.batch();
    let n = inputs.locs.rows();
    let m = inputs.qlocs.rows();
    dout.expect_shape("dout", Some(batch), Some(m), Some(conv.nkernels))?;
    dqlocs.expect_shape("dqlocs", Some(batch), Some(m), Some(conv.ndims))?;
    dlocs.expect_shape("dlocs", Some(batch), Some(n), Some(conv.ndims))?;
    ddata.expect_shape("ddata", Some(batch), Some(n), Some(conv.nchannels))?;
    if dweight.len() != inputs.weight.len() {
        return Err(SpnError::shape("dweight", inputs.weight.len(), dweight.len()));
    }
    if let Some(dbias) = &dbias {
        if dbias.len() != conv.nkernels {
            return Err(SpnError::shape("dbias", conv.nkernels, dbias.len()));
        }
    }

    let ndims = conv.ndims;
    let nchannels = conv.nchannels;

    // Per query.
    stream.install(|| {
        dqlocs
            .as_mut_slice()
            .par_chunks_mut(ndims)
            .enumerate()
            .for_each(|(flat, dq)| {
                let (b, i) = (flat / m, flat % m);
                conv.query_grad(b, i, dout.row(b, i), dq);
            });
    });

    // Per source, over the transposed graph.
    if n > 0 {
        let lists: Vec<SourceLists> =
            stream.install(|| (0..batch).into_par_iter().map(|b| SourceLists::build(&conv, b)).collect());
        stream.install(|| {
            dlocs
                .as_mut_slice()
                .par_chunks_mut(ndims)
                .zip(ddata.as_mut_slice().par_chunks_mut(nchannels))
                .enumerate()
                .for_each(|(flat, (dl, dx))| {
                    let (b, j) = (flat / n, flat % n);
                    conv.source_grad(b, j, lists[b].of(j), dout, dl, dx);
                });
        });
    }

    // Weight and bias, reduced in block order.
    let table = dweight.len();
    let mut partial = vec![0.0f32; table + conv.nkernels];
    reduce_blocks(stream, &conv.launch, batch * m, &mut partial, |rows, part| {
        conv.parameter_partial(rows, dout, part)
    });
    for (dw, p) in dweight.iter_mut().zip(&partial[..table]) {
        *dw += p;
    }
    if let Some(dbias) = dbias {
        for (db, p) in dbias.iter_mut().zip(&partial[table..]) {
            *db += p;
        }
    }

    debug!(
        "convsp backward: {}x{} queries, {}x{} sources, {:.2} ms",
        batch,
        m,
        batch,
        n,
        start.elapsed().as_secs_f32() * 1000.0
    );
    Ok(())
}
