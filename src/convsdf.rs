//! Convolution of points against a scene of rigid SDF bodies.
//!
//! For point `i` and kernel cell `c` the probe `p = locs[i] + offset_c` is
//! moved into every body's frame and the body's SDF is sampled:
//! `dist_m = s_m * S_m(R_m⁻¹ (p - t_m) / s_m)`. The scene distance is the
//! minimum over bodies, the lowest body index winning ties. Probes whose
//! scene distance is below `max_distance` contribute
//! `weight[k, c] * dist` to `out[i, k]`; every output then gets `bias[k]`.
//!
//! Bodies are few compared to points, so each probe scans all of them; no
//! spatial index is built.

use crate::{
    device::{device_shared_mem, Stream},
    error::{Result, SpnError},
    kernels::KernelCells,
    reduce::reduce_blocks,
    sdf::{pose_len, to_local, to_local_backward, SdfAtlas, SdfScene},
    tensor::{BatchView, BatchViewMut},
    types::{LaunchConfig, SdfKernelParams, MAX_DIMS},
};
use log::debug;
use rayon::prelude::*;
use std::time::Instant;

/// Read-only tensors of an SDF convolution.
#[derive(Clone, Copy, Debug)]
pub struct ConvSdfInputs<'a> {
    /// Point positions, `B×N×D`
    pub locs: BatchView<'a, f32>,
    /// Bodies placed in the scene
    pub scene: SdfScene<'a>,
    /// SDF grids the bodies refer to
    pub atlas: SdfAtlas<'a>,
    /// Weight table, `nkernels×ncells`
    pub weight: &'a [f32],
    /// Bias, `nkernels`
    pub bias: &'a [f32],
}

/// Gradient buffers of [`convsdf_backward`], accumulated into.
#[derive(Debug)]
pub struct ConvSdfGrads<'a> {
    /// `B×N×D`
    pub dlocs: BatchViewMut<'a, f32>,
    /// `nkernels×ncells`
    pub dweight: &'a mut [f32],
    /// `B×M×pose_len`
    pub dposes: BatchViewMut<'a, f32>,
    /// `nkernels`, if the bias gradient is wanted
    pub dbias: Option<&'a mut [f32]>,
}

/// Closest body to a probe.
struct Hit {
    body: usize,
    dist: f32,
    /// Gradient of `dist` with respect to the body-frame probe
    grad: [f32; MAX_DIMS],
}

struct SdfConv<'a> {
    inputs: ConvSdfInputs<'a>,
    cells: KernelCells,
    max_distance: f32,
    ndims: usize,
    nkernels: usize,
    pose_len: usize,
    launch: LaunchConfig,
}

impl<'a> SdfConv<'a> {
    fn new(stream: &Stream, inputs: ConvSdfInputs<'a>, params: &SdfKernelParams) -> Result<Self> {
        let locs = inputs.locs;
        let ndims = locs.cols();
        let cells = params.cells(ndims)?;
        let pose_len = pose_len(ndims)?;
        inputs.atlas.validate(ndims)?;
        inputs.scene.validate(locs.batch(), ndims, &inputs.atlas)?;

        let nkernels = inputs.bias.len();
        if nkernels == 0 {
            return Err(SpnError::shape("bias", ">= 1", 0));
        }
        if inputs.weight.len() != nkernels * cells.len() {
            return Err(SpnError::shape(
                "weight",
                format!("{}x{}", nkernels, cells.len()),
                inputs.weight.len(),
            ));
        }

        let launch = LaunchConfig::for_convsdf(
            device_shared_mem(stream.device()),
            nkernels,
            cells.len(),
            inputs.scene.num_bodies(),
            pose_len,
            ndims,
        )?;

        Ok(Self {
            inputs,
            cells,
            max_distance: params.max_distance,
            ndims,
            nkernels,
            pose_len,
            launch,
        })
    }

    fn probe(&self, b: usize, i: usize, c: usize) -> [f32; MAX_DIMS] {
        let loc = self.inputs.locs.row(b, i);
        let offset = self.cells.offset(c);
        let mut p = [0.0f32; MAX_DIMS];
        for d in 0..self.ndims {
            p[d] = loc[d] + offset[d];
        }
        p
    }

    /// Nearest body to `p`, if any lies closer than `max_distance`.
    fn nearest(&self, b: usize, p: &[f32; MAX_DIMS]) -> Option<Hit> {
        let scene = &self.inputs.scene;
        let mut best: Option<Hit> = None;
        for m in 0..scene.num_bodies() {
            let scale = scene.scale(b, m);
            let mut local = to_local(self.ndims, scene.pose(b, m), p);
            for v in local.iter_mut() {
                *v /= scale;
            }
            let (value, grad) = self.inputs.atlas.sample(scene.object(b, m), self.ndims, &local);
            let dist = scale * value;
            if best.as_ref().map_or(true, |hit| dist < hit.dist) {
                best = Some(Hit { body: m, dist, grad });
            }
        }
        best.filter(|hit| hit.dist < self.max_distance)
    }

    fn forward_row(&self, b: usize, i: usize, out: &mut [f32]) {
        out.fill(0.0);
        let ncells = self.cells.len();
        for c in 0..ncells {
            let p = self.probe(b, i, c);
            if let Some(hit) = self.nearest(b, &p) {
                for (k, o) in out.iter_mut().enumerate() {
                    *o += self.inputs.weight[k * ncells + c] * hit.dist;
                }
            }
        }
        for (o, &bias) in out.iter_mut().zip(self.inputs.bias) {
            *o += bias;
        }
    }

    /// `∂L/∂dist` of probe `c` given the output gradient of its point.
    fn dist_grad(&self, dout: &[f32], c: usize) -> f32 {
        let ncells = self.cells.len();
        (0..self.nkernels)
            .map(|k| dout[k] * self.inputs.weight[k * ncells + c])
            .sum()
    }

    fn point_grad(&self, b: usize, i: usize, dout: &[f32], dl: &mut [f32]) {
        let scene = &self.inputs.scene;
        let mut dpose = [0.0f32; 7];
        for c in 0..self.cells.len() {
            let p = self.probe(b, i, c);
            let Some(hit) = self.nearest(b, &p) else {
                continue;
            };
            let g = self.dist_grad(dout, c);
            let mut a = [0.0f32; MAX_DIMS];
            for d in 0..self.ndims {
                a[d] = g * hit.grad[d];
            }
            to_local_backward(self.ndims, scene.pose(b, hit.body), &p, &a, dl, &mut dpose);
        }
    }

    /// Weight, bias and pose partial of the flat point rows in `rows`. The
    /// partial holds the weight table, then the bias, then `B×M×pose_len`
    /// pose gradients.
    fn parameter_partial(&self, rows: std::ops::Range<usize>, dout: BatchView<'_, f32>, partial: &mut [f32]) {
        let n = self.inputs.locs.rows();
        let ncells = self.cells.len();
        let nbodies = self.inputs.scene.num_bodies();
        let scene = &self.inputs.scene;
        let (dweight, rest) = partial.split_at_mut(self.inputs.weight.len());
        let (dbias, dposes) = rest.split_at_mut(self.nkernels);
        let mut dp = [0.0f32; MAX_DIMS];
        for flat in rows {
            let (b, i) = (flat / n, flat % n);
            let dout_i = dout.row(b, i);
            for (db, &g) in dbias.iter_mut().zip(dout_i) {
                *db += g;
            }
            for c in 0..ncells {
                let p = self.probe(b, i, c);
                let Some(hit) = self.nearest(b, &p) else {
                    continue;
                };
                for (k, &g) in dout_i.iter().enumerate() {
                    dweight[k * ncells + c] += g * hit.dist;
                }
                let g = self.dist_grad(dout_i, c);
                let mut a = [0.0f32; MAX_DIMS];
                for d in 0..self.ndims {
                    a[d] = g * hit.grad[d];
                }
                let start = (b * nbodies + hit.body) * self.pose_len;
                to_local_backward(
                    self.ndims,
                    scene.pose(b, hit.body),
                    &p,
                    &a,
                    &mut dp,
                    &mut dposes[start..start + self.pose_len],
                );
            }
        }
    }
}

/// SDF convolution forward pass into `out` (`B×N×nkernels`).
///
/// # Errors
/// A scene index outside the atlas, a malformed atlas, mismatched shapes
/// or tables too large for the device's per-block shared memory fail
/// before `out` is written.
pub fn convsdf_forward(
    stream: &Stream,
    inputs: ConvSdfInputs<'_>,
    params: &SdfKernelParams,
    mut out: BatchViewMut<'_, f32>,
) -> Result<()> {
    let start = Instant::now();
    let conv = SdfConv::new(stream, inputs, params)?;
    let n = inputs.locs.rows();
    out.expect_shape("out", Some(inputs.locs.batch()), Some(n), Some(conv.nkernels))?;
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
                    conv.forward_row(flat / n, flat % n, row);
                }
            });
    });

    debug!(
        "convsdf forward: {}x{} points, {} bodies, {} cells, {:.2} ms",
        inputs.locs.batch(),
        n,
        inputs.scene.num_bodies(),
        conv.cells.len(),
        start.elapsed().as_secs_f32() * 1000.0
    );
    Ok(())
}

/// SDF convolution backward pass. Adds the gradients of `Σ dout * out`
/// into `grads`; probes with no body within `max_distance` contribute
/// nothing. Scales receive no gradient.
pub fn convsdf_backward(
    stream: &Stream,
    inputs: ConvSdfInputs<'_>,
    params: &SdfKernelParams,
    dout: BatchView<'_, f32>,
    grads: ConvSdfGrads<'_>,
) -> Result<()> {
    let start = Instant::now();
    let conv = SdfConv::new(stream, inputs, params)?;
    let ConvSdfGrads {
        mut dlocs,
        dweight,
        mut dposes,
        dbias,
    } = grads;
    let batch = inputs.locs.batch();
    let n = inputs.locs.rows();
    let ndims = conv.ndims;
    dout.expect_shape("dout", Some(batch), Some(n), Some(conv.nkernels))?;
    dlocs.expect_shape("dlocs", Some(batch), Some(n), Some(ndims))?;
    dposes.expect_shape(
        "dposes",
        Some(batch),
        Some(inputs.scene.num_bodies()),
        Some(conv.pose_len),
    )?;
    if dweight.len() != inputs.weight.len() {
        return Err(SpnError::shape("dweight", inputs.weight.len(), dweight.len()));
    }
    if let Some(dbias) = &dbias {
        if dbias.len() != conv.nkernels {
            return Err(SpnError::shape("dbias", conv.nkernels, dbias.len()));
        }
    }

    stream.install(|| {
        dlocs
            .as_mut_slice()
            .par_chunks_mut(ndims)
            .enumerate()
            .for_each(|(flat, dl)| {
                let (b, i) = (flat / n, flat % n);
                conv.point_grad(b, i, dout.row(b, i), dl);
            });
    });

    let table = dweight.len();
    let poses = dposes.as_slice().len();
    let mut partial = vec![0.0f32; table + conv.nkernels + poses];
    reduce_blocks(stream, &conv.launch, batch * n, &mut partial, |rows, part| {
        conv.parameter_partial(rows, dout, part)
    });
    for (dw, p) in dweight.iter_mut().zip(&partial[..table]) {
        *dw += p;
    }
    if let Some(dbias) = dbias {
        for (db, p) in dbias.iter_mut().zip(&partial[table..table + conv.nkernels]) {
            *db += p;
        }
    }
    for (dp, p) in dposes
        .as_mut_slice()
        .iter_mut()
        .zip(&partial[table + conv.nkernels..])
    {
        *dp += p;
    }

    debug!(
        "convsdf backward: {}x{} points, {:.2} ms",
        batch,
        n,
        start.elapsed().as_secs_f32() * 1000.0
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    /// Planar SDF `0.6 x - 0.8 y + 0.3` on a 9x9 grid with spacing 0.25.
    /// Multilinear interpolation reproduces it exactly, so its gradient is
    /// smooth everywhere inside the grid box.
    fn plane_sdf() -> Vec<f32> {
        let mut sdfs = Vec::new();
        for ix in 0..9 {
            for iy in 0..9 {
                let (x, y) = (ix as f32 * 0.25, iy as f32 * 0.25);
                sdfs.push(0.6 * x - 0.8 * y + 0.3);
            }
        }
        sdfs
    }

    struct Scene {
        locs: Vec<f32>,
        sdfs: Vec<f32>,
        idxs: Vec<i32>,
        poses: Vec<f32>,
        scales: Vec<f32>,
        weight: Vec<f32>,
        bias: Vec<f32>,
    }

    impl Scene {
        /// Three points well inside body 0; body 1 is far away.
        fn new() -> Self {
            Self {
                locs: vec![0.8, 0.6, 1.2, 1.0, 0.5, 1.3],
                sdfs: plane_sdf(),
                idxs: vec![0, 0],
                poses: vec![0.0, 0.0, 0.3, 10.0, 10.0, 0.0],
                scales: vec![1.0, 0.8],
                weight: (0..18).map(|v| ((v as f32) * 1.3).cos()).collect(),
                bias: vec![0.1, -0.3],
            }
        }

        fn inputs(&self) -> ConvSdfInputs<'_> {
            ConvSdfInputs {
                locs: BatchView::new(&self.locs, 1, 3, 2).unwrap(),
                scene: SdfScene {
                    idxs: BatchView::new(&self.idxs, 1, 2, 1).unwrap(),
                    poses: BatchView::new(&self.poses, 1, 2, 3).unwrap(),
                    scales: BatchView::new(&self.scales, 1, 2, 1).unwrap(),
                },
                atlas: SdfAtlas {
                    sdfs: &self.sdfs,
                    offsets: &[0],
                    shapes: &[9, 9],
                    cell_sizes: &[0.25],
                },
                weight: &self.weight,
                bias: &self.bias,
            }
        }

        fn forward(&self, params: &SdfKernelParams) -> Result<Vec<f32>> {
            let stream = Stream::cpu()?;
            let mut out = vec![0.0f32; 6];
            convsdf_forward(&stream, self.inputs(), params, BatchViewMut::new(&mut out, 1, 3, 2)?)?;
            Ok(out)
        }
    }

    fn params(max_distance: f32) -> SdfKernelParams {
        SdfKernelParams {
            kernel_size: vec![3, 3],
            dilation: vec![0.05, 0.05],
            max_distance,
        }
    }

    #[test]
    fn test_cutoff_leaves_bias() {
        let scene = Scene::new();
        let out = scene.forward(&params(-10.0)).unwrap();
        assert_eq!(out, vec![0.1, -0.3, 0.1, -0.3, 0.1, -0.3]);
    }

    #[test]
    fn test_nearest_body_wins() {
        let mut scene = Scene::new();
        scene.locs = vec![1.0, 0.5, 1.0, 0.5, 1.0, 0.5];
        scene.poses = vec![0.0, 0.0, 0.0, 0.5, 0.0, 0.0];
        scene.scales = vec![1.0, 1.0];
        scene.weight = vec![1.0, -2.0];
        let p = SdfKernelParams {
            kernel_size: vec![1, 1],
            dilation: vec![1.0, 1.0],
            max_distance: 10.0,
        };
        // Body 0 sees (1.0, 0.5) -> 0.5, body 1 sees (0.5, 0.5) -> 0.2.
        let out = scene.forward(&p).unwrap();
        for row in out.chunks(2) {
            assert_relative_eq!(row[0], 0.2 + 0.1, epsilon = 1e-5);
            assert_relative_eq!(row[1], -0.4 - 0.3, epsilon = 1e-5);
        }
    }

    #[test]
    fn test_bad_scene_index_writes_nothing() {
        let mut scene = Scene::new();
        scene.idxs = vec![0, 1];
        let stream = Stream::cpu().unwrap();
        let mut out = vec![5.0f32; 6];
        let result = convsdf_forward(
            &stream,
            scene.inputs(),
            &params(1.0),
            BatchViewMut::new(&mut out, 1, 3, 2).unwrap(),
        );
        assert!(matches!(result, Err(SpnError::InvalidArgument(_))));
        assert_ne!(crate::error::status_code(&result), 0);
        assert_eq!(out, vec![5.0; 6]);
    }

    #[test]
    fn test_backward_matches_finite_differences() {
        let scene = Scene::new();
        let p = params(100.0);
        let dout = vec![0.5f32, -0.8, 1.1, 0.3, -0.6, 0.9];
        let stream = Stream::cpu().unwrap();

        let mut dlocs = vec![0.0f32; 6];
        let mut dweight = vec![0.0f32; 18];
        let mut dposes = vec![0.0f32; 6];
        let mut dbias = vec![0.0f32; 2];
        convsdf_backward(
            &stream,
            scene.inputs(),
            &p,
            BatchView::new(&dout, 1, 3, 2).unwrap(),
            ConvSdfGrads {
                dlocs: BatchViewMut::new(&mut dlocs, 1, 3, 2).unwrap(),
                dweight: &mut dweight,
                dposes: BatchViewMut::new(&mut dposes, 1, 2, 3).unwrap(),
                dbias: Some(&mut dbias),
            },
        )
        .unwrap();
        assert!(dposes[..3].iter().any(|&g| g != 0.0));
        assert_eq!(&dposes[3..], &[0.0; 3]);

        let loss = |s: &Scene| -> f32 {
            s.forward(&p)
                .unwrap()
                .iter()
                .zip(&dout)
                .map(|(o, g)| o * g)
                .sum()
        };
        let eps = 1e-3f32;
        let check = |analytic: &[f32], perturb: &dyn Fn(&mut Scene, usize, f32)| {
            for (idx, &a) in analytic.iter().enumerate() {
                let mut plus = Scene::new();
                perturb(&mut plus, idx, eps);
                let mut minus = Scene::new();
                perturb(&mut minus, idx, -eps);
                let numeric = (loss(&plus) - loss(&minus)) / (2.0 * eps);
                assert_relative_eq!(a, numeric, epsilon = 5e-3, max_relative = 2e-2);
            }
        };
        check(&dlocs, &|s: &mut Scene, i: usize, e: f32| s.locs[i] += e);
        check(&dweight, &|s: &mut Scene, i: usize, e: f32| s.weight[i] += e);
        check(&dposes, &|s: &mut Scene, i: usize, e: f32| s.poses[i] += e);
        check(&dbias, &|s: &mut Scene, i: usize, e: f32| s.bias[i] += e);
    }

    /// Multilinear field on a 5x5x5 grid with spacing 0.5. Trilinear
    /// interpolation reproduces it exactly, so it is smooth across cells.
    fn saddle_sdf() -> Vec<f32> {
        let mut sdfs = Vec::new();
        for ix in 0..5 {
            for iy in 0..5 {
                for iz in 0..5 {
                    let (x, y, z) = (ix as f32 * 0.5, iy as f32 * 0.5, iz as f32 * 0.5);
                    sdfs.push(0.5 * x - 0.4 * y + 0.3 * z + 0.2 * x * y - 0.15 * y * z + 0.1);
                }
            }
        }
        sdfs
    }

    struct RotatedScene {
        locs: Vec<f32>,
        sdfs: Vec<f32>,
        idxs: Vec<i32>,
        poses: Vec<f32>,
        scales: Vec<f32>,
        weight: Vec<f32>,
        bias: Vec<f32>,
    }

    impl RotatedScene {
        /// Body 0 is rotated, scaled by 1.3 and holds all three points well
        /// inside its grid box. Body 1 is far away.
        fn new() -> Self {
            let rotation = glam::Quat::from_axis_angle(glam::Vec3::new(0.3, -0.5, 0.8).normalize(), 0.9);
            let translation = glam::Vec3::new(0.2, -0.1, 0.3);
            let scale = 1.3f32;
            let locs = [
                glam::Vec3::new(0.8, 1.1, 0.9),
                glam::Vec3::new(1.2, 0.75, 1.25),
                glam::Vec3::new(1.0, 1.0, 0.7),
            ]
            .iter()
            .flat_map(|&local| (translation + scale * (rotation * local)).to_array())
            .collect();
            Self {
                locs,
                sdfs: saddle_sdf(),
                idxs: vec![0, 0],
                poses: vec![
                    translation.x,
                    translation.y,
                    translation.z,
                    rotation.x,
                    rotation.y,
                    rotation.z,
                    rotation.w,
                    20.0,
                    20.0,
                    20.0,
                    0.0,
                    0.0,
                    0.0,
                    1.0,
                ],
                scales: vec![scale, 0.7],
                weight: (0..16).map(|v| ((v as f32) * 0.7).sin()).collect(),
                bias: vec![-0.2, 0.4],
            }
        }

        fn inputs(&self) -> ConvSdfInputs<'_> {
            ConvSdfInputs {
                locs: BatchView::new(&self.locs, 1, 3, 3).unwrap(),
                scene: SdfScene {
                    idxs: BatchView::new(&self.idxs, 1, 2, 1).unwrap(),
                    poses: BatchView::new(&self.poses, 1, 2, 7).unwrap(),
                    scales: BatchView::new(&self.scales, 1, 2, 1).unwrap(),
                },
                atlas: SdfAtlas {
                    sdfs: &self.sdfs,
                    offsets: &[0],
                    shapes: &[5, 5, 5],
                    cell_sizes: &[0.5],
                },
                weight: &self.weight,
                bias: &self.bias,
            }
        }

        fn forward(&self, params: &SdfKernelParams) -> Result<Vec<f32>> {
            let stream = Stream::cpu()?;
            let mut out = vec![0.0f32; 6];
            convsdf_forward(&stream, self.inputs(), params, BatchViewMut::new(&mut out, 1, 3, 2)?)?;
            Ok(out)
        }
    }

    #[test]
    fn test_rotated_scaled_backward_matches_finite_differences() {
        let p = SdfKernelParams {
            kernel_size: vec![2, 2, 2],
            dilation: vec![0.1, 0.1, 0.1],
            max_distance: 100.0,
        };
        let dout = vec![0.7f32, -0.4, 0.2, 1.1, -0.9, 0.5];
        let stream = Stream::cpu().unwrap();

        let mut dlocs = vec![0.0f32; 9];
        let mut dweight = vec![0.0f32; 16];
        let mut dposes = vec![0.0f32; 14];
        let mut dbias = vec![0.0f32; 2];
        convsdf_backward(
            &stream,
            RotatedScene::new().inputs(),
            &p,
            BatchView::new(&dout, 1, 3, 2).unwrap(),
            ConvSdfGrads {
                dlocs: BatchViewMut::new(&mut dlocs, 1, 3, 3).unwrap(),
                dweight: &mut dweight,
                dposes: BatchViewMut::new(&mut dposes, 1, 2, 7).unwrap(),
                dbias: Some(&mut dbias),
            },
        )
        .unwrap();
        assert!(dposes[3..7].iter().any(|&g| g != 0.0));
        assert_eq!(&dposes[7..], &[0.0; 7]);

        let loss = |s: &RotatedScene| -> f32 {
            s.forward(&p)
                .unwrap()
                .iter()
                .zip(&dout)
                .map(|(o, g)| o * g)
                .sum()
        };
        let eps = 1e-3f32;
        // Quaternion entries are perturbed off the unit sphere; forward and
        // backward share the same unnormalized rotation.
        let check = |analytic: &[f32], perturb: &dyn Fn(&mut RotatedScene, usize, f32)| {
            for (idx, &a) in analytic.iter().enumerate() {
                let mut plus = RotatedScene::new();
                perturb(&mut plus, idx, eps);
                let mut minus = RotatedScene::new();
                perturb(&mut minus, idx, -eps);
                let numeric = (loss(&plus) - loss(&minus)) / (2.0 * eps);
                assert_relative_eq!(a, numeric, epsilon = 5e-3, max_relative = 2e-2);
            }
        };
        check(&dlocs, &|s: &mut RotatedScene, i: usize, e: f32| s.locs[i] += e);
        check(&dweight, &|s: &mut RotatedScene, i: usize, e: f32| s.weight[i] += e);
        check(&dposes, &|s: &mut RotatedScene, i: usize, e: f32| s.poses[i] += e);
        check(&dbias, &|s: &mut RotatedScene, i: usize, e: f32| s.bias[i] += e);
    }
}
