//! Signed distance field atlas sampling and rigid body transforms.
//!
//! An atlas packs the SDF sub-grids of several objects into one flat
//! buffer. Object `k` occupies `prod(shapes[k])` values starting at
//! `offsets[k]`, row-major with the last axis fastest, and its grid vertex
//! `(ix, iy, iz)` sits at `(ix, iy, iz) * cell_sizes[k]` in the object's own
//! frame.
//!
//! A scene places bodies in the world: body `m` of batch element `b` shows
//! atlas object `idxs[b, m]` under the rigid pose `poses[b, m]` and uniform
//! scale `scales[b, m]`.

use crate::{
    error::{Result, SpnError},
    tensor::BatchView,
    types::MAX_DIMS,
};
use glam::{Mat2, Vec2, Vec3};

/// Pose length for a coordinate dimensionality: `[t]` in 1-D, `[tx, ty,
/// theta]` in 2-D and `[tx, ty, tz, qx, qy, qz, qw]` in 3-D.
pub fn pose_len(ndims: usize) -> Result<usize> {
    match ndims {
        1 => Ok(1),
        2 => Ok(3),
        3 => Ok(7),
        _ => Err(SpnError::InvalidArgument(format!(
            "poses are defined for 1 to 3 dimensions, got {}",
            ndims
        ))),
    }
}

/// Packed SDF sub-grids of every object.
#[derive(Clone, Copy, Debug)]
pub struct SdfAtlas<'a> {
    /// All grids back to back
    pub sdfs: &'a [f32],
    /// First value of each object, `K`
    pub offsets: &'a [u32],
    /// Grid vertices per axis of each object, `K×D`
    pub shapes: &'a [u32],
    /// Vertex spacing of each object, `K`
    pub cell_sizes: &'a [f32],
}

impl SdfAtlas<'_> {
    /// Number of objects in the atlas.
    pub fn len(&self) -> usize {
        self.offsets.len()
    }

    /// Whether the atlas holds no objects.
    pub fn is_empty(&self) -> bool {
        self.offsets.is_empty()
    }

    /// Checks that every object's grid lies inside `sdfs`.
    pub fn validate(&self, ndims: usize) -> Result<()> {
        let k = self.offsets.len();
        if self.shapes.len() != k * ndims {
            return Err(SpnError::shape("sdf_shapes", format!("{}x{}", k, ndims), self.shapes.len()));
        }
        if self.cell_sizes.len() != k {
            return Err(SpnError::shape("sdf_cell_sizes", k, self.cell_sizes.len()));
        }
        for obj in 0..k {
            let shape = self.shape(obj, ndims);
            if shape.iter().any(|&s| s == 0) {
                return Err(SpnError::InvalidArgument(format!(
                    "sdf {} has an empty axis in shape {:?}",
                    obj, shape
                )));
            }
            let size: u64 = shape.iter().map(|&s| s as u64).product();
            let end = self.offsets[obj] as u64 + size;
            if end > self.sdfs.len() as u64 {
                return Err(SpnError::InvalidArgument(format!(
                    "sdf {} spans values up to {} but the atlas holds {}",
                    obj,
                    end,
                    self.sdfs.len()
                )));
            }
            let cell = self.cell_sizes[obj];
            if !(cell.is_finite() && cell > 0.0) {
                return Err(SpnError::InvalidArgument(format!(
                    "sdf {} has cell size {}",
                    obj, cell
                )));
            }
        }
        Ok(())
    }

    #[inline]
    fn shape(&self, obj: usize, ndims: usize) -> &[u32] {
        &self.shapes[obj * ndims..(obj + 1) * ndims]
    }

    /// Distance of object `obj` at `local` (object frame) and its gradient.
    ///
    /// Inside the grid box the value is the multilinear interpolation of the
    /// surrounding vertices. Outside, the value at the nearest point of the
    /// box is extended by the distance to the box.
    pub fn sample(&self, obj: usize, ndims: usize, local: &[f32; MAX_DIMS]) -> (f32, [f32; MAX_DIMS]) {
        let shape = self.shape(obj, ndims);
        let cell = self.cell_sizes[obj];
        let base = self.offsets[obj] as usize;

        let mut lo = [0usize; MAX_DIMS];
        let mut hi = [0usize; MAX_DIMS];
        let mut t = [0.0f32; MAX_DIMS];
        let mut inside = [false; MAX_DIMS];
        let mut excess = [0.0f32; MAX_DIMS];
        for d in 0..ndims {
            let last = (shape[d] - 1) as f32;
            let g = local[d] / cell;
            let clamped = g.clamp(0.0, last);
            inside[d] = g > 0.0 && g < last;
            excess[d] = (g - clamped) * cell;
            let i0 = (clamped.floor() as usize).min((shape[d] as usize).saturating_sub(2));
            lo[d] = i0;
            hi[d] = (i0 + 1).min(shape[d] as usize - 1);
            t[d] = clamped - i0 as f32;
        }

        let mut value = 0.0f32;
        let mut grad = [0.0f32; MAX_DIMS];
        for corner in 0..(1usize << ndims) {
            let mut flat = 0usize;
            let mut weight = 1.0f32;
            for d in 0..ndims {
                let upper = (corner >> (ndims - 1 - d)) & 1 == 1;
                flat = flat * shape[d] as usize + if upper { hi[d] } else { lo[d] };
                weight *= if upper { t[d] } else { 1.0 - t[d] };
            }
            let v = self.sdfs[base + flat];
            value += weight * v;
            for (d, g) in grad.iter_mut().enumerate().take(ndims) {
                if !inside[d] {
                    continue;
                }
                let mut partial = 1.0f32;
                for e in 0..ndims {
                    let upper = (corner >> (ndims - 1 - e)) & 1 == 1;
                    partial *= match (e == d, upper) {
                        (true, true) => 1.0,
                        (true, false) => -1.0,
                        (false, true) => t[e],
                        (false, false) => 1.0 - t[e],
                    };
                }
                *g += partial * v;
            }
        }
        for g in grad.iter_mut().take(ndims) {
            *g /= cell;
        }

        let outside_sq: f32 = excess.iter().map(|e| e * e).sum();
        if outside_sq > 0.0 {
            let outside = outside_sq.sqrt();
            value += outside;
            for d in 0..ndims {
                grad[d] += excess[d] / outside;
            }
        }
        (value, grad)
    }
}

/// Bodies of a scene, `M` per batch element.
#[derive(Clone, Copy, Debug)]
pub struct SdfScene<'a> {
    /// Atlas object shown by each body, `B×M×1`
    pub idxs: BatchView<'a, i32>,
    /// Rigid pose of each body, `B×M×pose_len`
    pub poses: BatchView<'a, f32>,
    /// Uniform scale of each body, `B×M×1`
    pub scales: BatchView<'a, f32>,
}

impl SdfScene<'_> {
    /// Bodies per batch element.
    pub fn num_bodies(&self) -> usize {
        self.idxs.rows()
    }

    /// Checks shapes, atlas indices and scales.
    ///
    /// # Errors
    /// An atlas index outside `[0, K)` is an `InvalidArgument`; it is never
    /// treated as an absent body.
    pub fn validate(&self, batch: usize, ndims: usize, atlas: &SdfAtlas<'_>) -> Result<()> {
        let m = self.idxs.rows();
        self.idxs.expect_shape("idxs", Some(batch), None, Some(1))?;
        self.poses.expect_shape("poses", Some(batch), Some(m), Some(pose_len(ndims)?))?;
        self.scales.expect_shape("scales", Some(batch), Some(m), Some(1))?;
        if let Some(&bad) = self
            .idxs
            .as_slice()
            .iter()
            .find(|&&k| k < 0 || k as usize >= atlas.len())
        {
            return Err(SpnError::InvalidArgument(format!(
                "scene index {} is outside the atlas of {} objects",
                bad,
                atlas.len()
            )));
        }
        if let Some(&bad) = self.scales.as_slice().iter().find(|s| !(s.is_finite() && **s > 0.0)) {
            return Err(SpnError::InvalidArgument(format!(
                "body scales must be positive and finite, got {}",
                bad
            )));
        }
        if self.poses.as_slice().iter().any(|v| !v.is_finite()) {
            return Err(SpnError::InvalidArgument("poses must be finite".to_string()));
        }
        Ok(())
    }

    /// Atlas object of body `(b, m)`.
    #[inline]
    pub fn object(&self, b: usize, m: usize) -> usize {
        self.idxs.row(b, m)[0] as usize
    }

    /// Scale of body `(b, m)`.
    #[inline]
    pub fn scale(&self, b: usize, m: usize) -> f32 {
        self.scales.row(b, m)[0]
    }

    /// Pose of body `(b, m)`.
    #[inline]
    pub fn pose(&self, b: usize, m: usize) -> &[f32] {
        self.poses.row(b, m)
    }
}

/// Maps a world point into a body frame: `R⁻¹ (p - t)`.
///
/// The 3-D rotation `(qx, qy, qz, qw)` must be a unit quaternion. It is used
/// as given; a non-unit quaternion also scales the local point.
pub fn to_local(ndims: usize, pose: &[f32], p: &[f32]) -> [f32; MAX_DIMS] {
    let mut out = [0.0f32; MAX_DIMS];
    match ndims {
        1 => out[0] = p[0] - pose[0],
        2 => {
            let rot = Mat2::from_angle(pose[2]);
            let local = rot.transpose() * Vec2::new(p[0] - pose[0], p[1] - pose[1]);
            out[..2].copy_from_slice(&local.to_array());
        }
        _ => {
            let v = Vec3::new(p[0] - pose[0], p[1] - pose[1], p[2] - pose[2]);
            let u = Vec3::new(pose[3], pose[4], pose[5]);
            let w = pose[6];
            let f = v - 2.0 * w * u.cross(v) + 2.0 * u.dot(v) * u - 2.0 * u.dot(u) * v;
            out = f.to_array();
        }
    }
    out
}

/// Backward of [`to_local`]: given `grad` with respect to the local point,
/// accumulates into `dp` (world point) and `dpose`.
pub fn to_local_backward(
    ndims: usize,
    pose: &[f32],
    p: &[f32],
    grad: &[f32; MAX_DIMS],
    dp: &mut [f32],
    dpose: &mut [f32],
) {
    match ndims {
        1 => {
            dp[0] += grad[0];
            dpose[0] -= grad[0];
        }
        2 => {
            let rot = Mat2::from_angle(pose[2]);
            let local = rot.transpose() * Vec2::new(p[0] - pose[0], p[1] - pose[1]);
            let a = Vec2::new(grad[0], grad[1]);
            let dv = rot * a;
            dp[0] += dv.x;
            dp[1] += dv.y;
            dpose[0] -= dv.x;
            dpose[1] -= dv.y;
            // d(Rᵀv)/dθ = (l.y, -l.x) for l = Rᵀv.
            dpose[2] += a.perp_dot(local);
        }
        _ => {
            let v = Vec3::new(p[0] - pose[0], p[1] - pose[1], p[2] - pose[2]);
            let u = Vec3::new(pose[3], pose[4], pose[5]);
            let w = pose[6];
            let a = Vec3::from_array(*grad);

            let dv = a - 2.0 * w * a.cross(u) + 2.0 * a.dot(u) * u - 2.0 * u.dot(u) * a;
            let dw = -2.0 * a.dot(u.cross(v));
            let du = -2.0 * w * v.cross(a) + 2.0 * u.dot(v) * a + 2.0 * a.dot(u) * v
                - 4.0 * a.dot(v) * u;

            for d in 0..3 {
                dp[d] += dv[d];
                dpose[d] -= dv[d];
                dpose[3 + d] += du[d];
            }
            dpose[6] += dw;
        }
    }
}
