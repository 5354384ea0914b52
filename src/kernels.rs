//! Smoothing kernels and kernel-cell layout.
//!
//! A convolution's weight table has one row per kernel cell. Each cell sits
//! at a fixed offset from the query point; a neighbor contributes to a cell
//! in proportion to a smoothing kernel evaluated at its distance from that
//! offset point. Because the kernels are continuous in distance, gradients
//! with respect to positions are well defined for every selector except
//! [`KernelFn::Constant`], which is a hard in/out bin.

use crate::error::{Result, SpnError};
use crate::types::MAX_DIMS;

/// Kernel-function selector.
#[repr(i32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum KernelFn {
    /// `(1 - (d/h)²)³`
    #[default]
    Poly6 = 0,
    /// `(1 - d/h)³`
    Spiky = 1,
    /// `1 - d/h`
    Linear = 2,
    /// `exp(-4.5 (d/h)²)`, truncated at `h`
    Gaussian = 3,
    /// `1` inside the support. Zero position gradient everywhere.
    Constant = 4,
}

impl TryFrom<i32> for KernelFn {
    type Error = SpnError;

    fn try_from(value: i32) -> Result<Self> {
        match value {
            0 => Ok(KernelFn::Poly6),
            1 => Ok(KernelFn::Spiky),
            2 => Ok(KernelFn::Linear),
            3 => Ok(KernelFn::Gaussian),
            4 => Ok(KernelFn::Constant),
            other => Err(SpnError::InvalidArgument(format!(
                "unknown kernel_fn selector {}",
                other
            ))),
        }
    }
}

const GAUSSIAN_FALLOFF: f32 = 4.5;

impl KernelFn {
    /// Kernel value at distance `d` for support radius `h`.
    #[inline]
    pub fn value(self, d: f32, h: f32) -> f32 {
        if d >= h {
            return 0.0;
        }
        let x = d / h;
        match self {
            KernelFn::Poly6 => {
                let t = 1.0 - x * x;
                t * t * t
            }
            KernelFn::Spiky => {
                let t = 1.0 - x;
                t * t * t
            }
            KernelFn::Linear => 1.0 - x,
            KernelFn::Gaussian => (-GAUSSIAN_FALLOFF * x * x).exp(),
            KernelFn::Constant => 1.0,
        }
    }

    /// Derivative of [`value`](Self::value) with respect to `d`.
    #[inline]
    pub fn derivative(self, d: f32, h: f32) -> f32 {
        if d >= h {
            return 0.0;
        }
        let x = d / h;
        match self {
            KernelFn::Poly6 => {
                let t = 1.0 - x * x;
                -6.0 * x * t * t / h
            }
            KernelFn::Spiky => {
                let t = 1.0 - x;
                -3.0 * t * t / h
            }
            KernelFn::Linear => -1.0 / h,
            KernelFn::Gaussian => -2.0 * GAUSSIAN_FALLOFF * x * (-GAUSSIAN_FALLOFF * x * x).exp() / h,
            KernelFn::Constant => 0.0,
        }
    }

    /// Whether this kernel produces non-zero position gradients.
    pub fn has_position_gradient(self) -> bool {
        !matches!(self, KernelFn::Constant)
    }
}

/// Offsets of every kernel cell, row-major with the last axis fastest.
#[derive(Clone, Debug)]
pub struct KernelCells {
    ndims: usize,
    offsets: Vec<[f32; MAX_DIMS]>,
}

impl KernelCells {
    /// Lays out `prod(kernel_size)` cells; cell index `idx` along an axis sits
    /// at `(idx - (size - 1) / 2) * dilation`.
    pub fn new(kernel_size: &[u32], dilation: &[f32]) -> Result<Self> {
        let ndims = kernel_size.len();
        if ndims == 0 || ndims > MAX_DIMS {
            return Err(SpnError::InvalidArgument(format!(
                "kernel_size must have 1..={} entries, got {}",
                MAX_DIMS, ndims
            )));
        }
        if dilation.len() != ndims {
            return Err(SpnError::shape("dilation", ndims, dilation.len()));
        }
        if kernel_size.iter().any(|&k| k == 0) {
            return Err(SpnError::InvalidArgument(
                "kernel_size entries must be positive".to_string(),
            ));
        }
        if dilation.iter().any(|d| !d.is_finite()) {
            return Err(SpnError::InvalidArgument(
                "dilation must be finite".to_string(),
            ));
        }

        let ncells: usize = kernel_size.iter().map(|&k| k as usize).product();
        let mut offsets = Vec::with_capacity(ncells);
        let mut idx = [0u32; MAX_DIMS];
        for _ in 0..ncells {
            let mut offset = [0.0f32; MAX_DIMS];
            for d in 0..ndims {
                let center = (kernel_size[d] as f32 - 1.0) * 0.5;
                offset[d] = (idx[d] as f32 - center) * dilation[d];
            }
            offsets.push(offset);

            // Odometer increment, last axis fastest.
            for d in (0..ndims).rev() {
                idx[d] += 1;
                if idx[d] < kernel_size[d] {
                    break;
                }
                idx[d] = 0;
            }
        }

        Ok(Self { ndims, offsets })
    }

    /// Number of kernel cells.
    #[inline]
    pub fn len(&self) -> usize {
        self.offsets.len()
    }

    /// Always false; a kernel has at least one cell.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.offsets.is_empty()
    }

    /// Dimensionality of the offsets.
    #[inline]
    pub fn ndims(&self) -> usize {
        self.ndims
    }

    /// Offset of cell `c`; only the first `ndims` entries are meaningful.
    #[inline]
    pub fn offset(&self, c: usize) -> &[f32; MAX_DIMS] {
        &self.offsets[c]
    }
}
