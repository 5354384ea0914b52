//! Error types for the smooth-particle-ops library.
//!
//! Every operator returns a [`Result`]. Hosts that need the flat integer
//! status convention can map any result through [`status_code`].

use thiserror::Error;

/// Main error type for the smooth-particle-ops library.
#[derive(Error, Debug)]
pub enum SpnError {
    /// A tensor's buffer length or shape disagrees with the call's shape contract.
    #[error("Invalid shape for `{tensor}`: expected {expected}, got {actual}")]
    InvalidShape {
        /// Name of the offending tensor
        tensor: &'static str,
        /// Expected shape description
        expected: String,
        /// Actual shape description
        actual: String,
    },

    /// An index read from an input tensor points outside its target.
    #[error("Index out of range in `{tensor}`: {index} >= {bound}")]
    IndexOutOfRange {
        /// Name of the tensor holding the index
        tensor: &'static str,
        /// The offending index
        index: i64,
        /// Exclusive upper bound
        bound: usize,
    },

    /// A point fell outside the hash grid; `low`/`grid_dims` do not cover the data.
    #[error("Point {point} of batch {batch} falls outside the grid (axis {axis}, cell {cell}, dims {dim})")]
    CellOutOfRange {
        /// Batch element
        batch: usize,
        /// Point index inside the batch element
        point: usize,
        /// Axis on which the cell coordinate escaped
        axis: usize,
        /// Computed cell coordinate
        cell: i64,
        /// Number of cells along that axis
        dim: u32,
    },

    /// A scalar parameter, selector or scene entry is invalid.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// The per-block shared memory cannot hold the tables a launch must stage.
    #[error("Insufficient shared memory: launch needs {required} bytes, device offers {available}")]
    InsufficientSharedMemory {
        /// Bytes the launch needs per block
        required: usize,
        /// Bytes the device offers per block
        available: usize,
    },

    /// Error occurred during GPU device initialization or adapter selection.
    #[error("GPU initialization failed: {0}")]
    GpuInitError(String),

    /// Error occurred during shader compilation or pipeline creation.
    #[error("Shader compilation failed: {0}")]
    ShaderError(String),

    /// Error occurred during buffer creation or memory allocation.
    #[error("Buffer allocation failed: {0}")]
    BufferError(String),

    /// Error occurred during compute pass execution.
    #[error("Compute execution failed: {0}")]
    ComputeError(String),

    /// Invalid input data provided to an operator.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Error occurred during data transfer between CPU and GPU.
    #[error("Data transfer failed: {0}")]
    TransferError(String),

    /// The requested operation is not supported on the current configuration.
    #[error("Operation not supported: {0}")]
    NotSupported(String),

    /// Generic wgpu error wrapper.
    #[error("wgpu error: {0}")]
    WgpuError(#[from] wgpu::Error),

    /// Error occurred during buffer mapping operations.
    #[error("Buffer mapping failed: {0}")]
    BufferMapError(#[from] wgpu::BufferAsyncError),
}

/// Result type alias for operations that may fail with a SpnError.
pub type Result<T> = std::result::Result<T, SpnError>;

/// Integer status codes reported to hosts that drive the operators through a
/// flat call surface. `Success` is always `0`.
#[repr(i32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Status {
    /// The call completed.
    Success = 0,
    /// A tensor had the wrong shape.
    InvalidShape = 1,
    /// An index (cell, neighbor, permutation, scene) was out of range.
    OutOfRange = 2,
    /// A parameter or selector was invalid.
    InvalidArgument = 3,
    /// The launch did not fit the device's shared memory.
    InsufficientSharedMemory = 4,
    /// The device failed.
    DeviceFailure = 5,
    /// Allocation or host/device transfer failed.
    AllocationFailure = 6,
}

impl SpnError {
    /// Classifies this error into its status kind.
    pub fn status(&self) -> Status {
        match self {
            SpnError::InvalidShape { .. } => Status::InvalidShape,
            SpnError::IndexOutOfRange { .. } | SpnError::CellOutOfRange { .. } => {
                Status::OutOfRange
            }
            SpnError::InvalidArgument(_) | SpnError::InvalidInput(_) => Status::InvalidArgument,
            SpnError::InsufficientSharedMemory { .. } => Status::InsufficientSharedMemory,
            SpnError::GpuInitError(_)
            | SpnError::ShaderError(_)
            | SpnError::ComputeError(_)
            | SpnError::NotSupported(_)
            | SpnError::WgpuError(_) => Status::DeviceFailure,
            SpnError::BufferError(_) | SpnError::TransferError(_) | SpnError::BufferMapError(_) => {
                Status::AllocationFailure
            }
        }
    }

    /// The non-zero integer status code for this error.
    pub fn status_code(&self) -> i32 {
        self.status() as i32
    }

    pub(crate) fn shape(tensor: &'static str, expected: impl ToString, actual: impl ToString) -> Self {
        SpnError::InvalidShape {
            tensor,
            expected: expected.to_string(),
            actual: actual.to_string(),
        }
    }
}

/// Maps an operator result to its integer status code (`0` on success).
pub fn status_code<T>(result: &Result<T>) -> i32 {
    match result {
        Ok(_) => Status::Success as i32,
        Err(err) => err.status_code(),
    }
}

/// Validation error types for point coordinates.
#[derive(Error, Debug)]
pub enum ValidationError {
    /// Point coordinates contain NaN or infinity.
    #[error("Points contain invalid values at index {0}")]
    InvalidValues(usize),
}

impl From<ValidationError> for SpnError {
    fn from(err: ValidationError) -> Self {
        SpnError::InvalidInput(err.to_string())
    }
}
