//! Neighborhood operators for learning over unordered point sets.
//!
//! The crate bins points into a uniform hash grid, reorders them so that
//! points of one cell are contiguous, enumerates radius neighbors through
//! the grid and runs two differentiable convolutions on top:
//!
//! - **convsp**: a continuous point convolution whose weights are indexed by
//!   kernel cells placed around each query point;
//! - **convsdf**: a convolution of points against rigid bodies described by
//!   signed distance fields.
//!
//! Every operator takes an explicit [`Stream`] naming the device and
//! thread pool the call runs on, borrows caller-allocated buffers through
//! shaped views, and reports failures as [`SpnError`] values that map onto
//! integer status codes.
//!
//! # Example
//!
//! ```rust,no_run
//! use smooth_particle_ops::{BatchView, CollisionConfig, ParticleCollision, Stream};
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let stream = Stream::cpu()?;
//!
//! // Four 3D points (flat array: x0,y0,z0,x1,y1,z1,...)
//! let points = vec![
//!     0.0, 0.0, 0.0,
//!     0.05, 0.0, 0.0,
//!     0.0, 0.05, 0.0,
//!     1.0, 1.0, 1.0,
//! ];
//! let locs = BatchView::new(&points, 1, 4, 3)?;
//!
//! let collisions = ParticleCollision::new(CollisionConfig {
//!     radius: 0.1,
//!     max_collisions: 8,
//!     ..Default::default()
//! })?;
//! let out = collisions.forward(&stream, locs, None, None)?;
//! println!("Neighbors: {:?}", out.neighbors);
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

// Module declarations
pub mod collision;
pub mod convsdf;
pub mod convsp;
pub mod device;
pub mod error;
pub mod gpu;
pub mod hashgrid;
pub mod kernels;
pub mod pipeline;
mod reduce;
pub mod reorder;
pub mod sdf;
pub mod shaders;
pub mod sort;
pub mod tensor;
pub mod types;

// Re-exports for convenience
pub use collision::{compute_cell_bounds, compute_collisions, Queries, NO_NEIGHBOR};
pub use convsdf::{convsdf_backward, convsdf_forward, ConvSdfGrads, ConvSdfInputs};
pub use convsp::{convsp_backward, convsp_forward, ConvSpGrads, ConvSpInputs};
pub use device::{device_shared_mem, Device, GpuContext, Stream, StreamConfig};
pub use error::{status_code, Result, SpnError, Status};
pub use hashgrid::hashgrid_order;
pub use kernels::{KernelCells, KernelFn};
pub use pipeline::{CollisionOutput, ParticleCollision};
pub use reorder::reorder_data;
pub use sdf::{SdfAtlas, SdfScene};
pub use sort::radixsort_buffer_size;
pub use tensor::{BatchView, BatchViewMut};
pub use types::{CollisionConfig, GridGeometry, KernelParams, LaunchConfig, SdfKernelParams};

/// Library version information.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
