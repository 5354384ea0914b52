//! Basic example demonstrating smooth-particle-ops usage.
//!
//! This example finds the radius neighbors of a small 3D point cloud and runs
//! one point convolution over them, using the GPU for cell binning when one
//! is available.

use anyhow::Result;
use smooth_particle_ops::{
    convsp_forward, BatchView, BatchViewMut, CollisionConfig, ConvSpInputs, GpuContext, KernelFn,
    KernelParams, ParticleCollision, Stream, NO_NEIGHBOR,
};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    env_logger::init();

    println!("Initializing stream...");
    let stream = match GpuContext::new().await {
        Ok(gpu) => {
            println!("Using GPU: {}", gpu.device_description());
            Stream::gpu(gpu)?
        }
        Err(e) => {
            println!("No GPU available ({}), falling back to CPU", e);
            Stream::cpu()?
        }
    };

    // Two clusters of four points each
    let points = vec![
        // Cluster A
        0.00, 0.00, 0.00, // Point 0
        0.05, 0.00, 0.00, // Point 1
        0.00, 0.05, 0.00, // Point 2
        0.00, 0.00, 0.05, // Point 3
        // Cluster B
        1.00, 1.00, 1.00, // Point 4
        1.05, 1.00, 1.00, // Point 5
        1.00, 1.05, 1.00, // Point 6
        1.00, 1.00, 1.05, // Point 7
    ];
    // One channel per point: its original index
    let data: Vec<f32> = (0..8).map(|i| i as f32).collect();

    let num_points = points.len() / 3;
    println!("\nFinding neighbors for {} points...", num_points);

    let pipeline = ParticleCollision::new(CollisionConfig {
        radius: 0.1,
        max_collisions: 4,
        include_self: false,
        ..Default::default()
    })?;
    let locs = BatchView::new(&points, 1, num_points, 3)?;
    let data_view = BatchView::new(&data, 1, num_points, 1)?;
    let sorted = pipeline.forward(&stream, locs, Some(data_view), None)?;

    println!("\nNeighbors (sorted order):");
    println!("=========================");
    let width = pipeline.config.max_collisions;
    for (i, row) in sorted.neighbors.chunks(width).enumerate() {
        let found: Vec<i32> = row.iter().copied().take_while(|&j| j != NO_NEIGHBOR).collect();
        println!(
            "Point {} (original {}): neighbors {:?}",
            i, sorted.idxs[i], found
        );
    }

    // A 1x1x1 kernel table with a single output: a smoothed sum of neighbor data
    let params = KernelParams {
        radius: 0.1,
        kernel_size: vec![1, 1, 1],
        dilation: vec![0.0, 0.0, 0.0],
        dis_norm: true,
        kernel_fn: KernelFn::Poly6,
    };
    let weight = vec![1.0f32];
    let bias = vec![0.0f32];
    let inputs = ConvSpInputs {
        qlocs: sorted.locs_view()?,
        locs: sorted.locs_view()?,
        data: sorted.data_view()?,
        neighbors: sorted.neighbors_view()?,
        weight: &weight,
        bias: &bias,
    };
    let mut out = vec![0.0f32; num_points];
    convsp_forward(&stream, inputs, &params, BatchViewMut::new(&mut out, 1, num_points, 1)?)?;

    // Back to the caller's order
    let mut unsorted = vec![0.0f32; num_points];
    sorted.unsort(
        &stream,
        BatchView::new(&out, 1, num_points, 1)?,
        BatchViewMut::new(&mut unsorted, 1, num_points, 1)?,
    )?;

    println!("\nSmoothed neighbor data:");
    println!("=======================");
    for (i, value) in unsorted.iter().enumerate() {
        println!("Point {}: {:.4}", i, value);
    }

    Ok(())
}
