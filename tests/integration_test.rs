//! Integration tests for smooth-particle-ops.
//!
//! These run the operators end to end through the public API: grid order,
//! reorder, neighbor enumeration and both convolutions.

use approx::assert_relative_eq;
use rand::{rngs::StdRng, Rng, SeedableRng};
use smooth_particle_ops::{
    compute_cell_bounds, compute_collisions, convsdf_forward, convsp_backward, convsp_forward,
    hashgrid_order, radixsort_buffer_size, reorder_data, status_code, BatchView, BatchViewMut,
    ConvSdfInputs, ConvSpGrads, ConvSpInputs, GpuContext, GridGeometry, KernelFn, KernelParams,
    Queries, SdfAtlas, SdfKernelParams, SdfScene, Stream,
};

fn random_cloud(rng: &mut StdRng, batch: usize, n: usize, ndims: usize) -> Vec<f32> {
    (0..batch * n * ndims).map(|_| rng.gen_range(-1.0..1.0)).collect()
}

/// Orders a cloud through a fitted grid and returns `(grid, cell_ids, idxs)`.
fn order(stream: &Stream, locs: &[f32], batch: usize, n: usize, ndims: usize, edge: f32) -> (GridGeometry, Vec<u32>, Vec<u32>) {
    let view = BatchView::new(locs, batch, n, ndims).unwrap();
    let grid = GridGeometry::fit(view, edge, 64).unwrap();
    let mut cell_ids = vec![0u32; batch * n];
    let mut idxs = vec![0u32; batch * n];
    let mut buffer = vec![0u32; radixsort_buffer_size(stream, batch, n)];
    hashgrid_order(
        stream,
        view,
        &grid,
        BatchViewMut::new(&mut cell_ids, batch, n, 1).unwrap(),
        BatchViewMut::new(&mut idxs, batch, n, 1).unwrap(),
        &mut buffer,
    )
    .unwrap();
    (grid, cell_ids, idxs)
}

#[test]
fn test_reorder_round_trip_is_exact() {
    let stream = Stream::cpu().unwrap();
    let mut rng = StdRng::seed_from_u64(7);
    let (batch, n) = (3, 200);
    let locs = random_cloud(&mut rng, batch, n, 3);
    let data = random_cloud(&mut rng, batch, n, 5);
    let (_, _, idxs) = order(&stream, &locs, batch, n, 3, 0.1);
    let idxs = BatchView::new(&idxs, batch, n, 1).unwrap();

    let mut nlocs = vec![0.0f32; locs.len()];
    let mut ndata = vec![0.0f32; data.len()];
    reorder_data(
        &stream,
        idxs,
        BatchView::new(&locs, batch, n, 3).unwrap(),
        Some(BatchView::new(&data, batch, n, 5).unwrap()),
        BatchViewMut::new(&mut nlocs, batch, n, 3).unwrap(),
        Some(BatchViewMut::new(&mut ndata, batch, n, 5).unwrap()),
        false,
    )
    .unwrap();

    let mut back_locs = vec![0.0f32; locs.len()];
    let mut back_data = vec![0.0f32; data.len()];
    reorder_data(
        &stream,
        idxs,
        BatchView::new(&nlocs, batch, n, 3).unwrap(),
        Some(BatchView::new(&ndata, batch, n, 5).unwrap()),
        BatchViewMut::new(&mut back_locs, batch, n, 3).unwrap(),
        Some(BatchViewMut::new(&mut back_data, batch, n, 5).unwrap()),
        true,
    )
    .unwrap();

    assert_eq!(back_locs, locs);
    assert_eq!(back_data, data);
}

#[test]
fn test_cell_ranges_partition_points() {
    let stream = Stream::cpu().unwrap();
    let mut rng = StdRng::seed_from_u64(11);
    let (batch, n) = (2, 500);
    let locs = random_cloud(&mut rng, batch, n, 3);
    let (grid, cell_ids, _) = order(&stream, &locs, batch, n, 3, 0.2);

    let table = grid.max_ncells(batch);
    let mut starts = vec![0u32; batch * table];
    let mut ends = vec![0u32; batch * table];
    compute_cell_bounds(
        &grid,
        BatchView::new(&cell_ids, batch, n, 1).unwrap(),
        &mut BatchViewMut::new(&mut starts, batch, table, 1).unwrap(),
        &mut BatchViewMut::new(&mut ends, batch, table, 1).unwrap(),
    )
    .unwrap();

    for b in 0..batch {
        let mut covered = vec![0u32; n];
        for c in 0..table {
            for i in starts[b * table + c]..ends[b * table + c] {
                covered[i as usize] += 1;
                assert_eq!(cell_ids[b * n + i as usize], c as u32);
            }
        }
        assert!(covered.iter().all(|&k| k == 1));
    }
}

#[test]
fn test_line_neighbors() {
    let stream = Stream::cpu().unwrap();
    // Five points, spacing 1; radius 1.5 reaches exactly the adjacent points.
    let locs = vec![0.0f32, 1.0, 2.0, 3.0, 4.0];
    let (grid, cell_ids, idxs) = order(&stream, &locs, 1, 5, 1, 1.5);
    let mut sorted = vec![0.0f32; 5];
    reorder_data(
        &stream,
        BatchView::new(&idxs, 1, 5, 1).unwrap(),
        BatchView::new(&locs, 1, 5, 1).unwrap(),
        None,
        BatchViewMut::new(&mut sorted, 1, 5, 1).unwrap(),
        None,
        false,
    )
    .unwrap();

    let table = grid.max_ncells(1);
    let mut starts = vec![0u32; table];
    let mut ends = vec![0u32; table];
    let mut collisions = vec![0i32; 5 * 4];
    compute_collisions(
        &stream,
        Queries::Source,
        BatchView::new(&sorted, 1, 5, 1).unwrap(),
        &grid,
        BatchView::new(&cell_ids, 1, 5, 1).unwrap(),
        BatchViewMut::new(&mut starts, 1, table, 1).unwrap(),
        BatchViewMut::new(&mut ends, 1, table, 1).unwrap(),
        BatchViewMut::new(&mut collisions, 1, 5, 4).unwrap(),
        1.5,
        false,
    )
    .unwrap();

    for i in 0..5 {
        let me = idxs[i] as i32;
        let mut found: Vec<i32> = collisions[i * 4..(i + 1) * 4]
            .iter()
            .filter(|&&j| j >= 0)
            .map(|&j| idxs[j as usize] as i32)
            .collect();
        found.sort();
        let expected: Vec<i32> = [me - 1, me + 1].into_iter().filter(|j| (0..5).contains(j)).collect();
        assert_eq!(found, expected, "point {}", me);
    }
}

#[test]
fn test_truncation_is_deterministic() {
    let stream = Stream::cpu().unwrap();
    let mut rng = StdRng::seed_from_u64(3);
    let n = 400;
    let locs: Vec<f32> = (0..n * 2).map(|_| rng.gen_range(0.0..0.5)).collect();
    let (grid, cell_ids, idxs) = order(&stream, &locs, 1, n, 2, 0.25);
    let mut sorted = vec![0.0f32; locs.len()];
    reorder_data(
        &stream,
        BatchView::new(&idxs, 1, n, 1).unwrap(),
        BatchView::new(&locs, 1, n, 2).unwrap(),
        None,
        BatchViewMut::new(&mut sorted, 1, n, 2).unwrap(),
        None,
        false,
    )
    .unwrap();

    let run = || {
        let table = grid.max_ncells(1);
        let mut starts = vec![0u32; table];
        let mut ends = vec![0u32; table];
        let mut collisions = vec![0i32; n * 6];
        compute_collisions(
            &stream,
            Queries::Source,
            BatchView::new(&sorted, 1, n, 2).unwrap(),
            &grid,
            BatchView::new(&cell_ids, 1, n, 1).unwrap(),
            BatchViewMut::new(&mut starts, 1, table, 1).unwrap(),
            BatchViewMut::new(&mut ends, 1, table, 1).unwrap(),
            BatchViewMut::new(&mut collisions, 1, n, 6).unwrap(),
            0.25,
            true,
        )
        .unwrap();
        collisions
    };
    let first = run();
    assert!(first.iter().all(|&j| j >= 0), "every row should be full");
    assert_eq!(first, run());
}

#[test]
fn test_convsp_zero_neighbors_and_gradients() {
    let stream = Stream::cpu().unwrap();
    let mut rng = StdRng::seed_from_u64(19);
    let (m, n, nch, nk) = (4, 6, 3, 2);
    let qlocs = random_cloud(&mut rng, 1, m, 2);
    let locs: Vec<f32> = qlocs
        .iter()
        .cycle()
        .take(n * 2)
        .map(|v| v + rng.gen_range(-0.2..0.2))
        .collect();
    let data = random_cloud(&mut rng, 1, n, nch);
    let params = KernelParams {
        radius: 0.8,
        kernel_size: vec![2, 2],
        dilation: vec![0.1, 0.1],
        dis_norm: true,
        kernel_fn: KernelFn::Poly6,
    };
    let weight = random_cloud(&mut rng, 1, nk * 4, nch);
    let bias = vec![0.25f32, -0.5];
    // The last query has no neighbors.
    let neighbors = vec![0, 4, -1, 1, 5, 2, 2, -1, -1, -1, -1, -1];

    let inputs = |qlocs: &[f32], locs: &[f32], data: &[f32], weight: &[f32]| -> Vec<f32> {
        let mut out = vec![0.0f32; m * nk];
        convsp_forward(
            &stream,
            ConvSpInputs {
                qlocs: BatchView::new(qlocs, 1, m, 2).unwrap(),
                locs: BatchView::new(locs, 1, n, 2).unwrap(),
                data: BatchView::new(data, 1, n, nch).unwrap(),
                neighbors: BatchView::new(&neighbors, 1, m, 3).unwrap(),
                weight,
                bias: &bias,
            },
            &params,
            BatchViewMut::new(&mut out, 1, m, nk).unwrap(),
        )
        .unwrap();
        out
    };

    let out = inputs(&qlocs, &locs, &data, &weight);
    assert_eq!(&out[6..], &bias[..]);
    assert!(out.iter().all(|v| v.is_finite()));

    let dout: Vec<f32> = (0..m * nk).map(|_| rng.gen_range(-1.0..1.0)).collect();
    let mut dqlocs = vec![0.0f32; m * 2];
    let mut dlocs = vec![0.0f32; n * 2];
    let mut ddata = vec![0.0f32; n * nch];
    let mut dweight = vec![0.0f32; weight.len()];
    convsp_backward(
        &stream,
        ConvSpInputs {
            qlocs: BatchView::new(&qlocs, 1, m, 2).unwrap(),
            locs: BatchView::new(&locs, 1, n, 2).unwrap(),
            data: BatchView::new(&data, 1, n, nch).unwrap(),
            neighbors: BatchView::new(&neighbors, 1, m, 3).unwrap(),
            weight: &weight,
            bias: &bias,
        },
        &params,
        BatchView::new(&dout, 1, m, nk).unwrap(),
        ConvSpGrads {
            dqlocs: BatchViewMut::new(&mut dqlocs, 1, m, 2).unwrap(),
            dlocs: BatchViewMut::new(&mut dlocs, 1, n, 2).unwrap(),
            ddata: BatchViewMut::new(&mut ddata, 1, n, nch).unwrap(),
            dweight: &mut dweight,
            dbias: None,
        },
    )
    .unwrap();

    let loss = |out: Vec<f32>| -> f32 { out.iter().zip(&dout).map(|(o, g)| o * g).sum() };
    let eps = 1e-3f32;
    let fd = |which: usize, idx: usize| -> f32 {
        let mut bufs = [qlocs.clone(), locs.clone(), data.clone(), weight.clone()];
        bufs[which][idx] += eps;
        let plus = loss(inputs(&bufs[0], &bufs[1], &bufs[2], &bufs[3]));
        bufs[which][idx] -= 2.0 * eps;
        let minus = loss(inputs(&bufs[0], &bufs[1], &bufs[2], &bufs[3]));
        (plus - minus) / (2.0 * eps)
    };
    for (which, analytic) in [&dqlocs, &dlocs, &ddata, &dweight].into_iter().enumerate() {
        for (idx, &a) in analytic.iter().enumerate() {
            assert_relative_eq!(a, fd(which, idx), epsilon = 3e-3, max_relative = 2e-2);
        }
    }
}

#[test]
fn test_convsdf_bad_scene_index_reports_status() {
    let stream = Stream::cpu().unwrap();
    let locs = vec![0.5f32, 0.5];
    let sdfs = vec![0.0f32; 4];
    let idxs = vec![2i32];
    let poses = vec![0.0f32; 3];
    let scales = vec![1.0f32];
    let weight = vec![1.0f32];
    let bias = vec![0.0f32];
    let mut out = vec![-1.0f32];
    let result = convsdf_forward(
        &stream,
        ConvSdfInputs {
            locs: BatchView::new(&locs, 1, 1, 2).unwrap(),
            scene: SdfScene {
                idxs: BatchView::new(&idxs, 1, 1, 1).unwrap(),
                poses: BatchView::new(&poses, 1, 1, 3).unwrap(),
                scales: BatchView::new(&scales, 1, 1, 1).unwrap(),
            },
            atlas: SdfAtlas {
                sdfs: &sdfs,
                offsets: &[0],
                shapes: &[2, 2],
                cell_sizes: &[1.0],
            },
            weight: &weight,
            bias: &bias,
        },
        &SdfKernelParams {
            kernel_size: vec![1, 1],
            dilation: vec![1.0, 1.0],
            max_distance: 1.0,
        },
        BatchViewMut::new(&mut out, 1, 1, 1).unwrap(),
    );
    assert_ne!(status_code(&result), 0);
    assert_eq!(out, vec![-1.0]);
}

#[tokio::test]
async fn test_gpu_order_matches_cpu() {
    let Some(gpu) = GpuContext::new().await.ok() else {
        // No adapter on this machine.
        return;
    };
    let gpu_stream = Stream::gpu(gpu).unwrap();
    let cpu_stream = Stream::cpu().unwrap();

    let mut rng = StdRng::seed_from_u64(5);
    let (batch, n) = (2, 1000);
    // Keep points off cell boundaries so both devices agree exactly.
    let locs: Vec<f32> = (0..batch * n * 3)
        .map(|_| rng.gen_range(0..16) as f32 * 0.125 + 0.0625)
        .collect();
    let grid = GridGeometry::new(vec![0.0; 3], vec![16; 3], 3, 0.125).unwrap();

    let run = |stream: &Stream| {
        let mut cell_ids = vec![0u32; batch * n];
        let mut idxs = vec![0u32; batch * n];
        let mut buffer = vec![0u32; radixsort_buffer_size(stream, batch, n)];
        hashgrid_order(
            stream,
            BatchView::new(&locs, batch, n, 3).unwrap(),
            &grid,
            BatchViewMut::new(&mut cell_ids, batch, n, 1).unwrap(),
            BatchViewMut::new(&mut idxs, batch, n, 1).unwrap(),
            &mut buffer,
        )
        .unwrap();
        (cell_ids, idxs)
    };
    let (gpu_cells, gpu_idxs) = run(&gpu_stream);
    let (cpu_cells, cpu_idxs) = run(&cpu_stream);
    assert_eq!(gpu_cells, cpu_cells);
    // Both sorts are stable, so the permutations agree, not just the keys.
    assert_eq!(gpu_idxs, cpu_idxs);
    for b in 0..batch {
        let cells = &gpu_cells[b * n..(b + 1) * n];
        assert!(cells.windows(2).all(|w| w[0] <= w[1]));
        let mut seen = gpu_idxs[b * n..(b + 1) * n].to_vec();
        seen.sort_unstable();
        assert_eq!(seen, (0..n as u32).collect::<Vec<_>>());
    }
}

#[tokio::test]
async fn test_gpu_reports_out_of_range_like_cpu() {
    let Some(gpu) = GpuContext::new().await.ok() else {
        return;
    };
    let gpu_stream = Stream::gpu(gpu).unwrap();
    let cpu_stream = Stream::cpu().unwrap();
    let grid = GridGeometry::new(vec![0.0, 0.0], vec![4, 4], 2, 1.0).unwrap();
    let locs = vec![0.5, 0.5, 3.5, 0.5, 1.5, 6.5, 0.5, 3.5];

    let run = |stream: &Stream| {
        let mut cell_ids = vec![0u32; 4];
        let mut idxs = vec![0u32; 4];
        let mut buffer = vec![0u32; radixsort_buffer_size(stream, 1, 4)];
        let result = hashgrid_order(
            stream,
            BatchView::new(&locs, 1, 4, 2).unwrap(),
            &grid,
            BatchViewMut::new(&mut cell_ids, 1, 4, 1).unwrap(),
            BatchViewMut::new(&mut idxs, 1, 4, 1).unwrap(),
            &mut buffer,
        );
        status_code(&result)
    };
    assert_eq!(run(&gpu_stream), run(&cpu_stream));
    assert_ne!(run(&gpu_stream), 0);
}
