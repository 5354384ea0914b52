//! wgpu implementation of the hash-grid ordering.
//!
//! Positions, per-batch grid corners and cell counts are uploaded, one
//! invocation per point computes its row-major cell ID and seeds its sort
//! value, and a radix sort on the device orders the `(cellID, index)` pairs
//! of every batch element. The sorted pairs are read back together with a
//! status word holding the first point that fell outside the grid.

use crate::{
    device::GpuContext,
    error::{Result, SpnError},
    shaders::{CompiledShaders, ShaderSources},
    sort::{key_bits, GpuSortLayout, GPU_SORT_BLOCK},
    tensor::BatchView,
    types::GridGeometry,
};
use bytemuck::{cast_slice, Pod, Zeroable};
use log::debug;
use std::time::Instant;
use wgpu::util::DeviceExt;

/// Cell ID the shader writes for points outside the grid.
pub const OUT_OF_RANGE_CELL: u32 = u32::MAX;

const WORKGROUP_SIZE: u32 = 256;
const SCAN_WORKGROUP_SIZE: u32 = 64;

/// Uniform block matching `Params` in `hashgrid.wgsl`.
#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
struct HashgridParams {
    batch_size: u32,
    num_points: u32,
    ndims: u32,
    _pad0: u32,
    cell_edge: f32,
    _pad1: [f32; 3],
}

/// Uniform block matching `Params` in `hashgrid_sort.wgsl`.
#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
struct SortParams {
    batch_size: u32,
    num_points: u32,
    blocks_per_segment: u32,
    bit: u32,
}

/// Sorted pairs produced by the GPU passes.
#[derive(Clone, Debug)]
pub struct GpuOrder {
    /// Cell IDs in sorted order, `B×N`
    pub cell_ids: Vec<u32>,
    /// Index inside the batch element of every sorted point, `B×N`
    pub idxs: Vec<u32>,
    /// Flat index of the first point outside the grid, if any
    pub first_out_of_range: Option<usize>,
}

/// Compute pipelines for hash-grid ordering, built once per stream.
pub struct GpuHashgrid {
    context: GpuContext,
    cell_ids: wgpu::ComputePipeline,
    radix_count: wgpu::ComputePipeline,
    radix_block_scan: wgpu::ComputePipeline,
    radix_scatter: wgpu::ComputePipeline,
}

impl GpuHashgrid {
    /// Compiles the hash-grid shaders for `context`.
    pub fn new(context: GpuContext) -> Result<Self> {
        let shaders = CompiledShaders::compile(&context.device, &ShaderSources::default())?;
        let device = &context.device;
        let cell_ids = create_pipeline(
            device,
            "Hashgrid Cell ID Pipeline",
            &shaders.hashgrid,
            "compute_cell_ids",
        );
        let sort = &shaders.hashgrid_sort;
        let radix_count = create_pipeline(device, "Radix Count Pipeline", sort, "radix_count");
        let radix_block_scan =
            create_pipeline(device, "Radix Block Scan Pipeline", sort, "radix_block_scan");
        let radix_scatter = create_pipeline(device, "Radix Scatter Pipeline", sort, "radix_scatter");

        debug!("Built hash-grid pipelines on {}", context.device_description());
        Ok(Self {
            context,
            cell_ids,
            radix_count,
            radix_block_scan,
            radix_scatter,
        })
    }

    /// Assigns every point of `locs` (`B×N×D`) to its cell and sorts the
    /// `(cellID, index)` pairs of each batch element by cell.
    pub async fn order(&self, locs: BatchView<'_, f32>, grid: &GridGeometry) -> Result<GpuOrder> {
        let start = Instant::now();
        let batch = locs.batch();
        let num_points = locs.rows();
        let ndims = locs.cols();
        let total = batch * num_points;
        if total == 0 {
            return Ok(GpuOrder {
                cell_ids: Vec::new(),
                idxs: Vec::new(),
                first_out_of_range: None,
            });
        }

        let layout = GpuSortLayout::new(batch, num_points);
        let blocks_per_segment = layout.blocks_per_segment();
        let limits = &self.context.limits;
        let workgroups = (total as u64).div_ceil(WORKGROUP_SIZE as u64);
        let max_groups = limits.max_compute_workgroups_per_dimension as u64;
        for (what, groups) in [
            ("points", workgroups),
            ("sort blocks per batch element", blocks_per_segment as u64),
            ("batch elements", batch as u64),
        ] {
            if groups > max_groups {
                return Err(SpnError::NotSupported(format!(
                    "{} need {} workgroups along one axis, device allows {}",
                    what, groups, max_groups
                )));
            }
        }
        let locs_bytes = std::mem::size_of_val(locs.as_slice()) as u64;
        if locs_bytes > limits.max_storage_buffer_binding_size as u64 {
            return Err(SpnError::NotSupported(format!(
                "positions need {} bytes, storage bindings allow {}",
                locs_bytes, limits.max_storage_buffer_binding_size
            )));
        }

        let low: Vec<f32> = (0..batch).flat_map(|b| grid.low(b).to_vec()).collect();
        let dims: Vec<u32> = (0..batch).flat_map(|b| grid.dims(b).to_vec()).collect();
        let params = HashgridParams {
            batch_size: batch as u32,
            num_points: num_points as u32,
            ndims: ndims as u32,
            _pad0: 0,
            cell_edge: grid.cell_edge,
            _pad1: [0.0; 3],
        };

        let device = &self.context.device;
        let locs_buffer = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("Hashgrid Locs"),
            contents: cast_slice(locs.as_slice()),
            usage: wgpu::BufferUsages::STORAGE,
        });
        let low_buffer = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("Hashgrid Low"),
            contents: cast_slice(&low),
            usage: wgpu::BufferUsages::STORAGE,
        });
        let dims_buffer = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("Hashgrid Dims"),
            contents: cast_slice(&dims),
            usage: wgpu::BufferUsages::STORAGE,
        });
        let status_buffer = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("Hashgrid Status"),
            contents: bytemuck::bytes_of(&u32::MAX),
            usage: wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_SRC,
        });
        let params_buffer = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("Hashgrid Params"),
            contents: bytemuck::bytes_of(&params),
            usage: wgpu::BufferUsages::UNIFORM,
        });

        let keys = self.storage_buffer("Hashgrid Cell IDs", layout.pairs);
        let values = self.storage_buffer("Hashgrid Indices", layout.pairs);
        // Sort scratch, `layout.len()` words in total.
        let tmp_keys = self.storage_buffer("Radix Temp Keys", layout.pairs);
        let tmp_values = self.storage_buffer("Radix Temp Values", layout.pairs);
        let prefix = self.storage_buffer("Radix Prefix", layout.pairs);
        let block_zeros = self.storage_buffer("Radix Block Zeros", layout.blocks);
        let segment_zeros = self.storage_buffer("Radix Segment Zeros", layout.segments);

        let cell_bind_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("Hashgrid Bind Group"),
            layout: &self.cell_ids.get_bind_group_layout(0),
            entries: &[
                entry(0, &locs_buffer),
                entry(1, &low_buffer),
                entry(2, &dims_buffer),
                entry(3, &keys),
                entry(4, &status_buffer),
                entry(5, &params_buffer),
                entry(6, &values),
            ],
        });

        let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("Hashgrid Encoder"),
        });
        {
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some("Hashgrid Cell ID Pass"),
                timestamp_writes: None,
            });
            pass.set_pipeline(&self.cell_ids);
            pass.set_bind_group(0, &cell_bind_group, &[]);
            pass.dispatch_workgroups(workgroups as u32, 1, 1);
        }

        let max_cell = grid.max_ncells(batch).saturating_sub(1).min(u32::MAX as usize) as u32;
        let bits = key_bits(max_cell);
        let mut src = (&keys, &values);
        let mut dst = (&tmp_keys, &tmp_values);
        let scan_groups = (batch as u32).div_ceil(SCAN_WORKGROUP_SIZE);
        for bit in 0..bits {
            let params = SortParams {
                batch_size: batch as u32,
                num_points: num_points as u32,
                blocks_per_segment: blocks_per_segment as u32,
                bit,
            };
            let params_buffer = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some("Radix Params"),
                contents: bytemuck::bytes_of(&params),
                usage: wgpu::BufferUsages::UNIFORM,
            });

            let count_bind_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
                label: Some("Radix Count BG"),
                layout: &self.radix_count.get_bind_group_layout(0),
                entries: &[
                    entry(0, src.0),
                    entry(2, &prefix),
                    entry(3, &block_zeros),
                    entry(7, &params_buffer),
                ],
            });
            let scan_bind_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
                label: Some("Radix Block Scan BG"),
                layout: &self.radix_block_scan.get_bind_group_layout(0),
                entries: &[
                    entry(3, &block_zeros),
                    entry(4, &segment_zeros),
                    entry(7, &params_buffer),
                ],
            });
            let scatter_bind_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
                label: Some("Radix Scatter BG"),
                layout: &self.radix_scatter.get_bind_group_layout(0),
                entries: &[
                    entry(0, src.0),
                    entry(1, src.1),
                    entry(2, &prefix),
                    entry(3, &block_zeros),
                    entry(4, &segment_zeros),
                    entry(5, dst.0),
                    entry(6, dst.1),
                    entry(7, &params_buffer),
                ],
            });

            for (label, pipeline, bind_group, groups) in [
                (
                    "Radix Count Pass",
                    &self.radix_count,
                    &count_bind_group,
                    (blocks_per_segment as u32, batch as u32),
                ),
                (
                    "Radix Block Scan Pass",
                    &self.radix_block_scan,
                    &scan_bind_group,
                    (scan_groups, 1),
                ),
                (
                    "Radix Scatter Pass",
                    &self.radix_scatter,
                    &scatter_bind_group,
                    (blocks_per_segment as u32, batch as u32),
                ),
            ] {
                let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                    label: Some(label),
                    timestamp_writes: None,
                });
                pass.set_pipeline(pipeline);
                pass.set_bind_group(0, bind_group, &[]);
                pass.dispatch_workgroups(groups.0, groups.1, 1);
            }

            std::mem::swap(&mut src, &mut dst);
        }
        self.context.queue.submit(Some(encoder.finish()));

        let status = self.read_u32(&status_buffer, 1).await?;
        let first_out_of_range = match status.first() {
            Some(&idx) if idx != u32::MAX => Some(idx as usize),
            _ => None,
        };
        let (cell_ids, idxs) = if first_out_of_range.is_some() {
            (Vec::new(), Vec::new())
        } else {
            (
                self.read_u32(src.0, total).await?,
                self.read_u32(src.1, total).await?,
            )
        };

        debug!(
            "GPU hash-grid order of {}x{} points ({} sort passes, {} scratch words) took {:.2} ms",
            batch,
            num_points,
            bits,
            layout.len(),
            start.elapsed().as_secs_f32() * 1000.0
        );

        Ok(GpuOrder {
            cell_ids,
            idxs,
            first_out_of_range,
        })
    }

    /// A storage buffer of `len` words that can be read back.
    fn storage_buffer(&self, label: &str, len: usize) -> wgpu::Buffer {
        self.context.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some(label),
            size: (len.max(1) * std::mem::size_of::<u32>()) as u64,
            usage: wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_SRC,
            mapped_at_creation: false,
        })
    }

    /// Copies `len` words out of `buffer` into host memory.
    async fn read_u32(&self, buffer: &wgpu::Buffer, len: usize) -> Result<Vec<u32>> {
        let size = (len * std::mem::size_of::<u32>()) as u64;
        let staging_buffer = self.context.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Hashgrid Staging Buffer"),
            size,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        let mut encoder = self
            .context
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor::default());
        encoder.copy_buffer_to_buffer(buffer, 0, &staging_buffer, 0, size);
        self.context.queue.submit(Some(encoder.finish()));

        let buffer_slice = staging_buffer.slice(..);
        let (tx, rx) = futures::channel::oneshot::channel();
        buffer_slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = tx.send(result);
        });
        self.context
            .device
            .poll(wgpu::PollType::Wait)
            .map_err(|e| SpnError::ComputeError(format!("Failed to poll device: {}", e)))?;
        rx.await
            .map_err(|_| SpnError::TransferError("Buffer map callback dropped".to_string()))??;

        let words = {
            let data = buffer_slice.get_mapped_range();
            cast_slice::<u8, u32>(&data).to_vec()
        };
        staging_buffer.unmap();

        Ok(words)
    }
}

fn create_pipeline(
    device: &wgpu::Device,
    label: &str,
    module: &wgpu::ShaderModule,
    entry_point: &str,
) -> wgpu::ComputePipeline {
    device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
        label: Some(label),
        layout: None,
        module,
        entry_point: Some(entry_point),
        compilation_options: Default::default(),
        cache: None,
    })
}

fn entry(binding: u32, buffer: &wgpu::Buffer) -> wgpu::BindGroupEntry<'_> {
    wgpu::BindGroupEntry {
        binding,
        resource: buffer.as_entire_binding(),
    }
}
