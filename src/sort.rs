//! Stable LSD radix sort of (key, value) pairs and its scratch sizing.
//!
//! The hash grid sorts `(cellID, original index)` pairs with this sort.
//! On the host, keys are processed in 8-bit digits, least significant first,
//! and digits above the largest key are skipped. GPU streams run the same
//! sort one bit per pass in `hashgrid_sort.wgsl`. Every pass is a stable
//! scatter on either device, so equal cell IDs keep their original point
//! order and the permutation is fully deterministic.

use crate::device::{Device, Stream};
use crate::error::{Result, SpnError};
use log::debug;

/// Bits consumed per pass.
pub const RADIX_BITS: u32 = 8;

/// Buckets per pass.
pub const RADIX_BUCKETS: usize = 1 << RADIX_BITS;

/// Pairs one GPU sort workgroup scans.
pub const GPU_SORT_BLOCK: usize = 256;

/// Scratch elements one host sort over `n` pairs needs.
#[inline]
pub fn scratch_len(n: usize) -> usize {
    2 * n + RADIX_BUCKETS
}

/// Device scratch of the GPU sort over `batch` segments of `n` pairs.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GpuSortLayout {
    /// Elements in each of the ping-pong key, ping-pong value and prefix
    /// buffers
    pub pairs: usize,
    /// Per-block counts of zero bits
    pub blocks: usize,
    /// Per-segment counts of zero bits
    pub segments: usize,
}

impl GpuSortLayout {
    /// Lays out the scratch for `batch × n` pairs.
    pub fn new(batch: usize, n: usize) -> Self {
        Self {
            pairs: batch * n,
            blocks: batch * n.div_ceil(GPU_SORT_BLOCK),
            segments: batch,
        }
    }

    /// Blocks per segment.
    pub fn blocks_per_segment(&self) -> usize {
        if self.segments == 0 {
            0
        } else {
            self.blocks / self.segments
        }
    }

    /// Total scratch elements.
    pub fn len(&self) -> usize {
        3 * self.pairs + self.blocks + self.segments
    }

    /// Whether the layout holds no elements.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Number of bits a sort must process so that every key up to `max_key`
/// ends in order.
#[inline]
pub fn key_bits(max_key: u32) -> u32 {
    u32::BITS - max_key.leading_zeros()
}

/// Scratch elements (`u32`) a hash-grid ordering of `batch × n` points on
/// `stream` needs. Callers allocate this once and pass it to
/// [`hashgrid_order`](crate::hashgrid::hashgrid_order).
///
/// On the CPU, batch elements are sorted concurrently, so each gets its own
/// ping-pong key/value storage and histogram. On a GPU the sort runs in
/// device memory laid out by [`GpuSortLayout`] and this is its size.
pub fn radixsort_buffer_size(stream: &Stream, batch: usize, n: usize) -> usize {
    let len = match stream.device() {
        Device::Cpu => batch * scratch_len(n),
        Device::Gpu(_) => GpuSortLayout::new(batch, n).len(),
    };
    debug!(
        "Radix sort scratch for {}x{} keys on {:?}: {} elements",
        batch,
        n,
        stream.device(),
        len
    );
    len
}

/// Sorts `keys` ascending, permuting `values` alongside. Stable.
///
/// # Errors
/// Returns `InvalidShape` if `values` and `keys` differ in length or the
/// scratch is smaller than [`scratch_len`].
pub fn radix_sort_pairs(keys: &mut [u32], values: &mut [u32], scratch: &mut [u32]) -> Result<()> {
    let n = keys.len();
    if values.len() != n {
        return Err(SpnError::shape("values", n, values.len()));
    }
    if scratch.len() < scratch_len(n) {
        return Err(SpnError::shape(
            "buffer",
            format!(">= {}", scratch_len(n)),
            scratch.len(),
        ));
    }

    let max_key = keys.iter().copied().max().unwrap_or(0);
    let passes = key_bits(max_key).div_ceil(RADIX_BITS);

    let (tmp_keys, rest) = scratch.split_at_mut(n);
    let (tmp_values, rest) = rest.split_at_mut(n);
    let histogram = &mut rest[..RADIX_BUCKETS];

    for pass in 0..passes {
        let shift = pass * RADIX_BITS;
        if pass % 2 == 0 {
            scatter_pass(keys, values, tmp_keys, tmp_values, histogram, shift);
        } else {
            scatter_pass(tmp_keys, tmp_values, keys, values, histogram, shift);
        }
    }

    if passes % 2 == 1 {
        keys.copy_from_slice(tmp_keys);
        values.copy_from_slice(tmp_values);
    }
    Ok(())
}

/// One stable counting pass on the digit at `shift`.
fn scatter_pass(
    src_keys: &[u32],
    src_values: &[u32],
    dst_keys: &mut [u32],
    dst_values: &mut [u32],
    histogram: &mut [u32],
    shift: u32,
) {
    let mask = (RADIX_BUCKETS - 1) as u32;
    histogram.fill(0);
    for &key in src_keys {
        histogram[((key >> shift) & mask) as usize] += 1;
    }

    // Exclusive prefix sum turns counts into bucket starts.
    let mut running = 0u32;
    for slot in histogram.iter_mut() {
        let count = *slot;
        *slot = running;
        running += count;
    }

    for (&key, &value) in src_keys.iter().zip(src_values) {
        let bucket = ((key >> shift) & mask) as usize;
        let dst = histogram[bucket] as usize;
        histogram[bucket] += 1;
        dst_keys[dst] = key;
        dst_values[dst] = value;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sort(keys: &[u32]) -> (Vec<u32>, Vec<u32>) {
        let mut keys = keys.to_vec();
        let mut values: Vec<u32> = (0..keys.len() as u32).collect();
        let mut scratch = vec![0u32; scratch_len(keys.len())];
        radix_sort_pairs(&mut keys, &mut values, &mut scratch).unwrap();
        (keys, values)
    }

    #[test]
    fn test_sorts_small_keys() {
        let (keys, values) = sort(&[5, 3, 5, 0, 3, 1]);
        assert_eq!(keys, vec![0, 1, 3, 3, 5, 5]);
        // Stable: equal keys keep their input order.
        assert_eq!(values, vec![3, 5, 1, 4, 0, 2]);
    }

    #[test]
    fn test_sorts_multi_digit_keys() {
        let input = [70_000u32, 255, 256, 1, 65_535, 70_000, 0, 4_000_000_000];
        let (keys, values) = sort(&input);
        let mut expected: Vec<(u32, u32)> = input
            .iter()
            .enumerate()
            .map(|(i, &k)| (k, i as u32))
            .collect();
        expected.sort();
        assert_eq!(keys, expected.iter().map(|p| p.0).collect::<Vec<_>>());
        assert_eq!(values, expected.iter().map(|p| p.1).collect::<Vec<_>>());
    }

    #[test]
    fn test_all_zero_keys_keep_order() {
        let (keys, values) = sort(&[0, 0, 0, 0]);
        assert_eq!(keys, vec![0; 4]);
        assert_eq!(values, vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_empty_input() {
        let (keys, values) = sort(&[]);
        assert!(keys.is_empty());
        assert!(values.is_empty());
    }

    #[test]
    fn test_rejects_small_scratch() {
        let mut keys = vec![3, 2, 1];
        let mut values = vec![0, 1, 2];
        let mut scratch = vec![0u32; 4];
        assert!(radix_sort_pairs(&mut keys, &mut values, &mut scratch).is_err());
    }

    #[test]
    fn test_buffer_size_scales_with_batch() {
        let stream = Stream::cpu().unwrap();
        assert_eq!(radixsort_buffer_size(&stream, 3, 10), 3 * scratch_len(10));
    }

    #[test]
    fn test_gpu_layout_counts_blocks_per_segment() {
        let layout = GpuSortLayout::new(2, 600);
        assert_eq!(layout.pairs, 1200);
        assert_eq!(layout.blocks_per_segment(), 3);
        assert_eq!(layout.blocks, 6);
        assert_eq!(layout.len(), 3 * 1200 + 6 + 2);
        assert!(GpuSortLayout::new(0, 600).is_empty());
    }

    #[test]
    fn test_key_bits() {
        assert_eq!(key_bits(0), 0);
        assert_eq!(key_bits(1), 1);
        assert_eq!(key_bits(255), 8);
        assert_eq!(key_bits(256), 9);
        assert_eq!(key_bits(u32::MAX), 32);
    }

    #[test]
    fn test_buffer_size_follows_device() {
        let Ok(gpu) = pollster::block_on(crate::device::GpuContext::new()) else {
            return;
        };
        let stream = Stream::gpu(gpu).unwrap();
        assert_eq!(
            radixsort_buffer_size(&stream, 2, 600),
            GpuSortLayout::new(2, 600).len()
        );
    }
}
