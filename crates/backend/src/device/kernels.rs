//! Kernel bodies executed by [HostDevice](super::HostDevice).
//!
//! Every body runs one dispatch. Work-groups are independent and, with the `parallel` feature,
//! execute in parallel over disjoint chunks of the output. Work items inside a group run in
//! order and share a scratch vector standing in for group-local memory. Arithmetic is `u32`
//! with wraparound.

use std::sync::{
    atomic::{AtomicU32, Ordering},
    Arc,
};

use parking_lot::RwLock;
#[cfg(feature = "parallel")]
use rayon::prelude::*;
use strum::{EnumIter, EnumString, IntoStaticStr};

#[cfg(not(feature = "parallel"))]
use self::serial::*;
use crate::{error::DeviceError, planner::WorkGroupConfig};

pub(super) type Storage = Arc<RwLock<Vec<u32>>>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(super) enum ArgKind {
    Buffer,
    Uint,
    Local,
}

pub(super) enum BoundArg {
    Buffer(Storage),
    Uint(u32),
    Local,
}

/// The precompiled kernels available on the host device.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, EnumIter, EnumString, IntoStaticStr)]
pub enum HostKernel {
    /// `(data, stride, count)`
    #[strum(serialize = "interleavedAddressing")]
    InterleavedAddressing,
    /// `(data, stride, count)`
    #[strum(serialize = "sequentialAddressing")]
    SequentialAddressing,
    /// `(src, dst, count, scratch[local])`
    #[strum(serialize = "kernelDecomposition")]
    Decomposition,
    /// `(src, dst, count, scratch[1])`
    #[strum(serialize = "kernelDecompositionAtomics")]
    DecompositionAtomics,
    /// `(src, dst, count, offset)`
    #[strum(serialize = "scanNaive")]
    ScanNaive,
    /// `(data, block_sums, count, scratch[2 * local])`
    #[strum(serialize = "scanWorkEfficient")]
    ScanWorkEfficient,
    /// `(block_sums, data, count)`, one work item per element of `data`
    #[strum(serialize = "scanWorkEfficientAdd")]
    ScanWorkEfficientAdd,
}

impl HostKernel {
    pub fn name(self) -> &'static str {
        self.into()
    }

    pub(super) fn signature(self) -> &'static [ArgKind] {
        use ArgKind::*;
        match self {
            Self::InterleavedAddressing | Self::SequentialAddressing => &[Buffer, Uint, Uint],
            Self::Decomposition | Self::DecompositionAtomics => &[Buffer, Buffer, Uint, Local],
            Self::ScanNaive => &[Buffer, Buffer, Uint, Uint],
            Self::ScanWorkEfficient => &[Buffer, Buffer, Uint, Local],
            Self::ScanWorkEfficientAdd => &[Buffer, Buffer, Uint],
        }
    }

    /// Smallest scratch, in elements, the kernel needs per group for `config`.
    pub(super) fn min_local_elems(self, config: &WorkGroupConfig) -> usize {
        match self {
            Self::Decomposition => config.local,
            Self::DecompositionAtomics => 1,
            Self::ScanWorkEfficient => 2 * config.local,
            _ => 0,
        }
    }

    pub(super) fn execute(
        self,
        config: &WorkGroupConfig,
        args: &[BoundArg],
    ) -> Result<(), DeviceError> {
        use BoundArg::*;
        let result = match (self, args) {
            (Self::InterleavedAddressing, [Buffer(data), Uint(stride), Uint(count)]) => {
                interleaved_addressing(&mut data.write(), config, *stride as usize, *count as usize)
            }
            (Self::SequentialAddressing, [Buffer(data), Uint(stride), Uint(count)]) => {
                sequential_addressing(&mut data.write(), config, *stride as usize, *count as usize)
            }
            (Self::Decomposition, [Buffer(src), Buffer(dst), Uint(count), Local]) => {
                decomposition(&src.read(), &mut dst.write(), config, *count as usize)
            }
            (Self::DecompositionAtomics, [Buffer(src), Buffer(dst), Uint(count), Local]) => {
                decomposition_atomics(&src.read(), &mut dst.write(), config, *count as usize)
            }
            (Self::ScanNaive, [Buffer(src), Buffer(dst), Uint(count), Uint(offset)]) => {
                scan_naive(&src.read(), &mut dst.write(), config, *count as usize, *offset as usize)
            }
            (Self::ScanWorkEfficient, [Buffer(data), Buffer(sums), Uint(count), Local]) => {
                scan_work_efficient(&mut data.write(), &mut sums.write(), config, *count as usize)
            }
            (Self::ScanWorkEfficientAdd, [Buffer(sums), Buffer(data), Uint(count)]) => {
                scan_work_efficient_add(&sums.read(), &mut data.write(), config, *count as usize)
            }
            _ => {
                return Err(DeviceError::ArgumentBindingFailure {
                    kernel: self.name(),
                    reason: "bound arguments do not match the kernel signature".to_string(),
                })
            }
        };
        result.map_err(|reason| DeviceError::DispatchFailure {
            kernel: self.name(),
            reason,
        })
    }
}

/// Sequential stand-ins for the `rayon` entry points used below, so the kernel bodies read the
/// same with and without the `parallel` feature.
#[cfg(not(feature = "parallel"))]
mod serial {
    pub trait IntoParallelIterator {
        type Iter: Iterator<Item = Self::Item>;
        type Item;
        fn into_par_iter(self) -> Self::Iter;
    }

    impl<T: IntoIterator> IntoParallelIterator for T {
        type Iter = T::IntoIter;
        type Item = T::Item;
        fn into_par_iter(self) -> Self::Iter {
            self.into_iter()
        }
    }

    pub trait ParallelSlice<T> {
        fn par_chunks(&self, chunk_size: usize) -> std::slice::Chunks<'_, T>;
    }

    impl<T> ParallelSlice<T> for [T] {
        fn par_chunks(&self, chunk_size: usize) -> std::slice::Chunks<'_, T> {
            self.chunks(chunk_size)
        }
    }

    pub trait ParallelSliceMut<T> {
        fn par_chunks_mut(&mut self, chunk_size: usize) -> std::slice::ChunksMut<'_, T>;
        fn par_iter_mut(&mut self) -> std::slice::IterMut<'_, T>;
    }

    impl<T> ParallelSliceMut<T> for [T] {
        fn par_chunks_mut(&mut self, chunk_size: usize) -> std::slice::ChunksMut<'_, T> {
            self.chunks_mut(chunk_size)
        }

        fn par_iter_mut(&mut self) -> std::slice::IterMut<'_, T> {
            self.iter_mut()
        }
    }
}

fn check_count(count: usize, len: usize) -> Result<(), String> {
    if count == 0 || count > len {
        Err(format!("element count {count} out of range for buffer of {len}"))
    } else {
        Ok(())
    }
}

#[inline]
fn load(src: &[u32], count: usize, i: usize) -> u32 {
    if i < count {
        src[i]
    } else {
        0
    }
}

/// Work item `t` adds `data[2*stride*t + stride]` into `data[2*stride*t]`.
fn interleaved_addressing(
    data: &mut [u32],
    config: &WorkGroupConfig,
    stride: usize,
    count: usize,
) -> Result<(), String> {
    check_count(count, data.len())?;
    if stride == 0 {
        return Err("zero stride".to_string());
    }
    let span = 2 * stride * config.local;
    data[..count]
        .par_chunks_mut(span)
        .take(config.groups)
        .for_each(|block| {
            for t in 0..config.local {
                let i = 2 * stride * t;
                if i + stride >= block.len() {
                    break;
                }
                block[i] = block[i].wrapping_add(block[i + stride]);
            }
        });
    Ok(())
}

/// Work item `t` adds `data[t + stride]` into `data[t]` for `t < count - stride`.
fn sequential_addressing(
    data: &mut [u32],
    config: &WorkGroupConfig,
    stride: usize,
    count: usize,
) -> Result<(), String> {
    check_count(count, data.len())?;
    if stride == 0 || stride >= count || 2 * stride < count {
        return Err(format!("stride {stride} does not halve {count} elements"));
    }
    let (low, high) = data[..count].split_at_mut(stride);
    low[..high.len()]
        .par_chunks_mut(config.local)
        .zip(high.par_chunks(config.local))
        .take(config.groups)
        .for_each(|(dst, src)| {
            for (d, s) in dst.iter_mut().zip(src) {
                *d = d.wrapping_add(*s);
            }
        });
    Ok(())
}

/// Group `g` folds `src[2*local*g .. 2*local*(g+1)]` with a tree reduction in scratch and
/// writes the partial sum to `dst[g]`.
fn decomposition(
    src: &[u32],
    dst: &mut [u32],
    config: &WorkGroupConfig,
    count: usize,
) -> Result<(), String> {
    check_count(count, src.len())?;
    if dst.len() < config.groups {
        return Err(format!("{} partial sums do not fit {}", config.groups, dst.len()));
    }
    let local = config.local;
    dst[..config.groups]
        .par_iter_mut()
        .enumerate()
        .for_each(|(group, out)| {
            let base = group * 2 * local;
            let mut scratch: Vec<u32> = (0..local)
                .map(|lid| load(src, count, base + lid).wrapping_add(load(src, count, base + lid + local)))
                .collect();
            let mut width = local;
            while width > 1 {
                let half = width.div_ceil(2);
                for lid in 0..width - half {
                    scratch[lid] = scratch[lid].wrapping_add(scratch[lid + half]);
                }
                width = half;
            }
            *out = scratch[0];
        });
    Ok(())
}

/// Same fan-in as [decomposition], but every work item accumulates into one atomic slot.
fn decomposition_atomics(
    src: &[u32],
    dst: &mut [u32],
    config: &WorkGroupConfig,
    count: usize,
) -> Result<(), String> {
    check_count(count, src.len())?;
    if dst.len() < config.groups {
        return Err(format!("{} partial sums do not fit {}", config.groups, dst.len()));
    }
    let local = config.local;
    dst[..config.groups]
        .par_iter_mut()
        .enumerate()
        .for_each(|(group, out)| {
            let base = group * 2 * local;
            let slot = AtomicU32::new(0);
            (0..local).into_par_iter().for_each(|lid| {
                let pair = load(src, count, base + lid).wrapping_add(load(src, count, base + lid + local));
                slot.fetch_add(pair, Ordering::Relaxed);
            });
            *out = slot.into_inner();
        });
    Ok(())
}

/// `dst[i] = src[i] + src[i - offset]` for `i >= offset`, else `src[i]`.
fn scan_naive(
    src: &[u32],
    dst: &mut [u32],
    config: &WorkGroupConfig,
    count: usize,
    offset: usize,
) -> Result<(), String> {
    check_count(count, src.len())?;
    check_count(count, dst.len())?;
    dst[..count]
        .par_chunks_mut(config.local)
        .enumerate()
        .take(config.groups)
        .for_each(|(group, block)| {
            let base = group * config.local;
            for (lid, out) in block.iter_mut().enumerate() {
                let i = base + lid;
                *out = if i >= offset {
                    src[i].wrapping_add(src[i - offset])
                } else {
                    src[i]
                };
            }
        });
    Ok(())
}

/// Scans each block of `2 * local` elements in place and writes the block total to
/// `sums[group]`.
fn scan_work_efficient(
    data: &mut [u32],
    sums: &mut [u32],
    config: &WorkGroupConfig,
    count: usize,
) -> Result<(), String> {
    check_count(count, data.len())?;
    if sums.len() < config.groups {
        return Err(format!("{} block sums do not fit {}", config.groups, sums.len()));
    }
    let block_len = 2 * config.local;
    let scratch_len = block_len.next_power_of_two();
    data[..count]
        .par_chunks_mut(block_len)
        .zip(sums[..config.groups].par_iter_mut())
        .for_each(|(block, total)| {
            let mut scratch = vec![0u32; scratch_len];
            scratch[..block.len()].copy_from_slice(block);
            *total = blelloch_inclusive(&mut scratch);
            block.copy_from_slice(&scratch[..block.len()]);
        });
    Ok(())
}

/// In-place up-sweep/down-sweep over a power-of-two scratch, turned inclusive at the end.
/// Returns the total.
fn blelloch_inclusive(scratch: &mut [u32]) -> u32 {
    let n = scratch.len();
    debug_assert!(n.is_power_of_two());
    let mut d = 1;
    while d < n {
        for i in (2 * d - 1..n).step_by(2 * d) {
            scratch[i] = scratch[i].wrapping_add(scratch[i - d]);
        }
        d *= 2;
    }
    let total = scratch[n - 1];
    scratch[n - 1] = 0;
    d = n / 2;
    while d >= 1 {
        for i in (2 * d - 1..n).step_by(2 * d) {
            let left = scratch[i - d];
            scratch[i - d] = scratch[i];
            scratch[i] = scratch[i].wrapping_add(left);
        }
        d /= 2;
    }
    scratch.rotate_left(1);
    scratch[n - 1] = total;
    total
}

/// One work item per element. Group `g` covers `local` elements of block `g / 2`, so every
/// group past the first block adds `sums[g / 2 - 1]`.
fn scan_work_efficient_add(
    sums: &[u32],
    data: &mut [u32],
    config: &WorkGroupConfig,
    count: usize,
) -> Result<(), String> {
    check_count(count, data.len())?;
    let blocks = config.groups.div_ceil(2);
    if sums.len() + 1 < blocks {
        return Err(format!("{} block offsets missing from {}", blocks - 1, sums.len()));
    }
    data[..count]
        .par_chunks_mut(config.local)
        .enumerate()
        .take(config.groups)
        .skip(2)
        .for_each(|(group, chunk)| {
            let offset = sums[group / 2 - 1];
            for x in chunk.iter_mut() {
                *x = x.wrapping_add(offset);
            }
        });
    Ok(())
}
