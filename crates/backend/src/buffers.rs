//! Device buffer sets owned by a pipeline.
//!
//! Buffers are allocated once when a pipeline initializes its resources and are returned to
//! the device when the owning set is dropped.

use getset::CopyGetters;
use tracing::debug;

use crate::{
    device::{ComputeBackend, SizedBuffer},
    error::DeviceError,
};

/// Two equally sized buffers used ping/pong style. Swapping only relabels the slots.
#[derive(Debug)]
pub struct BufferPair<B> {
    slots: [B; 2],
    current: usize,
}

impl<B: SizedBuffer> BufferPair<B> {
    pub fn allocate<D>(device: &D, len: usize) -> Result<Self, DeviceError>
    where
        D: ComputeBackend<Buffer = B>,
    {
        Ok(Self {
            slots: [device.allocate(len)?, device.allocate(len)?],
            current: 0,
        })
    }

    /// The buffer holding the current data.
    pub fn primary(&self) -> &B {
        &self.slots[self.current]
    }

    pub fn secondary(&self) -> &B {
        &self.slots[1 - self.current]
    }

    pub fn swap(&mut self) {
        self.current = 1 - self.current;
    }

    /// Restores the initial labeling.
    pub fn reset(&mut self) {
        self.current = 0;
    }

    pub fn len(&self) -> usize {
        self.slots[0].len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Shape of the block-sum hierarchy used by the work-efficient scan.
///
/// Level 0 holds the `n` input elements. Every scanned level `i` is split into blocks of
/// `2 * min_block_size` elements, and level `i + 1` receives one total per block. Levels are
/// added until a level fits into a single block; the last level is the sink for that block's
/// total, so there are always at least two levels.
#[derive(Clone, Debug, PartialEq, Eq, CopyGetters)]
pub struct LevelHierarchy {
    #[getset(get_copy = "pub")]
    min_block_size: usize,
    counts: Vec<usize>,
    lens: Vec<usize>,
}

impl LevelHierarchy {
    pub fn new(n: usize, min_block_size: usize) -> Self {
        assert!(n > 0 && min_block_size > 0);
        let block = 2 * min_block_size;
        let mut counts = vec![n];
        let mut count = n;
        while count > block {
            count = count.div_ceil(block);
            counts.push(count);
        }
        counts.push(1);
        let lens = counts
            .iter()
            .enumerate()
            .map(|(i, &count)| if i == 0 { count } else { count.max(min_block_size) })
            .collect();
        Self {
            min_block_size,
            counts,
            lens,
        }
    }

    pub fn levels(&self) -> usize {
        self.counts.len()
    }

    /// Number of meaningful elements in level `i`.
    pub fn count(&self, i: usize) -> usize {
        self.counts[i]
    }

    /// Allocated length of level `i`.
    pub fn buffer_len(&self, i: usize) -> usize {
        self.lens[i]
    }

    pub fn counts(&self) -> &[usize] {
        &self.counts
    }
}

/// Number of levels [LevelHierarchy::new] produces for `n` elements.
pub fn level_count(n: usize, min_block_size: usize) -> usize {
    LevelHierarchy::new(n, min_block_size).levels()
}

/// One allocated buffer per level of a [LevelHierarchy].
#[derive(Debug)]
pub struct LevelBuffers<B> {
    levels: Vec<B>,
}

impl<B: SizedBuffer> LevelBuffers<B> {
    pub fn allocate<D>(device: &D, hierarchy: &LevelHierarchy) -> Result<Self, DeviceError>
    where
        D: ComputeBackend<Buffer = B>,
    {
        debug!(
            levels = hierarchy.levels(),
            counts = ?hierarchy.counts(),
            "allocating level hierarchy"
        );
        let levels = (0..hierarchy.levels())
            .map(|i| device.allocate(hierarchy.buffer_len(i)))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { levels })
    }

    pub fn level(&self, i: usize) -> &B {
        &self.levels[i]
    }

    pub fn len(&self) -> usize {
        self.levels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.levels.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use test_case::test_case;

    use super::*;
    use crate::device::HostDevice;

    #[test_case(16, 8, &[16, 1] ; "when n fits one block")]
    #[test_case(17, 8, &[17, 2, 1] ; "when n spills into a second block")]
    #[test_case(1, 4, &[1, 1] ; "when a single element")]
    #[test_case(1 << 12, 8, &[4096, 256, 16, 1])]
    #[test_case(1000, 3, &[1000, 167, 28, 5, 1] ; "when the block size is odd")]
    fn test_hierarchy_counts(n: usize, m: usize, counts: &[usize]) {
        let hierarchy = LevelHierarchy::new(n, m);
        assert_eq!(hierarchy.counts(), counts);
        assert_eq!(hierarchy.buffer_len(0), n);
        for i in 1..hierarchy.levels() {
            assert_eq!(hierarchy.buffer_len(i), counts[i].max(m));
        }
    }

    #[test]
    fn test_level_count_monotone() {
        for m in [1, 2, 8, 64] {
            assert_eq!(level_count(2 * m, m), 2);
            let mut prev = 2;
            for n in 1..5000 {
                let levels = level_count(n, m);
                assert!(levels >= prev || n == 1);
                assert!(levels >= 2);
                if n <= 2 * m {
                    assert_eq!(levels, 2);
                }
                prev = levels;
            }
        }
    }

    #[test]
    fn test_pair_swap_and_release() {
        let device = HostDevice::default();
        let mut pair = BufferPair::allocate(&device, 32).unwrap();
        assert_eq!(device.allocated_bytes(), 2 * 32 * 4);
        device.upload(pair.primary(), &[7; 32]).unwrap();
        pair.swap();
        let mut out = [0u32; 32];
        device.download(pair.secondary(), &mut out).unwrap();
        assert_eq!(out, [7; 32]);
        pair.reset();
        device.download(pair.primary(), &mut out).unwrap();
        assert_eq!(out, [7; 32]);
        drop(pair);
        assert_eq!(device.allocated_bytes(), 0);
    }
}
