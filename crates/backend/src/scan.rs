//! Inclusive prefix sum of a `u32` array.
//!
//! Two pass structures are provided. [ScanStrategy::NaiveDoubling] runs `ceil(log2 n)`
//! doubling passes over a ping/pong pair. [ScanStrategy::WorkEfficient] scans blocks of
//! `2 * min_block_size` elements and recurses over the block totals stored in a
//! [LevelHierarchy], then adds the scanned totals back down level by level.

use std::collections::BTreeMap;

use rand::Rng;
use strum::{EnumIter, IntoEnumIterator, IntoStaticStr};
use tracing::{debug, info, instrument};

use crate::{
    buffers::{BufferPair, LevelBuffers, LevelHierarchy},
    device::{ComputeBackend, KernelArg},
    error::PipelineError,
    planner::WorkGroupConfig,
    task::{check_block_size, check_problem_size, random_input, ComputeTask},
    validator::{reference_inclusive_scan, validate_scan, ValidationReport},
};

/// Kernel that adds the scanned block totals of one level into the blocks of the level below.
pub const SCAN_ADD_KERNEL: &str = "scanWorkEfficientAdd";

#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, EnumIter, IntoStaticStr, strum::Display,
)]
pub enum ScanStrategy {
    NaiveDoubling,
    WorkEfficient,
}

impl ScanStrategy {
    pub const fn kernel_name(self) -> &'static str {
        match self {
            Self::NaiveDoubling => "scanNaive",
            Self::WorkEfficient => "scanWorkEfficient",
        }
    }
}

/// One dispatch of a scan.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ScanPass {
    /// `new[i] = old[i] + old[i - offset]`, written to the other buffer of the pair.
    Doubling {
        config: WorkGroupConfig,
        offset: usize,
    },
    /// Scans the blocks of level `level` in place and writes their totals to `level + 1`.
    UpSweep {
        config: WorkGroupConfig,
        level: usize,
    },
    /// Adds the scanned totals of level `level` into the blocks of `level - 1`, one work item
    /// per element of `level - 1`.
    DownSweep {
        config: WorkGroupConfig,
        level: usize,
    },
}

impl ScanPass {
    pub fn config(&self) -> &WorkGroupConfig {
        match self {
            Self::Doubling { config, .. }
            | Self::UpSweep { config, .. }
            | Self::DownSweep { config, .. } => config,
        }
    }
}

fn up_sweep_config(hierarchy: &LevelHierarchy, level: usize) -> WorkGroupConfig {
    WorkGroupConfig::plan(
        hierarchy.count(level).div_ceil(2),
        hierarchy.min_block_size(),
    )
}

/// Pass sequence of `strategy`. `local` is the preferred group size of the doubling scan; the
/// work-efficient scan always uses the hierarchy's block size.
pub fn plan_scan(strategy: ScanStrategy, hierarchy: &LevelHierarchy, local: usize) -> Vec<ScanPass> {
    let n = hierarchy.count(0);
    let levels = hierarchy.levels();
    match strategy {
        ScanStrategy::NaiveDoubling => {
            let config = WorkGroupConfig::plan(n, local);
            std::iter::successors(Some(1usize), |offset| Some(offset * 2))
                .take_while(|&offset| offset < n)
                .map(|offset| ScanPass::Doubling { config, offset })
                .collect()
        }
        ScanStrategy::WorkEfficient => {
            let up = (0..levels - 1).map(|level| ScanPass::UpSweep {
                config: up_sweep_config(hierarchy, level),
                level,
            });
            let down = (1..levels - 1).rev().map(|level| ScanPass::DownSweep {
                config: WorkGroupConfig::plan(
                    hierarchy.count(level - 1),
                    hierarchy.min_block_size(),
                ),
                level,
            });
            up.chain(down).collect()
        }
    }
}

struct ScanResources<D: ComputeBackend> {
    pair: BufferPair<D::Buffer>,
    levels: LevelBuffers<D::Buffer>,
    naive: D::Kernel,
    work_efficient: D::Kernel,
    add: D::Kernel,
}

pub struct ScanPipeline<D: ComputeBackend> {
    device: D,
    input: Vec<u32>,
    hierarchy: LevelHierarchy,
    resources: Option<ScanResources<D>>,
    cpu_result: Option<Vec<u32>>,
    gpu_results: BTreeMap<ScanStrategy, Vec<u32>>,
}

impl<D: ComputeBackend> ScanPipeline<D> {
    /// A pipeline over `n` pseudo-random elements in `0..16`.
    pub fn new<R: Rng + ?Sized>(
        device: D,
        n: usize,
        min_block_size: usize,
        rng: &mut R,
    ) -> Result<Self, PipelineError> {
        check_problem_size(n)?;
        Self::from_input(device, random_input(rng, n), min_block_size)
    }

    pub fn from_input(
        device: D,
        input: Vec<u32>,
        min_block_size: usize,
    ) -> Result<Self, PipelineError> {
        check_problem_size(input.len())?;
        check_block_size(min_block_size)?;
        let hierarchy = LevelHierarchy::new(input.len(), min_block_size);
        Ok(Self {
            device,
            input,
            hierarchy,
            resources: None,
            cpu_result: None,
            gpu_results: BTreeMap::new(),
        })
    }

    pub fn device(&self) -> &D {
        &self.device
    }

    pub fn input(&self) -> &[u32] {
        &self.input
    }

    pub fn hierarchy(&self) -> &LevelHierarchy {
        &self.hierarchy
    }

    pub fn cpu_result(&self) -> Option<&[u32]> {
        self.cpu_result.as_deref()
    }

    pub fn gpu_result(&self, strategy: ScanStrategy) -> Option<&[u32]> {
        self.gpu_results.get(&strategy).map(Vec::as_slice)
    }

    pub fn is_initialized(&self) -> bool {
        self.resources.is_some()
    }

    pub fn plan_passes(
        &self,
        strategy: ScanStrategy,
        local: usize,
    ) -> Result<Vec<ScanPass>, PipelineError> {
        check_block_size(local)?;
        Ok(plan_scan(strategy, &self.hierarchy, local))
    }

    /// Dispatch shapes of the up-sweep, one per scanned level.
    pub fn plan_up_sweep(&self) -> Vec<WorkGroupConfig> {
        (0..self.hierarchy.levels() - 1)
            .map(|level| up_sweep_config(&self.hierarchy, level))
            .collect()
    }

    /// Runs `strategy` once and reads back the scanned array.
    #[instrument(name = "scan", level = "debug", skip_all, fields(strategy = %strategy, n = self.input.len(), local = local))]
    pub fn run(&mut self, strategy: ScanStrategy, local: usize) -> Result<&[u32], PipelineError> {
        self.upload_input(strategy)?;
        self.enqueue_passes(strategy, local)?;
        let resources = self
            .resources
            .as_ref()
            .ok_or(PipelineError::ResourcesNotInitialized)?;
        let src = match strategy {
            ScanStrategy::NaiveDoubling => resources.pair.primary(),
            ScanStrategy::WorkEfficient => resources.levels.level(0),
        };
        let result = self.gpu_results.entry(strategy).or_default();
        result.resize(self.input.len(), 0);
        self.device.download(src, result)?;
        Ok(result.as_slice())
    }
}

impl<D: ComputeBackend> ComputeTask for ScanPipeline<D> {
    type Strategy = ScanStrategy;

    fn name(&self) -> &'static str {
        "scan"
    }

    fn array_len(&self) -> usize {
        self.input.len()
    }

    fn strategies(&self) -> Vec<ScanStrategy> {
        ScanStrategy::iter().collect()
    }

    fn init_resources(&mut self) -> Result<(), PipelineError> {
        if self.resources.is_some() {
            return Err(PipelineError::ResourcesAlreadyInitialized);
        }
        let naive = self
            .device
            .build_kernel(ScanStrategy::NaiveDoubling.kernel_name())?;
        let work_efficient = self
            .device
            .build_kernel(ScanStrategy::WorkEfficient.kernel_name())?;
        let add = self.device.build_kernel(SCAN_ADD_KERNEL)?;
        let pair = BufferPair::allocate(&self.device, self.input.len())?;
        let levels = LevelBuffers::allocate(&self.device, &self.hierarchy)?;
        info!(
            n = self.input.len(),
            min_block_size = self.hierarchy.min_block_size(),
            levels = self.hierarchy.levels(),
            "scan resources initialized"
        );
        self.resources = Some(ScanResources {
            pair,
            levels,
            naive,
            work_efficient,
            add,
        });
        Ok(())
    }

    fn release_resources(&mut self) {
        if self.resources.take().is_some() {
            debug!("scan resources released");
        }
    }

    fn compute_cpu(&mut self) {
        self.cpu_result = Some(reference_inclusive_scan(&self.input));
    }

    fn compute_gpu(&mut self, local: usize) -> Result<(), PipelineError> {
        for strategy in self.strategies() {
            self.run(strategy, local)?;
        }
        Ok(())
    }

    fn validation_report(&self) -> ValidationReport {
        let computed;
        let expected = match &self.cpu_result {
            Some(expected) => expected.as_slice(),
            None => {
                computed = reference_inclusive_scan(&self.input);
                computed.as_slice()
            }
        };
        let records = ScanStrategy::iter()
            .map(|s| validate_scan(s.kernel_name(), expected, self.gpu_result(s)))
            .collect();
        ValidationReport {
            task: self.name(),
            records,
        }
    }

    fn upload_input(&mut self, strategy: ScanStrategy) -> Result<(), PipelineError> {
        let resources = self
            .resources
            .as_mut()
            .ok_or(PipelineError::ResourcesNotInitialized)?;
        match strategy {
            ScanStrategy::NaiveDoubling => {
                resources.pair.reset();
                self.device.upload(resources.pair.primary(), &self.input)?;
            }
            ScanStrategy::WorkEfficient => {
                self.device.upload(resources.levels.level(0), &self.input)?;
            }
        }
        Ok(())
    }

    fn enqueue_passes(&mut self, strategy: ScanStrategy, local: usize) -> Result<(), PipelineError> {
        check_block_size(local)?;
        let passes = plan_scan(strategy, &self.hierarchy, local);
        let n = self.input.len() as u32;
        let hierarchy = &self.hierarchy;
        let resources = self
            .resources
            .as_mut()
            .ok_or(PipelineError::ResourcesNotInitialized)?;
        for pass in passes {
            match pass {
                ScanPass::Doubling { config, offset } => {
                    self.device.dispatch(
                        &resources.naive,
                        &config,
                        &[
                            KernelArg::Buffer(resources.pair.primary()),
                            KernelArg::Buffer(resources.pair.secondary()),
                            KernelArg::Uint(n),
                            KernelArg::Uint(offset as u32),
                        ],
                    )?;
                    resources.pair.swap();
                }
                ScanPass::UpSweep { config, level } => {
                    self.device.dispatch(
                        &resources.work_efficient,
                        &config,
                        &[
                            KernelArg::Buffer(resources.levels.level(level)),
                            KernelArg::Buffer(resources.levels.level(level + 1)),
                            KernelArg::Uint(hierarchy.count(level) as u32),
                            KernelArg::Local(2 * config.local),
                        ],
                    )?;
                }
                ScanPass::DownSweep { config, level } => {
                    self.device.dispatch(
                        &resources.add,
                        &config,
                        &[
                            KernelArg::Buffer(resources.levels.level(level)),
                            KernelArg::Buffer(resources.levels.level(level - 1)),
                            KernelArg::Uint(hierarchy.count(level - 1) as u32),
                        ],
                    )?;
                }
            }
        }
        Ok(())
    }

    fn drain(&self) -> Result<(), PipelineError> {
        Ok(self.device.drain()?)
    }
}

#[cfg(test)]
mod tests {
    use test_case::test_case;

    use super::*;

    #[test]
    fn test_naive_plan_pass_count() {
        let hierarchy = LevelHierarchy::new(1000, 8);
        let passes = plan_scan(ScanStrategy::NaiveDoubling, &hierarchy, 256);
        assert_eq!(passes.len(), 10);
        assert!(passes
            .iter()
            .all(|p| *p.config() == WorkGroupConfig::plan(1000, 256)));
        let hierarchy = LevelHierarchy::new(100, 8);
        let passes = plan_scan(ScanStrategy::NaiveDoubling, &hierarchy, 256);
        assert_eq!(passes[0].config(), &WorkGroupConfig::single_group(100));
    }

    #[test_case(16, 8, 1, 0 ; "when n fits one block")]
    #[test_case(17, 8, 2, 1 ; "when n is not a power of two")]
    #[test_case(1, 8, 1, 0 ; "when a single element")]
    #[test_case(1 << 12, 8, 3, 2)]
    fn test_work_efficient_pass_counts(n: usize, m: usize, up: usize, down: usize) {
        let hierarchy = LevelHierarchy::new(n, m);
        let passes = plan_scan(ScanStrategy::WorkEfficient, &hierarchy, 256);
        let ups = passes
            .iter()
            .filter(|p| matches!(p, ScanPass::UpSweep { .. }))
            .count();
        assert_eq!(ups, up);
        assert_eq!(passes.len() - ups, down);
    }

    #[test]
    fn test_down_sweep_covers_lower_level() {
        let hierarchy = LevelHierarchy::new(1 << 12, 8);
        let passes = plan_scan(ScanStrategy::WorkEfficient, &hierarchy, 256);
        let up: Vec<_> = passes
            .iter()
            .filter_map(|p| match p {
                ScanPass::UpSweep { config, .. } => Some((config.global, config.local, config.groups)),
                _ => None,
            })
            .collect();
        assert_eq!(up, vec![(2048, 8, 256), (128, 8, 16), (8, 8, 1)]);
        let down: Vec<_> = passes
            .iter()
            .filter_map(|p| match p {
                ScanPass::DownSweep { config, level } => {
                    Some((*level, config.global, config.local, config.groups))
                }
                _ => None,
            })
            .collect();
        assert_eq!(down, vec![(2, 256, 8, 32), (1, 4096, 8, 512)]);
        for pass in &passes {
            if let ScanPass::DownSweep { config, level } = pass {
                assert!(config.global >= hierarchy.count(level - 1));
            }
        }
    }
}
