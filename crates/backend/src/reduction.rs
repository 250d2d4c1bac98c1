//! Reduction of a `u32` array to its wraparound sum.

use std::collections::BTreeMap;

use itertools::Itertools;
use rand::Rng;
use strum::{EnumIter, IntoEnumIterator, IntoStaticStr};
use tracing::{debug, info, instrument};

use crate::{
    buffers::BufferPair,
    device::{ComputeBackend, KernelArg},
    error::PipelineError,
    planner::WorkGroupConfig,
    task::{check_block_size, check_problem_size, random_input, ComputeTask},
    validator::{
        reference_reduce, validate_reduction, ValidationRecord, ValidationReport,
    },
};

/// The runnable reduction pass structures.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, EnumIter, IntoStaticStr, strum::Display,
)]
pub enum ReductionStrategy {
    InterleavedAddressing,
    SequentialAddressing,
    TreeDecomposition,
    AtomicDecomposition,
}

impl ReductionStrategy {
    pub const fn kernel_name(self) -> &'static str {
        match self {
            Self::InterleavedAddressing => "interleavedAddressing",
            Self::SequentialAddressing => "sequentialAddressing",
            Self::TreeDecomposition => "kernelDecomposition",
            Self::AtomicDecomposition => "kernelDecompositionAtomics",
        }
    }
}

/// A declared reduction variant without an implementation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ExcludedVariant {
    pub name: &'static str,
    pub kernel: &'static str,
    pub reason: &'static str,
}

/// Variants that are reported, but never run or compared.
pub const EXCLUDED_REDUCTION_VARIANTS: &[ExcludedVariant] = &[ExcludedVariant {
    name: "UnrolledDecomposition",
    kernel: "kernelDecompositionUnroll",
    reason: "not implemented",
}];

/// One dispatch of a reduction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReductionPass {
    /// Folds `count` elements in place, combining elements `stride` apart.
    InPlace {
        config: WorkGroupConfig,
        stride: usize,
        count: usize,
    },
    /// Folds `size` elements into one partial sum per group, written to the other buffer.
    Decompose {
        config: WorkGroupConfig,
        size: usize,
    },
}

impl ReductionPass {
    pub fn config(&self) -> &WorkGroupConfig {
        match self {
            Self::InPlace { config, .. } | Self::Decompose { config, .. } => config,
        }
    }
}

/// Pass sequence of `strategy` over `n` elements with preferred group size `local`.
pub fn plan_reduction(strategy: ReductionStrategy, n: usize, local: usize) -> Vec<ReductionPass> {
    let mut passes = Vec::new();
    match strategy {
        ReductionStrategy::InterleavedAddressing => {
            let mut stride = 1;
            while stride < n {
                passes.push(ReductionPass::InPlace {
                    config: WorkGroupConfig::plan(n.div_ceil(2 * stride), local),
                    stride,
                    count: n,
                });
                stride *= 2;
            }
        }
        ReductionStrategy::SequentialAddressing => {
            let mut active = n;
            while active > 1 {
                let stride = active.div_ceil(2);
                passes.push(ReductionPass::InPlace {
                    config: WorkGroupConfig::plan(active - stride, local),
                    stride,
                    count: active,
                });
                active = stride;
            }
        }
        ReductionStrategy::TreeDecomposition | ReductionStrategy::AtomicDecomposition => {
            let mut size = n;
            while size > 1 {
                let config = WorkGroupConfig::plan(size.div_ceil(2), local);
                passes.push(ReductionPass::Decompose { config, size });
                size = config.groups;
            }
        }
    }
    passes
}

struct ReductionResources<D: ComputeBackend> {
    buffers: BufferPair<D::Buffer>,
    kernels: Vec<(ReductionStrategy, D::Kernel)>,
}

pub struct ReductionPipeline<D: ComputeBackend> {
    device: D,
    input: Vec<u32>,
    resources: Option<ReductionResources<D>>,
    cpu_result: Option<u32>,
    gpu_results: BTreeMap<ReductionStrategy, u32>,
}

impl<D: ComputeBackend> ReductionPipeline<D> {
    /// A pipeline over `n` pseudo-random elements in `0..16`.
    pub fn new<R: Rng + ?Sized>(device: D, n: usize, rng: &mut R) -> Result<Self, PipelineError> {
        check_problem_size(n)?;
        Self::from_input(device, random_input(rng, n))
    }

    pub fn from_input(device: D, input: Vec<u32>) -> Result<Self, PipelineError> {
        check_problem_size(input.len())?;
        Ok(Self {
            device,
            input,
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

    pub fn cpu_result(&self) -> Option<u32> {
        self.cpu_result
    }

    pub fn gpu_result(&self, strategy: ReductionStrategy) -> Option<u32> {
        self.gpu_results.get(&strategy).copied()
    }

    pub fn is_initialized(&self) -> bool {
        self.resources.is_some()
    }

    pub fn plan_passes(
        &self,
        strategy: ReductionStrategy,
        local: usize,
    ) -> Result<Vec<ReductionPass>, PipelineError> {
        check_block_size(local)?;
        Ok(plan_reduction(strategy, self.input.len(), local))
    }

    fn resources(&self) -> Result<&ReductionResources<D>, PipelineError> {
        self.resources
            .as_ref()
            .ok_or(PipelineError::ResourcesNotInitialized)
    }

    /// Runs `strategy` once and reads back the sum.
    #[instrument(name = "reduce", level = "debug", skip_all, fields(strategy = %strategy, n = self.input.len(), local = local))]
    pub fn run(&mut self, strategy: ReductionStrategy, local: usize) -> Result<u32, PipelineError> {
        self.upload_input(strategy)?;
        self.enqueue_passes(strategy, local)?;
        let mut result = [0u32];
        self.device
            .download(self.resources()?.buffers.primary(), &mut result)?;
        debug!(result = result[0]);
        self.gpu_results.insert(strategy, result[0]);
        Ok(result[0])
    }
}

impl<D: ComputeBackend> ComputeTask for ReductionPipeline<D> {
    type Strategy = ReductionStrategy;

    fn name(&self) -> &'static str {
        "reduction"
    }

    fn array_len(&self) -> usize {
        self.input.len()
    }

    fn strategies(&self) -> Vec<ReductionStrategy> {
        ReductionStrategy::iter().collect()
    }

    fn init_resources(&mut self) -> Result<(), PipelineError> {
        if self.resources.is_some() {
            return Err(PipelineError::ResourcesAlreadyInitialized);
        }
        let kernels = ReductionStrategy::iter()
            .map(|s| Ok((s, self.device.build_kernel(s.kernel_name())?)))
            .collect::<Result<Vec<_>, PipelineError>>()?;
        let buffers = BufferPair::allocate(&self.device, self.input.len())?;
        info!(
            n = self.input.len(),
            kernels = %kernels.iter().map(|(s, _)| s.kernel_name()).join(", "),
            "reduction resources initialized"
        );
        self.resources = Some(ReductionResources { buffers, kernels });
        Ok(())
    }

    fn release_resources(&mut self) {
        if self.resources.take().is_some() {
            debug!("reduction resources released");
        }
    }

    fn compute_cpu(&mut self) {
        self.cpu_result = Some(reference_reduce(&self.input));
    }

    fn compute_gpu(&mut self, local: usize) -> Result<(), PipelineError> {
        for strategy in self.strategies() {
            self.run(strategy, local)?;
        }
        Ok(())
    }

    fn validation_report(&self) -> ValidationReport {
        let expected = self
            .cpu_result
            .unwrap_or_else(|| reference_reduce(&self.input));
        let records = ReductionStrategy::iter()
            .map(|s| validate_reduction(s.kernel_name(), expected, self.gpu_result(s)))
            .chain(
                EXCLUDED_REDUCTION_VARIANTS
                    .iter()
                    .map(|v| ValidationRecord::excluded(v.kernel, v.reason)),
            )
            .collect();
        ValidationReport {
            task: self.name(),
            records,
        }
    }

    fn upload_input(&mut self, _strategy: ReductionStrategy) -> Result<(), PipelineError> {
        let resources = self
            .resources
            .as_mut()
            .ok_or(PipelineError::ResourcesNotInitialized)?;
        resources.buffers.reset();
        self.device
            .upload(resources.buffers.primary(), &self.input)?;
        Ok(())
    }

    fn enqueue_passes(
        &mut self,
        strategy: ReductionStrategy,
        local: usize,
    ) -> Result<(), PipelineError> {
        check_block_size(local)?;
        let passes = plan_reduction(strategy, self.input.len(), local);
        let resources = self
            .resources
            .as_mut()
            .ok_or(PipelineError::ResourcesNotInitialized)?;
        for pass in passes {
            let kernel = &resources.kernels[strategy as usize].1;
            match pass {
                ReductionPass::InPlace {
                    config,
                    stride,
                    count,
                } => {
                    self.device.dispatch(
                        kernel,
                        &config,
                        &[
                            KernelArg::Buffer(resources.buffers.primary()),
                            KernelArg::Uint(stride as u32),
                            KernelArg::Uint(count as u32),
                        ],
                    )?;
                }
                ReductionPass::Decompose { config, size } => {
                    let scratch = match strategy {
                        ReductionStrategy::AtomicDecomposition => 1,
                        _ => config.local,
                    };
                    self.device.dispatch(
                        kernel,
                        &config,
                        &[
                            KernelArg::Buffer(resources.buffers.primary()),
                            KernelArg::Buffer(resources.buffers.secondary()),
                            KernelArg::Uint(size as u32),
                            KernelArg::Local(scratch),
                        ],
                    )?;
                    resources.buffers.swap();
                }
            }
        }
        Ok(())
    }

    fn drain(&self) -> Result<(), PipelineError> {
        Ok(self.device.drain()?)
    }
}
