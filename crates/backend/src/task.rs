use std::{
    fmt::{Debug, Display},
    time::{Duration, Instant},
};

use rand::Rng;
use tracing::{info, instrument, warn};

use crate::{error::PipelineError, validator::ValidationReport};

/// Lifecycle shared by the reduction and scan pipelines.
///
/// A driver calls [init_resources](ComputeTask::init_resources), computes the reference and
/// device results, validates them and finally calls
/// [release_resources](ComputeTask::release_resources).
pub trait ComputeTask {
    type Strategy: Copy + Debug + Display + Into<&'static str>;

    fn name(&self) -> &'static str;

    /// Number of input elements.
    fn array_len(&self) -> usize;

    /// The runnable strategies, in the order they are run.
    fn strategies(&self) -> Vec<Self::Strategy>;

    fn init_resources(&mut self) -> Result<(), PipelineError>;

    /// Returns every device buffer. Calling it again is a no-op.
    fn release_resources(&mut self);

    /// Computes the sequential reference result.
    fn compute_cpu(&mut self);

    /// Runs every strategy once and keeps its result.
    fn compute_gpu(&mut self, local: usize) -> Result<(), PipelineError>;

    fn validation_report(&self) -> ValidationReport;

    /// Builds the validation report, logs it and the excluded kernels, and returns whether it
    /// passed.
    fn validate_results(&self) -> bool {
        let report = self.validation_report();
        for (kernel, reason) in report.excluded() {
            warn!(kernel, reason, "kernel excluded from validation");
        }
        info!("{report}");
        report.passed()
    }

    /// Enqueues the upload of the input into the buffers `strategy` starts from.
    fn upload_input(&mut self, strategy: Self::Strategy) -> Result<(), PipelineError>;

    /// Enqueues the passes of `strategy` without waiting for them.
    fn enqueue_passes(&mut self, strategy: Self::Strategy, local: usize)
        -> Result<(), PipelineError>;

    /// Blocks until the device queue is empty.
    fn drain(&self) -> Result<(), PipelineError>;

    /// Wall time of `iterations` back-to-back runs of `strategy`, measured between two drains.
    #[instrument(name = "profile_gpu", level = "debug", skip_all, fields(task = self.name(), strategy = %strategy))]
    fn profile_gpu(
        &mut self,
        strategy: Self::Strategy,
        local: usize,
        iterations: usize,
    ) -> Result<Duration, PipelineError> {
        self.upload_input(strategy)?;
        self.drain()?;
        let start = Instant::now();
        for _ in 0..iterations {
            self.enqueue_passes(strategy, local)?;
        }
        self.drain()?;
        Ok(start.elapsed())
    }
}

/// `len` pseudo-random elements in `0..16`.
pub fn random_input<R: Rng + ?Sized>(rng: &mut R, len: usize) -> Vec<u32> {
    (0..len).map(|_| rng.random_range(0..16)).collect()
}

pub(crate) fn check_problem_size(len: usize) -> Result<(), PipelineError> {
    if len == 0 {
        Err(PipelineError::EmptyProblem)
    } else if u32::try_from(len).is_err() {
        Err(PipelineError::ProblemTooLarge { len })
    } else {
        Ok(())
    }
}

pub(crate) fn check_block_size(local: usize) -> Result<(), PipelineError> {
    if local == 0 {
        Err(PipelineError::InvalidBlockSize)
    } else {
        Ok(())
    }
}
