//! End-to-end drivers: one task through its whole lifecycle, or the reduction task followed by
//! the scan task.

use eyre::WrapErr;
use itertools::Itertools;
use parascan_backend::{
    validator::ValidationReport, ComputeBackend, ComputeTask, ReductionPipeline, ScanPipeline,
};
use serde::Serialize;
use tracing::{info, info_span, warn};

use crate::{
    bench::{measure_cpu_reference, measure_throughput, Throughput},
    config::TaskParams,
    utils::create_seeded_rng_with_seed,
};

#[derive(Clone, Debug, Serialize)]
pub struct TaskOutcome {
    pub name: &'static str,
    pub validated: bool,
    pub report: ValidationReport,
    /// Timed runs, the sequential reference first when it was timed.
    pub throughput: Vec<Throughput>,
}

impl TaskOutcome {
    pub fn to_json(&self) -> eyre::Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

/// Runs `task` through its lifecycle: initialize, reference, device, validation and, when
/// `timed_iterations > 0`, profiling of every strategy. Resources are released on every path.
pub fn run_compute_task<T: ComputeTask>(
    task: &mut T,
    local: usize,
    timed_iterations: usize,
    cpu_iterations: usize,
) -> eyre::Result<TaskOutcome> {
    let _span = info_span!("compute_task", task = task.name(), n = task.array_len()).entered();
    task.init_resources()
        .wrap_err_with(|| format!("failed to initialize {} resources", task.name()))?;
    let outcome = execute(task, local, timed_iterations, cpu_iterations);
    task.release_resources();
    outcome
}

fn execute<T: ComputeTask>(
    task: &mut T,
    local: usize,
    timed_iterations: usize,
    cpu_iterations: usize,
) -> eyre::Result<TaskOutcome> {
    let mut throughput = Vec::new();
    if cpu_iterations > 0 {
        throughput.push(measure_cpu_reference(task, cpu_iterations)?);
    } else {
        task.compute_cpu();
    }
    task.compute_gpu(local)?;
    let validated = task.validate_results();
    if !validated {
        warn!("{} produced results that differ from the reference", task.name());
    }
    if timed_iterations > 0 {
        for strategy in task.strategies() {
            throughput.push(measure_throughput(task, strategy, local, timed_iterations)?);
        }
    }
    let report = task.validation_report();
    info!(
        "{} done: validated = {}, strategies = [{}]",
        task.name(),
        validated,
        task.strategies().iter().join(", ")
    );
    Ok(TaskOutcome {
        name: task.name(),
        validated,
        report,
        throughput,
    })
}

/// Reduction task, then scan task, on `device` with inputs generated from `params.seed`.
pub fn run_assignment<D>(device: D, params: &TaskParams) -> eyre::Result<[TaskOutcome; 2]>
where
    D: ComputeBackend + Clone,
{
    params.check()?;
    let mut rng = create_seeded_rng_with_seed(params.seed);

    info!("Running parallel reduction task...");
    let mut reduction =
        ReductionPipeline::new(device.clone(), params.reduction.array_len, &mut rng)?;
    let reduction = run_compute_task(
        &mut reduction,
        params.reduction.local_work_size,
        params.timed_iterations,
        params.reduction.cpu_iterations,
    )?;

    info!("Running parallel prefix sum task...");
    let mut scan = ScanPipeline::new(
        device,
        params.scan.array_len,
        params.scan.min_block_size,
        &mut rng,
    )?;
    let scan = run_compute_task(
        &mut scan,
        params.scan.local_work_size,
        params.timed_iterations,
        params.scan.cpu_iterations,
    )?;

    Ok([reduction, scan])
}
