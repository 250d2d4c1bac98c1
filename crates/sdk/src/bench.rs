//! Wall-clock throughput of pipeline strategies and of the sequential reference.

use std::time::{Duration, Instant};

use eyre::ensure;
use parascan_backend::ComputeTask;
use serde::Serialize;
use tracing::info;

/// Label used for the sequential reference.
pub const CPU_REFERENCE: &str = "cpu";

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Throughput {
    pub task: &'static str,
    pub strategy: &'static str,
    pub iterations: usize,
    pub avg_time_ms: f64,
    /// Billions of input elements per second.
    pub gelems_per_sec: f64,
}

impl Throughput {
    pub fn from_elapsed(
        task: &'static str,
        strategy: &'static str,
        len: usize,
        iterations: usize,
        elapsed: Duration,
    ) -> Self {
        let avg_time_ms = elapsed.as_secs_f64() * 1e3 / iterations as f64;
        Self {
            task,
            strategy,
            iterations,
            avg_time_ms,
            gelems_per_sec: 1e-6 * len as f64 / avg_time_ms,
        }
    }

    fn emit(&self) {
        info!(
            "{} {}: average time: {:.4} ms, throughput: {:.4} Gelem/s",
            self.task, self.strategy, self.avg_time_ms, self.gelems_per_sec
        );
        let labels = [("task", self.task), ("strategy", self.strategy)];
        metrics::gauge!("parascan.avg_time_ms", &labels).set(self.avg_time_ms);
        metrics::gauge!("parascan.throughput_gelems", &labels).set(self.gelems_per_sec);
    }
}

/// Uploads the input, then times `iterations` back-to-back enqueues of `strategy` between two
/// queue drains.
pub fn measure_throughput<T: ComputeTask>(
    task: &mut T,
    strategy: T::Strategy,
    local: usize,
    iterations: usize,
) -> eyre::Result<Throughput> {
    ensure!(iterations > 0, "at least one timed iteration is required");
    let elapsed = task.profile_gpu(strategy, local, iterations)?;
    let throughput =
        Throughput::from_elapsed(task.name(), strategy.into(), task.array_len(), iterations, elapsed);
    throughput.emit();
    Ok(throughput)
}

/// Times `iterations` runs of the sequential reference.
pub fn measure_cpu_reference<T: ComputeTask>(
    task: &mut T,
    iterations: usize,
) -> eyre::Result<Throughput> {
    ensure!(iterations > 0, "at least one timed iteration is required");
    let start = Instant::now();
    for _ in 0..iterations {
        task.compute_cpu();
    }
    let throughput = Throughput::from_elapsed(
        task.name(),
        CPU_REFERENCE,
        task.array_len(),
        iterations,
        start.elapsed(),
    );
    throughput.emit();
    Ok(throughput)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_throughput_formula() {
        let t = Throughput::from_elapsed("reduction", "x", 1 << 20, 10, Duration::from_millis(20));
        assert!((t.avg_time_ms - 2.0).abs() < 1e-9);
        assert!((t.gelems_per_sec - 1e-6 * (1 << 20) as f64 / 2.0).abs() < 1e-9);
    }
}
