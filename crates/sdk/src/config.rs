use std::path::Path;

use eyre::{ensure, WrapErr};
use serde::{Deserialize, Serialize};

pub const STANDARD_ARRAY_LEN: usize = 16 * 1024 * 1024;
pub const STANDARD_LOCAL_WORK_SIZE: usize = 256;
pub const STANDARD_TIMED_ITERATIONS: usize = 100;
pub const STANDARD_REDUCTION_CPU_ITERATIONS: usize = 10;
pub const STANDARD_SCAN_CPU_ITERATIONS: usize = 100;

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReductionParams {
    pub array_len: usize,
    /// Preferred work-group size of every reduction pass.
    pub local_work_size: usize,
    /// Iterations of the sequential reference in a timed run. Zero skips it.
    pub cpu_iterations: usize,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ScanParams {
    pub array_len: usize,
    /// Half the block length of the work-efficient scan.
    pub min_block_size: usize,
    /// Preferred work-group size of the doubling scan.
    pub local_work_size: usize,
    pub cpu_iterations: usize,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct TaskParams {
    /// Iterations of each strategy in a timed run. Zero skips profiling.
    pub timed_iterations: usize,
    /// Seed of the generated inputs.
    pub seed: u64,
    pub reduction: ReductionParams,
    pub scan: ScanParams,
}

impl TaskParams {
    /// 16 Mi elements, work-groups of 256.
    pub fn standard() -> Self {
        Self {
            reduction: ReductionParams {
                array_len: STANDARD_ARRAY_LEN,
                local_work_size: STANDARD_LOCAL_WORK_SIZE,
                cpu_iterations: STANDARD_REDUCTION_CPU_ITERATIONS,
            },
            scan: ScanParams {
                array_len: STANDARD_ARRAY_LEN,
                min_block_size: STANDARD_LOCAL_WORK_SIZE,
                local_work_size: STANDARD_LOCAL_WORK_SIZE,
                cpu_iterations: STANDARD_SCAN_CPU_ITERATIONS,
            },
            timed_iterations: STANDARD_TIMED_ITERATIONS,
            seed: 42,
        }
    }

    /// Parameters for testing usage.
    /// If the environment variable `PARASCAN_FAST_TEST` is set to "1", the arrays are tiny and
    /// nothing is profiled.
    pub fn new_for_testing() -> Self {
        if let Ok("1") = std::env::var("PARASCAN_FAST_TEST").as_deref() {
            Self {
                reduction: ReductionParams {
                    array_len: 1 << 10,
                    local_work_size: 32,
                    cpu_iterations: 0,
                },
                scan: ScanParams {
                    array_len: 1 << 10,
                    min_block_size: 8,
                    local_work_size: 32,
                    cpu_iterations: 0,
                },
                timed_iterations: 0,
                seed: 42,
            }
        } else {
            Self {
                reduction: ReductionParams {
                    array_len: 1 << 16,
                    local_work_size: 128,
                    cpu_iterations: 2,
                },
                scan: ScanParams {
                    array_len: (1 << 16) + 3,
                    min_block_size: 64,
                    local_work_size: 128,
                    cpu_iterations: 2,
                },
                timed_iterations: 2,
                seed: 42,
            }
        }
    }

    pub fn from_toml_str(s: &str) -> eyre::Result<Self> {
        let params: Self = toml::from_str(s).wrap_err("invalid task parameters")?;
        params.check()?;
        Ok(params)
    }

    pub fn from_toml_file(path: impl AsRef<Path>) -> eyre::Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .wrap_err_with(|| format!("failed to read {}", path.display()))?;
        Self::from_toml_str(&contents)
    }

    pub fn to_toml_string(&self) -> eyre::Result<String> {
        Ok(toml::to_string(self)?)
    }

    pub fn check(&self) -> eyre::Result<()> {
        ensure!(self.reduction.array_len > 0, "reduction.array_len must be positive");
        ensure!(self.scan.array_len > 0, "scan.array_len must be positive");
        ensure!(
            self.reduction.local_work_size > 0
                && self.scan.local_work_size > 0
                && self.scan.min_block_size > 0,
            "work-group sizes must be positive"
        );
        Ok(())
    }
}

impl Default for TaskParams {
    fn default() -> Self {
        Self::standard()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_toml_round_trip() {
        let params = TaskParams::new_for_testing();
        let text = params.to_toml_string().unwrap();
        assert_eq!(TaskParams::from_toml_str(&text).unwrap(), params);
    }

    #[test]
    fn test_rejects_zero_block_size() {
        let text = r#"
            timed_iterations = 1
            seed = 7

            [reduction]
            array_len = 64
            local_work_size = 16
            cpu_iterations = 1

            [scan]
            array_len = 64
            min_block_size = 0
            local_work_size = 16
            cpu_iterations = 3
        "#;
        assert!(TaskParams::from_toml_str(text).is_err());
        let fixed = text.replace("min_block_size = 0", "min_block_size = 4");
        let params = TaskParams::from_toml_str(&fixed).unwrap();
        assert_eq!(params.scan.min_block_size, 4);
        assert_eq!(params.seed, 7);
        assert_eq!((params.reduction.cpu_iterations, params.scan.cpu_iterations), (1, 3));
    }

    #[test]
    fn test_standard_cpu_iterations_per_task() {
        let params = TaskParams::standard();
        assert_eq!(params.reduction.cpu_iterations, 10);
        assert_eq!(params.scan.cpu_iterations, 100);
        assert_eq!(params.timed_iterations, 100);
    }
}
