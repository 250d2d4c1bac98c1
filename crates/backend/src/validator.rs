//! Sequential reference results and exact comparison against device output.

use std::fmt::{self, Display};

use serde::{Deserialize, Serialize};
use tracing::error;

/// Sum of `input` in `u32` wraparound arithmetic.
pub fn reference_reduce(input: &[u32]) -> u32 {
    input.iter().fold(0u32, |acc, &x| acc.wrapping_add(x))
}

/// Inclusive prefix sum of `input` in `u32` wraparound arithmetic.
pub fn reference_inclusive_scan(input: &[u32]) -> Vec<u32> {
    input
        .iter()
        .scan(0u32, |acc, &x| {
            *acc = acc.wrapping_add(x);
            Some(*acc)
        })
        .collect()
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
pub enum Verdict {
    Passed,
    Failed,
    /// The variant has no implementation and is never compared.
    Excluded,
    /// No result was produced to compare.
    Missing,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub enum Detail {
    Scalar {
        expected: u32,
        actual: Option<u32>,
    },
    Array {
        len: usize,
        first_mismatch: Option<usize>,
    },
    Excluded {
        reason: &'static str,
    },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ValidationRecord {
    pub kernel: &'static str,
    pub verdict: Verdict,
    pub detail: Detail,
}

impl ValidationRecord {
    pub fn excluded(kernel: &'static str, reason: &'static str) -> Self {
        Self {
            kernel,
            verdict: Verdict::Excluded,
            detail: Detail::Excluded { reason },
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ValidationReport {
    pub task: &'static str,
    pub records: Vec<ValidationRecord>,
}

impl ValidationReport {
    /// True when no record failed or is missing. Excluded records do not count.
    pub fn passed(&self) -> bool {
        self.records
            .iter()
            .all(|r| matches!(r.verdict, Verdict::Passed | Verdict::Excluded))
    }

    pub fn record(&self, kernel: &str) -> Option<&ValidationRecord> {
        self.records.iter().find(|r| r.kernel == kernel)
    }

    /// Kernels left out of the comparison, with the reason.
    pub fn excluded(&self) -> impl Iterator<Item = (&'static str, &'static str)> + '_ {
        self.records.iter().filter_map(|r| match r.detail {
            Detail::Excluded { reason } => Some((r.kernel, reason)),
            _ => None,
        })
    }
}

impl Display for ValidationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}:", self.task)?;
        for record in &self.records {
            write!(f, "  {:<28} {}", record.kernel, record.verdict)?;
            match &record.detail {
                Detail::Scalar {
                    expected,
                    actual: Some(actual),
                } if record.verdict == Verdict::Failed => {
                    write!(f, " (expected {expected}, got {actual})")?
                }
                Detail::Array {
                    first_mismatch: Some(i),
                    ..
                } => write!(f, " (first mismatch at {i})")?,
                Detail::Excluded { reason } => write!(f, " ({reason})")?,
                _ => {}
            }
            writeln!(f)?;
        }
        Ok(())
    }
}

pub fn validate_reduction(
    kernel: &'static str,
    expected: u32,
    actual: Option<u32>,
) -> ValidationRecord {
    let verdict = match actual {
        None => Verdict::Missing,
        Some(actual) if actual == expected => Verdict::Passed,
        Some(actual) => {
            error!(
                "Validation of reduction kernel {} failed. Result should be {} but is {}",
                kernel, expected, actual
            );
            Verdict::Failed
        }
    };
    ValidationRecord {
        kernel,
        verdict,
        detail: Detail::Scalar { expected, actual },
    }
}

pub fn validate_scan(
    kernel: &'static str,
    expected: &[u32],
    actual: Option<&[u32]>,
) -> ValidationRecord {
    let Some(actual) = actual else {
        return ValidationRecord {
            kernel,
            verdict: Verdict::Missing,
            detail: Detail::Array {
                len: expected.len(),
                first_mismatch: None,
            },
        };
    };
    let first_mismatch = if actual.len() != expected.len() {
        Some(actual.len().min(expected.len()))
    } else {
        expected.iter().zip(actual).position(|(e, a)| e != a)
    };
    let verdict = match first_mismatch {
        None => Verdict::Passed,
        Some(i) => {
            error!(
                "Validation of scan kernel {} failed at element {} of {}",
                kernel,
                i,
                expected.len()
            );
            Verdict::Failed
        }
    };
    ValidationRecord {
        kernel,
        verdict,
        detail: Detail::Array {
            len: expected.len(),
            first_mismatch,
        },
    }
}
