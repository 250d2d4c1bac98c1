use thiserror::Error;

/// Failures reported by a compute backend. All of them are fatal to the run that triggered them.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeviceError {
    #[error("Buffer allocation failed: requested {requested} bytes, available {available}")]
    AllocationFailure { requested: usize, available: usize },
    #[error("Program build failed: {0}")]
    ProgramBuildFailure(String),
    #[error("Failed to set kernel arguments in '{kernel}': {reason}")]
    ArgumentBindingFailure { kernel: &'static str, reason: String },
    #[error("Failed to run kernel '{kernel}': {reason}")]
    DispatchFailure { kernel: &'static str, reason: String },
    #[error("Error copying data from host to device: source {src_len} > destination {dst_len}")]
    UploadFailure { src_len: usize, dst_len: usize },
    #[error("Error reading data from device: requested {requested} elements, buffer holds {available}")]
    ReadbackFailure { requested: usize, available: usize },
}

/// Top-level error type of the reduction and scan pipelines.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PipelineError {
    #[error("Device: {0}")]
    Device(#[from] DeviceError),
    #[error("problem size must be at least one element")]
    EmptyProblem,
    #[error("problem size {len} does not fit the 32-bit kernel index space")]
    ProblemTooLarge { len: usize },
    #[error("block size must be at least one work item")]
    InvalidBlockSize,
    #[error("device resources are not initialized")]
    ResourcesNotInitialized,
    #[error("device resources are already initialized")]
    ResourcesAlreadyInitialized,
}
