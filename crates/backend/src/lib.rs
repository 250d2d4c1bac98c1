//! Host-side orchestration of multi-pass parallel reduction and inclusive scan.
//!
//! A pipeline owns its input, its device buffers and the compiled kernels of every strategy it
//! offers. Each strategy is a fixed sequence of kernel dispatches whose shapes come from
//! [planner::WorkGroupConfig::plan]; the output of one pass is the input of the next.
//!
//! The [device::ComputeBackend] trait is the only contact with a device. [device::HostDevice]
//! implements it on the host with an in-order queue and `rayon` work-groups.

pub mod buffers;
pub mod device;
pub mod error;
pub mod planner;
pub mod reduction;
pub mod scan;
pub mod task;
pub mod validator;

pub use device::{ComputeBackend, DeviceLimits, HostDevice};
pub use error::{DeviceError, PipelineError};
pub use reduction::{ReductionPipeline, ReductionStrategy, EXCLUDED_REDUCTION_VARIANTS};
pub use scan::{ScanPipeline, ScanStrategy};
pub use task::ComputeTask;
