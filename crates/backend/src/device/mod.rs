//! Compute-backend capability consumed by the pipelines.
//!
//! A backend owns device memory, a set of named precompiled kernels and a single in-order
//! queue. Uploads and dispatches are non-blocking; [ComputeBackend::download] is the blocking
//! synchronization point and [ComputeBackend::drain] waits for the queue to run empty.

mod host;
mod kernels;

pub use host::{DispatchRecord, HostBuffer, HostDevice, DISPATCH_LOG_CAPACITY};
pub use kernels::HostKernel;

use crate::{error::DeviceError, planner::WorkGroupConfig};

/// Hardware limits a dispatch is checked against.
#[derive(Clone, Copy, Debug, PartialEq, Eq, derive_new::new)]
pub struct DeviceLimits {
    pub max_work_group_size: usize,
    /// Shared scratch available to one work-group, in bytes.
    pub local_mem_bytes: usize,
    /// Total device memory, in bytes.
    pub global_mem_bytes: usize,
}

impl Default for DeviceLimits {
    fn default() -> Self {
        Self {
            max_work_group_size: 1024,
            local_mem_bytes: 48 * 1024,
            global_mem_bytes: 4 << 30,
        }
    }
}

pub trait SizedBuffer {
    /// Length in `u32` elements.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// One kernel argument, in binding order.
#[derive(Debug)]
pub enum KernelArg<'a, B> {
    Buffer(&'a B),
    Uint(u32),
    /// Per-group shared scratch, in `u32` elements.
    Local(usize),
}

// Manual impls: `B` itself need not be `Copy` for a borrowed argument to be.
impl<B> Clone for KernelArg<'_, B> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<B> Copy for KernelArg<'_, B> {}

pub trait ComputeBackend {
    type Buffer: SizedBuffer;
    type Kernel;

    fn limits(&self) -> DeviceLimits;

    /// Looks up a precompiled kernel by name.
    fn build_kernel(&self, name: &'static str) -> Result<Self::Kernel, DeviceError>;

    /// Allocates a buffer of `len` `u32` elements. The memory is released when the buffer drops.
    fn allocate(&self, len: usize) -> Result<Self::Buffer, DeviceError>;

    /// Enqueues a host-to-device copy of `src` into the front of `dst`. Non-blocking.
    fn upload(&self, dst: &Self::Buffer, src: &[u32]) -> Result<(), DeviceError>;

    /// Copies the front `dst.len()` elements of `src` back to the host after all enqueued work
    /// has completed.
    fn download(&self, src: &Self::Buffer, dst: &mut [u32]) -> Result<(), DeviceError>;

    fn dispatch(
        &self,
        kernel: &Self::Kernel,
        config: &WorkGroupConfig,
        args: &[KernelArg<'_, Self::Buffer>],
    ) -> Result<(), DeviceError>;

    /// Blocks until every enqueued command has executed.
    fn drain(&self) -> Result<(), DeviceError>;
}
