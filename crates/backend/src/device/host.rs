use std::{
    collections::VecDeque,
    fmt::Debug,
    mem,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};

use parking_lot::{Mutex, RwLock};
use tracing::{debug, trace};

use super::{
    kernels::{ArgKind, BoundArg, HostKernel, Storage},
    ComputeBackend, DeviceLimits, KernelArg, SizedBuffer,
};
use crate::{error::DeviceError, planner::WorkGroupConfig};

const ELEM_BYTES: usize = mem::size_of::<u32>();

/// Most recent dispatches kept by [HostDevice::dispatch_log]. Older records are dropped.
pub const DISPATCH_LOG_CAPACITY: usize = 4096;

/// A dispatch as it was enqueued, kept for inspection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DispatchRecord {
    pub kernel: &'static str,
    pub config: WorkGroupConfig,
}

enum Command {
    Upload {
        dst: Storage,
        data: Vec<u32>,
    },
    Dispatch {
        kernel: HostKernel,
        config: WorkGroupConfig,
        args: Vec<BoundArg>,
    },
}

struct DeviceState {
    limits: DeviceLimits,
    queue: Mutex<Vec<Command>>,
    allocated_bytes: AtomicUsize,
    dispatch_log: Mutex<VecDeque<DispatchRecord>>,
}

/// A compute device emulated on the host.
///
/// Commands are recorded on an in-order queue and only execute on [ComputeBackend::drain] or
/// a blocking [ComputeBackend::download], so errors raised by a kernel surface at the next
/// synchronization point, as they would on a GPU. Cloning yields another handle to the same
/// device.
#[derive(Clone)]
pub struct HostDevice {
    state: Arc<DeviceState>,
}

impl Default for HostDevice {
    fn default() -> Self {
        Self::new(DeviceLimits::default())
    }
}

impl HostDevice {
    pub fn new(limits: DeviceLimits) -> Self {
        debug!(?limits, "Host device");
        Self {
            state: Arc::new(DeviceState {
                limits,
                queue: Mutex::new(Vec::new()),
                allocated_bytes: AtomicUsize::new(0),
                dispatch_log: Mutex::new(VecDeque::new()),
            }),
        }
    }

    /// Bytes currently held by live buffers.
    pub fn allocated_bytes(&self) -> usize {
        self.state.allocated_bytes.load(Ordering::SeqCst)
    }

    /// Number of commands enqueued but not yet executed.
    pub fn pending_commands(&self) -> usize {
        self.state.queue.lock().len()
    }

    /// Up to [DISPATCH_LOG_CAPACITY] of the latest dispatches, oldest first.
    pub fn dispatch_log(&self) -> Vec<DispatchRecord> {
        self.state.dispatch_log.lock().iter().copied().collect()
    }

    pub fn clear_dispatch_log(&self) {
        self.state.dispatch_log.lock().clear();
    }

    fn owns(&self, buffer: &HostBuffer) -> bool {
        Arc::ptr_eq(&self.state, &buffer.device)
    }

    fn bind(
        &self,
        kernel: HostKernel,
        config: &WorkGroupConfig,
        args: &[KernelArg<'_, HostBuffer>],
    ) -> Result<Vec<BoundArg>, DeviceError> {
        let binding_failure = |reason: String| DeviceError::ArgumentBindingFailure {
            kernel: kernel.name(),
            reason,
        };
        let signature = kernel.signature();
        if args.len() != signature.len() {
            return Err(binding_failure(format!(
                "expected {} arguments, got {}",
                signature.len(),
                args.len()
            )));
        }
        let mut bound = Vec::with_capacity(args.len());
        for (index, (arg, kind)) in args.iter().zip(signature).enumerate() {
            match (arg, kind) {
                (KernelArg::Buffer(buffer), ArgKind::Buffer) => {
                    if !self.owns(buffer) {
                        return Err(binding_failure(format!(
                            "argument {index} was allocated on another device"
                        )));
                    }
                    let aliased = bound.iter().any(
                        |b| matches!(b, BoundArg::Buffer(storage) if Arc::ptr_eq(storage, &buffer.storage)),
                    );
                    if aliased {
                        return Err(binding_failure(format!(
                            "argument {index} aliases another buffer argument"
                        )));
                    }
                    bound.push(BoundArg::Buffer(Arc::clone(&buffer.storage)));
                }
                (KernelArg::Uint(value), ArgKind::Uint) => bound.push(BoundArg::Uint(*value)),
                (KernelArg::Local(elems), ArgKind::Local) => {
                    let required = kernel.min_local_elems(config);
                    if *elems < required {
                        return Err(binding_failure(format!(
                            "argument {index}: scratch of {elems} elements, kernel needs {required}"
                        )));
                    }
                    if elems * ELEM_BYTES > self.state.limits.local_mem_bytes {
                        return Err(DeviceError::DispatchFailure {
                            kernel: kernel.name(),
                            reason: format!(
                                "scratch of {} bytes exceeds local memory of {} bytes",
                                elems * ELEM_BYTES,
                                self.state.limits.local_mem_bytes
                            ),
                        });
                    }
                    bound.push(BoundArg::Local);
                }
                (_, kind) => {
                    return Err(binding_failure(format!(
                        "argument {index}: expected {kind:?}"
                    )));
                }
            }
        }
        Ok(bound)
    }
}

impl ComputeBackend for HostDevice {
    type Buffer = HostBuffer;
    type Kernel = HostKernel;

    fn limits(&self) -> DeviceLimits {
        self.state.limits
    }

    fn build_kernel(&self, name: &'static str) -> Result<HostKernel, DeviceError> {
        name.parse::<HostKernel>()
            .map_err(|_| DeviceError::ProgramBuildFailure(format!("Failed to create kernel: {name}")))
    }

    fn allocate(&self, len: usize) -> Result<HostBuffer, DeviceError> {
        let size_bytes = len * ELEM_BYTES;
        let limit = self.state.limits.global_mem_bytes;
        self.state
            .allocated_bytes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |used| {
                used.checked_add(size_bytes).filter(|total| *total <= limit)
            })
            .map_err(|used| DeviceError::AllocationFailure {
                requested: size_bytes,
                available: limit.saturating_sub(used),
            })?;
        debug!(
            "Allocating device buffer: {} elements, {} bytes",
            len, size_bytes
        );
        metrics::counter!("parascan.buffer.alloc_bytes").increment(size_bytes as u64);
        Ok(HostBuffer {
            storage: Arc::new(RwLock::new(vec![0; len])),
            len,
            device: Arc::clone(&self.state),
        })
    }

    fn upload(&self, dst: &HostBuffer, src: &[u32]) -> Result<(), DeviceError> {
        if src.len() > dst.len() {
            return Err(DeviceError::UploadFailure {
                src_len: src.len(),
                dst_len: dst.len(),
            });
        }
        self.state.queue.lock().push(Command::Upload {
            dst: Arc::clone(&dst.storage),
            data: src.to_vec(),
        });
        Ok(())
    }

    fn download(&self, src: &HostBuffer, dst: &mut [u32]) -> Result<(), DeviceError> {
        self.drain()?;
        if dst.len() > src.len() {
            return Err(DeviceError::ReadbackFailure {
                requested: dst.len(),
                available: src.len(),
            });
        }
        dst.copy_from_slice(&src.storage.read()[..dst.len()]);
        Ok(())
    }

    fn dispatch(
        &self,
        kernel: &HostKernel,
        config: &WorkGroupConfig,
        args: &[KernelArg<'_, HostBuffer>],
    ) -> Result<(), DeviceError> {
        config.validate(kernel.name(), &self.state.limits)?;
        let args = self.bind(*kernel, config, args)?;
        trace!(kernel = kernel.name(), ?config, "enqueue dispatch");
        metrics::counter!("parascan.dispatch.count", "kernel" => kernel.name()).increment(1);
        {
            let mut log = self.state.dispatch_log.lock();
            if log.len() == DISPATCH_LOG_CAPACITY {
                log.pop_front();
            }
            log.push_back(DispatchRecord {
                kernel: kernel.name(),
                config: *config,
            });
        }
        self.state.queue.lock().push(Command::Dispatch {
            kernel: *kernel,
            config: *config,
            args,
        });
        Ok(())
    }

    fn drain(&self) -> Result<(), DeviceError> {
        let commands = mem::take(&mut *self.state.queue.lock());
        for command in commands {
            match command {
                Command::Upload { dst, data } => {
                    dst.write()[..data.len()].copy_from_slice(&data);
                }
                Command::Dispatch {
                    kernel,
                    config,
                    args,
                } => kernel.execute(&config, &args)?,
            }
        }
        Ok(())
    }
}

/// A `u32` buffer in host-device memory. The memory returns to the device when dropped.
pub struct HostBuffer {
    storage: Storage,
    len: usize,
    device: Arc<DeviceState>,
}

impl SizedBuffer for HostBuffer {
    fn len(&self) -> usize {
        self.len
    }
}

impl Drop for HostBuffer {
    fn drop(&mut self) {
        debug!("Freeing device buffer of size {}", self.len);
        self.device
            .allocated_bytes
            .fetch_sub(self.len * ELEM_BYTES, Ordering::SeqCst);
    }
}

impl Debug for HostBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "HostBuffer (len = {})", self.len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upload_is_deferred_until_download() {
        let device = HostDevice::default();
        let buf = device.allocate(4).unwrap();
        device.upload(&buf, &[1, 2, 3, 4]).unwrap();
        assert_eq!(device.pending_commands(), 1);
        let mut out = [0u32; 4];
        device.download(&buf, &mut out).unwrap();
        assert_eq!(out, [1, 2, 3, 4]);
        assert_eq!(device.pending_commands(), 0);
    }

    #[test]
    fn test_allocation_accounting() {
        let device = HostDevice::new(DeviceLimits::new(256, 1024, 64));
        let a = device.allocate(8).unwrap();
        assert_eq!(device.allocated_bytes(), 32);
        let err = device.allocate(16).unwrap_err();
        assert_eq!(
            err,
            DeviceError::AllocationFailure {
                requested: 64,
                available: 32
            }
        );
        drop(a);
        assert_eq!(device.allocated_bytes(), 0);
        assert!(device.allocate(16).is_ok());
    }

    #[test]
    fn test_upload_and_readback_size_checks() {
        let device = HostDevice::default();
        let buf = device.allocate(2).unwrap();
        assert!(matches!(
            device.upload(&buf, &[1, 2, 3]),
            Err(DeviceError::UploadFailure { .. })
        ));
        let mut out = [0u32; 3];
        assert!(matches!(
            device.download(&buf, &mut out),
            Err(DeviceError::ReadbackFailure { .. })
        ));
    }

    #[test]
    fn test_bind_rejects_aliasing_and_wrong_arity() {
        let device = HostDevice::default();
        let kernel = device.build_kernel("scanNaive").unwrap();
        let buf = device.allocate(8).unwrap();
        let config = WorkGroupConfig::plan(8, 8);
        let aliased = device.dispatch(
            &kernel,
            &config,
            &[
                KernelArg::Buffer(&buf),
                KernelArg::Buffer(&buf),
                KernelArg::Uint(8),
                KernelArg::Uint(1),
            ],
        );
        assert!(matches!(
            aliased,
            Err(DeviceError::ArgumentBindingFailure { kernel: "scanNaive", .. })
        ));
        let short = device.dispatch(&kernel, &config, &[KernelArg::Buffer(&buf)]);
        assert!(matches!(short, Err(DeviceError::ArgumentBindingFailure { .. })));
        assert!(device.dispatch_log().is_empty());
    }

    #[test]
    fn test_foreign_buffer_rejected() {
        let device = HostDevice::default();
        let other = HostDevice::default();
        let kernel = device.build_kernel("interleavedAddressing").unwrap();
        let buf = other.allocate(4).unwrap();
        let res = device.dispatch(
            &kernel,
            &WorkGroupConfig::plan(2, 2),
            &[KernelArg::Buffer(&buf), KernelArg::Uint(1), KernelArg::Uint(4)],
        );
        assert!(res.is_err());
    }

    #[test]
    fn test_unknown_kernel_fails_to_build() {
        let device = HostDevice::default();
        assert!(matches!(
            device.build_kernel("kernelDecompositionUnroll"),
            Err(DeviceError::ProgramBuildFailure(_))
        ));
    }

    #[test]
    fn test_kernel_error_surfaces_at_drain() {
        let device = HostDevice::default();
        let kernel = device.build_kernel("sequentialAddressing").unwrap();
        let buf = device.allocate(8).unwrap();
        device
            .dispatch(
                &kernel,
                &WorkGroupConfig::plan(2, 2),
                &[KernelArg::Buffer(&buf), KernelArg::Uint(1), KernelArg::Uint(8)],
            )
            .unwrap();
        assert!(matches!(
            device.drain(),
            Err(DeviceError::DispatchFailure { kernel: "sequentialAddressing", .. })
        ));
        assert_eq!(device.pending_commands(), 0);
    }

    #[test]
    fn test_dispatch_log_keeps_latest_records() {
        let device = HostDevice::default();
        let sequential = device.build_kernel("sequentialAddressing").unwrap();
        let interleaved = device.build_kernel("interleavedAddressing").unwrap();
        let buf = device.allocate(4).unwrap();
        let config = WorkGroupConfig::plan(1, 1);
        let args = [KernelArg::Buffer(&buf), KernelArg::Uint(1), KernelArg::Uint(2)];
        device.dispatch(&interleaved, &config, &args).unwrap();
        for _ in 0..DISPATCH_LOG_CAPACITY {
            device.dispatch(&sequential, &config, &args).unwrap();
        }
        device.dispatch(&interleaved, &config, &args).unwrap();
        device.drain().unwrap();
        let log = device.dispatch_log();
        assert_eq!(log.len(), DISPATCH_LOG_CAPACITY);
        assert_eq!(log[0].kernel, "sequentialAddressing");
        assert_eq!(log[DISPATCH_LOG_CAPACITY - 1].kernel, "interleavedAddressing");
        device.clear_dispatch_log();
        assert!(device.dispatch_log().is_empty());
    }
}
