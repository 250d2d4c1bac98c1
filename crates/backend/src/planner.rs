//! Global/local dispatch sizing shared by every pass of every strategy.

use serde::{Deserialize, Serialize};

use crate::{device::DeviceLimits, error::DeviceError};

/// Smallest multiple of `local` that is `>= n`.
#[inline]
pub fn global_work_size(n: usize, local: usize) -> usize {
    n.div_ceil(local) * local
}

/// One-dimensional dispatch shape: `global` work items in `groups` groups of `local`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkGroupConfig {
    pub global: usize,
    pub local: usize,
    pub groups: usize,
}

impl WorkGroupConfig {
    /// Plans `units` work items with the preferred group size `preferred_local`.
    ///
    /// When everything fits into a single group the group is shrunk to exactly `units` items,
    /// so that no work item idles and no extra synchronization level is introduced.
    pub fn plan(units: usize, preferred_local: usize) -> Self {
        debug_assert!(units > 0, "nothing to dispatch");
        debug_assert!(preferred_local > 0, "zero local work size");
        let global = global_work_size(units, preferred_local);
        let groups = global / preferred_local;
        if groups == 1 {
            Self::single_group(units)
        } else {
            Self {
                global,
                local: preferred_local,
                groups,
            }
        }
    }

    pub fn single_group(units: usize) -> Self {
        Self {
            global: units,
            local: units,
            groups: 1,
        }
    }

    /// Checks the shape against the limits of the device it is about to run on.
    pub fn validate(&self, kernel: &'static str, limits: &DeviceLimits) -> Result<(), DeviceError> {
        let reason = if self.local == 0 || self.global == 0 {
            Some(format!("empty dispatch {self:?}"))
        } else if self.global % self.local != 0 {
            Some(format!(
                "global size {} is not a multiple of local size {}",
                self.global, self.local
            ))
        } else if self.global / self.local != self.groups {
            Some(format!("group count {} does not match {self:?}", self.groups))
        } else if self.local > limits.max_work_group_size {
            Some(format!(
                "local size {} exceeds max work-group size {}",
                self.local, limits.max_work_group_size
            ))
        } else {
            None
        };
        match reason {
            Some(reason) => Err(DeviceError::DispatchFailure { kernel, reason }),
            None => Ok(()),
        }
    }
}
