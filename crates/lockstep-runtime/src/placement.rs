//! Worker thread placement.
//!
//! Spinning strategies keep one core busy per component, so pinning each
//! worker to its own CPU keeps them from fighting over the same core. Only
//! Linux supports this; elsewhere pinning is skipped with a warning.

#![allow(unused_imports)] // Platform-specific code may not use all imports

use lockstep_common::config::CpuAffinity;
use lockstep_common::error::{ClockError, ClockResult};
use tracing::{debug, warn};

/// Pin the calling thread to a single CPU.
///
/// Returns `Ok(false)` if the CPU does not exist or pinning is unsupported.
///
/// # Errors
///
/// Returns an error if the CPU index cannot be represented or the kernel
/// rejects the request for a reason other than an invalid CPU.
#[cfg(target_os = "linux")]
pub fn pin_current_thread(cpu: usize) -> ClockResult<bool> {
    use nix::sched::{sched_setaffinity, CpuSet};
    use nix::unistd::Pid;

    let mut cpu_set = CpuSet::new();
    cpu_set
        .set(cpu)
        .map_err(|e| ClockError::Config(format!("Invalid CPU index {cpu}: {e}")))?;

    match sched_setaffinity(Pid::from_raw(0), &cpu_set) {
        Ok(()) => {
            debug!(cpu, "Worker pinned");
            Ok(true)
        }
        Err(nix::errno::Errno::EINVAL) => {
            warn!(cpu, "CPU does not exist; worker left unpinned");
            Ok(false)
        }
        Err(e) => Err(ClockError::Config(format!("sched_setaffinity failed: {e}"))),
    }
}

/// Pin the calling thread to a single CPU.
///
/// # Errors
///
/// Never fails on this platform.
#[cfg(not(target_os = "linux"))]
pub fn pin_current_thread(cpu: usize) -> ClockResult<bool> {
    warn!(cpu, "CPU affinity not available on this platform");
    Ok(false)
}

/// Apply the configured affinity for the worker at `index`, logging failures.
pub(crate) fn apply(affinity: &CpuAffinity, index: usize) -> Option<usize> {
    let cpu = affinity.cpu_for(index)?;
    match pin_current_thread(cpu) {
        Ok(true) => Some(cpu),
        Ok(false) => None,
        Err(e) => {
            warn!(cpu, error = %e, "Failed to pin worker");
            None
        }
    }
}
