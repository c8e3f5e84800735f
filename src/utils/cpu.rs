//! CPU placement and scheduling of fabric worker threads

use crate::{Error, Result};
use log::{debug, warn};
use nix::sched::{sched_getaffinity, sched_setaffinity, CpuSet};
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};

/// SCHED_RR priority receive workers ask for by default
pub const RECV_RT_PRIORITY: i32 = 90;

/// Number of online CPUs
pub fn online_cpus() -> usize {
    num_cpus::get()
}

/// CPUs the calling thread may run on
pub fn current_affinity() -> Result<Vec<usize>> {
    let set = sched_getaffinity(Pid::from_raw(0)).map_err(|e| Error::IoError(e.into()))?;
    Ok((0..CpuSet::count())
        .filter(|&cpu| set.is_set(cpu).unwrap_or(false))
        .collect())
}

/// Pin the calling thread to `cores`
pub fn set_thread_affinity(cores: &[usize]) -> Result<()> {
    if cores.is_empty() {
        return Err(Error::InvalidConfig("core list cannot be empty".to_string()));
    }

    let online = online_cpus();
    let mut set = CpuSet::new();
    for &core in cores {
        if core >= online {
            return Err(Error::InvalidConfig(format!(
                "core {} out of range ({} online)",
                core, online
            )));
        }
        set.set(core).map_err(|e| Error::IoError(e.into()))?;
    }

    sched_setaffinity(Pid::from_raw(0), &set).map_err(|e| Error::IoError(e.into()))
}

/// Switch the calling thread to round-robin real-time scheduling
pub fn set_thread_rt_priority(priority: i32) -> Result<()> {
    let param = libc::sched_param {
        sched_priority: priority,
    };
    // SAFETY: pid 0 names the calling thread and param outlives the call
    let result = unsafe { libc::sched_setscheduler(0, libc::SCHED_RR, &param) };
    if result != 0 {
        return Err(Error::IoError(std::io::Error::last_os_error()));
    }
    Ok(())
}

/// Scheduling a worker thread applies to itself on start
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerOptions {
    pub rt_priority: Option<i32>,
    pub affinity: Option<Vec<usize>>,
}

impl WorkerOptions {
    /// Apply to the calling thread
    ///
    /// Failures only warn: the worker keeps running with default scheduling.
    pub fn apply(&self, name: &str) {
        if let Some(priority) = self.rt_priority {
            match set_thread_rt_priority(priority) {
                Ok(()) => debug!("{}: SCHED_RR priority {}", name, priority),
                Err(e) => warn!("{}: real-time priority {} denied: {}", name, priority, e),
            }
        }
        if let Some(cores) = &self.affinity {
            match set_thread_affinity(cores) {
                Ok(()) => debug!("{}: pinned to {:?}", name, cores),
                Err(e) => warn!("{}: affinity {:?} not applied: {}", name, cores, e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_online_cpus() {
        assert!(online_cpus() >= 1);
    }

    #[test]
    fn test_current_affinity() {
        let cores = current_affinity().unwrap();
        assert!(!cores.is_empty());
    }

    #[test]
    fn test_affinity_rejects_bad_input() {
        assert!(matches!(set_thread_affinity(&[]), Err(Error::InvalidConfig(_))));
        assert!(matches!(
            set_thread_affinity(&[usize::MAX]),
            Err(Error::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_default_options_are_noop() {
        // Runs on the test thread: nothing requested, nothing changed
        let before = current_affinity().unwrap();
        WorkerOptions::default().apply("test");
        assert_eq!(current_affinity().unwrap(), before);
    }
}
