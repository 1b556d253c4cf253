//! Kernel-enforced limits applied in the child between fork and exec

use std::time::Duration;

use nix::libc::rlim_t;
use nix::sched::{unshare, CloneFlags};
use nix::sys::resource::{setrlimit, Resource};
use nix::unistd::setsid;

const MB: u64 = 1024 * 1024;

/// Limits for one process run, resolved from the request, the language
/// profile and the sandbox configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessLimits {
    /// Wall-clock deadline
    pub wall_time: Duration,
    /// Memory ceiling in MB (RSS watchdog, and RLIMIT_AS when `address_space` is set)
    pub memory_mb: u32,
    /// Whether to apply RLIMIT_AS
    pub address_space: bool,
    /// Maximum size of any file the program writes, in KB
    pub file_size_kb: u64,
    /// Maximum open file descriptors
    pub open_files: u64,
    /// RLIMIT_NPROC; counts every process of the host user, so off by default
    pub max_processes: Option<u64>,
}

impl ProcessLimits {
    pub fn memory_kb(&self) -> u64 {
        u64::from(self.memory_mb) * 1024
    }

    /// RLIMIT_CPU soft limit: the wall limit rounded up plus one second, so the
    /// wall-clock deadline normally fires first
    pub fn cpu_seconds(&self) -> u64 {
        let secs = self.wall_time.as_secs();
        let rounded = if self.wall_time.subsec_nanos() > 0 { secs + 1 } else { secs };
        rounded + 1
    }

    pub(crate) fn child_setup(&self, unshare_network: bool) -> ChildSetup {
        ChildSetup {
            cpu_seconds: self.cpu_seconds(),
            address_space_bytes: self
                .address_space
                .then(|| u64::from(self.memory_mb) * MB),
            file_size_bytes: self.file_size_kb * 1024,
            open_files: self.open_files,
            max_processes: self.max_processes,
            unshare_network,
        }
    }
}

/// Plain-data copy of the limits moved into the `pre_exec` closure.
/// `apply` runs after fork, so it must not allocate or take locks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ChildSetup {
    pub cpu_seconds: u64,
    pub address_space_bytes: Option<u64>,
    pub file_size_bytes: u64,
    pub open_files: u64,
    pub max_processes: Option<u64>,
    pub unshare_network: bool,
}

impl ChildSetup {
    pub(crate) fn apply(&self) -> std::io::Result<()> {
        // New session: the child leads its own process group, so the whole
        // tree can be killed with one killpg.
        setsid()?;

        if self.unshare_network {
            unshare(CloneFlags::CLONE_NEWUSER | CloneFlags::CLONE_NEWNET)?;
        }

        setrlimit(
            Resource::RLIMIT_CPU,
            self.cpu_seconds as rlim_t,
            (self.cpu_seconds + 1) as rlim_t,
        )?;
        if let Some(bytes) = self.address_space_bytes {
            setrlimit(Resource::RLIMIT_AS, bytes as rlim_t, bytes as rlim_t)?;
        }
        setrlimit(
            Resource::RLIMIT_FSIZE,
            self.file_size_bytes as rlim_t,
            self.file_size_bytes as rlim_t,
        )?;
        setrlimit(
            Resource::RLIMIT_NOFILE,
            self.open_files as rlim_t,
            self.open_files as rlim_t,
        )?;
        setrlimit(Resource::RLIMIT_CORE, 0, 0)?;
        if let Some(procs) = self.max_processes {
            setrlimit(Resource::RLIMIT_NPROC, procs as rlim_t, procs as rlim_t)?;
        }

        Ok(())
    }
}
