//! Process confinement for the fallback toolchain
//!
//! Everything the fallback compiles or runs is untrusted. Between fork and
//! exec the child:
//! - moves into fresh network, IPC and UTS namespaces (no network at all)
//! - drops to `nobody` when the worker runs as root, or enters a new user
//!   namespace otherwise
//! - gets hard rlimits on CPU time, address space, file size, open files
//!   and process count
//!
//! When the host refuses the namespaces the toolchain does not load, so
//! untrusted code never runs unconfined.

use nix::sched::{unshare, CloneFlags};
use nix::sys::resource::{setrlimit, Resource};
use nix::unistd::{chown, setgid, setgroups, setuid, Gid, Uid};
use std::path::Path;
use std::time::Duration;
use tokio::process::Command;

/// uid and gid of `nobody`
const UNPRIVILEGED_ID: u32 = 65534;

/// Search path handed to confined processes
const CONFINED_PATH: &str = "/usr/local/bin:/usr/bin:/bin";

/// Resource limits applied inside the confined child
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SandboxLimits {
    /// CPU time in seconds (SIGXCPU, then SIGKILL)
    pub cpu_secs: u64,
    /// Address space in MB
    pub memory_mb: u64,
    /// Largest file the process may write, in KB
    pub fsize_kb: u64,
    pub open_files: u64,
    /// Processes for the confined user; `None` leaves it unlimited
    pub processes: Option<u64>,
}

impl SandboxLimits {
    /// Compiler driver, which spawns the compiler proper, assembler and linker
    pub fn compile(time_limit: Duration) -> Self {
        Self {
            cpu_secs: whole_secs(time_limit),
            memory_mb: 2048,
            fsize_kb: 262144,
            open_files: 256,
            processes: None,
        }
    }

    /// Compiled user program: a single process that cannot fork
    pub fn program(time_limit: Duration) -> Self {
        Self {
            // Wall-clock timeout fires first; this stops a detached spinner
            cpu_secs: whole_secs(time_limit) + 1,
            memory_mb: 256,
            fsize_kb: 1024,
            open_files: 64,
            // Checked on fork only, so the exec itself still succeeds
            processes: Some(0),
        }
    }
}

fn whole_secs(duration: Duration) -> u64 {
    duration.as_secs() + u64::from(duration.subsec_nanos() > 0)
}

/// Confinement strategy, chosen from the worker's own privileges
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sandbox {
    privileged: bool,
}

impl Sandbox {
    pub fn for_current_user() -> Self {
        Self {
            privileged: Uid::effective().is_root(),
        }
    }

    /// Hand the scratch directory to the user the child will run as
    pub fn prepare_workdir(&self, workdir: &Path) -> std::io::Result<()> {
        if self.privileged {
            chown(
                workdir,
                Some(Uid::from_raw(UNPRIVILEGED_ID)),
                Some(Gid::from_raw(UNPRIVILEGED_ID)),
            )?;
        }
        Ok(())
    }

    /// Clear the environment, pin the working directory and confine `cmd`
    /// before it execs
    pub fn confine(&self, cmd: &mut Command, workdir: &Path, limits: SandboxLimits) {
        cmd.env_clear()
            .env("PATH", CONFINED_PATH)
            .env("TMPDIR", workdir)
            .current_dir(workdir);

        let privileged = self.privileged;
        // SAFETY: the hook runs in the forked child before exec and only
        // issues raw syscalls, no allocation or locking.
        unsafe {
            cmd.pre_exec(move || enter(privileged, &limits));
        }
    }
}

/// Runs in the child between fork and exec
fn enter(privileged: bool, limits: &SandboxLimits) -> std::io::Result<()> {
    let mut namespaces =
        CloneFlags::CLONE_NEWNET | CloneFlags::CLONE_NEWIPC | CloneFlags::CLONE_NEWUTS;
    if !privileged {
        namespaces |= CloneFlags::CLONE_NEWUSER;
    }
    unshare(namespaces)?;

    if privileged {
        setgroups(&[])?;
        setgid(Gid::from_raw(UNPRIVILEGED_ID))?;
        setuid(Uid::from_raw(UNPRIVILEGED_ID))?;
    }

    // Limits go last so the uid switch is not charged against them
    set_limit(Resource::RLIMIT_CPU, limits.cpu_secs)?;
    set_limit(Resource::RLIMIT_AS, limits.memory_mb * 1024 * 1024)?;
    set_limit(Resource::RLIMIT_FSIZE, limits.fsize_kb * 1024)?;
    set_limit(Resource::RLIMIT_NOFILE, limits.open_files)?;
    set_limit(Resource::RLIMIT_CORE, 0)?;
    if let Some(processes) = limits.processes {
        set_limit(Resource::RLIMIT_NPROC, processes)?;
    }
    Ok(())
}

fn set_limit(resource: Resource, value: u64) -> nix::Result<()> {
    setrlimit(resource, value, value)
}
