use anyhow::{Result, anyhow, bail};

/// Lift the memlock rlimit so the probe maps can be created.
///
/// Kernels older than 5.11 account BPF map memory against `RLIMIT_MEMLOCK`,
/// and the exec ring buffer alone is larger than the usual default.
pub fn bump_memlock_rlimit() -> Result<()> {
    let rlimit = libc::rlimit {
        rlim_cur: libc::RLIM_INFINITY,
        rlim_max: libc::RLIM_INFINITY,
    };
    if unsafe { libc::setrlimit(libc::RLIMIT_MEMLOCK, &rlimit) } != 0 {
        bail!(anyhow!(std::io::Error::last_os_error()).context("Failed to increase memlock rlimit"))
    }
    Ok(())
}
