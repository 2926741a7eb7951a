//! Container correlation through procfs.
//!
//! The node agent sees host processes through a bind mount of the host `/proc`
//! (usually `/host/proc`), so every lookup takes the proc root explicitly.

use std::{
    fs, io,
    path::{Path, PathBuf},
};

use nix::unistd::Pid;
use thiserror::Error;

/// Length container ids are truncated to. Runtimes disagree on suffixes past it.
pub const CONTAINER_ID_LEN: usize = 31;

/// Substrings marking a cgroup managed by a container runtime.
const CGROUP_MARKERS: [&str; 3] = ["pod", "docker", "libpod"];

#[derive(Error, Debug)]
pub enum ProcfsError {
    #[error("reading {path} failed")]
    ReadFile {
        #[source]
        source: io::Error,
        path: PathBuf,
    },
}

/// Returns the container id of `pid`, `None` for processes outside containers.
///
/// Fails when the process has no cgroup record, usually because it already exited.
pub fn get_process_container_id(proc_root: &Path, pid: Pid) -> Result<Option<String>, ProcfsError> {
    let path = proc_root.join(pid.to_string()).join("cgroup");
    let cgroups =
        fs::read_to_string(&path).map_err(|source| ProcfsError::ReadFile { source, path })?;

    Ok(get_container_id_from_cgroups(&cgroups))
}

fn get_container_id_from_cgroups(cgroups: &str) -> Option<String> {
    cgroups
        .lines()
        .filter(|line| CGROUP_MARKERS.iter().any(|marker| line.contains(marker)))
        .find_map(get_container_id_from_cgroup)
}

/// Extract the id from the last path segment of a cgroup line.
///
/// With the cgroupfs driver the segment looks like `cri-containerd:<id>`,
/// with systemd like `cri-containerd-<id>.scope`: keep what follows the last
/// `:` and then the last `-`.
fn get_container_id_from_cgroup(line: &str) -> Option<String> {
    let last_dir = line.rsplit('/').next()?;
    let after_colon = last_dir.rsplit(':').next()?;
    let id = after_colon.rsplit('-').next()?;

    (id.len() >= CONTAINER_ID_LEN).then(|| id.chars().take(CONTAINER_ID_LEN).collect())
}
