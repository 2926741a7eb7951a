//! The exec probe attaches to a syscall tracepoint, which requires the debug
//! filesystem. Container images often start without it.

use std::{fs::DirBuilder, os::unix::fs::DirBuilderExt, path::Path};

use anyhow::{Context, Result, bail};
use procfs::process::Process;
use sys_mount::{FilesystemType, Mount, MountFlags};

pub const DEBUG_FS_PATH: &str = "/sys/kernel/debug";
const DEBUG_FS: &str = "debugfs";

/// Mount debugfs on [`DEBUG_FS_PATH`] unless it's already there.
pub fn check_or_mount_debug_fs() -> Result<()> {
    if is_debug_fs_mounted()? {
        log::debug!("{DEBUG_FS} already mounted on {DEBUG_FS_PATH}");
        return Ok(());
    }
    mount_debug_fs()
}

fn is_debug_fs_mounted() -> Result<bool> {
    let p_self = Process::myself().context("Error accessing /proc/self")?;
    let mount_info = p_self
        .mountinfo()
        .context("Error accessing process mount info")?;
    let debug_fs_path = Path::new(DEBUG_FS_PATH);

    for mount in mount_info {
        if mount.mount_point == debug_fs_path {
            if mount.fs_type == DEBUG_FS {
                return Ok(true);
            }
            bail!(
                "{DEBUG_FS_PATH} is mounted with type {} instead of {DEBUG_FS}",
                mount.fs_type
            )
        }
    }

    Ok(false)
}

fn mount_debug_fs() -> Result<()> {
    let debug_fs_path = Path::new(DEBUG_FS_PATH);

    if !debug_fs_path.exists() {
        log::debug!("Create '{DEBUG_FS_PATH}' because is not found");

        DirBuilder::new()
            .mode(0o700)
            .recursive(true)
            .create(DEBUG_FS_PATH)
            .with_context(|| format!("Error creating {DEBUG_FS_PATH}"))?;
    }
    if !debug_fs_path.is_dir() {
        bail!("'{DEBUG_FS_PATH}' already exists and is not a directory")
    }

    log::info!("Mounting {DEBUG_FS} on {DEBUG_FS_PATH}");

    Mount::builder()
        .fstype(FilesystemType::Manual(DEBUG_FS))
        .flags(MountFlags::empty())
        .mount(DEBUG_FS, DEBUG_FS_PATH)
        .context("Failed to mount debug file system")?;

    Ok(())
}
