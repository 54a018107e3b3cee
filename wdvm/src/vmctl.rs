//! Thin wrapper around the external `vmctl` binary that actually drives the
//! hypervisor. The original forks and waits on this tool synchronously from
//! inside the single-threaded event loop; here each invocation is an async
//! child process so a slow `vmctl start` stalls only the task awaiting it,
//! not the rest of the daemon (see the fork/wait -> tokio::process redesign
//! note).

use std::path::{Path, PathBuf};

use log::debug;
use tokio::process::Command;

use crate::error::{Error, Result};

async fn run(vmctl_path: &Path, args: &[&str]) -> Result<()> {
    debug!("vmctl {:?}", args);
    let status = Command::new(vmctl_path)
        .args(args)
        .status()
        .await
        .map_err(|e| Error::VmctlSpawn(vmctl_path.to_path_buf(), e))?;
    if !status.success() {
        return Err(Error::VmctlFailed(
            args.iter().map(|s| s.to_string()).collect(),
            status,
        ));
    }
    Ok(())
}

/// `vmctl create -b <template-image> <overlay-path>`: build a copy-on-write
/// overlay disk backed by a read-only template image.
pub async fn create_overlay(vmctl_path: &Path, template_image: &Path, overlay: &Path) -> Result<()> {
    run(
        vmctl_path,
        &[
            "create",
            "-b",
            &template_image.to_string_lossy(),
            &overlay.to_string_lossy(),
        ],
    )
    .await
}

/// `vmctl start -t <template-name> -d <base> -d <vivado> <name>`
pub async fn start(
    vmctl_path: &Path,
    template_name: &str,
    base_disk: &Path,
    vivado_disk: &Path,
    name: &str,
) -> Result<()> {
    run(
        vmctl_path,
        &[
            "start",
            "-t",
            template_name,
            "-d",
            &base_disk.to_string_lossy(),
            "-d",
            &vivado_disk.to_string_lossy(),
            name,
        ],
    )
    .await
}

/// `vmctl stop -fw <name>`: forcibly stop and wait for teardown to finish.
/// Returns the raw exit status rather than erroring on non-zero, since
/// whether a failed stop is tolerable depends on the slot's state at the
/// call site (see `pool::reap`).
pub async fn stop(vmctl_path: &Path, name: &str) -> Result<std::process::ExitStatus> {
    debug!("vmctl stop -fw {name}");
    Command::new(vmctl_path)
        .args(["stop", "-fw", name])
        .status()
        .await
        .map_err(|e| Error::VmctlSpawn(vmctl_path.to_path_buf(), e))
}

pub fn basedisk_path(disks_dir: &Path, idx: usize) -> PathBuf {
    disks_dir.join(format!("base{idx}.qcow2"))
}

pub fn vivadodisk_path(disks_dir: &Path, idx: usize) -> PathBuf {
    disks_dir.join(format!("vivado{idx}.qcow2"))
}

pub fn slot_name(idx: usize) -> String {
    format!("wd{idx}")
}
