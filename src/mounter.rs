//! Narrow wrapper around the union-mount syscalls.

use nix::errno::Errno;
use nix::mount::{mount, umount2, MntFlags, MsFlags};
use std::path::{Path, PathBuf};

/// The two OS operations the sandbox layer needs. Kept behind a trait so
/// layer ordering, reference counting and sweeping can run unprivileged.
pub trait Mounter: Send + Sync {
    fn mount(&self, fstype: &str, target: &Path, options: &str) -> Result<(), Errno>;
    fn unmount(&self, target: &Path, lazy: bool) -> Result<(), Errno>;
}

/// Real overlayfs mounts via `mount(2)` / `umount2(2)`. Requires CAP_SYS_ADMIN.
#[derive(Debug, Default, Clone, Copy)]
pub struct OverlayMounter;

impl Mounter for OverlayMounter {
    fn mount(&self, fstype: &str, target: &Path, options: &str) -> Result<(), Errno> {
        mount(
            Some(fstype),
            target,
            Some(fstype),
            MsFlags::MS_NOSUID | MsFlags::MS_NODEV,
            Some(options),
        )
    }

    fn unmount(&self, target: &Path, lazy: bool) -> Result<(), Errno> {
        let flags = if lazy { MntFlags::MNT_DETACH } else { MntFlags::empty() };
        umount2(target, flags)
    }
}

/// Build the overlayfs option string. `lower` is ordered top-most first;
/// the shared base image is expected to be the last entry.
pub fn overlay_options(lower: &[PathBuf], upper: &Path, work: &Path) -> String {
    let lowerdir = lower
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(":");
    format!(
        "lowerdir={},upperdir={},workdir={}",
        lowerdir,
        upper.display(),
        work.display()
    )
}
