//! Test doubles shared by the unit tests.

use crate::mounter::Mounter;
use nix::errno::Errno;
use parking_lot::Mutex;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};

/// Emulates an overlay mount by copying every layer into the target,
/// bottom layer first.
#[derive(Default)]
pub struct FakeMounter {
    mounts: AtomicUsize,
    unmounts: AtomicUsize,
    mount_error: Mutex<Option<Errno>>,
    unmount_error: Mutex<Option<Errno>>,
}

impl FakeMounter {
    pub fn mounts(&self) -> usize {
        self.mounts.load(Ordering::SeqCst)
    }

    pub fn unmounts(&self) -> usize {
        self.unmounts.load(Ordering::SeqCst)
    }

    pub fn fail_mount(&self, errno: Errno) {
        *self.mount_error.lock() = Some(errno);
    }

    pub fn fail_unmount(&self, errno: Errno) {
        *self.unmount_error.lock() = Some(errno);
    }
}

impl Mounter for FakeMounter {
    fn mount(&self, fstype: &str, target: &Path, options: &str) -> Result<(), Errno> {
        assert_eq!(fstype, "overlay");
        if let Some(errno) = *self.mount_error.lock() {
            return Err(errno);
        }
        let mut lower = Vec::new();
        let mut upper = None;
        for opt in options.split(',') {
            if let Some(list) = opt.strip_prefix("lowerdir=") {
                lower = list.split(':').map(PathBuf::from).collect();
            } else if let Some(dir) = opt.strip_prefix("upperdir=") {
                upper = Some(PathBuf::from(dir));
            }
        }
        for layer in lower.iter().rev().chain(upper.iter()) {
            copy_tree(layer, target).map_err(|_| Errno::EIO)?;
        }
        self.mounts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn unmount(&self, _target: &Path, _lazy: bool) -> Result<(), Errno> {
        if let Some(errno) = *self.unmount_error.lock() {
            return Err(errno);
        }
        self.unmounts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

fn copy_tree(from: &Path, to: &Path) -> std::io::Result<()> {
    fs::create_dir_all(to)?;
    for entry in fs::read_dir(from)? {
        let entry = entry?;
        let dest = to.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_tree(&entry.path(), &dest)?;
        } else {
            fs::copy(entry.path(), dest)?;
        }
    }
    Ok(())
}

/// Lay out a small base image under `<base>/defaultfs`.
pub fn provision(base: &Path) {
    let image = base.join("defaultfs");
    for dir in ["etc/ssh", "home/bob", "root", "tmp", "var/log", "bin"] {
        fs::create_dir_all(image.join(dir)).unwrap();
    }
    fs::write(image.join("etc/hostname"), "web01\n").unwrap();
    fs::write(image.join("etc/passwd"), "root:x:0:0:root:/root:/bin/bash\n").unwrap();
    fs::write(image.join("home/bob/notes.txt"), "remember the milk\n").unwrap();
}

/// Keeps every recorded event in memory.
#[derive(Default)]
pub struct MemoryRecorder {
    pub inputs: Mutex<Vec<String>>,
    pub outputs: Mutex<Vec<String>>,
}

impl crate::profile::Recorder for MemoryRecorder {
    fn record_input(&self, _session: &str, line: &str) {
        self.inputs.lock().push(line.to_string());
    }

    fn record_output(&self, _session: &str, text: &str) {
        self.outputs.lock().push(text.to_string());
    }
}

/// Serve settings rooted at a provisioned `base`, unthrottled and unpaced.
pub fn serve_config(base: &Path, extra: &[&str]) -> crate::config::ServeConfig {
    use crate::config::{Args, Commands};
    use clap::Parser;

    provision(base);
    let base_arg = base.display().to_string();
    let mut argv = vec!["decoy", "serve", "--base-dir", base_arg.as_str(), "--rate", "0", "--stats-port", "0"];
    argv.extend_from_slice(extra);
    let Commands::Serve(args) = Args::try_parse_from(argv).unwrap().command;
    let mut config = args.into_config().unwrap();
    config.profile.pacing_ms = 0;
    config
}
