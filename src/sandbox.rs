//! Per-attacker overlay sandboxes.
//!
//! Every sandbox identity gets its own directory tree under
//! `<base>/sandboxes/<identity>/` holding an upper layer, an overlay work
//! area and a merge point. The shared base image at `<base>/defaultfs` is
//! always the bottom lower layer and is never written to.
//!
//! Mounts are reference counted by [`SandboxManager`]. Releasing the last
//! reference only deactivates the identity; the actual unmount happens in
//! the background sweep so that a mount is never pulled out from under an
//! open file handle.

use crate::error::{DecoyError, DecoyResult};
use crate::mounter::{overlay_options, Mounter};
use nix::errno::Errno;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::fs::{self, File, OpenOptions};
use std::io;
use std::os::unix::fs::{DirBuilderExt, PermissionsExt};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{debug, info, warn};

const BASE_IMAGE_DIR: &str = "defaultfs";
const SANDBOXES_DIR: &str = "sandboxes";
const MERGE_PREFIX: &str = "merge-";
const WORK_PREFIX: &str = "work-";
const LAYERS_DIR: &str = "layers";
const SHARED_LAYER: &str = "data";
const MAX_SYMLINK_HOPS: usize = 40;

/// How per-identity layer directories are named.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum LayerNaming {
    /// `merge-data`, `work-data`, `layers/data`.
    #[default]
    Shared,
    /// `merge-<ts>`, `work-<ts>`, `layers/<ts>`; earlier layers are stacked below.
    Timestamped,
}

/// How a remote peer is mapped to a sandbox identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum IdentityPolicy {
    /// One sandbox per remote host.
    #[default]
    PerSource,
    /// All peers within the same time window share a sandbox.
    TimeBucket,
}

/// Opaque key grouping one or more sessions onto the same mount.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SandboxIdentity(String);

impl SandboxIdentity {
    /// Build an identity from an arbitrary string. Anything outside
    /// `[A-Za-z0-9._-]` becomes `_` so the key is always a single path segment.
    pub fn new(raw: &str) -> DecoyResult<Self> {
        let cleaned: String = raw
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') { c } else { '_' })
            .collect();
        if cleaned.is_empty() || cleaned.chars().all(|c| c == '.') {
            return Err(DecoyError::SessionIdentity(raw.to_string()));
        }
        Ok(Self(cleaned))
    }

    pub fn for_peer(policy: IdentityPolicy, host: &str, now_unix: u64, bucket_secs: u64) -> DecoyResult<Self> {
        match policy {
            IdentityPolicy::PerSource => Self::new(host),
            IdentityPolicy::TimeBucket => Self::new(&format!("t{}", now_unix / bucket_secs.max(1))),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SandboxIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// How a file is opened through [`SandboxMount::open`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Read,
    /// Create or truncate. Missing parent directories are created.
    Write,
    /// Create if absent, keep contents otherwise.
    Touch,
}

/// One layered filesystem rooted at a private merge directory.
pub struct SandboxMount {
    identity: SandboxIdentity,
    merged: PathBuf,
    upper: PathBuf,
    work: PathBuf,
    lower: Vec<PathBuf>,
    mounted: RwLock<bool>,
    mounter: Arc<dyn Mounter>,
}

impl std::fmt::Debug for SandboxMount {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SandboxMount")
            .field("identity", &self.identity)
            .field("merged", &self.merged)
            .field("mounted", &*self.mounted.read())
            .finish()
    }
}

impl SandboxMount {
    pub fn identity(&self) -> &SandboxIdentity {
        &self.identity
    }

    pub fn merged_dir(&self) -> &Path {
        &self.merged
    }

    pub fn upper_dir(&self) -> &Path {
        &self.upper
    }

    pub fn work_dir(&self) -> &Path {
        &self.work
    }

    /// Lower layers, top-most first. The base image is always last.
    pub fn lower_layers(&self) -> &[PathBuf] {
        &self.lower
    }

    pub fn is_mounted(&self) -> bool {
        *self.mounted.read()
    }

    /// Ensure the layer directories exist and mount the overlay. Idempotent.
    pub fn mount(&self) -> DecoyResult<()> {
        let mut mounted = self.mounted.write();
        if *mounted {
            return Ok(());
        }
        for dir in [&self.merged, &self.upper, &self.work] {
            fs::create_dir_all(dir)?;
        }
        if !self.merged.is_dir() {
            return Err(DecoyError::MountFailure {
                target: self.merged.clone(),
                errno: Errno::ENOENT,
            });
        }
        let options = overlay_options(&self.lower, &self.upper, &self.work);
        self.mounter
            .mount("overlay", &self.merged, &options)
            .map_err(|errno| DecoyError::MountFailure {
                target: self.merged.clone(),
                errno,
            })?;
        *mounted = true;
        info!(identity = %self.identity, merged = ?self.merged, "Sandbox mounted");
        Ok(())
    }

    /// Detach the overlay and remove the merge and work directories.
    /// "Not mounted" and "already removed" count as success.
    pub fn unmount(&self) -> DecoyResult<()> {
        let mut mounted = self.mounted.write();
        reclaim(self.mounter.as_ref(), &self.merged, &self.work)?;
        *mounted = false;
        Ok(())
    }

    /// Map a sandbox path onto the host, rejecting anything that would land
    /// outside the merge directory. Absolute paths are taken relative to the
    /// sandbox root, and so are absolute symlink targets inside the image.
    pub fn resolve(&self, path: &str) -> DecoyResult<PathBuf> {
        self.walk(path, true)
    }

    /// Expand `path` one component at a time from the merge root. Symlinks
    /// are followed by hand so that the returned path contains none, except
    /// for the final component when `follow_last` is false.
    fn walk(&self, path: &str, follow_last: bool) -> DecoyResult<PathBuf> {
        let mut pending = VecDeque::new();
        let mut depth = 0usize;
        for component in Path::new(path).components() {
            match component {
                Component::RootDir | Component::CurDir | Component::Prefix(_) => {}
                Component::ParentDir => {
                    if depth == 0 {
                        return Err(DecoyError::PathEscape(path.to_string()));
                    }
                    depth -= 1;
                    pending.push_back(component.as_os_str().to_os_string());
                }
                Component::Normal(segment) => {
                    depth += 1;
                    pending.push_back(segment.to_os_string());
                }
            }
        }
        if !self.merged.is_dir() {
            return Err(DecoyError::Unmounted(self.identity.to_string()));
        }

        let mut rel = PathBuf::new();
        let mut hops = 0;
        while let Some(segment) = pending.pop_front() {
            if segment == ".." {
                if !rel.pop() {
                    return Err(DecoyError::PathEscape(path.to_string()));
                }
                continue;
            }
            let candidate = self.merged.join(&rel).join(&segment);
            let is_link = fs::symlink_metadata(&candidate)
                .map(|meta| meta.file_type().is_symlink())
                .unwrap_or(false);
            if !is_link || (pending.is_empty() && !follow_last) {
                rel.push(&segment);
                continue;
            }

            hops += 1;
            if hops > MAX_SYMLINK_HOPS {
                return Err(DecoyError::PathEscape(path.to_string()));
            }
            let target = fs::read_link(&candidate).map_err(|e| DecoyError::from_io(e, path))?;
            if target.is_absolute() {
                rel.clear();
            }
            let expanded = target.components().filter_map(|c| match c {
                Component::Normal(s) => Some(s.to_os_string()),
                Component::ParentDir => Some(c.as_os_str().to_os_string()),
                _ => None,
            });
            for (i, part) in expanded.enumerate() {
                pending.insert(i, part);
            }
        }

        if rel.as_os_str().is_empty() {
            Ok(self.merged.clone())
        } else {
            Ok(self.merged.join(rel))
        }
    }

    fn checked(&self, path: &str) -> DecoyResult<(parking_lot::RwLockReadGuard<'_, bool>, PathBuf)> {
        self.checked_with(path, true)
    }

    fn checked_with(
        &self,
        path: &str,
        follow_last: bool,
    ) -> DecoyResult<(parking_lot::RwLockReadGuard<'_, bool>, PathBuf)> {
        let guard = self.mounted.read();
        if !*guard {
            return Err(DecoyError::Unmounted(self.identity.to_string()));
        }
        let full = self.walk(path, follow_last)?;
        Ok((guard, full))
    }

    pub fn open(&self, path: &str, access: Access) -> DecoyResult<File> {
        let (_guard, full) = self.checked(path)?;
        let mut options = OpenOptions::new();
        match access {
            Access::Read => {
                options.read(true);
            }
            Access::Write => {
                options.write(true).create(true).truncate(true);
            }
            Access::Touch => {
                options.append(true).create(true);
            }
        }
        if access != Access::Read {
            if let Some(parent) = full.parent() {
                fs::create_dir_all(parent).map_err(|e| DecoyError::from_io(e, path))?;
            }
        }
        options.open(&full).map_err(|e| DecoyError::from_io(e, path))
    }

    pub fn read(&self, path: &str) -> DecoyResult<Vec<u8>> {
        let (_guard, full) = self.checked(path)?;
        if full.is_dir() {
            return Err(DecoyError::IsADirectory(path.to_string()));
        }
        fs::read(&full).map_err(|e| DecoyError::from_io(e, path))
    }

    /// Write `data` to `path` and apply `mode`.
    pub fn write(&self, path: &str, data: &[u8], mode: u32) -> DecoyResult<()> {
        use std::io::Write;

        let mut file = self.open(path, Access::Write)?;
        file.write_all(data)?;
        file.set_permissions(fs::Permissions::from_mode(mode & 0o7777))?;
        Ok(())
    }

    /// Remove a file, or with `recursive` a whole directory tree.
    /// A symlink is removed itself, never its target.
    pub fn remove(&self, path: &str, recursive: bool) -> DecoyResult<()> {
        let (_guard, full) = self.checked_with(path, false)?;
        let meta = fs::symlink_metadata(&full).map_err(|e| DecoyError::from_io(e, path))?;
        let result = if meta.is_dir() {
            if !recursive {
                return Err(DecoyError::IsADirectory(path.to_string()));
            }
            fs::remove_dir_all(&full)
        } else {
            fs::remove_file(&full)
        };
        result.map_err(|e| DecoyError::from_io(e, path))
    }

    pub fn make_dir(&self, path: &str, mode: u32) -> DecoyResult<()> {
        let (_guard, full) = self.checked(path)?;
        fs::DirBuilder::new()
            .mode(mode & 0o7777)
            .create(&full)
            .map_err(|e| DecoyError::from_io(e, path))
    }

    pub fn make_dir_all(&self, path: &str, mode: u32) -> DecoyResult<()> {
        let (_guard, full) = self.checked(path)?;
        fs::DirBuilder::new()
            .recursive(true)
            .mode(mode & 0o7777)
            .create(&full)
            .map_err(|e| DecoyError::from_io(e, path))
    }

    /// Directory entry names, sorted.
    pub fn read_dir(&self, path: &str) -> DecoyResult<Vec<String>> {
        let (_guard, full) = self.checked(path)?;
        let mut names = fs::read_dir(&full)
            .map_err(|e| DecoyError::from_io(e, path))?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.file_name().to_string_lossy().into_owned())
            .collect::<Vec<_>>();
        names.sort();
        Ok(names)
    }

    pub fn exists(&self, path: &str) -> bool {
        self.checked(path).map(|(_, full)| full.exists()).unwrap_or(false)
    }

    pub fn is_dir(&self, path: &str) -> bool {
        self.checked(path).map(|(_, full)| full.is_dir()).unwrap_or(false)
    }
}

/// Unmount `merged` and remove it together with `work`.
fn reclaim(mounter: &dyn Mounter, merged: &Path, work: &Path) -> DecoyResult<()> {
    match mounter.unmount(merged, true) {
        // EINVAL: not a mount point, ENOENT: already gone
        Ok(()) | Err(Errno::EINVAL) | Err(Errno::ENOENT) => {}
        Err(errno) => {
            return Err(DecoyError::MountFailure {
                target: merged.to_path_buf(),
                errno,
            })
        }
    }
    for dir in [merged, work] {
        match fs::remove_dir_all(dir) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

struct ActiveEntry {
    mount: Arc<SandboxMount>,
    refs: usize,
}

/// Outcome of one reclamation pass.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepReport {
    pub reclaimed: usize,
    pub busy: usize,
    pub failed: usize,
}

/// Creates, shares and reclaims [`SandboxMount`]s.
pub struct SandboxManager {
    base_dir: PathBuf,
    naming: LayerNaming,
    mounter: Arc<dyn Mounter>,
    active: Mutex<HashMap<SandboxIdentity, ActiveEntry>>,
}

impl SandboxManager {
    pub fn new(base_dir: impl Into<PathBuf>, naming: LayerNaming, mounter: Arc<dyn Mounter>) -> DecoyResult<Self> {
        let base_dir = base_dir.into();
        let image = base_dir.join(BASE_IMAGE_DIR);
        if !image.is_dir() {
            warn!(image = ?image, "Base image missing, sandboxes will start empty");
            fs::create_dir_all(&image)?;
        }
        fs::create_dir_all(base_dir.join(SANDBOXES_DIR))?;
        Ok(Self {
            base_dir,
            naming,
            mounter,
            active: Mutex::new(HashMap::new()),
        })
    }

    pub fn base_image(&self) -> PathBuf {
        self.base_dir.join(BASE_IMAGE_DIR)
    }

    fn sandboxes_dir(&self) -> PathBuf {
        self.base_dir.join(SANDBOXES_DIR)
    }

    /// Return the registered mount for `identity`, or register a new unmounted
    /// one. Each call takes a reference that must be given back with
    /// [`deactivate`].
    ///
    /// [`deactivate`]: SandboxManager::deactivate
    pub async fn get_or_create(&self, identity: &SandboxIdentity) -> Arc<SandboxMount> {
        let mut active = self.active.lock().await;
        if let Some(entry) = active.get_mut(identity) {
            entry.refs += 1;
            return entry.mount.clone();
        }

        let mount = Arc::new(self.layout(identity));
        debug!(identity = %identity, merged = ?mount.merged, "Sandbox registered");
        active.insert(
            identity.clone(),
            ActiveEntry {
                mount: mount.clone(),
                refs: 1,
            },
        );
        mount
    }

    fn layout(&self, identity: &SandboxIdentity) -> SandboxMount {
        let root = self.sandboxes_dir().join(identity.as_str());
        let layers = root.join(LAYERS_DIR);
        let (tag, mut lower) = match self.naming {
            LayerNaming::Shared => (SHARED_LAYER.to_string(), Vec::new()),
            LayerNaming::Timestamped => {
                let ts = SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .map(|d| d.as_secs())
                    .unwrap_or_default();
                (ts.to_string(), earlier_layers(&layers, ts))
            }
        };
        lower.push(self.base_image());
        SandboxMount {
            identity: identity.clone(),
            merged: root.join(format!("{MERGE_PREFIX}{tag}")),
            upper: layers.join(&tag),
            work: root.join(format!("{WORK_PREFIX}{tag}")),
            lower,
            mounted: RwLock::new(false),
            mounter: self.mounter.clone(),
        }
    }

    /// Give back one reference. Once none remain the identity is no longer
    /// active and the next sweep may reclaim it. Returns true in that case.
    /// The mount itself stays registered until then, so a peer coming back
    /// before the sweep picks up the same, still mounted, overlay.
    pub async fn deactivate(&self, mount: &SandboxMount) -> bool {
        let mut active = self.active.lock().await;
        let Some(entry) = active.get_mut(&mount.identity) else {
            return false;
        };
        if entry.refs == 0 {
            return false;
        }
        entry.refs -= 1;
        if entry.refs > 0 {
            return false;
        }
        debug!(identity = %mount.identity, "Sandbox deactivated");
        true
    }

    pub async fn is_active(&self, identity: &SandboxIdentity) -> bool {
        self.active
            .lock()
            .await
            .get(identity)
            .is_some_and(|entry| entry.refs > 0)
    }

    pub async fn active_count(&self) -> usize {
        self.active.lock().await.values().filter(|entry| entry.refs > 0).count()
    }

    /// One reclamation pass. Idle registered mounts are unmounted through
    /// [`SandboxMount::unmount`]; any other on-disk merge directory whose
    /// identity is not registered is left over from an earlier run and is
    /// reclaimed directly.
    ///
    /// The registry lock is held for the whole pass so nothing re-activates
    /// an identity halfway through its unmount.
    pub async fn sweep(&self) -> SweepReport {
        let mut report = SweepReport::default();
        let mut active = self.active.lock().await;

        let idle = active
            .iter()
            .filter(|(_, entry)| entry.refs == 0)
            .map(|(identity, entry)| (identity.clone(), entry.mount.clone()))
            .collect::<Vec<_>>();
        for (identity, mount) in idle {
            if tally(&mut report, &identity, &mount.merged, mount.unmount()) {
                active.remove(&identity);
            }
        }

        let identities = match fs::read_dir(self.sandboxes_dir()) {
            Ok(entries) => entries.filter_map(|e| e.ok()).collect::<Vec<_>>(),
            Err(e) => {
                warn!(error = %e, "Cannot list sandboxes");
                return report;
            }
        };
        for entry in identities {
            let name = entry.file_name().to_string_lossy().into_owned();
            let Ok(identity) = SandboxIdentity::new(&name) else { continue };
            if identity.as_str() != name || active.contains_key(&identity) {
                continue;
            }
            let root = entry.path();
            let merges = match fs::read_dir(&root) {
                Ok(children) => children
                    .filter_map(|c| c.ok())
                    .filter_map(|c| {
                        let child = c.file_name().to_string_lossy().into_owned();
                        child.strip_prefix(MERGE_PREFIX).map(str::to_string)
                    })
                    .collect::<Vec<_>>(),
                Err(e) => {
                    warn!(identity = %identity, error = %e, "Cannot list sandbox");
                    report.failed += 1;
                    continue;
                }
            };
            for tag in merges {
                let merged = root.join(format!("{MERGE_PREFIX}{tag}"));
                let work = root.join(format!("{WORK_PREFIX}{tag}"));
                let outcome = reclaim(self.mounter.as_ref(), &merged, &work);
                tally(&mut report, &identity, &merged, outcome);
            }
        }
        report
    }

    /// Run [`sweep`](SandboxManager::sweep) every `period` until the handle is aborted.
    pub fn spawn_sweeper(self: Arc<Self>, period: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = interval(period);
            loop {
                ticker.tick().await;
                let report = self.sweep().await;
                if report != SweepReport::default() {
                    debug!(?report, "Sandbox sweep finished");
                }
            }
        })
    }
}

/// Count one reclaim outcome. Returns true when the mount is gone.
fn tally(report: &mut SweepReport, identity: &SandboxIdentity, merged: &Path, outcome: DecoyResult<()>) -> bool {
    match outcome {
        Ok(()) => {
            info!(identity = %identity, merged = ?merged, "Sandbox reclaimed");
            report.reclaimed += 1;
            true
        }
        Err(DecoyError::MountFailure { errno: Errno::EBUSY, .. }) => {
            debug!(identity = %identity, "Sandbox busy, retrying next sweep");
            report.busy += 1;
            false
        }
        Err(e) => {
            warn!(identity = %identity, error = %e, "Sandbox reclaim failed");
            report.failed += 1;
            false
        }
    }
}

/// Existing `layers/<ts>` directories older than `current`, newest first.
fn earlier_layers(layers: &Path, current: u64) -> Vec<PathBuf> {
    let mut found = fs::read_dir(layers)
        .map(|entries| {
            entries
                .filter_map(|e| e.ok())
                .filter_map(|e| {
                    let ts = e.file_name().to_str()?.parse::<u64>().ok()?;
                    (ts < current && e.path().is_dir()).then_some((ts, e.path()))
                })
                .collect::<Vec<_>>()
        })
        .unwrap_or_default();
    found.sort_by(|a, b| b.0.cmp(&a.0));
    found.into_iter().map(|(_, path)| path).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{provision, FakeMounter};
    use tempfile::TempDir;

    fn manager(dir: &TempDir, naming: LayerNaming) -> (Arc<SandboxManager>, Arc<FakeMounter>) {
        provision(dir.path());
        let mounter = Arc::new(FakeMounter::default());
        let mgr = SandboxManager::new(dir.path(), naming, mounter.clone()).unwrap();
        (Arc::new(mgr), mounter)
    }

    async fn mounted(mgr: &SandboxManager, name: &str) -> Arc<SandboxMount> {
        let mount = mgr.get_or_create(&SandboxIdentity::new(name).unwrap()).await;
        mount.mount().unwrap();
        mount
    }

    #[test]
    fn identity_is_sanitized() {
        assert_eq!(SandboxIdentity::new("10.0.0.1").unwrap().as_str(), "10.0.0.1");
        assert_eq!(SandboxIdentity::new("../etc").unwrap().as_str(), ".._etc");
        assert_eq!(SandboxIdentity::new("::1").unwrap().as_str(), "__1");
        assert!(SandboxIdentity::new("..").is_err());
        assert!(SandboxIdentity::new("").is_err());
    }

    #[test]
    fn time_bucket_groups_peers() {
        let a = SandboxIdentity::for_peer(IdentityPolicy::TimeBucket, "1.2.3.4", 7200, 3600).unwrap();
        let b = SandboxIdentity::for_peer(IdentityPolicy::TimeBucket, "5.6.7.8", 10799, 3600).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.as_str(), "t2");
    }

    #[tokio::test]
    async fn get_or_create_returns_unmounted_with_base_last() {
        let dir = TempDir::new().unwrap();
        let (mgr, mounter) = manager(&dir, LayerNaming::Shared);
        let mount = mgr.get_or_create(&SandboxIdentity::new("peer").unwrap()).await;

        assert!(!mount.is_mounted());
        assert!(!mount.merged_dir().exists());
        assert_eq!(mount.lower_layers().last().unwrap(), &mgr.base_image());
        assert!(mount.merged_dir().ends_with("sandboxes/peer/merge-data"));
        assert!(mount.upper_dir().ends_with("sandboxes/peer/layers/data"));
        assert_eq!(mounter.mounts(), 0);
    }

    #[tokio::test]
    async fn mount_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let (mgr, mounter) = manager(&dir, LayerNaming::Shared);
        let mount = mounted(&mgr, "peer").await;
        mount.mount().unwrap();
        assert_eq!(mounter.mounts(), 1);
        assert!(mount.is_dir("/etc"));
    }

    #[tokio::test]
    async fn mount_failure_is_reported() {
        let dir = TempDir::new().unwrap();
        let (mgr, mounter) = manager(&dir, LayerNaming::Shared);
        mounter.fail_mount(Errno::EPERM);
        let mount = mgr.get_or_create(&SandboxIdentity::new("peer").unwrap()).await;
        let err = mount.mount().unwrap_err();
        assert!(matches!(err, DecoyError::MountFailure { errno: Errno::EPERM, .. }));
        assert!(!mount.is_mounted());
    }

    #[tokio::test]
    async fn traversal_is_rejected() {
        let dir = TempDir::new().unwrap();
        let (mgr, _) = manager(&dir, LayerNaming::Shared);
        let mount = mounted(&mgr, "peer").await;

        for path in ["../../etc/passwd", "/../etc/passwd", "etc/../../x", "/etc/../../../root"] {
            let err = mount.resolve(path).unwrap_err();
            assert!(matches!(err, DecoyError::PathEscape(_)), "{path}");
            assert!(matches!(mount.read(path), Err(DecoyError::PathEscape(_))), "{path}");
        }
        let inside = mount.resolve("/etc/../etc/./hostname").unwrap();
        assert!(inside.starts_with(mount.merged_dir()));
        assert_eq!(mount.resolve("/").unwrap(), mount.merged_dir());
    }

    #[tokio::test]
    async fn symlinks_never_leave_the_root() {
        let dir = TempDir::new().unwrap();
        let (mgr, _) = manager(&dir, LayerNaming::Shared);
        let mount = mounted(&mgr, "peer").await;
        let outside = dir.path().join("secret");
        fs::write(&outside, b"host").unwrap();
        let tmp = mount.merged_dir().join("tmp");
        std::os::unix::fs::symlink(&outside, tmp.join("link")).unwrap();
        std::os::unix::fs::symlink(dir.path().join("nowhere"), tmp.join("dangling")).unwrap();
        std::os::unix::fs::symlink("../../../../../../secret", tmp.join("climb")).unwrap();

        // absolute targets are looked up inside the sandbox, where they do not exist
        assert!(matches!(mount.read("/tmp/link"), Err(DecoyError::NotFound(_))));
        mount.write("/tmp/dangling", b"x", 0o644).unwrap();
        assert!(!dir.path().join("nowhere").exists());
        assert!(mount.resolve("/tmp/dangling").unwrap().starts_with(mount.merged_dir()));

        assert!(matches!(mount.read("/tmp/climb"), Err(DecoyError::PathEscape(_))));
        assert!(matches!(mount.open("/tmp/climb/x", Access::Write), Err(DecoyError::PathEscape(_))));
        assert_eq!(fs::read(&outside).unwrap(), b"host");
    }

    #[tokio::test]
    async fn absolute_links_in_the_image_resolve_inside() {
        let dir = TempDir::new().unwrap();
        let (mgr, _) = manager(&dir, LayerNaming::Shared);
        let mount = mounted(&mgr, "peer").await;
        mount.write("/usr/share/zoneinfo/UTC", b"TZif2", 0o644).unwrap();
        std::os::unix::fs::symlink("/usr/share/zoneinfo/UTC", mount.merged_dir().join("etc/localtime")).unwrap();
        std::os::unix::fs::symlink("/usr/share", mount.merged_dir().join("share")).unwrap();
        std::os::unix::fs::symlink("zoneinfo/UTC", mount.merged_dir().join("usr/share/utc")).unwrap();

        assert_eq!(mount.read("/etc/localtime").unwrap(), b"TZif2");
        assert_eq!(mount.read("/share/zoneinfo/UTC").unwrap(), b"TZif2");
        assert_eq!(mount.read("/share/utc").unwrap(), b"TZif2");
        assert_eq!(
            mount.resolve("/etc/localtime").unwrap(),
            mount.merged_dir().join("usr/share/zoneinfo/UTC")
        );

        mount.remove("/etc/localtime", false).unwrap();
        assert!(!mount.exists("/etc/localtime"));
        assert_eq!(mount.read("/usr/share/zoneinfo/UTC").unwrap(), b"TZif2");
    }

    #[tokio::test]
    async fn symlink_loops_are_cut_off() {
        let dir = TempDir::new().unwrap();
        let (mgr, _) = manager(&dir, LayerNaming::Shared);
        let mount = mounted(&mgr, "peer").await;
        std::os::unix::fs::symlink("/tmp/b", mount.merged_dir().join("tmp/a")).unwrap();
        std::os::unix::fs::symlink("/tmp/a", mount.merged_dir().join("tmp/b")).unwrap();
        assert!(matches!(mount.read("/tmp/a"), Err(DecoyError::PathEscape(_))));
    }

    #[tokio::test]
    async fn write_creates_missing_parents() {
        let dir = TempDir::new().unwrap();
        let (mgr, _) = manager(&dir, LayerNaming::Shared);
        let mount = mounted(&mgr, "peer").await;

        mount.write("/opt/deep/nested/file", b"x", 0o644).unwrap();
        assert_eq!(mount.read("/opt/deep/nested/file").unwrap(), b"x");
        assert!(mount.read_dir("/opt").unwrap().contains(&"deep".to_string()));
        assert!(matches!(mount.read("/opt/deep"), Err(DecoyError::IsADirectory(_))));
        assert!(matches!(mount.read_dir("/nope"), Err(DecoyError::NotFound(_))));
    }

    #[tokio::test]
    async fn remove_requires_recursive_for_dirs() {
        let dir = TempDir::new().unwrap();
        let (mgr, _) = manager(&dir, LayerNaming::Shared);
        let mount = mounted(&mgr, "peer").await;
        mount.make_dir_all("/tmp/a/b", 0o755).unwrap();

        assert!(matches!(mount.remove("/tmp/a", false), Err(DecoyError::IsADirectory(_))));
        mount.remove("/tmp/a", true).unwrap();
        assert!(!mount.exists("/tmp/a"));
        assert!(matches!(mount.remove("/tmp/a", false), Err(DecoyError::NotFound(_))));
    }

    #[tokio::test]
    async fn operations_require_mount() {
        let dir = TempDir::new().unwrap();
        let (mgr, _) = manager(&dir, LayerNaming::Shared);
        let mount = mgr.get_or_create(&SandboxIdentity::new("peer").unwrap()).await;
        assert!(matches!(mount.read_dir("/"), Err(DecoyError::Unmounted(_))));
        assert!(!mount.exists("/etc"));
    }

    #[tokio::test]
    async fn concurrent_creates_share_one_mount() {
        let dir = TempDir::new().unwrap();
        let (mgr, _) = manager(&dir, LayerNaming::Shared);
        let identity = SandboxIdentity::new("shared").unwrap();

        let tasks = (0..8)
            .map(|_| {
                let mgr = mgr.clone();
                let identity = identity.clone();
                tokio::spawn(async move { mgr.get_or_create(&identity).await })
            })
            .collect::<Vec<_>>();
        let mut mounts = Vec::new();
        for task in tasks {
            mounts.push(task.await.unwrap());
        }
        assert!(mounts.iter().all(|m| Arc::ptr_eq(m, &mounts[0])));
        assert_eq!(mgr.active_count().await, 1);

        mounts[0].mount().unwrap();
        for mount in &mounts[..7] {
            assert!(!mgr.deactivate(mount).await);
            assert_eq!(mgr.sweep().await.reclaimed, 0);
            assert!(mounts[0].merged_dir().exists());
        }
        assert!(mgr.deactivate(&mounts[7]).await);
        assert_eq!(mgr.sweep().await.reclaimed, 1);
        assert!(!mounts[0].merged_dir().exists());
        assert!(!mounts[0].work_dir().exists());
        assert!(mounts[0].upper_dir().exists());
    }

    #[tokio::test]
    async fn sweep_tolerates_unmounted_and_skips_busy() {
        let dir = TempDir::new().unwrap();
        let (mgr, mounter) = manager(&dir, LayerNaming::Shared);

        let stale = mounted(&mgr, "stale").await;
        mgr.deactivate(&stale).await;
        mounter.fail_unmount(Errno::EBUSY);
        let report = mgr.sweep().await;
        assert_eq!(report.busy, 1);
        assert!(stale.merged_dir().exists());

        mounter.fail_unmount(Errno::EINVAL);
        assert_eq!(mgr.sweep().await.reclaimed, 1);
        assert!(!stale.merged_dir().exists());
    }

    #[tokio::test]
    async fn reactivation_reuses_the_idle_mount() {
        let dir = TempDir::new().unwrap();
        let (mgr, mounter) = manager(&dir, LayerNaming::Shared);
        let identity = SandboxIdentity::new("peer").unwrap();
        let first = mounted(&mgr, "peer").await;
        first.write("/tmp/dropper", b"1", 0o644).unwrap();

        assert!(mgr.deactivate(&first).await);
        assert!(!mgr.is_active(&identity).await);
        assert_eq!(mgr.active_count().await, 0);

        let second = mgr.get_or_create(&identity).await;
        assert!(Arc::ptr_eq(&first, &second));
        assert!(second.is_mounted());
        second.mount().unwrap();
        assert_eq!(mounter.mounts(), 1);
        assert!(mgr.is_active(&identity).await);

        assert_eq!(mgr.sweep().await, SweepReport::default());
        assert_eq!(second.read("/tmp/dropper").unwrap(), b"1");
        assert!(mgr.deactivate(&second).await);
    }

    #[tokio::test]
    async fn sweep_unmounts_through_the_mount() {
        let dir = TempDir::new().unwrap();
        let (mgr, mounter) = manager(&dir, LayerNaming::Shared);
        let mount = mounted(&mgr, "peer").await;
        assert!(mgr.deactivate(&mount).await);
        assert!(!mgr.deactivate(&mount).await);

        assert_eq!(mgr.sweep().await.reclaimed, 1);
        assert!(!mount.is_mounted());
        assert_eq!(mounter.unmounts(), 1);
        assert!(matches!(mount.read("/etc/hostname"), Err(DecoyError::Unmounted(_))));

        // a later peer gets a fresh registration and mounts again
        let again = mounted(&mgr, "peer").await;
        assert!(!Arc::ptr_eq(&mount, &again));
        assert_eq!(mounter.mounts(), 2);
    }

    #[tokio::test]
    async fn sweep_reclaims_leftovers_from_earlier_runs() {
        let dir = TempDir::new().unwrap();
        let (mgr, mounter) = manager(&dir, LayerNaming::Shared);
        let root = dir.path().join("sandboxes/old");
        fs::create_dir_all(root.join("merge-123")).unwrap();
        fs::create_dir_all(root.join("work-123")).unwrap();
        fs::create_dir_all(root.join("layers/123")).unwrap();

        assert_eq!(mgr.sweep().await.reclaimed, 1);
        assert_eq!(mounter.unmounts(), 1);
        assert!(!root.join("merge-123").exists());
        assert!(!root.join("work-123").exists());
        assert!(root.join("layers/123").exists());
    }

    #[tokio::test]
    async fn sweep_leaves_active_sandboxes() {
        let dir = TempDir::new().unwrap();
        let (mgr, mounter) = manager(&dir, LayerNaming::Shared);
        let live = mounted(&mgr, "live").await;
        let report = mgr.sweep().await;
        assert_eq!(report, SweepReport::default());
        assert_eq!(mounter.unmounts(), 0);
        assert!(live.is_dir("/etc"));
    }

    #[tokio::test]
    async fn timestamped_layers_stack_earlier_uppers() {
        let dir = TempDir::new().unwrap();
        let (mgr, _) = manager(&dir, LayerNaming::Timestamped);
        let layers = dir.path().join("sandboxes/peer/layers");
        fs::create_dir_all(layers.join("100")).unwrap();
        fs::create_dir_all(layers.join("200")).unwrap();

        let mount = mgr.get_or_create(&SandboxIdentity::new("peer").unwrap()).await;
        assert_eq!(
            mount.lower_layers(),
            &[layers.join("200"), layers.join("100"), mgr.base_image()]
        );
        let name = mount.merged_dir().file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with("merge-") && name != "merge-data");
    }
}
