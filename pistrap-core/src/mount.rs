//! Temporary mounts of the boot and root partitions.
use crate::error::Result;
use crate::partitions::{BOOT_FSTYPE, PartitionPair, ROOT_FSTYPE};
use crate::platform::MountOps;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

/// Owns two private mount directories and whatever is mounted on them.
///
/// Dropping the scope unmounts in reverse order and removes the directories.
/// A directory whose unmount failed is left in place rather than deleted, so
/// nothing is ever removed through a live mount.
pub struct MountScope<'a, P: MountOps + ?Sized> {
    platform: &'a P,
    boot: Option<TempDir>,
    root: Option<TempDir>,
    mounted: Vec<PathBuf>,
}

impl<'a, P: MountOps + ?Sized> MountScope<'a, P> {
    /// Mounts `pair.boot` then `pair.root` under fresh directories in `parent`.
    pub fn open(platform: &'a P, pair: &PartitionPair, parent: &Path) -> Result<Self> {
        let boot = tempfile::Builder::new()
            .prefix("pistrap-boot-")
            .tempdir_in(parent)?;
        let root = tempfile::Builder::new()
            .prefix("pistrap-root-")
            .tempdir_in(parent)?;
        let mut scope = Self {
            platform,
            boot: Some(boot),
            root: Some(root),
            mounted: Vec::new(),
        };

        let boot_dir = scope.boot_dir().to_path_buf();
        platform.mount(&pair.boot, &boot_dir, BOOT_FSTYPE)?;
        scope.mounted.push(boot_dir);
        log::info!("Mounted {} at {}", pair.boot.display(), scope.boot_dir().display());

        let root_dir = scope.root_dir().to_path_buf();
        platform.mount(&pair.root, &root_dir, ROOT_FSTYPE)?;
        scope.mounted.push(root_dir);
        log::info!("Mounted {} at {}", pair.root.display(), scope.root_dir().display());

        Ok(scope)
    }

    pub fn boot_dir(&self) -> &Path {
        self.boot.as_ref().map(TempDir::path).unwrap_or(Path::new(""))
    }

    pub fn root_dir(&self) -> &Path {
        self.root.as_ref().map(TempDir::path).unwrap_or(Path::new(""))
    }

    /// Unmounts both partitions and removes the directories, reporting the
    /// first unmount failure.
    pub fn close(mut self) -> Result<()> {
        self.release()
    }

    fn release(&mut self) -> Result<()> {
        let mut first_error = None;
        let mut stuck = Vec::new();
        while let Some(target) = self.mounted.pop() {
            match self.platform.unmount(&target) {
                Ok(()) => log::debug!("Unmounted {}", target.display()),
                Err(e) => {
                    log::warn!("Failed to unmount {}: {}", target.display(), e);
                    stuck.push(target);
                    first_error.get_or_insert(e);
                }
            }
        }
        for dir in [self.boot.take(), self.root.take()].into_iter().flatten() {
            if stuck.iter().any(|s| s == dir.path()) {
                let kept = dir.keep();
                log::warn!("Leaving {} in place; it is still mounted", kept.display());
            } else if let Err(e) = dir.close() {
                log::warn!("Could not remove mount directory: {e}");
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl<P: MountOps + ?Sized> Drop for MountScope<'_, P> {
    fn drop(&mut self) {
        if self.boot.is_none() && self.root.is_none() && self.mounted.is_empty() {
            return;
        }
        // Errors were already logged.
        let _ = self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ProvisionError;
    use crate::platform::fake::{FakePlatform, Operation};
    use std::fs;
    use tempfile::tempdir;

    fn pair() -> PartitionPair {
        PartitionPair {
            boot: "/dev/sdb1".into(),
            root: "/dev/sdb2".into(),
        }
    }

    #[test]
    fn mounts_both_and_cleans_up_on_drop() {
        let boot_fs = tempdir().unwrap();
        let root_fs = tempdir().unwrap();
        let scratch = tempdir().unwrap();
        let platform = FakePlatform::new()
            .with_filesystem("/dev/sdb1", boot_fs.path())
            .with_filesystem("/dev/sdb2", root_fs.path());

        let (boot_dir, root_dir) = {
            let scope = MountScope::open(&platform, &pair(), scratch.path()).unwrap();
            fs::write(scope.boot_dir().join("ssh"), "").unwrap();
            fs::write(scope.root_dir().join("marker"), "").unwrap();
            (scope.boot_dir().to_path_buf(), scope.root_dir().to_path_buf())
        };

        assert!(boot_fs.path().join("ssh").exists());
        assert!(root_fs.path().join("marker").exists());
        assert!(!boot_dir.exists());
        assert!(!root_dir.exists());
        assert!(platform.mounted().is_empty());

        let unmounts: Vec<_> = platform
            .operations()
            .into_iter()
            .filter_map(|op| match op {
                Operation::Unmount { target } => Some(target),
                _ => None,
            })
            .collect();
        assert_eq!(unmounts, vec![root_dir, boot_dir]);
    }

    #[test]
    fn root_mount_failure_unwinds_boot() {
        let boot_fs = tempdir().unwrap();
        let scratch = tempdir().unwrap();
        let platform = FakePlatform::new().with_filesystem("/dev/sdb1", boot_fs.path());

        let err = MountScope::open(&platform, &pair(), scratch.path())
            .err()
            .unwrap();
        assert!(matches!(err, ProvisionError::MountFailed { .. }));
        assert!(platform.mounted().is_empty());
        assert_eq!(fs::read_dir(scratch.path()).unwrap().count(), 0);
    }

    #[test]
    fn close_reports_success() {
        let boot_fs = tempdir().unwrap();
        let root_fs = tempdir().unwrap();
        let scratch = tempdir().unwrap();
        let platform = FakePlatform::new()
            .with_filesystem("/dev/sdb1", boot_fs.path())
            .with_filesystem("/dev/sdb2", root_fs.path());
        let scope = MountScope::open(&platform, &pair(), scratch.path()).unwrap();
        scope.close().unwrap();
        assert_eq!(fs::read_dir(scratch.path()).unwrap().count(), 0);
    }

    #[test]
    fn busy_mount_keeps_its_directory_and_fails_close() {
        let boot_fs = tempdir().unwrap();
        let root_fs = tempdir().unwrap();
        let scratch = tempdir().unwrap();
        let platform = FakePlatform::new()
            .with_filesystem("/dev/sdb1", boot_fs.path())
            .with_filesystem("/dev/sdb2", root_fs.path())
            .with_busy_mount("/dev/sdb2");

        let scope = MountScope::open(&platform, &pair(), scratch.path()).unwrap();
        let boot_dir = scope.boot_dir().to_path_buf();
        let root_dir = scope.root_dir().to_path_buf();

        let err = scope.close().unwrap_err();
        assert!(matches!(err, ProvisionError::Command { ref stderr, .. } if stderr.contains("busy")));

        // Boot unmounted and removed; root still mounted and left in place.
        assert!(!boot_dir.exists());
        assert!(root_dir.exists());
        assert_eq!(platform.mounted(), vec![root_dir]);
    }
}
