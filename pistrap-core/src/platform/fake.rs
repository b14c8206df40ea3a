//! In-memory platform for tests.
//!
//! Nothing here touches a device. Every call is appended to an [`Operation`]
//! log the test can inspect afterwards. Mounting is simulated by pointing the
//! mount directory at a fixture tree, so customization writes real files that
//! the test can read back.
use crate::device::BlockDevice;
use crate::error::{ProvisionError, Result};
use crate::partitions::PartitionInfo;
use crate::platform::{DiskOps, MountOps, ProbeOps, SystemOps};
use crate::progress::{Progress, Stage};
use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};

/// Hash returned for every password.
pub const FAKE_PASSWORD_HASH: &str = "$6$fakesalt$fakehashfakehashfakehash";

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Operation {
    UnmountAll { disk: PathBuf },
    ZeroHead { disk: PathBuf, len: u64 },
    CreateFat32Partition { disk: PathBuf },
    WriteImage { image: PathBuf, disk: PathBuf },
    Sync { disk: PathBuf },
    RereadPartitions { disk: PathBuf },
    Settle,
    HashPassword,
    Mount { device: PathBuf, target: PathBuf, fstype: String },
    Unmount { target: PathBuf },
}

#[derive(Debug, Default)]
struct FakeState {
    operations: Vec<Operation>,
    mounted: HashSet<PathBuf>,
    busy_targets: HashSet<PathBuf>,
}

#[derive(Debug, Default)]
pub struct FakePlatform {
    devices: Vec<BlockDevice>,
    partitions: Vec<PartitionInfo>,
    /// Partition device -> directory standing in for its filesystem.
    filesystems: HashMap<PathBuf, PathBuf>,
    missing_tools: HashSet<String>,
    has_settle: bool,
    fail_write: bool,
    busy_devices: HashSet<PathBuf>,
    state: Mutex<FakeState>,
}

impl FakePlatform {
    pub fn new() -> Self {
        Self {
            has_settle: true,
            ..Self::default()
        }
    }

    pub fn with_device(mut self, device: BlockDevice) -> Self {
        self.devices.push(device);
        self
    }

    /// Partitions reported for any disk.
    pub fn with_partitions(mut self, partitions: Vec<PartitionInfo>) -> Self {
        self.partitions = partitions;
        self
    }

    /// Mounting `device` exposes the contents of `root`.
    pub fn with_filesystem(mut self, device: impl Into<PathBuf>, root: impl Into<PathBuf>) -> Self {
        self.filesystems.insert(device.into(), root.into());
        self
    }

    pub fn without_tool(mut self, name: &str) -> Self {
        self.missing_tools.insert(name.to_string());
        self
    }

    pub fn without_settle(mut self) -> Self {
        self.has_settle = false;
        self
    }

    /// Makes every `write_image` fail part way.
    pub fn failing_writes(mut self) -> Self {
        self.fail_write = true;
        self
    }

    /// Wherever `device` gets mounted, unmounting it fails as busy.
    pub fn with_busy_mount(mut self, device: impl Into<PathBuf>) -> Self {
        self.busy_devices.insert(device.into());
        self
    }

    pub fn operations(&self) -> Vec<Operation> {
        self.state().operations.clone()
    }

    pub fn has_operation(&self, check: impl Fn(&Operation) -> bool) -> bool {
        self.state().operations.iter().any(check)
    }

    /// Targets still mounted.
    pub fn mounted(&self) -> Vec<PathBuf> {
        self.state().mounted.iter().cloned().collect()
    }

    fn state(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn record(&self, op: Operation) {
        self.state().operations.push(op);
    }
}

impl ProbeOps for FakePlatform {
    fn block_devices(&self) -> Result<Vec<BlockDevice>> {
        Ok(self.devices.clone())
    }

    fn partitions(&self, _disk: &Path) -> Result<Vec<PartitionInfo>> {
        Ok(self.partitions.clone())
    }

    fn find_tool(&self, name: &str) -> Option<PathBuf> {
        if self.missing_tools.contains(name) {
            None
        } else {
            Some(PathBuf::from("/usr/bin").join(name))
        }
    }
}

impl DiskOps for FakePlatform {
    fn unmount_all(&self, disk: &Path) -> Result<()> {
        self.record(Operation::UnmountAll {
            disk: disk.to_path_buf(),
        });
        Ok(())
    }

    fn zero_head(&self, disk: &Path, len: u64) -> Result<()> {
        self.record(Operation::ZeroHead {
            disk: disk.to_path_buf(),
            len,
        });
        Ok(())
    }

    fn create_fat32_partition(&self, disk: &Path) -> Result<()> {
        self.record(Operation::CreateFat32Partition {
            disk: disk.to_path_buf(),
        });
        Ok(())
    }

    fn write_image(
        &self,
        image: &Path,
        disk: &Path,
        running: &AtomicBool,
        progress: &dyn Progress,
    ) -> Result<u64> {
        self.record(Operation::WriteImage {
            image: image.to_path_buf(),
            disk: disk.to_path_buf(),
        });
        if !running.load(Ordering::SeqCst) {
            return Err(ProvisionError::cancelled());
        }
        let len = fs::metadata(image)
            .map_err(|_| ProvisionError::ImageUnavailable(image.to_path_buf()))?
            .len();
        progress.begin(Stage::Write, Some(len));
        if self.fail_write {
            progress.update(Stage::Write, len / 2);
            return Err(ProvisionError::WriteFailed {
                device: disk.to_path_buf(),
                reason: "No space left on device".into(),
            });
        }
        progress.update(Stage::Write, len);
        progress.finish(Stage::Write);
        Ok(len)
    }
}

impl SystemOps for FakePlatform {
    fn sync(&self, disk: &Path) -> Result<()> {
        self.record(Operation::Sync {
            disk: disk.to_path_buf(),
        });
        Ok(())
    }

    fn reread_partitions(&self, disk: &Path) -> Result<()> {
        self.record(Operation::RereadPartitions {
            disk: disk.to_path_buf(),
        });
        Ok(())
    }

    fn settle(&self) -> Result<bool> {
        if self.has_settle {
            self.record(Operation::Settle);
        }
        Ok(self.has_settle)
    }

    fn hash_password(&self, _password: &str) -> Result<String> {
        self.record(Operation::HashPassword);
        Ok(FAKE_PASSWORD_HASH.to_string())
    }
}

impl MountOps for FakePlatform {
    fn mount(&self, device: &Path, target: &Path, fstype: &str) -> Result<()> {
        self.record(Operation::Mount {
            device: device.to_path_buf(),
            target: target.to_path_buf(),
            fstype: fstype.to_string(),
        });
        let mount_failed = |reason: String| ProvisionError::MountFailed {
            device: device.to_path_buf(),
            target: target.to_path_buf(),
            reason,
        };
        let root = self
            .filesystems
            .get(device)
            .ok_or_else(|| mount_failed("no such device".into()))?;
        // The scope hands us an empty directory; swap it for a link.
        fs::remove_dir(target).map_err(|e| mount_failed(e.to_string()))?;
        std::os::unix::fs::symlink(root, target).map_err(|e| mount_failed(e.to_string()))?;
        let mut state = self.state();
        state.mounted.insert(target.to_path_buf());
        if self.busy_devices.contains(device) {
            state.busy_targets.insert(target.to_path_buf());
        }
        Ok(())
    }

    fn unmount(&self, target: &Path) -> Result<()> {
        self.record(Operation::Unmount {
            target: target.to_path_buf(),
        });
        if self.state().busy_targets.contains(target) {
            return Err(ProvisionError::Command {
                program: "umount".into(),
                code: Some(32),
                stderr: format!("{}: target is busy", target.display()),
            });
        }
        if !self.state().mounted.remove(target) {
            return Err(ProvisionError::Command {
                program: "umount".into(),
                code: Some(32),
                stderr: format!("{}: not mounted", target.display()),
            });
        }
        fs::remove_file(target)?;
        fs::create_dir(target)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn mount_exposes_fixture_and_unmount_restores_directory() {
        let fixture = tempdir().unwrap();
        fs::write(fixture.path().join("cmdline.txt"), "console=serial0").unwrap();
        let scratch = tempdir().unwrap();
        let target = scratch.path().join("boot");
        fs::create_dir(&target).unwrap();

        let platform = FakePlatform::new().with_filesystem("/dev/sdb1", fixture.path());
        platform
            .mount(Path::new("/dev/sdb1"), &target, "vfat")
            .unwrap();
        assert!(target.join("cmdline.txt").exists());
        fs::write(target.join("ssh"), "").unwrap();
        assert!(fixture.path().join("ssh").exists());

        platform.unmount(&target).unwrap();
        assert!(target.is_dir());
        assert!(fs::read_dir(&target).unwrap().next().is_none());
        assert!(platform.mounted().is_empty());
        assert!(platform.unmount(&target).is_err());
    }

    #[test]
    fn unknown_device_fails_to_mount() {
        let scratch = tempdir().unwrap();
        let platform = FakePlatform::new();
        let err = platform
            .mount(Path::new("/dev/sdz1"), scratch.path(), "ext4")
            .unwrap_err();
        assert!(matches!(err, ProvisionError::MountFailed { .. }));
    }

    #[test]
    fn tools_can_be_hidden() {
        let platform = FakePlatform::new().without_tool("mkfs.vfat");
        assert!(platform.find_tool("mkfs.vfat").is_none());
        assert!(platform.find_tool("lsblk").is_some());
    }
}
