//! Everything the pipeline asks of the host system.
//!
//! The traits here are the seam between the provisioning logic and the
//! machine it runs on. [`linux::LinuxPlatform`] is the real implementation;
//! [`fake::FakePlatform`] records every operation so pipelines can be
//! exercised without devices, root or a terminal.
use crate::device::BlockDevice;
use crate::error::Result;
use crate::partitions::PartitionInfo;
use crate::progress::Progress;
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;

pub mod fake;
pub mod linux;

/// Discovery and inspection. Never modifies anything.
pub trait ProbeOps {
    /// Every whole-disk block device, including the one the host runs from.
    fn block_devices(&self) -> Result<Vec<BlockDevice>>;

    /// Child partitions of `disk` with their detected filesystem type.
    fn partitions(&self, disk: &Path) -> Result<Vec<PartitionInfo>>;

    /// Resolves an executable on `PATH`.
    fn find_tool(&self, name: &str) -> Option<PathBuf>;
}

/// Operations that change the contents of a device.
pub trait DiskOps {
    /// Unmounts every mounted partition of `disk`. Partitions that are not
    /// mounted are not an error.
    fn unmount_all(&self, disk: &Path) -> Result<()>;

    /// Overwrites the first `len` bytes of `disk` with zeros.
    fn zero_head(&self, disk: &Path, len: u64) -> Result<()>;

    /// Writes a fresh MBR with one primary partition spanning the device and
    /// formats it FAT32.
    fn create_fat32_partition(&self, disk: &Path) -> Result<()>;

    /// Block-level copy of `image` onto `disk`, flushed to the medium.
    fn write_image(
        &self,
        image: &Path,
        disk: &Path,
        running: &AtomicBool,
        progress: &dyn Progress,
    ) -> Result<u64>;
}

/// Host-wide effects.
pub trait SystemOps {
    /// Flushes `disk` and then every filesystem buffer.
    fn sync(&self, disk: &Path) -> Result<()>;

    fn reread_partitions(&self, disk: &Path) -> Result<()>;

    /// Waits for the device layer to finish processing events. Returns
    /// `false` when no settle barrier exists on this host.
    fn settle(&self) -> Result<bool>;

    /// A crypt(3) SHA-512 hash of `password`.
    fn hash_password(&self, password: &str) -> Result<String>;
}

pub trait MountOps {
    fn mount(&self, device: &Path, target: &Path, fstype: &str) -> Result<()>;
    fn unmount(&self, target: &Path) -> Result<()>;
}

/// The full set of host capabilities a provisioning run needs.
pub trait Platform: ProbeOps + DiskOps + SystemOps + MountOps {}

impl<T: ProbeOps + DiskOps + SystemOps + MountOps> Platform for T {}
