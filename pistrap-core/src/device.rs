use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// Devices larger than this are treated as USB flash drives.
pub const FLASH_DRIVE_MIN_BYTES: u64 = 16_000_000_000;
/// Devices larger than this (and not a flash drive) are treated as SD cards.
pub const SD_CARD_MIN_BYTES: u64 = 1_000_000_000;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceKind {
    Disk,
    Partition,
}

/// Represents a block device discovered on the system.
///
/// Populated by the platform-specific discovery in [`crate::platform`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BlockDevice {
    /// The system path to the device (e.g., `/dev/sda`).
    pub path: PathBuf,
    /// The kernel-provided name of the device (e.g., "sda").
    pub name: String,
    pub size_bytes: u64,
    /// The kernel's `removable` flag for the device.
    pub removable: bool,
    pub model: String,
    /// Every mount point of the device or any of its partitions.
    pub mountpoints: Vec<PathBuf>,
    pub kind: DeviceKind,
}

impl BlockDevice {
    pub fn size_gb(&self) -> f64 {
        self.size_bytes as f64 / 1_000_000_000.0
    }

    pub fn class(&self) -> DeviceClass {
        DeviceClass::classify(self.size_bytes, self.removable)
    }
}

impl fmt::Display for BlockDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mount_info = if self.mountpoints.is_empty() {
            "[Not mounted]".to_string()
        } else {
            let joined: Vec<String> = self
                .mountpoints
                .iter()
                .map(|p| p.display().to_string())
                .collect();
            format!("[Mounted at {}]", joined.join(", "))
        };
        let model = if self.model.is_empty() {
            "-"
        } else {
            self.model.as_str()
        };
        let kind = match self.kind {
            DeviceKind::Disk => "disk",
            DeviceKind::Partition => "part",
        };

        write!(
            f,
            "{:<12} {:>7.1} GB  {:<24} {:<4} {}",
            self.path.display(),
            self.size_gb(),
            model,
            kind,
            mount_info
        )
    }
}

/// Size-based guess at what kind of media a device is.
///
/// This is a heuristic. A large SD card will be reported as a flash drive
/// and the other way round; callers show the guess to the operator and never
/// refuse to continue because of it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceClass {
    FlashDrive,
    SdCard,
    SmallDevice,
    Unknown,
}

impl DeviceClass {
    /// Ordered, first match wins. Removability does not change the outcome,
    /// it only decides which devices are offered in the first place.
    pub fn classify(size_bytes: u64, _removable: bool) -> Self {
        if size_bytes > FLASH_DRIVE_MIN_BYTES {
            DeviceClass::FlashDrive
        } else if size_bytes > SD_CARD_MIN_BYTES {
            DeviceClass::SdCard
        } else {
            DeviceClass::SmallDevice
        }
    }

    /// Large devices need a second destructive confirmation.
    pub fn is_large(self) -> bool {
        matches!(self, DeviceClass::FlashDrive)
    }
}

impl fmt::Display for DeviceClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DeviceClass::FlashDrive => "USB flash drive",
            DeviceClass::SdCard => "SD card",
            DeviceClass::SmallDevice => "small device",
            DeviceClass::Unknown => "unknown device",
        };
        f.write_str(s)
    }
}
