//! The optional destructive format that runs before an image is written.
use crate::device::DeviceClass;
use crate::error::Result;
use crate::platform::Platform;
use std::path::Path;
use std::thread::sleep;
use std::time::Duration;

/// How much of the device head is zeroed. Covers the MBR, a GPT header and
/// the alignment gap before the first partition.
pub const HEAD_BYTES: u64 = 1024 * 1024;

/// Clears the partition table of `device`. Flash drives only lose the table;
/// everything else also gets a single FAT32 partition spanning the device.
/// The kernel's view of the device is refreshed either way.
pub fn apply<P: Platform + ?Sized>(
    platform: &P,
    device: &Path,
    class: DeviceClass,
    settle_delay: Duration,
) -> Result<()> {
    platform.unmount_all(device)?;
    platform.zero_head(device, HEAD_BYTES)?;
    match class {
        DeviceClass::FlashDrive => {
            log::info!("Cleared partition table on {}", device.display());
        }
        DeviceClass::SdCard | DeviceClass::SmallDevice | DeviceClass::Unknown => {
            platform.create_fat32_partition(device)?;
            log::info!(
                "Recreated {} with a single FAT32 partition",
                device.display()
            );
        }
    }
    refresh_partition_table(platform, device, settle_delay)
}

/// Re-reads the partition table, then waits: a fixed delay, the device
/// settle barrier when there is one, otherwise a second fixed delay.
pub fn refresh_partition_table<P: Platform + ?Sized>(
    platform: &P,
    device: &Path,
    settle_delay: Duration,
) -> Result<()> {
    platform.reread_partitions(device)?;
    sleep(settle_delay);
    if !platform.settle()? {
        log::debug!("No settle barrier; waiting another {settle_delay:?}");
        sleep(settle_delay);
    }
    Ok(())
}
