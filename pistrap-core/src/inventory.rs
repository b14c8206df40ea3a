//! Chooses which discovered block devices may be offered as targets.
use crate::device::BlockDevice;
use std::path::Path;

/// Mount points that identify the disk the running system lives on.
pub const HOST_MOUNTPOINTS: &[&str] = &["/", "/boot", "/boot/efi", "/boot/firmware"];

/// Result of filtering: the candidates plus whether the removable-only pass
/// came up empty and every non-host disk is being offered instead.
#[derive(Debug, Clone)]
pub struct Candidates {
    pub devices: Vec<BlockDevice>,
    pub fell_back: bool,
}

fn hosts_running_system(device: &BlockDevice) -> bool {
    device
        .mountpoints
        .iter()
        .any(|mp| HOST_MOUNTPOINTS.iter().any(|h| mp == Path::new(h)))
}

fn eligible(device: &BlockDevice) -> bool {
    !device.name.trim().is_empty() && device.size_bytes > 0 && !hosts_running_system(device)
}

/// Two passes: removable devices first; if there are none, every non-host
/// device, with a warning. The fallback can offer internal disks.
pub fn candidates(all: &[BlockDevice]) -> Candidates {
    let removable: Vec<BlockDevice> = all
        .iter()
        .filter(|d| eligible(d) && d.removable)
        .cloned()
        .collect();
    if !removable.is_empty() {
        return Candidates {
            devices: removable,
            fell_back: false,
        };
    }

    let everything: Vec<BlockDevice> = all.iter().filter(|d| eligible(d)).cloned().collect();
    if !everything.is_empty() {
        log::warn!(
            "No removable devices found; listing all {} non-system devices. Double-check the target, internal disks are included.",
            everything.len()
        );
    }
    Candidates {
        devices: everything,
        fell_back: true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DeviceKind;
    use std::path::PathBuf;

    fn dev(name: &str, removable: bool, mounts: &[&str]) -> BlockDevice {
        BlockDevice {
            path: PathBuf::from("/dev").join(name),
            name: name.to_string(),
            size_bytes: 32_000_000_000,
            removable,
            model: String::new(),
            mountpoints: mounts.iter().map(PathBuf::from).collect(),
            kind: DeviceKind::Disk,
        }
    }

    #[test]
    fn host_disk_is_never_offered() {
        let all = vec![
            dev("nvme0n1", false, &["/", "/boot/efi"]),
            dev("sdb", true, &[]),
        ];
        let c = candidates(&all);
        assert!(!c.fell_back);
        assert_eq!(c.devices.len(), 1);
        assert_eq!(c.devices[0].name, "sdb");
    }

    #[test]
    fn removable_host_disk_is_still_excluded() {
        let all = vec![dev("mmcblk0", true, &["/boot/firmware", "/"])];
        let c = candidates(&all);
        assert!(c.devices.is_empty());
    }

    #[test]
    fn falls_back_to_non_removable_when_no_removable_exists() {
        let all = vec![dev("sda", false, &["/"]), dev("sdc", false, &["/media/x"])];
        let c = candidates(&all);
        assert!(c.fell_back);
        assert_eq!(c.devices.len(), 1);
        assert_eq!(c.devices[0].name, "sdc");
    }

    #[test]
    fn nameless_and_empty_devices_are_skipped() {
        let mut empty = dev("sdd", true, &[]);
        empty.size_bytes = 0;
        let all = vec![dev("", true, &[]), empty];
        let c = candidates(&all);
        assert!(c.devices.is_empty());
    }
}
