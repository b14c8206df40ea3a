use crate::blockdev;
use crate::device::{BlockDevice, DeviceKind};
use crate::error::{ProvisionError, Result};
use crate::partitions::{self, PartitionInfo};
use crate::platform::{DiskOps, MountOps, ProbeOps, SystemOps};
use crate::progress::Progress;
use crate::recovery::partition_path;
use crate::write;
use nix::mount::{MntFlags, MsFlags};
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::atomic::AtomicBool;
use std::thread::sleep;
use std::time::Duration;

const SETTLE_TIMEOUT_SECS: u32 = 30;

/// Talks to the running Linux host: sysfs, ioctls, mount(2) and a handful of
/// standard tools.
#[derive(Debug, Default)]
pub struct LinuxPlatform;

impl LinuxPlatform {
    pub fn new() -> Self {
        Self
    }
}

/// Helper to read a specific file below a `/sys/block/<device>` directory.
fn read_sys_file(dir: &Path, file: &str) -> io::Result<String> {
    fs::read_to_string(dir.join(file)).map(|s| s.trim().to_string())
}

fn should_skip(name: &str) -> bool {
    name.starts_with("loop")
        || name.starts_with("ram")
        || name.starts_with("zram")
        || name.starts_with("dm-")
        || name.starts_with("md")
        || name.starts_with("sr")
}

/// Every mounted filesystem as (kernel device name, mount point).
/// `/dev/mapper/*` links are resolved to their `dm-N` node.
fn mounted_filesystems() -> Vec<(String, PathBuf)> {
    let disks = sysinfo::Disks::new_with_refreshed_list();
    disks
        .iter()
        .filter_map(|disk| {
            let device = Path::new(disk.name());
            let device = fs::canonicalize(device).unwrap_or_else(|_| device.to_path_buf());
            let name = device.file_name()?.to_string_lossy().to_string();
            Some((name, disk.mount_point().to_path_buf()))
        })
        .collect()
}

/// Adds every device stacked on `dir` (LUKS, LVM and other device-mapper
/// nodes, recursively) to `members`.
fn collect_holders(sys_block_root: &Path, dir: &Path, members: &mut Vec<String>) {
    let Ok(holders) = fs::read_dir(dir.join("holders")) else {
        return;
    };
    for holder in holders.filter_map(|e| e.ok()) {
        let holder_name = holder.file_name().to_string_lossy().to_string();
        if members.contains(&holder_name) {
            continue;
        }
        members.push(holder_name.clone());
        collect_holders(sys_block_root, &sys_block_root.join(&holder_name), members);
    }
}

/// Scans `sys_block_root` (normally `/sys/block`) for whole disks.
///
/// A disk's mount points are those of the disk itself, of every partition
/// sysfs lists beneath it, and of every device-mapper node held on top of
/// either.
pub fn scan_block_devices_in(
    sys_block_root: &Path,
    mounts: &[(String, PathBuf)],
) -> io::Result<Vec<BlockDevice>> {
    let mut devices = Vec::new();
    for entry in fs::read_dir(sys_block_root)?.filter_map(|e| e.ok()) {
        let name = entry.file_name().to_string_lossy().to_string();
        if name.is_empty() || should_skip(&name) {
            continue;
        }
        let dir = sys_block_root.join(&name);

        let size_bytes = read_sys_file(&dir, "size")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .unwrap_or(0)
            .saturating_mul(512);
        let removable = read_sys_file(&dir, "removable")
            .map(|s| s == "1")
            .unwrap_or(false);
        let model = read_sys_file(&dir, "device/model").unwrap_or_default();

        let mut members = vec![name.clone()];
        if let Ok(children) = fs::read_dir(&dir) {
            for child in children.filter_map(|e| e.ok()) {
                let child_name = child.file_name().to_string_lossy().to_string();
                if child_name.starts_with(&name) && child.path().join("partition").exists() {
                    members.push(child_name);
                    collect_holders(sys_block_root, &child.path(), &mut members);
                }
            }
        }
        collect_holders(sys_block_root, &dir, &mut members);
        let mut mountpoints: Vec<PathBuf> = mounts
            .iter()
            .filter(|(dev, _)| members.contains(dev))
            .map(|(_, mp)| mp.clone())
            .collect();
        mountpoints.sort();
        mountpoints.dedup();

        devices.push(BlockDevice {
            path: PathBuf::from("/dev").join(&name),
            name,
            size_bytes,
            removable,
            model,
            mountpoints,
            kind: DeviceKind::Disk,
        });
    }
    devices.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(devices)
}

fn run_command(program: &str, args: &[&str]) -> Result<String> {
    let output = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .output()
        .map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => ProvisionError::MissingDependency(program.to_string()),
            _ => ProvisionError::Command {
                program: program.to_string(),
                code: None,
                stderr: e.to_string(),
            },
        })?;
    if !output.status.success() {
        return Err(ProvisionError::Command {
            program: program.to_string(),
            code: output.status.code(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    Ok(String::from_utf8_lossy(&output.stdout).to_string())
}

fn mountpoints_of(disk: &Path) -> Result<Vec<PathBuf>> {
    let disk_str = disk.to_string_lossy();
    let out = run_command("lsblk", &["-lnpo", "MOUNTPOINT", &disk_str])?;
    Ok(out
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(PathBuf::from)
        .collect())
}

impl ProbeOps for LinuxPlatform {
    fn block_devices(&self) -> Result<Vec<BlockDevice>> {
        let mounts = mounted_filesystems();
        Ok(scan_block_devices_in(Path::new("/sys/block"), &mounts)?)
    }

    fn partitions(&self, disk: &Path) -> Result<Vec<PartitionInfo>> {
        let disk_str = disk.to_string_lossy();
        let json = run_command("lsblk", &["--json", "-o", "NAME,PATH,FSTYPE,TYPE", &disk_str])?;
        partitions::parse_lsblk(&json)
    }

    fn find_tool(&self, name: &str) -> Option<PathBuf> {
        which::which(name).ok()
    }
}

impl DiskOps for LinuxPlatform {
    fn unmount_all(&self, disk: &Path) -> Result<()> {
        for mp in mountpoints_of(disk)? {
            log::info!("Unmounting {}", mp.display());
            match nix::mount::umount2(&mp, MntFlags::MNT_FORCE) {
                Ok(()) | Err(nix::errno::Errno::EINVAL) | Err(nix::errno::Errno::ENOENT) => {}
                Err(e) => {
                    log::warn!(
                        "Forced unmount of {} failed ({}); detaching lazily",
                        mp.display(),
                        e
                    );
                    if let Err(e) = nix::mount::umount2(&mp, MntFlags::MNT_DETACH) {
                        log::warn!("Could not detach {}: {}", mp.display(), e);
                    }
                }
            }
        }
        Ok(())
    }

    fn zero_head(&self, disk: &Path, len: u64) -> Result<()> {
        let failed = |e: io::Error| ProvisionError::WriteFailed {
            device: disk.to_path_buf(),
            reason: format!("clearing partition table: {e}"),
        };
        let mut file = OpenOptions::new().write(true).open(disk).map_err(failed)?;
        let zeros = vec![0u8; len as usize];
        file.write_all(&zeros).map_err(failed)?;
        file.sync_all().map_err(failed)?;
        Ok(())
    }

    fn create_fat32_partition(&self, disk: &Path) -> Result<()> {
        let failed = |reason: String| ProvisionError::WriteFailed {
            device: disk.to_path_buf(),
            reason,
        };
        {
            let mut file = OpenOptions::new()
                .read(true)
                .write(true)
                .open(disk)
                .map_err(|e| failed(e.to_string()))?;
            let sector_size = blockdev::logical_sector_size(&file).unwrap_or(512) as u32;
            let signature = rand_signature();
            let mut mbr = mbrman::MBR::new_from(&mut file, sector_size, signature)
                .map_err(|e| failed(format!("creating partition table: {e}")))?;
            let sectors = mbr
                .get_maximum_partition_size()
                .map_err(|e| failed(format!("no room for a partition: {e}")))?;
            let starting_lba = mbr
                .find_optimal_place(sectors)
                .ok_or_else(|| failed("no room for a partition".into()))?;
            mbr[1] = mbrman::MBRPartitionEntry {
                boot: mbrman::BOOT_INACTIVE,
                first_chs: mbrman::CHS::empty(),
                sys: 0x0c,
                last_chs: mbrman::CHS::empty(),
                starting_lba,
                sectors,
            };
            mbr.write_into(&mut file)
                .map_err(|e| failed(format!("writing partition table: {e}")))?;
            file.sync_all().map_err(|e| failed(e.to_string()))?;
        }

        self.reread_partitions(disk)?;
        if !self.settle()? {
            sleep(Duration::from_secs(2));
        }

        let part = partition_path(disk, 1);
        let part_str = part.to_string_lossy();
        run_command("mkfs.vfat", &["-F", "32", "-n", "BOOT", &part_str])?;
        log::info!("Formatted {} as FAT32", part.display());
        Ok(())
    }

    fn write_image(
        &self,
        image: &Path,
        disk: &Path,
        running: &AtomicBool,
        progress: &dyn Progress,
    ) -> Result<u64> {
        write::run(image, disk, running, progress)
    }
}

/// Disk signature for a new MBR; only needs to differ between disks.
fn rand_signature() -> [u8; 4] {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.subsec_nanos() ^ (d.as_secs() as u32))
        .unwrap_or(0x5049_5354);
    nanos.to_le_bytes()
}

impl SystemOps for LinuxPlatform {
    fn sync(&self, disk: &Path) -> Result<()> {
        let file = OpenOptions::new().write(true).open(disk)?;
        file.sync_all()?;
        nix::unistd::sync();
        Ok(())
    }

    fn reread_partitions(&self, disk: &Path) -> Result<()> {
        match blockdev::reread_partition_table(disk) {
            Ok(()) => Ok(()),
            Err(e) => {
                log::debug!("BLKRRPART on {} failed ({}); trying partprobe", disk.display(), e);
                let disk_str = disk.to_string_lossy();
                match run_command("partprobe", &[&disk_str]) {
                    Ok(_) => Ok(()),
                    Err(ProvisionError::MissingDependency(_)) => {
                        run_command("blockdev", &["--rereadpt", &disk_str]).map(|_| ())
                    }
                    Err(e) => Err(e),
                }
            }
        }
    }

    fn settle(&self) -> Result<bool> {
        if self.find_tool("udevadm").is_none() {
            return Ok(false);
        }
        let timeout = format!("--timeout={SETTLE_TIMEOUT_SECS}");
        if let Err(e) = run_command("udevadm", &["settle", &timeout]) {
            log::warn!("udevadm settle did not complete: {e}");
            sleep(Duration::from_secs(1));
        }
        Ok(true)
    }

    fn hash_password(&self, password: &str) -> Result<String> {
        let mut child = Command::new("openssl")
            .args(["passwd", "-6", "-stdin"])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| match e.kind() {
                io::ErrorKind::NotFound => ProvisionError::MissingDependency("openssl".into()),
                _ => ProvisionError::Io(e),
            })?;
        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(password.as_bytes())?;
            stdin.write_all(b"\n")?;
        }
        let output = child.wait_with_output()?;
        if !output.status.success() {
            return Err(ProvisionError::Command {
                program: "openssl".into(),
                code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        let hash = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if !hash.starts_with("$6$") {
            return Err(ProvisionError::Command {
                program: "openssl".into(),
                code: output.status.code(),
                stderr: "unexpected hash format".into(),
            });
        }
        Ok(hash)
    }
}

impl MountOps for LinuxPlatform {
    fn mount(&self, device: &Path, target: &Path, fstype: &str) -> Result<()> {
        nix::mount::mount(
            Some(device),
            target,
            Some(fstype),
            MsFlags::empty(),
            None::<&str>,
        )
        .map_err(|e| ProvisionError::MountFailed {
            device: device.to_path_buf(),
            target: target.to_path_buf(),
            reason: e.desc().to_string(),
        })
    }

    fn unmount(&self, target: &Path) -> Result<()> {
        nix::mount::umount2(target, MntFlags::empty()).map_err(|e| ProvisionError::Command {
            program: "umount".into(),
            code: None,
            stderr: format!("{}: {}", target.display(), e.desc()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn fake_disk(root: &Path, name: &str, sectors: u64, removable: bool, model: &str) {
        let dir = root.join(name);
        fs::create_dir_all(dir.join("device")).unwrap();
        fs::write(dir.join("size"), format!("{sectors}\n")).unwrap();
        fs::write(dir.join("removable"), if removable { "1\n" } else { "0\n" }).unwrap();
        fs::write(dir.join("device/model"), format!("{model}   \n")).unwrap();
    }

    fn fake_partition(root: &Path, disk: &str, part: &str) {
        let dir = root.join(disk).join(part);
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("partition"), "1\n").unwrap();
    }

    #[test]
    fn scan_reads_size_flags_and_partition_mounts() {
        let tmp = tempdir().unwrap();
        fake_disk(tmp.path(), "sda", 1_000_215_216, false, "Samsung SSD");
        fake_partition(tmp.path(), "sda", "sda2");
        fake_disk(tmp.path(), "sdb", 62_521_344, true, "Cruzer Blade");
        fake_disk(tmp.path(), "loop0", 8, false, "");

        let mounts = vec![
            ("sda2".to_string(), PathBuf::from("/")),
            ("sdb1".to_string(), PathBuf::from("/media/usb")),
        ];
        let devices = scan_block_devices_in(tmp.path(), &mounts).unwrap();

        assert_eq!(devices.len(), 2);
        let sda = &devices[0];
        assert_eq!(sda.name, "sda");
        assert_eq!(sda.mountpoints, vec![PathBuf::from("/")]);
        assert!(!sda.removable);

        let sdb = &devices[1];
        assert_eq!(sdb.path, PathBuf::from("/dev/sdb"));
        assert_eq!(sdb.size_bytes, 62_521_344 * 512);
        assert!(sdb.removable);
        assert_eq!(sdb.model, "Cruzer Blade");
        // sdb1 is not listed under sdb in sysfs, so it is not attributed.
        assert!(sdb.mountpoints.is_empty());
    }

    #[test]
    fn scan_attributes_device_mapper_mounts_to_the_underlying_disk() {
        let tmp = tempdir().unwrap();
        fake_disk(tmp.path(), "nvme0n1", 1_000_215_216, false, "WD SN770");
        fake_partition(tmp.path(), "nvme0n1", "nvme0n1p1");
        fake_partition(tmp.path(), "nvme0n1", "nvme0n1p2");
        // LUKS on p2, LVM on top of the LUKS mapping.
        fs::create_dir_all(tmp.path().join("nvme0n1/nvme0n1p2/holders/dm-0")).unwrap();
        fs::create_dir_all(tmp.path().join("dm-0/holders/dm-1")).unwrap();
        fs::create_dir_all(tmp.path().join("dm-1")).unwrap();
        fake_disk(tmp.path(), "sdc", 31_116_288, false, "Card Reader");

        let mounts = vec![
            ("dm-1".to_string(), PathBuf::from("/")),
            ("nvme0n1p1".to_string(), PathBuf::from("/efi")),
        ];
        let devices = scan_block_devices_in(tmp.path(), &mounts).unwrap();

        let names: Vec<&str> = devices.iter().map(|d| d.name.as_str()).collect();
        assert_eq!(names, vec!["nvme0n1", "sdc"]);
        assert_eq!(
            devices[0].mountpoints,
            vec![PathBuf::from("/"), PathBuf::from("/efi")]
        );

        // With nothing removable, the fallback must still leave the host disk out.
        let found = crate::inventory::candidates(&devices);
        assert!(found.fell_back);
        let offered: Vec<&str> = found.devices.iter().map(|d| d.name.as_str()).collect();
        assert_eq!(offered, vec!["sdc"]);
    }
}
