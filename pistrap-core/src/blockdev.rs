//! Thin wrappers over the block-device ioctls.
use nix::{ioctl_none, ioctl_read, ioctl_read_bad};
use std::fs::File;
use std::io;
use std::os::unix::fs::FileTypeExt;
use std::os::unix::io::AsRawFd;
use std::path::Path;

ioctl_read!(blkgetsize64, 0x12, 114, u64);
ioctl_none!(blkrrpart, 0x12, 95);
ioctl_read_bad!(blksszget, 0x1268, libc::c_int);

pub fn is_block_device(path: &Path) -> bool {
    std::fs::metadata(path)
        .map(|m| m.file_type().is_block_device())
        .unwrap_or(false)
}

/// Size in bytes. Block devices are asked via `BLKGETSIZE64`, anything else
/// reports its file length.
pub fn size_bytes(file: &File) -> io::Result<u64> {
    let meta = file.metadata()?;
    if !meta.file_type().is_block_device() {
        return Ok(meta.len());
    }
    let mut size: u64 = 0;
    unsafe {
        blkgetsize64(file.as_raw_fd(), &mut size)?;
    }
    Ok(size)
}

/// Logical sector size, 512 for anything that is not a block device.
pub fn logical_sector_size(file: &File) -> io::Result<usize> {
    if !file.metadata()?.file_type().is_block_device() {
        return Ok(512);
    }
    let mut ssz: libc::c_int = 0;
    unsafe {
        blksszget(file.as_raw_fd(), &mut ssz)?;
    }
    Ok(usize::try_from(ssz).unwrap_or(512).max(512))
}

/// Ask the kernel to re-read the partition table. Fails with `EBUSY` while
/// any partition of the device is in use.
pub fn reread_partition_table(device: &Path) -> io::Result<()> {
    let file = File::open(device)?;
    unsafe {
        blkrrpart(file.as_raw_fd())?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn regular_files_report_their_length() {
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        tmp.write_all(&[0u8; 4096]).unwrap();
        let file = File::open(tmp.path()).unwrap();
        assert_eq!(size_bytes(&file).unwrap(), 4096);
        assert_eq!(logical_sector_size(&file).unwrap(), 512);
        assert!(!is_block_device(tmp.path()));
    }
}
