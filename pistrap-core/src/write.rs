//! Contains the block-level copy of an uncompressed image onto a device.
//!
//! Block devices are opened with `O_DIRECT` so the page cache is bypassed,
//! and the copy only reports success after `fsync` has returned. Regular
//! files are accepted as targets too; they get the same copy without
//! `O_DIRECT`.
use crate::blockdev;
use crate::error::{ProvisionError, Result};
use crate::progress::{Progress, Stage};
use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

/// Copy chunk size.
pub const BUFFER_SIZE: usize = 4 * 1024 * 1024;

/// Writes `image_path` to the start of `device_path`, returning the number
/// of image bytes written.
///
/// # Errors
///
/// - [`ProvisionError::ImageUnavailable`] if the image is missing or empty.
/// - [`ProvisionError::WriteFailed`] if the device cannot be opened, is
///   smaller than the image, or any read, write or flush fails.
/// - [`ProvisionError::Aborted`] if `running` is cleared mid-copy.
pub fn run(
    image_path: &Path,
    device_path: &Path,
    running: &AtomicBool,
    progress: &dyn Progress,
) -> Result<u64> {
    let failed = |reason: String| ProvisionError::WriteFailed {
        device: device_path.to_path_buf(),
        reason,
    };

    let mut image_file =
        File::open(image_path).map_err(|_| ProvisionError::ImageUnavailable(image_path.into()))?;
    let image_len = image_file
        .metadata()
        .map(|m| m.len())
        .map_err(|_| ProvisionError::ImageUnavailable(image_path.into()))?;
    if image_len == 0 {
        return Err(ProvisionError::ImageUnavailable(image_path.into()));
    }

    let direct = blockdev::is_block_device(device_path);
    let mut options = OpenOptions::new();
    options.write(true);
    if direct {
        options.custom_flags(libc::O_DIRECT);
    }
    let mut device_file = options
        .open(device_path)
        .map_err(|e| failed(format!("cannot open for writing: {e}")))?;

    if direct {
        let capacity = blockdev::size_bytes(&device_file)
            .map_err(|e| failed(format!("cannot determine device size: {e}")))?;
        if image_len > capacity {
            return Err(failed(format!(
                "image is {image_len} bytes but the device only holds {capacity}"
            )));
        }
    }
    let block_size = blockdev::logical_sector_size(&device_file).unwrap_or(512);

    progress.begin(Stage::Write, Some(image_len));

    // O_DIRECT needs the buffer aligned to the logical sector size.
    let mut buf = vec![0u8; BUFFER_SIZE + block_size];
    let offset = buf.as_ptr().align_offset(block_size);
    let buffer = &mut buf[offset..offset + BUFFER_SIZE];

    let mut written: u64 = 0;
    while written < image_len {
        if !running.load(Ordering::SeqCst) {
            return Err(ProvisionError::cancelled());
        }

        let to_read = std::cmp::min(BUFFER_SIZE as u64, image_len - written) as usize;
        image_file
            .read_exact(&mut buffer[..to_read])
            .map_err(|e| failed(format!("reading image at offset {written}: {e}")))?;

        // The last chunk may not be a whole number of sectors.
        let chunk = if direct && to_read % block_size != 0 {
            let padded = to_read.div_ceil(block_size) * block_size;
            buffer[to_read..padded].fill(0);
            padded
        } else {
            to_read
        };

        device_file
            .write_all(&buffer[..chunk])
            .map_err(|e| failed(format!("at offset {written}: {e}")))?;
        written += to_read as u64;
        progress.update(Stage::Write, written);
    }

    device_file
        .sync_all()
        .map_err(|e| failed(format!("flush to medium failed: {e}")))?;
    progress.finish(Stage::Write);

    log::info!(
        "Wrote {} bytes from {} to {}",
        written,
        image_path.display(),
        device_path.display()
    );
    Ok(written)
}
