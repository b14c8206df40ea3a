//! The typed failure every pipeline stage returns.
//!
//! Each variant names what went wrong and carries the device path, file path
//! or field value involved, so the driver can print something the operator can
//! act on. All of them are terminal for the current run.
use std::io;
use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, ProvisionError>;

#[derive(Error, Debug)]
pub enum ProvisionError {
    #[error("required tool '{0}' was not found on PATH")]
    MissingDependency(String),

    #[error("no suitable target device found")]
    NoDeviceFound,

    #[error("'{0}' is not one of the offered devices")]
    InvalidSelection(String),

    #[error("invalid {field} '{value}': {reason}")]
    ValidationError {
        field: &'static str,
        value: String,
        reason: String,
    },

    #[error("unsupported image '{}': expected a .img or .img.xz file", .0.display())]
    InvalidImageFormat(PathBuf),

    #[error("failed to decompress '{}': {reason}", path.display())]
    DecompressionFailed { path: PathBuf, reason: String },

    #[error("download of {url} failed: {reason}")]
    DownloadFailed { url: String, reason: String },

    #[error("checksum mismatch for '{}': expected {expected}, got {actual}", path.display())]
    IntegrityCheckFailed {
        path: PathBuf,
        expected: String,
        actual: String,
    },

    #[error("image is unavailable at '{}' (missing or empty)", .0.display())]
    ImageUnavailable(PathBuf),

    #[error("writing to '{}' failed: {reason}", device.display())]
    WriteFailed { device: PathBuf, reason: String },

    #[error("could not find a vfat boot and an ext4 root partition on '{}' (saw: {observed})", device.display())]
    PartitionsNotFound { device: PathBuf, observed: String },

    #[error("failed to mount '{}' at '{}': {reason}", device.display(), target.display())]
    MountFailed {
        device: PathBuf,
        target: PathBuf,
        reason: String,
    },

    #[error("{0}")]
    Aborted(String),

    #[error("{program} failed (exit={code:?}): {stderr}")]
    Command {
        program: String,
        code: Option<i32>,
        stderr: String,
    },

    #[error("run configuration at '{}': {reason}", path.display())]
    Config { path: PathBuf, reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl ProvisionError {
    pub(crate) fn validation(
        field: &'static str,
        value: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        ProvisionError::ValidationError {
            field,
            value: value.into(),
            reason: reason.into(),
        }
    }

    /// True when the run ended because the operator cancelled it.
    pub fn is_interrupted(&self) -> bool {
        match self {
            ProvisionError::Aborted(_) => true,
            ProvisionError::Io(e) => e.kind() == io::ErrorKind::Interrupted,
            _ => false,
        }
    }

    /// The cancellation error raised when the interrupt flag is observed.
    pub(crate) fn cancelled() -> Self {
        ProvisionError::Aborted("Operation cancelled by user".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_name_the_implicated_value() {
        let err = ProvisionError::validation("username", "Pi", "must start with a-z or _");
        assert_eq!(
            err.to_string(),
            "invalid username 'Pi': must start with a-z or _"
        );

        let err = ProvisionError::PartitionsNotFound {
            device: PathBuf::from("/dev/sdb"),
            observed: "sdb1 (vfat)".into(),
        };
        assert!(err.to_string().contains("/dev/sdb"));
        assert!(err.to_string().contains("sdb1 (vfat)"));
    }

    #[test]
    fn interrupted_covers_abort_and_io_interrupt() {
        assert!(ProvisionError::cancelled().is_interrupted());
        assert!(ProvisionError::Io(io::Error::from(io::ErrorKind::Interrupted)).is_interrupted());
        assert!(!ProvisionError::NoDeviceFound.is_interrupted());
    }
}
