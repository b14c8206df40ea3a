//! Cleanup and outcome reporting that runs however a run ends.
//!
//! Two kinds of guard live here. [`TempArtifact`] owns one file the run
//! created (a download, a checksum, a decompressed image) and deletes it when
//! dropped. [`RunGuard`] owns the run as a whole: it persists the final
//! [`RunOutcome`] exactly once and, if a device was already being modified,
//! produces the commands that get the operator back to a usable device.
use crate::config::{ConfigStore, RunConfig, RunOutcome};
use crate::device::DeviceClass;
use std::fs;
use std::path::{Path, PathBuf};

/// RAII guard that deletes a run-owned file when dropped.
#[derive(Debug)]
pub struct TempArtifact {
    path: PathBuf,
    active: bool,
}

impl TempArtifact {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            active: true,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Follow the file to a new name.
    pub fn rename(&mut self, to: impl Into<PathBuf>) -> std::io::Result<()> {
        let to = to.into();
        fs::rename(&self.path, &to)?;
        self.path = to;
        Ok(())
    }

    /// Prevent deletion and return the path.
    pub fn release(mut self) -> PathBuf {
        self.active = false;
        self.path.clone()
    }
}

impl Drop for TempArtifact {
    fn drop(&mut self) {
        if !self.active {
            return;
        }
        match fs::remove_file(&self.path) {
            Ok(()) => log::debug!("Removed {}", self.path.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => log::warn!("Could not remove {}: {}", self.path.display(), e),
        }
    }
}

/// Commands that return a half-written device to a usable state.
pub fn recovery_guidance(class: DeviceClass, device: &Path) -> Vec<String> {
    let dev = device.display();
    match class {
        DeviceClass::FlashDrive => vec![
            format!("{dev} may now hold a partial image. To reset the drive:"),
            format!("  sudo wipefs --all {dev}"),
            format!("  sudo dd if=/dev/zero of={dev} bs=1M count=8 conv=fsync"),
            "Then re-run pistrap.".to_string(),
        ],
        DeviceClass::SdCard | DeviceClass::SmallDevice | DeviceClass::Unknown => vec![
            format!("{dev} may now hold a partial image. To reformat the card:"),
            format!("  sudo parted --script {dev} mklabel msdos mkpart primary fat32 1MiB 100%"),
            format!("  sudo mkfs.vfat -F 32 {}", first_partition(device).display()),
            "Then re-run pistrap.".to_string(),
        ],
    }
}

/// `/dev/sdb` -> `/dev/sdb1`, `/dev/mmcblk0` -> `/dev/mmcblk0p1`.
pub fn partition_path(device: &Path, number: u32) -> PathBuf {
    let s = device.to_string_lossy();
    if s.ends_with(|c: char| c.is_ascii_digit()) {
        PathBuf::from(format!("{s}p{number}"))
    } else {
        PathBuf::from(format!("{s}{number}"))
    }
}

fn first_partition(device: &Path) -> PathBuf {
    partition_path(device, 1)
}

/// Owns the run's outcome. Create it when the run starts, before any
/// question is asked; call [`RunGuard::succeed`] at the normal end or
/// [`RunGuard::fail`] from the error path. If neither happens (an early
/// return, an interrupted prompt, a panic), dropping it records a failure.
pub struct RunGuard {
    store: ConfigStore,
    config: RunConfig,
    touched: Option<(PathBuf, DeviceClass)>,
    active: bool,
}

impl RunGuard {
    pub fn new(store: ConfigStore, config: RunConfig) -> Self {
        Self {
            store,
            config,
            touched: None,
            active: true,
        }
    }

    /// Loads the previous run's record from `store` and arms the guard.
    pub fn start(store: ConfigStore) -> Self {
        let config = store.load();
        Self::new(store, config)
    }

    /// The record as it stands: the previous run's answers until
    /// [`RunConfig::record_answers`] is applied to it.
    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    /// Records that a destructive operation is about to start on `device`.
    pub fn device_touched(&mut self, device: &Path, class: DeviceClass) {
        self.touched = Some((device.to_path_buf(), class));
    }

    pub fn touched_device(&self) -> Option<&Path> {
        self.touched.as_ref().map(|(p, _)| p.as_path())
    }

    pub fn config_mut(&mut self) -> &mut RunConfig {
        &mut self.config
    }

    /// Persists `success` and disarms the guard.
    pub fn succeed(mut self) {
        self.persist(RunOutcome::Success);
        self.active = false;
    }

    /// Persists `failed`, disarms the guard and returns the recovery
    /// commands for the touched device, if any.
    pub fn fail(mut self) -> Vec<String> {
        self.persist(RunOutcome::Failed);
        self.active = false;
        self.guidance()
    }

    fn guidance(&self) -> Vec<String> {
        self.touched
            .as_ref()
            .map(|(dev, class)| recovery_guidance(*class, dev))
            .unwrap_or_default()
    }

    fn persist(&mut self, outcome: RunOutcome) {
        self.config.record_outcome(outcome);
        match self.store.save(&self.config) {
            Ok(()) => log::info!(
                "Recorded run outcome '{:?}' in {}",
                outcome,
                self.store.path().display()
            ),
            Err(e) => log::error!("Could not record run outcome: {e}"),
        }
    }
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        if !self.active {
            return;
        }
        self.persist(RunOutcome::Failed);
        for line in self.guidance() {
            log::error!("{line}");
        }
    }
}
