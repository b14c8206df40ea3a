//! Persisted answers from the previous run and the outcome of that run.
//!
//! The store is a single JSON document. It is read once at start to seed the
//! prompts' defaults and rewritten wholesale at every persistence point. A
//! missing or unreadable document is never fatal: the run starts from empty
//! defaults.
use crate::answers::{Architecture, Interface, ProvisioningAnswers};
use crate::error::{ProvisionError, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

pub const CONFIG_ENV: &str = "PISTRAP_CONFIG";

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunOutcome {
    Success,
    Failed,
    #[default]
    Unknown,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    pub username: Option<String>,
    pub password: Option<String>,
    pub ssh_public_key: Option<String>,
    pub architecture: Option<Architecture>,
    pub use_static_ip: Option<bool>,
    pub interface: Option<Interface>,
    pub static_ip: Option<String>,
    pub gateway_ip: Option<String>,
    pub subnet_mask: Option<String>,
    pub dns_server: Option<String>,
    pub wifi_ssid: Option<String>,
    pub wifi_country: Option<String>,
    pub use_local_image: Option<bool>,
    pub local_image: Option<PathBuf>,
    pub format_confirmed: Option<bool>,
    pub last_flash_status: RunOutcome,
    pub last_flash_date: Option<String>,
}

impl RunConfig {
    /// Copies the answers in as the next run's defaults. The Wi-Fi passphrase
    /// is not kept.
    pub fn record_answers(&mut self, answers: &ProvisioningAnswers) {
        self.username = Some(answers.username.clone());
        self.password = answers.password.clone();
        self.ssh_public_key = Some(answers.ssh_public_key.clone());
        self.architecture = Some(answers.architecture);
        self.use_static_ip = Some(answers.network.is_some());
        if let Some(net) = &answers.network {
            self.interface = Some(net.interface);
            self.static_ip = Some(net.ip.clone());
            self.gateway_ip = Some(net.gateway.clone());
            self.subnet_mask = Some(net.subnet_mask.clone());
            self.dns_server = Some(net.dns.clone());
            if let Some(wifi) = &net.wifi {
                self.wifi_ssid = Some(wifi.ssid.clone());
                self.wifi_country = Some(wifi.country.clone());
            }
        }
        self.use_local_image = Some(answers.local_image.is_some());
        if let Some(image) = &answers.local_image {
            self.local_image = Some(image.clone());
        }
    }

    pub fn record_outcome(&mut self, outcome: RunOutcome) {
        self.last_flash_status = outcome;
        self.last_flash_date = OffsetDateTime::now_utc().format(&Rfc3339).ok();
    }
}

/// Where the run configuration lives and who should own it.
#[derive(Clone, Debug)]
pub struct ConfigStore {
    path: PathBuf,
    owner: Option<(u32, u32)>,
}

impl ConfigStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            owner: None,
        }
    }

    /// Hand the file to `uid:gid` after every write.
    pub fn with_owner(mut self, uid: u32, gid: u32) -> Self {
        self.owner = Some((uid, gid));
        self
    }

    /// `$PISTRAP_CONFIG`, else `~/.config/pistrap/config.json` of the operator
    /// who invoked `sudo` (or of the current user). Ownership goes to
    /// `$SUDO_UID:$SUDO_GID` when both are set.
    pub fn locate() -> Self {
        let path = std::env::var_os(CONFIG_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|| operator_home().join(".config/pistrap/config.json"));
        let mut store = Self::new(path);
        let sudo_uid = std::env::var("SUDO_UID").ok().and_then(|v| v.parse().ok());
        let sudo_gid = std::env::var("SUDO_GID").ok().and_then(|v| v.parse().ok());
        if let (Some(uid), Some(gid)) = (sudo_uid, sudo_gid) {
            store = store.with_owner(uid, gid);
        }
        store
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load(&self) -> RunConfig {
        let content = match fs::read_to_string(&self.path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                log::debug!("No run configuration at {}", self.path.display());
                return RunConfig::default();
            }
            Err(e) => {
                log::warn!(
                    "Could not read run configuration {}: {}",
                    self.path.display(),
                    e
                );
                return RunConfig::default();
            }
        };
        serde_json::from_str(&content).unwrap_or_else(|e| {
            log::warn!(
                "Ignoring unparsable run configuration {}: {}",
                self.path.display(),
                e
            );
            RunConfig::default()
        })
    }

    /// Replaces the whole document. The file is written beside the target
    /// and renamed into place, so a crash never leaves half a document.
    pub fn save(&self, config: &RunConfig) -> Result<()> {
        let err = |reason: String| ProvisionError::Config {
            path: self.path.clone(),
            reason,
        };

        let parent = self
            .path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or(Path::new("."));
        let created_parent = !parent.exists();
        fs::create_dir_all(parent).map_err(|e| err(e.to_string()))?;

        let json = serde_json::to_string_pretty(config).map_err(|e| err(e.to_string()))?;
        let mut tmp = tempfile::NamedTempFile::new_in(parent).map_err(|e| err(e.to_string()))?;
        tmp.write_all(json.as_bytes())
            .and_then(|_| tmp.write_all(b"\n"))
            .and_then(|_| tmp.as_file().sync_all())
            .map_err(|e| err(e.to_string()))?;
        fs::set_permissions(tmp.path(), fs::Permissions::from_mode(0o600))
            .map_err(|e| err(e.to_string()))?;
        tmp.persist(&self.path).map_err(|e| err(e.to_string()))?;

        if let Some((uid, gid)) = self.owner {
            let mut owned = vec![self.path.as_path()];
            if created_parent {
                owned.push(parent);
            }
            for path in owned {
                if let Err(e) = chown(path, uid, gid) {
                    log::warn!("Could not hand {} to {}:{}: {}", path.display(), uid, gid, e);
                }
            }
        }
        Ok(())
    }
}

fn chown(path: &Path, uid: u32, gid: u32) -> nix::Result<()> {
    nix::unistd::chown(
        path,
        Some(nix::unistd::Uid::from_raw(uid)),
        Some(nix::unistd::Gid::from_raw(gid)),
    )
}

/// Home directory of the person running the tool: the `sudo` caller's
/// passwd entry when there is one, else `$HOME`.
pub fn operator_home() -> PathBuf {
    if let Ok(name) = std::env::var("SUDO_USER") {
        if let Ok(Some(user)) = nix::unistd::User::from_name(&name) {
            return user.dir;
        }
    }
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("/root"))
}
