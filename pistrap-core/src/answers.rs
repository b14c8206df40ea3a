//! Everything the operator decides before the pipeline starts.
use crate::error::{ProvisionError, Result};
use crate::validate;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Architecture {
    #[serde(rename = "32")]
    Bits32,
    #[serde(rename = "64")]
    Bits64,
}

impl Architecture {
    pub fn parse(value: &str) -> Result<Self> {
        match value.trim() {
            "32" => Ok(Architecture::Bits32),
            "64" => Ok(Architecture::Bits64),
            other => Err(ProvisionError::validation(
                "architecture",
                other,
                "expected 32 or 64",
            )),
        }
    }

    /// Suffix Raspberry Pi OS uses in its download names.
    pub fn os_suffix(self) -> &'static str {
        match self {
            Architecture::Bits32 => "armhf",
            Architecture::Bits64 => "arm64",
        }
    }
}

impl fmt::Display for Architecture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Architecture::Bits32 => f.write_str("32"),
            Architecture::Bits64 => f.write_str("64"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Interface {
    Wired,
    Wireless,
}

impl Interface {
    pub fn name(self) -> &'static str {
        match self {
            Interface::Wired => "eth0",
            Interface::Wireless => "wlan0",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WifiCredentials {
    pub ssid: String,
    /// `None` for an open network.
    pub psk: Option<String>,
    /// Two-letter regulatory domain.
    pub country: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StaticNetwork {
    pub interface: Interface,
    pub ip: String,
    pub gateway: String,
    pub subnet_mask: String,
    pub dns: String,
    /// Required when `interface` is wireless.
    pub wifi: Option<WifiCredentials>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProvisioningAnswers {
    pub username: String,
    /// `None` means key-only login.
    pub password: Option<String>,
    pub ssh_public_key: String,
    pub architecture: Architecture,
    pub network: Option<StaticNetwork>,
    /// A user-supplied `.img` or `.img.xz`; `None` downloads the image.
    pub local_image: Option<PathBuf>,
}

impl ProvisioningAnswers {
    pub fn validate(&self) -> Result<()> {
        validate::validate_required("username", &self.username)?;
        validate::validate_username(&self.username)?;
        if let Some(password) = &self.password {
            validate::validate_required("password", password)?;
        }
        validate::validate_public_key(&self.ssh_public_key)?;

        if let Some(net) = &self.network {
            validate::validate_ip("static ip", &net.ip)?;
            validate::validate_ip("gateway ip", &net.gateway)?;
            validate::netmask_prefix(&net.subnet_mask)?;
            validate::validate_ip("dns server", &net.dns)?;
            if net.interface == Interface::Wireless {
                let wifi = net.wifi.as_ref().ok_or_else(|| {
                    ProvisionError::validation("wifi ssid", "", "required for a wireless interface")
                })?;
                validate::validate_required("wifi ssid", &wifi.ssid)?;
                if let Some(psk) = &wifi.psk {
                    if !(8..=63).contains(&psk.len()) {
                        return Err(ProvisionError::validation(
                            "wifi passphrase",
                            "********",
                            "must be 8 to 63 characters",
                        ));
                    }
                }
                if wifi.country.len() != 2 || !wifi.country.chars().all(|c| c.is_ascii_uppercase())
                {
                    return Err(ProvisionError::validation(
                        "wifi country",
                        wifi.country.as_str(),
                        "expected a two-letter code such as US or GB",
                    ));
                }
            }
        }

        if let Some(image) = &self.local_image {
            validate::validate_required("local image", &image.to_string_lossy())?;
        }
        Ok(())
    }
}
