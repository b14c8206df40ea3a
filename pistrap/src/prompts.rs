//! Interactive questions, with the previous run's answers as defaults.
use anyhow::Result;
use console::style;
use dialoguer::{Confirm, Input, Password, Select, theme::ColorfulTheme};
use pistrap_core::answers::{
    Architecture, Interface, ProvisioningAnswers, StaticNetwork, WifiCredentials,
};
use pistrap_core::config::{self, RunConfig};
use pistrap_core::device::BlockDevice;
use pistrap_core::error::ProvisionError;
use pistrap_core::pipeline::Operator;
use pistrap_core::validate;
use std::path::{Path, PathBuf};

const DEFAULT_USERNAME: &str = "pi";
const DEFAULT_NETMASK: &str = "255.255.255.0";
const DEFAULT_WIFI_COUNTRY: &str = "US";

fn theme() -> ColorfulTheme {
    ColorfulTheme::default()
}

/// Keeps the I/O error kind, so a Ctrl+C at a prompt reads as a cancellation.
fn prompt_error(e: dialoguer::Error) -> ProvisionError {
    match e {
        dialoguer::Error::IO(io) => ProvisionError::Io(io),
    }
}

/// Text input checked by `check` before it is accepted.
fn ask(
    prompt: &str,
    default: Option<&str>,
    check: impl Fn(&str) -> pistrap_core::error::Result<()>,
) -> Result<String> {
    let theme = theme();
    let mut input = Input::<String>::with_theme(&theme).with_prompt(prompt);
    if let Some(default) = default.filter(|d| !d.is_empty()) {
        input = input.default(default.to_string());
    }
    let value = input
        .validate_with(|v: &String| check(v.trim()).map_err(|e| e.to_string()))
        .interact_text()?;
    Ok(value.trim().to_string())
}

fn ask_ip(prompt: &str, field: &'static str, default: Option<&str>) -> Result<String> {
    ask(prompt, default, |v| validate::validate_ip(field, v).map(|_| ()))
}

fn confirm(prompt: &str, default: bool) -> Result<bool> {
    Ok(Confirm::with_theme(&theme())
        .with_prompt(prompt)
        .default(default)
        .interact()?)
}

const KEY_FILES: &[&str] = &["id_ed25519.pub", "id_ecdsa.pub", "id_rsa.pub"];

/// First public key found in `home/.ssh`, preferring ed25519.
fn public_key_in(home: &Path) -> Option<String> {
    KEY_FILES
        .iter()
        .find_map(|name| std::fs::read_to_string(home.join(".ssh").join(name)).ok())
        .map(|k| k.trim().to_string())
        .filter(|k| !k.is_empty())
}

pub fn collect_answers(defaults: &RunConfig) -> Result<ProvisioningAnswers> {
    let username = ask(
        "Username",
        Some(defaults.username.as_deref().unwrap_or(DEFAULT_USERNAME)),
        validate::validate_username,
    )?;

    let password = match &defaults.password {
        Some(saved) if confirm("Reuse the saved password?", true)? => Some(saved.clone()),
        _ => {
            let entered = Password::with_theme(&theme())
                .with_prompt("Password (leave empty for key-only login)")
                .allow_empty_password(true)
                .with_confirmation("Repeat password", "Passwords do not match")
                .interact()?;
            Some(entered).filter(|p| !p.is_empty())
        }
    };

    let saved_key = defaults
        .ssh_public_key
        .clone()
        .or_else(|| public_key_in(&config::operator_home()));
    let ssh_public_key = ask(
        "SSH public key",
        saved_key.as_deref(),
        validate::validate_public_key,
    )?;

    let arch_default = match defaults.architecture {
        Some(Architecture::Bits32) => 1,
        _ => 0,
    };
    let architecture = match Select::with_theme(&theme())
        .with_prompt("Architecture")
        .items(&["64-bit (arm64)", "32-bit (armhf)"])
        .default(arch_default)
        .interact()?
    {
        1 => Architecture::Bits32,
        _ => Architecture::Bits64,
    };

    let network = if confirm(
        "Configure a static IP address?",
        defaults.use_static_ip.unwrap_or(false),
    )? {
        Some(collect_network(defaults)?)
    } else {
        None
    };

    let local_image = if confirm(
        "Use a local image instead of downloading?",
        defaults.use_local_image.unwrap_or(false),
    )? {
        let saved = defaults
            .local_image
            .as_ref()
            .map(|p| p.display().to_string());
        let path = ask("Path to .img or .img.xz", saved.as_deref(), |v| {
            validate::validate_required("local image", v)
        })?;
        Some(PathBuf::from(path))
    } else {
        None
    };

    let answers = ProvisioningAnswers {
        username,
        password,
        ssh_public_key,
        architecture,
        network,
        local_image,
    };
    answers.validate()?;
    Ok(answers)
}

fn collect_network(defaults: &RunConfig) -> Result<StaticNetwork> {
    let iface_default = match defaults.interface {
        Some(Interface::Wireless) => 1,
        _ => 0,
    };
    let interface = match Select::with_theme(&theme())
        .with_prompt("Interface")
        .items(&["Wired (eth0)", "Wireless (wlan0)"])
        .default(iface_default)
        .interact()?
    {
        1 => Interface::Wireless,
        _ => Interface::Wired,
    };

    let ip = ask_ip("Static IP", "static ip", defaults.static_ip.as_deref())?;
    let gateway = ask_ip("Gateway", "gateway ip", defaults.gateway_ip.as_deref())?;
    let subnet_mask = ask(
        "Subnet mask",
        Some(defaults.subnet_mask.as_deref().unwrap_or(DEFAULT_NETMASK)),
        |v| validate::netmask_prefix(v).map(|_| ()),
    )?;
    let dns = ask_ip(
        "DNS server",
        "dns server",
        Some(defaults.dns_server.as_deref().unwrap_or(&gateway)),
    )?;

    let wifi = if interface == Interface::Wireless {
        let ssid = ask("Wi-Fi SSID", defaults.wifi_ssid.as_deref(), |v| {
            validate::validate_required("wifi ssid", v)
        })?;
        let psk = Password::with_theme(&theme())
            .with_prompt("Wi-Fi passphrase (leave empty for an open network)")
            .allow_empty_password(true)
            .interact()?;
        let country = ask(
            "Wi-Fi country code",
            Some(defaults.wifi_country.as_deref().unwrap_or(DEFAULT_WIFI_COUNTRY)),
            |v| validate::validate_required("wifi country", v),
        )?
        .to_ascii_uppercase();
        Some(WifiCredentials {
            ssid,
            psk: Some(psk).filter(|p| !p.is_empty()),
            country,
        })
    } else {
        None
    };

    Ok(StaticNetwork {
        interface,
        ip,
        gateway,
        subnet_mask,
        dns,
        wifi,
    })
}

/// Asks the pipeline's questions on the terminal.
pub struct TerminalOperator;

impl Operator for TerminalOperator {
    fn select_device(&self, candidates: &[BlockDevice]) -> pistrap_core::error::Result<PathBuf> {
        let items: Vec<String> = candidates.iter().map(|d| d.to_string()).collect();
        let selection = Select::with_theme(&theme())
            .with_prompt("Select the device to provision")
            .items(&items)
            .default(0)
            .interact()
            .map_err(prompt_error)?;
        Ok(candidates[selection].path.clone())
    }

    fn confirm(&self, question: &str, default: bool) -> pistrap_core::error::Result<bool> {
        Confirm::with_theme(&theme())
            .with_prompt(question)
            .default(default)
            .interact()
            .map_err(prompt_error)
    }

    fn notice(&self, message: &str) {
        println!("{} {}", style("::").yellow().bold(), message);
    }
}
