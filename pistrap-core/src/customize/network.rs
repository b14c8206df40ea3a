//! Static addressing and Wi-Fi credentials.
//!
//! The supplicant file goes on the boot partition, where the OS picks it up
//! on first boot. The static address is a per-interface block in the root
//! filesystem's `dhcpcd.conf`.
use crate::answers::{StaticNetwork, WifiCredentials};
use crate::error::Result;
use crate::validate;
use std::fs;
use std::path::Path;

pub const WPA_SUPPLICANT: &str = "wpa_supplicant.conf";
pub const DHCPCD_CONF: &str = "etc/dhcpcd.conf";

pub fn apply(boot: &Path, root: &Path, network: &StaticNetwork) -> Result<()> {
    if let Some(wifi) = &network.wifi {
        fs::write(boot.join(WPA_SUPPLICANT), supplicant_config(wifi))?;
        log::info!("Wi-Fi configured for SSID '{}'", wifi.ssid);
    }

    let prefix = validate::netmask_prefix(&network.subnet_mask)?;
    let iface = network.interface.name();
    let path = root.join(DHCPCD_CONF);
    let existing = match fs::read_to_string(&path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
        Err(e) => return Err(e.into()),
    };
    let mut content = remove_interface_block(&existing, iface);
    if !content.is_empty() {
        while !content.ends_with("\n\n") {
            content.push('\n');
        }
    }
    content.push_str(&static_block(iface, network, prefix));
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(&path, content)?;
    log::info!("Static address {}/{} on {}", network.ip, prefix, iface);
    Ok(())
}

fn quote(value: &str) -> String {
    format!("\"{}\"", value.replace('\\', "\\\\").replace('"', "\\\""))
}

pub fn supplicant_config(wifi: &WifiCredentials) -> String {
    let auth = match &wifi.psk {
        Some(psk) => format!("    psk={}", quote(psk)),
        None => "    key_mgmt=NONE".to_string(),
    };
    format!(
        "ctrl_interface=DIR=/var/run/wpa_supplicant GROUP=netdev\n\
         update_config=1\n\
         country={}\n\
         \n\
         network={{\n    ssid={}\n{}\n}}\n",
        wifi.country,
        quote(&wifi.ssid),
        auth
    )
}

/// The block that pins `iface` to a static address and keeps DHCP off it.
pub fn static_block(iface: &str, network: &StaticNetwork, prefix: u8) -> String {
    format!(
        "interface {iface}\n\
         static ip_address={}/{prefix}\n\
         static routers={}\n\
         static domain_name_servers={}\n\
         nodhcp\n",
        network.ip, network.gateway, network.dns
    )
}

/// Drops every `interface <iface>` line and what follows it up to and
/// including the next blank line.
pub fn remove_interface_block(content: &str, iface: &str) -> String {
    let mut out: Vec<&str> = Vec::new();
    let mut skipping = false;
    for line in content.lines() {
        let trimmed = line.trim();
        if skipping {
            if trimmed.is_empty() {
                skipping = false;
            }
            continue;
        }
        let mut words = trimmed.split_whitespace();
        if words.next() == Some("interface") && words.next() == Some(iface) {
            skipping = true;
            continue;
        }
        out.push(line);
    }
    while out.last().is_some_and(|l| l.trim().is_empty()) {
        out.pop();
    }
    if out.is_empty() {
        return String::new();
    }
    let mut joined = out.join("\n");
    joined.push('\n');
    joined
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::answers::Interface;
    use tempfile::tempdir;

    fn wired() -> StaticNetwork {
        StaticNetwork {
            interface: Interface::Wired,
            ip: "192.168.0.50".into(),
            gateway: "192.168.0.1".into(),
            subnet_mask: "255.255.255.0".into(),
            dns: "1.1.1.1".into(),
            wifi: None,
        }
    }

    const STOCK: &str = "hostname\nclientid\npersistent\n\n\
        # Example static IP configuration:\n#interface eth0\n#static ip_address=192.168.0.10/24\n";

    #[test]
    fn block_removal_stops_at_blank_line() {
        let conf = "option rapid_commit\n\ninterface eth0\nstatic ip_address=10.0.0.2/8\n\ninterface wlan0\nstatic ip_address=10.0.0.3/8\n";
        assert_eq!(
            remove_interface_block(conf, "eth0"),
            "option rapid_commit\n\ninterface wlan0\nstatic ip_address=10.0.0.3/8\n"
        );
        // Commented examples and other interfaces are left alone.
        assert_eq!(remove_interface_block(STOCK, "eth0"), STOCK);
        assert_eq!(remove_interface_block(conf, "eth1"), conf);
    }

    #[test]
    fn exactly_one_block_after_repeated_runs() {
        let root = tempdir().unwrap();
        let boot = tempdir().unwrap();
        fs::create_dir_all(root.path().join("etc")).unwrap();
        fs::write(root.path().join(DHCPCD_CONF), STOCK).unwrap();

        apply(boot.path(), root.path(), &wired()).unwrap();
        apply(boot.path(), root.path(), &wired()).unwrap();

        let conf = fs::read_to_string(root.path().join(DHCPCD_CONF)).unwrap();
        assert_eq!(conf.lines().filter(|l| *l == "interface eth0").count(), 1);
        assert_eq!(conf.matches("nodhcp").count(), 1);
        assert!(conf.starts_with(STOCK));
        assert!(conf.ends_with(
            "interface eth0\nstatic ip_address=192.168.0.50/24\nstatic routers=192.168.0.1\nstatic domain_name_servers=1.1.1.1\nnodhcp\n"
        ));
        assert!(!boot.path().join(WPA_SUPPLICANT).exists());
    }

    #[test]
    fn wireless_writes_supplicant_with_or_without_psk() {
        let mut wifi = WifiCredentials {
            ssid: "Home \"5G\"".into(),
            psk: Some("hunter22hunter22".into()),
            country: "GB".into(),
        };
        let conf = supplicant_config(&wifi);
        assert!(conf.contains("country=GB\n"));
        assert!(conf.contains("ssid=\"Home \\\"5G\\\"\""));
        assert!(conf.contains("psk=\"hunter22hunter22\""));

        wifi.psk = None;
        let conf = supplicant_config(&wifi);
        assert!(conf.contains("key_mgmt=NONE"));
        assert!(!conf.contains("psk="));
    }

    #[test]
    fn wireless_targets_wlan0() {
        let root = tempdir().unwrap();
        let boot = tempdir().unwrap();
        let mut net = wired();
        net.interface = Interface::Wireless;
        net.wifi = Some(WifiCredentials {
            ssid: "lab".into(),
            psk: None,
            country: "US".into(),
        });
        apply(boot.path(), root.path(), &net).unwrap();
        assert!(boot.path().join(WPA_SUPPLICANT).exists());
        let conf = fs::read_to_string(root.path().join(DHCPCD_CONF)).unwrap();
        assert!(conf.starts_with("interface wlan0\n"));
    }
}
