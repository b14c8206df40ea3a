//! First-boot SSH enablement and the server's login policy.
use crate::error::Result;
use std::fs;
use std::path::Path;

/// Empty file on the boot partition that makes the OS enable `sshd`.
pub const SENTINEL: &str = "ssh";
pub const SSHD_CONFIG: &str = "etc/ssh/sshd_config";

pub fn enable_on_first_boot(boot: &Path) -> Result<()> {
    fs::write(boot.join(SENTINEL), b"")?;
    log::info!("SSH enabled for first boot");
    Ok(())
}

/// Root may not log in, only `user` may, and password login is off unless
/// the user has a password.
pub fn apply_policy(root: &Path, user: &str, allow_passwords: bool) -> Result<()> {
    let path = root.join(SSHD_CONFIG);
    let mut content = match fs::read_to_string(&path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
        Err(e) => return Err(e.into()),
    };
    content = set_directive(&content, "PermitRootLogin", "no");
    content = set_directive(&content, "AllowUsers", user);
    content = set_directive(
        &content,
        "PasswordAuthentication",
        if allow_passwords { "yes" } else { "no" },
    );
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(&path, content)?;
    log::info!(
        "sshd: root login off, AllowUsers {user}, password login {}",
        if allow_passwords { "on" } else { "off" }
    );
    Ok(())
}

fn keyword(line: &str) -> Option<&str> {
    line.trim_start()
        .trim_start_matches('#')
        .split_whitespace()
        .next()
}

fn is_match_block(line: &str) -> bool {
    let trimmed = line.trim_start();
    !trimmed.starts_with('#')
        && trimmed
            .split_whitespace()
            .next()
            .is_some_and(|k| k.eq_ignore_ascii_case("Match"))
}

/// Sets `key value` in the global section of an sshd_config. The first
/// existing line for `key`, commented out or not, is replaced; later active
/// duplicates are dropped. Otherwise the line goes before the first `Match`
/// block, or at the end.
pub fn set_directive(content: &str, key: &str, value: &str) -> String {
    let wanted = format!("{key} {value}");
    let mut out: Vec<String> = Vec::new();
    let mut placed = false;
    let mut in_match = false;

    for line in content.lines() {
        if is_match_block(line) {
            if !placed {
                out.push(wanted.clone());
                placed = true;
            }
            in_match = true;
        }
        let same_key = !in_match && keyword(line).is_some_and(|k| k.eq_ignore_ascii_case(key));
        if same_key {
            if !placed {
                out.push(wanted.clone());
                placed = true;
            } else if !line.trim_start().starts_with('#') {
                continue;
            } else {
                out.push(line.to_string());
            }
        } else {
            out.push(line.to_string());
        }
    }
    if !placed {
        out.push(wanted);
    }
    let mut joined = out.join("\n");
    joined.push('\n');
    joined
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const STOCK: &str = "Include /etc/ssh/sshd_config.d/*.conf\n\
        #PermitRootLogin prohibit-password\n\
        #PasswordAuthentication yes\n\
        KbdInteractiveAuthentication no\n\
        UsePAM yes\n\
        Subsystem sftp /usr/lib/openssh/sftp-server\n";

    #[test]
    fn commented_defaults_are_replaced_in_place() {
        let out = set_directive(STOCK, "PermitRootLogin", "no");
        let lines: Vec<&str> = out.lines().collect();
        assert_eq!(lines[1], "PermitRootLogin no");
        assert_eq!(lines.len(), STOCK.lines().count());
    }

    #[test]
    fn missing_directive_goes_before_match_block() {
        let config = "UsePAM yes\nMatch User anoncvs\n    PasswordAuthentication yes\n";
        let out = set_directive(config, "PasswordAuthentication", "no");
        assert_eq!(
            out,
            "UsePAM yes\nPasswordAuthentication no\nMatch User anoncvs\n    PasswordAuthentication yes\n"
        );
        let out = set_directive("UsePAM yes", "AllowUsers", "pi");
        assert_eq!(out, "UsePAM yes\nAllowUsers pi\n");
    }

    #[test]
    fn duplicates_collapse_to_one() {
        let config = "AllowUsers bob\nAllowUsers carol\n";
        assert_eq!(set_directive(config, "AllowUsers", "pi"), "AllowUsers pi\n");
    }

    #[test]
    fn policy_is_idempotent() {
        let root = tempdir().unwrap();
        let path = root.path().join(SSHD_CONFIG);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, STOCK).unwrap();

        apply_policy(root.path(), "pi", false).unwrap();
        let first = fs::read_to_string(&path).unwrap();
        apply_policy(root.path(), "pi", false).unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), first);

        assert!(first.lines().any(|l| l == "PermitRootLogin no"));
        assert!(first.lines().any(|l| l == "AllowUsers pi"));
        assert!(first.lines().any(|l| l == "PasswordAuthentication no"));
        assert!(first.lines().any(|l| l == "UsePAM yes"));
    }

    #[test]
    fn sentinel_is_created() {
        let boot = tempdir().unwrap();
        enable_on_first_boot(boot.path()).unwrap();
        assert!(boot.path().join("ssh").is_file());
    }
}
