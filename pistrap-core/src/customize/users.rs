//! Account records in the image's `/etc/passwd`, `/etc/group`, `/etc/shadow`
//! and `/etc/gshadow`, plus sudo rights, home directory and SSH key.
use crate::error::Result;
use std::fs;
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use time::OffsetDateTime;

pub const UID: u32 = 1000;
pub const GID: u32 = 1000;
/// Shadow password field that disables password login.
pub const LOCKED_PASSWORD: &str = "!";
/// Groups the default Raspberry Pi OS user belongs to. Only those present in
/// the image are touched.
pub const SUPPLEMENTARY_GROUPS: &[&str] = &[
    "adm", "dialout", "cdrom", "sudo", "audio", "video", "plugdev", "games", "users", "input",
    "render", "netdev", "spi", "i2c", "gpio",
];

pub struct NewUser<'a> {
    pub name: &'a str,
    /// Either a crypt(3) hash or [`LOCKED_PASSWORD`].
    pub shadow_password: &'a str,
    pub ssh_public_key: &'a str,
}

/// Replaces any existing account called `user.name` and installs the new one.
pub fn provision(root: &Path, user: &NewUser<'_>) -> Result<()> {
    let name = user.name;
    let home = format!("/home/{name}");

    edit_records(&root.join("etc/passwd"), 0o644, |lines| {
        lines.retain(|l| field(l, 0) != Some(name));
        lines.push(format!("{name}:x:{UID}:{GID}:,,,:{home}:/bin/bash"));
    })?;

    edit_records(&root.join("etc/group"), 0o644, |lines| {
        lines.retain(|l| field(l, 0) != Some(name));
        for line in lines.iter_mut() {
            *line = without_member(line, name);
            if field(line, 0).is_some_and(|g| SUPPLEMENTARY_GROUPS.contains(&g)) {
                *line = with_member(line, name);
            }
        }
        lines.push(format!("{name}:x:{GID}:"));
    })?;

    let days = OffsetDateTime::now_utc().unix_timestamp() / 86_400;
    edit_records(&root.join("etc/shadow"), 0o640, |lines| {
        lines.retain(|l| field(l, 0) != Some(name));
        lines.push(format!(
            "{name}:{}:{days}:0:99999:7:::",
            user.shadow_password
        ));
    })?;

    let gshadow = root.join("etc/gshadow");
    if gshadow.exists() {
        edit_records(&gshadow, 0o640, |lines| {
            lines.retain(|l| field(l, 0) != Some(name));
            lines.push(format!("{name}:!::"));
        })?;
    }

    install_sudoers(root, name)?;
    let home_dir = root.join(home.trim_start_matches('/'));
    create_home(root, &home_dir)?;
    install_authorized_key(&home_dir, user.ssh_public_key)?;
    log::info!("Provisioned user '{name}' (uid {UID})");
    Ok(())
}

fn field(line: &str, index: usize) -> Option<&str> {
    line.split(':').nth(index)
}

/// Reads a colon-separated database, lets `edit` change its lines and
/// writes it back. A missing file starts empty and is created with `mode`.
fn edit_records(path: &Path, mode: u32, edit: impl FnOnce(&mut Vec<String>)) -> Result<()> {
    let existed = path.exists();
    let content = if existed {
        fs::read_to_string(path)?
    } else {
        String::new()
    };
    let mut lines: Vec<String> = content
        .lines()
        .filter(|l| !l.trim().is_empty())
        .map(str::to_string)
        .collect();
    edit(&mut lines);

    let mut out = lines.join("\n");
    out.push('\n');
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, out)?;
    if !existed {
        fs::set_permissions(path, fs::Permissions::from_mode(mode))?;
    }
    Ok(())
}

fn members(line: &str) -> (Vec<&str>, Vec<&str>) {
    let parts: Vec<&str> = line.splitn(4, ':').collect();
    let head = parts.iter().take(3).copied().collect();
    let members = parts
        .get(3)
        .map(|m| m.split(',').filter(|s| !s.is_empty()).collect())
        .unwrap_or_default();
    (head, members)
}

fn join_group(head: &[&str], members: &[&str]) -> String {
    let mut head: Vec<&str> = head.to_vec();
    head.resize(3, "");
    format!("{}:{}", head.join(":"), members.join(","))
}

fn with_member(line: &str, user: &str) -> String {
    let (head, mut list) = members(line);
    if !list.contains(&user) {
        list.push(user);
    }
    join_group(&head, &list)
}

fn without_member(line: &str, user: &str) -> String {
    let (head, list) = members(line);
    if !list.contains(&user) {
        return line.to_string();
    }
    let kept: Vec<&str> = list.into_iter().filter(|m| *m != user).collect();
    join_group(&head, &kept)
}

fn install_sudoers(root: &Path, name: &str) -> Result<()> {
    let dir = root.join("etc/sudoers.d");
    fs::create_dir_all(&dir)?;
    let path = dir.join(format!("010_{name}-nopasswd"));
    fs::write(&path, format!("{name} ALL=(ALL) NOPASSWD: ALL\n"))?;
    fs::set_permissions(&path, fs::Permissions::from_mode(0o440))?;
    Ok(())
}

fn create_home(root: &Path, home: &Path) -> Result<()> {
    if home.exists() {
        return Ok(());
    }
    fs::create_dir_all(home)?;
    fs::set_permissions(home, fs::Permissions::from_mode(0o755))?;
    let skel = root.join("etc/skel");
    if skel.is_dir() {
        copy_dir_recursive(&skel, home)?;
    }
    chown_recursive(home);
    Ok(())
}

fn copy_dir_recursive(src: &Path, dst: &Path) -> io::Result<()> {
    fs::create_dir_all(dst)?;
    for entry in fs::read_dir(src)? {
        let entry = entry?;
        let from = entry.path();
        let to = dst.join(entry.file_name());
        let file_type = entry.file_type()?;
        if file_type.is_symlink() {
            let target = fs::read_link(&from)?;
            if to.symlink_metadata().is_ok() {
                fs::remove_file(&to)?;
            }
            std::os::unix::fs::symlink(target, &to)?;
        } else if file_type.is_dir() {
            copy_dir_recursive(&from, &to)?;
        } else {
            fs::copy(&from, &to)?;
        }
    }
    Ok(())
}

fn install_authorized_key(home: &Path, key: &str) -> Result<()> {
    let ssh_dir = home.join(".ssh");
    fs::create_dir_all(&ssh_dir)?;
    fs::set_permissions(&ssh_dir, fs::Permissions::from_mode(0o700))?;
    let keys = ssh_dir.join("authorized_keys");
    fs::write(&keys, format!("{}\n", key.trim()))?;
    fs::set_permissions(&keys, fs::Permissions::from_mode(0o600))?;
    chown(home);
    chown(&ssh_dir);
    chown(&keys);
    Ok(())
}

/// Hands `path` to the provisioned user. Without root this cannot succeed,
/// which only matters when the result is booted.
fn chown(path: &Path) {
    let result = nix::unistd::chown(
        path,
        Some(nix::unistd::Uid::from_raw(UID)),
        Some(nix::unistd::Gid::from_raw(GID)),
    );
    if let Err(e) = result {
        log::debug!("chown {} to {UID}:{GID} failed: {e}", path.display());
    }
}

fn chown_recursive(path: &Path) {
    chown(path);
    if let Ok(entries) = fs::read_dir(path) {
        for entry in entries.flatten() {
            let p = entry.path();
            match entry.file_type() {
                Ok(t) if t.is_dir() => chown_recursive(&p),
                Ok(t) if t.is_symlink() => {
                    if let Err(e) = std::os::unix::fs::lchown(&p, Some(UID), Some(GID)) {
                        log::debug!("lchown {} failed: {e}", p.display());
                    }
                }
                _ => chown(&p),
            }
        }
    }
}
