//! Edits a freshly written image so it boots headless and reachable.
//!
//! Runs against the mounted boot and root filesystems, in a fixed order:
//! the user account, then SSH, then the optional static network. Each step
//! can be repeated on the same image without duplicating anything, but the
//! sequence as a whole is not transactional.
pub mod network;
pub mod ssh;
pub mod users;

use crate::answers::ProvisioningAnswers;
use crate::error::Result;
use crate::platform::SystemOps;
use std::path::Path;

pub fn apply<P: SystemOps + ?Sized>(
    platform: &P,
    boot: &Path,
    root: &Path,
    answers: &ProvisioningAnswers,
) -> Result<()> {
    let shadow_password = match &answers.password {
        Some(password) => platform.hash_password(password)?,
        None => {
            log::info!("No password given; '{}' will log in by key only", answers.username);
            users::LOCKED_PASSWORD.to_string()
        }
    };
    users::provision(
        root,
        &users::NewUser {
            name: &answers.username,
            shadow_password: &shadow_password,
            ssh_public_key: &answers.ssh_public_key,
        },
    )?;

    ssh::enable_on_first_boot(boot)?;
    ssh::apply_policy(root, &answers.username, answers.password.is_some())?;

    if let Some(network) = &answers.network {
        network::apply(boot, root, network)?;
    }
    Ok(())
}
