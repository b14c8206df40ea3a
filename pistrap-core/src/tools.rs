//! Host tool preflight, run before any device is touched.
use crate::error::{ProvisionError, Result};
use crate::platform::ProbeOps;

/// Needed on every run.
pub const REQUIRED_TOOLS: &[&str] = &["lsblk", "mkfs.vfat"];
/// Needed only to hash a login password.
pub const PASSWORD_TOOL: &str = "openssl";
/// Used when present; the run degrades without them.
pub const OPTIONAL_TOOLS: &[&str] = &["partprobe", "udevadm"];

/// Fails with [`ProvisionError::MissingDependency`] naming the first missing
/// required tool.
pub fn preflight<P: ProbeOps + ?Sized>(probe: &P, needs_password_hash: bool) -> Result<()> {
    let mut required: Vec<&str> = REQUIRED_TOOLS.to_vec();
    if needs_password_hash {
        required.push(PASSWORD_TOOL);
    }
    for tool in required {
        match probe.find_tool(tool) {
            Some(path) => log::debug!("Found {} at {}", tool, path.display()),
            None => {
                log::error!("Required tool '{tool}' is not installed");
                return Err(ProvisionError::MissingDependency(tool.to_string()));
            }
        }
    }
    for tool in OPTIONAL_TOOLS {
        if probe.find_tool(tool).is_none() {
            log::warn!("Optional tool '{tool}' not found; falling back to fixed waits");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::fake::FakePlatform;

    #[test]
    fn everything_present_passes() {
        assert!(preflight(&FakePlatform::new(), true).is_ok());
    }

    #[test]
    fn missing_required_tool_is_named() {
        let platform = FakePlatform::new().without_tool("lsblk");
        match preflight(&platform, false) {
            Err(ProvisionError::MissingDependency(tool)) => assert_eq!(tool, "lsblk"),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn openssl_only_matters_with_a_password() {
        let platform = FakePlatform::new().without_tool("openssl").without_tool("udevadm");
        assert!(preflight(&platform, false).is_ok());
        assert!(matches!(
            preflight(&platform, true),
            Err(ProvisionError::MissingDependency(_))
        ));
    }
}
