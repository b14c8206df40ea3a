//! Finds the boot and root partitions of a freshly written device by the
//! filesystem they carry, never by partition number.
use crate::error::{ProvisionError, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

pub const BOOT_FSTYPE: &str = "vfat";
pub const ROOT_FSTYPE: &str = "ext4";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PartitionInfo {
    pub path: PathBuf,
    pub fstype: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PartitionPair {
    pub boot: PathBuf,
    pub root: PathBuf,
}

#[derive(Debug, Deserialize)]
struct LsblkOutput {
    blockdevices: Vec<LsblkNode>,
}

#[derive(Debug, Deserialize)]
struct LsblkNode {
    name: String,
    #[serde(default)]
    path: Option<String>,
    #[serde(default)]
    fstype: Option<String>,
    #[serde(rename = "type", default)]
    kind: String,
    #[serde(default)]
    children: Vec<LsblkNode>,
}

/// Parses `lsblk --json -o NAME,PATH,FSTYPE,TYPE <disk>` into the disk's
/// partitions, in the order lsblk lists them.
pub fn parse_lsblk(json: &str) -> Result<Vec<PartitionInfo>> {
    let parsed: LsblkOutput = serde_json::from_str(json).map_err(|e| ProvisionError::Command {
        program: "lsblk".into(),
        code: None,
        stderr: format!("unparsable output: {e}"),
    })?;

    fn walk(node: &LsblkNode, out: &mut Vec<PartitionInfo>) {
        if node.kind == "part" {
            let path = node
                .path
                .clone()
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("/dev").join(&node.name));
            out.push(PartitionInfo {
                path,
                fstype: node.fstype.clone().filter(|f| !f.is_empty()),
            });
        }
        for child in &node.children {
            walk(child, out);
        }
    }

    let mut out = Vec::new();
    for node in &parsed.blockdevices {
        walk(node, &mut out);
    }
    Ok(out)
}

/// One line per partition, for the operator when detection fails.
pub fn describe(parts: &[PartitionInfo]) -> String {
    if parts.is_empty() {
        return "no partitions".to_string();
    }
    parts
        .iter()
        .map(|p| {
            format!(
                "{} ({})",
                p.path.display(),
                p.fstype.as_deref().unwrap_or("no filesystem")
            )
        })
        .collect::<Vec<_>>()
        .join(", ")
}

/// First `vfat` partition is boot, first `ext4` partition is root.
pub fn locate(device: &Path, parts: &[PartitionInfo]) -> Result<PartitionPair> {
    let find = |fstype: &str| {
        parts
            .iter()
            .find(|p| p.fstype.as_deref() == Some(fstype))
            .map(|p| p.path.clone())
    };
    match (find(BOOT_FSTYPE), find(ROOT_FSTYPE)) {
        (Some(boot), Some(root)) => Ok(PartitionPair { boot, root }),
        _ => Err(ProvisionError::PartitionsNotFound {
            device: device.to_path_buf(),
            observed: describe(parts),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WRITTEN_CARD: &str = r#"{
       "blockdevices": [
          {"name":"mmcblk0", "path":"/dev/mmcblk0", "fstype":null, "type":"disk",
             "children": [
                {"name":"mmcblk0p1", "path":"/dev/mmcblk0p1", "fstype":"vfat", "type":"part"},
                {"name":"mmcblk0p2", "path":"/dev/mmcblk0p2", "fstype":"ext4", "type":"part"}
             ]
          }
       ]
    }"#;

    #[test]
    fn parses_children_of_the_disk() {
        let parts = parse_lsblk(WRITTEN_CARD).unwrap();
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[0].path, PathBuf::from("/dev/mmcblk0p1"));
        assert_eq!(parts[1].fstype.as_deref(), Some("ext4"));
    }

    #[test]
    fn falls_back_to_name_without_path_column() {
        let json = r#"{"blockdevices":[{"name":"sdb","type":"disk","children":[
            {"name":"sdb1","fstype":"","type":"part"}]}]}"#;
        let parts = parse_lsblk(json).unwrap();
        assert_eq!(parts[0].path, PathBuf::from("/dev/sdb1"));
        assert_eq!(parts[0].fstype, None);
    }

    #[test]
    fn locates_by_type_not_position() {
        let parts = vec![
            PartitionInfo {
                path: "/dev/sdb1".into(),
                fstype: Some("ext4".into()),
            },
            PartitionInfo {
                path: "/dev/sdb2".into(),
                fstype: None,
            },
            PartitionInfo {
                path: "/dev/sdb3".into(),
                fstype: Some("vfat".into()),
            },
            PartitionInfo {
                path: "/dev/sdb4".into(),
                fstype: Some("ext4".into()),
            },
        ];
        let pair = locate(Path::new("/dev/sdb"), &parts).unwrap();
        assert_eq!(pair.boot, PathBuf::from("/dev/sdb3"));
        assert_eq!(pair.root, PathBuf::from("/dev/sdb1"));
    }

    #[test]
    fn missing_root_reports_what_was_seen() {
        let parts = vec![PartitionInfo {
            path: "/dev/sdb1".into(),
            fstype: Some("vfat".into()),
        }];
        match locate(Path::new("/dev/sdb"), &parts) {
            Err(ProvisionError::PartitionsNotFound { device, observed }) => {
                assert_eq!(device, PathBuf::from("/dev/sdb"));
                assert_eq!(observed, "/dev/sdb1 (vfat)");
            }
            other => panic!("unexpected: {other:?}"),
        }
        assert!(locate(Path::new("/dev/sdb"), &[]).is_err());
    }
}
