//! The core, UI-agnostic library for the `pistrap` provisioning tool.
//!
//! `pistrap-core` writes a Raspberry Pi OS image onto an SD card or USB
//! drive and prepares it for a headless first boot: a user account with an
//! SSH key, an SSH server that only lets that user in, and optionally a
//! static address on the wired or wireless interface. Any front-end can drive
//! it; the `pistrap` binary is a terminal one.
//!
//! The library is structured into several key modules:
//! - [`inventory`] and [`device`]: which block devices may be written and
//!   what kind of media they probably are.
//! - [`policy`] and [`format`]: whether to clear the partition table first,
//!   and doing so.
//! - [`image`]: a local or downloaded, checksum-verified, decompressed image.
//! - [`mod@write`]: the block-level copy.
//! - [`partitions`]: finding boot and root by filesystem type.
//! - [`customize`]: user, SSH and network setup inside the image.
//! - [`recovery`] and [`config`]: cleanup, recovery advice and the persisted
//!   record of the last run.
//! - [`platform`]: everything that touches the host, behind traits, with a
//!   Linux implementation and a recording fake for tests.
//!
//! The entry point is [`pipeline::Provisioner::execute`]. Interaction goes
//! through [`pipeline::Operator`] and progress through [`progress::Progress`],
//! so the caller decides how questions are asked and bars are drawn.
//!
//! ## Example
//!
//! ```rust,no_run
//! use pistrap_core::answers::{Architecture, ProvisioningAnswers};
//! use pistrap_core::config::ConfigStore;
//! use pistrap_core::device::BlockDevice;
//! use pistrap_core::error::Result;
//! use pistrap_core::pipeline::{Operator, PipelineOptions, Provisioner};
//! use pistrap_core::platform::linux::LinuxPlatform;
//! use pistrap_core::progress::NoProgress;
//! use std::path::PathBuf;
//! use std::sync::atomic::AtomicBool;
//!
//! struct AssumeYes;
//!
//! impl Operator for AssumeYes {
//!     fn select_device(&self, candidates: &[BlockDevice]) -> Result<PathBuf> {
//!         Ok(candidates[0].path.clone())
//!     }
//!     fn confirm(&self, _question: &str, _default: bool) -> Result<bool> {
//!         Ok(true)
//!     }
//!     fn notice(&self, message: &str) {
//!         println!("{message}");
//!     }
//! }
//!
//! fn main() -> Result<()> {
//!     let answers = ProvisioningAnswers {
//!         username: "pi".into(),
//!         password: None,
//!         ssh_public_key: "ssh-ed25519 AAAA... me@laptop".into(),
//!         architecture: Architecture::Bits64,
//!         network: None,
//!         local_image: None,
//!     };
//!     let store = ConfigStore::locate();
//!     let previous = store.load();
//!     let running = AtomicBool::new(true);
//!     let platform = LinuxPlatform::new();
//!     let summary = Provisioner::new(&platform, &AssumeYes, &NoProgress, &running, PipelineOptions::from_env())
//!         .execute(answers, store, previous)?;
//!     println!("{}", summary.ssh_command());
//!     Ok(())
//! }
//! ```

pub mod answers;
pub mod blockdev;
pub mod config;
pub mod customize;
pub mod device;
pub mod error;
pub mod format;
pub mod image;
pub mod inventory;
pub mod mount;
pub mod partitions;
pub mod pipeline;
pub mod platform;
pub mod policy;
pub mod progress;
pub mod recovery;
pub mod tools;
pub mod validate;
pub mod write;
