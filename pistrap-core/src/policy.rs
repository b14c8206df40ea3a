//! Decides whether a device should have its partition table recreated
//! before the image is written.
use crate::device::DeviceClass;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FormatAction {
    Format,
    Skip,
}

/// A default for the operator, never applied without confirmation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Recommendation {
    pub action: FormatAction,
    pub reason: &'static str,
}

impl Recommendation {
    pub fn format_by_default(&self) -> bool {
        self.action == FormatAction::Format
    }
}

pub fn recommend(class: DeviceClass) -> Recommendation {
    match class {
        DeviceClass::FlashDrive => Recommendation {
            action: FormatAction::Skip,
            reason: "USB drives take the image's own partition layout as written; formatting first is unnecessary.",
        },
        DeviceClass::SdCard | DeviceClass::SmallDevice | DeviceClass::Unknown => Recommendation {
            action: FormatAction::Format,
            reason: "Used SD cards often carry stale partition tables; clearing them avoids confusing partition detection later.",
        },
    }
}
