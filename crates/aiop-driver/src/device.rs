//! Device records for the two objects a session drives.

use crate::platform::{DeviceFd, DeviceMetadata};
use aiop_mc::Token;

/// Role of a device inside the container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceRole {
    /// `dpmcp` MC portal used as the control plane
    Companion,
    /// `dpaiop` accelerator tile
    Accelerator,
}

impl DeviceRole {
    /// Object name prefix matched during discovery.
    pub const fn prefix(self) -> &'static str {
        match self {
            Self::Companion => aiop_mc::layout::COMPANION_PREFIX,
            Self::Accelerator => aiop_mc::layout::ACCELERATOR_PREFIX,
        }
    }
}

impl std::fmt::Display for DeviceRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.prefix())
    }
}

/// One bound device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceRecord {
    /// Object name, e.g. `dpaiop.0`
    pub name: String,
    /// Hardware id parsed from the name
    pub hw_id: u32,
    /// Open descriptor (accelerator only)
    pub fd: Option<DeviceFd>,
    /// Region and IRQ counts (accelerator only)
    pub metadata: Option<DeviceMetadata>,
    /// Firmware session token, set only while a channel is open
    pub token: Option<Token>,
}

impl DeviceRecord {
    /// Record without descriptor or metadata.
    pub fn new(name: impl Into<String>, hw_id: u32) -> Self {
        Self {
            name: name.into(),
            hw_id,
            fd: None,
            metadata: None,
            token: None,
        }
    }
}

/// Exactly one record per role.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceSet {
    companion: DeviceRecord,
    accelerator: DeviceRecord,
}

impl DeviceSet {
    /// Pair two records.
    pub const fn new(companion: DeviceRecord, accelerator: DeviceRecord) -> Self {
        Self {
            companion,
            accelerator,
        }
    }

    /// The control-plane device.
    pub const fn companion(&self) -> &DeviceRecord {
        &self.companion
    }

    /// The accelerator tile.
    pub const fn accelerator(&self) -> &DeviceRecord {
        &self.accelerator
    }

    /// Record for `role`.
    pub const fn get(&self, role: DeviceRole) -> &DeviceRecord {
        match role {
            DeviceRole::Companion => &self.companion,
            DeviceRole::Accelerator => &self.accelerator,
        }
    }

    pub(crate) fn accelerator_mut(&mut self) -> &mut DeviceRecord {
        &mut self.accelerator
    }
}
