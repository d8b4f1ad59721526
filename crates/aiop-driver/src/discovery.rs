//! Device discovery inside an IOMMU group
//!
//! Matches the group's device listing against the role prefixes and binds
//! the first object found for each role.

use crate::device::{DeviceRecord, DeviceRole, DeviceSet};
use crate::error::{AiopError, Result};
use crate::platform::{close_quietly, GroupFd, GroupId, Platform};
use aiop_mc::layout::object_id;

/// Binds the companion and accelerator devices of a group
#[derive(Debug, Clone, Copy, Default)]
pub struct DeviceBinder;

impl DeviceBinder {
    /// Resolve both roles in `group` and open the accelerator.
    ///
    /// Only the first listed object of each role is bound; further
    /// instances are reported and ignored.
    ///
    /// # Errors
    ///
    /// Returns an error if the listing cannot be read, a role is missing, an
    /// object name has no numeric id, or the accelerator cannot be opened
    /// or queried. Nothing stays open on failure.
    pub fn bind<P: Platform>(
        platform: &P,
        group_fd: GroupFd,
        group: GroupId,
    ) -> Result<DeviceSet> {
        let names = platform.group_devices(group)?;
        tracing::debug!("IOMMU group {group} devices: {names:?}");

        let companion = Self::first(&names, DeviceRole::Companion, group)?;
        let mut accelerator = Self::first(&names, DeviceRole::Accelerator, group)?;

        let fd = platform.device_fd(group_fd, &accelerator.name)?;
        match platform.device_info(fd) {
            Ok(metadata) => {
                tracing::info!(
                    "{}: {} regions, {} IRQs",
                    accelerator.name,
                    metadata.num_regions,
                    metadata.num_irqs
                );
                accelerator.fd = Some(fd);
                accelerator.metadata = Some(metadata);
            }
            Err(e) => {
                tracing::error!("Cannot query {}: {e}", accelerator.name);
                close_quietly(platform, fd);
                return Err(e);
            }
        }

        tracing::info!(
            "Bound {} (id {}) and {} (id {})",
            companion.name,
            companion.hw_id,
            accelerator.name,
            accelerator.hw_id
        );
        Ok(DeviceSet::new(companion, accelerator))
    }

    fn first(names: &[String], role: DeviceRole, group: GroupId) -> Result<DeviceRecord> {
        let mut matches = names.iter().filter(|n| n.starts_with(role.prefix()));
        let Some(name) = matches.next() else {
            tracing::error!("No {role} object in IOMMU group {group}");
            return Err(AiopError::DeviceMissing {
                role: role.prefix(),
                group: group.0,
            });
        };
        for extra in matches {
            tracing::warn!("Ignoring additional {role} object {extra}; using {name}");
        }
        let hw_id = object_id(name).ok_or_else(|| AiopError::InvalidDeviceName {
            name: name.clone(),
        })?;
        Ok(DeviceRecord::new(name.clone(), hw_id))
    }
}
