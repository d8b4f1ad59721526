//! Platform abstraction over the VFIO user-space protocol.
//!
//! Everything the driver asks of the kernel goes through [`Platform`]: group
//! and container ioctls, device descriptors, IOMMU mappings, and the host
//! memory mappings that back DMA buffers. [`VfioPlatform`](crate::VfioPlatform)
//! issues the real calls; [`SimPlatform`](crate::sim::SimPlatform) models
//! them in memory for CI and dry runs.
//!
//! Descriptors are plain `Copy` handles. Ownership is tracked by the pool,
//! the session and the load orchestrator, which close them explicitly.

use crate::config::ContainerName;
use crate::error::Result;
use crate::portal::FirmwareControl;
use std::os::unix::io::RawFd;
use std::path::Path;

/// A raw descriptor of a known kind.
pub trait Descriptor: Copy + std::fmt::Debug {
    /// Kind name used in diagnostics.
    const KIND: &'static str;

    /// The raw descriptor number.
    fn raw(self) -> RawFd;
}

macro_rules! descriptor {
    ($(#[$doc:meta])* $name:ident, $kind:literal) => {
        $(#[$doc])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub struct $name(pub RawFd);

        impl Descriptor for $name {
            const KIND: &'static str = $kind;

            fn raw(self) -> RawFd {
                self.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}:{}", Self::KIND, self.0)
            }
        }
    };
}

descriptor!(
    /// `/dev/vfio/<group>` descriptor.
    GroupFd,
    "group"
);
descriptor!(
    /// `/dev/vfio/vfio` container descriptor.
    ContainerFd,
    "container"
);
descriptor!(
    /// VFIO device descriptor obtained from a group.
    DeviceFd,
    "device"
);
descriptor!(
    /// Regular file opened for staging.
    FileFd,
    "file"
);

/// IOMMU group number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GroupId(pub u32);

impl std::fmt::Display for GroupId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Host virtual address of a mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VirtAddr(pub u64);

impl VirtAddr {
    /// The device-visible address of this host address under the identity
    /// IOVA scheme used for staged buffers.
    pub const fn identity_iova(self) -> Iova {
        Iova(self.0)
    }

    /// Build from a pointer returned by `mmap`.
    pub fn from_ptr<T>(ptr: *mut T) -> Self {
        Self(ptr as u64)
    }

    /// Pointer form for `munmap` and volatile access.
    #[allow(clippy::cast_possible_truncation)]
    pub fn as_ptr(self) -> *mut std::ffi::c_void {
        self.0 as usize as *mut std::ffi::c_void
    }
}

impl std::fmt::Display for VirtAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Device-visible I/O virtual address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Iova(pub u64);

impl std::fmt::Display for Iova {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Region and interrupt counts of a VFIO device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DeviceMetadata {
    /// Number of regions
    pub num_regions: u32,
    /// Number of interrupts
    pub num_irqs: u32,
}

/// Kernel control surface used by the driver.
///
/// All methods take `&self`; implementations carry no per-call state the
/// driver relies on beyond the descriptors they hand out.
pub trait Platform {
    /// Firmware channel backed by a mapped MC portal.
    type Portal: FirmwareControl;

    /// Resolve the IOMMU group of a container object.
    ///
    /// # Errors
    ///
    /// Returns an error if the container or its group link does not exist.
    fn container_group(&self, container: &ContainerName) -> Result<GroupId>;

    /// Names of the devices in an IOMMU group.
    ///
    /// # Errors
    ///
    /// Returns an error if the group listing cannot be read.
    fn group_devices(&self, group: GroupId) -> Result<Vec<String>>;

    /// Open the group node.
    ///
    /// # Errors
    ///
    /// Returns an error if the node cannot be opened.
    fn open_group(&self, group: GroupId) -> Result<GroupFd>;

    /// Whether every device in the group is bound to the VFIO bus driver.
    ///
    /// # Errors
    ///
    /// Returns an error if the status query fails.
    fn group_viable(&self, group: GroupFd) -> Result<bool>;

    /// Attach a group to a container.
    ///
    /// # Errors
    ///
    /// Returns an error if the kernel refuses the attachment.
    fn set_container(&self, group: GroupFd, container: ContainerFd) -> Result<()>;

    /// Detach a group from its container.
    ///
    /// # Errors
    ///
    /// Returns an error if the kernel refuses.
    fn unset_container(&self, group: GroupFd) -> Result<()>;

    /// Open a fresh container.
    ///
    /// # Errors
    ///
    /// Returns an error if `/dev/vfio/vfio` cannot be opened.
    fn open_container(&self) -> Result<ContainerFd>;

    /// VFIO API version of a container.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    fn api_version(&self, container: ContainerFd) -> Result<i32>;

    /// Whether the container supports the Type1 IOMMU backend.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    fn has_type1_iommu(&self, container: ContainerFd) -> Result<bool>;

    /// Select the Type1 IOMMU backend.
    ///
    /// # Errors
    ///
    /// Returns an error if the kernel refuses.
    fn set_iommu(&self, container: ContainerFd) -> Result<()>;

    /// Open a device by name through its group.
    ///
    /// # Errors
    ///
    /// Returns an error if the device is not in the group.
    fn device_fd(&self, group: GroupFd, name: &str) -> Result<DeviceFd>;

    /// Region and interrupt counts of a device.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    fn device_info(&self, device: DeviceFd) -> Result<DeviceMetadata>;

    /// Map the MC portal region of a companion device.
    ///
    /// The mapping outlives `device`.
    ///
    /// # Errors
    ///
    /// Returns an error if the region cannot be queried or mapped.
    fn map_portal(&self, device: DeviceFd) -> Result<Self::Portal>;

    /// Register `[vaddr, vaddr + len)` at `iova`, read and write.
    ///
    /// # Errors
    ///
    /// Returns an error if the IOMMU refuses the mapping.
    fn map_dma(&self, container: ContainerFd, vaddr: VirtAddr, iova: Iova, len: usize)
        -> Result<()>;

    /// Remove the registration at `iova`.
    ///
    /// # Errors
    ///
    /// Returns an error if the IOMMU refuses.
    fn unmap_dma(&self, container: ContainerFd, iova: Iova, len: usize) -> Result<()>;

    /// Open a regular file read-only.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened.
    fn open_file(&self, path: &Path) -> Result<FileFd>;

    /// Map `len` bytes of a file private, read/write, eagerly populated.
    ///
    /// # Errors
    ///
    /// Returns an error if the mapping fails.
    fn map_file(&self, file: FileFd, len: usize) -> Result<VirtAddr>;

    /// Map `len` bytes of a device at `offset`, shared, read/write.
    ///
    /// # Errors
    ///
    /// Returns an error if the mapping fails.
    fn map_device(&self, device: DeviceFd, offset: u64, len: usize) -> Result<VirtAddr>;

    /// Release a host mapping.
    ///
    /// # Errors
    ///
    /// Returns an error if `munmap` fails.
    fn unmap(&self, addr: VirtAddr, len: usize) -> Result<()>;

    /// Close a descriptor.
    ///
    /// # Errors
    ///
    /// Returns an error if `close` fails.
    fn close<D: Descriptor>(&self, fd: D) -> Result<()>;
}

/// Close a descriptor, logging instead of failing.
pub(crate) fn close_quietly<P: Platform, D: Descriptor>(platform: &P, fd: D) {
    if let Err(e) = platform.close(fd) {
        tracing::warn!("Closing {} descriptor {} failed: {e}", D::KIND, fd.raw());
    }
}
