//! VFIO platform: the real kernel control surface
//!
//! Issues the Linux VFIO ioctls for fsl-mc devices and maps host memory
//! through rustix.
//!
// FFI/ioctl casts are intentional - VFIO API requires specific types
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_possible_wrap)]
//! # Requirements
//!
//! 1. SMMU enabled and the `vfio-fsl-mc` bus driver loaded
//! 2. Every object of the container bound to `vfio-fsl-mc`
//! 3. User owns `/dev/vfio/$IOMMU_GROUP` or runs as root
//!
//! # Setup Commands
//!
//! ```bash
//! # Bind the container and its objects to vfio-fsl-mc
//! echo vfio-fsl-mc > /sys/bus/fsl-mc/devices/dprc.5/driver_override
//! echo dprc.5 > /sys/bus/fsl-mc/drivers/vfio-fsl-mc/bind
//!
//! # Grant user access
//! sudo chown $USER /dev/vfio/$IOMMU_GROUP
//! ```
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────┐     ┌─────────────┐     ┌─────────────┐
//! │  aiop_tool  │────▶│  VFIO API   │────▶│    SMMU     │
//! │  (Rust)     │     │  (ioctls)   │     │  (Hardware) │
//! └─────────────┘     └─────────────┘     └─────────────┘
//!        │                                       │
//!        ▼                                       ▼
//! ┌─────────────┐     ┌─────────────┐     ┌─────────────┐
//! │  MC portal  │────▶│     MC      │────▶│  AIOP tile  │
//! │  (dpmcp)    │     │  firmware   │     │  (dpaiop)   │
//! └─────────────┘     └─────────────┘     └─────────────┘
//! ```
//!
//! VFIO ioctls use libc: rustix has no typed wrappers for them.

use crate::config::{ContainerName, PollConfig};
use crate::error::{AiopError, Result};
use crate::mmio::PortalWindow;
use crate::platform::{
    ContainerFd, Descriptor, DeviceFd, DeviceMetadata, FileFd, GroupFd, GroupId, Iova, Platform,
    VirtAddr,
};
use crate::portal::McPortal;
use aiop_mc::layout;
use rustix::fs::{Mode, OFlags};
use rustix::mm::{mmap, munmap, MapFlags, ProtFlags};
use std::os::unix::io::{BorrowedFd, IntoRawFd};
use std::path::Path;

/// VFIO ioctl numbers (from Linux kernel headers)
///
/// These are calculated as: _IO(';', base + offset)
/// where _IO is: ((type as u64) << 8) | nr
pub(crate) mod ioctls {
    use std::os::raw::c_ulong;

    /// Helper to create ioctl number: _IO(type, nr) = (type << 8) | nr
    const fn io(ty: u8, nr: u8) -> c_ulong {
        ((ty as c_ulong) << 8) | (nr as c_ulong)
    }

    pub const VFIO_TYPE: u8 = b';';
    pub const VFIO_BASE: u8 = 100;

    // VFIO container ioctls
    pub const VFIO_GET_API_VERSION: c_ulong = io(VFIO_TYPE, VFIO_BASE);
    pub const VFIO_CHECK_EXTENSION: c_ulong = io(VFIO_TYPE, VFIO_BASE + 1);
    pub const VFIO_SET_IOMMU: c_ulong = io(VFIO_TYPE, VFIO_BASE + 2);

    // VFIO group ioctls
    pub const VFIO_GROUP_GET_STATUS: c_ulong = io(VFIO_TYPE, VFIO_BASE + 3);
    pub const VFIO_GROUP_SET_CONTAINER: c_ulong = io(VFIO_TYPE, VFIO_BASE + 4);
    pub const VFIO_GROUP_UNSET_CONTAINER: c_ulong = io(VFIO_TYPE, VFIO_BASE + 5);
    pub const VFIO_GROUP_GET_DEVICE_FD: c_ulong = io(VFIO_TYPE, VFIO_BASE + 6);

    // VFIO device ioctls
    pub const VFIO_DEVICE_GET_INFO: c_ulong = io(VFIO_TYPE, VFIO_BASE + 7);
    pub const VFIO_DEVICE_GET_REGION_INFO: c_ulong = io(VFIO_TYPE, VFIO_BASE + 8);

    // IOMMU DMA mapping
    pub const VFIO_IOMMU_MAP_DMA: c_ulong = io(VFIO_TYPE, VFIO_BASE + 13);
    pub const VFIO_IOMMU_UNMAP_DMA: c_ulong = io(VFIO_TYPE, VFIO_BASE + 14);

    // IOMMU types
    pub const VFIO_TYPE1_IOMMU: u32 = 1;

    // Group status flags
    pub const VFIO_GROUP_FLAGS_VIABLE: u32 = 1 << 0;

    // DMA map flags
    pub const VFIO_DMA_MAP_FLAG_READ: u32 = 1 << 0;
    pub const VFIO_DMA_MAP_FLAG_WRITE: u32 = 1 << 1;
}

/// VFIO device info structure
#[repr(C)]
#[derive(Debug, Default)]
struct VfioDeviceInfo {
    argsz: u32,
    flags: u32,
    num_regions: u32,
    num_irqs: u32,
}

/// VFIO group status structure
#[repr(C)]
#[derive(Debug, Default)]
struct VfioGroupStatus {
    argsz: u32,
    flags: u32,
}

/// VFIO DMA map structure
#[repr(C)]
#[derive(Debug, Default)]
struct VfioDmaMap {
    argsz: u32,
    flags: u32,
    vaddr: u64,
    iova: u64,
    size: u64,
}

/// VFIO DMA unmap structure
#[repr(C)]
#[derive(Debug, Default)]
struct VfioDmaUnmap {
    argsz: u32,
    flags: u32,
    iova: u64,
    size: u64,
}

/// Linux VFIO implementation of [`Platform`]
#[derive(Debug, Clone, Default)]
pub struct VfioPlatform {
    poll: PollConfig,
}

impl VfioPlatform {
    /// Create a platform whose portals poll with `poll`
    pub fn new(poll: PollConfig) -> Self {
        Self { poll }
    }

    fn open_node(path: &Path, flags: OFlags, op: &'static str) -> Result<i32> {
        let fd = rustix::fs::open(path, flags | OFlags::CLOEXEC, Mode::empty())
            .map_err(|e| AiopError::kernel(op, e.into()))?;
        Ok(fd.into_raw_fd())
    }

    /// Wrap an `ioctl` return value.
    fn check(ret: i32, op: &'static str) -> Result<i32> {
        if ret < 0 {
            let err = AiopError::last_os_error(op);
            tracing::error!("{err}");
            return Err(err);
        }
        Ok(ret)
    }
}

impl Platform for VfioPlatform {
    type Portal = McPortal<PortalWindow>;

    fn container_group(&self, container: &ContainerName) -> Result<GroupId> {
        let link_path = layout::container_group_link(container.as_str());
        let link = std::fs::read_link(&link_path)
            .map_err(|e| AiopError::kernel("read iommu_group link", e))?;

        let group = link
            .file_name()
            .and_then(|n| n.to_str())
            .and_then(|s| s.parse::<u32>().ok())
            .ok_or_else(|| {
                AiopError::kernel(
                    "parse iommu_group link",
                    std::io::Error::new(
                        std::io::ErrorKind::InvalidData,
                        format!("unexpected target {}", link.display()),
                    ),
                )
            })?;

        tracing::debug!("{container} → IOMMU group {group}");
        Ok(GroupId(group))
    }

    fn group_devices(&self, group: GroupId) -> Result<Vec<String>> {
        let dir = layout::group_devices_dir(group.0);
        let mut names = Vec::new();
        for entry in std::fs::read_dir(&dir).map_err(|e| AiopError::kernel("read group devices", e))?
        {
            let entry = entry?;
            if !entry.file_type()?.is_symlink() {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                names.push(name.to_string());
            }
        }
        // Directory order is unspecified; keep the first-match rule stable.
        names.sort();
        Ok(names)
    }

    fn open_group(&self, group: GroupId) -> Result<GroupFd> {
        let path = layout::group_node(group.0);
        Self::open_node(&path, OFlags::RDWR, "open VFIO group").map(GroupFd)
    }

    fn group_viable(&self, group: GroupFd) -> Result<bool> {
        let mut status = VfioGroupStatus {
            argsz: std::mem::size_of::<VfioGroupStatus>() as u32,
            flags: 0,
        };

        // SAFETY: VFIO_GROUP_GET_STATUS ioctl necessary - kernel fills status.
        // Invariants: (1) group fd valid from open; (2) _IOWR reads/writes status;
        // (3) layout matches kernel. Caller guarantees: group is /dev/vfio/N.
        let ret = unsafe {
            libc::ioctl(
                group.raw(),
                ioctls::VFIO_GROUP_GET_STATUS as _,
                &raw mut status,
            )
        };
        Self::check(ret, "VFIO_GROUP_GET_STATUS")?;
        Ok(status.flags & ioctls::VFIO_GROUP_FLAGS_VIABLE != 0)
    }

    fn set_container(&self, group: GroupFd, container: ContainerFd) -> Result<()> {
        let container_fd = container.raw();
        // SAFETY: VFIO_GROUP_SET_CONTAINER ioctl necessary - attaches group to container.
        // Invariants: (1) group fd valid; (2) third arg is ptr to container fd; (3) kernel
        // reads fd. Caller guarantees: group viable, container open.
        let ret = unsafe {
            libc::ioctl(
                group.raw(),
                ioctls::VFIO_GROUP_SET_CONTAINER as _,
                std::ptr::from_ref(&container_fd),
            )
        };
        // Probing live containers fails routinely; leave logging to the caller.
        if ret < 0 {
            return Err(AiopError::last_os_error("VFIO_GROUP_SET_CONTAINER"));
        }
        Ok(())
    }

    fn unset_container(&self, group: GroupFd) -> Result<()> {
        // SAFETY: VFIO_GROUP_UNSET_CONTAINER ioctl necessary - detaches group.
        // Invariants: (1) group fd valid; (2) _IO takes no argument.
        let ret = unsafe { libc::ioctl(group.raw(), ioctls::VFIO_GROUP_UNSET_CONTAINER as _) };
        Self::check(ret, "VFIO_GROUP_UNSET_CONTAINER").map(drop)
    }

    fn open_container(&self) -> Result<ContainerFd> {
        Self::open_node(
            Path::new(layout::CONTAINER_NODE),
            OFlags::RDWR,
            "open VFIO container",
        )
        .map(ContainerFd)
    }

    fn api_version(&self, container: ContainerFd) -> Result<i32> {
        // SAFETY: VFIO_GET_API_VERSION ioctl necessary - queries kernel VFIO API version.
        // Invariants: (1) container fd valid from open; (2) _IO(no arg) returns int.
        let ret = unsafe { libc::ioctl(container.raw(), ioctls::VFIO_GET_API_VERSION as _) };
        Self::check(ret, "VFIO_GET_API_VERSION")
    }

    fn has_type1_iommu(&self, container: ContainerFd) -> Result<bool> {
        // SAFETY: VFIO_CHECK_EXTENSION ioctl necessary - queries kernel for Type1 IOMMU.
        // Invariants: (1) container fd valid; (2) third arg is extension id;
        // (3) kernel returns 1 if supported, 0 otherwise.
        let ret = unsafe {
            libc::ioctl(
                container.raw(),
                ioctls::VFIO_CHECK_EXTENSION as _,
                ioctls::VFIO_TYPE1_IOMMU,
            )
        };
        Self::check(ret, "VFIO_CHECK_EXTENSION").map(|r| r == 1)
    }

    fn set_iommu(&self, container: ContainerFd) -> Result<()> {
        // SAFETY: VFIO_SET_IOMMU ioctl necessary - enables Type1 IOMMU in container.
        // Invariants: (1) container fd valid; (2) third arg is IOMMU type.
        // Caller guarantees: a group is attached, Type1 supported.
        let ret = unsafe {
            libc::ioctl(
                container.raw(),
                ioctls::VFIO_SET_IOMMU as _,
                ioctls::VFIO_TYPE1_IOMMU,
            )
        };
        Self::check(ret, "VFIO_SET_IOMMU").map(drop)
    }

    fn device_fd(&self, group: GroupFd, name: &str) -> Result<DeviceFd> {
        let name_cstr = std::ffi::CString::new(name).map_err(|e| {
            AiopError::kernel(
                "VFIO_GROUP_GET_DEVICE_FD",
                std::io::Error::new(std::io::ErrorKind::InvalidInput, e),
            )
        })?;

        // SAFETY: VFIO_GROUP_GET_DEVICE_FD ioctl necessary - opens device fd by name.
        // Invariants: (1) group fd valid; (2) name_cstr null-terminated; (3) kernel
        // reads string, returns device fd or -1. Caller guarantees: group attached.
        let ret = unsafe {
            libc::ioctl(
                group.raw(),
                ioctls::VFIO_GROUP_GET_DEVICE_FD as _,
                name_cstr.as_ptr(),
            )
        };
        let fd = Self::check(ret, "VFIO_GROUP_GET_DEVICE_FD")?;
        tracing::debug!("Opened device {name} (fd={fd})");
        Ok(DeviceFd(fd))
    }

    fn device_info(&self, device: DeviceFd) -> Result<DeviceMetadata> {
        let mut info = VfioDeviceInfo {
            argsz: std::mem::size_of::<VfioDeviceInfo>() as u32,
            ..Default::default()
        };

        // SAFETY: VFIO_DEVICE_GET_INFO ioctl necessary - kernel fills info (regions, IRQs).
        // Invariants: (1) device fd valid; (2) _IOWR reads/writes info; (3) layout matches.
        // Caller guarantees: device fd from VFIO_GROUP_GET_DEVICE_FD.
        let ret = unsafe {
            libc::ioctl(
                device.raw(),
                ioctls::VFIO_DEVICE_GET_INFO as _,
                &raw mut info,
            )
        };
        Self::check(ret, "VFIO_DEVICE_GET_INFO")?;
        Ok(DeviceMetadata {
            num_regions: info.num_regions,
            num_irqs: info.num_irqs,
        })
    }

    fn map_portal(&self, device: DeviceFd) -> Result<Self::Portal> {
        let window = PortalWindow::map(device, layout::PORTAL_REGION)?;
        Ok(McPortal::new(window, self.poll))
    }

    fn map_dma(
        &self,
        container: ContainerFd,
        vaddr: VirtAddr,
        iova: Iova,
        len: usize,
    ) -> Result<()> {
        let dma_map = VfioDmaMap {
            argsz: std::mem::size_of::<VfioDmaMap>() as u32,
            flags: ioctls::VFIO_DMA_MAP_FLAG_READ | ioctls::VFIO_DMA_MAP_FLAG_WRITE,
            vaddr: vaddr.0,
            iova: iova.0,
            size: len as u64,
        };

        tracing::debug!(
            "DMA map: vaddr={:#x}, iova={:#x}, size={:#x}",
            dma_map.vaddr,
            dma_map.iova,
            dma_map.size
        );

        // SAFETY: VFIO_IOMMU_MAP_DMA ioctl necessary - kernel maps user buffer to IOVA.
        // Invariants: (1) container fd valid with IOMMU set; (2) dma_map has argsz and
        // vaddr/iova/size of a live mapping; (3) _IOW ioctl reads dma_map.
        let ret = unsafe {
            libc::ioctl(
                container.raw(),
                ioctls::VFIO_IOMMU_MAP_DMA as _,
                &raw const dma_map,
            )
        };
        Self::check(ret, "VFIO_IOMMU_MAP_DMA").map(drop)
    }

    fn unmap_dma(&self, container: ContainerFd, iova: Iova, len: usize) -> Result<()> {
        let dma_unmap = VfioDmaUnmap {
            argsz: std::mem::size_of::<VfioDmaUnmap>() as u32,
            flags: 0,
            iova: iova.0,
            size: len as u64,
        };

        // SAFETY: VFIO_IOMMU_UNMAP_DMA ioctl necessary - kernel unmaps IOVA before release.
        // Invariants: (1) container fd valid; (2) dma_unmap has iova/size of a prior map;
        // (3) layout matches kernel VfioDmaUnmap.
        let ret = unsafe {
            libc::ioctl(
                container.raw(),
                ioctls::VFIO_IOMMU_UNMAP_DMA as _,
                &raw const dma_unmap,
            )
        };
        Self::check(ret, "VFIO_IOMMU_UNMAP_DMA").map(drop)
    }

    fn open_file(&self, path: &Path) -> Result<FileFd> {
        Self::open_node(path, OFlags::RDONLY, "open file").map(FileFd)
    }

    fn map_file(&self, file: FileFd, len: usize) -> Result<VirtAddr> {
        // SAFETY: file.raw() is an open descriptor for the duration of this call.
        let fd = unsafe { BorrowedFd::borrow_raw(file.raw()) };
        // SAFETY: mmap of a private copy-on-write file mapping; the kernel picks the
        // address. Pages past EOF inside the last page read as zero.
        let ptr = unsafe {
            mmap(
                std::ptr::null_mut(),
                len,
                ProtFlags::READ | ProtFlags::WRITE,
                MapFlags::PRIVATE | MapFlags::POPULATE,
                fd,
                0,
            )
        }
        .map_err(|e| AiopError::kernel("mmap file", e.into()))?;
        Ok(VirtAddr::from_ptr(ptr))
    }

    fn map_device(&self, device: DeviceFd, offset: u64, len: usize) -> Result<VirtAddr> {
        // SAFETY: device.raw() is an open descriptor for the duration of this call.
        let fd = unsafe { BorrowedFd::borrow_raw(device.raw()) };
        // SAFETY: shared mapping of a device region chosen by the kernel; no Rust
        // references are created over it.
        let ptr = unsafe {
            mmap(
                std::ptr::null_mut(),
                len,
                ProtFlags::READ | ProtFlags::WRITE,
                MapFlags::SHARED,
                fd,
                offset,
            )
        }
        .map_err(|e| AiopError::kernel("mmap device", e.into()))?;
        Ok(VirtAddr::from_ptr(ptr))
    }

    fn unmap(&self, addr: VirtAddr, len: usize) -> Result<()> {
        // SAFETY: addr/len name a mapping made by map_file or map_device that the
        // caller no longer references.
        unsafe { munmap(addr.as_ptr(), len) }.map_err(|e| AiopError::kernel("munmap", e.into()))
    }

    fn close<D: Descriptor>(&self, fd: D) -> Result<()> {
        // SAFETY: the caller owns fd and never uses it again.
        let ret = unsafe { libc::close(fd.raw()) };
        Self::check(ret, "close").map(drop)
    }
}
