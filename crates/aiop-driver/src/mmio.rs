//! Memory-mapped MC portal window.
//!
//! The companion `dpmcp` device exposes its portal as VFIO region 0. The
//! region is mapped shared read/write and accessed with volatile 64-bit
//! loads and stores only.

// Hardware register access requires exact type casts for mmap/ioctl APIs
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_ptr_alignment)]

use crate::error::{AiopError, Result};
use crate::platform::{Descriptor, DeviceFd, VirtAddr};
use crate::portal::CommandRegisters;
use aiop_mc::cmd::CMD_PARAM_COUNT;
use rustix::mm::{mmap, munmap, MapFlags, ProtFlags};
use std::os::unix::io::BorrowedFd;

/// VFIO region info structure
#[repr(C)]
#[derive(Debug, Default)]
pub(crate) struct VfioRegionInfo {
    pub argsz: u32,
    pub flags: u32,
    pub index: u32,
    pub cap_offset: u32,
    pub size: u64,
    pub offset: u64,
}

/// Smallest portal region that holds a command header and its parameters.
pub const PORTAL_MIN_LEN: usize = 8 * (CMD_PARAM_COUNT + 1);

/// Mapped MC portal region
pub struct PortalWindow {
    /// Memory-mapped pointer
    ptr: *mut u8,
    /// Size of the mapping
    size: usize,
}

impl std::fmt::Debug for PortalWindow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PortalWindow")
            .field("ptr", &format_args!("{:p}", self.ptr))
            .field("size", &self.size)
            .finish()
    }
}

impl PortalWindow {
    /// Map region `index` of a VFIO device.
    ///
    /// The mapping stays valid after `device` is closed.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The VFIO ioctl to get region info fails
    /// - The region is smaller than [`PORTAL_MIN_LEN`]
    /// - Memory mapping the region fails
    pub fn map(device: DeviceFd, index: u32) -> Result<Self> {
        let mut region_info = VfioRegionInfo {
            argsz: std::mem::size_of::<VfioRegionInfo>() as u32,
            index,
            ..Default::default()
        };

        // SAFETY: VFIO_DEVICE_GET_REGION_INFO ioctl necessary - kernel returns region size/offset.
        // Invariants: (1) device fd valid from VFIO_GROUP_GET_DEVICE_FD; (2) region_info
        // initialized with argsz = size_of, index; (3) _IOWR reads/writes region_info;
        // (4) layout matches kernel. Caller guarantees: device fd open.
        let ret = unsafe {
            libc::ioctl(
                device.raw(),
                crate::vfio::ioctls::VFIO_DEVICE_GET_REGION_INFO as _,
                &raw mut region_info,
            )
        };

        if ret < 0 {
            return Err(AiopError::last_os_error("VFIO_DEVICE_GET_REGION_INFO"));
        }

        tracing::debug!(
            "Region {index}: size={:#x}, offset={:#x}, flags={:#x}",
            region_info.size,
            region_info.offset,
            region_info.flags
        );

        let size = portal_len(region_info.size)?;

        // SAFETY: device.raw() is an open descriptor for the duration of this call.
        let fd = unsafe { BorrowedFd::borrow_raw(device.raw()) };

        // SAFETY: mmap necessary for MMIO - maps the portal into process address space.
        // Invariants: (1) fd valid; (2) size/offset from successful ioctl; (3) ptr valid
        // for size bytes or Err. Caller guarantees: region_info populated by kernel.
        let ptr = unsafe {
            mmap(
                std::ptr::null_mut(),
                size,
                ProtFlags::READ | ProtFlags::WRITE,
                MapFlags::SHARED,
                fd,
                region_info.offset,
            )
        }
        .map_err(|e| AiopError::kernel("mmap MC portal", e.into()))?;

        tracing::info!("Mapped MC portal at {ptr:p}, size={size:#x}");

        Ok(Self {
            ptr: ptr.cast(),
            size,
        })
    }

    /// Get region size
    pub const fn size(&self) -> usize {
        self.size
    }
}

/// Usable length of a portal region of `region_size` bytes.
fn portal_len(region_size: u64) -> Result<usize> {
    match usize::try_from(region_size) {
        Ok(size) if size >= PORTAL_MIN_LEN => Ok(size),
        _ => Err(AiopError::PortalTooSmall {
            size: region_size,
            required: PORTAL_MIN_LEN,
        }),
    }
}

impl CommandRegisters for PortalWindow {
    fn base(&self) -> VirtAddr {
        VirtAddr::from_ptr(self.ptr)
    }

    fn read64(&self, offset: usize) -> u64 {
        debug_assert!(offset + 8 <= self.size, "Register offset out of bounds");
        // SAFETY: read_volatile necessary for MMIO - the MC changes the value.
        // Invariants: (1) ptr from mmap; (2) offset+8 <= size; (3) u64 aligned.
        unsafe { std::ptr::read_volatile(self.ptr.add(offset).cast::<u64>()) }
    }

    fn write64(&self, offset: usize, value: u64) {
        debug_assert!(offset + 8 <= self.size, "Register offset out of bounds");
        // SAFETY: write_volatile necessary for MMIO - header write hands the portal to the MC.
        // Invariants: (1) ptr from mmap; (2) offset+8 <= size; (3) u64 aligned.
        unsafe {
            std::ptr::write_volatile(self.ptr.add(offset).cast::<u64>(), value);
        }
    }
}

impl Drop for PortalWindow {
    fn drop(&mut self) {
        // SAFETY: munmap necessary - releases the mapping made in map().
        // Invariants: (1) ptr+size previously mapped; (2) Drop runs at most once; (3) no refs.
        if let Err(e) = unsafe { munmap(self.ptr.cast(), self.size) } {
            tracing::warn!("munmap of MC portal failed: {e}");
        }
        tracing::debug!("Unmapped MC portal");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aiop_mc::cmd::param_offset;

    #[test]
    fn portal_must_hold_header_and_parameters() {
        assert_eq!(PORTAL_MIN_LEN, param_offset(CMD_PARAM_COUNT - 1) + 8);
        assert_eq!(portal_len(0x40).unwrap(), 0x40);
        assert_eq!(portal_len(0x1_0000).unwrap(), 0x1_0000);
        assert!(matches!(
            portal_len(0x38),
            Err(AiopError::PortalTooSmall {
                size: 0x38,
                required: 0x40
            })
        ));
        assert!(portal_len(0).is_err());
    }
}
