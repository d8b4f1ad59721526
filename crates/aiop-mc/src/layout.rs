//! Fixed platform layout.
//!
//! Sizes, sysfs locations and object naming conventions of the fsl-mc bus
//! as exposed to a VFIO user on LS2 class SoCs.

/// Host page size assumed for staging buffers.
pub const PAGE_SIZE: usize = 4096;

/// Largest accepted image file, inclusive.
pub const IMAGE_MAX_LEN: u64 = 8 * 1024 * 1024;

/// Largest accepted argument file, inclusive.
pub const ARGS_MAX_LEN: u64 = 512;

/// Longest accepted container object name.
pub const CONTAINER_NAME_MAX: usize = 10;

/// Container used when none is configured.
pub const DEFAULT_CONTAINER: &str = "dprc.5";

/// Environment variable naming the container.
pub const CONTAINER_ENV: &str = "DPRC";

/// Object name prefix of the companion (MC portal) device.
pub const COMPANION_PREFIX: &str = "dpmcp";

/// Object name prefix of the accelerator tile device.
pub const ACCELERATOR_PREFIX: &str = "dpaiop";

/// Root of the fsl-mc bus device tree.
pub const FSL_MC_DEVICES: &str = "/sys/bus/fsl-mc/devices";

/// Root of the IOMMU group tree.
pub const IOMMU_GROUPS: &str = "/sys/kernel/iommu_groups";

/// Interrupt translation window mapped alongside the first DMA region.
///
/// The GITS doorbell page must be IOMMU-visible for MSIs raised by devices
/// in the container (LS2085 erratum). IOVA and container device offset are
/// identical.
pub const IRQ_WINDOW_IOVA: u64 = 0x0603_0000;

/// Length of the interrupt translation window.
pub const IRQ_WINDOW_LEN: usize = 0x1000;

/// Index of the MC portal region on the companion device.
pub const PORTAL_REGION: u32 = 0;

/// Length of a staging buffer for a file of `file_len` bytes.
///
/// Always strictly larger than the file: the next page multiple past the
/// last byte, so an exact page multiple gains one page.
#[must_use]
pub const fn staging_len(file_len: usize) -> usize {
    (file_len / PAGE_SIZE + 1) * PAGE_SIZE
}

/// `/sys/bus/fsl-mc/devices/<container>/iommu_group`.
#[must_use]
pub fn container_group_link(container: &str) -> std::path::PathBuf {
    std::path::Path::new(FSL_MC_DEVICES)
        .join(container)
        .join("iommu_group")
}

/// `/sys/kernel/iommu_groups/<id>/devices`.
#[must_use]
pub fn group_devices_dir(group_id: u32) -> std::path::PathBuf {
    std::path::Path::new(IOMMU_GROUPS)
        .join(group_id.to_string())
        .join("devices")
}

/// `/dev/vfio/<id>`.
#[must_use]
pub fn group_node(group_id: u32) -> std::path::PathBuf {
    std::path::PathBuf::from(format!("/dev/vfio/{group_id}"))
}

/// `/dev/vfio/vfio`.
pub const CONTAINER_NODE: &str = "/dev/vfio/vfio";

/// VFIO API version a container must report.
pub const VFIO_API_VERSION: i32 = 0;

/// Hardware id encoded in an object name such as `dpaiop.0`.
///
/// The id is the decimal text after the first `.`.
#[must_use]
pub fn object_id(name: &str) -> Option<u32> {
    let (_, suffix) = name.split_once('.')?;
    suffix.parse().ok()
}
