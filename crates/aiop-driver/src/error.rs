//! Error types for AIOP driver operations

use aiop_mc::McStatus;
use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for AIOP operations
pub type Result<T> = std::result::Result<T, AiopError>;

/// Errors that can occur during AIOP operations
#[derive(Debug, Error)]
pub enum AiopError {
    /// Image or argument file rejected before any resource was taken
    #[error("Invalid file {path}: {reason}")]
    InvalidFile {
        /// File that was checked
        path: PathBuf,
        /// Why it was rejected
        reason: String,
    },

    /// Container name rejected
    #[error("Invalid container name {name:?}: {reason}")]
    InvalidContainerName {
        /// Name as given
        name: String,
        /// Why it was rejected
        reason: &'static str,
    },

    /// A kernel or filesystem call failed
    #[error("{op} failed: {source}")]
    Kernel {
        /// Operation that failed
        op: &'static str,
        /// Underlying OS error
        source: std::io::Error,
    },

    /// VFIO group exists but is not usable
    #[error("VFIO group {group} not viable (all devices must be bound to vfio-fsl-mc)")]
    GroupNotViable {
        /// IOMMU group id
        group: u32,
    },

    /// VFIO API version mismatch
    #[error("Unsupported VFIO API version: {version}")]
    UnsupportedApi {
        /// Version reported by the kernel
        version: i32,
    },

    /// Container lacks the Type1 IOMMU backend
    #[error("VFIO Type1 IOMMU not supported")]
    IommuUnsupported,

    /// A bounded pool is full
    #[error("No free {resource} slot (capacity {capacity})")]
    CapacityExceeded {
        /// Kind of resource
        resource: &'static str,
        /// Configured capacity
        capacity: usize,
    },

    /// A required device was not found in the group
    #[error("No {role} device found in IOMMU group {group}")]
    DeviceMissing {
        /// Role that could not be bound
        role: &'static str,
        /// IOMMU group id
        group: u32,
    },

    /// Device name lacks a numeric object id
    #[error("Cannot parse object id from device name {name:?}")]
    InvalidDeviceName {
        /// Device name
        name: String,
    },

    /// MC portal region cannot hold a command
    #[error("MC portal region of {size:#x} bytes is smaller than {required:#x}")]
    PortalTooSmall {
        /// Region size reported by the kernel
        size: u64,
        /// Bytes needed for the header and parameters
        required: usize,
    },

    /// The MC rejected a command
    #[error("MC command {op} failed: {status}")]
    Firmware {
        /// Command that failed
        op: &'static str,
        /// Status reported by the MC
        status: McStatus,
    },

    /// The MC did not complete a command in time
    #[error("MC command {op} timed out after {polls} polls")]
    FirmwareTimeout {
        /// Command that timed out
        op: &'static str,
        /// Number of status reads performed
        polls: u32,
    },

    /// I/O error
    #[error("I/O error: {source}")]
    Io {
        /// Underlying I/O error
        #[from]
        source: std::io::Error,
    },
}

impl AiopError {
    /// Create an invalid file error
    pub fn invalid_file(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::InvalidFile {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Create a kernel error from an explicit OS error
    pub fn kernel(op: &'static str, source: std::io::Error) -> Self {
        Self::Kernel { op, source }
    }

    /// Create a kernel error from `errno`
    pub fn last_os_error(op: &'static str) -> Self {
        Self::kernel(op, std::io::Error::last_os_error())
    }

    /// Create a firmware error
    pub fn firmware(op: &'static str, status: McStatus) -> Self {
        Self::Firmware { op, status }
    }

    /// Whether the error happened before any resource was touched
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::InvalidFile { .. } | Self::InvalidContainerName { .. }
        )
    }
}

impl From<rustix::io::Errno> for AiopError {
    fn from(errno: rustix::io::Errno) -> Self {
        Self::Io {
            source: errno.into(),
        }
    }
}
