//! VFIO passthrough driver for DPAA2 AIOP tiles.
//!
//! Binds the `dpmcp` (MC portal) and `dpaiop` (tile) objects of a DPRC
//! container through VFIO, stages AIOP images into IOMMU-mapped memory and
//! drives the tile through the management complex.
//!
//! # Layers
//!
//! ```text
//! Accelerator       session: init, status, reset, load, time of day
//!   ├─ ResourcePool   IOMMU group ↔ VFIO container bookkeeping
//!   ├─ DeviceBinder   dpmcp/dpaiop lookup in the group
//!   ├─ DmaMapper      identity IOVA mappings + GITS interrupt window
//!   └─ McPortal       MC command word over the portal registers
//! Platform          VfioPlatform (kernel) | SimPlatform (in memory)
//! ```
//!
//! # Quick start
//!
//! ```no_run
//! use aiop_driver::{Accelerator, ContainerName, LoadRequest, ResourcePool, VfioPlatform};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let container: ContainerName = "dprc.5".parse()?;
//! let mut tile = Accelerator::init(VfioPlatform::default(), ResourcePool::default(), &container)?;
//!
//! tile.load(&LoadRequest::new("aiop_app.elf").with_reset(true))?;
//! println!("{}", tile.status()?);
//! tile.teardown()?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::doc_markdown)]

mod config;
mod device;
mod discovery;
mod dma;
mod error;
mod loading;
pub mod mmio;
mod platform;
mod pool;
mod portal;
mod session;
pub mod sim;
pub mod vfio;

pub use config::{ContainerName, PollConfig, PoolLimits};
pub use device::{DeviceRecord, DeviceRole, DeviceSet};
pub use discovery::DeviceBinder;
pub use dma::{DmaMapper, DmaMapping};
pub use error::{AiopError, Result};
pub use loading::{LoadPlan, LoadRequest};
pub use mmio::PortalWindow;
pub use platform::{
    ContainerFd, Descriptor, DeviceFd, DeviceMetadata, FileFd, GroupFd, GroupId, Iova, Platform,
    VirtAddr,
};
pub use pool::{GroupHandle, ResourcePool};
pub use portal::{CommandRegisters, FirmwareControl, McPortal};
pub use session::{Accelerator, TileStatus};
pub use sim::SimPlatform;
pub use vfio::VfioPlatform;

/// Commonly used types.
pub mod prelude {
    pub use crate::{
        Accelerator, AiopError, ContainerName, LoadRequest, Platform, ResourcePool, Result,
        TileStatus, VfioPlatform,
    };
}
