//! IOMMU mappings for staged buffers.
//!
//! Buffers are registered with IOVA equal to their host address. The first
//! successful mapping also registers the GITS interrupt translation page so
//! that MSIs from devices in the container reach the interrupt controller;
//! any unmap tears that page down again.

use crate::error::Result;
use crate::platform::{ContainerFd, DeviceFd, Iova, Platform, VirtAddr};
use aiop_mc::layout::{IRQ_WINDOW_IOVA, IRQ_WINDOW_LEN};

/// A live IOMMU registration.
///
/// Only [`DmaMapper::unmap`] consumes it, so a mapping cannot be removed
/// twice.
#[derive(Debug, PartialEq, Eq)]
#[must_use = "a DMA mapping must be passed back to DmaMapper::unmap"]
pub struct DmaMapping {
    vaddr: VirtAddr,
    len: usize,
}

impl DmaMapping {
    /// Host address of the buffer.
    pub const fn vaddr(&self) -> VirtAddr {
        self.vaddr
    }

    /// Device-visible address of the buffer.
    pub const fn iova(&self) -> Iova {
        self.vaddr.identity_iova()
    }

    /// Length in bytes.
    pub const fn len(&self) -> usize {
        self.len
    }

    /// Whether the mapping is empty.
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// Maps host buffers into one container's IOMMU space.
#[derive(Debug)]
pub struct DmaMapper {
    container: ContainerFd,
    irq_source: DeviceFd,
    irq_window: Option<VirtAddr>,
}

impl DmaMapper {
    /// Mapper for `container`; `irq_source` is the container object's device
    /// descriptor, which backs the interrupt window.
    pub const fn new(container: ContainerFd, irq_source: DeviceFd) -> Self {
        Self {
            container,
            irq_source,
            irq_window: None,
        }
    }

    /// Whether the interrupt window is currently registered.
    pub const fn irq_window_mapped(&self) -> bool {
        self.irq_window.is_some()
    }

    /// Register `[vaddr, vaddr + len)` read/write at its identity IOVA.
    ///
    /// A failure to register the interrupt window is logged and does not
    /// fail the mapping.
    ///
    /// # Errors
    ///
    /// Returns an error if the IOMMU refuses the buffer mapping.
    pub fn map<P: Platform>(
        &mut self,
        platform: &P,
        vaddr: VirtAddr,
        len: usize,
    ) -> Result<DmaMapping> {
        tracing::debug!("DMA map {vaddr} (+{len:#x})");
        platform.map_dma(self.container, vaddr, vaddr.identity_iova(), len)?;
        self.ensure_irq_window(platform);
        Ok(DmaMapping { vaddr, len })
    }

    /// Remove a registration, then the interrupt window if present.
    ///
    /// Failures are logged; the caller always proceeds with its cleanup.
    pub fn unmap<P: Platform>(&mut self, platform: &P, mapping: DmaMapping) {
        tracing::debug!("DMA unmap {} (+{:#x})", mapping.iova(), mapping.len);
        if let Err(e) = platform.unmap_dma(self.container, mapping.iova(), mapping.len) {
            tracing::error!("DMA unmap of {} failed: {e}", mapping.iova());
        }
        self.release_irq_window(platform);
    }

    /// Tear down the interrupt window if it is registered.
    pub fn release_irq_window<P: Platform>(&mut self, platform: &P) {
        let Some(window) = self.irq_window.take() else {
            return;
        };
        if let Err(e) = platform.unmap_dma(self.container, Iova(IRQ_WINDOW_IOVA), IRQ_WINDOW_LEN)
        {
            tracing::error!("Unmapping interrupt window failed: {e}");
        }
        if let Err(e) = platform.unmap(window, IRQ_WINDOW_LEN) {
            tracing::warn!("munmap of interrupt window failed: {e}");
        }
        tracing::debug!("Interrupt window released");
    }

    fn ensure_irq_window<P: Platform>(&mut self, platform: &P) {
        if self.irq_window.is_some() {
            return;
        }
        let window = match platform.map_device(self.irq_source, IRQ_WINDOW_IOVA, IRQ_WINDOW_LEN) {
            Ok(window) => window,
            Err(e) => {
                tracing::error!("Mapping GITS region failed: {e}");
                return;
            }
        };
        match platform.map_dma(self.container, window, Iova(IRQ_WINDOW_IOVA), IRQ_WINDOW_LEN) {
            Ok(()) => {
                tracing::debug!("Interrupt window {window} registered at {IRQ_WINDOW_IOVA:#x}");
                self.irq_window = Some(window);
            }
            Err(e) => {
                tracing::error!("Registering interrupt window failed: {e}");
                if let Err(e) = platform.unmap(window, IRQ_WINDOW_LEN) {
                    tracing::warn!("munmap of interrupt window failed: {e}");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ContainerName;
    use crate::platform::GroupId;
    use crate::sim::{Fault, SimPlatform};

    fn setup() -> (SimPlatform, DmaMapper, VirtAddr) {
        let sim = SimPlatform::builder()
            .container("dprc.5", 7, &["dpmcp.23", "dpaiop.0"])
            .build();
        let container = sim.open_container().unwrap();
        let group = sim.open_group(GroupId(7)).unwrap();
        sim.set_container(group, container).unwrap();
        sim.set_iommu(container).unwrap();
        let device = sim
            .device_fd(group, ContainerName::default().as_str())
            .unwrap();
        let buffer = sim.anonymous_buffer(8192);
        (sim, DmaMapper::new(container, device), buffer)
    }

    #[test]
    fn map_registers_identity_iova_and_irq_window() {
        let (sim, mut dma, buf) = setup();
        let mapping = dma.map(&sim, buf, 8192).unwrap();
        assert_eq!(mapping.iova(), Iova(buf.0));
        assert!(dma.irq_window_mapped());
        assert_eq!(sim.held().dma, 2);

        dma.unmap(&sim, mapping);
        assert!(!dma.irq_window_mapped());
        assert_eq!(sim.held().dma, 0);
    }

    #[test]
    fn irq_window_is_mapped_once() {
        let (sim, mut dma, buf) = setup();
        let other = sim.anonymous_buffer(4096);
        let a = dma.map(&sim, buf, 8192).unwrap();
        let b = dma.map(&sim, other, 4096).unwrap();
        assert_eq!(sim.held().dma, 3);

        dma.unmap(&sim, b);
        assert!(!dma.irq_window_mapped());
        assert_eq!(sim.held().dma, 1);
        dma.unmap(&sim, a);
        assert_eq!(sim.held().dma, 0);
    }

    #[test]
    fn irq_window_failure_does_not_fail_map() {
        let (sim, mut dma, buf) = setup();
        sim.inject(Fault::MapIrqWindow);
        let mapping = dma.map(&sim, buf, 8192).unwrap();
        assert!(!dma.irq_window_mapped());
        assert_eq!(sim.held().dma, 1);
        dma.unmap(&sim, mapping);
        assert_eq!(sim.held().dma, 0);
    }

    #[test]
    fn failed_map_registers_nothing() {
        let (sim, mut dma, buf) = setup();
        sim.inject(Fault::MapDma(1));
        assert!(dma.map(&sim, buf, 8192).is_err());
        assert!(!dma.irq_window_mapped());
        assert_eq!(sim.held().dma, 0);
    }
}
