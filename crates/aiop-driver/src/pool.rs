//! VFIO group and container pool.
//!
//! Groups are owned exclusively; containers are shared IOMMU contexts that
//! groups attach to. A container is created lazily when no live one accepts
//! the group and is closed when its last group detaches.

use crate::config::PoolLimits;
use crate::error::{AiopError, Result};
use crate::platform::{close_quietly, ContainerFd, GroupFd, GroupId, Platform};
use aiop_mc::layout::{CONTAINER_NODE, VFIO_API_VERSION};

/// Handle to a group held by a [`ResourcePool`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GroupHandle {
    slot: usize,
    id: GroupId,
    group_fd: GroupFd,
    container_fd: ContainerFd,
}

impl GroupHandle {
    /// IOMMU group id.
    pub const fn id(&self) -> GroupId {
        self.id
    }

    /// Group descriptor at acquisition time.
    pub const fn group_fd(&self) -> GroupFd {
        self.group_fd
    }

    /// Container descriptor at acquisition time.
    pub const fn container_fd(&self) -> ContainerFd {
        self.container_fd
    }

    /// Whether `slot` still holds the group this handle was issued for.
    fn owns(&self, slot: &GroupSlot) -> bool {
        slot.id == self.id && slot.fd == self.group_fd
    }
}

#[derive(Debug)]
struct GroupSlot {
    fd: GroupFd,
    id: GroupId,
    container: usize,
}

#[derive(Debug)]
struct ContainerSlot {
    fd: ContainerFd,
    groups: Vec<usize>,
}

/// Bounded pool of VFIO groups and containers.
#[derive(Debug, Default)]
pub struct ResourcePool {
    limits: PoolLimits,
    groups: Vec<Option<GroupSlot>>,
    containers: Vec<Option<ContainerSlot>>,
}

impl ResourcePool {
    /// Create an empty pool.
    pub fn new(limits: PoolLimits) -> Self {
        Self {
            limits,
            groups: Vec::new(),
            containers: Vec::new(),
        }
    }

    /// Configured capacities.
    pub const fn limits(&self) -> PoolLimits {
        self.limits
    }

    /// Take ownership of group `id`, attaching it to a container.
    ///
    /// Acquiring a group the pool already holds returns the existing handle
    /// without opening anything.
    ///
    /// # Errors
    ///
    /// Returns an error if the group cannot be opened or is not viable, if
    /// no container accepts it, or if a pool bound is reached. Nothing is
    /// left open on failure.
    pub fn acquire<P: Platform>(&mut self, platform: &P, id: GroupId) -> Result<GroupHandle> {
        if let Some(handle) = self.find(id) {
            tracing::debug!("IOMMU group {id} already held (slot {})", handle.slot);
            return Ok(handle);
        }

        let slot = free_slot(&self.groups, self.limits.groups).ok_or(
            AiopError::CapacityExceeded {
                resource: "group",
                capacity: self.limits.groups,
            },
        )?;

        let fd = platform.open_group(id)?;
        let (container, container_fd) = match self.attach(platform, id, fd, slot) {
            Ok(attached) => attached,
            Err(e) => {
                tracing::error!("Cannot attach IOMMU group {id}: {e}");
                close_quietly(platform, fd);
                return Err(e);
            }
        };

        put(&mut self.groups, slot, GroupSlot { fd, id, container });
        tracing::info!("Acquired IOMMU group {id} (container slot {container})");
        Ok(GroupHandle {
            slot,
            id,
            group_fd: fd,
            container_fd,
        })
    }

    /// Detach and close a group; the container closes with its last group.
    ///
    /// Every step is attempted; the first failure is returned.
    ///
    /// # Errors
    ///
    /// Returns the first kernel error met while detaching or closing.
    pub fn release<P: Platform>(&mut self, platform: &P, handle: GroupHandle) -> Result<()> {
        let Some(group) = self
            .groups
            .get_mut(handle.slot)
            .filter(|slot| matches!(slot, Some(g) if handle.owns(g)))
            .and_then(Option::take)
        else {
            tracing::warn!("Release of IOMMU group {} not held by the pool", handle.id);
            return Ok(());
        };

        let mut first_err = platform.unset_container(group.fd).err();

        if let Some(container) = self
            .containers
            .get_mut(group.container)
            .and_then(Option::as_mut)
        {
            container.groups.retain(|&g| g != handle.slot);
            if container.groups.is_empty() {
                let fd = container.fd;
                self.containers[group.container] = None;
                if let Err(e) = platform.close(fd) {
                    first_err.get_or_insert(e);
                }
                tracing::debug!("Closed container {fd}");
            }
        }

        if let Err(e) = platform.close(group.fd) {
            first_err.get_or_insert(e);
        }
        tracing::info!("Released IOMMU group {}", group.id);
        first_err.map_or(Ok(()), Err)
    }

    /// Group descriptor of a held group.
    pub fn group_fd(&self, handle: GroupHandle) -> Option<GroupFd> {
        self.group(handle).map(|g| g.fd)
    }

    /// Descriptor of the container a held group is attached to.
    pub fn container_fd(&self, handle: GroupHandle) -> Option<ContainerFd> {
        let group = self.group(handle)?;
        self.containers
            .get(group.container)?
            .as_ref()
            .map(|c| c.fd)
    }

    /// Number of groups currently held.
    pub fn group_count(&self) -> usize {
        self.groups.iter().flatten().count()
    }

    /// Number of containers currently open.
    pub fn container_count(&self) -> usize {
        self.containers.iter().flatten().count()
    }

    fn group(&self, handle: GroupHandle) -> Option<&GroupSlot> {
        self.groups
            .get(handle.slot)?
            .as_ref()
            .filter(|g| handle.owns(g))
    }

    fn find(&self, id: GroupId) -> Option<GroupHandle> {
        let slot = self
            .groups
            .iter()
            .position(|g| g.as_ref().is_some_and(|g| g.id == id))?;
        let group = self.groups[slot].as_ref()?;
        let container = self.containers.get(group.container)?.as_ref()?;
        Some(GroupHandle {
            slot,
            id,
            group_fd: group.fd,
            container_fd: container.fd,
        })
    }

    /// Attach `fd` to a live container or a fresh one.
    fn attach<P: Platform>(
        &mut self,
        platform: &P,
        id: GroupId,
        fd: GroupFd,
        group_slot: usize,
    ) -> Result<(usize, ContainerFd)> {
        if !platform.group_viable(fd)? {
            return Err(AiopError::GroupNotViable { group: id.0 });
        }

        let per_container = self.limits.groups_per_container;
        for (index, container) in self.containers.iter_mut().enumerate() {
            let Some(container) = container else { continue };
            if container.groups.len() >= per_container {
                continue;
            }
            match platform.set_container(fd, container.fd) {
                Ok(()) => {
                    container.groups.push(group_slot);
                    tracing::debug!("IOMMU group {id} joined live container {}", container.fd);
                    return Ok((index, container.fd));
                }
                Err(e) => tracing::debug!("Container {} refused group {id}: {e}", container.fd),
            }
        }

        if per_container == 0 {
            return Err(AiopError::CapacityExceeded {
                resource: "container group",
                capacity: 0,
            });
        }
        let index = free_slot(&self.containers, self.limits.containers).ok_or(
            AiopError::CapacityExceeded {
                resource: "container",
                capacity: self.limits.containers,
            },
        )?;

        let container = platform.open_container()?;
        tracing::debug!("Opened {CONTAINER_NODE} as {container}");
        let mut attached = false;
        let bound = (|| {
            let version = platform.api_version(container)?;
            if version != VFIO_API_VERSION {
                return Err(AiopError::UnsupportedApi { version });
            }
            if !platform.has_type1_iommu(container)? {
                return Err(AiopError::IommuUnsupported);
            }
            platform.set_container(fd, container)?;
            attached = true;
            platform.set_iommu(container)
        })();

        if let Err(e) = bound {
            if attached {
                if let Err(unset) = platform.unset_container(fd) {
                    tracing::warn!("Detaching IOMMU group {id} failed: {unset}");
                }
            }
            close_quietly(platform, container);
            return Err(e);
        }

        put(
            &mut self.containers,
            index,
            ContainerSlot {
                fd: container,
                groups: vec![group_slot],
            },
        );
        Ok((index, container))
    }
}

/// First free index in a slot table bounded by `capacity`.
fn free_slot<T>(slots: &[Option<T>], capacity: usize) -> Option<usize> {
    slots
        .iter()
        .position(Option::is_none)
        .or_else(|| (slots.len() < capacity).then_some(slots.len()))
}

fn put<T>(slots: &mut Vec<Option<T>>, index: usize, value: T) {
    if index == slots.len() {
        slots.push(Some(value));
    } else {
        slots[index] = Some(value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{Fault, SimPlatform};

    fn platform() -> SimPlatform {
        SimPlatform::builder()
            .container("dprc.5", 7, &["dpmcp.23", "dpaiop.0"])
            .container("dprc.6", 8, &["dpmcp.24", "dpaiop.1"])
            .build()
    }

    #[test]
    fn acquire_is_idempotent() {
        let sim = platform();
        let mut pool = ResourcePool::default();
        let a = pool.acquire(&sim, GroupId(7)).unwrap();
        let opened = sim.held().fds;
        let b = pool.acquire(&sim, GroupId(7)).unwrap();
        assert_eq!(a, b);
        assert_eq!(sim.held().fds, opened);
        assert_eq!(pool.group_count(), 1);
        assert_eq!(pool.container_count(), 1);
    }

    #[test]
    fn release_closes_group_and_last_container() {
        let sim = platform();
        let mut pool = ResourcePool::default();
        let handle = pool.acquire(&sim, GroupId(7)).unwrap();
        assert!(pool.group_fd(handle).is_some());
        assert!(pool.container_fd(handle).is_some());
        pool.release(&sim, handle).unwrap();
        assert_eq!(sim.held().fds, 0);
        assert_eq!(pool.container_count(), 0);
        assert!(pool.group_fd(handle).is_none());
    }

    #[test]
    fn stale_handle_does_not_release_a_reused_slot() {
        let sim = platform();
        let mut pool = ResourcePool::default();
        let a = pool.acquire(&sim, GroupId(7)).unwrap();
        pool.release(&sim, a).unwrap();
        let b = pool.acquire(&sim, GroupId(8)).unwrap();
        let held = sim.held();

        pool.release(&sim, a).unwrap();
        assert_eq!(pool.group_count(), 1);
        assert!(pool.group_fd(b).is_some());
        assert_eq!(sim.held(), held);
        assert_eq!(sim.attached_groups(), 1);

        pool.release(&sim, b).unwrap();
        assert!(sim.held().is_empty());
    }

    #[test]
    fn unsupported_api_version_is_rejected() {
        let sim = platform();
        sim.set_api_version(1);
        let mut pool = ResourcePool::default();
        let err = pool.acquire(&sim, GroupId(7)).unwrap_err();
        assert!(matches!(err, AiopError::UnsupportedApi { version: 1 }));
        assert_eq!(sim.held().fds, 0);
        assert_eq!(pool.container_count(), 0);
    }

    #[test]
    fn group_capacity_is_enforced() {
        let sim = platform();
        let mut pool = ResourcePool::default();
        pool.acquire(&sim, GroupId(7)).unwrap();
        let err = pool.acquire(&sim, GroupId(8)).unwrap_err();
        assert!(matches!(
            err,
            AiopError::CapacityExceeded {
                resource: "group",
                ..
            }
        ));
    }

    #[test]
    fn second_group_shares_a_live_container() {
        let sim = platform();
        let mut pool = ResourcePool::new(PoolLimits {
            groups: 2,
            containers: 1,
            groups_per_container: 2,
        });
        let a = pool.acquire(&sim, GroupId(7)).unwrap();
        let b = pool.acquire(&sim, GroupId(8)).unwrap();
        assert_eq!(pool.container_fd(a), pool.container_fd(b));
        assert_eq!(pool.container_count(), 1);

        pool.release(&sim, a).unwrap();
        assert_eq!(pool.container_count(), 1);
        pool.release(&sim, b).unwrap();
        assert_eq!(pool.container_count(), 0);
        assert_eq!(sim.held().fds, 0);
    }

    #[test]
    fn full_container_forces_a_fresh_one() {
        let sim = platform();
        let mut pool = ResourcePool::new(PoolLimits {
            groups: 2,
            containers: 1,
            groups_per_container: 1,
        });
        pool.acquire(&sim, GroupId(7)).unwrap();
        let err = pool.acquire(&sim, GroupId(8)).unwrap_err();
        assert!(matches!(
            err,
            AiopError::CapacityExceeded {
                resource: "container",
                ..
            }
        ));
        assert_eq!(pool.group_count(), 1);
        // The refused group's descriptor is closed again.
        assert_eq!(sim.held().fds, 2);
    }

    #[test]
    fn failed_bind_leaks_nothing() {
        for fault in [Fault::GroupStatus, Fault::SetContainer, Fault::SetIommu] {
            let sim = platform();
            sim.inject(fault);
            let mut pool = ResourcePool::default();
            assert!(pool.acquire(&sim, GroupId(7)).is_err(), "{fault:?}");
            assert_eq!(sim.held().fds, 0, "{fault:?}");
            assert_eq!(sim.attached_groups(), 0, "{fault:?}");
            assert_eq!(pool.group_count(), 0);
            assert_eq!(pool.container_count(), 0);
        }
    }

    #[test]
    fn non_viable_group_is_rejected() {
        let sim = platform();
        sim.set_viable(GroupId(7), false);
        let mut pool = ResourcePool::default();
        let err = pool.acquire(&sim, GroupId(7)).unwrap_err();
        assert!(matches!(err, AiopError::GroupNotViable { group: 7 }));
        assert_eq!(sim.held().fds, 0);
    }
}
