//! Accelerator session
//!
//! An [`Accelerator`] owns everything needed to drive one AIOP tile: the
//! pool holding its IOMMU group, the container object's device descriptor,
//! the DMA mapper, the mapped MC portal and the two bound devices.
//!
//! Every firmware operation opens a short-lived `dpaiop` session, performs
//! its calls and closes the session regardless of outcome. The reported
//! error is the open error, else the first call error, else the close error.

use crate::config::ContainerName;
use crate::device::DeviceSet;
use crate::discovery::DeviceBinder;
use crate::dma::DmaMapper;
use crate::error::Result;
use crate::platform::{close_quietly, DeviceFd, GroupFd, Platform};
use crate::pool::{GroupHandle, ResourcePool};
use crate::portal::FirmwareControl;
use aiop_mc::{SlVersion, TileAttributes, TileState, Token};

/// Snapshot of the tile returned by [`Accelerator::status`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileStatus {
    /// Object attributes and command interface version
    pub attributes: TileAttributes,
    /// Service layer version
    pub sl_version: SlVersion,
    /// Lifecycle state
    pub state: TileState,
}

impl std::fmt::Display for TileStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "AIOP Tile Status:")?;
        writeln!(
            f,
            "\t Major Version: {}, Minor Version: {}",
            self.attributes.major, self.attributes.minor
        )?;
        writeln!(
            f,
            "\t Service Layer:- Major Version: {}, Minor Version: {}, Revision: {}",
            self.sl_version.major, self.sl_version.minor, self.sl_version.revision
        )?;
        write!(f, "\t State: {}", self.state)
    }
}

/// A bound AIOP tile
pub struct Accelerator<P: Platform> {
    pub(crate) platform: P,
    pool: ResourcePool,
    group: GroupHandle,
    container_device: DeviceFd,
    pub(crate) dma: DmaMapper,
    portal: P::Portal,
    devices: DeviceSet,
    released: bool,
}

impl<P: Platform> std::fmt::Debug for Accelerator<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Accelerator")
            .field("group", &self.group)
            .field("container_device", &self.container_device)
            .field("window", &self.portal.window())
            .field("devices", &self.devices)
            .finish_non_exhaustive()
    }
}

impl<P: Platform> Accelerator<P> {
    /// Bind the tile of `container`.
    ///
    /// Resolves the container's IOMMU group, acquires it from `pool`, opens
    /// the container object, binds the companion and accelerator devices,
    /// maps the MC portal and probes the tile once.
    ///
    /// # Errors
    ///
    /// Returns the first failing step. Everything acquired before it is
    /// released again.
    pub fn init(platform: P, mut pool: ResourcePool, container: &ContainerName) -> Result<Self> {
        tracing::info!("Initializing AIOP session for {container}");

        let group_id = platform.container_group(container)?;
        let group = pool.acquire(&platform, group_id)?;

        let container_device = match platform.device_fd(group.group_fd(), container.as_str()) {
            Ok(fd) => fd,
            Err(e) => {
                tracing::error!("Cannot open container object {container}: {e}");
                release_group(&platform, &mut pool, group);
                return Err(e);
            }
        };

        let devices = match DeviceBinder::bind(&platform, group.group_fd(), group_id) {
            Ok(devices) => devices,
            Err(e) => {
                close_quietly(&platform, container_device);
                release_group(&platform, &mut pool, group);
                return Err(e);
            }
        };

        let portal = match map_companion(&platform, group.group_fd(), &devices) {
            Ok(portal) => portal,
            Err(e) => {
                if let Some(fd) = devices.accelerator().fd {
                    close_quietly(&platform, fd);
                }
                close_quietly(&platform, container_device);
                release_group(&platform, &mut pool, group);
                return Err(e);
            }
        };

        let mut accelerator = Self {
            dma: DmaMapper::new(group.container_fd(), container_device),
            platform,
            pool,
            group,
            container_device,
            portal,
            devices,
            released: false,
        };

        if let Err(e) = accelerator.probe() {
            tracing::error!("Cannot open a session on {}: {e}", accelerator.devices.accelerator().name);
            if let Err(teardown) = accelerator.release_all() {
                tracing::warn!("Cleanup after failed init: {teardown}");
            }
            return Err(e);
        }

        tracing::info!(
            "AIOP session ready: {} via {} (portal {})",
            accelerator.devices.accelerator().name,
            accelerator.devices.companion().name,
            accelerator.portal.window()
        );
        Ok(accelerator)
    }

    /// Bound devices.
    pub const fn devices(&self) -> &DeviceSet {
        &self.devices
    }

    /// The pool holding this session's group.
    pub const fn pool(&self) -> &ResourcePool {
        &self.pool
    }

    /// The platform this session runs on.
    pub const fn platform(&self) -> &P {
        &self.platform
    }

    /// Read attributes, service layer version and state in one session.
    ///
    /// The first failing read fails the call; the session is still closed.
    ///
    /// # Errors
    ///
    /// Returns the open error, else the first read error, else the close error.
    pub fn status(&mut self) -> Result<TileStatus> {
        self.with_channel("status", |fw, token| {
            let attributes = fw.attributes(token)?;
            let sl_version = fw.sl_version(token)?;
            let state = fw.state(token)?;
            Ok(TileStatus {
                attributes,
                sl_version,
                state,
            })
        })
    }

    /// Reset the tile.
    ///
    /// # Errors
    ///
    /// Returns the open error, else the reset error, else the close error.
    pub fn reset(&mut self) -> Result<()> {
        self.with_channel("reset", |fw, token| fw.reset(token))
    }

    /// Tile time of day.
    ///
    /// # Errors
    ///
    /// Returns the open error, else the read error, else the close error.
    pub fn time_of_day(&mut self) -> Result<u64> {
        self.with_channel("get_time_of_day", |fw, token| fw.time_of_day(token))
    }

    /// Set the tile time of day.
    ///
    /// # Errors
    ///
    /// Returns the open error, else the write error, else the close error.
    pub fn set_time_of_day(&mut self, tod: u64) -> Result<()> {
        self.with_channel("set_time_of_day", |fw, token| {
            fw.set_time_of_day(token, tod)
        })
    }

    /// Release every resource held by the session.
    ///
    /// # Errors
    ///
    /// Returns the first error met; every step is still attempted.
    pub fn teardown(mut self) -> Result<()> {
        self.release_all()
    }

    /// Run `calls` inside an open firmware session.
    pub(crate) fn with_channel<T>(
        &mut self,
        op: &'static str,
        calls: impl FnOnce(&P::Portal, Token) -> Result<T>,
    ) -> Result<T> {
        let hw_id = self.devices.accelerator().hw_id;
        let token = match self.portal.open(hw_id) {
            Ok(token) => token,
            Err(e) => {
                tracing::error!("{op}: cannot open dpaiop.{hw_id}: {e}");
                return Err(e);
            }
        };
        tracing::debug!("{op}: opened dpaiop.{hw_id} (token {token})");
        self.devices.accelerator_mut().token = Some(token);

        let result = calls(&self.portal, token);
        if let Err(e) = &result {
            tracing::error!("{op} failed: {e}");
        }

        let closed = self.portal.close(token);
        self.devices.accelerator_mut().token = None;
        match closed {
            Ok(()) => result,
            Err(e) => {
                tracing::error!("{op}: closing dpaiop.{hw_id} failed: {e}");
                result.and(Err(e))
            }
        }
    }

    fn probe(&mut self) -> Result<()> {
        let hw_id = self.devices.accelerator().hw_id;
        let token = self.portal.open(hw_id)?;
        match self.portal.attributes(token) {
            Ok(attrs) => tracing::info!(
                "dpaiop.{} attributes: id {}, version {}.{}",
                hw_id,
                attrs.id,
                attrs.major,
                attrs.minor
            ),
            Err(e) => tracing::warn!("Cannot read dpaiop.{hw_id} attributes: {e}"),
        }
        if let Err(e) = self.portal.close(token) {
            tracing::warn!("Closing probe session on dpaiop.{hw_id} failed: {e}");
        }
        Ok(())
    }

    fn release_all(&mut self) -> Result<()> {
        if self.released {
            return Ok(());
        }
        self.released = true;

        self.dma.release_irq_window(&self.platform);

        let mut first_err = None;
        if let Some(fd) = self.devices.accelerator_mut().fd.take() {
            if let Err(e) = self.platform.close(fd) {
                first_err.get_or_insert(e);
            }
        }
        if let Err(e) = self.platform.close(self.container_device) {
            first_err.get_or_insert(e);
        }
        if let Err(e) = self.pool.release(&self.platform, self.group) {
            first_err.get_or_insert(e);
        }
        tracing::info!("AIOP session released");
        first_err.map_or(Ok(()), Err)
    }
}

impl<P: Platform> Drop for Accelerator<P> {
    fn drop(&mut self) {
        if let Err(e) = self.release_all() {
            tracing::warn!("Releasing AIOP session on drop failed: {e}");
        }
    }
}

/// Map the companion's portal and close its descriptor again.
fn map_companion<P: Platform>(
    platform: &P,
    group_fd: GroupFd,
    devices: &DeviceSet,
) -> Result<P::Portal> {
    let companion = devices.companion();
    let fd = platform.device_fd(group_fd, &companion.name)?;
    let portal = platform.map_portal(fd);
    close_quietly(platform, fd);
    portal.inspect_err(|e| tracing::error!("Cannot map portal of {}: {e}", companion.name))
}

fn release_group<P: Platform>(platform: &P, pool: &mut ResourcePool, group: GroupHandle) {
    if let Err(e) = pool.release(platform, group) {
        tracing::warn!("Releasing IOMMU group {} failed: {e}", group.id());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{Fault, RemoteCall, SimPlatform};
    use aiop_mc::McStatus;

    fn sim() -> SimPlatform {
        SimPlatform::builder()
            .container("dprc.5", 7, &["dpmcp.23", "dpaiop.0"])
            .build()
    }

    fn init(sim: &SimPlatform) -> Accelerator<SimPlatform> {
        Accelerator::init(sim.clone(), ResourcePool::default(), &ContainerName::default()).unwrap()
    }

    #[test]
    fn init_probes_once_and_holds_window() {
        let sim = sim();
        let acc = init(&sim);
        assert_eq!(
            sim.remote_calls(),
            vec![RemoteCall::Open(0), RemoteCall::Attributes, RemoteCall::Close]
        );
        let held = sim.held();
        // group, container, container object, accelerator
        assert_eq!(held.fds, 4);
        assert_eq!(held.mappings, 1);
        assert_eq!(held.tokens, 0);
        acc.teardown().unwrap();
        assert!(sim.held().is_empty());
    }

    #[test]
    fn status_reads_in_one_session() {
        let sim = sim();
        let mut acc = init(&sim);
        sim.clear_calls();
        let status = acc.status().unwrap();
        assert_eq!(status.state, TileState::ResetDone);
        assert_eq!(
            sim.remote_calls(),
            vec![
                RemoteCall::Open(0),
                RemoteCall::Attributes,
                RemoteCall::SlVersion,
                RemoteCall::State,
                RemoteCall::Close
            ]
        );
        assert!(acc.devices().accelerator().token.is_none());
    }

    #[test]
    fn failed_read_still_closes() {
        let sim = sim();
        let mut acc = init(&sim);
        sim.clear_calls();
        sim.inject(Fault::SlVersion);
        let err = acc.status().unwrap_err();
        assert!(matches!(err, crate::AiopError::Firmware { op: "get_sl_version", .. }));
        assert_eq!(
            sim.remote_calls(),
            vec![
                RemoteCall::Open(0),
                RemoteCall::Attributes,
                RemoteCall::SlVersion,
                RemoteCall::Close
            ]
        );
        assert_eq!(sim.held().tokens, 0);
    }

    #[test]
    fn call_error_wins_over_close_error() {
        let sim = sim();
        let mut acc = init(&sim);
        sim.inject(Fault::Reset);
        sim.inject(Fault::FirmwareClose);
        let err = acc.reset().unwrap_err();
        assert!(matches!(err, crate::AiopError::Firmware { op: "reset", .. }));
    }

    #[test]
    fn close_error_reported_when_calls_succeed() {
        let sim = sim();
        let mut acc = init(&sim);
        sim.inject(Fault::FirmwareClose);
        let err = acc.set_time_of_day(42).unwrap_err();
        assert!(matches!(err, crate::AiopError::Firmware { op: "close", .. }));
        sim.clear_faults();
        assert_eq!(acc.time_of_day().unwrap(), 42);
    }

    #[test]
    fn open_failure_skips_calls() {
        let sim = sim();
        let mut acc = init(&sim);
        sim.clear_calls();
        sim.inject(Fault::FirmwareOpen);
        let err = acc.time_of_day().unwrap_err();
        assert!(matches!(
            err,
            crate::AiopError::Firmware {
                op: "open",
                status: McStatus::NoResource
            }
        ));
        assert_eq!(sim.remote_calls(), vec![RemoteCall::Open(0)]);
    }

    #[test]
    fn probe_attribute_failure_is_only_a_warning() {
        let sim = sim();
        sim.inject(Fault::Attributes);
        let acc = init(&sim);
        acc.teardown().unwrap();
    }

    #[test]
    fn init_failures_release_everything() {
        for fault in [
            Fault::OpenGroup,
            Fault::SetIommu,
            Fault::DeviceInfo,
            Fault::MapPortal,
            Fault::FirmwareOpen,
        ] {
            let sim = sim();
            sim.inject(fault);
            let res = Accelerator::init(
                sim.clone(),
                ResourcePool::default(),
                &ContainerName::default(),
            );
            assert!(res.is_err(), "{fault:?}");
            assert!(sim.held().is_empty(), "{fault:?}: {:?}", sim.held());
        }
    }

    #[test]
    fn unknown_container_fails_cleanly() {
        let sim = sim();
        let name = ContainerName::new("dprc.9").unwrap();
        assert!(Accelerator::init(sim.clone(), ResourcePool::default(), &name).is_err());
        assert!(sim.held().is_empty());
    }

    #[test]
    fn drop_releases_like_teardown() {
        let sim = sim();
        drop(init(&sim));
        assert!(sim.held().is_empty());
    }

    #[test]
    fn status_block_format() {
        let status = TileStatus {
            attributes: TileAttributes {
                id: 0,
                major: 1,
                minor: 2,
            },
            sl_version: SlVersion {
                major: 10,
                minor: 1,
                revision: 3,
            },
            state: TileState::Running,
        };
        let text = status.to_string();
        assert!(text.starts_with("AIOP Tile Status:\n"));
        assert!(text.contains("Major Version: 1, Minor Version: 2"));
        assert!(text.contains("Revision: 3"));
        assert!(text.ends_with("State: RUNNING"));
    }
}
