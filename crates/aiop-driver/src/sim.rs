//! Simulated platform for CI and dry runs.
//!
//! [`SimPlatform`] models the VFIO control surface in memory: descriptors,
//! group/container attachment, host mappings and IOMMU registrations. Its
//! portals run a small MC firmware model ([`SimFirmware`]) behind the real
//! [`McPortal`] codec, so every firmware call crosses the same command
//! encoding as on hardware.
//!
//! Every call is logged as a [`SimEvent`], and any step can be made to fail
//! with [`SimPlatform::inject`]. [`SimPlatform::held`] reports what is still
//! open so tests can check that nothing leaks.
//!
//! ```
//! use aiop_driver::sim::SimPlatform;
//! use aiop_driver::{Accelerator, ContainerName, ResourcePool};
//!
//! let sim = SimPlatform::builder()
//!     .container("dprc.5", 7, &["dpmcp.23", "dpaiop.0"])
//!     .build();
//! let mut tile = Accelerator::init(sim.clone(), ResourcePool::default(), &ContainerName::default())?;
//! println!("{}", tile.status()?);
//! tile.teardown()?;
//! assert!(sim.held().is_empty());
//! # Ok::<(), aiop_driver::AiopError>(())
//! ```

use crate::config::{ContainerName, PollConfig};
use crate::error::{AiopError, Result};
use crate::platform::{
    ContainerFd, Descriptor, DeviceFd, DeviceMetadata, FileFd, GroupFd, GroupId, Iova, Platform,
    VirtAddr,
};
use crate::portal::{CommandRegisters, McPortal};
use aiop_mc::cmd::{param_offset, CMD_PARAM_COUNT};
use aiop_mc::dpaiop::{self, ids, versioned};
use aiop_mc::layout::{ACCELERATOR_PREFIX, COMPANION_PREFIX, IRQ_WINDOW_IOVA, PAGE_SIZE};
use aiop_mc::{McCommand, McStatus, SlVersion, TileAttributes, TileState, Token};
use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet};
use std::os::unix::io::RawFd;
use std::path::{Path, PathBuf};
use std::rc::Rc;

/// Size of a simulated MC portal window.
const PORTAL_LEN: usize = 0x1_0000;

/// A step that can be made to fail.
///
/// Variants carrying a number fail only the n-th call (1-based, counted
/// from platform creation); the others fail every call while injected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Fault {
    /// Opening a group node
    OpenGroup,
    /// Group status query
    GroupStatus,
    /// Attaching a group to a container
    SetContainer,
    /// Selecting the IOMMU backend
    SetIommu,
    /// Device metadata query
    DeviceInfo,
    /// Mapping an MC portal
    MapPortal,
    /// Opening the n-th staged file
    OpenFile(usize),
    /// Mapping the n-th staged file
    MapFile(usize),
    /// The n-th buffer DMA registration (interrupt window excluded)
    MapDma(usize),
    /// Registering the interrupt window
    MapIrqWindow,
    /// Firmware `open`
    FirmwareOpen,
    /// Firmware `close`
    FirmwareClose,
    /// Firmware `reset`
    Reset,
    /// Firmware `load`
    Load,
    /// Firmware `run`
    Run,
    /// Firmware `get_attributes`
    Attributes,
    /// Firmware `get_sl_version`
    SlVersion,
    /// Firmware `get_state`
    State,
    /// Firmware `get_time_of_day`
    GetTod,
    /// Firmware `set_time_of_day`
    SetTod,
}

/// A firmware command as seen by the simulated MC.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteCall {
    /// `open` for a hardware id
    Open(u32),
    /// `close`
    Close,
    /// `reset`
    Reset,
    /// `load`
    Load {
        /// Image IOVA
        iova: u64,
        /// Image length
        size: u32,
    },
    /// `run`
    Run {
        /// Cores mask
        cores_mask: u32,
        /// Argument IOVA
        args_iova: u64,
        /// Argument length
        args_size: u32,
    },
    /// `get_attributes`
    Attributes,
    /// `get_sl_version`
    SlVersion,
    /// `get_state`
    State,
    /// `get_time_of_day`
    GetTod,
    /// `set_time_of_day`
    SetTod(u64),
}

/// One recorded platform call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SimEvent {
    /// Group node opened
    OpenGroup(u32),
    /// Container opened
    OpenContainer,
    /// Device descriptor opened
    OpenDevice(String),
    /// Staged file opened
    OpenFile(PathBuf),
    /// Private file mapping
    MapFile {
        /// Mapping length
        len: usize,
    },
    /// Shared device mapping
    MapDevice {
        /// Offset into the device
        offset: u64,
        /// Mapping length
        len: usize,
    },
    /// IOMMU registration
    MapDma {
        /// Device-visible address
        iova: Iova,
        /// Length
        len: usize,
    },
    /// IOMMU removal
    UnmapDma {
        /// Device-visible address
        iova: Iova,
        /// Length
        len: usize,
    },
    /// Host mapping released
    Unmap {
        /// Length
        len: usize,
    },
    /// Descriptor closed
    Close(&'static str),
    /// Firmware command
    Remote(RemoteCall),
}

/// Resources still held on the platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Holdings {
    /// Open descriptors
    pub fds: usize,
    /// Host mappings
    pub mappings: usize,
    /// IOMMU registrations
    pub dma: usize,
    /// Open firmware sessions
    pub tokens: usize,
}

impl Holdings {
    /// Whether nothing is held.
    pub const fn is_empty(&self) -> bool {
        self.fds == 0 && self.mappings == 0 && self.dma == 0 && self.tokens == 0
    }
}

/// State of the simulated tile.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SimFirmware {
    /// Reported attributes
    pub attributes: TileAttributes,
    /// Reported service layer version
    pub sl_version: SlVersion,
    /// Current tile state
    pub state: TileState,
    /// Current time of day
    pub time_of_day: u64,
}

impl Default for SimFirmware {
    fn default() -> Self {
        Self {
            attributes: TileAttributes {
                id: 0,
                major: 1,
                minor: 2,
            },
            sl_version: SlVersion {
                major: 10,
                minor: 1,
                revision: 0,
            },
            state: TileState::ResetDone,
            time_of_day: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum OpenKind {
    Group(u32),
    Container { iommu: bool },
    Device(String),
    File,
}

impl OpenKind {
    const fn kind(&self) -> &'static str {
        match self {
            Self::Group(_) => "group",
            Self::Container { .. } => "container",
            Self::Device(_) => "device",
            Self::File => "file",
        }
    }
}

#[derive(Debug)]
struct SimGroup {
    container: String,
    devices: Vec<String>,
    viable: bool,
}

#[derive(Debug, Default)]
struct SimState {
    containers: BTreeMap<String, u32>,
    groups: BTreeMap<u32, SimGroup>,
    next_fd: RawFd,
    open: BTreeMap<RawFd, OpenKind>,
    attached: BTreeMap<RawFd, RawFd>,
    next_addr: u64,
    mappings: BTreeMap<u64, usize>,
    dma: BTreeMap<(RawFd, u64), usize>,
    next_token: u16,
    tokens: BTreeSet<u16>,
    firmware: SimFirmware,
    faults: BTreeSet<Fault>,
    open_files: usize,
    mapped_files: usize,
    dma_maps: usize,
    api_version: i32,
    events: Vec<SimEvent>,
}

fn os_error(op: &'static str, errno: i32) -> AiopError {
    AiopError::kernel(op, std::io::Error::from_raw_os_error(errno))
}

impl SimState {
    fn fail(&self, fault: Fault, op: &'static str) -> Result<()> {
        if self.faults.contains(&fault) {
            return Err(os_error(op, libc::EIO));
        }
        Ok(())
    }

    fn alloc_fd(&mut self, kind: OpenKind) -> RawFd {
        self.next_fd += 1;
        let fd = self.next_fd;
        self.open.insert(fd, kind);
        fd
    }

    fn kind(&self, fd: RawFd, op: &'static str) -> Result<&OpenKind> {
        self.open.get(&fd).ok_or_else(|| os_error(op, libc::EBADF))
    }

    fn alloc_mapping(&mut self, len: usize) -> VirtAddr {
        let addr = self.next_addr;
        let pages = len.div_ceil(PAGE_SIZE) as u64 + 1;
        self.next_addr += pages * PAGE_SIZE as u64;
        self.mappings.insert(addr, len);
        VirtAddr(addr)
    }

    fn group_of(&self, group: GroupFd, op: &'static str) -> Result<u32> {
        match self.kind(group.raw(), op)? {
            OpenKind::Group(id) => Ok(*id),
            _ => Err(os_error(op, libc::EINVAL)),
        }
    }

    fn execute(&mut self, cmd: &McCommand) -> McCommand {
        let (call, outcome) = self.dispatch(cmd);
        if let Some(call) = call {
            self.events.push(SimEvent::Remote(call));
        }
        match outcome {
            Ok(resp) => resp.with_status(McStatus::Ok),
            Err(status) => McCommand {
                header: cmd.header,
                params: [0; CMD_PARAM_COUNT],
            }
            .with_status(status),
        }
    }

    fn firmware_fault(&self, fault: Fault, status: McStatus) -> std::result::Result<(), McStatus> {
        if self.faults.contains(&fault) {
            Err(status)
        } else {
            Ok(())
        }
    }

    fn session(&self, token: Token) -> std::result::Result<(), McStatus> {
        if self.tokens.contains(&token.0) {
            Ok(())
        } else {
            Err(McStatus::AuthError)
        }
    }

    fn covered(&self, iova: u64, len: u64) -> bool {
        self.dma
            .iter()
            .any(|(&(_, start), &size)| iova >= start && iova + len <= start + size as u64)
    }

    #[allow(clippy::too_many_lines)]
    fn dispatch(
        &mut self,
        cmd: &McCommand,
    ) -> (Option<RemoteCall>, std::result::Result<McCommand, McStatus>) {
        let token = cmd.token();
        let mut resp = McCommand {
            header: cmd.header,
            params: [0; CMD_PARAM_COUNT],
        };
        let id = cmd.cmd_id();

        if id == versioned(ids::OPEN) {
            #[allow(clippy::cast_possible_truncation)]
            let hw_id = cmd.field(0, 0, 32) as u32;
            let call = RemoteCall::Open(hw_id);
            if let Err(status) = self.firmware_fault(Fault::FirmwareOpen, McStatus::NoResource) {
                return (Some(call), Err(status));
            }
            if hw_id != self.firmware.attributes.id {
                return (Some(call), Err(McStatus::ConfigError));
            }
            self.next_token = self.next_token.wrapping_add(1).max(1);
            self.tokens.insert(self.next_token);
            return (Some(call), Ok(resp.with_token(Token(self.next_token))));
        }

        if id == versioned(ids::CLOSE) {
            let result = self.session(token).and_then(|()| {
                // The MC drops the session even when it reports an error.
                self.tokens.remove(&token.0);
                self.firmware_fault(Fault::FirmwareClose, McStatus::Busy)
            });
            return (Some(RemoteCall::Close), result.map(|()| resp));
        }

        if let Err(status) = self.session(token) {
            return (None, Err(status));
        }

        if id == versioned(ids::RESET) {
            let result = if self.faults.contains(&Fault::Reset) {
                Err(McStatus::UnsupportedOp)
            } else {
                self.firmware.state = TileState::ResetDone;
                Ok(resp)
            };
            (Some(RemoteCall::Reset), result)
        } else if id == versioned(ids::LOAD) {
            #[allow(clippy::cast_possible_truncation)]
            let size = cmd.field(0, 32, 32) as u32;
            let iova = cmd.field(1, 0, 64);
            let call = RemoteCall::Load { iova, size };
            let result = if self.faults.contains(&Fault::Load) {
                Err(McStatus::ConfigError)
            } else if !self.covered(iova, u64::from(size)) {
                Err(McStatus::DmaError)
            } else {
                self.firmware.state = TileState::LoadDone;
                Ok(resp)
            };
            (Some(call), result)
        } else if id == versioned(ids::RUN) {
            #[allow(clippy::cast_possible_truncation)]
            let cores_mask = cmd.field(0, 0, 32) as u32;
            #[allow(clippy::cast_possible_truncation)]
            let args_size = cmd.field(0, 32, 32) as u32;
            let args_iova = cmd.field(2, 0, 64);
            let call = RemoteCall::Run {
                cores_mask,
                args_iova,
                args_size,
            };
            let result = if self.faults.contains(&Fault::Run) {
                Err(McStatus::InvalidState)
            } else if self.firmware.state != TileState::LoadDone {
                Err(McStatus::InvalidState)
            } else if args_size != 0 && !self.covered(args_iova, u64::from(args_size)) {
                Err(McStatus::DmaError)
            } else {
                self.firmware.state = TileState::Running;
                Ok(resp)
            };
            (Some(call), result)
        } else if id == versioned(ids::GET_ATTRIBUTES) {
            let result = self
                .firmware_fault(Fault::Attributes, McStatus::Busy)
                .map(|()| {
                    let a = self.firmware.attributes;
                    resp.set_field(0, 0, 32, u64::from(a.id));
                    resp.set_field(1, 0, 32, u64::from(a.major));
                    resp.set_field(1, 32, 32, u64::from(a.minor));
                    resp
                });
            (Some(RemoteCall::Attributes), result)
        } else if id == versioned(ids::GET_SL_VERSION) {
            let result = self
                .firmware_fault(Fault::SlVersion, McStatus::Busy)
                .map(|()| {
                    let v = self.firmware.sl_version;
                    resp.set_field(0, 0, 32, u64::from(v.major));
                    resp.set_field(0, 32, 32, u64::from(v.minor));
                    resp.set_field(1, 0, 32, u64::from(v.revision));
                    resp
                });
            (Some(RemoteCall::SlVersion), result)
        } else if id == versioned(ids::GET_STATE) {
            let result = self.firmware_fault(Fault::State, McStatus::Busy).map(|()| {
                resp.set_field(0, 0, 32, u64::from(self.firmware.state.raw()));
                resp
            });
            (Some(RemoteCall::State), result)
        } else if id == versioned(ids::GET_TIME_OF_DAY) {
            let result = self.firmware_fault(Fault::GetTod, McStatus::Busy).map(|()| {
                resp.set_field(0, 0, 64, self.firmware.time_of_day);
                resp
            });
            (Some(RemoteCall::GetTod), result)
        } else if id == versioned(ids::SET_TIME_OF_DAY) {
            let tod = dpaiop::decode_time_of_day(cmd);
            let result = self.firmware_fault(Fault::SetTod, McStatus::Busy).map(|()| {
                self.firmware.time_of_day = tod;
                resp
            });
            (Some(RemoteCall::SetTod(tod)), result)
        } else {
            (None, Err(McStatus::UnsupportedOp))
        }
    }
}

/// In-memory VFIO platform.
///
/// Clones share state, so a test can keep one clone for inspection while
/// the session owns another.
#[derive(Debug, Clone)]
pub struct SimPlatform {
    state: Rc<RefCell<SimState>>,
}

/// Builder for [`SimPlatform`].
#[derive(Debug, Default)]
pub struct SimPlatformBuilder {
    containers: Vec<(String, u32, Vec<String>)>,
    firmware: SimFirmware,
}

impl SimPlatformBuilder {
    /// Add a container object whose IOMMU group holds `devices`.
    #[must_use]
    pub fn container(mut self, name: &str, group: u32, devices: &[&str]) -> Self {
        self.containers.push((
            name.to_string(),
            group,
            devices.iter().map(ToString::to_string).collect(),
        ));
        self
    }

    /// Initial firmware state.
    #[must_use]
    pub const fn firmware(mut self, firmware: SimFirmware) -> Self {
        self.firmware = firmware;
        self
    }

    /// Build the platform.
    pub fn build(self) -> SimPlatform {
        let mut state = SimState {
            next_fd: 2,
            next_addr: 0x7f00_0000_0000,
            firmware: self.firmware,
            ..SimState::default()
        };
        for (name, group, devices) in self.containers {
            state.containers.insert(name.clone(), group);
            state.groups.insert(
                group,
                SimGroup {
                    container: name,
                    devices,
                    viable: true,
                },
            );
        }
        SimPlatform {
            state: Rc::new(RefCell::new(state)),
        }
    }
}

impl SimPlatform {
    /// Start describing a platform.
    pub fn builder() -> SimPlatformBuilder {
        SimPlatformBuilder::default()
    }

    /// Make a step fail.
    pub fn inject(&self, fault: Fault) {
        self.state.borrow_mut().faults.insert(fault);
    }

    /// Remove every injected fault.
    pub fn clear_faults(&self) {
        self.state.borrow_mut().faults.clear();
    }

    /// Mark a group as (not) viable.
    pub fn set_viable(&self, group: GroupId, viable: bool) {
        if let Some(g) = self.state.borrow_mut().groups.get_mut(&group.0) {
            g.viable = viable;
        }
    }

    /// VFIO API version reported by every container.
    pub fn set_api_version(&self, version: i32) {
        self.state.borrow_mut().api_version = version;
    }

    /// Create a host mapping not backed by any descriptor.
    pub fn anonymous_buffer(&self, len: usize) -> VirtAddr {
        self.state.borrow_mut().alloc_mapping(len)
    }

    /// What is still held.
    pub fn held(&self) -> Holdings {
        let state = self.state.borrow();
        Holdings {
            fds: state.open.len(),
            mappings: state.mappings.len(),
            dma: state.dma.len(),
            tokens: state.tokens.len(),
        }
    }

    /// Number of groups attached to a container.
    pub fn attached_groups(&self) -> usize {
        self.state.borrow().attached.len()
    }

    /// Current firmware state.
    pub fn firmware(&self) -> SimFirmware {
        self.state.borrow().firmware
    }

    /// Every recorded call.
    pub fn events(&self) -> Vec<SimEvent> {
        self.state.borrow().events.clone()
    }

    /// Recorded firmware commands.
    pub fn remote_calls(&self) -> Vec<RemoteCall> {
        self.state
            .borrow()
            .events
            .iter()
            .filter_map(|e| match e {
                SimEvent::Remote(call) => Some(*call),
                _ => None,
            })
            .collect()
    }

    /// Forget recorded calls.
    pub fn clear_calls(&self) {
        self.state.borrow_mut().events.clear();
    }
}

impl Platform for SimPlatform {
    type Portal = McPortal<SimPortal>;

    fn container_group(&self, container: &ContainerName) -> Result<GroupId> {
        self.state
            .borrow()
            .containers
            .get(container.as_str())
            .map(|&g| GroupId(g))
            .ok_or_else(|| os_error("read iommu_group link", libc::ENOENT))
    }

    fn group_devices(&self, group: GroupId) -> Result<Vec<String>> {
        let state = self.state.borrow();
        let g = state
            .groups
            .get(&group.0)
            .ok_or_else(|| os_error("read group devices", libc::ENOENT))?;
        let mut names = vec![g.container.clone()];
        names.extend(g.devices.iter().cloned());
        Ok(names)
    }

    fn open_group(&self, group: GroupId) -> Result<GroupFd> {
        let mut state = self.state.borrow_mut();
        state.fail(Fault::OpenGroup, "open VFIO group")?;
        if !state.groups.contains_key(&group.0) {
            return Err(os_error("open VFIO group", libc::ENOENT));
        }
        if state.open.values().any(|k| *k == OpenKind::Group(group.0)) {
            return Err(os_error("open VFIO group", libc::EBUSY));
        }
        state.events.push(SimEvent::OpenGroup(group.0));
        Ok(GroupFd(state.alloc_fd(OpenKind::Group(group.0))))
    }

    fn group_viable(&self, group: GroupFd) -> Result<bool> {
        let state = self.state.borrow();
        state.fail(Fault::GroupStatus, "VFIO_GROUP_GET_STATUS")?;
        let id = state.group_of(group, "VFIO_GROUP_GET_STATUS")?;
        Ok(state.groups.get(&id).is_some_and(|g| g.viable))
    }

    fn set_container(&self, group: GroupFd, container: ContainerFd) -> Result<()> {
        let mut state = self.state.borrow_mut();
        state.fail(Fault::SetContainer, "VFIO_GROUP_SET_CONTAINER")?;
        state.group_of(group, "VFIO_GROUP_SET_CONTAINER")?;
        if !matches!(
            state.kind(container.raw(), "VFIO_GROUP_SET_CONTAINER")?,
            OpenKind::Container { .. }
        ) {
            return Err(os_error("VFIO_GROUP_SET_CONTAINER", libc::EINVAL));
        }
        if state.attached.contains_key(&group.raw()) {
            return Err(os_error("VFIO_GROUP_SET_CONTAINER", libc::EBUSY));
        }
        state.attached.insert(group.raw(), container.raw());
        Ok(())
    }

    fn unset_container(&self, group: GroupFd) -> Result<()> {
        let mut state = self.state.borrow_mut();
        match state.attached.remove(&group.raw()) {
            Some(_) => Ok(()),
            None => Err(os_error("VFIO_GROUP_UNSET_CONTAINER", libc::EINVAL)),
        }
    }

    fn open_container(&self) -> Result<ContainerFd> {
        let mut state = self.state.borrow_mut();
        state.events.push(SimEvent::OpenContainer);
        Ok(ContainerFd(state.alloc_fd(OpenKind::Container { iommu: false })))
    }

    fn api_version(&self, container: ContainerFd) -> Result<i32> {
        let state = self.state.borrow();
        state.kind(container.raw(), "VFIO_GET_API_VERSION")?;
        Ok(state.api_version)
    }

    fn has_type1_iommu(&self, container: ContainerFd) -> Result<bool> {
        self.state
            .borrow()
            .kind(container.raw(), "VFIO_CHECK_EXTENSION")
            .map(|_| true)
    }

    fn set_iommu(&self, container: ContainerFd) -> Result<()> {
        let mut state = self.state.borrow_mut();
        state.fail(Fault::SetIommu, "VFIO_SET_IOMMU")?;
        if !state.attached.values().any(|&c| c == container.raw()) {
            return Err(os_error("VFIO_SET_IOMMU", libc::EINVAL));
        }
        match state.open.get_mut(&container.raw()) {
            Some(OpenKind::Container { iommu }) => {
                *iommu = true;
                Ok(())
            }
            _ => Err(os_error("VFIO_SET_IOMMU", libc::EBADF)),
        }
    }

    fn device_fd(&self, group: GroupFd, name: &str) -> Result<DeviceFd> {
        let mut state = self.state.borrow_mut();
        let id = state.group_of(group, "VFIO_GROUP_GET_DEVICE_FD")?;
        let known = state
            .groups
            .get(&id)
            .is_some_and(|g| g.container == name || g.devices.iter().any(|d| d == name));
        if !known {
            return Err(os_error("VFIO_GROUP_GET_DEVICE_FD", libc::ENODEV));
        }
        state.events.push(SimEvent::OpenDevice(name.to_string()));
        Ok(DeviceFd(state.alloc_fd(OpenKind::Device(name.to_string()))))
    }

    fn device_info(&self, device: DeviceFd) -> Result<DeviceMetadata> {
        let state = self.state.borrow();
        state.fail(Fault::DeviceInfo, "VFIO_DEVICE_GET_INFO")?;
        match state.kind(device.raw(), "VFIO_DEVICE_GET_INFO")? {
            OpenKind::Device(name) if name.starts_with(ACCELERATOR_PREFIX) => Ok(DeviceMetadata {
                num_regions: 1,
                num_irqs: 1,
            }),
            OpenKind::Device(_) => Ok(DeviceMetadata {
                num_regions: 1,
                num_irqs: 0,
            }),
            _ => Err(os_error("VFIO_DEVICE_GET_INFO", libc::ENOTTY)),
        }
    }

    fn map_portal(&self, device: DeviceFd) -> Result<Self::Portal> {
        let addr = {
            let mut state = self.state.borrow_mut();
            state.fail(Fault::MapPortal, "mmap MC portal")?;
            match state.kind(device.raw(), "mmap MC portal")? {
                OpenKind::Device(name) if name.starts_with(COMPANION_PREFIX) => {}
                _ => return Err(os_error("mmap MC portal", libc::EINVAL)),
            }
            state.events.push(SimEvent::MapDevice {
                offset: 0,
                len: PORTAL_LEN,
            });
            state.alloc_mapping(PORTAL_LEN)
        };
        let regs = SimPortal {
            state: Rc::clone(&self.state),
            addr,
            regs: RefCell::new([0; 1 + CMD_PARAM_COUNT]),
        };
        Ok(McPortal::new(regs, PollConfig::default()))
    }

    fn map_dma(
        &self,
        container: ContainerFd,
        vaddr: VirtAddr,
        iova: Iova,
        len: usize,
    ) -> Result<()> {
        let mut state = self.state.borrow_mut();
        if iova.0 == IRQ_WINDOW_IOVA {
            state.fail(Fault::MapIrqWindow, "VFIO_IOMMU_MAP_DMA")?;
        } else {
            state.dma_maps += 1;
            let nth = state.dma_maps;
            state.fail(Fault::MapDma(nth), "VFIO_IOMMU_MAP_DMA")?;
        }
        match state.kind(container.raw(), "VFIO_IOMMU_MAP_DMA")? {
            OpenKind::Container { iommu: true } => {}
            _ => return Err(os_error("VFIO_IOMMU_MAP_DMA", libc::EINVAL)),
        }
        if !state.mappings.get(&vaddr.0).is_some_and(|&l| l >= len) {
            return Err(os_error("VFIO_IOMMU_MAP_DMA", libc::EFAULT));
        }
        if state.dma.contains_key(&(container.raw(), iova.0)) {
            return Err(os_error("VFIO_IOMMU_MAP_DMA", libc::EEXIST));
        }
        state.dma.insert((container.raw(), iova.0), len);
        state.events.push(SimEvent::MapDma { iova, len });
        Ok(())
    }

    fn unmap_dma(&self, container: ContainerFd, iova: Iova, len: usize) -> Result<()> {
        let mut state = self.state.borrow_mut();
        state.events.push(SimEvent::UnmapDma { iova, len });
        match state.dma.remove(&(container.raw(), iova.0)) {
            Some(_) => Ok(()),
            None => Err(os_error("VFIO_IOMMU_UNMAP_DMA", libc::EINVAL)),
        }
    }

    fn open_file(&self, path: &Path) -> Result<FileFd> {
        let mut state = self.state.borrow_mut();
        state.open_files += 1;
        let nth = state.open_files;
        state.fail(Fault::OpenFile(nth), "open file")?;
        if !path.is_file() {
            return Err(os_error("open file", libc::ENOENT));
        }
        state.events.push(SimEvent::OpenFile(path.to_path_buf()));
        Ok(FileFd(state.alloc_fd(OpenKind::File)))
    }

    fn map_file(&self, file: FileFd, len: usize) -> Result<VirtAddr> {
        let mut state = self.state.borrow_mut();
        state.mapped_files += 1;
        let nth = state.mapped_files;
        state.fail(Fault::MapFile(nth), "mmap file")?;
        if *state.kind(file.raw(), "mmap file")? != OpenKind::File {
            return Err(os_error("mmap file", libc::EACCES));
        }
        state.events.push(SimEvent::MapFile { len });
        Ok(state.alloc_mapping(len))
    }

    fn map_device(&self, device: DeviceFd, offset: u64, len: usize) -> Result<VirtAddr> {
        let mut state = self.state.borrow_mut();
        if !matches!(state.kind(device.raw(), "mmap device")?, OpenKind::Device(_)) {
            return Err(os_error("mmap device", libc::EINVAL));
        }
        state.events.push(SimEvent::MapDevice { offset, len });
        Ok(state.alloc_mapping(len))
    }

    fn unmap(&self, addr: VirtAddr, len: usize) -> Result<()> {
        let mut state = self.state.borrow_mut();
        state.events.push(SimEvent::Unmap { len });
        match state.mappings.get(&addr.0) {
            Some(&mapped) if mapped == len => {
                state.mappings.remove(&addr.0);
                Ok(())
            }
            _ => Err(os_error("munmap", libc::EINVAL)),
        }
    }

    fn close<D: Descriptor>(&self, fd: D) -> Result<()> {
        let mut state = self.state.borrow_mut();
        let Some(kind) = state.open.remove(&fd.raw()) else {
            return Err(os_error("close", libc::EBADF));
        };
        match kind {
            // Closing a group detaches it.
            OpenKind::Group(_) => {
                state.attached.remove(&fd.raw());
            }
            // Closing a container drops its IOMMU registrations.
            OpenKind::Container { .. } => {
                state.dma.retain(|&(c, _), _| c != fd.raw());
            }
            _ => {}
        }
        state.events.push(SimEvent::Close(kind.kind()));
        Ok(())
    }
}

/// Register window of a simulated MC portal.
///
/// Writing the header executes the command against the firmware model.
#[derive(Debug)]
pub struct SimPortal {
    state: Rc<RefCell<SimState>>,
    addr: VirtAddr,
    regs: RefCell<[u64; 1 + CMD_PARAM_COUNT]>,
}

impl CommandRegisters for SimPortal {
    fn base(&self) -> VirtAddr {
        self.addr
    }

    fn read64(&self, offset: usize) -> u64 {
        self.regs.borrow()[offset / 8]
    }

    fn write64(&self, offset: usize, value: u64) {
        self.regs.borrow_mut()[offset / 8] = value;
        if offset != 0 {
            return;
        }
        let mut cmd = McCommand {
            header: value,
            params: [0; CMD_PARAM_COUNT],
        };
        {
            let regs = self.regs.borrow();
            for i in 0..CMD_PARAM_COUNT {
                cmd.params[i] = regs[param_offset(i) / 8];
            }
        }
        let resp = self.state.borrow_mut().execute(&cmd);
        let mut regs = self.regs.borrow_mut();
        regs[0] = resp.header;
        regs[1..].copy_from_slice(&resp.params);
    }
}

impl Drop for SimPortal {
    fn drop(&mut self) {
        let mut state = self.state.borrow_mut();
        state.mappings.remove(&self.addr.0);
        state.events.push(SimEvent::Unmap { len: PORTAL_LEN });
    }
}
