//! `dpaiop` object command set.
//!
//! Each function builds the [`McCommand`] for one firmware call, and the
//! `decode_*` helpers read the response parameters back out. Field
//! placement follows the MC firmware ABI for `dpaiop` revision 1.

use crate::cmd::{CmdPriority, McCommand, Token};

/// Raw command ids (before versioning).
pub mod ids {
    /// Close an open control session.
    pub const CLOSE: u16 = 0x800;
    /// Open a control session for a `dpaiop` hardware id.
    pub const OPEN: u16 = 0x80a;
    /// Read object attributes.
    pub const GET_ATTRIBUTES: u16 = 0x004;
    /// Reset the tile.
    pub const RESET: u16 = 0x005;
    /// Load an image from DMA memory.
    pub const LOAD: u16 = 0x280;
    /// Start the loaded image.
    pub const RUN: u16 = 0x281;
    /// Read the service layer version.
    pub const GET_SL_VERSION: u16 = 0x282;
    /// Read the tile state.
    pub const GET_STATE: u16 = 0x283;
    /// Set the tile time of day.
    pub const SET_TIME_OF_DAY: u16 = 0x284;
    /// Read the tile time of day.
    pub const GET_TIME_OF_DAY: u16 = 0x285;
}

/// Command interface version carried in the low nibble of the id.
pub const CMD_VERSION: u16 = 1;

/// Cores mask selecting every core of the tile.
pub const RUN_CORES_ALL: u32 = 0xFFFF_FFFF;

/// Full on-wire command id for a raw id.
#[must_use]
pub const fn versioned(id: u16) -> u16 {
    (id << 4) | CMD_VERSION
}

/// Tile lifecycle state reported by `GET_STATE`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TileState {
    /// Reset completed.
    ResetDone,
    /// Reset in progress.
    ResetOngoing,
    /// Image loaded.
    LoadDone,
    /// Load in progress.
    LoadOngoing,
    /// Load failed.
    LoadError,
    /// Boot in progress.
    BootOngoing,
    /// Boot failed.
    BootError,
    /// Image running.
    Running,
    /// Value outside the known set.
    Unknown(u32),
}

impl TileState {
    /// Decode the raw state word.
    #[must_use]
    pub const fn from_raw(raw: u32) -> Self {
        match raw {
            0x00 => Self::ResetDone,
            0x01 => Self::ResetOngoing,
            0x02 => Self::LoadDone,
            0x04 => Self::LoadOngoing,
            0x08 => Self::LoadError,
            0x10 => Self::BootOngoing,
            0x20 => Self::BootError,
            0x40 => Self::Running,
            other => Self::Unknown(other),
        }
    }

    /// Raw state word.
    #[must_use]
    pub const fn raw(self) -> u32 {
        match self {
            Self::ResetDone => 0x00,
            Self::ResetOngoing => 0x01,
            Self::LoadDone => 0x02,
            Self::LoadOngoing => 0x04,
            Self::LoadError => 0x08,
            Self::BootOngoing => 0x10,
            Self::BootError => 0x20,
            Self::Running => 0x40,
            Self::Unknown(other) => other,
        }
    }
}

impl std::fmt::Display for TileState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::ResetDone => "RESET_DONE",
            Self::ResetOngoing => "RESET_ONGOING",
            Self::LoadDone => "LOAD_DONE",
            Self::LoadOngoing => "LOAD_ONGOING",
            Self::LoadError => "LOAD_ERROR",
            Self::BootOngoing => "BOOT_ONGOING",
            Self::BootError => "BOOT_ERROR",
            Self::Running => "RUNNING",
            Self::Unknown(_) => "Invalid MC State",
        };
        f.write_str(name)
    }
}

/// `dpaiop` object attributes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TileAttributes {
    /// Object id.
    pub id: u32,
    /// Command interface major version.
    pub major: u32,
    /// Command interface minor version.
    pub minor: u32,
}

/// Service layer version running on the tile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SlVersion {
    /// Major version.
    pub major: u32,
    /// Minor version.
    pub minor: u32,
    /// Revision.
    pub revision: u32,
}

impl std::fmt::Display for SlVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.revision)
    }
}

/// Parameters of a `LOAD` command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LoadConfig {
    /// IOVA of the staged image.
    pub iova: u64,
    /// Image length in bytes.
    pub size: u32,
    /// Load options (none defined).
    pub options: u64,
}

/// Parameters of a `RUN` command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RunConfig {
    /// Cores to start.
    pub cores_mask: u32,
    /// Run options (none defined).
    pub options: u64,
    /// IOVA of the argument blob, zero when absent.
    pub args_iova: u64,
    /// Argument blob length, zero when absent.
    pub args_size: u32,
}

impl RunConfig {
    /// Run on all cores, with an optional argument blob `(iova, len)`.
    #[must_use]
    pub fn all_cores(args: Option<(u64, u32)>) -> Self {
        let (args_iova, args_size) = args.unwrap_or((0, 0));
        Self {
            cores_mask: RUN_CORES_ALL,
            options: 0,
            args_iova,
            args_size,
        }
    }
}

fn command(id: u16, token: Token) -> McCommand {
    McCommand::new(versioned(id), CmdPriority::Low, token)
}

/// `OPEN` for hardware id `hw_id`; the response header carries the token.
#[must_use]
pub fn open(hw_id: u32) -> McCommand {
    let mut cmd = command(ids::OPEN, Token(0));
    cmd.set_field(0, 0, 32, u64::from(hw_id));
    cmd
}

/// `CLOSE` for an open session.
#[must_use]
pub fn close(token: Token) -> McCommand {
    command(ids::CLOSE, token)
}

/// `RESET`.
#[must_use]
pub fn reset(token: Token) -> McCommand {
    command(ids::RESET, token)
}

/// `LOAD`.
#[must_use]
pub fn load(token: Token, cfg: &LoadConfig) -> McCommand {
    let mut cmd = command(ids::LOAD, token);
    cmd.set_field(0, 32, 32, u64::from(cfg.size));
    cmd.set_field(1, 0, 64, cfg.iova);
    cmd.set_field(2, 0, 64, cfg.options);
    cmd
}

/// `RUN`.
#[must_use]
pub fn run(token: Token, cfg: &RunConfig) -> McCommand {
    let mut cmd = command(ids::RUN, token);
    cmd.set_field(0, 0, 32, u64::from(cfg.cores_mask));
    cmd.set_field(0, 32, 32, u64::from(cfg.args_size));
    cmd.set_field(1, 0, 64, cfg.options);
    cmd.set_field(2, 0, 64, cfg.args_iova);
    cmd
}

/// `GET_ATTRIBUTES`.
#[must_use]
pub fn get_attributes(token: Token) -> McCommand {
    command(ids::GET_ATTRIBUTES, token)
}

/// `GET_SL_VERSION`.
#[must_use]
pub fn get_sl_version(token: Token) -> McCommand {
    command(ids::GET_SL_VERSION, token)
}

/// `GET_STATE`.
#[must_use]
pub fn get_state(token: Token) -> McCommand {
    command(ids::GET_STATE, token)
}

/// `GET_TIME_OF_DAY`.
#[must_use]
pub fn get_time_of_day(token: Token) -> McCommand {
    command(ids::GET_TIME_OF_DAY, token)
}

/// `SET_TIME_OF_DAY`.
#[must_use]
pub fn set_time_of_day(token: Token, tod: u64) -> McCommand {
    let mut cmd = command(ids::SET_TIME_OF_DAY, token);
    cmd.set_field(0, 0, 64, tod);
    cmd
}

#[allow(clippy::cast_possible_truncation)]
fn low32(resp: &McCommand, index: usize, offset: u32) -> u32 {
    resp.field(index, offset, 32) as u32
}

/// Token returned by `OPEN`.
#[must_use]
pub fn decode_open(resp: &McCommand) -> Token {
    resp.token()
}

/// Attributes returned by `GET_ATTRIBUTES`.
#[must_use]
pub fn decode_attributes(resp: &McCommand) -> TileAttributes {
    TileAttributes {
        id: low32(resp, 0, 0),
        major: low32(resp, 1, 0),
        minor: low32(resp, 1, 32),
    }
}

/// Version returned by `GET_SL_VERSION`.
#[must_use]
pub fn decode_sl_version(resp: &McCommand) -> SlVersion {
    SlVersion {
        major: low32(resp, 0, 0),
        minor: low32(resp, 0, 32),
        revision: low32(resp, 1, 0),
    }
}

/// State returned by `GET_STATE`.
#[must_use]
pub fn decode_state(resp: &McCommand) -> TileState {
    TileState::from_raw(low32(resp, 0, 0))
}

/// Time of day returned by `GET_TIME_OF_DAY`.
#[must_use]
pub fn decode_time_of_day(resp: &McCommand) -> u64 {
    resp.field(0, 0, 64)
}
