//! Firmware control channel over an MC portal.
//!
//! [`McPortal`] writes a command into the portal registers, header last,
//! then polls the header status byte until the MC hands the portal back.
//! The `dpaiop` calls are layered on top as [`FirmwareControl`].

use crate::config::PollConfig;
use crate::error::{AiopError, Result};
use crate::platform::VirtAddr;
use aiop_mc::cmd::{param_offset, CMD_PARAM_COUNT};
use aiop_mc::{dpaiop, LoadConfig, McCommand, McStatus, RunConfig, SlVersion, TileAttributes};
use aiop_mc::{TileState, Token};

/// The `dpaiop` command set as seen by the session.
///
/// Every call except [`open`](Self::open) requires the token of an open
/// session.
pub trait FirmwareControl {
    /// Host address of the control window.
    fn window(&self) -> VirtAddr;

    /// Open a session on the tile with hardware id `hw_id`.
    ///
    /// # Errors
    ///
    /// Returns an error if the MC rejects the command or times out.
    fn open(&self, hw_id: u32) -> Result<Token>;

    /// Close a session.
    ///
    /// # Errors
    ///
    /// Returns an error if the MC rejects the command or times out.
    fn close(&self, token: Token) -> Result<()>;

    /// Reset the tile.
    ///
    /// # Errors
    ///
    /// Returns an error if the MC rejects the command or times out.
    fn reset(&self, token: Token) -> Result<()>;

    /// Load an image from DMA memory.
    ///
    /// # Errors
    ///
    /// Returns an error if the MC rejects the command or times out.
    fn load(&self, token: Token, cfg: &LoadConfig) -> Result<()>;

    /// Start the loaded image.
    ///
    /// # Errors
    ///
    /// Returns an error if the MC rejects the command or times out.
    fn run(&self, token: Token, cfg: &RunConfig) -> Result<()>;

    /// Object attributes.
    ///
    /// # Errors
    ///
    /// Returns an error if the MC rejects the command or times out.
    fn attributes(&self, token: Token) -> Result<TileAttributes>;

    /// Service layer version.
    ///
    /// # Errors
    ///
    /// Returns an error if the MC rejects the command or times out.
    fn sl_version(&self, token: Token) -> Result<SlVersion>;

    /// Tile state.
    ///
    /// # Errors
    ///
    /// Returns an error if the MC rejects the command or times out.
    fn state(&self, token: Token) -> Result<TileState>;

    /// Tile time of day.
    ///
    /// # Errors
    ///
    /// Returns an error if the MC rejects the command or times out.
    fn time_of_day(&self, token: Token) -> Result<u64>;

    /// Set the tile time of day.
    ///
    /// # Errors
    ///
    /// Returns an error if the MC rejects the command or times out.
    fn set_time_of_day(&self, token: Token, tod: u64) -> Result<()>;
}

/// 64-bit register access to a portal.
pub trait CommandRegisters {
    /// Host address of the first register.
    fn base(&self) -> VirtAddr;

    /// Read the register at byte `offset`.
    fn read64(&self, offset: usize) -> u64;

    /// Write the register at byte `offset`.
    fn write64(&self, offset: usize, value: u64);
}

/// MC portal driving [`dpaiop`] commands through a register window.
#[derive(Debug)]
pub struct McPortal<R> {
    regs: R,
    poll: PollConfig,
}

impl<R: CommandRegisters> McPortal<R> {
    /// Wrap a register window.
    pub fn new(regs: R, poll: PollConfig) -> Self {
        Self { regs, poll }
    }

    /// Register window.
    pub fn registers(&self) -> &R {
        &self.regs
    }

    /// Issue one command and wait for its response.
    ///
    /// # Errors
    ///
    /// Returns [`AiopError::Firmware`] when the MC reports a non-OK status and
    /// [`AiopError::FirmwareTimeout`] when the portal stays busy.
    pub fn send(&self, op: &'static str, cmd: &McCommand) -> Result<McCommand> {
        for (i, param) in cmd.params.iter().enumerate() {
            self.regs.write64(param_offset(i), *param);
        }
        self.regs.write64(0, cmd.header);

        let header = self.wait(op)?;
        let mut resp = McCommand {
            header,
            params: [0; CMD_PARAM_COUNT],
        };
        for (i, param) in resp.params.iter_mut().enumerate() {
            *param = self.regs.read64(param_offset(i));
        }

        match resp.status() {
            McStatus::Ok => Ok(resp),
            status => {
                tracing::debug!("MC command {op} ({:#06x}) -> {status}", cmd.cmd_id());
                Err(AiopError::firmware(op, status))
            }
        }
    }

    fn wait(&self, op: &'static str) -> Result<u64> {
        let PollConfig {
            max_polls,
            yield_interval,
        } = self.poll;
        for i in 0..max_polls {
            let header = self.regs.read64(0);
            let status = McCommand {
                header,
                ..McCommand::default()
            }
            .status();
            if status != McStatus::Ready {
                return Ok(header);
            }
            if yield_interval != 0 && i % yield_interval == 0 {
                std::thread::yield_now();
            }
        }
        Err(AiopError::FirmwareTimeout {
            op,
            polls: max_polls,
        })
    }
}

impl<R: CommandRegisters> FirmwareControl for McPortal<R> {
    fn window(&self) -> VirtAddr {
        self.regs.base()
    }

    fn open(&self, hw_id: u32) -> Result<Token> {
        let resp = self.send("open", &dpaiop::open(hw_id))?;
        Ok(dpaiop::decode_open(&resp))
    }

    fn close(&self, token: Token) -> Result<()> {
        self.send("close", &dpaiop::close(token)).map(drop)
    }

    fn reset(&self, token: Token) -> Result<()> {
        self.send("reset", &dpaiop::reset(token)).map(drop)
    }

    fn load(&self, token: Token, cfg: &LoadConfig) -> Result<()> {
        self.send("load", &dpaiop::load(token, cfg)).map(drop)
    }

    fn run(&self, token: Token, cfg: &RunConfig) -> Result<()> {
        self.send("run", &dpaiop::run(token, cfg)).map(drop)
    }

    fn attributes(&self, token: Token) -> Result<TileAttributes> {
        let resp = self.send("get_attributes", &dpaiop::get_attributes(token))?;
        Ok(dpaiop::decode_attributes(&resp))
    }

    fn sl_version(&self, token: Token) -> Result<SlVersion> {
        let resp = self.send("get_sl_version", &dpaiop::get_sl_version(token))?;
        Ok(dpaiop::decode_sl_version(&resp))
    }

    fn state(&self, token: Token) -> Result<TileState> {
        let resp = self.send("get_state", &dpaiop::get_state(token))?;
        Ok(dpaiop::decode_state(&resp))
    }

    fn time_of_day(&self, token: Token) -> Result<u64> {
        let resp = self.send("get_time_of_day", &dpaiop::get_time_of_day(token))?;
        Ok(dpaiop::decode_time_of_day(&resp))
    }

    fn set_time_of_day(&self, token: Token, tod: u64) -> Result<()> {
        self.send("set_time_of_day", &dpaiop::set_time_of_day(token, tod))
            .map(drop)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aiop_mc::dpaiop::{ids, versioned};
    use std::cell::{Cell, RefCell};

    /// Portal that answers after a fixed number of busy reads.
    struct Scripted {
        regs: RefCell<[u64; 8]>,
        busy_reads: Cell<u32>,
        reply: McStatus,
        reply_params: [u64; CMD_PARAM_COUNT],
        writes: RefCell<Vec<usize>>,
    }

    impl Scripted {
        fn new(busy_reads: u32, reply: McStatus) -> Self {
            Self {
                regs: RefCell::new([0; 8]),
                busy_reads: Cell::new(busy_reads),
                reply,
                reply_params: [0; CMD_PARAM_COUNT],
                writes: RefCell::new(Vec::new()),
            }
        }
    }

    impl CommandRegisters for Scripted {
        fn base(&self) -> VirtAddr {
            VirtAddr(0x1000)
        }

        fn read64(&self, offset: usize) -> u64 {
            if offset == 0 {
                let left = self.busy_reads.get();
                if left > 0 {
                    self.busy_reads.set(left - 1);
                } else {
                    let mut regs = self.regs.borrow_mut();
                    let done = McCommand {
                        header: regs[0],
                        ..McCommand::default()
                    }
                    .with_status(self.reply);
                    regs[0] = done.header;
                    regs[1..].copy_from_slice(&self.reply_params);
                }
            }
            self.regs.borrow()[offset / 8]
        }

        fn write64(&self, offset: usize, value: u64) {
            self.writes.borrow_mut().push(offset);
            self.regs.borrow_mut()[offset / 8] = value;
        }
    }

    fn quick() -> PollConfig {
        PollConfig {
            max_polls: 16,
            yield_interval: 4,
        }
    }

    #[test]
    fn header_is_written_after_parameters() {
        let portal = McPortal::new(Scripted::new(2, McStatus::Ok), quick());
        portal.reset(Token(5)).unwrap();
        let writes = portal.registers().writes.borrow();
        assert_eq!(writes.len(), 8);
        assert_eq!(*writes.last().unwrap(), 0);
        assert!(writes[..7].iter().all(|&o| o != 0));
    }

    #[test]
    fn response_parameters_are_decoded() {
        let mut regs = Scripted::new(0, McStatus::Ok);
        regs.reply_params[0] = (7u64 << 32) | 10;
        regs.reply_params[1] = 3;
        let portal = McPortal::new(regs, quick());
        let v = portal.sl_version(Token(1)).unwrap();
        assert_eq!(v, SlVersion { major: 10, minor: 7, revision: 3 });
        let header = portal.registers().regs.borrow()[0];
        let sent = McCommand {
            header,
            ..McCommand::default()
        };
        assert_eq!(sent.cmd_id(), versioned(ids::GET_SL_VERSION));
        assert_eq!(sent.token(), Token(1));
    }

    #[test]
    fn error_status_becomes_firmware_error() {
        let portal = McPortal::new(Scripted::new(1, McStatus::InvalidState), quick());
        let err = portal.load(Token(1), &LoadConfig::default()).unwrap_err();
        assert!(matches!(
            err,
            AiopError::Firmware {
                op: "load",
                status: McStatus::InvalidState
            }
        ));
    }

    #[test]
    fn busy_portal_times_out() {
        let portal = McPortal::new(Scripted::new(100, McStatus::Ok), quick());
        let err = portal.close(Token(1)).unwrap_err();
        assert!(matches!(
            err,
            AiopError::FirmwareTimeout {
                op: "close",
                polls: 16
            }
        ));
    }

    #[test]
    fn open_returns_token_from_header() {
        let regs = Scripted::new(0, McStatus::Ok);
        let portal = McPortal::new(regs, quick());
        // The scripted MC echoes the header, so the token is the one sent.
        assert_eq!(portal.open(4).unwrap(), Token(0));
    }
}
