//! Pure model of the DPAA2 management complex (MC) as seen by the AIOP tool.
//!
//! This crate has **no dependencies** and **no hardware access**. It models
//! the command word exchanged through an MC portal, the `dpaiop` object's
//! command set, the tile state machine, and the fixed platform layout the
//! tool relies on (sysfs paths, object name prefixes, staging limits).
//!
//! # Crate organisation
//!
//! | Module | Contents |
//! |--------|----------|
//! | [`cmd`] | MC command word: header fields, parameters, status codes |
//! | [`dpaiop`] | `dpaiop` command ids, encoders/decoders, tile states |
//! | [`layout`] | Platform constants: limits, paths, prefixes, IRQ window |

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod cmd;
pub mod dpaiop;
pub mod layout;

pub use cmd::{CmdPriority, McCommand, McStatus, Token};
pub use dpaiop::{LoadConfig, RunConfig, SlVersion, TileAttributes, TileState};
