//! MC portal command word.
//!
//! A command occupies the first 64 bytes of a portal: one 64-bit header
//! followed by seven 64-bit parameters. The host writes the parameters,
//! then the header with status [`McStatus::Ready`]; the MC overwrites the
//! status byte when it has placed the response parameters.
//!
//! ```text
//! header bits   63..48   47..32   31..24    23..16   15..8      7..0
//!               cmd_id   token    flags_sw  status   flags_hw   src_id
//! ```

/// Number of 64-bit parameter words following the header.
pub const CMD_PARAM_COUNT: usize = 7;

/// Byte offset of parameter `index` inside the portal.
#[must_use]
pub const fn param_offset(index: usize) -> usize {
    8 * (index + 1)
}

const HDR_STATUS_SHIFT: u32 = 16;
const HDR_TOKEN_SHIFT: u32 = 32;
const HDR_CMD_ID_SHIFT: u32 = 48;
const HDR_PRIORITY_BIT: u64 = 1 << 15;

/// Opaque per-session handle returned by an `open` command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Token(pub u16);

impl std::fmt::Display for Token {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#06x}", self.0)
    }
}

/// Command queue priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CmdPriority {
    /// Normal queue.
    #[default]
    Low,
    /// High priority queue.
    High,
}

/// Completion status reported in the header status byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum McStatus {
    /// Completed successfully.
    Ok,
    /// Still owned by the MC (command pending).
    Ready,
    /// Authentication error.
    AuthError,
    /// Caller lacks privilege.
    NoPrivilege,
    /// DMA or memory access error.
    DmaError,
    /// Configuration error.
    ConfigError,
    /// MC-side timeout.
    Timeout,
    /// No resources available.
    NoResource,
    /// No memory available.
    NoMemory,
    /// Object busy.
    Busy,
    /// Operation not supported by this object or firmware revision.
    UnsupportedOp,
    /// Object in an invalid state for the operation.
    InvalidState,
    /// Any status byte outside the documented set.
    Unknown(u8),
}

impl McStatus {
    /// Decode a raw status byte.
    #[must_use]
    pub const fn from_raw(raw: u8) -> Self {
        match raw {
            0x0 => Self::Ok,
            0x1 => Self::Ready,
            0x3 => Self::AuthError,
            0x4 => Self::NoPrivilege,
            0x5 => Self::DmaError,
            0x6 => Self::ConfigError,
            0x7 => Self::Timeout,
            0x8 => Self::NoResource,
            0x9 => Self::NoMemory,
            0xA => Self::Busy,
            0xB => Self::UnsupportedOp,
            0xC => Self::InvalidState,
            other => Self::Unknown(other),
        }
    }

    /// Raw status byte.
    #[must_use]
    pub const fn raw(self) -> u8 {
        match self {
            Self::Ok => 0x0,
            Self::Ready => 0x1,
            Self::AuthError => 0x3,
            Self::NoPrivilege => 0x4,
            Self::DmaError => 0x5,
            Self::ConfigError => 0x6,
            Self::Timeout => 0x7,
            Self::NoResource => 0x8,
            Self::NoMemory => 0x9,
            Self::Busy => 0xA,
            Self::UnsupportedOp => 0xB,
            Self::InvalidState => 0xC,
            Self::Unknown(other) => other,
        }
    }
}

impl std::fmt::Display for McStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Ok => write!(f, "ok"),
            Self::Ready => write!(f, "pending"),
            Self::AuthError => write!(f, "authentication error"),
            Self::NoPrivilege => write!(f, "no privilege"),
            Self::DmaError => write!(f, "DMA error"),
            Self::ConfigError => write!(f, "configuration error"),
            Self::Timeout => write!(f, "timeout"),
            Self::NoResource => write!(f, "no resource"),
            Self::NoMemory => write!(f, "no memory"),
            Self::Busy => write!(f, "busy"),
            Self::UnsupportedOp => write!(f, "unsupported operation"),
            Self::InvalidState => write!(f, "invalid state"),
            Self::Unknown(raw) => write!(f, "unknown status {raw:#04x}"),
        }
    }
}

/// One MC command or response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct McCommand {
    /// Header word.
    pub header: u64,
    /// Parameter words.
    pub params: [u64; CMD_PARAM_COUNT],
}

impl McCommand {
    /// Build a command with the header status set to [`McStatus::Ready`].
    #[must_use]
    pub const fn new(cmd_id: u16, priority: CmdPriority, token: Token) -> Self {
        let mut header = ((cmd_id as u64) << HDR_CMD_ID_SHIFT)
            | ((token.0 as u64) << HDR_TOKEN_SHIFT)
            | ((McStatus::Ready.raw() as u64) << HDR_STATUS_SHIFT);
        if matches!(priority, CmdPriority::High) {
            header |= HDR_PRIORITY_BIT;
        }
        Self {
            header,
            params: [0; CMD_PARAM_COUNT],
        }
    }

    /// Command id from the header.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn cmd_id(&self) -> u16 {
        (self.header >> HDR_CMD_ID_SHIFT) as u16
    }

    /// Token from the header.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn token(&self) -> Token {
        Token((self.header >> HDR_TOKEN_SHIFT) as u16)
    }

    /// Status byte from the header.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn status(&self) -> McStatus {
        McStatus::from_raw((self.header >> HDR_STATUS_SHIFT) as u8)
    }

    /// Whether the header carries the high-priority flag.
    #[must_use]
    pub const fn is_high_priority(&self) -> bool {
        self.header & HDR_PRIORITY_BIT != 0
    }

    /// Replace the status byte.
    #[must_use]
    pub const fn with_status(mut self, status: McStatus) -> Self {
        self.header &= !(0xFF << HDR_STATUS_SHIFT);
        self.header |= (status.raw() as u64) << HDR_STATUS_SHIFT;
        self
    }

    /// Replace the token field.
    #[must_use]
    pub const fn with_token(mut self, token: Token) -> Self {
        self.header &= !(0xFFFF << HDR_TOKEN_SHIFT);
        self.header |= (token.0 as u64) << HDR_TOKEN_SHIFT;
        self
    }

    /// Store `width` bits of `value` at bit `offset` of parameter `index`.
    ///
    /// # Panics
    ///
    /// Panics if `index` is out of range or the field overflows the word.
    pub fn set_field(&mut self, index: usize, offset: u32, width: u32, value: u64) {
        assert!(offset + width <= 64, "field exceeds parameter word");
        let mask = field_mask(width);
        self.params[index] &= !(mask << offset);
        self.params[index] |= (value & mask) << offset;
    }

    /// Read `width` bits at bit `offset` of parameter `index`.
    ///
    /// # Panics
    ///
    /// Panics if `index` is out of range or the field overflows the word.
    #[must_use]
    pub fn field(&self, index: usize, offset: u32, width: u32) -> u64 {
        assert!(offset + width <= 64, "field exceeds parameter word");
        (self.params[index] >> offset) & field_mask(width)
    }
}

const fn field_mask(width: u32) -> u64 {
    if width == 64 {
        u64::MAX
    } else {
        (1u64 << width) - 1
    }
}
