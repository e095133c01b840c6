//! Match and action primitives for nf_tables rules
//!
//! Every rule the engine writes is an ordered list of [`Expr`] values. All
//! matches load into the first data register and compare against it, so the
//! register operands are implied rather than stored. The kernel transport
//! maps these onto `rustables` expressions; anything it reads back that does
//! not fit one of these shapes comes back as [`Expr::Other`] and makes the
//! surrounding rule unclassifiable.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Keys for the `meta` expression.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetaKey {
    /// Input interface name, 16 bytes NUL padded
    IifName,
    /// Output interface name, 16 bytes NUL padded
    OifName,
    /// Layer 3 protocol of the packet (`NFPROTO_*`), one byte
    NfProto,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    Neq,
}

/// Header a `payload` expression reads relative to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadBase {
    LinkLayer,
    Network,
    Transport,
}

impl PayloadBase {
    /// `NFT_PAYLOAD_*_HEADER`
    pub const fn code(self) -> u32 {
        match self {
            PayloadBase::LinkLayer => 0,
            PayloadBase::Network => 1,
            PayloadBase::Transport => 2,
        }
    }

    pub const fn from_code(code: u32) -> Option<Self> {
        match code {
            0 => Some(PayloadBase::LinkLayer),
            1 => Some(PayloadBase::Network),
            2 => Some(PayloadBase::Transport),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CtKey {
    State,
}

/// Time unit for rate limiters
#[derive(
    Debug,
    Clone,
    Copy,
    Serialize,
    Deserialize,
    PartialEq,
    Eq,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
    strum::AsRefStr,
)]
#[serde(rename_all = "lowercase")]
pub enum TimeUnit {
    #[strum(serialize = "second")]
    Second,
    #[strum(serialize = "minute")]
    Minute,
    #[strum(serialize = "hour")]
    Hour,
    #[strum(serialize = "day")]
    Day,
}

impl TimeUnit {
    /// Length of the unit in seconds, as the kernel stores it
    pub const fn seconds(self) -> u64 {
        match self {
            TimeUnit::Second => 1,
            TimeUnit::Minute => 60,
            TimeUnit::Hour => 3_600,
            TimeUnit::Day => 86_400,
        }
    }

    pub const fn from_seconds(secs: u64) -> Option<Self> {
        match secs {
            1 => Some(TimeUnit::Second),
            60 => Some(TimeUnit::Minute),
            3_600 => Some(TimeUnit::Hour),
            86_400 => Some(TimeUnit::Day),
            _ => None,
        }
    }
}

/// Terminal or deferring action of a rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Accept,
    Drop,
    /// Fall back to the calling chain
    Return,
    Continue,
    Break,
    Jump(String),
    Goto(String),
}

impl Verdict {
    /// Target chain for jump and goto verdicts
    pub fn chain(&self) -> Option<&str> {
        match self {
            Verdict::Jump(chain) | Verdict::Goto(chain) => Some(chain),
            _ => None,
        }
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Verdict::Accept => write!(f, "accept"),
            Verdict::Drop => write!(f, "drop"),
            Verdict::Return => write!(f, "return"),
            Verdict::Continue => write!(f, "continue"),
            Verdict::Break => write!(f, "break"),
            Verdict::Jump(chain) => write!(f, "jump {chain}"),
            Verdict::Goto(chain) => write!(f, "goto {chain}"),
        }
    }
}

/// Expression kind, the unit of a rule's structural signature.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
pub enum ExprType {
    Meta,
    Cmp,
    Payload,
    Bitwise,
    Ct,
    Limit,
    Verdict,
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Expr {
    Meta {
        key: MetaKey,
    },
    Cmp {
        op: CmpOp,
        data: Vec<u8>,
    },
    Payload {
        base: PayloadBase,
        offset: u32,
        len: u32,
    },
    /// `reg = (reg & mask) ^ xor`, over `mask.len()` bytes
    Bitwise {
        mask: Vec<u8>,
        xor: Vec<u8>,
    },
    Ct {
        key: CtKey,
    },
    Limit {
        rate: u64,
        unit: TimeUnit,
        burst: u32,
        over: bool,
    },
    Verdict(Verdict),
    /// Anything this crate does not write. Only produced when reading back.
    Other(String),
}

impl Expr {
    pub fn expr_type(&self) -> ExprType {
        match self {
            Expr::Meta { .. } => ExprType::Meta,
            Expr::Cmp { .. } => ExprType::Cmp,
            Expr::Payload { .. } => ExprType::Payload,
            Expr::Bitwise { .. } => ExprType::Bitwise,
            Expr::Ct { .. } => ExprType::Ct,
            Expr::Limit { .. } => ExprType::Limit,
            Expr::Verdict(_) => ExprType::Verdict,
            Expr::Other(_) => ExprType::Other,
        }
    }

    /// Kernel expression name
    pub fn name(&self) -> &str {
        match self {
            Expr::Meta { .. } => "meta",
            Expr::Cmp { .. } => "cmp",
            Expr::Payload { .. } => "payload",
            Expr::Bitwise { .. } => "bitwise",
            Expr::Ct { .. } => "ct",
            Expr::Limit { .. } => "limit",
            Expr::Verdict(_) => "immediate",
            Expr::Other(name) => name,
        }
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Meta { key } => write!(f, "meta load {key:?}"),
            Expr::Cmp { op, data } => write!(f, "cmp {op:?} {}", hex(data)),
            Expr::Payload { base, offset, len } => {
                write!(f, "payload load {len}b @ {base:?} + {offset}")
            }
            Expr::Bitwise { mask, .. } => write!(f, "bitwise & {}", hex(mask)),
            Expr::Ct { key } => write!(f, "ct load {key:?}"),
            Expr::Limit {
                rate, unit, burst, ..
            } => write!(f, "limit rate {rate}/{unit} burst {burst}"),
            Expr::Verdict(v) => write!(f, "{v}"),
            Expr::Other(name) => write!(f, "{name} (unknown)"),
        }
    }
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}
