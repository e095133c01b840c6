//! Rules, rule kinds, and classification of installed rules
//!
//! The kernel only stores expression lists. Each rule kind written by this
//! crate has a unique expression-type sequence ([`SIGNATURES`]), which is how
//! read-back tells kinds apart. Rules we write additionally carry their kind
//! as a comment in the rule userdata; when present it must agree with the
//! signature.

use crate::core::error::{Error, Result};
use crate::core::expr::{CmpOp, CtKey, Expr, ExprType, MetaKey, PayloadBase, Verdict};
use crate::core::templates::{
    CtState, Direction, IpFamily, RateLimit, prefix_len_from_mask, unpad_ifname,
};
use crate::core::topology::ChainName;
use ipnetwork::IpNetwork;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

/// Comment TLV type in nftables rule userdata (`NFTNL_UDATA_RULE_COMMENT`)
const UDATA_RULE_COMMENT: u8 = 0;
const TAG_PREFIX: &str = "zonewall:";

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
    strum::AsRefStr,
)]
#[strum(serialize_all = "kebab-case")]
pub enum RuleKind {
    InterfaceJump,
    Prefix,
    ConnTrack,
    Protocol,
    DefaultPolicy,
    RateLimit,
}

/// Expression-type sequence of every rule kind. Must stay injective.
pub const SIGNATURES: &[(RuleKind, &[ExprType])] = &[
    (
        RuleKind::InterfaceJump,
        &[ExprType::Meta, ExprType::Cmp, ExprType::Verdict],
    ),
    (
        RuleKind::ConnTrack,
        &[ExprType::Ct, ExprType::Bitwise, ExprType::Cmp, ExprType::Verdict],
    ),
    (
        RuleKind::Protocol,
        &[
            ExprType::Meta,
            ExprType::Cmp,
            ExprType::Payload,
            ExprType::Cmp,
            ExprType::Verdict,
        ],
    ),
    (
        RuleKind::Prefix,
        &[
            ExprType::Meta,
            ExprType::Cmp,
            ExprType::Payload,
            ExprType::Bitwise,
            ExprType::Cmp,
            ExprType::Verdict,
        ],
    ),
    (
        RuleKind::RateLimit,
        &[
            ExprType::Meta,
            ExprType::Cmp,
            ExprType::Payload,
            ExprType::Cmp,
            ExprType::Limit,
            ExprType::Verdict,
        ],
    ),
    (RuleKind::DefaultPolicy, &[ExprType::Verdict]),
];

impl RuleKind {
    pub fn signature(self) -> &'static [ExprType] {
        SIGNATURES
            .iter()
            .find(|(kind, _)| *kind == self)
            .map(|(_, sig)| *sig)
            .unwrap_or(&[])
    }

    /// Kind whose signature matches `exprs` exactly
    pub fn from_exprs(exprs: &[Expr]) -> Option<Self> {
        let types: Vec<ExprType> = exprs.iter().map(Expr::expr_type).collect();
        SIGNATURES
            .iter()
            .find(|(_, sig)| *sig == types.as_slice())
            .map(|(kind, _)| *kind)
    }
}

/// A rule as written to or read from one chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rule {
    pub chain: ChainName,
    /// Kernel handle; only set on rules read back from a chain
    pub handle: Option<u64>,
    pub exprs: Vec<Expr>,
    /// Kind recorded in the rule userdata
    pub tag: Option<RuleKind>,
}

impl Rule {
    pub fn new(chain: ChainName, kind: RuleKind, exprs: Vec<Expr>) -> Self {
        Self {
            chain,
            handle: None,
            exprs,
            tag: Some(kind),
        }
    }

    /// Userdata blob carrying the kind tag, empty for untagged rules.
    pub fn userdata(&self) -> Vec<u8> {
        let Some(kind) = self.tag else {
            return Vec::new();
        };
        let comment = format!("{TAG_PREFIX}{kind}\0");
        let mut out = Vec::with_capacity(comment.len() + 2);
        out.push(UDATA_RULE_COMMENT);
        out.push(comment.len() as u8);
        out.extend_from_slice(comment.as_bytes());
        out
    }

    /// Recovers the kind tag from a userdata blob, ignoring foreign comments.
    pub fn tag_from_userdata(udata: &[u8]) -> Option<RuleKind> {
        let mut offset = 0usize;
        while offset + 2 <= udata.len() {
            let kind = udata[offset];
            let len = udata[offset + 1] as usize;
            let value = udata.get(offset + 2..offset + 2 + len)?;
            if kind == UDATA_RULE_COMMENT {
                let end = value.iter().position(|b| *b == 0).unwrap_or(value.len());
                let text = std::str::from_utf8(&value[..end]).ok()?;
                return text
                    .strip_prefix(TAG_PREFIX)
                    .and_then(|k| RuleKind::from_str(k).ok());
            }
            offset += 2 + len;
        }
        None
    }

    /// Resolves the rule to exactly one kind and extracts its parameters.
    ///
    /// # Errors
    ///
    /// Returns `ClassificationAmbiguity` when the expression sequence matches
    /// no known signature, disagrees with the userdata tag, or carries values
    /// this crate never writes.
    pub fn classify(&self) -> Result<Decoded> {
        let Some(kind) = RuleKind::from_exprs(&self.exprs) else {
            let sig: Vec<String> = self.exprs.iter().map(|e| e.expr_type().to_string()).collect();
            return Err(self.ambiguity(format!("unknown signature [{}]", sig.join(", "))));
        };
        if let Some(tag) = self.tag
            && tag != kind
        {
            return Err(self.ambiguity(format!("tagged {tag} but shaped like {kind}")));
        }
        decode(kind, &self.exprs).ok_or_else(|| self.ambiguity(format!("malformed {kind} rule")))
    }

    fn ambiguity(&self, reason: String) -> Error {
        Error::ClassificationAmbiguity {
            chain: self.chain.to_string(),
            handle: self.handle,
            reason,
        }
    }
}

/// Semantic content of a classified rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decoded {
    InterfaceJump {
        direction: Direction,
        ifname: String,
        target: String,
    },
    Prefix {
        network: IpNetwork,
        verdict: Verdict,
    },
    ConnTrack {
        state: CtState,
        verdict: Verdict,
    },
    Protocol {
        family: IpFamily,
        protocol: u8,
        verdict: Verdict,
    },
    DefaultPolicy {
        verdict: Verdict,
    },
    RateLimit {
        family: IpFamily,
        protocol: u8,
        limit: RateLimit,
        verdict: Verdict,
    },
}

impl Decoded {
    pub fn kind(&self) -> RuleKind {
        match self {
            Decoded::InterfaceJump { .. } => RuleKind::InterfaceJump,
            Decoded::Prefix { .. } => RuleKind::Prefix,
            Decoded::ConnTrack { .. } => RuleKind::ConnTrack,
            Decoded::Protocol { .. } => RuleKind::Protocol,
            Decoded::DefaultPolicy { .. } => RuleKind::DefaultPolicy,
            Decoded::RateLimit { .. } => RuleKind::RateLimit,
        }
    }
}

fn family_of(meta: &Expr, cmp: &Expr) -> Option<IpFamily> {
    match (meta, cmp) {
        (
            Expr::Meta {
                key: MetaKey::NfProto,
            },
            Expr::Cmp {
                op: CmpOp::Eq,
                data,
            },
        ) if data.len() == 1 => IpFamily::from_nfproto(data[0]),
        _ => None,
    }
}

/// `payload` at the family's protocol offset followed by `cmp eq <proto>`
fn protocol_of(family: IpFamily, payload: &Expr, cmp: &Expr) -> Option<u8> {
    match (payload, cmp) {
        (
            Expr::Payload {
                base: PayloadBase::Network,
                offset,
                len: 1,
            },
            Expr::Cmp {
                op: CmpOp::Eq,
                data,
            },
        ) if *offset == family.protocol_offset() && data.len() == 1 => Some(data[0]),
        _ => None,
    }
}

fn addr_from_bytes(bytes: &[u8]) -> Option<IpAddr> {
    match bytes.len() {
        4 => {
            let octets: [u8; 4] = bytes.try_into().ok()?;
            Some(IpAddr::V4(Ipv4Addr::from(octets)))
        }
        16 => {
            let octets: [u8; 16] = bytes.try_into().ok()?;
            Some(IpAddr::V6(Ipv6Addr::from(octets)))
        }
        _ => None,
    }
}

fn decode(kind: RuleKind, exprs: &[Expr]) -> Option<Decoded> {
    match (kind, exprs) {
        (
            RuleKind::InterfaceJump,
            [Expr::Meta { key }, Expr::Cmp { op: CmpOp::Eq, data }, Expr::Verdict(v)],
        ) => Some(Decoded::InterfaceJump {
            direction: Direction::from_meta_key(*key)?,
            ifname: unpad_ifname(data),
            target: v.chain()?.to_string(),
        }),
        (
            RuleKind::Prefix,
            [m, c, Expr::Payload { offset, len, .. }, Expr::Bitwise { mask, .. }, Expr::Cmp { op: CmpOp::Eq, data }, Expr::Verdict(v)],
        ) => {
            let family = family_of(m, c)?;
            if *offset != family.saddr_offset() || *len != family.addr_len() {
                return None;
            }
            let addr = addr_from_bytes(data)?;
            let prefix = prefix_len_from_mask(mask);
            Some(Decoded::Prefix {
                network: IpNetwork::new(addr, u8::try_from(prefix).ok()?).ok()?,
                verdict: v.clone(),
            })
        }
        (
            RuleKind::ConnTrack,
            [Expr::Ct { key: CtKey::State }, Expr::Bitwise { mask, xor }, Expr::Cmp { op: CmpOp::Neq, data }, Expr::Verdict(v)],
        ) => {
            // `ct state & mask != 0`; any other comparison is someone else's rule
            if *data != [0u8; 4] || xor.iter().any(|b| *b != 0) {
                return None;
            }
            let bytes: [u8; 4] = mask.as_slice().try_into().ok()?;
            Some(Decoded::ConnTrack {
                state: CtState(u32::from_ne_bytes(bytes)),
                verdict: v.clone(),
            })
        }
        (RuleKind::Protocol, [m, c, p, pc, Expr::Verdict(v)]) => {
            let family = family_of(m, c)?;
            Some(Decoded::Protocol {
                family,
                protocol: protocol_of(family, p, pc)?,
                verdict: v.clone(),
            })
        }
        (
            RuleKind::RateLimit,
            [m, c, p, pc, Expr::Limit { rate, unit, burst, over: false }, Expr::Verdict(v)],
        ) => {
            let family = family_of(m, c)?;
            Some(Decoded::RateLimit {
                family,
                protocol: protocol_of(family, p, pc)?,
                limit: RateLimit {
                    rate: *rate,
                    unit: *unit,
                    burst: *burst,
                },
                verdict: v.clone(),
            })
        }
        (RuleKind::DefaultPolicy, [Expr::Verdict(v)]) => Some(Decoded::DefaultPolicy {
            verdict: v.clone(),
        }),
        _ => None,
    }
}
