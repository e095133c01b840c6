//! Rule templates
//!
//! One constructor per rule kind. Every call allocates a fresh [`Rule`];
//! nothing here touches the kernel.

use crate::core::error::{Error, Result};
use crate::core::expr::{CmpOp, CtKey, Expr, MetaKey, PayloadBase, TimeUnit, Verdict};
use crate::core::rule::{Rule, RuleKind};
use crate::core::topology::ChainName;
use ipnetwork::IpNetwork;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::BitOr;

/// Interface name field width (`IFNAMSIZ`)
pub const IFNAME_LEN: usize = 16;

/// IP protocol numbers used by the built-in rules
pub const IPPROTO_ICMP: u8 = 1;
pub const IPPROTO_ICMPV6: u8 = 58;

/// Layer 3 family of a match
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
    strum::AsRefStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum IpFamily {
    Ipv4,
    Ipv6,
}

impl IpFamily {
    /// Maps an IP version number (4 or 6).
    ///
    /// # Errors
    ///
    /// Returns `InvalidRuleParameter` for any other version.
    pub fn from_version(version: u8) -> Result<Self> {
        match version {
            4 => Ok(IpFamily::Ipv4),
            6 => Ok(IpFamily::Ipv6),
            other => Err(Error::InvalidRuleParameter(format!(
                "unsupported IP version {other}"
            ))),
        }
    }

    pub const fn version(self) -> u8 {
        match self {
            IpFamily::Ipv4 => 4,
            IpFamily::Ipv6 => 6,
        }
    }

    /// `NFPROTO_*` value loaded by `meta nfproto`
    pub const fn nfproto(self) -> u8 {
        match self {
            IpFamily::Ipv4 => 0x02,
            IpFamily::Ipv6 => 0x0a,
        }
    }

    pub const fn from_nfproto(value: u8) -> Option<Self> {
        match value {
            0x02 => Some(IpFamily::Ipv4),
            0x0a => Some(IpFamily::Ipv6),
            _ => None,
        }
    }

    pub const fn addr_len(self) -> u32 {
        match self {
            IpFamily::Ipv4 => 4,
            IpFamily::Ipv6 => 16,
        }
    }

    /// Source address offset in the network header
    pub const fn saddr_offset(self) -> u32 {
        match self {
            IpFamily::Ipv4 => 12,
            IpFamily::Ipv6 => 8,
        }
    }

    /// Offset of the IPv4 protocol field or the IPv6 next-header field
    pub const fn protocol_offset(self) -> u32 {
        match self {
            IpFamily::Ipv4 => 9,
            IpFamily::Ipv6 => 6,
        }
    }

    /// ICMP flavour of the family
    pub const fn icmp_protocol(self) -> u8 {
        match self {
            IpFamily::Ipv4 => IPPROTO_ICMP,
            IpFamily::Ipv6 => IPPROTO_ICMPV6,
        }
    }
}

/// Which interface a jump rule matches on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum Direction {
    /// `iifname`
    Inbound,
    /// `oifname`
    Outbound,
}

impl Direction {
    pub const fn meta_key(self) -> MetaKey {
        match self {
            Direction::Inbound => MetaKey::IifName,
            Direction::Outbound => MetaKey::OifName,
        }
    }

    pub const fn from_meta_key(key: MetaKey) -> Option<Self> {
        match key {
            MetaKey::IifName => Some(Direction::Inbound),
            MetaKey::OifName => Some(Direction::Outbound),
            _ => None,
        }
    }
}

/// Connection tracking state bitmap, as loaded by `ct state`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct CtState(pub u32);

impl CtState {
    pub const INVALID: CtState = CtState(1);
    pub const ESTABLISHED: CtState = CtState(1 << 1);
    pub const RELATED: CtState = CtState(1 << 2);
    pub const NEW: CtState = CtState(1 << 3);
    pub const UNTRACKED: CtState = CtState(1 << 6);

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn contains(self, other: CtState) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for CtState {
    type Output = CtState;

    fn bitor(self, rhs: CtState) -> CtState {
        CtState(self.0 | rhs.0)
    }
}

impl fmt::Display for CtState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const NAMES: [(CtState, &str); 5] = [
            (CtState::INVALID, "invalid"),
            (CtState::ESTABLISHED, "established"),
            (CtState::RELATED, "related"),
            (CtState::NEW, "new"),
            (CtState::UNTRACKED, "untracked"),
        ];
        let names: Vec<&str> = NAMES
            .iter()
            .filter(|(state, _)| self.contains(*state))
            .map(|(_, name)| *name)
            .collect();
        if names.is_empty() {
            write!(f, "{:#x}", self.0)
        } else {
            write!(f, "{}", names.join(","))
        }
    }
}

/// Packet rate limit (`limit rate N/unit burst B packets`)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimit {
    pub rate: u64,
    pub unit: TimeUnit,
    pub burst: u32,
}

impl Default for RateLimit {
    fn default() -> Self {
        Self {
            rate: 10,
            unit: TimeUnit::Second,
            burst: 5,
        }
    }
}

/// Sets the top `prefix_len` bits, MSB first, over a 4 or 16 byte field.
///
/// # Errors
///
/// Returns `InvalidRuleParameter` for an IP version other than 4 or 6, or a
/// prefix longer than the address.
pub fn generate_bitmask(prefix_len: u32, version: u8) -> Result<Vec<u8>> {
    let family = IpFamily::from_version(version)?;
    let width = family.addr_len();
    if prefix_len > width * 8 {
        return Err(Error::InvalidRuleParameter(format!(
            "prefix length {prefix_len} exceeds {} bits",
            width * 8
        )));
    }
    let mut mask = vec![0u8; width as usize];
    for bit in 0..prefix_len as usize {
        mask[bit / 8] |= 1 << (7 - bit % 8);
    }
    Ok(mask)
}

/// Counts contiguous set bits from the top of a mask.
pub fn prefix_len_from_mask(mask: &[u8]) -> u32 {
    let mut count = 0;
    for byte in mask {
        if *byte == 0xff {
            count += 8;
            continue;
        }
        return count + byte.leading_ones();
    }
    count
}

/// Right-pads an interface name with NUL bytes to the kernel field width.
///
/// # Errors
///
/// Returns `InvalidRuleParameter` for empty names or names that leave no
/// room for the terminating NUL.
pub fn pad_ifname(name: &str) -> Result<[u8; IFNAME_LEN]> {
    let bytes = name.as_bytes();
    if bytes.is_empty() || bytes.len() >= IFNAME_LEN {
        return Err(Error::InvalidRuleParameter(format!(
            "interface name '{name}' must be 1-{} bytes",
            IFNAME_LEN - 1
        )));
    }
    let mut buf = [0u8; IFNAME_LEN];
    buf[..bytes.len()].copy_from_slice(bytes);
    Ok(buf)
}

/// Strips the NUL padding from an interface name operand.
pub fn unpad_ifname(data: &[u8]) -> String {
    let end = data.iter().position(|b| *b == 0).unwrap_or(data.len());
    String::from_utf8_lossy(&data[..end]).into_owned()
}

/// Parses a CIDR and normalizes it to its network address.
///
/// # Errors
///
/// Returns `InvalidAddress` if the string does not parse.
pub fn parse_cidr(cidr: &str) -> Result<IpNetwork> {
    let net: IpNetwork = cidr
        .trim()
        .parse()
        .map_err(|e| Error::InvalidAddress(format!("{cidr}: {e}")))?;
    IpNetwork::new(net.network(), net.prefix())
        .map_err(|e| Error::InvalidAddress(format!("{cidr}: {e}")))
}

fn meta(key: MetaKey) -> Expr {
    Expr::Meta { key }
}

fn cmp_eq(data: impl Into<Vec<u8>>) -> Expr {
    Expr::Cmp {
        op: CmpOp::Eq,
        data: data.into(),
    }
}

fn network_payload(offset: u32, len: u32) -> Expr {
    Expr::Payload {
        base: PayloadBase::Network,
        offset,
        len,
    }
}

/// `meta nfproto <family>` prefix shared by the L3 matches.
fn family_match(family: IpFamily) -> [Expr; 2] {
    [meta(MetaKey::NfProto), cmp_eq(vec![family.nfproto()])]
}

/// `ip saddr <net>` / `ip6 saddr <net>` with the given verdict.
///
/// # Errors
///
/// Returns `InvalidAddress` if `cidr` does not parse.
pub fn build_prefix_rule(chain: ChainName, cidr: &str, verdict: Verdict) -> Result<Rule> {
    let net = parse_cidr(cidr)?;
    let (family, addr) = match net {
        IpNetwork::V4(v4) => (IpFamily::Ipv4, v4.network().octets().to_vec()),
        IpNetwork::V6(v6) => (IpFamily::Ipv6, v6.network().octets().to_vec()),
    };
    let mask = generate_bitmask(u32::from(net.prefix()), family.version())?;

    let [m, c] = family_match(family);
    let exprs = vec![
        m,
        c,
        network_payload(family.saddr_offset(), family.addr_len()),
        Expr::Bitwise {
            mask,
            xor: vec![0u8; family.addr_len() as usize],
        },
        cmp_eq(addr),
        Expr::Verdict(verdict),
    ];
    Ok(Rule::new(chain, RuleKind::Prefix, exprs))
}

/// `ct state <state> <verdict>`
pub fn build_conntrack_rule(chain: ChainName, state: CtState, verdict: Verdict) -> Rule {
    let exprs = vec![
        Expr::Ct { key: CtKey::State },
        Expr::Bitwise {
            // ct state is a host-order register
            mask: state.bits().to_ne_bytes().to_vec(),
            xor: vec![0u8; 4],
        },
        Expr::Cmp {
            op: CmpOp::Neq,
            data: vec![0u8; 4],
        },
        Expr::Verdict(verdict),
    ];
    Rule::new(chain, RuleKind::ConnTrack, exprs)
}

/// Bare verdict, terminating the chain
pub fn build_default_policy_rule(chain: ChainName, verdict: Verdict) -> Rule {
    Rule::new(chain, RuleKind::DefaultPolicy, vec![Expr::Verdict(verdict)])
}

/// `iifname|oifname <name> jump <target>`
///
/// # Errors
///
/// Returns `InvalidRuleParameter` if the interface name does not fit.
pub fn build_interface_jump_rule(
    chain: ChainName,
    direction: Direction,
    ifname: &str,
    target: ChainName,
) -> Result<Rule> {
    let padded = pad_ifname(ifname)?;
    let exprs = vec![
        meta(direction.meta_key()),
        cmp_eq(padded.to_vec()),
        Expr::Verdict(Verdict::Jump(target.as_str().to_string())),
    ];
    Ok(Rule::new(chain, RuleKind::InterfaceJump, exprs))
}

/// `meta nfproto <family> <ip protocol | ip6 nexthdr> <proto> <verdict>`
pub fn build_protocol_rule(
    chain: ChainName,
    family: IpFamily,
    protocol: u8,
    verdict: Verdict,
) -> Rule {
    let [m, c] = family_match(family);
    let exprs = vec![
        m,
        c,
        network_payload(family.protocol_offset(), 1),
        cmp_eq(vec![protocol]),
        Expr::Verdict(verdict),
    ];
    Rule::new(chain, RuleKind::Protocol, exprs)
}

/// Protocol match followed by a packet rate limiter
pub fn build_rate_limit_rule(
    chain: ChainName,
    family: IpFamily,
    protocol: u8,
    limit: RateLimit,
    verdict: Verdict,
) -> Rule {
    let [m, c] = family_match(family);
    let exprs = vec![
        m,
        c,
        network_payload(family.protocol_offset(), 1),
        cmp_eq(vec![protocol]),
        Expr::Limit {
            rate: limit.rate,
            unit: limit.unit,
            burst: limit.burst,
            over: false,
        },
        Expr::Verdict(verdict),
    ];
    Rule::new(chain, RuleKind::RateLimit, exprs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_bitmask_ipv4_24() {
        assert_eq!(
            generate_bitmask(24, 4).unwrap(),
            vec![0xff, 0xff, 0xff, 0x00]
        );
    }

    #[test]
    fn test_bitmask_ipv6_64() {
        let mut expected = vec![0xff; 8];
        expected.extend_from_slice(&[0x00; 8]);
        assert_eq!(generate_bitmask(64, 6).unwrap(), expected);
    }

    #[test]
    fn test_bitmask_partial_byte() {
        assert_eq!(generate_bitmask(20, 4).unwrap(), vec![0xff, 0xff, 0xf0, 0]);
        assert_eq!(generate_bitmask(0, 4).unwrap(), vec![0; 4]);
    }

    #[test]
    fn test_bitmask_rejects_bad_input() {
        assert!(matches!(
            generate_bitmask(24, 5),
            Err(Error::InvalidRuleParameter(_))
        ));
        assert!(matches!(
            generate_bitmask(33, 4),
            Err(Error::InvalidRuleParameter(_))
        ));
    }

    #[test]
    fn test_prefix_len_stops_at_first_gap() {
        assert_eq!(prefix_len_from_mask(&[0xff, 0xff, 0xff, 0x00]), 24);
        assert_eq!(prefix_len_from_mask(&[0xff, 0xfe, 0xff, 0xff]), 15);
        assert_eq!(prefix_len_from_mask(&[0xff; 16]), 128);
    }

    #[test]
    fn test_pad_ifname() {
        let padded = pad_ifname("eth0").unwrap();
        assert_eq!(&padded[..4], b"eth0");
        assert!(padded[4..].iter().all(|b| *b == 0));
        assert_eq!(unpad_ifname(&padded), "eth0");
        assert!(pad_ifname("").is_err());
        assert!(pad_ifname("sixteen-chars-xx").is_err());
    }

    #[test]
    fn test_prefix_rule_normalizes_host_bits() {
        let rule = build_prefix_rule(ChainName::PairUntrustToTrust, "10.1.2.3/24", Verdict::Accept)
            .unwrap();
        assert_eq!(rule.exprs.len(), 6);
        assert_eq!(
            rule.exprs[4],
            Expr::Cmp {
                op: CmpOp::Eq,
                data: vec![10, 1, 2, 0],
            }
        );
        assert_eq!(
            rule.exprs[2],
            Expr::Payload {
                base: PayloadBase::Network,
                offset: 12,
                len: 4,
            }
        );
    }

    #[test]
    fn test_prefix_rule_ipv6_layout() {
        let rule =
            build_prefix_rule(ChainName::PairTrustToUntrust, "2001:db8::/64", Verdict::Accept)
                .unwrap();
        assert_eq!(rule.exprs[1], cmp_eq(vec![0x0a]));
        assert_eq!(rule.exprs[2], network_payload(8, 16));
    }

    #[test]
    fn test_prefix_rule_rejects_garbage() {
        let err = build_prefix_rule(ChainName::PairTrustToUntrust, "not-a-cidr", Verdict::Accept)
            .unwrap_err();
        assert!(matches!(err, Error::InvalidAddress(_)));
    }

    #[test]
    fn test_protocol_rule_offsets() {
        let v4 = build_protocol_rule(ChainName::Input, IpFamily::Ipv4, 1, Verdict::Return);
        assert_eq!(v4.exprs[2], network_payload(9, 1));
        let v6 = build_protocol_rule(ChainName::Input, IpFamily::Ipv6, 58, Verdict::Return);
        assert_eq!(v6.exprs[2], network_payload(6, 1));
        assert_eq!(v6.exprs[3], cmp_eq(vec![0x3a]));
    }

    #[test]
    fn test_conntrack_mask_is_host_order() {
        let rule = build_conntrack_rule(
            ChainName::Input,
            CtState::ESTABLISHED | CtState::RELATED,
            Verdict::Accept,
        );
        match &rule.exprs[1] {
            Expr::Bitwise { mask, .. } => assert_eq!(mask, &6u32.to_ne_bytes().to_vec()),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_builders_do_not_share_state() {
        let a = build_interface_jump_rule(
            ChainName::Forward,
            Direction::Outbound,
            "eth-a",
            ChainName::ZoneTrust,
        )
        .unwrap();
        let b = build_interface_jump_rule(
            ChainName::Forward,
            Direction::Outbound,
            "eth-b",
            ChainName::ZoneUntrust,
        )
        .unwrap();
        assert_ne!(a.exprs, b.exprs);
        assert_eq!(unpad_ifname(match &a.exprs[1] {
            Expr::Cmp { data, .. } => data,
            _ => unreachable!(),
        }), "eth-a");
    }

    #[test]
    fn test_ct_state_display() {
        assert_eq!(
            (CtState::ESTABLISHED | CtState::RELATED).to_string(),
            "established,related"
        );
    }

    proptest! {
        #[test]
        fn test_mask_prefix_roundtrip_v4(len in 0u32..=32) {
            let mask = generate_bitmask(len, 4).unwrap();
            prop_assert_eq!(prefix_len_from_mask(&mask), len);
        }

        #[test]
        fn test_mask_prefix_roundtrip_v6(len in 0u32..=128) {
            let mask = generate_bitmask(len, 6).unwrap();
            prop_assert_eq!(mask.len(), 16);
            prop_assert_eq!(prefix_len_from_mask(&mask), len);
        }

        #[test]
        fn test_parse_cidr_is_idempotent(a in any::<u32>(), len in 0u8..=32) {
            let cidr = format!("{}/{}", std::net::Ipv4Addr::from(a), len);
            let once = parse_cidr(&cidr).unwrap();
            let twice = parse_cidr(&once.to_string()).unwrap();
            prop_assert_eq!(once, twice);
        }
    }
}
