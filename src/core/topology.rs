//! Fixed chain graph of the zone firewall
//!
//! ```text
//! Forward ──oifname──▶ ZONE_<dst> ──iifname──▶ PAIR_<src>_TO_<dst>
//! Input   (rate limits, established/related accept)
//! ```
//!
//! Same-zone pair chains always return. Cross-zone pair chains carry the
//! policy of the destination zone plus its prefix allow-list.

use crate::core::expr::Verdict;
use crate::core::model::{ZoneName, ZonePolicy};
use crate::core::policy::build_ruleset;
use crate::core::rule::Rule;
use crate::core::templates::{
    CtState, Direction, IpFamily, RateLimit, build_conntrack_rule, build_default_policy_rule,
    build_rate_limit_rule,
};
use serde::{Deserialize, Serialize};
use strum::IntoEnumIterator;

/// Name of the `inet` table holding every chain
pub const TABLE_NAME: &str = "filter";

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
    strum::AsRefStr,
)]
pub enum ChainName {
    #[strum(serialize = "Input")]
    Input,
    #[strum(serialize = "Forward")]
    Forward,
    #[strum(serialize = "ZONE_TRUST")]
    ZoneTrust,
    #[strum(serialize = "ZONE_UNTRUST")]
    ZoneUntrust,
    #[strum(serialize = "PAIR_TRUST_TO_UNTRUST")]
    PairTrustToUntrust,
    #[strum(serialize = "PAIR_UNTRUST_TO_TRUST")]
    PairUntrustToTrust,
    #[strum(serialize = "PAIR_TRUST_TO_TRUST")]
    PairTrustToTrust,
    #[strum(serialize = "PAIR_UNTRUST_TO_UNTRUST")]
    PairUntrustToUntrust,
}

impl ChainName {
    pub const fn as_str(self) -> &'static str {
        match self {
            ChainName::Input => "Input",
            ChainName::Forward => "Forward",
            ChainName::ZoneTrust => "ZONE_TRUST",
            ChainName::ZoneUntrust => "ZONE_UNTRUST",
            ChainName::PairTrustToUntrust => "PAIR_TRUST_TO_UNTRUST",
            ChainName::PairUntrustToTrust => "PAIR_UNTRUST_TO_TRUST",
            ChainName::PairTrustToTrust => "PAIR_TRUST_TO_TRUST",
            ChainName::PairUntrustToUntrust => "PAIR_UNTRUST_TO_UNTRUST",
        }
    }

    /// Chain traffic destined to `zone` enters from Forward
    pub const fn zone(zone: ZoneName) -> Self {
        match zone {
            ZoneName::Trust => ChainName::ZoneTrust,
            ZoneName::Untrust => ChainName::ZoneUntrust,
        }
    }

    pub const fn pair(from: ZoneName, to: ZoneName) -> Self {
        match (from, to) {
            (ZoneName::Trust, ZoneName::Trust) => ChainName::PairTrustToTrust,
            (ZoneName::Trust, ZoneName::Untrust) => ChainName::PairTrustToUntrust,
            (ZoneName::Untrust, ZoneName::Trust) => ChainName::PairUntrustToTrust,
            (ZoneName::Untrust, ZoneName::Untrust) => ChainName::PairUntrustToUntrust,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Hook {
    Input,
    Forward,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainPolicy {
    Drop,
    Accept,
}

/// Hook registration of a base chain
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BaseChain {
    pub hook: Hook,
    pub priority: i32,
    pub policy: ChainPolicy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChainSpec {
    pub name: ChainName,
    /// `None` for regular (jump target) chains
    pub base: Option<BaseChain>,
}

/// One interface jump a zone membership needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JumpEdge {
    pub chain: ChainName,
    pub direction: Direction,
    pub target: ChainName,
}

/// The chain set of one namespace
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topology {
    chains: Vec<ChainSpec>,
    icmp_limit: RateLimit,
}

impl Topology {
    /// Input and Forward hooked at filter priority with accept policy, plus
    /// the two zone chains and four pair chains.
    pub fn standard() -> Self {
        let chains = ChainName::iter()
            .map(|name| {
                let hook = match name {
                    ChainName::Input => Some(Hook::Input),
                    ChainName::Forward => Some(Hook::Forward),
                    _ => None,
                };
                ChainSpec {
                    name,
                    base: hook.map(|hook| BaseChain {
                        hook,
                        priority: 0,
                        policy: ChainPolicy::Accept,
                    }),
                }
            })
            .collect();
        Self {
            chains,
            icmp_limit: RateLimit::default(),
        }
    }

    /// Replaces the rate applied to ICMP and ICMPv6 in Input.
    #[must_use]
    pub fn with_icmp_limit(mut self, limit: RateLimit) -> Self {
        self.icmp_limit = limit;
        self
    }

    pub fn chains(&self) -> &[ChainSpec] {
        &self.chains
    }

    /// Pair chain holding the policy and allow-list of `zone`, i.e. the chain
    /// for traffic coming from the other zone into it.
    pub const fn policy_chain(zone: ZoneName) -> ChainName {
        ChainName::pair(zone.peer(), zone)
    }

    /// Jump rules needed for an interface owned by `zone`: Forward sends
    /// traffic leaving through it into the zone chain, and each zone chain
    /// sends traffic arriving on it into the pair chain starting at `zone`.
    pub fn jump_path(zone: ZoneName) -> [JumpEdge; 3] {
        [
            JumpEdge {
                chain: ChainName::Forward,
                direction: Direction::Outbound,
                target: ChainName::zone(zone),
            },
            JumpEdge {
                chain: ChainName::ZoneTrust,
                direction: Direction::Inbound,
                target: ChainName::pair(zone, ZoneName::Trust),
            },
            JumpEdge {
                chain: ChainName::ZoneUntrust,
                direction: Direction::Inbound,
                target: ChainName::pair(zone, ZoneName::Untrust),
            },
        ]
    }

    /// Jump target used for `zone` interfaces inside `chain`, if `chain` is
    /// on its jump path.
    pub fn jump_target(zone: ZoneName, chain: ChainName) -> Option<ChainName> {
        Self::jump_path(zone)
            .into_iter()
            .find(|edge| edge.chain == chain)
            .map(|edge| edge.target)
    }

    /// Rules installed right after the chains are created, in install order.
    pub fn bootstrap_rules(&self, family: IpFamily) -> Vec<Rule> {
        let mut rules = Vec::new();
        for spec in &self.chains {
            match spec.name {
                ChainName::Input => {
                    for rl_family in [IpFamily::Ipv6, IpFamily::Ipv4] {
                        rules.push(build_rate_limit_rule(
                            ChainName::Input,
                            rl_family,
                            rl_family.icmp_protocol(),
                            self.icmp_limit,
                            Verdict::Accept,
                        ));
                    }
                    rules.push(build_conntrack_rule(
                        ChainName::Input,
                        CtState::ESTABLISHED | CtState::RELATED,
                        Verdict::Accept,
                    ));
                }
                ChainName::PairTrustToTrust | ChainName::PairUntrustToUntrust => {
                    rules.push(build_default_policy_rule(spec.name, Verdict::Return));
                }
                ChainName::PairUntrustToTrust => {
                    rules.extend(build_ruleset(
                        ZonePolicy::EstablishedOnly,
                        spec.name,
                        family,
                    ));
                }
                ChainName::PairTrustToUntrust => {
                    rules.extend(build_ruleset(
                        ZonePolicy::AllPermit,
                        spec.name,
                        family,
                    ));
                }
                ChainName::Forward | ChainName::ZoneTrust | ChainName::ZoneUntrust => {}
            }
        }
        rules
    }
}
