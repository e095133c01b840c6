//! Zone policy rulesets
//!
//! A policy is installed into a pair chain as a fixed, ordered rule list.
//! The default verdict always comes last, otherwise it would short-circuit
//! the matches before it.

use crate::core::expr::Verdict;
use crate::core::model::ZonePolicy;
use crate::core::rule::Rule;
use crate::core::templates::{
    CtState, IpFamily, build_conntrack_rule, build_default_policy_rule, build_protocol_rule,
};
use crate::core::topology::ChainName;

/// Ordered rules implementing `policy` in `chain`.
///
/// - established-only: ICMP of the session family returns, established and
///   related flows return, everything else drops
/// - all-permit: everything returns
pub fn build_ruleset(policy: ZonePolicy, chain: ChainName, family: IpFamily) -> Vec<Rule> {
    match policy {
        ZonePolicy::EstablishedOnly => vec![
            build_protocol_rule(chain, family, family.icmp_protocol(), Verdict::Return),
            build_conntrack_rule(chain, CtState::ESTABLISHED | CtState::RELATED, Verdict::Return),
            build_default_policy_rule(chain, Verdict::Drop),
        ],
        ZonePolicy::AllPermit => vec![build_default_policy_rule(chain, Verdict::Return)],
    }
}

/// Policy implied by the verdict of a chain's default rule.
///
/// Anything but drop or return is not a policy this crate installs.
pub fn policy_from_verdict(verdict: &Verdict) -> Option<ZonePolicy> {
    match verdict {
        Verdict::Drop => Some(ZonePolicy::EstablishedOnly),
        Verdict::Return => Some(ZonePolicy::AllPermit),
        _ => None,
    }
}
