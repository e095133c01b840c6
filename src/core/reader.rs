//! Live-state read-back
//!
//! Every function here only lists rules; none of them queue or flush.
//! Rules that cannot be classified are logged and left out of every set, so
//! a foreign rule can never make a zone look converged.

use crate::core::backend::RulesetBackend;
use crate::core::error::{Error, Result};
use crate::core::expr::Verdict;
use crate::core::model::{ObservedZone, ZoneName, ZonePolicy};
use crate::core::policy::policy_from_verdict;
use crate::core::rule::{Decoded, Rule};
use crate::core::topology::{ChainName, Topology};
use std::collections::BTreeSet;
use tracing::{debug, warn};

/// A classified rule together with its kernel handle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Installed {
    pub handle: Option<u64>,
    pub decoded: Decoded,
}

/// Lists `chain` and classifies each rule. Ambiguous rules are returned
/// separately so callers that own the whole chain can purge them.
pub fn classify_chain<B: RulesetBackend + ?Sized>(
    backend: &mut B,
    chain: ChainName,
) -> Result<(Vec<Installed>, Vec<Rule>)> {
    let mut known = Vec::new();
    let mut unknown = Vec::new();
    for rule in backend.get_rules(chain)? {
        match rule.classify() {
            Ok(decoded) => known.push(Installed {
                handle: rule.handle,
                decoded,
            }),
            Err(e) => {
                warn!("Skipping rule: {}", e);
                unknown.push(rule);
            }
        }
    }
    Ok((known, unknown))
}

/// Interface jump rules in `chain` that belong to `zone`, as
/// `(ifname, handle)`.
///
/// A jump counts for `zone` only if it targets the chain `zone` interfaces
/// jump to from `chain`.
///
/// # Errors
///
/// `Internal` if `chain` is not on the jump path of `zone`; otherwise only
/// listing errors.
pub fn interface_rules<B: RulesetBackend + ?Sized>(
    backend: &mut B,
    chain: ChainName,
    zone: ZoneName,
) -> Result<Vec<(String, Option<u64>)>> {
    let target = Topology::jump_target(zone, chain).ok_or_else(|| {
        Error::Internal(format!("{chain} carries no interface jumps for {zone}"))
    })?;
    let (known, _) = classify_chain(backend, chain)?;
    Ok(known
        .into_iter()
        .filter_map(|rule| match rule.decoded {
            Decoded::InterfaceJump {
                ifname, target: t, ..
            } if t == target.as_str() => Some((ifname, rule.handle)),
            _ => None,
        })
        .collect())
}

/// Interface names of `zone` wired in `chain`.
///
/// # Errors
///
/// See [`interface_rules`].
pub fn list_interfaces<B: RulesetBackend + ?Sized>(
    backend: &mut B,
    chain: ChainName,
    zone: ZoneName,
) -> Result<BTreeSet<String>> {
    Ok(interface_rules(backend, chain, zone)?
        .into_iter()
        .map(|(name, _)| name)
        .collect())
}

/// Policy of `zone` inferred from the default rule of its policy chain.
///
/// `None` means unknown: no default rule, more than one disagreeing, or a
/// verdict no policy uses. Callers must treat it as out of sync.
///
/// # Errors
///
/// Only listing errors.
pub fn list_policy<B: RulesetBackend + ?Sized>(
    backend: &mut B,
    zone: ZoneName,
) -> Result<Option<ZonePolicy>> {
    let chain = Topology::policy_chain(zone);
    let (known, _) = classify_chain(backend, chain)?;
    let verdicts: Vec<Verdict> = known
        .into_iter()
        .filter_map(|rule| match rule.decoded {
            Decoded::DefaultPolicy { verdict } => Some(verdict),
            _ => None,
        })
        .collect();

    let policies: BTreeSet<Option<ZonePolicy>> = verdicts.iter().map(policy_from_verdict).collect();
    match policies.len() {
        0 => {
            debug!("No default rule in {}", chain);
            Ok(None)
        }
        1 => {
            let policy = policies.into_iter().next().flatten();
            if policy.is_none() {
                warn!("Default verdict {:?} in {} maps to no policy", verdicts, chain);
            }
            Ok(policy)
        }
        _ => {
            warn!("Conflicting default rules in {}: {:?}", chain, verdicts);
            Ok(None)
        }
    }
}

/// Accept-prefix rules in the policy chain of `zone`, as
/// `(normalized cidr, handle)`.
///
/// # Errors
///
/// Only listing errors.
pub fn prefix_rules<B: RulesetBackend + ?Sized>(
    backend: &mut B,
    zone: ZoneName,
) -> Result<Vec<(String, Option<u64>)>> {
    let (known, _) = classify_chain(backend, Topology::policy_chain(zone))?;
    Ok(known
        .into_iter()
        .filter_map(|rule| match rule.decoded {
            Decoded::Prefix {
                network,
                verdict: Verdict::Accept,
            } => Some((network.to_string(), rule.handle)),
            _ => None,
        })
        .collect())
}

/// Allow-listed prefixes of `zone`.
///
/// # Errors
///
/// Only listing errors.
pub fn list_prefixes<B: RulesetBackend + ?Sized>(
    backend: &mut B,
    zone: ZoneName,
) -> Result<BTreeSet<String>> {
    Ok(prefix_rules(backend, zone)?
        .into_iter()
        .map(|(cidr, _)| cidr)
        .collect())
}

/// Full observed state of `zone`. Interfaces are taken from Forward, the
/// first hop of every jump path.
///
/// # Errors
///
/// Only listing errors.
pub fn read_zone<B: RulesetBackend + ?Sized>(backend: &mut B, zone: ZoneName) -> Result<ObservedZone> {
    Ok(ObservedZone {
        interfaces: list_interfaces(backend, ChainName::Forward, zone)?,
        policy: list_policy(backend, zone)?,
        addresses: list_prefixes(backend, zone)?,
    })
}
