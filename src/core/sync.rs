//! Diff and sync engine
//!
//! Every add and delete is committed on its own before the next one is
//! queued. A failure stops the step and is returned; whatever was committed
//! before it stays, and the next pass picks up from the re-read state.

use crate::core::backend::{Op, RulesetBackend};
use crate::core::error::Result;
use crate::core::expr::Verdict;
use crate::core::model::{DesiredZone, ObservedZone, ZoneName, ZonePolicy};
use crate::core::policy::build_ruleset;
use crate::core::reader::{self, classify_chain};
use crate::core::rule::{Decoded, Rule, RuleKind};
use crate::core::templates::{
    IpFamily, build_interface_jump_rule, build_prefix_rule, pad_ifname, parse_cidr,
};
use crate::core::topology::{ChainName, Topology};
use crate::validators::{check_prefix_scope, validate_interface};
use serde::Serialize;
use std::collections::BTreeSet;
use tracing::{debug, info, warn};

/// Symmetric difference between a desired and an observed set.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SetDiff {
    /// desired − observed
    pub added: BTreeSet<String>,
    /// observed − desired
    pub removed: BTreeSet<String>,
}

impl SetDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

pub fn diff_sets(desired: &BTreeSet<String>, observed: &BTreeSet<String>) -> SetDiff {
    SetDiff {
        added: desired.difference(observed).cloned().collect(),
        removed: observed.difference(desired).cloned().collect(),
    }
}

/// A desired value that could not be turned into a rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Rejected {
    pub value: String,
    pub reason: String,
}

/// Committed adds and deletes per sync step.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StepCounts {
    pub interfaces: usize,
    pub policy: usize,
    pub prefixes: usize,
}

impl StepCounts {
    pub fn total(&self) -> usize {
        self.interfaces + self.policy + self.prefixes
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncOutcome {
    /// State re-read after the sync
    pub observed: ObservedZone,
    pub changes: StepCounts,
    pub rejected: Vec<Rejected>,
}

fn commit<B: RulesetBackend + ?Sized>(backend: &mut B, op: Op) -> Result<()> {
    debug!("Committing: {}", op.describe());
    backend.queue(op);
    backend.flush()
}

/// Resets the table and installs the full topology.
///
/// The add-then-delete pair in the first batch makes the delete succeed
/// whether or not the table existed, so re-running this is a reset to the
/// initial ruleset, not an error.
///
/// # Errors
///
/// The first rejected commit.
pub fn bootstrap<B: RulesetBackend + ?Sized>(
    backend: &mut B,
    topology: &Topology,
    family: IpFamily,
) -> Result<usize> {
    backend.add_table();
    backend.del_table();
    backend.flush()?;
    let mut mutations = 2;

    commit(backend, Op::AddTable)?;
    mutations += 1;
    for spec in topology.chains() {
        commit(backend, Op::AddChain(*spec))?;
        mutations += 1;
    }
    for rule in topology.bootstrap_rules(family) {
        commit(backend, Op::AddRule(rule))?;
        mutations += 1;
    }
    info!("Bootstrapped {} chains", topology.chains().len());
    Ok(mutations)
}

/// Splits desired interface names into encodable ones and rejections.
fn valid_interfaces(desired: &BTreeSet<String>) -> (BTreeSet<String>, Vec<Rejected>) {
    let mut valid = BTreeSet::new();
    let mut rejected = Vec::new();
    for name in desired {
        let problem = match validate_interface(name) {
            Ok(_) => pad_ifname(name).err().map(|e| e.to_string()),
            Err(e) => Some(e),
        };
        match problem {
            None => {
                valid.insert(name.clone());
            }
            Some(reason) => {
                warn!("Rejecting interface {:?}: {}", name, reason);
                rejected.push(Rejected {
                    value: name.clone(),
                    reason,
                });
            }
        }
    }
    (valid, rejected)
}

/// Splits desired CIDRs into normalized ones and rejections.
fn valid_prefixes(desired: &BTreeSet<String>) -> (BTreeSet<String>, Vec<Rejected>) {
    let mut valid = BTreeSet::new();
    let mut rejected = Vec::new();
    for cidr in desired {
        match parse_cidr(cidr) {
            Ok(net) => {
                if let Some(warning) = check_prefix_scope(net) {
                    warn!("Allow-list entry {}", warning);
                }
                valid.insert(net.to_string());
            }
            Err(e) => {
                warn!("Rejecting prefix {:?}: {}", cidr, e);
                rejected.push(Rejected {
                    value: cidr.clone(),
                    reason: e.to_string(),
                });
            }
        }
    }
    (valid, rejected)
}

/// Converges the interface jumps of `zone` in every chain of its jump path.
///
/// Returns the number of committed ops.
///
/// # Errors
///
/// The first listing error or rejected commit.
pub fn sync_interfaces<B: RulesetBackend + ?Sized>(
    backend: &mut B,
    zone: ZoneName,
    desired: &BTreeSet<String>,
) -> Result<usize> {
    let mut mutations = 0;
    for edge in Topology::jump_path(zone) {
        let installed = reader::interface_rules(backend, edge.chain, zone)?;
        let observed: BTreeSet<String> = installed.iter().map(|(n, _)| n.clone()).collect();
        let diff = diff_sets(desired, &observed);
        if diff.is_empty() {
            continue;
        }
        info!(
            "{} {}: +{:?} -{:?}",
            zone, edge.chain, diff.added, diff.removed
        );

        for (name, handle) in &installed {
            if let Some(handle) = handle
                && diff.removed.contains(name)
            {
                commit(
                    backend,
                    Op::DelRule {
                        chain: edge.chain,
                        handle: *handle,
                    },
                )?;
                mutations += 1;
            }
        }
        for name in &diff.added {
            let rule = build_interface_jump_rule(edge.chain, edge.direction, name, edge.target)?;
            commit(backend, Op::AddRule(rule))?;
            mutations += 1;
        }
    }
    Ok(mutations)
}

/// Whether the non-prefix rules of the policy chain are exactly the ruleset
/// of `desired`, in order.
fn policy_installed<B: RulesetBackend + ?Sized>(
    backend: &mut B,
    zone: ZoneName,
    desired: ZonePolicy,
    family: IpFamily,
) -> Result<bool> {
    let chain = Topology::policy_chain(zone);
    let (known, unknown) = classify_chain(backend, chain)?;
    if !unknown.is_empty() {
        return Ok(false);
    }
    let installed: Vec<Decoded> = known
        .into_iter()
        .map(|r| r.decoded)
        .filter(|d| d.kind() != RuleKind::Prefix)
        .collect();
    let expected: Vec<Decoded> = build_ruleset(desired, chain, family)
        .iter()
        .map(Rule::classify)
        .collect::<Result<_>>()?;
    Ok(installed == expected)
}

/// Replaces the policy ruleset of `zone` unless it is already installed.
///
/// Replacement is whole-chain: every rule in the policy chain is deleted,
/// including allow-listed prefixes, then the new ruleset is appended.
/// [`sync_prefixes`] re-inserts the prefixes afterwards.
///
/// # Errors
///
/// The first listing error or rejected commit.
pub fn sync_policy<B: RulesetBackend + ?Sized>(
    backend: &mut B,
    zone: ZoneName,
    desired: ZonePolicy,
    family: IpFamily,
) -> Result<usize> {
    if policy_installed(backend, zone, desired, family)? {
        return Ok(0);
    }
    let chain = Topology::policy_chain(zone);
    let current = reader::list_policy(backend, zone)?;
    info!(
        "Replacing {} policy in {}: {:?} -> {}",
        zone, chain, current, desired
    );

    let mut mutations = 0;
    for rule in backend.get_rules(chain)? {
        if let Some(handle) = rule.handle {
            commit(backend, Op::DelRule { chain, handle })?;
            mutations += 1;
        }
    }
    for rule in build_ruleset(desired, chain, family) {
        commit(backend, Op::AddRule(rule))?;
        mutations += 1;
    }
    Ok(mutations)
}

/// Converges the allow-listed prefixes of `zone`.
///
/// Rules matching an added or a removed address are deleted, then one accept
/// rule per added address is inserted at the head of the policy chain, ahead
/// of the default verdict.
///
/// # Errors
///
/// The first listing error or rejected commit.
pub fn sync_prefixes<B: RulesetBackend + ?Sized>(
    backend: &mut B,
    zone: ZoneName,
    desired: &BTreeSet<String>,
) -> Result<usize> {
    let chain = Topology::policy_chain(zone);
    let installed = reader::prefix_rules(backend, zone)?;
    let observed: BTreeSet<String> = installed.iter().map(|(c, _)| c.clone()).collect();
    let diff = diff_sets(desired, &observed);
    if diff.is_empty() {
        return Ok(0);
    }
    info!("{} prefixes: +{:?} -{:?}", zone, diff.added, diff.removed);

    let churn: BTreeSet<&String> = diff.added.iter().chain(diff.removed.iter()).collect();
    let mut mutations = 0;
    for (cidr, handle) in &installed {
        if let Some(handle) = handle
            && churn.contains(cidr)
        {
            commit(
                backend,
                Op::DelRule {
                    chain,
                    handle: *handle,
                },
            )?;
            mutations += 1;
        }
    }
    for cidr in &diff.added {
        let rule = build_prefix_rule(chain, cidr, Verdict::Accept)?;
        commit(backend, Op::InsertRule(rule))?;
        mutations += 1;
    }
    Ok(mutations)
}

/// Converges one zone: interfaces, then policy, then prefixes, and re-reads
/// the result.
///
/// Invalid interface names and CIDRs are reported in
/// [`SyncOutcome::rejected`] and left out; the rest of the zone still syncs.
///
/// # Errors
///
/// The first listing error or rejected commit. Earlier commits stay applied.
pub fn sync_zone<B: RulesetBackend + ?Sized>(
    backend: &mut B,
    zone: ZoneName,
    desired: &DesiredZone,
    family: IpFamily,
) -> Result<SyncOutcome> {
    let (interfaces, mut rejected) = valid_interfaces(&desired.interfaces);
    let (addresses, bad_prefixes) = valid_prefixes(&desired.addresses);
    rejected.extend(bad_prefixes);

    let mut changes = StepCounts {
        interfaces: sync_interfaces(backend, zone, &interfaces)?,
        ..StepCounts::default()
    };
    changes.policy = sync_policy(backend, zone, desired.policy, family)?;
    changes.prefixes = sync_prefixes(backend, zone, &addresses)?;

    let observed = reader::read_zone(backend, zone)?;
    if changes.total() > 0 {
        info!("Synced {} with {} changes", zone, changes.total());
    }
    Ok(SyncOutcome {
        observed,
        changes,
        rejected,
    })
}

/// Re-reads every chain, for display.
///
/// # Errors
///
/// Only listing errors.
pub fn dump_chains<B: RulesetBackend + ?Sized>(
    backend: &mut B,
    topology: &Topology,
) -> Result<Vec<(ChainName, Vec<Rule>)>> {
    topology
        .chains()
        .iter()
        .map(|spec| Ok((spec.name, backend.get_rules(spec.name)?)))
        .collect()
}
