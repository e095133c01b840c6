//! Shared test utilities for core module tests
//!
//! Provides common fixtures to avoid duplication across test suites.
//! This module is only compiled in test mode.

use crate::core::backend::Op;
use crate::core::memory::MemoryRuleset;
use crate::core::model::{DesiredZone, ZonePolicy};
use crate::core::rule::{Rule, RuleKind};
use crate::core::sync;
use crate::core::templates::IpFamily;
use crate::core::topology::{ChainName, Topology};

/// Family used by the fixtures unless a test says otherwise.
pub const FAMILY: IpFamily = IpFamily::Ipv6;

/// A freshly bootstrapped in-memory ruleset with an empty journal.
///
/// This is the canonical starting point for sync tests.
pub fn bootstrapped() -> MemoryRuleset {
    let mut mem = MemoryRuleset::new();
    sync::bootstrap(&mut mem, &Topology::standard(), FAMILY).unwrap();
    mem.clear_journal();
    mem
}

/// Desired zone state from string slices.
pub fn desired(interfaces: &[&str], policy: ZonePolicy, prefixes: &[&str]) -> DesiredZone {
    DesiredZone::new(
        interfaces.iter().copied(),
        policy,
        prefixes.iter().copied(),
    )
}

/// Kinds of the rules in `chain`, in evaluation order, by signature.
pub fn chain_kinds(mem: &MemoryRuleset, chain: ChainName) -> Vec<Option<RuleKind>> {
    mem.rules(chain)
        .iter()
        .map(|r| RuleKind::from_exprs(&r.exprs))
        .collect()
}

/// Rules of every chain with handles cleared, for comparing two rulesets.
pub fn without_handles(mem: &MemoryRuleset) -> Vec<(ChainName, Vec<Rule>)> {
    Topology::standard()
        .chains()
        .iter()
        .map(|spec| {
            let rules = mem
                .rules(spec.name)
                .iter()
                .cloned()
                .map(|mut r| {
                    r.handle = None;
                    r
                })
                .collect();
            (spec.name, rules)
        })
        .collect()
}

/// Short journal summary: `("add" | "insert" | "del", chain)` per op.
///
/// Table and chain ops are summarized with the Forward chain as placeholder;
/// sync tests never produce them.
pub fn journal_summary(mem: &MemoryRuleset) -> Vec<(&'static str, ChainName)> {
    mem.journal()
        .iter()
        .map(|op| match op {
            Op::AddRule(rule) => ("add", rule.chain),
            Op::InsertRule(rule) => ("insert", rule.chain),
            Op::DelRule { chain, .. } => ("del", *chain),
            Op::AddTable | Op::DelTable | Op::AddChain(_) => ("table", ChainName::Forward),
        })
        .collect()
}

/// Journal ops touching `chain`, summarized like [`journal_summary`].
pub fn journal_for(mem: &MemoryRuleset, chain: ChainName) -> Vec<&'static str> {
    journal_summary(mem)
        .into_iter()
        .filter(|(_, c)| *c == chain)
        .map(|(op, _)| op)
        .collect()
}
