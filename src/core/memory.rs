//! In-memory ruleset
//!
//! Mirrors the kernel's commit semantics closely enough to drive the sync
//! engine without privileges: a flush applies all queued ops to a copy and
//! only keeps the copy if every op succeeded. Missing tables, chains, jump
//! targets and handles fail with `ENOENT` like nf_tables does.
//!
//! Used by the test suite and by `zonewall plan`, which mirrors the live
//! ruleset here and reports the journal instead of touching the kernel.

use crate::core::backend::{Op, RulesetBackend};
use crate::core::error::{Error, Result};
use crate::core::expr::Expr;
use crate::core::rule::Rule;
use crate::core::topology::{ChainName, ChainSpec, Topology};
use std::collections::BTreeMap;
use std::io;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct Table {
    chains: BTreeMap<ChainName, (ChainSpec, Vec<Rule>)>,
}

#[derive(Debug, Clone, Default)]
struct State {
    table: Option<Table>,
    next_handle: u64,
}

impl State {
    fn chain_mut(&mut self, chain: ChainName) -> io::Result<&mut Vec<Rule>> {
        self.table
            .as_mut()
            .and_then(|t| t.chains.get_mut(&chain))
            .map(|(_, rules)| rules)
            .ok_or_else(|| io::Error::from_raw_os_error(libc::ENOENT))
    }

    fn has_chain(&self, name: &str) -> bool {
        self.table
            .as_ref()
            .is_some_and(|t| t.chains.keys().any(|c| c.as_str() == name))
    }

    /// Stores `rule` with a fresh handle at the chain head or tail.
    fn place(&mut self, mut rule: Rule, head: bool) -> io::Result<()> {
        if let Some(target) = rule.exprs.iter().find_map(|e| match e {
            Expr::Verdict(v) => v.chain().map(str::to_string),
            _ => None,
        }) && !self.has_chain(&target)
        {
            return Err(io::Error::from_raw_os_error(libc::ENOENT));
        }
        self.next_handle += 1;
        rule.handle = Some(self.next_handle);
        let rules = self.chain_mut(rule.chain)?;
        if head {
            rules.insert(0, rule);
        } else {
            rules.push(rule);
        }
        Ok(())
    }

    fn apply(&mut self, op: &Op) -> io::Result<()> {
        match op {
            Op::AddTable => {
                if self.table.is_none() {
                    self.table = Some(Table::default());
                }
                Ok(())
            }
            Op::DelTable => match self.table.take() {
                Some(_) => Ok(()),
                None => Err(io::Error::from_raw_os_error(libc::ENOENT)),
            },
            Op::AddChain(spec) => {
                let table = self
                    .table
                    .as_mut()
                    .ok_or_else(|| io::Error::from_raw_os_error(libc::ENOENT))?;
                table
                    .chains
                    .entry(spec.name)
                    .or_insert_with(|| (*spec, Vec::new()));
                Ok(())
            }
            Op::AddRule(rule) => self.place(rule.clone(), false),
            Op::InsertRule(rule) => self.place(rule.clone(), true),
            Op::DelRule { chain, handle } => {
                let rules = self.chain_mut(*chain)?;
                let pos = rules
                    .iter()
                    .position(|r| r.handle == Some(*handle))
                    .ok_or_else(|| io::Error::from_raw_os_error(libc::ENOENT))?;
                rules.remove(pos);
                Ok(())
            }
        }
    }
}

/// Scheduled failure of a future op
#[derive(Debug, Clone, Copy)]
struct Injected {
    remaining: usize,
    errno: i32,
}

/// Ruleset backend kept entirely in memory, with a journal of every
/// committed mutation.
#[derive(Debug, Default)]
pub struct MemoryRuleset {
    state: State,
    pending: Vec<Op>,
    journal: Vec<Op>,
    failure: Option<Injected>,
}

impl MemoryRuleset {
    pub fn new() -> Self {
        Self::default()
    }

    /// A ruleset holding the table, the chains of `topology`, and `rules`
    /// with their handles preserved. Nothing is journaled.
    pub fn mirror(topology: &Topology, rules: impl IntoIterator<Item = Rule>) -> Self {
        let mut table = Table::default();
        for spec in topology.chains() {
            table.chains.insert(spec.name, (*spec, Vec::new()));
        }
        let mut next_handle = 0;
        for rule in rules {
            if let Some((_, chain)) = table.chains.get_mut(&rule.chain) {
                next_handle = next_handle.max(rule.handle.unwrap_or(0));
                chain.push(rule);
            }
        }
        // Rules without a handle get one after the highest preserved handle.
        for (_, chain) in table.chains.values_mut() {
            for rule in chain.iter_mut().filter(|r| r.handle.is_none()) {
                next_handle += 1;
                rule.handle = Some(next_handle);
            }
        }
        Self {
            state: State {
                table: Some(table),
                next_handle,
            },
            ..Self::default()
        }
    }

    /// Places a rule directly, bypassing the journal. Returns its handle.
    ///
    /// # Errors
    ///
    /// Same as a queued append: `ENOENT` for a missing chain or jump target.
    pub fn seed(&mut self, rule: Rule) -> Result<u64> {
        self.state.place(rule, false)?;
        Ok(self.state.next_handle)
    }

    /// Makes the `nth` op flushed from now on (1-based) fail with `errno`,
    /// rejecting its whole batch.
    pub fn fail_nth_op(&mut self, nth: usize, errno: i32) {
        self.failure = Some(Injected {
            remaining: nth.max(1),
            errno,
        });
    }

    pub fn journal(&self) -> &[Op] {
        &self.journal
    }

    /// Number of committed ops.
    pub fn mutations(&self) -> usize {
        self.journal.len()
    }

    pub fn clear_journal(&mut self) {
        self.journal.clear();
    }

    pub fn has_table(&self) -> bool {
        self.state.table.is_some()
    }

    /// Rules currently committed to `chain`; empty when it does not exist.
    pub fn rules(&self, chain: ChainName) -> &[Rule] {
        self.state
            .table
            .as_ref()
            .and_then(|t| t.chains.get(&chain))
            .map_or(&[], |(_, rules)| rules.as_slice())
    }

    pub fn chain_spec(&self, chain: ChainName) -> Option<ChainSpec> {
        self.state
            .table
            .as_ref()
            .and_then(|t| t.chains.get(&chain))
            .map(|(spec, _)| *spec)
    }

    fn take_injected(&mut self) -> Option<i32> {
        let failure = self.failure.as_mut()?;
        failure.remaining -= 1;
        if failure.remaining == 0 {
            let errno = failure.errno;
            self.failure = None;
            Some(errno)
        } else {
            None
        }
    }
}

impl RulesetBackend for MemoryRuleset {
    fn queue(&mut self, op: Op) {
        self.pending.push(op);
    }

    fn flush(&mut self) -> Result<()> {
        let ops = std::mem::take(&mut self.pending);
        let mut next = self.state.clone();
        for op in &ops {
            let outcome = match self.take_injected() {
                Some(errno) => Err(io::Error::from_raw_os_error(errno)),
                None => next.apply(op),
            };
            if let Err(source) = outcome {
                return Err(Error::KernelCommit {
                    operation: op.describe(),
                    source,
                });
            }
        }
        self.state = next;
        self.journal.extend(ops);
        Ok(())
    }

    fn get_rules(&mut self, chain: ChainName) -> Result<Vec<Rule>> {
        let table = self
            .state
            .table
            .as_ref()
            .ok_or_else(|| io::Error::from_raw_os_error(libc::ENOENT))?;
        let (_, rules) = table
            .chains
            .get(&chain)
            .ok_or_else(|| io::Error::from_raw_os_error(libc::ENOENT))?;
        Ok(rules.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::expr::Verdict;
    use crate::core::templates::{Direction, build_default_policy_rule, build_interface_jump_rule};

    fn with_chains() -> MemoryRuleset {
        MemoryRuleset::mirror(&Topology::standard(), Vec::new())
    }

    #[test]
    fn test_delete_missing_table_is_enoent() {
        let mut mem = MemoryRuleset::new();
        mem.del_table();
        let err = mem.flush().unwrap_err();
        assert_eq!(err.errno(), Some(libc::ENOENT));
        assert_eq!(mem.mutations(), 0);
    }

    #[test]
    fn test_failed_batch_applies_nothing() {
        let mut mem = with_chains();
        mem.add_rule(build_default_policy_rule(ChainName::PairTrustToTrust, Verdict::Return));
        mem.del_rule(ChainName::PairTrustToTrust, 999);
        assert!(mem.flush().is_err());
        assert!(mem.rules(ChainName::PairTrustToTrust).is_empty());
        assert!(mem.journal().is_empty());
    }

    #[test]
    fn test_insert_goes_to_head_with_fresh_handles() {
        let mut mem = with_chains();
        mem.add_rule(build_default_policy_rule(ChainName::PairTrustToTrust, Verdict::Drop));
        mem.flush().unwrap();
        mem.insert_rule(build_default_policy_rule(ChainName::PairTrustToTrust, Verdict::Return));
        mem.flush().unwrap();

        let rules = mem.get_rules(ChainName::PairTrustToTrust).unwrap();
        assert_eq!(rules.len(), 2);
        assert_eq!(rules[0].handle, Some(2));
        assert_eq!(rules[1].handle, Some(1));
    }

    #[test]
    fn test_jump_to_missing_chain_is_rejected() {
        let mut mem = MemoryRuleset::new();
        mem.add_table();
        mem.add_chain(Topology::standard().chains()[1]);
        mem.flush().unwrap();
        mem.add_rule(
            build_interface_jump_rule(
                ChainName::Forward,
                Direction::Outbound,
                "eth0",
                ChainName::ZoneTrust,
            )
            .unwrap(),
        );
        assert_eq!(mem.flush().unwrap_err().errno(), Some(libc::ENOENT));
    }

    #[test]
    fn test_injected_failure_hits_nth_op_once() {
        let mut mem = with_chains();
        mem.fail_nth_op(2, libc::EBUSY);
        for _ in 0..3 {
            mem.add_rule(build_default_policy_rule(ChainName::PairTrustToTrust, Verdict::Return));
            let _ = mem.flush();
        }
        assert_eq!(mem.rules(ChainName::PairTrustToTrust).len(), 2);
        assert_eq!(mem.mutations(), 2);
    }

    #[test]
    fn test_mirror_preserves_handles() {
        let mut rule = build_default_policy_rule(ChainName::PairTrustToUntrust, Verdict::Return);
        rule.handle = Some(40);
        let mut mem = MemoryRuleset::mirror(&Topology::standard(), vec![rule]);
        assert_eq!(mem.rules(ChainName::PairTrustToUntrust)[0].handle, Some(40));
        let handle = mem
            .seed(build_default_policy_rule(ChainName::PairTrustToUntrust, Verdict::Drop))
            .unwrap();
        assert_eq!(handle, 41);
    }
}
