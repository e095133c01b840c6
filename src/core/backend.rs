//! Kernel ruleset access
//!
//! Mutations are queued and only take effect on [`RulesetBackend::flush`],
//! which commits everything queued since the last flush as one batch.

use crate::core::error::Result;
use crate::core::rule::Rule;
use crate::core::topology::{ChainName, ChainSpec};

/// A queued ruleset mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Op {
    AddTable,
    DelTable,
    AddChain(ChainSpec),
    /// Append at the chain tail
    AddRule(Rule),
    /// Insert at the chain head
    InsertRule(Rule),
    DelRule { chain: ChainName, handle: u64 },
}

impl Op {
    pub fn describe(&self) -> String {
        match self {
            Op::AddTable => "add table".to_string(),
            Op::DelTable => "delete table".to_string(),
            Op::AddChain(spec) => format!("add chain {}", spec.name),
            Op::AddRule(rule) => format!("append {} rule to {}", kind_label(rule), rule.chain),
            Op::InsertRule(rule) => format!("insert {} rule into {}", kind_label(rule), rule.chain),
            Op::DelRule { chain, handle } => format!("delete rule {handle} from {chain}"),
        }
    }
}

fn kind_label(rule: &Rule) -> String {
    rule.tag.map_or_else(|| "untagged".to_string(), |k| k.to_string())
}

pub trait RulesetBackend {
    /// Queues a mutation.
    fn queue(&mut self, op: Op);

    /// Commits all queued mutations atomically.
    ///
    /// # Errors
    ///
    /// Returns `KernelCommit` naming the rejected mutations. Nothing in
    /// the batch is applied in that case.
    fn flush(&mut self) -> Result<()>;

    /// Lists the rules of one chain in evaluation order, with handles.
    ///
    /// # Errors
    ///
    /// Fails if the chain does not exist or the dump fails.
    fn get_rules(&mut self, chain: ChainName) -> Result<Vec<Rule>>;

    fn add_table(&mut self) {
        self.queue(Op::AddTable);
    }

    fn del_table(&mut self) {
        self.queue(Op::DelTable);
    }

    fn add_chain(&mut self, spec: ChainSpec) {
        self.queue(Op::AddChain(spec));
    }

    fn add_rule(&mut self, rule: Rule) {
        self.queue(Op::AddRule(rule));
    }

    fn insert_rule(&mut self, rule: Rule) {
        self.queue(Op::InsertRule(rule));
    }

    fn del_rule(&mut self, chain: ChainName, handle: u64) {
        self.queue(Op::DelRule { chain, handle });
    }
}
