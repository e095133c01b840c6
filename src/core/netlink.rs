//! nf_tables access through rustables
//!
//! Each flush becomes one [`Batch`], which the kernel applies all-or-nothing.
//! `Batch::send` opens a socket for that batch alone, waits for its acks and
//! closes it, so nothing from a rejected batch is left to confuse the next
//! request. Dumps go through [`list_rules_for_chain`]. Both run in the
//! network namespace of the calling thread.

use crate::core::backend::{Op, RulesetBackend};
use crate::core::error::{Error, Result};
use crate::core::expr::{CmpOp, CtKey, Expr, MetaKey, PayloadBase, TimeUnit, Verdict};
use crate::core::rule::Rule;
use crate::core::topology::{self, ChainName, ChainSpec, TABLE_NAME};
use rustables::error::QueryError;
use rustables::expr::{
    Bitwise, Cmp, Conntrack, ConntrackKey, ExpressionVariant, Immediate, Limit, Meta, MetaType,
    Payload, Register, VerdictKind, VerdictType,
};
use rustables::{
    Batch, Chain, ChainPolicy as NftPolicy, Hook as NftHook, HookClass, MsgType, ProtocolFamily,
    Rule as NftRule, Table, list_rules_for_chain,
};
use std::collections::HashSet;
use std::io;
use std::mem;
use tracing::{debug, warn};

/// `NFT_LIMIT_F_INV`: match once the rate is exceeded
const NFT_LIMIT_F_INV: u32 = 1;

fn table() -> Table {
    Table::new(ProtocolFamily::Inet).with_name(TABLE_NAME)
}

fn chain(name: ChainName) -> Chain {
    Chain::new(&table()).with_name(name.as_str())
}

fn chain_object(spec: &ChainSpec) -> Chain {
    let chain = chain(spec.name);
    let Some(base) = spec.base else {
        return chain;
    };
    let class = match base.hook {
        topology::Hook::Input => HookClass::In,
        topology::Hook::Forward => HookClass::Forward,
    };
    let policy = match base.policy {
        topology::ChainPolicy::Accept => NftPolicy::Accept,
        topology::ChainPolicy::Drop => NftPolicy::Drop,
    };
    chain
        .with_hook(NftHook::new(class, base.priority))
        .with_policy(policy)
}

fn meta_type(key: MetaKey) -> MetaType {
    match key {
        MetaKey::IifName => MetaType::IifName,
        MetaKey::OifName => MetaType::OifName,
        MetaKey::NfProto => MetaType::NfProto,
    }
}

fn verdict_kind(verdict: &Verdict) -> VerdictKind {
    match verdict {
        Verdict::Accept => VerdictKind::Accept,
        Verdict::Drop => VerdictKind::Drop,
        Verdict::Return => VerdictKind::Return,
        Verdict::Continue => VerdictKind::Continue,
        Verdict::Break => VerdictKind::Break,
        Verdict::Jump(chain) => VerdictKind::Jump {
            chain: chain.clone(),
        },
        Verdict::Goto(chain) => VerdictKind::Goto {
            chain: chain.clone(),
        },
    }
}

fn with_expr(rule: NftRule, expr: &Expr) -> Result<NftRule> {
    Ok(match expr {
        Expr::Meta { key } => rule.with_expr(
            Meta::default()
                .with_key(meta_type(*key))
                .with_dreg(Register::Reg1),
        ),
        Expr::Cmp { op, data } => {
            let op = match op {
                CmpOp::Eq => rustables::expr::CmpOp::Eq,
                CmpOp::Neq => rustables::expr::CmpOp::Neq,
            };
            rule.with_expr(Cmp::new(op, data.clone()))
        }
        Expr::Payload { base, offset, len } => rule.with_expr(
            Payload::default()
                .with_dreg(Register::Reg1)
                .with_base(base.code())
                .with_offset(*offset)
                .with_len(*len),
        ),
        Expr::Bitwise { mask, xor } => {
            let bitwise = Bitwise::new(mask.clone(), xor.clone())
                .map_err(|e| Error::InvalidRuleParameter(format!("bitwise: {e}")))?;
            rule.with_expr(bitwise)
        }
        Expr::Ct { key: CtKey::State } => rule.with_expr(
            Conntrack::default()
                .with_dreg(Register::Reg1)
                .with_key(ConntrackKey::State),
        ),
        Expr::Limit {
            rate,
            unit,
            burst,
            over,
        } => rule.with_expr(
            Limit::default()
                .with_rate(*rate)
                .with_unit(unit.seconds())
                .with_burst(*burst)
                .with_flags(if *over { NFT_LIMIT_F_INV } else { 0 }),
        ),
        Expr::Verdict(verdict) => rule.with_expr(Immediate::new_verdict(verdict_kind(verdict))),
        Expr::Other(name) => {
            return Err(Error::InvalidRuleParameter(format!(
                "cannot write foreign expression '{name}'"
            )));
        }
    })
}

/// Builds the rustables rule for `rule`, handle left unset.
///
/// # Errors
///
/// `InvalidRuleParameter` for expressions this crate does not write.
pub fn to_nft_rule(rule: &Rule) -> Result<NftRule> {
    let mut nft = NftRule::new(&chain(rule.chain))
        .map_err(|e| Error::Internal(format!("rule for {}: {e}", rule.chain)))?;
    for expr in &rule.exprs {
        nft = with_expr(nft, expr)?;
    }
    let udata = rule.userdata();
    if !udata.is_empty() {
        nft = nft.with_userdata(udata);
    }
    Ok(nft)
}

fn decode_meta(meta: &Meta) -> Option<Expr> {
    let key = match meta.get_key()? {
        MetaType::IifName => MetaKey::IifName,
        MetaType::OifName => MetaKey::OifName,
        MetaType::NfProto => MetaKey::NfProto,
        _ => return None,
    };
    Some(Expr::Meta { key })
}

fn decode_cmp(cmp: &Cmp) -> Option<Expr> {
    let op = match cmp.get_op()? {
        rustables::expr::CmpOp::Eq => CmpOp::Eq,
        rustables::expr::CmpOp::Neq => CmpOp::Neq,
        _ => return None,
    };
    Some(Expr::Cmp {
        op,
        data: cmp.get_data()?.get_value()?.clone(),
    })
}

fn decode_payload(payload: &Payload) -> Option<Expr> {
    Some(Expr::Payload {
        base: PayloadBase::from_code(*payload.get_base()?)?,
        offset: *payload.get_offset()?,
        len: *payload.get_len()?,
    })
}

fn decode_bitwise(bitwise: &Bitwise) -> Option<Expr> {
    Some(Expr::Bitwise {
        mask: bitwise.get_mask()?.get_value()?.clone(),
        xor: bitwise
            .get_xor()
            .and_then(|x| x.get_value())
            .cloned()
            .unwrap_or_default(),
    })
}

fn decode_ct(ct: &Conntrack) -> Option<Expr> {
    match ct.get_key()? {
        ConntrackKey::State => Some(Expr::Ct { key: CtKey::State }),
        _ => None,
    }
}

fn decode_limit(limit: &Limit) -> Option<Expr> {
    Some(Expr::Limit {
        rate: *limit.get_rate()?,
        unit: TimeUnit::from_seconds(*limit.get_unit()?)?,
        burst: limit.get_burst().copied().unwrap_or(0),
        over: limit.get_flags().copied().unwrap_or(0) & NFT_LIMIT_F_INV != 0,
    })
}

fn decode_immediate(imm: &Immediate) -> Option<Expr> {
    // Only verdicts; data loads into a register are not ours.
    let verdict = imm.get_data()?.get_verdict()?;
    let target = verdict.get_chain().cloned();
    let verdict = match verdict.get_code()? {
        VerdictType::Accept => Verdict::Accept,
        VerdictType::Drop => Verdict::Drop,
        VerdictType::Return => Verdict::Return,
        VerdictType::Continue => Verdict::Continue,
        VerdictType::Break => Verdict::Break,
        VerdictType::Jump => Verdict::Jump(target?),
        VerdictType::Goto => Verdict::Goto(target?),
        _ => return None,
    };
    Some(Expr::Verdict(verdict))
}

fn decode_expr(variant: &ExpressionVariant) -> Expr {
    let (name, decoded) = match variant {
        ExpressionVariant::Meta(e) => ("meta", decode_meta(e)),
        ExpressionVariant::Cmp(e) => ("cmp", decode_cmp(e)),
        ExpressionVariant::Payload(e) => ("payload", decode_payload(e)),
        ExpressionVariant::Bitwise(e) => ("bitwise", decode_bitwise(e)),
        ExpressionVariant::Conntrack(e) => ("ct", decode_ct(e)),
        ExpressionVariant::Limit(e) => ("limit", decode_limit(e)),
        ExpressionVariant::Immediate(e) => ("immediate", decode_immediate(e)),
        _ => ("unknown", None),
    };
    decoded.unwrap_or_else(|| Expr::Other(name.to_string()))
}

/// Reads a dumped rule back into the crate's rule model.
pub fn from_nft_rule(nft: &NftRule, chain: ChainName) -> Rule {
    Rule {
        chain,
        handle: nft.get_handle().copied(),
        exprs: nft
            .get_expressions()
            .map(|list| list.iter().map(decode_expr).collect())
            .unwrap_or_default(),
        tag: nft
            .get_userdata()
            .and_then(|udata| Rule::tag_from_userdata(udata)),
    }
}

fn rule_handle(chain_name: ChainName, handle: u64) -> Result<NftRule> {
    NftRule::new(&chain(chain_name))
        .map(|rule| rule.with_handle(handle))
        .map_err(|e| Error::Internal(format!("rule handle in {chain_name}: {e}")))
}

/// Kernel errno carried by a rustables failure, if there is one.
fn query_io_error(err: &QueryError) -> io::Error {
    match err {
        QueryError::NetlinkError(msg) => io::Error::from_raw_os_error(msg.error.abs()),
        other => io::Error::other(other.to_string()),
    }
}

fn describe_batch(ops: &[Op]) -> String {
    match ops {
        [op] => op.describe(),
        _ => format!(
            "batch of {} ({})",
            ops.len(),
            ops.iter().map(Op::describe).collect::<Vec<_>>().join(", ")
        ),
    }
}

/// nf_tables connection in the calling thread's network namespace.
///
/// Holds no socket between calls; rustables opens one per request.
#[derive(Debug, Default)]
pub struct NetlinkConn {
    pending: Vec<Op>,
}

impl NetlinkConn {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `op` to `batch`. `touched` holds the chains earlier ops of the
    /// same batch wrote to.
    fn add_to_batch(
        &mut self,
        batch: &mut Batch,
        op: &Op,
        touched: &mut HashSet<ChainName>,
    ) -> Result<()> {
        match op {
            Op::AddTable => batch.add(&table(), MsgType::Add),
            Op::DelTable => batch.add(&table(), MsgType::Del),
            Op::AddChain(spec) => batch.add(&chain_object(spec), MsgType::Add),
            Op::AddRule(rule) => {
                batch.add(&to_nft_rule(rule)?, MsgType::Add);
                touched.insert(rule.chain);
            }
            Op::InsertRule(rule) => {
                // rustables always appends, so the head insert is done by
                // moving every installed rule behind the new one. That reads
                // the committed chain, which must not already have pending
                // writes in this batch.
                if touched.contains(&rule.chain) {
                    return Err(Error::Internal(format!(
                        "head insert into {} after other writes in the same batch",
                        rule.chain
                    )));
                }
                let installed = self.get_rules(rule.chain)?;
                batch.add(&to_nft_rule(rule)?, MsgType::Add);
                for old in installed {
                    let Some(handle) = old.handle else {
                        continue;
                    };
                    let moved = to_nft_rule(&old)?;
                    batch.add(&rule_handle(old.chain, handle)?, MsgType::Del);
                    batch.add(&moved, MsgType::Add);
                }
                touched.insert(rule.chain);
            }
            Op::DelRule { chain, handle } => {
                batch.add(&rule_handle(*chain, *handle)?, MsgType::Del);
                touched.insert(*chain);
            }
        }
        Ok(())
    }
}

impl RulesetBackend for NetlinkConn {
    fn queue(&mut self, op: Op) {
        self.pending.push(op);
    }

    fn flush(&mut self) -> Result<()> {
        let ops = mem::take(&mut self.pending);
        if ops.is_empty() {
            return Ok(());
        }

        let mut batch = Batch::new();
        let mut touched = HashSet::new();
        for op in &ops {
            self.add_to_batch(&mut batch, op, &mut touched)?;
        }

        debug!("Committing batch of {} ops", ops.len());
        batch.send().map_err(|e| {
            let operation = describe_batch(&ops);
            warn!("Kernel rejected {}: {}", operation, e);
            Error::KernelCommit {
                operation,
                source: query_io_error(&e),
            }
        })
    }

    fn get_rules(&mut self, chain_name: ChainName) -> Result<Vec<Rule>> {
        let rules = list_rules_for_chain(&chain(chain_name)).map_err(|e| {
            debug!("Listing {} failed: {}", chain_name, e);
            Error::Io(query_io_error(&e))
        })?;
        Ok(rules
            .iter()
            .map(|nft| from_nft_rule(nft, chain_name))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::templates::{
        CtState, Direction, IpFamily, RateLimit, build_conntrack_rule, build_default_policy_rule,
        build_interface_jump_rule, build_prefix_rule, build_protocol_rule, build_rate_limit_rule,
    };
    use crate::core::topology::Topology;

    fn one_of_each() -> Vec<Rule> {
        vec![
            build_interface_jump_rule(
                ChainName::ZoneUntrust,
                Direction::Inbound,
                "eth-b",
                ChainName::PairTrustToUntrust,
            )
            .unwrap(),
            build_prefix_rule(ChainName::PairUntrustToTrust, "2001:db8::/48", Verdict::Accept)
                .unwrap(),
            build_conntrack_rule(
                ChainName::Input,
                CtState::ESTABLISHED | CtState::RELATED,
                Verdict::Accept,
            ),
            build_protocol_rule(ChainName::PairUntrustToTrust, IpFamily::Ipv6, 58, Verdict::Return),
            build_default_policy_rule(ChainName::PairTrustToTrust, Verdict::Return),
            build_rate_limit_rule(
                ChainName::Input,
                IpFamily::Ipv4,
                1,
                RateLimit::default(),
                Verdict::Accept,
            ),
        ]
    }

    #[test]
    fn test_rules_read_back_as_written() {
        for rule in one_of_each() {
            let nft = to_nft_rule(&rule).unwrap().with_handle(42u64);
            let back = from_nft_rule(&nft, rule.chain);
            assert_eq!(back.handle, Some(42));
            assert_eq!(back.exprs, rule.exprs);
            assert_eq!(back.tag, rule.tag);
            assert_eq!(back.classify().unwrap(), rule.classify().unwrap());
        }
    }

    #[test]
    fn test_foreign_expression_is_not_written() {
        let rule = Rule {
            chain: ChainName::Forward,
            handle: None,
            exprs: vec![Expr::Other("counter".into()), Expr::Verdict(Verdict::Accept)],
            tag: None,
        };
        assert!(matches!(
            to_nft_rule(&rule),
            Err(Error::InvalidRuleParameter(_))
        ));
    }

    #[test]
    fn test_rejected_batch_leaves_nothing_queued() {
        let mut conn = NetlinkConn::new();
        conn.queue(Op::AddRule(Rule {
            chain: ChainName::Forward,
            handle: None,
            exprs: vec![Expr::Other("counter".into())],
            tag: None,
        }));
        assert!(conn.flush().is_err());
        assert!(conn.pending.is_empty());
        // Nothing left over, so the next flush has nothing to send.
        conn.flush().unwrap();
    }

    #[test]
    fn test_head_insert_after_write_to_same_chain_is_refused() {
        let mut conn = NetlinkConn::new();
        let chain = ChainName::PairUntrustToTrust;
        conn.queue(Op::AddRule(build_default_policy_rule(chain, Verdict::Drop)));
        conn.queue(Op::InsertRule(
            build_prefix_rule(chain, "10.0.0.0/8", Verdict::Accept).unwrap(),
        ));
        assert!(matches!(conn.flush(), Err(Error::Internal(_))));
        assert!(conn.pending.is_empty());
    }

    #[test]
    fn test_only_base_chains_carry_a_hook() {
        for spec in Topology::standard().chains() {
            let chain = chain_object(spec);
            assert_eq!(chain.get_name().map(String::as_str), Some(spec.name.as_str()));
            assert_eq!(chain.get_hook().is_some(), spec.base.is_some());
        }
    }

    #[test]
    fn test_single_op_batches_are_described_by_their_op() {
        let op = Op::DelRule {
            chain: ChainName::Forward,
            handle: 7,
        };
        assert_eq!(describe_batch(std::slice::from_ref(&op)), op.describe());
        let both = describe_batch(&[Op::AddTable, Op::DelTable]);
        assert!(both.starts_with("batch of 2"));
    }
}
