#[cfg(test)]
mod sync_scenarios {
    use crate::core::error::Error;
    use crate::core::expr::{Expr, Verdict};
    use crate::core::model::{ZoneName, ZonePolicy};
    use crate::core::reader;
    use crate::core::rule::{Rule, RuleKind};
    use crate::core::sync::{self, sync_zone};
    use crate::core::templates::{IpFamily, build_default_policy_rule};
    use crate::core::test_helpers::{
        FAMILY, bootstrapped, chain_kinds, desired, journal_for, journal_summary,
        without_handles,
    };
    use crate::core::topology::{ChainName, Topology};

    #[test]
    fn test_bootstrap_is_a_reset() {
        let mut mem = bootstrapped();
        let clean = without_handles(&mem);

        sync_zone(
            &mut mem,
            ZoneName::Trust,
            &desired(&["eth0"], ZonePolicy::AllPermit, &["10.0.0.0/8"]),
            FAMILY,
        )
        .unwrap();
        assert_ne!(without_handles(&mem), clean);

        let topology = Topology::standard();
        let mutations = sync::bootstrap(&mut mem, &topology, FAMILY).unwrap();
        assert_eq!(without_handles(&mem), clean);
        assert_eq!(
            mutations,
            3 + topology.chains().len() + topology.bootstrap_rules(FAMILY).len()
        );
    }

    #[test]
    fn test_bootstrap_installs_default_policies() {
        let mut mem = bootstrapped();
        assert_eq!(
            reader::list_policy(&mut mem, ZoneName::Trust).unwrap(),
            Some(ZonePolicy::EstablishedOnly)
        );
        assert_eq!(
            reader::list_policy(&mut mem, ZoneName::Untrust).unwrap(),
            Some(ZonePolicy::AllPermit)
        );
        assert_eq!(
            chain_kinds(&mem, ChainName::Input),
            vec![
                Some(RuleKind::RateLimit),
                Some(RuleKind::RateLimit),
                Some(RuleKind::ConnTrack)
            ]
        );
        assert!(mem.chain_spec(ChainName::Forward).unwrap().base.is_some());
        assert!(mem.chain_spec(ChainName::ZoneTrust).unwrap().base.is_none());
    }

    #[test]
    fn test_second_sync_commits_nothing() {
        let mut mem = bootstrapped();
        let want = desired(
            &["eth-a", "eth-b"],
            ZonePolicy::EstablishedOnly,
            &["2001:db8::/64"],
        );
        let first = sync_zone(&mut mem, ZoneName::Trust, &want, FAMILY).unwrap();
        assert_eq!(first.changes.interfaces, 6);
        assert_eq!(first.changes.policy, 0);
        assert_eq!(first.changes.prefixes, 1);

        mem.clear_journal();
        let second = sync_zone(&mut mem, ZoneName::Trust, &want, FAMILY).unwrap();
        assert_eq!(second.changes.total(), 0);
        assert_eq!(mem.mutations(), 0);
        assert_eq!(second.observed, first.observed);
    }

    #[test]
    fn test_adding_one_interface_touches_each_jump_chain_once() {
        let mut mem = bootstrapped();
        sync_zone(
            &mut mem,
            ZoneName::Trust,
            &desired(&["eth-a"], ZonePolicy::EstablishedOnly, &[]),
            FAMILY,
        )
        .unwrap();
        mem.clear_journal();

        let outcome = sync_zone(
            &mut mem,
            ZoneName::Trust,
            &desired(&["eth-a", "eth-b"], ZonePolicy::EstablishedOnly, &[]),
            FAMILY,
        )
        .unwrap();

        assert_eq!(
            journal_summary(&mem),
            vec![
                ("add", ChainName::Forward),
                ("add", ChainName::ZoneTrust),
                ("add", ChainName::ZoneUntrust),
            ]
        );
        assert_eq!(
            outcome.observed.interfaces.iter().collect::<Vec<_>>(),
            vec!["eth-a", "eth-b"]
        );
    }

    #[test]
    fn test_removing_an_interface_only_deletes() {
        let mut mem = bootstrapped();
        sync_zone(
            &mut mem,
            ZoneName::Trust,
            &desired(&["eth-a", "eth-b"], ZonePolicy::EstablishedOnly, &[]),
            FAMILY,
        )
        .unwrap();
        mem.clear_journal();

        sync_zone(
            &mut mem,
            ZoneName::Trust,
            &desired(&["eth-b"], ZonePolicy::EstablishedOnly, &[]),
            FAMILY,
        )
        .unwrap();
        let ops: Vec<&str> = journal_summary(&mem).iter().map(|(op, _)| *op).collect();
        assert_eq!(ops, vec!["del", "del", "del"]);
    }

    #[test]
    fn test_zones_do_not_touch_each_others_interfaces() {
        let mut mem = bootstrapped();
        sync_zone(
            &mut mem,
            ZoneName::Untrust,
            &desired(&["wan0"], ZonePolicy::AllPermit, &[]),
            FAMILY,
        )
        .unwrap();
        sync_zone(
            &mut mem,
            ZoneName::Trust,
            &desired(&["lan0"], ZonePolicy::EstablishedOnly, &[]),
            FAMILY,
        )
        .unwrap();
        // Both zones' jumps share ZONE_TRUST, told apart by target.
        assert_eq!(mem.rules(ChainName::ZoneTrust).len(), 2);

        sync_zone(
            &mut mem,
            ZoneName::Trust,
            &desired(&[], ZonePolicy::EstablishedOnly, &[]),
            FAMILY,
        )
        .unwrap();
        let untrust = reader::read_zone(&mut mem, ZoneName::Untrust).unwrap();
        assert_eq!(untrust.interfaces.len(), 1);
        assert!(untrust.interfaces.contains("wan0"));
        for chain in [ChainName::Forward, ChainName::ZoneTrust, ChainName::ZoneUntrust] {
            assert_eq!(mem.rules(chain).len(), 1, "{chain}");
        }
    }

    #[test]
    fn test_policy_replace_deletes_then_appends() {
        let mut mem = bootstrapped();
        let outcome = sync_zone(
            &mut mem,
            ZoneName::Untrust,
            &desired(&[], ZonePolicy::EstablishedOnly, &[]),
            FAMILY,
        )
        .unwrap();

        assert_eq!(outcome.changes.policy, 4);
        assert_eq!(
            journal_for(&mem, ChainName::PairTrustToUntrust),
            vec!["del", "add", "add", "add"]
        );
        assert_eq!(
            chain_kinds(&mem, ChainName::PairTrustToUntrust),
            vec![
                Some(RuleKind::Protocol),
                Some(RuleKind::ConnTrack),
                Some(RuleKind::DefaultPolicy)
            ]
        );
        assert_eq!(outcome.observed.policy, Some(ZonePolicy::EstablishedOnly));
    }

    #[test]
    fn test_policy_replace_keeps_prefixes_ahead_of_default() {
        let mut mem = bootstrapped();
        sync_zone(
            &mut mem,
            ZoneName::Untrust,
            &desired(&[], ZonePolicy::AllPermit, &["2001:db8::/64"]),
            FAMILY,
        )
        .unwrap();
        assert_eq!(
            chain_kinds(&mem, ChainName::PairTrustToUntrust),
            vec![Some(RuleKind::Prefix), Some(RuleKind::DefaultPolicy)]
        );

        let outcome = sync_zone(
            &mut mem,
            ZoneName::Untrust,
            &desired(&[], ZonePolicy::EstablishedOnly, &["2001:db8::/64"]),
            FAMILY,
        )
        .unwrap();
        assert_eq!(outcome.changes.policy, 2 + 3);
        assert_eq!(outcome.changes.prefixes, 1);
        assert_eq!(
            chain_kinds(&mem, ChainName::PairTrustToUntrust),
            vec![
                Some(RuleKind::Prefix),
                Some(RuleKind::Protocol),
                Some(RuleKind::ConnTrack),
                Some(RuleKind::DefaultPolicy)
            ]
        );
        assert!(outcome.observed.addresses.contains("2001:db8::/64"));
    }

    #[test]
    fn test_conflicting_default_rules_read_as_unknown_and_are_replaced() {
        let mut mem = bootstrapped();
        mem.seed(build_default_policy_rule(
            ChainName::PairUntrustToTrust,
            Verdict::Accept,
        ))
        .unwrap();
        assert_eq!(reader::list_policy(&mut mem, ZoneName::Trust).unwrap(), None);

        let outcome = sync_zone(
            &mut mem,
            ZoneName::Trust,
            &desired(&[], ZonePolicy::EstablishedOnly, &[]),
            FAMILY,
        )
        .unwrap();
        assert_eq!(outcome.changes.policy, 4 + 3);
        assert_eq!(outcome.observed.policy, Some(ZonePolicy::EstablishedOnly));
        assert_eq!(mem.rules(ChainName::PairUntrustToTrust).len(), 3);
    }

    #[test]
    fn test_policy_change_clears_pair_chain_but_spares_forward() {
        let mut mem = bootstrapped();
        let foreign = |chain| Rule {
            chain,
            handle: None,
            exprs: vec![Expr::Other("counter".into()), Expr::Verdict(Verdict::Accept)],
            tag: None,
        };
        mem.seed(foreign(ChainName::Forward)).unwrap();
        mem.seed(foreign(ChainName::PairTrustToUntrust)).unwrap();

        sync_zone(
            &mut mem,
            ZoneName::Untrust,
            &desired(&["wan0"], ZonePolicy::EstablishedOnly, &[]),
            FAMILY,
        )
        .unwrap();

        let forward = mem.rules(ChainName::Forward);
        assert_eq!(forward.len(), 2);
        assert!(forward.iter().any(|r| r.exprs[0] == Expr::Other("counter".into())));
        assert_eq!(
            chain_kinds(&mem, ChainName::PairTrustToUntrust),
            vec![
                Some(RuleKind::Protocol),
                Some(RuleKind::ConnTrack),
                Some(RuleKind::DefaultPolicy)
            ]
        );
    }

    #[test]
    fn test_family_change_replaces_protocol_rule() {
        let mut mem = bootstrapped();
        let outcome = sync_zone(
            &mut mem,
            ZoneName::Trust,
            &desired(&[], ZonePolicy::EstablishedOnly, &[]),
            IpFamily::Ipv4,
        )
        .unwrap();
        assert_eq!(outcome.changes.policy, 3 + 3);

        mem.clear_journal();
        sync_zone(
            &mut mem,
            ZoneName::Trust,
            &desired(&[], ZonePolicy::EstablishedOnly, &[]),
            IpFamily::Ipv4,
        )
        .unwrap();
        assert_eq!(mem.mutations(), 0);
    }

    #[test]
    fn test_prefixes_roundtrip_normalized() {
        let mut mem = bootstrapped();
        let want = desired(
            &[],
            ZonePolicy::EstablishedOnly,
            &["10.1.2.7/24", "2001:db8:0:1::/64"],
        );
        let outcome = sync_zone(&mut mem, ZoneName::Trust, &want, FAMILY).unwrap();
        assert_eq!(
            outcome.observed.addresses.iter().collect::<Vec<_>>(),
            vec!["10.1.2.0/24", "2001:db8:0:1::/64"]
        );

        // Host bits in the desired value do not cause churn.
        mem.clear_journal();
        sync_zone(&mut mem, ZoneName::Trust, &want, FAMILY).unwrap();
        assert_eq!(mem.mutations(), 0);
    }

    #[test]
    fn test_dropping_one_prefix_only_deletes_it() {
        let mut mem = bootstrapped();
        sync_zone(
            &mut mem,
            ZoneName::Trust,
            &desired(
                &[],
                ZonePolicy::EstablishedOnly,
                &["2001:db8::/64", "2001:db9::/64"],
            ),
            FAMILY,
        )
        .unwrap();
        mem.clear_journal();

        let outcome = sync_zone(
            &mut mem,
            ZoneName::Trust,
            &desired(&[], ZonePolicy::EstablishedOnly, &["2001:db8::/64"]),
            FAMILY,
        )
        .unwrap();
        assert_eq!(outcome.changes.prefixes, 1);
        assert_eq!(
            journal_summary(&mem),
            vec![("del", ChainName::PairUntrustToTrust)]
        );
        assert_eq!(
            outcome.observed.addresses.iter().collect::<Vec<_>>(),
            vec!["2001:db8::/64"]
        );
    }

    #[test]
    fn test_prefix_rules_are_inserted_at_head() {
        let mut mem = bootstrapped();
        sync_zone(
            &mut mem,
            ZoneName::Trust,
            &desired(&[], ZonePolicy::EstablishedOnly, &["192.0.2.0/24"]),
            FAMILY,
        )
        .unwrap();
        let kinds = chain_kinds(&mem, ChainName::PairUntrustToTrust);
        assert_eq!(kinds.first(), Some(&Some(RuleKind::Prefix)));
        assert_eq!(kinds.last(), Some(&Some(RuleKind::DefaultPolicy)));
        assert_eq!(
            journal_for(&mem, ChainName::PairUntrustToTrust),
            vec!["insert"]
        );
    }

    #[test]
    fn test_invalid_values_are_rejected_not_fatal() {
        let mut mem = bootstrapped();
        let outcome = sync_zone(
            &mut mem,
            ZoneName::Trust,
            &desired(
                &["eth0", "this-name-is-too-long", "bad*name"],
                ZonePolicy::EstablishedOnly,
                &["10.0.0.0/8", "10.0.0.0/33", "not-a-prefix"],
            ),
            FAMILY,
        )
        .unwrap();

        let mut rejected: Vec<&str> = outcome.rejected.iter().map(|r| r.value.as_str()).collect();
        rejected.sort_unstable();
        assert_eq!(
            rejected,
            vec!["10.0.0.0/33", "bad*name", "not-a-prefix", "this-name-is-too-long"]
        );
        assert_eq!(outcome.observed.interfaces.len(), 1);
        assert_eq!(outcome.observed.addresses.len(), 1);
    }

    #[test]
    fn test_failed_commit_stops_and_next_sync_heals() {
        let mut mem = bootstrapped();
        let want = desired(&["eth-a"], ZonePolicy::EstablishedOnly, &[]);
        mem.fail_nth_op(2, libc::EBUSY);

        let err = sync_zone(&mut mem, ZoneName::Trust, &want, FAMILY).unwrap_err();
        assert!(matches!(err, Error::KernelCommit { .. }));
        assert!(err.is_retryable());
        assert_eq!(mem.mutations(), 1);
        assert_eq!(mem.rules(ChainName::ZoneTrust).len(), 0);

        let outcome = sync_zone(&mut mem, ZoneName::Trust, &want, FAMILY).unwrap();
        assert_eq!(outcome.changes.interfaces, 2);
        for chain in [ChainName::Forward, ChainName::ZoneTrust, ChainName::ZoneUntrust] {
            assert_eq!(mem.rules(chain).len(), 1, "{chain}");
        }
    }

    #[test]
    fn test_failure_mid_policy_replace_heals() {
        let mut mem = bootstrapped();
        let want = desired(&[], ZonePolicy::EstablishedOnly, &[]);
        // First op deletes the all-permit default, the second (first append)
        // is rejected.
        mem.fail_nth_op(2, libc::ENOBUFS);
        assert!(sync_zone(&mut mem, ZoneName::Untrust, &want, FAMILY).is_err());
        assert_eq!(
            reader::list_policy(&mut mem, ZoneName::Untrust).unwrap(),
            None
        );

        let outcome = sync_zone(&mut mem, ZoneName::Untrust, &want, FAMILY).unwrap();
        assert_eq!(outcome.changes.policy, 3);
        assert_eq!(outcome.observed.policy, Some(ZonePolicy::EstablishedOnly));
    }

    #[test]
    fn test_sync_without_table_fails_cleanly() {
        let mut mem = crate::core::memory::MemoryRuleset::new();
        let err = sync_zone(
            &mut mem,
            ZoneName::Trust,
            &desired(&["eth0"], ZonePolicy::EstablishedOnly, &[]),
            FAMILY,
        )
        .unwrap_err();
        assert!(matches!(err, Error::Io(_)));
        assert_eq!(err.errno(), Some(libc::ENOENT));
        assert_eq!(mem.mutations(), 0);
    }
}

#[cfg(test)]
mod property_tests {
    use crate::core::model::{DesiredZone, ZoneName, ZonePolicy};
    use crate::core::sync::sync_zone;
    use crate::core::test_helpers::{FAMILY, bootstrapped};
    use crate::core::topology::{ChainName, Topology};
    use proptest::prelude::*;
    use std::collections::BTreeSet;

    fn interface_set() -> impl Strategy<Value = BTreeSet<String>> {
        prop::collection::btree_set("[a-z]{2,6}[0-9]", 0..5)
    }

    fn prefix_set() -> impl Strategy<Value = BTreeSet<String>> {
        prop::collection::btree_set(
            (any::<u8>(), any::<u8>()).prop_map(|(a, b)| format!("10.{a}.{b}.0/24")),
            0..4,
        )
    }

    fn policy() -> impl Strategy<Value = ZonePolicy> {
        prop_oneof![
            Just(ZonePolicy::EstablishedOnly),
            Just(ZonePolicy::AllPermit)
        ]
    }

    proptest! {
        #[test]
        fn test_any_transition_converges_and_settles(
            first in (interface_set(), policy(), prefix_set()),
            second in (interface_set(), policy(), prefix_set()),
            zone in prop_oneof![Just(ZoneName::Trust), Just(ZoneName::Untrust)],
        ) {
            let mut mem = bootstrapped();
            let (ifs, pol, prefixes) = first;
            sync_zone(&mut mem, zone, &DesiredZone::new(ifs, pol, prefixes), FAMILY).unwrap();

            let (ifs, pol, prefixes) = second;
            let want = DesiredZone::new(ifs.clone(), pol, prefixes.clone());
            let outcome = sync_zone(&mut mem, zone, &want, FAMILY).unwrap();
            prop_assert_eq!(&outcome.observed.interfaces, &ifs);
            prop_assert_eq!(outcome.observed.policy, Some(pol));
            prop_assert_eq!(&outcome.observed.addresses, &prefixes);

            // Every chain on the jump path carries exactly one jump per interface.
            for edge in Topology::jump_path(zone) {
                let jumps = crate::core::reader::list_interfaces(&mut mem, edge.chain, zone).unwrap();
                prop_assert_eq!(&jumps, &ifs);
            }
            let forward_jumps = mem.rules(ChainName::Forward).len();
            prop_assert_eq!(forward_jumps, ifs.len());

            mem.clear_journal();
            let again = sync_zone(&mut mem, zone, &want, FAMILY).unwrap();
            prop_assert_eq!(again.changes.total(), 0);
            prop_assert_eq!(mem.mutations(), 0);
        }
    }
}
