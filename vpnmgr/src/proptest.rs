// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Property-based tests for next hop election, subnet overlap and route
//! distinguisher allocation.

use crate::election::select_next_hop;
use crate::extra_route::{RdAllocation, RemoveOutcome};
use crate::idmgr::label_key;
use crate::manager::Event;
use crate::rtindex::are_subnets_overlapping;
use crate::test::{bgp_vpn, Harness};
use itertools::Itertools;
use proptest::prelude::*;
use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use vrdb::{DpnId, Prefix, Prefix4, Prefix6, RouteOrigin};

fn prefix_strategy() -> impl Strategy<Value = Prefix> {
    prop_oneof![
        (any::<u32>(), 0u8..=32u8).prop_map(|(bits, len)| {
            Prefix::V4(Prefix4::new(Ipv4Addr::from(bits), len))
        }),
        (any::<u128>(), 0u8..=128u8).prop_map(|(bits, len)| {
            Prefix::V6(Prefix6::new(Ipv6Addr::from(bits), len))
        }),
    ]
}

/// A VPN with up to four RDs and distinct next hops for one IPv4 prefix,
/// never more next hops than RDs, plus which next hop to release.
fn rd_strategy() -> impl Strategy<Value = (usize, Prefix, Vec<IpAddr>, usize)>
{
    (1usize..=4).prop_flat_map(|rds| {
        (
            Just(rds),
            (any::<u32>(), 8u8..=32u8).prop_map(|(bits, len)| {
                Prefix::V4(Prefix4::new(Ipv4Addr::from(bits), len))
            }),
            prop::collection::hash_set(any::<u32>(), 1..=rds).prop_map(|s| {
                s.into_iter()
                    .map(|n| IpAddr::V4(Ipv4Addr::from(n)))
                    .collect::<Vec<_>>()
            }),
            0usize..4,
        )
    })
}

/// Distinct member nodes in insertion order, a subset of them eligible and
/// maybe one excluded.
fn election_strategy(
) -> impl Strategy<Value = (Vec<DpnId>, HashSet<DpnId>, Option<DpnId>)> {
    prop::collection::vec(0u64..16, 0..10).prop_flat_map(|raw| {
        let nodes: Vec<DpnId> = raw.into_iter().unique().collect();
        let n = nodes.len();
        (
            Just(nodes.clone()),
            prop::collection::vec(any::<bool>(), n),
            prop::option::of(0u64..16),
        )
            .prop_map(|(nodes, flags, excluded)| {
                let eligible = nodes
                    .iter()
                    .zip(flags)
                    .filter(|(_, e)| *e)
                    .map(|(d, _)| *d)
                    .collect();
                (nodes, eligible, excluded)
            })
    })
}

proptest! {
    #[test]
    fn prop_election_picks_first_usable_node(
        (nodes, eligible, excluded) in election_strategy()
    ) {
        let usable = |d: &DpnId| Some(*d) != excluded && eligible.contains(d);
        let chosen =
            select_next_hop(&nodes, excluded, |d| eligible.contains(&d));
        match chosen {
            Some(dpn) => {
                prop_assert!(usable(&dpn));
                let pos = nodes.iter().position(|d| *d == dpn);
                prop_assert!(pos.is_some());
                let before = &nodes[..pos.unwrap_or(0)];
                prop_assert!(before.iter().all(|d| !usable(d)));
            }
            None => prop_assert!(nodes.iter().all(|d| !usable(d))),
        }
    }

    #[test]
    fn prop_election_is_deterministic(
        (nodes, eligible, excluded) in election_strategy()
    ) {
        let first =
            select_next_hop(&nodes, excluded, |d| eligible.contains(&d));
        let second =
            select_next_hop(&nodes, excluded, |d| eligible.contains(&d));
        prop_assert_eq!(first, second);
    }

    #[test]
    fn prop_overlap_is_symmetric(
        a in prefix_strategy(),
        b in prefix_strategy(),
    ) {
        prop_assert_eq!(
            are_subnets_overlapping(&a, &b),
            are_subnets_overlapping(&b, &a)
        );
    }

    #[test]
    fn prop_prefix_overlaps_itself_and_its_subnets(
        a in prefix_strategy(),
        extra in 0u8..=8u8,
    ) {
        prop_assert!(are_subnets_overlapping(&a, &a));
        let max = if a.is_v4() { 32 } else { 128 };
        let len = a.length().saturating_add(extra).min(max);
        let longer = Prefix::new(a.addr(), len);
        prop_assert!(are_subnets_overlapping(&a, &longer));
    }

    #[test]
    fn prop_label_keys_are_distinct(
        a in prefix_strategy(),
        b in prefix_strategy(),
    ) {
        prop_assume!(a != b);
        prop_assert_ne!(label_key("100:1", &a), label_key("100:1", &b));
    }
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 24,
        ..ProptestConfig::default()
    })]

    #[test]
    fn prop_rd_allocation_is_stable(
        (rds, prefix, nexthops, pick) in rd_strategy()
    ) {
        let h = Harness::new("prop_rd_allocation_is_stable");
        let names: Vec<String> =
            (1..=rds).map(|i| format!("100:{i}")).collect();
        let names: Vec<&str> = names.iter().map(String::as_str).collect();
        h.apply(Event::VpnAdded(bgp_vpn("blue", &names, &[], &[])))
            .unwrap();
        let vpn = h.engine.vpns.wait_for_vpn("blue").unwrap();
        let extra = &h.engine.extra;

        let mut held = Vec::new();
        for nh in &nexthops {
            let a = extra
                .add_route(&vpn, prefix, *nh, RouteOrigin::Static)
                .unwrap();
            prop_assert!(matches!(a, RdAllocation::Fresh(_)));
            held.push(a.rd().to_string());
        }
        prop_assert_eq!(held.iter().unique().count(), held.len());

        // asking again hands out the same RD every time
        for _ in 0..2 {
            for (nh, rd) in nexthops.iter().zip(&held) {
                let again = extra
                    .add_route(&vpn, prefix, *nh, RouteOrigin::Static)
                    .unwrap();
                prop_assert_eq!(again, RdAllocation::Exact(rd.clone()));
            }
        }

        // a released RD comes back to the next hop that gave it up
        let i = pick % nexthops.len();
        let outcome = extra.remove_route(&vpn, prefix, nexthops[i]).unwrap();
        prop_assert_eq!(outcome, RemoveOutcome::Released);
        let back = extra
            .add_route(&vpn, prefix, nexthops[i], RouteOrigin::Static)
            .unwrap();
        prop_assert_eq!(back, RdAllocation::Fresh(held[i].clone()));
    }
}
