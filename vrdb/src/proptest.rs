// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Property-based tests for prefix arithmetic.

use crate::types::{Prefix, Prefix4, Prefix6};
use proptest::prelude::*;
use std::net::{Ipv4Addr, Ipv6Addr};

fn ipv4_prefix_strategy() -> impl Strategy<Value = Prefix4> {
    (any::<u32>(), 0u8..=32u8).prop_map(|(addr_bits, length)| {
        Prefix4::new(Ipv4Addr::from(addr_bits), length)
    })
}

fn ipv6_prefix_strategy() -> impl Strategy<Value = Prefix6> {
    (any::<u128>(), 0u8..=128u8).prop_map(|(addr_bits, length)| {
        Prefix6::new(Ipv6Addr::from(addr_bits), length)
    })
}

fn prefix_strategy() -> impl Strategy<Value = Prefix> {
    prop_oneof![
        ipv4_prefix_strategy().prop_map(Prefix::V4),
        ipv6_prefix_strategy().prop_map(Prefix::V6),
    ]
}

proptest! {
    #[test]
    fn prop_ipv4_host_bits_always_unset(prefix in ipv4_prefix_strategy()) {
        prop_assert!(prefix.host_bits_are_unset());
    }

    #[test]
    fn prop_ipv6_host_bits_always_unset(prefix in ipv6_prefix_strategy()) {
        prop_assert!(prefix.host_bits_are_unset());
    }

    /// Overlap must not depend on argument order.
    #[test]
    fn prop_overlap_symmetric(a in prefix_strategy(), b in prefix_strategy()) {
        prop_assert_eq!(a.overlaps(&b), b.overlaps(&a));
    }

    #[test]
    fn prop_overlap_reflexive(a in prefix_strategy()) {
        prop_assert!(a.overlaps(&a));
    }

    /// Overlap is exactly "one is within the other".
    #[test]
    fn prop_overlap_is_containment(a in prefix_strategy(), b in prefix_strategy()) {
        prop_assert_eq!(a.overlaps(&b), a.within(&b) || b.within(&a));
    }

    #[test]
    fn prop_display_parse_roundtrip(a in prefix_strategy()) {
        let parsed: Prefix = a.to_string().parse().unwrap();
        prop_assert_eq!(parsed, a);
    }

    #[test]
    fn prop_prefix_contains_own_network(a in prefix_strategy()) {
        prop_assert!(a.contains(a.addr()));
    }
}
