// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The L3VPN route distribution engine.
//!
//! Keeps a tenant's VPN forwarding state consistent across member nodes as
//! ports, tunnels and nodes come and go, and decides what is advertised to
//! the BGP speaker. Work arrives as [`manager::Event`]s which the
//! [`manager::VpnManager`] turns into jobs on a key-partitioned
//! [`queue::JobCoordinator`].

pub mod adjacency;
pub mod bgp;
pub mod config;
pub mod election;
pub mod error;
pub mod extra_route;
pub mod fanout;
pub mod flows;
pub mod idmgr;
pub mod inflight;
pub mod lockmgr;
pub mod log;
pub mod manager;
pub mod queue;
pub mod rtindex;
pub mod vpn;

#[cfg(test)]
mod proptest;


pub const COMPONENT_VPNMGR: &str = "vpnmgr";
pub const MOD_ENGINE: &str = "engine";
pub const MOD_QUEUE: &str = "queue";
