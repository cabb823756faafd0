// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Interface adjacency lifecycle.
//!
//! An interface change is applied as a diff of its old and new adjacency
//! lists, matched by IP address, so that removed adjacencies give back
//! their labels and RDs and added ones allocate theirs. The interface lock
//! is held only while the diff is computed and the new record written;
//! the resulting route work takes the locks of the prefixes it touches.

use crate::bgp::{AdvertiseRequest, BgpSpeaker};
use crate::error::Error;
use crate::extra_route::{node_tep, ExtraRouteAllocator};
use crate::fanout::RouteFanout;
use crate::flows::FlowProgrammer;
use crate::idmgr::{release_route_label, route_label, IdAllocator};
use crate::inflight::DeleteTracker;
use crate::lockmgr::{interface_key, prefix_key, LockManager};
use crate::log::adj_log;
use slog::Logger;
use std::collections::BTreeMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;
use vrdb::{
    Adjacency, AdjacencyKind, Db, DpnId, PrefixToInterface, RouteOrigin,
    VpnInstance, VpnInterface, VrfEntry, VrfKey,
};

/// Subnet membership changes produced by primary adjacencies. These are
/// run as subnet election jobs by the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubnetTrigger {
    PortUp {
        subnet_id: Uuid,
        dpn: DpnId,
        port: String,
    },
    PortDown {
        subnet_id: Uuid,
        dpn: DpnId,
        port: String,
    },
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct AdjacencyDiff {
    pub added: Vec<Adjacency>,
    pub removed: Vec<Adjacency>,
    /// Extra routes present on both sides whose next hops changed, as
    /// (old, new).
    pub changed: Vec<(Adjacency, Adjacency)>,
}

/// Match adjacencies by IP. Anything else that differs on a match is
/// handled as a removal followed by an addition, except a change of an
/// extra route's next hops, which is applied next hop by next hop.
pub fn diff_adjacencies(old: &[Adjacency], new: &[Adjacency]) -> AdjacencyDiff {
    let mut diff = AdjacencyDiff::default();
    for o in old {
        match new.iter().find(|n| n.ip == o.ip) {
            None => diff.removed.push(o.clone()),
            Some(n) if n == o => {}
            Some(n)
                if n.kind == AdjacencyKind::ExtraRoute
                    && o.kind == AdjacencyKind::ExtraRoute =>
            {
                diff.changed.push((o.clone(), n.clone()));
            }
            Some(n) => {
                diff.removed.push(o.clone());
                diff.added.push(n.clone());
            }
        }
    }
    for n in new {
        if !old.iter().any(|o| o.ip == n.ip) {
            diff.added.push(n.clone());
        }
    }
    diff
}

#[derive(Clone)]
pub struct AdjacencyCoordinator {
    db: Db,
    ids: Arc<dyn IdAllocator>,
    bgp: Arc<dyn BgpSpeaker>,
    flows: Arc<dyn FlowProgrammer>,
    fanout: RouteFanout,
    extra: ExtraRouteAllocator,
    locks: Arc<LockManager>,
    deletes: DeleteTracker,
    delete_wait: Duration,
    log: Logger,
}

/// Keep going through a list of route operations and report the first
/// failure at the end.
fn first_error(
    first: &mut Option<Error>,
    result: Result<(), Error>,
    log: &Logger,
    what: &str,
) {
    if let Err(e) = result {
        adj_log!(log, error,
            "adjacency operation failed";
            "operation" => what,
            "error" => format!("{e}")
        );
        if first.is_none() {
            *first = Some(e);
        }
    }
}

impl AdjacencyCoordinator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        db: Db,
        ids: Arc<dyn IdAllocator>,
        bgp: Arc<dyn BgpSpeaker>,
        flows: Arc<dyn FlowProgrammer>,
        fanout: RouteFanout,
        extra: ExtraRouteAllocator,
        locks: Arc<LockManager>,
        deletes: DeleteTracker,
        delete_wait: Duration,
        log: Logger,
    ) -> Self {
        Self {
            db,
            ids,
            bgp,
            flows,
            fanout,
            extra,
            locks,
            deletes,
            delete_wait,
            log,
        }
    }

    pub fn deletes(&self) -> &DeleteTracker {
        &self.deletes
    }

    /// Add or update an interface. If a delete of the same interface from
    /// the same VPN is still in flight, wait for it up to the configured
    /// bound and abandon the add on timeout.
    ///
    /// Subnet membership changes are pushed to `triggers` even when some
    /// adjacency fails, so the caller can act on what did happen.
    pub fn add_interface(
        &self,
        iface: VpnInterface,
        vpn: &VpnInstance,
        triggers: &mut Vec<SubnetTrigger>,
    ) -> Result<(), Error> {
        if !self.deletes.wait(&iface.name, &iface.vpn_name, self.delete_wait) {
            adj_log!(self.log, error,
                "abandoning interface add, delete still in flight";
                "interface" => &iface.name,
                "vpn" => &iface.vpn_name,
                "waited" => format!("{:?}", self.delete_wait)
            );
            return Err(Error::Timeout(format!(
                "delete of interface {} from vpn {} still in flight",
                iface.name, iface.vpn_name
            )));
        }

        let (old, diff) = {
            let _guard = self.locks.lock(interface_key(&iface.name));
            let old = self.db.get_interface(&iface.name)?;
            let old_adjs = match &old {
                Some(o)
                    if o.vpn_name == iface.vpn_name && o.dpn == iface.dpn =>
                {
                    o.adjacencies.clone()
                }
                _ => Vec::new(),
            };
            let diff = diff_adjacencies(&old_adjs, &iface.adjacencies);
            self.db.put_interface(&iface)?;
            (old, diff)
        };

        let mut first = None;

        // An interface that moved is torn down completely from where it was.
        let moved =
            old.filter(|o| o.vpn_name != iface.vpn_name || o.dpn != iface.dpn);
        if let Some(o) = moved {
            if let Some(old_vpn) = self.db.get_vpn_instance(&o.vpn_name)? {
                for adj in &o.adjacencies {
                    let r = self.remove_adjacency(&old_vpn, &o, adj, triggers);
                    first_error(&mut first, r, &self.log, "remove");
                }
            }
        }

        for adj in &diff.removed {
            let r = self.remove_adjacency(vpn, &iface, adj, triggers);
            first_error(&mut first, r, &self.log, "remove");
        }
        for (o, n) in &diff.changed {
            for nh in o.nexthops.iter().filter(|nh| !n.nexthops.contains(nh)) {
                let r = self.extra.remove_route(vpn, n.ip, *nh).map(|_| ());
                first_error(&mut first, r, &self.log, "remove next hop");
            }
            for nh in n.nexthops.iter().filter(|nh| !o.nexthops.contains(nh)) {
                let r = self
                    .extra
                    .add_route(vpn, n.ip, *nh, RouteOrigin::Static)
                    .map(|_| ());
                first_error(&mut first, r, &self.log, "add next hop");
            }
        }
        for adj in &diff.added {
            let r = self.add_adjacency(vpn, &iface, adj, triggers);
            first_error(&mut first, r, &self.log, "add");
        }

        adj_log!(self.log, info,
            "interface applied";
            "interface" => &iface.name,
            "vpn" => &iface.vpn_name,
            "added" => diff.added.len(),
            "removed" => diff.removed.len(),
            "changed" => diff.changed.len()
        );

        first.map_or(Ok(()), Err)
    }

    /// Remove an interface and everything its adjacencies installed. Adds
    /// of the same interface wait until the forwarding changes made here
    /// have been delivered to forwarding table watchers.
    pub fn remove_interface(
        &self,
        name: &str,
        triggers: &mut Vec<SubnetTrigger>,
    ) -> Result<(), Error> {
        let (old, ticket) = {
            let _guard = self.locks.lock(interface_key(name));
            let Some(old) = self.db.get_interface(name)? else {
                return Ok(());
            };
            let ticket = self.deletes.begin(name, &old.vpn_name);
            self.db.remove_interface(name)?;
            (old, ticket)
        };

        let Some(vpn) = self.db.get_vpn_instance(&old.vpn_name)? else {
            adj_log!(self.log, warn,
                "interface removed after its vpn";
                "interface" => name,
                "vpn" => &old.vpn_name
            );
            return Ok(());
        };

        let mut first = None;
        for adj in &old.adjacencies {
            let r = self.remove_adjacency(&vpn, &old, adj, triggers);
            first_error(&mut first, r, &self.log, "remove");
        }
        ticket.settle_at(self.db.generation());

        adj_log!(self.log, info,
            "interface removed";
            "interface" => name,
            "vpn" => &old.vpn_name
        );
        first.map_or(Ok(()), Err)
    }

    fn add_adjacency(
        &self,
        vpn: &VpnInstance,
        iface: &VpnInterface,
        adj: &Adjacency,
        triggers: &mut Vec<SubnetTrigger>,
    ) -> Result<(), Error> {
        match adj.kind {
            AdjacencyKind::Primary => {
                self.add_primary(vpn, iface, adj)?;
                if let Some(subnet_id) = adj.subnet_id {
                    triggers.push(SubnetTrigger::PortUp {
                        subnet_id,
                        dpn: iface.dpn,
                        port: iface.name.clone(),
                    });
                }
                Ok(())
            }
            AdjacencyKind::ExtraRoute => {
                let mut first = None;
                for nh in &adj.nexthops {
                    let r = self
                        .extra
                        .add_route(vpn, adj.ip, *nh, RouteOrigin::Static)
                        .map(|_| ());
                    first_error(&mut first, r, &self.log, "add extra route");
                }
                first.map_or(Ok(()), Err)
            }
            AdjacencyKind::LearntIp => {
                let nh = self.learnt_nexthop(iface, adj)?;
                self.extra
                    .add_route(vpn, adj.ip, nh, RouteOrigin::Dynamic)
                    .map(|_| ())
            }
        }
    }

    fn remove_adjacency(
        &self,
        vpn: &VpnInstance,
        iface: &VpnInterface,
        adj: &Adjacency,
        triggers: &mut Vec<SubnetTrigger>,
    ) -> Result<(), Error> {
        match adj.kind {
            AdjacencyKind::Primary => {
                self.remove_primary(vpn, iface, adj)?;
                if let Some(subnet_id) = adj.subnet_id {
                    triggers.push(SubnetTrigger::PortDown {
                        subnet_id,
                        dpn: iface.dpn,
                        port: iface.name.clone(),
                    });
                }
                Ok(())
            }
            AdjacencyKind::ExtraRoute => {
                let mut first = None;
                for nh in &adj.nexthops {
                    let r =
                        self.extra.remove_route(vpn, adj.ip, *nh).map(|_| ());
                    first_error(&mut first, r, &self.log, "remove extra route");
                }
                first.map_or(Ok(()), Err)
            }
            AdjacencyKind::LearntIp => {
                let nh = self.learnt_nexthop(iface, adj)?;
                self.extra.remove_route(vpn, adj.ip, nh).map(|_| ())
            }
        }
    }

    /// Learnt addresses without an explicit next hop are reached through
    /// the interface's own address.
    fn learnt_nexthop(
        &self,
        iface: &VpnInterface,
        adj: &Adjacency,
    ) -> Result<IpAddr, Error> {
        if let Some(nh) = adj.nexthops.first() {
            return Ok(*nh);
        }
        iface.primary_ip().ok_or_else(|| {
            Error::InvalidArgument(format!(
                "interface {} has a learnt address but no primary address",
                iface.name
            ))
        })
    }

    fn add_primary(
        &self,
        vpn: &VpnInstance,
        iface: &VpnInterface,
        adj: &Adjacency,
    ) -> Result<(), Error> {
        let _guard = self.locks.lock(prefix_key(&vpn.name, &adj.ip));

        self.db.put_prefix_to_interface(&PrefixToInterface {
            vpn_id: vpn.vpn_id,
            ip: adj.ip,
            dpn: iface.dpn,
            interface: iface.name.clone(),
            subnet_id: adj.subnet_id,
        })?;

        let rd = vpn.primary_rd();
        let label = route_label(self.ids.as_ref(), vpn, &rd, &adj.ip)?;
        let nexthops: Vec<IpAddr> =
            node_tep(&self.db, iface.dpn)?.into_iter().collect();
        let gateway_mac = if adj.gateway { adj.mac.clone() } else { None };
        let entry = VrfEntry {
            rd: rd.clone(),
            prefix: adj.ip,
            nexthops: nexthops.clone(),
            label: label.label(),
            vni: label.vni(),
            origin: RouteOrigin::Local,
            gateway_mac: gateway_mac.clone(),
            parent_rd: None,
            subnet: None,
            sources: BTreeMap::new(),
        };
        self.db.set_vrf_entry(entry.clone())?;
        self.fanout.export_route(vpn, &entry)?;

        if let Some(mac) = &adj.mac {
            self.flows.install_arp_responder(
                iface.dpn,
                &iface.name,
                adj.ip.addr(),
                mac,
            )?;
            if adj.gateway {
                self.flows.install_gateway_mac(iface.dpn, vpn.vpn_id, mac)?;
            }
        }

        if vpn.is_bgp_vpn() {
            if nexthops.is_empty() {
                adj_log!(self.log, debug,
                    "no tunnel endpoint yet, not advertising";
                    "interface" => &iface.name,
                    "dpn" => iface.dpn,
                    "ip" => adj.ip.to_string()
                );
            } else {
                self.bgp.advertise_prefix(&AdvertiseRequest {
                    rd,
                    prefix: adj.ip,
                    nexthops,
                    encap: vpn.encap(),
                    label,
                    gateway_mac,
                })?;
            }
        }

        adj_log!(self.log, debug,
            "primary adjacency added";
            "interface" => &iface.name,
            "vpn" => &vpn.name,
            "ip" => adj.ip.to_string()
        );
        Ok(())
    }

    fn remove_primary(
        &self,
        vpn: &VpnInstance,
        iface: &VpnInterface,
        adj: &Adjacency,
    ) -> Result<(), Error> {
        let _guard = self.locks.lock(prefix_key(&vpn.name, &adj.ip));

        let rd = vpn.primary_rd();
        if let Some(change) =
            self.db.remove_vrf_entry(&VrfKey::new(&rd, adj.ip))?
        {
            self.fanout.withdraw_route(vpn, change.entry())?;
        }
        release_route_label(self.ids.as_ref(), vpn, &rd, &adj.ip)?;
        self.db.remove_prefix_to_interface(vpn.vpn_id, &adj.ip)?;

        if let Some(mac) = &adj.mac {
            self.flows.remove_arp_responder(
                iface.dpn,
                &iface.name,
                adj.ip.addr(),
                mac,
            )?;
            if adj.gateway {
                self.flows.remove_gateway_mac(iface.dpn, vpn.vpn_id, mac)?;
            }
        }

        if vpn.is_bgp_vpn() {
            self.bgp.withdraw_prefix(&rd, &adj.ip)?;
        }

        adj_log!(self.log, debug,
            "primary adjacency removed";
            "interface" => &iface.name,
            "vpn" => &vpn.name,
            "ip" => adj.ip.to_string()
        );
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;
    use vpn_common::{cidr, ip};

    #[test]
    fn diff_matches_by_ip() {
        let p = Adjacency::primary(ip!("10.0.0.5"), "a8:40:25:00:00:01", None);
        let learnt = Adjacency::learnt(ip!("10.0.0.9"), "a8:40:25:00:00:09");
        let er_old = Adjacency::extra_route(
            cidr!("192.168.0.0/24"),
            vec![ip!("10.0.0.5")],
        );
        let er_new = Adjacency::extra_route(
            cidr!("192.168.0.0/24"),
            vec![ip!("10.0.0.5"), ip!("10.0.0.6")],
        );
        let p_moved_mac =
            Adjacency::primary(ip!("10.0.0.5"), "a8:40:25:00:00:02", None);

        let old = vec![p.clone(), learnt.clone(), er_old.clone()];
        let new = vec![p_moved_mac.clone(), er_new.clone()];
        let diff = diff_adjacencies(&old, &new);

        assert_eq!(diff.removed, vec![p, learnt]);
        assert_eq!(diff.added, vec![p_moved_mac]);
        assert_eq!(diff.changed, vec![(er_old, er_new)]);
    }

    #[test]
    fn identical_lists_diff_empty() {
        let adjs = vec![
            Adjacency::primary(ip!("10.0.0.5"), "a8:40:25:00:00:01", None),
            Adjacency::extra_route(
                cidr!("192.168.0.0/24"),
                vec![ip!("10.0.0.5")],
            ),
        ];
        assert_eq!(diff_adjacencies(&adjs, &adjs), AdjacencyDiff::default());
    }
}
