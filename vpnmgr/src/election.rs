// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Subnet route next hop election.
//!
//! Every subnet attached to a VPN has one aggregate route, advertised via a
//! single member node hosting a live port on the subnet. The route moves
//! through
//!
//! ```text
//!   Idle -> PendingAdvertise -> Advertised -> PendingWithdraw -> Withdrawn
//!   Idle/Withdrawn -> Advertised
//! ```
//!
//! Failed speaker calls leave the route in a pending state. Nothing here
//! retries them, the next trigger for the subnet elects again.
//!
//! Subnets of internal VPNs have no next hop to elect: their route is
//! installed locally when the subnet is attached and removed when it is
//! detached.

use crate::bgp::{AdvertiseRequest, BgpSpeaker, RouteLabel};
use crate::error::Error;
use crate::extra_route::node_tep;
use crate::fanout::RouteFanout;
use crate::idmgr::{release_route_label, route_label, IdAllocator};
use crate::lockmgr::{subnet_key, LockManager};
use crate::log::election_log;
use crate::rtindex::RouteTargetIndex;
use slog::Logger;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use uuid::Uuid;
use vrdb::{
    AdjacencyKind, AdvertisementState, Db, DpnId, RouteOrigin, SubnetConfig,
    SubnetRoute, SubnetRouteInfo, VpnInstance, VrfEntry, VrfKey,
};

/// First node of `nodes`, other than `excluded`, for which `eligible`
/// holds. Insertion order breaks ties.
pub fn select_next_hop<F>(
    nodes: &[DpnId],
    excluded: Option<DpnId>,
    mut eligible: F,
) -> Option<DpnId>
where
    F: FnMut(DpnId) -> bool,
{
    nodes
        .iter()
        .copied()
        .filter(|dpn| Some(*dpn) != excluded)
        .find(|dpn| eligible(*dpn))
}

fn is_pending(state: AdvertisementState) -> bool {
    matches!(
        state,
        AdvertisementState::PendingAdvertise
            | AdvertisementState::PendingWithdraw
    )
}

#[derive(Clone)]
pub struct SubnetRouteElector {
    db: Db,
    ids: Arc<dyn IdAllocator>,
    bgp: Arc<dyn BgpSpeaker>,
    fanout: RouteFanout,
    rtindex: RouteTargetIndex,
    locks: Arc<LockManager>,
    log: Logger,
}

impl SubnetRouteElector {
    pub fn new(
        db: Db,
        ids: Arc<dyn IdAllocator>,
        bgp: Arc<dyn BgpSpeaker>,
        fanout: RouteFanout,
        rtindex: RouteTargetIndex,
        locks: Arc<LockManager>,
        log: Logger,
    ) -> Self {
        Self {
            db,
            ids,
            bgp,
            fanout,
            rtindex,
            locks,
            log,
        }
    }

    /// Attach a subnet to its VPN. Ports already configured on the subnet
    /// become members straight away. Attaching an attached subnet runs
    /// election again.
    pub fn subnet_added(
        &self,
        cfg: &SubnetConfig,
        vpn: &VpnInstance,
    ) -> Result<(), Error> {
        let _guard = self.locks.lock(subnet_key(cfg.subnet_id));

        if let Some(mut sr) = self.load(cfg.subnet_id)? {
            if !vpn.is_bgp_vpn() {
                return Ok(());
            }
            let result = self.elect(&mut sr, vpn, None);
            self.db.put_subnet_route(&sr)?;
            return result;
        }

        self.rtindex.associate(vpn, cfg.cidr)?;
        self.db.put_subnet_config(cfg)?;

        let mut sr = SubnetRoute::new(cfg, vpn.primary_rd());
        for iface in self.db.get_interfaces()? {
            if iface.vpn_name != vpn.name {
                continue;
            }
            let on_subnet = iface.adjacencies.iter().any(|a| {
                a.kind == AdjacencyKind::Primary
                    && a.subnet_id == Some(cfg.subnet_id)
            });
            if on_subnet {
                sr.add_member(iface.dpn, &iface.name);
            }
        }

        election_log!(self.log, info,
            "subnet attached";
            "subnet" => cfg.subnet_id.to_string(),
            "vpn" => &vpn.name,
            "cidr" => cfg.cidr.to_string(),
            "members" => sr.members.len()
        );

        if !vpn.is_bgp_vpn() {
            let result = self.install_local(&mut sr, vpn);
            self.db.put_subnet_route(&sr)?;
            return result;
        }

        let result = self.elect(&mut sr, vpn, None);
        self.db.put_subnet_route(&sr)?;
        result
    }

    /// Detach a subnet. The route is withdrawn before anything is deleted.
    /// If the withdraw fails the route is kept as `PendingWithdraw` so a
    /// redelivered detach tries again.
    pub fn subnet_removed(&self, subnet_id: Uuid) -> Result<(), Error> {
        let _guard = self.locks.lock(subnet_key(subnet_id));

        let Some(mut sr) = self.db.get_subnet_route(subnet_id)? else {
            self.db.remove_subnet_config(subnet_id)?;
            return Ok(());
        };
        let vpn = self.db.get_vpn_instance(&sr.vpn_name)?;

        self.remove_forwarding(&sr, vpn.as_ref())?;

        let bgp_backed = vpn.as_ref().map(|v| v.is_bgp_vpn()).unwrap_or(true);
        let advertised = !matches!(
            sr.state,
            AdvertisementState::Idle | AdvertisementState::Withdrawn
        );
        if bgp_backed && advertised {
            if let Err(e) = self.bgp.withdraw_prefix(&sr.rd, &sr.cidr) {
                election_log!(self.log, error,
                    "withdraw failed while detaching subnet";
                    "subnet" => subnet_id.to_string(),
                    "vpn" => &sr.vpn_name,
                    "error" => format!("{e}")
                );
                sr.nexthop_dpn = None;
                sr.transition(AdvertisementState::PendingWithdraw);
                self.db.put_subnet_route(&sr)?;
                return Err(e.into());
            }
        }

        if let Some(vpn) = &vpn {
            if sr.label.is_some() || sr.vni.is_some() {
                release_route_label(self.ids.as_ref(), vpn, &sr.rd, &sr.cidr)?;
            }
        }
        self.rtindex.disassociate(&sr.vpn_name, &sr.cidr)?;
        self.db.remove_subnet_route(subnet_id)?;
        self.db.remove_subnet_config(subnet_id)?;

        election_log!(self.log, info,
            "subnet detached";
            "subnet" => subnet_id.to_string(),
            "vpn" => &sr.vpn_name,
            "cidr" => sr.cidr.to_string()
        );
        Ok(())
    }

    /// A port on `dpn` came up on the subnet.
    pub fn port_added(
        &self,
        subnet_id: Uuid,
        dpn: DpnId,
        port: &str,
    ) -> Result<(), Error> {
        let _guard = self.locks.lock(subnet_key(subnet_id));
        let Some(mut sr) = self.load(subnet_id)? else {
            election_log!(self.log, debug,
                "port on unattached subnet";
                "subnet" => subnet_id.to_string(),
                "dpn" => dpn,
                "port" => port
            );
            return Ok(());
        };
        let vpn = self.vpn(&sr)?;

        let added = sr.add_member(dpn, port);
        let needs_election = vpn.is_bgp_vpn()
            && (sr.nexthop_dpn.is_none()
                || sr.state != AdvertisementState::Advertised);

        if !needs_election {
            if added {
                self.db.put_subnet_route(&sr)?;
            }
            return Ok(());
        }
        let result = self.elect(&mut sr, &vpn, None);
        self.db.put_subnet_route(&sr)?;
        result
    }

    /// A port on `dpn` went away. Election runs if it was the last port on
    /// the current next hop, which is then excluded.
    pub fn port_removed(
        &self,
        subnet_id: Uuid,
        dpn: DpnId,
        port: &str,
    ) -> Result<(), Error> {
        let _guard = self.locks.lock(subnet_key(subnet_id));
        let Some(mut sr) = self.load(subnet_id)? else {
            return Ok(());
        };
        let vpn = self.vpn(&sr)?;

        let removed = sr.remove_member(dpn, port);
        let lost_nexthop = sr.nexthop_dpn == Some(dpn) && !sr.hosts(dpn);

        if !vpn.is_bgp_vpn() || !(lost_nexthop || is_pending(sr.state)) {
            if removed {
                self.db.put_subnet_route(&sr)?;
            }
            return Ok(());
        }
        let excluded = if lost_nexthop { Some(dpn) } else { None };
        let result = self.elect(&mut sr, &vpn, excluded);
        self.db.put_subnet_route(&sr)?;
        result
    }

    /// `dpn` lost its tunnel or its control plane connection.
    pub fn node_lost(&self, subnet_id: Uuid, dpn: DpnId) -> Result<(), Error> {
        let _guard = self.locks.lock(subnet_key(subnet_id));
        let Some(mut sr) = self.load(subnet_id)? else {
            return Ok(());
        };
        let vpn = self.vpn(&sr)?;
        if !vpn.is_bgp_vpn() {
            return Ok(());
        }

        let excluded = if sr.nexthop_dpn == Some(dpn) {
            Some(dpn)
        } else if is_pending(sr.state) {
            None
        } else {
            return Ok(());
        };
        let result = self.elect(&mut sr, &vpn, excluded);
        self.db.put_subnet_route(&sr)?;
        result
    }

    /// `dpn` became reachable. A subnet without a working next hop runs
    /// election again, and one advertised via `dpn` follows it to a new
    /// tunnel endpoint.
    pub fn node_gained(
        &self,
        subnet_id: Uuid,
        dpn: DpnId,
    ) -> Result<(), Error> {
        let _guard = self.locks.lock(subnet_key(subnet_id));
        let Some(mut sr) = self.load(subnet_id)? else {
            return Ok(());
        };
        let vpn = self.vpn(&sr)?;
        if !vpn.is_bgp_vpn() {
            return Ok(());
        }

        if sr.nexthop_dpn == Some(dpn)
            && sr.state == AdvertisementState::Advertised
        {
            if !self.tep_moved(&sr, dpn)? {
                return Ok(());
            }
            election_log!(self.log, info,
                "next hop tunnel endpoint moved";
                "subnet" => sr.subnet_id.to_string(),
                "vpn" => &sr.vpn_name,
                "dpn" => dpn
            );
            let result = self.advertise(&mut sr, &vpn, Some(dpn));
            self.db.put_subnet_route(&sr)?;
            return result;
        }

        let without_nexthop = sr.nexthop_dpn.is_none() && sr.hosts(dpn);
        if !(without_nexthop || is_pending(sr.state)) {
            return Ok(());
        }
        let result = self.elect(&mut sr, &vpn, None);
        self.db.put_subnet_route(&sr)?;
        result
    }

    /// Run election for a subnet, never choosing `excluded`, and return the
    /// resulting state. Subnets of internal VPNs are left alone.
    pub fn elect_next_hop(
        &self,
        subnet_id: Uuid,
        excluded: Option<DpnId>,
    ) -> Result<AdvertisementState, Error> {
        let _guard = self.locks.lock(subnet_key(subnet_id));
        let mut sr = self
            .load(subnet_id)?
            .ok_or_else(|| Error::NotFound(format!("subnet {subnet_id}")))?;
        let vpn = self.vpn(&sr)?;
        if !vpn.is_bgp_vpn() {
            return Ok(sr.state);
        }
        let result = self.elect(&mut sr, &vpn, excluded);
        self.db.put_subnet_route(&sr)?;
        result.map(|_| sr.state)
    }

    /// Subnets an event on `dpn` may concern: those hosting a port there,
    /// those using it as next hop and those with a pending route.
    pub fn affected_subnets(&self, dpn: DpnId) -> Result<Vec<Uuid>, Error> {
        Ok(self
            .db
            .get_subnet_routes()?
            .into_iter()
            .filter(|sr| {
                sr.hosts(dpn)
                    || sr.nexthop_dpn == Some(dpn)
                    || is_pending(sr.state)
            })
            .map(|sr| sr.subnet_id)
            .collect())
    }

    /// Load a subnet route and check it still holds together before it is
    /// touched.
    fn load(&self, subnet_id: Uuid) -> Result<Option<SubnetRoute>, Error> {
        let Some(sr) = self.db.get_subnet_route(subnet_id)? else {
            return Ok(None);
        };
        if let Err(violation) = sr.check_invariants() {
            election_log!(self.log, error,
                "subnet route invariant violated";
                "subnet" => subnet_id.to_string(),
                "vpn" => &sr.vpn_name,
                "state" => sr.state.to_string(),
                "nexthop" => format!("{:?}", sr.nexthop_dpn),
                "violation" => &violation
            );
            return Err(Error::InvariantViolation(violation));
        }
        Ok(Some(sr))
    }

    fn vpn(&self, sr: &SubnetRoute) -> Result<VpnInstance, Error> {
        self.db.get_vpn_instance(&sr.vpn_name)?.ok_or_else(|| {
            Error::NotReady(format!(
                "vpn {} of subnet {}",
                sr.vpn_name, sr.subnet_id
            ))
        })
    }

    /// Pick a next hop for `sr` and advertise or withdraw accordingly. The
    /// caller persists `sr` whatever the outcome.
    fn elect(
        &self,
        sr: &mut SubnetRoute,
        vpn: &VpnInstance,
        excluded: Option<DpnId>,
    ) -> Result<(), Error> {
        let nodes = sr.nodes();
        let mut eligible = HashSet::new();
        for dpn in &nodes {
            if self.db.get_member_node(*dpn)?.is_some_and(|n| n.is_eligible()) {
                eligible.insert(*dpn);
            }
        }
        let candidate =
            select_next_hop(&nodes, excluded, |dpn| eligible.contains(&dpn));

        election_log!(self.log, debug,
            "election";
            "subnet" => sr.subnet_id.to_string(),
            "vpn" => &sr.vpn_name,
            "nodes" => format!("{nodes:?}"),
            "excluded" => format!("{excluded:?}"),
            "elected" => format!("{candidate:?}")
        );

        match candidate {
            Some(dpn) => self.advertise(sr, vpn, Some(dpn)),
            None if sr.external => self.advertise(sr, vpn, None),
            None => self.withdraw(sr, vpn),
        }
    }

    fn label(
        &self,
        sr: &mut SubnetRoute,
        vpn: &VpnInstance,
    ) -> Result<RouteLabel, Error> {
        if let Some(label) = RouteLabel::of(sr.label, sr.vni) {
            return Ok(label);
        }
        let label = route_label(self.ids.as_ref(), vpn, &sr.rd, &sr.cidr)?;
        sr.label = label.label();
        sr.vni = label.vni();
        Ok(label)
    }

    fn forwarding_entry(
        sr: &SubnetRoute,
        nexthops: Vec<std::net::IpAddr>,
        label: RouteLabel,
    ) -> VrfEntry {
        VrfEntry {
            rd: sr.rd.clone(),
            prefix: sr.cidr,
            nexthops,
            label: label.label(),
            vni: label.vni(),
            origin: RouteOrigin::Connected,
            gateway_mac: None,
            parent_rd: None,
            subnet: Some(SubnetRouteInfo {
                subnet_id: sr.subnet_id,
                elan_tag: sr.elan_tag,
            }),
            sources: BTreeMap::new(),
        }
    }

    /// Whether the installed entry of `sr` no longer points at the tunnel
    /// endpoint `dpn` has now.
    fn tep_moved(&self, sr: &SubnetRoute, dpn: DpnId) -> Result<bool, Error> {
        let tep: Vec<_> = node_tep(&self.db, dpn)?.into_iter().collect();
        let installed = self
            .db
            .get_vrf_entry(&VrfKey::new(&sr.rd, sr.cidr))?
            .map(|e| e.nexthops);
        Ok(installed.as_ref() != Some(&tep))
    }

    fn advertise(
        &self,
        sr: &mut SubnetRoute,
        vpn: &VpnInstance,
        nexthop: Option<DpnId>,
    ) -> Result<(), Error> {
        let from = sr.state;
        let label = self.label(sr, vpn)?;
        let tep = match nexthop {
            Some(dpn) => node_tep(&self.db, dpn)?,
            None => None,
        };
        let nexthops: Vec<_> = tep.into_iter().collect();

        let entry = Self::forwarding_entry(sr, nexthops.clone(), label);
        self.db.set_vrf_entry(entry.clone())?;
        self.fanout.export_route(vpn, &entry)?;
        sr.nexthop_dpn = nexthop;

        let req = AdvertiseRequest {
            rd: sr.rd.clone(),
            prefix: sr.cidr,
            nexthops,
            encap: vpn.encap(),
            label,
            gateway_mac: None,
        };
        if let Err(e) = self.bgp.advertise_prefix(&req) {
            sr.transition(AdvertisementState::PendingAdvertise);
            election_log!(self.log, error,
                "subnet route advertise failed";
                "subnet" => sr.subnet_id.to_string(),
                "vpn" => &sr.vpn_name,
                "nexthop" => format!("{nexthop:?}"),
                "error" => format!("{e}")
            );
            return Err(e.into());
        }

        sr.transition(AdvertisementState::Advertised);
        election_log!(self.log, info,
            "subnet route advertised";
            "subnet" => sr.subnet_id.to_string(),
            "vpn" => &sr.vpn_name,
            "from" => from.to_string(),
            "nexthop" => format!("{nexthop:?}")
        );
        Ok(())
    }

    fn withdraw(
        &self,
        sr: &mut SubnetRoute,
        vpn: &VpnInstance,
    ) -> Result<(), Error> {
        let from = sr.state;
        sr.nexthop_dpn = None;
        self.remove_forwarding(sr, Some(vpn))?;

        if matches!(
            from,
            AdvertisementState::Idle | AdvertisementState::Withdrawn
        ) {
            return Ok(());
        }

        if let Err(e) = self.bgp.withdraw_prefix(&sr.rd, &sr.cidr) {
            sr.transition(AdvertisementState::PendingWithdraw);
            election_log!(self.log, error,
                "subnet route withdraw failed";
                "subnet" => sr.subnet_id.to_string(),
                "vpn" => &sr.vpn_name,
                "error" => format!("{e}")
            );
            return Err(e.into());
        }

        sr.transition(AdvertisementState::Withdrawn);
        election_log!(self.log, info,
            "subnet route withdrawn";
            "subnet" => sr.subnet_id.to_string(),
            "vpn" => &sr.vpn_name,
            "from" => from.to_string()
        );
        Ok(())
    }

    /// Subnet route of an internal VPN: forwarded locally, never advertised.
    fn install_local(
        &self,
        sr: &mut SubnetRoute,
        vpn: &VpnInstance,
    ) -> Result<(), Error> {
        let label = self.label(sr, vpn)?;
        let entry = Self::forwarding_entry(sr, Vec::new(), label);
        self.db.set_vrf_entry(entry)?;
        election_log!(self.log, info,
            "subnet route installed locally";
            "subnet" => sr.subnet_id.to_string(),
            "vpn" => &sr.vpn_name
        );
        Ok(())
    }

    fn remove_forwarding(
        &self,
        sr: &SubnetRoute,
        vpn: Option<&VpnInstance>,
    ) -> Result<(), Error> {
        let removed = self.db.remove_vrf_entry(&VrfKey::new(&sr.rd, sr.cidr))?;
        if let (Some(change), Some(vpn)) = (removed, vpn) {
            self.fanout.withdraw_route(vpn, change.entry())?;
        }
        Ok(())
    }
}
