// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Route distinguisher allocation for extra routes.
//!
//! A forwarding entry is keyed by RD and prefix, so every next hop of an
//! extra route needs an RD before it can be installed. Allocations are
//! persisted per (vpn id, prefix, next hop) and reused wherever possible so
//! multipath state comes back the same after a restart:
//!
//! 1. the exact tuple already holds an RD,
//! 2. another next hop of the prefix resolves to the same member node,
//! 3. the first VPN RD not yet used for the prefix (or, for an internal
//!    VPN, the member node id qualified by the VPN name).
//!
//! Anything else is exhaustion.
//!
//! All next hops sharing an RD share one forwarding entry. Removing one of
//! several refreshes the entry in place rather than deleting it.

use crate::bgp::{AdvertiseRequest, BgpSpeaker, RouteLabel};
use crate::error::Error;
use crate::fanout::RouteFanout;
use crate::idmgr::{release_route_label, route_label, IdAllocator};
use crate::lockmgr::{prefix_key, LockManager};
use crate::log::route_log;
use slog::Logger;
use std::collections::BTreeMap;
use std::net::IpAddr;
use std::sync::Arc;
use vrdb::{
    Db, DpnId, ExtraRouteAllocation, Prefix, RouteOrigin, VpnInstance,
    VrfEntry, VrfKey,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RdAllocation {
    /// This exact next hop already held the RD.
    Exact(String),
    /// A next hop on the same member node held the RD.
    NodeReuse(String),
    Fresh(String),
}

impl RdAllocation {
    pub fn rd(&self) -> &str {
        match self {
            Self::Exact(rd) | Self::NodeReuse(rd) | Self::Fresh(rd) => rd,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoveOutcome {
    /// No allocation for the next hop.
    NotFound,
    /// Other next hops remain under the RD, the entry was updated.
    Refreshed,
    /// The RD is free again and the entry is gone.
    Released,
}

/// The member node an address lives on, via the prefix-to-interface index.
pub(crate) fn resolve_dpn(
    db: &Db,
    vpn_id: u32,
    addr: IpAddr,
) -> Result<Option<DpnId>, Error> {
    Ok(db
        .get_prefix_to_interface(vpn_id, &Prefix::host(addr))?
        .map(|p| p.dpn))
}

/// Every RD the forwarding entries of `vpn` may live under, node RDs of
/// its extra routes included.
pub(crate) fn vpn_rds(
    db: &Db,
    vpn: &VpnInstance,
) -> Result<Vec<String>, Error> {
    let mut rds = vpn.all_rds();
    for a in db.get_vpn_allocations(vpn.vpn_id)? {
        if !rds.contains(&a.rd) {
            rds.push(a.rd);
        }
    }
    Ok(rds)
}

pub(crate) fn node_tep(db: &Db, dpn: DpnId) -> Result<Option<IpAddr>, Error> {
    Ok(db.get_member_node(dpn)?.and_then(|n| n.tep))
}

/// Tunnel endpoints to advertise for a set of next hops. Next hops that are
/// not on a member node are advertised as they are.
pub(crate) fn resolve_teps(
    db: &Db,
    vpn_id: u32,
    nexthops: &[IpAddr],
) -> Result<Vec<IpAddr>, Error> {
    let mut teps = Vec::new();
    for nh in nexthops {
        let tep = match resolve_dpn(db, vpn_id, *nh)? {
            Some(dpn) => node_tep(db, dpn)?,
            None => Some(*nh),
        };
        if let Some(tep) = tep {
            if !teps.contains(&tep) {
                teps.push(tep);
            }
        }
    }
    Ok(teps)
}

#[derive(Clone)]
pub struct ExtraRouteAllocator {
    db: Db,
    ids: Arc<dyn IdAllocator>,
    bgp: Arc<dyn BgpSpeaker>,
    fanout: RouteFanout,
    locks: Arc<LockManager>,
    log: Logger,
}

impl ExtraRouteAllocator {
    pub fn new(
        db: Db,
        ids: Arc<dyn IdAllocator>,
        bgp: Arc<dyn BgpSpeaker>,
        fanout: RouteFanout,
        locks: Arc<LockManager>,
        log: Logger,
    ) -> Self {
        Self {
            db,
            ids,
            bgp,
            fanout,
            locks,
            log,
        }
    }

    /// Find or allocate the RD for `nexthop` behind `prefix` and persist
    /// it. Callers hold the prefix lock.
    pub fn allocate_rd(
        &self,
        vpn: &VpnInstance,
        prefix: &Prefix,
        nexthop: IpAddr,
    ) -> Result<RdAllocation, Error> {
        if let Some(a) =
            self.db.get_extra_route_alloc(vpn.vpn_id, prefix, &nexthop)?
        {
            return Ok(RdAllocation::Exact(a.rd));
        }

        let existing = self.db.get_prefix_allocations(vpn.vpn_id, prefix)?;
        let dpn = resolve_dpn(&self.db, vpn.vpn_id, nexthop)?;

        let mut allocation = None;
        if let Some(dpn) = dpn {
            for a in &existing {
                if resolve_dpn(&self.db, vpn.vpn_id, a.nexthop)? == Some(dpn) {
                    allocation = Some(RdAllocation::NodeReuse(a.rd.clone()));
                    break;
                }
            }
        }

        let allocation = match allocation {
            Some(a) => a,
            None if vpn.is_bgp_vpn() => {
                let rd = vpn
                    .rds
                    .iter()
                    .find(|rd| !existing.iter().any(|a| &a.rd == *rd))
                    .ok_or_else(|| {
                        Error::Exhausted(format!(
                            "all {} rds of vpn {} used for {prefix}",
                            vpn.rds.len(),
                            vpn.name
                        ))
                    })?;
                RdAllocation::Fresh(rd.clone())
            }
            None => {
                let dpn = dpn.ok_or_else(|| {
                    Error::NotReady(format!(
                        "next hop {nexthop} of {prefix} in vpn {} is not on \
                         a known member node",
                        vpn.name
                    ))
                })?;
                RdAllocation::Fresh(vpn.node_rd(dpn))
            }
        };

        self.db.put_extra_route_alloc(&ExtraRouteAllocation {
            vpn_id: vpn.vpn_id,
            prefix: *prefix,
            nexthop,
            rd: allocation.rd().to_string(),
        })?;
        Ok(allocation)
    }

    /// Install `prefix` via `nexthop` and advertise it.
    pub fn add_route(
        &self,
        vpn: &VpnInstance,
        prefix: Prefix,
        nexthop: IpAddr,
        origin: RouteOrigin,
    ) -> Result<RdAllocation, Error> {
        let _guard = self.locks.lock(prefix_key(&vpn.name, &prefix));

        let allocation = match self.allocate_rd(vpn, &prefix, nexthop) {
            Ok(a) => a,
            Err(e) => {
                route_log!(self.log, error,
                    "no route distinguisher for extra route";
                    "vpn" => &vpn.name,
                    "prefix" => prefix.to_string(),
                    "nexthop" => nexthop.to_string(),
                    "error" => format!("{e}")
                );
                return Err(e);
            }
        };
        let rd = allocation.rd().to_string();
        let label = route_label(self.ids.as_ref(), vpn, &rd, &prefix)?;

        let key = VrfKey::new(&rd, prefix);
        let mut installed = None;
        self.db.update_vrf_entry(&key, |current| {
            let mut entry = current.cloned().unwrap_or_else(|| VrfEntry {
                rd: rd.clone(),
                prefix,
                nexthops: Vec::new(),
                label: label.label(),
                vni: label.vni(),
                origin,
                gateway_mac: None,
                parent_rd: None,
                subnet: None,
                sources: BTreeMap::new(),
            });
            if !entry.nexthops.contains(&nexthop) {
                entry.nexthops.push(nexthop);
            }
            installed = Some(entry.clone());
            Some(entry)
        })?;
        let Some(entry) = installed else {
            return Ok(allocation);
        };

        route_log!(self.log, info,
            "extra route installed";
            "vpn" => &vpn.name,
            "prefix" => prefix.to_string(),
            "nexthop" => nexthop.to_string(),
            "rd" => &rd,
            "allocation" => format!("{allocation:?}")
        );

        self.fanout.export_route(vpn, &entry)?;
        self.advertise(vpn, &entry, label)?;
        Ok(allocation)
    }

    /// Remove `nexthop` from `prefix`.
    pub fn remove_route(
        &self,
        vpn: &VpnInstance,
        prefix: Prefix,
        nexthop: IpAddr,
    ) -> Result<RemoveOutcome, Error> {
        let _guard = self.locks.lock(prefix_key(&vpn.name, &prefix));

        let Some(alloc) =
            self.db.get_extra_route_alloc(vpn.vpn_id, &prefix, &nexthop)?
        else {
            route_log!(self.log, debug,
                "no allocation for removed extra route";
                "vpn" => &vpn.name,
                "prefix" => prefix.to_string(),
                "nexthop" => nexthop.to_string()
            );
            return Ok(RemoveOutcome::NotFound);
        };
        let rd = alloc.rd;
        let others = self
            .db
            .get_prefix_allocations(vpn.vpn_id, &prefix)?
            .into_iter()
            .filter(|a| a.rd == rd && a.nexthop != nexthop)
            .count();
        self.db
            .remove_extra_route_alloc(vpn.vpn_id, &prefix, &nexthop)?;

        let key = VrfKey::new(&rd, prefix);

        if others > 0 {
            let mut refreshed = None;
            self.db.update_vrf_entry(&key, |current| {
                let mut entry = current?.clone();
                entry.nexthops.retain(|nh| nh != &nexthop);
                refreshed = Some(entry.clone());
                Some(entry)
            })?;
            route_log!(self.log, info,
                "extra route refreshed";
                "vpn" => &vpn.name,
                "prefix" => prefix.to_string(),
                "nexthop" => nexthop.to_string(),
                "rd" => &rd,
                "remaining" => others
            );
            if let Some(entry) = refreshed {
                // importers hold the old next hops until refreshed
                self.fanout.export_route(vpn, &entry)?;
                if let Some(label) = RouteLabel::of(entry.label, entry.vni) {
                    self.advertise(vpn, &entry, label)?;
                }
            }
            return Ok(RemoveOutcome::Refreshed);
        }

        let removed = self.db.remove_vrf_entry(&key)?;
        release_route_label(self.ids.as_ref(), vpn, &rd, &prefix)?;
        route_log!(self.log, info,
            "extra route released";
            "vpn" => &vpn.name,
            "prefix" => prefix.to_string(),
            "nexthop" => nexthop.to_string(),
            "rd" => &rd
        );
        if let Some(change) = removed {
            self.fanout.withdraw_route(vpn, change.entry())?;
        }
        if vpn.is_bgp_vpn() {
            self.bgp.withdraw_prefix(&rd, &prefix)?;
        }
        Ok(RemoveOutcome::Released)
    }

    fn advertise(
        &self,
        vpn: &VpnInstance,
        entry: &VrfEntry,
        label: RouteLabel,
    ) -> Result<(), Error> {
        if !vpn.is_bgp_vpn() {
            return Ok(());
        }
        let nexthops = resolve_teps(&self.db, vpn.vpn_id, &entry.nexthops)?;
        let req = AdvertiseRequest {
            rd: entry.rd.clone(),
            prefix: entry.prefix,
            nexthops,
            encap: vpn.encap(),
            label,
            gateway_mac: entry.gateway_mac.clone(),
        };
        if let Err(e) = self.bgp.advertise_prefix(&req) {
            route_log!(self.log, error,
                "advertise failed";
                "vpn" => &vpn.name,
                "rd" => &entry.rd,
                "prefix" => entry.prefix.to_string(),
                "error" => format!("{e}")
            );
            return Err(e.into());
        }
        Ok(())
    }
}
