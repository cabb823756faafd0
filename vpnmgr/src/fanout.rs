// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Route import/export between VPNs linked by route targets.
//!
//! Only routes of a controller managed, non-link origin travel. A copy
//! lands under the importing VPN's primary RD with origin `SelfImported`
//! and `parent_rd` naming where it came from. Copies never replace an entry
//! the importing VPN owns itself, and imported copies are never exported
//! again.

use crate::error::Error;
use crate::extra_route::vpn_rds;
use crate::log::fanout_log;
use crate::rtindex::RouteTargetIndex;
use slog::Logger;
use std::collections::BTreeMap;
use vrdb::{Db, RouteOrigin, VpnInstance, VrfEntry, VrfKey};

#[derive(Clone)]
pub struct RouteFanout {
    db: Db,
    rtindex: RouteTargetIndex,
    log: Logger,
}

/// The copy of a subnet aggregate route keeps its subnet identity so the
/// importing side can still resolve the segment behind it.
fn imported_subnet_route(dst_rd: &str, entry: &VrfEntry) -> VrfEntry {
    VrfEntry {
        rd: dst_rd.to_string(),
        prefix: entry.prefix,
        nexthops: entry.nexthops.clone(),
        label: entry.label,
        vni: entry.vni,
        origin: RouteOrigin::SelfImported,
        gateway_mac: None,
        parent_rd: Some(entry.rd.clone()),
        subnet: entry.subnet,
        sources: BTreeMap::from([(entry.rd.clone(), entry.nexthops.clone())]),
    }
}

fn imported_route(dst_rd: &str, entry: &VrfEntry) -> VrfEntry {
    VrfEntry {
        rd: dst_rd.to_string(),
        prefix: entry.prefix,
        nexthops: entry.nexthops.clone(),
        label: entry.label,
        vni: entry.vni,
        origin: RouteOrigin::SelfImported,
        gateway_mac: entry.gateway_mac.clone(),
        parent_rd: Some(entry.rd.clone()),
        subnet: None,
        sources: BTreeMap::from([(entry.rd.clone(), entry.nexthops.clone())]),
    }
}

impl RouteFanout {
    pub fn new(db: Db, rtindex: RouteTargetIndex, log: Logger) -> Self {
        Self { db, rtindex, log }
    }

    /// Copy `entry` into `dst`. Returns whether the forwarding table
    /// changed.
    pub fn import_route(
        &self,
        dst: &VpnInstance,
        entry: &VrfEntry,
    ) -> Result<bool, Error> {
        if !entry.origin.is_controller_managed_non_link() {
            return Ok(false);
        }
        if !dst.family.carries(&entry.prefix) {
            fanout_log!(self.log, debug,
                "skipping import of foreign family route";
                "vpn" => &dst.name,
                "prefix" => entry.prefix.to_string()
            );
            return Ok(false);
        }

        let dst_rd = dst.primary_rd();
        if dst.all_rds().contains(&entry.rd) {
            return Ok(false);
        }
        let copy = if entry.origin == RouteOrigin::Connected
            && entry.subnet.is_some()
        {
            imported_subnet_route(&dst_rd, entry)
        } else {
            imported_route(&dst_rd, entry)
        };

        let key = VrfKey::new(&dst_rd, entry.prefix);
        let change = self.db.update_vrf_entry(&key, |current| match current {
            None => Some(copy),
            Some(c) if c.origin != RouteOrigin::SelfImported => Some(c.clone()),
            Some(c) => {
                let mut merged = if c.parent_rd == copy.parent_rd {
                    copy.clone()
                } else {
                    c.clone()
                };
                merged.sources = c.sources.clone();
                merged
                    .sources
                    .insert(entry.rd.clone(), entry.nexthops.clone());
                merged.sync_sources();
                Some(merged)
            }
        })?;

        if change.is_some() {
            fanout_log!(self.log, debug,
                "imported route";
                "vpn" => &dst.name,
                "rd" => &dst_rd,
                "prefix" => entry.prefix.to_string(),
                "parent_rd" => &entry.rd
            );
        }
        Ok(change.is_some())
    }

    /// Take what `entry`'s RD contributed out of its copy in `dst`. The copy
    /// is deleted once no source RD contributes to it.
    pub fn remove_import(
        &self,
        dst: &VpnInstance,
        entry: &VrfEntry,
    ) -> Result<bool, Error> {
        let key = VrfKey::new(&dst.primary_rd(), entry.prefix);
        let change = self.db.update_vrf_entry(&key, |current| {
            let c = current?;
            if c.origin != RouteOrigin::SelfImported {
                return Some(c.clone());
            }
            let mut kept = c.clone();
            if kept.sources.remove(&entry.rd).is_none() {
                return Some(c.clone());
            }
            if kept.sources.is_empty() {
                return None;
            }
            kept.sync_sources();
            Some(kept)
        })?;
        Ok(change.is_some())
    }

    /// Push `entry`, written under one of `src`'s RDs, to every importer.
    pub fn export_route(
        &self,
        src: &VpnInstance,
        entry: &VrfEntry,
    ) -> Result<usize, Error> {
        if !entry.origin.is_controller_managed_non_link() {
            return Ok(0);
        }
        let mut changed = 0;
        for dst in self.rtindex.importing_vpns(src)? {
            if self.import_route(&dst, entry)? {
                changed += 1;
            }
        }
        Ok(changed)
    }

    /// Pull the copies of `entry` back out of every importer.
    pub fn withdraw_route(
        &self,
        src: &VpnInstance,
        entry: &VrfEntry,
    ) -> Result<usize, Error> {
        if !entry.origin.is_controller_managed_non_link() {
            return Ok(0);
        }
        let mut changed = 0;
        for dst in self.rtindex.importing_vpns(src)? {
            if self.remove_import(&dst, entry)? {
                changed += 1;
            }
        }
        Ok(changed)
    }

    fn own_routes(&self, vpn: &VpnInstance) -> Result<Vec<VrfEntry>, Error> {
        let mut routes = Vec::new();
        for rd in vpn_rds(&self.db, vpn)? {
            routes.extend(
                self.db
                    .get_vrf_entries(&rd)?
                    .into_iter()
                    .filter(|e| e.origin.is_controller_managed_non_link()),
            );
        }
        Ok(routes)
    }

    /// Bring `vpn` in line with its route targets: pull in everything its
    /// exporters carry and push out everything it carries to its importers.
    /// Running it again changes nothing.
    pub fn import_for_new_vpn(
        &self,
        vpn: &VpnInstance,
    ) -> Result<usize, Error> {
        let mut changed = 0;
        for src in self.rtindex.exporting_vpns(vpn)? {
            for entry in self.own_routes(&src)? {
                if self.import_route(vpn, &entry)? {
                    changed += 1;
                }
            }
        }
        for entry in self.own_routes(vpn)? {
            changed += self.export_route(vpn, &entry)?;
        }
        fanout_log!(self.log, info,
            "vpn fan-out complete";
            "vpn" => &vpn.name,
            "changed" => changed
        );
        Ok(changed)
    }

    /// Drop every copy of `src`'s routes from `dst`.
    pub fn remove_imported_routes(
        &self,
        src: &VpnInstance,
        dst: &VpnInstance,
    ) -> Result<usize, Error> {
        let mut changed = 0;
        for entry in self.own_routes(src)? {
            if self.remove_import(dst, &entry)? {
                changed += 1;
            }
        }
        fanout_log!(self.log, info,
            "removed imported routes";
            "from" => &src.name,
            "vpn" => &dst.name,
            "changed" => changed
        );
        Ok(changed)
    }

    /// Unlink what `old` route targets linked but `new` ones no longer do,
    /// then fan out under the new route targets.
    pub fn route_targets_changed(
        &self,
        old: &VpnInstance,
        new: &VpnInstance,
    ) -> Result<(), Error> {
        let importers_now: Vec<String> = self
            .rtindex
            .importing_vpns(new)?
            .into_iter()
            .map(|v| v.name)
            .collect();
        for dst in self.rtindex.importing_vpns(old)? {
            if !importers_now.contains(&dst.name) {
                self.remove_imported_routes(new, &dst)?;
            }
        }

        let exporters_now: Vec<String> = self
            .rtindex
            .exporting_vpns(new)?
            .into_iter()
            .map(|v| v.name)
            .collect();
        for src in self.rtindex.exporting_vpns(old)? {
            if !exporters_now.contains(&src.name) {
                self.remove_imported_routes(&src, new)?;
            }
        }

        self.import_for_new_vpn(new)?;
        Ok(())
    }
}
