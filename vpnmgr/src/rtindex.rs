// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The route-target index: which subnets of which VPNs sit below each route
//! target, by import/export direction.

use crate::error::Error;
use crate::log::rt_log;
use itertools::Itertools;
use slog::Logger;
use std::collections::BTreeSet;
use vrdb::{AssociatedSubnet, Db, Prefix, RtKind, VpnInstance};

/// Shorter-prefix network against the longer prefix masked to the shorter
/// length. Symmetric, and prefixes of different families never overlap.
pub fn are_subnets_overlapping(a: &Prefix, b: &Prefix) -> bool {
    a.overlaps(b)
}

fn all_route_targets(vpn: &VpnInstance) -> BTreeSet<String> {
    vpn.import_rts.union(&vpn.export_rts).cloned().collect()
}

#[derive(Clone)]
pub struct RouteTargetIndex {
    db: Db,
    log: Logger,
}

impl RouteTargetIndex {
    pub fn new(db: Db, log: Logger) -> Self {
        Self { db, log }
    }

    /// Admit `cidr` of `vpn` below each of the VPN's route targets. Fails
    /// with [`Error::Overlap`] without touching the index if the subnet
    /// would overlap one already reachable through those route targets.
    pub fn associate(
        &self,
        vpn: &VpnInstance,
        cidr: Prefix,
    ) -> Result<(), Error> {
        self.check_overlap(vpn, &cidr)?;
        for kind in [RtKind::Import, RtKind::Export] {
            for rt in vpn.route_targets(kind) {
                self.db.update_route_target(rt, |rec| {
                    rec.associations.entry(kind).or_default().insert(
                        AssociatedSubnet {
                            cidr,
                            vpn: vpn.name.clone(),
                        },
                    );
                })?;
                rt_log!(self.log, debug,
                    "associated subnet";
                    "rt" => rt,
                    "kind" => kind.to_string(),
                    "vpn" => &vpn.name,
                    "cidr" => cidr.to_string()
                );
            }
        }
        Ok(())
    }

    /// Remove `cidr` of `vpn` from every route target that holds it.
    /// Records left empty are garbage collected by the store.
    pub fn disassociate(&self, vpn: &str, cidr: &Prefix) -> Result<(), Error> {
        let target = AssociatedSubnet {
            cidr: *cidr,
            vpn: vpn.to_string(),
        };
        for record in self.db.get_route_targets()? {
            if !record.subnets().any(|s| s == &target) {
                continue;
            }
            let remaining = self.db.update_route_target(&record.rt, |rec| {
                for subnets in rec.associations.values_mut() {
                    subnets.remove(&target);
                }
            })?;
            rt_log!(self.log, debug,
                "disassociated subnet";
                "rt" => &record.rt,
                "vpn" => vpn,
                "cidr" => cidr.to_string(),
                "rt_removed" => remaining.is_none()
            );
        }
        Ok(())
    }

    /// Check `cidr` against every subnet of other VPNs below the route
    /// targets of `vpn`, and below the route targets of every VPN sharing a
    /// route target with `vpn`.
    pub fn check_overlap(
        &self,
        vpn: &VpnInstance,
        cidr: &Prefix,
    ) -> Result<(), Error> {
        let direct = all_route_targets(vpn);
        if direct.is_empty() {
            return Ok(());
        }

        let mut reachable = direct.clone();
        for sibling in self.db.get_vpn_instances()? {
            if sibling.name == vpn.name {
                continue;
            }
            let theirs = all_route_targets(&sibling);
            if !theirs.is_disjoint(&direct) {
                reachable.extend(theirs);
            }
        }

        for rt in &reachable {
            let Some(record) = self.db.get_route_target(rt)? else {
                continue;
            };
            let clash = record.subnets().find(|s| {
                s.vpn != vpn.name && are_subnets_overlapping(&s.cidr, cidr)
            });
            if let Some(clash) = clash {
                let indirect = !direct.contains(rt);
                rt_log!(self.log, warn,
                    "rejecting overlapping subnet";
                    "vpn" => &vpn.name,
                    "cidr" => cidr.to_string(),
                    "rt" => rt,
                    "other_vpn" => &clash.vpn,
                    "other_cidr" => clash.cidr.to_string(),
                    "indirect" => indirect
                );
                return Err(Error::Overlap(format!(
                    "{cidr} in vpn {} overlaps {} in vpn {} via rt {rt}",
                    vpn.name, clash.cidr, clash.vpn
                )));
            }
        }
        Ok(())
    }

    /// VPNs importing any route target `vpn` exports.
    pub fn importing_vpns(
        &self,
        vpn: &VpnInstance,
    ) -> Result<Vec<VpnInstance>, Error> {
        self.linked(vpn, RtKind::Export)
    }

    /// VPNs exporting any route target `vpn` imports.
    pub fn exporting_vpns(
        &self,
        vpn: &VpnInstance,
    ) -> Result<Vec<VpnInstance>, Error> {
        self.linked(vpn, RtKind::Import)
    }

    /// VPNs whose `kind.opposite()` route targets meet `vpn`'s `kind`
    /// route targets.
    fn linked(
        &self,
        vpn: &VpnInstance,
        kind: RtKind,
    ) -> Result<Vec<VpnInstance>, Error> {
        let ours = vpn.route_targets(kind);
        if ours.is_empty() {
            return Ok(Vec::new());
        }
        Ok(self
            .db
            .get_vpn_instances()?
            .into_iter()
            .filter(|other| other.name != vpn.name)
            .filter(|other| {
                !other.route_targets(kind.opposite()).is_disjoint(ours)
            })
            .sorted_by(|a, b| a.name.cmp(&b.name))
            .collect())
    }

    /// Check the subnets `old` already has against everything the route
    /// targets of `new` make reachable. Run before a route target change is
    /// written, it leaves the index and the VPN untouched on
    /// [`Error::Overlap`].
    pub fn check_retarget(
        &self,
        old: &VpnInstance,
        new: &VpnInstance,
    ) -> Result<(), Error> {
        let before = all_route_targets(old);
        if all_route_targets(new).is_subset(&before) {
            return Ok(());
        }
        for sr in self.db.get_vpn_subnet_routes(&new.name)? {
            self.check_overlap(new, &sr.cidr)?;
        }
        Ok(())
    }

    /// Move the subnets of a VPN from its old route targets to its new ones.
    pub fn retarget(
        &self,
        old: &VpnInstance,
        new: &VpnInstance,
    ) -> Result<(), Error> {
        let cidrs: Vec<Prefix> = self
            .db
            .get_vpn_subnet_routes(&new.name)?
            .into_iter()
            .map(|sr| sr.cidr)
            .collect();

        for kind in [RtKind::Import, RtKind::Export] {
            let before = old.route_targets(kind);
            let after = new.route_targets(kind);

            for rt in before.difference(after) {
                self.db.update_route_target(rt, |rec| {
                    if let Some(subnets) = rec.associations.get_mut(&kind) {
                        subnets.retain(|s| s.vpn != new.name);
                    }
                })?;
                rt_log!(self.log, info,
                    "route target removed from vpn";
                    "vpn" => &new.name,
                    "rt" => rt,
                    "kind" => kind.to_string()
                );
            }

            for rt in after.difference(before) {
                self.db.update_route_target(rt, |rec| {
                    let subnets = rec.associations.entry(kind).or_default();
                    for cidr in &cidrs {
                        subnets.insert(AssociatedSubnet {
                            cidr: *cidr,
                            vpn: new.name.clone(),
                        });
                    }
                })?;
                rt_log!(self.log, info,
                    "route target added to vpn";
                    "vpn" => &new.name,
                    "rt" => rt,
                    "kind" => kind.to_string()
                );
            }
        }
        Ok(())
    }
}
