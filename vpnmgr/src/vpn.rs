// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! VPN instance lifecycle.
//!
//! A VPN becomes visible with its numeric id and primary RD in a single
//! record write, so nothing can ever observe a VPN without them. While
//! active, its RD list may only grow at the end, its address family may
//! only widen and its VNI is fixed.

use crate::config::EngineConfig;
use crate::error::Error;
use crate::extra_route::vpn_rds;
use crate::fanout::RouteFanout;
use crate::idmgr::{IdAllocator, VPN_ID_POOL};
use crate::lockmgr::{vpn_key, LockManager};
use crate::log::vpn_log;
use crate::rtindex::RouteTargetIndex;
use backoff::ExponentialBackoff;
use slog::Logger;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use vrdb::{Db, RouteOrigin, VpnConfig, VpnInstance};

/// Policy for waiting on a VPN that has not appeared yet.
fn not_ready_policy(initial: Duration, limit: Duration) -> ExponentialBackoff {
    ExponentialBackoff {
        current_interval: initial,
        initial_interval: initial,
        multiplier: 2.0,
        max_interval: limit.max(initial),
        max_elapsed_time: Some(limit),
        ..ExponentialBackoff::default()
    }
}

#[derive(Clone)]
pub struct VpnLifecycle {
    db: Db,
    ids: Arc<dyn IdAllocator>,
    rtindex: RouteTargetIndex,
    fanout: RouteFanout,
    locks: Arc<LockManager>,
    not_ready_initial: Duration,
    not_ready_timeout: Duration,
    log: Logger,
}

impl VpnLifecycle {
    pub fn new(
        db: Db,
        ids: Arc<dyn IdAllocator>,
        rtindex: RouteTargetIndex,
        fanout: RouteFanout,
        locks: Arc<LockManager>,
        config: &EngineConfig,
        log: Logger,
    ) -> Self {
        Self {
            db,
            ids,
            rtindex,
            fanout,
            locks,
            not_ready_initial: config.not_ready_initial_interval(),
            not_ready_timeout: config.not_ready_timeout(),
            log,
        }
    }

    fn validate(cfg: &VpnConfig) -> Result<(), Error> {
        if cfg.name.is_empty() {
            return Err(Error::InvalidArgument("vpn without a name".into()));
        }
        let unique: BTreeSet<&String> = cfg.rds.iter().collect();
        if unique.len() != cfg.rds.len() {
            return Err(Error::InvalidArgument(format!(
                "vpn {} lists a route distinguisher twice",
                cfg.name
            )));
        }
        Ok(())
    }

    /// Create a VPN. Adding an existing VPN again is treated as an update.
    pub fn add_vpn(&self, cfg: VpnConfig) -> Result<VpnInstance, Error> {
        Self::validate(&cfg)?;
        let guard = self.locks.lock(vpn_key(&cfg.name));

        if self.db.get_vpn_instance(&cfg.name)?.is_some() {
            drop(guard);
            return self.update_vpn(cfg);
        }

        let vpn_id = self.ids.allocate(VPN_ID_POOL, &cfg.name)?;
        self.db.put_vpn_config(&cfg)?;
        let vpn = VpnInstance::new(cfg, vpn_id);
        self.db.put_vpn_instance(&vpn)?;

        vpn_log!(self.log, info,
            "vpn created";
            "vpn" => &vpn.name,
            "vpn_id" => vpn.vpn_id,
            "rd" => vpn.primary_rd()
        );

        self.fanout.import_for_new_vpn(&vpn)?;
        Ok(vpn)
    }

    pub fn update_vpn(&self, cfg: VpnConfig) -> Result<VpnInstance, Error> {
        Self::validate(&cfg)?;
        let _guard = self.locks.lock(vpn_key(&cfg.name));

        let old = self
            .db
            .get_vpn_instance(&cfg.name)?
            .ok_or_else(|| Error::NotFound(format!("vpn {}", cfg.name)))?;

        if old.rds.is_empty() != cfg.rds.is_empty()
            || !cfg.rds.starts_with(&old.rds)
        {
            return Err(Error::InvalidArgument(format!(
                "vpn {} route distinguishers {:?} do not extend {:?}",
                cfg.name, cfg.rds, old.rds
            )));
        }
        let family = old.family.widen(cfg.family).ok_or_else(|| {
            Error::InvalidArgument(format!(
                "vpn {} address family {:?} can not narrow to {:?}",
                cfg.name, old.family, cfg.family
            ))
        })?;
        if old.l3vni != cfg.l3vni {
            return Err(Error::InvalidArgument(format!(
                "vpn {} vni is fixed at {:?}",
                cfg.name, old.l3vni
            )));
        }

        let mut new = VpnInstance::new(cfg.clone(), old.vpn_id);
        new.family = family;
        if new == old {
            return Ok(old);
        }
        self.rtindex.check_retarget(&old, &new)?;
        self.db.put_vpn_config(&cfg)?;
        self.db.put_vpn_instance(&new)?;

        vpn_log!(self.log, info,
            "vpn updated";
            "vpn" => &new.name,
            "rds" => format!("{:?}", new.rds),
            "family" => format!("{:?}", new.family)
        );

        if old.import_rts != new.import_rts || old.export_rts != new.export_rts
        {
            self.rtindex.retarget(&old, &new)?;
            self.fanout.route_targets_changed(&old, &new)?;
        }
        Ok(new)
    }

    /// Remove a VPN. Refused while it still owns subnet routes or
    /// forwarding entries. Copies imported from other VPNs go with it.
    pub fn remove_vpn(&self, name: &str) -> Result<(), Error> {
        let _guard = self.locks.lock(vpn_key(name));

        let Some(vpn) = self.db.get_vpn_instance(name)? else {
            self.db.remove_vpn_config(name)?;
            return Ok(());
        };

        let subnets = self.db.get_vpn_subnet_routes(name)?;
        if !subnets.is_empty() {
            return Err(Error::Conflict(format!(
                "vpn {name} still has {} subnet routes",
                subnets.len()
            )));
        }

        let mut imported = Vec::new();
        for rd in vpn_rds(&self.db, &vpn)? {
            for entry in self.db.get_vrf_entries(&rd)? {
                if entry.origin != RouteOrigin::SelfImported {
                    return Err(Error::Conflict(format!(
                        "vpn {name} still has forwarding entry {}",
                        entry.key()
                    )));
                }
                imported.push(entry.key());
            }
        }
        for key in &imported {
            self.db.remove_vrf_entry(key)?;
        }

        self.db.remove_vpn_instance(name)?;
        self.db.remove_vpn_config(name)?;
        self.ids.release(VPN_ID_POOL, name)?;

        vpn_log!(self.log, info,
            "vpn removed";
            "vpn" => name,
            "vpn_id" => vpn.vpn_id,
            "imported_removed" => imported.len()
        );
        Ok(())
    }

    /// Wait, with exponential backoff, for a VPN to become ready. Gives up
    /// with [`Error::NotReady`] once the configured limit passes.
    pub fn wait_for_vpn(&self, name: &str) -> Result<VpnInstance, Error> {
        let policy =
            not_ready_policy(self.not_ready_initial, self.not_ready_timeout);

        let op = || match self.db.get_vpn_instance(name) {
            Ok(Some(vpn)) => Ok(vpn),
            Ok(None) => Err(backoff::Error::transient(Error::NotReady(
                format!("vpn {name}"),
            ))),
            Err(e) => Err(backoff::Error::permanent(Error::from(e))),
        };

        let log_wait = |e: Error, delay: Duration| {
            vpn_log!(self.log, debug,
                "vpn not ready, waiting";
                "vpn" => name,
                "error" => format!("{e}"),
                "delay" => format!("{delay:?}")
            );
        };

        match backoff::retry_notify(policy, op, log_wait) {
            Ok(vpn) => Ok(vpn),
            Err(backoff::Error::Permanent(e))
            | Err(backoff::Error::Transient { err: e, .. }) => {
                vpn_log!(self.log, warn,
                    "gave up waiting for vpn";
                    "vpn" => name,
                    "error" => format!("{e}")
                );
                Err(e)
            }
        }
    }
}
