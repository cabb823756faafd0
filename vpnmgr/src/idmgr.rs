// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Identifier allocation for labels and VPN ids.

use crate::bgp::RouteLabel;
use crate::config::EngineConfig;
use crate::error::Error;
use vrdb::{Db, Prefix, VpnInstance};

/// MPLS labels, keyed by [`label_key`].
pub const LABEL_POOL: &str = "vpnservices";
/// Numeric VPN ids, keyed by VPN name.
pub const VPN_ID_POOL: &str = "vpnids";

pub fn label_key(rd: &str, prefix: &Prefix) -> String {
    format!("{rd}|{prefix}")
}

/// Keyed identifier allocation. Allocating the same key twice returns the
/// same id and releasing an unknown key succeeds.
pub trait IdAllocator: Send + Sync {
    fn allocate(&self, pool: &str, key: &str) -> Result<u32, Error>;
    fn release(&self, pool: &str, key: &str) -> Result<(), Error>;
    fn lookup(&self, pool: &str, key: &str) -> Result<Option<u32>, Error>;
}

/// The label a route under `rd` is forwarded with. VXLAN VPNs use their
/// VNI and allocate nothing.
pub fn route_label(
    ids: &dyn IdAllocator,
    vpn: &VpnInstance,
    rd: &str,
    prefix: &Prefix,
) -> Result<RouteLabel, Error> {
    match vpn.l3vni {
        Some(vni) => Ok(RouteLabel::Vni(vni)),
        None => Ok(RouteLabel::Mpls(
            ids.allocate(LABEL_POOL, &label_key(rd, prefix))?,
        )),
    }
}

pub fn release_route_label(
    ids: &dyn IdAllocator,
    vpn: &VpnInstance,
    rd: &str,
    prefix: &Prefix,
) -> Result<(), Error> {
    if vpn.l3vni.is_none() {
        ids.release(LABEL_POOL, &label_key(rd, prefix))?;
    }
    Ok(())
}

/// Allocator backed by the pools kept in the route database.
#[derive(Clone)]
pub struct IdManager {
    db: Db,
}

impl IdManager {
    /// Create the engine's pools if they do not exist yet.
    pub fn init(db: Db, config: &EngineConfig) -> Result<Self, Error> {
        db.create_pool(
            LABEL_POOL,
            config.label_pool.start,
            config.label_pool.end,
        )?;
        db.create_pool(
            VPN_ID_POOL,
            config.vpn_id_pool.start,
            config.vpn_id_pool.end,
        )?;
        Ok(Self { db })
    }
}

impl IdAllocator for IdManager {
    fn allocate(&self, pool: &str, key: &str) -> Result<u32, Error> {
        Ok(self.db.allocate_id(pool, key)?)
    }

    fn release(&self, pool: &str, key: &str) -> Result<(), Error> {
        self.db.release_id(pool, key)?;
        Ok(())
    }

    fn lookup(&self, pool: &str, key: &str) -> Result<Option<u32>, Error> {
        Ok(self.db.lookup_id(pool, key)?)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::PoolRange;
    use crate::error::ErrorKind;
    use pretty_assertions::assert_eq;
    use vpn_common::log::init_file_logger;
    use vrdb::test::get_test_db;

    #[test]
    fn labels_are_keyed_and_exhaust() {
        let log = init_file_logger("idmgr_labels.log");
        let db = get_test_db("idmgr_labels", log).unwrap();
        let cfg = EngineConfig {
            label_pool: PoolRange { start: 10, end: 11 },
            ..Default::default()
        };
        let ids = IdManager::init(db.db().clone(), &cfg).unwrap();

        let a = ids.allocate(LABEL_POOL, "100:1|10.0.0.0/24").unwrap();
        assert_eq!(a, 10);
        assert_eq!(ids.allocate(LABEL_POOL, "100:1|10.0.0.0/24").unwrap(), a);
        assert_eq!(ids.allocate(LABEL_POOL, "100:1|10.0.1.0/24").unwrap(), 11);

        let err = ids.allocate(LABEL_POOL, "100:1|10.0.2.0/24").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Exhausted);

        ids.release(LABEL_POOL, "100:1|10.0.0.0/24").unwrap();
        ids.release(LABEL_POOL, "100:1|10.0.0.0/24").unwrap();
        assert_eq!(ids.lookup(LABEL_POOL, "100:1|10.0.0.0/24").unwrap(), None);
        assert_eq!(ids.allocate(LABEL_POOL, "100:1|10.0.2.0/24").unwrap(), 10);

        // init again over the same store is a no-op
        IdManager::init(db.db().clone(), &cfg).unwrap();
    }
}
