// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Named identifier pools.
//!
//! A pool hands out integers from a closed range. Allocation is keyed: asking
//! twice for the same key returns the same id, which is what keeps labels and
//! VPN ids stable across restarts. The lowest free id is always chosen, so a
//! released id is the first to be handed out again.

use crate::db::Db;
use crate::error::Error;
use crate::log::vrdb_log;
use crate::MOD_IDPOOL;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use vpn_common::lock;

const OPER_ID_POOL: &str = "oper/id_pool";
const OPER_ID_ALLOC: &str = "oper/id_alloc";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
pub struct PoolInfo {
    pub start: u32,
    pub end: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
struct IdAllocation {
    key: String,
    id: u32,
}

fn alloc_key(pool: &str, key: &str) -> String {
    format!("{pool}|{key}")
}

impl Db {
    /// Create a pool covering `start..=end`. Creating an existing pool with
    /// the same range is a no-op, a different range is a conflict.
    pub fn create_pool(
        &self,
        name: &str,
        start: u32,
        end: u32,
    ) -> Result<(), Error> {
        if start > end {
            return Err(Error::DbValue(format!(
                "pool {name} range {start}..={end} is empty"
            )));
        }
        let _guard = lock!(self.pool_lock);
        let info = PoolInfo { start, end };
        match self.get::<PoolInfo>(OPER_ID_POOL, name)? {
            Some(existing) if existing == info => Ok(()),
            Some(existing) => Err(Error::Conflict(format!(
                "pool {name} exists with range {}..={}",
                existing.start, existing.end
            ))),
            None => self.put(OPER_ID_POOL, name, &info),
        }
    }

    pub fn get_pool(&self, name: &str) -> Result<Option<PoolInfo>, Error> {
        self.get(OPER_ID_POOL, name)
    }

    pub fn lookup_id(&self, pool: &str, key: &str) -> Result<Option<u32>, Error> {
        Ok(self
            .get::<IdAllocation>(OPER_ID_ALLOC, &alloc_key(pool, key))?
            .map(|a| a.id))
    }

    pub fn allocate_id(&self, pool: &str, key: &str) -> Result<u32, Error> {
        let _guard = lock!(self.pool_lock);
        let info = self
            .get::<PoolInfo>(OPER_ID_POOL, pool)?
            .ok_or_else(|| Error::NotFound(format!("id pool {pool}")))?;

        if let Some(id) = self.lookup_id(pool, key)? {
            return Ok(id);
        }

        let used: BTreeSet<u32> = self
            .scan::<IdAllocation>(OPER_ID_ALLOC, &alloc_key(pool, ""))?
            .into_iter()
            .map(|a| a.id)
            .collect();

        let id = (info.start..=info.end)
            .find(|id| !used.contains(id))
            .ok_or_else(|| Error::PoolExhausted(pool.to_string()))?;

        self.put(
            OPER_ID_ALLOC,
            &alloc_key(pool, key),
            &IdAllocation {
                key: key.to_string(),
                id,
            },
        )?;
        vrdb_log!(self, debug, MOD_IDPOOL,
            "allocated id";
            "pool" => pool,
            "key" => key,
            "id" => id
        );
        Ok(id)
    }

    /// Releasing a key that holds no id is not an error.
    pub fn release_id(&self, pool: &str, key: &str) -> Result<Option<u32>, Error> {
        let _guard = lock!(self.pool_lock);
        let released = self
            .delete::<IdAllocation>(OPER_ID_ALLOC, &alloc_key(pool, key))?
            .map(|a| a.id);
        if let Some(id) = released {
            vrdb_log!(self, debug, MOD_IDPOOL,
                "released id";
                "pool" => pool,
                "key" => key,
                "id" => id
            );
        }
        Ok(released)
    }
}

#[cfg(test)]
mod test {
    use crate::error::Error;
    use crate::test::get_test_db;
    use vpn_common::log::init_file_logger;

    #[test]
    fn pool_allocation_is_keyed_and_reuses_lowest() {
        let log = init_file_logger("pool_allocation.log");
        let db = get_test_db("pool_allocation", log).unwrap();
        db.create_pool("labels", 100, 102).unwrap();
        db.create_pool("labels", 100, 102).unwrap();
        assert!(matches!(
            db.create_pool("labels", 100, 200),
            Err(Error::Conflict(_))
        ));

        assert_eq!(db.allocate_id("labels", "a").unwrap(), 100);
        assert_eq!(db.allocate_id("labels", "a").unwrap(), 100);
        assert_eq!(db.allocate_id("labels", "b").unwrap(), 101);
        assert_eq!(db.allocate_id("labels", "c").unwrap(), 102);
        assert!(matches!(
            db.allocate_id("labels", "d"),
            Err(Error::PoolExhausted(_))
        ));

        assert_eq!(db.release_id("labels", "b").unwrap(), Some(101));
        assert_eq!(db.release_id("labels", "b").unwrap(), None);
        assert_eq!(db.allocate_id("labels", "d").unwrap(), 101);
        assert_eq!(db.lookup_id("labels", "d").unwrap(), Some(101));
    }

    #[test]
    fn pools_are_independent() {
        let log = init_file_logger("pools_independent.log");
        let db = get_test_db("pools_independent", log).unwrap();
        db.create_pool("vpnids", 1, 10).unwrap();
        db.create_pool("vpnservices", 1, 10).unwrap();
        assert_eq!(db.allocate_id("vpnids", "blue").unwrap(), 1);
        assert_eq!(db.allocate_id("vpnservices", "blue").unwrap(), 1);
        assert!(matches!(
            db.allocate_id("nope", "blue"),
            Err(Error::NotFound(_))
        ));
    }
}
