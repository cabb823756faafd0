// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The VPN route database (vrdb).
//!
//! All VPN control plane records live in a sled key-value store. Records are
//! split across two isolation domains by tree name: `config/*` trees hold
//! desired state handed to us by the tenant, `oper/*` trees hold state this
//! engine derives. Every write is flushed before returning so a record
//! written by one worker is visible to the next read issued by any worker.
//!
//! Forwarding entries (VRF tables) additionally generate change
//! notifications for registered watchers, which is how forwarding state
//! leaves the engine.
use crate::error::Error;
use crate::log::vrdb_log;
use crate::types::*;
use crate::MOD_DB;
use serde::de::DeserializeOwned;
use serde::Serialize;
use slog::Logger;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::Sender;
use std::sync::{Arc, Mutex, RwLock};
use uuid::Uuid;
use vpn_common::{lock, read_lock, write_lock};

const CONFIG_VPN: &str = "config/vpn";
const CONFIG_SUBNET: &str = "config/subnet";
const CONFIG_INTERFACE: &str = "config/interface";

const OPER_VPN_INSTANCE: &str = "oper/vpn_instance";
const OPER_SUBNET_ROUTE: &str = "oper/subnet_route";
const OPER_EXTRA_ROUTE: &str = "oper/extra_route_alloc";
const OPER_ROUTE_TARGET: &str = "oper/route_target";
const OPER_MEMBER_NODE: &str = "oper/member_node";
const OPER_PREFIX_TO_INTERFACE: &str = "oper/prefix_to_interface";
const OPER_VRF: &str = "oper/vrf";

/// Handle to the VPN route database. Cloning is cheap, all clones share the
/// same underlying store and watchers.
#[derive(Clone)]
pub struct Db {
    persistent: sled::Db,

    /// A generation number bumped on every forwarding table change.
    generation: Arc<AtomicU64>,

    /// Notified when forwarding entries change.
    watchers: Arc<RwLock<Vec<Watcher>>>,

    /// Serializes read-modify-write cycles on records that are shared
    /// between jobs of different partition keys.
    rt_lock: Arc<Mutex<()>>,
    node_lock: Arc<Mutex<()>>,
    vrf_lock: Arc<Mutex<()>>,
    pub(crate) pool_lock: Arc<Mutex<()>>,

    pub(crate) log: Logger,
}

#[derive(Clone)]
struct Watcher {
    tag: String,
    sender: Sender<FibChangeNotification>,
}

fn extra_route_key(vpn_id: u32, prefix: &Prefix, nexthop: &IpAddr) -> String {
    format!("{vpn_id}|{prefix}|{nexthop}")
}

fn extra_route_scan(vpn_id: u32, prefix: &Prefix) -> String {
    format!("{vpn_id}|{prefix}|")
}

fn extra_route_vpn_scan(vpn_id: u32) -> String {
    format!("{vpn_id}|")
}

fn prefix_to_interface_key(vpn_id: u32, ip: &Prefix) -> String {
    format!("{vpn_id}|{ip}")
}

impl Db {
    /// Open (or create) a route database that stores data at `path`.
    pub fn new(path: &str, log: Logger) -> Result<Self, Error> {
        Ok(Self {
            persistent: sled::open(path)?,
            generation: Arc::new(AtomicU64::new(0)),
            watchers: Arc::new(RwLock::new(Vec::new())),
            rt_lock: Arc::new(Mutex::new(())),
            node_lock: Arc::new(Mutex::new(())),
            vrf_lock: Arc::new(Mutex::new(())),
            pool_lock: Arc::new(Mutex::new(())),
            log,
        })
    }

    /// Register a forwarding table watcher.
    pub fn watch(&self, tag: String, sender: Sender<FibChangeNotification>) {
        write_lock!(self.watchers).push(Watcher { tag, sender });
    }

    fn notify(&self, changes: Vec<FibChange>) {
        if changes.is_empty() {
            return;
        }
        let n = FibChangeNotification {
            generation: self.generation.fetch_add(1, Ordering::SeqCst) + 1,
            changes,
        };
        for Watcher { tag, sender } in read_lock!(self.watchers).iter() {
            if let Err(e) = sender.send(n.clone()) {
                vrdb_log!(self, error, MOD_DB,
                    "failed to send notification to watcher";
                    "watcher" => tag.as_str(),
                    "error" => format!("{e}")
                );
            }
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    pub(crate) fn put<T: Serialize>(
        &self,
        tree: &str,
        key: &str,
        value: &T,
    ) -> Result<(), Error> {
        let tree = self.persistent.open_tree(tree)?;
        let value = serde_json::to_string(value)?;
        tree.insert(key, value.as_str())?;
        tree.flush()?;
        Ok(())
    }

    pub(crate) fn get<T: DeserializeOwned>(
        &self,
        tree: &str,
        key: &str,
    ) -> Result<Option<T>, Error> {
        let tree = self.persistent.open_tree(tree)?;
        match tree.get(key)? {
            Some(value) => Ok(Some(serde_json::from_slice(&value)?)),
            None => Ok(None),
        }
    }

    pub(crate) fn delete<T: DeserializeOwned>(
        &self,
        tree: &str,
        key: &str,
    ) -> Result<Option<T>, Error> {
        let tree = self.persistent.open_tree(tree)?;
        let previous = tree.remove(key)?;
        tree.flush()?;
        match previous {
            Some(value) => Ok(Some(serde_json::from_slice(&value)?)),
            None => Ok(None),
        }
    }

    /// Collect every value in `tree` whose key starts with `prefix`.
    /// Entries that fail to decode are logged and skipped.
    pub(crate) fn scan<T: DeserializeOwned>(
        &self,
        tree: &str,
        prefix: &str,
    ) -> Result<Vec<T>, Error> {
        let name = tree;
        let tree = self.persistent.open_tree(tree)?;
        let result = tree
            .scan_prefix(prefix)
            .filter_map(|item| {
                let (key, value) = match item {
                    Ok(item) => item,
                    Err(e) => {
                        vrdb_log!(self, error, MOD_DB,
                            "error fetching entry";
                            "tree" => name,
                            "error" => format!("{e}")
                        );
                        return None;
                    }
                };
                match serde_json::from_slice(&value) {
                    Ok(item) => Some(item),
                    Err(e) => {
                        vrdb_log!(self, error, MOD_DB,
                            "error parsing entry value";
                            "tree" => name,
                            "key" => String::from_utf8_lossy(&key).to_string(),
                            "error" => format!("{e}")
                        );
                        None
                    }
                }
            })
            .collect();
        Ok(result)
    }

    //
    // vpn instances
    //

    pub fn put_vpn_config(&self, cfg: &VpnConfig) -> Result<(), Error> {
        self.put(CONFIG_VPN, &cfg.name, cfg)
    }

    pub fn get_vpn_config(&self, name: &str) -> Result<Option<VpnConfig>, Error> {
        self.get(CONFIG_VPN, name)
    }

    pub fn remove_vpn_config(&self, name: &str) -> Result<(), Error> {
        self.delete::<VpnConfig>(CONFIG_VPN, name)?;
        Ok(())
    }

    /// A VPN instance becomes visible to other jobs only once its numeric
    /// id and primary RD are fixed, in this single write.
    pub fn put_vpn_instance(&self, vpn: &VpnInstance) -> Result<(), Error> {
        self.put(OPER_VPN_INSTANCE, &vpn.name, vpn)
    }

    pub fn get_vpn_instance(
        &self,
        name: &str,
    ) -> Result<Option<VpnInstance>, Error> {
        self.get(OPER_VPN_INSTANCE, name)
    }

    pub fn remove_vpn_instance(&self, name: &str) -> Result<(), Error> {
        self.delete::<VpnInstance>(OPER_VPN_INSTANCE, name)?;
        Ok(())
    }

    pub fn get_vpn_instances(&self) -> Result<Vec<VpnInstance>, Error> {
        self.scan(OPER_VPN_INSTANCE, "")
    }

    //
    // subnets
    //

    pub fn put_subnet_config(&self, cfg: &SubnetConfig) -> Result<(), Error> {
        self.put(CONFIG_SUBNET, &cfg.subnet_id.to_string(), cfg)
    }

    pub fn get_subnet_config(
        &self,
        id: Uuid,
    ) -> Result<Option<SubnetConfig>, Error> {
        self.get(CONFIG_SUBNET, &id.to_string())
    }

    pub fn remove_subnet_config(&self, id: Uuid) -> Result<(), Error> {
        self.delete::<SubnetConfig>(CONFIG_SUBNET, &id.to_string())?;
        Ok(())
    }

    pub fn put_subnet_route(&self, sr: &SubnetRoute) -> Result<(), Error> {
        self.put(OPER_SUBNET_ROUTE, &sr.subnet_id.to_string(), sr)
    }

    pub fn get_subnet_route(
        &self,
        id: Uuid,
    ) -> Result<Option<SubnetRoute>, Error> {
        self.get(OPER_SUBNET_ROUTE, &id.to_string())
    }

    pub fn remove_subnet_route(&self, id: Uuid) -> Result<(), Error> {
        self.delete::<SubnetRoute>(OPER_SUBNET_ROUTE, &id.to_string())?;
        Ok(())
    }

    pub fn get_subnet_routes(&self) -> Result<Vec<SubnetRoute>, Error> {
        self.scan(OPER_SUBNET_ROUTE, "")
    }

    pub fn get_vpn_subnet_routes(
        &self,
        vpn: &str,
    ) -> Result<Vec<SubnetRoute>, Error> {
        Ok(self
            .get_subnet_routes()?
            .into_iter()
            .filter(|sr| sr.vpn_name == vpn)
            .collect())
    }

    //
    // extra route allocations
    //

    pub fn put_extra_route_alloc(
        &self,
        alloc: &ExtraRouteAllocation,
    ) -> Result<(), Error> {
        let key = extra_route_key(alloc.vpn_id, &alloc.prefix, &alloc.nexthop);
        self.put(OPER_EXTRA_ROUTE, &key, alloc)
    }

    pub fn get_extra_route_alloc(
        &self,
        vpn_id: u32,
        prefix: &Prefix,
        nexthop: &IpAddr,
    ) -> Result<Option<ExtraRouteAllocation>, Error> {
        self.get(OPER_EXTRA_ROUTE, &extra_route_key(vpn_id, prefix, nexthop))
    }

    pub fn remove_extra_route_alloc(
        &self,
        vpn_id: u32,
        prefix: &Prefix,
        nexthop: &IpAddr,
    ) -> Result<Option<ExtraRouteAllocation>, Error> {
        self.delete(OPER_EXTRA_ROUTE, &extra_route_key(vpn_id, prefix, nexthop))
    }

    /// All allocations held for `prefix` in a VPN, across next hops.
    pub fn get_prefix_allocations(
        &self,
        vpn_id: u32,
        prefix: &Prefix,
    ) -> Result<Vec<ExtraRouteAllocation>, Error> {
        self.scan(OPER_EXTRA_ROUTE, &extra_route_scan(vpn_id, prefix))
    }

    /// Every extra route allocation a VPN holds.
    pub fn get_vpn_allocations(
        &self,
        vpn_id: u32,
    ) -> Result<Vec<ExtraRouteAllocation>, Error> {
        self.scan(OPER_EXTRA_ROUTE, &extra_route_vpn_scan(vpn_id))
    }

    //
    // route targets
    //

    pub fn get_route_target(
        &self,
        rt: &str,
    ) -> Result<Option<RouteTargetRecord>, Error> {
        self.get(OPER_ROUTE_TARGET, rt)
    }

    pub fn get_route_targets(&self) -> Result<Vec<RouteTargetRecord>, Error> {
        self.scan(OPER_ROUTE_TARGET, "")
    }

    /// Apply `f` to the record for `rt` (created empty if absent). Empty
    /// association sets are pruned afterwards and a record left without
    /// associations is deleted. Returns the record as stored, if any.
    pub fn update_route_target<F>(
        &self,
        rt: &str,
        f: F,
    ) -> Result<Option<RouteTargetRecord>, Error>
    where
        F: FnOnce(&mut RouteTargetRecord),
    {
        let _guard = lock!(self.rt_lock);
        let mut record = self
            .get::<RouteTargetRecord>(OPER_ROUTE_TARGET, rt)?
            .unwrap_or_else(|| RouteTargetRecord::new(rt));
        f(&mut record);
        record.associations.retain(|_, subnets| !subnets.is_empty());
        if record.is_empty() {
            self.delete::<RouteTargetRecord>(OPER_ROUTE_TARGET, rt)?;
            return Ok(None);
        }
        self.put(OPER_ROUTE_TARGET, rt, &record)?;
        Ok(Some(record))
    }

    //
    // member nodes
    //

    pub fn get_member_node(
        &self,
        dpn: DpnId,
    ) -> Result<Option<MemberNode>, Error> {
        self.get(OPER_MEMBER_NODE, &dpn.to_string())
    }

    pub fn get_member_nodes(&self) -> Result<Vec<MemberNode>, Error> {
        self.scan(OPER_MEMBER_NODE, "")
    }

    /// Read-modify-write of a member node record, created on first use.
    pub fn update_member_node<F>(
        &self,
        dpn: DpnId,
        f: F,
    ) -> Result<MemberNode, Error>
    where
        F: FnOnce(&mut MemberNode),
    {
        let _guard = lock!(self.node_lock);
        let mut node = self
            .get_member_node(dpn)?
            .unwrap_or_else(|| MemberNode::new(dpn));
        f(&mut node);
        self.put(OPER_MEMBER_NODE, &dpn.to_string(), &node)?;
        Ok(node)
    }

    //
    // interfaces
    //

    pub fn put_interface(&self, iface: &VpnInterface) -> Result<(), Error> {
        self.put(CONFIG_INTERFACE, &iface.name, iface)
    }

    pub fn get_interface(
        &self,
        name: &str,
    ) -> Result<Option<VpnInterface>, Error> {
        self.get(CONFIG_INTERFACE, name)
    }

    pub fn remove_interface(&self, name: &str) -> Result<(), Error> {
        self.delete::<VpnInterface>(CONFIG_INTERFACE, name)?;
        Ok(())
    }

    pub fn get_interfaces(&self) -> Result<Vec<VpnInterface>, Error> {
        self.scan(CONFIG_INTERFACE, "")
    }

    pub fn put_prefix_to_interface(
        &self,
        p: &PrefixToInterface,
    ) -> Result<(), Error> {
        self.put(
            OPER_PREFIX_TO_INTERFACE,
            &prefix_to_interface_key(p.vpn_id, &p.ip),
            p,
        )
    }

    pub fn get_prefix_to_interface(
        &self,
        vpn_id: u32,
        ip: &Prefix,
    ) -> Result<Option<PrefixToInterface>, Error> {
        self.get(OPER_PREFIX_TO_INTERFACE, &prefix_to_interface_key(vpn_id, ip))
    }

    pub fn remove_prefix_to_interface(
        &self,
        vpn_id: u32,
        ip: &Prefix,
    ) -> Result<(), Error> {
        self.delete::<PrefixToInterface>(
            OPER_PREFIX_TO_INTERFACE,
            &prefix_to_interface_key(vpn_id, ip),
        )?;
        Ok(())
    }

    //
    // forwarding entries
    //

    pub fn get_vrf_entry(&self, key: &VrfKey) -> Result<Option<VrfEntry>, Error> {
        self.get(OPER_VRF, &key.db_key())
    }

    pub fn get_vrf_entries(&self, rd: &str) -> Result<Vec<VrfEntry>, Error> {
        self.scan(OPER_VRF, &VrfKey::rd_scan(rd))
    }

    pub fn get_all_vrf_entries(&self) -> Result<Vec<VrfEntry>, Error> {
        self.scan(OPER_VRF, "")
    }

    /// Atomically replace the entry at `key` with the result of `f`.
    /// Returning `None` from `f` deletes the entry. Watchers are notified
    /// only if the stored entry actually changed, and the change is
    /// returned.
    pub fn update_vrf_entry<F>(
        &self,
        key: &VrfKey,
        f: F,
    ) -> Result<Option<FibChange>, Error>
    where
        F: FnOnce(Option<&VrfEntry>) -> Option<VrfEntry>,
    {
        let _guard = lock!(self.vrf_lock);
        let current = self.get_vrf_entry(key)?;
        let next = f(current.as_ref());
        let change = match (current, next) {
            (None, None) => None,
            (Some(old), None) => {
                self.delete::<VrfEntry>(OPER_VRF, &key.db_key())?;
                Some(FibChange::Removed(old))
            }
            (None, Some(new)) => {
                self.put(OPER_VRF, &key.db_key(), &new)?;
                Some(FibChange::Added(new))
            }
            (Some(old), Some(new)) if old == new => None,
            (Some(_), Some(new)) => {
                self.put(OPER_VRF, &key.db_key(), &new)?;
                Some(FibChange::Updated(new))
            }
        };
        if let Some(change) = &change {
            vrdb_log!(self, debug, MOD_DB,
                "forwarding entry changed";
                "entry" => key.to_string(),
                "change" => format!("{change:?}")
            );
            self.notify(vec![change.clone()]);
        }
        Ok(change)
    }

    pub fn set_vrf_entry(
        &self,
        entry: VrfEntry,
    ) -> Result<Option<FibChange>, Error> {
        let key = entry.key();
        self.update_vrf_entry(&key, |_| Some(entry))
    }

    pub fn remove_vrf_entry(
        &self,
        key: &VrfKey,
    ) -> Result<Option<FibChange>, Error> {
        self.update_vrf_entry(key, |_| None)
    }
}
