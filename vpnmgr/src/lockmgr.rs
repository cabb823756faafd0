// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Named locks serializing read-decide-write cycles on shared records.
//!
//! A [`KeyGuard`] is the only way to hold a key and releases it when
//! dropped, so a key can not leak across an early return or a retried job.
//! Never acquire a second key while holding one.

use std::collections::HashSet;
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};
use uuid::Uuid;
use vpn_common::lock;
use vrdb::{DpnId, Prefix};

#[derive(Debug, Default)]
pub struct LockManager {
    held: Mutex<HashSet<String>>,
    released: Condvar,
}

#[must_use = "the key is released as soon as the guard is dropped"]
#[derive(Debug)]
pub struct KeyGuard<'a> {
    mgr: &'a LockManager,
    key: String,
}

impl KeyGuard<'_> {
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl Drop for KeyGuard<'_> {
    fn drop(&mut self) {
        lock!(self.mgr.held).remove(&self.key);
        self.mgr.released.notify_all();
    }
}

impl LockManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Block until `key` is free and take it.
    pub fn lock(&self, key: impl Into<String>) -> KeyGuard<'_> {
        let key = key.into();
        let mut held = lock!(self.held);
        while held.contains(&key) {
            held = self.released.wait(held).expect("lock manager wait");
        }
        held.insert(key.clone());
        KeyGuard { mgr: self, key }
    }

    /// Like [`LockManager::lock`] but gives up after `timeout`.
    pub fn try_lock_for(
        &self,
        key: impl Into<String>,
        timeout: Duration,
    ) -> Option<KeyGuard<'_>> {
        let key = key.into();
        let deadline = Instant::now() + timeout;
        let mut held = lock!(self.held);
        while held.contains(&key) {
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            held = self
                .released
                .wait_timeout(held, deadline - now)
                .expect("lock manager wait")
                .0;
        }
        held.insert(key.clone());
        Some(KeyGuard { mgr: self, key })
    }

    pub fn is_locked(&self, key: &str) -> bool {
        lock!(self.held).contains(key)
    }
}

pub fn subnet_key(subnet_id: Uuid) -> String {
    format!("subnet:{subnet_id}")
}

pub fn prefix_key(vpn: &str, prefix: &Prefix) -> String {
    format!("prefix:{vpn}:{prefix}")
}

pub fn interface_key(name: &str) -> String {
    format!("interface:{name}")
}

pub fn vpn_key(name: &str) -> String {
    format!("vpn:{name}")
}

pub fn node_key(dpn: DpnId) -> String {
    format!("node:{dpn}")
}
