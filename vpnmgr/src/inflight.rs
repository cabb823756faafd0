// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Tracks interface deletes that are still being torn down so that an add
//! of the same interface can wait for them.
//!
//! A delete is in flight from [`DeleteTracker::begin`] until the forwarding
//! changes it made have been delivered to forwarding table watchers. The
//! deleting job settles its ticket on the store generation it reached, and
//! the tracker's own watcher releases the delete once notifications up to
//! that generation have gone by.

use crate::error::Error;
use crate::log::adj_log;
use slog::Logger;
use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::mpsc::{channel, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use vpn_common::lock;
use vpn_common::thread::ManagedThread;
use vrdb::Db;

const WATCH_POLL_INTERVAL: Duration = Duration::from_millis(100);

type DeleteKey = (String, String);

#[derive(Default)]
struct PendingDelete {
    /// Generation the delete's forwarding changes end at, once the deleting
    /// job has finished its own work.
    until: Option<u64>,
    waiters: Vec<Sender<()>>,
}

#[derive(Default)]
struct InFlight {
    deletes: HashMap<DeleteKey, PendingDelete>,
    /// Highest forwarding generation delivered to watchers so far.
    seen: u64,
}

impl InFlight {
    fn resolve(&mut self, key: &DeleteKey) {
        if let Some(pending) = self.deletes.remove(key) {
            for w in pending.waiters {
                let _ = w.send(());
            }
        }
    }
}

#[derive(Clone, Default)]
pub struct DeleteTracker {
    inner: Arc<Mutex<InFlight>>,
}

/// Held by the deleting job. Dropping a ticket that was never settled
/// releases the delete at once.
pub struct DeleteTicket {
    tracker: DeleteTracker,
    key: Option<DeleteKey>,
}

impl DeleteTicket {
    /// Release the delete now.
    pub fn complete(mut self) {
        if let Some(key) = self.key.take() {
            lock!(self.tracker.inner).resolve(&key);
        }
    }

    /// The deleting job is done. The delete stays in flight until
    /// forwarding changes up to `generation` have been delivered.
    pub fn settle_at(mut self, generation: u64) {
        let Some(key) = self.key.take() else {
            return;
        };
        let mut inner = lock!(self.tracker.inner);
        if inner.seen >= generation {
            inner.resolve(&key);
        } else if let Some(pending) = inner.deletes.get_mut(&key) {
            pending.until = Some(generation);
        }
    }
}

impl Drop for DeleteTicket {
    fn drop(&mut self) {
        if let Some(key) = self.key.take() {
            lock!(self.tracker.inner).resolve(&key);
        }
    }
}

impl DeleteTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark a delete of `interface` from `vpn` as in flight.
    pub fn begin(&self, interface: &str, vpn: &str) -> DeleteTicket {
        let key = (interface.to_string(), vpn.to_string());
        lock!(self.inner).deletes.entry(key.clone()).or_default();
        DeleteTicket {
            tracker: self.clone(),
            key: Some(key),
        }
    }

    pub fn in_flight(&self, interface: &str, vpn: &str) -> bool {
        lock!(self.inner)
            .deletes
            .contains_key(&(interface.to_string(), vpn.to_string()))
    }

    /// Forwarding changes up to `generation` have been delivered. Settled
    /// deletes at or below it are released.
    pub fn observe(&self, generation: u64) {
        let mut inner = lock!(self.inner);
        inner.seen = inner.seen.max(generation);
        let seen = inner.seen;
        let done: Vec<DeleteKey> = inner
            .deletes
            .iter()
            .filter(|(_, p)| p.until.is_some_and(|g| g <= seen))
            .map(|(k, _)| k.clone())
            .collect();
        for key in &done {
            inner.resolve(key);
        }
    }

    /// Follow the forwarding change notifications of `db` on a thread of
    /// its own. The thread stops when the returned handle is dropped.
    pub fn watch(&self, db: &Db, log: Logger) -> Result<ManagedThread, Error> {
        let (tx, rx) = channel();
        // Nothing before this point can be waited on, so start caught up.
        self.observe(db.generation());
        db.watch("interface-deletes".into(), tx);

        let tracker = self.clone();
        let thread = ManagedThread::new();
        thread.spawn("vpnmgr-delete-watch".into(), move |stop| loop {
            if stop.load(Ordering::Relaxed) {
                break;
            }
            match rx.recv_timeout(WATCH_POLL_INTERVAL) {
                Ok(n) => tracker.observe(n.generation),
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => {
                    adj_log!(log, warn, "forwarding watch closed");
                    break;
                }
            }
        })?;
        Ok(thread)
    }

    /// Wait for an in-flight delete to finish. Returns true immediately if
    /// there is none, false if `timeout` passes first.
    pub fn wait(&self, interface: &str, vpn: &str, timeout: Duration) -> bool {
        let rx = {
            let mut inner = lock!(self.inner);
            let key = (interface.to_string(), vpn.to_string());
            let Some(pending) = inner.deletes.get_mut(&key) else {
                return true;
            };
            let (tx, rx) = channel();
            pending.waiters.push(tx);
            rx
        };
        match rx.recv_timeout(timeout) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => true,
            Err(RecvTimeoutError::Timeout) => false,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use vpn_common::log::init_file_logger;
    use vpn_common::{cidr, wait_for_eq};
    use vrdb::test::get_test_db;
    use vrdb::{Prefix, RouteOrigin, VrfEntry};

    #[test]
    fn wait_without_delete_returns_at_once() {
        let t = DeleteTracker::new();
        assert!(t.wait("tap0", "blue", Duration::from_millis(1)));
    }

    #[test]
    fn waiter_released_by_completion() {
        let t = DeleteTracker::new();
        let ticket = t.begin("tap0", "blue");
        assert!(t.in_flight("tap0", "blue"));
        assert!(!t.in_flight("tap0", "red"));

        let waiter = {
            let t = t.clone();
            std::thread::spawn(move || {
                t.wait("tap0", "blue", Duration::from_secs(10))
            })
        };
        std::thread::sleep(Duration::from_millis(20));
        ticket.complete();
        assert!(waiter.join().unwrap());
        assert!(!t.in_flight("tap0", "blue"));
    }

    #[test]
    fn dropped_ticket_completes() {
        let t = DeleteTracker::new();
        {
            let _ticket = t.begin("tap0", "blue");
        }
        assert!(!t.in_flight("tap0", "blue"));
    }

    #[test]
    fn waiter_times_out() {
        let t = DeleteTracker::new();
        let _ticket = t.begin("tap0", "blue");
        assert!(!t.wait("tap0", "blue", Duration::from_millis(20)));
    }

    #[test]
    fn settled_delete_waits_for_its_generation() {
        let t = DeleteTracker::new();
        t.observe(3);
        t.begin("tap0", "blue").settle_at(5);
        assert!(t.in_flight("tap0", "blue"));
        assert!(!t.wait("tap0", "blue", Duration::from_millis(20)));

        t.observe(4);
        assert!(t.in_flight("tap0", "blue"));
        t.observe(5);
        assert!(!t.in_flight("tap0", "blue"));

        // already delivered
        t.begin("tap1", "blue").settle_at(2);
        assert!(!t.in_flight("tap1", "blue"));
    }

    #[test]
    fn watcher_releases_delete_after_notification() {
        let log = init_file_logger("delete_watch.log");
        let db = get_test_db("delete_watch", log.clone()).unwrap();
        let t = DeleteTracker::new();
        let _watch = t.watch(&db, log).unwrap();

        let prefix: Prefix = cidr!("10.0.0.0/24");
        db.set_vrf_entry(VrfEntry {
            rd: "1:1".into(),
            prefix,
            nexthops: Vec::new(),
            label: Some(100),
            vni: None,
            origin: RouteOrigin::Static,
            gateway_mac: None,
            parent_rd: None,
            subnet: None,
            sources: Default::default(),
        })
        .unwrap();

        let ticket = t.begin("tap0", "blue");
        db.remove_vrf_entry(&vrdb::VrfKey::new("1:1", prefix)).unwrap();
        ticket.settle_at(db.generation());
        wait_for_eq!(t.in_flight("tap0", "blue"), false);
        assert!(t.wait("tap0", "blue", Duration::from_millis(1)));
    }
}
