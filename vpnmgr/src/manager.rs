// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The engine facade. Topology, port, tunnel and configuration events come
//! in as [`Event`]s and run as jobs on the key-partitioned work queue:
//!
//! | event                         | partition key        |
//! |-------------------------------|----------------------|
//! | VPN added/updated/removed     | vpn name             |
//! | subnet added/removed, ports   | subnet id            |
//! | interface added/updated/gone  | interface name       |
//! | extra route added/removed     | vpn name + prefix    |
//! | tunnel/node status            | member node id       |
//!
//! Events are treated as at-least-once: every handler tolerates seeing the
//! same event twice.

use crate::adjacency::{AdjacencyCoordinator, SubnetTrigger};
use crate::bgp::BgpSpeaker;
use crate::config::EngineConfig;
use crate::election::SubnetRouteElector;
use crate::error::Error;
use crate::extra_route::ExtraRouteAllocator;
use crate::fanout::RouteFanout;
use crate::flows::FlowProgrammer;
use crate::idmgr::{IdAllocator, IdManager};
use crate::inflight::DeleteTracker;
use crate::lockmgr::{
    interface_key, node_key, prefix_key, subnet_key, vpn_key, LockManager,
};
use crate::log::mgr_log;
use crate::queue::{JobCoordinator, JobSender};
use crate::rtindex::RouteTargetIndex;
use crate::vpn::VpnLifecycle;
use slog::Logger;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;
use vpn_common::thread::ManagedThread;
use vrdb::{
    Db, DpnId, Prefix, RouteOrigin, SubnetConfig, VpnConfig, VpnInterface,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    VpnAdded(VpnConfig),
    VpnUpdated(VpnConfig),
    VpnRemoved(String),
    SubnetAdded(SubnetConfig),
    SubnetRemoved(Uuid),
    InterfaceAdded(VpnInterface),
    InterfaceUpdated(VpnInterface),
    InterfaceRemoved(String),
    PortUp {
        subnet_id: Uuid,
        dpn: DpnId,
        port: String,
    },
    PortDown {
        subnet_id: Uuid,
        dpn: DpnId,
        port: String,
    },
    /// A member node of the subnet became eligible as next hop.
    NodeGained {
        subnet_id: Uuid,
        dpn: DpnId,
    },
    /// A member node of the subnet stopped being eligible.
    NodeLost {
        subnet_id: Uuid,
        dpn: DpnId,
    },
    TunnelUp {
        dpn: DpnId,
        tep: IpAddr,
    },
    TunnelDown {
        dpn: DpnId,
    },
    NodeConnected(DpnId),
    NodeDisconnected(DpnId),
    ExtraRouteAdded {
        vpn: String,
        prefix: Prefix,
        nexthop: IpAddr,
    },
    ExtraRouteRemoved {
        vpn: String,
        prefix: Prefix,
        nexthop: IpAddr,
    },
}

impl Event {
    /// The work queue partition the event runs in.
    pub fn key(&self) -> String {
        match self {
            Self::VpnAdded(cfg) | Self::VpnUpdated(cfg) => vpn_key(&cfg.name),
            Self::VpnRemoved(name) => vpn_key(name),
            Self::SubnetAdded(cfg) => subnet_key(cfg.subnet_id),
            Self::SubnetRemoved(id)
            | Self::PortUp { subnet_id: id, .. }
            | Self::PortDown { subnet_id: id, .. }
            | Self::NodeGained { subnet_id: id, .. }
            | Self::NodeLost { subnet_id: id, .. } => subnet_key(*id),
            Self::InterfaceAdded(iface) | Self::InterfaceUpdated(iface) => {
                interface_key(&iface.name)
            }
            Self::InterfaceRemoved(name) => interface_key(name),
            Self::TunnelUp { dpn, .. }
            | Self::TunnelDown { dpn }
            | Self::NodeConnected(dpn)
            | Self::NodeDisconnected(dpn) => node_key(*dpn),
            Self::ExtraRouteAdded { vpn, prefix, .. }
            | Self::ExtraRouteRemoved { vpn, prefix, .. } => {
                prefix_key(vpn, prefix)
            }
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::VpnAdded(_) => "vpn_added",
            Self::VpnUpdated(_) => "vpn_updated",
            Self::VpnRemoved(_) => "vpn_removed",
            Self::SubnetAdded(_) => "subnet_added",
            Self::SubnetRemoved(_) => "subnet_removed",
            Self::InterfaceAdded(_) => "interface_added",
            Self::InterfaceUpdated(_) => "interface_updated",
            Self::InterfaceRemoved(_) => "interface_removed",
            Self::PortUp { .. } => "port_up",
            Self::PortDown { .. } => "port_down",
            Self::NodeGained { .. } => "node_gained",
            Self::NodeLost { .. } => "node_lost",
            Self::TunnelUp { .. } => "tunnel_up",
            Self::TunnelDown { .. } => "tunnel_down",
            Self::NodeConnected(_) => "node_connected",
            Self::NodeDisconnected(_) => "node_disconnected",
            Self::ExtraRouteAdded { .. } => "extra_route_added",
            Self::ExtraRouteRemoved { .. } => "extra_route_removed",
        }
    }
}

impl From<SubnetTrigger> for Event {
    fn from(t: SubnetTrigger) -> Self {
        match t {
            SubnetTrigger::PortUp {
                subnet_id,
                dpn,
                port,
            } => Event::PortUp {
                subnet_id,
                dpn,
                port,
            },
            SubnetTrigger::PortDown {
                subnet_id,
                dpn,
                port,
            } => Event::PortDown {
                subnet_id,
                dpn,
                port,
            },
        }
    }
}

/// Everything a job needs, shared by all jobs.
pub struct Engine {
    pub db: Db,
    pub ids: Arc<dyn IdAllocator>,
    pub locks: Arc<LockManager>,
    pub rtindex: RouteTargetIndex,
    pub fanout: RouteFanout,
    pub extra: ExtraRouteAllocator,
    pub elector: SubnetRouteElector,
    pub vpns: VpnLifecycle,
    pub adjacency: AdjacencyCoordinator,
    _delete_watch: ManagedThread,
    log: Logger,
}

impl Engine {
    pub fn new(
        db: Db,
        config: &EngineConfig,
        bgp: Arc<dyn BgpSpeaker>,
        flows: Arc<dyn FlowProgrammer>,
        log: Logger,
    ) -> Result<Self, Error> {
        let ids: Arc<dyn IdAllocator> =
            Arc::new(IdManager::init(db.clone(), config)?);
        let locks = Arc::new(LockManager::new());
        let rtindex = RouteTargetIndex::new(db.clone(), log.clone());
        let fanout = RouteFanout::new(db.clone(), rtindex.clone(), log.clone());
        let extra = ExtraRouteAllocator::new(
            db.clone(),
            ids.clone(),
            bgp.clone(),
            fanout.clone(),
            locks.clone(),
            log.clone(),
        );
        let elector = SubnetRouteElector::new(
            db.clone(),
            ids.clone(),
            bgp.clone(),
            fanout.clone(),
            rtindex.clone(),
            locks.clone(),
            log.clone(),
        );
        let vpns = VpnLifecycle::new(
            db.clone(),
            ids.clone(),
            rtindex.clone(),
            fanout.clone(),
            locks.clone(),
            config,
            log.clone(),
        );
        let deletes = DeleteTracker::new();
        let delete_watch = deletes.watch(&db, log.clone())?;
        let adjacency = AdjacencyCoordinator::new(
            db.clone(),
            ids.clone(),
            bgp,
            flows,
            fanout.clone(),
            extra.clone(),
            locks.clone(),
            deletes,
            config.delete_wait_timeout(),
            log.clone(),
        );
        Ok(Self {
            db,
            ids,
            locks,
            rtindex,
            fanout,
            extra,
            elector,
            vpns,
            adjacency,
            _delete_watch: delete_watch,
            log,
        })
    }

    /// Run one event to completion on the calling thread. Follow-up work on
    /// other keys goes to `follow_up`.
    pub fn apply(
        &self,
        event: Event,
        follow_up: &mut Vec<Event>,
    ) -> Result<(), Error> {
        match event {
            Event::VpnAdded(cfg) => self.vpns.add_vpn(cfg).map(|_| ()),
            Event::VpnUpdated(cfg) => self.vpns.update_vpn(cfg).map(|_| ()),
            Event::VpnRemoved(name) => self.vpns.remove_vpn(&name),

            Event::SubnetAdded(cfg) => {
                let vpn = self.vpns.wait_for_vpn(&cfg.vpn_name)?;
                self.elector.subnet_added(&cfg, &vpn)
            }
            Event::SubnetRemoved(id) => self.elector.subnet_removed(id),

            Event::InterfaceAdded(iface) | Event::InterfaceUpdated(iface) => {
                let vpn = self.vpns.wait_for_vpn(&iface.vpn_name)?;
                let mut triggers = Vec::new();
                let result =
                    self.adjacency.add_interface(iface, &vpn, &mut triggers);
                follow_up.extend(triggers.into_iter().map(Event::from));
                result
            }
            Event::InterfaceRemoved(name) => {
                let mut triggers = Vec::new();
                let result =
                    self.adjacency.remove_interface(&name, &mut triggers);
                follow_up.extend(triggers.into_iter().map(Event::from));
                result
            }

            Event::PortUp {
                subnet_id,
                dpn,
                port,
            } => self.elector.port_added(subnet_id, dpn, &port),
            Event::PortDown {
                subnet_id,
                dpn,
                port,
            } => self.elector.port_removed(subnet_id, dpn, &port),
            Event::NodeGained { subnet_id, dpn } => {
                self.elector.node_gained(subnet_id, dpn)
            }
            Event::NodeLost { subnet_id, dpn } => {
                self.elector.node_lost(subnet_id, dpn)
            }

            Event::TunnelUp { dpn, tep } => {
                self.db.update_member_node(dpn, |n| n.tep = Some(tep))?;
                self.node_changed(dpn, true, follow_up)
            }
            Event::TunnelDown { dpn } => {
                self.db.update_member_node(dpn, |n| n.tep = None)?;
                self.node_changed(dpn, false, follow_up)
            }
            Event::NodeConnected(dpn) => {
                self.db.update_member_node(dpn, |n| n.connected = true)?;
                self.node_changed(dpn, true, follow_up)
            }
            Event::NodeDisconnected(dpn) => {
                self.db.update_member_node(dpn, |n| n.connected = false)?;
                self.node_changed(dpn, false, follow_up)
            }

            Event::ExtraRouteAdded {
                vpn,
                prefix,
                nexthop,
            } => {
                let vpn = self.vpns.wait_for_vpn(&vpn)?;
                self.extra
                    .add_route(&vpn, prefix, nexthop, RouteOrigin::Static)
                    .map(|_| ())
            }
            Event::ExtraRouteRemoved {
                vpn,
                prefix,
                nexthop,
            } => {
                let vpn = self.vpns.wait_for_vpn(&vpn)?;
                self.extra.remove_route(&vpn, prefix, nexthop).map(|_| ())
            }
        }
    }

    /// Node status changes fan out into one election job per subnet the
    /// node matters to.
    fn node_changed(
        &self,
        dpn: DpnId,
        gained: bool,
        follow_up: &mut Vec<Event>,
    ) -> Result<(), Error> {
        let subnets = self.elector.affected_subnets(dpn)?;
        mgr_log!(self.log, info,
            "member node status changed";
            "dpn" => dpn,
            "gained" => gained,
            "subnets" => subnets.len()
        );
        for subnet_id in subnets {
            follow_up.push(if gained {
                Event::NodeGained { subnet_id, dpn }
            } else {
                Event::NodeLost { subnet_id, dpn }
            });
        }
        Ok(())
    }
}

pub struct VpnManager {
    engine: Arc<Engine>,
    queue: JobCoordinator,
    log: Logger,
}

fn submit(engine: &Arc<Engine>, sender: &JobSender, event: Event) {
    let key = event.key();
    let name = event.name();
    let job_engine = engine.clone();
    let job_sender = sender.clone();
    sender.enqueue(&key, name, move || {
        let mut follow_up = Vec::new();
        let result = job_engine.apply(event.clone(), &mut follow_up);
        for next in follow_up {
            submit(&job_engine, &job_sender, next);
        }
        result
    });
}

impl VpnManager {
    pub fn new(
        db: Db,
        config: EngineConfig,
        bgp: Arc<dyn BgpSpeaker>,
        flows: Arc<dyn FlowProgrammer>,
        log: Logger,
    ) -> Result<Self, Error> {
        config.validate()?;
        let engine =
            Arc::new(Engine::new(db, &config, bgp, flows, log.clone())?);
        let queue = JobCoordinator::new(
            config.workers,
            config.max_job_retries,
            log.clone(),
        )?;
        mgr_log!(log, info,
            "vpn manager started";
            "workers" => queue.worker_count(),
            "max_job_retries" => config.max_job_retries
        );
        Ok(Self { engine, queue, log })
    }

    /// Queue an event. Failures are handled at the job boundary and show
    /// up in the logs and in persisted route state.
    pub fn handle(&self, event: Event) {
        mgr_log!(self.log, debug,
            "event";
            "event" => event.name(),
            "key" => event.key()
        );
        submit(&self.engine, &self.queue.sender(), event);
    }

    pub fn pending(&self) -> usize {
        self.queue.pending()
    }

    pub fn wait_idle(&self, timeout: Duration) -> bool {
        self.queue.wait_idle(timeout)
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    pub fn db(&self) -> &Db {
        &self.engine.db
    }
}
