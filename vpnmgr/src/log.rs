// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

pub const UNIT_ELECTION: &str = "election";
pub const UNIT_EXTRA_ROUTE: &str = "extra_route";
pub const UNIT_FANOUT: &str = "fanout";
pub const UNIT_RTINDEX: &str = "rtindex";
pub const UNIT_ADJACENCY: &str = "adjacency";
pub const UNIT_VPN: &str = "vpn";
pub const UNIT_MANAGER: &str = "manager";
pub const UNIT_WORKER: &str = "worker";

macro_rules! election_log {
    ($log:expr, $level:ident, $msg:expr; $($key:expr => $value:expr),*) => {
        slog::$level!($log,
            $msg;
            "component" => crate::COMPONENT_VPNMGR,
            "module" => crate::MOD_ENGINE,
            "unit" => crate::log::UNIT_ELECTION,
            $($key => $value),*
        )
    };
    ($log:expr, $level:ident, $msg:expr) => {
        slog::$level!($log,
            $msg;
            "component" => crate::COMPONENT_VPNMGR,
            "module" => crate::MOD_ENGINE,
            "unit" => crate::log::UNIT_ELECTION
        )
    };
}

macro_rules! route_log {
    ($log:expr, $level:ident, $msg:expr; $($key:expr => $value:expr),*) => {
        slog::$level!($log,
            $msg;
            "component" => crate::COMPONENT_VPNMGR,
            "module" => crate::MOD_ENGINE,
            "unit" => crate::log::UNIT_EXTRA_ROUTE,
            $($key => $value),*
        )
    };
    ($log:expr, $level:ident, $msg:expr) => {
        slog::$level!($log,
            $msg;
            "component" => crate::COMPONENT_VPNMGR,
            "module" => crate::MOD_ENGINE,
            "unit" => crate::log::UNIT_EXTRA_ROUTE
        )
    };
}

macro_rules! fanout_log {
    ($log:expr, $level:ident, $msg:expr; $($key:expr => $value:expr),*) => {
        slog::$level!($log,
            $msg;
            "component" => crate::COMPONENT_VPNMGR,
            "module" => crate::MOD_ENGINE,
            "unit" => crate::log::UNIT_FANOUT,
            $($key => $value),*
        )
    };
    ($log:expr, $level:ident, $msg:expr) => {
        slog::$level!($log,
            $msg;
            "component" => crate::COMPONENT_VPNMGR,
            "module" => crate::MOD_ENGINE,
            "unit" => crate::log::UNIT_FANOUT
        )
    };
}

macro_rules! rt_log {
    ($log:expr, $level:ident, $msg:expr; $($key:expr => $value:expr),*) => {
        slog::$level!($log,
            $msg;
            "component" => crate::COMPONENT_VPNMGR,
            "module" => crate::MOD_ENGINE,
            "unit" => crate::log::UNIT_RTINDEX,
            $($key => $value),*
        )
    };
    ($log:expr, $level:ident, $msg:expr) => {
        slog::$level!($log,
            $msg;
            "component" => crate::COMPONENT_VPNMGR,
            "module" => crate::MOD_ENGINE,
            "unit" => crate::log::UNIT_RTINDEX
        )
    };
}

macro_rules! adj_log {
    ($log:expr, $level:ident, $msg:expr; $($key:expr => $value:expr),*) => {
        slog::$level!($log,
            $msg;
            "component" => crate::COMPONENT_VPNMGR,
            "module" => crate::MOD_ENGINE,
            "unit" => crate::log::UNIT_ADJACENCY,
            $($key => $value),*
        )
    };
    ($log:expr, $level:ident, $msg:expr) => {
        slog::$level!($log,
            $msg;
            "component" => crate::COMPONENT_VPNMGR,
            "module" => crate::MOD_ENGINE,
            "unit" => crate::log::UNIT_ADJACENCY
        )
    };
}

macro_rules! vpn_log {
    ($log:expr, $level:ident, $msg:expr; $($key:expr => $value:expr),*) => {
        slog::$level!($log,
            $msg;
            "component" => crate::COMPONENT_VPNMGR,
            "module" => crate::MOD_ENGINE,
            "unit" => crate::log::UNIT_VPN,
            $($key => $value),*
        )
    };
    ($log:expr, $level:ident, $msg:expr) => {
        slog::$level!($log,
            $msg;
            "component" => crate::COMPONENT_VPNMGR,
            "module" => crate::MOD_ENGINE,
            "unit" => crate::log::UNIT_VPN
        )
    };
}

macro_rules! mgr_log {
    ($log:expr, $level:ident, $msg:expr; $($key:expr => $value:expr),*) => {
        slog::$level!($log,
            $msg;
            "component" => crate::COMPONENT_VPNMGR,
            "module" => crate::MOD_ENGINE,
            "unit" => crate::log::UNIT_MANAGER,
            $($key => $value),*
        )
    };
    ($log:expr, $level:ident, $msg:expr) => {
        slog::$level!($log,
            $msg;
            "component" => crate::COMPONENT_VPNMGR,
            "module" => crate::MOD_ENGINE,
            "unit" => crate::log::UNIT_MANAGER
        )
    };
}

// work queue
macro_rules! queue_log {
    ($log:expr, $level:ident, $msg:expr; $($key:expr => $value:expr),*) => {
        slog::$level!($log,
            $msg;
            "component" => crate::COMPONENT_VPNMGR,
            "module" => crate::MOD_QUEUE,
            "unit" => crate::log::UNIT_WORKER,
            $($key => $value),*
        )
    };
    ($log:expr, $level:ident, $msg:expr) => {
        slog::$level!($log,
            $msg;
            "component" => crate::COMPONENT_VPNMGR,
            "module" => crate::MOD_QUEUE,
            "unit" => crate::log::UNIT_WORKER
        )
    };
}

pub(crate) use {
    adj_log, election_log, fanout_log, mgr_log, queue_log, route_log, rt_log,
    vpn_log,
};
