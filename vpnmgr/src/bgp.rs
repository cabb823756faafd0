// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The interface to the BGP speaker that carries VPN routes to the outside
//! world.

use std::net::IpAddr;
use vrdb::{EncapType, Prefix};

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum BgpError {
    #[error("speaker unavailable: {0}")]
    Unavailable(String),

    #[error("speaker rejected route: {0}")]
    Rejected(String),
}

/// What a route is forwarded with once it reaches the advertised next hop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RouteLabel {
    Mpls(u32),
    Vni(u32),
}

impl RouteLabel {
    pub fn label(&self) -> Option<u32> {
        match self {
            Self::Mpls(l) => Some(*l),
            Self::Vni(_) => None,
        }
    }

    pub fn vni(&self) -> Option<u32> {
        match self {
            Self::Mpls(_) => None,
            Self::Vni(v) => Some(*v),
        }
    }

    /// Recover the label of a stored forwarding entry.
    pub fn of(label: Option<u32>, vni: Option<u32>) -> Option<Self> {
        match (label, vni) {
            (_, Some(v)) => Some(Self::Vni(v)),
            (Some(l), None) => Some(Self::Mpls(l)),
            (None, None) => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdvertiseRequest {
    pub rd: String,
    pub prefix: Prefix,
    /// Tunnel endpoint addresses. Empty for an external subnet route.
    pub nexthops: Vec<IpAddr>,
    pub encap: EncapType,
    pub label: RouteLabel,
    pub gateway_mac: Option<String>,
}

/// Both calls must be idempotent: advertising an identical route twice or
/// withdrawing a route that is not there is not an error.
pub trait BgpSpeaker: Send + Sync {
    fn advertise_prefix(&self, req: &AdvertiseRequest) -> Result<(), BgpError>;
    fn withdraw_prefix(&self, rd: &str, prefix: &Prefix)
        -> Result<(), BgpError>;
}
