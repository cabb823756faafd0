// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Flow directives for member nodes. Forwarding table entries leave the
//! engine through database watchers; the directives here cover what is not
//! a forwarding entry.

use std::net::IpAddr;
use vrdb::DpnId;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum FlowError {
    #[error("node {0} unreachable")]
    NodeUnreachable(DpnId),

    #[error("programming failed: {0}")]
    Failed(String),
}

pub trait FlowProgrammer: Send + Sync {
    fn install_gateway_mac(
        &self,
        dpn: DpnId,
        vpn_id: u32,
        mac: &str,
    ) -> Result<(), FlowError>;

    fn remove_gateway_mac(
        &self,
        dpn: DpnId,
        vpn_id: u32,
        mac: &str,
    ) -> Result<(), FlowError>;

    fn install_arp_responder(
        &self,
        dpn: DpnId,
        interface: &str,
        ip: IpAddr,
        mac: &str,
    ) -> Result<(), FlowError>;

    fn remove_arp_responder(
        &self,
        dpn: DpnId,
        interface: &str,
        ip: IpAddr,
        mac: &str,
    ) -> Result<(), FlowError>;
}
