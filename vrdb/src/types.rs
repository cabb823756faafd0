// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use chrono::{DateTime, Utc};
use itertools::Itertools;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt::{self, Display, Formatter};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::str::FromStr;
use uuid::Uuid;

/// Identifier of a member node (forwarding switch) in the VPN fabric.
pub type DpnId = u64;

#[derive(
    Debug, Copy, Clone, Serialize, Deserialize, Eq, Hash, PartialEq, JsonSchema,
)]
pub struct Prefix4 {
    pub value: Ipv4Addr,
    pub length: u8,
}

impl PartialOrd for Prefix4 {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for Prefix4 {
    fn cmp(&self, other: &Self) -> Ordering {
        if self.value != other.value {
            return self.value.cmp(&other.value);
        }
        self.length.cmp(&other.length)
    }
}

impl Prefix4 {
    const HOST_MASK: u8 = 32;

    /// Create a new `Prefix4` from an IP address and net mask. Host bits are
    /// zeroed on creation.
    /// ```
    /// use vrdb::types::Prefix4;
    /// use std::net::Ipv4Addr;
    /// let p4 = Prefix4::new(Ipv4Addr::new(10, 0, 0, 10), 24);
    /// assert_eq!(p4.value, Ipv4Addr::new(10, 0, 0, 0));
    /// ```
    pub fn new(ip: Ipv4Addr, length: u8) -> Self {
        let length = length.min(Self::HOST_MASK);
        Self {
            value: Ipv4Addr::from(ip.to_bits() & Self::mask(length)),
            length,
        }
    }

    pub fn host(ip: Ipv4Addr) -> Self {
        Self::new(ip, Self::HOST_MASK)
    }

    fn mask(length: u8) -> u32 {
        match length {
            0 => 0,
            _ => (!0u32) << (32 - length),
        }
    }

    pub fn host_bits_are_unset(&self) -> bool {
        self.value.to_bits() & Self::mask(self.length) == self.value.to_bits()
    }

    /// True if this prefix is equal to or more specific than `other`.
    pub fn within(&self, other: &Prefix4) -> bool {
        if self.length < other.length {
            return false;
        }
        let mask = Self::mask(other.length);
        self.value.to_bits() & mask == other.value.to_bits() & mask
    }

    pub fn contains(&self, addr: Ipv4Addr) -> bool {
        let mask = Self::mask(self.length);
        addr.to_bits() & mask == self.value.to_bits() & mask
    }

    /// The network of the shorter prefix is compared against the address of
    /// the longer prefix masked down to the shorter length.
    pub fn overlaps(&self, other: &Prefix4) -> bool {
        let (short, long) = if self.length <= other.length {
            (self, other)
        } else {
            (other, self)
        };
        let mask = Self::mask(short.length);
        short.value.to_bits() & mask == long.value.to_bits() & mask
    }

    pub fn is_host(&self) -> bool {
        self.length == Self::HOST_MASK
    }
}

impl Display for Prefix4 {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.value, self.length)
    }
}

impl FromStr for Prefix4 {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (value, length) =
            s.split_once('/').ok_or("malformed prefix".to_string())?;
        let value: Ipv4Addr =
            value.parse().map_err(|_| "malformed ip addr".to_string())?;
        let length: u8 =
            length.parse().map_err(|_| "malformed length".to_string())?;
        if length > Self::HOST_MASK {
            return Err(format!("prefix length {length} exceeds 32"));
        }
        Ok(Self::new(value, length))
    }
}

#[derive(
    Debug, Copy, Clone, Serialize, Deserialize, Hash, Eq, PartialEq, JsonSchema,
)]
pub struct Prefix6 {
    pub value: Ipv6Addr,
    pub length: u8,
}

impl PartialOrd for Prefix6 {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for Prefix6 {
    fn cmp(&self, other: &Self) -> Ordering {
        if self.value != other.value {
            return self.value.cmp(&other.value);
        }
        self.length.cmp(&other.length)
    }
}

impl Prefix6 {
    const HOST_MASK: u8 = 128;

    pub fn new(ip: Ipv6Addr, length: u8) -> Self {
        let length = length.min(Self::HOST_MASK);
        Self {
            value: Ipv6Addr::from(ip.to_bits() & Self::mask(length)),
            length,
        }
    }

    pub fn host(ip: Ipv6Addr) -> Self {
        Self::new(ip, Self::HOST_MASK)
    }

    fn mask(length: u8) -> u128 {
        match length {
            0 => 0,
            _ => (!0u128) << (128 - length),
        }
    }

    pub fn host_bits_are_unset(&self) -> bool {
        self.value.to_bits() & Self::mask(self.length) == self.value.to_bits()
    }

    pub fn within(&self, other: &Prefix6) -> bool {
        if self.length < other.length {
            return false;
        }
        let mask = Self::mask(other.length);
        self.value.to_bits() & mask == other.value.to_bits() & mask
    }

    pub fn contains(&self, addr: Ipv6Addr) -> bool {
        let mask = Self::mask(self.length);
        addr.to_bits() & mask == self.value.to_bits() & mask
    }

    pub fn overlaps(&self, other: &Prefix6) -> bool {
        let (short, long) = if self.length <= other.length {
            (self, other)
        } else {
            (other, self)
        };
        let mask = Self::mask(short.length);
        short.value.to_bits() & mask == long.value.to_bits() & mask
    }

    pub fn is_host(&self) -> bool {
        self.length == Self::HOST_MASK
    }
}

impl Display for Prefix6 {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.value, self.length)
    }
}

impl FromStr for Prefix6 {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (value, length) =
            s.split_once('/').ok_or("malformed prefix".to_string())?;
        let value: Ipv6Addr =
            value.parse().map_err(|_| "malformed ip addr".to_string())?;
        let length: u8 =
            length.parse().map_err(|_| "malformed length".to_string())?;
        if length > Self::HOST_MASK {
            return Err(format!("prefix length {length} exceeds 128"));
        }
        Ok(Self::new(value, length))
    }
}

#[derive(
    Debug,
    Copy,
    Clone,
    Serialize,
    Deserialize,
    Eq,
    Hash,
    PartialEq,
    JsonSchema,
    PartialOrd,
    Ord,
)]
pub enum Prefix {
    V4(Prefix4),
    V6(Prefix6),
}

impl Display for Prefix {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Prefix::V4(p) => p.fmt(f),
            Prefix::V6(p) => p.fmt(f),
        }
    }
}

impl From<Prefix4> for Prefix {
    fn from(value: Prefix4) -> Self {
        Self::V4(value)
    }
}

impl From<Prefix6> for Prefix {
    fn from(value: Prefix6) -> Self {
        Self::V6(value)
    }
}

impl From<IpAddr> for Prefix {
    fn from(value: IpAddr) -> Self {
        Self::host(value)
    }
}

impl FromStr for Prefix {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Ok(prefix4) = s.parse::<Prefix4>() {
            Ok(Self::V4(prefix4))
        } else if let Ok(prefix6) = s.parse::<Prefix6>() {
            Ok(Self::V6(prefix6))
        } else {
            Err(format!("malformed prefix {s}"))
        }
    }
}

impl Prefix {
    pub fn new(ip: IpAddr, length: u8) -> Self {
        match ip {
            IpAddr::V4(ip4) => Self::V4(Prefix4::new(ip4, length)),
            IpAddr::V6(ip6) => Self::V6(Prefix6::new(ip6, length)),
        }
    }

    /// A /32 or /128 prefix for `ip`.
    pub fn host(ip: IpAddr) -> Self {
        match ip {
            IpAddr::V4(ip4) => Self::V4(Prefix4::host(ip4)),
            IpAddr::V6(ip6) => Self::V6(Prefix6::host(ip6)),
        }
    }

    pub fn addr(&self) -> IpAddr {
        match self {
            Self::V4(p) => p.value.into(),
            Self::V6(p) => p.value.into(),
        }
    }

    pub fn length(&self) -> u8 {
        match self {
            Self::V4(p) => p.length,
            Self::V6(p) => p.length,
        }
    }

    pub fn is_v4(&self) -> bool {
        matches!(self, Prefix::V4(_))
    }

    pub fn is_host(&self) -> bool {
        match self {
            Self::V4(p) => p.is_host(),
            Self::V6(p) => p.is_host(),
        }
    }

    /// Cross-family comparisons are always false.
    pub fn within(&self, other: &Prefix) -> bool {
        match (self, other) {
            (Prefix::V4(a), Prefix::V4(b)) => a.within(b),
            (Prefix::V6(a), Prefix::V6(b)) => a.within(b),
            _ => false,
        }
    }

    pub fn contains(&self, addr: IpAddr) -> bool {
        match (self, addr) {
            (Prefix::V4(p), IpAddr::V4(a)) => p.contains(a),
            (Prefix::V6(p), IpAddr::V6(a)) => p.contains(a),
            _ => false,
        }
    }

    /// Two prefixes overlap when one contains the other. Cross-family
    /// prefixes never overlap.
    pub fn overlaps(&self, other: &Prefix) -> bool {
        match (self, other) {
            (Prefix::V4(a), Prefix::V4(b)) => a.overlaps(b),
            (Prefix::V6(a), Prefix::V6(b)) => a.overlaps(b),
            _ => false,
        }
    }
}

/// The address families a VPN carries.
#[derive(
    Debug,
    Copy,
    Clone,
    Eq,
    PartialEq,
    Hash,
    Serialize,
    Deserialize,
    JsonSchema,
    Default,
)]
pub enum VpnAddressFamily {
    #[default]
    Ipv4,
    Ipv6,
    Dual,
}

impl VpnAddressFamily {
    pub fn carries(&self, prefix: &Prefix) -> bool {
        match self {
            Self::Dual => true,
            Self::Ipv4 => prefix.is_v4(),
            Self::Ipv6 => !prefix.is_v4(),
        }
    }

    /// Address families may only widen while a VPN is active. Returns the
    /// resulting family or `None` if `to` would narrow `self`.
    pub fn widen(self, to: VpnAddressFamily) -> Option<VpnAddressFamily> {
        match (self, to) {
            (a, b) if a == b => Some(a),
            (Self::Dual, _) => None,
            (_, Self::Dual) => Some(Self::Dual),
            // v4 <-> v6 swaps would drop a family, both together is dual
            _ => Some(Self::Dual),
        }
    }
}

/// Tenant supplied description of a VPN, before a numeric id exists.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
pub struct VpnConfig {
    pub name: String,
    /// Route distinguishers. Empty for an internal (non-BGP) VPN.
    pub rds: Vec<String>,
    pub import_rts: BTreeSet<String>,
    pub export_rts: BTreeSet<String>,
    pub family: VpnAddressFamily,
    pub l3vni: Option<u32>,
}

impl VpnConfig {
    pub fn internal(name: &str) -> Self {
        Self {
            name: name.to_string(),
            rds: Vec::new(),
            import_rts: BTreeSet::new(),
            export_rts: BTreeSet::new(),
            family: VpnAddressFamily::Ipv4,
            l3vni: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
pub struct VpnInstance {
    pub name: String,
    pub vpn_id: u32,
    pub rds: Vec<String>,
    pub import_rts: BTreeSet<String>,
    pub export_rts: BTreeSet<String>,
    pub family: VpnAddressFamily,
    pub l3vni: Option<u32>,
}

impl VpnInstance {
    pub fn new(config: VpnConfig, vpn_id: u32) -> Self {
        Self {
            name: config.name,
            vpn_id,
            rds: config.rds,
            import_rts: config.import_rts,
            export_rts: config.export_rts,
            family: config.family,
            l3vni: config.l3vni,
        }
    }

    /// The first configured route distinguisher, or the VPN name for an
    /// internal VPN.
    pub fn primary_rd(&self) -> String {
        self.rds.first().cloned().unwrap_or_else(|| self.name.clone())
    }

    /// A VPN with configured route distinguishers is BGP backed.
    pub fn is_bgp_vpn(&self) -> bool {
        !self.rds.is_empty()
    }

    pub fn encap(&self) -> EncapType {
        match self.l3vni {
            Some(_) => EncapType::Vxlan,
            None => EncapType::Mpls,
        }
    }

    /// The RD an internal VPN files an extra route under when its next hop
    /// sits on member node `dpn`. Qualified by the VPN so that internal VPNs
    /// sharing a node keep apart.
    pub fn node_rd(&self, dpn: DpnId) -> String {
        format!("{}/{dpn}", self.name)
    }

    /// The configured RDs, or the VPN name for an internal VPN. Node RDs
    /// handed out to extra routes are not included.
    pub fn all_rds(&self) -> Vec<String> {
        if self.rds.is_empty() {
            vec![self.name.clone()]
        } else {
            self.rds.clone()
        }
    }

    pub fn route_targets(&self, kind: RtKind) -> &BTreeSet<String> {
        match kind {
            RtKind::Import => &self.import_rts,
            RtKind::Export => &self.export_rts,
        }
    }
}

#[derive(
    Debug, Copy, Clone, Eq, PartialEq, Hash, Serialize, Deserialize, JsonSchema,
)]
pub enum EncapType {
    Mpls,
    Vxlan,
}

impl Display for EncapType {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::Mpls => write!(f, "mpls"),
            Self::Vxlan => write!(f, "vxlan"),
        }
    }
}

#[derive(
    Debug,
    Copy,
    Clone,
    Eq,
    PartialEq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    JsonSchema,
)]
pub enum RtKind {
    Import,
    Export,
}

impl RtKind {
    pub fn opposite(&self) -> Self {
        match self {
            Self::Import => Self::Export,
            Self::Export => Self::Import,
        }
    }
}

impl Display for RtKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::Import => write!(f, "import"),
            Self::Export => write!(f, "export"),
        }
    }
}

/// A (cidr, vpn) pair hanging off a route target association.
#[derive(
    Debug,
    Clone,
    Eq,
    PartialEq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    JsonSchema,
)]
pub struct AssociatedSubnet {
    pub cidr: Prefix,
    pub vpn: String,
}

/// All associations of one route target, split by import/export.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
pub struct RouteTargetRecord {
    pub rt: String,
    pub associations: BTreeMap<RtKind, BTreeSet<AssociatedSubnet>>,
}

impl RouteTargetRecord {
    pub fn new(rt: &str) -> Self {
        Self {
            rt: rt.to_string(),
            associations: BTreeMap::new(),
        }
    }

    pub fn subnets(&self) -> impl Iterator<Item = &AssociatedSubnet> {
        self.associations.values().flatten()
    }

    pub fn is_empty(&self) -> bool {
        self.associations.is_empty()
    }
}

#[derive(
    Debug,
    Copy,
    Clone,
    Eq,
    PartialEq,
    Hash,
    Serialize,
    Deserialize,
    JsonSchema,
    Default,
)]
pub enum AdvertisementState {
    #[default]
    Idle,
    PendingAdvertise,
    Advertised,
    PendingWithdraw,
    Withdrawn,
}

impl Display for AdvertisementState {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::PendingAdvertise => write!(f, "pending advertise"),
            Self::Advertised => write!(f, "advertised"),
            Self::PendingWithdraw => write!(f, "pending withdraw"),
            Self::Withdrawn => write!(f, "withdrawn"),
        }
    }
}

/// Desired attachment of a subnet to a VPN.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
pub struct SubnetConfig {
    pub subnet_id: Uuid,
    pub vpn_name: String,
    pub cidr: Prefix,
    pub elan_tag: u32,
    /// External (provider gateway) subnets are advertised without a
    /// member node next hop.
    pub external: bool,
}

#[derive(
    Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Hash,
)]
pub struct SubnetMember {
    pub dpn: DpnId,
    pub port: String,
}

/// Operational state of a subnet's aggregate route.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
pub struct SubnetRoute {
    pub subnet_id: Uuid,
    pub vpn_name: String,
    pub rd: String,
    pub cidr: Prefix,
    pub label: Option<u32>,
    pub vni: Option<u32>,
    pub elan_tag: u32,
    pub external: bool,
    pub state: AdvertisementState,
    pub last_state: AdvertisementState,
    pub nexthop_dpn: Option<DpnId>,
    /// Member ports in the order they came up.
    pub members: Vec<SubnetMember>,
    pub last_change: DateTime<Utc>,
}

impl SubnetRoute {
    pub fn new(cfg: &SubnetConfig, rd: String) -> Self {
        Self {
            subnet_id: cfg.subnet_id,
            vpn_name: cfg.vpn_name.clone(),
            rd,
            cidr: cfg.cidr,
            label: None,
            vni: None,
            elan_tag: cfg.elan_tag,
            external: cfg.external,
            state: AdvertisementState::Idle,
            last_state: AdvertisementState::Idle,
            nexthop_dpn: None,
            members: Vec::new(),
            last_change: Utc::now(),
        }
    }

    pub fn transition(&mut self, to: AdvertisementState) {
        if self.state != to {
            self.last_state = self.state;
            self.state = to;
            self.last_change = Utc::now();
        }
    }

    /// Returns false if the member was already present.
    pub fn add_member(&mut self, dpn: DpnId, port: &str) -> bool {
        let m = SubnetMember {
            dpn,
            port: port.to_string(),
        };
        if self.members.contains(&m) {
            return false;
        }
        self.members.push(m);
        true
    }

    /// Returns false if the member was not present.
    pub fn remove_member(&mut self, dpn: DpnId, port: &str) -> bool {
        let before = self.members.len();
        self.members.retain(|m| !(m.dpn == dpn && m.port == port));
        before != self.members.len()
    }

    pub fn hosts(&self, dpn: DpnId) -> bool {
        self.members.iter().any(|m| m.dpn == dpn)
    }

    /// Member nodes in first-seen order.
    pub fn nodes(&self) -> Vec<DpnId> {
        self.members.iter().map(|m| m.dpn).unique().collect()
    }

    pub fn is_advertised(&self) -> bool {
        self.state == AdvertisementState::Advertised
    }

    /// An advertised, non-external subnet route has a next hop that hosts
    /// one of its ports.
    pub fn check_invariants(&self) -> Result<(), String> {
        if self.state != AdvertisementState::Advertised || self.external {
            return Ok(());
        }
        match self.nexthop_dpn {
            None => Err(format!(
                "subnet {} advertised without a next hop",
                self.subnet_id
            )),
            Some(dpn) if !self.hosts(dpn) => Err(format!(
                "subnet {} advertised via dpn {dpn} outside its node set",
                self.subnet_id
            )),
            Some(_) => Ok(()),
        }
    }
}

/// Operational status of a member node.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
pub struct MemberNode {
    pub dpn: DpnId,
    pub connected: bool,
    pub tep: Option<IpAddr>,
}

impl MemberNode {
    pub fn new(dpn: DpnId) -> Self {
        Self {
            dpn,
            connected: false,
            tep: None,
        }
    }

    /// Connected to the control plane with a reachable tunnel endpoint.
    pub fn is_eligible(&self) -> bool {
        self.connected && self.tep.is_some()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
pub struct ExtraRouteAllocation {
    pub vpn_id: u32,
    pub prefix: Prefix,
    pub nexthop: IpAddr,
    pub rd: String,
}

#[derive(
    Debug, Copy, Clone, Eq, PartialEq, Hash, Serialize, Deserialize, JsonSchema,
)]
pub enum AdjacencyKind {
    Primary,
    ExtraRoute,
    LearntIp,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
pub struct Adjacency {
    pub ip: Prefix,
    pub mac: Option<String>,
    pub kind: AdjacencyKind,
    /// Next hops of an extra route. A learnt ip with no next hops is reached
    /// through the interface's primary address.
    pub nexthops: Vec<IpAddr>,
    pub subnet_id: Option<Uuid>,
    /// The primary address is the subnet gateway.
    pub gateway: bool,
}

impl Adjacency {
    pub fn primary(ip: IpAddr, mac: &str, subnet_id: Option<Uuid>) -> Self {
        Self {
            ip: Prefix::host(ip),
            mac: Some(mac.to_string()),
            kind: AdjacencyKind::Primary,
            nexthops: Vec::new(),
            subnet_id,
            gateway: false,
        }
    }

    pub fn extra_route(prefix: Prefix, nexthops: Vec<IpAddr>) -> Self {
        Self {
            ip: prefix,
            mac: None,
            kind: AdjacencyKind::ExtraRoute,
            nexthops,
            subnet_id: None,
            gateway: false,
        }
    }

    pub fn learnt(ip: IpAddr, mac: &str) -> Self {
        Self {
            ip: Prefix::host(ip),
            mac: Some(mac.to_string()),
            kind: AdjacencyKind::LearntIp,
            nexthops: Vec::new(),
            subnet_id: None,
            gateway: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
pub struct VpnInterface {
    pub name: String,
    pub vpn_name: String,
    pub dpn: DpnId,
    pub adjacencies: Vec<Adjacency>,
}

impl VpnInterface {
    pub fn primary_ip(&self) -> Option<IpAddr> {
        self.adjacencies
            .iter()
            .find(|a| a.kind == AdjacencyKind::Primary)
            .map(|a| a.ip.addr())
    }
}

/// Index from an address inside a VPN to the interface hosting it.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
pub struct PrefixToInterface {
    pub vpn_id: u32,
    pub ip: Prefix,
    pub dpn: DpnId,
    pub interface: String,
    pub subnet_id: Option<Uuid>,
}

#[derive(
    Debug, Copy, Clone, Eq, PartialEq, Hash, Serialize, Deserialize, JsonSchema,
)]
pub enum RouteOrigin {
    /// Subnet aggregate route.
    Connected,
    Static,
    /// An interface's own address.
    Local,
    /// A learnt address.
    Dynamic,
    InterVpnLink,
    SelfImported,
    Bgp,
}

impl RouteOrigin {
    /// Routes this controller owns that are not carried over an inter-VPN
    /// link. Only these are propagated to importing VPNs.
    pub fn is_controller_managed_non_link(&self) -> bool {
        matches!(
            self,
            Self::Connected | Self::Static | Self::Local | Self::Dynamic
        )
    }
}

impl Display for RouteOrigin {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Connected => "connected",
            Self::Static => "static",
            Self::Local => "local",
            Self::Dynamic => "dynamic",
            Self::InterVpnLink => "intervpn",
            Self::SelfImported => "selfimport",
            Self::Bgp => "bgp",
        };
        write!(f, "{s}")
    }
}

#[derive(
    Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq,
)]
pub struct SubnetRouteInfo {
    pub subnet_id: Uuid,
    pub elan_tag: u32,
}

/// A forwarding table entry keyed by route distinguisher and prefix.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
pub struct VrfEntry {
    pub rd: String,
    pub prefix: Prefix,
    pub nexthops: Vec<IpAddr>,
    pub label: Option<u32>,
    pub vni: Option<u32>,
    pub origin: RouteOrigin,
    pub gateway_mac: Option<String>,
    /// For imported routes, the RD the route was copied from.
    pub parent_rd: Option<String>,
    pub subnet: Option<SubnetRouteInfo>,
    /// For imported routes, the next hops each source RD contributed.
    #[serde(default)]
    pub sources: BTreeMap<String, Vec<IpAddr>>,
}

impl VrfEntry {
    pub fn key(&self) -> VrfKey {
        VrfKey {
            rd: self.rd.clone(),
            prefix: self.prefix,
        }
    }

    /// Rebuild the next hops of an imported copy from what its sources
    /// contribute. The parent moves to another source once its own is gone.
    pub fn sync_sources(&mut self) {
        let mut nexthops: Vec<IpAddr> = Vec::new();
        for nh in self.sources.values().flatten() {
            if !nexthops.contains(nh) {
                nexthops.push(*nh);
            }
        }
        self.nexthops = nexthops;
        let parent_live = self
            .parent_rd
            .as_ref()
            .is_some_and(|rd| self.sources.contains_key(rd));
        if !parent_live {
            self.parent_rd = self.sources.keys().next().cloned();
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VrfKey {
    pub rd: String,
    pub prefix: Prefix,
}

impl Display for VrfKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}|{}", self.rd, self.prefix)
    }
}

impl VrfKey {
    pub fn new(rd: &str, prefix: Prefix) -> Self {
        Self {
            rd: rd.to_string(),
            prefix,
        }
    }

    pub fn db_key(&self) -> String {
        self.to_string()
    }

    pub fn rd_scan(rd: &str) -> String {
        format!("{rd}|")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FibChange {
    Added(VrfEntry),
    /// Next hop list or attributes changed in place.
    Updated(VrfEntry),
    Removed(VrfEntry),
}

impl FibChange {
    pub fn entry(&self) -> &VrfEntry {
        match self {
            Self::Added(e) | Self::Updated(e) | Self::Removed(e) => e,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FibChangeNotification {
    pub generation: u64,
    pub changes: Vec<FibChange>,
}

impl Display for FibChangeNotification {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let keys = self
            .changes
            .iter()
            .map(|c| c.entry().key().to_string())
            .join(" ");
        write!(f, "FibChangeNotification({}) [ {keys} ]", self.generation)
    }
}
