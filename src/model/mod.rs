//! Shared network model: assets, flows and partial-model merging
//!
//! Workers never touch the shared model directly; they emit a [`LocalModel`]
//! covering the at most two assets and one flow a single packet touched, and
//! the aggregator merges it in under one coarse lock. Merge semantics are
//! additive: counters only grow, sets only union, and already-populated
//! string fields are kept (first non-empty wins).

use chrono::{DateTime, Utc};
use pnet::util::MacAddr;
use serde::de::Error as DeError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use crate::fingerprint::DeviceInfo;

/// Cap on accumulated fingerprint evidence per asset
pub const EVIDENCE_CAP: usize = 200;

/// Purdue reference model level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PurdueLevel {
    L0,
    L1,
    L2,
    L3,
    L4,
    L5,
    Unknown,
}

impl fmt::Display for PurdueLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PurdueLevel::L0 => write!(f, "L0"),
            PurdueLevel::L1 => write!(f, "L1"),
            PurdueLevel::L2 => write!(f, "L2"),
            PurdueLevel::L3 => write!(f, "L3"),
            PurdueLevel::L4 => write!(f, "L4"),
            PurdueLevel::L5 => write!(f, "L5"),
            PurdueLevel::Unknown => write!(f, "Unknown"),
        }
    }
}

/// Stable asset identifier: network-layer address when one exists,
/// link-layer address otherwise (ARP and other non-IP frames).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum AssetId {
    Ip(IpAddr),
    Mac(MacAddr),
}

impl fmt::Display for AssetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AssetId::Ip(ip) => write!(f, "{}", ip),
            AssetId::Mac(mac) => write!(f, "{}", mac),
        }
    }
}

impl FromStr for AssetId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Ok(ip) = s.parse::<IpAddr>() {
            return Ok(AssetId::Ip(ip));
        }
        if let Ok(mac) = s.parse::<MacAddr>() {
            return Ok(AssetId::Mac(mac));
        }
        Err(format!("not an IP or MAC address: {}", s))
    }
}

impl Serialize for AssetId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for AssetId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(D::Error::custom)
    }
}

/// Lightweight per-packet fingerprint evidence, extracted by workers and
/// accumulated per asset by the aggregator. Fused once at drain time.
#[derive(Debug, Clone, PartialEq)]
pub struct EvidenceSample {
    pub timestamp: DateTime<Utc>,
    pub ttl: Option<u8>,
    pub tcp_window: Option<u16>,
    pub tcp_option_kinds: Vec<u8>,
    pub syn_only: bool,
    pub dhcp_payload: Option<Vec<u8>>,
}

/// One observed network endpoint and everything learned about it
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Asset {
    pub id: AssetId,

    pub ip: Option<IpAddr>,
    pub mac: Option<String>,
    pub hostname: String,
    pub device_name: String,
    pub vendor: String,

    /// All protocols this asset was seen speaking
    pub protocols: BTreeSet<String>,

    /// Per-protocol packet counts this asset initiated
    pub initiated_counts: BTreeMap<String, u64>,

    /// Per-protocol packet counts this asset received
    pub received_counts: BTreeMap<String, u64>,

    /// Per-protocol peers this asset initiated traffic towards
    #[serde(skip)]
    pub initiated_peers: BTreeMap<String, BTreeSet<AssetId>>,

    /// Per-protocol peers this asset received traffic from
    #[serde(skip)]
    pub received_peers: BTreeMap<String, BTreeSet<AssetId>>,

    /// Transport ports this asset was seen using on its own side
    pub ports_seen: BTreeSet<u16>,

    /// Set when the asset sends to multicast or broadcast destinations
    pub multicast_peer: bool,

    pub inferred_level: PurdueLevel,
    pub roles: Vec<String>,

    /// Manual override: always wins over the heuristic classifier
    pub override_level: Option<PurdueLevel>,
    pub override_role: Option<String>,

    pub device_info: Option<DeviceInfo>,

    #[serde(skip)]
    pub evidence: Vec<EvidenceSample>,
}

impl Asset {
    pub fn new(id: AssetId) -> Self {
        let ip = match id {
            AssetId::Ip(ip) => Some(ip),
            AssetId::Mac(_) => None,
        };
        let mac = match id {
            AssetId::Mac(mac) => Some(mac.to_string()),
            AssetId::Ip(_) => None,
        };
        Self {
            id,
            ip,
            mac,
            hostname: String::new(),
            device_name: String::new(),
            vendor: String::new(),
            protocols: BTreeSet::new(),
            initiated_counts: BTreeMap::new(),
            received_counts: BTreeMap::new(),
            initiated_peers: BTreeMap::new(),
            received_peers: BTreeMap::new(),
            ports_seen: BTreeSet::new(),
            multicast_peer: false,
            inferred_level: PurdueLevel::Unknown,
            roles: Vec::new(),
            override_level: None,
            override_role: None,
            device_info: None,
            evidence: Vec::new(),
        }
    }

    /// Record one packet this asset initiated towards a peer
    pub fn record_initiated(&mut self, protocol: &str, peer: AssetId) {
        self.protocols.insert(protocol.to_string());
        *self.initiated_counts.entry(protocol.to_string()).or_insert(0) += 1;
        self.initiated_peers
            .entry(protocol.to_string())
            .or_default()
            .insert(peer);
    }

    /// Record one packet this asset received from a peer
    pub fn record_received(&mut self, protocol: &str, peer: AssetId) {
        self.protocols.insert(protocol.to_string());
        *self.received_counts.entry(protocol.to_string()).or_insert(0) += 1;
        self.received_peers
            .entry(protocol.to_string())
            .or_default()
            .insert(peer);
    }

    /// Record a transport port seen on this asset's side of a conversation
    pub fn observe_port(&mut self, port: u16) {
        self.ports_seen.insert(port);
    }

    /// Add a role tag if not already present (roles are additive, deduplicated)
    pub fn push_role(&mut self, role: &str) {
        if !self.roles.iter().any(|r| r == role) {
            self.roles.push(role.to_string());
        }
    }

    /// Attach a fingerprint evidence sample, bounded by [`EVIDENCE_CAP`]
    pub fn push_evidence(&mut self, sample: EvidenceSample) {
        if self.evidence.len() < EVIDENCE_CAP {
            self.evidence.push(sample);
        }
    }

    /// Merge another record for the same endpoint into this one.
    ///
    /// Counters sum, sets union, and string fields keep the first non-empty
    /// value so the most informative packet is never overwritten.
    pub fn merge_from(&mut self, other: Asset) {
        if self.ip.is_none() {
            self.ip = other.ip;
        }
        if self.mac.is_none() {
            self.mac = other.mac;
        }
        merge_string(&mut self.hostname, other.hostname);
        merge_string(&mut self.device_name, other.device_name);
        merge_string(&mut self.vendor, other.vendor);

        self.protocols.extend(other.protocols);
        for (proto, count) in other.initiated_counts {
            *self.initiated_counts.entry(proto).or_insert(0) += count;
        }
        for (proto, count) in other.received_counts {
            *self.received_counts.entry(proto).or_insert(0) += count;
        }
        for (proto, peers) in other.initiated_peers {
            self.initiated_peers.entry(proto).or_default().extend(peers);
        }
        for (proto, peers) in other.received_peers {
            self.received_peers.entry(proto).or_default().extend(peers);
        }
        self.ports_seen.extend(other.ports_seen);
        self.multicast_peer |= other.multicast_peer;

        for role in other.roles {
            self.push_role(&role);
        }
        if self.override_level.is_none() {
            self.override_level = other.override_level;
        }
        if self.override_role.is_none() {
            self.override_role = other.override_role;
        }
        if self.device_info.is_none() {
            self.device_info = other.device_info;
        }
        if self.inferred_level == PurdueLevel::Unknown {
            self.inferred_level = other.inferred_level;
        }
        for sample in other.evidence {
            self.push_evidence(sample);
        }
    }

    /// Total packets this asset initiated, across all protocols
    pub fn total_initiated(&self) -> u64 {
        self.initiated_counts.values().sum()
    }

    /// Total packets this asset received, across all protocols
    pub fn total_received(&self) -> u64 {
        self.received_counts.values().sum()
    }
}

fn merge_string(current: &mut String, incoming: String) {
    if current.is_empty() && !incoming.is_empty() {
        *current = incoming;
    }
}

/// Directional flow key: (source, destination, protocol)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FlowKey {
    pub source: AssetId,
    pub destination: AssetId,
    pub protocol: String,
}

/// A directional, protocol-specific traffic aggregate between two assets
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Flow {
    pub source: AssetId,
    pub destination: AssetId,
    pub protocol: String,
    pub packets: u64,
    pub bytes: u64,
    #[serde(with = "chrono::serde::ts_microseconds")]
    pub first_seen: DateTime<Utc>,
    #[serde(with = "chrono::serde::ts_microseconds")]
    pub last_seen: DateTime<Utc>,
    /// Set by a later policy-matching pass, never by the pipeline
    pub allowed: Option<bool>,
}

impl Flow {
    pub fn new(
        source: AssetId,
        destination: AssetId,
        protocol: String,
        bytes: u64,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            source,
            destination,
            protocol,
            packets: 1,
            bytes,
            first_seen: timestamp,
            last_seen: timestamp,
            allowed: None,
        }
    }

    pub fn key(&self) -> FlowKey {
        FlowKey {
            source: self.source,
            destination: self.destination,
            protocol: self.protocol.clone(),
        }
    }

    /// Accumulate another flow record for the same key
    pub fn merge_from(&mut self, other: &Flow) {
        self.packets += other.packets;
        self.bytes += other.bytes;
        if other.first_seen < self.first_seen {
            self.first_seen = other.first_seen;
        }
        if other.last_seen > self.last_seen {
            self.last_seen = other.last_seen;
        }
        if self.allowed.is_none() {
            self.allowed = other.allowed;
        }
    }
}

/// Partial model built by one worker from one packet: at most two assets
/// and one flow. Never shared, handed whole to the aggregator.
#[derive(Debug, Clone, Default)]
pub struct LocalModel {
    pub assets: Vec<Asset>,
    pub flow: Option<Flow>,
}

/// The merged graph of assets and flows
#[derive(Debug, Clone, Default, Serialize)]
pub struct NetworkModel {
    pub assets: HashMap<AssetId, Asset>,
    #[serde(serialize_with = "flows_as_list")]
    pub flows: HashMap<FlowKey, Flow>,
}

fn flows_as_list<S: Serializer>(
    flows: &HashMap<FlowKey, Flow>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    let mut list: Vec<&Flow> = flows.values().collect();
    list.sort_by(|a, b| a.key().cmp(&b.key()));
    list.serialize(serializer)
}

impl NetworkModel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge one worker-local partial model.
    ///
    /// Assets are inserted before the flow so a flow never references an
    /// endpoint missing from the model.
    pub fn merge_local(&mut self, local: LocalModel) {
        for asset in local.assets {
            match self.assets.get_mut(&asset.id) {
                Some(existing) => existing.merge_from(asset),
                None => {
                    self.assets.insert(asset.id, asset);
                }
            }
        }
        if let Some(flow) = local.flow {
            self.assets
                .entry(flow.source)
                .or_insert_with(|| Asset::new(flow.source));
            self.assets
                .entry(flow.destination)
                .or_insert_with(|| Asset::new(flow.destination));
            match self.flows.get_mut(&flow.key()) {
                Some(existing) => existing.merge_from(&flow),
                None => {
                    self.flows.insert(flow.key(), flow);
                }
            }
        }
    }

    /// Collapse assets that share a MAC address into one record.
    ///
    /// An IP-keyed asset wins the identity; MAC-keyed placeholders (created
    /// from ARP traffic) and duplicate IPs fold into it, and flows are
    /// re-pointed at the surviving identifier.
    pub fn merge_by_mac(&mut self) {
        let mut by_mac: HashMap<String, Vec<AssetId>> = HashMap::new();
        for (id, asset) in &self.assets {
            if let Some(mac) = &asset.mac {
                by_mac.entry(mac.clone()).or_default().push(*id);
            }
        }

        let mut remap: HashMap<AssetId, AssetId> = HashMap::new();
        for (_, mut ids) in by_mac {
            if ids.len() < 2 {
                continue;
            }
            ids.sort();
            // Prefer a routable IP identity; 0.0.0.0 shows up as the source
            // of DHCP discovers and must not win the merge.
            let winner = *ids
                .iter()
                .find(|id| matches!(id, AssetId::Ip(ip) if !ip.is_unspecified()))
                .or_else(|| ids.iter().find(|id| matches!(id, AssetId::Ip(_))))
                .unwrap_or(&ids[0]);
            for id in ids {
                if id != winner {
                    remap.insert(id, winner);
                }
            }
        }
        if remap.is_empty() {
            return;
        }

        for (loser, winner) in &remap {
            if let Some(asset) = self.assets.remove(loser) {
                if let Some(target) = self.assets.get_mut(winner) {
                    target.merge_from(asset);
                }
            }
        }

        let old_flows = std::mem::take(&mut self.flows);
        for (_, mut flow) in old_flows {
            if let Some(&winner) = remap.get(&flow.source) {
                flow.source = winner;
            }
            if let Some(&winner) = remap.get(&flow.destination) {
                flow.destination = winner;
            }
            match self.flows.get_mut(&flow.key()) {
                Some(existing) => existing.merge_from(&flow),
                None => {
                    self.flows.insert(flow.key(), flow);
                }
            }
        }
    }

    pub fn asset_count(&self) -> usize {
        self.assets.len()
    }

    pub fn flow_count(&self) -> usize {
        self.flows.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use proptest::prelude::*;

    fn ip_id(s: &str) -> AssetId {
        AssetId::Ip(s.parse().unwrap())
    }

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    #[test]
    fn test_asset_id_roundtrip() {
        let ip = ip_id("10.0.0.1");
        assert_eq!("10.0.0.1".parse::<AssetId>().unwrap(), ip);

        let mac = AssetId::Mac("00:1d:9c:aa:bb:cc".parse().unwrap());
        assert_eq!(mac.to_string().parse::<AssetId>().unwrap(), mac);
    }

    #[test]
    fn test_string_merge_keeps_first_non_empty() {
        let mut a = Asset::new(ip_id("10.0.0.1"));
        a.vendor = "Rockwell Automation".to_string();
        let mut b = Asset::new(ip_id("10.0.0.1"));
        b.vendor = "Unknown Vendor".to_string();
        b.hostname = "plc-7".to_string();

        a.merge_from(b);
        assert_eq!(a.vendor, "Rockwell Automation");
        assert_eq!(a.hostname, "plc-7");
    }

    #[test]
    fn test_flow_merge_widens_interval() {
        let src = ip_id("10.0.0.1");
        let dst = ip_id("10.0.0.2");
        let mut f1 = Flow::new(src, dst, "Modbus".into(), 100, ts(50));
        let f2 = Flow::new(src, dst, "Modbus".into(), 60, ts(10));
        let f3 = Flow::new(src, dst, "Modbus".into(), 40, ts(90));

        f1.merge_from(&f2);
        f1.merge_from(&f3);
        assert_eq!(f1.packets, 3);
        assert_eq!(f1.bytes, 200);
        assert_eq!(f1.first_seen, ts(10));
        assert_eq!(f1.last_seen, ts(90));
    }

    #[test]
    fn test_flow_endpoints_always_exist() {
        let mut model = NetworkModel::new();
        let src = ip_id("10.0.0.1");
        let dst = ip_id("10.0.0.2");
        let local = LocalModel {
            assets: vec![],
            flow: Some(Flow::new(src, dst, "TCP".into(), 64, ts(1))),
        };
        model.merge_local(local);
        assert!(model.assets.contains_key(&src));
        assert!(model.assets.contains_key(&dst));
    }

    #[test]
    fn test_merge_by_mac_collapses_arp_placeholder() {
        let mut model = NetworkModel::new();
        let mac: MacAddr = "00:1d:9c:01:02:03".parse().unwrap();

        let mut by_ip = Asset::new(ip_id("10.0.0.5"));
        by_ip.mac = Some(mac.to_string());
        by_ip.record_received("Modbus", ip_id("10.0.0.9"));

        let mut by_mac = Asset::new(AssetId::Mac(mac));
        by_mac.record_initiated("ARP", ip_id("10.0.0.9"));

        model.merge_local(LocalModel { assets: vec![by_ip], flow: None });
        model.merge_local(LocalModel {
            assets: vec![by_mac],
            flow: Some(Flow::new(AssetId::Mac(mac), ip_id("10.0.0.9"), "ARP".into(), 60, ts(1))),
        });

        model.merge_by_mac();
        assert_eq!(model.assets.len(), 2); // survivor + the 10.0.0.9 peer
        let survivor = model.assets.get(&ip_id("10.0.0.5")).unwrap();
        assert!(survivor.protocols.contains("ARP"));
        assert!(survivor.protocols.contains("Modbus"));
        assert!(model
            .flows
            .keys()
            .all(|k| k.source != AssetId::Mac(mac) && k.destination != AssetId::Mac(mac)));
    }

    fn arb_asset(id_str: &'static str) -> impl Strategy<Value = Asset> {
        let protos = prop::collection::vec(
            prop::sample::select(vec!["Modbus", "S7", "HTTP", "DNS", "EtherNet/IP"]),
            0..5,
        );
        let roles = prop::collection::vec(
            prop::sample::select(vec!["PLC", "HMI/Engineering Station", "Field Device"]),
            0..3,
        );
        (protos, roles).prop_map(move |(protos, roles)| {
            let mut asset = Asset::new(AssetId::Ip(id_str.parse().unwrap()));
            for p in protos {
                asset.record_initiated(p, AssetId::Ip("172.16.0.1".parse().unwrap()));
            }
            for r in roles {
                asset.push_role(r);
            }
            asset
        })
    }

    proptest! {
        /// Set-valued fields merge commutatively: A then B equals B then A.
        #[test]
        fn prop_merge_commutative_for_sets(a in arb_asset("10.0.0.1"), b in arb_asset("10.0.0.1")) {
            let mut ab = a.clone();
            ab.merge_from(b.clone());
            let mut ba = b.clone();
            ba.merge_from(a.clone());

            prop_assert_eq!(&ab.protocols, &ba.protocols);
            let mut ab_roles = ab.roles.clone();
            let mut ba_roles = ba.roles.clone();
            ab_roles.sort();
            ba_roles.sort();
            prop_assert_eq!(ab_roles, ba_roles);
        }

        /// Merging the same record twice is idempotent for set-valued fields.
        #[test]
        fn prop_merge_idempotent_for_sets(a in arb_asset("10.0.0.1"), b in arb_asset("10.0.0.1")) {
            let mut once = a.clone();
            once.merge_from(b.clone());
            let mut twice = a.clone();
            twice.merge_from(b.clone());
            twice.merge_from(b.clone());

            prop_assert_eq!(&once.protocols, &twice.protocols);
            prop_assert_eq!(&once.roles, &twice.roles);
            prop_assert_eq!(&once.ports_seen, &twice.ports_seen);
        }
    }

    #[test]
    fn test_json_export_field_names() {
        let mut asset = Asset::new(ip_id("10.0.0.1"));
        asset.hostname = "plc-7".into();
        asset.vendor = "Siemens".into();
        asset.inferred_level = PurdueLevel::L1;
        asset.push_role("Siemens S7 PLC");

        let json = serde_json::to_value(&asset).unwrap();
        assert_eq!(json["ip"], "10.0.0.1");
        assert_eq!(json["hostname"], "plc-7");
        assert_eq!(json["vendor"], "Siemens");
        assert_eq!(json["inferred_level"], "L1");
        assert_eq!(json["roles"][0], "Siemens S7 PLC");

        let flow = Flow::new(ip_id("10.0.0.1"), ip_id("10.0.0.2"), "Modbus".into(), 12, ts(3));
        let json = serde_json::to_value(&flow).unwrap();
        assert_eq!(json["protocol"], "Modbus");
        assert_eq!(json["packets"], 1);
        assert_eq!(json["bytes"], 12);
        assert!(json["first_seen"].is_i64());
        assert!(json["last_seen"].is_i64());
    }
}
