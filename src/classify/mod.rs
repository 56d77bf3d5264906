//! Purdue-level classification
//!
//! A pure function over a fully aggregated asset record. The rule list is an
//! explicit ordered decision list with first-match-wins semantics; several
//! rules intentionally overlap and rely on the fixed order, so do not
//! reorder them without re-validating the documented examples. A manual
//! override always preempts every rule.

use serde::{Deserialize, Serialize};

use crate::detection::protocol_names as proto;
use crate::model::{Asset, PurdueLevel};

/// The fixed ICS reference port list (13 ports)
pub const ICS_PORTS: [u16; 13] = [
    102, 502, 1089, 1091, 2222, 2404, 4840, 5006, 5007, 9600, 20000, 44818, 47808,
];

/// The fixed IT reference port list (16 ports)
pub const IT_PORTS: [u16; 16] = [
    22, 23, 25, 53, 80, 110, 135, 139, 143, 389, 443, 445, 993, 1433, 3306, 3389,
];

/// Industrial ports checked by the final fallback rule
const FALLBACK_INDUSTRIAL_PORTS: [u16; 7] = [2222, 44818, 502, 102, 9600, 4840, 20000];

/// Protocol families counted as distinct ICS families
const ICS_FAMILIES: [&str; 9] = [
    proto::MODBUS,
    proto::S7,
    proto::ENIP,
    proto::CIP_IO,
    proto::OPC_UA,
    proto::DNP3,
    proto::BACNET,
    proto::FINS,
    proto::SLMP,
];

/// The SCADA request/response families summed by the SCADA-master rule
const SCADA_FAMILIES: [&str; 4] = [proto::MODBUS, proto::S7, proto::FINS, proto::SLMP];

/// Classification outcome: one level and the role tags it justifies
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Classification {
    pub level: PurdueLevel,
    pub roles: Vec<String>,
}

impl Classification {
    fn new(level: PurdueLevel, role: &str) -> Self {
        Self { level, roles: vec![role.to_string()] }
    }
}

/// Precomputed view of one host, so rule predicates stay cheap and legible
struct HostView<'a> {
    asset: &'a Asset,
    ics_score: usize,
    it_score: usize,
    vendor: String,
}

impl<'a> HostView<'a> {
    fn new(asset: &'a Asset) -> Self {
        Self {
            asset,
            ics_score: ics_score(asset),
            it_score: it_score(asset),
            vendor: asset.vendor.to_lowercase(),
        }
    }

    fn has(&self, protocol: &str) -> bool {
        self.asset.protocols.contains(protocol)
    }

    fn initiated(&self, protocol: &str) -> u64 {
        self.asset.initiated_counts.get(protocol).copied().unwrap_or(0)
    }

    fn received(&self, protocol: &str) -> u64 {
        self.asset.received_counts.get(protocol).copied().unwrap_or(0)
    }

    fn initiated_peer_count(&self, protocol: &str) -> usize {
        self.asset
            .initiated_peers
            .get(protocol)
            .map(|s| s.len())
            .unwrap_or(0)
    }

    fn received_peer_count(&self, protocol: &str) -> usize {
        self.asset
            .received_peers
            .get(protocol)
            .map(|s| s.len())
            .unwrap_or(0)
    }

    fn has_io_traffic(&self) -> bool {
        self.initiated(proto::CIP_IO) + self.received(proto::CIP_IO) > 0
    }

    fn ics_family_count(&self) -> usize {
        ICS_FAMILIES.iter().filter(|&&f| self.has(f)).count()
    }

    fn vendor_contains(&self, keyword: &str) -> bool {
        self.vendor.contains(keyword)
    }
}

/// ICS score: count of reference ICS ports this host was seen using
pub fn ics_score(asset: &Asset) -> usize {
    ICS_PORTS
        .iter()
        .filter(|p| asset.ports_seen.contains(*p))
        .count()
}

/// IT score: count of reference IT ports this host was seen using
pub fn it_score(asset: &Asset) -> usize {
    IT_PORTS
        .iter()
        .filter(|p| asset.ports_seen.contains(*p))
        .count()
}

type Rule = (&'static str, fn(&HostView) -> Option<Classification>);

/// The ordered decision list. First match wins.
const RULES: &[Rule] = &[
    ("explicit-peer-plc", rule_explicit_peer_plc),
    ("io-adapter", rule_io_adapter),
    ("modbus-server", rule_modbus_server),
    ("s7-server", rule_s7_server),
    ("fins-slmp-server", rule_fins_slmp_server),
    ("hmi-engineering-station", rule_hmi_engineering_station),
    ("opcua-client", rule_opcua_client),
    ("scada-master", rule_scada_master),
    ("dnp3-bacnet-opcua", rule_dnp3_bacnet_opcua),
    ("it-host", rule_it_host),
    ("multi-protocol", rule_multi_protocol),
    ("single-ics", rule_single_ics),
    ("fallback", rule_fallback),
];

/// Assign a Purdue level and role set to one fully aggregated host.
///
/// Pure and deterministic: repeat calls on the same record yield the same
/// classification.
pub fn classify(asset: &Asset) -> Classification {
    if let Some(level) = asset.override_level {
        let roles = match &asset.override_role {
            Some(role) => vec![role.clone()],
            None => Vec::new(),
        };
        return Classification { level, roles };
    }

    let view = HostView::new(asset);
    for (name, rule) in RULES {
        if let Some(classification) = rule(&view) {
            log::trace!("{} classified by rule {}", asset.id, name);
            return classification;
        }
    }
    // rule_fallback is total; unreachable by construction
    Classification::new(PurdueLevel::Unknown, "Unknown Device")
}

/// Rule 1: receives explicit messaging, exchanges I/O, negligible IT traffic
fn rule_explicit_peer_plc(v: &HostView) -> Option<Classification> {
    if v.received_peer_count(proto::ENIP) >= 1 && v.has_io_traffic() && v.it_score <= 1 {
        let role = if v.vendor_contains("siemens") || v.has(proto::S7) {
            "Siemens PLC"
        } else if v.vendor_contains("rockwell") || v.vendor_contains("allen-bradley") {
            "Rockwell PLC"
        } else if v.vendor_contains("omron") && v.has(proto::FINS) {
            "Omron PLC"
        } else if v.vendor_contains("mitsubishi") || v.has(proto::SLMP) {
            "Mitsubishi PLC"
        } else {
            "PLC"
        };
        return Some(Classification::new(PurdueLevel::L1, role));
    }
    None
}

/// Rule 2: pure I/O endpoint on the implicit-messaging side
fn rule_io_adapter(v: &HostView) -> Option<Classification> {
    if v.has_io_traffic()
        && v.asset.multicast_peer
        && v.initiated_peer_count(proto::ENIP) == 0
        && v.received_peer_count(proto::ENIP) <= 1
        && v.it_score == 0
    {
        return Some(Classification::new(PurdueLevel::L1, "I/O Adapter/Drive"));
    }
    None
}

/// Rule 3: Modbus server side
fn rule_modbus_server(v: &HostView) -> Option<Classification> {
    if v.has(proto::MODBUS)
        && v.received(proto::MODBUS) > v.initiated(proto::MODBUS)
        && v.it_score <= 1
    {
        let role = if v.vendor_contains("schneider") {
            "Schneider PLC"
        } else {
            "Modbus PLC"
        };
        return Some(Classification::new(PurdueLevel::L1, role));
    }
    None
}

/// Rule 4: S7 server side
fn rule_s7_server(v: &HostView) -> Option<Classification> {
    if v.has(proto::S7) && v.received(proto::S7) > v.initiated(proto::S7) && v.it_score <= 1 {
        return Some(Classification::new(PurdueLevel::L1, "Siemens S7 PLC"));
    }
    None
}

/// Rule 5: FINS / SLMP server side
fn rule_fins_slmp_server(v: &HostView) -> Option<Classification> {
    if v.has(proto::FINS) && v.received(proto::FINS) > v.initiated(proto::FINS) {
        return Some(Classification::new(PurdueLevel::L1, "Omron PLC"));
    }
    if v.has(proto::SLMP) && v.received(proto::SLMP) > v.initiated(proto::SLMP) {
        return Some(Classification::new(PurdueLevel::L1, "Mitsubishi PLC"));
    }
    None
}

/// Rule 6: talks explicit messaging to many controllers, with IT traffic
fn rule_hmi_engineering_station(v: &HostView) -> Option<Classification> {
    if v.initiated_peer_count(proto::ENIP) >= 3 && v.it_score >= 1 {
        return Some(Classification::new(PurdueLevel::L2, "HMI/Engineering Station"));
    }
    None
}

/// Rule 7: OPC-UA client side with IT traffic
fn rule_opcua_client(v: &HostView) -> Option<Classification> {
    if v.has(proto::OPC_UA)
        && v.initiated(proto::OPC_UA) > v.received(proto::OPC_UA)
        && v.it_score >= 1
    {
        return Some(Classification::new(PurdueLevel::L2, "OPC-UA Client/HMI"));
    }
    None
}

/// Rule 8: net requester across the SCADA families, with IT traffic
fn rule_scada_master(v: &HostView) -> Option<Classification> {
    let initiated: u64 = SCADA_FAMILIES.iter().map(|&f| v.initiated(f)).sum();
    let received: u64 = SCADA_FAMILIES.iter().map(|&f| v.received(f)).sum();
    let any_present = SCADA_FAMILIES.iter().any(|&f| v.has(f));
    if any_present && initiated > received && v.it_score >= 1 {
        return Some(Classification::new(PurdueLevel::L2, "SCADA Master"));
    }
    None
}

/// Rule 9: DNP3 master, BACnet device, or OPC-UA server
fn rule_dnp3_bacnet_opcua(v: &HostView) -> Option<Classification> {
    if v.has(proto::DNP3) && v.it_score >= 1 {
        return Some(Classification::new(PurdueLevel::L2, "DNP3 Master/RTU"));
    }
    if v.has(proto::BACNET) {
        return Some(Classification::new(PurdueLevel::L2, "BACnet Device"));
    }
    if v.has(proto::OPC_UA) && v.received(proto::OPC_UA) > v.initiated(proto::OPC_UA) {
        return Some(Classification::new(PurdueLevel::L1, "OPC-UA Server"));
    }
    None
}

/// Rule 10: plainly an IT host
fn rule_it_host(v: &HostView) -> Option<Classification> {
    if v.it_score >= 3 && v.ics_score <= 1 {
        return Some(Classification::new(PurdueLevel::L3, "IT Server/Workstation"));
    }
    if v.it_score >= 2 && v.ics_score == 0 {
        return Some(Classification::new(PurdueLevel::L3, "IT Infrastructure"));
    }
    None
}

/// Rule 11: several ICS families on one host
fn rule_multi_protocol(v: &HostView) -> Option<Classification> {
    if v.ics_family_count() >= 2 && v.it_score <= 1 {
        if v.asset.multicast_peer || v.has_io_traffic() {
            return Some(Classification::new(PurdueLevel::L1, "Multi-Protocol Controller"));
        }
        return Some(Classification::new(PurdueLevel::L2, "Protocol Gateway"));
    }
    None
}

/// Rule 12: a single ICS presence
fn rule_single_ics(v: &HostView) -> Option<Classification> {
    if v.ics_score >= 1 && v.it_score <= 1 {
        if v.asset.multicast_peer && v.has_io_traffic() {
            return Some(Classification::new(PurdueLevel::L1, "Field Device"));
        }
        let client_side = v.initiated(proto::ENIP) > v.received(proto::ENIP)
            || v.initiated(proto::MODBUS) > v.received(proto::MODBUS);
        if client_side {
            return Some(Classification::new(PurdueLevel::L2, "Control Device"));
        }
        return Some(Classification::new(PurdueLevel::L1, "Field Device"));
    }
    None
}

/// Rule 13: the total fallback chain
fn rule_fallback(v: &HostView) -> Option<Classification> {
    if v.asset.multicast_peer && v.ics_score >= 1 {
        return Some(Classification::new(PurdueLevel::L1, "Field Device"));
    }
    if v.it_score >= 2 {
        return Some(Classification::new(PurdueLevel::L3, "IT Device"));
    }
    if v.ics_score >= 1 {
        return Some(Classification::new(PurdueLevel::L2, "Industrial Device"));
    }
    if v.it_score >= 1 {
        return Some(Classification::new(PurdueLevel::L3, "Network Device"));
    }
    if v
        .asset
        .ports_seen
        .iter()
        .any(|p| FALLBACK_INDUSTRIAL_PORTS.contains(p))
    {
        return Some(Classification::new(PurdueLevel::L1, "Field Device"));
    }
    if v.asset.ports_seen.is_empty() {
        return Some(Classification::new(PurdueLevel::Unknown, "Unknown Device"));
    }
    Some(Classification::new(PurdueLevel::L3, "Network Device"))
}
