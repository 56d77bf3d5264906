//! Multi-signal device fingerprinting
//!
//! Five independent evidence sources — MAC OUI, TCP SYN stack signature,
//! DHCP options, protocol mix and communication timing — each optionally
//! produce one scored signal. Fusion is deliberately simple: the overall
//! confidence is the arithmetic mean of the signals that fired, boosted by
//! fixed multipliers, and identity fields are filled first-signal-wins.
//! The arithmetic is part of the compatibility contract; downstream
//! consumers depend on the existing ranges.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::{Asset, EvidenceSample};
use crate::network::CapturedPacket;

/// Confidence multiplier applied when more than one signal fired
pub const MULTI_SIGNAL_BOOST: f64 = 1.2;

/// Further multiplier applied when both manufacturer and device type are known
pub const CORROBORATION_BOOST: f64 = 1.1;

/// Hard cap applied after each boost
pub const CONFIDENCE_CAP: f64 = 0.95;

/// Minimum packet sample for the timing signal
pub const MIN_TIMING_SAMPLES: usize = 10;

/// Regular polling: variance below this fraction of mean²
pub const TIMING_VARIANCE_RATIO: f64 = 0.25;

/// Burst communication: intervals below this count as "fast"
pub const BURST_INTERVAL_MS: f64 = 100.0;

/// Device identity verdict for one asset
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub device_type: String,
    pub manufacturer: String,
    pub os: String,
    pub model: String,
    pub version: String,
    /// Confidence in [0, 1]; 0 when no signal fired
    pub confidence: f64,
    /// Human-readable indicators that justified the verdict, in signal order
    pub indicators: Vec<String>,
}

/// One fired evidence signal
#[derive(Debug, Clone, Default)]
struct Signal {
    confidence: f64,
    device_type: Option<String>,
    manufacturer: Option<String>,
    os: Option<String>,
    indicator: String,
}

/// OUI prefix → vendor name
const OUI_VENDORS: &[(&str, &str)] = &[
    ("00:00:bc", "Rockwell Automation"),
    ("00:1d:9c", "Rockwell Automation"),
    ("f4:54:33", "Rockwell Automation"),
    ("08:00:06", "Siemens"),
    ("00:1b:1b", "Siemens"),
    ("28:63:36", "Siemens"),
    ("00:80:f4", "Schneider Electric"),
    ("00:00:54", "Schneider Electric"),
    ("00:00:0a", "Omron"),
    ("08:00:70", "Mitsubishi Electric"),
    ("00:30:de", "Wago"),
    ("00:a0:45", "Phoenix Contact"),
    ("00:01:05", "Beckhoff"),
    ("00:90:e8", "Moxa"),
    ("00:1e:14", "Cisco Systems"),
    ("00:40:96", "Cisco Systems"),
    ("3c:d9:2b", "Hewlett Packard"),
    ("f8:b1:56", "Dell"),
    ("00:1b:21", "Intel Corporate"),
    ("00:0c:29", "VMware"),
    ("00:50:56", "VMware"),
];

/// Vendor keyword → device type. Unmatched vendors get no partial credit.
const VENDOR_DEVICE_TYPES: &[(&str, &str)] = &[
    ("rockwell", "PLC"),
    ("siemens", "PLC"),
    ("schneider", "PLC"),
    ("omron", "PLC"),
    ("mitsubishi", "PLC"),
    ("wago", "PLC"),
    ("phoenix", "PLC"),
    ("beckhoff", "PLC"),
    ("moxa", "Network Switch"),
    ("cisco", "Network Switch"),
    ("juniper", "Network Router"),
    ("hewlett", "Server"),
    ("dell", "Workstation"),
    ("intel", "Workstation"),
    ("vmware", "Virtual Machine"),
];

/// (TTL, window) → OS for known TCP SYN signatures
const SYN_SIGNATURES: &[(u8, u16, &str)] = &[
    (64, 65535, "Linux/Unix"),
    (64, 64240, "Linux"),
    (64, 29200, "Linux"),
    (64, 5840, "Linux 2.6"),
    (128, 64240, "Windows 10"),
    (128, 8192, "Windows 7/Server 2008"),
    (128, 65535, "Windows"),
    (255, 4128, "Cisco IOS"),
    (255, 8760, "Solaris"),
];

/// DHCP vendor-class keywords for industrial equipment
const DHCP_INDUSTRIAL_CLASSES: &[(&str, &str, &str)] = &[
    // keyword, device type, os
    ("rockwell", "PLC", ""),
    ("allen-bradley", "PLC", ""),
    ("siemens", "PLC", ""),
    ("schneider", "PLC", ""),
    ("wago", "PLC", ""),
    ("vxworks", "PLC", "VxWorks"),
    ("bacnet", "Building Controller", ""),
];

/// DHCP vendor-class keywords for general-purpose operating systems
const DHCP_OS_CLASSES: &[(&str, &str)] = &[
    ("msft", "Windows"),
    ("microsoft", "Windows"),
    ("android", "Android"),
    ("udhcp", "Linux"),
    ("dhcpcd", "Linux"),
    ("darwin", "macOS"),
];

/// Protocol categories for the protocol-mix vote
const INDUSTRIAL_PROTOCOLS: &[&str] = &[
    "Modbus", "S7", "EtherNet/IP", "CIP-IO", "OPC-UA", "DNP3", "BACnet", "FINS", "SLMP", "IEC-104",
];
const IT_PROTOCOLS: &[&str] = &[
    "HTTP", "HTTPS", "DNS", "SSH", "SMB", "RDP", "SMTP", "MySQL", "MSSQL", "Telnet", "LDAP",
    "IMAP", "POP3", "FTP", "NetBIOS", "MSRPC",
];
const NETWORK_PROTOCOLS: &[&str] = &["ARP", "ICMP", "DHCP", "SNMP"];

/// Industrial device-type priority for the protocol-mix vote
const INDUSTRIAL_TYPE_PRIORITY: &[(&str, &str)] = &[
    ("BACnet", "Building Controller"),
    ("DNP3", "RTU"),
    ("Modbus", "PLC"),
    ("S7", "PLC"),
    ("FINS", "PLC"),
    ("SLMP", "PLC"),
    ("EtherNet/IP", "PLC"),
    ("CIP-IO", "PLC"),
    ("OPC-UA", "HMI"),
];

/// Fuses per-asset evidence into a device-type/OS/manufacturer guess
#[derive(Debug, Default)]
pub struct DeviceFingerprinter;

impl DeviceFingerprinter {
    pub fn new() -> Self {
        Self
    }

    /// Extract the lightweight evidence one packet contributes to its sender
    pub fn extract_sample(packet: &CapturedPacket) -> EvidenceSample {
        let mut sample = EvidenceSample {
            timestamp: packet.timestamp,
            ttl: packet.ttl,
            tcp_window: None,
            tcp_option_kinds: Vec::new(),
            syn_only: false,
            dhcp_payload: None,
        };
        if let Some(meta) = packet.tcp_meta() {
            if meta.is_syn_only() {
                sample.syn_only = true;
                sample.tcp_window = Some(meta.window);
                sample.tcp_option_kinds = meta.option_kinds.clone();
            }
        }
        let dhcp_ports = packet.src_port() == Some(68)
            || packet.src_port() == Some(67)
            || packet.dst_port() == Some(67)
            || packet.dst_port() == Some(68);
        if dhcp_ports && packet.payload.len() >= 240 {
            sample.dhcp_payload = Some(packet.payload.clone());
        }
        sample
    }

    /// Fuse all available evidence for one asset into a [`DeviceInfo`].
    ///
    /// Signals are evaluated in a fixed order and later signals never
    /// overwrite a field an earlier one filled.
    pub fn fingerprint_device(&self, asset: &Asset, samples: &[EvidenceSample]) -> DeviceInfo {
        let signals: Vec<Signal> = [
            self.mac_signal(asset),
            self.syn_signal(samples),
            self.dhcp_signal(samples),
            self.protocol_mix_signal(asset),
            self.timing_signal(samples),
        ]
        .into_iter()
        .flatten()
        .collect();

        let mut info = DeviceInfo::default();
        if signals.is_empty() {
            return info;
        }

        let mut confidence =
            signals.iter().map(|s| s.confidence).sum::<f64>() / signals.len() as f64;
        if signals.len() > 1 {
            confidence = (confidence * MULTI_SIGNAL_BOOST).min(CONFIDENCE_CAP);
        }

        for signal in &signals {
            if info.device_type.is_empty() {
                if let Some(t) = &signal.device_type {
                    info.device_type = t.clone();
                }
            }
            if info.manufacturer.is_empty() {
                if let Some(m) = &signal.manufacturer {
                    info.manufacturer = m.clone();
                }
            }
            if info.os.is_empty() {
                if let Some(os) = &signal.os {
                    info.os = os.clone();
                }
            }
            info.indicators.push(signal.indicator.clone());
        }

        if !info.manufacturer.is_empty() && !info.device_type.is_empty() {
            confidence = (confidence * CORROBORATION_BOOST).min(CONFIDENCE_CAP);
        }
        info.confidence = confidence.clamp(0.0, 1.0);
        info
    }

    /// Signal 1: MAC OUI → vendor, vendor → device type
    fn mac_signal(&self, asset: &Asset) -> Option<Signal> {
        let mac = asset.mac.as_ref()?.to_lowercase();
        let prefix = mac.get(..8)?;
        let vendor = OUI_VENDORS
            .iter()
            .find(|(oui, _)| *oui == prefix)
            .map(|(_, v)| *v)?;

        let vendor_lower = vendor.to_lowercase();
        let device_type = VENDOR_DEVICE_TYPES
            .iter()
            .find(|(kw, _)| vendor_lower.contains(kw))
            .map(|(_, t)| t.to_string());

        let confidence = if device_type.is_some() { 0.7 } else { 0.5 };
        Some(Signal {
            confidence,
            device_type,
            manufacturer: Some(vendor.to_string()),
            os: None,
            indicator: format!("MAC OUI {} registered to {}", prefix, vendor),
        })
    }

    /// Signal 2: TCP SYN stack signature, TTL/window heuristic fallback
    fn syn_signal(&self, samples: &[EvidenceSample]) -> Option<Signal> {
        let syn = samples.iter().find(|s| s.syn_only)?;
        let ttl = syn.ttl?;
        let window = syn.tcp_window?;
        let signature = format!("{}:{}:{}", ttl, window, option_kinds_label(&syn.tcp_option_kinds));

        if let Some((_, _, os)) = SYN_SIGNATURES
            .iter()
            .find(|(t, w, _)| *t == ttl && *w == window)
        {
            let device_type = if os.contains("Cisco") {
                Some("Network Device".to_string())
            } else {
                None
            };
            return Some(Signal {
                confidence: 0.7,
                device_type,
                manufacturer: None,
                os: Some(os.to_string()),
                indicator: format!("TCP SYN signature {} matches {}", signature, os),
            });
        }

        // TTL decay heuristic when no exact signature matches
        let (os, device_type) = if ttl <= 64 {
            (Some("Linux/Unix".to_string()), None)
        } else if ttl <= 128 {
            (Some("Windows".to_string()), None)
        } else {
            (None, Some("Network Device".to_string()))
        };
        Some(Signal {
            confidence: 0.4,
            device_type,
            manufacturer: None,
            os,
            indicator: format!("TCP SYN heuristic from signature {}", signature),
        })
    }

    /// Signal 3: DHCP option 60 (vendor class) and 12 (hostname)
    fn dhcp_signal(&self, samples: &[EvidenceSample]) -> Option<Signal> {
        let payload = samples.iter().find_map(|s| s.dhcp_payload.as_deref())?;
        let (hostname, vendor_class) = parse_dhcp_options(payload);
        let class = vendor_class?;
        let class_lower = class.to_lowercase();

        for (keyword, device_type, os) in DHCP_INDUSTRIAL_CLASSES {
            if class_lower.contains(keyword) {
                return Some(Signal {
                    confidence: 0.6,
                    device_type: Some(device_type.to_string()),
                    manufacturer: None,
                    os: if os.is_empty() { None } else { Some(os.to_string()) },
                    indicator: format!("DHCP vendor class \"{}\"", class),
                });
            }
        }
        for (keyword, os) in DHCP_OS_CLASSES {
            if class_lower.contains(keyword) {
                return Some(Signal {
                    confidence: 0.6,
                    device_type: None,
                    manufacturer: None,
                    os: Some(os.to_string()),
                    indicator: format!("DHCP vendor class \"{}\"", class),
                });
            }
        }
        // Vendor class present but unrecognized: hostname alone still
        // justifies a weak signal when it was supplied.
        hostname.map(|h| Signal {
            confidence: 0.3,
            device_type: None,
            manufacturer: None,
            os: None,
            indicator: format!("DHCP hostname \"{}\"", h),
        })
    }

    /// Signal 4: majority vote over protocol-category membership
    fn protocol_mix_signal(&self, asset: &Asset) -> Option<Signal> {
        let industrial = count_membership(asset, INDUSTRIAL_PROTOCOLS);
        let it = count_membership(asset, IT_PROTOCOLS);
        let network = count_membership(asset, NETWORK_PROTOCOLS);
        if industrial + it + network == 0 {
            return None;
        }

        if industrial >= it && industrial >= network {
            let device_type = INDUSTRIAL_TYPE_PRIORITY
                .iter()
                .find(|(proto, _)| asset.protocols.contains(*proto))
                .map(|(_, t)| t.to_string())
                .unwrap_or_else(|| "PLC".to_string());
            return Some(Signal {
                confidence: 0.6,
                device_type: Some(device_type),
                manufacturer: None,
                os: None,
                indicator: format!("{} industrial protocols in traffic mix", industrial),
            });
        }
        if it >= network {
            return Some(Signal {
                confidence: 0.5,
                device_type: Some("Workstation".to_string()),
                manufacturer: None,
                os: None,
                indicator: format!("{} IT protocols in traffic mix", it),
            });
        }
        Some(Signal {
            confidence: 0.4,
            device_type: Some("Network Device".to_string()),
            manufacturer: None,
            os: None,
            indicator: format!("{} network-infrastructure protocols in traffic mix", network),
        })
    }

    /// Signal 5: inter-packet timing over the available sample
    fn timing_signal(&self, samples: &[EvidenceSample]) -> Option<Signal> {
        if samples.len() < MIN_TIMING_SAMPLES {
            return None;
        }
        let mut times: Vec<DateTime<Utc>> = samples.iter().map(|s| s.timestamp).collect();
        times.sort();
        let intervals: Vec<f64> = times
            .windows(2)
            .map(|w| (w[1] - w[0]).num_microseconds().unwrap_or(0) as f64 / 1000.0)
            .collect();

        let mean = intervals.iter().sum::<f64>() / intervals.len() as f64;
        if mean <= 0.0 {
            return None;
        }
        let variance = intervals
            .iter()
            .map(|i| (i - mean).powi(2))
            .sum::<f64>()
            / intervals.len() as f64;

        if variance < TIMING_VARIANCE_RATIO * mean * mean {
            return Some(Signal {
                confidence: 0.5,
                device_type: Some("PLC".to_string()),
                manufacturer: None,
                os: None,
                indicator: "Regular Polling".to_string(),
            });
        }

        let fast = intervals.iter().filter(|i| **i < BURST_INTERVAL_MS).count();
        let has_pause = intervals.iter().any(|i| *i > 1000.0);
        if fast as f64 / intervals.len() as f64 >= 0.6 && has_pause {
            return Some(Signal {
                confidence: 0.4,
                device_type: Some("HMI".to_string()),
                manufacturer: None,
                os: None,
                indicator: "Burst Communication".to_string(),
            });
        }
        None
    }
}

/// Hostname from DHCP option 12, if any sample carried one
pub fn dhcp_hostname(samples: &[EvidenceSample]) -> Option<String> {
    samples
        .iter()
        .find_map(|s| s.dhcp_payload.as_deref())
        .and_then(|payload| parse_dhcp_options(payload).0)
}

fn count_membership(asset: &Asset, category: &[&str]) -> usize {
    asset
        .protocols
        .iter()
        .filter(|p| category.contains(&p.as_str()))
        .count()
}

fn option_kinds_label(kinds: &[u8]) -> String {
    if kinds.is_empty() {
        return "-".to_string();
    }
    kinds
        .iter()
        .map(|k| match *k {
            0 => "EOL".to_string(),
            1 => "NOP".to_string(),
            2 => "MSS".to_string(),
            3 => "WS".to_string(),
            4 => "SACK".to_string(),
            8 => "TS".to_string(),
            other => other.to_string(),
        })
        .collect::<Vec<_>>()
        .join(",")
}

/// Walk raw BOOTP option bytes, returning (hostname, vendor class)
fn parse_dhcp_options(payload: &[u8]) -> (Option<String>, Option<String>) {
    if payload.len() < 240 || payload[236..240] != [0x63, 0x82, 0x53, 0x63] {
        return (None, None);
    }
    let mut hostname = None;
    let mut vendor_class = None;
    let mut i = 240;
    while i < payload.len() {
        let code = payload[i];
        if code == 0 {
            i += 1;
            continue;
        }
        if code == 255 {
            break;
        }
        if i + 1 >= payload.len() {
            break;
        }
        let len = payload[i + 1] as usize;
        let end = i + 2 + len;
        if end > payload.len() {
            break;
        }
        let value = &payload[i + 2..end];
        match code {
            12 => hostname = Some(String::from_utf8_lossy(value).to_string()),
            60 => vendor_class = Some(String::from_utf8_lossy(value).to_string()),
            _ => {}
        }
        i = end;
    }
    (hostname, vendor_class)
}
