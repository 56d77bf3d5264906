//! Concrete protocol analyzers
//!
//! Each analyzer pairs a cheap `can_analyze` precondition (usually a port
//! check) with a payload inspection step. Port-only matches report lower
//! confidence than payload-verified ones, so the engine prefers real DPI
//! evidence when both fire.

use once_cell::sync::Lazy;
use std::collections::HashMap;
use std::sync::Arc;

use super::protocol_names as names;
use super::{DetectionMethod, DetectionResult, ProtocolAnalyzer};
use crate::network::CapturedPacket;

fn touches_port(packet: &CapturedPacket, port: u16) -> bool {
    packet.src_port() == Some(port) || packet.dst_port() == Some(port)
}

fn is_udp(packet: &CapturedPacket) -> bool {
    matches!(packet.transport, Some(crate::network::TransportMeta::Udp { .. }))
}

fn is_tcp(packet: &CapturedPacket) -> bool {
    packet.tcp_meta().is_some()
}

/// Modbus/TCP: MBAP header on port 502
pub struct ModbusAnalyzer;

impl ProtocolAnalyzer for ModbusAnalyzer {
    fn name(&self) -> &'static str {
        "modbus"
    }

    fn can_analyze(&self, packet: &CapturedPacket) -> bool {
        is_tcp(packet) && touches_port(packet, 502)
    }

    fn analyze(&self, packet: &CapturedPacket) -> Option<DetectionResult> {
        let payload = &packet.payload;
        if payload.len() >= 8 {
            // MBAP: protocol identifier must be zero and the length field
            // covers unit id + PDU
            let protocol_id = u16::from_be_bytes([payload[2], payload[3]]);
            let length = u16::from_be_bytes([payload[4], payload[5]]) as usize;
            if protocol_id == 0 && length + 6 == payload.len() {
                let function = payload[7];
                return Some(DetectionResult::new(
                    names::MODBUS,
                    0.95,
                    DetectionMethod::Dpi,
                    &format!("MBAP header, function code {}", function),
                ));
            }
        }
        Some(DetectionResult::new(
            names::MODBUS,
            0.6,
            DetectionMethod::Port,
            "port 502 without verifiable MBAP header",
        ))
    }
}

/// S7comm over ISO-on-TCP (TPKT/COTP) on port 102
pub struct S7Analyzer;

impl ProtocolAnalyzer for S7Analyzer {
    fn name(&self) -> &'static str {
        "s7comm"
    }

    fn can_analyze(&self, packet: &CapturedPacket) -> bool {
        is_tcp(packet) && touches_port(packet, 102) && packet.has_payload()
    }

    fn analyze(&self, packet: &CapturedPacket) -> Option<DetectionResult> {
        let payload = &packet.payload;
        if payload.len() < 4 || payload[0] != 0x03 || payload[1] != 0x00 {
            return None;
        }
        // TPKT confirmed; an S7 PDU starts with 0x32 after the COTP header
        let cotp_len = *payload.get(4)? as usize;
        if payload.get(5 + cotp_len) == Some(&0x32) {
            return Some(DetectionResult::new(
                names::S7,
                0.95,
                DetectionMethod::Dpi,
                "TPKT/COTP with S7 PDU",
            ));
        }
        Some(DetectionResult::new(
            names::S7,
            0.8,
            DetectionMethod::Dpi,
            "TPKT/COTP on port 102",
        ))
    }
}

/// EtherNet/IP explicit messaging (encapsulation header) on 44818
pub struct EnipAnalyzer;

/// ENIP encapsulation commands we accept as evidence
const ENIP_COMMANDS: [u16; 6] = [0x0063, 0x0064, 0x0065, 0x0066, 0x006f, 0x0070];

impl ProtocolAnalyzer for EnipAnalyzer {
    fn name(&self) -> &'static str {
        "ethernet-ip"
    }

    fn can_analyze(&self, packet: &CapturedPacket) -> bool {
        touches_port(packet, 44818)
    }

    fn analyze(&self, packet: &CapturedPacket) -> Option<DetectionResult> {
        let payload = &packet.payload;
        if payload.len() >= 24 {
            let command = u16::from_le_bytes([payload[0], payload[1]]);
            let length = u16::from_le_bytes([payload[2], payload[3]]) as usize;
            if ENIP_COMMANDS.contains(&command) && length + 24 == payload.len() {
                return Some(DetectionResult::new(
                    names::ENIP,
                    0.95,
                    DetectionMethod::Dpi,
                    &format!("ENIP encapsulation command 0x{:04x}", command),
                ));
            }
        }
        Some(DetectionResult::new(
            names::ENIP,
            0.6,
            DetectionMethod::Port,
            "port 44818 without verifiable encapsulation header",
        ))
    }
}

/// CIP Class 1 implicit I/O on UDP 2222
pub struct CipIoAnalyzer;

impl ProtocolAnalyzer for CipIoAnalyzer {
    fn name(&self) -> &'static str {
        "cip-io"
    }

    fn can_analyze(&self, packet: &CapturedPacket) -> bool {
        is_udp(packet) && touches_port(packet, 2222)
    }

    fn analyze(&self, packet: &CapturedPacket) -> Option<DetectionResult> {
        if !packet.has_payload() {
            return None;
        }
        Some(DetectionResult::new(
            names::CIP_IO,
            0.85,
            DetectionMethod::Heuristic,
            "UDP 2222 implicit I/O traffic",
        ))
    }
}

/// OPC-UA binary transport on port 4840
pub struct OpcUaAnalyzer;

const OPC_UA_MESSAGE_TYPES: [&[u8; 3]; 5] = [b"HEL", b"ACK", b"OPN", b"MSG", b"CLO"];

impl ProtocolAnalyzer for OpcUaAnalyzer {
    fn name(&self) -> &'static str {
        "opc-ua"
    }

    fn can_analyze(&self, packet: &CapturedPacket) -> bool {
        is_tcp(packet) && touches_port(packet, 4840) && packet.has_payload()
    }

    fn analyze(&self, packet: &CapturedPacket) -> Option<DetectionResult> {
        let payload = &packet.payload;
        if payload.len() >= 8 {
            let header: &[u8] = &payload[..3];
            if OPC_UA_MESSAGE_TYPES.iter().any(|t| &t[..] == header) {
                return Some(DetectionResult::new(
                    names::OPC_UA,
                    0.95,
                    DetectionMethod::Dpi,
                    &format!("UA binary message {}", String::from_utf8_lossy(header)),
                ));
            }
        }
        Some(DetectionResult::new(
            names::OPC_UA,
            0.6,
            DetectionMethod::Port,
            "port 4840 without UA message header",
        ))
    }
}

/// DNP3 link-layer frames on port 20000
pub struct Dnp3Analyzer;

impl ProtocolAnalyzer for Dnp3Analyzer {
    fn name(&self) -> &'static str {
        "dnp3"
    }

    fn can_analyze(&self, packet: &CapturedPacket) -> bool {
        touches_port(packet, 20000)
    }

    fn analyze(&self, packet: &CapturedPacket) -> Option<DetectionResult> {
        let payload = &packet.payload;
        if payload.len() >= 10 && payload[0] == 0x05 && payload[1] == 0x64 {
            return Some(DetectionResult::new(
                names::DNP3,
                0.95,
                DetectionMethod::Dpi,
                "DNP3 link header 0x0564",
            ));
        }
        Some(DetectionResult::new(
            names::DNP3,
            0.6,
            DetectionMethod::Port,
            "port 20000 without DNP3 start bytes",
        ))
    }
}

/// BACnet/IP (BVLC) on UDP 47808
pub struct BacnetAnalyzer;

impl ProtocolAnalyzer for BacnetAnalyzer {
    fn name(&self) -> &'static str {
        "bacnet"
    }

    fn can_analyze(&self, packet: &CapturedPacket) -> bool {
        is_udp(packet) && touches_port(packet, 47808)
    }

    fn analyze(&self, packet: &CapturedPacket) -> Option<DetectionResult> {
        let payload = &packet.payload;
        if payload.len() >= 4 && payload[0] == 0x81 {
            return Some(DetectionResult::new(
                names::BACNET,
                0.9,
                DetectionMethod::Dpi,
                "BVLC type 0x81",
            ));
        }
        Some(DetectionResult::new(
            names::BACNET,
            0.6,
            DetectionMethod::Port,
            "port 47808 without BVLC header",
        ))
    }
}

/// Omron FINS on port 9600
pub struct FinsAnalyzer;

impl ProtocolAnalyzer for FinsAnalyzer {
    fn name(&self) -> &'static str {
        "fins"
    }

    fn can_analyze(&self, packet: &CapturedPacket) -> bool {
        touches_port(packet, 9600) && packet.has_payload()
    }

    fn analyze(&self, packet: &CapturedPacket) -> Option<DetectionResult> {
        let payload = &packet.payload;
        // UDP command frames start with an ICF byte with the bridge bit set;
        // FINS/TCP wraps frames in an ASCII "FINS" magic.
        if payload.starts_with(b"FINS") {
            return Some(DetectionResult::new(
                names::FINS,
                0.95,
                DetectionMethod::Dpi,
                "FINS/TCP magic",
            ));
        }
        if payload.len() >= 10 && payload[0] & 0x80 != 0 {
            return Some(DetectionResult::new(
                names::FINS,
                0.85,
                DetectionMethod::Dpi,
                "FINS ICF header",
            ));
        }
        Some(DetectionResult::new(
            names::FINS,
            0.6,
            DetectionMethod::Port,
            "port 9600 without FINS framing",
        ))
    }
}

/// Mitsubishi SLMP (MELSEC) on ports 5006/5007
pub struct SlmpAnalyzer;

impl ProtocolAnalyzer for SlmpAnalyzer {
    fn name(&self) -> &'static str {
        "slmp"
    }

    fn can_analyze(&self, packet: &CapturedPacket) -> bool {
        (touches_port(packet, 5006) || touches_port(packet, 5007)) && packet.has_payload()
    }

    fn analyze(&self, packet: &CapturedPacket) -> Option<DetectionResult> {
        let payload = &packet.payload;
        // 3E frame request subheader 0x5000, response 0xd000
        if payload.len() >= 9 && (payload[0] == 0x50 || payload[0] == 0xd0) && payload[1] == 0x00 {
            return Some(DetectionResult::new(
                names::SLMP,
                0.85,
                DetectionMethod::Dpi,
                "SLMP 3E frame subheader",
            ));
        }
        Some(DetectionResult::new(
            names::SLMP,
            0.6,
            DetectionMethod::Port,
            "MELSEC port without SLMP subheader",
        ))
    }
}

/// DHCP (BOOTP magic cookie) on UDP 67/68
pub struct DhcpAnalyzer;

impl ProtocolAnalyzer for DhcpAnalyzer {
    fn name(&self) -> &'static str {
        "dhcp"
    }

    fn can_analyze(&self, packet: &CapturedPacket) -> bool {
        is_udp(packet) && (touches_port(packet, 67) || touches_port(packet, 68))
    }

    fn analyze(&self, packet: &CapturedPacket) -> Option<DetectionResult> {
        let payload = &packet.payload;
        if payload.len() >= 240 && payload[236..240] == [0x63, 0x82, 0x53, 0x63] {
            return Some(DetectionResult::new(
                names::DHCP,
                0.95,
                DetectionMethod::Dpi,
                "BOOTP magic cookie",
            ));
        }
        None
    }
}

/// DNS on port 53
pub struct DnsAnalyzer;

impl ProtocolAnalyzer for DnsAnalyzer {
    fn name(&self) -> &'static str {
        "dns"
    }

    fn can_analyze(&self, packet: &CapturedPacket) -> bool {
        touches_port(packet, 53) && packet.has_payload()
    }

    fn analyze(&self, packet: &CapturedPacket) -> Option<DetectionResult> {
        if packet.payload.len() >= 12 {
            return Some(DetectionResult::new(
                names::DNS,
                0.7,
                DetectionMethod::Heuristic,
                "port 53 with DNS-sized header",
            ));
        }
        None
    }
}

/// HTTP request/response lines on any port
pub struct HttpAnalyzer;

const HTTP_PREFIXES: [&[u8]; 8] = [
    b"GET ", b"POST ", b"PUT ", b"HEAD ", b"DELETE ", b"OPTIONS ", b"PATCH ", b"HTTP/",
];

impl ProtocolAnalyzer for HttpAnalyzer {
    fn name(&self) -> &'static str {
        "http"
    }

    fn can_analyze(&self, packet: &CapturedPacket) -> bool {
        is_tcp(packet) && packet.has_payload()
    }

    fn analyze(&self, packet: &CapturedPacket) -> Option<DetectionResult> {
        let payload = &packet.payload;
        if HTTP_PREFIXES.iter().any(|p| payload.starts_with(p)) {
            return Some(DetectionResult::new(
                names::HTTP,
                0.9,
                DetectionMethod::Dpi,
                "HTTP start line",
            ));
        }
        None
    }
}

/// Fallback analyzer: well-known port map, low confidence
pub struct PortMapAnalyzer;

static PORT_MAP: Lazy<HashMap<u16, &'static str>> = Lazy::new(|| {
    HashMap::from([
        (21, "FTP"),
        (22, "SSH"),
        (23, "Telnet"),
        (25, "SMTP"),
        (53, names::DNS),
        (80, names::HTTP),
        (102, names::S7),
        (110, "POP3"),
        (135, "MSRPC"),
        (139, "NetBIOS"),
        (143, "IMAP"),
        (161, "SNMP"),
        (389, "LDAP"),
        (443, "HTTPS"),
        (445, "SMB"),
        (502, names::MODBUS),
        (993, "IMAPS"),
        (1433, "MSSQL"),
        (2222, names::CIP_IO),
        (2404, names::IEC104),
        (3306, "MySQL"),
        (3389, "RDP"),
        (4840, names::OPC_UA),
        (5006, names::SLMP),
        (5007, names::SLMP),
        (9600, names::FINS),
        (20000, names::DNP3),
        (44818, names::ENIP),
        (47808, names::BACNET),
    ])
});

impl ProtocolAnalyzer for PortMapAnalyzer {
    fn name(&self) -> &'static str {
        "port-map"
    }

    fn can_analyze(&self, packet: &CapturedPacket) -> bool {
        packet
            .dst_port()
            .map(|p| PORT_MAP.contains_key(&p))
            .unwrap_or(false)
            || packet
                .src_port()
                .map(|p| PORT_MAP.contains_key(&p))
                .unwrap_or(false)
    }

    fn analyze(&self, packet: &CapturedPacket) -> Option<DetectionResult> {
        let protocol = packet
            .dst_port()
            .and_then(|p| PORT_MAP.get(&p))
            .or_else(|| packet.src_port().and_then(|p| PORT_MAP.get(&p)))?;
        Some(DetectionResult::new(
            protocol,
            0.5,
            DetectionMethod::Port,
            "well-known port mapping",
        ))
    }
}

/// The full default analyzer set, specific DPI analyzers first
pub fn default_analyzers() -> Vec<Arc<dyn ProtocolAnalyzer>> {
    vec![
        Arc::new(ModbusAnalyzer),
        Arc::new(S7Analyzer),
        Arc::new(EnipAnalyzer),
        Arc::new(CipIoAnalyzer),
        Arc::new(OpcUaAnalyzer),
        Arc::new(Dnp3Analyzer),
        Arc::new(BacnetAnalyzer),
        Arc::new(FinsAnalyzer),
        Arc::new(SlmpAnalyzer),
        Arc::new(DhcpAnalyzer),
        Arc::new(DnsAnalyzer),
        Arc::new(HttpAnalyzer),
        Arc::new(PortMapAnalyzer),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detection::DetectionEngine;
    use crate::network::testing;
    use chrono::Utc;
    use pnet::packet::tcp::TcpFlags;
    use std::net::Ipv4Addr;

    fn tcp_packet(dst_port: u16, payload: &[u8]) -> CapturedPacket {
        let frame = testing::tcp_frame(
            "00:11:22:33:44:55".parse().unwrap(),
            "66:77:88:99:aa:bb".parse().unwrap(),
            Ipv4Addr::new(10, 0, 0, 1),
            Ipv4Addr::new(10, 0, 0, 2),
            49152,
            dst_port,
            TcpFlags::PSH | TcpFlags::ACK,
            64,
            65535,
            payload,
        );
        CapturedPacket::decode(&frame, Utc::now()).unwrap()
    }

    fn udp_packet(src_port: u16, dst_port: u16, payload: &[u8]) -> CapturedPacket {
        let frame = testing::udp_frame(
            "00:11:22:33:44:55".parse().unwrap(),
            "66:77:88:99:aa:bb".parse().unwrap(),
            Ipv4Addr::new(10, 0, 0, 1),
            Ipv4Addr::new(10, 0, 0, 2),
            src_port,
            dst_port,
            64,
            payload,
        );
        CapturedPacket::decode(&frame, Utc::now()).unwrap()
    }

    /// A well-formed Modbus read-holding-registers request
    fn modbus_request() -> Vec<u8> {
        vec![0x00, 0x01, 0x00, 0x00, 0x00, 0x06, 0x01, 0x03, 0x00, 0x00, 0x00, 0x0a]
    }

    #[test]
    fn test_modbus_mbap_high_confidence() {
        let packet = tcp_packet(502, &modbus_request());
        let result = ModbusAnalyzer.analyze(&packet).unwrap();
        assert_eq!(result.protocol, "Modbus");
        assert_eq!(result.method, DetectionMethod::Dpi);
        assert!(result.confidence > 0.9);
    }

    #[test]
    fn test_modbus_port_only_low_confidence() {
        let packet = tcp_packet(502, b"\xff\xff\xff\xff\xff\xff\xff\xff");
        let result = ModbusAnalyzer.analyze(&packet).unwrap();
        assert_eq!(result.method, DetectionMethod::Port);
        assert!(result.confidence < 0.7);
    }

    #[test]
    fn test_s7_tpkt_detection() {
        // TPKT + COTP DT + S7 header byte
        let payload = vec![0x03, 0x00, 0x00, 0x1f, 0x02, 0xf0, 0x80, 0x32, 0x01];
        let packet = tcp_packet(102, &payload);
        let result = S7Analyzer.analyze(&packet).unwrap();
        assert_eq!(result.protocol, "S7");
        assert!(result.confidence > 0.9);
    }

    #[test]
    fn test_enip_register_session() {
        let mut payload = vec![0u8; 28];
        payload[0] = 0x65; // RegisterSession, little endian
        payload[2] = 0x04; // length 4
        let packet = tcp_packet(44818, &payload);
        let result = EnipAnalyzer.analyze(&packet).unwrap();
        assert_eq!(result.protocol, "EtherNet/IP");
        assert_eq!(result.method, DetectionMethod::Dpi);
    }

    #[test]
    fn test_dnp3_start_bytes() {
        let payload = vec![0x05, 0x64, 0x05, 0xc0, 0x01, 0x00, 0x00, 0x04, 0xe9, 0x21];
        let packet = tcp_packet(20000, &payload);
        let result = Dnp3Analyzer.analyze(&packet).unwrap();
        assert_eq!(result.protocol, "DNP3");
        assert!(result.confidence > 0.9);
    }

    #[test]
    fn test_bacnet_bvlc() {
        let packet = udp_packet(47808, 47808, &[0x81, 0x0a, 0x00, 0x0c]);
        let result = BacnetAnalyzer.analyze(&packet).unwrap();
        assert_eq!(result.protocol, "BACnet");
    }

    #[test]
    fn test_opcua_hello() {
        let mut payload = b"HELF".to_vec();
        payload.extend_from_slice(&[0x20, 0x00, 0x00, 0x00]);
        let packet = tcp_packet(4840, &payload);
        let result = OpcUaAnalyzer.analyze(&packet).unwrap();
        assert_eq!(result.protocol, "OPC-UA");
        assert!(result.confidence > 0.9);
    }

    #[test]
    fn test_dhcp_magic_cookie() {
        let payload = testing::dhcp_payload("plc-7", "Rockwell Automation");
        let packet = udp_packet(68, 67, &payload);
        let result = DhcpAnalyzer.analyze(&packet).unwrap();
        assert_eq!(result.protocol, "DHCP");
    }

    #[test]
    fn test_http_start_line() {
        let packet = tcp_packet(8080, b"GET /index.html HTTP/1.1\r\n");
        let result = HttpAnalyzer.analyze(&packet).unwrap();
        assert_eq!(result.protocol, "HTTP");
    }

    #[test]
    fn test_port_map_fallback() {
        let packet = tcp_packet(3389, b"\x03\x00\x00\x13");
        assert!(PortMapAnalyzer.can_analyze(&packet));
        let result = PortMapAnalyzer.analyze(&packet).unwrap();
        assert_eq!(result.protocol, "RDP");
        assert_eq!(result.method, DetectionMethod::Port);
    }

    #[test]
    fn test_engine_prefers_dpi_over_port_map() {
        let engine = DetectionEngine::with_default_analyzers(64);
        let result = engine.analyze_packet(&tcp_packet(502, &modbus_request())).unwrap();
        assert_eq!(result.protocol, "Modbus");
        assert_eq!(result.method, DetectionMethod::Dpi);
    }

    #[test]
    fn test_slmp_3e_frame() {
        let payload = vec![0x50, 0x00, 0x00, 0xff, 0xff, 0x03, 0x00, 0x0c, 0x00];
        let packet = tcp_packet(5007, &payload);
        let result = SlmpAnalyzer.analyze(&packet).unwrap();
        assert_eq!(result.protocol, "SLMP");
        assert_eq!(result.method, DetectionMethod::Dpi);
    }

    #[test]
    fn test_fins_tcp_magic() {
        let payload = b"FINS\x00\x00\x00\x0c\x00\x00\x00\x00".to_vec();
        let packet = tcp_packet(9600, &payload);
        let result = FinsAnalyzer.analyze(&packet).unwrap();
        assert!(result.confidence > 0.9);
    }
}
