//! Captured frame decoding
//!
//! A [`CapturedPacket`] is the immutable unit of work the pipeline operates
//! on: one frame, decoded once, with its link/network/transport layers and
//! application payload exposed. Decoding is best-effort per packet; a frame
//! that cannot be decoded is an error counted by the pipeline, never a
//! pipeline failure.

use chrono::{DateTime, Utc};
use pnet::packet::arp::ArpPacket;
use pnet::packet::ethernet::{EtherTypes, EthernetPacket};
use pnet::packet::ip::{IpNextHeaderProtocol, IpNextHeaderProtocols};
use pnet::packet::ipv4::Ipv4Packet;
use pnet::packet::ipv6::Ipv6Packet;
use pnet::packet::tcp::{TcpFlags, TcpPacket};
use pnet::packet::udp::UdpPacket;
use pnet::packet::Packet;
use pnet::util::MacAddr;
use std::net::IpAddr;

use crate::model::AssetId;
use crate::{AnalysisError, Result};

/// Decoded layer kinds, in wire order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LayerType {
    Ethernet,
    Arp,
    Ipv4,
    Ipv6,
    Tcp,
    Udp,
    Icmp,
    Payload,
}

/// TCP header fields the fingerprinter and analyzers care about
#[derive(Debug, Clone, PartialEq)]
pub struct TcpMeta {
    pub src_port: u16,
    pub dst_port: u16,
    pub flags: u16,
    pub window: u16,
    /// Ordered TCP option kinds as they appeared in the header
    pub option_kinds: Vec<u8>,
}

impl TcpMeta {
    /// SYN set, ACK clear: the first packet of a connection attempt
    pub fn is_syn_only(&self) -> bool {
        self.flags & TcpFlags::SYN != 0 && self.flags & TcpFlags::ACK == 0
    }
}

/// Transport layer metadata
#[derive(Debug, Clone, PartialEq)]
pub enum TransportMeta {
    Tcp(TcpMeta),
    Udp { src_port: u16, dst_port: u16 },
    Icmp,
}

/// One captured frame with decodable layers
#[derive(Debug, Clone)]
pub struct CapturedPacket {
    pub timestamp: DateTime<Utc>,
    /// Length of the frame on the wire
    pub wire_len: usize,
    pub src_mac: Option<MacAddr>,
    pub dst_mac: Option<MacAddr>,
    pub src_ip: Option<IpAddr>,
    pub dst_ip: Option<IpAddr>,
    /// IPv4 TTL or IPv6 hop limit
    pub ttl: Option<u8>,
    pub transport: Option<TransportMeta>,
    /// Application-layer payload, empty when none
    pub payload: Vec<u8>,
    /// Decoded layer types in wire order
    pub layers: Vec<LayerType>,
}

impl CapturedPacket {
    /// Decode an Ethernet frame into a captured packet
    pub fn decode(frame: &[u8], timestamp: DateTime<Utc>) -> Result<Self> {
        let ethernet = EthernetPacket::new(frame)
            .ok_or_else(|| AnalysisError::DecodeError("frame too short for Ethernet".into()))?;

        let mut packet = CapturedPacket {
            timestamp,
            wire_len: frame.len(),
            src_mac: Some(ethernet.get_source()),
            dst_mac: Some(ethernet.get_destination()),
            src_ip: None,
            dst_ip: None,
            ttl: None,
            transport: None,
            payload: Vec::new(),
            layers: vec![LayerType::Ethernet],
        };

        match ethernet.get_ethertype() {
            EtherTypes::Arp => {
                let arp = ArpPacket::new(ethernet.payload())
                    .ok_or_else(|| AnalysisError::DecodeError("truncated ARP packet".into()))?;
                packet.layers.push(LayerType::Arp);
                // ARP sender/target protocol addresses are informational only;
                // identity for non-IP frames stays link-layer.
                let _ = arp.get_sender_proto_addr();
            }
            EtherTypes::Ipv4 => {
                let ip = Ipv4Packet::new(ethernet.payload())
                    .ok_or_else(|| AnalysisError::DecodeError("truncated IPv4 packet".into()))?;
                packet.layers.push(LayerType::Ipv4);
                packet.src_ip = Some(IpAddr::V4(ip.get_source()));
                packet.dst_ip = Some(IpAddr::V4(ip.get_destination()));
                packet.ttl = Some(ip.get_ttl());
                Self::decode_transport(&mut packet, ip.get_next_level_protocol(), ip.payload())?;
            }
            EtherTypes::Ipv6 => {
                let ip = Ipv6Packet::new(ethernet.payload())
                    .ok_or_else(|| AnalysisError::DecodeError("truncated IPv6 packet".into()))?;
                packet.layers.push(LayerType::Ipv6);
                packet.src_ip = Some(IpAddr::V6(ip.get_source()));
                packet.dst_ip = Some(IpAddr::V6(ip.get_destination()));
                packet.ttl = Some(ip.get_hop_limit());
                Self::decode_transport(&mut packet, ip.get_next_header(), ip.payload())?;
            }
            other => {
                return Err(AnalysisError::DecodeError(format!(
                    "unsupported ethertype {:?}",
                    other
                )));
            }
        }

        if !packet.payload.is_empty() {
            packet.layers.push(LayerType::Payload);
        }
        Ok(packet)
    }

    fn decode_transport(
        packet: &mut CapturedPacket,
        protocol: IpNextHeaderProtocol,
        data: &[u8],
    ) -> Result<()> {
        match protocol {
            IpNextHeaderProtocols::Tcp => {
                let tcp = TcpPacket::new(data)
                    .ok_or_else(|| AnalysisError::DecodeError("truncated TCP segment".into()))?;
                packet.layers.push(LayerType::Tcp);
                let option_kinds = tcp
                    .get_options_iter()
                    .map(|opt| opt.get_number().0)
                    .collect();
                packet.transport = Some(TransportMeta::Tcp(TcpMeta {
                    src_port: tcp.get_source(),
                    dst_port: tcp.get_destination(),
                    flags: tcp.get_flags(),
                    window: tcp.get_window(),
                    option_kinds,
                }));
                packet.payload = tcp.payload().to_vec();
            }
            IpNextHeaderProtocols::Udp => {
                let udp = UdpPacket::new(data)
                    .ok_or_else(|| AnalysisError::DecodeError("truncated UDP datagram".into()))?;
                packet.layers.push(LayerType::Udp);
                packet.transport = Some(TransportMeta::Udp {
                    src_port: udp.get_source(),
                    dst_port: udp.get_destination(),
                });
                packet.payload = udp.payload().to_vec();
            }
            IpNextHeaderProtocols::Icmp | IpNextHeaderProtocols::Icmpv6 => {
                packet.layers.push(LayerType::Icmp);
                packet.transport = Some(TransportMeta::Icmp);
            }
            _ => {}
        }
        Ok(())
    }

    /// Identifier for the sending endpoint: IP when present, MAC otherwise
    pub fn src_id(&self) -> Option<AssetId> {
        self.src_ip
            .map(AssetId::Ip)
            .or(self.src_mac.map(AssetId::Mac))
    }

    /// Identifier for the receiving endpoint: IP when present, MAC otherwise
    pub fn dst_id(&self) -> Option<AssetId> {
        self.dst_ip
            .map(AssetId::Ip)
            .or(self.dst_mac.map(AssetId::Mac))
    }

    /// Both endpoint identifiers, when the frame has any addressing at all
    pub fn endpoints(&self) -> Option<(AssetId, AssetId)> {
        Some((self.src_id()?, self.dst_id()?))
    }

    pub fn src_port(&self) -> Option<u16> {
        match &self.transport {
            Some(TransportMeta::Tcp(meta)) => Some(meta.src_port),
            Some(TransportMeta::Udp { src_port, .. }) => Some(*src_port),
            _ => None,
        }
    }

    pub fn dst_port(&self) -> Option<u16> {
        match &self.transport {
            Some(TransportMeta::Tcp(meta)) => Some(meta.dst_port),
            Some(TransportMeta::Udp { dst_port, .. }) => Some(*dst_port),
            _ => None,
        }
    }

    pub fn tcp_meta(&self) -> Option<&TcpMeta> {
        match &self.transport {
            Some(TransportMeta::Tcp(meta)) => Some(meta),
            _ => None,
        }
    }

    pub fn has_payload(&self) -> bool {
        !self.payload.is_empty()
    }

    /// True when the frame is addressed to a multicast or broadcast group
    pub fn is_multicast_destination(&self) -> bool {
        if let Some(ip) = self.dst_ip {
            if ip.is_multicast() {
                return true;
            }
            if let IpAddr::V4(v4) = ip {
                if v4.is_broadcast() {
                    return true;
                }
            }
        }
        match self.dst_mac {
            Some(mac) => mac.is_multicast() || mac.is_broadcast(),
            None => false,
        }
    }

    /// Coarse protocol label used when no analyzer recognizes the packet
    pub fn transport_label(&self) -> &'static str {
        if self.layers.contains(&LayerType::Arp) {
            return "ARP";
        }
        match &self.transport {
            Some(TransportMeta::Tcp(_)) => "TCP",
            Some(TransportMeta::Udp { .. }) => "UDP",
            Some(TransportMeta::Icmp) => "ICMP",
            None => "OTHER",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::testing;

    fn now() -> DateTime<Utc> {
        Utc::now()
    }

    #[test]
    fn test_decode_tcp_frame() {
        let frame = testing::tcp_frame(
            "00:11:22:33:44:55".parse().unwrap(),
            "66:77:88:99:aa:bb".parse().unwrap(),
            "10.0.0.1".parse().unwrap(),
            "10.0.0.2".parse().unwrap(),
            49152,
            502,
            TcpFlags::PSH | TcpFlags::ACK,
            64,
            65535,
            &[0x00, 0x01, 0x00, 0x00, 0x00, 0x06, 0x01, 0x03],
        );
        let packet = CapturedPacket::decode(&frame, now()).unwrap();

        assert_eq!(packet.src_ip, Some("10.0.0.1".parse().unwrap()));
        assert_eq!(packet.dst_port(), Some(502));
        assert_eq!(packet.ttl, Some(64));
        assert!(packet.has_payload());
        assert_eq!(
            packet.layers,
            vec![LayerType::Ethernet, LayerType::Ipv4, LayerType::Tcp, LayerType::Payload]
        );
    }

    #[test]
    fn test_syn_only_detection() {
        let frame = testing::tcp_frame(
            "00:11:22:33:44:55".parse().unwrap(),
            "66:77:88:99:aa:bb".parse().unwrap(),
            "10.0.0.1".parse().unwrap(),
            "10.0.0.2".parse().unwrap(),
            49152,
            80,
            TcpFlags::SYN,
            64,
            65535,
            &[],
        );
        let packet = CapturedPacket::decode(&frame, now()).unwrap();
        let meta = packet.tcp_meta().unwrap();
        assert!(meta.is_syn_only());
        assert_eq!(meta.window, 65535);
    }

    #[test]
    fn test_arp_frame_uses_mac_identity() {
        let src: MacAddr = "00:11:22:33:44:55".parse().unwrap();
        let frame = testing::arp_frame(
            src,
            "10.0.0.1".parse().unwrap(),
            "10.0.0.2".parse().unwrap(),
        );
        let packet = CapturedPacket::decode(&frame, now()).unwrap();

        assert_eq!(packet.src_id(), Some(AssetId::Mac(src)));
        assert_eq!(packet.transport_label(), "ARP");
        assert!(packet.is_multicast_destination()); // broadcast target
    }

    #[test]
    fn test_truncated_frame_is_error() {
        assert!(CapturedPacket::decode(&[0u8; 4], now()).is_err());
    }

    #[test]
    fn test_multicast_destination() {
        let frame = testing::udp_frame(
            "00:11:22:33:44:55".parse().unwrap(),
            "01:00:5e:00:00:fb".parse().unwrap(),
            "10.0.0.1".parse().unwrap(),
            "224.0.0.251".parse().unwrap(),
            5353,
            5353,
            64,
            &[0x00],
        );
        let packet = CapturedPacket::decode(&frame, now()).unwrap();
        assert!(packet.is_multicast_destination());
    }
}
