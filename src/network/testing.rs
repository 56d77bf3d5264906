//! Synthetic frame builders
//!
//! Used by the unit and integration tests to craft deterministic Ethernet
//! frames without a capture source. Checksums are filled in so the frames
//! also survive a round-trip through external tooling.

use pnet::packet::arp::{ArpHardwareTypes, ArpOperations, MutableArpPacket};
use pnet::packet::ethernet::{EtherTypes, MutableEthernetPacket};
use pnet::packet::ip::IpNextHeaderProtocols;
use pnet::packet::ipv4::{self, MutableIpv4Packet};
use pnet::packet::tcp::{self, MutableTcpPacket};
use pnet::packet::udp::{self, MutableUdpPacket};
use pnet::util::MacAddr;
use std::net::Ipv4Addr;

const ETHERNET_LEN: usize = 14;
const IPV4_LEN: usize = 20;
const TCP_LEN: usize = 20;
const UDP_LEN: usize = 8;

/// Build an IPv4/TCP frame with the given header fields and payload
#[allow(clippy::too_many_arguments)]
pub fn tcp_frame(
    src_mac: MacAddr,
    dst_mac: MacAddr,
    src_ip: Ipv4Addr,
    dst_ip: Ipv4Addr,
    src_port: u16,
    dst_port: u16,
    flags: u16,
    ttl: u8,
    window: u16,
    payload: &[u8],
) -> Vec<u8> {
    let total = ETHERNET_LEN + IPV4_LEN + TCP_LEN + payload.len();
    let mut buf = vec![0u8; total];

    {
        let mut ethernet = MutableEthernetPacket::new(&mut buf).unwrap();
        ethernet.set_source(src_mac);
        ethernet.set_destination(dst_mac);
        ethernet.set_ethertype(EtherTypes::Ipv4);
    }
    {
        let mut ip = MutableIpv4Packet::new(&mut buf[ETHERNET_LEN..]).unwrap();
        ip.set_version(4);
        ip.set_header_length(5);
        ip.set_total_length((IPV4_LEN + TCP_LEN + payload.len()) as u16);
        ip.set_ttl(ttl);
        ip.set_next_level_protocol(IpNextHeaderProtocols::Tcp);
        ip.set_source(src_ip);
        ip.set_destination(dst_ip);
        let checksum = ipv4::checksum(&ip.to_immutable());
        ip.set_checksum(checksum);
    }
    {
        let mut segment = MutableTcpPacket::new(&mut buf[ETHERNET_LEN + IPV4_LEN..]).unwrap();
        segment.set_source(src_port);
        segment.set_destination(dst_port);
        segment.set_data_offset(5);
        segment.set_flags(flags);
        segment.set_window(window);
        segment.set_payload(payload);
        let checksum = tcp::ipv4_checksum(&segment.to_immutable(), &src_ip, &dst_ip);
        segment.set_checksum(checksum);
    }

    buf
}

/// Build an IPv4/UDP frame with the given header fields and payload
#[allow(clippy::too_many_arguments)]
pub fn udp_frame(
    src_mac: MacAddr,
    dst_mac: MacAddr,
    src_ip: Ipv4Addr,
    dst_ip: Ipv4Addr,
    src_port: u16,
    dst_port: u16,
    ttl: u8,
    payload: &[u8],
) -> Vec<u8> {
    let total = ETHERNET_LEN + IPV4_LEN + UDP_LEN + payload.len();
    let mut buf = vec![0u8; total];

    {
        let mut ethernet = MutableEthernetPacket::new(&mut buf).unwrap();
        ethernet.set_source(src_mac);
        ethernet.set_destination(dst_mac);
        ethernet.set_ethertype(EtherTypes::Ipv4);
    }
    {
        let mut ip = MutableIpv4Packet::new(&mut buf[ETHERNET_LEN..]).unwrap();
        ip.set_version(4);
        ip.set_header_length(5);
        ip.set_total_length((IPV4_LEN + UDP_LEN + payload.len()) as u16);
        ip.set_ttl(ttl);
        ip.set_next_level_protocol(IpNextHeaderProtocols::Udp);
        ip.set_source(src_ip);
        ip.set_destination(dst_ip);
        let checksum = ipv4::checksum(&ip.to_immutable());
        ip.set_checksum(checksum);
    }
    {
        let mut datagram = MutableUdpPacket::new(&mut buf[ETHERNET_LEN + IPV4_LEN..]).unwrap();
        datagram.set_source(src_port);
        datagram.set_destination(dst_port);
        datagram.set_length((UDP_LEN + payload.len()) as u16);
        datagram.set_payload(payload);
        let checksum = udp::ipv4_checksum(&datagram.to_immutable(), &src_ip, &dst_ip);
        datagram.set_checksum(checksum);
    }

    buf
}

/// Build a broadcast ARP request frame
pub fn arp_frame(sender_mac: MacAddr, sender_ip: Ipv4Addr, target_ip: Ipv4Addr) -> Vec<u8> {
    let mut buf = vec![0u8; ETHERNET_LEN + 28];

    {
        let mut ethernet = MutableEthernetPacket::new(&mut buf).unwrap();
        ethernet.set_source(sender_mac);
        ethernet.set_destination(MacAddr::broadcast());
        ethernet.set_ethertype(EtherTypes::Arp);
    }
    {
        let mut arp = MutableArpPacket::new(&mut buf[ETHERNET_LEN..]).unwrap();
        arp.set_hardware_type(ArpHardwareTypes::Ethernet);
        arp.set_protocol_type(EtherTypes::Ipv4);
        arp.set_hw_addr_len(6);
        arp.set_proto_addr_len(4);
        arp.set_operation(ArpOperations::Request);
        arp.set_sender_hw_addr(sender_mac);
        arp.set_sender_proto_addr(sender_ip);
        arp.set_target_hw_addr(MacAddr::zero());
        arp.set_target_proto_addr(target_ip);
    }

    buf
}

/// A minimal DHCP Discover payload carrying hostname (option 12) and
/// vendor class identifier (option 60)
pub fn dhcp_payload(hostname: &str, vendor_class: &str) -> Vec<u8> {
    // BOOTP header (236 bytes) + magic cookie + options
    let mut payload = vec![0u8; 236];
    payload[0] = 0x01; // BOOTREQUEST
    payload[1] = 0x01; // Ethernet
    payload[2] = 0x06; // hardware address length
    payload.extend_from_slice(&[0x63, 0x82, 0x53, 0x63]);

    payload.extend_from_slice(&[53, 1, 1]); // DHCP message type: Discover
    payload.push(12);
    payload.push(hostname.len() as u8);
    payload.extend_from_slice(hostname.as_bytes());
    payload.push(60);
    payload.push(vendor_class.len() as u8);
    payload.extend_from_slice(vendor_class.as_bytes());
    payload.push(255); // end option

    payload
}
