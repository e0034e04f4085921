/// Ethernet + IPv4 + TCP frame crafting and parsing
///
/// Decoys bypass the kernel TCP stack entirely, so every header is written by
/// hand. The parsing half only understands what the hop estimator needs from
/// captured SYN+ACK replies.
use std::net::{Ipv4Addr, SocketAddrV4};

use bytes::{BufMut, Bytes, BytesMut};

use super::MacAddr;
use super::checksum::{ipv4_header_checksum, tcp_checksum};

pub const ETHERNET_HEADER_LEN: usize = 14;
pub const IPV4_HEADER_LEN: usize = 20;
pub const TCP_HEADER_LEN: usize = 20;

pub const ETHERTYPE_IPV4: u16 = 0x0800;
pub const ETHERTYPE_ARP: u16 = 0x0806;
pub const IPPROTO_TCP: u8 = 6;

/// Flags byte of the TCP header (offset 13)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TcpFlags(pub u8);

impl TcpFlags {
    pub const FIN: u8 = 0x01;
    pub const SYN: u8 = 0x02;
    pub const RST: u8 = 0x04;
    pub const PSH: u8 = 0x08;
    pub const ACK: u8 = 0x10;

    pub const PSH_ACK: Self = Self(Self::PSH | Self::ACK);
    pub const SYN_ACK: Self = Self(Self::SYN | Self::ACK);

    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EthernetHeader {
    pub destination: MacAddr,
    pub source: MacAddr,
    pub ethertype: u16,
}

impl EthernetHeader {
    pub fn encode(&self, dst: &mut BytesMut) {
        dst.put_slice(&self.destination.octets());
        dst.put_slice(&self.source.octets());
        dst.put_u16(self.ethertype);
    }

    pub fn parse(frame: &[u8]) -> Option<Self> {
        let header = frame.get(..ETHERNET_HEADER_LEN)?;
        Some(Self {
            destination: MacAddr::from_slice(&header[0..6])?,
            source: MacAddr::from_slice(&header[6..12])?,
            ethertype: u16::from_be_bytes([header[12], header[13]]),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ipv4Header {
    pub source: Ipv4Addr,
    pub destination: Ipv4Addr,
    pub ttl: u8,
    pub identification: u16,
    pub dont_fragment: bool,
    pub protocol: u8,
}

impl Ipv4Header {
    /// Write a 20-byte header (no options) with its checksum filled in
    pub fn encode(&self, payload_len: usize, dst: &mut BytesMut) {
        let start = dst.len();
        let total_len = (IPV4_HEADER_LEN + payload_len) as u16;

        dst.put_u8(0x45); // version 4, IHL 5
        dst.put_u8(0);
        dst.put_u16(total_len);
        dst.put_u16(self.identification);
        dst.put_u16(if self.dont_fragment { 0x4000 } else { 0 });
        dst.put_u8(self.ttl);
        dst.put_u8(self.protocol);
        dst.put_u16(0);
        dst.put_slice(&self.source.octets());
        dst.put_slice(&self.destination.octets());

        let checksum = ipv4_header_checksum(&dst[start..start + IPV4_HEADER_LEN]);
        dst[start + 10..start + 12].copy_from_slice(&checksum.to_be_bytes());
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TcpHeader {
    pub source_port: u16,
    pub destination_port: u16,
    pub sequence: u32,
    pub acknowledgement: u32,
    pub flags: TcpFlags,
    pub window: u16,
}

impl TcpHeader {
    /// Write a 20-byte header (no options) followed by `payload`, checksum
    /// computed over the IPv4 pseudo-header
    pub fn encode(&self, source: Ipv4Addr, destination: Ipv4Addr, payload: &[u8], dst: &mut BytesMut) {
        let start = dst.len();

        dst.put_u16(self.source_port);
        dst.put_u16(self.destination_port);
        dst.put_u32(self.sequence);
        dst.put_u32(self.acknowledgement);
        dst.put_u8(((TCP_HEADER_LEN / 4) as u8) << 4);
        dst.put_u8(self.flags.0);
        dst.put_u16(self.window);
        dst.put_u16(0); // checksum
        dst.put_u16(0); // urgent pointer
        dst.put_slice(payload);

        let checksum = tcp_checksum(source, destination, &dst[start..]);
        dst[start + 16..start + 18].copy_from_slice(&checksum.to_be_bytes());
    }
}

/// A complete decoy frame, built fresh for every send
#[derive(Debug, Clone)]
pub struct CraftedFrame {
    pub ethernet: EthernetHeader,
    pub ip: Ipv4Header,
    pub tcp: TcpHeader,
    pub payload: Bytes,
}

impl CraftedFrame {
    pub fn wire_len(&self) -> usize {
        ETHERNET_HEADER_LEN + IPV4_HEADER_LEN + TCP_HEADER_LEN + self.payload.len()
    }

    pub fn serialize(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.wire_len());
        self.ethernet.encode(&mut buf);
        self.ip.encode(TCP_HEADER_LEN + self.payload.len(), &mut buf);
        self.tcp.encode(self.ip.source, self.ip.destination, &self.payload, &mut buf);
        buf.freeze()
    }
}

/// Fields of a captured IPv4/TCP frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TcpSegmentInfo {
    pub source: SocketAddrV4,
    pub destination: SocketAddrV4,
    pub ttl: u8,
    pub flags: TcpFlags,
    pub fragmented: bool,
}

/// Parse an Ethernet frame carrying IPv4/TCP; anything else is `None`
pub fn parse_ipv4_tcp(frame: &[u8]) -> Option<TcpSegmentInfo> {
    let ethernet = EthernetHeader::parse(frame)?;
    if ethernet.ethertype != ETHERTYPE_IPV4 {
        return None;
    }

    let ip = frame.get(ETHERNET_HEADER_LEN..)?;
    if ip.len() < IPV4_HEADER_LEN || ip[0] >> 4 != 4 {
        return None;
    }
    let ihl = usize::from(ip[0] & 0x0f) * 4;
    if ihl < IPV4_HEADER_LEN || ip[9] != IPPROTO_TCP {
        return None;
    }

    let flags_fragment = u16::from_be_bytes([ip[6], ip[7]]);
    let more_fragments = flags_fragment & 0x2000 != 0;
    let fragment_offset = flags_fragment & 0x1fff;

    let tcp = ip.get(ihl..ihl + TCP_HEADER_LEN)?;
    let source_ip = Ipv4Addr::new(ip[12], ip[13], ip[14], ip[15]);
    let destination_ip = Ipv4Addr::new(ip[16], ip[17], ip[18], ip[19]);

    Some(TcpSegmentInfo {
        source: SocketAddrV4::new(source_ip, u16::from_be_bytes([tcp[0], tcp[1]])),
        destination: SocketAddrV4::new(destination_ip, u16::from_be_bytes([tcp[2], tcp[3]])),
        ttl: ip[8],
        flags: TcpFlags(tcp[13]),
        fragmented: more_fragments || fragment_offset != 0,
    })
}
