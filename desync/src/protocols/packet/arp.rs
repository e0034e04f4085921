/// ARP (RFC 826) over Ethernet, IPv4 only
use std::net::Ipv4Addr;

use bytes::{BufMut, Bytes, BytesMut};

use super::MacAddr;
use super::frame::{ETHERNET_HEADER_LEN, ETHERTYPE_ARP, ETHERTYPE_IPV4, EthernetHeader};

pub const ARP_PACKET_LEN: usize = 28;

const HTYPE_ETHERNET: u16 = 1;
pub const ARP_OP_REQUEST: u16 = 1;
pub const ARP_OP_REPLY: u16 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArpPacket {
    pub operation: u16,
    pub sender_mac: MacAddr,
    pub sender_ip: Ipv4Addr,
    pub target_mac: MacAddr,
    pub target_ip: Ipv4Addr,
}

impl ArpPacket {
    /// Who-has `target_ip`, tell `sender_ip`
    pub fn request(sender_mac: MacAddr, sender_ip: Ipv4Addr, target_ip: Ipv4Addr) -> Self {
        Self {
            operation: ARP_OP_REQUEST,
            sender_mac,
            sender_ip,
            target_mac: MacAddr::ZERO,
            target_ip,
        }
    }

    pub fn is_reply(&self) -> bool {
        self.operation == ARP_OP_REPLY
    }

    /// Serialize with an Ethernet header; requests go to broadcast
    pub fn to_frame(&self) -> Bytes {
        let destination = if self.operation == ARP_OP_REQUEST {
            MacAddr::BROADCAST
        } else {
            self.target_mac
        };

        let mut buf = BytesMut::with_capacity(ETHERNET_HEADER_LEN + ARP_PACKET_LEN);
        EthernetHeader {
            destination,
            source: self.sender_mac,
            ethertype: ETHERTYPE_ARP,
        }
        .encode(&mut buf);

        buf.put_u16(HTYPE_ETHERNET);
        buf.put_u16(ETHERTYPE_IPV4);
        buf.put_u8(6);
        buf.put_u8(4);
        buf.put_u16(self.operation);
        buf.put_slice(&self.sender_mac.octets());
        buf.put_slice(&self.sender_ip.octets());
        buf.put_slice(&self.target_mac.octets());
        buf.put_slice(&self.target_ip.octets());
        buf.freeze()
    }

    /// Parse an Ethernet frame carrying an Ethernet/IPv4 ARP packet
    pub fn parse_frame(frame: &[u8]) -> Option<Self> {
        let ethernet = EthernetHeader::parse(frame)?;
        if ethernet.ethertype != ETHERTYPE_ARP {
            return None;
        }

        let arp = frame.get(ETHERNET_HEADER_LEN..ETHERNET_HEADER_LEN + ARP_PACKET_LEN)?;
        let htype = u16::from_be_bytes([arp[0], arp[1]]);
        let ptype = u16::from_be_bytes([arp[2], arp[3]]);
        if htype != HTYPE_ETHERNET || ptype != ETHERTYPE_IPV4 || arp[4] != 6 || arp[5] != 4 {
            return None;
        }

        Some(Self {
            operation: u16::from_be_bytes([arp[6], arp[7]]),
            sender_mac: MacAddr::from_slice(&arp[8..14])?,
            sender_ip: Ipv4Addr::new(arp[14], arp[15], arp[16], arp[17]),
            target_mac: MacAddr::from_slice(&arp[18..24])?,
            target_ip: Ipv4Addr::new(arp[24], arp[25], arp[26], arp[27]),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LOCAL_MAC: MacAddr = MacAddr::new([0x02, 0x11, 0x22, 0x33, 0x44, 0x55]);
    const GATEWAY_MAC: MacAddr = MacAddr::new([0x00, 0x1a, 0x2b, 0x3c, 0x4d, 0x5e]);

    #[test]
    fn test_request_layout() {
        let frame = ArpPacket::request(LOCAL_MAC, Ipv4Addr::new(192, 168, 1, 10), Ipv4Addr::new(192, 168, 1, 1))
            .to_frame();

        assert_eq!(frame.len(), 42);
        assert_eq!(&frame[0..6], &[0xff; 6]);
        assert_eq!(&frame[6..12], &LOCAL_MAC.octets());
        assert_eq!(&frame[12..14], &[0x08, 0x06]);
        assert_eq!(&frame[20..22], &[0x00, 0x01]);
        assert_eq!(&frame[32..38], &[0u8; 6]);
        assert_eq!(&frame[38..42], &[192, 168, 1, 1]);
    }

    #[test]
    fn test_parse_reply() {
        let reply = ArpPacket {
            operation: ARP_OP_REPLY,
            sender_mac: GATEWAY_MAC,
            sender_ip: Ipv4Addr::new(192, 168, 1, 1),
            target_mac: LOCAL_MAC,
            target_ip: Ipv4Addr::new(192, 168, 1, 10),
        };
        let frame = reply.to_frame();
        assert_eq!(&frame[0..6], &LOCAL_MAC.octets());

        let parsed = ArpPacket::parse_frame(&frame).unwrap();
        assert!(parsed.is_reply());
        assert_eq!(parsed.sender_mac, GATEWAY_MAC);
        assert_eq!(parsed.sender_ip, Ipv4Addr::new(192, 168, 1, 1));
    }

    #[test]
    fn test_parse_rejects_other_frames() {
        let mut frame = ArpPacket::request(LOCAL_MAC, Ipv4Addr::LOCALHOST, Ipv4Addr::LOCALHOST)
            .to_frame()
            .to_vec();
        assert!(ArpPacket::parse_frame(&frame[..30]).is_none());

        frame[13] = 0x00; // ethertype 0x0800
        assert!(ArpPacket::parse_frame(&frame).is_none());
    }
}
