/// Internet checksum (RFC 1071) for IPv4 headers and TCP segments
use std::net::Ipv4Addr;

const IPPROTO_TCP: u8 = 6;

/// Running one's complement sum, so the TCP pseudo-header and segment can be
/// summed without first copying them into one buffer
#[derive(Debug, Default, Clone, Copy)]
pub struct Checksum {
    sum: u32,
    // Carries an odd trailing byte into the next `add`
    pending: Option<u8>,
}

impl Checksum {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, data: &[u8]) -> &mut Self {
        let mut data = data;
        if let Some(hi) = self.pending.take() {
            match data.split_first() {
                Some((lo, rest)) => {
                    self.sum += u32::from(u16::from_be_bytes([hi, *lo]));
                    data = rest;
                }
                None => {
                    self.pending = Some(hi);
                    return self;
                }
            }
        }

        let mut chunks = data.chunks_exact(2);
        for word in &mut chunks {
            self.sum += u32::from(u16::from_be_bytes([word[0], word[1]]));
        }
        if let [last] = chunks.remainder() {
            self.pending = Some(*last);
        }
        self.fold();
        self
    }

    fn fold(&mut self) {
        while self.sum >> 16 != 0 {
            self.sum = (self.sum & 0xffff) + (self.sum >> 16);
        }
    }

    pub fn finish(mut self) -> u16 {
        if let Some(hi) = self.pending.take() {
            self.sum += u32::from(hi) << 8;
        }
        self.fold();
        !(self.sum as u16)
    }
}

/// IPv4 header checksum; the checksum field (bytes 10-11) must be zero
pub fn ipv4_header_checksum(header: &[u8]) -> u16 {
    let mut sum = Checksum::new();
    sum.add(header);
    sum.finish()
}

/// TCP checksum including the IPv4 pseudo-header; the checksum field
/// (bytes 16-17 of the segment) must be zero
pub fn tcp_checksum(src: Ipv4Addr, dst: Ipv4Addr, segment: &[u8]) -> u16 {
    let tcp_len = segment.len() as u16;
    let mut sum = Checksum::new();
    sum.add(&src.octets())
        .add(&dst.octets())
        .add(&[0, IPPROTO_TCP])
        .add(&tcp_len.to_be_bytes())
        .add(segment);
    sum.finish()
}
