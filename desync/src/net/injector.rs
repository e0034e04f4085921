/// Raw decoy injection
///
/// Frames are written straight to the link layer, so the kernel never learns
/// about them and the real connection's sequence state stays untouched.
use std::net::{IpAddr, SocketAddr, SocketAddrV4};

use bytes::Bytes;
use parking_lot::Mutex;
use rand::Rng;
use tracing::{debug, warn};

use crate::capture::LinkLayer;
use crate::error::{EvasionError, Result};
use crate::protocols::packet::frame::{ETHERTYPE_IPV4, IPPROTO_TCP};
use crate::protocols::packet::{CraftedFrame, EthernetHeader, Ipv4Header, TcpFlags, TcpHeader};

use super::gateway::GatewayInfo;

/// Receive windows commonly advertised by desktop stacks
const PLAUSIBLE_WINDOWS: [u16; 5] = [64240, 65535, 29200, 14600, 8192];

pub struct PacketInjector {
    link: Mutex<Box<dyn LinkLayer>>,
    gateway: GatewayInfo,
}

impl PacketInjector {
    pub fn new(link: Box<dyn LinkLayer>, gateway: GatewayInfo) -> Self {
        Self {
            link: Mutex::new(link),
            gateway,
        }
    }

    pub fn gateway(&self) -> &GatewayInfo {
        &self.gateway
    }

    /// One PSH+ACK frame from `src` to `dst` with fresh random identifiers
    ///
    /// `window_size` is in units of 256 bytes; zero picks a common window.
    pub fn build_frame(&self, src: SocketAddr, dst: SocketAddr, ttl: u8, payload: Bytes, window_size: u8) -> Result<CraftedFrame> {
        let (src, dst) = ipv4_pair(src, dst)?;
        let mut rng = rand::thread_rng();

        let window = if window_size > 0 {
            u16::from(window_size) << 8
        } else {
            PLAUSIBLE_WINDOWS[rng.gen_range(0..PLAUSIBLE_WINDOWS.len())]
        };

        Ok(CraftedFrame {
            ethernet: EthernetHeader {
                destination: self.gateway.gateway_mac,
                source: self.gateway.interface_mac,
                ethertype: ETHERTYPE_IPV4,
            },
            ip: Ipv4Header {
                source: *src.ip(),
                destination: *dst.ip(),
                ttl,
                identification: rng.gen_range(1..=u16::MAX),
                dont_fragment: true,
                protocol: IPPROTO_TCP,
            },
            tcp: TcpHeader {
                source_port: src.port(),
                destination_port: dst.port(),
                sequence: rng.gen_range(1..=u32::MAX),
                acknowledgement: rng.gen_range(1..=u32::MAX),
                flags: TcpFlags::PSH_ACK,
                window,
            },
            payload,
        })
    }

    /// Write `repeat` decoys carrying `payload`; returns how many went out
    pub fn write_crafted_packet(&self, src: SocketAddr, dst: SocketAddr, ttl: u8, payload: &[u8], repeat: u8) -> Result<usize> {
        self.write_crafted_packet_with_window(src, dst, ttl, payload, repeat, 0)
    }

    pub fn write_crafted_packet_with_window(
        &self,
        src: SocketAddr,
        dst: SocketAddr,
        ttl: u8,
        payload: &[u8],
        repeat: u8,
        window_size: u8,
    ) -> Result<usize> {
        let payload = Bytes::copy_from_slice(payload);
        let mut written = 0;

        for _ in 0..repeat {
            let frame = self.build_frame(src, dst, ttl, payload.clone(), window_size)?.serialize();
            let mut link = self.link.lock();
            link.write_frame(&frame)?;
            written += 1;
        }

        debug!("Injected {} decoy(s) {} -> {} with ttl {}", written, src, dst, ttl);
        Ok(written)
    }

    pub fn close(&self) {
        if let Err(err) = self.link.lock().close() {
            warn!("Cannot close injection handle: {}", err);
        }
    }
}

fn ipv4_pair(src: SocketAddr, dst: SocketAddr) -> Result<(SocketAddrV4, SocketAddrV4)> {
    Ok((as_ipv4(src)?, as_ipv4(dst)?))
}

/// Plain IPv4, or IPv4-mapped IPv6 as a dual-stack socket reports it
fn as_ipv4(addr: SocketAddr) -> Result<SocketAddrV4> {
    match addr {
        SocketAddr::V4(addr) => Ok(addr),
        SocketAddr::V6(addr) => match addr.ip().to_ipv4_mapped() {
            Some(ip) => Ok(SocketAddrV4::new(ip, addr.port())),
            None => Err(unsupported((*addr.ip()).into())),
        },
    }
}

fn unsupported(addr: IpAddr) -> EvasionError {
    EvasionError::Unsupported(format!("raw injection is IPv4 only ({addr})"))
}
