/// Outbound interface and default gateway detection
///
/// The local address is learned with a connected UDP socket: `connect` on a
/// datagram socket only runs route selection, nothing is sent. The interface
/// that owns that address is then looked up with `getifaddrs`.
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket};

use tracing::debug;

use crate::error::{EvasionError, Result};
use crate::protocols::packet::MacAddr;

/// Default probe target; any routable address works, nothing is sent to it
pub const DEFAULT_PROBE_ADDR: SocketAddr = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(8, 8, 8, 8)), 53);

const RTF_UP: u16 = 0x0001;
const RTF_GATEWAY: u16 = 0x0002;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceInfo {
    pub name: String,
    pub index: u32,
    pub mac: MacAddr,
    pub local_ip: Ipv4Addr,
}

/// Local IPv4 address the kernel would use to reach `probe`
pub fn outbound_local_ip(probe: SocketAddr) -> io::Result<Ipv4Addr> {
    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))?;
    socket.connect(probe)?;
    match socket.local_addr()?.ip() {
        IpAddr::V4(ip) if !ip.is_unspecified() => Ok(ip),
        other => Err(io::Error::new(
            io::ErrorKind::AddrNotAvailable,
            format!("no usable IPv4 source address ({other})"),
        )),
    }
}

/// Interface carrying the default route toward `probe`
pub fn detect_outbound_interface(probe: SocketAddr) -> Result<InterfaceInfo> {
    let local_ip = outbound_local_ip(probe)?;
    let info = find_interface(|_, ip| ip == Some(local_ip))?;
    debug!(
        "Outbound interface {} (index {}, mac {}, ip {})",
        info.name, info.index, info.mac, info.local_ip
    );
    Ok(info)
}

/// Look up an interface by name, for an explicit override
pub fn interface_by_name(name: &str) -> Result<InterfaceInfo> {
    find_interface(|ifname, ip| ifname == name && ip.is_some())
}

#[cfg(unix)]
fn find_interface(matches: impl Fn(&str, Option<Ipv4Addr>) -> bool) -> Result<InterfaceInfo> {
    use nix::ifaddrs::getifaddrs;

    let addrs: Vec<_> = getifaddrs().map_err(io::Error::from)?.collect();

    let (name, local_ip) = addrs
        .iter()
        .find_map(|ifaddr| {
            let ip = ifaddr
                .address
                .as_ref()
                .and_then(|a| a.as_sockaddr_in())
                .map(|sin| Ipv4Addr::from(sin.ip()));
            if matches(&ifaddr.interface_name, ip) {
                Some((ifaddr.interface_name.clone(), ip?))
            } else {
                None
            }
        })
        .ok_or_else(|| EvasionError::Unsupported("no interface matches the outbound address".to_string()))?;

    let link = addrs
        .iter()
        .filter(|ifaddr| ifaddr.interface_name == name)
        .find_map(|ifaddr| ifaddr.address.as_ref().and_then(|a| a.as_link_addr()).cloned());

    let mac = link
        .as_ref()
        .and_then(|l| l.addr())
        .map(MacAddr::new)
        .ok_or_else(|| EvasionError::Unsupported(format!("interface {name} has no hardware address")))?;

    let index = match link.as_ref().map(|l| l.ifindex()) {
        Some(index) if index > 0 => index as u32,
        _ => nix::net::if_::if_nametoindex(name.as_str()).map_err(io::Error::from)?,
    };

    Ok(InterfaceInfo {
        name,
        index,
        mac,
        local_ip,
    })
}

#[cfg(not(unix))]
fn find_interface(_matches: impl Fn(&str, Option<Ipv4Addr>) -> bool) -> Result<InterfaceInfo> {
    Err(EvasionError::Unsupported("interface enumeration".to_string()))
}

/// Default IPv4 gateway for `interface`
#[cfg(target_os = "linux")]
pub fn default_gateway(interface: &str) -> Result<Ipv4Addr> {
    let table = std::fs::read_to_string("/proc/net/route")?;
    parse_default_route(&table, Some(interface))
        .map(|(_, gateway)| gateway)
        .ok_or_else(|| EvasionError::Unsupported(format!("no default route via {interface}")))
}

#[cfg(not(target_os = "linux"))]
pub fn default_gateway(_interface: &str) -> Result<Ipv4Addr> {
    Err(EvasionError::Unsupported("default gateway lookup".to_string()))
}

/// Pick the default route out of a `/proc/net/route` table
///
/// Addresses in that file are hex dumps of the kernel's native-endian u32,
/// i.e. little-endian on every platform this runs on. Among several default
/// routes the lowest metric wins.
pub fn parse_default_route(table: &str, interface: Option<&str>) -> Option<(String, Ipv4Addr)> {
    let parse_addr = |hex: &str| u32::from_str_radix(hex, 16).ok().map(|v| Ipv4Addr::from(v.to_le_bytes()));

    table
        .lines()
        .skip(1)
        .filter_map(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() < 8 {
                return None;
            }
            let iface = fields[0];
            if interface.is_some_and(|wanted| wanted != iface) {
                return None;
            }

            let destination = parse_addr(fields[1])?;
            let gateway = parse_addr(fields[2])?;
            let flags = u16::from_str_radix(fields[3], 16).ok()?;
            let metric: u32 = fields[6].parse().ok()?;
            let mask = parse_addr(fields[7])?;

            let is_default = destination.is_unspecified() && mask.is_unspecified();
            let usable = flags & RTF_UP != 0 && flags & RTF_GATEWAY != 0;
            (is_default && usable).then(|| (metric, iface.to_string(), gateway))
        })
        .min_by_key(|(metric, _, _)| *metric)
        .map(|(_, iface, gateway)| (iface, gateway))
}
