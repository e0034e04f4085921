/// Gateway MAC resolution over ARP
///
/// Decoy frames are written below the kernel's neighbour cache, so the
/// destination MAC of the default gateway has to be learned by hand. This
/// happens once per process; the answer is never invalidated.
use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use crate::capture::{LinkLayer, LinkProvider, LinkType, bpf};
use crate::error::{EvasionError, Result};
use crate::protocols::packet::{ArpPacket, MacAddr};

use super::interface::{self, InterfaceInfo};

pub const DEFAULT_ARP_TIMEOUT: Duration = Duration::from_secs(3);

const ARP_RETRY_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayInfo {
    pub gateway_ip: Ipv4Addr,
    pub gateway_mac: MacAddr,
    pub interface: String,
    pub interface_index: u32,
    pub interface_mac: MacAddr,
    pub local_ip: Ipv4Addr,
}

/// Ask `gateway_ip` for its hardware address and wait for the reply
///
/// Installs a filter that only passes ARP replies from the gateway, so the
/// link can be a freshly opened handle on a busy interface. The request is
/// repeated every second until `timeout` runs out.
pub fn resolve_gateway_mac(
    link: &mut dyn LinkLayer,
    interface_mac: MacAddr,
    local_ip: Ipv4Addr,
    gateway_ip: Ipv4Addr,
    timeout: Duration,
) -> Result<MacAddr> {
    if link.link_type() != LinkType::Ethernet {
        return Err(EvasionError::Unsupported(format!("ARP on {} link", link.link_type())));
    }

    link.set_filter(&bpf::arp_reply_filter(gateway_ip))?;
    let request = ArpPacket::request(interface_mac, local_ip, gateway_ip).to_frame();

    let deadline = Instant::now() + timeout;
    let mut next_request = Instant::now();
    let mut buf = [0u8; 1514];

    loop {
        let now = Instant::now();
        if now >= deadline {
            return Err(EvasionError::Timeout(timeout));
        }

        if now >= next_request {
            debug!("ARP who-has {} tell {}", gateway_ip, local_ip);
            link.write_frame(&request)?;
            next_request = now + ARP_RETRY_INTERVAL;
        }

        let wait = deadline.min(next_request).saturating_duration_since(now);
        let Some(n) = link.read_frame(&mut buf, wait)? else {
            continue;
        };

        match ArpPacket::parse_frame(&buf[..n]) {
            Some(reply) if reply.is_reply() && reply.sender_ip == gateway_ip && !reply.sender_mac.is_zero() => {
                return Ok(reply.sender_mac);
            }
            _ => continue,
        }
    }
}

/// Where the resolver gets its interface and gateway address from
#[derive(Debug, Clone)]
pub enum GatewayTarget {
    /// Route lookup toward `probe`, optionally forcing an interface by name
    Detect {
        probe: SocketAddr,
        interface: Option<String>,
    },
    /// Already known, only the MAC is missing
    Fixed { interface: InterfaceInfo, gateway_ip: Ipv4Addr },
}

/// Resolves the gateway at most once and caches the result
pub struct GatewayResolver {
    provider: Arc<dyn LinkProvider>,
    target: GatewayTarget,
    timeout: Duration,
    resolved: OnceCell<GatewayInfo>,
}

impl GatewayResolver {
    pub fn new(provider: Arc<dyn LinkProvider>, target: GatewayTarget, timeout: Duration) -> Self {
        Self {
            provider,
            target,
            timeout,
            resolved: OnceCell::new(),
        }
    }

    /// Cached result, if a previous `resolve` succeeded
    pub fn get(&self) -> Option<&GatewayInfo> {
        self.resolved.get()
    }

    /// Resolve on a blocking thread; concurrent callers share one attempt.
    /// A failed attempt is not cached.
    pub async fn resolve(&self) -> Result<GatewayInfo> {
        let info = self
            .resolved
            .get_or_try_init(|| async {
                let provider = self.provider.clone();
                let target = self.target.clone();
                let timeout = self.timeout;
                tokio::task::spawn_blocking(move || resolve_blocking(provider.as_ref(), &target, timeout))
                    .await
                    .map_err(|err| EvasionError::Io(io::Error::other(err)))?
            })
            .await?;
        Ok(info.clone())
    }
}

fn resolve_blocking(provider: &dyn LinkProvider, target: &GatewayTarget, timeout: Duration) -> Result<GatewayInfo> {
    let (iface, gateway_ip) = match target {
        GatewayTarget::Detect { probe, interface: None } => {
            let iface = interface::detect_outbound_interface(*probe)?;
            let gateway = interface::default_gateway(&iface.name)?;
            (iface, gateway)
        }
        GatewayTarget::Detect {
            interface: Some(name), ..
        } => {
            let iface = interface::interface_by_name(name)?;
            let gateway = interface::default_gateway(&iface.name)?;
            (iface, gateway)
        }
        GatewayTarget::Fixed { interface, gateway_ip } => (interface.clone(), *gateway_ip),
    };

    let mut link = provider.open(&iface.name)?;
    let started = Instant::now();
    let result = resolve_gateway_mac(link.as_mut(), iface.mac, iface.local_ip, gateway_ip, timeout);
    if let Err(err) = link.close() {
        warn!("Cannot close ARP handle on {}: {}", iface.name, err);
    }
    let gateway_mac = result?;

    info!(
        "Gateway {} is at {} via {} ({:?})",
        gateway_ip,
        gateway_mac,
        iface.name,
        started.elapsed()
    );

    Ok(GatewayInfo {
        gateway_ip,
        gateway_mac,
        interface: iface.name,
        interface_index: iface.index,
        interface_mac: iface.mac,
        local_ip: iface.local_ip,
    })
}
