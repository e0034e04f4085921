/// Disorder sender
///
/// Writes a fragmentation plan to the real connection. With disorder enabled,
/// selected segments go out with IP TTL 1: they die at the first router, so
/// the server never sees them and TCP retransmits them later with the normal
/// TTL. A censor on the path that reassembles by arrival order sees a hole or
/// a reordered stream instead of the ClientHello.
use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::{debug, warn};

use super::tcp_fragmentation::{DisorderPattern, FragmentationPlan};

/// TTL used for segments selected by the disorder pattern
pub const DISORDER_TTL: u8 = 1;

/// TTL restored when the configured default is zero
pub const FALLBACK_DEFAULT_TTL: u8 = 64;

/// Changes the TTL of a socket while the stream itself is borrowed for writing
pub trait TtlSwitch {
    fn set_ttl(&self, ttl: u8) -> io::Result<()>;
}

/// A stream whose outgoing TTL can be changed per segment
pub trait SocketControl {
    type Switch: TtlSwitch;

    fn ttl_switch(&self) -> io::Result<Self::Switch>;

    /// Local and peer address of the connection, needed to forge decoys
    fn endpoints(&self) -> io::Result<(SocketAddr, SocketAddr)> {
        Err(io::Error::new(io::ErrorKind::Unsupported, "connection endpoints"))
    }
}

#[cfg(unix)]
mod platform {
    use std::io;
    use std::mem::size_of;
    use std::net::SocketAddr;
    use std::os::fd::{AsRawFd, RawFd};

    use libc::{IPPROTO_IP, IPPROTO_IPV6, IP_TTL, IPV6_UNICAST_HOPS, c_int, setsockopt};
    use tokio::net::TcpStream;

    use super::{SocketControl, TtlSwitch};

    /// Raw descriptor of a live `TcpStream`; only valid while the stream is open
    #[derive(Debug, Clone, Copy)]
    pub struct SocketTtl {
        fd: RawFd,
        ipv6: bool,
    }

    impl TtlSwitch for SocketTtl {
        fn set_ttl(&self, ttl: u8) -> io::Result<()> {
            let (level, name) = if self.ipv6 {
                (IPPROTO_IPV6, IPV6_UNICAST_HOPS)
            } else {
                (IPPROTO_IP, IP_TTL)
            };
            let value: c_int = c_int::from(ttl);

            let ret = unsafe {
                setsockopt(
                    self.fd,
                    level,
                    name,
                    &value as *const c_int as *const libc::c_void,
                    size_of::<c_int>() as libc::socklen_t,
                )
            };
            if ret != 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(())
        }
    }

    impl SocketControl for TcpStream {
        type Switch = SocketTtl;

        fn ttl_switch(&self) -> io::Result<SocketTtl> {
            // v4-mapped peers on a dual-stack socket still use IP_TTL
            let ipv6 = match self.local_addr()? {
                SocketAddr::V4(_) => false,
                SocketAddr::V6(addr) => addr.ip().to_ipv4_mapped().is_none(),
            };
            Ok(SocketTtl {
                fd: self.as_raw_fd(),
                ipv6,
            })
        }

        fn endpoints(&self) -> io::Result<(SocketAddr, SocketAddr)> {
            Ok((self.local_addr()?, self.peer_addr()?))
        }
    }
}

#[cfg(not(unix))]
mod platform {
    use std::io;
    use std::net::SocketAddr;

    use tokio::net::TcpStream;

    use super::{SocketControl, TtlSwitch};

    pub struct SocketTtl;

    impl TtlSwitch for SocketTtl {
        fn set_ttl(&self, _ttl: u8) -> io::Result<()> {
            Err(io::Error::new(io::ErrorKind::Unsupported, "per-segment TTL"))
        }
    }

    impl SocketControl for TcpStream {
        type Switch = SocketTtl;

        fn ttl_switch(&self) -> io::Result<SocketTtl> {
            Err(io::Error::new(io::ErrorKind::Unsupported, "per-segment TTL"))
        }

        fn endpoints(&self) -> io::Result<(SocketAddr, SocketAddr)> {
            Ok((self.local_addr()?, self.peer_addr()?))
        }
    }
}

pub use platform::SocketTtl;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DisorderOptions {
    pub disorder: bool,
    pub default_ttl: u8,
    pub segment_delay: Duration,
}

impl Default for DisorderOptions {
    fn default() -> Self {
        Self {
            disorder: false,
            default_ttl: FALLBACK_DEFAULT_TTL,
            segment_delay: Duration::ZERO,
        }
    }
}

/// Lowers the TTL on demand and puts the default back on drop, so an early
/// return, an error or a dropped future never leaves the socket at TTL 1
struct TtlOverride<T: TtlSwitch> {
    switch: T,
    default_ttl: u8,
    lowered: bool,
}

impl<T: TtlSwitch> TtlOverride<T> {
    fn new(switch: T, default_ttl: u8) -> Self {
        Self {
            switch,
            default_ttl,
            lowered: false,
        }
    }

    fn lower(&mut self, ttl: u8) -> io::Result<()> {
        // Mark first: a half-applied change must still be undone on drop
        self.lowered = true;
        self.switch.set_ttl(ttl)
    }

    fn restore(&mut self) -> io::Result<()> {
        self.switch.set_ttl(self.default_ttl)?;
        self.lowered = false;
        Ok(())
    }
}

impl<T: TtlSwitch> Drop for TtlOverride<T> {
    fn drop(&mut self) {
        if self.lowered {
            if let Err(err) = self.switch.set_ttl(self.default_ttl) {
                warn!("Cannot restore default TTL {}: {}", self.default_ttl, err);
            }
        }
    }
}

/// Write every segment in order; returns the number of bytes written
///
/// With `options.disorder` a fresh [`DisorderPattern`] picks which segments
/// are sent at [`DISORDER_TTL`]. Failing to change the TTL is not fatal: the
/// rest of the plan is written normally.
pub async fn send_segments<S>(stream: &mut S, plan: &FragmentationPlan<'_>, options: &DisorderOptions) -> io::Result<usize>
where
    S: AsyncWrite + SocketControl + Unpin,
{
    if !options.disorder {
        return send_plain(stream, plan, options.segment_delay).await;
    }
    send_with_pattern(stream, plan, DisorderPattern::generate(), options).await
}

async fn send_plain<S>(stream: &mut S, plan: &FragmentationPlan<'_>, delay: Duration) -> io::Result<usize>
where
    S: AsyncWrite + Unpin,
{
    let mut written = 0;
    for (i, segment) in plan.iter().enumerate() {
        write_segment(stream, segment).await?;
        written += segment.len();
        pause(i, plan.len(), delay).await;
    }
    Ok(written)
}

pub(crate) async fn send_with_pattern<S>(
    stream: &mut S,
    plan: &FragmentationPlan<'_>,
    pattern: DisorderPattern,
    options: &DisorderOptions,
) -> io::Result<usize>
where
    S: AsyncWrite + SocketControl + Unpin,
{
    let default_ttl = if options.default_ttl == 0 {
        FALLBACK_DEFAULT_TTL
    } else {
        options.default_ttl
    };

    let mut ttl = match stream.ttl_switch() {
        Ok(switch) => Some(TtlOverride::new(switch, default_ttl)),
        Err(err) => {
            warn!("Cannot control socket TTL, sending without disorder: {}", err);
            None
        }
    };

    debug!("Disorder pattern {:#018x} over {} segments", pattern.bits(), plan.len());

    let mut written = 0;
    for (i, segment) in plan.iter().enumerate() {
        let flip = pattern.is_set(i);

        if flip {
            let failed = ttl.as_mut().and_then(|t| t.lower(DISORDER_TTL).err());
            if let Some(err) = failed {
                warn!("Cannot lower TTL for segment {}, disorder disabled: {}", i, err);
                ttl = None;
            }
        }

        write_segment(stream, segment).await?;
        written += segment.len();

        if flip {
            let failed = ttl.as_mut().and_then(|t| t.restore().err());
            if let Some(err) = failed {
                warn!("Cannot restore TTL after segment {}, disorder disabled: {}", i, err);
                ttl = None;
            }
        }

        pause(i, plan.len(), options.segment_delay).await;
    }

    Ok(written)
}

async fn write_segment<S: AsyncWrite + Unpin>(stream: &mut S, segment: &[u8]) -> io::Result<()> {
    stream.write_all(segment).await?;
    stream.flush().await
}

async fn pause(index: usize, total: usize, delay: Duration) {
    if !delay.is_zero() && index + 1 < total {
        tokio::time::sleep(delay).await;
    }
}
