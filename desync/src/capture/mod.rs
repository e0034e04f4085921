/// Link-layer capture and injection
///
/// Everything that touches raw frames goes through [`LinkLayer`]: the hop
/// estimator reads SYN+ACK replies from it, the gateway resolver runs its ARP
/// exchange over it and the packet injector writes decoys to it. The concrete
/// backend is picked at build time; on Linux it is an `AF_PACKET` socket.
use std::fmt;
use std::io;
use std::time::Duration;

pub mod bpf;
#[cfg(target_os = "linux")]
pub mod linux;
#[cfg(test)]
pub(crate) mod memory;

pub use bpf::BpfInstruction;

/// Link-layer framing of a capture handle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkType {
    Ethernet,
    Other(u16),
}

impl fmt::Display for LinkType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ethernet => f.write_str("ethernet"),
            Self::Other(arphrd) => write!(f, "arphrd {arphrd}"),
        }
    }
}

/// An open capture/injection handle bound to one interface
pub trait LinkLayer: Send {
    /// Wait up to `timeout` for one frame. `Ok(None)` means the timeout elapsed.
    fn read_frame(&mut self, buf: &mut [u8], timeout: Duration) -> io::Result<Option<usize>>;

    /// Write one complete frame, link-layer header included
    fn write_frame(&mut self, frame: &[u8]) -> io::Result<()>;

    /// Replace the kernel filter; frames queued under the previous filter are dropped
    fn set_filter(&mut self, program: &[BpfInstruction]) -> io::Result<()>;

    fn link_type(&self) -> LinkType;

    fn close(&mut self) -> io::Result<()>;
}

/// Opens [`LinkLayer`] handles by interface name
///
/// Several handles are opened over the life of the process (one for the hop
/// estimator, one for ARP, one for injection), so this is a factory rather
/// than a single handle.
pub trait LinkProvider: Send + Sync {
    fn open(&self, interface: &str) -> io::Result<Box<dyn LinkLayer>>;
}

/// Raw socket provider for this platform
#[cfg(target_os = "linux")]
pub fn system_provider() -> io::Result<std::sync::Arc<dyn LinkProvider>> {
    Ok(std::sync::Arc::new(linux::PacketSocketProvider))
}

#[cfg(not(target_os = "linux"))]
pub fn system_provider() -> io::Result<std::sync::Arc<dyn LinkProvider>> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "raw link-layer access is only implemented for Linux",
    ))
}
