/// `AF_PACKET` backend
///
/// Needs `CAP_NET_RAW`. The socket is bound to a single interface and sees
/// every ethertype; the attached BPF program does the filtering in-kernel.
use std::io::{self, Read};
use std::mem;
use std::os::fd::AsRawFd;
use std::time::Duration;

use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use tracing::debug;

use super::bpf::{self, BpfInstruction};
use super::{LinkLayer, LinkProvider, LinkType};

const ARPHRD_ETHER: u16 = 1;

/// Opens [`PacketSocket`]s
#[derive(Debug, Clone, Copy, Default)]
pub struct PacketSocketProvider;

impl LinkProvider for PacketSocketProvider {
    fn open(&self, interface: &str) -> io::Result<Box<dyn LinkLayer>> {
        Ok(Box::new(PacketSocket::open(interface)?))
    }
}

pub struct PacketSocket {
    socket: Option<Socket>,
    interface: String,
    read_timeout: Option<Duration>,
}

impl PacketSocket {
    pub fn open(interface: &str) -> io::Result<Self> {
        let ifindex = nix::net::if_::if_nametoindex(interface).map_err(io::Error::from)?;

        let eth_p_all = (libc::ETH_P_ALL as u16).to_be();
        let socket = Socket::new(Domain::PACKET, Type::RAW, Some(Protocol::from(i32::from(eth_p_all))))?;

        // SAFETY: sockaddr_ll fits in sockaddr_storage and every field we do not
        // set is valid as zero
        let address = unsafe {
            let mut storage: libc::sockaddr_storage = mem::zeroed();
            let sll = &mut *(&mut storage as *mut libc::sockaddr_storage as *mut libc::sockaddr_ll);
            sll.sll_family = libc::AF_PACKET as u16;
            sll.sll_protocol = eth_p_all;
            sll.sll_ifindex = ifindex as i32;
            SockAddr::new(storage, mem::size_of::<libc::sockaddr_ll>() as libc::socklen_t)
        };
        socket.bind(&address)?;

        debug!("Opened AF_PACKET socket on {} (ifindex {})", interface, ifindex);
        Ok(Self {
            socket: Some(socket),
            interface: interface.to_string(),
            read_timeout: None,
        })
    }

    fn socket(&self) -> io::Result<&Socket> {
        self.socket
            .as_ref()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "capture handle closed"))
    }

    fn attach(&self, program: &[BpfInstruction]) -> io::Result<()> {
        let socket = self.socket()?;
        let filters: Vec<libc::sock_filter> = program
            .iter()
            .map(|ins| libc::sock_filter {
                code: ins.code,
                jt: ins.jt,
                jf: ins.jf,
                k: ins.k,
            })
            .collect();
        let fprog = libc::sock_fprog {
            len: filters.len() as u16,
            filter: filters.as_ptr() as *mut libc::sock_filter,
        };

        let ret = unsafe {
            libc::setsockopt(
                socket.as_raw_fd(),
                libc::SOL_SOCKET,
                libc::SO_ATTACH_FILTER,
                &fprog as *const libc::sock_fprog as *const libc::c_void,
                mem::size_of::<libc::sock_fprog>() as libc::socklen_t,
            )
        };
        if ret != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Discard whatever is already queued on the socket
    fn drain(&self) -> io::Result<()> {
        let socket = self.socket()?;
        socket.set_nonblocking(true)?;
        let mut buf = [0u8; 2048];
        let result = loop {
            match (&*socket).read(&mut buf) {
                Ok(_) => continue,
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => break Ok(()),
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => break Err(err),
            }
        };
        socket.set_nonblocking(false)?;
        result
    }
}

impl LinkLayer for PacketSocket {
    fn read_frame(&mut self, buf: &mut [u8], timeout: Duration) -> io::Result<Option<usize>> {
        // SO_RCVTIMEO rejects a zero duration
        let timeout = timeout.max(Duration::from_millis(1));
        if self.read_timeout != Some(timeout) {
            self.socket()?.set_read_timeout(Some(timeout))?;
            self.read_timeout = Some(timeout);
        }

        match (&*self.socket()?).read(buf) {
            Ok(n) => Ok(Some(n)),
            Err(err) if matches!(err.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => Ok(None),
            Err(err) if err.kind() == io::ErrorKind::Interrupted => Ok(None),
            Err(err) => Err(err),
        }
    }

    fn write_frame(&mut self, frame: &[u8]) -> io::Result<()> {
        let written = self.socket()?.send(frame)?;
        if written != frame.len() {
            return Err(io::Error::new(
                io::ErrorKind::WriteZero,
                format!("short raw write on {}: {} of {} bytes", self.interface, written, frame.len()),
            ));
        }
        Ok(())
    }

    fn set_filter(&mut self, program: &[BpfInstruction]) -> io::Result<()> {
        // Frames accepted before the filter lands would otherwise leak through
        self.attach(&bpf::drop_all_filter())?;
        self.drain()?;
        self.attach(program)
    }

    fn link_type(&self) -> LinkType {
        match hardware_type(&self.interface) {
            Some(ARPHRD_ETHER) => LinkType::Ethernet,
            Some(other) => LinkType::Other(other),
            None => LinkType::Ethernet,
        }
    }

    fn close(&mut self) -> io::Result<()> {
        if self.socket.take().is_some() {
            debug!("Closed AF_PACKET socket on {}", self.interface);
        }
        Ok(())
    }
}

/// ARPHRD_* type from sysfs
fn hardware_type(interface: &str) -> Option<u16> {
    std::fs::read_to_string(format!("/sys/class/net/{interface}/type"))
        .ok()?
        .trim()
        .parse()
        .ok()
}
