/// In-memory link layer for tests
///
/// Inbound frames are queued through a channel and filtered with the BPF
/// interpreter, so tests exercise the same programs the kernel would run.
/// Written frames are recorded, and an optional responder can answer them
/// (an ARP reply for an ARP request, say).
use std::io;
use std::sync::Arc;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::time::Duration;

use parking_lot::Mutex;

use super::bpf::{self, BpfInstruction};
use super::{LinkLayer, LinkProvider, LinkType};

type Responder = Arc<dyn Fn(&[u8]) -> Option<Vec<u8>> + Send + Sync>;

/// Shared view of everything a [`MemoryLink`] wrote
#[derive(Clone, Default)]
pub struct Recorded(Arc<Mutex<Vec<Vec<u8>>>>);

impl Recorded {
    pub fn frames(&self) -> Vec<Vec<u8>> {
        self.0.lock().clone()
    }
}

pub struct MemoryLink {
    inbound: Receiver<Vec<u8>>,
    loopback: Sender<Vec<u8>>,
    written: Recorded,
    filter: Option<Vec<BpfInstruction>>,
    responder: Option<Responder>,
    fail_writes: bool,
    closed: bool,
}

impl MemoryLink {
    /// A link plus the sender used to inject inbound frames
    pub fn new() -> (Self, Sender<Vec<u8>>) {
        let (tx, rx) = mpsc::channel();
        let link = Self {
            inbound: rx,
            loopback: tx.clone(),
            written: Recorded::default(),
            filter: None,
            responder: None,
            fail_writes: false,
            closed: false,
        };
        (link, tx)
    }

    pub fn with_responder(mut self, responder: impl Fn(&[u8]) -> Option<Vec<u8>> + Send + Sync + 'static) -> Self {
        self.responder = Some(Arc::new(responder));
        self
    }

    pub fn failing_writes(mut self) -> Self {
        self.fail_writes = true;
        self
    }

    pub fn recorded(&self) -> Recorded {
        self.written.clone()
    }
}

impl LinkLayer for MemoryLink {
    fn read_frame(&mut self, buf: &mut [u8], timeout: Duration) -> io::Result<Option<usize>> {
        if self.closed {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "capture handle closed"));
        }

        let deadline = std::time::Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(std::time::Instant::now());
            let frame = match self.inbound.recv_timeout(remaining) {
                Ok(frame) => frame,
                Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => return Ok(None),
            };

            let accepted = match &self.filter {
                Some(program) => bpf::run(program, &frame) as usize,
                None => frame.len(),
            };
            if accepted == 0 {
                continue;
            }

            let n = accepted.min(frame.len()).min(buf.len());
            buf[..n].copy_from_slice(&frame[..n]);
            return Ok(Some(n));
        }
    }

    fn write_frame(&mut self, frame: &[u8]) -> io::Result<()> {
        if self.fail_writes {
            return Err(io::Error::new(io::ErrorKind::PermissionDenied, "write refused"));
        }
        self.written.0.lock().push(frame.to_vec());
        if let Some(reply) = self.responder.as_ref().and_then(|respond| respond(frame)) {
            let _ = self.loopback.send(reply);
        }
        Ok(())
    }

    // Queued frames are kept and filtered at read time, so tests can queue
    // before the reader installs its program
    fn set_filter(&mut self, program: &[BpfInstruction]) -> io::Result<()> {
        self.filter = Some(program.to_vec());
        Ok(())
    }

    fn link_type(&self) -> LinkType {
        LinkType::Ethernet
    }

    fn close(&mut self) -> io::Result<()> {
        self.closed = true;
        Ok(())
    }
}

/// Hands out pre-built links in order
#[derive(Default)]
pub struct MemoryProvider {
    links: Mutex<Vec<MemoryLink>>,
}

impl MemoryProvider {
    pub fn new(links: Vec<MemoryLink>) -> Self {
        Self {
            links: Mutex::new(links.into_iter().rev().collect()),
        }
    }
}

impl LinkProvider for MemoryProvider {
    fn open(&self, _interface: &str) -> io::Result<Box<dyn LinkLayer>> {
        match self.links.lock().pop() {
            Some(link) => Ok(Box::new(link)),
            None => Err(io::Error::new(io::ErrorKind::PermissionDenied, "no capture handle available")),
        }
    }
}
