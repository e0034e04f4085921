/// Passive hop-count estimation
///
/// Every SYN+ACK a server sends back carries its IP TTL as seen on arrival.
/// Servers start from one of a few well-known initial values (64 for Linux,
/// 128 for Windows, 255 for network gear), so the distance is the gap to the
/// nearest initial value at or above the observed one. Decoys are then sent
/// with a TTL one short of that distance: they pass the censor sitting on the
/// path but expire before the server.
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::capture::{LinkLayer, bpf};
use crate::error::{EvasionError, Result};
use crate::protocols::packet::{TcpFlags, parse_ipv4_tcp};

pub const DEFAULT_HOP_CACHE_TTL: Duration = Duration::from_secs(180);

/// Returned for destinations never seen
pub const UNKNOWN_HOPS: u8 = 255;

const INITIAL_TTLS: [u8; 3] = [64, 128, 255];
const READ_TIMEOUT: Duration = Duration::from_millis(500);
const CLEANUP_INTERVAL: Duration = Duration::from_secs(60);
const SNAPLEN: usize = 65536;

/// Hops between us and a sender whose packet arrived with `observed_ttl`
pub fn estimate_hops(observed_ttl: u8) -> u8 {
    let initial = INITIAL_TTLS
        .iter()
        .copied()
        .find(|initial| *initial >= observed_ttl)
        .unwrap_or(u8::MAX);
    initial - observed_ttl
}

/// Cache key for a destination, `ip:port`. IPv4-mapped IPv6 addresses
/// share the key of the plain IPv4 address.
pub fn destination_key(ip: IpAddr, port: u16) -> String {
    format!("{}:{}", ip.to_canonical(), port)
}

#[derive(Debug, Clone)]
struct HopEntry {
    hops: u8,
    recorded_at: Instant,
    ttl: Duration,
}

impl HopEntry {
    fn is_valid(&self) -> bool {
        self.recorded_at.elapsed() < self.ttl
    }
}

/// Destination → estimated hop count, with per-entry expiry
///
/// Written by the estimator thread, read by every connection worker.
#[derive(Clone)]
pub struct HopCache {
    entries: Arc<RwLock<HashMap<String, HopEntry>>>,
    ttl: Duration,
}

impl HopCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: Arc::new(RwLock::new(HashMap::new())),
            ttl,
        }
    }

    /// Insert or refresh
    pub fn record(&self, key: impl Into<String>, hops: u8) {
        let entry = HopEntry {
            hops,
            recorded_at: Instant::now(),
            ttl: self.ttl,
        };
        self.entries.write().insert(key.into(), entry);
    }

    /// Insert unless a live entry already exists; returns whether it inserted
    pub fn insert_if_absent(&self, key: impl Into<String>, hops: u8) -> bool {
        let mut entries = self.entries.write();
        let key = key.into();
        if entries.get(&key).is_some_and(HopEntry::is_valid) {
            return false;
        }
        entries.insert(
            key,
            HopEntry {
                hops,
                recorded_at: Instant::now(),
                ttl: self.ttl,
            },
        );
        true
    }

    pub fn get(&self, key: &str) -> Option<u8> {
        let entries = self.entries.read();
        entries.get(key).filter(|e| e.is_valid()).map(|e| e.hops)
    }

    /// TTL for a decoy toward `key`: one less than the hop count, never below 1.
    /// Unknown destinations get 254.
    pub fn optimal_ttl(&self, key: &str) -> u8 {
        let hops = self.get(key).unwrap_or(UNKNOWN_HOPS);
        hops.max(2) - 1
    }

    /// Seed a default for destinations whose handshake we may never see
    pub fn register_untracked(&self, addrs: &[IpAddr], port: u16, default_hops: u8) {
        for addr in addrs {
            let key = destination_key(*addr, port);
            if self.insert_if_absent(key.as_str(), default_hops) {
                debug!("Registered untracked destination {} with {} hops", key, default_hops);
            }
        }
    }

    pub fn cleanup_expired(&self) {
        let mut entries = self.entries.write();
        entries.retain(|_, entry| entry.is_valid());
    }

    pub fn stats(&self) -> HopCacheStats {
        let entries = self.entries.read();
        let total = entries.len();
        let expired = entries.values().filter(|e| !e.is_valid()).count();

        HopCacheStats {
            total_entries: total,
            valid_entries: total - expired,
            expired_entries: expired,
        }
    }
}

impl Default for HopCache {
    fn default() -> Self {
        Self::new(DEFAULT_HOP_CACHE_TTL)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HopCacheStats {
    pub total_entries: usize,
    pub valid_entries: usize,
    pub expired_entries: usize,
}

/// Record the sender of a captured SYN+ACK; returns the key and hop count
pub fn observe_frame(cache: &HopCache, frame: &[u8]) -> Option<(SocketAddr, u8)> {
    let segment = parse_ipv4_tcp(frame)?;
    if segment.fragmented || !segment.flags.contains(TcpFlags::SYN_ACK) {
        return None;
    }

    let source = SocketAddr::V4(segment.source);
    let hops = estimate_hops(segment.ttl);
    cache.record(destination_key(source.ip(), source.port()), hops);
    Some((source, hops))
}

enum EstimatorState {
    Idle,
    Capturing {
        cancel: CancellationToken,
        worker: JoinHandle<()>,
    },
    Stopped,
}

/// Owns the background capture thread feeding a [`HopCache`]
///
/// Idle → `start` → capturing → `stop` (or cancellation of the parent token)
/// → stopped. A stopped estimator cannot be restarted.
pub struct HopEstimator {
    cache: HopCache,
    state: Mutex<EstimatorState>,
}

impl HopEstimator {
    pub fn new(cache: HopCache) -> Self {
        Self {
            cache,
            state: Mutex::new(EstimatorState::Idle),
        }
    }

    pub fn cache(&self) -> &HopCache {
        &self.cache
    }

    pub fn is_running(&self) -> bool {
        match &*self.state.lock() {
            EstimatorState::Capturing { worker, .. } => !worker.is_finished(),
            _ => false,
        }
    }

    /// Install the SYN+ACK filter on `link` and start reading from it on a
    /// dedicated thread
    pub fn start(&self, mut link: Box<dyn LinkLayer>, cancel: &CancellationToken) -> Result<()> {
        let mut state = self.state.lock();
        if !matches!(*state, EstimatorState::Idle) {
            return Err(EvasionError::Protocol("hop estimator already started".to_string()));
        }

        link.set_filter(&bpf::syn_ack_filter())?;

        let token = cancel.child_token();
        let cache = self.cache.clone();
        let loop_token = token.clone();
        let worker = std::thread::Builder::new()
            .name("hop-estimator".to_string())
            .spawn(move || capture_loop(link, cache, loop_token))?;

        info!("Hop estimator started");
        *state = EstimatorState::Capturing { cancel: token, worker };
        Ok(())
    }

    /// Signal the worker and wait for it; it notices within one read timeout
    pub fn stop(&self) {
        let previous = std::mem::replace(&mut *self.state.lock(), EstimatorState::Stopped);
        if let EstimatorState::Capturing { cancel, worker } = previous {
            cancel.cancel();
            if worker.join().is_err() {
                error!("Hop estimator thread panicked");
            }
        }
    }
}

impl Drop for HopEstimator {
    fn drop(&mut self) {
        if let EstimatorState::Capturing { cancel, .. } = &*self.state.lock() {
            cancel.cancel();
        }
    }
}

fn capture_loop(mut link: Box<dyn LinkLayer>, cache: HopCache, cancel: CancellationToken) {
    let mut buf = vec![0u8; SNAPLEN];
    let mut last_cleanup = Instant::now();

    while !cancel.is_cancelled() {
        match link.read_frame(&mut buf, READ_TIMEOUT) {
            Ok(Some(n)) => {
                if let Some((source, hops)) = observe_frame(&cache, &buf[..n]) {
                    debug!("SYN+ACK from {}: {} hops", source, hops);
                }
            }
            Ok(None) => {}
            Err(err) => {
                error!("Hop estimator capture failed: {}", err);
                break;
            }
        }

        if last_cleanup.elapsed() >= CLEANUP_INTERVAL {
            cache.cleanup_expired();
            last_cleanup = Instant::now();
        }
    }

    if let Err(err) = link.close() {
        warn!("Cannot close capture handle: {}", err);
    }
    info!("Hop estimator stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::memory::MemoryLink;
    use crate::protocols::packet::frame::{ETHERTYPE_IPV4, IPPROTO_TCP};
    use crate::protocols::packet::{CraftedFrame, EthernetHeader, Ipv4Header, MacAddr, TcpHeader};
    use bytes::Bytes;
    use std::net::Ipv4Addr;

    fn reply_frame(source: Ipv4Addr, port: u16, ttl: u8, flags: TcpFlags) -> Vec<u8> {
        CraftedFrame {
            ethernet: EthernetHeader {
                destination: MacAddr::new([2, 0, 0, 0, 0, 1]),
                source: MacAddr::new([2, 0, 0, 0, 0, 2]),
                ethertype: ETHERTYPE_IPV4,
            },
            ip: Ipv4Header {
                source,
                destination: Ipv4Addr::new(192, 168, 1, 10),
                ttl,
                identification: 1,
                dont_fragment: true,
                protocol: IPPROTO_TCP,
            },
            tcp: TcpHeader {
                source_port: port,
                destination_port: 50123,
                sequence: 100,
                acknowledgement: 200,
                flags,
                window: 65535,
            },
            payload: Bytes::new(),
        }
        .serialize()
        .to_vec()
    }

    #[test]
    fn test_estimate_hops() {
        assert_eq!(estimate_hops(60), 4);
        assert_eq!(estimate_hops(120), 8);
        assert_eq!(estimate_hops(250), 5);
        assert_eq!(estimate_hops(64), 0);
        assert_eq!(estimate_hops(65), 63);
        assert_eq!(estimate_hops(255), 0);
    }

    #[test]
    fn test_optimal_ttl() {
        let cache = HopCache::default();
        assert_eq!(cache.optimal_ttl("1.2.3.4:443"), 254);

        cache.record("1.2.3.4:443", 8);
        assert_eq!(cache.optimal_ttl("1.2.3.4:443"), 7);

        // never below 1
        cache.record("1.2.3.4:443", 0);
        assert_eq!(cache.optimal_ttl("1.2.3.4:443"), 1);
        cache.record("1.2.3.4:443", 1);
        assert_eq!(cache.optimal_ttl("1.2.3.4:443"), 1);
    }

    #[test]
    fn test_mapped_destination_shares_ipv4_key() {
        let mapped: IpAddr = "::ffff:1.2.3.4".parse().unwrap();
        let plain: IpAddr = "1.2.3.4".parse().unwrap();
        assert_eq!(destination_key(mapped, 443), "1.2.3.4:443");
        assert_eq!(destination_key(mapped, 443), destination_key(plain, 443));

        let cache = HopCache::default();
        cache.record(&destination_key(plain, 443), 9);
        assert_eq!(cache.get(&destination_key(mapped, 443)), Some(9));
    }

    #[test]
    fn test_register_untracked_does_not_overwrite() {
        let cache = HopCache::default();
        let known: IpAddr = "1.2.3.4".parse().unwrap();
        let unknown: IpAddr = "5.6.7.8".parse().unwrap();
        cache.record(destination_key(known, 443), 12);

        cache.register_untracked(&[known, unknown], 443, 8);

        assert_eq!(cache.get("1.2.3.4:443"), Some(12));
        assert_eq!(cache.get("5.6.7.8:443"), Some(8));
        assert_eq!(cache.get("5.6.7.8:80"), None);
    }

    #[test]
    fn test_expired_entries_are_invisible() {
        let cache = HopCache::new(Duration::from_secs(180));
        cache.record("1.2.3.4:443", 10);
        cache.record("5.6.7.8:443", 10);

        {
            let mut entries = cache.entries.write();
            if let Some(entry) = entries.get_mut("1.2.3.4:443") {
                entry.recorded_at = Instant::now() - Duration::from_secs(400);
            }
        }

        assert_eq!(cache.get("1.2.3.4:443"), None);
        assert_eq!(cache.optimal_ttl("1.2.3.4:443"), 254);
        // an expired entry does not block insert_if_absent
        assert!(cache.insert_if_absent("1.2.3.4:443", 3));
        assert!(!cache.insert_if_absent("5.6.7.8:443", 3));
    }

    #[test]
    fn test_cache_stats_and_cleanup() {
        let cache = HopCache::default();
        cache.record("a:1", 1);
        cache.record("b:1", 1);
        {
            let mut entries = cache.entries.write();
            if let Some(entry) = entries.get_mut("a:1") {
                entry.recorded_at = Instant::now() - Duration::from_secs(400);
            }
        }

        let stats = cache.stats();
        assert_eq!(stats.total_entries, 2);
        assert_eq!(stats.valid_entries, 1);
        assert_eq!(stats.expired_entries, 1);

        cache.cleanup_expired();
        assert_eq!(cache.stats().total_entries, 1);
    }

    #[test]
    fn test_observe_frame() {
        let cache = HopCache::default();
        let frame = reply_frame(Ipv4Addr::new(93, 184, 216, 34), 443, 52, TcpFlags::SYN_ACK);

        let (source, hops) = observe_frame(&cache, &frame).unwrap();
        assert_eq!(source, "93.184.216.34:443".parse().unwrap());
        assert_eq!(hops, 12);
        assert_eq!(cache.optimal_ttl("93.184.216.34:443"), 11);

        let data = reply_frame(Ipv4Addr::new(1, 1, 1, 1), 443, 52, TcpFlags::PSH_ACK);
        assert!(observe_frame(&cache, &data).is_none());
        assert_eq!(cache.get("1.1.1.1:443"), None);
    }

    #[test]
    fn test_estimator_lifecycle() {
        let (link, tx) = MemoryLink::new();
        tx.send(reply_frame(Ipv4Addr::new(10, 0, 0, 1), 443, 120, TcpFlags::SYN_ACK)).unwrap();
        tx.send(reply_frame(Ipv4Addr::new(10, 0, 0, 2), 443, 60, TcpFlags(TcpFlags::SYN))).unwrap();

        let estimator = HopEstimator::new(HopCache::default());
        let cancel = CancellationToken::new();
        estimator.start(Box::new(link), &cancel).unwrap();
        assert!(estimator.is_running());
        assert!(estimator.start(Box::new(MemoryLink::new().0), &cancel).is_err());

        let deadline = Instant::now() + Duration::from_secs(5);
        while estimator.cache().get("10.0.0.1:443").is_none() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(estimator.cache().get("10.0.0.1:443"), Some(8));
        assert_eq!(estimator.cache().get("10.0.0.2:443"), None);

        let started = Instant::now();
        estimator.stop();
        assert!(started.elapsed() < READ_TIMEOUT + Duration::from_millis(500));
        assert!(!estimator.is_running());
    }

    #[test]
    fn test_parent_cancellation_stops_worker() {
        let (link, _tx) = MemoryLink::new();
        let estimator = HopEstimator::new(HopCache::default());
        let cancel = CancellationToken::new();
        estimator.start(Box::new(link), &cancel).unwrap();

        cancel.cancel();
        let deadline = Instant::now() + Duration::from_secs(2);
        while estimator.is_running() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
        assert!(!estimator.is_running());
    }
}
