/// DPI bypass entry point
///
/// Ties the pieces together for one process: the hop cache and its capture
/// thread, the gateway lookup and the decoy injector are created once by
/// [`DpiBypass::start`] and then shared by every connection through `send`.
///
/// ## Send path
/// 1. decoys, if configured, go out first on the raw link at a TTL that
///    expires just before the server
/// 2. the real ClientHello is split according to the split mode
/// 3. the segments are written to the connection, some of them at TTL 1
///    when disorder is on
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use tokio::io::AsyncWrite;
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::capture::LinkProvider;
use crate::config::{Destination, EvasionConfig, HttpsOptions};
use crate::error::{EvasionError, Result, classify_relay_error};
use crate::net::gateway::{GatewayInfo, GatewayResolver, GatewayTarget};
use crate::net::hop_tracker::{HopCache, HopEstimator, destination_key};
use crate::net::injector::PacketInjector;

use super::disorder::{SocketControl, send_segments};
use super::tcp_fragmentation::{FragmentationStats, fragment};

pub struct DpiBypass {
    config: EvasionConfig,
    hops: HopCache,
    estimator: Option<Arc<HopEstimator>>,
    injector: Option<Arc<PacketInjector>>,
}

impl DpiBypass {
    /// Set up raw link access against the auto-detected (or configured)
    /// interface
    ///
    /// When neither decoys nor disorder are enabled nothing is opened and no
    /// privilege is needed. Otherwise failing to open the link is fatal.
    pub async fn start(config: EvasionConfig, provider: Arc<dyn LinkProvider>, cancel: &CancellationToken) -> anyhow::Result<Self> {
        let target = GatewayTarget::Detect {
            probe: config.probe_addr,
            interface: config.interface.clone(),
        };
        Self::start_with_target(config, provider, target, cancel).await
    }

    pub async fn start_with_target(
        config: EvasionConfig,
        provider: Arc<dyn LinkProvider>,
        target: GatewayTarget,
        cancel: &CancellationToken,
    ) -> anyhow::Result<Self> {
        let hops = HopCache::new(config.hop_cache_ttl());

        if !config.https.needs_raw_access() {
            info!("Decoys and disorder are off, raw link access not needed");
            return Ok(Self {
                config,
                hops,
                estimator: None,
                injector: None,
            });
        }

        let resolver = GatewayResolver::new(provider.clone(), target, config.arp_timeout());
        let gateway = resolver.resolve().await.context("cannot resolve default gateway")?;

        let capture = provider
            .open(&gateway.interface)
            .with_context(|| format!("cannot open capture handle on {}", gateway.interface))?;
        let estimator = Arc::new(HopEstimator::new(hops.clone()));
        estimator.start(capture, cancel).context("cannot start hop estimator")?;

        let injection = provider
            .open(&gateway.interface)
            .with_context(|| format!("cannot open injection handle on {}", gateway.interface))?;
        let injector = Arc::new(PacketInjector::new(injection, gateway));

        Ok(Self {
            config,
            hops,
            estimator: Some(estimator),
            injector: Some(injector),
        })
    }

    pub fn config(&self) -> &EvasionConfig {
        &self.config
    }

    pub fn hop_cache(&self) -> &HopCache {
        &self.hops
    }

    pub fn gateway(&self) -> Option<&GatewayInfo> {
        self.injector.as_deref().map(PacketInjector::gateway)
    }

    /// Seed hop estimates for a destination we have not seen a SYN+ACK from
    pub fn register_destination(&self, destination: &Destination) {
        self.hops
            .register_untracked(&destination.addrs, destination.port, self.config.untracked_hops);
    }

    /// Register `destination` and dial its addresses in order, each bounded
    /// by `dial_timeout`; the first connection that succeeds wins
    pub async fn connect(&self, destination: &Destination, cancel: &CancellationToken) -> Result<TcpStream> {
        self.register_destination(destination);

        let mut last_err = EvasionError::Io(io::Error::new(
            io::ErrorKind::AddrNotAvailable,
            "destination has no addresses",
        ));
        for ip in &destination.addrs {
            let addr = SocketAddr::new(*ip, destination.port);
            let dial = tokio::time::timeout(destination.dial_timeout, TcpStream::connect(addr));

            let ret = tokio::select! {
                biased;

                _ = cancel.cancelled() => return Err(EvasionError::Cancelled),
                ret = dial => ret,
            };
            match ret {
                Ok(Ok(stream)) => {
                    if let Err(err) = stream.set_nodelay(true) {
                        warn!("Cannot set TCP_NODELAY toward {}: {}", addr, err);
                    }
                    return Ok(stream);
                }
                Ok(Err(err)) => {
                    debug!("Cannot connect to {}: {}", addr, err);
                    last_err = EvasionError::Io(err);
                }
                Err(_) => {
                    debug!("Connecting to {} timed out after {:?}", addr, destination.dial_timeout);
                    last_err = EvasionError::Timeout(destination.dial_timeout);
                }
            }
        }

        Err(last_err)
    }

    /// Write `client_hello` to `stream` with the evasion `options`
    ///
    /// Returns the number of real bytes written. A reset during the write is
    /// reported as [`EvasionError::Blocked`]. Nothing is retried: on
    /// cancellation or timeout the connection is left half-written.
    pub async fn send<S>(
        &self,
        stream: &mut S,
        client_hello: &[u8],
        options: &HttpsOptions,
        cancel: &CancellationToken,
    ) -> Result<usize>
    where
        S: AsyncWrite + SocketControl + Unpin,
    {
        if cancel.is_cancelled() {
            return Err(EvasionError::Cancelled);
        }

        if options.fake_count > 0 {
            self.send_decoys(stream, options);
        }

        let plan = fragment(client_hello, options.split_mode, usize::from(options.chunk_size));
        debug!("Split {} ClientHello: {}", options.split_mode, FragmentationStats::from_plan(&plan));

        let timeout = self.config.write_timeout();
        let disorder = options.disorder_options();
        let write = send_segments(stream, &plan, &disorder);

        tokio::select! {
            biased;

            _ = cancel.cancelled() => Err(EvasionError::Cancelled),
            ret = tokio::time::timeout(timeout, write) => match ret {
                Ok(Ok(written)) => Ok(written),
                Ok(Err(err)) => Err(classify_relay_error(err)),
                Err(_) => Err(EvasionError::Timeout(timeout)),
            },
        }
    }

    // Decoy failures never fail the connection
    fn send_decoys<S: SocketControl>(&self, stream: &S, options: &HttpsOptions) {
        let Some(injector) = &self.injector else {
            warn!("{} decoys requested but raw injection is not available", options.fake_count);
            return;
        };
        let Some(payload) = options.decoy_payload() else {
            warn!("{} decoys requested without a decoy payload", options.fake_count);
            return;
        };
        let (local, peer) = match stream.endpoints() {
            Ok(endpoints) => endpoints,
            Err(err) => {
                warn!("Cannot get connection endpoints, skipping decoys: {}", err);
                return;
            }
        };

        let ttl = self.hops.optimal_ttl(&destination_key(peer.ip(), peer.port()));
        if let Err(err) =
            injector.write_crafted_packet_with_window(local, peer, ttl, &payload, options.fake_count, options.window_size)
        {
            warn!("Cannot inject decoys toward {}: {}", peer, err);
        }
    }

    /// Stop the capture thread and close the raw handles. Joining the
    /// thread can take up to one capture read timeout, so it runs on the
    /// blocking pool.
    pub async fn shutdown(&self) {
        if let Some(estimator) = self.estimator.clone() {
            if tokio::task::spawn_blocking(move || estimator.stop()).await.is_err() {
                warn!("Hop estimator did not stop cleanly");
            }
        }
        if let Some(injector) = &self.injector {
            injector.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::memory::{MemoryLink, MemoryProvider, Recorded};
    use crate::net::interface::InterfaceInfo;
    use crate::protocols::packet::arp::ARP_OP_REPLY;
    use crate::protocols::packet::{ArpPacket, MacAddr, parse_ipv4_tcp};
    use crate::protocols::tls::ClientHelloBuilder;
    use crate::tunnel::transport::disorder::TtlSwitch;
    use crate::tunnel::transport::tcp_fragmentation::SplitMode;
    use std::io;
    use std::net::{Ipv4Addr, SocketAddr};
    use std::pin::Pin;
    use std::task::{Context, Poll};
    use std::time::Duration;
    use tokio::io::AsyncReadExt;
    use tokio::net::{TcpListener, TcpStream};

    const LOCAL_MAC: MacAddr = MacAddr::new([0x02, 0, 0, 0, 0, 0x10]);
    const GATEWAY_MAC: MacAddr = MacAddr::new([0x00, 0x1a, 0x2b, 0x3c, 0x4d, 0x5e]);
    const LOCAL_IP: Ipv4Addr = Ipv4Addr::new(192, 168, 1, 10);
    const GATEWAY_IP: Ipv4Addr = Ipv4Addr::new(192, 168, 1, 1);

    fn fixed_target() -> GatewayTarget {
        GatewayTarget::Fixed {
            interface: InterfaceInfo {
                name: "test0".to_string(),
                index: 2,
                mac: LOCAL_MAC,
                local_ip: LOCAL_IP,
            },
            gateway_ip: GATEWAY_IP,
        }
    }

    /// ARP link, capture link and injection link, in the order `start` opens them
    fn raw_links() -> (MemoryProvider, Recorded) {
        let (arp, _) = MemoryLink::new();
        let arp = arp.with_responder(|frame| {
            ArpPacket::parse_frame(frame)?;
            let reply = ArpPacket {
                operation: ARP_OP_REPLY,
                sender_mac: GATEWAY_MAC,
                sender_ip: GATEWAY_IP,
                target_mac: LOCAL_MAC,
                target_ip: LOCAL_IP,
            };
            Some(reply.to_frame().to_vec())
        });
        let (capture, _) = MemoryLink::new();
        let (injection, _) = MemoryLink::new();
        let recorded = injection.recorded();
        (MemoryProvider::new(vec![arp, capture, injection]), recorded)
    }

    async fn connected_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        (client, server)
    }

    async fn receive(mut server: TcpStream, len: usize) -> Vec<u8> {
        let mut buf = vec![0u8; len];
        server.read_exact(&mut buf).await.unwrap();
        buf
    }

    struct NoopSwitch;

    impl TtlSwitch for NoopSwitch {
        fn set_ttl(&self, _ttl: u8) -> io::Result<()> {
            Ok(())
        }
    }

    /// Fails every write with `kind`, or never completes when `kind` is None
    struct BrokenStream(Option<io::ErrorKind>);

    impl SocketControl for BrokenStream {
        type Switch = NoopSwitch;

        fn ttl_switch(&self) -> io::Result<NoopSwitch> {
            Ok(NoopSwitch)
        }
    }

    impl AsyncWrite for BrokenStream {
        fn poll_write(self: Pin<&mut Self>, _cx: &mut Context<'_>, _buf: &[u8]) -> Poll<io::Result<usize>> {
            match self.0 {
                Some(kind) => Poll::Ready(Err(io::Error::from(kind))),
                None => Poll::Pending,
            }
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    #[tokio::test]
    async fn test_start_without_raw_access() {
        // No links at all: opening one would fail the start
        let provider = Arc::new(MemoryProvider::new(vec![]));
        let cancel = CancellationToken::new();
        let bypass = DpiBypass::start_with_target(EvasionConfig::disabled(), provider, fixed_target(), &cancel)
            .await
            .unwrap();

        assert!(bypass.gateway().is_none());

        let hello = ClientHelloBuilder::new("www.w3.org").build().unwrap();
        let options = HttpsOptions {
            split_mode: SplitMode::Sni,
            ..HttpsOptions::default()
        };
        let (mut client, server) = connected_pair().await;

        let written = bypass.send(&mut client, &hello, &options, &cancel).await.unwrap();
        assert_eq!(written, hello.len());
        assert_eq!(receive(server, hello.len()).await, hello);
    }

    #[tokio::test]
    async fn test_start_fails_without_link() {
        let provider = Arc::new(MemoryProvider::new(vec![]));
        let cancel = CancellationToken::new();
        let result = DpiBypass::start_with_target(EvasionConfig::aggressive(), provider, fixed_target(), &cancel).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_send_injects_decoys_at_optimal_ttl() {
        let (provider, recorded) = raw_links();
        let cancel = CancellationToken::new();
        let bypass = DpiBypass::start_with_target(EvasionConfig::aggressive(), Arc::new(provider), fixed_target(), &cancel)
            .await
            .unwrap();
        assert_eq!(bypass.gateway().map(|g| g.gateway_mac), Some(GATEWAY_MAC));

        let (mut client, server) = connected_pair().await;
        let peer = client.peer_addr().unwrap();
        bypass.register_destination(&Destination {
            addrs: vec![peer.ip()],
            port: peer.port(),
            dial_timeout: Duration::from_secs(1),
        });

        let hello = ClientHelloBuilder::new("blocked.example").build().unwrap();
        let options = HttpsOptions {
            fake_packet: b"not the real hello".to_vec(),
            ..HttpsOptions::aggressive()
        };
        let written = bypass.send(&mut client, &hello, &options, &cancel).await.unwrap();
        assert_eq!(written, hello.len());
        assert_eq!(receive(server, hello.len()).await, hello);

        let frames = recorded.frames();
        assert_eq!(frames.len(), usize::from(options.fake_count));
        for frame in &frames {
            let info = parse_ipv4_tcp(frame).unwrap();
            // 8 untracked hops
            assert_eq!(info.ttl, 7);
            assert_eq!(SocketAddr::V4(info.destination), peer);
            assert_eq!(SocketAddr::V4(info.source), client.local_addr().unwrap());
            assert!(frame.ends_with(b"not the real hello"));
        }

        bypass.shutdown().await;
    }

    #[tokio::test]
    async fn test_unregistered_destination_uses_254() {
        let (provider, recorded) = raw_links();
        let cancel = CancellationToken::new();
        let bypass = DpiBypass::start_with_target(EvasionConfig::aggressive(), Arc::new(provider), fixed_target(), &cancel)
            .await
            .unwrap();

        let (mut client, _server) = connected_pair().await;
        let options = HttpsOptions {
            fake_count: 1,
            fake_packet: b"decoy".to_vec(),
            ..HttpsOptions::default()
        };
        bypass.send(&mut client, b"hello", &options, &cancel).await.unwrap();

        let frames = recorded.frames();
        assert_eq!(frames.len(), 1);
        assert_eq!(parse_ipv4_tcp(&frames[0]).unwrap().ttl, 254);
        bypass.shutdown().await;
    }

    #[tokio::test]
    async fn test_decoys_without_injector_still_send() {
        let provider = Arc::new(MemoryProvider::new(vec![]));
        let cancel = CancellationToken::new();
        let bypass = DpiBypass::start_with_target(EvasionConfig::disabled(), provider, fixed_target(), &cancel)
            .await
            .unwrap();

        let (mut client, server) = connected_pair().await;
        let written = bypass.send(&mut client, b"hello", &HttpsOptions::aggressive(), &cancel).await.unwrap();
        assert_eq!(written, 5);
        assert_eq!(receive(server, 5).await, b"hello");
    }

    #[tokio::test]
    async fn test_reset_is_blocked() {
        let bypass = DpiBypass::start_with_target(
            EvasionConfig::disabled(),
            Arc::new(MemoryProvider::new(vec![])),
            fixed_target(),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        let mut stream = BrokenStream(Some(io::ErrorKind::ConnectionReset));
        let err = bypass
            .send(&mut stream, b"hello", &HttpsOptions::default(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(err.is_blocked());

        let mut stream = BrokenStream(Some(io::ErrorKind::BrokenPipe));
        let err = bypass
            .send(&mut stream, b"hello", &HttpsOptions::default(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, EvasionError::Io(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_write_times_out() {
        let bypass = DpiBypass::start_with_target(
            EvasionConfig::disabled(),
            Arc::new(MemoryProvider::new(vec![])),
            fixed_target(),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        let mut stream = BrokenStream(None);
        let err = bypass
            .send(&mut stream, b"hello", &HttpsOptions::default(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, EvasionError::Timeout(t) if t == Duration::from_secs(10)));
    }

    #[tokio::test]
    async fn test_cancelled_send() {
        let bypass = DpiBypass::start_with_target(
            EvasionConfig::disabled(),
            Arc::new(MemoryProvider::new(vec![])),
            fixed_target(),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        let cancel = CancellationToken::new();
        cancel.cancel();
        let mut stream = BrokenStream(None);
        let err = bypass
            .send(&mut stream, b"hello", &HttpsOptions::default(), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, EvasionError::Cancelled));

        // Cancelled while stuck in the write
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });
        let err = bypass
            .send(&mut stream, b"hello", &HttpsOptions::default(), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, EvasionError::Cancelled));
    }

    #[tokio::test]
    async fn test_parent_cancellation_stops_estimator() {
        let (provider, _recorded) = raw_links();
        let cancel = CancellationToken::new();
        let bypass = DpiBypass::start_with_target(EvasionConfig::aggressive(), Arc::new(provider), fixed_target(), &cancel)
            .await
            .unwrap();

        let estimator = bypass.estimator.as_ref().unwrap();
        assert!(estimator.is_running());

        cancel.cancel();
        let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
        while estimator.is_running() && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(!estimator.is_running());
    }

    #[tokio::test]
    async fn test_shutdown_stops_estimator() {
        let (provider, _recorded) = raw_links();
        let bypass = DpiBypass::start_with_target(
            EvasionConfig::aggressive(),
            Arc::new(provider),
            fixed_target(),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        let estimator = bypass.estimator.clone().unwrap();
        assert!(estimator.is_running());

        bypass.shutdown().await;
        assert!(!estimator.is_running());
    }

    #[tokio::test]
    async fn test_connect_registers_and_dials() {
        let bypass = DpiBypass::start_with_target(
            EvasionConfig::disabled(),
            Arc::new(MemoryProvider::new(vec![])),
            fixed_target(),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        // Nothing listens on the first address, the second one answers
        let destination = Destination {
            addrs: vec!["127.0.0.2".parse().unwrap(), "127.0.0.1".parse().unwrap()],
            port,
            dial_timeout: Duration::from_secs(2),
        };

        let stream = bypass.connect(&destination, &CancellationToken::new()).await.unwrap();
        assert_eq!(stream.peer_addr().unwrap(), listener.local_addr().unwrap());
        for ip in &destination.addrs {
            assert_eq!(bypass.hop_cache().get(&destination_key(*ip, port)), Some(8));
        }
    }

    #[tokio::test]
    async fn test_connect_without_addresses_fails() {
        let bypass = DpiBypass::start_with_target(
            EvasionConfig::disabled(),
            Arc::new(MemoryProvider::new(vec![])),
            fixed_target(),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        let destination = Destination {
            addrs: vec![],
            port: 443,
            dial_timeout: Duration::from_secs(1),
        };
        let err = bypass.connect(&destination, &CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, EvasionError::Io(_)));

        let cancel = CancellationToken::new();
        cancel.cancel();
        let destination = Destination {
            addrs: vec!["127.0.0.1".parse().unwrap()],
            ..destination
        };
        let err = bypass.connect(&destination, &cancel).await.unwrap_err();
        assert!(matches!(err, EvasionError::Cancelled));
    }
}
