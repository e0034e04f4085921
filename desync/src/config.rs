/// Evasion configuration
///
/// `HttpsOptions` is the per-destination policy the proxy hands to every
/// `send`; `EvasionConfig` carries it as the default together with the
/// process-wide knobs, and is what gets loaded from YAML.
use std::borrow::Cow;
use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, anyhow};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::net::hop_tracker::DEFAULT_HOP_CACHE_TTL;
use crate::net::interface::DEFAULT_PROBE_ADDR;
use crate::protocols::tls::{ClientHelloBuilder, MAX_HOST_NAME_LEN};
use crate::tunnel::transport::disorder::{DisorderOptions, FALLBACK_DEFAULT_TTL};
use crate::tunnel::transport::tcp_fragmentation::SplitMode;

/// Per-connection evasion policy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpsOptions {
    /// Send TTL-1 segments picked by a random pattern
    pub disorder: bool,

    /// Number of decoys injected ahead of the real ClientHello
    pub fake_count: u8,

    /// Raw decoy payload, hex encoded
    #[serde(with = "hex_bytes")]
    pub fake_packet: Vec<u8>,

    /// Host for a generated decoy ClientHello when `fake_packet` is empty
    pub fake_sni: Option<String>,

    pub split_mode: SplitMode,

    /// Segment size for `split_mode: chunk`
    pub chunk_size: u8,

    /// TTL the socket is returned to after a disorder segment
    pub default_ttl: u8,

    /// Decoy TCP window in units of 256 bytes, 0 for a random common window
    pub window_size: u8,

    /// Pause between real segments
    pub segment_delay_ms: u64,
}

impl Default for HttpsOptions {
    fn default() -> Self {
        Self {
            disorder: false,
            fake_count: 0,
            fake_packet: Vec::new(),
            fake_sni: None,
            split_mode: SplitMode::None,
            chunk_size: 0,
            default_ttl: FALLBACK_DEFAULT_TTL,
            window_size: 0,
            segment_delay_ms: 0,
        }
    }
}

impl HttpsOptions {
    /// Leave the ClientHello alone
    pub fn disabled() -> Self {
        Self::default()
    }

    /// Everything on: decoys, SNI split and disorder
    pub fn aggressive() -> Self {
        Self {
            disorder: true,
            fake_count: 3,
            fake_packet: Vec::new(),
            fake_sni: Some("www.w3.org".to_string()),
            split_mode: SplitMode::Sni,
            chunk_size: 0,
            default_ttl: FALLBACK_DEFAULT_TTL,
            window_size: 0,
            segment_delay_ms: 0,
        }
    }

    /// Whether any part of this policy needs the raw link layer
    pub fn needs_raw_access(&self) -> bool {
        self.fake_count > 0 || self.disorder
    }

    pub fn segment_delay(&self) -> Duration {
        Duration::from_millis(self.segment_delay_ms)
    }

    pub fn disorder_options(&self) -> DisorderOptions {
        DisorderOptions {
            disorder: self.disorder,
            default_ttl: self.default_ttl,
            segment_delay: self.segment_delay(),
        }
    }

    /// What the decoys carry: `fake_packet` if set, else a generated
    /// ClientHello for `fake_sni`, else nothing (no decoys are sent)
    pub fn decoy_payload(&self) -> Option<Cow<'_, [u8]>> {
        if !self.fake_packet.is_empty() {
            return Some(Cow::Borrowed(&self.fake_packet));
        }
        let host = self.fake_sni.as_deref()?;
        match ClientHelloBuilder::new(host).build() {
            Ok(hello) => Some(Cow::Owned(hello)),
            Err(err) => {
                warn!("Cannot build decoy ClientHello for {}: {}", host, err);
                None
            }
        }
    }
}

/// Process-wide configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EvasionConfig {
    /// Default policy for destinations without an override
    pub https: HttpsOptions,

    pub hop_cache_ttl_secs: u64,

    /// Hop count assumed for destinations whose SYN+ACK was never seen
    pub untracked_hops: u8,

    pub arp_timeout_secs: u64,

    /// Upper bound for writing the whole ClientHello
    pub write_timeout_secs: u64,

    /// Address used to find the outbound interface; nothing is sent to it
    pub probe_addr: SocketAddr,

    /// Skip detection and use this interface
    pub interface: Option<String>,
}

impl Default for EvasionConfig {
    fn default() -> Self {
        Self {
            https: HttpsOptions::default(),
            hop_cache_ttl_secs: DEFAULT_HOP_CACHE_TTL.as_secs(),
            untracked_hops: 8,
            arp_timeout_secs: 3,
            write_timeout_secs: 10,
            probe_addr: DEFAULT_PROBE_ADDR,
            interface: None,
        }
    }
}

impl EvasionConfig {
    pub fn disabled() -> Self {
        Self::default()
    }

    pub fn aggressive() -> Self {
        Self {
            https: HttpsOptions::aggressive(),
            ..Self::default()
        }
    }

    /// Load configuration from a YAML file; a missing file gives the defaults
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        match std::fs::read_to_string(path) {
            Ok(contents) => Self::from_yaml(&contents).with_context(|| format!("invalid configuration in {}", path.display())),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                warn!("Configuration file not found at '{}', using default configuration", path.display());
                Ok(Self::default())
            }
            Err(err) => Err(err).with_context(|| format!("cannot read configuration file {}", path.display())),
        }
    }

    pub fn from_yaml(contents: &str) -> anyhow::Result<Self> {
        let config: Self = serde_yaml::from_str(contents).context("Failed to parse YAML configuration")?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.https.split_mode == SplitMode::Chunk && self.https.chunk_size == 0 {
            return Err(anyhow!("split_mode chunk needs a non-zero chunk_size"));
        }
        if let Some(host) = &self.https.fake_sni {
            if host.is_empty() || host.len() > MAX_HOST_NAME_LEN {
                return Err(anyhow!("fake_sni must be 1 to {} bytes long", MAX_HOST_NAME_LEN));
            }
        }
        if self.https.fake_count > 0 && self.https.decoy_payload().is_none() {
            return Err(anyhow!("fake_count is set but neither fake_packet nor fake_sni is"));
        }
        if self.write_timeout_secs == 0 {
            return Err(anyhow!("write_timeout_secs must be positive"));
        }
        if self.arp_timeout_secs == 0 {
            return Err(anyhow!("arp_timeout_secs must be positive"));
        }
        Ok(())
    }

    pub fn hop_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.hop_cache_ttl_secs)
    }

    pub fn arp_timeout(&self) -> Duration {
        Duration::from_secs(self.arp_timeout_secs)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_secs(self.write_timeout_secs)
    }
}

/// Where a proxied connection goes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Destination {
    pub addrs: Vec<IpAddr>,
    pub port: u16,
    pub dial_timeout: Duration,
}

mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer, de::Error};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(bytes))
    }

    /// Whitespace between digits is allowed, e.g. "1603 0100"
    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let digits: String = String::deserialize(deserializer)?
            .chars()
            .filter(|c| !c.is_whitespace())
            .collect();
        hex::decode(digits).map_err(D::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocols::tls::locate_sni;

    #[test]
    fn test_defaults_from_empty_yaml() {
        let config = EvasionConfig::from_yaml("{}").unwrap();
        assert_eq!(config, EvasionConfig::default());
        assert_eq!(config.hop_cache_ttl(), Duration::from_secs(180));
        assert_eq!(config.untracked_hops, 8);
        assert!(!config.https.needs_raw_access());
    }

    #[test]
    fn test_parse_full_yaml() {
        let yaml = r#"
https:
  disorder: true
  fake_count: 2
  fake_packet: "1603 01ff"
  split_mode: first-byte
  default_ttl: 128
  window_size: 4
  segment_delay_ms: 5
hop_cache_ttl_secs: 60
untracked_hops: 12
probe_addr: "1.1.1.1:53"
interface: eth0
"#;
        let config = EvasionConfig::from_yaml(yaml).unwrap();

        assert!(config.https.disorder);
        assert_eq!(config.https.fake_packet, vec![0x16, 0x03, 0x01, 0xff]);
        assert_eq!(config.https.split_mode, SplitMode::FirstByte);
        assert_eq!(config.https.default_ttl, 128);
        assert_eq!(config.https.segment_delay(), Duration::from_millis(5));
        assert_eq!(config.hop_cache_ttl(), Duration::from_secs(60));
        assert_eq!(config.untracked_hops, 12);
        assert_eq!(config.probe_addr, "1.1.1.1:53".parse().unwrap());
        assert_eq!(config.interface.as_deref(), Some("eth0"));
        assert!(config.https.needs_raw_access());
    }

    #[test]
    fn test_validation() {
        assert!(EvasionConfig::from_yaml("https: { split_mode: chunk }").is_err());
        assert!(EvasionConfig::from_yaml("https: { fake_count: 1 }").is_err());
        assert!(EvasionConfig::from_yaml("https: { fake_packet: \"abc\" }").is_err());
        assert!(EvasionConfig::from_yaml("https: { split_mode: sideways }").is_err());
        assert!(EvasionConfig::from_yaml("write_timeout_secs: 0").is_err());
        assert!(EvasionConfig::from_yaml("https: { fake_packet: \"aéb\" }").is_err());
        assert!(EvasionConfig::from_yaml("https: { fake_packet: \"éé\" }").is_err());
        assert!(EvasionConfig::from_yaml("https: { fake_packet: \"zz\" }").is_err());
        assert!(EvasionConfig::aggressive().validate().is_ok());
    }

    #[test]
    fn test_decoy_payload() {
        let mut options = HttpsOptions::default();
        assert!(options.decoy_payload().is_none());

        options.fake_sni = Some("www.w3.org".to_string());
        let payload = options.decoy_payload().unwrap();
        let sni = locate_sni(&payload).unwrap();
        assert_eq!(&payload[sni.range()], b"www.w3.org");

        options.fake_packet = vec![1, 2, 3];
        assert_eq!(options.decoy_payload().unwrap().as_ref(), &[1, 2, 3]);
    }

    #[test]
    fn test_fake_sni_length_is_validated() {
        let mut config = EvasionConfig::aggressive();
        config.https.fake_sni = Some("a".repeat(MAX_HOST_NAME_LEN));
        assert!(config.validate().is_ok());

        config.https.fake_sni = Some("a".repeat(MAX_HOST_NAME_LEN + 1));
        assert!(config.validate().is_err());
        assert!(config.https.decoy_payload().is_none());

        config.https.fake_sni = Some(String::new());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_missing_file_gives_defaults() {
        let config = EvasionConfig::load("/nonexistent/desync.yaml").unwrap();
        assert_eq!(config, EvasionConfig::default());
    }

    #[test]
    fn test_yaml_round_trip_keeps_hex_payload() {
        let mut config = EvasionConfig::aggressive();
        config.https.fake_packet = vec![0xde, 0xad, 0xbe, 0xef];
        let yaml = serde_yaml::to_string(&config).unwrap();
        assert!(yaml.contains("deadbeef"));
        assert_eq!(EvasionConfig::from_yaml(&yaml).unwrap(), config);
    }
}
