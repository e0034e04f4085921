/// TCP Fragmentation Module - ClientHello splitting
///
/// A censor that inspects packets one at a time only ever sees the SNI if it
/// fits in a single TCP segment. This module decides where the ClientHello is
/// cut; the actual writes happen in the disorder sender.
///
/// ## Strategies
/// - `none`: send as-is
/// - `chunk`: fixed-size segments, remainder last
/// - `first-byte`: one byte, then everything else
/// - `sni`: the hostname goes out one byte per segment
/// - `random`: cut wherever a random 64-bit mask has a bit set
///
/// Every strategy is lossless: concatenating the segments gives back the
/// input, and there is always at least one segment. Malformed input never
/// fails, it just degrades to `none`.
use std::fmt;
use std::str::FromStr;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::protocols::tls::locate_sni;

/// How the ClientHello is cut into segments
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SplitMode {
    /// No fragmentation
    #[default]
    None,

    /// Split at every set bit of a random disorder pattern
    Random,

    /// Fixed size segments
    Chunk,

    /// First byte alone
    FirstByte,

    /// One segment per SNI byte
    Sni,
}

impl SplitMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Random => "random",
            Self::Chunk => "chunk",
            Self::FirstByte => "first-byte",
            Self::Sni => "sni",
        }
    }
}

impl fmt::Display for SplitMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SplitMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "none" => Ok(Self::None),
            "random" => Ok(Self::Random),
            "chunk" => Ok(Self::Chunk),
            "first-byte" | "firstbyte" | "first_byte" => Ok(Self::FirstByte),
            "sni" => Ok(Self::Sni),
            other => Err(format!("unknown split mode: {other}")),
        }
    }
}

/// 64-bit mask selecting segments (or split points)
///
/// Bit `i` refers to index `i mod 64`. Generated patterns always have bit 0
/// set and at least one bit set in each of the eight byte-sized blocks, so a
/// long ClientHello is never sent as one unbroken run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DisorderPattern(u64);

impl DisorderPattern {
    pub fn generate() -> Self {
        let mut rng = rand::thread_rng();
        let mut mask: u64 = rng.r#gen();

        for block in 0..8 {
            let shift = block * 8;
            if (mask >> shift) & 0xff == 0 {
                mask |= 1u64 << (shift + rng.gen_range(0..8));
            }
        }

        Self(mask | 1)
    }

    pub const fn from_bits(bits: u64) -> Self {
        Self(bits)
    }

    pub const fn bits(&self) -> u64 {
        self.0
    }

    pub fn is_set(&self, index: usize) -> bool {
        (self.0 >> (index % 64)) & 1 == 1
    }
}

/// Ordered, non-overlapping views over the original ClientHello
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FragmentationPlan<'a> {
    segments: Vec<&'a [u8]>,
}

impl<'a> FragmentationPlan<'a> {
    fn single(data: &'a [u8]) -> Self {
        Self { segments: vec![data] }
    }

    /// Cut `data` before every position in `positions` (ascending, deduplicated);
    /// positions outside `1..data.len()` are ignored
    fn split_at_positions(data: &'a [u8], positions: impl IntoIterator<Item = usize>) -> Self {
        let mut segments = Vec::new();
        let mut start = 0;
        for pos in positions {
            if pos > start && pos < data.len() {
                segments.push(&data[start..pos]);
                start = pos;
            }
        }
        segments.push(&data[start..]);
        Self { segments }
    }

    pub fn segments(&self) -> &[&'a [u8]] {
        &self.segments
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn total_len(&self) -> usize {
        self.segments.iter().map(|s| s.len()).sum()
    }

    pub fn iter(&self) -> impl Iterator<Item = &'a [u8]> + '_ {
        self.segments.iter().copied()
    }

    pub fn stats(&self) -> FragmentationStats {
        FragmentationStats::from_plan(self)
    }
}

/// Build the plan for `mode`; `chunk_size` is only read by `SplitMode::Chunk`
pub fn fragment(data: &[u8], mode: SplitMode, chunk_size: usize) -> FragmentationPlan<'_> {
    let plan = match mode {
        SplitMode::None => split_none(data),
        SplitMode::Chunk => split_chunks(data, chunk_size),
        SplitMode::FirstByte => split_first_byte(data),
        SplitMode::Sni => split_sni(data),
        SplitMode::Random => split_random(data, DisorderPattern::generate()),
    };

    debug!("Fragmented {} bytes with mode {}: {}", data.len(), mode, plan.stats());
    plan
}

pub fn split_none(data: &[u8]) -> FragmentationPlan<'_> {
    FragmentationPlan::single(data)
}

/// Fixed-size segments, remainder last; `size == 0` behaves as `none`
pub fn split_chunks(data: &[u8], size: usize) -> FragmentationPlan<'_> {
    if size == 0 || data.is_empty() {
        return FragmentationPlan::single(data);
    }
    FragmentationPlan {
        segments: data.chunks(size).collect(),
    }
}

pub fn split_first_byte(data: &[u8]) -> FragmentationPlan<'_> {
    if data.len() <= 1 {
        return FragmentationPlan::single(data);
    }
    FragmentationPlan {
        segments: vec![&data[..1], &data[1..]],
    }
}

/// Prefix, then every SNI byte alone, then the suffix. No SNI means `none`.
pub fn split_sni(data: &[u8]) -> FragmentationPlan<'_> {
    match locate_sni(data) {
        Ok(sni) => FragmentationPlan::split_at_positions(data, sni.start..=sni.end),
        Err(err) => {
            debug!("SNI split falling back to single segment: {}", err);
            FragmentationPlan::single(data)
        }
    }
}

/// Cut before byte `i` whenever bit `i mod 64` of the pattern is set
pub fn split_random(data: &[u8], pattern: DisorderPattern) -> FragmentationPlan<'_> {
    FragmentationPlan::split_at_positions(data, (1..data.len()).filter(|i| pattern.is_set(*i)))
}

/// Statistics about fragmentation
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FragmentationStats {
    pub total_bytes: usize,
    pub total_fragments: usize,
    pub avg_fragment_size: f64,
    pub min_fragment_size: usize,
    pub max_fragment_size: usize,
}

impl FragmentationStats {
    pub fn from_plan(plan: &FragmentationPlan<'_>) -> Self {
        if plan.is_empty() {
            return Self::default();
        }

        let sizes: Vec<usize> = plan.iter().map(|f| f.len()).collect();
        let total: usize = sizes.iter().sum();

        Self {
            total_bytes: total,
            total_fragments: sizes.len(),
            avg_fragment_size: total as f64 / sizes.len() as f64,
            min_fragment_size: sizes.iter().copied().min().unwrap_or(0),
            max_fragment_size: sizes.iter().copied().max().unwrap_or(0),
        }
    }
}

impl fmt::Display for FragmentationStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} fragments, {} bytes (min {}, max {}, avg {:.1})",
            self.total_fragments, self.total_bytes, self.min_fragment_size, self.max_fragment_size, self.avg_fragment_size
        )
    }
}
