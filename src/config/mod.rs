//! Explicit configuration handed to each stage of the pipeline.

use crate::packet::Protocol;
use std::path::{Path, PathBuf};

/// Which transport protocol the classifier keeps.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProtocolSelector {
    Tcp,
    Udp,
    /// Protocol of the first TCP or UDP packet of each capture
    Auto,
}

impl ProtocolSelector {
    pub fn fixed(&self) -> Option<Protocol> {
        match self {
            ProtocolSelector::Tcp => Some(Protocol::Tcp),
            ProtocolSelector::Udp => Some(Protocol::Udp),
            ProtocolSelector::Auto => None,
        }
    }
}

impl std::str::FromStr for ProtocolSelector {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "tcp" => Ok(ProtocolSelector::Tcp),
            "udp" => Ok(ProtocolSelector::Udp),
            "auto" => Ok(ProtocolSelector::Auto),
            other => Err(format!("unknown protocol '{}', expected tcp, udp or auto", other)),
        }
    }
}

#[derive(Clone, Debug)]
pub struct ExtractConfig {
    /// Byte offset of the generator's 32-bit packet counter in the UDP payload
    pub udp_sequence_offset: usize,
    /// Drop iperf2 end-of-test datagrams (negative datagram id)
    pub skip_udp_fin: bool,
    /// Drop packets repeating a sequence number already seen in their flow
    pub dedup_sequences: bool,
}

impl Default for ExtractConfig {
    fn default() -> Self {
        ExtractConfig {
            udp_sequence_offset: 0,
            skip_udp_fin: true,
            dedup_sequences: false,
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct FlowConfig {
    pub directional: bool,
    pub tcp_require_payload: bool,
}

/// How the per-flow expected single-step delay is established.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum Baseline {
    /// Elapsed time over sequence progress from the first to the last sample
    #[default]
    Rate,
    /// Median time delta of consecutive-sequence pairs
    Median,
    /// Time delta of the first consecutive-sequence pair
    FirstPair,
}

impl std::str::FromStr for Baseline {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "rate" => Ok(Baseline::Rate),
            "median" => Ok(Baseline::Median),
            "first" | "first-pair" => Ok(Baseline::FirstPair),
            other => Err(format!("unknown baseline '{}', expected rate, median or first-pair", other)),
        }
    }
}

/// Unit one step of sequence progress is measured in.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum SequenceUnit {
    /// One sequence number, the iperf2 datagram counter
    #[default]
    Number,
    /// The most common forward sequence delta of the flow, i.e. the segment
    /// size of a bulk TCP transfer whose sequence numbers count bytes
    Segment,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct CpdvConfig {
    pub baseline: Baseline,
    pub unit: SequenceUnit,
}

#[derive(Clone, Debug)]
pub struct RecordConfig {
    pub output_dir: PathBuf,
    pub file_prefix: String,
    pub extension: String,
    pub delimiter: u8,
    /// Fractional digits of the delay variation column
    pub precision: usize,
}

impl RecordConfig {
    pub fn in_dir(output_dir: impl Into<PathBuf>) -> RecordConfig {
        RecordConfig {
            output_dir: output_dir.into(),
            ..RecordConfig::default()
        }
    }

    pub fn file_name(&self, ordinal: usize) -> String {
        format!("{}{}.{}", self.file_prefix, ordinal, self.extension)
    }

    pub fn path_for(&self, ordinal: usize) -> PathBuf {
        self.output_dir.join(self.file_name(ordinal))
    }
}

impl Default for RecordConfig {
    fn default() -> Self {
        RecordConfig {
            output_dir: PathBuf::from("."),
            file_prefix: String::from("cpdv_flow"),
            extension: String::from("tsv"),
            delimiter: b'\t',
            precision: 9,
        }
    }
}

#[derive(Clone, Debug)]
pub struct PipelineConfig {
    pub protocol: ProtocolSelector,
    pub extract: ExtractConfig,
    pub flows: FlowConfig,
    pub cpdv: CpdvConfig,
    pub record: RecordConfig,
}

impl PipelineConfig {
    pub fn new(protocol: ProtocolSelector, output_dir: impl Into<PathBuf>) -> PipelineConfig {
        PipelineConfig {
            protocol,
            extract: ExtractConfig::default(),
            flows: FlowConfig::default(),
            cpdv: CpdvConfig::default(),
            record: RecordConfig::in_dir(output_dir),
        }
    }

    /// Same configuration with records placed next to `capture`.
    pub fn beside_capture(&self, capture: &Path) -> PipelineConfig {
        let dir = match capture.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        let mut cfg = self.clone();
        cfg.record.output_dir = dir;
        cfg
    }
}
