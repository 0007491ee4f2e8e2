//! End-to-end processing of one capture: read, classify, compute, write.
//!
//! Only an unreadable capture aborts; every other failure is confined to the
//! flow it concerns and shows up in that flow's [`FlowReport`].

use crate::config::PipelineConfig;
use crate::cpdv;
use crate::error::{CpdvError, Result};
use crate::flow_manager::{self, FlowTable};
use crate::packet::{FlowKey, Protocol};
use crate::pcap::Capture;
use crate::writer::{RecordWriter, WrittenRecord};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

#[derive(Debug)]
pub enum FlowOutcome {
    Written(WrittenRecord),
    Failed(CpdvError),
}

#[derive(Debug)]
pub struct FlowReport {
    pub ordinal: usize,
    pub key: FlowKey,
    pub packets: usize,
    pub samples: usize,
    pub outcome: FlowOutcome,
}

impl FlowReport {
    pub fn is_ok(&self) -> bool {
        matches!(self.outcome, FlowOutcome::Written(_))
    }
}

#[derive(Debug)]
pub struct CaptureReport {
    pub capture: PathBuf,
    /// `None` when auto detection found no TCP or UDP packet
    pub protocol: Option<Protocol>,
    pub flows: Vec<FlowReport>,
}

impl CaptureReport {
    pub fn failed(&self) -> impl Iterator<Item = &FlowReport> {
        self.flows.iter().filter(|f| !f.is_ok())
    }
}

/// Protocol the capture is analysed for; `auto` looks at its first TCP/UDP
/// packet.
pub fn resolve_protocol(capture: &Capture, cfg: &PipelineConfig) -> Result<Option<Protocol>> {
    match cfg.protocol.fixed() {
        Some(protocol) => Ok(Some(protocol)),
        None => {
            let detected = capture.first_protocol()?;
            match detected {
                Some(p) => info!(capture = %capture.path().display(), protocol = %p, "detected protocol"),
                None => warn!(capture = %capture.path().display(), "no TCP or UDP packet, nothing to analyse"),
            }
            Ok(detected)
        }
    }
}

/// Computes and writes every flow of `table`.
pub fn process_flows(table: &FlowTable, cfg: &PipelineConfig) -> Vec<FlowReport> {
    let writer = RecordWriter::build(cfg.record.clone());
    table
        .values()
        .map(|flow| {
            let outcome = cpdv::compute(flow, &cfg.cpdv)
                .and_then(|series| writer.write(flow.ordinal, &series));
            let outcome = match outcome {
                Ok(written) => FlowOutcome::Written(written),
                Err(e) => {
                    warn!(ordinal = flow.ordinal, flow = %flow.key, error = %e, "flow failed");
                    FlowOutcome::Failed(e)
                }
            };
            FlowReport {
                ordinal: flow.ordinal,
                key: flow.key,
                packets: flow.packets,
                samples: flow.samples.len(),
                outcome,
            }
        })
        .collect()
}

pub fn process_capture(path: impl AsRef<Path>, cfg: &PipelineConfig) -> Result<CaptureReport> {
    let capture = Capture::new(path.as_ref());
    info!(capture = %capture.path().display(), "reading capture");

    let protocol = match resolve_protocol(&capture, cfg)? {
        Some(p) => p,
        None => {
            return Ok(CaptureReport {
                capture: capture.path().to_path_buf(),
                protocol: None,
                flows: vec![],
            })
        }
    };

    let table = flow_manager::classify(capture.packets()?, protocol, &cfg.flows, &cfg.extract)?;
    for flow in table.values() {
        info!(ordinal = flow.ordinal, flow = %flow.key, packets = flow.packets, "found flow");
    }
    let flows = process_flows(&table, cfg);

    Ok(CaptureReport {
        capture: capture.path().to_path_buf(),
        protocol: Some(protocol),
        flows,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProtocolSelector;
    use crate::flow_manager::Flow;
    use crate::packet::Endpoint;
    use crate::parser::SequenceSample;
    use std::net::Ipv4Addr;

    fn flow(ordinal: usize, points: &[(u32, f64)]) -> Flow {
        let key = FlowKey::new(
            Endpoint::new(Ipv4Addr::new(10, 0, 0, 1), 40000 + ordinal as u16),
            Endpoint::new(Ipv4Addr::new(10, 0, 0, 2), 5001),
            Protocol::Udp,
            false,
        );
        let samples = points
            .iter()
            .map(|&(sequence, timestamp)| SequenceSample { sequence, timestamp })
            .collect();
        Flow::from_samples(key, ordinal, samples)
    }

    #[test]
    fn failing_flow_does_not_stop_others() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = PipelineConfig::new(ProtocolSelector::Udp, dir.path());
        let mut table = FlowTable::new();
        table.insert(0, flow(0, &[(0, 0.0), (2, 0.2), (4, 0.4)]));
        table.insert(1, flow(1, &[(0, 0.0), (1, 0.1), (2, 0.2)]));
        table.insert(2, flow(2, &[(7, 0.0)]));

        let reports = process_flows(&table, &cfg);
        assert_eq!(reports.len(), 3);
        assert!(matches!(
            reports[0].outcome,
            FlowOutcome::Failed(CpdvError::InsufficientData { ordinal: 0, .. })
        ));
        assert!(reports[1].is_ok());
        assert!(reports[2].is_ok());
        assert!(!dir.path().join("cpdv_flow0.tsv").exists());
        assert!(dir.path().join("cpdv_flow1.tsv").is_file());
        assert_eq!(std::fs::read_to_string(dir.path().join("cpdv_flow2.tsv")).unwrap(), "");
    }

    #[test]
    fn missing_capture_is_fatal() {
        let cfg = PipelineConfig::new(ProtocolSelector::Auto, ".");
        assert!(matches!(
            process_capture("/nonexistent/cpdv/capture.pcap", &cfg),
            Err(CpdvError::UnreadableCapture { .. })
        ));
    }
}
