//! Flow Classifier: demultiplexes the packets of one transport protocol into
//! flows and collects each flow's sequence samples in arrival order.

use crate::config::{ExtractConfig, FlowConfig};
use crate::error::Result;
use crate::packet::{FlowKey, Protocol, RawPacket, Transport};
use crate::parser::{self, SequenceSample};
use std::collections::{BTreeMap, HashMap, HashSet};
use tracing::{debug, info, trace};

/// One logical stream of a capture.
#[derive(Clone, Debug)]
pub struct Flow {
    pub key: FlowKey,
    /// Position of the flow's first packet among all flows of the capture
    pub ordinal: usize,
    /// Samples in capture order, not sequence order
    pub samples: Vec<SequenceSample>,
    /// Packets matched to the flow, including those yielding no sample
    pub packets: usize,
    pub payload_bytes: usize,
    seen: HashSet<u32>,
}

impl Flow {
    fn new(key: FlowKey, ordinal: usize) -> Flow {
        Flow {
            key,
            ordinal,
            samples: vec![],
            packets: 0,
            payload_bytes: 0,
            seen: HashSet::new(),
        }
    }

    pub fn from_samples(key: FlowKey, ordinal: usize, samples: Vec<SequenceSample>) -> Flow {
        let mut flow = Flow::new(key, ordinal);
        flow.packets = samples.len();
        flow.samples = samples;
        flow
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ClassifyStats {
    pub packets: usize,
    pub other_protocol: usize,
    pub unparsable: usize,
    pub end_markers: usize,
    pub duplicates: usize,
}

pub type FlowTable = BTreeMap<usize, Flow>;

pub struct FlowManager {
    protocol: Protocol,
    flow_cfg: FlowConfig,
    extract_cfg: ExtractConfig,
    hash_table: HashMap<u128, usize>,
    flows: Vec<Flow>,
    stats: ClassifyStats,
}

impl FlowManager {
    pub fn build(protocol: Protocol, flow_cfg: FlowConfig, extract_cfg: ExtractConfig) -> FlowManager {
        FlowManager {
            protocol,
            flow_cfg,
            extract_cfg,
            hash_table: HashMap::new(),
            flows: vec![],
            stats: ClassifyStats::default(),
        }
    }

    pub fn stats(&self) -> ClassifyStats {
        self.stats
    }

    pub fn receive_packet(&mut self, packet: &RawPacket) {
        self.stats.packets += 1;
        if packet.protocol != self.protocol {
            self.stats.other_protocol += 1;
            return;
        }

        let key = packet.flow_key(self.flow_cfg.directional);
        let next_ordinal = self.flows.len();
        let ordinal = *self.hash_table.entry(key.get_binary_key()).or_insert(next_ordinal);
        if ordinal == next_ordinal {
            debug!(ordinal, flow = %key, "new flow");
            self.flows.push(Flow::new(key, ordinal));
        }
        let flow = &mut self.flows[ordinal];
        flow.packets += 1;
        if let Transport::Tcp(segment) = packet.transport() {
            flow.payload_bytes += parser::tcp_payload_len(segment).unwrap_or(0);
        }

        match parser::extract(packet, self.protocol, &self.extract_cfg) {
            Ok(Some(sample)) => {
                if self.extract_cfg.dedup_sequences && !flow.seen.insert(sample.sequence) {
                    trace!(ordinal, sequence = sample.sequence, "duplicate sequence number dropped");
                    self.stats.duplicates += 1;
                    return;
                }
                flow.samples.push(sample);
            }
            Ok(None) => self.stats.end_markers += 1,
            // the packet counts as lost: its sequence number shows up as a gap
            Err(e) => {
                trace!(ordinal, error = %e, "packet skipped");
                self.stats.unparsable += 1;
            }
        }
    }

    /// Finalizes the flows, keyed by ordinal.
    pub fn finish(self) -> FlowTable {
        info!(
            protocol = %self.protocol,
            flows = self.flows.len(),
            packets = self.stats.packets,
            other_protocol = self.stats.other_protocol,
            unparsable = self.stats.unparsable,
            end_markers = self.stats.end_markers,
            duplicates = self.stats.duplicates,
            "classified capture"
        );
        let require_payload = self.flow_cfg.tcp_require_payload && self.protocol == Protocol::Tcp;
        self.flows
            .into_iter()
            .filter(|flow| {
                let keep = !require_payload || flow.payload_bytes > 0;
                if !keep {
                    debug!(ordinal = flow.ordinal, flow = %flow.key, "no payload sent, flow dropped");
                }
                keep
            })
            .map(|flow| (flow.ordinal, flow))
            .collect()
    }
}

/// Classifies a whole packet stream. A read error of the stream aborts.
pub fn classify<I>(packets: I, protocol: Protocol, flow_cfg: &FlowConfig, extract_cfg: &ExtractConfig) -> Result<FlowTable>
where
    I: IntoIterator<Item = Result<RawPacket>>,
{
    let mut manager = FlowManager::build(protocol, flow_cfg.clone(), extract_cfg.clone());
    for packet in packets {
        manager.receive_packet(&packet?);
    }
    Ok(manager.finish())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CpdvError;
    use crate::packet::Endpoint;
    use std::net::Ipv4Addr;

    fn udp(src: u8, sport: u16, dst: u8, dport: u16, seq: u32, ts: f64) -> RawPacket {
        let mut segment = vec![0; 8];
        segment[0..2].copy_from_slice(&sport.to_be_bytes());
        segment[2..4].copy_from_slice(&dport.to_be_bytes());
        segment[4..6].copy_from_slice(&12u16.to_be_bytes());
        segment.extend_from_slice(&seq.to_be_bytes());
        RawPacket {
            timestamp: ts,
            protocol: Protocol::Udp,
            src: Endpoint::new(Ipv4Addr::new(10, 0, 0, src), sport),
            dst: Endpoint::new(Ipv4Addr::new(10, 0, 0, dst), dport),
            segment,
        }
    }

    fn tcp(seq: u32, payload: &[u8], ts: f64) -> RawPacket {
        let mut segment = vec![0x9c, 0x40, 0x13, 0x89];
        segment.extend_from_slice(&seq.to_be_bytes());
        segment.extend_from_slice(&[0, 0, 0, 0, 0x50, 0x10, 0xff, 0xff, 0, 0, 0, 0]);
        segment.extend_from_slice(payload);
        RawPacket {
            timestamp: ts,
            protocol: Protocol::Tcp,
            src: Endpoint::new(Ipv4Addr::new(10, 0, 0, 1), 40000),
            dst: Endpoint::new(Ipv4Addr::new(10, 0, 0, 2), 5001),
            segment,
        }
    }

    fn run(packets: Vec<RawPacket>, protocol: Protocol, flow_cfg: FlowConfig, extract_cfg: ExtractConfig) -> FlowTable {
        classify(packets.into_iter().map(Ok), protocol, &flow_cfg, &extract_cfg).unwrap()
    }

    #[test]
    fn ordinals_follow_first_appearance() {
        let packets = vec![
            udp(1, 1000, 9, 5001, 0, 0.0), // A
            udp(2, 1000, 9, 5001, 0, 0.1), // B
            udp(1, 1000, 9, 5001, 1, 0.2), // A
            udp(3, 1000, 9, 5001, 0, 0.3), // C
        ];
        let table = run(packets, Protocol::Udp, FlowConfig::default(), ExtractConfig::default());
        let sources: Vec<(usize, u8)> = table
            .values()
            .map(|f| (f.ordinal, f.key.a.addr.octets()[3]))
            .collect();
        assert_eq!(sources, vec![(0, 1), (1, 2), (2, 3)]);
        assert_eq!(table[&0].samples.len(), 2);
    }

    #[test]
    fn both_directions_merge_into_one_flow() {
        let packets = vec![
            udp(1, 40000, 2, 5001, 0, 0.0),
            udp(2, 5001, 1, 40000, 7, 0.1),
            udp(1, 40000, 2, 5001, 1, 0.2),
        ];
        let table = run(packets.clone(), Protocol::Udp, FlowConfig::default(), ExtractConfig::default());
        assert_eq!(table.len(), 1);
        let seqs: Vec<u32> = table[&0].samples.iter().map(|s| s.sequence).collect();
        assert_eq!(seqs, vec![0, 7, 1]);

        let directional = FlowConfig { directional: true, ..FlowConfig::default() };
        let table = run(packets, Protocol::Udp, directional, ExtractConfig::default());
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn other_protocol_yields_empty_table() {
        let packets = vec![udp(1, 1, 2, 2, 0, 0.0), udp(1, 1, 2, 2, 1, 0.1)];
        let mut manager = FlowManager::build(Protocol::Tcp, FlowConfig::default(), ExtractConfig::default());
        for p in &packets {
            manager.receive_packet(p);
        }
        assert_eq!(manager.stats().other_protocol, 2);
        assert!(manager.finish().is_empty());
    }

    #[test]
    fn malformed_packet_keeps_flow_and_leaves_gap() {
        let mut short = udp(1, 1, 2, 2, 1, 0.1);
        short.segment.truncate(10);
        let packets = vec![udp(1, 1, 2, 2, 0, 0.0), short, udp(1, 1, 2, 2, 2, 0.2)];
        let mut manager = FlowManager::build(Protocol::Udp, FlowConfig::default(), ExtractConfig::default());
        for p in &packets {
            manager.receive_packet(p);
        }
        assert_eq!(manager.stats().unparsable, 1);
        let table = manager.finish();
        let seqs: Vec<u32> = table[&0].samples.iter().map(|s| s.sequence).collect();
        assert_eq!(seqs, vec![0, 2]);
        assert_eq!(table[&0].packets, 3);
    }

    #[test]
    fn duplicates_dropped_when_enabled() {
        let packets = vec![udp(1, 1, 2, 2, 0, 0.0), udp(1, 1, 2, 2, 0, 0.1), udp(1, 1, 2, 2, 1, 0.2)];
        let dedup = ExtractConfig { dedup_sequences: true, ..ExtractConfig::default() };
        let mut manager = FlowManager::build(Protocol::Udp, FlowConfig::default(), dedup);
        for p in &packets {
            manager.receive_packet(p);
        }
        assert_eq!(manager.stats().duplicates, 1);
        assert_eq!(manager.finish()[&0].samples.len(), 2);
        let table = run(packets, Protocol::Udp, FlowConfig::default(), ExtractConfig::default());
        assert_eq!(table[&0].samples.len(), 3);
    }

    #[test]
    fn payloadless_tcp_flows_dropped_on_request() {
        let acks = vec![tcp(100, &[], 0.0), tcp(100, &[], 0.1)];
        let strict = FlowConfig { tcp_require_payload: true, ..FlowConfig::default() };
        assert!(run(acks.clone(), Protocol::Tcp, strict, ExtractConfig::default()).is_empty());
        let table = run(acks, Protocol::Tcp, FlowConfig::default(), ExtractConfig::default());
        assert_eq!(table[&0].samples.len(), 2);

        let data = vec![tcp(100, b"abc", 0.0), tcp(103, b"abc", 0.1)];
        let strict = FlowConfig { tcp_require_payload: true, ..FlowConfig::default() };
        let table = run(data, Protocol::Tcp, strict, ExtractConfig::default());
        assert_eq!(table[&0].payload_bytes, 6);
    }

    #[test]
    fn end_marker_is_counted_not_sampled() {
        let mut fin = udp(1, 1, 2, 2, 0, 0.2);
        fin.segment[8..12].copy_from_slice(&(-2i32).to_be_bytes());
        let packets = vec![udp(1, 1, 2, 2, 0, 0.0), udp(1, 1, 2, 2, 1, 0.1), fin];
        let mut manager = FlowManager::build(Protocol::Udp, FlowConfig::default(), ExtractConfig::default());
        for p in &packets {
            manager.receive_packet(p);
        }
        assert_eq!(manager.stats().end_markers, 1);
        let table = manager.finish();
        assert_eq!(table[&0].samples.len(), 2);
        assert_eq!(table[&0].packets, 3);
    }

    #[test]
    fn read_error_aborts() {
        let packets: Vec<Result<RawPacket>> = vec![
            Ok(udp(1, 1, 2, 2, 0, 0.0)),
            Err(CpdvError::unreadable("x.pcap", "truncated capture")),
        ];
        let res = classify(packets, Protocol::Udp, &FlowConfig::default(), &ExtractConfig::default());
        assert!(matches!(res, Err(CpdvError::UnreadableCapture { .. })));
    }
}
