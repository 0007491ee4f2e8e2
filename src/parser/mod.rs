//! Sequence Extractor: one `(sequence number, timestamp)` sample per packet.
//!
//! TCP packets yield the wire sequence number, absolute and not rebased on
//! the initial sequence number. UDP packets yield the packet counter iperf2
//! writes at the start of every datagram payload.

use crate::config::ExtractConfig;
use crate::error::{CpdvError, Result};
use crate::packet::{Protocol, RawPacket, TcpSegment, Transport, UdpDatagram};
use packet::tcp::Packet as TcpPacket;
use packet::udp::Packet as UdpPacket;
use packet::Packet;

const UDP_HEADER: usize = 8;
const IPERF_ID_LEN: usize = 4;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SequenceSample {
    pub sequence: u32,
    pub timestamp: f64,
}

pub fn extract_tcp(segment: TcpSegment<'_>, timestamp: f64) -> Result<SequenceSample> {
    let tcp = TcpPacket::new(segment.0)
        .map_err(|e| CpdvError::unparsable("tcp", format!("bad header in {} bytes: {:?}", segment.0.len(), e)))?;
    Ok(SequenceSample {
        sequence: tcp.sequence(),
        timestamp,
    })
}

/// Payload bytes carried by a TCP segment, `None` if the header is damaged.
pub fn tcp_payload_len(segment: TcpSegment<'_>) -> Option<usize> {
    TcpPacket::new(segment.0).ok().map(|tcp| tcp.payload().len())
}

/// Decodes the iperf2 datagram id.
///
/// Returns `Ok(None)` for the end-of-test datagram, which iperf2 marks with
/// a negated id, when `cfg.skip_udp_fin` is set.
pub fn extract_udp(datagram: UdpDatagram<'_>, timestamp: f64, cfg: &ExtractConfig) -> Result<Option<SequenceSample>> {
    let bytes = datagram.0;
    let udp = UdpPacket::no_payload(bytes)
        .map_err(|e| CpdvError::unparsable("udp", format!("bad header in {} bytes: {:?}", bytes.len(), e)))?;
    let end = (udp.length() as usize).clamp(UDP_HEADER, bytes.len());
    let payload = &bytes[UDP_HEADER..end];

    let start = cfg.udp_sequence_offset;
    let field = start
        .checked_add(IPERF_ID_LEN)
        .and_then(|end| payload.get(start..end))
        .ok_or_else(|| {
            CpdvError::unparsable(
                "udp",
                format!("payload of {} bytes too short for generator header", payload.len()),
            )
        })?;
    let id = i32::from_be_bytes([field[0], field[1], field[2], field[3]]);
    if id < 0 && cfg.skip_udp_fin {
        return Ok(None);
    }
    Ok(Some(SequenceSample {
        sequence: id as u32,
        timestamp,
    }))
}

/// Extracts the sample of `packet`, which must carry `protocol`.
pub fn extract(packet: &RawPacket, protocol: Protocol, cfg: &ExtractConfig) -> Result<Option<SequenceSample>> {
    if packet.protocol != protocol {
        return Err(CpdvError::unparsable(
            protocol.name(),
            format!("{} packet routed to the {} extractor", packet.protocol, protocol),
        ));
    }
    match packet.transport() {
        Transport::Tcp(segment) => extract_tcp(segment, packet.timestamp).map(Some),
        Transport::Udp(datagram) => extract_udp(datagram, packet.timestamp, cfg),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::Endpoint;
    use std::net::Ipv4Addr;

    fn tcp_segment(seq: u32, payload: &[u8]) -> Vec<u8> {
        let mut b = vec![0x30, 0x39, 0x00, 0x50];
        b.extend_from_slice(&seq.to_be_bytes());
        b.extend_from_slice(&[0, 0, 0, 0, 0x50, 0x18, 0xff, 0xff, 0, 0, 0, 0]);
        b.extend_from_slice(payload);
        b
    }

    fn udp_datagram(payload: &[u8]) -> Vec<u8> {
        let len = (UDP_HEADER + payload.len()) as u16;
        let mut b = vec![0x13, 0x89, 0x9c, 0x40];
        b.extend_from_slice(&len.to_be_bytes());
        b.extend_from_slice(&[0, 0]);
        b.extend_from_slice(payload);
        b
    }

    fn raw(protocol: Protocol, segment: Vec<u8>) -> RawPacket {
        let ep = Endpoint::new(Ipv4Addr::LOCALHOST, 5001);
        RawPacket {
            timestamp: 2.25,
            protocol,
            src: ep,
            dst: ep,
            segment,
        }
    }

    #[test]
    fn tcp_sequence_is_absolute_wire_value() {
        let seg = tcp_segment(0xfffffffe, b"data");
        let sample = extract_tcp(TcpSegment(&seg), 1.0).unwrap();
        assert_eq!(sample.sequence, 0xfffffffe);
        assert_eq!(sample.timestamp, 1.0);
        assert_eq!(tcp_payload_len(TcpSegment(&seg)), Some(4));
    }

    #[test]
    fn truncated_tcp_header_is_unparsable() {
        let seg = tcp_segment(1, &[]);
        assert!(matches!(
            extract_tcp(TcpSegment(&seg[..12]), 0.0),
            Err(CpdvError::UnparsablePacket { protocol: "tcp", .. })
        ));
    }

    #[test]
    fn udp_reads_iperf_datagram_id() {
        let mut payload = 41u32.to_be_bytes().to_vec();
        payload.extend_from_slice(&[0; 8]);
        let dgram = udp_datagram(&payload);
        let sample = extract_udp(UdpDatagram(&dgram), 0.5, &ExtractConfig::default())
            .unwrap()
            .unwrap();
        assert_eq!(sample.sequence, 41);
    }

    #[test]
    fn udp_short_payload_is_unparsable() {
        let dgram = udp_datagram(&[0, 1]);
        let res = extract_udp(UdpDatagram(&dgram), 0.5, &ExtractConfig::default());
        assert!(matches!(res, Err(CpdvError::UnparsablePacket { protocol: "udp", .. })));
    }

    #[test]
    fn udp_fin_datagram_is_skipped_unless_disabled() {
        let dgram = udp_datagram(&(-7i32).to_be_bytes());
        let cfg = ExtractConfig::default();
        assert_eq!(extract_udp(UdpDatagram(&dgram), 0.0, &cfg).unwrap(), None);

        let keep = ExtractConfig { skip_udp_fin: false, ..cfg };
        let sample = extract_udp(UdpDatagram(&dgram), 0.0, &keep).unwrap().unwrap();
        assert_eq!(sample.sequence, (-7i32) as u32);
    }

    #[test]
    fn udp_sequence_offset_is_configurable() {
        let dgram = udp_datagram(&[0xaa, 0xbb, 0, 0, 0, 9]);
        let cfg = ExtractConfig { udp_sequence_offset: 2, ..ExtractConfig::default() };
        let sample = extract_udp(UdpDatagram(&dgram), 0.0, &cfg).unwrap().unwrap();
        assert_eq!(sample.sequence, 9);

        let far = ExtractConfig { udp_sequence_offset: usize::MAX, ..ExtractConfig::default() };
        assert!(matches!(
            extract_udp(UdpDatagram(&dgram), 0.0, &far),
            Err(CpdvError::UnparsablePacket { protocol: "udp", .. })
        ));
    }

    #[test]
    fn mismatched_protocol_is_rejected() {
        let packet = raw(Protocol::Udp, udp_datagram(&[0, 0, 0, 1]));
        assert!(matches!(
            extract(&packet, Protocol::Tcp, &ExtractConfig::default()),
            Err(CpdvError::UnparsablePacket { protocol: "tcp", .. })
        ));
        let sample = extract(&packet, Protocol::Udp, &ExtractConfig::default()).unwrap().unwrap();
        assert_eq!(sample, SequenceSample { sequence: 1, timestamp: 2.25 });
    }
}
