//! Capture Reader: lazy, in-order decoding of pcap/pcapng files into
//! [`RawPacket`]s carrying a TCP or UDP segment.
//!
//! Frames that are not IPv4 TCP/UDP (ARP, IPv6, ICMP, non-initial
//! fragments, ...) are skipped here; a damaged container ends the iteration
//! with [`CpdvError::UnreadableCapture`].

use crate::error::{CpdvError, Result};
use crate::packet::{Endpoint, Protocol, RawPacket};
use packet::ether::Packet as EthernetPacket;
use packet::ip::Packet as IpPacket;
use packet::tcp::Packet as TcpPacket;
use packet::udp::Packet as UdpPacket;
use pcap_parser::data::{get_packetdata, PacketData};
use pcap_parser::traits::PcapReaderIterator;
use pcap_parser::{Block, Linktype, PcapBlockOwned, PcapError};
use std::fs::File;
use std::path::{Path, PathBuf};
use tracing::{debug, trace, warn};

const BUFFER_SIZE: usize = 262144;
const ETHERNET_HEADER: usize = 14;
const ETHERTYPE_IPV4: u16 = 0x0800;
const IPV4_MIN_HEADER: usize = 20;
const NANO_MAGIC: u32 = 0xa1b2_3c4d;
const NANO_MAGIC_SWAPPED: u32 = 0x4d3c_b2a1;

/// A capture file on disk. Every call to [`Capture::packets`] restarts
/// reading from the first packet.
#[derive(Clone, Debug)]
pub struct Capture {
    path: PathBuf,
}

impl Capture {
    pub fn new(path: impl Into<PathBuf>) -> Capture {
        Capture { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn packets(&self) -> Result<CaptureReader> {
        CaptureReader::open(&self.path)
    }

    /// Transport protocol of the first TCP or UDP packet in the capture.
    pub fn first_protocol(&self) -> Result<Option<Protocol>> {
        match self.packets()?.next() {
            Some(packet) => packet.map(|p| Some(p.protocol)),
            None => Ok(None),
        }
    }
}

#[derive(Clone, Copy, Debug)]
struct Interface {
    linktype: Linktype,
    /// Timestamp units per second
    ts_units: f64,
    ts_offset: f64,
}

impl Interface {
    fn legacy(linktype: Linktype, nanosecond: bool) -> Interface {
        Interface {
            linktype,
            ts_units: if nanosecond { 1e9 } else { 1e6 },
            ts_offset: 0.0,
        }
    }
}

/// `if_tsresol`: bit 7 clear means a negative power of 10, set a negative
/// power of 2.
fn ts_units_from_resolution(resol: u8) -> f64 {
    let exponent = (resol & 0x7f) as i32;
    if resol & 0x80 == 0 {
        10f64.powi(exponent)
    } else {
        2f64.powi(exponent)
    }
}

/// Seconds in `ticks` timestamp units, whole seconds split off before the
/// conversion so nanosecond counts keep their fraction.
fn ticks_to_seconds(ticks: u64, ts_units: f64) -> f64 {
    if ts_units >= 1.0 && ts_units < u64::MAX as f64 {
        let units = ts_units as u64;
        (ticks / units) as f64 + (ticks % units) as f64 / ts_units
    } else {
        ticks as f64 / ts_units
    }
}

enum Frame {
    Packet { timestamp: f64, linktype: Linktype, data: Vec<u8>, caplen: usize },
    Skip,
}

pub struct CaptureReader {
    path: PathBuf,
    reader: Box<dyn PcapReaderIterator>,
    interfaces: Vec<Interface>,
    frames: u64,
    finished: bool,
}

impl CaptureReader {
    pub fn open(path: impl AsRef<Path>) -> Result<CaptureReader> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|e| CpdvError::unreadable(path, e))?;
        let reader = pcap_parser::create_reader(BUFFER_SIZE, file)
            .map_err(|e| CpdvError::unreadable(path, format!("not a pcap or pcapng file ({})", e)))?;
        debug!(path = %path.display(), "opened capture");
        Ok(CaptureReader {
            path: path.to_path_buf(),
            reader,
            interfaces: vec![],
            frames: 0,
            finished: false,
        })
    }

    fn read_block(interfaces: &mut Vec<Interface>, block: PcapBlockOwned) -> Frame {
        match block {
            PcapBlockOwned::LegacyHeader(header) => {
                let nano = header.magic_number == NANO_MAGIC || header.magic_number == NANO_MAGIC_SWAPPED;
                debug!(linktype = header.network.0, nanosecond = nano, "legacy pcap header");
                *interfaces = vec![Interface::legacy(header.network, nano)];
                Frame::Skip
            }
            PcapBlockOwned::Legacy(packet) => {
                let iface = interfaces
                    .first()
                    .copied()
                    .unwrap_or_else(|| Interface::legacy(Linktype::ETHERNET, false));
                Frame::Packet {
                    timestamp: packet.ts_sec as f64 + packet.ts_usec as f64 / iface.ts_units,
                    linktype: iface.linktype,
                    data: packet.data.to_vec(),
                    caplen: packet.caplen as usize,
                }
            }
            PcapBlockOwned::NG(Block::SectionHeader(_)) => {
                // a new section restarts interface numbering
                interfaces.clear();
                Frame::Skip
            }
            PcapBlockOwned::NG(Block::InterfaceDescription(idb)) => {
                debug!(linktype = idb.linktype.0, tsresol = idb.if_tsresol, "pcapng interface");
                interfaces.push(Interface {
                    linktype: idb.linktype,
                    ts_units: ts_units_from_resolution(idb.if_tsresol),
                    ts_offset: idb.if_tsoffset as f64,
                });
                Frame::Skip
            }
            PcapBlockOwned::NG(Block::EnhancedPacket(epb)) => match interfaces.get(epb.if_id as usize) {
                Some(iface) => {
                    let ticks = ((epb.ts_high as u64) << 32) | epb.ts_low as u64;
                    Frame::Packet {
                        timestamp: iface.ts_offset + ticks_to_seconds(ticks, iface.ts_units),
                        linktype: iface.linktype,
                        data: epb.data.to_vec(),
                        caplen: epb.caplen as usize,
                    }
                }
                None => {
                    warn!(if_id = epb.if_id, "enhanced packet for unknown interface, skipped");
                    Frame::Skip
                }
            },
            PcapBlockOwned::NG(Block::SimplePacket(_)) => {
                warn!("simple packet block carries no timestamp, skipped");
                Frame::Skip
            }
            // statistics, name resolution, custom blocks
            PcapBlockOwned::NG(_) => Frame::Skip,
        }
    }

    fn decode(&self, timestamp: f64, linktype: Linktype, data: &[u8], caplen: usize) -> Option<RawPacket> {
        let l3 = match get_packetdata(data, linktype, caplen)? {
            PacketData::L2(frame) => {
                let ethertype = EthernetPacket::new(frame).ok()?.protocol();
                let payload = &frame[ETHERNET_HEADER..];
                if ethertype == packet::ether::Protocol::Vlan {
                    if payload.len() < 4 || u16::from_be_bytes([payload[2], payload[3]]) != ETHERTYPE_IPV4 {
                        return None;
                    }
                    &payload[4..]
                } else if ethertype == packet::ether::Protocol::Ipv4 {
                    payload
                } else {
                    return None;
                }
            }
            PacketData::L3(ETHERTYPE_IPV4, b) => b,
            PacketData::L3(_, _) => return None,
            PacketData::L4(_, _) | PacketData::Unsupported(_) => {
                trace!(frame = self.frames, "unsupported link layer data");
                return None;
            }
        };
        decode_ipv4(timestamp, l3)
    }
}

fn decode_ipv4(timestamp: f64, b: &[u8]) -> Option<RawPacket> {
    if b.len() < IPV4_MIN_HEADER || b[0] >> 4 != 4 {
        return None;
    }
    let header_len = (b[0] & 0x0f) as usize * 4;
    if header_len < IPV4_MIN_HEADER || header_len > b.len() {
        return None;
    }
    if u16::from_be_bytes([b[6], b[7]]) & 0x1fff != 0 {
        // only the first fragment carries the transport header
        return None;
    }
    let ip = match IpPacket::unchecked(b) {
        IpPacket::V4(p) => p,
        _ => return None,
    };
    let end = match u16::from_be_bytes([b[2], b[3]]) as usize {
        0 => b.len(),
        n => n.min(b.len()).max(header_len),
    };
    let segment = &b[header_len..end];
    if segment.len() < 4 {
        return None;
    }
    let (protocol, src_port, dst_port) = if ip.protocol() == packet::ip::Protocol::Tcp {
        let tcp = TcpPacket::unchecked(segment);
        (Protocol::Tcp, tcp.source(), tcp.destination())
    } else if ip.protocol() == packet::ip::Protocol::Udp {
        let udp = UdpPacket::unchecked(segment);
        (Protocol::Udp, udp.source(), udp.destination())
    } else {
        return None;
    };
    Some(RawPacket {
        timestamp,
        protocol,
        src: Endpoint::new(ip.source(), src_port),
        dst: Endpoint::new(ip.destination(), dst_port),
        segment: segment.to_vec(),
    })
}

impl Iterator for CaptureReader {
    type Item = Result<RawPacket>;

    fn next(&mut self) -> Option<Self::Item> {
        let mut stalled = false;
        while !self.finished {
            let frame = match self.reader.next() {
                Ok((offset, block)) => {
                    let frame = Self::read_block(&mut self.interfaces, block);
                    self.reader.consume(offset);
                    stalled = false;
                    frame
                }
                Err(PcapError::Eof) => {
                    debug!(path = %self.path.display(), frames = self.frames, "end of capture");
                    self.finished = true;
                    return None;
                }
                Err(PcapError::Incomplete(_)) => {
                    if stalled {
                        self.finished = true;
                        return Some(Err(CpdvError::unreadable(&self.path, "truncated capture")));
                    }
                    stalled = true;
                    if let Err(e) = self.reader.refill() {
                        let reason = format!("read error after frame {}: {}", self.frames, e);
                        self.finished = true;
                        return Some(Err(CpdvError::unreadable(&self.path, reason)));
                    }
                    continue;
                }
                Err(e) => {
                    let reason = format!("corrupt block after frame {}: {}", self.frames, e);
                    self.finished = true;
                    return Some(Err(CpdvError::unreadable(&self.path, reason)));
                }
            };
            if let Frame::Packet { timestamp, linktype, data, caplen } = frame {
                self.frames += 1;
                match self.decode(timestamp, linktype, &data, caplen) {
                    Some(packet) => return Some(Ok(packet)),
                    None => trace!(frame = self.frames, "not an IPv4 TCP/UDP frame, skipped"),
                }
            }
        }
        None
    }
}
