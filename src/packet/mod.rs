use std::fmt;
use std::net::Ipv4Addr;

/// Transport protocols a flow can be demultiplexed on.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Protocol {
    Tcp,
    Udp,
}

impl Protocol {
    pub fn name(&self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
        }
    }

    pub fn ip_number(&self) -> u8 {
        match self {
            Protocol::Tcp => 6,
            Protocol::Udp => 17,
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Endpoint {
    pub addr: Ipv4Addr,
    pub port: u16,
}

impl Endpoint {
    pub fn new(addr: Ipv4Addr, port: u16) -> Endpoint {
        Endpoint { addr, port }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.addr, self.port)
    }
}

/// One captured frame with a TCP or UDP transport segment.
///
/// `segment` holds the whole transport segment, header included, as found
/// in the capture (possibly cut short by the snap length).
#[derive(Clone, Debug)]
pub struct RawPacket {
    pub timestamp: f64,
    pub protocol: Protocol,
    pub src: Endpoint,
    pub dst: Endpoint,
    pub segment: Vec<u8>,
}

/// Borrowed TCP segment, only reachable from a packet tagged [`Protocol::Tcp`].
#[derive(Clone, Copy, Debug)]
pub struct TcpSegment<'a>(pub &'a [u8]);

/// Borrowed UDP datagram, only reachable from a packet tagged [`Protocol::Udp`].
#[derive(Clone, Copy, Debug)]
pub struct UdpDatagram<'a>(pub &'a [u8]);

/// Transport view of a packet, narrowed once on its protocol tag.
#[derive(Clone, Copy, Debug)]
pub enum Transport<'a> {
    Tcp(TcpSegment<'a>),
    Udp(UdpDatagram<'a>),
}

impl RawPacket {
    pub fn transport(&self) -> Transport<'_> {
        match self.protocol {
            Protocol::Tcp => Transport::Tcp(TcpSegment(&self.segment)),
            Protocol::Udp => Transport::Udp(UdpDatagram(&self.segment)),
        }
    }

    pub fn flow_key(&self, directional: bool) -> FlowKey {
        FlowKey::new(self.src, self.dst, self.protocol, directional)
    }
}

/// Grouping key of a flow: endpoint pair plus protocol.
///
/// Built undirected the pair is stored with the lower endpoint first, so both
/// directions of one conversation yield the same key.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct FlowKey {
    pub a: Endpoint,
    pub b: Endpoint,
    pub protocol: Protocol,
}

impl FlowKey {
    pub fn new(src: Endpoint, dst: Endpoint, protocol: Protocol, directional: bool) -> FlowKey {
        let (a, b) = if directional || src <= dst { (src, dst) } else { (dst, src) };
        FlowKey { a, b, protocol }
    }

    /// Packs the key into 104 bits: a.addr | b.addr | a.port | b.port | proto.
    pub fn get_binary_key(&self) -> u128 {
        let mut ret = u32::from(self.a.addr) as u128;
        ret = (ret << 32) | (u32::from(self.b.addr) as u128);
        ret = (ret << 16) | (self.a.port as u128);
        ret = (ret << 16) | (self.b.port as u128);
        ret = (ret << 8) | (self.protocol.ip_number() as u128);
        ret
    }
}

impl fmt::Display for FlowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}<->{}", self.protocol, self.a, self.b)
    }
}
