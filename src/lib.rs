//! Consecutive packet delay variation (cpdv) of iperf2 flows in packet
//! captures.
//!
//! A capture is read once ([`pcap`]), split into flows ([`flow_manager`]),
//! each packet reduced to a sequence number and arrival time ([`parser`]),
//! and every flow's series turned into delay variation samples ([`cpdv`])
//! that are persisted as one tab separated record per flow ([`writer`]).

pub mod config;
pub mod cpdv;
pub mod error;
pub mod flow_manager;
pub mod packet;
pub mod parser;
pub mod pcap;
pub mod pipeline;
pub mod writer;

pub use error::{CpdvError, Result};
