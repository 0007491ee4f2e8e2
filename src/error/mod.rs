//! Error taxonomy of the cpdv pipeline.
//!
//! Capture-level failures ([`CpdvError::UnreadableCapture`]) abort a run.
//! Packet-level failures are skipped by the classifier, flow-level failures
//! are reported per flow and never stop the other flows of a capture.

use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, CpdvError>;

#[derive(Error, Debug)]
pub enum CpdvError {
    /// Capture file missing, truncated or not a pcap/pcapng container
    #[error("unreadable capture {path}: {reason}")]
    UnreadableCapture { path: PathBuf, reason: String },

    /// A single packet lacks the header fields its protocol needs
    #[error("unparsable {protocol} packet: {reason}")]
    UnparsablePacket {
        protocol: &'static str,
        reason: String,
    },

    /// No pair of packets with consecutive sequence numbers in the flow
    #[error("flow {ordinal}: no consecutive sequence pair among {samples} samples, cannot establish expected delay")]
    InsufficientData { ordinal: usize, samples: usize },

    /// Output record could not be persisted
    #[error("cannot write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl CpdvError {
    pub(crate) fn unreadable(path: impl Into<PathBuf>, reason: impl ToString) -> CpdvError {
        CpdvError::UnreadableCapture {
            path: path.into(),
            reason: reason.to_string(),
        }
    }

    pub(crate) fn unparsable(protocol: &'static str, reason: impl ToString) -> CpdvError {
        CpdvError::UnparsablePacket {
            protocol,
            reason: reason.to_string(),
        }
    }
}
