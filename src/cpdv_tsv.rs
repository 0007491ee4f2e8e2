use clap::Parser as ClapParser;
use cpdv::config::{Baseline, PipelineConfig, ProtocolSelector, SequenceUnit};
use cpdv::pipeline::{self, FlowOutcome};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Writes one cpdv_flow<N>.tsv per flow of each capture:
/// <sequence number> TAB <delay variation in seconds>
#[derive(ClapParser)]
struct Args {
    /// tcp, udp or auto (protocol of the first TCP/UDP packet, per capture)
    protocol: ProtocolSelector,
    #[clap(required = true)]
    pcap_files: Vec<PathBuf>,
    /// Directory for the records, defaults to the directory of each capture
    #[clap(short, long)]
    output_dir: Option<PathBuf>,
    /// Expected delay estimate: rate, median or first-pair
    #[clap(short, long, default_value = "rate")]
    baseline: Baseline,
    /// Measure sequence progress in segments (most common forward sequence
    /// step) instead of sequence numbers, for TCP byte sequence numbers
    #[clap(long, action)]
    segment_unit: bool,
    /// Split flows by direction instead of merging both directions
    #[clap(long, action)]
    directional: bool,
    /// Drop TCP flows in which no packet carried payload
    #[clap(long, action)]
    tcp_require_payload: bool,
    /// Drop packets repeating a sequence number already seen in their flow
    #[clap(long, action)]
    dedup: bool,
    /// Byte offset of the generator's packet counter in the UDP payload
    #[clap(long, default_value = "0")]
    udp_sequence_offset: usize,
    #[clap(short, long, action)]
    verbose: bool,
}

fn main() -> ExitCode {
    let args = Args::parse();
    let filter = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .init();

    let mut cfg = PipelineConfig::new(args.protocol, args.output_dir.clone().unwrap_or_default());
    cfg.cpdv.baseline = args.baseline;
    if args.segment_unit {
        cfg.cpdv.unit = SequenceUnit::Segment;
    }
    cfg.flows.directional = args.directional;
    cfg.flows.tcp_require_payload = args.tcp_require_payload;
    cfg.extract.dedup_sequences = args.dedup;
    cfg.extract.udp_sequence_offset = args.udp_sequence_offset;

    let mut fatal = 0;
    for pcap_file in &args.pcap_files {
        let capture_cfg = match args.output_dir {
            Some(_) => cfg.clone(),
            None => cfg.beside_capture(pcap_file),
        };
        match pipeline::process_capture(pcap_file, &capture_cfg) {
            Ok(report) => {
                for flow in &report.flows {
                    match &flow.outcome {
                        FlowOutcome::Written(record) => info!(
                            "{}: flow {} {} - {} packets, {} rows -> {}",
                            report.capture.display(),
                            flow.ordinal,
                            flow.key,
                            flow.packets,
                            record.rows,
                            record.path.display()
                        ),
                        FlowOutcome::Failed(e) => warn!(
                            "{}: flow {} {} failed: {}",
                            report.capture.display(),
                            flow.ordinal,
                            flow.key,
                            e
                        ),
                    }
                }
                let failed = report.failed().count();
                info!(
                    "{}: {} flows, {} failed",
                    report.capture.display(),
                    report.flows.len(),
                    failed
                );
            }
            Err(e) => {
                error!("{}", e);
                fatal += 1;
            }
        }
    }

    if fatal > 0 {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}
