//! CPDV Calculator.
//!
//! For every consecutive pair of a flow's samples the observed inter-arrival
//! time is compared with the time the generator needed for the sequence
//! progress between them: `value = Δt - Δseq * expected_delta`. Losses widen
//! `Δseq` and therefore do not show up as delay spikes; reordering yields a
//! negative `Δseq` and is reported as is.

use crate::config::{Baseline, CpdvConfig, SequenceUnit};
use crate::error::{CpdvError, Result};
use crate::flow_manager::Flow;
use crate::parser::SequenceSample;
use itertools::Itertools;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct DelaySample {
    /// Sequence number of the later packet of the pair
    pub sequence: u32,
    /// Delay variation in seconds
    pub value: f64,
}

/// Signed distance from `previous` to `current` on the circular 32-bit
/// sequence space.
pub fn wrapping_sequence_delta(current: u32, previous: u32) -> i32 {
    current.wrapping_sub(previous) as i32
}

/// Most common forward sequence delta of a series, 1 if it never advances.
pub fn sequence_step(samples: &[SequenceSample]) -> u32 {
    samples
        .iter()
        .tuple_windows()
        .map(|(prev, cur)| wrapping_sequence_delta(cur.sequence, prev.sequence))
        .filter(|delta| *delta > 0)
        .counts()
        .into_iter()
        .max_by(|(da, ca), (db, cb)| ca.cmp(cb).then(db.cmp(da)))
        .map_or(1, |(delta, _)| delta as u32)
}

/// Sequence progress between two samples, in units of `step`.
fn progress(prev: &SequenceSample, cur: &SequenceSample, step: u32) -> f64 {
    wrapping_sequence_delta(cur.sequence, prev.sequence) as f64 / step as f64
}

/// Expected single-step delay of a series, `None` when no pair of samples
/// is exactly one `step` apart or, for [`Baseline::Rate`], when the last
/// sample does not lie ahead of the first.
pub fn expected_delta(samples: &[SequenceSample], baseline: Baseline, step: u32) -> Option<f64> {
    let steps = samples
        .iter()
        .tuple_windows()
        .map(|(prev, cur)| (progress(prev, cur, step), cur.timestamp - prev.timestamp))
        .collect_vec();

    let mut unit_steps = steps.iter().filter(|(seq, _)| *seq == 1.0).map(|(_, dt)| *dt).peekable();
    unit_steps.peek()?;

    match baseline {
        Baseline::FirstPair => unit_steps.next(),
        Baseline::Median => {
            let mut deltas = unit_steps.collect_vec();
            deltas.sort_by(f64::total_cmp);
            let mid = deltas.len() / 2;
            if deltas.len() % 2 == 0 {
                Some((deltas[mid - 1] + deltas[mid]) / 2.0)
            } else {
                Some(deltas[mid])
            }
        }
        Baseline::Rate => {
            // first to last sample, independent of the order in between
            let (first, last) = (samples.first()?, samples.last()?);
            let advance = progress(first, last, step);
            if advance > 0.0 {
                Some((last.timestamp - first.timestamp) / advance)
            } else {
                None
            }
        }
    }
}

/// Delay variation series of one flow's samples, in input order.
pub fn compute_series(ordinal: usize, samples: &[SequenceSample], cfg: &CpdvConfig) -> Result<Vec<DelaySample>> {
    if samples.len() < 2 {
        return Ok(vec![]);
    }
    let step = match cfg.unit {
        SequenceUnit::Number => 1,
        SequenceUnit::Segment => sequence_step(samples),
    };
    let expected = expected_delta(samples, cfg.baseline, step).ok_or(CpdvError::InsufficientData {
        ordinal,
        samples: samples.len(),
    })?;

    Ok(samples
        .iter()
        .tuple_windows()
        .map(|(prev, cur)| DelaySample {
            sequence: cur.sequence,
            value: (cur.timestamp - prev.timestamp) - progress(prev, cur, step) * expected,
        })
        .collect())
}

pub fn compute(flow: &Flow, cfg: &CpdvConfig) -> Result<Vec<DelaySample>> {
    compute_series(flow.ordinal, &flow.samples, cfg)
}
