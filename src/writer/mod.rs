//! Record Writer: one headerless tab separated file per flow,
//! `<sequence>\t<delay variation in seconds>` per row.

use crate::config::RecordConfig;
use crate::cpdv::DelaySample;
use crate::error::{CpdvError, Result};
use csv::WriterBuilder;
use std::fs::{self, File};
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use tracing::info;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WrittenRecord {
    pub path: PathBuf,
    pub rows: usize,
}

pub struct RecordWriter {
    cfg: RecordConfig,
}

impl RecordWriter {
    pub fn build(cfg: RecordConfig) -> RecordWriter {
        RecordWriter { cfg }
    }

    /// Writes the series of flow `ordinal`.
    ///
    /// Rows go to a temporary sibling first; the destination is replaced only
    /// once every row has been flushed.
    pub fn write(&self, ordinal: usize, samples: &[DelaySample]) -> Result<WrittenRecord> {
        let path = self.cfg.path_for(ordinal);
        let tmp = self.cfg.output_dir.join(format!(".{}.tmp", self.cfg.file_name(ordinal)));
        let io_err = |source: std::io::Error| CpdvError::Write {
            path: path.clone(),
            source,
        };

        fs::create_dir_all(&self.cfg.output_dir).map_err(io_err)?;
        if let Err(e) = self.write_rows(&tmp, samples) {
            let _ = fs::remove_file(&tmp);
            return Err(io_err(e));
        }
        fs::rename(&tmp, &path).map_err(|e| {
            let _ = fs::remove_file(&tmp);
            io_err(e)
        })?;

        info!(ordinal, rows = samples.len(), path = %path.display(), "record written");
        Ok(WrittenRecord {
            path,
            rows: samples.len(),
        })
    }

    fn write_rows(&self, tmp: &Path, samples: &[DelaySample]) -> std::io::Result<()> {
        let file = File::create(tmp)?;
        let mut wtr = WriterBuilder::new()
            .delimiter(self.cfg.delimiter)
            .has_headers(false)
            .from_writer(BufWriter::new(file));
        for sample in samples {
            wtr.write_record(&[
                sample.sequence.to_string(),
                format!("{:.*}", self.cfg.precision, sample.value),
            ])?;
        }
        let buf = wtr.into_inner().map_err(|e| e.into_error())?;
        let file = buf.into_inner().map_err(|e| e.into_error())?;
        file.sync_all()
    }
}

/// Reads a record back, mainly for consumers and tests.
pub fn read_record(path: &Path, delimiter: u8) -> Result<Vec<DelaySample>> {
    let mut rdr = csv::ReaderBuilder::new()
        .delimiter(delimiter)
        .has_headers(false)
        .from_path(path)
        .map_err(|e| CpdvError::unreadable(path, e))?;
    let mut samples = vec![];
    for row in rdr.records() {
        let row = row.map_err(|e| CpdvError::unreadable(path, e))?;
        let field = |i: usize| row.get(i).ok_or_else(|| CpdvError::unreadable(path, format!("missing column {}", i)));
        let sequence = field(0)?
            .parse::<u32>()
            .map_err(|e| CpdvError::unreadable(path, e))?;
        let value = field(1)?
            .parse::<f64>()
            .map_err(|e| CpdvError::unreadable(path, e))?;
        samples.push(DelaySample { sequence, value });
    }
    Ok(samples)
}
