//! Writers for the tabular artifacts. Paths ending in `.bgz` or `.gz` are
//! gzip-compressed; everything else is plain TSV.

use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::Path;

use flate2::write::GzEncoder;
use flate2::Compression;
use log::info;
use ndarray::Array2;

use crate::engine::{IbdRow, KingRow, PcRelateRow};
use crate::error::{AncestryError, Result};

pub(crate) fn is_gzip_path(path: &Path) -> bool {
    matches!(path.extension().and_then(|e| e.to_str()), Some("bgz") | Some("gz"))
}

/// An artifact being written. Call [`OutputFile::finish`] once done: the
/// gzip trailer is only written there, and dropping the writer instead
/// swallows any error from the final write.
pub enum OutputFile {
    Plain(BufWriter<File>),
    Gzip(BufWriter<GzEncoder<File>>),
}

impl OutputFile {
    pub fn finish(self) -> Result<()> {
        match self {
            OutputFile::Plain(mut out) => out.flush()?,
            OutputFile::Gzip(out) => {
                out.into_inner().map_err(|e| e.into_error())?.finish()?;
            }
        }
        Ok(())
    }
}

impl Write for OutputFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            OutputFile::Plain(out) => out.write(buf),
            OutputFile::Gzip(out) => out.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            OutputFile::Plain(out) => out.flush(),
            OutputFile::Gzip(out) => out.flush(),
        }
    }
}

/// Opens `path` for writing, creating parent directories and replacing any existing file.
pub fn create_output_file(path: &Path) -> Result<OutputFile> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            fs::create_dir_all(parent)?;
            info!("Created output directory: {}", parent.display());
        }
    }
    let file = File::create(path)?;
    if is_gzip_path(path) {
        Ok(OutputFile::Gzip(BufWriter::new(GzEncoder::new(file, Compression::default()))))
    } else {
        Ok(OutputFile::Plain(BufWriter::new(file)))
    }
}

pub(crate) fn tsv_writer(path: &Path) -> Result<csv::Writer<OutputFile>> {
    Ok(csv::WriterBuilder::new()
        .delimiter(b'\t')
        .from_writer(create_output_file(path)?))
}

/// Flushes the csv buffer and finishes the underlying file.
pub(crate) fn finish_tsv(writer: csv::Writer<OutputFile>) -> Result<()> {
    writer.into_inner().map_err(|e| e.into_error())?.finish()
}

pub fn pc_columns(n: usize) -> Vec<String> {
    (1..=n).map(|i| format!("PC{}", i)).collect()
}

/// `s, PC1..PCk` per sample.
pub fn write_scores(path: &Path, samples: &[String], scores: &Array2<f64>) -> Result<()> {
    if samples.len() != scores.nrows() {
        return Err(AncestryError::InvalidArgument(format!(
            "{} samples but {} score rows",
            samples.len(),
            scores.nrows()
        )));
    }
    let mut writer = tsv_writer(path)?;
    let mut header = vec!["s".to_string()];
    header.extend(pc_columns(scores.ncols()));
    writer.write_record(&header)?;
    for (sample, row) in samples.iter().zip(scores.rows()) {
        let mut record = vec![sample.clone()];
        record.extend(row.iter().map(|v| v.to_string()));
        writer.write_record(&record)?;
    }
    finish_tsv(writer)?;
    info!("Wrote {} sample scores to {}", samples.len(), path.display());
    Ok(())
}

pub fn write_eigenvalues(path: &Path, eigenvalues: &[f64]) -> Result<()> {
    let mut writer = tsv_writer(path)?;
    writer.write_record(["PC", "Eigenvalue"])?;
    for (i, value) in eigenvalues.iter().enumerate() {
        writer.write_record([(i + 1).to_string(), value.to_string()])?;
    }
    finish_tsv(writer)?;
    info!("Wrote {} eigenvalues to {}", eigenvalues.len(), path.display());
    Ok(())
}

/// One sample id per line, no header.
pub fn write_removed_samples(path: &Path, samples: &[String]) -> Result<()> {
    let mut out = create_output_file(path)?;
    for sample in samples {
        writeln!(out, "{}", sample)?;
    }
    out.finish()
}

pub fn write_pc_relate(path: &Path, rows: &[PcRelateRow]) -> Result<()> {
    let mut writer = tsv_writer(path)?;
    writer.write_record(["i", "j", "kin"])?;
    for row in rows {
        writer.write_record([row.i.clone(), row.j.clone(), row.kin.to_string()])?;
    }
    finish_tsv(writer)?;
    Ok(())
}

pub fn write_ibd(path: &Path, rows: &[IbdRow]) -> Result<()> {
    let mut writer = tsv_writer(path)?;
    writer.write_record(["i", "j", "ibs0", "ibs1", "ibs2", "Z0", "Z1", "Z2", "PI_HAT"])?;
    for row in rows {
        writer.write_record([
            row.i.clone(),
            row.j.clone(),
            row.ibs0.to_string(),
            row.ibs1.to_string(),
            row.ibs2.to_string(),
            row.z0.to_string(),
            row.z1.to_string(),
            row.z2.to_string(),
            row.pi_hat.to_string(),
        ])?;
    }
    finish_tsv(writer)?;
    Ok(())
}

pub fn write_king(path: &Path, rows: &[KingRow]) -> Result<()> {
    let mut writer = tsv_writer(path)?;
    writer.write_record(["s_1", "s", "phi"])?;
    for row in rows {
        let phi = row.phi.map_or_else(|| "NA".to_string(), |p| p.to_string());
        writer.write_record([row.s_1.clone(), row.s.clone(), phi])?;
    }
    finish_tsv(writer)?;
    Ok(())
}
