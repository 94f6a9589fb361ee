//! Score tables and the reference/study merge feeding the classifier.

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use flate2::read::MultiGzDecoder;
use log::{debug, info};
use ndarray::Array2;

use crate::error::{malformed, AncestryError, Result};
use crate::output::{self, is_gzip_path};

/// Metadata column holding the reference sample id.
pub const METADATA_SAMPLE_COLUMN: &str = "Sample";

pub(crate) fn tsv_reader(path: &Path) -> Result<csv::Reader<Box<dyn Read>>> {
    let file = File::open(path)?;
    let input: Box<dyn Read> = if is_gzip_path(path) {
        Box::new(BufReader::new(MultiGzDecoder::new(file)))
    } else {
        Box::new(BufReader::new(file))
    };
    Ok(csv::ReaderBuilder::new()
        .delimiter(b'\t')
        .has_headers(true)
        .from_reader(input))
}

pub(crate) fn column_index(headers: &csv::StringRecord, path: &Path, column: &str) -> Result<usize> {
    headers
        .iter()
        .position(|h| h == column)
        .ok_or_else(|| AncestryError::MissingColumn {
            path: path.display().to_string(),
            column: column.to_string(),
        })
}

pub(crate) fn parse_f64(path: &Path, line: usize, field: &str) -> Result<f64> {
    field
        .parse::<f64>()
        .map_err(|e| malformed(path, line, format!("bad number '{}': {}", field, e)))
}

/// Principal-component scores keyed by sample, `PC1..PCk` in column order.
#[derive(Clone, Debug, PartialEq)]
pub struct ScoreTable {
    pub samples: Vec<String>,
    /// Samples x components.
    pub scores: Array2<f64>,
}

impl ScoreTable {
    pub fn num_pcs(&self) -> usize {
        self.scores.ncols()
    }

    pub fn write(&self, path: &Path) -> Result<()> {
        output::write_scores(path, &self.samples, &self.scores)
    }

    /// Reads `s, PC1..PCk`; other columns are ignored.
    pub fn read(path: &Path) -> Result<Self> {
        let mut reader = tsv_reader(path)?;
        let headers = reader.headers()?.clone();
        let s_idx = column_index(&headers, path, "s")?;
        let mut pc_idx = Vec::new();
        while let Some(idx) = headers.iter().position(|h| h == format!("PC{}", pc_idx.len() + 1)) {
            pc_idx.push(idx);
        }

        let mut samples = Vec::new();
        let mut values = Vec::new();
        for (row_num, record) in reader.records().enumerate() {
            let record = record?;
            let line = row_num + 2;
            samples.push(record.get(s_idx).unwrap_or_default().to_string());
            for &idx in &pc_idx {
                values.push(parse_f64(path, line, record.get(idx).unwrap_or_default())?);
            }
        }
        let scores = Array2::from_shape_vec((samples.len(), pc_idx.len()), values)
            .map_err(|e| AncestryError::InvalidArgument(e.to_string()))?;
        debug!("Read {} x {} scores from {}", samples.len(), pc_idx.len(), path.display());
        Ok(Self { samples, scores })
    }
}

/// Reference sample annotations, e.g. `Sample`, `SuperPop`, `Population`.
#[derive(Clone, Debug, PartialEq)]
pub struct MetadataTable {
    pub columns: Vec<String>,
    rows: HashMap<String, Vec<String>>,
}

impl MetadataTable {
    pub fn new(columns: Vec<String>, rows: impl IntoIterator<Item = (String, Vec<String>)>) -> Self {
        Self {
            columns,
            rows: rows.into_iter().collect(),
        }
    }

    pub fn read(path: &Path) -> Result<Self> {
        let mut reader = tsv_reader(path)?;
        let headers = reader.headers()?.clone();
        let sample_idx = column_index(&headers, path, METADATA_SAMPLE_COLUMN)?;
        let columns: Vec<String> = headers
            .iter()
            .enumerate()
            .filter(|(i, _)| *i != sample_idx)
            .map(|(_, h)| h.to_string())
            .collect();
        let mut rows = HashMap::new();
        for record in reader.records() {
            let record = record?;
            let values = record
                .iter()
                .enumerate()
                .filter(|(i, _)| *i != sample_idx)
                .map(|(_, v)| v.to_string())
                .collect();
            rows.insert(record.get(sample_idx).unwrap_or_default().to_string(), values);
        }
        info!("Read metadata for {} reference samples from {}", rows.len(), path.display());
        Ok(Self { columns, rows })
    }

    pub fn get(&self, sample: &str) -> Option<&[String]> {
        self.rows.get(sample).map(|v| v.as_slice())
    }
}

/// Reference rows (with metadata) stacked above study rows (without).
#[derive(Clone, Debug, PartialEq)]
pub struct MergedTable {
    pub samples: Vec<String>,
    pub scores: Array2<f64>,
    pub metadata_columns: Vec<String>,
    /// Per row, one value per metadata column; `None` for study rows and empty cells.
    pub metadata: Vec<Vec<Option<String>>>,
}

impl MergedTable {
    pub fn column(&self, name: &str) -> Option<Vec<Option<&str>>> {
        let idx = self.metadata_columns.iter().position(|c| c == name)?;
        Some(self.metadata.iter().map(|row| row[idx].as_deref()).collect())
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

/// Inner join of reference scores with metadata on `s == Sample`, then the
/// study rows appended with null metadata. Reference samples without
/// metadata are dropped.
pub fn merge(reference: &ScoreTable, metadata: &MetadataTable, study: &ScoreTable) -> Result<MergedTable> {
    info!("Merging data with ref");
    let num_pcs = reference.num_pcs().min(study.num_pcs());
    if reference.num_pcs() != study.num_pcs() {
        info!(
            "Reference has {} PCs and study {}; keeping the first {}",
            reference.num_pcs(),
            study.num_pcs(),
            num_pcs
        );
    }

    let mut samples = Vec::new();
    let mut values = Vec::new();
    let mut meta_rows = Vec::new();
    let mut dropped = 0usize;
    for (row, sample) in reference.samples.iter().enumerate() {
        let Some(meta) = metadata.get(sample) else {
            debug!("Reference sample {} has no metadata; dropped from merge", sample);
            dropped += 1;
            continue;
        };
        samples.push(sample.clone());
        values.extend((0..num_pcs).map(|pc| reference.scores[[row, pc]]));
        meta_rows.push(
            meta.iter()
                .map(|v| (!v.is_empty()).then(|| v.clone()))
                .collect::<Vec<_>>(),
        );
    }
    if dropped > 0 {
        debug!("{} reference samples dropped for missing metadata", dropped);
    }

    for (row, sample) in study.samples.iter().enumerate() {
        samples.push(sample.clone());
        values.extend((0..num_pcs).map(|pc| study.scores[[row, pc]]));
        meta_rows.push(vec![None; metadata.columns.len()]);
    }

    let scores = Array2::from_shape_vec((samples.len(), num_pcs), values)
        .map_err(|e| AncestryError::InvalidArgument(e.to_string()))?;
    info!("Done merging data with ref: {} rows", samples.len());
    Ok(MergedTable {
        samples,
        scores,
        metadata_columns: metadata.columns.clone(),
        metadata: meta_rows,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn reference_rows_without_metadata_are_dropped() {
        let reference = ScoreTable {
            samples: vec!["R1".into(), "R2".into(), "R3".into()],
            scores: array![[1.0, 2.0], [3.0, 4.0], [5.0, 6.0]],
        };
        let metadata = MetadataTable::new(
            vec!["SuperPop".into()],
            vec![("R1".to_string(), vec!["AFR".to_string()]), ("R3".to_string(), vec!["EUR".to_string()])],
        );
        let study = ScoreTable {
            samples: vec!["X".into()],
            scores: array![[0.5, 0.5]],
        };
        let merged = merge(&reference, &metadata, &study).unwrap();
        assert_eq!(merged.samples, vec!["R1", "R3", "X"]);
        assert_eq!(merged.scores, array![[1.0, 2.0], [5.0, 6.0], [0.5, 0.5]]);
        assert_eq!(merged.column("SuperPop").unwrap(), vec![Some("AFR"), Some("EUR"), None]);
    }

    #[test]
    fn score_table_ignores_extra_columns() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("probs.txt");
        std::fs::write(&path, "s\tpop\tPC1\tPC2\tPC4\nA\tAFR\t0.1\t-0.2\t9\nB\toth\t1\t2\t9\n").unwrap();
        let table = ScoreTable::read(&path).unwrap();
        assert_eq!(table.samples, vec!["A", "B"]);
        assert_eq!(table.scores, array![[0.1, -0.2], [1.0, 2.0]]);
    }

    #[test]
    fn metadata_needs_sample_column() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("info.tsv");
        std::fs::write(&path, "s\tSuperPop\nA\tAFR\n").unwrap();
        assert!(matches!(
            MetadataTable::read(&path),
            Err(AncestryError::MissingColumn { .. })
        ));
    }
}
