//! In-memory genotype matrix keyed by variant, plus the native on-disk
//! dataset directory (`*.mt`) used for the reference panel and for
//! intersection artifacts.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::fs::{self, File};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;

use flate2::read::MultiGzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use log::{debug, info};
use ndarray::{Array2, ArrayView1, Axis};
use serde::{Deserialize, Serialize};

use crate::error::{malformed, AncestryError, Result};

/// Encoded value for a missing genotype call.
pub const MISSING: i8 = -1;

const VARIANTS_FILE: &str = "variants.tsv";
const SAMPLES_FILE: &str = "samples.txt";
const GENOTYPES_FILE: &str = "genotypes.tsv.gz";

/// Row key of every variant table: locus plus the biallelic allele pair.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct VariantKey {
    pub contig: String,
    pub position: u64,
    pub reference: String,
    pub alternate: String,
}

impl VariantKey {
    pub fn new(contig: impl Into<String>, position: u64, reference: impl Into<String>, alternate: impl Into<String>) -> Self {
        Self {
            contig: contig.into(),
            position,
            reference: reference.into(),
            alternate: alternate.into(),
        }
    }
}

impl fmt::Display for VariantKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}:{}", self.contig, self.position, self.reference, self.alternate)
    }
}

/// Variants x samples matrix of alt-allele counts (0, 1, 2) or [`MISSING`].
///
/// Every transformation returns a new dataset; nothing here mutates in place.
#[derive(Clone, Debug)]
pub struct GenotypeDataset {
    variants: Vec<VariantKey>,
    samples: Vec<String>,
    genotypes: Array2<i8>,
}

impl GenotypeDataset {
    pub fn try_new(variants: Vec<VariantKey>, samples: Vec<String>, genotypes: Array2<i8>) -> Result<Self> {
        if genotypes.nrows() != variants.len() || genotypes.ncols() != samples.len() {
            return Err(AncestryError::InvalidArgument(format!(
                "genotype matrix is {}x{} but dataset has {} variants and {} samples",
                genotypes.nrows(),
                genotypes.ncols(),
                variants.len(),
                samples.len()
            )));
        }
        let mut seen_keys = HashSet::with_capacity(variants.len());
        for key in &variants {
            if !seen_keys.insert(key) {
                return Err(AncestryError::InvalidArgument(format!("duplicate variant key {}", key)));
            }
        }
        let mut seen_samples = HashSet::with_capacity(samples.len());
        for sample in &samples {
            if !seen_samples.insert(sample) {
                return Err(AncestryError::InvalidArgument(format!("duplicate sample id {}", sample)));
            }
        }
        if let Some(bad) = genotypes.iter().find(|&&g| !(g == MISSING || (0..=2).contains(&g))) {
            return Err(AncestryError::InvalidArgument(format!(
                "genotype value {} is not a diploid alt-allele count",
                bad
            )));
        }
        Ok(Self {
            variants,
            samples,
            genotypes,
        })
    }

    /// Builds a dataset from one genotype vector per variant; `None` is a missing call.
    pub fn from_variant_rows(
        variants: Vec<VariantKey>,
        samples: Vec<String>,
        rows: Vec<Vec<Option<u8>>>,
    ) -> Result<Self> {
        let num_samples = samples.len();
        let mut matrix = Array2::<i8>::from_elem((rows.len(), num_samples), MISSING);
        for (variant_idx, row) in rows.iter().enumerate() {
            if row.len() != num_samples {
                return Err(AncestryError::InvalidArgument(format!(
                    "genotype count mismatch for variant index {}: expected {}, found {}",
                    variant_idx,
                    num_samples,
                    row.len()
                )));
            }
            for (sample_idx, call) in row.iter().enumerate() {
                if let Some(n_alt) = call {
                    matrix[[variant_idx, sample_idx]] = *n_alt as i8;
                }
            }
        }
        Self::try_new(variants, samples, matrix)
    }

    pub fn variants(&self) -> &[VariantKey] {
        &self.variants
    }

    pub fn samples(&self) -> &[String] {
        &self.samples
    }

    pub fn genotypes(&self) -> &Array2<i8> {
        &self.genotypes
    }

    pub fn n_variants(&self) -> usize {
        self.variants.len()
    }

    pub fn n_samples(&self) -> usize {
        self.samples.len()
    }

    pub fn variant_row(&self, variant_idx: usize) -> ArrayView1<'_, i8> {
        self.genotypes.row(variant_idx)
    }

    pub fn n_alt(&self, variant_idx: usize, sample_idx: usize) -> Option<u8> {
        match self.genotypes[[variant_idx, sample_idx]] {
            MISSING => None,
            g => Some(g as u8),
        }
    }

    pub fn key_set(&self) -> HashSet<VariantKey> {
        self.variants.iter().cloned().collect()
    }

    pub fn variant_index(&self) -> HashMap<&VariantKey, usize> {
        self.variants.iter().enumerate().map(|(idx, key)| (key, idx)).collect()
    }

    /// Keeps the variants for which `keep` returns true, preserving order.
    pub fn filter_variants<F>(&self, mut keep: F) -> Self
    where
        F: FnMut(usize, &VariantKey) -> bool,
    {
        let kept: Vec<usize> = self
            .variants
            .iter()
            .enumerate()
            .filter(|(idx, key)| keep(*idx, key))
            .map(|(idx, _)| idx)
            .collect();
        Self {
            variants: kept.iter().map(|&idx| self.variants[idx].clone()).collect(),
            samples: self.samples.clone(),
            genotypes: self.genotypes.select(Axis(0), &kept),
        }
    }

    /// Semi-join on the row key: keeps variants whose key is in `keys`.
    pub fn restrict_to_keys(&self, keys: &HashSet<VariantKey>) -> Self {
        self.filter_variants(|_, key| keys.contains(key))
    }

    /// Column filter: drops the listed samples, keeping all variants.
    pub fn drop_samples(&self, to_remove: &HashSet<String>) -> Self {
        let kept: Vec<usize> = self
            .samples
            .iter()
            .enumerate()
            .filter(|(_, s)| !to_remove.contains(*s))
            .map(|(idx, _)| idx)
            .collect();
        Self {
            variants: self.variants.clone(),
            samples: kept.iter().map(|&idx| self.samples[idx].clone()).collect(),
            genotypes: self.genotypes.select(Axis(1), &kept),
        }
    }

    /// Writes the dataset directory, replacing whatever was at `path`.
    pub fn write_native(&self, path: &Path) -> Result<()> {
        if path.exists() {
            debug!("Overwriting existing dataset at {}", path.display());
            if path.is_dir() {
                fs::remove_dir_all(path)?;
            } else {
                fs::remove_file(path)?;
            }
        }
        fs::create_dir_all(path)?;

        let mut variants_out = BufWriter::new(File::create(path.join(VARIANTS_FILE))?);
        writeln!(variants_out, "contig\tposition\tref\talt")?;
        for key in &self.variants {
            writeln!(
                variants_out,
                "{}\t{}\t{}\t{}",
                key.contig, key.position, key.reference, key.alternate
            )?;
        }
        variants_out.flush()?;

        let mut samples_out = BufWriter::new(File::create(path.join(SAMPLES_FILE))?);
        for sample in &self.samples {
            writeln!(samples_out, "{}", sample)?;
        }
        samples_out.flush()?;

        let genotypes_file = File::create(path.join(GENOTYPES_FILE))?;
        let mut genotypes_out = BufWriter::new(GzEncoder::new(genotypes_file, Compression::default()));
        let mut line = String::with_capacity(self.samples.len());
        for row in self.genotypes.axis_iter(Axis(0)) {
            line.clear();
            line.extend(row.iter().map(|&g| match g {
                MISSING => '.',
                g => (b'0' + g as u8) as char,
            }));
            writeln!(genotypes_out, "{}", line)?;
        }
        genotypes_out.into_inner().map_err(|e| e.into_error())?.finish()?;

        info!(
            "Wrote dataset {} ({} variants x {} samples)",
            path.display(),
            self.variants.len(),
            self.samples.len()
        );
        Ok(())
    }

    pub fn read_native(path: &Path) -> Result<Self> {
        let variants_path = path.join(VARIANTS_FILE);
        let mut variants = Vec::new();
        let reader = BufReader::new(File::open(&variants_path)?);
        for (line_num, line) in reader.lines().enumerate() {
            let line = line?;
            if line_num == 0 || line.trim().is_empty() {
                continue;
            }
            let fields: Vec<&str> = line.split('\t').collect();
            if fields.len() != 4 {
                return Err(malformed(&variants_path, line_num + 1, "expected contig, position, ref, alt"));
            }
            let position = fields[1]
                .parse::<u64>()
                .map_err(|e| malformed(&variants_path, line_num + 1, format!("bad position '{}': {}", fields[1], e)))?;
            variants.push(VariantKey::new(fields[0], position, fields[2], fields[3]));
        }

        let samples: Vec<String> = fs::read_to_string(path.join(SAMPLES_FILE))?
            .lines()
            .filter(|l| !l.is_empty())
            .map(String::from)
            .collect();

        let genotypes_path = path.join(GENOTYPES_FILE);
        let reader = BufReader::new(MultiGzDecoder::new(File::open(&genotypes_path)?));
        let mut matrix = Array2::<i8>::from_elem((variants.len(), samples.len()), MISSING);
        let mut rows_read = 0usize;
        for (line_num, line) in reader.lines().enumerate() {
            let line = line?;
            if rows_read >= variants.len() {
                return Err(malformed(&genotypes_path, line_num + 1, "more genotype rows than variants"));
            }
            if line.len() != samples.len() {
                return Err(malformed(
                    &genotypes_path,
                    line_num + 1,
                    format!("expected {} genotype codes, found {}", samples.len(), line.len()),
                ));
            }
            for (sample_idx, code) in line.bytes().enumerate() {
                matrix[[rows_read, sample_idx]] = match code {
                    b'.' => MISSING,
                    b'0'..=b'2' => (code - b'0') as i8,
                    other => {
                        return Err(malformed(
                            &genotypes_path,
                            line_num + 1,
                            format!("invalid genotype code '{}'", other as char),
                        ))
                    }
                };
            }
            rows_read += 1;
        }
        if rows_read != variants.len() {
            return Err(malformed(
                &genotypes_path,
                rows_read,
                format!("expected {} genotype rows, found {}", variants.len(), rows_read),
            ));
        }
        debug!("Read dataset {} ({} x {})", path.display(), variants.len(), samples.len());
        Self::try_new(variants, samples, matrix)
    }
}
