//! The genotype-statistics engine the pipeline stages are written against.
//!
//! Stages never compute allele frequencies, LD, kinship or eigenvectors
//! themselves; they call a [`GenotypeEngine`]. [`InMemoryEngine`] is the
//! implementation used by the binary: a dense `ndarray` matrix with rayon
//! over variants or sample pairs. Tests substitute small fakes.

mod kinship;
mod ld;
mod pca;
mod qc;

use std::collections::HashSet;

use indicatif::{ProgressBar, ProgressStyle};
use ndarray::Array2;

use crate::dataset::{GenotypeDataset, VariantKey};
use crate::error::Result;

pub use qc::hwe_exact_p_value;

/// Per-variant genotype aggregates.
#[derive(Clone, Debug, PartialEq)]
pub struct VariantQc {
    /// `[ref, alt]` allele frequencies over called genotypes.
    pub allele_frequency: Option<[f64; 2]>,
    pub p_value_hwe: Option<f64>,
    pub call_rate: Option<f64>,
    pub n_called: usize,
    pub n_het: usize,
}

impl VariantQc {
    /// Aggregates with only the three statistics the filter reads.
    pub fn from_stats(alt_frequency: f64, p_value_hwe: f64, call_rate: f64) -> Self {
        Self {
            allele_frequency: Some([1.0 - alt_frequency, alt_frequency]),
            p_value_hwe: Some(p_value_hwe),
            call_rate: Some(call_rate),
            n_called: 0,
            n_het: 0,
        }
    }

    pub fn alt_frequency(&self) -> Option<f64> {
        self.allele_frequency.map(|af| af[1])
    }

    /// Minor allele frequency: the smaller entry of `allele_frequency`.
    pub fn maf(&self) -> Option<f64> {
        self.allele_frequency.map(|af| af[0].min(af[1]))
    }
}

/// One PC-Relate kinship estimate.
#[derive(Clone, Debug, PartialEq)]
pub struct PcRelateRow {
    pub i: String,
    pub j: String,
    pub kin: f64,
}

/// One PLINK-style identity-by-descent estimate.
#[derive(Clone, Debug, PartialEq)]
pub struct IbdRow {
    pub i: String,
    pub j: String,
    pub ibs0: usize,
    pub ibs1: usize,
    pub ibs2: usize,
    pub z0: f64,
    pub z1: f64,
    pub z2: f64,
    pub pi_hat: f64,
}

/// One entry of the KING kinship matrix; `s_1 == s` on the diagonal.
#[derive(Clone, Debug, PartialEq)]
pub struct KingRow {
    pub s_1: String,
    pub s: String,
    /// Undefined when neither sample is heterozygous at any shared site.
    pub phi: Option<f64>,
}

/// Output of an HWE-normalised PCA.
#[derive(Clone, Debug)]
pub struct PcaResult {
    pub eigenvalues: Vec<f64>,
    /// Samples x components, in dataset sample order.
    pub scores: Array2<f64>,
    /// Variants x components, one row per entry of `variants`.
    pub loadings: Array2<f64>,
    /// Variants that entered the decomposition (polymorphic and called).
    pub variants: Vec<VariantKey>,
}

/// Aggregate statistics and matrix operations consumed by the pipeline.
pub trait GenotypeEngine: Sync {
    /// One entry per dataset variant, in dataset order.
    fn variant_qc(&self, dataset: &GenotypeDataset) -> Result<Vec<VariantQc>>;

    /// Keys of the variants retained after pruning pairs with `r² > r2`
    /// that lie within `bp_window_size` of each other on one contig.
    fn ld_prune(&self, dataset: &GenotypeDataset, r2: f64, bp_window_size: u64) -> Result<HashSet<VariantKey>>;

    /// Pairs with kinship at or above `min_kinship`.
    fn pc_relate(
        &self,
        dataset: &GenotypeDataset,
        min_individual_maf: f64,
        k: usize,
        min_kinship: f64,
    ) -> Result<Vec<PcRelateRow>>;

    /// Pairs with `PI_HAT` at or above `min_pi_hat`. `maf` is per dataset variant.
    fn identity_by_descent(&self, dataset: &GenotypeDataset, maf: &[f64], min_pi_hat: f64) -> Result<Vec<IbdRow>>;

    /// The full KING matrix, self-pairs included.
    fn king(&self, dataset: &GenotypeDataset) -> Result<Vec<KingRow>>;

    fn hwe_normalized_pca(&self, dataset: &GenotypeDataset, k: usize) -> Result<PcaResult>;
}

/// Dense in-memory engine.
#[derive(Debug, Clone, Default)]
pub struct InMemoryEngine {
    /// Draw progress bars for the pairwise loops.
    pub show_progress: bool,
}

impl InMemoryEngine {
    pub fn new(show_progress: bool) -> Self {
        Self { show_progress }
    }

    pub(crate) fn progress_bar(&self, len: u64, unit: &str) -> ProgressBar {
        if !self.show_progress {
            return ProgressBar::hidden();
        }
        let template = format!(
            "{{spinner:.green}} [{{elapsed_precise}}] [{{bar:40.cyan/blue}}] {{pos}}/{{len}} {} ({{percent}}%) ETA: {{eta}}",
            unit
        );
        match ProgressStyle::default_bar().template(&template) {
            Ok(style) => ProgressBar::new(len).with_style(style.progress_chars("=> ")),
            Err(_) => ProgressBar::new(len),
        }
    }
}

impl GenotypeEngine for InMemoryEngine {
    fn variant_qc(&self, dataset: &GenotypeDataset) -> Result<Vec<VariantQc>> {
        Ok(qc::variant_qc(dataset))
    }

    fn ld_prune(&self, dataset: &GenotypeDataset, r2: f64, bp_window_size: u64) -> Result<HashSet<VariantKey>> {
        let stats = qc::variant_qc(dataset);
        ld::ld_prune(dataset, &stats, r2, bp_window_size)
    }

    fn pc_relate(
        &self,
        dataset: &GenotypeDataset,
        min_individual_maf: f64,
        k: usize,
        min_kinship: f64,
    ) -> Result<Vec<PcRelateRow>> {
        let pcs = pca::hwe_normalized_pca(dataset, k)?;
        kinship::pc_relate(self, dataset, &pcs.scores, min_individual_maf, min_kinship)
    }

    fn identity_by_descent(&self, dataset: &GenotypeDataset, maf: &[f64], min_pi_hat: f64) -> Result<Vec<IbdRow>> {
        kinship::identity_by_descent(self, dataset, maf, min_pi_hat)
    }

    fn king(&self, dataset: &GenotypeDataset) -> Result<Vec<KingRow>> {
        Ok(kinship::king(self, dataset))
    }

    fn hwe_normalized_pca(&self, dataset: &GenotypeDataset, k: usize) -> Result<PcaResult> {
        pca::hwe_normalized_pca(dataset, k)
    }
}
