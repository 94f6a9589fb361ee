//! Variant-level filtering ahead of PCA: allele frequency, Hardy-Weinberg,
//! call rate, strand ambiguity, long-range LD regions and LD pruning, always
//! applied in that order.

use std::fmt;
use std::str::FromStr;

use clap::ValueEnum;
use log::{debug, info};
use serde::{Deserialize, Serialize};

use crate::dataset::GenotypeDataset;
use crate::engine::{GenotypeEngine, VariantQc};
use crate::error::{AncestryError, Result};

/// Genome build of the input coordinates.
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
pub enum ReferenceBuild {
    #[value(name = "GRCh37")]
    GRCh37,
    #[value(name = "GRCh38")]
    GRCh38,
}

impl ReferenceBuild {
    /// MHC and the chr8 inversion, which dominate PCs if left in.
    pub fn excluded_intervals(self) -> Vec<GenomicInterval> {
        let (chr6, chr8) = match self {
            ReferenceBuild::GRCh38 => ("chr6", "chr8"),
            ReferenceBuild::GRCh37 => ("6", "8"),
        };
        vec![
            GenomicInterval::new(chr6, 25_000_000, 35_000_000),
            GenomicInterval::new(chr8, 7_000_000, 13_000_000),
        ]
    }
}

impl fmt::Display for ReferenceBuild {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReferenceBuild::GRCh37 => write!(f, "GRCh37"),
            ReferenceBuild::GRCh38 => write!(f, "GRCh38"),
        }
    }
}

/// Half-open locus interval `[start, end)` on one contig.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GenomicInterval {
    pub contig: String,
    pub start: u64,
    pub end: u64,
}

fn strip_chr(contig: &str) -> &str {
    contig.strip_prefix("chr").unwrap_or(contig)
}

fn parse_position(text: &str) -> Option<u64> {
    let text = text.trim().replace(',', "");
    let (digits, multiplier) = match text.chars().last()? {
        'M' | 'm' => (&text[..text.len() - 1], 1_000_000.0),
        'K' | 'k' => (&text[..text.len() - 1], 1_000.0),
        _ => (text.as_str(), 1.0),
    };
    let value: f64 = digits.parse().ok()?;
    (value >= 0.0).then(|| (value * multiplier).round() as u64)
}

impl GenomicInterval {
    pub fn new(contig: impl Into<String>, start: u64, end: u64) -> Self {
        Self {
            contig: contig.into(),
            start,
            end,
        }
    }

    /// Contig names match with or without a `chr` prefix.
    pub fn contains(&self, contig: &str, position: u64) -> bool {
        strip_chr(&self.contig) == strip_chr(contig) && position >= self.start && position < self.end
    }
}

impl FromStr for GenomicInterval {
    type Err = AncestryError;

    /// Parses `contig:start-end` with optional `K`/`M` suffixes, e.g. `chr6:25M-35M`.
    fn from_str(s: &str) -> Result<Self> {
        let bad = || AncestryError::InvalidArgument(format!("cannot parse interval '{}'", s));
        let (contig, range) = s.rsplit_once(':').ok_or_else(bad)?;
        let (start, end) = range.split_once('-').ok_or_else(bad)?;
        let start = parse_position(start).ok_or_else(bad)?;
        let end = parse_position(end).ok_or_else(bad)?;
        if contig.is_empty() || end < start {
            return Err(bad());
        }
        Ok(Self::new(contig, start, end))
    }
}

impl fmt::Display for GenomicInterval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}-{}", self.contig, self.start, self.end)
    }
}

/// True for A/T, T/A, C/G and G/C, case-insensitively.
pub fn is_strand_ambiguous(reference: &str, alternate: &str) -> bool {
    let pair = (reference.to_ascii_uppercase(), alternate.to_ascii_uppercase());
    matches!(
        (pair.0.as_str(), pair.1.as_str()),
        ("A", "T") | ("T", "A") | ("C", "G") | ("G", "C")
    )
}

/// Thresholds for [`filter`].
#[derive(Clone, Debug, PartialEq)]
pub struct FilterConfig {
    /// Keep `maf > maf_min`.
    pub maf_min: f64,
    /// Keep `p_hwe > hwe_min`.
    pub hwe_min: f64,
    /// Keep `call_rate >= call_rate_min`.
    pub call_rate_min: f64,
    pub ld_r2_max: f64,
    pub ld_window_bp: u64,
    pub excluded_intervals: Vec<GenomicInterval>,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            maf_min: 0.05,
            hwe_min: 1e-3,
            call_rate_min: 0.98,
            ld_r2_max: 0.2,
            ld_window_bp: 250_000,
            excluded_intervals: ReferenceBuild::GRCh38.excluded_intervals(),
        }
    }
}

impl FilterConfig {
    pub fn for_build(build: ReferenceBuild) -> Self {
        Self {
            excluded_intervals: build.excluded_intervals(),
            ..Self::default()
        }
    }
}

/// Keeps variants whose statistic passes `keep`. A statistic that is
/// undefined for a row (no called genotypes) fails the predicate.
fn filter_on_stat<F, P>(
    dataset: &GenotypeDataset,
    stats: &[&VariantQc],
    statistic: &'static str,
    get: F,
    keep: P,
) -> (GenotypeDataset, Vec<usize>)
where
    F: Fn(&VariantQc) -> Option<f64>,
    P: Fn(f64) -> bool,
{
    let mut kept = Vec::with_capacity(dataset.n_variants());
    for (idx, key) in dataset.variants().iter().enumerate() {
        match get(stats[idx]) {
            Some(value) if keep(value) => kept.push(idx),
            Some(_) => {}
            None => debug!("Dropping {}: {} is undefined", key, statistic),
        }
    }
    let kept_set: Vec<bool> = {
        let mut mask = vec![false; dataset.n_variants()];
        kept.iter().for_each(|&i| mask[i] = true);
        mask
    };
    (dataset.filter_variants(|idx, _| kept_set[idx]), kept)
}

/// Runs the full filter chain and returns a new dataset.
pub fn filter(engine: &dyn GenotypeEngine, dataset: &GenotypeDataset, config: &FilterConfig) -> Result<GenotypeDataset> {
    info!("Initial number of SNPs before filtering: {}", dataset.n_variants());
    let qc = engine.variant_qc(dataset)?;
    if qc.len() != dataset.n_variants() {
        let first_missing = dataset.variants().get(qc.len()).map(|k| k.to_string()).unwrap_or_default();
        return Err(AncestryError::MissingStatistic {
            variant: first_missing,
            statistic: "variant QC",
        });
    }
    let mut stats: Vec<&VariantQc> = qc.iter().collect();

    let (ds, kept) = filter_on_stat(dataset, &stats, "allele frequency", VariantQc::maf, |maf| maf > config.maf_min);
    stats = kept.iter().map(|&i| stats[i]).collect();
    info!("Filtered variants with MAF <= {}: {} remain", config.maf_min, ds.n_variants());

    let (ds, kept) = filter_on_stat(&ds, &stats, "HWE p-value", |s| s.p_value_hwe, |p| p > config.hwe_min);
    stats = kept.iter().map(|&i| stats[i]).collect();
    info!("Filtered variants with HWE p <= {:e}: {} remain", config.hwe_min, ds.n_variants());

    let (ds, _) = filter_on_stat(&ds, &stats, "call rate", |s| s.call_rate, |cr| cr >= config.call_rate_min);
    info!("Filtered variants with call rate < {}: {} remain", config.call_rate_min, ds.n_variants());

    let ds = ds.filter_variants(|_, key| !is_strand_ambiguous(&key.reference, &key.alternate));
    info!("Filtered strand-ambiguous variants: {} remain", ds.n_variants());

    let ds = ds.filter_variants(|_, key| {
        !config
            .excluded_intervals
            .iter()
            .any(|interval| interval.contains(&key.contig, key.position))
    });
    info!(
        "Filtered variants in {}: {} remain",
        config
            .excluded_intervals
            .iter()
            .map(|i| i.to_string())
            .collect::<Vec<_>>()
            .join(", "),
        ds.n_variants()
    );

    info!(
        "LD pruning with r2 threshold {} and window size {} bp",
        config.ld_r2_max, config.ld_window_bp
    );
    let retained = engine.ld_prune(&ds, config.ld_r2_max, config.ld_window_bp)?;
    let ds = ds.restrict_to_keys(&retained);
    info!("Number of SNPs after filtering: {}", ds.n_variants());
    Ok(ds)
}

#[cfg(test)]
pub(crate) mod tests {
    use std::collections::HashSet;

    use super::*;
    use crate::dataset::tests::key;
    use crate::dataset::VariantKey;
    use crate::engine::{IbdRow, InMemoryEngine, KingRow, PcRelateRow, PcaResult};

    /// Engine returning canned per-variant statistics; LD pruning keeps everything.
    pub(crate) struct FixedStatsEngine {
        pub(crate) stats: Vec<VariantQc>,
    }

    impl GenotypeEngine for FixedStatsEngine {
        fn variant_qc(&self, _dataset: &GenotypeDataset) -> Result<Vec<VariantQc>> {
            Ok(self.stats.clone())
        }

        fn ld_prune(&self, dataset: &GenotypeDataset, _r2: f64, _window: u64) -> Result<HashSet<VariantKey>> {
            Ok(dataset.key_set())
        }

        fn pc_relate(&self, _: &GenotypeDataset, _: f64, _: usize, _: f64) -> Result<Vec<PcRelateRow>> {
            Ok(Vec::new())
        }

        fn identity_by_descent(&self, _: &GenotypeDataset, _: &[f64], _: f64) -> Result<Vec<IbdRow>> {
            Ok(Vec::new())
        }

        fn king(&self, _: &GenotypeDataset) -> Result<Vec<KingRow>> {
            Ok(Vec::new())
        }

        fn hwe_normalized_pca(&self, _: &GenotypeDataset, _: usize) -> Result<PcaResult> {
            Err(AncestryError::NoInformativeVariants)
        }
    }

    fn dataset_of(keys: Vec<VariantKey>) -> GenotypeDataset {
        let rows = keys.iter().map(|_| vec![Some(0), Some(1)]).collect();
        GenotypeDataset::from_variant_rows(keys, vec!["a".into(), "b".into()], rows).unwrap()
    }

    fn no_intervals() -> FilterConfig {
        FilterConfig {
            excluded_intervals: Vec::new(),
            ..FilterConfig::default()
        }
    }

    #[test]
    fn thresholds_use_strict_and_inclusive_bounds() {
        let keys: Vec<VariantKey> = (1..=6).map(|i| key("chr1", i * 10, "A", "G")).collect();
        let engine = FixedStatsEngine {
            stats: vec![
                VariantQc::from_stats(0.05, 0.5, 1.0),   // maf == min: dropped
                VariantQc::from_stats(0.06, 0.5, 1.0),   // kept
                VariantQc::from_stats(0.30, 1e-3, 1.0),  // hwe == min: dropped
                VariantQc::from_stats(0.30, 2e-3, 0.98), // call rate == min: kept
                VariantQc::from_stats(0.30, 2e-3, 0.97), // dropped
                VariantQc::from_stats(0.96, 0.5, 1.0),   // maf 0.04 via ref allele: dropped
            ],
        };
        let out = filter(&engine, &dataset_of(keys.clone()), &no_intervals()).unwrap();
        assert_eq!(out.variants(), &[keys[1].clone(), keys[3].clone()]);
    }

    #[test]
    fn strand_ambiguous_pairs_are_removed() {
        let keys = vec![
            key("1", 1, "A", "T"),
            key("1", 2, "t", "a"),
            key("1", 3, "C", "G"),
            key("1", 4, "G", "c"),
            key("1", 5, "A", "G"),
            key("1", 6, "C", "T"),
            key("1", 7, "AT", "A"),
        ];
        let engine = FixedStatsEngine {
            stats: vec![VariantQc::from_stats(0.3, 0.5, 1.0); keys.len()],
        };
        let out = filter(&engine, &dataset_of(keys.clone()), &no_intervals()).unwrap();
        assert_eq!(out.variants(), &keys[4..]);
    }

    #[test]
    fn excluded_regions_are_half_open() {
        let keys = vec![
            key("chr6", 24_999_999, "A", "G"),
            key("chr6", 25_000_000, "A", "G"),
            key("chr6", 35_000_000, "A", "G"),
            key("8", 10_000_000, "A", "G"),
        ];
        let engine = FixedStatsEngine {
            stats: vec![VariantQc::from_stats(0.3, 0.5, 1.0); keys.len()],
        };
        let out = filter(&engine, &dataset_of(keys.clone()), &FilterConfig::default()).unwrap();
        assert_eq!(out.variants(), &[keys[0].clone(), keys[2].clone()]);
    }

    #[test]
    fn undefined_statistic_drops_the_variant() {
        let keys = vec![key("1", 1, "A", "G"), key("1", 2, "A", "G"), key("1", 3, "A", "G")];
        let mut no_af = VariantQc::from_stats(0.3, 0.5, 1.0);
        no_af.allele_frequency = None;
        let mut no_hwe = VariantQc::from_stats(0.3, 0.5, 1.0);
        no_hwe.p_value_hwe = None;
        let engine = FixedStatsEngine {
            stats: vec![no_af, VariantQc::from_stats(0.3, 0.5, 1.0), no_hwe],
        };
        let out = filter(&engine, &dataset_of(keys.clone()), &no_intervals()).unwrap();
        assert_eq!(out.variants(), &[keys[1].clone()]);
    }

    #[test]
    fn all_missing_variant_is_filtered_out() {
        let keys = vec![key("chr1", 100, "A", "G"), key("chr1", 900_000, "C", "T")];
        let polymorphic: Vec<Option<u8>> = [0, 1, 2, 1, 0, 1, 2, 1, 0, 1].iter().map(|&g| Some(g)).collect();
        let rows = vec![polymorphic, vec![None; 10]];
        let samples = (0..10).map(|i| format!("s{}", i)).collect();
        let dataset = GenotypeDataset::from_variant_rows(keys.clone(), samples, rows).unwrap();
        let config = FilterConfig {
            hwe_min: 0.0,
            call_rate_min: 0.0,
            ..no_intervals()
        };
        let out = filter(&InMemoryEngine::default(), &dataset, &config).unwrap();
        assert_eq!(out.variants(), &[keys[0].clone()]);
    }

    #[test]
    fn short_statistics_are_fatal() {
        let keys = vec![key("1", 1, "A", "G"), key("1", 2, "A", "G")];
        let engine = FixedStatsEngine {
            stats: vec![VariantQc::from_stats(0.3, 0.5, 1.0)],
        };
        assert!(filter(&engine, &dataset_of(keys), &no_intervals()).is_err());
    }

    #[test]
    fn interval_strings_accept_suffixes() {
        let interval: GenomicInterval = "chr8:7M-13M".parse().unwrap();
        assert_eq!(interval, GenomicInterval::new("chr8", 7_000_000, 13_000_000));
        let interval: GenomicInterval = "2:150k-2,000,000".parse().unwrap();
        assert_eq!((interval.start, interval.end), (150_000, 2_000_000));
        assert!("chr8".parse::<GenomicInterval>().is_err());
        assert!("chr8:13M-7M".parse::<GenomicInterval>().is_err());
    }

    #[test]
    fn grch37_intervals_match_prefixed_contigs() {
        let intervals = ReferenceBuild::GRCh37.excluded_intervals();
        assert!(intervals[0].contains("chr6", 30_000_000));
        assert!(intervals[0].contains("6", 30_000_000));
        assert!(!intervals[1].contains("chr9", 10_000_000));
    }
}
