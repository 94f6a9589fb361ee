use std::cmp::Ordering;
use std::collections::HashSet;
use std::fmt;
use std::path::Path;

use clap::ValueEnum;
use log::info;

use crate::dataset::GenotypeDataset;
use crate::engine::GenotypeEngine;
use crate::error::{AncestryError, Result};
use crate::graph::maximal_independent_set;
use crate::output;

/// Upper bound of the KING kinship coefficient (a sample with itself).
pub const KING_MAX_KINSHIP: f64 = 0.5;

const PC_RELATE_MIN_INDIVIDUAL_MAF: f64 = 0.01;
const PC_RELATE_K: usize = 10;

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum RelatednessMethod {
    #[value(name = "pc_relate")]
    PcRelate,
    #[value(name = "ibd")]
    Ibd,
    #[value(name = "king")]
    King,
}

impl fmt::Display for RelatednessMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RelatednessMethod::PcRelate => "pc_relate",
            RelatednessMethod::Ibd => "ibd",
            RelatednessMethod::King => "king",
        };
        write!(f, "{}", name)
    }
}

#[derive(Clone, Debug)]
pub struct RelatednessOutcome {
    pub dataset: GenotypeDataset,
    /// Removed sample ids in removal order.
    pub removed: Vec<String>,
}

pub fn checks_file_name(method: RelatednessMethod) -> String {
    format!("relatedness_checks_{}.tsv.bgz", method)
}

pub const REMOVED_SAMPLES_FILE: &str = "relatedness_removed_samples.tsv";

/// Computes pairwise relatedness, writes the statistics table and drops one
/// sample from every related pair via a maximal independent set.
pub fn resolve(
    engine: &dyn GenotypeEngine,
    dataset: &GenotypeDataset,
    method: RelatednessMethod,
    min_kinship: f64,
    out_dir: &Path,
) -> Result<RelatednessOutcome> {
    let checks_path = out_dir.join(checks_file_name(method));
    let edges: Vec<(String, String)> = match method {
        RelatednessMethod::PcRelate => {
            info!("Using PC-Relate for relatedness checks");
            let rows = engine.pc_relate(dataset, PC_RELATE_MIN_INDIVIDUAL_MAF, PC_RELATE_K, min_kinship)?;
            output::write_pc_relate(&checks_path, &rows)?;
            rows.into_iter()
                .filter(|r| r.kin >= min_kinship)
                .map(|r| (r.i, r.j))
                .collect()
        }
        RelatednessMethod::Ibd => {
            info!("Using PLINK-style IBD for relatedness checks");
            let qc = engine.variant_qc(dataset)?;
            if qc.len() != dataset.n_variants() {
                return Err(AncestryError::MissingStatistic {
                    variant: dataset.variants().get(qc.len()).map(|k| k.to_string()).unwrap_or_default(),
                    statistic: "allele frequency",
                });
            }
            // variants without any called genotype carry no IBD information
            let maf_defined: Vec<Option<f64>> = qc.iter().map(|q| q.maf()).collect();
            let called = dataset.filter_variants(|idx, _| maf_defined[idx].is_some());
            let maf: Vec<f64> = maf_defined.into_iter().flatten().collect();
            let rows = engine.identity_by_descent(&called, &maf, min_kinship)?;
            output::write_ibd(&checks_path, &rows)?;
            rows.into_iter()
                .filter(|r| r.pi_hat >= min_kinship)
                .map(|r| (r.i, r.j))
                .collect()
        }
        RelatednessMethod::King => {
            info!("Using KING for relatedness checks");
            if min_kinship > KING_MAX_KINSHIP {
                return Err(AncestryError::KinshipBound {
                    max: KING_MAX_KINSHIP,
                    requested: min_kinship,
                });
            }
            let related: Vec<_> = engine
                .king(dataset)?
                .into_iter()
                .filter(|r| r.s_1 != r.s && r.phi.is_some_and(|phi| phi >= min_kinship))
                .collect();
            output::write_king(&checks_path, &related)?;
            related.into_iter().map(|r| (r.s_1, r.s)).collect()
        }
    };
    info!("Exported relatedness statistics to {}", checks_path.display());

    let removed = samples_to_remove(&edges);
    if removed.is_empty() {
        info!("No samples failed the relatedness check");
        return Ok(RelatednessOutcome {
            dataset: dataset.clone(),
            removed,
        });
    }

    info!("Number of samples that fail relatedness checks: {}", removed.len());
    output::write_removed_samples(&out_dir.join(REMOVED_SAMPLES_FILE), &removed)?;
    let to_drop: HashSet<String> = removed.iter().cloned().collect();
    Ok(RelatednessOutcome {
        dataset: dataset.drop_samples(&to_drop),
        removed,
    })
}

/// Vertices outside the maximal independent set of the relatedness graph.
/// Ties go to the lexicographically greatest sample id.
pub fn samples_to_remove(edges: &[(String, String)]) -> Vec<String> {
    maximal_independent_set(edges, |a: &String, b: &String| -> Ordering { a.cmp(b) }).removed
}
