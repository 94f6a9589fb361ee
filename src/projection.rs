//! Reference-panel PCA and projection of study samples onto its basis.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use log::{info, warn};
use ndarray::Array2;
use rayon::prelude::*;

use crate::dataset::{GenotypeDataset, VariantKey, MISSING};
use crate::engine::GenotypeEngine;
use crate::error::{malformed, AncestryError, Result};
use crate::merge::{column_index, parse_f64, tsv_reader, ScoreTable};
use crate::output::{self, finish_tsv, tsv_writer};

/// Number of reference PCs computed and reported.
pub const DEFAULT_NUM_PCS: usize = 20;

/// Prefix of every reference-panel artifact.
pub const REFERENCE_PREFIX: &str = "1000G";

/// File names of the reference basis artifacts under one output directory.
#[derive(Clone, Debug)]
pub struct BasisPaths {
    pub scores_table: PathBuf,
    pub scores_export: PathBuf,
    pub loadings: PathBuf,
    pub eigenvalues: PathBuf,
}

impl BasisPaths {
    pub fn new(out_dir: &Path) -> Self {
        Self {
            scores_table: out_dir.join(format!("{}_scores.ht", REFERENCE_PREFIX)),
            scores_export: out_dir.join(format!("{}_scores.txt.bgz", REFERENCE_PREFIX)),
            loadings: out_dir.join(format!("{}_loadings.ht", REFERENCE_PREFIX)),
            eigenvalues: out_dir.join(format!("{}_eigenvalues.tsv", REFERENCE_PREFIX)),
        }
    }
}

pub fn study_intersect_path(out_dir: &Path, data_basename: &str) -> PathBuf {
    out_dir.join(format!("{}_intersect_{}.mt", data_basename, REFERENCE_PREFIX))
}

pub fn reference_intersect_path(out_dir: &Path, data_basename: &str) -> PathBuf {
    out_dir.join(format!("{}_intersect_{}.mt", REFERENCE_PREFIX, data_basename))
}

/// Restricts study and reference to their shared variant keys and writes
/// both intersections, replacing earlier ones. Returns `(study, reference)`.
pub fn intersect(
    study: &GenotypeDataset,
    reference: &GenotypeDataset,
    data_basename: &str,
    out_dir: &Path,
) -> Result<(GenotypeDataset, GenotypeDataset)> {
    let reference_keys = reference.key_set();
    let study_in_ref = study.restrict_to_keys(&reference_keys);
    info!(
        "Sites in ref and data, inds in data: ({}, {})",
        study_in_ref.n_variants(),
        study_in_ref.n_samples()
    );
    study_in_ref.write_native(&study_intersect_path(out_dir, data_basename))?;

    let ref_in_study = reference.restrict_to_keys(&study.key_set());
    info!(
        "Sites in ref and data, inds in ref: ({}, {})",
        ref_in_study.n_variants(),
        ref_in_study.n_samples()
    );
    ref_in_study.write_native(&reference_intersect_path(out_dir, data_basename))?;
    Ok((study_in_ref, ref_in_study))
}

/// Per-variant loadings plus the allele frequency used to normalise them.
#[derive(Clone, Debug, PartialEq)]
pub struct LoadingsTable {
    pub variants: Vec<VariantKey>,
    pub pca_af: Vec<f64>,
    /// Variants x components.
    pub loadings: Array2<f64>,
}

impl LoadingsTable {
    pub fn num_pcs(&self) -> usize {
        self.loadings.ncols()
    }

    pub fn write(&self, path: &Path) -> Result<()> {
        let mut writer = tsv_writer(path)?;
        let mut header: Vec<String> = ["contig", "position", "ref", "alt", "pca_af"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        header.extend((1..=self.num_pcs()).map(|i| format!("loading{}", i)));
        writer.write_record(&header)?;
        for (idx, key) in self.variants.iter().enumerate() {
            let mut record = vec![
                key.contig.clone(),
                key.position.to_string(),
                key.reference.clone(),
                key.alternate.clone(),
                self.pca_af[idx].to_string(),
            ];
            record.extend(self.loadings.row(idx).iter().map(|v| v.to_string()));
            writer.write_record(&record)?;
        }
        finish_tsv(writer)?;
        info!("Wrote loadings for {} variants to {}", self.variants.len(), path.display());
        Ok(())
    }

    pub fn read(path: &Path) -> Result<Self> {
        let mut reader = tsv_reader(path)?;
        let headers = reader.headers()?.clone();
        let contig = column_index(&headers, path, "contig")?;
        let position = column_index(&headers, path, "position")?;
        let reference = column_index(&headers, path, "ref")?;
        let alternate = column_index(&headers, path, "alt")?;
        let af = column_index(&headers, path, "pca_af")?;
        let mut loading_idx = Vec::new();
        while let Some(idx) = headers
            .iter()
            .position(|h| h == format!("loading{}", loading_idx.len() + 1))
        {
            loading_idx.push(idx);
        }

        let mut variants = Vec::new();
        let mut pca_af = Vec::new();
        let mut values = Vec::new();
        for (row_num, record) in reader.records().enumerate() {
            let record = record?;
            let line = row_num + 2;
            let field = |idx: usize| record.get(idx).unwrap_or_default();
            let pos = field(position)
                .parse::<u64>()
                .map_err(|e| malformed(path, line, format!("bad position '{}': {}", field(position), e)))?;
            variants.push(VariantKey::new(field(contig), pos, field(reference), field(alternate)));
            pca_af.push(parse_f64(path, line, field(af))?);
            for &idx in &loading_idx {
                values.push(parse_f64(path, line, field(idx))?);
            }
        }
        let loadings = Array2::from_shape_vec((variants.len(), loading_idx.len()), values)
            .map_err(|e| AncestryError::InvalidArgument(e.to_string()))?;
        Ok(Self {
            variants,
            pca_af,
            loadings,
        })
    }
}

/// Reference PCA output.
#[derive(Clone, Debug)]
pub struct ReferenceBasis {
    pub eigenvalues: Vec<f64>,
    pub scores: ScoreTable,
    pub loadings: LoadingsTable,
}

/// HWE-normalised PCA of the reference, persisted as scores, loadings and eigenvalues.
pub fn compute_basis(
    engine: &dyn GenotypeEngine,
    reference: &GenotypeDataset,
    k: usize,
    out_dir: &Path,
) -> Result<ReferenceBasis> {
    info!("Computing reference PCs (k = {})", k);
    let pca = engine.hwe_normalized_pca(reference, k)?;
    if pca.scores.ncols() < k {
        warn!(
            "Reference PCA produced {} of {} requested components",
            pca.scores.ncols(),
            k
        );
    }

    // pca_af is the mean alt-allele count / 2 over called genotypes
    let qc = engine.variant_qc(reference)?;
    let index = reference.variant_index();
    let pca_af = pca
        .variants
        .iter()
        .map(|key| {
            index
                .get(key)
                .and_then(|&idx| qc.get(idx))
                .and_then(|q| q.alt_frequency())
                .ok_or_else(|| AncestryError::MissingStatistic {
                    variant: key.to_string(),
                    statistic: "allele frequency",
                })
        })
        .collect::<Result<Vec<f64>>>()?;

    let basis = ReferenceBasis {
        eigenvalues: pca.eigenvalues,
        scores: ScoreTable {
            samples: reference.samples().to_vec(),
            scores: pca.scores,
        },
        loadings: LoadingsTable {
            variants: pca.variants,
            pca_af,
            loadings: pca.loadings,
        },
    };

    let paths = BasisPaths::new(out_dir);
    basis.scores.write(&paths.scores_table)?;
    basis.scores.write(&paths.scores_export)?;
    basis.loadings.write(&paths.loadings)?;
    output::write_eigenvalues(&paths.eigenvalues, &basis.eigenvalues)?;
    Ok(basis)
}

/// Projects every sample of `dataset` onto the basis in `loadings`.
///
/// Uses the variants present in both with `0 < pca_af < 1`; with `n` such
/// variants each genotype is normalised as `(g - 2af) / sqrt(n * 2af(1-af))`
/// and score `c` is the sum of `loading_c * z`. Missing genotypes contribute
/// nothing.
pub fn pc_project(dataset: &GenotypeDataset, loadings: &LoadingsTable) -> Result<ScoreTable> {
    let loading_index: HashMap<&VariantKey, usize> = loadings
        .variants
        .iter()
        .enumerate()
        .map(|(idx, key)| (key, idx))
        .collect();

    // (dataset row, loadings row)
    let retained: Vec<(usize, usize)> = dataset
        .variants()
        .iter()
        .enumerate()
        .filter_map(|(row, key)| {
            let &l = loading_index.get(key)?;
            let af = loadings.pca_af[l];
            (af > 0.0 && af < 1.0).then_some((row, l))
        })
        .collect();

    let n = retained.len();
    if n == 0 {
        return Err(AncestryError::NoInformativeVariants);
    }
    info!(
        "Projecting {} samples onto {} PCs using {} variants",
        dataset.n_samples(),
        loadings.num_pcs(),
        n
    );

    let num_pcs = loadings.num_pcs();
    let genotypes = dataset.genotypes();
    let rows: Vec<Vec<f64>> = (0..dataset.n_samples())
        .into_par_iter()
        .map(|s| {
            let mut scores = vec![0.0; num_pcs];
            let mut called = 0usize;
            for &(row, l) in &retained {
                let g = genotypes[[row, s]];
                if g == MISSING {
                    continue;
                }
                called += 1;
                let af = loadings.pca_af[l];
                let z = (g as f64 - 2.0 * af) / (n as f64 * 2.0 * af * (1.0 - af)).sqrt();
                if !z.is_finite() {
                    return Err(AncestryError::NonFinite(format!(
                        "normalising genotype of {} at {}",
                        dataset.samples()[s],
                        loadings.variants[l]
                    )));
                }
                for (pc, score) in scores.iter_mut().enumerate() {
                    *score += loadings.loadings[[l, pc]] * z;
                }
            }
            if called == 0 {
                return Err(AncestryError::NoCalledGenotypes(dataset.samples()[s].clone()));
            }
            if let Some(pc) = scores.iter().position(|v| !v.is_finite()) {
                return Err(AncestryError::NonFinite(format!(
                    "projecting {} onto PC{}",
                    dataset.samples()[s],
                    pc + 1
                )));
            }
            Ok(scores)
        })
        .collect::<Result<Vec<_>>>()?;

    let scores = Array2::from_shape_vec((rows.len(), num_pcs), rows.into_iter().flatten().collect())
        .map_err(|e| AncestryError::InvalidArgument(e.to_string()))?;
    Ok(ScoreTable {
        samples: dataset.samples().to_vec(),
        scores,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::tests::key;
    use crate::engine::InMemoryEngine;
    use approx::assert_relative_eq;
    use ndarray::array;

    fn reference_panel() -> GenotypeDataset {
        let rows: Vec<Vec<u8>> = vec![
            vec![0, 0, 1, 2, 2, 1],
            vec![2, 1, 2, 0, 0, 1],
            vec![0, 1, 0, 2, 1, 2],
            vec![1, 0, 0, 1, 2, 2],
            vec![2, 2, 1, 0, 1, 0],
        ];
        GenotypeDataset::from_variant_rows(
            (0..rows.len()).map(|i| key("chr2", 100 * (i as u64 + 1), "C", "T")).collect(),
            (0..6).map(|s| format!("R{}", s)).collect(),
            rows.into_iter().map(|r| r.into_iter().map(Some).collect()).collect(),
        )
        .unwrap()
    }

    fn two_site_loadings() -> LoadingsTable {
        LoadingsTable {
            variants: vec![key("1", 10, "A", "G"), key("1", 20, "A", "G"), key("1", 30, "A", "G")],
            pca_af: vec![0.5, 0.25, 1.0],
            loadings: array![[1.0, 0.0], [0.5, -1.0], [9.0, 9.0]],
        }
    }

    #[test]
    fn intersections_share_one_key_set() {
        let dir = tempfile::tempdir().unwrap();
        let study = GenotypeDataset::from_variant_rows(
            vec![key("chr2", 100, "C", "T"), key("chr2", 150, "A", "G"), key("chr2", 300, "C", "T")],
            vec!["X".into()],
            vec![vec![Some(1)], vec![Some(0)], vec![None]],
        )
        .unwrap();
        let (s, r) = intersect(&study, &reference_panel(), "study", dir.path()).unwrap();
        assert_eq!(s.key_set(), r.key_set());
        assert_eq!(s.n_variants(), 2);
        assert_eq!(r.n_samples(), 6);

        let reread = GenotypeDataset::read_native(&reference_intersect_path(dir.path(), "study")).unwrap();
        assert_eq!(reread.key_set(), s.key_set());
        assert!(study_intersect_path(dir.path(), "study").ends_with("study_intersect_1000G.mt"));
    }

    #[test]
    fn projection_matches_closed_form() {
        let ds = GenotypeDataset::from_variant_rows(
            vec![key("1", 10, "A", "G"), key("1", 20, "A", "G"), key("1", 30, "A", "G"), key("1", 40, "A", "G")],
            vec!["P".into()],
            vec![vec![Some(2)], vec![Some(0)], vec![Some(1)], vec![Some(1)]],
        )
        .unwrap();
        let projected = pc_project(&ds, &two_site_loadings()).unwrap();
        // two retained sites: af 1.0 is excluded, the fourth has no loading
        let z1 = (2.0 - 1.0) / (2.0f64 * 2.0 * 0.5 * 0.5).sqrt();
        let z2 = (0.0 - 0.5) / (2.0f64 * 2.0 * 0.25 * 0.75).sqrt();
        assert_relative_eq!(projected.scores[[0, 0]], z1 + 0.5 * z2, epsilon = 1e-12);
        assert_relative_eq!(projected.scores[[0, 1]], -z2, epsilon = 1e-12);

        let again = pc_project(&ds, &two_site_loadings()).unwrap();
        assert_eq!(projected, again);
    }

    #[test]
    fn sample_without_calls_is_fatal() {
        let ds = GenotypeDataset::from_variant_rows(
            vec![key("1", 10, "A", "G"), key("1", 20, "A", "G")],
            vec!["ok".into(), "empty".into()],
            vec![vec![Some(1), None], vec![Some(0), None]],
        )
        .unwrap();
        let err = pc_project(&ds, &two_site_loadings()).unwrap_err();
        assert!(matches!(err, AncestryError::NoCalledGenotypes(ref s) if s == "empty"));
    }

    #[test]
    fn no_shared_variant_is_fatal() {
        let ds = GenotypeDataset::from_variant_rows(vec![key("9", 1, "A", "G")], vec!["x".into()], vec![vec![Some(1)]])
            .unwrap();
        assert!(matches!(
            pc_project(&ds, &two_site_loadings()),
            Err(AncestryError::NoInformativeVariants)
        ));
    }

    #[test]
    fn reference_projects_onto_its_own_scores() {
        let dir = tempfile::tempdir().unwrap();
        let reference = reference_panel();
        let basis = compute_basis(&InMemoryEngine::default(), &reference, DEFAULT_NUM_PCS, dir.path()).unwrap();
        let reread = LoadingsTable::read(&BasisPaths::new(dir.path()).loadings).unwrap();
        let projected = pc_project(&reference, &reread).unwrap();

        assert_eq!(projected.scores.dim(), basis.scores.scores.dim());
        for (a, b) in projected.scores.iter().zip(basis.scores.scores.iter()) {
            assert_relative_eq!(a, b, epsilon = 1e-9);
        }
        let paths = BasisPaths::new(dir.path());
        assert!(paths.scores_table.exists() && paths.scores_export.exists() && paths.eigenvalues.exists());
    }
}
