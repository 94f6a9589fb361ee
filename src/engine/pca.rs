use log::{info, warn};
use nalgebra::{DMatrix, SymmetricEigen};
use ndarray::Array2;
use rayon::prelude::*;

use super::PcaResult;
use crate::dataset::{GenotypeDataset, MISSING};
use crate::error::{AncestryError, Result};

/// Eigenvalues at or below this fraction of the largest are treated as zero.
const EIGENVALUE_TOLERANCE: f64 = 1e-10;

/// HWE-normalised PCA.
///
/// Each polymorphic variant contributes the row `(g - 2p) / sqrt(2p(1-p)m)`
/// with missing genotypes set to zero, where `p` is the alt frequency over
/// called genotypes and `m` the number of contributing variants. Components
/// come from the eigendecomposition of the sample-by-sample Gram matrix:
/// scores are `u * sqrt(lambda)` and loadings `Z' u / sqrt(lambda)`.
pub(super) fn hwe_normalized_pca(dataset: &GenotypeDataset, k: usize) -> Result<PcaResult> {
    if k == 0 {
        return Err(AncestryError::InvalidArgument("PCA needs at least one component".into()));
    }
    let num_samples = dataset.n_samples();

    let normalized: Vec<(usize, Vec<f64>)> = (0..dataset.n_variants())
        .into_par_iter()
        .filter_map(|variant_idx| {
            let row = dataset.variant_row(variant_idx);
            let (mut alt, mut called) = (0u64, 0u64);
            for &g in row.iter().filter(|&&g| g != MISSING) {
                alt += g as u64;
                called += 1;
            }
            if called == 0 {
                return None;
            }
            let p = alt as f64 / (2 * called) as f64;
            if p <= 0.0 || p >= 1.0 {
                return None;
            }
            let scale = (2.0 * p * (1.0 - p)).sqrt();
            let centred = row
                .iter()
                .map(|&g| if g == MISSING { 0.0 } else { (g as f64 - 2.0 * p) / scale })
                .collect();
            Some((variant_idx, centred))
        })
        .collect();

    let m = normalized.len();
    if m == 0 || num_samples == 0 {
        return Err(AncestryError::NoInformativeVariants);
    }
    info!("Running HWE-normalised PCA on {} samples x {} polymorphic variants", num_samples, m);

    let norm = (m as f64).sqrt();
    let z = DMatrix::<f64>::from_fn(m, num_samples, |v, s| normalized[v].1[s] / norm);
    let gram = z.transpose() * &z;
    let eigen = SymmetricEigen::new(gram);

    let mut order: Vec<usize> = (0..num_samples).collect();
    order.sort_by(|&a, &b| eigen.eigenvalues[b].total_cmp(&eigen.eigenvalues[a]));
    let largest = eigen.eigenvalues[order[0]].max(0.0);
    let usable: Vec<usize> = order
        .into_iter()
        .take_while(|&c| eigen.eigenvalues[c] > largest * EIGENVALUE_TOLERANCE && eigen.eigenvalues[c] > 0.0)
        .collect();

    if usable.len() < k {
        warn!(
            "Requested {} principal components but only {} are available; computing {}",
            k,
            usable.len(),
            usable.len()
        );
    }
    let components: Vec<usize> = usable.into_iter().take(k).collect();
    if components.is_empty() {
        return Err(AncestryError::NoInformativeVariants);
    }

    let eigenvalues: Vec<f64> = components.iter().map(|&c| eigen.eigenvalues[c]).collect();
    let scores = Array2::from_shape_fn((num_samples, components.len()), |(s, pc)| {
        let c = components[pc];
        eigen.eigenvectors[(s, c)] * eigenvalues[pc].sqrt()
    });

    let zu = &z * &eigen.eigenvectors;
    let loadings = Array2::from_shape_fn((m, components.len()), |(v, pc)| {
        zu[(v, components[pc])] / eigenvalues[pc].sqrt()
    });

    let variants = normalized
        .iter()
        .map(|(idx, _)| dataset.variants()[*idx].clone())
        .collect();

    Ok(PcaResult {
        eigenvalues,
        scores,
        loadings,
        variants,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::tests::key;
    use approx::assert_relative_eq;

    fn two_cluster_dataset() -> GenotypeDataset {
        let rows: Vec<Vec<u8>> = vec![
            vec![0, 0, 0, 2, 2, 2],
            vec![0, 1, 0, 2, 1, 2],
            vec![2, 2, 2, 0, 0, 0],
            vec![1, 1, 1, 1, 1, 1],
            vec![0, 0, 1, 2, 2, 1],
        ];
        GenotypeDataset::from_variant_rows(
            (0..rows.len()).map(|i| key("1", 1_000 * (i as u64 + 1), "C", "T")).collect(),
            (0..6).map(|s| format!("S{}", s)).collect(),
            rows.into_iter().map(|r| r.into_iter().map(Some).collect()).collect(),
        )
        .unwrap()
    }

    #[test]
    fn first_component_separates_the_clusters() {
        let result = hwe_normalized_pca(&two_cluster_dataset(), 2).unwrap();
        assert_eq!(result.scores.dim(), (6, 2));
        let pc1 = result.scores.column(0);
        assert!(pc1[0].signum() == pc1[1].signum() && pc1[1].signum() == pc1[2].signum());
        assert!(pc1[0].signum() != pc1[3].signum());
        assert!(result.eigenvalues[0] >= result.eigenvalues[1]);
    }

    #[test]
    fn monomorphic_variants_are_excluded() {
        let result = hwe_normalized_pca(&two_cluster_dataset(), 1).unwrap();
        // all-heterozygous row has p = 0.5 and stays
        assert_eq!(result.variants.len(), 5);
        assert_eq!(result.loadings.nrows(), 5);
    }

    #[test]
    fn loadings_reproduce_scores() {
        let ds = two_cluster_dataset();
        let result = hwe_normalized_pca(&ds, 2).unwrap();
        let m = result.variants.len() as f64;
        for s in 0..ds.n_samples() {
            for pc in 0..2 {
                let mut projected = 0.0;
                for v in 0..ds.n_variants() {
                    let row = ds.variant_row(v);
                    let p = row.iter().map(|&g| g as f64).sum::<f64>() / (2.0 * row.len() as f64);
                    let z = (row[s] as f64 - 2.0 * p) / (2.0 * p * (1.0 - p)).sqrt();
                    projected += z * result.loadings[[v, pc]];
                }
                assert_relative_eq!(projected / m.sqrt(), result.scores[[s, pc]], epsilon = 1e-8);
            }
        }
    }

    #[test]
    fn too_many_components_are_capped() {
        let result = hwe_normalized_pca(&two_cluster_dataset(), 50).unwrap();
        assert!(result.scores.ncols() <= 6);
        assert_eq!(result.eigenvalues.len(), result.scores.ncols());
    }

    #[test]
    fn no_polymorphic_variant_is_an_error() {
        let ds = GenotypeDataset::from_variant_rows(
            vec![key("1", 10, "A", "G")],
            vec!["a".into(), "b".into()],
            vec![vec![Some(0), Some(0)]],
        )
        .unwrap();
        assert!(matches!(hwe_normalized_pca(&ds, 1), Err(AncestryError::NoInformativeVariants)));
    }
}
