use std::cmp::Ordering;
use std::collections::{BTreeMap, HashSet};

use log::debug;
use rayon::prelude::*;

use super::VariantQc;
use crate::dataset::{GenotypeDataset, VariantKey, MISSING};
use crate::error::Result;
use crate::graph::maximal_independent_set;

/// Mean-imputed, centred, unit-norm genotype rows. Rows with no variance
/// stay all-zero and therefore correlate with nothing.
fn standardized_rows(dataset: &GenotypeDataset) -> Vec<Vec<f64>> {
    (0..dataset.n_variants())
        .into_par_iter()
        .map(|variant_idx| {
            let raw = dataset.variant_row(variant_idx);
            let mut row = vec![0.0; raw.len()];
            let called: Vec<f64> = raw.iter().filter(|&&g| g != MISSING).map(|&g| g as f64).collect();
            if called.is_empty() {
                return row;
            }
            let mean = called.iter().sum::<f64>() / called.len() as f64;
            for (dst, &g) in row.iter_mut().zip(raw.iter()) {
                *dst = if g == MISSING { 0.0 } else { g as f64 - mean };
            }
            let norm = row.iter().map(|x| x * x).sum::<f64>().sqrt();
            if norm > 1e-12 {
                row.iter_mut().for_each(|x| *x /= norm);
            } else {
                row.fill(0.0);
            }
            row
        })
        .collect()
}

fn correlation(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

pub(super) fn ld_prune(
    dataset: &GenotypeDataset,
    stats: &[VariantQc],
    r2: f64,
    bp_window_size: u64,
) -> Result<HashSet<VariantKey>> {
    let standardized = standardized_rows(dataset);

    // variant indices per contig, sorted by position
    let mut by_contig: BTreeMap<&str, Vec<usize>> = BTreeMap::new();
    for (idx, key) in dataset.variants().iter().enumerate() {
        by_contig.entry(key.contig.as_str()).or_default().push(idx);
    }
    let mut ordered: Vec<Vec<usize>> = by_contig.into_values().collect();
    for contig in &mut ordered {
        contig.sort_by_key(|&idx| dataset.variants()[idx].position);
    }

    let correlated_pairs: Vec<(usize, usize)> = ordered
        .par_iter()
        .flat_map_iter(|contig| {
            let standardized = &standardized;
            (0..contig.len()).flat_map(move |a| {
                let i = contig[a];
                let pos_i = dataset.variants()[i].position;
                contig[a + 1..]
                    .iter()
                    .take_while(move |&&j| dataset.variants()[j].position - pos_i <= bp_window_size)
                    .filter(move |&&j| {
                        let r = correlation(&standardized[i], &standardized[j]);
                        r * r > r2
                    })
                    .map(move |&j| (i, j))
                    .collect::<Vec<_>>()
            })
        })
        .collect();
    debug!(
        "LD pruning: {} correlated pairs (r2 > {}) within {} bp",
        correlated_pairs.len(),
        r2,
        bp_window_size
    );

    // on equal degree drop the lower-MAF variant, then the later one
    let maf: Vec<f64> = stats.iter().map(|s| s.maf().unwrap_or(0.0)).collect();
    let set = maximal_independent_set(&correlated_pairs, |&a, &b| {
        maf[b]
            .partial_cmp(&maf[a])
            .unwrap_or(Ordering::Equal)
            .then_with(|| dataset.variants()[a].cmp(&dataset.variants()[b]))
    });
    let removed: HashSet<usize> = set.removed.into_iter().collect();

    Ok(dataset
        .variants()
        .iter()
        .enumerate()
        .filter(|(idx, _)| !removed.contains(idx))
        .map(|(_, key)| key.clone())
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::tests::key;
    use crate::engine::qc::variant_qc;

    fn dataset(rows: Vec<(u64, Vec<u8>)>) -> GenotypeDataset {
        let n = rows[0].1.len();
        GenotypeDataset::from_variant_rows(
            rows.iter().map(|(pos, _)| key("chr1", *pos, "A", "G")).collect(),
            (0..n).map(|i| format!("S{}", i)).collect(),
            rows.into_iter().map(|(_, g)| g.into_iter().map(Some).collect()).collect(),
        )
        .unwrap()
    }

    #[test]
    fn keeps_one_of_a_perfectly_correlated_pair() {
        let ds = dataset(vec![
            (100, vec![0, 1, 2, 1, 0, 2]),
            (200, vec![0, 1, 2, 1, 0, 2]),
            (300, vec![1, 1, 0, 2, 1, 1]),
        ]);
        let kept = ld_prune(&ds, &variant_qc(&ds), 0.2, 1_000).unwrap();
        assert_eq!(kept.len(), 2);
        assert!(kept.contains(&key("chr1", 300, "A", "G")));
    }

    #[test]
    fn pairs_outside_the_window_are_not_compared() {
        let ds = dataset(vec![(100, vec![0, 1, 2, 1, 0, 2]), (5_000, vec![0, 1, 2, 1, 0, 2])]);
        let kept = ld_prune(&ds, &variant_qc(&ds), 0.2, 1_000).unwrap();
        assert_eq!(kept.len(), 2);
    }
}
