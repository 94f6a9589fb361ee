use log::{debug, info};
use nalgebra::DMatrix;
use ndarray::Array2;
use rayon::prelude::*;

use super::{IbdRow, InMemoryEngine, KingRow, PcRelateRow};
use crate::dataset::{GenotypeDataset, MISSING};
use crate::error::{AncestryError, Result};

/// Visits every unordered pair `(i, j)` with `i < j` in parallel, keeping
/// rows in `(i, j)` order.
fn for_each_pair<T, F>(engine: &InMemoryEngine, num_samples: usize, with_self: bool, f: F) -> Vec<T>
where
    T: Send,
    F: Fn(usize, usize) -> Option<T> + Sync,
{
    let pb = engine.progress_bar(num_samples as u64, "samples");
    let rows: Vec<T> = (0..num_samples)
        .into_par_iter()
        .flat_map_iter(|i| {
            let start = if with_self { i } else { i + 1 };
            let row: Vec<T> = (start..num_samples).filter_map(|j| f(i, j)).collect();
            pb.inc(1);
            row
        })
        .collect();
    pb.finish_and_clear();
    rows
}

/// KING-robust kinship over the variants called in both samples:
/// `phi = (N_het,het - 2 N_opposite_hom) / (N_het_i + N_het_j)`.
pub(super) fn king(engine: &InMemoryEngine, dataset: &GenotypeDataset) -> Vec<KingRow> {
    let genotypes = dataset.genotypes();
    let samples = dataset.samples();
    info!("Computing KING kinship for {} samples over {} variants", samples.len(), dataset.n_variants());

    let mut rows = for_each_pair(engine, samples.len(), true, |i, j| {
        let mut het_het = 0i64;
        let mut opposite_hom = 0i64;
        let mut het_i = 0i64;
        let mut het_j = 0i64;
        for v in 0..genotypes.nrows() {
            let (gi, gj) = (genotypes[[v, i]], genotypes[[v, j]]);
            if gi == MISSING || gj == MISSING {
                continue;
            }
            het_i += (gi == 1) as i64;
            het_j += (gj == 1) as i64;
            if gi == 1 && gj == 1 {
                het_het += 1;
            } else if (gi - gj).abs() == 2 {
                opposite_hom += 1;
            }
        }
        let denominator = het_i + het_j;
        let phi = (denominator > 0).then(|| (het_het - 2 * opposite_hom) as f64 / denominator as f64);
        Some((i, j, phi))
    })
    .into_iter()
    .flat_map(|(i, j, phi)| {
        let forward = KingRow {
            s_1: samples[i].clone(),
            s: samples[j].clone(),
            phi,
        };
        let mirrored = (i != j).then(|| KingRow {
            s_1: samples[j].clone(),
            s: samples[i].clone(),
            phi,
        });
        std::iter::once(forward).chain(mirrored)
    })
    .collect::<Vec<_>>();
    rows.sort_by(|a, b| a.s_1.cmp(&b.s_1).then_with(|| a.s.cmp(&b.s)));
    rows
}

/// Probabilities of IBS 0/1/2 given IBD 0 and IBD 1 at a site with allele frequency `p`.
struct ExpectedIbs {
    e00: f64,
    e10: f64,
    e20: f64,
    e11: f64,
    e21: f64,
}

impl ExpectedIbs {
    fn at(p: f64) -> Self {
        let q = 1.0 - p;
        let (p2, q2) = (p * p, q * q);
        Self {
            e00: 2.0 * p2 * q2,
            e10: 4.0 * p2 * p * q + 4.0 * p * q2 * q,
            e20: p2 * p2 + q2 * q2 + 4.0 * p2 * q2,
            e11: 2.0 * p2 * q + 2.0 * p * q2,
            e21: p2 * p + q2 * q + p2 * q + p * q2,
        }
    }
}

/// PLINK method-of-moments IBD estimate from observed IBS counts.
pub(super) fn identity_by_descent(
    engine: &InMemoryEngine,
    dataset: &GenotypeDataset,
    maf: &[f64],
    min_pi_hat: f64,
) -> Result<Vec<IbdRow>> {
    if maf.len() != dataset.n_variants() {
        return Err(AncestryError::InvalidArgument(format!(
            "IBD needs one allele frequency per variant: got {} for {} variants",
            maf.len(),
            dataset.n_variants()
        )));
    }
    let genotypes = dataset.genotypes();
    let samples = dataset.samples();
    let expectations: Vec<Option<ExpectedIbs>> = maf
        .iter()
        .map(|&p| (p > 0.0 && p < 1.0).then(|| ExpectedIbs::at(p)))
        .collect();
    info!("Computing IBD for {} samples over {} variants", samples.len(), dataset.n_variants());

    let rows = for_each_pair(engine, samples.len(), false, |i, j| {
        let mut ibs = [0usize; 3];
        let mut e = [0.0f64; 5];
        let mut sites = 0usize;
        for (v, expected) in expectations.iter().enumerate() {
            let Some(expected) = expected else { continue };
            let (gi, gj) = (genotypes[[v, i]], genotypes[[v, j]]);
            if gi == MISSING || gj == MISSING {
                continue;
            }
            ibs[(2 - (gi - gj).abs()) as usize] += 1;
            e[0] += expected.e00;
            e[1] += expected.e10;
            e[2] += expected.e20;
            e[3] += expected.e11;
            e[4] += expected.e21;
            sites += 1;
        }
        if sites == 0 {
            return None;
        }
        let (z0, z1, z2) = ibd_proportions(ibs, e, sites);
        let pi_hat = z1 / 2.0 + z2;
        (pi_hat >= min_pi_hat).then(|| IbdRow {
            i: samples[i].clone(),
            j: samples[j].clone(),
            ibs0: ibs[0],
            ibs1: ibs[1],
            ibs2: ibs[2],
            z0,
            z1,
            z2,
            pi_hat,
        })
    });
    debug!("IBD: {} pairs with PI_HAT >= {}", rows.len(), min_pi_hat);
    Ok(rows)
}

fn ibd_proportions(ibs: [usize; 3], e: [f64; 5], sites: usize) -> (f64, f64, f64) {
    let [e00, e10, e20, e11, e21] = e;
    let n = sites as f64;
    let mut z0 = if e00 > 0.0 { ibs[0] as f64 / e00 } else { 0.0 };
    let mut z1 = if e11 > 0.0 { (ibs[1] as f64 - z0 * e10) / e11 } else { 0.0 };
    let mut z2 = (ibs[2] as f64 - z0 * e20 - z1 * e21) / n;

    if z0 > 1.0 {
        (z0, z1, z2) = (1.0, 0.0, 0.0);
    } else if z1 > 1.0 {
        (z0, z1, z2) = (0.0, 1.0, 0.0);
    } else if z2 > 1.0 {
        (z0, z1, z2) = (0.0, 0.0, 1.0);
    }
    z0 = z0.max(0.0);
    z1 = z1.max(0.0);
    z2 = z2.max(0.0);
    let total = z0 + z1 + z2;
    if total > 0.0 {
        (z0 / total, z1 / total, z2 / total)
    } else {
        (1.0, 0.0, 0.0)
    }
}

/// PC-Relate kinship with individual-specific allele frequencies fitted by
/// regressing each variant's genotypes on the principal components.
pub(super) fn pc_relate(
    engine: &InMemoryEngine,
    dataset: &GenotypeDataset,
    scores: &Array2<f64>,
    min_individual_maf: f64,
    min_kinship: f64,
) -> Result<Vec<PcRelateRow>> {
    let num_samples = dataset.n_samples();
    let k = scores.ncols();
    info!(
        "Computing PC-Relate kinship for {} samples using {} PCs (min individual MAF {})",
        num_samples, k, min_individual_maf
    );

    // design matrix [1, PC1..PCk]; hat = (X'X)^-1 X'
    let design = DMatrix::<f64>::from_fn(num_samples, k + 1, |s, c| if c == 0 { 1.0 } else { scores[[s, c - 1]] });
    let gram = design.transpose() * &design;
    let gram_inv = gram.try_inverse().ok_or_else(|| {
        AncestryError::InvalidArgument("PC-Relate design matrix is singular; too few samples for the PCs".into())
    })?;
    let hat = gram_inv * design.transpose();
    let fitted_projection = &design * hat;

    let genotypes = dataset.genotypes();
    // mu[v][s]: individual-specific allele frequency, None when out of range or uncalled
    let mu: Vec<Vec<Option<f64>>> = (0..dataset.n_variants())
        .into_par_iter()
        .map(|v| {
            let row = genotypes.row(v);
            let called: Vec<f64> = row.iter().filter(|&&g| g != MISSING).map(|&g| g as f64 / 2.0).collect();
            if called.is_empty() {
                return vec![None; num_samples];
            }
            let mean = called.iter().sum::<f64>() / called.len() as f64;
            let y: Vec<f64> = row.iter().map(|&g| if g == MISSING { mean } else { g as f64 / 2.0 }).collect();
            (0..num_samples)
                .map(|s| {
                    if row[s] == MISSING {
                        return None;
                    }
                    let fitted: f64 = (0..num_samples).map(|t| fitted_projection[(s, t)] * y[t]).sum();
                    (fitted > min_individual_maf && fitted < 1.0 - min_individual_maf).then_some(fitted)
                })
                .collect()
        })
        .collect();

    let samples = dataset.samples();
    let rows = for_each_pair(engine, num_samples, false, |i, j| {
        let mut numerator = 0.0;
        let mut denominator = 0.0;
        for (v, mu_v) in mu.iter().enumerate() {
            let (Some(mi), Some(mj)) = (mu_v[i], mu_v[j]) else { continue };
            let ri = genotypes[[v, i]] as f64 - 2.0 * mi;
            let rj = genotypes[[v, j]] as f64 - 2.0 * mj;
            numerator += ri * rj;
            denominator += (mi * (1.0 - mi) * mj * (1.0 - mj)).sqrt();
        }
        if denominator <= 0.0 {
            return None;
        }
        let kin = numerator / (4.0 * denominator);
        (kin >= min_kinship).then(|| PcRelateRow {
            i: samples[i].clone(),
            j: samples[j].clone(),
            kin,
        })
    });
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::tests::key;
    use approx::assert_relative_eq;

    fn dataset(samples: &[&str], rows: Vec<Vec<u8>>) -> GenotypeDataset {
        GenotypeDataset::from_variant_rows(
            (0..rows.len()).map(|i| key("1", 100 * (i as u64 + 1), "A", "G")).collect(),
            samples.iter().map(|s| s.to_string()).collect(),
            rows.into_iter().map(|r| r.into_iter().map(Some).collect()).collect(),
        )
        .unwrap()
    }

    #[test]
    fn king_self_pairs_are_one_half() {
        let ds = dataset(&["a", "b"], vec![vec![1, 0], vec![1, 2], vec![0, 1]]);
        let rows = king(&InMemoryEngine::default(), &ds);
        assert_eq!(rows.len(), 4);
        let aa = rows.iter().find(|r| r.s_1 == "a" && r.s == "a").unwrap();
        assert_relative_eq!(aa.phi.unwrap(), 0.5);
        let ab = rows.iter().find(|r| r.s_1 == "a" && r.s == "b").unwrap();
        let ba = rows.iter().find(|r| r.s_1 == "b" && r.s == "a").unwrap();
        assert_eq!(ab.phi, ba.phi);
        // het_het = 0, opposite_hom = 0, hets: a=2 b=1
        assert_relative_eq!(ab.phi.unwrap(), 0.0);
    }

    #[test]
    fn identical_samples_have_pi_hat_one() {
        let rows = vec![vec![0, 0, 2], vec![1, 1, 0], vec![2, 2, 1], vec![1, 1, 2], vec![0, 0, 1]];
        let ds = dataset(&["x", "twin", "other"], rows);
        let maf = vec![0.5; 5];
        let ibd = identity_by_descent(&InMemoryEngine::default(), &ds, &maf, 0.9).unwrap();
        assert_eq!(ibd.len(), 1);
        assert_eq!((ibd[0].i.as_str(), ibd[0].j.as_str()), ("x", "twin"));
        assert_relative_eq!(ibd[0].pi_hat, 1.0, epsilon = 1e-12);
        assert_eq!(ibd[0].ibs2, 5);
    }

    #[test]
    fn ibd_rejects_misaligned_frequencies() {
        let ds = dataset(&["x", "y"], vec![vec![0, 1]]);
        assert!(identity_by_descent(&InMemoryEngine::default(), &ds, &[], 0.1).is_err());
    }
}
