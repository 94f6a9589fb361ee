use rayon::prelude::*;

use super::VariantQc;
use crate::dataset::{GenotypeDataset, MISSING};

pub(super) fn variant_qc(dataset: &GenotypeDataset) -> Vec<VariantQc> {
    let num_samples = dataset.n_samples();
    (0..dataset.n_variants())
        .into_par_iter()
        .map(|variant_idx| {
            let mut hom_ref_count = 0usize;
            let mut het_count = 0usize;
            let mut hom_alt_count = 0usize;
            for &g in dataset.variant_row(variant_idx).iter() {
                match g {
                    0 => hom_ref_count += 1,
                    1 => het_count += 1,
                    2 => hom_alt_count += 1,
                    MISSING => {}
                    _ => unreachable!("dataset invariant: genotype codes are -1..=2"),
                }
            }
            let n_called = hom_ref_count + het_count + hom_alt_count;

            let call_rate = (num_samples > 0).then(|| n_called as f64 / num_samples as f64);
            let (allele_frequency, p_value_hwe) = if n_called == 0 {
                (None, None)
            } else {
                let alt = (het_count + 2 * hom_alt_count) as f64 / (2 * n_called) as f64;
                (
                    Some([1.0 - alt, alt]),
                    Some(hwe_exact_p_value(hom_ref_count, het_count, hom_alt_count)),
                )
            };

            VariantQc {
                allele_frequency,
                p_value_hwe,
                call_rate,
                n_called,
                n_het: het_count,
            }
        })
        .collect()
}

/// Exact Hardy-Weinberg test (Wigginton, Cutler & Abecasis 2005).
///
/// Returns the probability, under equilibrium and the observed allele
/// counts, of a heterozygote count at least as unlikely as the observed one.
pub fn hwe_exact_p_value(hom_ref_count: usize, het_count: usize, hom_alt_count: usize) -> f64 {
    let n = hom_ref_count + het_count + hom_alt_count;
    if n == 0 {
        return 1.0;
    }
    let hom_rare = hom_ref_count.min(hom_alt_count);
    let rare_copies = 2 * hom_rare + het_count;

    let mut het_probs = vec![0.0f64; rare_copies + 1];

    // start from the most likely heterozygote count and walk outwards
    let mut mid = rare_copies * (2 * n - rare_copies) / (2 * n);
    if mid % 2 != rare_copies % 2 {
        mid += 1;
    }
    het_probs[mid] = 1.0;
    let mut total = 1.0;

    let mut curr_hets = mid;
    let mut curr_hom_r = (rare_copies - mid) / 2;
    let mut curr_hom_c = n - curr_hets - curr_hom_r;
    while curr_hets >= 2 {
        let p = het_probs[curr_hets] * (curr_hets as f64) * ((curr_hets - 1) as f64)
            / (4.0 * ((curr_hom_r + 1) as f64) * ((curr_hom_c + 1) as f64));
        het_probs[curr_hets - 2] = p;
        total += p;
        curr_hets -= 2;
        curr_hom_r += 1;
        curr_hom_c += 1;
    }

    curr_hets = mid;
    curr_hom_r = (rare_copies - mid) / 2;
    curr_hom_c = n - curr_hets - curr_hom_r;
    while curr_hets + 2 <= rare_copies {
        let p = het_probs[curr_hets] * 4.0 * (curr_hom_r as f64) * (curr_hom_c as f64)
            / (((curr_hets + 2) as f64) * ((curr_hets + 1) as f64));
        het_probs[curr_hets + 2] = p;
        total += p;
        curr_hets += 2;
        curr_hom_r -= 1;
        curr_hom_c -= 1;
    }

    let observed = het_probs[het_count] / total;
    let p_value: f64 = het_probs
        .iter()
        .map(|p| p / total)
        .filter(|&p| p <= observed * (1.0 + 1e-9))
        .sum();
    p_value.min(1.0)
}
