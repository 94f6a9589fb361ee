//! PLINK `.bed/.bim/.fam` import via bed-reader.
//!
//! Genotypes are read as allele-1 counts, so allele 1 is the alternate
//! allele of the resulting [`VariantKey`] and allele 2 the reference.

use std::path::{Path, PathBuf};

use bed_reader::{Bed, BedErrorPlus, ReadOptions};
use log::info;

use crate::dataset::{GenotypeDataset, VariantKey, MISSING};
use crate::error::{AncestryError, Result};

const BED_MISSING: i8 = -127;

fn plink_err(e: Box<BedErrorPlus>) -> AncestryError {
    AncestryError::Plink(e.to_string())
}

/// Accepts either the `.bed` file or the shared fileset prefix.
pub fn bed_path(path: &Path) -> PathBuf {
    if path.extension().is_some_and(|ext| ext == "bed") {
        path.to_path_buf()
    } else {
        let mut with_ext = path.as_os_str().to_owned();
        with_ext.push(".bed");
        PathBuf::from(with_ext)
    }
}

pub fn read_plink(path: &Path) -> Result<GenotypeDataset> {
    let bed_file = bed_path(path);
    let mut bed = Bed::new(&bed_file).map_err(plink_err)?;
    let n_samples = bed.iid_count().map_err(plink_err)?;
    let n_variants = bed.sid_count().map_err(plink_err)?;
    info!(
        "Reading PLINK fileset {}: {} samples x {} variants",
        bed_file.display(),
        n_samples,
        n_variants
    );

    let samples: Vec<String> = bed.iid().map_err(plink_err)?.to_vec();
    let chromosomes = bed.chromosome().map_err(plink_err)?.to_owned();
    let positions = bed.bp_position().map_err(plink_err)?.to_owned();
    let allele_1 = bed.allele_1().map_err(plink_err)?.to_owned();
    let allele_2 = bed.allele_2().map_err(plink_err)?.to_owned();

    let mut variants = Vec::with_capacity(n_variants);
    for idx in 0..n_variants {
        let position = u64::try_from(positions[idx]).map_err(|_| {
            AncestryError::Plink(format!("negative base-pair position {} for variant {}", positions[idx], idx))
        })?;
        variants.push(VariantKey::new(
            chromosomes[idx].clone(),
            position,
            allele_2[idx].clone(),
            allele_1[idx].clone(),
        ));
    }

    // samples x variants, allele-1 counts
    let counts = ReadOptions::builder().i8().count_a1().read(&mut bed).map_err(plink_err)?;
    let genotypes = counts.t().mapv(|g| if g == BED_MISSING { MISSING } else { g });
    GenotypeDataset::try_new(variants, samples, genotypes)
}
