//! VCF import: biallelic SNPs with their GT calls as alt-allele counts.

use std::path::{Path, PathBuf};

use log::{debug, info, warn};
use noodles_vcf::{
    self as vcf,
    variant::record::{samples::series::Value as GenotypeValue, samples::Series as _, AlternateBases as _},
};
use rayon::prelude::*;

use crate::dataset::{GenotypeDataset, VariantKey};
use crate::error::{AncestryError, Result};

const GT_KEY: &str = "GT";

struct VariantCalls {
    key: VariantKey,
    calls: Vec<Option<u8>>,
}

/// Parses a text GT such as `0/1` or `1|1`. Anything else, including `./.`,
/// is a missing call.
#[inline(always)]
fn parse_gt(gt: &str) -> Option<u8> {
    let bytes = gt.as_bytes();
    if bytes.len() != 3 || (bytes[1] != b'/' && bytes[1] != b'|') {
        return None;
    }
    let allele = |b: u8| match b {
        b'0' => Some(0u8),
        b'1' => Some(1u8),
        _ => None,
    };
    Some(allele(bytes[0])? + allele(bytes[2])?)
}

fn is_snp_allele(bases: &str) -> bool {
    matches!(bases, "A" | "C" | "G" | "T" | "a" | "c" | "g" | "t")
}

fn read_sample_names(path: &Path) -> Result<Vec<String>> {
    let mut reader = vcf::io::reader::Builder::default().build_from_path(path)?;
    let header = reader.read_header()?;
    let names: Vec<String> = header.sample_names().iter().cloned().collect();
    if names.is_empty() {
        return Err(AncestryError::InvalidArgument(format!(
            "VCF header from {} contains no samples",
            path.display()
        )));
    }
    Ok(names)
}

fn read_single_vcf(path: &Path, samples: &[String]) -> Result<Vec<VariantCalls>> {
    debug!("Processing VCF: {}", path.display());
    let mut reader = vcf::io::reader::Builder::default().build_from_path(path)?;
    let header = reader.read_header()?;

    if header.sample_names().len() != samples.len()
        || header.sample_names().iter().zip(samples).any(|(a, b)| a != b)
    {
        return Err(AncestryError::InvalidArgument(format!(
            "sample mismatch in VCF {}: expected {} samples (names like {:?}), found {} (names like {:?})",
            path.display(),
            samples.len(),
            samples.iter().take(3).collect::<Vec<_>>(),
            header.sample_names().len(),
            header.sample_names().iter().take(3).collect::<Vec<_>>()
        )));
    }
    if !header.formats().contains_key(GT_KEY) {
        return Err(AncestryError::InvalidArgument(format!(
            "GT key (FORMAT={}) not found in FORMAT header for VCF {}",
            GT_KEY,
            path.display()
        )));
    }

    let mut variants = Vec::new();
    let mut record = vcf::Record::default();
    let mut skipped = 0usize;

    while reader.read_record(&mut record)? != 0 {
        let contig = record.reference_sequence_name().to_string();
        let position = record.variant_start().transpose()?.map_or(0u64, |p| p.get() as u64);
        let reference = record.reference_bases().to_string();
        let alternate_bases = record.alternate_bases();
        let alternate = alternate_bases.as_ref().to_string();

        if alternate_bases.len() != 1 || !is_snp_allele(&reference) || !is_snp_allele(&alternate) {
            debug!(
                "Variant at {}:{} (REF:{}, ALT:{}) is not a biallelic SNP, skipping.",
                contig, position, reference, alternate
            );
            skipped += 1;
            continue;
        }

        let mut calls = vec![None; samples.len()];
        match record.samples().select(GT_KEY) {
            Some(series) => {
                for (sample_idx, value) in series.iter(&header).enumerate() {
                    if sample_idx >= samples.len() {
                        warn!(
                            "More GT values than samples for variant at {}:{} in {}. Truncating.",
                            contig,
                            position,
                            path.display()
                        );
                        break;
                    }
                    calls[sample_idx] = match value? {
                        Some(GenotypeValue::String(gt)) => parse_gt(gt.as_ref()),
                        Some(GenotypeValue::Genotype(genotype)) => {
                            let mut n_alt = Some(0u8);
                            let mut ploidy = 0;
                            for allele in genotype.iter() {
                                let (index, _) = allele?;
                                ploidy += 1;
                                n_alt = match (n_alt, index) {
                                    (Some(n), Some(0)) => Some(n),
                                    (Some(n), Some(1)) => Some(n + 1),
                                    _ => None,
                                };
                            }
                            if ploidy == 2 { n_alt } else { None }
                        }
                        Some(other) => {
                            debug!(
                                "Variant at {}:{}: unexpected GT value {:?} for sample {}, treating as missing.",
                                contig, position, other, sample_idx
                            );
                            None
                        }
                        None => None,
                    };
                }
            }
            None => debug!("Variant at {}:{} has no GT series; all calls missing.", contig, position),
        }

        variants.push(VariantCalls {
            key: VariantKey::new(contig, position, reference, alternate),
            calls,
        });
    }
    debug!(
        "{}: kept {} biallelic SNPs, skipped {} other records",
        path.display(),
        variants.len(),
        skipped
    );
    Ok(variants)
}

/// Reads one VCF (plain or gzipped).
pub fn read_vcf(path: &Path) -> Result<GenotypeDataset> {
    read_vcfs(&[path.to_path_buf()])
}

/// Reads several VCFs that share one sample list (e.g. one per chromosome)
/// and concatenates their variants in file order.
pub fn read_vcfs(paths: &[PathBuf]) -> Result<GenotypeDataset> {
    let first = paths
        .first()
        .ok_or_else(|| AncestryError::InvalidArgument("no VCF files given".to_string()))?;
    let samples = read_sample_names(first)?;
    info!(
        "Reading {} VCF file(s) with {} samples established from {}",
        paths.len(),
        samples.len(),
        first.display()
    );

    let per_file: Vec<Result<Vec<VariantCalls>>> = paths
        .par_iter()
        .map(|path| read_single_vcf(path, &samples))
        .collect();

    let mut keys = Vec::new();
    let mut rows = Vec::new();
    for result in per_file {
        for variant in result? {
            keys.push(variant.key);
            rows.push(variant.calls);
        }
    }
    info!("Read {} biallelic SNPs across {} VCF file(s)", keys.len(), paths.len());
    GenotypeDataset::from_variant_rows(keys, samples, rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::tests::key;
    use std::io::Write;

    const HEADER: &str = "##fileformat=VCFv4.3\n\
##FORMAT=<ID=GT,Number=1,Type=String,Description=\"Genotype\">\n\
##contig=<ID=1>\n\
#CHROM\tPOS\tID\tREF\tALT\tQUAL\tFILTER\tINFO\tFORMAT\tS1\tS2\tS3\n";

    fn write_vcf(dir: &Path, name: &str, body: &str) -> PathBuf {
        let path = dir.join(name);
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(HEADER.as_bytes()).unwrap();
        file.write_all(body.as_bytes()).unwrap();
        path
    }

    #[test]
    fn gt_strings() {
        assert_eq!(parse_gt("0/0"), Some(0));
        assert_eq!(parse_gt("0|1"), Some(1));
        assert_eq!(parse_gt("1/1"), Some(2));
        assert_eq!(parse_gt("./."), None);
        assert_eq!(parse_gt("0/2"), None);
        assert_eq!(parse_gt("1"), None);
    }

    #[test]
    fn keeps_biallelic_snps_and_missing_calls() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_vcf(
            dir.path(),
            "study.vcf",
            "1\t100\t.\tA\tG\t.\tPASS\t.\tGT\t0/0\t0|1\t1/1\n\
1\t200\t.\tA\tC,T\t.\tPASS\t.\tGT\t0/1\t0/2\t1/1\n\
1\t300\t.\tAT\tA\t.\tPASS\t.\tGT\t0/1\t0/0\t1/1\n\
1\t400\t.\tC\tT\t.\tPASS\t.\tGT\t./.\t1/1\t0/1\n",
        );
        let ds = read_vcf(&path).unwrap();
        assert_eq!(ds.samples(), &["S1", "S2", "S3"]);
        assert_eq!(ds.variants(), &[key("1", 100, "A", "G"), key("1", 400, "C", "T")]);
        assert_eq!(ds.n_alt(0, 1), Some(1));
        assert_eq!(ds.n_alt(0, 2), Some(2));
        assert_eq!(ds.n_alt(1, 0), None);
        assert_eq!(ds.n_alt(1, 1), Some(2));
    }

    #[test]
    fn concatenates_files_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let a = write_vcf(dir.path(), "a.vcf", "1\t100\t.\tA\tG\t.\tPASS\t.\tGT\t0/0\t0/1\t1/1\n");
        let b = write_vcf(dir.path(), "b.vcf", "1\t900\t.\tG\tA\t.\tPASS\t.\tGT\t1/1\t0/1\t0/0\n");
        let ds = read_vcfs(&[a, b]).unwrap();
        assert_eq!(ds.n_variants(), 2);
        assert_eq!(ds.variants()[1], key("1", 900, "G", "A"));
    }

    #[test]
    fn sample_mismatch_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let a = write_vcf(dir.path(), "a.vcf", "1\t100\t.\tA\tG\t.\tPASS\t.\tGT\t0/0\t0/1\t1/1\n");
        let other = dir.path().join("other.vcf");
        std::fs::write(
            &other,
            HEADER.replace("S3", "S9") + "1\t900\t.\tG\tA\t.\tPASS\t.\tGT\t1/1\t0/1\t0/0\n",
        )
        .unwrap();
        assert!(matches!(read_vcfs(&[a, other]), Err(AncestryError::InvalidArgument(_))));
    }
}
