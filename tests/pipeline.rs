use std::collections::HashSet;
use std::fs;
use std::path::Path;

use ancestry_pca::classifier::RandomForest;
use ancestry_pca::filter::FilterConfig;
use ancestry_pca::merge::ScoreTable;
use ancestry_pca::pipeline::{pca_with_ref, InputType, PipelineConfig};
use ancestry_pca::relatedness::RelatednessMethod;
use ancestry_pca::{GenotypeDataset, InMemoryEngine, VariantKey};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

const SHARED_VARIANTS: usize = 200;

/// Alt-allele frequency of shared variant `idx` in each population.
fn frequency(idx: usize, population: &str) -> f64 {
    let afr = if idx % 2 == 0 { 0.15 } else { 0.85 };
    if population == "AFR" {
        afr
    } else {
        1.0 - afr
    }
}

fn genotype(rng: &mut ChaCha8Rng, p: f64) -> Option<u8> {
    Some(rng.random_bool(p) as u8 + rng.random_bool(p) as u8)
}

fn shared_key(idx: usize) -> VariantKey {
    let (reference, alternate) = if idx % 2 == 0 { ("A", "G") } else { ("C", "T") };
    VariantKey::new("chr1", 10_000 * (idx as u64 + 1), reference, alternate)
}

/// `samples` are `(id, population)`; `extra_contig` adds ten variants the
/// other dataset does not have.
fn simulate(rng: &mut ChaCha8Rng, samples: &[(String, &str)], extra_contig: &str) -> (Vec<VariantKey>, Vec<Vec<Option<u8>>>) {
    let mut keys = Vec::new();
    let mut rows = Vec::new();
    for idx in 0..SHARED_VARIANTS {
        keys.push(shared_key(idx));
        rows.push(samples.iter().map(|(_, pop)| genotype(rng, frequency(idx, pop))).collect());
    }
    for idx in 0..10 {
        keys.push(VariantKey::new(extra_contig, 10_000 * (idx as u64 + 1), "A", "C"));
        rows.push(samples.iter().map(|_| genotype(rng, 0.5)).collect());
    }
    (keys, rows)
}

fn reference_samples() -> Vec<(String, &'static str)> {
    let mut samples = Vec::new();
    for i in 0..10 {
        samples.push((format!("HG_AFR_{}", i), "AFR"));
        samples.push((format!("HG_EUR_{}", i), "EUR"));
    }
    samples
}

fn study_samples() -> Vec<(String, &'static str)> {
    (0..3)
        .flat_map(|i| [(format!("study_AFR_{}", i), "AFR"), (format!("study_EUR_{}", i), "EUR")])
        .collect()
}

struct Fixture {
    _dir: tempfile::TempDir,
    config: PipelineConfig,
}

fn fixture(duplicate_study_sample: bool) -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let ref_dir = dir.path().join("ref");
    let data_dir = dir.path().join("data");
    let out_dir = dir.path().join("out");
    fs::create_dir_all(&ref_dir).unwrap();
    fs::create_dir_all(&data_dir).unwrap();
    let mut rng = ChaCha8Rng::seed_from_u64(7);

    let reference = reference_samples();
    let (keys, rows) = simulate(&mut rng, &reference, "chr3");
    let ids: Vec<String> = reference.iter().map(|(id, _)| id.clone()).collect();
    GenotypeDataset::from_variant_rows(keys, ids, rows)
        .unwrap()
        .write_native(&ref_dir.join("panel.mt"))
        .unwrap();

    // HG_EUR_9 has no metadata and must be dropped from the merge
    let mut info = String::from("Sample\tSuperPop\tPopulation\n");
    for (id, pop) in reference.iter().filter(|(id, _)| id != "HG_EUR_9") {
        info.push_str(&format!("{}\t{}\t{}_sub\n", id, pop, pop));
    }
    fs::write(ref_dir.join("info.tsv"), info).unwrap();

    let study = study_samples();
    let (keys, mut rows) = simulate(&mut rng, &study, "chr2");
    let mut ids: Vec<String> = study.iter().map(|(id, _)| id.clone()).collect();
    if duplicate_study_sample {
        ids.push("study_AFR_0_dup".to_string());
        for row in rows.iter_mut() {
            let copy = row[0];
            row.push(copy);
        }
    }
    GenotypeDataset::from_variant_rows(keys, ids, rows)
        .unwrap()
        .write_native(&data_dir.join("study.mt"))
        .unwrap();

    let mut config = PipelineConfig::new(
        &ref_dir,
        "panel",
        ref_dir.join("info.tsv"),
        &data_dir,
        "study",
        InputType::Native,
        &out_dir,
    );
    // no LD pruning or HWE cut on this synthetic panel
    config.filter = FilterConfig {
        hwe_min: 0.0,
        ld_window_bp: 100,
        ..FilterConfig::default()
    };
    config.num_pcs = 4;
    config.classifier.num_pcs = 4;
    Fixture { _dir: dir, config }
}

fn probability_rows(path: &Path) -> Vec<Vec<String>> {
    fs::read_to_string(path)
        .unwrap()
        .lines()
        .map(|l| l.split('\t').map(String::from).collect())
        .collect()
}

#[test]
fn projects_study_and_writes_every_artifact() {
    let Fixture { _dir, config } = fixture(false);
    let engine = InMemoryEngine::default();
    let output = pca_with_ref(&engine, &config).unwrap();
    let out = &config.out_dir;

    for name in [
        "study_intersect_1000G.mt",
        "1000G_intersect_study.mt",
        "1000G_scores.ht",
        "1000G_scores.txt.bgz",
        "1000G_loadings.ht",
        "1000G_eigenvalues.tsv",
        "study_scores.tsv",
        "pca_sup_pops_0.8_probs.txt",
        "study.pca.with.ref.plots.svg",
        "study_rf_model.json",
    ] {
        assert!(out.join(name).exists(), "missing artifact {}", name);
    }
    assert!(!out.join("relatedness_removed_samples.tsv").exists());

    let study_in_ref = GenotypeDataset::read_native(&out.join("study_intersect_1000G.mt")).unwrap();
    let ref_in_study = GenotypeDataset::read_native(&out.join("1000G_intersect_study.mt")).unwrap();
    assert_eq!(study_in_ref.key_set(), ref_in_study.key_set());
    assert!(study_in_ref.variants().iter().all(|k| k.contig == "chr1"));
    assert_eq!(ref_in_study.n_samples(), 20);

    let scores = ScoreTable::read(&out.join("study_scores.tsv")).unwrap();
    assert_eq!(scores.samples.len(), 6);
    assert_eq!(scores.num_pcs(), 4);

    // 19 reference rows with metadata plus 6 study rows
    assert_eq!(output.labeled.table.len(), 25);
    assert!(!output.labeled.table.samples.contains(&"HG_EUR_9".to_string()));
    assert!(output.removed_samples.is_empty());

    let rows = probability_rows(&config.probabilities_path());
    assert_eq!(rows.len(), 7);
    assert_eq!(rows[0][..5], ["s", "pop", "prob_AFR", "prob_EUR", "PC1"]);
    for row in &rows[1..] {
        let prob_afr: f64 = row[2].parse().unwrap();
        if row[0].starts_with("study_AFR") {
            assert!(prob_afr > 0.5, "{:?}", row);
            assert_ne!(row[1], "EUR");
        } else {
            assert!(prob_afr < 0.5, "{:?}", row);
            assert_ne!(row[1], "AFR");
        }
    }

    let svg = fs::read_to_string(config.plot_path()).unwrap();
    assert!(svg.contains("PC3"));
}

#[test]
fn saved_model_reproduces_predictions() {
    let Fixture { _dir, mut config } = fixture(false);
    let engine = InMemoryEngine::default();
    let first = pca_with_ref(&engine, &config).unwrap();
    let saved = RandomForest::load(&config.model_output_path()).unwrap();
    assert_eq!(saved.classes(), first.model.classes());

    config.model = Some(config.model_output_path());
    let second = pca_with_ref(&engine, &config).unwrap();
    assert_eq!(first.labeled.predicted, second.labeled.predicted);
}

#[test]
fn duplicated_study_sample_is_pruned_by_king() {
    let Fixture { _dir, mut config } = fixture(true);
    config.relatedness = Some((RelatednessMethod::King, 0.45));
    let engine = InMemoryEngine::default();
    let output = pca_with_ref(&engine, &config).unwrap();

    assert_eq!(output.removed_samples, vec!["study_AFR_0_dup".to_string()]);
    assert!(config.out_dir.join("relatedness_checks_king.tsv.bgz").exists());
    let removed = fs::read_to_string(config.out_dir.join("relatedness_removed_samples.tsv")).unwrap();
    assert_eq!(removed.trim(), "study_AFR_0_dup");

    let study: HashSet<String> = ScoreTable::read(&config.study_scores_path())
        .unwrap()
        .samples
        .into_iter()
        .collect();
    assert_eq!(study.len(), 6);
    assert!(!study.contains("study_AFR_0_dup"));
}
