//! End-to-end projection of a study onto the reference panel: filter,
//! optional relatedness pruning, intersect, reference PCA, projection,
//! merge, population assignment, reports and plots.

use std::fmt;
use std::path::{Path, PathBuf};

use clap::ValueEnum;
use log::{info, warn};

use crate::classifier::{self, ClassifierConfig, LabeledTable, RandomForest};
use crate::dataset::GenotypeDataset;
use crate::engine::GenotypeEngine;
use crate::error::Result;
use crate::filter::{self, FilterConfig, ReferenceBuild};
use crate::merge::{self, MetadataTable, ScoreTable};
use crate::plot;
use crate::projection::{self, BasisPaths, LoadingsTable, DEFAULT_NUM_PCS};
use crate::relatedness::{self, RelatednessMethod};
use crate::{plink, vcf};

/// Default confidence threshold for the pipeline's population calls.
pub const DEFAULT_PROB_THRESHOLD: f64 = 0.8;

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum InputType {
    /// A native dataset directory `<dir>/<basename>.mt`.
    Native,
    /// A PLINK fileset `<dir>/<basename>.{bed,bim,fam}`.
    Plink,
    /// `<dir>/<basename>.vcf.gz` or `<dir>/<basename>.vcf`.
    Vcf,
}

impl fmt::Display for InputType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            InputType::Native => "native",
            InputType::Plink => "plink",
            InputType::Vcf => "vcf",
        };
        write!(f, "{}", name)
    }
}

pub fn load_dataset(input_type: InputType, dir: &Path, basename: &str) -> Result<GenotypeDataset> {
    info!("Reading {} input {} from {}", input_type, basename, dir.display());
    match input_type {
        InputType::Native => GenotypeDataset::read_native(&dir.join(format!("{}.mt", basename))),
        InputType::Plink => plink::read_plink(&dir.join(basename)),
        InputType::Vcf => {
            let gz = dir.join(format!("{}.vcf.gz", basename));
            let path = if gz.exists() { gz } else { dir.join(format!("{}.vcf", basename)) };
            vcf::read_vcf(&path)
        }
    }
}

#[derive(Clone, Debug)]
pub struct PipelineConfig {
    pub ref_dir: PathBuf,
    pub ref_basename: String,
    /// Reference sample metadata with a `Sample` column.
    pub ref_info: PathBuf,
    pub data_dir: PathBuf,
    pub data_basename: String,
    pub input_type: InputType,
    pub out_dir: PathBuf,
    pub filter: FilterConfig,
    /// Relatedness pruning of the study before projection.
    pub relatedness: Option<(RelatednessMethod, f64)>,
    pub num_pcs: usize,
    pub classifier: ClassifierConfig,
    /// Previously saved model; skips training when set.
    pub model: Option<PathBuf>,
}

impl PipelineConfig {
    pub fn new(
        ref_dir: impl Into<PathBuf>,
        ref_basename: impl Into<String>,
        ref_info: impl Into<PathBuf>,
        data_dir: impl Into<PathBuf>,
        data_basename: impl Into<String>,
        input_type: InputType,
        out_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            ref_dir: ref_dir.into(),
            ref_basename: ref_basename.into(),
            ref_info: ref_info.into(),
            data_dir: data_dir.into(),
            data_basename: data_basename.into(),
            input_type,
            out_dir: out_dir.into(),
            filter: FilterConfig::for_build(ReferenceBuild::GRCh38),
            relatedness: None,
            num_pcs: DEFAULT_NUM_PCS,
            classifier: ClassifierConfig {
                min_prob: DEFAULT_PROB_THRESHOLD,
                ..ClassifierConfig::default()
            },
            model: None,
        }
    }

    pub fn reference_path(&self) -> PathBuf {
        self.ref_dir.join(format!("{}.mt", self.ref_basename))
    }

    pub fn study_scores_path(&self) -> PathBuf {
        self.out_dir.join(format!("{}_scores.tsv", self.data_basename))
    }

    /// The threshold always carries a decimal point (`1.0`, not `1`).
    pub fn probabilities_path(&self) -> PathBuf {
        self.out_dir
            .join(format!("pca_sup_pops_{:?}_probs.txt", self.classifier.min_prob))
    }

    pub fn plot_path(&self) -> PathBuf {
        self.out_dir
            .join(format!("{}.pca.with.ref.plots.svg", self.data_basename))
    }

    pub fn model_output_path(&self) -> PathBuf {
        self.out_dir.join(format!("{}_rf_model.json", self.data_basename))
    }
}

#[derive(Debug)]
pub struct PipelineOutput {
    pub labeled: LabeledTable,
    pub model: RandomForest,
    /// Study samples dropped by relatedness pruning.
    pub removed_samples: Vec<String>,
}

/// Projects a study dataset with an existing loadings table and writes the scores.
pub fn project_with_loadings(dataset: &GenotypeDataset, loadings_path: &Path, output: &Path) -> Result<ScoreTable> {
    let loadings = LoadingsTable::read(loadings_path)?;
    let scores = projection::pc_project(dataset, &loadings)?;
    scores.write(output)?;
    info!("Wrote projected scores for {} samples to {}", scores.samples.len(), output.display());
    Ok(scores)
}

pub fn pca_with_ref(engine: &dyn GenotypeEngine, config: &PipelineConfig) -> Result<PipelineOutput> {
    let study = load_dataset(config.input_type, &config.data_dir, &config.data_basename)?;

    info!("Filtering data");
    let study = filter::filter(engine, &study, &config.filter)?;

    let (study, removed_samples) = match config.relatedness {
        Some((method, min_kinship)) => {
            let outcome = relatedness::resolve(engine, &study, method, min_kinship, &config.out_dir)?;
            (outcome.dataset, outcome.removed)
        }
        None => (study, Vec::new()),
    };

    let reference = GenotypeDataset::read_native(&config.reference_path())?;
    let (study_in_ref, _) = projection::intersect(&study, &reference, &config.data_basename, &config.out_dir)?;
    let ref_in_data = GenotypeDataset::read_native(&projection::reference_intersect_path(
        &config.out_dir,
        &config.data_basename,
    ))?;

    info!("Computing reference PCs");
    let basis = projection::compute_basis(engine, &ref_in_data, config.num_pcs, &config.out_dir)?;
    let paths = BasisPaths::new(&config.out_dir);

    let loadings = LoadingsTable::read(&paths.loadings)?;
    let study_scores = projection::pc_project(&study_in_ref, &loadings)?;
    study_scores.write(&config.study_scores_path())?;
    info!(
        "Projected {} study samples onto {} reference PCs",
        study_scores.samples.len(),
        basis.eigenvalues.len()
    );

    let reference_scores = ScoreTable::read(&paths.scores_export)?;
    let study_scores = ScoreTable::read(&config.study_scores_path())?;
    let metadata = MetadataTable::read(&config.ref_info)?;
    let merged = merge::merge(&reference_scores, &metadata, &study_scores)?;

    let existing_model = config.model.as_deref().map(RandomForest::load).transpose()?;
    let num_pcs = config.classifier.num_pcs.min(merged.scores.ncols());
    if num_pcs < config.classifier.num_pcs {
        warn!(
            "Classifying on {} PCs; only {} are available",
            num_pcs,
            merged.scores.ncols()
        );
    }
    let classifier_config = ClassifierConfig {
        num_pcs,
        ..config.classifier.clone()
    };
    let (labeled, model) = classifier::assign(&merged, &classifier_config, existing_model)?;
    if config.model.is_none() {
        model.save(&config.model_output_path())?;
    }

    let study_rows = labeled.unlabeled_rows();
    labeled.write_rows(&config.probabilities_path(), &study_rows, num_pcs)?;

    info!("Generating PCA plots");
    if num_pcs >= 2 {
        plot::plot_pca_with_reference(&labeled, num_pcs, &config.plot_path())?;
    } else {
        warn!("Skipping PCA plots; need at least two PCs");
    }

    Ok(PipelineOutput {
        labeled,
        model,
        removed_samples,
    })
}
