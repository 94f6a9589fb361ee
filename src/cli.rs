use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use ancestry_pca::filter::ReferenceBuild;
use ancestry_pca::phasing::PhasingSoftware;
use ancestry_pca::pipeline::InputType;
use ancestry_pca::relatedness::RelatednessMethod;

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Reference-panel PCA projection and ancestry assignment.",
    long_about = None,
    propagate_version = true
)]
pub(crate) struct CliArgs {
    #[command(subcommand)]
    pub(crate) command: Command,

    #[arg(short = 't', long, global = true)]
    pub(crate) threads: Option<usize>,

    #[arg(long, default_value = "Info", global = true)]
    pub(crate) log_level: String,

    /// Draw progress bars for long pairwise computations.
    #[arg(long, global = true)]
    pub(crate) progress: bool,
}

#[derive(Subcommand, Debug)]
pub(crate) enum Command {
    /// Filter, project onto the reference panel and assign populations.
    Pca(PcaArgs),
    /// Apply the variant filters and write the filtered dataset.
    Filter(FilterArgs),
    /// Remove related samples and write the pruned dataset.
    Relatedness(RelatednessArgs),
    /// Convert a VCF or PLINK input into a native dataset directory.
    Import(InputArgs),
    /// Project samples onto an existing loadings table.
    Project(ProjectArgs),
    /// Plan phasing jobs for scattered VCF shards.
    PhasePlan(PhasePlanArgs),
}

#[derive(Args, Debug)]
pub(crate) struct InputArgs {
    #[arg(long)]
    pub(crate) data_dir: PathBuf,

    #[arg(long)]
    pub(crate) data_basename: String,

    #[arg(long, value_enum, default_value_t = InputType::Vcf)]
    pub(crate) input_type: InputType,

    #[arg(short, long)]
    pub(crate) out_dir: PathBuf,
}

#[derive(Args, Debug)]
pub(crate) struct FilterParams {
    #[arg(long, value_enum, default_value_t = ReferenceBuild::GRCh38)]
    pub(crate) reference: ReferenceBuild,

    #[arg(long, default_value_t = 0.05)]
    pub(crate) maf: f64,

    #[arg(long, default_value_t = 1e-3)]
    pub(crate) hwe: f64,

    #[arg(long, default_value_t = 0.98)]
    pub(crate) call_rate: f64,

    #[arg(long, default_value_t = 0.2)]
    pub(crate) ld_cor: f64,

    #[arg(long, default_value_t = 250_000)]
    pub(crate) ld_window: u64,
}

#[derive(Args, Debug)]
pub(crate) struct FilterArgs {
    #[command(flatten)]
    pub(crate) input: InputArgs,

    #[command(flatten)]
    pub(crate) params: FilterParams,
}

#[derive(Args, Debug)]
pub(crate) struct RelatednessArgs {
    #[command(flatten)]
    pub(crate) input: InputArgs,

    #[arg(long, value_enum, default_value_t = RelatednessMethod::PcRelate)]
    pub(crate) method: RelatednessMethod,

    #[arg(long, default_value_t = 0.1)]
    pub(crate) kin_estimate: f64,
}

#[derive(Args, Debug)]
pub(crate) struct PcaArgs {
    #[command(flatten)]
    pub(crate) input: InputArgs,

    #[command(flatten)]
    pub(crate) params: FilterParams,

    #[arg(long)]
    pub(crate) ref_dir: PathBuf,

    #[arg(long)]
    pub(crate) ref_basename: String,

    /// Reference sample metadata TSV with a `Sample` column.
    #[arg(long)]
    pub(crate) ref_info: PathBuf,

    /// Prune related study samples before projection.
    #[arg(long, value_enum)]
    pub(crate) relatedness: Option<RelatednessMethod>,

    #[arg(long, default_value_t = 0.1)]
    pub(crate) kin_estimate: f64,

    #[arg(long, default_value_t = 0.8)]
    pub(crate) prob_threshold: f64,

    #[arg(short = 'k', long, default_value_t = 20)]
    pub(crate) num_pcs: usize,

    #[arg(long, default_value_t = 100)]
    pub(crate) num_trees: usize,

    #[arg(long, default_value_t = 42)]
    pub(crate) seed: u64,

    /// A random forest saved by an earlier run.
    #[arg(long)]
    pub(crate) model: Option<PathBuf>,
}

#[derive(Args, Debug)]
pub(crate) struct ProjectArgs {
    #[command(flatten)]
    pub(crate) input: InputArgs,

    #[arg(long)]
    pub(crate) loadings: PathBuf,
}

#[derive(Args, Debug)]
pub(crate) struct PhasePlanArgs {
    /// File listing one VCF per line (first tab-separated column).
    #[arg(long)]
    pub(crate) input_vcfs: PathBuf,

    /// `region<TAB>index` lines for the scattered shards.
    #[arg(long)]
    pub(crate) regions: PathBuf,

    #[arg(long, value_enum, default_value_t = PhasingSoftware::Shapeit)]
    pub(crate) software: PhasingSoftware,

    #[arg(long, value_enum, default_value_t = ReferenceBuild::GRCh38)]
    pub(crate) reference: ReferenceBuild,

    #[arg(long)]
    pub(crate) reference_panel: Option<PathBuf>,

    #[arg(long, default_value_t = 4)]
    pub(crate) cpu: usize,

    #[arg(long, default_value_t = 3)]
    pub(crate) phasing_threads: usize,

    #[arg(short, long)]
    pub(crate) out_dir: PathBuf,
}
