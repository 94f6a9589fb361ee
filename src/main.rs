use std::fs;
use std::time::Instant;

use anyhow::{Context, Error, Result};
use clap::Parser;
use log::{info, warn};

use ancestry_pca::classifier::ClassifierConfig;
use ancestry_pca::engine::InMemoryEngine;
use ancestry_pca::filter::{self, FilterConfig};
use ancestry_pca::phasing::{self, PhasingConfig, DEFAULT_IMAGE};
use ancestry_pca::pipeline::{self, PipelineConfig};
use ancestry_pca::relatedness;

mod cli;

use cli::{CliArgs, Command, FilterParams, InputArgs};

fn filter_config(params: &FilterParams) -> FilterConfig {
    FilterConfig {
        maf_min: params.maf,
        hwe_min: params.hwe,
        call_rate_min: params.call_rate,
        ld_r2_max: params.ld_cor,
        ld_window_bp: params.ld_window,
        ..FilterConfig::for_build(params.reference)
    }
}

fn prepare_out_dir(input: &InputArgs) -> Result<()> {
    if !input.out_dir.exists() {
        fs::create_dir_all(&input.out_dir)
            .with_context(|| format!("Failed to create output directory {}", input.out_dir.display()))?;
        info!("Created output directory: {}", input.out_dir.display());
    }
    Ok(())
}

fn run(command: Command, engine: &InMemoryEngine) -> Result<()> {
    match command {
        Command::Pca(args) => {
            prepare_out_dir(&args.input)?;
            let mut config = PipelineConfig::new(
                &args.ref_dir,
                &args.ref_basename,
                &args.ref_info,
                &args.input.data_dir,
                &args.input.data_basename,
                args.input.input_type,
                &args.input.out_dir,
            );
            config.filter = filter_config(&args.params);
            config.relatedness = args.relatedness.map(|method| (method, args.kin_estimate));
            config.num_pcs = args.num_pcs;
            config.classifier = ClassifierConfig {
                num_pcs: args.num_pcs,
                seed: args.seed,
                num_trees: args.num_trees,
                min_prob: args.prob_threshold,
                ..ClassifierConfig::default()
            };
            config.model = args.model;
            let output = pipeline::pca_with_ref(engine, &config)?;

            let study_rows = output.labeled.unlabeled_rows();
            let unassigned = study_rows
                .iter()
                .filter(|&&row| output.labeled.predicted[row] == config.classifier.missing_label)
                .count();
            info!(
                "Assigned {} of {} study samples at probability >= {}",
                study_rows.len() - unassigned,
                study_rows.len(),
                config.classifier.min_prob
            );
            if !output.removed_samples.is_empty() {
                warn!("{} related study samples were excluded", output.removed_samples.len());
            }
        }
        Command::Filter(args) => {
            prepare_out_dir(&args.input)?;
            let dataset = pipeline::load_dataset(args.input.input_type, &args.input.data_dir, &args.input.data_basename)?;
            let filtered = filter::filter(engine, &dataset, &filter_config(&args.params))?;
            let path = args
                .input
                .out_dir
                .join(format!("{}_filtered.mt", args.input.data_basename));
            filtered.write_native(&path)?;
        }
        Command::Relatedness(args) => {
            prepare_out_dir(&args.input)?;
            let dataset = pipeline::load_dataset(args.input.input_type, &args.input.data_dir, &args.input.data_basename)?;
            let outcome = relatedness::resolve(engine, &dataset, args.method, args.kin_estimate, &args.input.out_dir)?;
            let path = args
                .input
                .out_dir
                .join(format!("{}_unrelated.mt", args.input.data_basename));
            outcome.dataset.write_native(&path)?;
        }
        Command::Import(args) => {
            prepare_out_dir(&args)?;
            let dataset = pipeline::load_dataset(args.input_type, &args.data_dir, &args.data_basename)?;
            dataset.write_native(&args.out_dir.join(format!("{}.mt", args.data_basename)))?;
        }
        Command::Project(args) => {
            prepare_out_dir(&args.input)?;
            let dataset = pipeline::load_dataset(args.input.input_type, &args.input.data_dir, &args.input.data_basename)?;
            let output = args
                .input
                .out_dir
                .join(format!("{}_scores.tsv", args.input.data_basename));
            pipeline::project_with_loadings(&dataset, &args.loadings, &output)?;
        }
        Command::PhasePlan(args) => {
            fs::create_dir_all(&args.out_dir)
                .with_context(|| format!("Failed to create output directory {}", args.out_dir.display()))?;
            let config = PhasingConfig {
                software: args.software,
                reference: args.reference,
                reference_panel: args.reference_panel,
                cpu: args.cpu,
                threads: args.phasing_threads,
                image: DEFAULT_IMAGE.to_string(),
            };
            let jobs = phasing::plan(&config, &args.input_vcfs, &args.regions, &args.out_dir)?;
            phasing::write_plan(&args.out_dir.join("phasing_plan.json"), &jobs)?;
        }
    }
    Ok(())
}

fn main() -> Result<(), Error> {
    let total_time_start = Instant::now();
    let cli_args = CliArgs::parse();

    let log_level = cli_args
        .log_level
        .parse::<log::LevelFilter>()
        .unwrap_or_else(|_| {
            eprintln!(
                "Warning: Invalid log level '{}' provided. Defaulting to Info.",
                cli_args.log_level
            );
            log::LevelFilter::Info
        });
    env_logger::Builder::new()
        .filter_level(log_level)
        .format_timestamp_micros()
        .init();

    info!("Starting ancestry_pca with args: {:?}", cli_args);

    let num_threads = cli_args.threads.unwrap_or_else(num_cpus::get);
    info!("Using {} threads for parallel operations.", num_threads);
    rayon::ThreadPoolBuilder::new()
        .num_threads(num_threads)
        .build_global()?;

    let engine = InMemoryEngine::new(cli_args.progress);
    run(cli_args.command, &engine)?;

    info!(
        "ancestry_pca finished successfully in {:.2?}.",
        total_time_start.elapsed()
    );
    Ok(())
}
