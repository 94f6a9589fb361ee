//! Planning of haplotype-phasing jobs over scattered VCF shards.
//!
//! Each shard becomes one job description (resources, container image and
//! shell commands). Jobs are written out as a plan; nothing is executed here.

use std::collections::HashMap;
use std::fmt;
use std::fs::{self, File};
use std::io::{BufRead, BufReader, BufWriter};
use std::path::{Path, PathBuf};

use clap::ValueEnum;
use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::error::{malformed, AncestryError, Result};
use crate::filter::ReferenceBuild;

const BYTES_PER_GIB: f64 = 1024.0 * 1024.0 * 1024.0;

pub const DEFAULT_IMAGE: &str = "docker.io/lindonkambule/gwaspy:v1";

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PhasingSoftware {
    Eagle,
    Shapeit,
}

impl fmt::Display for PhasingSoftware {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PhasingSoftware::Eagle => write!(f, "eagle"),
            PhasingSoftware::Shapeit => write!(f, "shapeit"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemoryTier {
    Standard,
    Highmem,
}

/// Memory tier and disk size of one phasing job.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobResources {
    pub memory: MemoryTier,
    pub storage_gib: u64,
}

fn disk_for(gib: f64) -> u64 {
    (5.0 + 3.0 * gib).round_ties_even() as u64
}

impl JobResources {
    /// High memory above 1 GiB of target VCF; disk is `5 + 3x` GiB per input,
    /// the reference term only when a panel is used.
    pub fn size(vcf_bytes: u64, reference_bytes: Option<u64>) -> Self {
        let vcf_gib = vcf_bytes as f64 / BYTES_PER_GIB;
        let memory = if vcf_gib > 1.0 {
            MemoryTier::Highmem
        } else {
            MemoryTier::Standard
        };
        let reference_disk = reference_bytes.map_or(0, |b| disk_for(b as f64 / BYTES_PER_GIB));
        Self {
            memory,
            storage_gib: disk_for(vcf_gib) + reference_disk,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PhasingJob {
    pub name: String,
    pub cpu: usize,
    pub resources: JobResources,
    pub image: String,
    pub commands: Vec<String>,
    pub output: PathBuf,
}

#[derive(Clone, Debug)]
pub struct PhasingConfig {
    pub software: PhasingSoftware,
    pub reference: ReferenceBuild,
    pub reference_panel: Option<PathBuf>,
    pub cpu: usize,
    pub threads: usize,
    pub image: String,
}

impl Default for PhasingConfig {
    fn default() -> Self {
        Self {
            software: PhasingSoftware::Shapeit,
            reference: ReferenceBuild::GRCh38,
            reference_panel: None,
            cpu: 4,
            threads: 3,
            image: DEFAULT_IMAGE.to_string(),
        }
    }
}

/// File name without directory and without its VCF/BCF extension.
pub fn vcf_filebase(path: &Path) -> String {
    let name = path.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();
    for ext in [".vcf.gz", ".vcf.bgz", ".vcf", ".bcf"] {
        if let Some(stripped) = name.strip_suffix(ext) {
            return stripped.to_string();
        }
    }
    name
}

/// Shard index: the last dot-separated field of the shard base name.
pub fn shard_index(filebase: &str) -> Result<usize> {
    filebase
        .rsplit('.')
        .next()
        .and_then(|field| field.parse().ok())
        .ok_or_else(|| AncestryError::InvalidArgument(format!("shard name '{}' does not end in an index", filebase)))
}

/// Reads `region<TAB>index` lines into an index-to-region map.
pub fn read_regions(path: &Path) -> Result<HashMap<usize, String>> {
    let mut regions = HashMap::new();
    for (line_num, line) in BufReader::new(File::open(path)?).lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let (region, index) = line
            .split_once('\t')
            .ok_or_else(|| malformed(path, line_num + 1, "expected region<TAB>index"))?;
        let index = index
            .trim()
            .parse::<usize>()
            .map_err(|e| malformed(path, line_num + 1, format!("bad index '{}': {}", index, e)))?;
        regions.insert(index, region.to_string());
    }
    Ok(regions)
}

fn genetic_map(config: &PhasingConfig, chromosome: &str) -> String {
    match (config.software, config.reference) {
        (PhasingSoftware::Eagle, ReferenceBuild::GRCh38) => "/opt/genetic_map_hg38_withX.txt.gz".to_string(),
        (PhasingSoftware::Eagle, ReferenceBuild::GRCh37) => "/opt/genetic_map_hg19_withX.txt.gz".to_string(),
        (PhasingSoftware::Shapeit, ReferenceBuild::GRCh38) => format!("/shapeit4/maps/b38/{}.b38.gmap.gz", chromosome),
        (PhasingSoftware::Shapeit, ReferenceBuild::GRCh37) => format!("/shapeit4/maps/b37/{}.b37.gmap.gz", chromosome),
    }
}

/// Builds the job for one shard. SHAPEIT needs the shard's `region`.
pub fn plan_job(
    shard: &Path,
    resources: JobResources,
    region: Option<&str>,
    config: &PhasingConfig,
    out_dir: &Path,
) -> Result<PhasingJob> {
    let base = vcf_filebase(shard);
    let vcf = shard.display();
    let panel = config.reference_panel.as_ref().map(|p| p.display().to_string());

    let (name, commands, output) = match config.software {
        PhasingSoftware::Eagle => {
            let prefix = format!("{}.phased.eagle", base);
            let inputs = match &panel {
                Some(panel) => format!("--vcfRef {} --vcfTarget {}", panel, vcf),
                None => format!("--vcf {}", vcf),
            };
            let output = out_dir.join(format!("{}.vcf.gz", prefix));
            let commands = vec![
                format!(
                    "eagle --geneticMapFile {} --numThreads {} --outPrefix {} --vcfOutFormat b {}",
                    genetic_map(config, ""),
                    config.threads,
                    prefix,
                    inputs
                ),
                format!("mv {}.vcf.gz {}", prefix, output.display()),
            ];
            (prefix, commands, output)
        }
        PhasingSoftware::Shapeit => {
            let region = region.ok_or_else(|| {
                AncestryError::InvalidArgument(format!("no region known for shard {}", shard.display()))
            })?;
            let chromosome = region.split(':').next().unwrap_or(region);
            let file_name = format!("{}.phased.shapeit.bcf", base);
            let output = out_dir.join(&file_name);
            let mut commands = Vec::new();
            let reference_arg = match &panel {
                Some(panel) => {
                    commands.push(format!("bcftools index {}", panel));
                    format!(" --reference {}", panel)
                }
                None => String::new(),
            };
            commands.push(format!("bcftools index {}", vcf));
            commands.push(format!(
                "shapeit4.2 --input {} --map {} --region {}{} --output {} --thread {}",
                vcf,
                genetic_map(config, chromosome),
                region,
                reference_arg,
                file_name,
                config.threads
            ));
            commands.push(format!("mv {} {}", file_name, output.display()));
            (file_name, commands, output)
        }
    };

    Ok(PhasingJob {
        name,
        cpu: config.cpu,
        resources,
        image: config.image.clone(),
        commands,
        output,
    })
}

/// Plans one job per shard under `<out_dir>/<filebase>/scatter_vcfs` for
/// every VCF listed (first tab-separated column) in `input_list`.
pub fn plan(config: &PhasingConfig, input_list: &Path, regions_file: &Path, out_dir: &Path) -> Result<Vec<PhasingJob>> {
    if config.reference_panel.is_some() {
        info!("Planning {} phasing with a reference panel", config.software);
    } else {
        info!("Planning {} phasing without a reference panel", config.software);
    }
    let regions = read_regions(regions_file)?;
    let reference_bytes = match &config.reference_panel {
        Some(panel) => Some(fs::metadata(panel)?.len()),
        None => None,
    };

    let mut jobs = Vec::new();
    for line in BufReader::new(File::open(input_list)?).lines() {
        let line = line?;
        let Some(vcf) = line.split('\t').next().filter(|v| !v.trim().is_empty()) else {
            continue;
        };
        let filebase = vcf_filebase(Path::new(vcf));
        let scatter_dir = out_dir.join(&filebase).join("scatter_vcfs");
        let phased_dir = out_dir.join(&filebase).join("phased_scatter");

        let mut shards: Vec<PathBuf> = fs::read_dir(&scatter_dir)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.is_file())
            .collect();
        shards.sort();
        if shards.is_empty() {
            warn!("No shards found in {}", scatter_dir.display());
        }

        for shard in shards {
            let index = shard_index(&vcf_filebase(&shard))?;
            let region = regions.get(&index).map(String::as_str);
            let resources = JobResources::size(fs::metadata(&shard)?.len(), reference_bytes);
            jobs.push(plan_job(&shard, resources, region, config, &phased_dir)?);
        }
    }
    info!("Planned {} phasing jobs", jobs.len());
    Ok(jobs)
}

pub fn write_plan(path: &Path, jobs: &[PhasingJob]) -> Result<()> {
    serde_json::to_writer_pretty(BufWriter::new(File::create(path)?), jobs)?;
    info!("Wrote phasing plan to {}", path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const GIB: u64 = 1024 * 1024 * 1024;

    #[test]
    fn large_vcf_with_panel_needs_highmem() {
        let resources = JobResources::size(2 * GIB, Some(GIB));
        assert_eq!(resources.memory, MemoryTier::Highmem);
        assert_eq!(resources.storage_gib, 19);
    }

    #[test]
    fn small_vcf_without_panel() {
        let resources = JobResources::size(GIB / 2, None);
        assert_eq!(resources.memory, MemoryTier::Standard);
        // 5 + 1.5 = 6.5 rounds to even
        assert_eq!(resources.storage_gib, 6);
        assert_eq!(JobResources::size(GIB, None).memory, MemoryTier::Standard);
    }

    #[test]
    fn shard_index_is_last_field() {
        assert_eq!(vcf_filebase(Path::new("/data/chr20.cohort.12.vcf.gz")), "chr20.cohort.12");
        assert_eq!(shard_index("chr20.cohort.12").unwrap(), 12);
        assert!(shard_index("chr20.cohort").is_err());
    }

    #[test]
    fn shapeit_job_indexes_inputs_and_uses_region_map() {
        let config = PhasingConfig {
            reference_panel: Some(PathBuf::from("/ref/panel.bcf")),
            ..PhasingConfig::default()
        };
        let job = plan_job(
            Path::new("/s/chr20.3.vcf.gz"),
            JobResources::size(GIB, Some(GIB)),
            Some("chr20:1-1000000"),
            &config,
            Path::new("/out"),
        )
        .unwrap();
        assert_eq!(job.name, "chr20.3.phased.shapeit.bcf");
        assert_eq!(job.commands[0], "bcftools index /ref/panel.bcf");
        assert_eq!(job.commands[1], "bcftools index /s/chr20.3.vcf.gz");
        assert!(job.commands[2].contains("--map /shapeit4/maps/b38/chr20.b38.gmap.gz"));
        assert!(job.commands[2].contains("--region chr20:1-1000000 --reference /ref/panel.bcf"));
        assert_eq!(job.output, PathBuf::from("/out/chr20.3.phased.shapeit.bcf"));
    }

    #[test]
    fn shapeit_without_region_is_rejected() {
        let err = plan_job(
            Path::new("chr1.0.vcf.gz"),
            JobResources::size(1, None),
            None,
            &PhasingConfig::default(),
            Path::new("."),
        );
        assert!(err.is_err());
    }

    #[test]
    fn eagle_without_panel_uses_single_input() {
        let config = PhasingConfig {
            software: PhasingSoftware::Eagle,
            reference: ReferenceBuild::GRCh37,
            ..PhasingConfig::default()
        };
        let job = plan_job(Path::new("x.1.vcf.gz"), JobResources::size(1, None), None, &config, Path::new("o")).unwrap();
        assert_eq!(job.name, "x.1.phased.eagle");
        assert!(job.commands[0].contains("/opt/genetic_map_hg19_withX.txt.gz"));
        assert!(job.commands[0].ends_with("--vcf x.1.vcf.gz"));
        assert_eq!(job.output, PathBuf::from("o/x.1.phased.eagle.vcf.gz"));
    }

    #[test]
    fn plan_walks_scatter_directories() {
        let dir = tempfile::tempdir().unwrap();
        let scatter = dir.path().join("cohort").join("scatter_vcfs");
        fs::create_dir_all(&scatter).unwrap();
        fs::write(scatter.join("cohort.0.vcf.gz"), b"x").unwrap();
        fs::write(scatter.join("cohort.1.vcf.gz"), b"x").unwrap();
        let list = dir.path().join("inputs.tsv");
        fs::write(&list, "gs://bucket/cohort.vcf.gz\n").unwrap();
        let regions = dir.path().join("regions.lines");
        fs::write(&regions, "chr1:1-500\t0\nchr1:501-1000\t1\n").unwrap();

        let jobs = plan(&PhasingConfig::default(), &list, &regions, dir.path()).unwrap();
        assert_eq!(jobs.len(), 2);
        assert!(jobs[1].commands[1].contains("--region chr1:501-1000"));
        assert!(jobs[0].output.starts_with(dir.path().join("cohort").join("phased_scatter")));

        let plan_path = dir.path().join("plan.json");
        write_plan(&plan_path, &jobs).unwrap();
        let back: Vec<PhasingJob> = serde_json::from_reader(File::open(&plan_path).unwrap()).unwrap();
        assert_eq!(back, jobs);
    }
}
