//! Reference-panel PCA projection and ancestry assignment for genotype data.
//!
//! Study genotypes are filtered, optionally pruned of related samples,
//! intersected with a reference panel and projected onto the panel's PCs.
//! A random forest trained on the reference labels then assigns each study
//! sample a population, or `oth` when no class is confident enough.

pub mod classifier;
pub mod dataset;
pub mod engine;
pub mod error;
pub mod filter;
pub mod graph;
pub mod merge;
pub mod output;
pub mod phasing;
pub mod pipeline;
pub mod plink;
pub mod plot;
pub mod projection;
pub mod relatedness;
pub mod vcf;

pub use dataset::{GenotypeDataset, VariantKey};
pub use engine::{GenotypeEngine, InMemoryEngine};
pub use error::{AncestryError, Result};
pub use pipeline::{pca_with_ref, PipelineConfig};
