use std::io;

use thiserror::Error;

/// Errors raised by the library stages. Every variant is fatal for the run.
#[derive(Debug, Error)]
pub enum AncestryError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("the maximum kinship coefficient in KING is {max}, got {requested}")]
    KinshipBound { max: f64, requested: f64 },

    #[error("missing {statistic} for variant {variant}; genotype statistics must be computed upstream")]
    MissingStatistic {
        variant: String,
        statistic: &'static str,
    },

    #[error("no informative variants left for projection (need a loading and 0 < allele frequency < 1)")]
    NoInformativeVariants,

    #[error("sample {0} has no called genotypes at the retained projection sites")]
    NoCalledGenotypes(String),

    #[error("non-finite value while {0}")]
    NonFinite(String),

    #[error("missing column {column} in {path}")]
    MissingColumn { path: String, column: String },

    #[error("malformed record in {path} at line {line}: {message}")]
    MalformedRecord {
        path: String,
        line: usize,
        message: String,
    },

    #[error("PLINK read error: {0}")]
    Plink(String),

    #[error("plotting error: {0}")]
    Plot(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("table error: {0}")]
    Csv(#[from] csv::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, AncestryError>;

pub(crate) fn malformed(path: &std::path::Path, line: usize, message: impl Into<String>) -> AncestryError {
    AncestryError::MalformedRecord {
        path: path.display().to_string(),
        line,
        message: message.into(),
    }
}
