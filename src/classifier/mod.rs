//! Supervised population assignment from PC scores.
//!
//! A random forest is trained on the rows with a known label, evaluated on
//! the held-out labelled rows and then applied to every row. Predictions
//! whose top probability is below `min_prob` get `missing_label` instead.

mod forest;

use std::collections::HashSet;
use std::path::Path;

use log::{info, warn};
use ndarray::{s, Array2, ArrayView1};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

pub use forest::RandomForest;

use crate::error::{AncestryError, Result};
use crate::merge::MergedTable;
use crate::output::{finish_tsv, pc_columns, tsv_writer};

#[derive(Clone, Debug, PartialEq)]
pub struct ClassifierConfig {
    pub num_pcs: usize,
    /// Metadata column with the known population of reference rows.
    pub known_label_col: String,
    pub seed: u64,
    pub train_fraction: f64,
    pub num_trees: usize,
    pub min_prob: f64,
    pub output_col: String,
    pub missing_label: String,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            num_pcs: 20,
            known_label_col: "SuperPop".to_string(),
            seed: 42,
            train_fraction: 0.8,
            num_trees: 100,
            min_prob: 0.9,
            output_col: "pop".to_string(),
            missing_label: "oth".to_string(),
        }
    }
}

/// The merged table with a predicted label and class probabilities per row.
#[derive(Clone, Debug)]
pub struct LabeledTable {
    pub table: MergedTable,
    pub output_col: String,
    pub predicted: Vec<String>,
    pub classes: Vec<String>,
    /// Rows x classes, columns in `classes` order.
    pub probabilities: Array2<f64>,
    /// Known label per row, `None` for study rows.
    pub known: Vec<Option<String>>,
}

impl LabeledTable {
    /// Indices of rows without a known label.
    pub fn unlabeled_rows(&self) -> Vec<usize> {
        (0..self.known.len()).filter(|&i| self.known[i].is_none()).collect()
    }

    /// Writes `s`, the output column, `prob_<class>` and `PC1..PCk` for the given rows.
    pub fn write_rows(&self, path: &Path, rows: &[usize], num_pcs: usize) -> Result<()> {
        let num_pcs = num_pcs.min(self.table.scores.ncols());
        let mut writer = tsv_writer(path)?;
        let mut header = vec!["s".to_string(), self.output_col.clone()];
        header.extend(self.classes.iter().map(|c| format!("prob_{}", c)));
        header.extend(pc_columns(num_pcs));
        writer.write_record(&header)?;
        for &row in rows {
            let mut record = vec![self.table.samples[row].clone(), self.predicted[row].clone()];
            record.extend(self.probabilities.row(row).iter().map(|p| p.to_string()));
            record.extend((0..num_pcs).map(|pc| self.table.scores[[row, pc]].to_string()));
            writer.write_record(&record)?;
        }
        finish_tsv(writer)?;
        info!("Wrote {} classified samples to {}", rows.len(), path.display());
        Ok(())
    }
}

fn features(table: &MergedTable, rows: &[usize], num_pcs: usize) -> Array2<f64> {
    Array2::from_shape_fn((rows.len(), num_pcs), |(r, pc)| table.scores[[rows[r], pc]])
}

fn train(
    table: &MergedTable,
    labeled: &[(usize, String)],
    config: &ClassifierConfig,
    num_pcs: usize,
) -> Result<RandomForest> {
    let n = labeled.len();
    if n == 0 {
        return Err(AncestryError::InvalidArgument(format!(
            "no rows with a known '{}' label to train on",
            config.known_label_col
        )));
    }
    let mut rng = ChaCha8Rng::seed_from_u64(config.seed);
    let num_train = ((n as f64) * config.train_fraction).floor() as usize;
    if num_train == 0 {
        return Err(AncestryError::InvalidArgument(format!(
            "training fraction {} of {} labelled rows leaves no training data",
            config.train_fraction, n
        )));
    }
    let picked = rand::seq::index::sample(&mut rng, n, num_train.min(n)).into_vec();
    let train_rows: Vec<usize> = picked.iter().map(|&i| labeled[i].0).collect();
    let train_labels: Vec<String> = picked.iter().map(|&i| labeled[i].1.clone()).collect();
    let train_ids: HashSet<&str> = train_rows.iter().map(|&r| table.samples[r].as_str()).collect();

    let forest = RandomForest::fit(&features(table, &train_rows, num_pcs), &train_labels, config.num_trees, &mut rng)?;
    info!("Random forest feature importances are as follows: {:?}", forest.feature_importances());

    let evaluation: Vec<&(usize, String)> = labeled
        .iter()
        .filter(|(row, _)| !train_ids.contains(table.samples[*row].as_str()))
        .collect();
    if evaluation.is_empty() {
        warn!("No labelled rows left for evaluation; error rate not estimated");
    } else {
        let correct = evaluation
            .iter()
            .filter(|(row, label)| {
                let probs = forest.predict_proba(table.scores.slice(s![*row, ..num_pcs]));
                &forest.classes()[RandomForest::argmax(&probs)] == label
            })
            .count();
        let error_rate = 1.0 - correct as f64 / evaluation.len() as f64;
        info!("Estimated error rate for RF model is {}", error_rate);
    }
    Ok(forest)
}

/// Trains (unless `existing_model` is given) and classifies every row of `table`.
pub fn assign(
    table: &MergedTable,
    config: &ClassifierConfig,
    existing_model: Option<RandomForest>,
) -> Result<(LabeledTable, RandomForest)> {
    let num_pcs = config.num_pcs;
    if num_pcs == 0 || num_pcs > table.scores.ncols() {
        return Err(AncestryError::InvalidArgument(format!(
            "cannot classify on {} PCs; the table has {}",
            num_pcs,
            table.scores.ncols()
        )));
    }
    let known: Vec<Option<String>> = table
        .column(&config.known_label_col)
        .ok_or_else(|| AncestryError::MissingColumn {
            path: "merged table".to_string(),
            column: config.known_label_col.clone(),
        })?
        .into_iter()
        .map(|v| v.map(String::from))
        .collect();
    let labeled: Vec<(usize, String)> = known
        .iter()
        .enumerate()
        .filter_map(|(row, label)| label.clone().map(|l| (row, l)))
        .collect();

    let model = match existing_model {
        Some(model) => {
            if model.num_features() != num_pcs {
                return Err(AncestryError::InvalidArgument(format!(
                    "model was trained on {} PCs but {} were requested",
                    model.num_features(),
                    num_pcs
                )));
            }
            info!("Using supplied random forest model");
            model
        }
        None => train(table, &labeled, config, num_pcs)?,
    };

    info!("Classifying data");
    let mut probabilities = Array2::<f64>::zeros((table.len(), model.classes().len()));
    let mut predicted = Vec::with_capacity(table.len());
    for row in 0..table.len() {
        let probs = model.predict_proba(table.scores.slice(s![row, ..num_pcs]));
        let best = RandomForest::argmax(&probs);
        let label = if probs[best] < config.min_prob {
            config.missing_label.clone()
        } else {
            model.classes()[best].clone()
        };
        predicted.push(label);
        probabilities.row_mut(row).assign(&ArrayView1::from(probs.as_slice()));
    }

    let labeled_table = LabeledTable {
        table: table.clone(),
        output_col: config.output_col.clone(),
        predicted,
        classes: model.classes().to_vec(),
        probabilities,
        known,
    };
    Ok((labeled_table, model))
}
