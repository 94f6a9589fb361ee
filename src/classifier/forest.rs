use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;

use log::debug;
use ndarray::{Array2, ArrayView1};
use rand::seq::SliceRandom;
use rand::Rng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};

use crate::error::{AncestryError, Result};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub(crate) enum Node {
    Leaf {
        /// Class frequencies of the training rows reaching this leaf.
        distribution: Vec<f64>,
    },
    Split {
        feature: usize,
        threshold: f64,
        left: usize,
        right: usize,
    },
}

/// A fully grown CART tree; node 0 is the root.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub(crate) struct DecisionTree {
    pub(crate) nodes: Vec<Node>,
}

impl DecisionTree {
    fn leaf_distribution(&self, row: ArrayView1<f64>) -> &[f64] {
        let mut idx = 0;
        loop {
            match &self.nodes[idx] {
                Node::Leaf { distribution } => return distribution,
                Node::Split {
                    feature,
                    threshold,
                    left,
                    right,
                } => idx = if row[*feature] <= *threshold { *left } else { *right },
            }
        }
    }
}

fn gini(counts: &[usize], total: usize) -> f64 {
    if total == 0 {
        return 0.0;
    }
    let t = total as f64;
    1.0 - counts.iter().map(|&c| (c as f64 / t).powi(2)).sum::<f64>()
}

struct BestSplit {
    feature: usize,
    threshold: f64,
    decrease: f64,
}

/// Grows trees on one training matrix; `labels[i]` indexes `classes`.
struct TreeBuilder<'a> {
    features: &'a Array2<f64>,
    labels: &'a [usize],
    num_classes: usize,
    candidates_per_split: usize,
    num_rows: usize,
}

impl TreeBuilder<'_> {
    fn class_counts(&self, rows: &[usize]) -> Vec<usize> {
        let mut counts = vec![0usize; self.num_classes];
        for &r in rows {
            counts[self.labels[r]] += 1;
        }
        counts
    }

    fn best_split_on(&self, rows: &[usize], feature: usize, parent_gini: f64) -> Option<BestSplit> {
        let mut sorted: Vec<usize> = rows.to_vec();
        sorted.sort_by(|&a, &b| self.features[[a, feature]].total_cmp(&self.features[[b, feature]]));

        let total = sorted.len();
        let mut left = vec![0usize; self.num_classes];
        let mut right = self.class_counts(&sorted);
        let mut best: Option<BestSplit> = None;
        for split in 1..total {
            let moved = sorted[split - 1];
            left[self.labels[moved]] += 1;
            right[self.labels[moved]] -= 1;
            let lo = self.features[[moved, feature]];
            let hi = self.features[[sorted[split], feature]];
            if hi <= lo {
                continue;
            }
            let weighted = (split as f64 * gini(&left, split) + (total - split) as f64 * gini(&right, total - split))
                / total as f64;
            let decrease = parent_gini - weighted;
            if best.as_ref().map_or(true, |b| decrease > b.decrease) {
                best = Some(BestSplit {
                    feature,
                    threshold: lo + (hi - lo) / 2.0,
                    decrease,
                });
            }
        }
        best
    }

    /// Grows one tree on `rows`, adding impurity decreases into `importances`.
    fn grow(&self, rows: Vec<usize>, rng: &mut ChaCha8Rng, importances: &mut [f64]) -> DecisionTree {
        let num_features = self.features.ncols();
        let mut nodes: Vec<Node> = Vec::new();
        // (node slot, rows reaching it)
        let mut pending: Vec<(usize, Vec<usize>)> = vec![(0, rows)];
        nodes.push(Node::Leaf { distribution: Vec::new() });

        while let Some((slot, rows)) = pending.pop() {
            let counts = self.class_counts(&rows);
            let parent_gini = gini(&counts, rows.len());
            let leaf = Node::Leaf {
                distribution: counts.iter().map(|&c| c as f64 / rows.len() as f64).collect(),
            };
            if parent_gini <= 0.0 || rows.len() < 2 {
                nodes[slot] = leaf;
                continue;
            }

            // draw candidate features; keep drawing past the quota until a split exists
            let mut order: Vec<usize> = (0..num_features).collect();
            order.shuffle(rng);
            let mut best: Option<BestSplit> = None;
            for (tried, &feature) in order.iter().enumerate() {
                if tried >= self.candidates_per_split && best.is_some() {
                    break;
                }
                if let Some(split) = self.best_split_on(&rows, feature, parent_gini) {
                    if best.as_ref().map_or(true, |b| split.decrease > b.decrease) {
                        best = Some(split);
                    }
                }
            }

            let Some(best) = best else {
                nodes[slot] = leaf;
                continue;
            };
            importances[best.feature] += best.decrease * rows.len() as f64 / self.num_rows as f64;

            let (left_rows, right_rows): (Vec<usize>, Vec<usize>) = rows
                .into_iter()
                .partition(|&r| self.features[[r, best.feature]] <= best.threshold);
            let left = nodes.len();
            nodes.push(Node::Leaf { distribution: Vec::new() });
            let right = nodes.len();
            nodes.push(Node::Leaf { distribution: Vec::new() });
            nodes[slot] = Node::Split {
                feature: best.feature,
                threshold: best.threshold,
                left,
                right,
            };
            pending.push((right, right_rows));
            pending.push((left, left_rows));
        }
        DecisionTree { nodes }
    }
}

/// Bagged CART classifier over principal-component features.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RandomForest {
    /// Class labels in sorted order; probability vectors follow this order.
    classes: Vec<String>,
    num_features: usize,
    trees: Vec<DecisionTree>,
    feature_importances: Vec<f64>,
}

impl RandomForest {
    pub(crate) fn from_trees(classes: Vec<String>, num_features: usize, trees: Vec<DecisionTree>) -> Self {
        Self {
            feature_importances: vec![0.0; num_features],
            classes,
            num_features,
            trees,
        }
    }

    /// Fits `num_trees` bootstrap trees, each split choosing among
    /// `sqrt(num_features)` random candidate features.
    pub fn fit(features: &Array2<f64>, labels: &[String], num_trees: usize, rng: &mut ChaCha8Rng) -> Result<Self> {
        if features.nrows() == 0 || features.nrows() != labels.len() {
            return Err(AncestryError::InvalidArgument(format!(
                "cannot train on {} rows with {} labels",
                features.nrows(),
                labels.len()
            )));
        }
        if num_trees == 0 || features.ncols() == 0 {
            return Err(AncestryError::InvalidArgument(
                "random forest needs at least one tree and one feature".into(),
            ));
        }
        let mut classes: Vec<String> = labels.to_vec();
        classes.sort();
        classes.dedup();
        let encoded: Vec<usize> = labels
            .iter()
            .map(|l| classes.binary_search(l).unwrap_or(0))
            .collect();

        let num_features = features.ncols();
        let builder = TreeBuilder {
            features,
            labels: &encoded,
            num_classes: classes.len(),
            candidates_per_split: ((num_features as f64).sqrt().floor() as usize).max(1),
            num_rows: features.nrows(),
        };

        let mut trees = Vec::with_capacity(num_trees);
        let mut importances = vec![0.0; num_features];
        for _ in 0..num_trees {
            let bootstrap: Vec<usize> = (0..features.nrows()).map(|_| rng.random_range(0..features.nrows())).collect();
            let mut tree_importances = vec![0.0; num_features];
            trees.push(builder.grow(bootstrap, rng, &mut tree_importances));
            let total: f64 = tree_importances.iter().sum();
            if total > 0.0 {
                for (acc, v) in importances.iter_mut().zip(&tree_importances) {
                    *acc += v / total;
                }
            }
        }
        let total: f64 = importances.iter().sum();
        if total > 0.0 {
            importances.iter_mut().for_each(|v| *v /= total);
        }
        debug!(
            "Trained random forest: {} trees, {} classes, {} total nodes",
            trees.len(),
            classes.len(),
            trees.iter().map(|t| t.nodes.len()).sum::<usize>()
        );

        Ok(Self {
            classes,
            num_features,
            trees,
            feature_importances: importances,
        })
    }

    pub fn classes(&self) -> &[String] {
        &self.classes
    }

    pub fn num_features(&self) -> usize {
        self.num_features
    }

    /// Mean impurity decrease per feature, normalised to sum to one.
    pub fn feature_importances(&self) -> &[f64] {
        &self.feature_importances
    }

    /// Mean over trees of the leaf class frequencies.
    pub fn predict_proba(&self, row: ArrayView1<f64>) -> Vec<f64> {
        let mut probs = vec![0.0; self.classes.len()];
        for tree in &self.trees {
            for (p, leaf) in probs.iter_mut().zip(tree.leaf_distribution(row)) {
                *p += leaf;
            }
        }
        let n = self.trees.len().max(1) as f64;
        probs.iter_mut().for_each(|p| *p /= n);
        probs
    }

    /// Index of the most probable class; the first class wins ties.
    pub fn argmax(probs: &[f64]) -> usize {
        probs
            .iter()
            .enumerate()
            .fold((0, f64::NEG_INFINITY), |best, (i, &p)| if p > best.1 { (i, p) } else { best })
            .0
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        serde_json::to_writer(BufWriter::new(File::create(path)?), self)?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let forest: Self = serde_json::from_reader(BufReader::new(File::open(path)?))?;
        if forest.trees.is_empty() || forest.classes.is_empty() {
            return Err(AncestryError::InvalidArgument(format!(
                "model {} has no trees or classes",
                path.display()
            )));
        }
        Ok(forest)
    }
}
