use crate::models::FeatureMatrix;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};

const IMPURITY_EPSILON: f64 = 1e-12;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Criterion {
    /// Binary labels in {0, 1}; leaves hold the positive fraction.
    Gini,
    /// Continuous labels; leaves hold the mean.
    SquaredError,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TreeConfig {
    pub max_depth: usize,
    pub min_samples_split: usize,
    pub min_samples_leaf: usize,
    /// Number of features drawn at random for each split search.
    pub max_features: usize,
    pub criterion: Criterion,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
enum Node {
    Leaf {
        value: f64,
    },
    Split {
        feature: usize,
        threshold: f64,
        left: Box<Node>,
        right: Box<Node>,
    },
}

#[derive(Debug, Clone, Copy, Default)]
struct NodeStats {
    count: f64,
    sum: f64,
    sum_sq: f64,
}

impl NodeStats {
    fn push(&mut self, y: f64) {
        self.count += 1.0;
        self.sum += y;
        self.sum_sq += y * y;
    }

    fn pop(&mut self, y: f64) {
        self.count -= 1.0;
        self.sum -= y;
        self.sum_sq -= y * y;
    }

    fn mean(&self) -> f64 {
        if self.count > 0.0 {
            self.sum / self.count
        } else {
            0.0
        }
    }

    fn impurity(&self, criterion: Criterion) -> f64 {
        if self.count <= 0.0 {
            return 0.0;
        }
        let mean = self.mean();
        match criterion {
            Criterion::Gini => 2.0 * mean * (1.0 - mean),
            Criterion::SquaredError => (self.sum_sq / self.count - mean * mean).max(0.0),
        }
    }
}

struct BestSplit {
    feature: usize,
    threshold: f64,
    gain: f64,
    left: Vec<usize>,
    right: Vec<usize>,
}

/// CART tree fitted on a (possibly repeated) set of sample indices.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionTree {
    root: Node,
    node_count: usize,
    importances: Vec<f64>,
}

impl DecisionTree {
    pub fn fit(
        x: &FeatureMatrix,
        y: &[f64],
        samples: &[usize],
        config: &TreeConfig,
        rng: &mut StdRng,
    ) -> Self {
        let mut builder = TreeBuilder {
            x,
            y,
            config,
            importances: vec![0.0; x.n_features()],
            node_count: 0,
        };
        let root = builder.build(samples.to_vec(), 0, rng);

        let mut importances = builder.importances;
        let total: f64 = importances.iter().sum();
        if total > 0.0 {
            for value in &mut importances {
                *value /= total;
            }
        }

        Self {
            root,
            node_count: builder.node_count,
            importances,
        }
    }

    /// Leaf value for one row: positive fraction for Gini trees, mean for regression trees.
    pub fn predict_row(&self, row: &[f64]) -> f64 {
        let mut node = &self.root;
        loop {
            match node {
                Node::Leaf { value } => return *value,
                Node::Split {
                    feature,
                    threshold,
                    left,
                    right,
                } => {
                    node = if row[*feature] <= *threshold { left } else { right };
                }
            }
        }
    }

    pub fn node_count(&self) -> usize {
        self.node_count
    }

    pub fn importances(&self) -> &[f64] {
        &self.importances
    }
}

struct TreeBuilder<'a> {
    x: &'a FeatureMatrix,
    y: &'a [f64],
    config: &'a TreeConfig,
    importances: Vec<f64>,
    node_count: usize,
}

impl<'a> TreeBuilder<'a> {
    fn build(&mut self, samples: Vec<usize>, depth: usize, rng: &mut StdRng) -> Node {
        self.node_count += 1;
        let mut stats = NodeStats::default();
        for &idx in &samples {
            stats.push(self.y[idx]);
        }
        let impurity = stats.impurity(self.config.criterion);
        let n = samples.len();

        if depth >= self.config.max_depth
            || n < self.config.min_samples_split
            || n < 2 * self.config.min_samples_leaf
            || impurity <= IMPURITY_EPSILON
        {
            return Node::Leaf {
                value: stats.mean(),
            };
        }

        let Some(best) = self.find_best_split(&samples, stats, rng) else {
            return Node::Leaf {
                value: stats.mean(),
            };
        };

        self.importances[best.feature] += best.gain * n as f64;
        let left = self.build(best.left, depth + 1, rng);
        let right = self.build(best.right, depth + 1, rng);
        Node::Split {
            feature: best.feature,
            threshold: best.threshold,
            left: Box::new(left),
            right: Box::new(right),
        }
    }

    fn find_best_split(
        &self,
        samples: &[usize],
        parent: NodeStats,
        rng: &mut StdRng,
    ) -> Option<BestSplit> {
        let criterion = self.config.criterion;
        let min_leaf = self.config.min_samples_leaf.max(1);
        let parent_impurity = parent.impurity(criterion);
        let n = samples.len();

        let mut features: Vec<usize> = (0..self.x.n_features()).collect();
        features.shuffle(rng);
        features.truncate(self.config.max_features.max(1));

        let mut best: Option<(usize, f64, f64)> = None;
        let mut sorted = samples.to_vec();
        for &feature in &features {
            sorted.sort_by(|&a, &b| self.x.rows[a][feature].total_cmp(&self.x.rows[b][feature]));

            let mut left = NodeStats::default();
            let mut right = parent;
            for pos in 0..n - 1 {
                let idx = sorted[pos];
                left.push(self.y[idx]);
                right.pop(self.y[idx]);

                let current = self.x.rows[idx][feature];
                let next = self.x.rows[sorted[pos + 1]][feature];
                if !(next > current) {
                    continue;
                }
                let left_n = pos + 1;
                if left_n < min_leaf || n - left_n < min_leaf {
                    continue;
                }

                let weighted = (left.count * left.impurity(criterion)
                    + right.count * right.impurity(criterion))
                    / n as f64;
                let gain = parent_impurity - weighted;
                if gain > best.map(|(_, _, g)| g).unwrap_or(0.0) {
                    let mut threshold = current + (next - current) / 2.0;
                    // Adjacent floats can round the midpoint up to `next`.
                    if threshold >= next {
                        threshold = current;
                    }
                    best = Some((feature, threshold, gain));
                }
            }
        }

        let (feature, threshold, gain) = best?;
        let (left, right): (Vec<usize>, Vec<usize>) = samples
            .iter()
            .partition(|&&idx| self.x.rows[idx][feature] <= threshold);
        Some(BestSplit {
            feature,
            threshold,
            gain,
            left,
            right,
        })
    }
}
