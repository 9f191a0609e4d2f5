//! Isolation-forest model state and scoring.

use serde::{Deserialize, Serialize};

/// Euler–Mascheroni constant used by the harmonic-number approximation.
const EULER_GAMMA: f64 = 0.577_215_664_901_532_9;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum Node {
    Split { feature: usize, threshold: f64, left: usize, right: usize },
    Leaf { size: usize },
}

/// Serialized form of a fitted ensemble.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ForestState {
    pub features: Vec<String>,
    /// Sub-sample size each tree was grown on.
    pub sample_size: usize,
    pub trees: Vec<Vec<Node>>,
    /// Decision scores of the training set, the reference distribution for percentiles.
    pub fitted_scores: Vec<f64>,
}

#[derive(Debug)]
pub struct IsolationForest {
    state: ForestState,
    normalizer: f64,
    sorted_fitted: Vec<f64>,
    /// Per tree and node: expected remaining path length below the node, weighted by leaf sizes.
    expected: Vec<Vec<f64>>,
}

/// Expected remaining path length below each node. Children always follow their parent,
/// so a reverse sweep sees both children before the split.
fn expected_lengths(tree: &[Node]) -> Vec<f64> {
    let mut size = vec![0usize; tree.len()];
    let mut expected = vec![0.0; tree.len()];
    for i in (0..tree.len()).rev() {
        match &tree[i] {
            Node::Leaf { size: n } => {
                size[i] = *n;
                expected[i] = average_path_length(*n);
            }
            Node::Split { left, right, .. } => {
                let (nl, nr) = (size[*left] as f64, size[*right] as f64);
                size[i] = size[*left] + size[*right];
                let (wl, wr) = if nl + nr > 0.0 { (nl / (nl + nr), nr / (nl + nr)) } else { (0.5, 0.5) };
                expected[i] = 1.0 + wl * expected[*left] + wr * expected[*right];
            }
        }
    }
    expected
}

/// Average path length of an unsuccessful BST search over `n` points.
pub fn average_path_length(n: usize) -> f64 {
    match n {
        0 | 1 => 0.0,
        2 => 1.0,
        n => {
            let n = n as f64;
            2.0 * ((n - 1.0).ln() + EULER_GAMMA) - 2.0 * (n - 1.0) / n
        }
    }
}

impl IsolationForest {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, String> {
        let state: ForestState = serde_json::from_slice(bytes).map_err(|e| format!("model state does not decode: {e}"))?;
        Self::from_state(state)
    }

    pub fn from_state(state: ForestState) -> Result<Self, String> {
        if state.features.is_empty() { return Err("model has no features".into()); }
        if state.trees.is_empty() { return Err("model has no trees".into()); }
        if state.sample_size < 2 { return Err(format!("sample_size {} is too small", state.sample_size)); }
        if state.fitted_scores.is_empty() { return Err("model has no fitted scores".into()); }
        if state.fitted_scores.iter().any(|s| !s.is_finite()) { return Err("fitted scores must be finite".into()); }
        for (t, tree) in state.trees.iter().enumerate() {
            if tree.is_empty() { return Err(format!("tree {t} is empty")); }
            for (i, node) in tree.iter().enumerate() {
                if let Node::Split { feature, threshold, left, right } = node {
                    if *feature >= state.features.len() { return Err(format!("tree {t} node {i}: feature {feature} out of range")); }
                    if !threshold.is_finite() { return Err(format!("tree {t} node {i}: threshold not finite")); }
                    // children strictly after their parent keeps traversal acyclic
                    for child in [*left, *right] {
                        if child <= i || child >= tree.len() { return Err(format!("tree {t} node {i}: child {child} out of range")); }
                    }
                }
            }
        }
        let normalizer = average_path_length(state.sample_size);
        let mut sorted_fitted = state.fitted_scores.clone();
        sorted_fitted.sort_by(|a, b| a.total_cmp(b));
        let expected = state.trees.iter().map(|t| expected_lengths(t)).collect();
        Ok(Self { state, normalizer, sorted_fitted, expected })
    }

    pub fn features(&self) -> &[String] { &self.state.features }

    fn path_length(tree: &[Node], row: &[f64]) -> f64 {
        let mut idx = 0;
        let mut depth = 0.0;
        loop {
            match &tree[idx] {
                Node::Leaf { size } => return depth + average_path_length(*size),
                Node::Split { feature, threshold, left, right } => {
                    idx = if row[*feature] < *threshold { *left } else { *right };
                    depth += 1.0;
                }
            }
        }
    }

    /// Anomaly decision score; higher means more anomalous, zero sits on the default contamination boundary.
    pub fn decision_score(&self, row: &[f64]) -> f64 {
        let total: f64 = self.state.trees.iter().map(|t| Self::path_length(t, row)).sum();
        let mean = total / self.state.trees.len() as f64;
        2f64.powf(-mean / self.normalizer) - 0.5
    }

    /// Per-feature contribution to `row`'s decision score, in the same units.
    ///
    /// Each split on the path moves the expected path length from the node's
    /// expectation to the child's; that move is credited to the split feature.
    /// Contributions are signed so positive values push toward anomalous, and
    /// they sum to the score minus the score of the forest's mean path length.
    pub fn attribution(&self, row: &[f64]) -> Vec<f64> {
        let mut shift = vec![0.0; self.state.features.len()];
        for (tree, expected) in self.state.trees.iter().zip(&self.expected) {
            let mut idx = 0;
            while let Node::Split { feature, threshold, left, right } = &tree[idx] {
                let next = if row[*feature] < *threshold { *left } else { *right };
                shift[*feature] += 1.0 + expected[next] - expected[idx];
                idx = next;
            }
        }
        let trees = self.state.trees.len() as f64;
        let baseline = self.baseline_path_length();
        // map path-length shifts through the score curve, then split the change proportionally
        let total: f64 = shift.iter().sum::<f64>() / trees;
        if total == 0.0 {
            return vec![0.0; shift.len()];
        }
        let score_change = 2f64.powf(-(baseline + total) / self.normalizer) - 2f64.powf(-baseline / self.normalizer);
        shift.iter().map(|s| score_change * (s / trees) / total).collect()
    }

    /// Mean expected path length at the tree roots; the reference point for [`Self::attribution`].
    pub fn baseline_path_length(&self) -> f64 {
        self.expected.iter().map(|e| e[0]).sum::<f64>() / self.expected.len() as f64
    }

    /// Rank percentile of `score` among the fitted scores, ties averaged.
    pub fn percentile_of(&self, score: f64) -> f64 {
        let n = self.sorted_fitted.len() as f64;
        let left = self.sorted_fitted.partition_point(|s| *s < score) as f64;
        let right = self.sorted_fitted.partition_point(|s| *s <= score) as f64;
        let plus1 = if left < right { 1.0 } else { 0.0 };
        (left + right + plus1) * 50.0 / n
    }
}
