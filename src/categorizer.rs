// Smart categorization - fitted text model as data
// A TF-IDF vectorizer and a linear or random-forest classifier, produced offline and loaded once at startup

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use tracing::{info, warn};

use crate::error::{Result, TrackerError};

// ============================================================================
// VECTORIZER
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Norm {
    L2,
    None,
}

fn default_true() -> bool {
    true
}

fn default_norm() -> Norm {
    Norm::L2
}

/// Fitted TF-IDF transformer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TfidfVectorizer {
    /// Token -> feature column
    pub vocabulary: HashMap<String, usize>,

    /// Inverse document frequency per column
    pub idf: Vec<f64>,

    #[serde(default = "default_true")]
    pub lowercase: bool,

    /// Use 1 + ln(tf) instead of raw counts
    #[serde(default)]
    pub sublinear_tf: bool,

    #[serde(default = "default_norm")]
    pub norm: Norm,
}

/// Split text into word tokens of at least two characters
pub fn tokenize(text: &str) -> Vec<&str> {
    text.split(|c: char| !(c.is_alphanumeric() || c == '_'))
        .filter(|tok| tok.chars().count() >= 2)
        .collect()
}

impl TfidfVectorizer {
    pub fn n_features(&self) -> usize {
        self.idf.len()
    }

    /// Sparse feature vector as (column, weight) pairs sorted by column
    pub fn transform(&self, text: &str) -> Vec<(usize, f64)> {
        let text = if self.lowercase {
            text.to_lowercase()
        } else {
            text.to_string()
        };

        let mut counts: HashMap<usize, f64> = HashMap::new();
        for token in tokenize(&text) {
            if let Some(&col) = self.vocabulary.get(token) {
                *counts.entry(col).or_insert(0.0) += 1.0;
            }
        }

        let mut features: Vec<(usize, f64)> = counts
            .into_iter()
            .map(|(col, tf)| {
                let tf = if self.sublinear_tf { 1.0 + tf.ln() } else { tf };
                (col, tf * self.idf[col])
            })
            .collect();
        features.sort_by_key(|(col, _)| *col);

        if self.norm == Norm::L2 {
            let norm = features.iter().map(|(_, w)| w * w).sum::<f64>().sqrt();
            if norm > 0.0 {
                for (_, w) in &mut features {
                    *w /= norm;
                }
            }
        }

        features
    }

    fn validate(&self) -> Result<()> {
        if let Some((token, col)) = self
            .vocabulary
            .iter()
            .find(|(_, &col)| col >= self.idf.len())
        {
            return Err(TrackerError::Model(format!(
                "vocabulary token '{}' maps to column {} but idf has {} entries",
                token,
                col,
                self.idf.len()
            )));
        }
        Ok(())
    }
}

// ============================================================================
// CLASSIFIER
// ============================================================================

/// Fitted one-vs-rest / multinomial linear classifier
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinearClassifier {
    pub classes: Vec<String>,

    /// One row per class, or a single row for a binary model
    pub coef: Vec<Vec<f64>>,

    pub intercept: Vec<f64>,
}

impl LinearClassifier {
    fn decision(&self, row: usize, features: &[(usize, f64)]) -> f64 {
        let weights = &self.coef[row];
        features
            .iter()
            .map(|(col, x)| weights[*col] * x)
            .sum::<f64>()
            + self.intercept[row]
    }

    pub fn predict(&self, features: &[(usize, f64)]) -> &str {
        if self.coef.len() == 1 && self.classes.len() == 2 {
            let idx = if self.decision(0, features) > 0.0 { 1 } else { 0 };
            return &self.classes[idx];
        }

        let mut best = 0;
        let mut best_score = f64::NEG_INFINITY;
        for row in 0..self.coef.len() {
            let score = self.decision(row, features);
            // Ties keep the earlier class
            if score > best_score {
                best = row;
                best_score = score;
            }
        }
        &self.classes[best]
    }

    fn validate(&self, n_features: usize) -> Result<()> {
        if self.classes.is_empty() {
            return Err(TrackerError::Model("classifier has no classes".into()));
        }

        let binary = self.classes.len() == 2 && self.coef.len() == 1;
        if !binary && self.coef.len() != self.classes.len() {
            return Err(TrackerError::Model(format!(
                "{} coefficient rows for {} classes",
                self.coef.len(),
                self.classes.len()
            )));
        }
        if self.intercept.len() != self.coef.len() {
            return Err(TrackerError::Model(format!(
                "{} intercepts for {} coefficient rows",
                self.intercept.len(),
                self.coef.len()
            )));
        }
        if let Some(row) = self.coef.iter().find(|row| row.len() != n_features) {
            return Err(TrackerError::Model(format!(
                "coefficient row has {} weights, vectorizer produces {} features",
                row.len(),
                n_features
            )));
        }
        Ok(())
    }
}

/// One node of a fitted decision tree. Children always sit at higher indices.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TreeNode {
    /// Go left when `x[feature] <= threshold`
    Split {
        feature: usize,
        threshold: f64,
        left: usize,
        right: usize,
    },
    /// Per-class weights (sample counts or fractions)
    Leaf { value: Vec<f64> },
}

/// Fitted decision tree, root at node 0
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionTree {
    pub nodes: Vec<TreeNode>,
}

/// Dense lookup into a sparse, column-sorted feature vector
fn feature_value(features: &[(usize, f64)], col: usize) -> f64 {
    features
        .binary_search_by_key(&col, |(c, _)| *c)
        .map(|idx| features[idx].1)
        .unwrap_or(0.0)
}

impl DecisionTree {
    /// Class probabilities of the leaf the features fall into
    fn leaf_probabilities(&self, features: &[(usize, f64)]) -> Vec<f64> {
        let mut idx = 0;
        loop {
            match &self.nodes[idx] {
                TreeNode::Split {
                    feature,
                    threshold,
                    left,
                    right,
                } => {
                    idx = if feature_value(features, *feature) <= *threshold {
                        *left
                    } else {
                        *right
                    };
                }
                TreeNode::Leaf { value } => {
                    let total: f64 = value.iter().sum();
                    return value.iter().map(|v| v / total).collect();
                }
            }
        }
    }

    fn validate(&self, tree: usize, n_features: usize, n_classes: usize) -> Result<()> {
        if self.nodes.is_empty() {
            return Err(TrackerError::Model(format!("tree {} has no nodes", tree)));
        }

        for (idx, node) in self.nodes.iter().enumerate() {
            match node {
                TreeNode::Split {
                    feature,
                    threshold,
                    left,
                    right,
                } => {
                    if *feature >= n_features {
                        return Err(TrackerError::Model(format!(
                            "tree {} node {} splits on feature {}, vectorizer produces {} features",
                            tree, idx, feature, n_features
                        )));
                    }
                    if !threshold.is_finite() {
                        return Err(TrackerError::Model(format!(
                            "tree {} node {} has a non-finite threshold",
                            tree, idx
                        )));
                    }
                    for child in [*left, *right] {
                        if child <= idx || child >= self.nodes.len() {
                            return Err(TrackerError::Model(format!(
                                "tree {} node {} points to invalid child {}",
                                tree, idx, child
                            )));
                        }
                    }
                }
                TreeNode::Leaf { value } => {
                    if value.len() != n_classes {
                        return Err(TrackerError::Model(format!(
                            "tree {} leaf {} has {} values for {} classes",
                            tree,
                            idx,
                            value.len(),
                            n_classes
                        )));
                    }
                    if value.iter().any(|v| !v.is_finite() || *v < 0.0)
                        || value.iter().sum::<f64>() <= 0.0
                    {
                        return Err(TrackerError::Model(format!(
                            "tree {} leaf {} has invalid class weights",
                            tree, idx
                        )));
                    }
                }
            }
        }
        Ok(())
    }
}

/// Fitted random forest: averages per-tree class probabilities
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForestClassifier {
    pub classes: Vec<String>,
    pub trees: Vec<DecisionTree>,
}

impl ForestClassifier {
    /// Mean class probabilities across trees
    pub fn predict_proba(&self, features: &[(usize, f64)]) -> Vec<f64> {
        let mut totals = vec![0.0; self.classes.len()];
        for tree in &self.trees {
            for (total, p) in totals.iter_mut().zip(tree.leaf_probabilities(features)) {
                *total += p;
            }
        }

        let n = self.trees.len() as f64;
        totals.into_iter().map(|t| t / n).collect()
    }

    pub fn predict(&self, features: &[(usize, f64)]) -> &str {
        let proba = self.predict_proba(features);

        let mut best = 0;
        for (idx, p) in proba.iter().enumerate() {
            // Ties keep the earlier class
            if *p > proba[best] {
                best = idx;
            }
        }
        &self.classes[best]
    }

    fn validate(&self, n_features: usize) -> Result<()> {
        if self.classes.is_empty() {
            return Err(TrackerError::Model("classifier has no classes".into()));
        }
        if self.trees.is_empty() {
            return Err(TrackerError::Model("forest has no trees".into()));
        }
        for (i, tree) in self.trees.iter().enumerate() {
            tree.validate(i, n_features, self.classes.len())?;
        }
        Ok(())
    }
}

/// The fitted classifier half of the artifact, tagged by `kind`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Classifier {
    Linear(LinearClassifier),
    Forest(ForestClassifier),
}

impl Classifier {
    pub fn classes(&self) -> &[String] {
        match self {
            Classifier::Linear(model) => &model.classes,
            Classifier::Forest(model) => &model.classes,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Classifier::Linear(_) => "linear",
            Classifier::Forest(_) => "forest",
        }
    }

    pub fn predict(&self, features: &[(usize, f64)]) -> &str {
        match self {
            Classifier::Linear(model) => model.predict(features),
            Classifier::Forest(model) => model.predict(features),
        }
    }

    fn validate(&self, n_features: usize) -> Result<()> {
        match self {
            Classifier::Linear(model) => model.validate(n_features),
            Classifier::Forest(model) => model.validate(n_features),
        }
    }
}

impl From<LinearClassifier> for Classifier {
    fn from(model: LinearClassifier) -> Self {
        Classifier::Linear(model)
    }
}

impl From<ForestClassifier> for Classifier {
    fn from(model: ForestClassifier) -> Self {
        Classifier::Forest(model)
    }
}

// ============================================================================
// CATEGORIZER
// ============================================================================

/// Read-only handle over a fitted vectorizer + classifier pair
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Categorizer {
    pub vectorizer: TfidfVectorizer,
    pub classifier: Classifier,
}

impl Categorizer {
    /// Build from parts, checking that the two halves agree
    pub fn new(vectorizer: TfidfVectorizer, classifier: impl Into<Classifier>) -> Result<Self> {
        let classifier = classifier.into();
        vectorizer.validate()?;
        classifier.validate(vectorizer.n_features())?;
        Ok(Categorizer {
            vectorizer,
            classifier,
        })
    }

    /// Load the JSON artifact written by the training job
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref())?;
        Self::from_json(&content)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let raw: Categorizer = serde_json::from_str(json)
            .map_err(|e| TrackerError::Model(format!("failed to parse model artifact: {}", e)))?;
        Self::new(raw.vectorizer, raw.classifier)
    }

    /// Startup helper: a missing or broken artifact disables categorization
    pub fn load_optional<P: AsRef<Path>>(path: P) -> Option<Self> {
        match Self::from_file(path.as_ref()) {
            Ok(model) => {
                info!(
                    path = %path.as_ref().display(),
                    kind = model.classifier.kind(),
                    classes = model.classifier.classes().len(),
                    features = model.vectorizer.n_features(),
                    "categorization model loaded"
                );
                Some(model)
            }
            Err(e) => {
                warn!(
                    path = %path.as_ref().display(),
                    error = %e,
                    "categorization model not loaded; smart categorization disabled"
                );
                None
            }
        }
    }

    /// Predict the category label for a free-text title
    pub fn predict(&self, title: &str) -> &str {
        let features = self.vectorizer.transform(title);
        self.classifier.predict(&features)
    }
}

/// Categorize with an optional model handle
pub fn categorize(model: Option<&Categorizer>, title: &str) -> Result<String> {
    model
        .map(|m| m.predict(title).to_string())
        .ok_or(TrackerError::ModelUnavailable)
}

// ============================================================================
// TESTS
// ============================================================================
