use std::fs;
use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::config::{ScoringMode, Settings};
use crate::features::normalize;
use crate::models::{TripBreakdown, TripFeatures, TripScore};
use crate::risk::{rounded, sigmoid, RuleScorer, TripScorer};

pub const MODEL_VERSION: &str = "rf_v1.0";
pub const FEATURE_NAMES: [&str; 5] = [
    "avg_speed",
    "max_speed",
    "harsh_per_100km",
    "night_ratio",
    "speeding_per_100km",
];

pub type Sample = [f64; 5];

/// Size of the synthetic training set used at startup and by `train-model`.
pub const SYNTHETIC_SAMPLES: usize = 1200;

const SAMPLE_LOW: Sample = [40.0, 70.0, 0.0, 0.0, 0.0];
const SAMPLE_HIGH: Sample = [85.0, 130.0, 20.0, 1.0, 20.0];

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ForestParams {
    pub n_trees: usize,
    /// `None` grows each tree until its leaves are pure.
    pub max_depth: Option<usize>,
    pub min_samples_leaf: usize,
    pub seed: u64,
}

impl Default for ForestParams {
    fn default() -> Self {
        Self {
            n_trees: 120,
            max_depth: None,
            min_samples_leaf: 1,
            seed: 42,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
enum Node {
    Leaf {
        value: f64,
    },
    Split {
        feature: usize,
        threshold: f64,
        left: usize,
        right: usize,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct RegressionTree {
    nodes: Vec<Node>,
}

struct Split {
    feature: usize,
    threshold: f64,
}

impl RegressionTree {
    fn fit(x: &[Sample], y: &[f64], mut indices: Vec<usize>, params: &ForestParams) -> Self {
        let mut tree = Self { nodes: Vec::new() };
        tree.grow(x, y, &mut indices, 0, params);
        tree
    }

    fn grow(
        &mut self,
        x: &[Sample],
        y: &[f64],
        idx: &mut [usize],
        depth: usize,
        params: &ForestParams,
    ) -> usize {
        let node_id = self.nodes.len();
        let mean = idx.iter().map(|&i| y[i]).sum::<f64>() / idx.len() as f64;
        self.nodes.push(Node::Leaf { value: mean });

        let too_deep = params.max_depth.is_some_and(|max| depth >= max);
        if too_deep || idx.len() < 2 * params.min_samples_leaf.max(1) {
            return node_id;
        }
        let Some(split) = best_split(x, y, idx, params.min_samples_leaf.max(1)) else {
            return node_id;
        };

        let mut mid = 0;
        for k in 0..idx.len() {
            if x[idx[k]][split.feature] <= split.threshold {
                idx.swap(k, mid);
                mid += 1;
            }
        }
        let (left_idx, right_idx) = idx.split_at_mut(mid);
        let left = self.grow(x, y, left_idx, depth + 1, params);
        let right = self.grow(x, y, right_idx, depth + 1, params);
        self.nodes[node_id] = Node::Split {
            feature: split.feature,
            threshold: split.threshold,
            left,
            right,
        };
        node_id
    }

    fn predict(&self, sample: &Sample) -> f64 {
        let mut at = 0;
        loop {
            match self.nodes[at] {
                Node::Leaf { value } => return value,
                Node::Split {
                    feature,
                    threshold,
                    left,
                    right,
                } => at = if sample[feature] <= threshold { left } else { right },
            }
        }
    }

    /// Children must point forward within the node list, so prediction
    /// always reaches a leaf.
    fn check(&self) -> Result<()> {
        if self.nodes.is_empty() {
            bail!("tree has no nodes");
        }
        for (at, node) in self.nodes.iter().enumerate() {
            if let Node::Split {
                feature,
                threshold,
                left,
                right,
            } = *node
            {
                if feature >= FEATURE_NAMES.len() {
                    bail!("node {at} splits on unknown feature {feature}");
                }
                if !threshold.is_finite() {
                    bail!("node {at} has a non-finite threshold");
                }
                for child in [left, right] {
                    if child <= at || child >= self.nodes.len() {
                        bail!("node {at} has invalid child {child}");
                    }
                }
            }
        }
        Ok(())
    }
}

/// Finds the split maximising variance reduction, if any improves on the parent.
fn best_split(x: &[Sample], y: &[f64], idx: &[usize], min_leaf: usize) -> Option<Split> {
    let n = idx.len();
    let total: f64 = idx.iter().map(|&i| y[i]).sum();
    let parent_gain = total * total / n as f64;

    let mut best: Option<(f64, Split)> = None;
    let mut order = idx.to_vec();

    for feature in 0..FEATURE_NAMES.len() {
        order.sort_by(|&a, &b| x[a][feature].total_cmp(&x[b][feature]));

        let mut left_sum = 0.0;
        for split_at in 1..n {
            left_sum += y[order[split_at - 1]];
            if split_at < min_leaf || n - split_at < min_leaf {
                continue;
            }
            let lo = x[order[split_at - 1]][feature];
            let hi = x[order[split_at]][feature];
            if lo == hi {
                continue;
            }
            let right_sum = total - left_sum;
            let gain = left_sum * left_sum / split_at as f64
                + right_sum * right_sum / (n - split_at) as f64;
            if gain > parent_gain + 1e-9 && best.as_ref().map_or(true, |(g, _)| gain > *g) {
                best = Some((
                    gain,
                    Split {
                        feature,
                        threshold: (lo + hi) / 2.0,
                    },
                ));
            }
        }
    }

    best.map(|(_, split)| split)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RandomForest {
    pub version: String,
    pub feature_names: Vec<String>,
    pub params: ForestParams,
    trees: Vec<RegressionTree>,
}

impl RandomForest {
    /// Fits bootstrap-sampled trees. Deterministic for a given seed.
    pub fn fit(x: &[Sample], y: &[f64], params: ForestParams) -> Result<Self> {
        if x.is_empty() || x.len() != y.len() {
            bail!(
                "training set mismatch: {} samples, {} targets",
                x.len(),
                y.len()
            );
        }
        if params.n_trees == 0 {
            bail!("forest needs at least one tree");
        }

        let mut rng = StdRng::seed_from_u64(params.seed);
        let n = x.len();
        let trees = (0..params.n_trees)
            .map(|_| {
                let bootstrap: Vec<usize> = (0..n).map(|_| rng.gen_range(0..n)).collect();
                RegressionTree::fit(x, y, bootstrap, &params)
            })
            .collect();

        Ok(Self {
            version: MODEL_VERSION.to_string(),
            feature_names: FEATURE_NAMES.iter().map(|s| s.to_string()).collect(),
            params,
            trees,
        })
    }

    pub fn predict(&self, sample: &Sample) -> f64 {
        self.trees.iter().map(|t| t.predict(sample)).sum::<f64>() / self.trees.len() as f64
    }

    pub fn tree_count(&self) -> usize {
        self.trees.len()
    }

    pub fn evaluate(&self, x: &[Sample], y: &[f64]) -> ModelMetrics {
        let predictions: Vec<f64> = x.iter().map(|s| self.predict(s)).collect();
        let n = y.len().max(1) as f64;
        let mae = predictions
            .iter()
            .zip(y)
            .map(|(p, t)| (p - t).abs())
            .sum::<f64>()
            / n;
        let mean = y.iter().sum::<f64>() / n;
        let ss_res: f64 = predictions.iter().zip(y).map(|(p, t)| (t - p).powi(2)).sum();
        let ss_tot: f64 = y.iter().map(|t| (t - mean).powi(2)).sum();
        let r2 = if ss_tot == 0.0 { 0.0 } else { 1.0 - ss_res / ss_tot };
        ModelMetrics {
            mae,
            r2,
            n_test: y.len(),
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string(self).context("failed to serialize model")?;
        fs::write(path, json).with_context(|| format!("failed to write model {}", path.display()))
    }

    pub fn load(path: &Path) -> Result<Self> {
        let txt = fs::read_to_string(path)
            .with_context(|| format!("failed to read model at {}", path.display()))?;
        let forest: Self = serde_json::from_str(&txt)
            .with_context(|| format!("failed to parse model {}", path.display()))?;
        if forest.trees.is_empty() {
            bail!("model {} has no trees", path.display());
        }
        for (i, tree) in forest.trees.iter().enumerate() {
            tree.check()
                .with_context(|| format!("model {} tree {i} is malformed", path.display()))?;
        }
        if forest.feature_names != FEATURE_NAMES {
            bail!(
                "model {} expects features {:?}, scorer provides {:?}",
                path.display(),
                forest.feature_names,
                FEATURE_NAMES
            );
        }
        Ok(forest)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ModelMetrics {
    pub mae: f64,
    pub r2: f64,
    pub n_test: usize,
}

/// Synthetic risk target the forest learns, on the same 0-100 scale family
/// as the rule score.
pub fn synthetic_target(s: &Sample) -> f64 {
    (0.35 * ((s[0] - 60.0) / 40.0).clamp(0.0, 1.0)
        + 0.45 * ((s[1] - 80.0) / 40.0).clamp(0.0, 1.0)
        + 0.4 * sigmoid((s[2] - 6.0) / 2.0)
        + 0.3 * s[3]
        + 0.45 * sigmoid((s[4] - 5.0) / 2.0))
        * 25.0
}

pub fn synthesize(n: usize, seed: u64) -> (Vec<Sample>, Vec<f64>) {
    let mut rng = StdRng::seed_from_u64(seed);
    let x: Vec<Sample> = (0..n)
        .map(|_| std::array::from_fn(|j| rng.gen_range(SAMPLE_LOW[j]..SAMPLE_HIGH[j])))
        .collect();
    let y = x.iter().map(synthetic_target).collect();
    (x, y)
}

/// Fits on the full synthetic set, as done when no model file is configured.
pub fn fit_synthetic(samples: usize, params: ForestParams) -> Result<RandomForest> {
    let (x, y) = synthesize(samples, params.seed);
    RandomForest::fit(&x, &y, params)
}

/// Trains on synthetic data with an 80/20 holdout and reports holdout metrics.
pub fn train_synthetic(samples: usize, params: ForestParams) -> Result<(RandomForest, ModelMetrics)> {
    if samples < 10 {
        bail!("need at least 10 synthetic samples, got {samples}");
    }
    let (x, y) = synthesize(samples, params.seed);

    let mut order: Vec<usize> = (0..samples).collect();
    order.shuffle(&mut StdRng::seed_from_u64(params.seed));
    let n_test = samples / 5;
    let (test, train) = order.split_at(n_test);

    let pick = |ids: &[usize]| -> (Vec<Sample>, Vec<f64>) {
        (ids.iter().map(|&i| x[i]).collect(), ids.iter().map(|&i| y[i]).collect())
    };
    let (x_train, y_train) = pick(train);
    let (x_test, y_test) = pick(test);

    let forest = RandomForest::fit(&x_train, &y_train, params)?;
    let metrics = forest.evaluate(&x_test, &y_test);
    Ok((forest, metrics))
}

/// Writes the model and its companion files into `dir`.
pub fn write_artifacts(dir: &Path, forest: &RandomForest, metrics: &ModelMetrics) -> Result<()> {
    fs::create_dir_all(dir).with_context(|| format!("failed to create {}", dir.display()))?;
    forest.save(&dir.join("model.json"))?;
    fs::write(
        dir.join("feature_list.json"),
        serde_json::to_string_pretty(&forest.feature_names)?,
    )?;
    fs::write(dir.join("metrics.json"), serde_json::to_string_pretty(metrics)?)?;
    fs::write(dir.join("VERSION"), format!("{}\n", forest.version))?;
    Ok(())
}

pub struct ForestScorer {
    forest: RandomForest,
}

impl ForestScorer {
    pub fn new(forest: RandomForest) -> Self {
        Self { forest }
    }
}

impl TripScorer for ForestScorer {
    fn name(&self) -> &str {
        "random-forest (synthetic)"
    }

    fn score(&self, f: &TripFeatures) -> TripScore {
        let (norms, night) = normalize(f);
        let sample = [
            f.avg_speed,
            f.max_speed,
            norms.harsh_per_100km,
            night,
            norms.speeding_per_100km,
        ];
        TripScore {
            score: self.forest.predict(&sample).clamp(0.0, 100.0),
            breakdown: TripBreakdown {
                model: self.name().to_string(),
                contributions: None,
                norms: rounded(norms),
            },
        }
    }
}

/// Picks the trip scorer for `settings`. Model mode loads `model_path` when
/// set and otherwise fits the synthetic forest, which blocks for a while.
pub fn scorer_for(settings: &Settings) -> Result<Arc<dyn TripScorer>> {
    match settings.scoring_mode {
        ScoringMode::Rules => Ok(Arc::new(RuleScorer)),
        ScoringMode::Model => {
            let forest = match &settings.model_path {
                Some(path) => RandomForest::load(path)
                    .with_context(|| format!("failed to load model from {}", path.display()))?,
                None => {
                    info!(samples = SYNTHETIC_SAMPLES, "no MODEL_PATH set, fitting synthetic model");
                    fit_synthetic(SYNTHETIC_SAMPLES, ForestParams::default())?
                }
            };
            info!(trees = forest.tree_count(), version = %forest.version, "forest scorer ready");
            Ok(Arc::new(ForestScorer::new(forest)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_params() -> ForestParams {
        ForestParams {
            n_trees: 20,
            max_depth: Some(10),
            min_samples_leaf: 2,
            seed: 7,
        }
    }

    #[test]
    fn synthetic_samples_stay_in_range() {
        let (x, y) = synthesize(200, 42);
        assert_eq!(x.len(), 200);
        for (sample, target) in x.iter().zip(&y) {
            for j in 0..5 {
                assert!(sample[j] >= SAMPLE_LOW[j] && sample[j] < SAMPLE_HIGH[j]);
            }
            assert!(*target >= 0.0 && *target <= 50.0);
        }
        let (again, _) = synthesize(200, 42);
        assert_eq!(x, again);
    }

    #[test]
    fn single_split_tree_separates_two_groups() {
        let x = vec![
            [0.0, 0.0, 0.0, 0.0, 0.0],
            [1.0, 0.0, 0.0, 0.0, 0.0],
            [10.0, 0.0, 0.0, 0.0, 0.0],
            [11.0, 0.0, 0.0, 0.0, 0.0],
        ];
        let y = vec![1.0, 1.0, 5.0, 5.0];
        let params = ForestParams {
            n_trees: 1,
            max_depth: Some(4),
            min_samples_leaf: 1,
            seed: 1,
        };
        let tree = RegressionTree::fit(&x, &y, vec![0, 1, 2, 3], &params);
        assert_eq!(tree.predict(&[0.5, 0.0, 0.0, 0.0, 0.0]), 1.0);
        assert_eq!(tree.predict(&[20.0, 0.0, 0.0, 0.0, 0.0]), 5.0);
        assert_eq!(tree.nodes.len(), 3);
    }

    #[test]
    fn forest_learns_the_synthetic_target() {
        let (forest, metrics) = train_synthetic(600, small_params()).unwrap();
        assert_eq!(forest.tree_count(), 20);
        assert_eq!(metrics.n_test, 120);
        assert!(metrics.r2 > 0.7, "r2 too low: {}", metrics.r2);
        assert!(metrics.mae < 5.0, "mae too high: {}", metrics.mae);
    }

    #[test]
    fn forest_scorer_ranks_risky_trips_higher() {
        let (forest, _) = train_synthetic(600, small_params()).unwrap();
        let scorer = ForestScorer::new(forest);
        let calm = scorer.score(&TripFeatures {
            distance_km: 200.0,
            avg_speed: 42.0,
            max_speed: 72.0,
            harsh_brakes: 0,
            night_ratio: 0.0,
            speeding_events: 0,
        });
        let risky = scorer.score(&TripFeatures {
            distance_km: 50.0,
            avg_speed: 84.0,
            max_speed: 128.0,
            harsh_brakes: 9,
            night_ratio: 0.95,
            speeding_events: 9,
        });
        assert!(risky.score > calm.score + 20.0);
        assert!(calm.breakdown.contributions.is_none());
        assert_eq!(risky.breakdown.norms.harsh_per_100km, 18.0);
    }

    #[test]
    fn artifacts_load_back_with_identical_predictions() {
        let (forest, metrics) = train_synthetic(100, small_params()).unwrap();
        let dir = std::env::temp_dir().join(format!("telematics-model-{}", uuid::Uuid::new_v4()));
        write_artifacts(&dir, &forest, &metrics).unwrap();

        let loaded = RandomForest::load(&dir.join("model.json")).unwrap();
        let sample = [70.0, 100.0, 8.0, 0.4, 6.0];
        assert_eq!(loaded.predict(&sample), forest.predict(&sample));
        let version = fs::read_to_string(dir.join("VERSION")).unwrap();
        assert_eq!(version.trim(), MODEL_VERSION);
        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn rejects_empty_training_sets() {
        assert!(RandomForest::fit(&[], &[], ForestParams::default()).is_err());
        assert!(train_synthetic(5, ForestParams::default()).is_err());
    }

    #[test]
    fn startup_defaults_pin_the_synthetic_setup() {
        assert_eq!(SYNTHETIC_SAMPLES, 1200);
        let params = ForestParams::default();
        assert_eq!(params.n_trees, 120);
        assert_eq!(params.seed, 42);
        assert_eq!(params.max_depth, None);
        assert_eq!(params.min_samples_leaf, 1);
    }

    #[test]
    fn fit_synthetic_uses_every_sample() {
        let params = small_params();
        let forest = fit_synthetic(80, params).unwrap();
        let (x, y) = synthesize(80, params.seed);
        let direct = RandomForest::fit(&x, &y, params).unwrap();
        let sample = [62.0, 95.0, 4.0, 0.2, 3.0];
        assert_eq!(forest.predict(&sample), direct.predict(&sample));
    }

    fn write_model(forest: &RandomForest) -> std::path::PathBuf {
        let path = std::env::temp_dir()
            .join(format!("telematics-forest-{}.json", uuid::Uuid::new_v4()));
        forest.save(&path).unwrap();
        path
    }

    fn forest_with(nodes: Vec<Node>) -> RandomForest {
        RandomForest {
            version: MODEL_VERSION.to_string(),
            feature_names: FEATURE_NAMES.iter().map(|s| s.to_string()).collect(),
            params: ForestParams::default(),
            trees: vec![RegressionTree { nodes }],
        }
    }

    #[test]
    fn load_rejects_malformed_trees() {
        let leaf = |value| Node::Leaf { value };
        let split = |feature, left, right| Node::Split {
            feature,
            threshold: 1.0,
            left,
            right,
        };
        let cases = vec![
            vec![],
            vec![split(0, 1, 5), leaf(1.0)],
            vec![split(7, 1, 2), leaf(1.0), leaf(2.0)],
            vec![split(0, 0, 1), leaf(1.0)],
            vec![leaf(0.0), split(0, 0, 2), leaf(1.0)],
        ];
        for nodes in cases {
            let path = write_model(&forest_with(nodes));
            assert!(RandomForest::load(&path).is_err());
            fs::remove_file(&path).ok();
        }

        let good = write_model(&forest_with(vec![split(0, 1, 2), leaf(1.0), leaf(2.0)]));
        let loaded = RandomForest::load(&good).unwrap();
        assert_eq!(loaded.predict(&[3.0, 0.0, 0.0, 0.0, 0.0]), 2.0);
        fs::remove_file(&good).ok();
    }

    #[test]
    fn scorer_for_follows_the_scoring_mode() {
        let rules = scorer_for(&Settings::default()).unwrap();
        assert_eq!(rules.name(), "rules");

        let (forest, _) = train_synthetic(100, small_params()).unwrap();
        let path = write_model(&forest);
        let settings = Settings {
            scoring_mode: ScoringMode::Model,
            model_path: Some(path.clone()),
            ..Settings::default()
        };
        let scorer = scorer_for(&settings).unwrap();
        assert_eq!(scorer.name(), ForestScorer::new(forest).name());
        fs::remove_file(&path).ok();

        let missing = Settings {
            scoring_mode: ScoringMode::Model,
            model_path: Some(std::env::temp_dir().join("telematics-no-such-model.json")),
            ..Settings::default()
        };
        assert!(scorer_for(&missing).is_err());
    }
}
