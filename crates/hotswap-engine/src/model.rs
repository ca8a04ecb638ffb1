//! Lightweight scoring models
//!
//! Both the conflict resolver (merge-success confidence) and the failure
//! predictor (failure probability) score a small feature vector through a
//! [`ScoringModel`]. The provided [`LinearModel`] is a logistic regression
//! nudged online:
//!
//! ```text
//! p = sigmoid(bias + w · x)
//! w += rate * (actual - p) * x
//! ```

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

/// Pluggable scoring strategy
pub trait ScoringModel: Send + Sync {
    /// Probability in `[0, 1]` for `features`
    fn score(&self, features: &[f64]) -> f64;

    /// Learn from an observed outcome (`1.0` = the event happened)
    fn update(&self, features: &[f64], actual: f64);

    /// Running accuracy in `[0, 1]`
    fn accuracy(&self) -> f64;
}

/// Weights, bias and accuracy of a [`LinearModel`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinearParams {
    pub weights: Vec<f64>,
    pub bias: f64,
    /// Exponential moving average of prediction correctness
    pub accuracy: f64,
    pub updates: u64,
}

/// Smoothing factor of the accuracy moving average
const ACCURACY_ALPHA: f64 = 0.1;

/// Online logistic regression
#[derive(Debug)]
pub struct LinearModel {
    params: RwLock<LinearParams>,
    learning_rate: f64,
}

impl LinearModel {
    pub fn new(weights: Vec<f64>, bias: f64, learning_rate: f64) -> Self {
        Self {
            params: RwLock::new(LinearParams {
                weights,
                bias,
                accuracy: 0.5,
                updates: 0,
            }),
            learning_rate,
        }
    }

    /// Copy of the current parameters
    pub fn params(&self) -> LinearParams {
        self.params.read().clone()
    }

    fn raw_score(params: &LinearParams, features: &[f64]) -> f64 {
        let dot: f64 = params
            .weights
            .iter()
            .zip(features)
            .map(|(w, x)| w * x)
            .sum();
        sigmoid(params.bias + dot)
    }
}

impl ScoringModel for LinearModel {
    fn score(&self, features: &[f64]) -> f64 {
        Self::raw_score(&self.params.read(), features)
    }

    fn update(&self, features: &[f64], actual: f64) {
        let mut params = self.params.write();
        let predicted = Self::raw_score(&params, features);
        let error = actual - predicted;
        for (w, x) in params.weights.iter_mut().zip(features) {
            *w += self.learning_rate * error * x;
        }
        params.bias += self.learning_rate * error;

        let correct = (predicted >= 0.5) == (actual >= 0.5);
        params.accuracy =
            (1.0 - ACCURACY_ALPHA) * params.accuracy + ACCURACY_ALPHA * f64::from(u8::from(correct));
        params.updates += 1;
    }

    fn accuracy(&self) -> f64 {
        self.params.read().accuracy
    }
}

/// Logistic function
pub fn sigmoid(x: f64) -> f64 {
    1.0 / (1.0 + (-x).exp())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sigmoid() {
        assert_eq!(sigmoid(0.0), 0.5);
        assert!(sigmoid(10.0) > 0.99);
        assert!(sigmoid(-10.0) < 0.01);
    }

    #[test]
    fn test_score_uses_bias_and_weights() {
        let model = LinearModel::new(vec![2.0, -1.0], 0.0, 0.01);
        assert_eq!(model.score(&[0.0, 0.0]), 0.5);
        assert!(model.score(&[1.0, 0.0]) > 0.8);
        assert!(model.score(&[0.0, 1.0]) < 0.3);
    }

    #[test]
    fn test_update_moves_towards_outcome() {
        let model = LinearModel::new(vec![0.0], 0.0, 0.5);
        let before = model.score(&[1.0]);
        for _ in 0..20 {
            model.update(&[1.0], 1.0);
        }
        assert!(model.score(&[1.0]) > before);
        assert!(model.accuracy() > 0.5);
        assert_eq!(model.params().updates, 20);
    }

    #[test]
    fn test_accuracy_drops_on_misses() {
        let model = LinearModel::new(vec![5.0], 0.0, 0.0);
        // Always predicts high; outcomes say otherwise
        for _ in 0..10 {
            model.update(&[1.0], 0.0);
        }
        assert!(model.accuracy() < 0.25);
    }
}
