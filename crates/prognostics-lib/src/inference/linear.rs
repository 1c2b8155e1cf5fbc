//! Linear scoring models with an optional link function

use super::{ModelOutput, Scorer};
use anyhow::{ensure, Context, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Link {
    #[default]
    Identity,
    /// `exp(z)`, for strictly positive targets such as RUL hours
    Exp,
    /// `1 / (1 + exp(-z))`, for scores in (0, 1)
    Logistic,
}

/// `link(w . x + b)` with residual standard deviation on the linear scale
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinearModel {
    pub weights: Vec<f64>,
    #[serde(default)]
    pub bias: f64,
    #[serde(default)]
    pub link: Link,
    #[serde(default)]
    pub residual_std: Option<f64>,
}

impl LinearModel {
    pub fn from_json(bytes: &[u8]) -> Result<Self> {
        let model: LinearModel =
            serde_json::from_slice(bytes).context("Failed to parse linear model artifact")?;
        ensure!(!model.weights.is_empty(), "linear model has no weights");
        ensure!(
            model.weights.iter().all(|w| w.is_finite()) && model.bias.is_finite(),
            "linear model has non-finite coefficients"
        );
        Ok(model)
    }
}

impl Scorer for LinearModel {
    fn input_len(&self) -> usize {
        self.weights.len()
    }

    fn predict(&self, features: &[f64]) -> Result<ModelOutput> {
        ensure!(
            features.len() == self.weights.len(),
            "expected {} features, got {}",
            self.weights.len(),
            features.len()
        );
        let z: f64 = self
            .weights
            .iter()
            .zip(features)
            .map(|(w, x)| w * x)
            .sum::<f64>()
            + self.bias;

        // delta-method spread on the output scale
        let (value, slope) = match self.link {
            Link::Identity => (z, 1.0),
            Link::Exp => {
                let v = z.exp();
                (v, v)
            }
            Link::Logistic => {
                let v = 1.0 / (1.0 + (-z).exp());
                (v, v * (1.0 - v))
            }
        };

        Ok(ModelOutput {
            value,
            spread: self.residual_std.map(|s| s * slope),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_link() {
        let model = LinearModel::from_json(br#"{"weights":[2.0,-1.0],"bias":0.5,"residual_std":3.0}"#)
            .unwrap();
        let out = model.predict(&[1.0, 4.0]).unwrap();
        assert_eq!(out.value, -1.5);
        assert_eq!(out.spread, Some(3.0));
    }

    #[test]
    fn test_logistic_link_bounds_output() {
        let model = LinearModel {
            weights: vec![10.0],
            bias: 0.0,
            link: Link::Logistic,
            residual_std: None,
        };
        assert_eq!(model.predict(&[0.0]).unwrap().value, 0.5);
        let high = model.predict(&[5.0]).unwrap().value;
        assert!(high > 0.99 && high <= 1.0);
    }

    #[test]
    fn test_wrong_width_is_rejected() {
        let model = LinearModel::from_json(br#"{"weights":[1.0,1.0,1.0]}"#).unwrap();
        assert!(model.predict(&[1.0]).is_err());
        assert!(LinearModel::from_json(br#"{"weights":[]}"#).is_err());
    }
}
