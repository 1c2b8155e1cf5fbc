//! Regression tree ensembles loaded from JSON
//!
//! Each tree is a flat node list rooted at index 0. A split sends a sample
//! left when `x[feature] < threshold`.

use super::{ModelOutput, Scorer};
use anyhow::{bail, ensure, Context, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Node {
    Split {
        feature: usize,
        threshold: f64,
        left: usize,
        right: usize,
    },
    Leaf {
        leaf: f64,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tree {
    pub nodes: Vec<Node>,
}

impl Tree {
    fn evaluate(&self, features: &[f64]) -> Result<f64> {
        let mut index = 0;
        // a well-formed tree never visits more nodes than it has
        for _ in 0..self.nodes.len() {
            match self.nodes.get(index) {
                Some(Node::Leaf { leaf }) => return Ok(*leaf),
                Some(Node::Split {
                    feature,
                    threshold,
                    left,
                    right,
                }) => {
                    let x = features.get(*feature).copied().unwrap_or(f64::NAN);
                    index = if x < *threshold { *left } else { *right };
                }
                None => bail!("node index {} out of range", index),
            }
        }
        bail!("tree does not terminate")
    }
}

/// Mean of independent regression trees; spread is their standard deviation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TreeEnsemble {
    pub n_features: usize,
    pub trees: Vec<Tree>,
}

impl TreeEnsemble {
    pub fn from_json(bytes: &[u8]) -> Result<Self> {
        let ensemble: TreeEnsemble =
            serde_json::from_slice(bytes).context("Failed to parse tree ensemble artifact")?;
        ensemble.check()?;
        Ok(ensemble)
    }

    fn check(&self) -> Result<()> {
        ensure!(!self.trees.is_empty(), "tree ensemble has no trees");
        for (t, tree) in self.trees.iter().enumerate() {
            ensure!(!tree.nodes.is_empty(), "tree {} is empty", t);
            for node in &tree.nodes {
                if let Node::Split {
                    feature,
                    left,
                    right,
                    ..
                } = node
                {
                    ensure!(
                        *feature < self.n_features,
                        "tree {} splits on feature {} of {}",
                        t,
                        feature,
                        self.n_features
                    );
                    ensure!(
                        *left < tree.nodes.len() && *right < tree.nodes.len(),
                        "tree {} has a dangling child",
                        t
                    );
                }
            }
        }
        Ok(())
    }
}

impl Scorer for TreeEnsemble {
    fn input_len(&self) -> usize {
        self.n_features
    }

    fn predict(&self, features: &[f64]) -> Result<ModelOutput> {
        ensure!(
            features.len() == self.n_features,
            "expected {} features, got {}",
            self.n_features,
            features.len()
        );
        let outputs = self
            .trees
            .iter()
            .map(|tree| tree.evaluate(features))
            .collect::<Result<Vec<f64>>>()?;

        let n = outputs.len() as f64;
        let mean = outputs.iter().sum::<f64>() / n;
        let spread = (outputs.len() > 1).then(|| {
            let var = outputs.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
            var.sqrt()
        });

        Ok(ModelOutput {
            value: mean,
            spread,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ENSEMBLE: &str = r#"{
        "n_features": 2,
        "trees": [
            {"nodes": [
                {"feature": 0, "threshold": 10.0, "left": 1, "right": 2},
                {"leaf": 400.0},
                {"leaf": 100.0}
            ]},
            {"nodes": [
                {"feature": 1, "threshold": 0.5, "left": 1, "right": 2},
                {"leaf": 600.0},
                {"leaf": 200.0}
            ]}
        ]
    }"#;

    #[test]
    fn test_ensemble_mean_and_spread() {
        let model = TreeEnsemble::from_json(ENSEMBLE.as_bytes()).unwrap();
        let out = model.predict(&[5.0, 0.1]).unwrap();
        assert_eq!(out.value, 500.0);
        assert_eq!(out.spread, Some(100.0));

        let out = model.predict(&[20.0, 0.9]).unwrap();
        assert_eq!(out.value, 150.0);
        assert_eq!(out.spread, Some(50.0));
    }

    #[test]
    fn test_malformed_trees_rejected() {
        let dangling = r#"{"n_features":1,"trees":[{"nodes":[{"feature":0,"threshold":1.0,"left":1,"right":5},{"leaf":1.0}]}]}"#;
        assert!(TreeEnsemble::from_json(dangling.as_bytes()).is_err());

        let wide = r#"{"n_features":1,"trees":[{"nodes":[{"feature":3,"threshold":1.0,"left":1,"right":1},{"leaf":1.0}]}]}"#;
        assert!(TreeEnsemble::from_json(wide.as_bytes()).is_err());
    }

    #[test]
    fn test_cycle_does_not_hang() {
        let cyclic = TreeEnsemble {
            n_features: 1,
            trees: vec![Tree {
                nodes: vec![Node::Split {
                    feature: 0,
                    threshold: 1.0,
                    left: 0,
                    right: 0,
                }],
            }],
        };
        assert!(cyclic.predict(&[0.0]).is_err());
    }
}
