//! Declarative module construction.
//!
//! A `ModuleConfig` names a module kind and its hyperparameters, e.g.
//!
//! ```json
//! { "type": "linear", "shape_in": [4], "shape_out": [2],
//!   "forget": { "lin_value": 1.0, "lin_exponent": 2.0 } }
//! { "type": "penalty_l1", "threshold": 0.01 }
//! ```
//!
//! and builds it as a boxed [`Module`].

use crate::losses::{
    BconvRecCost, BconvRecCostConfig, CrossEntropy, CrossEntropyConfig, DistanceL2,
    DistanceL2Config, PenaltyL1, PenaltyL1Config, PenaltyL2, PenaltyL2Config,
};
use crate::nn::bias::{Bias, BiasConfig};
use crate::nn::linear::{Linear, LinearConfig};
use crate::nn::module::{Module, ModuleError};
use crate::nn::multiplication::Multiplication;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("module error: {0}")]
    Module(#[from] ModuleError),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ModuleConfig {
    Linear(LinearConfig),
    Bias(BiasConfig),
    Multiplication,
    DistanceL2(DistanceL2Config),
    CrossEntropy(CrossEntropyConfig),
    PenaltyL1(PenaltyL1Config),
    PenaltyL2(PenaltyL2Config),
    BconvRecCost(BconvRecCostConfig),
}

impl ModuleConfig {
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(json)?)
    }

    /// Parses a JSON array of module configs.
    pub fn list_from_json(json: &str) -> Result<Vec<Self>, ConfigError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn to_json(&self) -> Result<String, ConfigError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn build(&self) -> Result<Box<dyn Module>, ConfigError> {
        let module: Box<dyn Module> = match self {
            ModuleConfig::Linear(config) => Box::new(Linear::from_config(config)),
            ModuleConfig::Bias(config) => Box::new(Bias::from_config(config)?),
            ModuleConfig::Multiplication => Box::new(Multiplication::new()),
            ModuleConfig::DistanceL2(config) => Box::new(DistanceL2::from_config(config)),
            ModuleConfig::CrossEntropy(config) => Box::new(CrossEntropy::from_config(config)),
            ModuleConfig::PenaltyL1(config) => Box::new(PenaltyL1::from_config(config)),
            ModuleConfig::PenaltyL2(config) => Box::new(PenaltyL2::from_config(config)),
            ModuleConfig::BconvRecCost(config) => Box::new(BconvRecCost::from_config(config)?),
        };
        Ok(module)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_and_build_linear() {
        let config = ModuleConfig::from_json(
            r#"{"type": "linear", "shape_in": [4], "shape_out": [2, 1]}"#,
        )
        .unwrap();
        match &config {
            ModuleConfig::Linear(linear) => {
                assert_eq!(linear.shape_out, vec![2, 1]);
                assert_eq!(linear.forget.lin_exponent, 2.0);
            }
            other => panic!("unexpected config {:?}", other),
        }
        let module = config.build().unwrap();
        assert_eq!(module.name(), "linear");
        assert_eq!(module.parameters()[0].shape(), &[2, 4]);
    }

    #[test]
    fn test_parse_list_with_defaults() {
        let configs = ModuleConfig::list_from_json(
            r#"[
                {"type": "bias", "shape_in": [3, 2], "per_feature": true,
                 "normalization": "unit_norm"},
                {"type": "multiplication"},
                {"type": "distance_l2"},
                {"type": "cross_entropy", "average": true},
                {"type": "penalty_l1", "threshold": 0.01},
                {"type": "penalty_l2", "average": false},
                {"type": "bconv_rec_cost", "rec_shape": [6], "kernel_shape": [3]}
            ]"#,
        )
        .unwrap();
        assert_eq!(configs.len(), 7);
        let names: Vec<_> = configs
            .iter()
            .map(|c| c.build().unwrap().name())
            .collect();
        assert_eq!(
            names,
            vec![
                "bias",
                "multiplication",
                "distance_l2",
                "cross_entropy",
                "penalty_l1",
                "penalty_l2",
                "bconv_rec_cost"
            ]
        );
        assert_eq!(
            configs[2],
            ModuleConfig::DistanceL2(DistanceL2Config { average: true })
        );
    }

    #[test]
    fn test_json_round_trip() {
        let config = ModuleConfig::PenaltyL1(PenaltyL1Config {
            threshold: 0.25,
            average: false,
        });
        let json = config.to_json().unwrap();
        assert_eq!(ModuleConfig::from_json(&json).unwrap(), config);
    }

    #[test]
    fn test_invalid_module_config_surfaces_module_error() {
        let config = ModuleConfig::from_json(
            r#"{"type": "bconv_rec_cost", "rec_shape": [2], "kernel_shape": [3]}"#,
        )
        .unwrap();
        assert!(matches!(
            config.build(),
            Err(ConfigError::Module(ModuleError::InvalidConfig(_)))
        ));
        assert!(matches!(
            ModuleConfig::from_json(r#"{"type": "conv"}"#),
            Err(ConfigError::Json(_))
        ));
    }
}
