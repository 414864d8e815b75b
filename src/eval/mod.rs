mod evaluation;
mod evaluator;

pub mod eval_details;

pub use evaluation::{DynamicConfig, Evaluation, FeatureGate, Layer, LayerValue, OVERRIDE_RULE_ID};
pub use evaluator::{Evaluator, EvaluatorConfig};
