//! Fixed-parameter validation.
//!
//! Distilled video models are trained for one exact sampler configuration;
//! running them at any other step count or guidance scale produces garbage
//! while still burning a full GPU slot.  The validator therefore requires
//! exact equality with the catalog's fixed values and runs before any lane
//! lookup or queue admission: a rejected request never creates a task and
//! never touches scheduler state.

use std::sync::Arc;

use thiserror::Error;

use crate::catalog::{ModelCatalog, ModelSpec};
use crate::scheduler::types::GenerationParams;

/// A named constraint violation, surfaced verbatim to the caller.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConstraintViolation {
    #[error("unknown model '{model}'")]
    UnknownModel { model: String },

    #[error("model '{model}' requires steps={required}, got {actual}")]
    StepsMismatch {
        model: String,
        required: u32,
        /// The submitted value, or `"unset"`.
        actual: String,
    },

    #[error("model '{model}' requires cfg={required}, got {actual}")]
    CfgMismatch {
        model: String,
        required: f32,
        actual: String,
    },
}

/// Validates `(model, parameters)` against the catalog's fixed values.
#[derive(Debug, Clone)]
pub struct ConstraintValidator {
    catalog: Arc<ModelCatalog>,
}

impl ConstraintValidator {
    pub fn new(catalog: Arc<ModelCatalog>) -> Self {
        Self { catalog }
    }

    /// Returns the model's spec when the parameters are legal, or the first
    /// violated constraint.  Exact match only; no tolerance, no rounding.
    pub fn validate<'a>(
        &'a self,
        model: &str,
        params: &GenerationParams,
    ) -> Result<&'a ModelSpec, ConstraintViolation> {
        let spec = self
            .catalog
            .get(model)
            .ok_or_else(|| ConstraintViolation::UnknownModel {
                model: model.to_owned(),
            })?;

        if let Some(required) = spec.fixed_steps {
            if params.steps != Some(required) {
                return Err(ConstraintViolation::StepsMismatch {
                    model: model.to_owned(),
                    required,
                    actual: fmt_opt(params.steps),
                });
            }
        }

        if let Some(required) = spec.fixed_cfg {
            if params.cfg != Some(required) {
                return Err(ConstraintViolation::CfgMismatch {
                    model: model.to_owned(),
                    required,
                    actual: fmt_opt(params.cfg),
                });
            }
        }

        Ok(spec)
    }
}

fn fmt_opt<T: std::fmt::Display>(v: Option<T>) -> String {
    match v {
        Some(v) => v.to_string(),
        None => "unset".to_owned(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(steps: Option<u32>, cfg: Option<f32>) -> GenerationParams {
        GenerationParams {
            prompt: "a red fox".to_owned(),
            steps,
            cfg,
            seed: None,
            extra: serde_json::Map::new(),
        }
    }

    fn validator() -> ConstraintValidator {
        ConstraintValidator::new(Arc::new(ModelCatalog::builtin()))
    }

    #[test]
    fn exact_fixed_steps_pass() {
        assert!(validator().validate("wan-video-14b", &params(Some(8), None)).is_ok());
    }

    #[test]
    fn wrong_steps_name_the_constraint() {
        let err = validator()
            .validate("wan-video-14b", &params(Some(6), None))
            .unwrap_err();
        assert_eq!(
            err,
            ConstraintViolation::StepsMismatch {
                model: "wan-video-14b".to_owned(),
                required: 8,
                actual: "6".to_owned(),
            }
        );
    }

    #[test]
    fn missing_steps_are_a_violation_not_a_default() {
        let err = validator()
            .validate("wan-video-14b", &params(None, None))
            .unwrap_err();
        assert!(matches!(err, ConstraintViolation::StepsMismatch { ref actual, .. } if actual == "unset"));
    }

    #[test]
    fn cfg_is_exact_match() {
        let v = validator();
        assert!(v.validate("ltx-video-2b", &params(Some(4), Some(1.0))).is_ok());
        let err = v.validate("ltx-video-2b", &params(Some(4), Some(1.5))).unwrap_err();
        assert!(matches!(err, ConstraintViolation::CfgMismatch { required, .. } if required == 1.0));
    }

    #[test]
    fn unconstrained_model_accepts_any_steps() {
        let v = validator();
        assert!(v.validate("sdxl-turbo", &params(Some(30), Some(7.5))).is_ok());
        assert!(v.validate("sdxl-turbo", &params(None, None)).is_ok());
    }

    #[test]
    fn unknown_model_is_a_validation_failure() {
        let err = validator().validate("no-such-model", &params(None, None)).unwrap_err();
        assert!(matches!(err, ConstraintViolation::UnknownModel { .. }));
    }
}
