//! Model catalog: the enumerated set of generation models the scheduler
//! routes for, together with each model's fixed generation parameters.
//!
//! The catalog is the scheduler's read-only source of truth.  It is loaded
//! once at startup (from a JSON file, or the embedded default set) and never
//! mutated afterwards; every component that needs model metadata holds an
//! `Arc<ModelCatalog>`.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

/// What a model produces.  Determines the stale-task time-to-live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString, Serialize, Deserialize)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum TaskKind {
    Video,
    Image,
}

/// One catalog entry.
///
/// `fixed_steps` / `fixed_cfg` are exact-match constraints: a request for
/// this model must carry precisely these values or it is rejected before any
/// lane or queue state is touched.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelSpec {
    pub name: String,
    pub kind: TaskKind,
    /// Heavy models get a dedicated warm execution lane; in shared mode at
    /// most one heavy pipeline may be resident on a worker at a time.
    #[serde(default)]
    pub heavy: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fixed_steps: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fixed_cfg: Option<f32>,
}

/// The full model set, keyed by model name.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelCatalog {
    models: BTreeMap<String, ModelSpec>,
}

impl ModelCatalog {
    pub fn new(specs: impl IntoIterator<Item = ModelSpec>) -> Self {
        Self {
            models: specs.into_iter().map(|s| (s.name.clone(), s)).collect(),
        }
    }

    /// The default catalog shipped with the server: two heavy video models
    /// with distilled-sampler fixed parameters, two image models.
    pub fn builtin() -> Self {
        Self::new([
            ModelSpec {
                name: "wan-video-14b".to_owned(),
                kind: TaskKind::Video,
                heavy: true,
                fixed_steps: Some(8),
                fixed_cfg: None,
            },
            ModelSpec {
                name: "ltx-video-2b".to_owned(),
                kind: TaskKind::Video,
                heavy: true,
                fixed_steps: Some(4),
                fixed_cfg: Some(1.0),
            },
            ModelSpec {
                name: "sdxl-turbo".to_owned(),
                kind: TaskKind::Image,
                heavy: false,
                fixed_steps: None,
                fixed_cfg: None,
            },
            ModelSpec {
                name: "flux-schnell".to_owned(),
                kind: TaskKind::Image,
                heavy: false,
                fixed_steps: None,
                fixed_cfg: None,
            },
        ])
    }

    /// Parse a catalog from its JSON representation:
    /// `{"models": {"name": {...}, ...}}`.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    pub fn get(&self, name: &str) -> Option<&ModelSpec> {
        self.models.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.models.contains_key(name)
    }

    /// All models, in name order.
    pub fn iter(&self) -> impl Iterator<Item = &ModelSpec> {
        self.models.values()
    }

    pub fn len(&self) -> usize {
        self.models.len()
    }

    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }
}
