use std::collections::HashMap;
use std::fmt::Display;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Numeric precision the annealing kernel runs at.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Precision {
    Float32,
    Float64,
}

/// Distribution the kernel draws candidate perturbations from.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RandomDistribution {
    Normal,
    Uniform,
}

/// Capability set a model must provide.
///
/// Resolved at load time; a missing capability is a validation error,
/// never a runtime type check.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelFunction {
    Distribution,
    Precision,
    Dimensions,
    Initialize,
    GenerateNext,
    Cool,
    Evaluate,
    AcceptanceFunc,
    EmptyState,
}

impl ModelFunction {
    pub const ALL: [ModelFunction; 9] = [
        ModelFunction::Distribution,
        ModelFunction::Precision,
        ModelFunction::Dimensions,
        ModelFunction::Initialize,
        ModelFunction::GenerateNext,
        ModelFunction::Cool,
        ModelFunction::Evaluate,
        ModelFunction::AcceptanceFunc,
        ModelFunction::EmptyState,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ModelFunction::Distribution => "distribution",
            ModelFunction::Precision => "precision",
            ModelFunction::Dimensions => "dimensions",
            ModelFunction::Initialize => "initialize",
            ModelFunction::GenerateNext => "generate_next",
            ModelFunction::Cool => "cool",
            ModelFunction::Evaluate => "evaluate",
            ModelFunction::AcceptanceFunc => "acceptance_func",
            ModelFunction::EmptyState => "empty_state",
        }
    }
}

impl Display for ModelFunction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Raw, unvalidated model definition as supplied by the user.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ModelSource {
    pub name: String,
    /// Dimensionality of the optimization domain.
    pub dimensions: u32,
    pub precision: Precision,
    pub distribution: RandomDistribution,
    /// Source fragment shared by all functions.
    #[serde(default)]
    pub globals: String,
    /// Function bodies keyed by capability.
    pub functions: HashMap<ModelFunction, String>,
}

/// A named, validated optimization target.
///
/// Immutable after load; destroyed on explicit unload or process
/// teardown. Jobs hold a non-owning reference by name.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Model {
    name: String,
    source: ModelSource,
    skip_typecheck: bool,
}

impl Model {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn source(&self) -> &ModelSource {
        &self.source
    }

    /// Whether capability validation was skipped at load time.
    pub fn typecheck_skipped(&self) -> bool {
        self.skip_typecheck
    }
}

/// Holds loaded models keyed by name.
///
/// A pure mapping. No internal lock; access is funneled through the
/// orchestrator's serialization.
#[derive(Debug, Default)]
pub struct ModelRegistry {
    models: HashMap<String, Model>,
}

impl ModelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate and store a model under `name`.
    ///
    /// With `skip_typecheck` only structural loading is performed and
    /// runtime failures surface later during execution. Replaces any
    /// model previously loaded under the same name.
    pub fn load(
        &mut self,
        name: impl Into<String>,
        source: ModelSource,
        skip_typecheck: bool,
    ) -> Result<&Model> {
        let name = name.into();
        if name.is_empty() {
            return Err(Error::validation("model name must not be empty"));
        }

        if skip_typecheck {
            if source.functions.is_empty() {
                return Err(Error::validation(format!(
                    "model `{name}` defines no functions"
                )));
            }
        } else {
            Self::typecheck(&name, &source)?;
        }

        let model = Model {
            name: name.clone(),
            source,
            skip_typecheck,
        };
        self.models.insert(name.clone(), model);
        Ok(&self.models[&name])
    }

    pub fn get(&self, name: &str) -> Result<&Model> {
        self.models
            .get(name)
            .ok_or_else(|| Error::ModelNotFound(name.to_string()))
    }

    /// Remove a model. Idempotent; absent names are ignored.
    pub fn unload(&mut self, name: &str) {
        self.models.remove(name);
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.models.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.models.len()
    }

    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }

    fn typecheck(name: &str, source: &ModelSource) -> Result<()> {
        if source.dimensions == 0 {
            return Err(Error::validation(format!(
                "model `{name}` must have at least one dimension"
            )));
        }

        let missing: Vec<&'static str> = ModelFunction::ALL
            .iter()
            .filter(|f| {
                source
                    .functions
                    .get(f)
                    .map(|body| body.trim().is_empty())
                    .unwrap_or(true)
            })
            .map(|f| f.as_str())
            .collect();

        if !missing.is_empty() {
            return Err(Error::validation(format!(
                "model `{name}` is missing required functions: {}",
                missing.join(", ")
            )));
        }

        Ok(())
    }
}
