//! # Provider Registration Table
//!
//! ## Responsibility
//! Map configuration keys to generator implementations and hold the prompt
//! builder. The table is built once at startup with [`ProvidersBuilder`] and
//! is read-only afterwards.
//!
//! ## Guarantees
//! - Immutable after `build()`: lookups never race with registration
//! - Fail-fast: every key named in `[generation]` is resolved before the
//!   run starts; an unknown key is a [`ConfigError::UnknownProvider`]
//!
//! ## NOT Responsible For
//! - Constructing provider clients from configuration (callers register
//!   ready-made instances)
//! - Evaluators: the single evaluator of a run is handed to
//!   `EvolutionController::start` directly

use std::collections::HashMap;
use std::sync::Arc;

use rand::distributions::{Distribution, WeightedIndex};
use rand::Rng;

use crate::config::{ConfigError, GenerationConfig};
use crate::generator::Generator;
use crate::prompt::{PromptBuilder, TemplatePromptBuilder};

/// Read-only table of collaborators, keyed by configuration string.
#[derive(Clone)]
pub struct Providers {
    generators: HashMap<String, Arc<dyn Generator>>,
    prompt_builder: Arc<dyn PromptBuilder>,
}

impl std::fmt::Debug for Providers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut generators: Vec<_> = self.generators.keys().collect();
        generators.sort();
        f.debug_struct("Providers")
            .field("generators", &generators)
            .finish_non_exhaustive()
    }
}

impl Providers {
    /// Start an empty table that uses [`TemplatePromptBuilder`].
    pub fn builder() -> ProvidersBuilder {
        ProvidersBuilder {
            inner: Providers {
                generators: HashMap::new(),
                prompt_builder: Arc::new(TemplatePromptBuilder),
            },
        }
    }

    /// Generator registered under `key`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::UnknownProvider`] if nothing is registered.
    pub fn generator(&self, key: &str) -> Result<Arc<dyn Generator>, ConfigError> {
        self.generators
            .get(key)
            .cloned()
            .ok_or_else(|| ConfigError::UnknownProvider {
                kind: "generator",
                key: key.to_string(),
            })
    }

    /// The prompt builder.
    pub fn prompt_builder(&self) -> Arc<dyn PromptBuilder> {
        Arc::clone(&self.prompt_builder)
    }

    /// Resolve the weighted generator ensemble named in `config`.
    ///
    /// # Errors
    ///
    /// - [`ConfigError::UnknownProvider`] for an unregistered key.
    /// - [`ConfigError::InvalidField`] if the weights cannot form a distribution.
    pub fn ensemble(&self, config: &GenerationConfig) -> Result<GeneratorEnsemble, ConfigError> {
        let members = config
            .generators
            .iter()
            .map(|g| Ok((g.key.clone(), self.generator(&g.key)?)))
            .collect::<Result<Vec<_>, ConfigError>>()?;
        let weights = WeightedIndex::new(config.generators.iter().map(|g| g.weight)).map_err(
            |e| ConfigError::InvalidField {
                field: "generation.generators".to_string(),
                value: format!("{} entries", config.generators.len()),
                reason: e.to_string(),
            },
        )?;
        Ok(GeneratorEnsemble { members, weights })
    }
}

/// Builder for [`Providers`].
pub struct ProvidersBuilder {
    inner: Providers,
}

impl ProvidersBuilder {
    /// Register a generator. A later registration under the same key wins.
    pub fn generator(mut self, key: impl Into<String>, generator: Arc<dyn Generator>) -> Self {
        self.inner.generators.insert(key.into(), generator);
        self
    }

    /// Replace the prompt builder.
    pub fn prompt_builder(mut self, builder: Arc<dyn PromptBuilder>) -> Self {
        self.inner.prompt_builder = builder;
        self
    }

    /// Freeze the table.
    pub fn build(self) -> Providers {
        self.inner
    }
}

/// Generators and their sampling weights, resolved from configuration.
#[derive(Clone)]
pub struct GeneratorEnsemble {
    members: Vec<(String, Arc<dyn Generator>)>,
    weights: WeightedIndex<f64>,
}

impl GeneratorEnsemble {
    /// Draw one generator by weight.
    pub fn pick<R: Rng + ?Sized>(&self, rng: &mut R) -> (&str, Arc<dyn Generator>) {
        let (key, generator) = &self.members[self.weights.sample(rng)];
        (key.as_str(), Arc::clone(generator))
    }

    /// Number of generators.
    pub fn len(&self) -> usize {
        self.members.len()
    }

    /// Whether the ensemble is empty. Never true for a resolved ensemble.
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}
