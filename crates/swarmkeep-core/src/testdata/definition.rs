//! JSON testdata definition file.
//!
//! ```json
//! {
//!   "scenarios": [
//!     {
//!       "identifier": "Checkout",
//!       "iterations": 100,
//!       "aliases": {"users.name": "username"},
//!       "variables": [
//!         {"key": "order_id", "source": {"type": "integer_incrementer", "start": 1, "persist": true}},
//!         {"key": "users", "hidden": true, "source": {"type": "row_reader", "rows": [{"name": "alice"}]}}
//!       ],
//!       "expose": ["users.name"]
//!     }
//!   ]
//! }
//! ```

use super::persist::Snapshot;
use super::variables::{IntegerIncrementer, RandomInteger, RowReader, Timestamp, VariableSource};
use super::{ScenarioDefinition, TestdataProducer, VariableTable};
use crate::{Result, SwarmError};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use tracing::{debug, info};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TestdataDefinition {
    #[serde(default)]
    pub scenarios: Vec<ScenarioConfig>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScenarioConfig {
    pub identifier: String,
    #[serde(default)]
    pub iterations: u64,
    #[serde(default)]
    pub aliases: HashMap<String, String>,
    #[serde(default)]
    pub variables: Vec<VariableConfig>,
    /// Extra served keys, usually `<source>.<attribute>` projections.
    #[serde(default)]
    pub expose: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariableConfig {
    pub key: String,
    /// Only reachable through `expose`d dotted keys.
    #[serde(default)]
    pub hidden: bool,
    pub source: SourceConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SourceConfig {
    Literal {
        value: Value,
    },
    IntegerIncrementer {
        #[serde(default = "default_start")]
        start: i64,
        #[serde(default = "default_step")]
        step: i64,
        #[serde(default)]
        persist: bool,
    },
    RowReader {
        rows: Vec<Map<String, Value>>,
        #[serde(default)]
        repeat: bool,
    },
    RandomInteger {
        min: i64,
        max: i64,
    },
    Timestamp {
        #[serde(default)]
        format: Option<String>,
        #[serde(default)]
        offset_seconds: i64,
    },
    OnConsumer,
}

fn default_start() -> i64 {
    1
}

fn default_step() -> i64 {
    1
}

impl SourceConfig {
    fn build(&self, persisted: Option<&Value>) -> Result<VariableSource> {
        let source = match self {
            SourceConfig::Literal { value } => VariableSource::Literal(value.clone()),
            SourceConfig::IntegerIncrementer {
                start,
                step,
                persist,
            } => {
                let mut counter = IntegerIncrementer::new(*start, *step);
                if *persist {
                    counter = counter.persistent();
                    if let Some(persisted) = persisted.and_then(Value::as_str) {
                        counter.restore(persisted)?;
                    }
                }
                VariableSource::generator(counter)
            }
            SourceConfig::RowReader { rows, repeat } => {
                let reader = RowReader::new(rows.clone());
                VariableSource::generator(if *repeat { reader.repeating() } else { reader })
            }
            SourceConfig::RandomInteger { min, max } => {
                VariableSource::generator(RandomInteger::new(*min, *max)?)
            }
            SourceConfig::Timestamp {
                format,
                offset_seconds,
            } => VariableSource::generator(Timestamp::new(
                format.clone(),
                chrono::Duration::seconds(*offset_seconds),
            )),
            SourceConfig::OnConsumer => VariableSource::OnConsumer,
        };
        Ok(source)
    }
}

impl TestdataDefinition {
    /// Load a definition from a JSON file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents =
            std::fs::read_to_string(path).map_err(|e| SwarmError::io_with_path(e, path))?;
        let definition: Self = serde_json::from_str(&contents).map_err(|e| SwarmError::Json {
            message: format!("Failed to parse {}: {}", path.display(), e),
            source: Some(e),
        })?;

        info!(
            "loaded testdata definition for {} scenarios from {}",
            definition.scenarios.len(),
            path.display()
        );
        Ok(definition)
    }

    /// Check identifiers and keys before building anything.
    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for scenario in &self.scenarios {
            if scenario.identifier.is_empty() {
                return Err(SwarmError::Validation {
                    field: "identifier".to_string(),
                    message: "scenario identifier cannot be empty".to_string(),
                });
            }
            if !seen.insert(scenario.identifier.as_str()) {
                return Err(SwarmError::Validation {
                    field: "identifier".to_string(),
                    message: format!("scenario \"{}\" is defined twice", scenario.identifier),
                });
            }
            // Aliases sit next to `variables` in the served payload.
            if let Some(key) = scenario
                .aliases
                .iter()
                .find_map(|(key, alias)| (alias == "variables").then_some(key))
            {
                return Err(SwarmError::Validation {
                    field: format!("{}.aliases", scenario.identifier),
                    message: format!("\"{}\" cannot be aliased as \"variables\"", key),
                });
            }
            if let Some(variable) = scenario.variables.iter().find(|v| v.key.is_empty()) {
                return Err(SwarmError::Validation {
                    field: format!("{}.variables", scenario.identifier),
                    message: format!("variable with source {:?} has no key", variable.source),
                });
            }
        }
        Ok(())
    }

    /// Build the scenario registry and variable tables.
    ///
    /// Persistent counters continue from `snapshot` when it has an entry
    /// for them.
    pub fn build(
        &self,
        snapshot: Option<&Snapshot>,
    ) -> Result<(Vec<ScenarioDefinition>, HashMap<String, VariableTable>)> {
        self.validate()?;

        let mut scenarios = Vec::with_capacity(self.scenarios.len());
        let mut testdata = HashMap::new();

        for config in &self.scenarios {
            let persisted = snapshot.and_then(|s| s.get(&config.identifier));

            let mut table = VariableTable::new();
            for variable in &config.variables {
                let source = variable
                    .source
                    .build(persisted.and_then(|p| p.get(&variable.key)))?;

                if variable.hidden {
                    table.declare_hidden(variable.key.clone(), source);
                } else {
                    table.declare(variable.key.clone(), source);
                }
            }
            for key in &config.expose {
                table.expose(key.clone());
            }

            debug!(
                "{}: iterations={}, {} served keys",
                config.identifier,
                config.iterations,
                table.keys().len()
            );

            if !config.variables.is_empty() || !config.expose.is_empty() {
                testdata.insert(config.identifier.clone(), table);
            }
            scenarios.push(ScenarioDefinition {
                identifier: config.identifier.clone(),
                iterations: config.iterations,
                aliases: config.aliases.clone(),
            });
        }

        Ok((scenarios, testdata))
    }

    /// Build a ready-to-serve producer.
    pub fn into_producer(self, snapshot: Option<&Snapshot>) -> Result<TestdataProducer> {
        let (scenarios, testdata) = self.build(snapshot)?;
        Ok(TestdataProducer::new(scenarios, testdata))
    }
}
