//! Testdata distribution.
//!
//! The coordinator owns one [`VariableTable`] per scenario and hands out one
//! iteration worth of materialized variables per request, until the
//! scenario's iteration bound is reached.
//!
//! # Iteration bookkeeping
//!
//! - A scenario with `iterations > 0` is tracked from the first request on,
//!   with its counter starting at 0.
//! - Each `consume` reply increments the counter by exactly one.
//! - Once the counter reaches the bound every further request gets `stop`,
//!   until [`TestdataProducer::reset_iterations`] is called at test stop.
//! - Untracked scenarios (`iterations == 0`) and unknown identifiers always
//!   get `stop`.
//!
//! Errors while materializing one scenario's variables are logged and turned
//! into a `stop` reply; they never reach the transport.

pub mod definition;
pub mod persist;
pub mod variables;

pub use definition::TestdataDefinition;
pub use persist::{Persister, Snapshot};
pub use variables::{
    Generator, IntegerIncrementer, RandomInteger, RowReader, Timestamp, VariableSource,
};

use crate::protocol::{Request, TestdataPayload, TestdataResponse};
use crate::{Result, SwarmError};
use serde_json::Value;
use std::collections::HashMap;
use tracing::{debug, error, warn};

/// Static description of a scenario, as far as testdata is concerned.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScenarioDefinition {
    /// Scenario type name; workers send it as their request identifier.
    pub identifier: String,
    /// Number of iterations to serve, `0` for none.
    pub iterations: u64,
    /// Declared key → flat alias exposed next to `variables`.
    pub aliases: HashMap<String, String>,
}

impl ScenarioDefinition {
    pub fn new(identifier: impl Into<String>, iterations: u64) -> Self {
        Self {
            identifier: identifier.into(),
            iterations,
            aliases: HashMap::new(),
        }
    }

    pub fn with_alias(mut self, key: impl Into<String>, alias: impl Into<String>) -> Self {
        self.aliases.insert(key.into(), alias.into());
        self
    }
}

/// Variable sources of one scenario and the keys served from them.
///
/// A served key is either the name of a source, or `<source>.<attribute>`
/// projecting one attribute out of a composite source.
#[derive(Debug, Default)]
pub struct VariableTable {
    sources: HashMap<String, VariableSource>,
    keys: Vec<String>,
}

impl VariableTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a source under `key` and serve it under the same key.
    pub fn declare(&mut self, key: impl Into<String>, source: VariableSource) -> &mut Self {
        let key = key.into();
        self.sources.insert(key.clone(), source);
        self.expose(key)
    }

    /// Register a source that is only served through dotted keys.
    pub fn declare_hidden(&mut self, name: impl Into<String>, source: VariableSource) -> &mut Self {
        self.sources.insert(name.into(), source);
        self
    }

    /// Serve `key`, typically a `<source>.<attribute>` projection.
    pub fn expose(&mut self, key: impl Into<String>) -> &mut Self {
        let key = key.into();
        if !self.keys.contains(&key) {
            self.keys.push(key);
        }
        self
    }

    pub fn keys(&self) -> &[String] {
        &self.keys
    }

    pub fn sources(&self) -> impl Iterator<Item = (&String, &VariableSource)> {
        self.sources.iter()
    }

    /// Split a served key into its source name and optional attribute.
    fn resolve<'a>(&self, key: &'a str) -> Option<(&'a str, Option<&'a str>)> {
        if self.sources.contains_key(key) {
            return Some((key, None));
        }

        key.rsplit_once('.')
            .filter(|(base, _)| self.sources.contains_key(*base))
            .map(|(base, attribute)| (base, Some(attribute)))
    }

    /// Materialize every served key once.
    ///
    /// Each source advances at most once per call, however many keys
    /// reference it.
    fn materialize(&mut self, scenario: &ScenarioDefinition) -> Result<TestdataPayload> {
        let mut payload = TestdataPayload::default();
        let mut materialized: HashMap<String, Value> = HashMap::new();

        for key in &self.keys {
            let (base, attribute) = self.resolve(key).ok_or_else(|| {
                SwarmError::materialize(key.as_str(), "no variable source declared")
            })?;

            let source = self
                .sources
                .get_mut(base)
                .ok_or_else(|| SwarmError::materialize(base, "no variable source declared"))?;

            if matches!(source, VariableSource::OnConsumer) {
                continue;
            }

            if let Some(attribute) = attribute {
                let known = source.attributes();
                if !known.is_empty() && !known.iter().any(|a| a == attribute) {
                    return Err(SwarmError::materialize(
                        key.as_str(),
                        format!("\"{}\" has no attribute \"{}\"", base, attribute),
                    ));
                }
            }

            if !materialized.contains_key(base) {
                let value = source.materialize()?;
                materialized.insert(base.to_string(), value);
            }
            let base_value = &materialized[base];

            let value = match attribute {
                Some(attribute) => variables::project(key, base_value, attribute)?,
                None => base_value.clone(),
            };

            if let Some(alias) = scenario.aliases.get(key) {
                payload.aliases.insert(alias.clone(), value.clone());
            }
            payload.variables.insert(key.clone(), value);
        }

        Ok(payload)
    }
}

/// Coordinator-side testdata engine.
#[derive(Debug, Default)]
pub struct TestdataProducer {
    scenarios: HashMap<String, ScenarioDefinition>,
    testdata: HashMap<String, VariableTable>,
    iterations: HashMap<String, u64>,
}

impl TestdataProducer {
    pub fn new(
        scenarios: impl IntoIterator<Item = ScenarioDefinition>,
        testdata: HashMap<String, VariableTable>,
    ) -> Self {
        let scenarios = scenarios
            .into_iter()
            .map(|scenario| (scenario.identifier.clone(), scenario))
            .collect::<HashMap<_, _>>();

        debug!(
            "serving testdata for {} scenarios ({} with variables)",
            scenarios.len(),
            testdata.len()
        );

        Self {
            scenarios,
            testdata,
            iterations: HashMap::new(),
        }
    }

    /// Answer one testdata request.
    pub fn handle(&mut self, request: &Request) -> TestdataResponse {
        let identifier = request.identifier.as_str();

        match self.next_iteration(identifier) {
            Ok(Some(payload)) => TestdataResponse::consume(payload),
            Ok(None) => TestdataResponse::stop(),
            Err(e) => {
                error!("test data error, stop consumer {}: {}", identifier, e);
                TestdataResponse::stop()
            }
        }
    }

    fn next_iteration(&mut self, identifier: &str) -> Result<Option<TestdataPayload>> {
        let Some(scenario) = self.scenarios.get(identifier) else {
            warn!("no scenario with identifier {}", identifier);
            return Ok(None);
        };

        if scenario.iterations > 0 && !self.iterations.contains_key(identifier) {
            self.iterations.insert(identifier.to_string(), 0);
        }

        // Scenarios without an iteration bound are never tracked.
        match self.iterations.get(identifier) {
            Some(served) if *served < scenario.iterations => {}
            _ => return Ok(None),
        }

        let payload = match self.testdata.get_mut(identifier) {
            Some(table) => table.materialize(scenario)?,
            None => TestdataPayload::default(),
        };

        if let Some(served) = self.iterations.get_mut(identifier) {
            *served += 1;
            debug!("{}: iteration={}", identifier, served);
        }

        Ok(Some(payload))
    }

    /// Iterations served so far for a tracked scenario.
    pub fn iteration(&self, identifier: &str) -> Option<u64> {
        self.iterations.get(identifier).copied()
    }

    pub fn iterations(&self) -> &HashMap<String, u64> {
        &self.iterations
    }

    /// Reset every tracked scenario's counter to 0.
    pub fn reset_iterations(&mut self) {
        for served in self.iterations.values_mut() {
            *served = 0;
        }
    }

    /// Persistable generator state, by scenario and source name.
    pub fn snapshot(&self) -> Snapshot {
        persist::collect_snapshot(&self.testdata)
    }
}
