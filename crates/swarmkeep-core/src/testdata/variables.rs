//! Variable sources for testdata.
//!
//! A declared variable is either a literal value, a stateful [`Generator`]
//! that yields the next value each time it is read, or a marker for a value
//! the worker fills in itself. Composite generators expose attributes that
//! can be requested with dotted keys (`users.name`).

use crate::{Result, SwarmError};
use chrono::{Duration as ChronoDuration, Utc};
use rand::Rng;
use serde_json::{Map, Value};

/// A stateful value source.
pub trait Generator: Send + std::fmt::Debug {
    /// Advance the cursor and return the value for this read.
    ///
    /// `Value::Null` means the source is exhausted.
    fn next_value(&mut self) -> Result<Value>;

    /// Attributes that may be projected with `<name>.<attribute>`.
    fn attributes(&self) -> Vec<String> {
        Vec::new()
    }

    /// State to persist so the next run can continue where this one stopped.
    fn initial_value(&self) -> Option<Value> {
        None
    }
}

/// Where the value of a declared variable comes from.
#[derive(Debug)]
pub enum VariableSource {
    Literal(Value),
    Generator(Box<dyn Generator>),
    /// Materialized on the worker; the coordinator leaves it out.
    OnConsumer,
}

impl VariableSource {
    pub fn literal(value: impl Into<Value>) -> Self {
        VariableSource::Literal(value.into())
    }

    pub fn generator(generator: impl Generator + 'static) -> Self {
        VariableSource::Generator(Box::new(generator))
    }

    /// Produce the current value, advancing a generator once.
    pub fn materialize(&mut self) -> Result<Value> {
        match self {
            VariableSource::Literal(value) => Ok(value.clone()),
            VariableSource::Generator(generator) => generator.next_value(),
            VariableSource::OnConsumer => Ok(Value::Null),
        }
    }

    pub fn attributes(&self) -> Vec<String> {
        match self {
            VariableSource::Literal(Value::Object(map)) => map.keys().cloned().collect(),
            VariableSource::Literal(_) | VariableSource::OnConsumer => Vec::new(),
            VariableSource::Generator(generator) => generator.attributes(),
        }
    }

    pub fn initial_value(&self) -> Option<Value> {
        match self {
            VariableSource::Generator(generator) => generator.initial_value(),
            _ => None,
        }
    }
}

/// Project `attribute` out of a materialized composite value.
///
/// A `null` base (exhausted source) projects to `null`.
pub fn project(key: &str, value: &Value, attribute: &str) -> Result<Value> {
    match value {
        Value::Null => Ok(Value::Null),
        Value::Object(map) => map.get(attribute).cloned().ok_or_else(|| {
            SwarmError::materialize(key, format!("no attribute \"{}\"", attribute))
        }),
        other => Err(SwarmError::materialize(
            key,
            format!("value {} has no attributes", other),
        )),
    }
}

/// Monotonic integer counter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IntegerIncrementer {
    next: i64,
    step: i64,
    persist: bool,
}

impl IntegerIncrementer {
    pub fn new(start: i64, step: i64) -> Self {
        Self {
            next: start,
            step,
            persist: false,
        }
    }

    /// Persist the counter at test stop.
    pub fn persistent(mut self) -> Self {
        self.persist = true;
        self
    }

    /// Continue from a persisted `"<next> | step=<step>"` value.
    pub fn restore(&mut self, persisted: &str) -> Result<()> {
        let invalid = || {
            SwarmError::materialize(
                "integer_incrementer",
                format!("cannot restore from \"{}\"", persisted),
            )
        };

        let (next, step) = persisted.split_once('|').ok_or_else(invalid)?;
        let step = step
            .trim()
            .strip_prefix("step=")
            .and_then(|s| s.trim().parse::<i64>().ok())
            .ok_or_else(invalid)?;
        let next = next.trim().parse::<i64>().map_err(|_| invalid())?;

        self.next = next;
        self.step = step;
        Ok(())
    }
}

impl Generator for IntegerIncrementer {
    fn next_value(&mut self) -> Result<Value> {
        let value = self.next;
        self.next = self
            .next
            .checked_add(self.step)
            .ok_or_else(|| SwarmError::materialize("integer_incrementer", "counter overflow"))?;
        Ok(Value::from(value))
    }

    fn initial_value(&self) -> Option<Value> {
        self.persist
            .then(|| Value::String(format!("{} | step={}", self.next, self.step)))
    }
}

/// Yields one row (a JSON object) per read.
///
/// Columns are exposed as attributes. Returns `null` once all rows were
/// served unless `repeat` is set, in which case it starts over.
#[derive(Debug, Clone, PartialEq)]
pub struct RowReader {
    rows: Vec<Map<String, Value>>,
    position: usize,
    repeat: bool,
}

impl RowReader {
    pub fn new(rows: Vec<Map<String, Value>>) -> Self {
        Self {
            rows,
            position: 0,
            repeat: false,
        }
    }

    pub fn repeating(mut self) -> Self {
        self.repeat = true;
        self
    }
}

impl Generator for RowReader {
    fn next_value(&mut self) -> Result<Value> {
        if self.position >= self.rows.len() {
            if !self.repeat || self.rows.is_empty() {
                return Ok(Value::Null);
            }
            self.position = 0;
        }

        let row = self.rows[self.position].clone();
        self.position += 1;
        Ok(Value::Object(row))
    }

    fn attributes(&self) -> Vec<String> {
        self.rows
            .first()
            .map(|row| row.keys().cloned().collect())
            .unwrap_or_default()
    }
}

/// Uniform random integer in `min..=max`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RandomInteger {
    min: i64,
    max: i64,
}

impl RandomInteger {
    pub fn new(min: i64, max: i64) -> Result<Self> {
        if min > max {
            return Err(SwarmError::Validation {
                field: "random_integer".to_string(),
                message: format!("min {} is greater than max {}", min, max),
            });
        }
        Ok(Self { min, max })
    }
}

impl Generator for RandomInteger {
    fn next_value(&mut self) -> Result<Value> {
        Ok(Value::from(rand::rng().random_range(self.min..=self.max)))
    }
}

/// Current UTC time, shifted by `offset`, as a formatted string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Timestamp {
    format: Option<String>,
    offset: ChronoDuration,
}

impl Timestamp {
    /// RFC 3339 when `format` is `None`, otherwise a `strftime` pattern.
    pub fn new(format: Option<String>, offset: ChronoDuration) -> Self {
        Self { format, offset }
    }
}

impl Generator for Timestamp {
    fn next_value(&mut self) -> Result<Value> {
        let now = Utc::now() + self.offset;
        let formatted = match &self.format {
            Some(format) => now.format(format).to_string(),
            None => now.to_rfc3339(),
        };
        Ok(Value::String(formatted))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn rows() -> Vec<Map<String, Value>> {
        vec![
            json!({"name": "alice", "id": 1}).as_object().unwrap().clone(),
            json!({"name": "bob", "id": 2}).as_object().unwrap().clone(),
        ]
    }

    #[test]
    fn test_incrementer_advances_by_step() {
        let mut counter = IntegerIncrementer::new(10, 5);
        assert_eq!(counter.next_value().unwrap(), json!(10));
        assert_eq!(counter.next_value().unwrap(), json!(15));
        assert_eq!(counter.initial_value(), None);
    }

    #[test]
    fn test_persistent_incrementer_reports_next_value() {
        let mut counter = IntegerIncrementer::new(1, 2).persistent();
        counter.next_value().unwrap();
        assert_eq!(counter.initial_value(), Some(json!("3 | step=2")));

        let mut restored = IntegerIncrementer::new(1, 1).persistent();
        restored.restore("3 | step=2").unwrap();
        assert_eq!(restored.next_value().unwrap(), json!(3));
        assert_eq!(restored.next_value().unwrap(), json!(5));
        assert!(restored.restore("three").is_err());
    }

    #[test]
    fn test_row_reader_exhausts_to_null() {
        let mut reader = RowReader::new(rows());
        assert_eq!(reader.next_value().unwrap()["name"], json!("alice"));
        assert_eq!(reader.next_value().unwrap()["name"], json!("bob"));
        assert_eq!(reader.next_value().unwrap(), Value::Null);
    }

    #[test]
    fn test_repeating_row_reader_wraps() {
        let mut reader = RowReader::new(rows()).repeating();
        reader.next_value().unwrap();
        reader.next_value().unwrap();
        assert_eq!(reader.next_value().unwrap()["name"], json!("alice"));

        let mut attributes = reader.attributes();
        attributes.sort();
        assert_eq!(attributes, vec!["id".to_string(), "name".to_string()]);
    }

    #[test]
    fn test_random_integer_stays_in_range() {
        let mut random = RandomInteger::new(3, 5).unwrap();
        for _ in 0..50 {
            let value = random.next_value().unwrap().as_i64().unwrap();
            assert!((3..=5).contains(&value));
        }
        assert!(RandomInteger::new(5, 3).is_err());
    }

    #[test]
    fn test_timestamp_uses_format() {
        let mut timestamp = Timestamp::new(Some("%Y".to_string()), ChronoDuration::zero());
        let value = timestamp.next_value().unwrap();
        assert_eq!(value.as_str().unwrap().len(), 4);
    }

    #[test]
    fn test_project_attribute() {
        let row = json!({"name": "alice"});
        assert_eq!(project("users.name", &row, "name").unwrap(), json!("alice"));
        assert_eq!(project("users.name", &Value::Null, "name").unwrap(), Value::Null);
        assert!(project("users.age", &row, "age").is_err());
        assert!(project("count.value", &json!(3), "value").is_err());
    }
}
