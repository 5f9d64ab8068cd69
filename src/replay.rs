//! Scripted replay of counter operations.
//!
//! Counter stores never read a clock, so a list of operations with explicit
//! timestamps always produces the same results. Replay scripts are YAML:
//!
//! ```yaml
//! provider: local
//! store: sla
//! operations:
//!   - { op: update, name: loginAttempts, at: "2024-05-14T10:20:30Z", delta: 1 }
//!   - { op: update_with_limit, name: loginAttempts, field: minute, at: "2024-05-14T10:20:31Z", delta: 5, limit: 4 }
//!   - { op: query, name: loginAttempts }
//! ```

use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::ProviderSettings;
use crate::counter::{CounterError, CounterField, CounterResult, CounterSnapshot, CounterStore};
use crate::error::{Result, TallyError};
use crate::provider::{ProviderRegistry, LOCAL_PROVIDER_KEY};

/// A sequence of operations against one store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplayScript {
    /// Provider key; the local provider when unset
    #[serde(default)]
    pub provider: Option<String>,

    /// Store the operations run against; the configured default when unset
    #[serde(default)]
    pub store: Option<String>,

    /// Operations, executed in order
    #[serde(default)]
    pub operations: Vec<ReplayStep>,
}

impl ReplayScript {
    /// Parse a script from YAML.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| TallyError::Replay(format!("Failed to parse script: {}", e)))
    }

    /// Read and parse a script file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    /// Fill in the provider and store the script leaves unset.
    pub fn with_defaults(mut self, defaults: &ProviderSettings) -> Self {
        if self.provider.is_none() {
            self.provider = Some(defaults.default_provider.clone());
        }
        if self.store.is_none() {
            self.store = Some(defaults.default_store.clone());
        }
        self
    }

    /// The provider key the script resolves its store through.
    pub fn provider_key(&self) -> &str {
        self.provider.as_deref().unwrap_or(LOCAL_PROVIDER_KEY)
    }

    /// The store the script runs against.
    pub fn store_name(&self) -> Result<&str> {
        self.store
            .as_deref()
            .ok_or_else(|| TallyError::Replay("script names no store".to_string()))
    }
}

/// Operation kinds a script can use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplayOp {
    Get,
    Query,
    GetField,
    Update,
    UpdateWithLimit,
    GetAndUpdate,
    UpdateAndGet,
    Reset,
}

impl ReplayOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReplayOp::Get => "get",
            ReplayOp::Query => "query",
            ReplayOp::GetField => "get_field",
            ReplayOp::Update => "update",
            ReplayOp::UpdateWithLimit => "update_with_limit",
            ReplayOp::GetAndUpdate => "get_and_update",
            ReplayOp::UpdateAndGet => "update_and_get",
            ReplayOp::Reset => "reset",
        }
    }
}

/// One scripted operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplayStep {
    pub op: ReplayOp,

    /// Counter name
    pub name: String,

    /// Field of interest; `second` when unset
    #[serde(default)]
    pub field: Option<CounterField>,

    /// Timestamp of the operation, required by updates and resets
    #[serde(default)]
    pub at: Option<DateTime<Utc>>,

    /// Signed amount; 1 when unset
    #[serde(default)]
    pub delta: Option<i64>,

    /// Limit for the field of interest. Required by `update_with_limit`,
    /// optional for `get_and_update` and `update_and_get`.
    #[serde(default)]
    pub limit: Option<i64>,
}

impl ReplayStep {
    fn field(&self) -> CounterField {
        self.field.unwrap_or(CounterField::Second)
    }

    fn delta(&self) -> i64 {
        self.delta.unwrap_or(1)
    }

    fn at(&self, index: usize) -> Result<DateTime<Utc>> {
        self.at.ok_or_else(|| self.missing(index, "at"))
    }

    fn limit(&self, index: usize) -> Result<i64> {
        self.limit.ok_or_else(|| self.missing(index, "limit"))
    }

    fn missing(&self, index: usize, what: &str) -> TallyError {
        TallyError::Replay(format!(
            "operation {} ({} {}) requires `{}`",
            index,
            self.op.as_str(),
            self.name,
            what
        ))
    }
}

/// The result of one replayed operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ReplayOutcome {
    /// A counter snapshot from `get` or `query`
    Snapshot { snapshot: CounterSnapshot },
    /// `query` of a counter that does not exist
    Absent { name: String },
    /// A field value from `get_field`, `get_and_update` or `update_and_get`
    Value { value: i64 },
    /// A mutation that succeeded without returning a value
    Ok,
    /// A limit-checked mutation that was rejected
    LimitExceeded { name: String },
    /// The store could not serve the operation
    Unavailable { name: String, reason: String },
}

impl ReplayOutcome {
    /// Encode as a single JSON line.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

impl<T> From<CounterResult<T>> for ReplayOutcome
where
    T: Into<ReplayOutcome>,
{
    fn from(result: CounterResult<T>) -> Self {
        match result {
            Ok(value) => value.into(),
            Err(CounterError::LimitExceeded { name }) => ReplayOutcome::LimitExceeded { name },
            Err(CounterError::Unavailable { name, reason }) => {
                ReplayOutcome::Unavailable { name, reason }
            }
        }
    }
}

impl From<()> for ReplayOutcome {
    fn from(_: ()) -> Self {
        ReplayOutcome::Ok
    }
}

impl From<i64> for ReplayOutcome {
    fn from(value: i64) -> Self {
        ReplayOutcome::Value { value }
    }
}

impl From<CounterSnapshot> for ReplayOutcome {
    fn from(snapshot: CounterSnapshot) -> Self {
        ReplayOutcome::Snapshot { snapshot }
    }
}

/// Run `script` against the store it names.
///
/// Counter-level failures (limit rejections, unavailable stores) are
/// recorded as outcomes and replay continues; malformed operations and
/// unknown providers abort with an error before anything later runs.
pub fn replay(registry: &ProviderRegistry, script: &ReplayScript) -> Result<Vec<ReplayOutcome>> {
    let store_name = script.store_name()?;
    let store = registry.counter_store(script.provider_key(), store_name)?;

    info!(
        provider = %script.provider_key(),
        store = %store_name,
        operations = script.operations.len(),
        "Replaying counter operations"
    );

    script
        .operations
        .iter()
        .enumerate()
        .map(|(index, step)| -> Result<ReplayOutcome> {
            let outcome = run_step(store.as_ref(), index, step)?;
            debug!(index, op = step.op.as_str(), name = %step.name, ?outcome, "Replayed operation");
            Ok(outcome)
        })
        .collect()
}

fn run_step(store: &dyn CounterStore, index: usize, step: &ReplayStep) -> Result<ReplayOutcome> {
    let name = step.name.as_str();
    let field = step.field();

    let outcome: ReplayOutcome = match step.op {
        ReplayOp::Get => store.get(name).into(),
        ReplayOp::Query => match store.query(name) {
            Ok(None) => ReplayOutcome::Absent {
                name: name.to_string(),
            },
            Ok(Some(snapshot)) => snapshot.into(),
            Err(e) => Err::<(), _>(e).into(),
        },
        ReplayOp::GetField => store.get_field(name, field).into(),
        ReplayOp::Update => store.update(name, field, step.at(index)?, step.delta()).into(),
        ReplayOp::UpdateWithLimit => store
            .update_with_limit(name, field, step.at(index)?, step.delta(), step.limit(index)?)
            .into(),
        ReplayOp::GetAndUpdate => {
            let at = step.at(index)?;
            let result = match step.limit {
                Some(limit) => store.get_and_update_with_limit(name, field, at, step.delta(), limit),
                None => store.get_and_update(name, field, at, step.delta()),
            };
            result.into()
        }
        ReplayOp::UpdateAndGet => {
            let at = step.at(index)?;
            let result = match step.limit {
                Some(limit) => store.update_and_get_with_limit(name, field, at, step.delta(), limit),
                None => store.update_and_get(name, field, at, step.delta()),
            };
            result.into()
        }
        ReplayOp::Reset => store.reset(name, step.at(index)?).into(),
    };

    Ok(outcome)
}
