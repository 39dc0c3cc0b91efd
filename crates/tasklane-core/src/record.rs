use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Display;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use uuid::Uuid;

use crate::config::DEFAULT_GROUP;
use crate::error::{JobError, RecordError};
use crate::limit::Limit;
use crate::network::NetworkRequirement;
use crate::retry::secs_to_duration;

/// Opaque payload forwarded to the job implementation.
pub type Params = serde_json::Map<String, serde_json::Value>;

/// Flat persisted form of a [`JobRecord`].
pub type Fields = BTreeMap<String, String>;

/// Durable description of one job: identity, constraints and progress.
///
/// Created once by the host, then owned by its execution engine until the job
/// terminates. The engine is the only writer of the runtime counters.
#[derive(Debug, Clone, PartialEq)]
pub struct JobRecord {
    /// Engine identity (UUIDv4); key of the persisted row.
    pub id: String,
    /// Registry type name. Immutable.
    pub job_type: String,
    /// Single-instance identity, unique among live jobs when set.
    pub uuid: Option<String>,
    /// Concurrency partition.
    pub group: String,
    /// Minimum delay before the first run, counted from the first admission attempt.
    pub delay_secs: f64,
    /// When admission was first attempted; set by the delay constraint.
    pub delay_started_at: Option<DateTime<Utc>>,
    /// Discard the job without running it after this instant.
    pub deadline: Option<DateTime<Utc>>,
    /// Cap on successful executions.
    pub max_runs: Limit,
    /// Pause between successful runs of a periodic job (0 = immediately).
    pub interval_secs: f64,
    pub network: NetworkRequirement,
    /// Whether the record is written to the job store.
    pub persisted: bool,
    /// Remaining retry budget over the job's whole lifetime.
    pub retry_limit: Limit,
    /// Scheduling hint only; never preempts a running job.
    pub priority: i8,
    pub tags: BTreeSet<String>,
    pub params: Params,
    /// Successful runs so far.
    pub run_count: u32,
    /// Consecutive failures since the last success; drives exponential backoff.
    pub current_repetition: u32,
    /// A new submission with the same uuid cancels the live one instead of failing.
    pub override_existing: bool,
    pub created_at: DateTime<Utc>,
}

impl JobRecord {
    /// A one-shot job of `job_type`: runs once, no retries, no constraints.
    pub fn new(job_type: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            job_type: job_type.into(),
            uuid: None,
            group: DEFAULT_GROUP.to_string(),
            delay_secs: 0.0,
            delay_started_at: None,
            deadline: None,
            max_runs: Limit::Limited(1),
            interval_secs: 0.0,
            network: NetworkRequirement::None,
            persisted: false,
            retry_limit: Limit::Limited(0),
            priority: 0,
            tags: BTreeSet::new(),
            params: Params::new(),
            run_count: 0,
            current_repetition: 0,
            override_existing: false,
            created_at: Utc::now(),
        }
    }

    pub fn with_uuid(mut self, uuid: impl Into<String>) -> Self {
        self.uuid = Some(uuid.into());
        self
    }

    pub fn with_override(mut self, override_existing: bool) -> Self {
        self.override_existing = override_existing;
        self
    }

    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.group = group.into();
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay_secs = delay.as_secs_f64();
        self
    }

    pub fn with_deadline(mut self, deadline: DateTime<Utc>) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Make the job periodic: up to `max_runs` successes, `interval` apart.
    pub fn periodic(mut self, max_runs: Limit, interval: Duration) -> Self {
        self.max_runs = max_runs;
        self.interval_secs = interval.as_secs_f64();
        self
    }

    pub fn with_network(mut self, network: NetworkRequirement) -> Self {
        self.network = network;
        self
    }

    pub fn with_retry_limit(mut self, retry_limit: Limit) -> Self {
        self.retry_limit = retry_limit;
        self
    }

    pub fn with_priority(mut self, priority: i8) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.insert(tag.into());
        self
    }

    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    pub fn persisted(mut self) -> Self {
        self.persisted = true;
        self
    }

    pub fn delay(&self) -> Duration {
        secs_to_duration(self.delay_secs)
    }

    pub fn interval(&self) -> Duration {
        secs_to_duration(self.interval_secs)
    }

    /// Reject records the engine cannot run meaningfully.
    pub fn validate(&self) -> Result<(), JobError> {
        if self.job_type.trim().is_empty() {
            return Err(JobError::InvalidRecord("job type must not be empty".into()));
        }
        if self.group.trim().is_empty() {
            return Err(JobError::InvalidRecord("group must not be empty".into()));
        }
        if self.uuid.as_deref().is_some_and(|u| u.trim().is_empty()) {
            return Err(JobError::InvalidRecord("uuid must not be blank".into()));
        }
        for (name, secs) in [("delay", self.delay_secs), ("interval", self.interval_secs)] {
            if !secs.is_finite() || secs < 0.0 {
                return Err(JobError::InvalidRecord(format!(
                    "{name} must be a finite, non-negative number of seconds (got {secs})"
                )));
            }
        }
        Ok(())
    }

    /// Flatten into string fields; optional fields are omitted when unset.
    pub fn to_fields(&self) -> Fields {
        let mut fields = Fields::new();
        let mut put = |key: &str, value: String| {
            fields.insert(key.to_string(), value);
        };

        put("id", self.id.clone());
        put("type", self.job_type.clone());
        if let Some(uuid) = &self.uuid {
            put("uuid", uuid.clone());
        }
        put("group", self.group.clone());
        put("delay", self.delay_secs.to_string());
        if let Some(at) = self.delay_started_at {
            put("delay_started_at", format_time(at));
        }
        if let Some(deadline) = self.deadline {
            put("deadline", format_time(deadline));
        }
        put("max_runs", self.max_runs.to_string());
        put("interval", self.interval_secs.to_string());
        put("network", self.network.to_string());
        put("persisted", self.persisted.to_string());
        put("retry_limit", self.retry_limit.to_string());
        put("priority", self.priority.to_string());
        put(
            "tags",
            serde_json::Value::from(self.tags.iter().cloned().collect::<Vec<_>>()).to_string(),
        );
        put("params", serde_json::Value::Object(self.params.clone()).to_string());
        put("run_count", self.run_count.to_string());
        put("current_repetition", self.current_repetition.to_string());
        put("override", self.override_existing.to_string());
        put("created_at", format_time(self.created_at));
        fields
    }

    /// Rebuild a record from [`JobRecord::to_fields`] output.
    pub fn from_fields(fields: &Fields) -> Result<Self, RecordError> {
        let tags: BTreeSet<String> = serde_json::from_str(required(fields, "tags")?)
            .map_err(|e| invalid("tags", e))?;
        let params: Params = serde_json::from_str(required(fields, "params")?)
            .map_err(|e| invalid("params", e))?;

        Ok(Self {
            id: required(fields, "id")?.to_string(),
            job_type: required(fields, "type")?.to_string(),
            uuid: fields.get("uuid").cloned(),
            group: required(fields, "group")?.to_string(),
            delay_secs: parse(fields, "delay")?,
            delay_started_at: optional_time(fields, "delay_started_at")?,
            deadline: optional_time(fields, "deadline")?,
            max_runs: parse(fields, "max_runs")?,
            interval_secs: parse(fields, "interval")?,
            network: parse(fields, "network")?,
            persisted: parse(fields, "persisted")?,
            retry_limit: parse(fields, "retry_limit")?,
            priority: parse(fields, "priority")?,
            tags,
            params,
            run_count: parse(fields, "run_count")?,
            current_repetition: parse(fields, "current_repetition")?,
            override_existing: parse(fields, "override")?,
            created_at: parse_time("created_at", required(fields, "created_at")?)?,
        })
    }
}

fn format_time(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::AutoSi, true)
}

fn required<'a>(fields: &'a Fields, key: &'static str) -> Result<&'a str, RecordError> {
    fields
        .get(key)
        .map(String::as_str)
        .ok_or(RecordError::MissingField(key))
}

fn invalid(field: &'static str, reason: impl Display) -> RecordError {
    RecordError::InvalidField {
        field,
        reason: reason.to_string(),
    }
}

fn parse<T>(fields: &Fields, key: &'static str) -> Result<T, RecordError>
where
    T: FromStr,
    T::Err: Display,
{
    required(fields, key)?.parse().map_err(|e| invalid(key, e))
}

fn parse_time(key: &'static str, raw: &str) -> Result<DateTime<Utc>, RecordError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| invalid(key, e))
}

fn optional_time(fields: &Fields, key: &'static str) -> Result<Option<DateTime<Utc>>, RecordError> {
    fields.get(key).map(|raw| parse_time(key, raw)).transpose()
}
