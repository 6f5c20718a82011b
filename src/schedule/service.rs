//! Schedule model and the service that persists schedules in the project file.

use crate::models::{Config, Result, TidemarkError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::info;

/// Named shorthands accepted as an interval.
const NAMED_INTERVALS: &[&str] = &[
    "@once", "@manual", "@hourly", "@daily", "@weekly", "@monthly", "@yearly",
];

/// A named recurring extract/load pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Schedule {
    /// Unique name; doubles as the state id
    pub name: String,

    /// Extractor plugin name
    pub extractor: String,

    /// Loader plugin name
    pub loader: String,

    /// Whether to run transforms after loading
    #[serde(default)]
    pub transform: Transform,

    /// Cron expression or named shorthand (`@daily`, `@hourly`, ...)
    pub interval: String,

    /// First run the schedule covers
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_date: Option<DateTime<Utc>>,

    /// Extra environment for the pipeline run
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
}

/// Transform step mode.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transform {
    /// Extract, load, then transform
    Run,
    /// Only transform
    Only,
    /// Extract and load without transforming
    #[default]
    Skip,
}

impl FromStr for Transform {
    type Err = TidemarkError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "run" => Ok(Self::Run),
            "only" => Ok(Self::Only),
            "skip" => Ok(Self::Skip),
            other => Err(TidemarkError::InvalidInput(format!(
                "transform must be one of run, only, skip (got '{other}')"
            ))),
        }
    }
}

impl fmt::Display for Transform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Run => "run",
            Self::Only => "only",
            Self::Skip => "skip",
        })
    }
}

impl Schedule {
    pub fn new(
        name: impl Into<String>,
        extractor: impl Into<String>,
        loader: impl Into<String>,
        interval: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            extractor: extractor.into(),
            loader: loader.into(),
            transform: Transform::default(),
            interval: interval.into(),
            start_date: None,
            env: BTreeMap::new(),
        }
    }

    /// Id the schedule's run state is stored under.
    pub fn state_id(&self) -> &str {
        &self.name
    }

    /// Reject schedules that could never run.
    pub fn validate(&self) -> Result<()> {
        for (field, value) in [
            ("name", &self.name),
            ("extractor", &self.extractor),
            ("loader", &self.loader),
        ] {
            if value.trim().is_empty() {
                return Err(TidemarkError::InvalidInput(format!(
                    "schedule {field} must not be empty"
                )));
            }
        }
        validate_interval(&self.interval)
    }
}

/// Accept a named shorthand or a five-field cron expression.
fn validate_interval(interval: &str) -> Result<()> {
    let interval = interval.trim();
    if interval.starts_with('@') {
        if NAMED_INTERVALS.contains(&interval) {
            return Ok(());
        }
        return Err(TidemarkError::InvalidInput(format!(
            "unknown interval '{interval}' (expected one of {})",
            NAMED_INTERVALS.join(", ")
        )));
    }

    let fields = interval.split_whitespace().count();
    if fields == 5 {
        Ok(())
    } else {
        Err(TidemarkError::InvalidInput(format!(
            "interval '{interval}' is not a cron expression (expected 5 fields, got {fields})"
        )))
    }
}

/// Reads and appends schedules in a project file.
pub struct ScheduleService {
    config_path: PathBuf,
}

impl ScheduleService {
    pub fn new(config_path: impl Into<PathBuf>) -> Self {
        Self {
            config_path: config_path.into(),
        }
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    /// Register a new schedule and persist it.
    ///
    /// A missing `start_date` defaults to now. Fails with
    /// `ScheduleAlreadyExists` if the name is taken; the file is untouched.
    pub fn add(&self, mut schedule: Schedule) -> Result<Schedule> {
        schedule.validate()?;

        let mut config = Config::from_file_or_default(&self.config_path)?;
        if config.schedules.iter().any(|s| s.name == schedule.name) {
            return Err(TidemarkError::ScheduleAlreadyExists(schedule.name));
        }

        schedule.start_date.get_or_insert_with(Utc::now);
        config.schedules.push(schedule.clone());
        config.write_to_file(&self.config_path)?;

        info!(
            name = %schedule.name,
            extractor = %schedule.extractor,
            loader = %schedule.loader,
            interval = %schedule.interval,
            "Added schedule"
        );
        Ok(schedule)
    }

    /// All schedules, in file order.
    pub fn schedules(&self) -> Result<Vec<Schedule>> {
        Ok(Config::from_file_or_default(&self.config_path)?.schedules)
    }

    /// Look up one schedule by name.
    pub fn find(&self, name: &str) -> Result<Schedule> {
        self.schedules()?
            .into_iter()
            .find(|s| s.name == name)
            .ok_or_else(|| TidemarkError::ScheduleNotFound(name.to_string()))
    }
}
