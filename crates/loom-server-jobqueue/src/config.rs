// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Job queue configuration.
//!
//! Sources are layered by precedence: built-in defaults, then a TOML file,
//! then environment variables (`LOOM_JOBQUEUE_<FIELD>`).
//!
//! ```toml
//! database_url = "sqlite:./.data/jobqueue.db"
//! table = "jobs"
//! poll_interval_ms = 5000
//!
//! [defaults.job]
//! timeout = "30s"
//! priority = 3
//! retry = { count = 3, delay = "5s", strategy = "exponential" }
//!
//! [defaults.cron]
//! timeout = "1m"
//! ```

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, trace};

use loom_jobqueue_core::{JobDefaults, JobOptions};

use crate::schema::{TableName, DEFAULT_TABLE};
use crate::worker::DEFAULT_POLL_INTERVAL;

pub const DEFAULT_DATABASE_URL: &str = "sqlite:./.data/jobqueue.db";

#[derive(Debug, Error)]
pub enum ConfigError {
	#[error("failed to read config file {path}: {source}")]
	FileRead {
		path: PathBuf,
		#[source]
		source: std::io::Error,
	},

	#[error("failed to parse config file {path}: {source}")]
	TomlParse {
		path: PathBuf,
		#[source]
		source: toml::de::Error,
	},

	#[error("invalid value for {key}: {message}")]
	InvalidValue { key: String, message: String },
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct DefaultsConfigLayer {
	pub job: Option<JobDefaults>,
	pub cron: Option<JobDefaults>,
}

impl DefaultsConfigLayer {
	pub fn merge(&mut self, other: Self) {
		self.job = overlay(self.job.take(), other.job);
		self.cron = overlay(self.cron.take(), other.cron);
	}
}

fn overlay(base: Option<JobDefaults>, top: Option<JobDefaults>) -> Option<JobDefaults> {
	match (base, top) {
		(Some(base), Some(top)) => Some(top.or(&base)),
		(base, None) => base,
		(None, top) => top,
	}
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct JobQueueConfigLayer {
	pub database_url: Option<String>,
	pub table: Option<String>,
	pub poll_interval_ms: Option<u64>,
	pub min_priority: Option<i64>,
	pub defaults: Option<DefaultsConfigLayer>,
}

impl JobQueueConfigLayer {
	pub fn merge(&mut self, other: Self) {
		if other.database_url.is_some() {
			self.database_url = other.database_url;
		}
		if other.table.is_some() {
			self.table = other.table;
		}
		if other.poll_interval_ms.is_some() {
			self.poll_interval_ms = other.poll_interval_ms;
		}
		if other.min_priority.is_some() {
			self.min_priority = other.min_priority;
		}
		if let Some(defaults) = other.defaults {
			self.defaults.get_or_insert_with(Default::default).merge(defaults);
		}
	}

	pub fn finalize(self) -> Result<JobQueueConfig, ConfigError> {
		let table_name = self.table.unwrap_or_else(|| DEFAULT_TABLE.to_string());
		let table = TableName::new(table_name.clone()).map_err(|_| ConfigError::InvalidValue {
			key: "table".to_string(),
			message: format!("'{table_name}' is not a valid SQL identifier"),
		})?;

		let poll_interval = self
			.poll_interval_ms
			.map(Duration::from_millis)
			.unwrap_or(DEFAULT_POLL_INTERVAL);
		if poll_interval.is_zero() {
			return Err(ConfigError::InvalidValue {
				key: "poll_interval_ms".to_string(),
				message: "must be greater than zero".to_string(),
			});
		}

		let defaults = self.defaults.unwrap_or_default();
		let job_defaults = defaults
			.job
			.map(|configured| configured.or(&JobDefaults::job()))
			.unwrap_or_else(JobDefaults::job);
		let cron_defaults = defaults
			.cron
			.map(|configured| configured.or(&JobDefaults::cron()))
			.unwrap_or_else(JobDefaults::cron);
		validate_defaults("defaults.job", &job_defaults)?;
		validate_defaults("defaults.cron", &cron_defaults)?;

		Ok(JobQueueConfig {
			database_url: self
				.database_url
				.unwrap_or_else(|| DEFAULT_DATABASE_URL.to_string()),
			table,
			poll_interval,
			min_priority: self.min_priority,
			job_defaults,
			cron_defaults,
		})
	}
}

fn validate_defaults(key: &str, defaults: &JobDefaults) -> Result<(), ConfigError> {
	JobOptions::new()
		.resolve(defaults)
		.map(|_| ())
		.map_err(|e| ConfigError::InvalidValue {
			key: key.to_string(),
			message: e.to_string(),
		})
}

#[derive(Debug, Clone, PartialEq)]
pub struct JobQueueConfig {
	pub database_url: String,
	pub table: TableName,
	pub poll_interval: Duration,
	pub min_priority: Option<i64>,
	/// Defaults for one-off jobs, already overlaid on the built-in fallbacks.
	pub job_defaults: JobDefaults,
	/// Defaults for cron jobs, already overlaid on the built-in fallbacks.
	pub cron_defaults: JobDefaults,
}

impl Default for JobQueueConfig {
	fn default() -> Self {
		Self {
			database_url: DEFAULT_DATABASE_URL.to_string(),
			table: TableName::default(),
			poll_interval: DEFAULT_POLL_INTERVAL,
			min_priority: None,
			job_defaults: JobDefaults::job(),
			cron_defaults: JobDefaults::cron(),
		}
	}
}

/// Source precedence levels (higher = overrides lower).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Precedence {
	Defaults = 10,
	ConfigFile = 20,
	Environment = 50,
}

/// Trait for configuration sources.
pub trait ConfigSource: Send + Sync {
	fn name(&self) -> &'static str;
	fn precedence(&self) -> Precedence;
	fn load(&self) -> Result<JobQueueConfigLayer, ConfigError>;
}

/// Built-in defaults source.
pub struct DefaultsSource;

impl ConfigSource for DefaultsSource {
	fn name(&self) -> &'static str {
		"defaults"
	}

	fn precedence(&self) -> Precedence {
		Precedence::Defaults
	}

	fn load(&self) -> Result<JobQueueConfigLayer, ConfigError> {
		debug!("loading defaults");
		Ok(JobQueueConfigLayer::default())
	}
}

/// TOML file configuration source. A missing file is skipped.
pub struct TomlSource {
	path: PathBuf,
}

impl TomlSource {
	pub fn new(path: impl Into<PathBuf>) -> Self {
		Self { path: path.into() }
	}
}

impl ConfigSource for TomlSource {
	fn name(&self) -> &'static str {
		"toml-config"
	}

	fn precedence(&self) -> Precedence {
		Precedence::ConfigFile
	}

	fn load(&self) -> Result<JobQueueConfigLayer, ConfigError> {
		if !self.path.exists() {
			debug!(path = %self.path.display(), "config file not found, skipping");
			return Ok(JobQueueConfigLayer::default());
		}

		debug!(path = %self.path.display(), "loading config file");
		let content = std::fs::read_to_string(&self.path).map_err(|e| ConfigError::FileRead {
			path: self.path.clone(),
			source: e,
		})?;

		let layer: JobQueueConfigLayer =
			toml::from_str(&content).map_err(|e| ConfigError::TomlParse {
				path: self.path.clone(),
				source: e,
			})?;

		trace!("parsed config layer from TOML");
		Ok(layer)
	}
}

/// Environment variable source.
///
/// Convention: LOOM_JOBQUEUE_<FIELD>
pub struct EnvSource;

impl ConfigSource for EnvSource {
	fn name(&self) -> &'static str {
		"environment"
	}

	fn precedence(&self) -> Precedence {
		Precedence::Environment
	}

	fn load(&self) -> Result<JobQueueConfigLayer, ConfigError> {
		debug!("loading environment variables");
		Ok(JobQueueConfigLayer {
			database_url: env_var("LOOM_JOBQUEUE_DATABASE_URL"),
			table: env_var("LOOM_JOBQUEUE_TABLE"),
			poll_interval_ms: env_parse("LOOM_JOBQUEUE_POLL_INTERVAL_MS")?,
			min_priority: env_parse("LOOM_JOBQUEUE_MIN_PRIORITY")?,
			defaults: None,
		})
	}
}

fn env_var(name: &str) -> Option<String> {
	std::env::var(name).ok().filter(|s| !s.is_empty())
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Result<Option<T>, ConfigError> {
	match env_var(name) {
		Some(v) => v.trim().parse().map(Some).map_err(|_| ConfigError::InvalidValue {
			key: name.to_string(),
			message: format!("invalid {} value '{v}'", std::any::type_name::<T>()),
		}),
		None => Ok(None),
	}
}

fn load_from_sources(
	mut sources: Vec<Box<dyn ConfigSource>>,
) -> Result<JobQueueConfig, ConfigError> {
	sources.sort_by_key(|s| s.precedence());

	let mut merged = JobQueueConfigLayer::default();
	for source in sources {
		debug!(source = source.name(), "loading configuration source");
		let layer = source.load()?;
		merged.merge(layer);
	}

	let config = merged.finalize()?;
	info!(
		database = %config.database_url,
		table = %config.table,
		poll_interval_ms = config.poll_interval.as_millis() as u64,
		"job queue configuration loaded"
	);
	Ok(config)
}

/// Load configuration from defaults, an optional TOML file and the environment.
pub fn load_config(config_path: Option<PathBuf>) -> Result<JobQueueConfig, ConfigError> {
	let mut sources: Vec<Box<dyn ConfigSource>> = vec![Box::new(DefaultsSource), Box::new(EnvSource)];
	if let Some(path) = config_path {
		sources.push(Box::new(TomlSource::new(path)));
	}
	load_from_sources(sources)
}

/// Load configuration from environment only (for testing or simple deployments).
pub fn load_config_from_env() -> Result<JobQueueConfig, ConfigError> {
	load_from_sources(vec![Box::new(DefaultsSource), Box::new(EnvSource)])
}
