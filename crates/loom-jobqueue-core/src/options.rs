// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Per-call job options and their resolution against configured defaults.
//!
//! Resolution happens once, at submission time, with this precedence:
//! 1. Options given on the call
//! 2. Configured defaults (`defaults.job` or `defaults.cron`)
//! 3. Built-in fallbacks ([`JobDefaults::job`], [`JobDefaults::cron`])

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::retry::{
	parse_delay, parse_retry, parse_timeout, DurationSpec, RetryCount, RetryPolicy, EXPONENTIAL,
};

/// Retry options as a caller or a config file writes them.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryOptions {
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub count: Option<RetryCount>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub delay: Option<DurationSpec>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub strategy: Option<String>,
}

impl RetryOptions {
	/// Field-wise overlay: values set on `self` win over `fallback`.
	pub fn or(self, fallback: &RetryOptions) -> RetryOptions {
		RetryOptions {
			count: self.count.or_else(|| fallback.count.clone()),
			delay: self.delay.or_else(|| fallback.delay.clone()),
			strategy: self.strategy.or_else(|| fallback.strategy.clone()),
		}
	}
}

/// Options accepted when enqueueing a call.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobOptions {
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub delay: Option<DurationSpec>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub timeout: Option<DurationSpec>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub priority: Option<i64>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub retry: Option<RetryOptions>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub cron: Option<String>,
}

impl JobOptions {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn delay(mut self, delay: impl Into<DurationSpec>) -> Self {
		self.delay = Some(delay.into());
		self
	}

	pub fn timeout(mut self, timeout: impl Into<DurationSpec>) -> Self {
		self.timeout = Some(timeout.into());
		self
	}

	pub fn priority(mut self, priority: i64) -> Self {
		self.priority = Some(priority);
		self
	}

	pub fn retry(mut self, retry: RetryOptions) -> Self {
		self.retry = Some(retry);
		self
	}

	pub fn cron(mut self, expression: impl Into<String>) -> Self {
		self.cron = Some(expression.into());
		self
	}

	pub fn is_cron(&self) -> bool {
		self
			.cron
			.as_deref()
			.is_some_and(|expr| !expr.trim().is_empty())
	}

	/// Fill every unset field from `defaults` and parse durations.
	pub fn resolve(self, defaults: &JobDefaults) -> Result<ResolvedOptions> {
		let delay = match self.delay.as_ref().or(defaults.delay.as_ref()) {
			Some(delay) => parse_delay(Some(delay))?,
			None => 0,
		};
		let timeout = parse_timeout(self.timeout.as_ref().or(defaults.timeout.as_ref()))?;
		let retry = match (self.retry, defaults.retry.as_ref()) {
			(Some(explicit), Some(fallback)) => Some(explicit.or(fallback)),
			(Some(explicit), None) => Some(explicit),
			(None, fallback) => fallback.cloned(),
		};

		Ok(ResolvedOptions {
			delay,
			timeout,
			priority: self.priority.or(defaults.priority),
			retry: parse_retry(retry.as_ref())?,
			cron: self.cron.filter(|expr| !expr.trim().is_empty()),
		})
	}
}

/// Defaults applied to calls that leave options unset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobDefaults {
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub delay: Option<DurationSpec>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub timeout: Option<DurationSpec>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub priority: Option<i64>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub retry: Option<RetryOptions>,
}

impl JobDefaults {
	/// Built-in defaults for one-off jobs.
	pub fn job() -> Self {
		Self {
			delay: Some(DurationSpec::Millis(0)),
			..Self::cron()
		}
	}

	/// Built-in defaults for cron jobs. Cron rows have no initial delay.
	pub fn cron() -> Self {
		Self {
			delay: None,
			timeout: Some(DurationSpec::Millis(5_000)),
			priority: Some(3),
			retry: Some(RetryOptions {
				count: Some(RetryCount::Number(3)),
				delay: Some(DurationSpec::Millis(5_000)),
				strategy: Some(EXPONENTIAL.to_string()),
			}),
		}
	}

	/// Field-wise overlay: values set on `self` win over `fallback`.
	pub fn or(self, fallback: &JobDefaults) -> JobDefaults {
		let retry = match (self.retry, fallback.retry.as_ref()) {
			(Some(explicit), Some(base)) => Some(explicit.or(base)),
			(Some(explicit), None) => Some(explicit),
			(None, base) => base.cloned(),
		};
		JobDefaults {
			delay: self.delay.or_else(|| fallback.delay.clone()),
			timeout: self.timeout.or_else(|| fallback.timeout.clone()),
			priority: self.priority.or(fallback.priority),
			retry,
		}
	}
}

/// Options after defaults and parsing, ready for the queue.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolvedOptions {
	/// Milliseconds from now before the job becomes ready.
	pub delay: u64,
	pub timeout: Option<u64>,
	pub priority: Option<i64>,
	pub retry: Option<RetryPolicy>,
	pub cron: Option<String>,
}
