// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Duration parsing, retry policy normalization and backoff strategies.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::warn;

use crate::error::{CoreError, Result};
use crate::options::RetryOptions;

pub const LINEAR: &str = "linear";
pub const EXPONENTIAL: &str = "exponential";

/// A duration given either as milliseconds or as text such as `"5m"` or `"2s"`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DurationSpec {
	Millis(u64),
	Text(String),
}

impl From<u64> for DurationSpec {
	fn from(ms: u64) -> Self {
		DurationSpec::Millis(ms)
	}
}

impl From<&str> for DurationSpec {
	fn from(text: &str) -> Self {
		DurationSpec::Text(text.to_string())
	}
}

impl From<String> for DurationSpec {
	fn from(text: String) -> Self {
		DurationSpec::Text(text)
	}
}

/// A retry count given as a number or as text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RetryCount {
	Number(i64),
	Text(String),
}

impl From<u32> for RetryCount {
	fn from(count: u32) -> Self {
		RetryCount::Number(count as i64)
	}
}

impl RetryCount {
	/// Unparseable or negative counts become 0.
	pub fn resolve(&self) -> u32 {
		match self {
			RetryCount::Number(n) => (*n).clamp(0, u32::MAX as i64) as u32,
			RetryCount::Text(s) => s.trim().parse().unwrap_or(0),
		}
	}
}

/// Parse a delay into milliseconds. Absent means 0.
pub fn parse_delay(value: Option<&DurationSpec>) -> Result<u64> {
	match value {
		None => Ok(0),
		Some(DurationSpec::Millis(ms)) => Ok(*ms),
		Some(DurationSpec::Text(text)) => parse_duration_text(text),
	}
}

/// Parse a handler timeout into milliseconds. Absent stays absent.
pub fn parse_timeout(value: Option<&DurationSpec>) -> Result<Option<u64>> {
	value.map(|v| parse_delay(Some(v))).transpose()
}

fn parse_duration_text(text: &str) -> Result<u64> {
	let text = text.trim();
	if text.is_empty() {
		return Ok(0);
	}
	if let Ok(ms) = text.parse::<u64>() {
		return Ok(ms);
	}
	humantime::parse_duration(text)
		.map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
		.map_err(|e| CoreError::InvalidDuration(format!("{text}: {e}")))
}

/// Snapshot of a job's retry configuration plus its mutable attempt state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
	pub count: u32,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub delay: Option<u64>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub strategy: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub remaining: Option<u32>,
}

impl RetryPolicy {
	pub fn new(count: u32) -> Self {
		Self {
			count,
			delay: None,
			strategy: None,
			remaining: None,
		}
	}

	pub fn with_delay(mut self, delay_ms: u64) -> Self {
		self.delay = Some(delay_ms);
		self
	}

	pub fn with_strategy(mut self, strategy: impl Into<String>) -> Self {
		self.strategy = Some(strategy.into());
		self
	}

	/// Record one failed attempt and return the attempts left.
	///
	/// Counting starts from `count` when nothing has been consumed yet, and also
	/// after a previous run exhausted the budget (a failed job that an operator
	/// re-queued gets a fresh budget).
	pub fn consume_attempt(&mut self) -> u32 {
		let current = match self.remaining {
			Some(r) if r > 0 => r,
			_ => self.count,
		};
		let remaining = current.saturating_sub(1);
		self.remaining = Some(remaining);
		remaining
	}

	/// Attempts already used, as seen by the exponential strategy.
	pub fn attempts_used(&self) -> u32 {
		self
			.count
			.saturating_sub(self.remaining.unwrap_or(self.count))
	}
}

/// Normalize caller retry options into a persisted policy.
pub fn parse_retry(options: Option<&RetryOptions>) -> Result<Option<RetryPolicy>> {
	let Some(options) = options else {
		return Ok(None);
	};

	let count = options.count.as_ref().map(RetryCount::resolve).unwrap_or(0);
	let delay = options
		.delay
		.as_ref()
		.map(|d| parse_delay(Some(d)))
		.transpose()?;

	Ok(Some(RetryPolicy {
		count,
		delay,
		strategy: options.strategy.clone(),
		remaining: None,
	}))
}

/// Constant wait between attempts.
pub fn linear(retry: &RetryPolicy) -> u64 {
	retry.delay.unwrap_or(0)
}

/// Wait grows by one delay unit per attempt already used.
pub fn exponential(retry: &RetryPolicy) -> u64 {
	retry
		.delay
		.unwrap_or(0)
		.saturating_mul(retry.attempts_used() as u64)
}

pub type BackoffFn = Arc<dyn Fn(&RetryPolicy) -> u64 + Send + Sync>;

/// Named backoff strategies. `linear` and `exponential` are always present.
#[derive(Clone)]
pub struct BackoffStrategies {
	strategies: HashMap<String, BackoffFn>,
}

impl BackoffStrategies {
	pub fn new() -> Self {
		let mut strategies: HashMap<String, BackoffFn> = HashMap::new();
		strategies.insert(LINEAR.to_string(), Arc::new(linear));
		strategies.insert(EXPONENTIAL.to_string(), Arc::new(exponential));
		Self { strategies }
	}

	/// Add or replace a named strategy.
	pub fn register<F>(&mut self, name: impl Into<String>, strategy: F)
	where
		F: Fn(&RetryPolicy) -> u64 + Send + Sync + 'static,
	{
		self.strategies.insert(name.into(), Arc::new(strategy));
	}

	pub fn contains(&self, name: &str) -> bool {
		self.strategies.contains_key(name)
	}

	/// Milliseconds to wait before the next attempt.
	///
	/// Unknown strategy names fall back to linear with a warning. A policy without
	/// a delay retries immediately.
	pub fn wait_for(&self, retry: &RetryPolicy) -> u64 {
		if retry.delay.is_none() {
			return 0;
		}

		let name = retry.strategy.as_deref().unwrap_or(LINEAR);
		match self.strategies.get(name) {
			Some(strategy) => strategy(retry),
			None => {
				warn!(strategy = %name, "no such retry strategy, using linear");
				linear(retry)
			}
		}
	}
}

impl Default for BackoffStrategies {
	fn default() -> Self {
		Self::new()
	}
}

impl fmt::Debug for BackoffStrategies {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let mut names: Vec<&String> = self.strategies.keys().collect();
		names.sort();
		f.debug_struct("BackoffStrategies")
			.field("strategies", &names)
			.finish()
	}
}
