// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Job record types.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

use crate::retry::RetryPolicy;

/// Current wall-clock time in epoch milliseconds.
pub fn now_millis() -> i64 {
	Utc::now().timestamp_millis()
}

/// The epoch-millisecond instant `delay_ms` after `from`, saturating at
/// `i64::MAX` instead of wrapping into the past.
pub fn millis_after(from: i64, delay_ms: u64) -> i64 {
	from.saturating_add(i64::try_from(delay_ms).unwrap_or(i64::MAX))
}

/// Store-assigned identity of a job row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub i64);

impl fmt::Display for JobId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.0)
	}
}

impl FromStr for JobId {
	type Err = std::num::ParseIntError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		Ok(Self(s.trim().parse()?))
	}
}

/// Lifecycle status of a job row.
///
/// ```text
/// Queued -> Dequeued -> {Complete | Failed}
/// Queued -> Cancelled
/// Queued -> Queued      (retry re-delay)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
	Queued,
	Dequeued,
	Complete,
	Failed,
	Cancelled,
}

impl JobStatus {
	pub const ALL: [JobStatus; 5] = [
		JobStatus::Queued,
		JobStatus::Dequeued,
		JobStatus::Complete,
		JobStatus::Failed,
		JobStatus::Cancelled,
	];

	pub fn as_str(&self) -> &'static str {
		match self {
			JobStatus::Queued => "queued",
			JobStatus::Dequeued => "dequeued",
			JobStatus::Complete => "complete",
			JobStatus::Failed => "failed",
			JobStatus::Cancelled => "cancelled",
		}
	}

	/// Terminal statuses are never left by the worker.
	pub fn is_terminal(&self) -> bool {
		matches!(
			self,
			JobStatus::Complete | JobStatus::Failed | JobStatus::Cancelled
		)
	}
}

impl fmt::Display for JobStatus {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

impl FromStr for JobStatus {
	type Err = String;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s {
			"queued" => Ok(JobStatus::Queued),
			"dequeued" => Ok(JobStatus::Dequeued),
			"complete" => Ok(JobStatus::Complete),
			"failed" => Ok(JobStatus::Failed),
			"cancelled" => Ok(JobStatus::Cancelled),
			_ => Err(format!("unknown job status: {s}")),
		}
	}
}

/// Serialized form of a failure, stored in `result` when a job fails.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorEnvelope {
	pub message: String,
	pub stack: String,
}

impl ErrorEnvelope {
	pub fn new(message: impl Into<String>, stack: impl Into<String>) -> Self {
		Self {
			message: message.into(),
			stack: stack.into(),
		}
	}

	pub fn to_value(&self) -> Value {
		serde_json::json!({
			"message": self.message,
			"stack": self.stack,
		})
	}
}

impl<E: std::error::Error> From<&E> for ErrorEnvelope {
	fn from(err: &E) -> Self {
		let mut stack = err.to_string();
		let mut source = err.source();
		while let Some(cause) = source {
			stack.push_str("\n  caused by: ");
			stack.push_str(&cause.to_string());
			source = cause.source();
		}
		Self::new(err.to_string(), stack)
	}
}

/// One persisted task instance.
///
/// Cron jobs reuse one row across runs; every other job gets a fresh row per enqueue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
	pub id: Option<JobId>,
	/// Handler key (`module.function`) or a cron job key.
	pub name: String,
	/// Ordered positional arguments passed to the handler.
	pub params: Vec<Value>,
	/// Logical queue this row belongs to.
	pub queue: String,
	pub retry: Option<RetryPolicy>,
	/// Handler deadline in milliseconds.
	pub timeout: Option<u64>,
	/// Epoch-ms "not ready before" timestamp; the next run for cron rows.
	pub delay: Option<i64>,
	pub cron: Option<String>,
	/// Higher is served first. Unset until enqueued.
	pub priority: Option<i64>,
	pub status: JobStatus,
	pub enqueued: Option<i64>,
	pub dequeued: Option<i64>,
	pub ended: Option<i64>,
	pub result: Option<Value>,
}

impl JobRecord {
	pub fn new(name: impl Into<String>, params: Vec<Value>, queue: impl Into<String>) -> Self {
		Self {
			id: None,
			name: name.into(),
			params,
			queue: queue.into(),
			retry: None,
			timeout: None,
			delay: None,
			cron: None,
			priority: None,
			status: JobStatus::Queued,
			enqueued: None,
			dequeued: None,
			ended: None,
			result: None,
		}
	}

	/// Whether this row is rescheduled by a cron expression instead of completing.
	pub fn is_cron(&self) -> bool {
		self
			.cron
			.as_deref()
			.is_some_and(|expr| !expr.trim().is_empty())
	}

	/// Whether the row is claimable at `now` (epoch ms).
	pub fn is_ready(&self, now: i64) -> bool {
		self.status == JobStatus::Queued && self.delay.is_some_and(|d| d <= now)
	}

	/// Admin view of this record. `None` until the row has been persisted.
	pub fn summary(&self) -> Option<JobSummary> {
		let id = self.id?;
		Some(JobSummary {
			id,
			name: self.name.clone(),
			queue: self.queue.clone(),
			status: self.status,
			created_at: self.enqueued,
			updated_at: self.ended.or(self.dequeued),
			params: self.params.clone(),
			result: self.result.clone(),
			priority: self.priority.unwrap_or(0),
			cron: self.cron.clone(),
			delay: self.delay,
			timeout: self.timeout,
			retry: self.retry.clone(),
		})
	}
}

/// Flattened job listing used by admin surfaces.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSummary {
	pub id: JobId,
	pub name: String,
	pub queue: String,
	pub status: JobStatus,
	pub created_at: Option<i64>,
	pub updated_at: Option<i64>,
	pub params: Vec<Value>,
	pub result: Option<Value>,
	pub priority: i64,
	pub cron: Option<String>,
	pub delay: Option<i64>,
	pub timeout: Option<u64>,
	pub retry: Option<RetryPolicy>,
}
