// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Worker lifecycle events.
//!
//! Workers publish these on a broadcast channel. Each job-bearing variant
//! carries a snapshot of the record at the time of the event.
//!
//! # Events
//!
//! - `dequeued` - a job was claimed
//! - `complete` - a non-cron job finished and was marked complete
//! - `retrying` - a job failed and was re-delayed for another attempt
//! - `failed` - a job exhausted its retries
//! - `empty` - a claim attempt found nothing ready
//! - `error` - a store or claim error; the poll loop keeps running
//! - `stopped` - the poll loop exited after `stop()`

use serde::{Deserialize, Serialize};

use crate::job::{ErrorEnvelope, JobRecord};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum WorkerEvent {
	#[serde(rename = "dequeued")]
	Dequeued(JobRecord),

	#[serde(rename = "complete")]
	Complete(JobRecord),

	#[serde(rename = "retrying")]
	Retrying {
		job: JobRecord,
		error: ErrorEnvelope,
		wait_ms: u64,
	},

	#[serde(rename = "failed")]
	Failed {
		job: JobRecord,
		error: ErrorEnvelope,
	},

	#[serde(rename = "empty")]
	Empty { queue: String },

	#[serde(rename = "error")]
	Error { message: String },

	#[serde(rename = "stopped")]
	Stopped { worker: String },
}

impl WorkerEvent {
	/// Returns the event type name as a string.
	pub fn event_type(&self) -> &'static str {
		match self {
			WorkerEvent::Dequeued(_) => "dequeued",
			WorkerEvent::Complete(_) => "complete",
			WorkerEvent::Retrying { .. } => "retrying",
			WorkerEvent::Failed { .. } => "failed",
			WorkerEvent::Empty { .. } => "empty",
			WorkerEvent::Error { .. } => "error",
			WorkerEvent::Stopped { .. } => "stopped",
		}
	}

	/// The job snapshot carried by this event, if any.
	pub fn job(&self) -> Option<&JobRecord> {
		match self {
			WorkerEvent::Dequeued(job) | WorkerEvent::Complete(job) => Some(job),
			WorkerEvent::Retrying { job, .. } | WorkerEvent::Failed { job, .. } => Some(job),
			WorkerEvent::Empty { .. } | WorkerEvent::Error { .. } | WorkerEvent::Stopped { .. } => None,
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_event_type_matches_serde_tag() {
		let job = JobRecord::new("test.job", vec![], "default");
		let events = vec![
			WorkerEvent::Dequeued(job.clone()),
			WorkerEvent::Complete(job.clone()),
			WorkerEvent::Retrying {
				job: job.clone(),
				error: ErrorEnvelope::new("boom", "boom"),
				wait_ms: 10,
			},
			WorkerEvent::Failed {
				job,
				error: ErrorEnvelope::new("boom", "boom"),
			},
			WorkerEvent::Empty {
				queue: "default".to_string(),
			},
			WorkerEvent::Error {
				message: "database is locked".to_string(),
			},
			WorkerEvent::Stopped {
				worker: "default".to_string(),
			},
		];

		for event in events {
			let json = serde_json::to_value(&event).unwrap();
			assert_eq!(json["event"], event.event_type());
		}
	}

	#[test]
	fn test_job_accessor() {
		let job = JobRecord::new("test.job", vec![], "default");
		assert!(WorkerEvent::Dequeued(job).job().is_some());
		assert!(WorkerEvent::Empty {
			queue: "default".to_string()
		}
		.job()
		.is_none());
	}
}
