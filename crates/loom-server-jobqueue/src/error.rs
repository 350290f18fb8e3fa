// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Error types for job queue operations.

use loom_jobqueue_core::{CoreError, JobId, JobStatus};
use thiserror::Error;

/// Result type for job queue operations.
pub type Result<T> = std::result::Result<T, QueueError>;

/// Errors that can occur in job queue operations.
#[derive(Debug, Error)]
pub enum QueueError {
	#[error("database error: {0}")]
	Database(#[from] sqlx::Error),

	#[error("serialization error: {0}")]
	Serialization(#[from] serde_json::Error),

	#[error("invalid transition for job {id}: {from} -> {to}")]
	InvalidTransition {
		id: String,
		from: JobStatus,
		to: JobStatus,
	},

	#[error("invalid cron expression: {0}")]
	InvalidCronExpression(String),

	#[error("no handler registered for {0}")]
	NoHandlerRegistered(String),

	#[error("job timed out after {0}ms")]
	Timeout(u64),

	#[error("handler error: {0}")]
	Handler(String),

	#[error("not found: {0}")]
	NotFound(String),

	#[error("invalid table name: {0}")]
	InvalidTableName(String),

	#[error(transparent)]
	Core(#[from] CoreError),

	#[error("internal error: {0}")]
	Internal(String),
}

impl QueueError {
	pub(crate) fn transition(id: Option<JobId>, from: JobStatus, to: JobStatus) -> Self {
		QueueError::InvalidTransition {
			id: id.map(|id| id.to_string()).unwrap_or_else(|| "<unsaved>".to_string()),
			from,
			to,
		}
	}

	pub(crate) fn job_not_found(id: JobId) -> Self {
		QueueError::NotFound(format!("job {id}"))
	}
}
