// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Persistence for individual job records.
//!
//! Transitions of a persisted row are compare-and-swap updates keyed on
//! `(id, status)`, using the status the caller last observed. A swap that
//! matches no row means another worker or an operator moved the row first,
//! and is reported as [`QueueError::InvalidTransition`].

use serde_json::Value;
use sqlx::SqlitePool;
use tracing::instrument;

use loom_jobqueue_core::{
	millis_after, now_millis, ErrorEnvelope, JobId, JobRecord, JobStatus, RetryPolicy,
};

use crate::error::{QueueError, Result};
use crate::schema::TableName;

pub(crate) const JOB_COLUMNS: &str = "id, name, params, queue, retry, timeout, delay, cron, priority, status, enqueued, dequeued, ended, result";

#[derive(Clone)]
pub struct JobRepository {
	pool: SqlitePool,
	table: TableName,
}

impl JobRepository {
	pub fn new(pool: SqlitePool, table: TableName) -> Self {
		Self { pool, table }
	}

	pub fn pool(&self) -> &SqlitePool {
		&self.pool
	}

	pub fn table(&self) -> &TableName {
		&self.table
	}

	/// Mark the record queued and persist it.
	///
	/// An unset `delay` means ready now and an unset `priority` means 0.
	#[instrument(skip(self, job), fields(name = %job.name, queue = %job.queue))]
	pub async fn enqueue(&self, job: &mut JobRecord) -> Result<()> {
		let now = now_millis();
		job.delay.get_or_insert(now);
		job.priority.get_or_insert(0);
		job.status = JobStatus::Queued;
		job.enqueued = Some(now);
		self.save(job).await
	}

	/// Upsert the record.
	///
	/// Cron records first look up an existing cron row with the same
	/// `(name, params, queue)` so rescheduling reuses one row.
	#[instrument(skip(self, job), fields(name = %job.name, job_id = ?job.id))]
	pub async fn save(&self, job: &mut JobRecord) -> Result<()> {
		let params = serde_json::to_string(&job.params)?;
		let retry = job.retry.as_ref().map(serde_json::to_string).transpose()?;
		let result = job.result.as_ref().map(serde_json::to_string).transpose()?;

		let mut tx = self.pool.begin().await?;

		if job.is_cron() {
			let existing: Option<(i64,)> = sqlx::query_as(&format!(
				"SELECT id FROM {} WHERE name = ? AND params = ? AND queue = ? AND cron IS NOT NULL ORDER BY id ASC LIMIT 1",
				self.table
			))
			.bind(&job.name)
			.bind(&params)
			.bind(&job.queue)
			.fetch_optional(&mut *tx)
			.await?;

			if let Some((id,)) = existing {
				tracing::debug!(job_id = id, "reusing existing cron row");
				job.id = Some(JobId(id));
			}
		}

		let (id,): (i64,) = sqlx::query_as(&format!(
			r#"
			INSERT INTO {} ({JOB_COLUMNS})
			VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
			ON CONFLICT(id) DO UPDATE SET
				name = excluded.name,
				params = excluded.params,
				queue = excluded.queue,
				retry = excluded.retry,
				timeout = excluded.timeout,
				delay = excluded.delay,
				cron = excluded.cron,
				priority = excluded.priority,
				status = excluded.status,
				enqueued = excluded.enqueued,
				dequeued = excluded.dequeued,
				ended = excluded.ended,
				result = excluded.result,
				updated_at = CURRENT_TIMESTAMP
			RETURNING id
			"#,
			self.table
		))
		.bind(job.id.map(|id| id.0))
		.bind(&job.name)
		.bind(&params)
		.bind(&job.queue)
		.bind(retry)
		.bind(job.timeout.map(|t| i64::try_from(t).unwrap_or(i64::MAX)))
		.bind(job.delay)
		.bind(&job.cron)
		.bind(job.priority.unwrap_or(0))
		.bind(job.status.as_str())
		.bind(job.enqueued)
		.bind(job.dequeued)
		.bind(job.ended)
		.bind(result)
		.fetch_one(&mut *tx)
		.await?;

		tx.commit().await?;

		job.id = Some(JobId(id));
		Ok(())
	}

	/// Move a queued record to `Cancelled`.
	#[instrument(skip(self, job), fields(job_id = ?job.id))]
	pub async fn cancel(&self, job: &mut JobRecord) -> Result<()> {
		if job.status != JobStatus::Queued {
			return Err(QueueError::transition(
				job.id,
				job.status,
				JobStatus::Cancelled,
			));
		}

		let mut next = job.clone();
		next.status = JobStatus::Cancelled;
		next.ended = Some(now_millis());
		self.compare_and_swap(job, next).await
	}

	/// Move a record to `Complete`, storing the handler's result.
	#[instrument(skip(self, job, result), fields(job_id = ?job.id))]
	pub async fn complete(&self, job: &mut JobRecord, result: Value) -> Result<()> {
		if job.status.is_terminal() {
			return Err(QueueError::transition(
				job.id,
				job.status,
				JobStatus::Complete,
			));
		}

		let mut next = job.clone();
		next.status = JobStatus::Complete;
		next.ended = Some(now_millis());
		next.result = Some(result);
		self.compare_and_swap(job, next).await
	}

	/// Move a record to `Failed`, storing the error envelope as its result.
	#[instrument(skip(self, job, error), fields(job_id = ?job.id))]
	pub async fn fail(&self, job: &mut JobRecord, error: &ErrorEnvelope) -> Result<()> {
		if job.status.is_terminal() {
			return Err(QueueError::transition(job.id, job.status, JobStatus::Failed));
		}

		let mut next = job.clone();
		next.status = JobStatus::Failed;
		next.ended = Some(now_millis());
		next.result = Some(error.to_value());
		self.compare_and_swap(job, next).await
	}

	/// Push the record's readiness `delay_ms` into the future and queue it again.
	///
	/// The record's current `retry` snapshot is written along with it, so the
	/// decremented attempt budget and the re-queue land in one update.
	#[instrument(skip(self, job), fields(job_id = ?job.id))]
	pub async fn delay(&self, job: &mut JobRecord, delay_ms: u64) -> Result<()> {
		let now = now_millis();
		let mut next = job.clone();
		next.delay = Some(millis_after(now, delay_ms));
		next.priority.get_or_insert(0);
		next.status = JobStatus::Queued;
		next.enqueued = Some(now);

		if job.id.is_none() {
			*job = next;
			return self.save(job).await;
		}

		if job.status.is_terminal() {
			return Err(QueueError::transition(job.id, job.status, JobStatus::Queued));
		}
		self.compare_and_swap(job, next).await
	}

	/// Give a cron row a fresh retry budget for its next scheduled run.
	///
	/// Only the `retry` column is written, so a concurrent claim that already
	/// advanced the row's `delay` is kept.
	#[instrument(skip(self, job), fields(job_id = ?job.id))]
	pub async fn reset_retry_budget(&self, job: &mut JobRecord) -> Result<()> {
		let (Some(id), Some(retry)) = (job.id, job.retry.as_mut()) else {
			return Ok(());
		};
		retry.remaining = None;
		let retry = serde_json::to_string(retry)?;

		sqlx::query(&format!(
			"UPDATE {} SET retry = ?, updated_at = CURRENT_TIMESTAMP WHERE id = ? AND status = ?",
			self.table
		))
		.bind(retry)
		.bind(id.0)
		.bind(job.status.as_str())
		.execute(&self.pool)
		.await?;

		Ok(())
	}

	/// Write `next` over the persisted row only if it still has `job.status`.
	async fn compare_and_swap(&self, job: &mut JobRecord, next: JobRecord) -> Result<()> {
		let Some(id) = job.id else {
			return Err(QueueError::Internal(
				"job must be persisted before it can change state".to_string(),
			));
		};

		let retry = next.retry.as_ref().map(serde_json::to_string).transpose()?;
		let result = next.result.as_ref().map(serde_json::to_string).transpose()?;

		let outcome = sqlx::query(&format!(
			r#"
			UPDATE {}
			SET retry = ?, delay = ?, priority = ?, status = ?, enqueued = ?, dequeued = ?,
				ended = ?, result = ?, updated_at = CURRENT_TIMESTAMP
			WHERE id = ? AND status = ?
			"#,
			self.table
		))
		.bind(retry)
		.bind(next.delay)
		.bind(next.priority.unwrap_or(0))
		.bind(next.status.as_str())
		.bind(next.enqueued)
		.bind(next.dequeued)
		.bind(next.ended)
		.bind(result)
		.bind(id.0)
		.bind(job.status.as_str())
		.execute(&self.pool)
		.await?;

		if outcome.rows_affected() == 0 {
			return Err(QueueError::transition(job.id, job.status, next.status));
		}

		tracing::debug!(job_id = %id, from = %job.status, to = %next.status, "job transitioned");
		*job = next;
		Ok(())
	}
}

/// One row of the job table.
#[derive(Debug, sqlx::FromRow)]
pub(crate) struct JobRow {
	id: i64,
	name: String,
	params: String,
	queue: String,
	retry: Option<String>,
	timeout: Option<i64>,
	delay: Option<i64>,
	cron: Option<String>,
	priority: i64,
	status: String,
	enqueued: Option<i64>,
	dequeued: Option<i64>,
	ended: Option<i64>,
	result: Option<String>,
}

impl TryFrom<JobRow> for JobRecord {
	type Error = QueueError;

	fn try_from(row: JobRow) -> Result<Self> {
		let params: Vec<Value> = if row.params.trim().is_empty() {
			Vec::new()
		} else {
			serde_json::from_str(&row.params)?
		};
		let retry: Option<RetryPolicy> = row
			.retry
			.as_deref()
			.filter(|s| !s.is_empty())
			.map(serde_json::from_str)
			.transpose()?;
		let result: Option<Value> = row
			.result
			.as_deref()
			.map(|s| serde_json::from_str(s).unwrap_or_else(|_| Value::String(s.to_string())));

		Ok(JobRecord {
			id: Some(JobId(row.id)),
			name: row.name,
			params,
			queue: row.queue,
			retry,
			timeout: row.timeout.map(|t| t.max(0) as u64),
			delay: row.delay,
			cron: row.cron,
			priority: Some(row.priority),
			status: row
				.status
				.parse()
				.map_err(|e: String| QueueError::Internal(format!("Invalid status: {e}")))?,
			enqueued: row.enqueued,
			dequeued: row.dequeued,
			ended: row.ended,
			result,
		})
	}
}
