// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! A named logical queue over a shared job table.
//!
//! # Claiming
//!
//! [`Queue::dequeue`] selects the best ready row (`priority DESC, id ASC`) and
//! then claims it with a conditional update keyed on the row's id and its
//! observed `queued` state. Regular rows move to `dequeued`; cron rows stay
//! `queued` and have their `delay` advanced to the next fire time, guarded by
//! the `delay` value that was read. When another poller wins the race the
//! update matches nothing and the selection is retried, so no two pollers ever
//! receive the same claim.

use serde_json::Value;
use sqlx::{QueryBuilder, Sqlite, SqlitePool};
use tracing::instrument;

use loom_jobqueue_core::{millis_after, now_millis, JobId, JobRecord, JobStatus, ResolvedOptions};

use crate::error::{QueueError, Result};
use crate::repository::{JobRepository, JobRow, JOB_COLUMNS};
use crate::schedule::next_fire;
use crate::schema::{bootstrap_schema, TableName};

/// Claim attempts before a contended poll gives up and reports empty.
const MAX_CLAIM_ATTEMPTS: usize = 8;

#[derive(Debug, Clone, Default)]
pub struct QueueOptions {
	pub table: TableName,
	/// Serve rows from every logical queue in the table.
	pub universal: bool,
}

/// Filters applied when claiming a job.
#[derive(Debug, Clone, Default)]
pub struct DequeueOptions {
	pub min_priority: Option<i64>,
	/// Only claim jobs whose name is in this set. `None` claims any name.
	pub names: Option<Vec<String>>,
}

#[derive(Clone)]
pub struct Queue {
	name: String,
	universal: bool,
	repository: JobRepository,
}

impl Queue {
	pub fn new(pool: SqlitePool, name: impl Into<String>, options: QueueOptions) -> Self {
		Self {
			name: name.into(),
			universal: options.universal,
			repository: JobRepository::new(pool, options.table),
		}
	}

	pub fn name(&self) -> &str {
		&self.name
	}

	pub fn is_universal(&self) -> bool {
		self.universal
	}

	pub fn repository(&self) -> &JobRepository {
		&self.repository
	}

	fn pool(&self) -> &SqlitePool {
		self.repository.pool()
	}

	fn table(&self) -> &TableName {
		self.repository.table()
	}

	/// Create the backing table and index if missing.
	pub async fn bootstrap(&self) -> Result<()> {
		bootstrap_schema(self.pool(), self.table()).await
	}

	/// Persist a new job in this queue.
	#[instrument(skip(self, params, options), fields(queue = %self.name))]
	pub async fn enqueue(
		&self,
		name: &str,
		params: Vec<Value>,
		options: ResolvedOptions,
	) -> Result<JobRecord> {
		let mut job = JobRecord::new(name, params, self.name.clone());
		job.retry = options.retry;
		job.timeout = options.timeout;
		job.delay = Some(millis_after(now_millis(), options.delay));
		job.priority = options.priority;
		job.cron = options.cron;

		self.repository.enqueue(&mut job).await?;
		tracing::debug!(job_id = ?job.id, "job enqueued");
		Ok(job)
	}

	/// Claim the next ready job, or `None` when nothing is ready.
	#[instrument(skip(self, options), fields(queue = %self.name))]
	pub async fn dequeue(&self, options: &DequeueOptions) -> Result<Option<JobRecord>> {
		if options.names.as_ref().is_some_and(|names| names.is_empty()) {
			return Ok(None);
		}

		for attempt in 0..MAX_CLAIM_ATTEMPTS {
			let now = now_millis();
			let Some(candidate) = self.select_candidate(options, now).await? else {
				return Ok(None);
			};

			if let Some(job) = self.claim(candidate, now).await? {
				tracing::debug!(job_id = ?job.id, name = %job.name, "job claimed");
				return Ok(Some(job));
			}
			tracing::debug!(attempt, "lost claim race, retrying");
		}

		Ok(None)
	}

	async fn select_candidate(
		&self,
		options: &DequeueOptions,
		now: i64,
	) -> Result<Option<Candidate>> {
		let mut query = QueryBuilder::<Sqlite>::new(format!(
			"SELECT id, cron, delay FROM {} WHERE status = ",
			self.table()
		));
		query.push_bind(JobStatus::Queued.as_str());
		query.push(" AND delay <= ");
		query.push_bind(now);
		if !self.universal {
			query.push(" AND queue = ");
			query.push_bind(self.name.clone());
		}
		if let Some(min_priority) = options.min_priority {
			query.push(" AND priority >= ");
			query.push_bind(min_priority);
		}
		if let Some(names) = &options.names {
			query.push(" AND name IN (");
			let mut separated = query.separated(", ");
			for name in names {
				separated.push_bind(name.clone());
			}
			separated.push_unseparated(")");
		}
		query.push(" ORDER BY priority DESC, id ASC LIMIT 1");

		let candidate = query
			.build_query_as::<Candidate>()
			.fetch_optional(self.pool())
			.await?;
		Ok(candidate)
	}

	async fn claim(&self, candidate: Candidate, now: i64) -> Result<Option<JobRecord>> {
		let row: Option<JobRow> = match candidate.cron.as_deref().map(str::trim) {
			Some(expression) if !expression.is_empty() => {
				let next = next_fire(expression, now)?;
				sqlx::query_as(&format!(
					r#"
					UPDATE {} SET delay = ?, updated_at = CURRENT_TIMESTAMP
					WHERE id = ? AND status = ? AND delay = ?
					RETURNING {JOB_COLUMNS}
					"#,
					self.table()
				))
				.bind(next)
				.bind(candidate.id)
				.bind(JobStatus::Queued.as_str())
				.bind(candidate.delay)
				.fetch_optional(self.pool())
				.await?
			}
			_ => {
				sqlx::query_as(&format!(
					r#"
					UPDATE {} SET status = ?, dequeued = ?, updated_at = CURRENT_TIMESTAMP
					WHERE id = ? AND status = ?
					RETURNING {JOB_COLUMNS}
					"#,
					self.table()
				))
				.bind(JobStatus::Dequeued.as_str())
				.bind(now)
				.bind(candidate.id)
				.bind(JobStatus::Queued.as_str())
				.fetch_optional(self.pool())
				.await?
			}
		};

		row.map(JobRecord::try_from).transpose()
	}

	/// Start a `SELECT`/`DELETE` scoped to this queue unless it is universal.
	fn scoped(&self, statement: &str) -> QueryBuilder<'static, Sqlite> {
		let mut query = QueryBuilder::new(format!("{statement} FROM {} WHERE 1 = 1", self.table()));
		if !self.universal {
			query.push(" AND queue = ");
			query.push_bind(self.name.clone());
		}
		query
	}

	async fn fetch_records(&self, mut query: QueryBuilder<'static, Sqlite>) -> Result<Vec<JobRecord>> {
		let rows = query
			.build_query_as::<JobRow>()
			.fetch_all(self.pool())
			.await?;
		rows.into_iter().map(JobRecord::try_from).collect()
	}

	async fn execute_delete(&self, mut query: QueryBuilder<'static, Sqlite>) -> Result<u64> {
		let result = query.build().execute(self.pool()).await?;
		Ok(result.rows_affected())
	}

	#[instrument(skip(self), fields(queue = %self.name))]
	pub async fn get(&self, id: JobId) -> Result<Option<JobRecord>> {
		let mut query = self.scoped(&format!("SELECT {JOB_COLUMNS}"));
		query.push(" AND id = ");
		query.push_bind(id.0);
		Ok(self.fetch_records(query).await?.into_iter().next())
	}

	#[instrument(skip(self), fields(queue = %self.name))]
	pub async fn list_all(&self) -> Result<Vec<JobRecord>> {
		let mut query = self.scoped(&format!("SELECT {JOB_COLUMNS}"));
		query.push(" ORDER BY id ASC");
		self.fetch_records(query).await
	}

	#[instrument(skip(self), fields(queue = %self.name, status = %status))]
	pub async fn list_by_status(&self, status: JobStatus) -> Result<Vec<JobRecord>> {
		let mut query = self.scoped(&format!("SELECT {JOB_COLUMNS}"));
		query.push(" AND status = ");
		query.push_bind(status.as_str());
		query.push(" ORDER BY id ASC");
		self.fetch_records(query).await
	}

	#[instrument(skip(self), fields(queue = %self.name))]
	pub async fn list_cron(&self) -> Result<Vec<JobRecord>> {
		let mut query = self.scoped(&format!("SELECT {JOB_COLUMNS}"));
		query.push(" AND cron IS NOT NULL AND TRIM(cron) != '' ORDER BY id ASC");
		self.fetch_records(query).await
	}

	/// Delete one job by id.
	#[instrument(skip(self), fields(queue = %self.name, job_id = %id))]
	pub async fn remove(&self, id: JobId) -> Result<()> {
		let mut query = self.scoped("DELETE");
		query.push(" AND id = ");
		query.push_bind(id.0);
		match self.execute_delete(query).await? {
			0 => Err(QueueError::job_not_found(id)),
			_ => Ok(()),
		}
	}

	/// Delete every job with this name. Returns the number of rows removed.
	#[instrument(skip(self), fields(queue = %self.name))]
	pub async fn remove_by_name(&self, name: &str) -> Result<u64> {
		let mut query = self.scoped("DELETE");
		query.push(" AND name = ");
		query.push_bind(name.to_string());
		self.execute_delete(query).await
	}

	/// Delete the cron rows with this name, leaving one-off jobs alone.
	#[instrument(skip(self), fields(queue = %self.name))]
	pub async fn remove_cron_job(&self, name: &str) -> Result<u64> {
		let mut query = self.scoped("DELETE");
		query.push(" AND cron IS NOT NULL AND name = ");
		query.push_bind(name.to_string());
		self.execute_delete(query).await
	}

	#[instrument(skip(self), fields(queue = %self.name))]
	pub async fn remove_all(&self) -> Result<u64> {
		self.execute_delete(self.scoped("DELETE")).await
	}

	#[instrument(skip(self), fields(queue = %self.name, status = %status))]
	pub async fn remove_by_status(&self, status: JobStatus) -> Result<u64> {
		let mut query = self.scoped("DELETE");
		query.push(" AND status = ");
		query.push_bind(status.as_str());
		self.execute_delete(query).await
	}

	#[instrument(skip(self), fields(queue = %self.name))]
	pub async fn remove_all_cron(&self) -> Result<u64> {
		let mut query = self.scoped("DELETE");
		query.push(" AND cron IS NOT NULL");
		self.execute_delete(query).await
	}

	/// Cancel a queued job by id.
	#[instrument(skip(self), fields(queue = %self.name, job_id = %id))]
	pub async fn cancel(&self, id: JobId) -> Result<JobRecord> {
		let mut job = self
			.get(id)
			.await?
			.ok_or_else(|| QueueError::job_not_found(id))?;
		self.repository.cancel(&mut job).await?;
		Ok(job)
	}

	/// Put a failed job back in the queue with its outcome cleared.
	///
	/// Only a row that is currently `failed` is reset; anything else reports
	/// `NotFound`.
	#[instrument(skip(self), fields(queue = %self.name, job_id = %id))]
	pub async fn retry_failed_job(&self, id: JobId) -> Result<JobRecord> {
		let mut query = QueryBuilder::<Sqlite>::new(format!(
			"UPDATE {} SET status = ",
			self.table()
		));
		query.push_bind(JobStatus::Queued.as_str());
		query.push(", dequeued = NULL, ended = NULL, result = NULL, updated_at = CURRENT_TIMESTAMP WHERE id = ");
		query.push_bind(id.0);
		query.push(" AND status = ");
		query.push_bind(JobStatus::Failed.as_str());
		if !self.universal {
			query.push(" AND queue = ");
			query.push_bind(self.name.clone());
		}
		query.push(format!(" RETURNING {JOB_COLUMNS}"));

		let row = query
			.build_query_as::<JobRow>()
			.fetch_optional(self.pool())
			.await?
			.ok_or_else(|| QueueError::job_not_found(id))?;

		tracing::info!("failed job re-queued");
		JobRecord::try_from(row)
	}
}

#[derive(Debug, sqlx::FromRow)]
struct Candidate {
	id: i64,
	cron: Option<String>,
	delay: Option<i64>,
}
