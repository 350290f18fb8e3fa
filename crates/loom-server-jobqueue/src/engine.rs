// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! The job queue engine: the registry of queues and workers that one process
//! assembles at startup and tears down on shutdown.

use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{info, instrument};

use loom_jobqueue_core::{JobId, JobRecord, JobStatus, JobSummary};

use crate::client::JobClient;
use crate::config::JobQueueConfig;
use crate::error::{QueueError, Result};
use crate::handler::HandlerRegistry;
use crate::pool::create_pool;
use crate::queue::{Queue, QueueOptions};
use crate::schema::bootstrap_schema;
use crate::worker::{Worker, WorkerConfig};

pub const DEFAULT_QUEUE: &str = "default";
pub const CRON_QUEUE: &str = "cron";
/// Worker key for a worker that serves every logical queue in the table.
pub const UNIVERSAL_QUEUE: &str = "*";

/// Result of re-queueing a failed job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryOutcome {
	pub success: bool,
	/// The queue whose row was reset.
	pub queue: String,
}

pub struct JobQueueEngine {
	pool: SqlitePool,
	config: JobQueueConfig,
	queues: RwLock<BTreeMap<String, Queue>>,
	workers: RwLock<BTreeMap<String, Worker>>,
}

impl JobQueueEngine {
	/// Bootstrap the job table and create the `default` and `cron` queues.
	#[instrument(skip(pool, config), fields(table = %config.table))]
	pub async fn new(pool: SqlitePool, config: JobQueueConfig) -> Result<Arc<Self>> {
		bootstrap_schema(&pool, &config.table).await?;

		let engine = Arc::new(Self {
			pool,
			config,
			queues: RwLock::new(BTreeMap::new()),
			workers: RwLock::new(BTreeMap::new()),
		});
		engine.queue_or_create(DEFAULT_QUEUE).await;
		engine.queue_or_create(CRON_QUEUE).await;

		info!("job queue engine initialized");
		Ok(engine)
	}

	/// Open the configured database and build an engine over it.
	pub async fn connect(config: JobQueueConfig) -> Result<Arc<Self>> {
		let pool = create_pool(&config.database_url).await?;
		Self::new(pool, config).await
	}

	pub fn config(&self) -> &JobQueueConfig {
		&self.config
	}

	pub fn pool(&self) -> &SqlitePool {
		&self.pool
	}

	/// A facade for enqueueing calls through this engine.
	pub fn client(self: &Arc<Self>) -> JobClient {
		JobClient::new(Arc::clone(self))
	}

	/// The queue handle for a logical name, if one exists.
	pub async fn queue(&self, name: &str) -> Option<Queue> {
		self.queues.read().await.get(name).cloned()
	}

	/// The queue handle for a logical name, creating it on first use.
	pub async fn queue_or_create(&self, name: &str) -> Queue {
		if let Some(queue) = self.queues.read().await.get(name) {
			return queue.clone();
		}

		let mut queues = self.queues.write().await;
		queues
			.entry(name.to_string())
			.or_insert_with(|| {
				Queue::new(
					self.pool.clone(),
					name,
					QueueOptions {
						table: self.config.table.clone(),
						universal: false,
					},
				)
			})
			.clone()
	}

	pub async fn queue_names(&self) -> Vec<String> {
		self.queues.read().await.keys().cloned().collect()
	}

	/// Create (or extend) the worker for `queue_name` and start it.
	///
	/// A second call for the same queue merges `handlers` into the running
	/// worker instead of starting another one. [`UNIVERSAL_QUEUE`] binds the
	/// worker to every logical queue in the table.
	#[instrument(skip(self, handlers), fields(queue = %queue_name))]
	pub async fn spawn_worker(&self, queue_name: &str, handlers: HandlerRegistry) -> Worker {
		let existing = self.workers.read().await.get(queue_name).cloned();
		let worker = match existing {
			Some(worker) => worker,
			None => {
				let queue = if queue_name == UNIVERSAL_QUEUE {
					Queue::new(
						self.pool.clone(),
						UNIVERSAL_QUEUE,
						QueueOptions {
							table: self.config.table.clone(),
							universal: true,
						},
					)
				} else {
					self.queue_or_create(queue_name).await
				};
				let worker = Worker::new(
					queue_name,
					vec![queue],
					WorkerConfig {
						interval: self.config.poll_interval,
						min_priority: self.config.min_priority,
					},
				);
				self
					.workers
					.write()
					.await
					.entry(queue_name.to_string())
					.or_insert(worker)
					.clone()
			}
		};

		worker.register(handlers).await;
		worker.start().await;
		worker
	}

	/// Shorthand for `spawn_worker(UNIVERSAL_QUEUE, handlers)`.
	pub async fn spawn_universal_worker(&self, handlers: HandlerRegistry) -> Worker {
		self.spawn_worker(UNIVERSAL_QUEUE, handlers).await
	}

	pub async fn worker(&self, queue_name: &str) -> Option<Worker> {
		self.workers.read().await.get(queue_name).cloned()
	}

	pub async fn stop_worker(&self, queue_name: &str) -> Result<()> {
		let worker = self
			.worker(queue_name)
			.await
			.ok_or_else(|| QueueError::NotFound(format!("worker {queue_name}")))?;
		worker.stop().await;
		Ok(())
	}

	pub async fn start_all_workers(&self) {
		let workers: Vec<Worker> = self.workers.read().await.values().cloned().collect();
		for worker in workers {
			worker.start().await;
		}
	}

	pub async fn stop_all_workers(&self) {
		let workers: Vec<Worker> = self.workers.read().await.values().cloned().collect();
		for worker in workers {
			worker.stop().await;
		}
	}

	async fn known_queues(&self) -> Vec<Queue> {
		let queues = self.queues.read().await;
		let mut ordered = Vec::with_capacity(queues.len());
		for name in [DEFAULT_QUEUE, CRON_QUEUE] {
			if let Some(queue) = queues.get(name) {
				ordered.push(queue.clone());
			}
		}
		ordered.extend(
			queues
				.iter()
				.filter(|(name, _)| name.as_str() != DEFAULT_QUEUE && name.as_str() != CRON_QUEUE)
				.map(|(_, queue)| queue.clone()),
		);
		ordered
	}

	/// Every job in every known queue, grouped by queue then by status.
	#[instrument(skip(self))]
	pub async fn list_jobs(&self) -> Result<Vec<JobSummary>> {
		let mut jobs = Vec::new();
		for queue in self.known_queues().await {
			for status in JobStatus::ALL {
				jobs.extend(
					queue
						.list_by_status(status)
						.await?
						.iter()
						.filter_map(JobRecord::summary),
				);
			}
		}
		Ok(jobs)
	}

	/// Re-queue a failed job, trying each known queue in turn.
	#[instrument(skip(self), fields(job_id = %id))]
	pub async fn retry_job(&self, id: JobId) -> Result<RetryOutcome> {
		for queue in self.known_queues().await {
			match queue.retry_failed_job(id).await {
				Ok(_) => {
					return Ok(RetryOutcome {
						success: true,
						queue: queue.name().to_string(),
					})
				}
				Err(QueueError::NotFound(_)) => continue,
				Err(err) => return Err(err),
			}
		}
		Err(QueueError::job_not_found(id))
	}

	/// Delete a job, trying each known queue in turn.
	#[instrument(skip(self), fields(job_id = %id))]
	pub async fn delete_job(&self, id: JobId) -> Result<()> {
		for queue in self.known_queues().await {
			match queue.remove(id).await {
				Ok(()) => return Ok(()),
				Err(QueueError::NotFound(_)) => continue,
				Err(err) => return Err(err),
			}
		}
		Err(QueueError::job_not_found(id))
	}

	/// Cancel a queued job, trying each known queue in turn.
	#[instrument(skip(self), fields(job_id = %id))]
	pub async fn cancel_job(&self, id: JobId) -> Result<JobRecord> {
		for queue in self.known_queues().await {
			match queue.cancel(id).await {
				Ok(job) => return Ok(job),
				Err(QueueError::NotFound(_)) => continue,
				Err(err) => return Err(err),
			}
		}
		Err(QueueError::job_not_found(id))
	}

	/// Stop every worker and close the pool.
	#[instrument(skip(self))]
	pub async fn shutdown(&self) {
		self.stop_all_workers().await;
		self.pool.close().await;
		info!("job queue engine shut down");
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::testing::create_test_pool;
	use loom_jobqueue_core::{ErrorEnvelope, ResolvedOptions, WorkerEvent};

	async fn engine() -> Arc<JobQueueEngine> {
		JobQueueEngine::new(create_test_pool().await, JobQueueConfig::default())
			.await
			.unwrap()
	}

	#[tokio::test]
	async fn test_builtin_queues_exist() {
		let engine = engine().await;
		assert!(engine.queue(DEFAULT_QUEUE).await.is_some());
		assert!(engine.queue(CRON_QUEUE).await.is_some());
		assert!(engine.queue("emails").await.is_none());

		engine.queue_or_create("emails").await;
		assert_eq!(
			engine.queue_names().await,
			vec!["cron", "default", "emails"]
		);
	}

	#[tokio::test]
	async fn test_admin_surface_spans_queues() {
		let engine = engine().await;
		let default = engine.queue(DEFAULT_QUEUE).await.unwrap();
		let cron = engine.queue(CRON_QUEUE).await.unwrap();

		let one = default
			.enqueue("a.one", vec![], ResolvedOptions::default())
			.await
			.unwrap();
		let two = cron
			.enqueue(
				"b.two",
				vec![],
				ResolvedOptions {
					cron: Some("0 0 * * *".to_string()),
					..Default::default()
				},
			)
			.await
			.unwrap();

		let jobs = engine.list_jobs().await.unwrap();
		assert_eq!(jobs.len(), 2);
		assert_eq!(jobs[0].queue, "default");
		assert_eq!(jobs[1].queue, "cron");
		assert_eq!(jobs[1].cron.as_deref(), Some("0 0 * * *"));

		engine.delete_job(two.id.unwrap()).await.unwrap();
		assert!(matches!(
			engine.delete_job(two.id.unwrap()).await,
			Err(QueueError::NotFound(_))
		));

		let mut claimed = default
			.dequeue(&Default::default())
			.await
			.unwrap()
			.unwrap();
		assert_eq!(claimed.id, one.id);
		default
			.repository()
			.fail(&mut claimed, &ErrorEnvelope::new("boom", "boom"))
			.await
			.unwrap();

		let outcome = engine.retry_job(one.id.unwrap()).await.unwrap();
		assert_eq!(
			outcome,
			RetryOutcome {
				success: true,
				queue: "default".to_string()
			}
		);
		assert!(matches!(
			engine.retry_job(one.id.unwrap()).await,
			Err(QueueError::NotFound(_))
		));

		let cancelled = engine.cancel_job(one.id.unwrap()).await.unwrap();
		assert_eq!(cancelled.status, JobStatus::Cancelled);
	}

	#[tokio::test]
	async fn test_universal_worker_serves_every_queue() {
		let config = JobQueueConfig {
			poll_interval: std::time::Duration::from_millis(20),
			..Default::default()
		};
		let engine = JobQueueEngine::new(create_test_pool().await, config)
			.await
			.unwrap();

		let mut handlers = HandlerRegistry::new();
		handlers.register("a.b", |_params: Vec<serde_json::Value>| async move {
			anyhow::Ok(serde_json::json!("ok"))
		});
		let worker = engine.spawn_universal_worker(handlers).await;
		let mut events = worker.subscribe();

		for name in [DEFAULT_QUEUE, "emails"] {
			engine
				.queue_or_create(name)
				.await
				.enqueue("a.b", vec![], ResolvedOptions::default())
				.await
				.unwrap();
		}

		let mut completed = tokio::time::timeout(std::time::Duration::from_secs(5), async {
			let mut completed = Vec::new();
			while completed.len() < 2 {
				if let WorkerEvent::Complete(job) = events.recv().await.unwrap() {
					completed.push(job.queue);
				}
			}
			completed
		})
		.await
		.unwrap();
		completed.sort();

		assert_eq!(completed, vec!["default", "emails"]);
		assert_eq!(worker.queue_names().await, vec![UNIVERSAL_QUEUE]);
		assert!(engine.worker(UNIVERSAL_QUEUE).await.is_some());
		assert!(!engine.queue_names().await.contains(&UNIVERSAL_QUEUE.to_string()));
		engine.shutdown().await;
	}

	#[tokio::test]
	async fn test_spawn_worker_is_idempotent_per_queue() {
		let engine = engine().await;
		let first = engine.spawn_worker(DEFAULT_QUEUE, HandlerRegistry::new()).await;
		let second = engine.spawn_worker(DEFAULT_QUEUE, HandlerRegistry::new()).await;
		assert!(first.is_working());
		assert!(second.is_working());

		engine.stop_worker(DEFAULT_QUEUE).await.unwrap();
		assert!(!first.is_working());
		assert!(matches!(
			engine.stop_worker("missing").await,
			Err(QueueError::NotFound(_))
		));
		engine.shutdown().await;
	}
}
