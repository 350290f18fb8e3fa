// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Polling workers.
//!
//! A worker owns one polling task bound to one or more queues. Each cycle
//! claims from the next queue in round-robin order; when every bound queue has
//! come up empty in a row the task pauses for the poll interval. Claimed jobs
//! run on their own Tokio task so a timeout marks the job failed without
//! cancelling the handler.

use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use loom_jobqueue_core::{BackoffStrategies, ErrorEnvelope, JobRecord, RetryPolicy, WorkerEvent};

use crate::error::{QueueError, Result};
use crate::handler::HandlerRegistry;
use crate::queue::{DequeueOptions, Queue};
use crate::repository::JobRepository;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(5_000);

const EVENT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
pub struct WorkerConfig {
	/// Pause after every bound queue came up empty.
	pub interval: Duration,
	/// Only claim jobs at or above this priority.
	pub min_priority: Option<i64>,
}

impl Default for WorkerConfig {
	fn default() -> Self {
		Self {
			interval: DEFAULT_POLL_INTERVAL,
			min_priority: None,
		}
	}
}

struct Running {
	shutdown_tx: broadcast::Sender<()>,
	handle: JoinHandle<()>,
}

struct WorkerInner {
	name: String,
	config: WorkerConfig,
	queues: RwLock<Vec<Queue>>,
	handlers: RwLock<HandlerRegistry>,
	strategies: RwLock<BackoffStrategies>,
	events: broadcast::Sender<WorkerEvent>,
	working: AtomicBool,
	cursor: Mutex<usize>,
}

/// Outcome of one claim attempt in the poll loop.
enum PollOutcome {
	Worked,
	Empty,
	Failed,
}

#[derive(Clone)]
pub struct Worker {
	inner: Arc<WorkerInner>,
	running: Arc<Mutex<Option<Running>>>,
}

impl Worker {
	pub fn new(name: impl Into<String>, queues: Vec<Queue>, config: WorkerConfig) -> Self {
		let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
		Self {
			inner: Arc::new(WorkerInner {
				name: name.into(),
				config,
				queues: RwLock::new(queues),
				handlers: RwLock::new(HandlerRegistry::new()),
				strategies: RwLock::new(BackoffStrategies::new()),
				events,
				working: AtomicBool::new(false),
				cursor: Mutex::new(0),
			}),
			running: Arc::new(Mutex::new(None)),
		}
	}

	pub fn name(&self) -> &str {
		&self.inner.name
	}

	pub fn config(&self) -> &WorkerConfig {
		&self.inner.config
	}

	pub fn is_working(&self) -> bool {
		self.inner.working.load(Ordering::SeqCst)
	}

	/// Merge `handlers` into the dispatch table. Later registrations win.
	pub async fn register(&self, handlers: HandlerRegistry) {
		let mut table = self.inner.handlers.write().await;
		table.merge(handlers);
		debug!(worker = %self.inner.name, handlers = table.len(), "handlers registered");
	}

	/// Add or replace a named backoff strategy.
	pub async fn register_strategy<F>(&self, name: impl Into<String>, strategy: F)
	where
		F: Fn(&RetryPolicy) -> u64 + Send + Sync + 'static,
	{
		self.inner.strategies.write().await.register(name, strategy);
	}

	/// Bind another queue. A running worker picks it up on its next cycle.
	pub async fn bind(&self, queue: Queue) {
		self.inner.queues.write().await.push(queue);
	}

	pub async fn queue_names(&self) -> Vec<String> {
		let queues = self.inner.queues.read().await;
		queues.iter().map(|q| q.name().to_string()).collect()
	}

	/// Receive lifecycle events from this worker.
	pub fn subscribe(&self) -> broadcast::Receiver<WorkerEvent> {
		self.inner.events.subscribe()
	}

	/// Start the poll loop. Starting a running worker does nothing.
	///
	/// A worker with no bound queues stays idle, re-checking once per interval.
	#[instrument(skip(self), fields(worker = %self.inner.name))]
	pub async fn start(&self) {
		let mut running = self.running.lock().await;
		if running.is_some() {
			return;
		}

		let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
		self.inner.working.store(true, Ordering::SeqCst);
		let inner = Arc::clone(&self.inner);
		let handle = tokio::spawn(async move { inner.run(shutdown_rx).await });

		*running = Some(Running {
			shutdown_tx,
			handle,
		});
		info!(interval_ms = self.inner.config.interval.as_millis() as u64, "worker started");
	}

	/// Stop the poll loop and wait for it to exit.
	///
	/// A pending pause is cut short. A job being dispatched is allowed to
	/// settle first.
	#[instrument(skip(self), fields(worker = %self.inner.name))]
	pub async fn stop(&self) {
		self.inner.working.store(false, Ordering::SeqCst);

		let Some(running) = self.running.lock().await.take() else {
			return;
		};
		let _ = running.shutdown_tx.send(());
		if let Err(e) = running.handle.await {
			error!(error = %e, "worker task ended abnormally");
		}
		info!("worker stopped");
	}

	/// Claim and dispatch at most one job, trying each bound queue once.
	///
	/// Returns the job's final snapshot, or `None` when every queue was empty.
	pub async fn work_once(&self) -> Result<Option<JobRecord>> {
		let count = self.inner.queues.read().await.len();
		for _ in 0..count {
			let Some(queue) = self.inner.next_queue().await else {
				break;
			};
			if let Some(job) = self.inner.claim(&queue).await? {
				return Ok(Some(self.inner.dispatch(job).await));
			}
		}
		Ok(None)
	}
}

impl WorkerInner {
	fn emit(&self, event: WorkerEvent) {
		let _ = self.events.send(event);
	}

	fn emit_error(&self, err: &QueueError) {
		error!(worker = %self.name, error = %err, "job queue error");
		self.emit(WorkerEvent::Error {
			message: err.to_string(),
		});
	}

	async fn run(self: Arc<Self>, mut shutdown_rx: broadcast::Receiver<()>) {
		let mut empty = 0usize;

		while self.working.load(Ordering::SeqCst) {
			let bound = self.queues.read().await.len();
			let pause = match self.poll().await {
				PollOutcome::Worked => {
					empty = 0;
					false
				}
				PollOutcome::Empty => {
					empty += 1;
					if empty >= bound {
						empty = 0;
						true
					} else {
						false
					}
				}
				PollOutcome::Failed => true,
			};

			if pause {
				tokio::select! {
					_ = tokio::time::sleep(self.config.interval) => {}
					_ = shutdown_rx.recv() => break,
				}
			}
		}

		debug!(worker = %self.name, "poll loop exited");
		self.emit(WorkerEvent::Stopped {
			worker: self.name.clone(),
		});
	}

	async fn poll(&self) -> PollOutcome {
		let Some(queue) = self.next_queue().await else {
			return PollOutcome::Empty;
		};

		match self.claim(&queue).await {
			Ok(Some(job)) => {
				self.dispatch(job).await;
				PollOutcome::Worked
			}
			Ok(None) => PollOutcome::Empty,
			Err(err) => {
				self.emit_error(&err);
				PollOutcome::Failed
			}
		}
	}

	/// Rotate to the next bound queue.
	async fn next_queue(&self) -> Option<Queue> {
		let queues = self.queues.read().await;
		if queues.is_empty() {
			return None;
		}
		let mut cursor = self.cursor.lock().await;
		let queue = queues[*cursor % queues.len()].clone();
		*cursor = cursor.wrapping_add(1);
		Some(queue)
	}

	async fn claim(&self, queue: &Queue) -> Result<Option<JobRecord>> {
		let options = DequeueOptions {
			min_priority: self.config.min_priority,
			names: Some(self.handlers.read().await.names()),
		};

		match queue.dequeue(&options).await? {
			Some(job) => {
				debug!(worker = %self.name, job_id = ?job.id, name = %job.name, "job dequeued");
				self.emit(WorkerEvent::Dequeued(job.clone()));
				Ok(Some(job))
			}
			None => {
				self.emit(WorkerEvent::Empty {
					queue: queue.name().to_string(),
				});
				Ok(None)
			}
		}
	}

	/// Run a claimed job and record its outcome.
	#[instrument(skip(self, job), fields(worker = %self.name, job_id = ?job.id, name = %job.name))]
	async fn dispatch(&self, mut job: JobRecord) -> JobRecord {
		let repository = {
			let queues = self.queues.read().await;
			queues
				.iter()
				.find(|q| q.is_universal() || q.name() == job.queue)
				.or_else(|| queues.first())
				.map(|q| q.repository().clone())
		};
		let Some(repository) = repository else {
			self.emit_error(&QueueError::Internal(format!(
				"no bound queue for claimed job in {}",
				job.queue
			)));
			return job;
		};

		match self.execute(&job).await {
			Ok(_) if job.is_cron() => {
				debug!("cron run finished, row stays scheduled");
			}
			Ok(result) => match repository.complete(&mut job, result).await {
				Ok(()) => {
					debug!("job complete");
					self.emit(WorkerEvent::Complete(job.clone()));
				}
				Err(err) => self.emit_error(&err),
			},
			Err(failure) => self.retry(&repository, &mut job, failure).await,
		}

		job
	}

	/// Invoke the handler, racing it against the job's timeout.
	async fn execute(&self, job: &JobRecord) -> std::result::Result<Value, ErrorEnvelope> {
		let handler = self.handlers.read().await.get(&job.name);
		let Some(handler) = handler else {
			return Err(ErrorEnvelope::from(&QueueError::NoHandlerRegistered(
				job.name.clone(),
			)));
		};

		let params = job.params.clone();
		let task = tokio::spawn(async move { handler.handle(params).await });

		let joined = match job.timeout.filter(|ms| *ms > 0) {
			Some(ms) => match tokio::time::timeout(Duration::from_millis(ms), task).await {
				Ok(joined) => joined,
				Err(_) => {
					warn!(timeout_ms = ms, "job timed out, handler left running");
					return Err(ErrorEnvelope::from(&QueueError::Timeout(ms)));
				}
			},
			None => task.await,
		};

		match joined {
			Ok(Ok(value)) => Ok(value),
			Ok(Err(err)) => Err(ErrorEnvelope::new(err.to_string(), format!("{err:?}"))),
			Err(join_err) => Err(ErrorEnvelope::from(&QueueError::Handler(format!(
				"handler panicked: {join_err}"
			)))),
		}
	}

	/// Re-delay a failed job while attempts remain, otherwise fail it.
	async fn retry(&self, repository: &JobRepository, job: &mut JobRecord, error: ErrorEnvelope) {
		let remaining = job
			.retry
			.as_mut()
			.map(RetryPolicy::consume_attempt)
			.unwrap_or(0);

		if remaining > 0 {
			let wait_ms = match &job.retry {
				Some(retry) => self.strategies.read().await.wait_for(retry),
				None => 0,
			};
			warn!(remaining, wait_ms, error = %error.message, "job failed, retrying");

			match repository.delay(job, wait_ms).await {
				Ok(()) => self.emit(WorkerEvent::Retrying {
					job: job.clone(),
					error,
					wait_ms,
				}),
				Err(err) => self.emit_error(&err),
			}
			return;
		}

		if job.is_cron() {
			warn!(error = %error.message, "cron job exhausted its retries, keeping its schedule");
			if let Err(err) = repository.reset_retry_budget(job).await {
				self.emit_error(&err);
			}
			self.emit(WorkerEvent::Failed {
				job: job.clone(),
				error,
			});
			return;
		}

		match repository.fail(job, &error).await {
			Ok(()) => {
				warn!(error = %error.message, "job failed");
				self.emit(WorkerEvent::Failed {
					job: job.clone(),
					error,
				});
			}
			Err(err) => self.emit_error(&err),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::testing::{create_test_queue_pool, test_queue};
	use loom_jobqueue_core::{JobStatus, ResolvedOptions};
	use serde_json::json;
	use std::sync::atomic::AtomicUsize;

	fn fast() -> WorkerConfig {
		WorkerConfig {
			interval: Duration::from_millis(20),
			min_priority: None,
		}
	}

	#[tokio::test]
	async fn test_work_once_completes_job() {
		let pool = create_test_queue_pool().await;
		let queue = test_queue(&pool, "default");
		let worker = Worker::new("default", vec![queue.clone()], fast());

		let mut handlers = HandlerRegistry::new();
		handlers.register("math.add", |params: Vec<Value>| async move {
			let sum: i64 = params.iter().filter_map(Value::as_i64).sum();
			anyhow::Ok(json!(sum))
		});
		worker.register(handlers).await;

		queue
			.enqueue("math.add", vec![json!(2), json!(3)], ResolvedOptions::default())
			.await
			.unwrap();

		let job = worker.work_once().await.unwrap().unwrap();
		assert_eq!(job.status, JobStatus::Complete);
		assert_eq!(job.result, Some(json!(5)));
		assert!(worker.work_once().await.unwrap().is_none());
	}

	#[tokio::test]
	async fn test_unregistered_names_are_not_claimed() {
		let pool = create_test_queue_pool().await;
		let queue = test_queue(&pool, "default");
		let worker = Worker::new("default", vec![queue.clone()], fast());

		queue
			.enqueue("unknown.fn", vec![], ResolvedOptions::default())
			.await
			.unwrap();

		assert!(worker.work_once().await.unwrap().is_none());
		let stored = queue.list_all().await.unwrap();
		assert_eq!(stored[0].status, JobStatus::Queued);
	}

	#[tokio::test]
	async fn test_failure_without_retry_policy_fails_job() {
		let pool = create_test_queue_pool().await;
		let queue = test_queue(&pool, "default");
		let worker = Worker::new("default", vec![queue.clone()], fast());
		let mut events = worker.subscribe();

		let mut handlers = HandlerRegistry::new();
		handlers.register("mail.send", |_params: Vec<Value>| async move {
			Err::<Value, _>(anyhow::anyhow!("smtp unavailable"))
		});
		worker.register(handlers).await;

		queue
			.enqueue("mail.send", vec![], ResolvedOptions::default())
			.await
			.unwrap();

		let job = worker.work_once().await.unwrap().unwrap();
		assert_eq!(job.status, JobStatus::Failed);
		assert_eq!(job.result.as_ref().unwrap()["message"], json!("smtp unavailable"));

		assert_eq!(events.recv().await.unwrap().event_type(), "dequeued");
		assert_eq!(events.recv().await.unwrap().event_type(), "failed");
	}

	#[tokio::test]
	async fn test_cron_success_does_not_complete() {
		let pool = create_test_queue_pool().await;
		let queue = test_queue(&pool, "cron");
		let worker = Worker::new("cron", vec![queue.clone()], fast());
		let runs = Arc::new(AtomicUsize::new(0));

		let counter = Arc::clone(&runs);
		let mut handlers = HandlerRegistry::new();
		handlers.register("report.tick", move |_params: Vec<Value>| {
			let counter = Arc::clone(&counter);
			async move {
				counter.fetch_add(1, Ordering::SeqCst);
				anyhow::Ok(Value::Null)
			}
		});
		worker.register(handlers).await;

		queue
			.enqueue(
				"report.tick",
				vec![],
				ResolvedOptions {
					cron: Some("0 0 * * *".to_string()),
					..Default::default()
				},
			)
			.await
			.unwrap();

		let job = worker.work_once().await.unwrap().unwrap();
		assert_eq!(job.status, JobStatus::Queued);
		assert_eq!(runs.load(Ordering::SeqCst), 1);

		let stored = queue.get(job.id.unwrap()).await.unwrap().unwrap();
		assert_eq!(stored.status, JobStatus::Queued);
		assert!(stored.ended.is_none());
	}

	#[tokio::test]
	async fn test_start_stop_emits_stopped() {
		let pool = create_test_queue_pool().await;
		let queue = test_queue(&pool, "default");
		let worker = Worker::new("default", vec![queue], fast());
		let mut events = worker.subscribe();

		worker.start().await;
		assert!(worker.is_working());
		worker.start().await;
		worker.stop().await;
		assert!(!worker.is_working());

		loop {
			let event = events.recv().await.unwrap();
			if event.event_type() == "stopped" {
				break;
			}
			assert_eq!(event.event_type(), "empty");
		}
	}

	async fn two_queue_worker(interval: Duration) -> (Queue, Queue, Worker) {
		let pool = create_test_queue_pool().await;
		let alpha = test_queue(&pool, "alpha");
		let beta = test_queue(&pool, "beta");
		let worker = Worker::new(
			"pair",
			vec![alpha.clone(), beta.clone()],
			WorkerConfig {
				interval,
				min_priority: None,
			},
		);
		let mut handlers = HandlerRegistry::new();
		handlers.register("a.b", |params: Vec<Value>| async move { anyhow::Ok(json!(params)) });
		worker.register(handlers).await;
		(alpha, beta, worker)
	}

	#[tokio::test]
	async fn test_bound_queues_are_served_round_robin() {
		let (alpha, beta, worker) = two_queue_worker(Duration::from_millis(20)).await;
		for queue in [&alpha, &beta] {
			for i in 0..2 {
				let tag = json!(format!("{}-{i}", queue.name()));
				queue
					.enqueue("a.b", vec![tag], ResolvedOptions::default())
					.await
					.unwrap();
			}
		}

		let mut order = Vec::new();
		while let Some(job) = worker.work_once().await.unwrap() {
			order.push(job.params[0].as_str().unwrap().to_string());
		}
		assert_eq!(order, vec!["alpha-0", "beta-0", "alpha-1", "beta-1"]);
	}

	#[tokio::test]
	async fn test_poll_loop_alternates_between_queues() {
		let (alpha, beta, worker) = two_queue_worker(Duration::from_millis(20)).await;
		for queue in [&alpha, &beta] {
			for _ in 0..2 {
				queue
					.enqueue("a.b", vec![], ResolvedOptions::default())
					.await
					.unwrap();
			}
		}
		let mut events = worker.subscribe();

		worker.start().await;
		let claimed = tokio::time::timeout(Duration::from_secs(5), async {
			let mut claimed = Vec::new();
			while claimed.len() < 4 {
				if let WorkerEvent::Dequeued(job) = events.recv().await.unwrap() {
					claimed.push(job.queue);
				}
			}
			claimed
		})
		.await
		.unwrap();
		worker.stop().await;

		assert_eq!(claimed, vec!["alpha", "beta", "alpha", "beta"]);
	}

	#[tokio::test]
	async fn test_pause_only_after_every_queue_came_up_empty() {
		let interval = Duration::from_millis(200);
		let (_alpha, _beta, worker) = two_queue_worker(interval).await;
		let mut events = worker.subscribe();

		worker.start().await;
		let polls = tokio::time::timeout(Duration::from_secs(5), async {
			let mut polls = Vec::new();
			while polls.len() < 4 {
				if let WorkerEvent::Empty { queue } = events.recv().await.unwrap() {
					polls.push((queue, std::time::Instant::now()));
				}
			}
			polls
		})
		.await
		.unwrap();
		worker.stop().await;

		let queues: Vec<&str> = polls.iter().map(|(q, _)| q.as_str()).collect();
		assert_eq!(queues, vec!["alpha", "beta", "alpha", "beta"]);

		// No pause inside a rotation, one pause between rotations.
		let gap = |i: usize| polls[i + 1].1 - polls[i].1;
		assert!(gap(0) < Duration::from_millis(150));
		assert!(gap(1) >= Duration::from_millis(150));
		assert!(gap(2) < Duration::from_millis(150));
	}

	#[tokio::test]
	async fn test_idle_worker_picks_up_bound_queue() {
		let pool = create_test_queue_pool().await;
		let queue = test_queue(&pool, "late");
		let worker = Worker::new("late", vec![], fast());
		let mut events = worker.subscribe();

		let mut handlers = HandlerRegistry::new();
		handlers.register("a.b", |_params: Vec<Value>| async move { anyhow::Ok(json!("ok")) });
		worker.register(handlers).await;
		queue
			.enqueue("a.b", vec![], ResolvedOptions::default())
			.await
			.unwrap();

		worker.start().await;
		tokio::time::sleep(Duration::from_millis(50)).await;
		worker.bind(queue.clone()).await;

		let complete = tokio::time::timeout(Duration::from_secs(5), async {
			loop {
				if let WorkerEvent::Complete(job) = events.recv().await.unwrap() {
					return job;
				}
			}
		})
		.await
		.unwrap();
		worker.stop().await;

		assert_eq!(complete.result, Some(json!("ok")));
		assert_eq!(worker.queue_names().await, vec!["late"]);
	}
}
