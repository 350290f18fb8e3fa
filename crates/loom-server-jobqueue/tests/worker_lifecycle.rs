// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! End-to-end worker behavior against an in-memory queue with short intervals.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use loom_jobqueue_core::{ResolvedOptions, EXPONENTIAL, LINEAR};
use loom_server_jobqueue::testing::{create_test_queue_pool, test_queue};
use loom_server_jobqueue::{
	HandlerRegistry, JobRecord, JobStatus, Queue, RetryPolicy, Worker, WorkerConfig, WorkerEvent,
};
use serde_json::{json, Value};
use tokio::sync::broadcast;

// Stored times are whole milliseconds, so measured gaps allow a few ms of slack.
fn fast() -> WorkerConfig {
	WorkerConfig {
		interval: Duration::from_millis(10),
		min_priority: None,
	}
}

async fn setup(queue_name: &str) -> (Queue, Worker) {
	let pool = create_test_queue_pool().await;
	let queue = test_queue(&pool, queue_name);
	let worker = Worker::new(queue_name, vec![queue.clone()], fast());
	(queue, worker)
}

/// Register a handler that records each invocation and fails with its ordinal.
fn failing_handler(name: &str, calls: Arc<Mutex<Vec<Instant>>>) -> HandlerRegistry {
	let mut handlers = HandlerRegistry::new();
	handlers.register(name, move |_params: Vec<Value>| {
		let calls = Arc::clone(&calls);
		async move {
			let attempt = {
				let mut calls = calls.lock().unwrap();
				calls.push(Instant::now());
				calls.len()
			};
			Err::<Value, _>(anyhow::anyhow!("attempt {attempt} failed"))
		}
	});
	handlers
}

async fn wait_for_failed(events: &mut broadcast::Receiver<WorkerEvent>) -> JobRecord {
	tokio::time::timeout(Duration::from_secs(10), async {
		loop {
			if let WorkerEvent::Failed { job, .. } = events.recv().await.unwrap() {
				return job;
			}
		}
	})
	.await
	.expect("job never failed")
}

fn retrying(count: u32, delay_ms: u64, strategy: &str) -> ResolvedOptions {
	ResolvedOptions {
		retry: Some(RetryPolicy::new(count).with_delay(delay_ms).with_strategy(strategy)),
		..Default::default()
	}
}

#[tokio::test]
async fn linear_retry_runs_handler_count_times() {
	let (queue, worker) = setup("default").await;
	let calls = Arc::new(Mutex::new(Vec::new()));
	worker
		.register(failing_handler("flaky.call", Arc::clone(&calls)))
		.await;
	let mut events = worker.subscribe();

	let job = queue
		.enqueue("flaky.call", vec![], retrying(3, 100, LINEAR))
		.await
		.unwrap();
	worker.start().await;
	let failed = wait_for_failed(&mut events).await;
	worker.stop().await;

	let calls = calls.lock().unwrap().clone();
	assert_eq!(calls.len(), 3);
	for gap in calls.windows(2) {
		assert!(gap[1] - gap[0] >= Duration::from_millis(95));
	}

	assert_eq!(failed.id, job.id);
	let stored = queue.get(job.id.unwrap()).await.unwrap().unwrap();
	assert_eq!(stored.status, JobStatus::Failed);
	assert_eq!(
		stored.result.unwrap()["message"],
		json!("attempt 3 failed")
	);
	assert!(stored.ended.is_some());
}

#[tokio::test]
async fn exponential_retry_waits_grow() {
	let (queue, worker) = setup("default").await;
	let calls = Arc::new(Mutex::new(Vec::new()));
	worker
		.register(failing_handler("flaky.call", Arc::clone(&calls)))
		.await;
	let mut events = worker.subscribe();

	queue
		.enqueue("flaky.call", vec![], retrying(3, 100, EXPONENTIAL))
		.await
		.unwrap();
	worker.start().await;
	wait_for_failed(&mut events).await;
	worker.stop().await;

	let calls = calls.lock().unwrap().clone();
	assert_eq!(calls.len(), 3);
	let first = calls[1] - calls[0];
	let second = calls[2] - calls[1];
	assert!(first >= Duration::from_millis(95));
	assert!(second >= Duration::from_millis(195));
	assert!(second > first);
}

#[tokio::test]
async fn custom_strategy_controls_wait() {
	let (queue, worker) = setup("default").await;
	let calls = Arc::new(Mutex::new(Vec::new()));
	worker
		.register(failing_handler("flaky.call", Arc::clone(&calls)))
		.await;
	worker
		.register_strategy("fixed", |_retry: &RetryPolicy| 150)
		.await;
	let mut events = worker.subscribe();

	queue
		.enqueue("flaky.call", vec![], retrying(2, 1, "fixed"))
		.await
		.unwrap();
	worker.start().await;

	let wait_ms = tokio::time::timeout(Duration::from_secs(5), async {
		loop {
			if let WorkerEvent::Retrying { wait_ms, .. } = events.recv().await.unwrap() {
				return wait_ms;
			}
		}
	})
	.await
	.unwrap();
	wait_for_failed(&mut events).await;
	worker.stop().await;

	assert_eq!(wait_ms, 150);
	let calls = calls.lock().unwrap().clone();
	assert_eq!(calls.len(), 2);
	assert!(calls[1] - calls[0] >= Duration::from_millis(145));
}

#[tokio::test]
async fn timeout_fails_job_even_if_handler_finishes_later() {
	let (queue, worker) = setup("default").await;
	let mut handlers = HandlerRegistry::new();
	handlers.register("slow.call", |_params: Vec<Value>| async move {
		tokio::time::sleep(Duration::from_millis(300)).await;
		anyhow::Ok(json!("late"))
	});
	worker.register(handlers).await;

	let job = queue
		.enqueue(
			"slow.call",
			vec![],
			ResolvedOptions {
				timeout: Some(50),
				..Default::default()
			},
		)
		.await
		.unwrap();

	let done = worker.work_once().await.unwrap().unwrap();
	assert_eq!(done.status, JobStatus::Failed);
	assert_eq!(
		done.result.as_ref().unwrap()["message"],
		json!("job timed out after 50ms")
	);

	tokio::time::sleep(Duration::from_millis(400)).await;
	let stored = queue.get(job.id.unwrap()).await.unwrap().unwrap();
	assert_eq!(stored.status, JobStatus::Failed);
}

#[tokio::test]
async fn delayed_job_is_not_run_early() {
	let (queue, worker) = setup("default").await;
	let ran_at = Arc::new(Mutex::new(None));
	let slot = Arc::clone(&ran_at);
	let mut handlers = HandlerRegistry::new();
	handlers.register("later.call", move |_params: Vec<Value>| {
		let slot = Arc::clone(&slot);
		async move {
			*slot.lock().unwrap() = Some(Instant::now());
			anyhow::Ok(Value::Null)
		}
	});
	worker.register(handlers).await;
	let mut events = worker.subscribe();

	let enqueued_at = Instant::now();
	queue
		.enqueue(
			"later.call",
			vec![],
			ResolvedOptions {
				delay: 250,
				..Default::default()
			},
		)
		.await
		.unwrap();
	worker.start().await;

	tokio::time::timeout(Duration::from_secs(5), async {
		loop {
			if let WorkerEvent::Complete(_) = events.recv().await.unwrap() {
				return;
			}
		}
	})
	.await
	.unwrap();
	worker.stop().await;

	let ran_at = ran_at.lock().unwrap().unwrap();
	assert!(ran_at - enqueued_at >= Duration::from_millis(245));
}

#[tokio::test]
async fn cron_job_reruns_and_never_completes() {
	let (queue, worker) = setup("cron").await;
	let calls = Arc::new(Mutex::new(Vec::new()));
	worker
		.register(failing_handler("report.tick", Arc::clone(&calls)))
		.await;
	let mut events = worker.subscribe();

	let options = ResolvedOptions {
		cron: Some("* * * * *".to_string()),
		retry: Some(RetryPolicy::new(2)),
		..Default::default()
	};
	let first = queue
		.enqueue("report.tick", vec![json!("daily")], options.clone())
		.await
		.unwrap();
	let again = queue
		.enqueue("report.tick", vec![json!("daily")], options)
		.await
		.unwrap();
	assert_eq!(first.id, again.id);

	worker.start().await;
	let failed = wait_for_failed(&mut events).await;
	worker.stop().await;

	// Two attempts, then the row goes back on its schedule.
	assert_eq!(calls.lock().unwrap().len(), 2);
	assert_eq!(failed.status, JobStatus::Queued);

	let stored = queue.get(first.id.unwrap()).await.unwrap().unwrap();
	assert_eq!(stored.status, JobStatus::Queued);
	assert!(stored.ended.is_none());
	assert!(stored.delay.unwrap() > first.delay.unwrap());
	assert_eq!(stored.retry.unwrap().remaining, None);
	assert_eq!(queue.list_all().await.unwrap().len(), 1);
}

#[tokio::test]
async fn retry_failed_job_runs_again() {
	let (queue, worker) = setup("default").await;
	let calls = Arc::new(Mutex::new(Vec::new()));
	worker
		.register(failing_handler("flaky.call", Arc::clone(&calls)))
		.await;

	let job = queue
		.enqueue("flaky.call", vec![], ResolvedOptions::default())
		.await
		.unwrap();
	let failed = worker.work_once().await.unwrap().unwrap();
	assert_eq!(failed.status, JobStatus::Failed);

	let requeued = queue.retry_failed_job(job.id.unwrap()).await.unwrap();
	assert_eq!(requeued.status, JobStatus::Queued);

	let again = worker.work_once().await.unwrap().unwrap();
	assert_eq!(again.id, job.id);
	assert_eq!(calls.lock().unwrap().len(), 2);
	assert_eq!(again.result.unwrap()["message"], json!("attempt 2 failed"));
}
