// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Persistent job queue for Loom.
//!
//! Jobs live in one SQLite table shared by any number of logical queues.
//! Workers poll their bound queues, claim ready rows with a conditional update
//! so concurrent pollers never take the same row, and run the registered
//! handler for each claimed job. Failed jobs are re-delayed per their retry
//! policy; cron jobs are rescheduled in place instead of completing.
//!
//! ```no_run
//! use loom_server_jobqueue::{
//! 	load_config_from_env, EnqueueRequest, HandlerRegistry, JobQueueEngine, DEFAULT_QUEUE,
//! };
//!
//! # async fn run() -> anyhow::Result<()> {
//! let engine = JobQueueEngine::connect(load_config_from_env()?).await?;
//!
//! let mut handlers = HandlerRegistry::new();
//! handlers.register("mail.send", |params: Vec<serde_json::Value>| async move {
//! 	anyhow::Ok(serde_json::json!({ "sent": params.len() }))
//! });
//! engine.spawn_worker(DEFAULT_QUEUE, handlers).await;
//!
//! engine
//! 	.client()
//! 	.submit(EnqueueRequest::call("mail", "send").arg("a@example.com"))
//! 	.await?;
//!
//! engine.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod config;
pub mod engine;
pub mod error;
pub mod handler;
pub mod pool;
pub mod queue;
pub mod repository;
pub mod schedule;
pub mod schema;
pub mod testing;
pub mod worker;

pub use client::{EnqueueRequest, JobClient};
pub use config::{
	load_config, load_config_from_env, ConfigError, ConfigSource, DefaultsConfigLayer,
	DefaultsSource, EnvSource, JobQueueConfig, JobQueueConfigLayer, Precedence, TomlSource,
};
pub use engine::{JobQueueEngine, RetryOutcome, CRON_QUEUE, DEFAULT_QUEUE, UNIVERSAL_QUEUE};
pub use error::{QueueError, Result};
pub use handler::{typed, HandlerRegistry, JobHandler, Typed};
pub use pool::create_pool;
pub use queue::{DequeueOptions, Queue, QueueOptions};
pub use repository::JobRepository;
pub use schedule::{next_fire, parse_schedule};
pub use schema::{bootstrap_schema, TableName, DEFAULT_TABLE};
pub use worker::{Worker, WorkerConfig, DEFAULT_POLL_INTERVAL};

pub use loom_jobqueue_core::{
	JobId, JobOptions, JobRecord, JobStatus, JobSummary, RetryOptions, RetryPolicy, WorkerEvent,
};
