// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use anyhow::{bail, Context};
use clap::{Args, Subcommand};
use serde_json::Value;
use std::sync::Arc;
use tracing::{info, instrument};

use loom_jobqueue_core::{JobId, JobOptions, JobStatus, JobSummary, RetryOptions};
use loom_server_jobqueue::{EnqueueRequest, JobQueueEngine, DEFAULT_QUEUE};

#[derive(Debug, Subcommand)]
pub enum Command {
	/// List jobs across every known queue
	List(ListArgs),
	/// Re-queue a failed job
	Retry {
		/// Job id
		id: JobId,
	},
	/// Delete a job
	Delete {
		/// Job id
		id: JobId,
	},
	/// Cancel a queued job
	Cancel {
		/// Job id
		id: JobId,
	},
	/// Enqueue a call to `module.function`
	Enqueue(EnqueueArgs),
	/// Remove jobs from one queue in bulk
	Purge(PurgeArgs),
	/// Show version information
	Version,
}

#[derive(Debug, Clone, Args)]
pub struct ListArgs {
	/// Only show jobs in this status
	#[arg(long)]
	pub status: Option<JobStatus>,

	/// Print JSON instead of a table
	#[arg(long)]
	pub json: bool,
}

#[derive(Debug, Clone, Args)]
pub struct EnqueueArgs {
	/// Handler key, e.g. `mail.send`
	pub name: String,

	/// Positional arguments. Each is parsed as JSON, falling back to a string.
	pub args: Vec<String>,

	/// Delay before the first run, e.g. `30s` or `5m`
	#[arg(long)]
	pub delay: Option<String>,

	/// Per-run timeout, e.g. `10s`
	#[arg(long)]
	pub timeout: Option<String>,

	#[arg(long, allow_negative_numbers = true)]
	pub priority: Option<i64>,

	/// Cron expression (5 or 6 fields, UTC)
	#[arg(long)]
	pub cron: Option<String>,

	/// Total attempts before the job fails
	#[arg(long)]
	pub retries: Option<u32>,

	/// Base wait between attempts
	#[arg(long)]
	pub retry_delay: Option<String>,

	/// Backoff strategy name (`linear` or `exponential`)
	#[arg(long)]
	pub strategy: Option<String>,

	/// Target queue. Defaults to `cron` for cron jobs, else `default`.
	#[arg(long)]
	pub queue: Option<String>,
}

#[derive(Debug, Clone, Args)]
pub struct PurgeArgs {
	#[arg(long, default_value = DEFAULT_QUEUE)]
	pub queue: String,

	/// Remove jobs in this status
	#[arg(long, conflicts_with_all = ["cron", "name", "all"])]
	pub status: Option<JobStatus>,

	/// Remove every cron job
	#[arg(long, conflicts_with_all = ["name", "all"])]
	pub cron: bool,

	/// Remove every job with this handler key
	#[arg(long, conflicts_with = "all")]
	pub name: Option<String>,

	/// Remove every job in the queue
	#[arg(long)]
	pub all: bool,
}

/// Parse a command line argument as JSON, keeping bare words as strings.
pub fn parse_arg(raw: &str) -> Value {
	serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

impl EnqueueArgs {
	pub fn into_request(self) -> EnqueueRequest {
		let mut options = JobOptions::new();
		if let Some(delay) = self.delay {
			options = options.delay(delay);
		}
		if let Some(timeout) = self.timeout {
			options = options.timeout(timeout);
		}
		if let Some(priority) = self.priority {
			options = options.priority(priority);
		}
		if let Some(cron) = self.cron {
			options = options.cron(cron);
		}
		if self.retries.is_some() || self.retry_delay.is_some() || self.strategy.is_some() {
			options = options.retry(RetryOptions {
				count: self.retries.map(Into::into),
				delay: self.retry_delay.map(Into::into),
				strategy: self.strategy,
			});
		}

		let mut request = EnqueueRequest::new(self.name)
			.args(self.args.iter().map(|raw| parse_arg(raw)).collect())
			.options(options);
		if let Some(queue) = self.queue {
			request = request.queue(queue);
		}
		request
	}
}

fn print_table(jobs: &[JobSummary]) {
	println!(
		"{:>6}  {:<10}  {:<10}  {:>4}  {:<24}  {}",
		"ID", "QUEUE", "STATUS", "PRI", "NAME", "CRON"
	);
	for job in jobs {
		println!(
			"{:>6}  {:<10}  {:<10}  {:>4}  {:<24}  {}",
			job.id,
			job.queue,
			job.status,
			job.priority,
			job.name,
			job.cron.as_deref().unwrap_or("-")
		);
	}
}

#[instrument(skip(engine))]
pub async fn run(engine: &Arc<JobQueueEngine>, command: Command) -> anyhow::Result<()> {
	match command {
		Command::List(args) => {
			let jobs: Vec<JobSummary> = engine
				.list_jobs()
				.await?
				.into_iter()
				.filter(|job| args.status.map_or(true, |status| job.status == status))
				.collect();
			if args.json {
				println!("{}", serde_json::to_string_pretty(&jobs)?);
			} else {
				print_table(&jobs);
			}
		}
		Command::Retry { id } => {
			let outcome = engine
				.retry_job(id)
				.await
				.with_context(|| format!("could not retry job {id}"))?;
			println!("job {id} re-queued on {}", outcome.queue);
		}
		Command::Delete { id } => {
			engine
				.delete_job(id)
				.await
				.with_context(|| format!("could not delete job {id}"))?;
			println!("job {id} deleted");
		}
		Command::Cancel { id } => {
			let job = engine
				.cancel_job(id)
				.await
				.with_context(|| format!("could not cancel job {id}"))?;
			println!("job {id} {}", job.status);
		}
		Command::Enqueue(args) => {
			let job = engine.client().submit(args.into_request()).await?;
			info!(job_id = ?job.id, queue = %job.queue, "job enqueued");
			println!("{}", serde_json::to_string_pretty(&job)?);
		}
		Command::Purge(args) => {
			let queue = engine.queue_or_create(&args.queue).await;
			let removed = if let Some(status) = args.status {
				queue.remove_by_status(status).await?
			} else if args.cron {
				queue.remove_all_cron().await?
			} else if let Some(name) = &args.name {
				queue.remove_by_name(name).await?
			} else if args.all {
				queue.remove_all().await?
			} else {
				bail!("purge needs one of --status, --cron, --name or --all");
			};
			println!("removed {removed} job(s) from {}", args.queue);
		}
		Command::Version => run_version()?,
	}
	Ok(())
}

pub fn run_version() -> anyhow::Result<()> {
	println!("loom-jobqueue {}", env!("CARGO_PKG_VERSION"));
	Ok(())
}
