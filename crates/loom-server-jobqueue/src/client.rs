// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Enqueue facade: build a request for `module.function(args)` and submit it.

use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use tracing::instrument;

use loom_jobqueue_core::{JobOptions, JobRecord};

use crate::engine::{JobQueueEngine, CRON_QUEUE, DEFAULT_QUEUE};
use crate::error::Result;

/// A call to enqueue: handler key, positional arguments and options.
#[derive(Debug, Clone, PartialEq)]
pub struct EnqueueRequest {
	pub name: String,
	pub args: Vec<Value>,
	pub options: JobOptions,
	/// Target queue. Defaults to `cron` for cron requests and `default` otherwise.
	pub queue: Option<String>,
}

impl EnqueueRequest {
	pub fn new(name: impl Into<String>) -> Self {
		Self {
			name: name.into(),
			args: Vec::new(),
			options: JobOptions::default(),
			queue: None,
		}
	}

	/// Request for `module.function`.
	pub fn call(module: &str, function: &str) -> Self {
		Self::new(format!("{module}.{function}"))
	}

	pub fn arg(mut self, value: impl Into<Value>) -> Self {
		self.args.push(value.into());
		self
	}

	/// Append any serializable argument.
	pub fn try_arg<T: Serialize>(mut self, value: &T) -> serde_json::Result<Self> {
		self.args.push(serde_json::to_value(value)?);
		Ok(self)
	}

	pub fn args(mut self, args: Vec<Value>) -> Self {
		self.args = args;
		self
	}

	pub fn options(mut self, options: JobOptions) -> Self {
		self.options = options;
		self
	}

	pub fn queue(mut self, queue: impl Into<String>) -> Self {
		self.queue = Some(queue.into());
		self
	}
}

#[derive(Clone)]
pub struct JobClient {
	engine: Arc<JobQueueEngine>,
}

impl JobClient {
	pub fn new(engine: Arc<JobQueueEngine>) -> Self {
		Self { engine }
	}

	/// Resolve the request's options and enqueue it.
	///
	/// Options resolve once, here: values on the request, then the configured
	/// `defaults.job` or `defaults.cron`, then the built-in fallbacks.
	#[instrument(skip(self, request), fields(name = %request.name))]
	pub async fn submit(&self, request: EnqueueRequest) -> Result<JobRecord> {
		let config = self.engine.config();
		let is_cron = request.options.is_cron();
		let defaults = if is_cron {
			&config.cron_defaults
		} else {
			&config.job_defaults
		};
		let resolved = request.options.resolve(defaults)?;

		let queue_name = request.queue.as_deref().unwrap_or(if is_cron {
			CRON_QUEUE
		} else {
			DEFAULT_QUEUE
		});
		let queue = self.engine.queue_or_create(queue_name).await;

		queue.enqueue(&request.name, request.args, resolved).await
	}
}
