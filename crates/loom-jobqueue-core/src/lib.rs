// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Core types for the Loom persistent job queue.
//!
//! This crate holds everything about a job that does not touch storage:
//! - [`JobRecord`] and its status lifecycle
//! - Duration and retry option parsing
//! - Backoff strategies used between retry attempts
//! - Per-call [`JobOptions`] and their resolution against configured defaults
//! - [`WorkerEvent`], the lifecycle events a worker publishes

pub mod error;
pub mod event;
pub mod job;
pub mod options;
pub mod retry;

pub use error::{CoreError, Result};
pub use event::WorkerEvent;
pub use job::{millis_after, now_millis, ErrorEnvelope, JobId, JobRecord, JobStatus, JobSummary};
pub use options::{JobDefaults, JobOptions, ResolvedOptions, RetryOptions};
pub use retry::{
	exponential, linear, parse_delay, parse_retry, parse_timeout, BackoffStrategies, DurationSpec,
	RetryCount, RetryPolicy, EXPONENTIAL, LINEAR,
};
