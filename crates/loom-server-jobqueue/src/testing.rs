// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Test helpers for building in-memory job queues.

use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};

use crate::queue::{Queue, QueueOptions};
use crate::schema::{bootstrap_schema, TableName};

/// A single-connection in-memory pool.
///
/// Every connection to `sqlite::memory:` opens its own database, so the pool is
/// pinned to one connection that is never recycled.
pub async fn create_test_pool() -> SqlitePool {
	SqlitePoolOptions::new()
		.max_connections(1)
		.idle_timeout(None)
		.max_lifetime(None)
		.connect("sqlite::memory:")
		.await
		.unwrap()
}

/// An in-memory pool with the default job table already created.
pub async fn create_test_queue_pool() -> SqlitePool {
	let pool = create_test_pool().await;
	bootstrap_schema(&pool, &TableName::default()).await.unwrap();
	pool
}

/// A queue named `name` over the default table of `pool`.
pub fn test_queue(pool: &SqlitePool, name: &str) -> Queue {
	Queue::new(pool.clone(), name, QueueOptions::default())
}
