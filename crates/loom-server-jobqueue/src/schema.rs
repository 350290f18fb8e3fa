// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Job table schema bootstrap.

use sqlx::SqlitePool;
use std::fmt;

use crate::error::{QueueError, Result};

pub const DEFAULT_TABLE: &str = "jobs";

/// A validated SQL identifier naming a job table.
///
/// Table names are interpolated into statements, so only
/// `[A-Za-z_][A-Za-z0-9_]*` is accepted.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TableName(String);

impl TableName {
	pub fn new(name: impl Into<String>) -> Result<Self> {
		let name = name.into();
		let mut chars = name.chars();
		let valid = match chars.next() {
			Some(first) if first.is_ascii_alphabetic() || first == '_' => {
				chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
			}
			_ => false,
		};
		if !valid {
			return Err(QueueError::InvalidTableName(name));
		}
		Ok(Self(name))
	}

	pub fn as_str(&self) -> &str {
		&self.0
	}
}

impl Default for TableName {
	fn default() -> Self {
		Self(DEFAULT_TABLE.to_string())
	}
}

impl fmt::Display for TableName {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

/// Create the job table and its claim index if they do not exist.
///
/// Safe to call on every startup.
#[tracing::instrument(skip(pool), fields(table = %table))]
pub async fn bootstrap_schema(pool: &SqlitePool, table: &TableName) -> Result<()> {
	sqlx::query(&format!(
		r#"
		CREATE TABLE IF NOT EXISTS {table} (
			id INTEGER PRIMARY KEY AUTOINCREMENT,
			name TEXT NOT NULL,
			params TEXT NOT NULL DEFAULT '[]',
			queue TEXT NOT NULL,
			retry TEXT,
			timeout INTEGER,
			delay INTEGER,
			cron TEXT,
			priority INTEGER NOT NULL DEFAULT 0,
			status TEXT NOT NULL,
			enqueued INTEGER,
			dequeued INTEGER,
			ended INTEGER,
			result TEXT,
			created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
			updated_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
		)
		"#
	))
	.execute(pool)
	.await?;

	sqlx::query(&format!(
		"CREATE INDEX IF NOT EXISTS idx_{table}_status_queue_priority ON {table} (status, queue, priority)"
	))
	.execute(pool)
	.await?;

	tracing::debug!("job table ready");
	Ok(())
}
