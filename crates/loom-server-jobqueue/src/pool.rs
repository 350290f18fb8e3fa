// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqliteSynchronous};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use crate::error::QueueError;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Create a SqlitePool with WAL mode and common settings.
///
/// Several worker processes may share one database file, so connections wait on
/// a busy timeout instead of failing immediately on a locked database. The
/// parent directory of a file-backed database is created if missing.
///
/// # Arguments
/// * `database_url` - SQLite connection string (e.g., "sqlite:./.data/jobqueue.db")
///
/// # Errors
/// Returns `QueueError::Internal` if the URL is invalid or the directory cannot be
/// created, and `QueueError::Database` if the connection fails.
#[tracing::instrument(skip(database_url))]
pub async fn create_pool(database_url: &str) -> Result<SqlitePool, QueueError> {
	let options = SqliteConnectOptions::from_str(database_url)
		.map_err(|e| QueueError::Internal(format!("Invalid database URL: {e}")))?
		.journal_mode(SqliteJournalMode::Wal)
		.synchronous(SqliteSynchronous::Normal)
		.busy_timeout(BUSY_TIMEOUT)
		.create_if_missing(true);

	ensure_parent_dir(options.get_filename())?;

	let pool = SqlitePool::connect_with(options).await?;

	tracing::debug!("database pool created");
	Ok(pool)
}

fn ensure_parent_dir(filename: &Path) -> Result<(), QueueError> {
	if filename.as_os_str() == ":memory:" {
		return Ok(());
	}
	match filename.parent() {
		Some(parent) if !parent.as_os_str().is_empty() && !parent.exists() => {
			std::fs::create_dir_all(parent).map_err(|e| {
				QueueError::Internal(format!(
					"failed to create database directory {}: {e}",
					parent.display()
				))
			})
		}
		_ => Ok(()),
	}
}
