// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! `loom-jobqueue`: inspect and administer a Loom job database.

use clap::Parser;
use std::path::PathBuf;

use loom_server_jobqueue::{load_config, JobQueueEngine};

mod commands;

use commands::Command;

#[derive(Parser, Debug)]
#[command(name = "loom-jobqueue", about = "Loom job queue administration", version)]
struct Args {
	/// TOML configuration file
	#[arg(long, env = "LOOM_JOBQUEUE_CONFIG")]
	config: Option<PathBuf>,

	/// Database URL, overriding configuration
	#[arg(long)]
	database_url: Option<String>,

	#[command(subcommand)]
	command: Command,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	let args = Args::parse();

	if let Command::Version = args.command {
		return commands::run_version();
	}

	dotenvy::dotenv().ok();

	tracing_subscriber::fmt()
		.with_env_filter(
			tracing_subscriber::EnvFilter::try_from_default_env()
				.unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
		)
		.with_writer(std::io::stderr)
		.init();

	let mut config = load_config(args.config)?;
	if let Some(url) = args.database_url {
		config.database_url = url;
	}
	tracing::debug!(database = %config.database_url, table = %config.table, "opening job database");

	let engine = JobQueueEngine::connect(config).await?;
	let result = commands::run(&engine, args.command).await;
	engine.shutdown().await;
	result
}

#[cfg(test)]
mod tests {
	use super::*;
	use clap::CommandFactory;
	use loom_jobqueue_core::{JobId, JobStatus};

	#[test]
	fn test_cli_definition_is_valid() {
		Args::command().debug_assert();
	}

	#[test]
	fn test_parse_retry() {
		let args = Args::try_parse_from(["loom-jobqueue", "retry", "42"]).unwrap();
		assert!(matches!(args.command, Command::Retry { id } if id == JobId(42)));
	}

	#[test]
	fn test_parse_list_status() {
		let args = Args::try_parse_from(["loom-jobqueue", "list", "--status", "failed"]).unwrap();
		match args.command {
			Command::List(list) => assert_eq!(list.status, Some(JobStatus::Failed)),
			other => panic!("unexpected command {other:?}"),
		}
		assert!(Args::try_parse_from(["loom-jobqueue", "list", "--status", "bogus"]).is_err());
	}

	#[test]
	fn test_parse_enqueue() {
		let args = Args::try_parse_from([
			"loom-jobqueue",
			"--database-url",
			"sqlite::memory:",
			"enqueue",
			"mail.send",
			"a@example.com",
			"--priority",
			"-1",
			"--cron",
			"0 6 * * *",
		])
		.unwrap();
		assert_eq!(args.database_url.as_deref(), Some("sqlite::memory:"));
		match args.command {
			Command::Enqueue(enqueue) => {
				assert_eq!(enqueue.name, "mail.send");
				assert_eq!(enqueue.args, vec!["a@example.com"]);
				assert_eq!(enqueue.priority, Some(-1));
				assert_eq!(enqueue.cron.as_deref(), Some("0 6 * * *"));
			}
			other => panic!("unexpected command {other:?}"),
		}
	}

	#[test]
	fn test_purge_flags_conflict() {
		assert!(
			Args::try_parse_from(["loom-jobqueue", "purge", "--status", "failed", "--all"]).is_err()
		);
		let args = Args::try_parse_from(["loom-jobqueue", "purge", "--cron", "--queue", "cron"]).unwrap();
		match args.command {
			Command::Purge(purge) => {
				assert!(purge.cron);
				assert_eq!(purge.queue, "cron");
			}
			other => panic!("unexpected command {other:?}"),
		}
	}
}
