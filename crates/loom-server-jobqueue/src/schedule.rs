// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Next-run calculation for cron jobs.
//!
//! Schedules are evaluated in UTC.

use chrono::{DateTime, TimeZone, Utc};
use cron::Schedule;
use std::str::FromStr;

use crate::error::{QueueError, Result};

/// Convert a standard Unix cron expression to the 7-field format expected by
/// the `cron` crate.
///
/// 5-field format: minute hour day-of-month month day-of-week
/// 6-field format: second minute hour day-of-month month day-of-week
/// 7-field format: second minute hour day-of-month month day-of-week year
///
/// Unix day-of-week numbers run 0-6 from Sunday (7 is also Sunday) while the
/// `cron` crate numbers them 1-7 from Sunday, so the field is renumbered for
/// the 5- and 6-field forms. 7-field expressions are passed through as-is.
fn convert_to_cron_crate_format(expression: &str) -> String {
	let mut fields: Vec<String> = expression.split_whitespace().map(str::to_string).collect();
	match fields.len() {
		5 => {
			fields[4] = renumber_day_of_week(&fields[4]);
			format!("0 {} *", fields.join(" "))
		}
		6 => {
			fields[5] = renumber_day_of_week(&fields[5]);
			fields.join(" ")
		}
		_ => expression.trim().to_string(),
	}
}

fn renumber_day_of_week(field: &str) -> String {
	field
		.split(',')
		.map(renumber_day_of_week_item)
		.collect::<Vec<_>>()
		.join(",")
}

/// Renumber one list item: `n`, `a-b`, either with a `/step`. Names and `*`
/// are left alone.
fn renumber_day_of_week_item(item: &str) -> String {
	let (base, step) = match item.split_once('/') {
		Some((base, step)) => (base, Some(step)),
		None => (item, None),
	};
	let with_step = |base: String| match step {
		Some(step) => format!("{base}/{step}"),
		None => base,
	};

	match base.split_once('-') {
		Some((start, end)) => match (start.parse::<u8>(), end.parse::<u8>()) {
			// A range ending on Sunday-as-7 wraps onto the crate's Sunday (1).
			(Ok(start), Ok(7)) if start > 0 && start <= 7 && step.is_none() => {
				if start == 7 {
					"1".to_string()
				} else {
					format!("{}-7,1", start + 1)
				}
			}
			(Ok(start), Ok(end)) if start <= 6 && end <= 6 => {
				with_step(format!("{}-{}", start + 1, end + 1))
			}
			_ => item.to_string(),
		},
		None => match base.parse::<u8>() {
			Ok(7) => with_step("1".to_string()),
			Ok(day) if day <= 6 => with_step((day + 1).to_string()),
			_ => item.to_string(),
		},
	}
}

/// Parse a cron expression, accepting 5, 6 or 7 fields.
pub fn parse_schedule(expression: &str) -> Result<Schedule> {
	Schedule::from_str(&convert_to_cron_crate_format(expression))
		.map_err(|e| QueueError::InvalidCronExpression(format!("{expression}: {e}")))
}

/// The next fire time strictly after `after_ms`, in epoch milliseconds.
///
/// # Errors
///
/// Returns `QueueError::InvalidCronExpression` if the expression does not parse
/// or never fires again.
pub fn next_fire(expression: &str, after_ms: i64) -> Result<i64> {
	let schedule = parse_schedule(expression)?;
	let after: DateTime<Utc> = Utc
		.timestamp_millis_opt(after_ms)
		.single()
		.ok_or_else(|| QueueError::Internal(format!("timestamp out of range: {after_ms}")))?;

	schedule
		.after(&after)
		.next()
		.map(|next| next.timestamp_millis())
		.ok_or_else(|| {
			QueueError::InvalidCronExpression(format!("{expression}: no upcoming fire time"))
		})
}
