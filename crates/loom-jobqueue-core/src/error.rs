// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Error types for job option parsing.

use thiserror::Error;

/// Result type for core job queue operations.
pub type Result<T> = std::result::Result<T, CoreError>;

/// Errors that can occur while interpreting job options.
#[derive(Debug, Error)]
pub enum CoreError {
	#[error("invalid duration: {0}")]
	InvalidDuration(String),
}
