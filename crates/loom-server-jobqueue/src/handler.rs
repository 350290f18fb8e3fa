// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Named job handlers.
//!
//! A handler is looked up by its fully-qualified `module.function` key and
//! receives the job's stored positional arguments.

use anyhow::Context;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

#[async_trait]
pub trait JobHandler: Send + Sync {
	async fn handle(&self, params: Vec<Value>) -> anyhow::Result<Value>;
}

#[async_trait]
impl<F, Fut> JobHandler for F
where
	F: Fn(Vec<Value>) -> Fut + Send + Sync,
	Fut: Future<Output = anyhow::Result<Value>> + Send,
{
	async fn handle(&self, params: Vec<Value>) -> anyhow::Result<Value> {
		(self)(params).await
	}
}

/// Handler adapter that decodes the positional arguments into `A`.
///
/// `A` is usually a tuple, so `typed(|(to, subject): (String, String)| ...)`
/// accepts a job enqueued with two string arguments.
pub struct Typed<F, A> {
	f: F,
	_args: PhantomData<fn(A)>,
}

pub fn typed<F, A, R, Fut>(f: F) -> Typed<F, A>
where
	F: Fn(A) -> Fut + Send + Sync,
	A: DeserializeOwned + Send,
	R: Serialize,
	Fut: Future<Output = anyhow::Result<R>> + Send,
{
	Typed {
		f,
		_args: PhantomData,
	}
}

#[async_trait]
impl<F, A, R, Fut> JobHandler for Typed<F, A>
where
	F: Fn(A) -> Fut + Send + Sync,
	A: DeserializeOwned + Send,
	R: Serialize,
	Fut: Future<Output = anyhow::Result<R>> + Send,
{
	async fn handle(&self, params: Vec<Value>) -> anyhow::Result<Value> {
		let args: A =
			serde_json::from_value(Value::Array(params)).context("invalid job arguments")?;
		let result = (self.f)(args).await?;
		Ok(serde_json::to_value(result)?)
	}
}

/// Dispatch table from `module.function` keys to handlers.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
	handlers: HashMap<String, Arc<dyn JobHandler>>,
}

impl HandlerRegistry {
	pub fn new() -> Self {
		Self::default()
	}

	/// Register `handler` under `name`, replacing any earlier registration.
	pub fn register(&mut self, name: impl Into<String>, handler: impl JobHandler + 'static) -> &mut Self {
		self.handlers.insert(name.into(), Arc::new(handler));
		self
	}

	/// Register every function of a module under `module.function`.
	pub fn register_module<I, S>(&mut self, module: &str, functions: I) -> &mut Self
	where
		I: IntoIterator<Item = (S, Arc<dyn JobHandler>)>,
		S: AsRef<str>,
	{
		for (function, handler) in functions {
			self
				.handlers
				.insert(format!("{module}.{}", function.as_ref()), handler);
		}
		self
	}

	/// Merge `other` into this registry. Entries in `other` win.
	pub fn merge(&mut self, other: HandlerRegistry) -> &mut Self {
		self.handlers.extend(other.handlers);
		self
	}

	pub fn get(&self, name: &str) -> Option<Arc<dyn JobHandler>> {
		self.handlers.get(name).cloned()
	}

	pub fn contains(&self, name: &str) -> bool {
		self.handlers.contains_key(name)
	}

	/// Registered names, sorted.
	pub fn names(&self) -> Vec<String> {
		let mut names: Vec<String> = self.handlers.keys().cloned().collect();
		names.sort();
		names
	}

	pub fn len(&self) -> usize {
		self.handlers.len()
	}

	pub fn is_empty(&self) -> bool {
		self.handlers.is_empty()
	}
}

impl fmt::Debug for HandlerRegistry {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("HandlerRegistry")
			.field("names", &self.names())
			.finish()
	}
}
