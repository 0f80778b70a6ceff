//! Contract between the instance runtime and user code.
//!
//! User functions, custom sources and custom sinks compile against this crate
//! only. The engine never exposes its own types to plugins.

use std::future::Future;
use std::pin::Pin;

pub mod config;
pub mod context;
pub mod error;
pub mod ffi;
pub mod function;
pub mod record;
pub mod sink;
pub mod source;
pub mod state;

/// Boxed `Send` future returned by every async plugin trait method.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;
