//! taskctx - cooperative tasks with execution-context affinity
//!
//! A small task runtime that makes three behaviors of `async` code observable:
//!
//! - a fire-and-forget task that fails has nobody to report to, so its failure
//!   goes to the unobserved-failure sink (which terminates the process by default);
//! - an awaited (or blocked-on) task hands its failure to the caller;
//! - blocking a single-threaded affine context on a task whose continuation
//!   needs that same context never returns.
//!
//! # Example
//!
//! ```no_run
//! use taskctx::runtime::{delay, Scheduler};
//! use std::time::Duration;
//!
//! let scheduler = Scheduler::new();
//! let pool = scheduler.pooled_context();
//!
//! let failing = scheduler.submit(async {
//!     delay(Duration::from_millis(5)).await;
//!     Err::<(), _>(anyhow::anyhow!("boom"))
//! }, &pool);
//!
//! assert!(failing.block_until_complete().is_err());
//! ```

#![doc(html_root_url = "https://docs.rs/taskctx")]
#![warn(rust_2018_idioms)]

// Public modules
pub mod runtime;
pub mod scenarios;

// Utility modules
pub mod util;

// Re-exports
pub use anyhow::{Context, Result};
pub use thiserror::Error;

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Crate name
pub const NAME: &str = "taskctx";
