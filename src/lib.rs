//! # Weir
//!
//! A small, composable engine for sequencing callback-style asynchronous
//! task steps.
//!
//! ## Features
//!
//! - **Strictly sequential steps**: a flow advances only after the current
//!   step reports, no matter how many asynchronous operations it started
//! - **Error-first plumbing**: one shared error slot travels with the flow
//!   until a step consumes it
//! - **Composable design**: compiled flows nest inside other flows as
//!   single steps
//! - **Dynamic fan-out**: [`parallel_each`] forks per-item workers and
//!   joins their results in declaration order
//!
//! ## Quick Start
//!
//! ```rust
//! use weir::prelude::*;
//! use serde_json::json;
//!
//! let my_flow = Flow::builder()
//!     .named("greeter")
//!     .task(|ctx: Context, args: Vec<TaskValue>| {
//!         let name = args[0].as_str().unwrap_or("world").to_string();
//!         ctx.next(vec![json!(format!("hello, {name}"))]);
//!     })
//!     .task(|ctx: Context, args: Vec<TaskValue>| {
//!         if let Some(err) = ctx.err() {
//!             panic!("{err}");
//!         }
//!         ctx.next(args);
//!     })
//!     .build();
//!
//! let outcome = futures::executor::block_on(my_flow.call(vec![json!("weir")]))
//!     .expect("flow completed");
//! assert_eq!(outcome.args, vec![json!("hello, weir")]);
//! ```
//!
//! Steps that wait on external asynchronous operations hand out completion
//! callbacks instead of calling [`Context::next`] directly:
//!
//! ```rust,no_run
//! use weir::prelude::*;
//!
//! let reader = Flow::builder()
//!     .task(|ctx: Context, args: Vec<TaskValue>| {
//!         for path in args {
//!             let cb = ctx.async_cb();
//!             tokio::spawn(async move {
//!                 match tokio::fs::read_to_string(path.as_str().unwrap_or_default()).await {
//!                     Ok(text) => cb.ok(vec![text.into()]),
//!                     Err(e) => cb.fail(e.into()),
//!                 }
//!             });
//!         }
//!     })
//!     .task(|ctx: Context, contents: Vec<TaskValue>| {
//!         // one argument per file, in the order the callbacks were taken
//!         ctx.next(contents);
//!     })
//!     .build();
//! ```
//!
//! ## Module Organization
//!
//! - [`Flow`] / [`FlowBuilder`]: compiling and invoking step sequences
//! - [`Context`] / [`AsyncCallback`]: the per-step continuation protocol
//! - [`parallel_each`] / [`ForkContext`]: dynamic fan-out with ordered joins
//! - [`AsyncTask`]: steps written as `async fn` bodies on tokio
//! - [`prelude`]: commonly used types (import with `use weir::prelude::*`)

// ============================================================================
// Core Module
// ============================================================================

mod core;

// ============================================================================
// Public Re-exports
// ============================================================================

pub use core::TaskValue;
pub use core::async_task::AsyncTask;
pub use core::context::{AsyncCallback, Context, nth};
pub use core::error::{Stalled, TaskError};
pub use core::flow::{Done, Flow, FlowBuilder, FlowOutcome};
pub use core::fork::{ForkContext, parallel_each};

// ============================================================================
// Prelude Module
// ============================================================================

/// The prelude: imports everything you need to compile and run flows.
///
/// # Example
/// ```rust
/// use weir::prelude::*;
/// ```
pub mod prelude {
    pub use super::{
        AsyncCallback,
        AsyncTask,
        Context,
        Done,
        // Compilation
        Flow,
        FlowBuilder,
        FlowOutcome,
        ForkContext,
        Stalled,
        // Errors
        TaskError,
        // Values
        TaskValue,
        nth,
        // Fan-out
        parallel_each,
    };
}

// ============================================================================
// Library Metadata
// ============================================================================

/// The version of this crate.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// The name of this crate.
pub const NAME: &str = env!("CARGO_PKG_NAME");
