//! Dependency module - per-call dependency injection.
//!
//! Provides:
//! - [`Dependency`] - a typed handle to a producer, declared once at startup
//! - [`DependencyPlan`] - the resolution order of a method's dependency graph
//! - [`DependencyScope`] - resolves a plan for one call and runs cleanups
//! - [`Resolved`] - the values handed to the endpoint
//!
//! # Producers
//!
//! A producer is one of four shapes:
//! - plain value: `Dependency::value`
//! - awaitable: `Dependency::from_fn`
//! - scoped resource with synchronous acquire/release: `Dependency::scoped`
//! - resource with asynchronous acquire/release: `Dependency::resource`
//!
//! Resource releases are registered as cleanup handles when acquired and run
//! exactly once after the endpoint finishes, in acquisition order, whether the
//! call succeeded or not.
//!
//! # Sharing
//!
//! A producer runs at most once per call. When two dependencies both depend
//! on `settings`, they see the same resolved value, and if `settings` is a
//! resource it is released once.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use rpc_dispatch::dependency::{Dependency, DependencyPlan};
//!
//! struct Settings { dsn: String }
//! struct Pool { dsn: String }
//!
//! let settings = Dependency::value("settings", |_| Ok(Settings { dsn: "db://".into() }));
//! let pool = Dependency::<Pool>::builder("pool")
//!     .depends_on(&settings)
//!     .resource(
//!         {
//!             let settings = settings.clone();
//!             move |deps| {
//!                 let settings = deps.get(&settings);
//!                 async move { Ok(Pool { dsn: settings?.dsn.clone() }) }
//!             }
//!         },
//!         |_pool: Arc<Pool>| async { Ok(()) },
//!     );
//!
//! let plan = DependencyPlan::new([pool.erased()]);
//! assert_eq!(plan.names(), vec!["settings", "pool"]);
//! ```

mod node;
mod resolver;

pub use node::{AnyDependency, Dependency, DependencyBuilder};
pub use resolver::{CleanupHandle, DependencyPlan, DependencyScope, Exhausted, Resolved};
