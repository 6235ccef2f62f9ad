//! Dependency resolution and cleanup.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use thiserror::Error;

use super::node::{AnyValue, Node, Producer};
use super::{AnyDependency, Dependency};
use crate::error::{BoxError, ConfigError, DispatchError};
use crate::method::BoxFuture;

/// Returned by a release function that found nothing left to release.
///
/// Cleanup treats it as a normal end of teardown and does not report it.
#[derive(Debug, Clone, Copy, Default, Error)]
#[error("dependency already released")]
pub struct Exhausted;

/// Resolution order of a method's dependency graph.
///
/// Built once at registration: depth-first, post-order, each producer once.
#[derive(Clone, Default)]
pub struct DependencyPlan {
    order: Vec<Arc<Node>>,
}

impl DependencyPlan {
    /// Plan the resolution of `roots` and everything they depend on.
    pub fn new<I>(roots: I) -> Self
    where
        I: IntoIterator<Item = AnyDependency>,
    {
        let mut order = Vec::new();
        let mut seen = HashSet::new();
        for root in roots {
            visit(&root.node, &mut seen, &mut order);
        }
        Self { order }
    }

    /// Dependency names in resolution order.
    pub fn names(&self) -> Vec<&str> {
        self.order.iter().map(|node| &*node.name).collect()
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

fn visit(node: &Arc<Node>, seen: &mut HashSet<usize>, order: &mut Vec<Arc<Node>>) {
    if !seen.insert(node.key()) {
        return;
    }
    for dependency in &node.dependencies {
        visit(dependency, seen, order);
    }
    order.push(node.clone());
}

impl fmt::Debug for DependencyPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}

/// Dependency values resolved for one call.
#[derive(Clone, Default)]
pub struct Resolved {
    values: Arc<HashMap<usize, AnyValue>>,
}

impl Resolved {
    /// Value of `dependency`.
    ///
    /// Fails with [`ConfigError::UndeclaredDependency`] when the method did not
    /// declare it (directly or through another dependency).
    pub fn get<T>(&self, dependency: &Dependency<T>) -> Result<Arc<T>, DispatchError>
    where
        T: Send + Sync + 'static,
    {
        self.try_get(dependency).ok_or_else(|| {
            ConfigError::UndeclaredDependency(dependency.name().to_string()).into()
        })
    }

    /// Value of `dependency`, `None` when it was not resolved.
    pub fn try_get<T>(&self, dependency: &Dependency<T>) -> Option<Arc<T>>
    where
        T: Send + Sync + 'static,
    {
        let value = self.values.get(&dependency.node().key())?.clone();
        value.downcast::<T>().ok()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    fn insert(&mut self, key: usize, value: AnyValue) {
        Arc::make_mut(&mut self.values).insert(key, value);
    }
}

impl fmt::Debug for Resolved {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Resolved").field("len", &self.len()).finish()
    }
}

enum Release {
    Sync(Box<dyn FnOnce() -> Result<(), BoxError> + Send>),
    Async(Box<dyn FnOnce() -> BoxFuture<'static, Result<(), BoxError>> + Send>),
}

/// Deferred release of one acquired resource.
pub struct CleanupHandle {
    dependency: Arc<str>,
    release: Release,
}

impl CleanupHandle {
    pub fn dependency(&self) -> &str {
        &self.dependency
    }

    /// Release the resource. Failures are logged, never returned.
    pub async fn run(self) {
        let result = match self.release {
            Release::Sync(release) => release(),
            Release::Async(release) => release().await,
        };
        match result {
            Ok(()) => tracing::trace!("released dependency `{}`", self.dependency),
            Err(e) if e.is::<Exhausted>() => {
                tracing::debug!("dependency `{}` had nothing left to release", self.dependency)
            }
            Err(e) => {
                tracing::warn!("Cleanup of dependency `{}` failed: {}", self.dependency, e)
            }
        }
    }
}

impl fmt::Debug for CleanupHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("CleanupHandle").field(&self.dependency).finish()
    }
}

/// Resolves a [`DependencyPlan`] for one call and owns its cleanups.
///
/// Call [`close`](Self::close) once the endpoint has finished. A scope dropped
/// without being closed (the call was cancelled) spawns its pending cleanups on
/// the current tokio runtime.
#[derive(Default)]
pub struct DependencyScope {
    cleanups: Vec<CleanupHandle>,
}

impl DependencyScope {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve every dependency in `plan`, in order.
    ///
    /// Stops at the first producer that fails. Resources acquired before the
    /// failure are still released by [`close`](Self::close).
    pub async fn resolve(&mut self, plan: &DependencyPlan) -> Result<Resolved, DispatchError> {
        let mut resolved = Resolved::default();
        for node in &plan.order {
            let value = match &node.producer {
                Producer::Value(produce) => produce(&resolved),
                Producer::Future(produce) => produce(resolved.clone()).await,
                Producer::Scoped { acquire, release } => acquire(&resolved).map(|value| {
                    self.push_sync(node, release.clone(), value.clone());
                    value
                }),
                Producer::Resource { acquire, release } => {
                    acquire(resolved.clone()).await.map(|value| {
                        self.push_async(node, release.clone(), value.clone());
                        value
                    })
                }
            }
            .map_err(|e| {
                tracing::debug!("dependency `{}` failed: {}", node.name, e);
                DispatchError::from_boxed(e)
            })?;
            resolved.insert(node.key(), value);
        }
        Ok(resolved)
    }

    /// Cleanups registered so far.
    pub fn pending(&self) -> usize {
        self.cleanups.len()
    }

    /// Run every registered cleanup once, in acquisition order.
    pub async fn close(mut self) {
        run_all(std::mem::take(&mut self.cleanups)).await;
    }

    fn push_sync(
        &mut self,
        node: &Node,
        release: Arc<dyn Fn(AnyValue) -> Result<(), BoxError> + Send + Sync>,
        value: AnyValue,
    ) {
        self.cleanups.push(CleanupHandle {
            dependency: node.name.clone(),
            release: Release::Sync(Box::new(move || release(value))),
        });
    }

    fn push_async(
        &mut self,
        node: &Node,
        release: Arc<dyn Fn(AnyValue) -> BoxFuture<'static, Result<(), BoxError>> + Send + Sync>,
        value: AnyValue,
    ) {
        self.cleanups.push(CleanupHandle {
            dependency: node.name.clone(),
            release: Release::Async(Box::new(move || release(value))),
        });
    }
}

async fn run_all(cleanups: Vec<CleanupHandle>) {
    for cleanup in cleanups {
        cleanup.run().await;
    }
}

impl Drop for DependencyScope {
    fn drop(&mut self) {
        if self.cleanups.is_empty() {
            return;
        }
        let cleanups = std::mem::take(&mut self.cleanups);
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                tracing::debug!("call dropped, releasing {} dependencies", cleanups.len());
                runtime.spawn(run_all(cleanups));
            }
            Err(_) => {
                tracing::warn!(
                    "{} dependency cleanups dropped outside a tokio runtime",
                    cleanups.len()
                );
            }
        }
    }
}

impl fmt::Debug for DependencyScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DependencyScope")
            .field("cleanups", &self.cleanups)
            .finish()
    }
}
