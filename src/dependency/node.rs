//! Dependency declarations.

use std::any::Any;
use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

use super::Resolved;
use crate::error::BoxError;
use crate::method::BoxFuture;

/// Type-erased resolved value.
pub(crate) type AnyValue = Arc<dyn Any + Send + Sync>;

type SyncProduce = Arc<dyn Fn(&Resolved) -> Result<AnyValue, BoxError> + Send + Sync>;
type AsyncProduce =
    Arc<dyn Fn(Resolved) -> BoxFuture<'static, Result<AnyValue, BoxError>> + Send + Sync>;
type SyncRelease = Arc<dyn Fn(AnyValue) -> Result<(), BoxError> + Send + Sync>;
type AsyncRelease =
    Arc<dyn Fn(AnyValue) -> BoxFuture<'static, Result<(), BoxError>> + Send + Sync>;

/// How a node produces its value.
pub(crate) enum Producer {
    Value(SyncProduce),
    Future(AsyncProduce),
    Scoped {
        acquire: SyncProduce,
        release: SyncRelease,
    },
    Resource {
        acquire: AsyncProduce,
        release: AsyncRelease,
    },
}

/// One producer in the dependency graph.
///
/// Identity is the allocation: two handles are the same dependency exactly
/// when they point at the same node.
pub(crate) struct Node {
    pub(crate) name: Arc<str>,
    pub(crate) dependencies: Vec<Arc<Node>>,
    pub(crate) producer: Producer,
}

impl Node {
    /// Identity key used by the per-call cache.
    #[inline]
    pub(crate) fn key(self: &Arc<Self>) -> usize {
        Arc::as_ptr(self) as *const () as usize
    }
}

/// Typed handle to a declared dependency.
///
/// Cheap to clone; clones are the same dependency.
pub struct Dependency<T> {
    node: Arc<Node>,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Clone for Dependency<T> {
    fn clone(&self) -> Self {
        Self {
            node: self.node.clone(),
            _marker: PhantomData,
        }
    }
}

impl<T> fmt::Debug for Dependency<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dependency")
            .field("name", &self.node.name)
            .field("depends_on", &self.node.dependencies.len())
            .finish()
    }
}

impl<T> Dependency<T> {
    /// Name given at declaration, used in logs and errors.
    pub fn name(&self) -> &str {
        &self.node.name
    }

    /// Type-erased handle, for dependency lists.
    pub fn erased(&self) -> AnyDependency {
        AnyDependency {
            node: self.node.clone(),
        }
    }

    pub(crate) fn node(&self) -> &Arc<Node> {
        &self.node
    }
}

impl<T: Send + Sync + 'static> Dependency<T> {
    /// Start declaring a dependency that itself depends on others.
    pub fn builder(name: impl Into<Arc<str>>) -> DependencyBuilder<T> {
        DependencyBuilder {
            name: name.into(),
            dependencies: Vec::new(),
            _marker: PhantomData,
        }
    }

    /// Plain value computed from already-resolved dependencies.
    pub fn value<F>(name: impl Into<Arc<str>>, produce: F) -> Self
    where
        F: Fn(&Resolved) -> Result<T, BoxError> + Send + Sync + 'static,
    {
        Self::builder(name).value(produce)
    }

    /// Value produced by an async function.
    pub fn from_fn<F, Fut>(name: impl Into<Arc<str>>, produce: F) -> Self
    where
        F: Fn(Resolved) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, BoxError>> + Send + 'static,
    {
        Self::builder(name).from_fn(produce)
    }

    /// Resource with synchronous acquire and release.
    pub fn scoped<A, R>(name: impl Into<Arc<str>>, acquire: A, release: R) -> Self
    where
        A: Fn(&Resolved) -> Result<T, BoxError> + Send + Sync + 'static,
        R: Fn(&T) -> Result<(), BoxError> + Send + Sync + 'static,
    {
        Self::builder(name).scoped(acquire, release)
    }

    /// Resource with asynchronous acquire and release.
    pub fn resource<A, AFut, R, RFut>(name: impl Into<Arc<str>>, acquire: A, release: R) -> Self
    where
        A: Fn(Resolved) -> AFut + Send + Sync + 'static,
        AFut: Future<Output = Result<T, BoxError>> + Send + 'static,
        R: Fn(Arc<T>) -> RFut + Send + Sync + 'static,
        RFut: Future<Output = Result<(), BoxError>> + Send + 'static,
    {
        Self::builder(name).resource(acquire, release)
    }
}

/// Type-erased dependency handle.
#[derive(Clone)]
pub struct AnyDependency {
    pub(crate) node: Arc<Node>,
}

impl AnyDependency {
    pub fn name(&self) -> &str {
        &self.node.name
    }
}

impl fmt::Debug for AnyDependency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("AnyDependency").field(&self.node.name).finish()
    }
}

impl<T> From<&Dependency<T>> for AnyDependency {
    fn from(dep: &Dependency<T>) -> Self {
        dep.erased()
    }
}

/// Builder for a dependency with its own dependencies.
///
/// Dependencies must exist before the dependency that uses them, so a
/// declaration cycle cannot be expressed.
pub struct DependencyBuilder<T> {
    name: Arc<str>,
    dependencies: Vec<Arc<Node>>,
    _marker: PhantomData<fn() -> T>,
}

fn wrong_type(name: &str) -> BoxError {
    format!("dependency `{name}` holds a value of an unexpected type").into()
}

impl<T: Send + Sync + 'static> DependencyBuilder<T> {
    /// Resolve `dependency` before this one.
    pub fn depends_on<U>(mut self, dependency: &Dependency<U>) -> Self {
        self.dependencies.push(dependency.node().clone());
        self
    }

    pub fn value<F>(self, produce: F) -> Dependency<T>
    where
        F: Fn(&Resolved) -> Result<T, BoxError> + Send + Sync + 'static,
    {
        self.finish(Producer::Value(erase_sync(produce)))
    }

    pub fn from_fn<F, Fut>(self, produce: F) -> Dependency<T>
    where
        F: Fn(Resolved) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, BoxError>> + Send + 'static,
    {
        self.finish(Producer::Future(erase_async(produce)))
    }

    pub fn scoped<A, R>(self, acquire: A, release: R) -> Dependency<T>
    where
        A: Fn(&Resolved) -> Result<T, BoxError> + Send + Sync + 'static,
        R: Fn(&T) -> Result<(), BoxError> + Send + Sync + 'static,
    {
        let name = self.name.clone();
        let release: SyncRelease = Arc::new(move |value: AnyValue| match value.downcast_ref::<T>() {
            Some(value) => release(value),
            None => Err(wrong_type(&name)),
        });
        self.finish(Producer::Scoped {
            acquire: erase_sync(acquire),
            release,
        })
    }

    pub fn resource<A, AFut, R, RFut>(self, acquire: A, release: R) -> Dependency<T>
    where
        A: Fn(Resolved) -> AFut + Send + Sync + 'static,
        AFut: Future<Output = Result<T, BoxError>> + Send + 'static,
        R: Fn(Arc<T>) -> RFut + Send + Sync + 'static,
        RFut: Future<Output = Result<(), BoxError>> + Send + 'static,
    {
        let name = self.name.clone();
        let release: AsyncRelease = Arc::new(move |value: AnyValue| match value.downcast::<T>() {
            Ok(value) => Box::pin(release(value)),
            Err(_) => {
                let err = wrong_type(&name);
                Box::pin(async move { Err(err) })
            }
        });
        self.finish(Producer::Resource {
            acquire: erase_async(acquire),
            release,
        })
    }

    fn finish(self, producer: Producer) -> Dependency<T> {
        Dependency {
            node: Arc::new(Node {
                name: self.name,
                dependencies: self.dependencies,
                producer,
            }),
            _marker: PhantomData,
        }
    }
}

fn erase_sync<T, F>(produce: F) -> SyncProduce
where
    T: Send + Sync + 'static,
    F: Fn(&Resolved) -> Result<T, BoxError> + Send + Sync + 'static,
{
    Arc::new(move |deps: &Resolved| produce(deps).map(|v| Arc::new(v) as AnyValue))
}

fn erase_async<T, F, Fut>(produce: F) -> AsyncProduce
where
    T: Send + Sync + 'static,
    F: Fn(Resolved) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T, BoxError>> + Send + 'static,
{
    Arc::new(move |deps: Resolved| {
        let fut = produce(deps);
        Box::pin(async move { fut.await.map(|v| Arc::new(v) as AnyValue) })
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clones_share_identity() {
        let a = Dependency::value("a", |_| Ok(1u32));
        let b = a.clone();
        let c = Dependency::value("a", |_| Ok(1u32));

        assert_eq!(a.node().key(), b.node().key());
        assert_ne!(a.node().key(), c.node().key());
    }

    #[test]
    fn test_builder_records_dependencies() {
        let a = Dependency::value("a", |_| Ok(1u32));
        let b = Dependency::value("b", |_| Ok("b"));
        let c = Dependency::<u64>::builder("c")
            .depends_on(&a)
            .depends_on(&b)
            .value(|_| Ok(3));

        assert_eq!(c.name(), "c");
        let names: Vec<&str> = c.node().dependencies.iter().map(|n| &*n.name).collect();
        assert_eq!(names, vec!["a", "b"]);
    }

    #[test]
    fn test_producer_shapes() {
        let value = Dependency::value("v", |_| Ok(1u8));
        let future = Dependency::from_fn("f", |_| async { Ok(1u8) });
        let scoped = Dependency::scoped("s", |_| Ok(1u8), |_| Ok(()));
        let resource = Dependency::resource("r", |_| async { Ok(1u8) }, |_| async { Ok(()) });

        assert!(matches!(value.node().producer, Producer::Value(_)));
        assert!(matches!(future.node().producer, Producer::Future(_)));
        assert!(matches!(scoped.node().producer, Producer::Scoped { .. }));
        assert!(matches!(resource.node().producer, Producer::Resource { .. }));
    }
}
