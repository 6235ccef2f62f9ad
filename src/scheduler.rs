//! Background task scheduler.
//!
//! A controller configured with a [`Scheduler`] attaches it to every call's
//! context, so endpoints can hand off work that must outlive the call:
//!
//! ```ignore
//! async fn create_user(req: CreateUser, ctx: CallContext, _deps: Resolved) -> EndpointResult<User> {
//!     let user = store(req).await?;
//!     if let Some(scheduler) = ctx.scheduler() {
//!         scheduler.spawn_after(Duration::from_secs(60), send_welcome_mail(user.id));
//!     }
//!     Ok(user)
//! }
//! ```

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::task::JoinHandle;

/// Cloneable handle for spawning background jobs on a tokio runtime.
#[derive(Clone, Debug)]
pub struct Scheduler {
    runtime: Handle,
    active: Arc<AtomicUsize>,
}

impl Scheduler {
    /// Schedule onto the given runtime.
    pub fn new(runtime: Handle) -> Self {
        Self {
            runtime,
            active: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Schedule onto the runtime we are currently running in.
    ///
    /// Returns `None` outside a tokio runtime.
    pub fn current() -> Option<Self> {
        Handle::try_current().ok().map(Self::new)
    }

    /// Run a job in the background right away.
    pub fn spawn<F>(&self, job: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let guard = ActiveGuard::new(self.active.clone());
        self.runtime.spawn(async move {
            let _guard = guard;
            job.await
        })
    }

    /// Run a job in the background once `delay` has elapsed.
    pub fn spawn_after<F>(&self, delay: Duration, job: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let guard = ActiveGuard::new(self.active.clone());
        self.runtime.spawn(async move {
            let _guard = guard;
            tokio::time::sleep(delay).await;
            job.await
        })
    }

    /// Jobs spawned and not yet finished (or dropped).
    #[inline]
    pub fn active(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }
}

/// Decrements the active count when a job finishes or is cancelled.
struct ActiveGuard(Arc<AtomicUsize>);

impl ActiveGuard {
    fn new(counter: Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::AcqRel);
        Self(counter)
    }
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_spawn_tracks_active_jobs() {
        let scheduler = Scheduler::current().unwrap();
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();

        let job = scheduler.spawn(async move {
            let _ = rx.await;
            7
        });
        assert_eq!(scheduler.active(), 1);

        tx.send(()).unwrap();
        assert_eq!(job.await.unwrap(), 7);
        assert_eq!(scheduler.active(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_spawn_after_waits_for_delay() {
        let scheduler = Scheduler::current().unwrap();
        let started = tokio::time::Instant::now();

        let job = scheduler.spawn_after(Duration::from_secs(5), async { "done" });

        assert_eq!(job.await.unwrap(), "done");
        assert!(started.elapsed() >= Duration::from_secs(5));
    }

    #[test]
    fn test_current_outside_runtime() {
        assert!(Scheduler::current().is_none());
    }
}
