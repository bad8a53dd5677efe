//! A cloneable handle onto a tokio runtime, with an explicit, timeout-bounded
//! shutdown and a `TailTasks` helper for waiting on a bounded set of spawned
//! tasks to finish without hanging forever on one that doesn't.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::runtime::{Handle, Runtime};
use tokio::task::{Id, JoinSet};

/// An executor either borrows an ambient tokio runtime (the common case,
/// when constructed from inside an `async fn`) or owns one it created and
/// will shut down itself. Either way, cloning an `Executor` is cheap: the
/// `Handle` is a lightweight reference and the owned `Runtime`, if any, is
/// shared behind an `Arc`.
#[derive(Clone)]
pub struct Executor {
    handle: Handle,
    // `None` once `shutdown` has consumed the owned runtime (or if this
    // executor never owned one to begin with).
    owned_runtime: Arc<Mutex<Option<Runtime>>>,
}

impl Executor {
    /// Wraps the runtime of the calling context. Panics outside of a tokio
    /// runtime, exactly like `Handle::current`.
    pub fn borrowed() -> Self {
        Executor {
            handle: Handle::current(),
            owned_runtime: Arc::new(Mutex::new(None)),
        }
    }

    /// Builds and owns a new multi-threaded runtime. `shutdown` will drive
    /// it to completion; dropping the `Executor` without calling `shutdown`
    /// leaks the runtime's threads, same as dropping a bare `Runtime` would.
    pub fn new_owned(thread_name_prefix: &str) -> std::io::Result<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .thread_name(thread_name_prefix.to_string())
            .build()?;
        let handle = runtime.handle().clone();
        Ok(Executor {
            handle,
            owned_runtime: Arc::new(Mutex::new(Some(runtime))),
        })
    }

    /// Spawns a future onto the underlying runtime, detached: the caller
    /// gets a `JoinHandle` but dropping it does not cancel the task.
    pub fn spawn<F>(&self, future: F) -> tokio::task::JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.handle.spawn(future)
    }

    /// Runs a blocking closure on the runtime's blocking thread pool.
    pub fn spawn_blocking<F, R>(&self, f: F) -> tokio::task::JoinHandle<R>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        self.handle.spawn_blocking(f)
    }

    /// Blocks the current thread until `future` resolves. Must not be
    /// called from within an async context driven by this same runtime.
    pub fn block_on<F: Future>(&self, future: F) -> F::Output {
        self.handle.block_on(future)
    }

    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    /// Drives an owned runtime to a graceful stop, waiting up to `timeout`
    /// for in-flight tasks to finish before the runtime is dropped out from
    /// under them. A no-op (returns immediately) for a borrowed executor,
    /// since it does not own the runtime's lifecycle.
    pub fn shutdown(&self, timeout: Duration) {
        if let Some(runtime) = self.owned_runtime.lock().take() {
            runtime.shutdown_timeout(timeout);
        }
    }
}

/// Tracks a bounded set of spawned tasks by name, so a caller can wait for
/// all of them to finish (or log which ones are still outstanding after a
/// deadline) without holding a `JoinHandle` per task by hand.
pub struct TailTasks {
    executor: Executor,
    tasks: JoinSet<()>,
    names: std::collections::HashMap<Id, String>,
}

impl TailTasks {
    pub fn new(executor: Executor) -> Self {
        TailTasks {
            executor,
            tasks: JoinSet::new(),
            names: std::collections::HashMap::new(),
        }
    }

    /// Spawns `future` under `name` and starts tracking it.
    pub fn spawn<F>(&mut self, name: impl Into<String>, future: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let id = self.tasks.spawn_on(future, self.executor.handle()).id();
        self.names.insert(id, name.into());
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    /// Waits for every tracked task to complete, up to `timeout`. Tasks
    /// still outstanding when the deadline passes are logged by name at
    /// `warn` and left running; this does not cancel them.
    pub async fn join_all(&mut self, timeout: Duration) {
        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);
        loop {
            if self.tasks.is_empty() {
                return;
            }
            tokio::select! {
                biased;
                () = &mut deadline => {
                    let outstanding: Vec<&str> = self.names.values().map(String::as_str).collect();
                    log::warn!(
                        "timed out after {:?} waiting for tasks to finish: {:?}",
                        timeout,
                        outstanding
                    );
                    return;
                }
                joined = self.tasks.join_next_with_id() => {
                    match joined {
                        Some(Ok((id, ()))) => {
                            self.names.remove(&id);
                        }
                        Some(Err(join_error)) => {
                            let id = join_error.id();
                            let name = self.names.remove(&id).unwrap_or_else(|| "<unknown>".to_string());
                            if join_error.is_panic() {
                                log::error!("task {name} panicked while draining: {join_error}");
                            }
                        }
                        None => return,
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn spawn_runs_future() {
        let executor = Executor::borrowed();
        let handle = executor.spawn(async { 1 + 1 });
        assert_eq!(handle.await.unwrap(), 2);
    }

    #[tokio::test]
    async fn tail_tasks_waits_for_completion() {
        let executor = Executor::borrowed();
        let mut tail = TailTasks::new(executor);
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..4 {
            let counter = counter.clone();
            tail.spawn("increment", async move {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }
        tail.join_all(Duration::from_secs(1)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 4);
        assert!(tail.is_empty());
    }

    #[tokio::test]
    async fn tail_tasks_gives_up_after_timeout() {
        let executor = Executor::borrowed();
        let mut tail = TailTasks::new(executor);
        tail.spawn("sleeper", async {
            tokio::time::sleep(Duration::from_secs(10)).await;
        });
        tail.join_all(Duration::from_millis(50)).await;
        assert_eq!(tail.len(), 1);
    }
}
