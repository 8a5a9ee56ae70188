//! IO execution context: a fixed pool of reactor worker threads.
//!
//! Each worker thread owns a current-thread tokio runtime and drives it until
//! the context is stopped, or until no tracked work is pending and no guard is
//! held. Tasks are placed round-robin across the workers, or on the calling
//! worker with `spawn_local`.
//!
//! Blocking waits (`wait_for_stop`, `future_get_once`) refuse to run on one of
//! the context's own workers, since a worker cannot wait for itself to exit.

use crate::error::{AggregateError, Error, Result, WorkerFailure};
use std::any::Any;
use std::cell::Cell;
use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::pin::Pin;
use std::task::{Context, Poll};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use tokio::runtime::{Builder, Handle, Runtime};
use tokio::sync::Notify;
use tracing::{debug, error, info};

static NEXT_CONTEXT_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    /// Context id and worker index of the calling reactor worker.
    static REACTOR_WORKER: Cell<Option<(u64, usize)>> = const { Cell::new(None) };
}

/// Whether the calling thread is a worker of any `IoContext`.
pub(crate) fn on_reactor_worker() -> bool {
    REACTOR_WORKER.with(|w| w.get()).is_some()
}

type StopCallback = Box<dyn Fn() + Send + Sync + 'static>;
type DeferredTask = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;
type WorkerOutcome = std::result::Result<(), String>;

struct WorkerSlot {
    index: usize,
    thread: Option<thread::JoinHandle<WorkerOutcome>>,
    outcome: Option<WorkerOutcome>,
    /// First task panic caught on this worker.
    task_panic: Option<String>,
    reported: bool,
}

impl WorkerSlot {
    fn failure(&self) -> Option<WorkerFailure> {
        let message = match &self.outcome {
            Some(Err(message)) => message.clone(),
            _ => self.task_panic.clone()?,
        };
        Some(WorkerFailure {
            worker: self.index,
            message,
        })
    }
}

#[derive(Default)]
struct RunState {
    handles: Vec<Handle>,
    workers: Vec<WorkerSlot>,
    /// Tasks spawned before `run`; dispatched when the workers start.
    deferred: Vec<DeferredTask>,
    /// Failures of a previous run that were never collected.
    unreported: Vec<WorkerFailure>,
}

struct ContextInner {
    id: u64,
    worker_count: usize,
    on_stopped: Option<StopCallback>,
    stop_requested: AtomicBool,
    guard: AtomicBool,
    guard_installed: AtomicBool,
    pending: AtomicUsize,
    running: AtomicUsize,
    next_worker: AtomicUsize,
    wake: Notify,
    state: Mutex<RunState>,
    join_lock: Mutex<()>,
}

impl ContextInner {
    fn lock_state(&self) -> MutexGuard<'_, RunState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn is_worker_thread(&self) -> bool {
        REACTOR_WORKER.with(|w| w.get()).is_some_and(|(id, _)| id == self.id)
    }

    fn should_exit(&self) -> bool {
        self.stop_requested.load(Ordering::Acquire)
            || (!self.guard.load(Ordering::Acquire) && self.pending.load(Ordering::Acquire) == 0)
    }

    async fn wait_until_done(&self) {
        loop {
            let notified = self.wake.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.should_exit() {
                return;
            }
            notified.await;
        }
    }

    fn worker_exited(&self) {
        if self.running.fetch_sub(1, Ordering::AcqRel) == 1 {
            info!(context = self.id, "IO context stopped");
            if let Some(cb) = &self.on_stopped {
                cb();
            }
        }
    }

    fn track<F>(self: &Arc<Self>, fut: F) -> impl Future<Output = ()> + Send + 'static
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let work = PendingWork::new(Arc::clone(self));
        let inner = Arc::clone(self);
        async move {
            let _work = work;
            if let Err(payload) = CatchUnwind(Box::pin(fut)).await {
                inner.task_panicked(panic_message(payload));
            }
        }
    }

    fn task_panicked(&self, message: String) {
        let worker = REACTOR_WORKER.with(|w| w.get()).map(|(_, index)| index);
        error!(context = self.id, worker = ?worker, error = %message, "IO task panicked");
        let Some(index) = worker else {
            return;
        };
        if let Some(slot) = self.lock_state().workers.get_mut(index) {
            slot.task_panic.get_or_insert(message);
        }
    }

    fn spawn<F>(self: &Arc<Self>, fut: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut state = self.lock_state();
        if self.running.load(Ordering::Acquire) == 0 {
            if self.stop_requested.load(Ordering::Acquire) && !state.workers.is_empty() {
                return Err(Error::NotRunning("io context"));
            }
            state.deferred.push(Box::pin(self.track(fut)));
            return Ok(());
        }
        if self.stop_requested.load(Ordering::Acquire) || state.handles.is_empty() {
            return Err(Error::NotRunning("io context"));
        }
        let idx = self.next_worker.fetch_add(1, Ordering::Relaxed) % state.handles.len();
        let handle = state.handles[idx].clone();
        drop(state);

        handle.spawn(self.track(fut));
        Ok(())
    }

    fn spawn_local<F>(self: &Arc<Self>, fut: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.is_worker_thread() && !self.stop_requested.load(Ordering::Acquire) {
            if let Ok(handle) = Handle::try_current() {
                handle.spawn(self.track(fut));
                return Ok(());
            }
        }
        self.spawn(fut)
    }

    fn join_workers(&self) {
        let _joining = self.join_lock.lock().unwrap_or_else(|e| e.into_inner());

        let threads: Vec<_> = self
            .lock_state()
            .workers
            .iter_mut()
            .filter_map(|slot| slot.thread.take().map(|t| (slot.index, t)))
            .collect();

        for (index, handle) in threads {
            let outcome = handle.join().unwrap_or_else(|p| Err(panic_message(p)));
            if let Err(message) = &outcome {
                error!(worker = index, error = %message, "IO worker failed");
            }
            if let Some(slot) = self.lock_state().workers.get_mut(index) {
                slot.outcome = Some(outcome);
            }
        }
    }
}

/// One unit of outstanding work; keeps unguarded workers alive while held.
struct PendingWork {
    inner: Arc<ContextInner>,
}

impl PendingWork {
    fn new(inner: Arc<ContextInner>) -> Self {
        inner.pending.fetch_add(1, Ordering::AcqRel);
        Self { inner }
    }
}

impl Drop for PendingWork {
    fn drop(&mut self) {
        if self.inner.pending.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.inner.wake.notify_waiters();
        }
    }
}

/// Reactor plus worker-thread pool.
pub struct IoContext {
    inner: Arc<ContextInner>,
}

/// Cheap, cloneable spawner for an `IoContext`.
#[derive(Clone)]
pub struct IoHandle {
    inner: Arc<ContextInner>,
}

impl IoContext {
    /// Create a context with `worker_count` workers (at least one) and no stop
    /// callback. Nothing runs until `run`.
    pub fn with_workers(worker_count: usize) -> Self {
        Self::build(worker_count, None)
    }

    /// Create a context whose `on_stopped` callback fires once per run, on the
    /// last worker to exit.
    pub fn new<F>(worker_count: usize, on_stopped: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        Self::build(worker_count, Some(Box::new(on_stopped)))
    }

    fn build(worker_count: usize, on_stopped: Option<StopCallback>) -> Self {
        Self {
            inner: Arc::new(ContextInner {
                id: NEXT_CONTEXT_ID.fetch_add(1, Ordering::Relaxed),
                worker_count: worker_count.max(1),
                on_stopped,
                stop_requested: AtomicBool::new(false),
                guard: AtomicBool::new(false),
                guard_installed: AtomicBool::new(false),
                pending: AtomicUsize::new(0),
                running: AtomicUsize::new(0),
                next_worker: AtomicUsize::new(0),
                wake: Notify::new(),
                state: Mutex::new(RunState::default()),
                join_lock: Mutex::new(()),
            }),
        }
    }

    pub fn handle(&self) -> IoHandle {
        IoHandle {
            inner: Arc::clone(&self.inner),
        }
    }

    pub fn worker_count(&self) -> usize {
        self.inner.worker_count
    }

    /// True while at least one worker thread is inside its run loop.
    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::Acquire) > 0
    }

    /// Whether the calling thread is one of this context's workers.
    pub fn is_worker_thread(&self) -> bool {
        self.inner.is_worker_thread()
    }

    /// Launch the worker threads.
    ///
    /// With `enable_guard` the workers stay up with no pending work until
    /// `reset_guard` or `stop_async`.
    pub fn run(&self, enable_guard: bool) -> Result<()> {
        let inner = &self.inner;
        let mut guard = inner.lock_state();
        let state = &mut *guard;
        if inner.running.load(Ordering::Acquire) > 0 {
            return Err(Error::AlreadyRunning("io context"));
        }

        let me = thread::current().id();
        for slot in state.workers.iter_mut() {
            if let Some(t) = slot.thread.take() {
                if t.thread().id() != me {
                    slot.outcome = Some(t.join().unwrap_or_else(|p| Err(panic_message(p))));
                }
            }
            if !slot.reported {
                if let Some(failure) = slot.failure() {
                    error!(worker = failure.worker, error = %failure.message, "IO worker failed");
                    state.unreported.push(failure);
                }
            }
        }

        let mut runtimes = Vec::with_capacity(inner.worker_count);
        for _ in 0..inner.worker_count {
            runtimes.push(Builder::new_current_thread().enable_all().build()?);
        }

        inner.stop_requested.store(false, Ordering::Release);
        inner.guard_installed.store(enable_guard, Ordering::Release);
        inner.guard.store(enable_guard, Ordering::Release);
        inner.running.store(inner.worker_count, Ordering::Release);
        state.handles = runtimes.iter().map(|rt| rt.handle().clone()).collect();
        state.workers.clear();

        for task in state.deferred.drain(..) {
            let idx = inner.next_worker.fetch_add(1, Ordering::Relaxed) % state.handles.len();
            state.handles[idx].spawn(task);
        }

        info!(
            context = inner.id,
            workers = inner.worker_count,
            guard = enable_guard,
            "Starting IO context"
        );

        let mut runtimes = runtimes.into_iter().enumerate();
        while let Some((index, rt)) = runtimes.next() {
            let worker_inner = Arc::clone(inner);
            let spawned = thread::Builder::new()
                .name(format!("io-worker-{index}"))
                .spawn(move || worker_main(worker_inner, index, rt));

            match spawned {
                Ok(thread) => state.workers.push(WorkerSlot {
                    index,
                    thread: Some(thread),
                    outcome: None,
                    task_panic: None,
                    reported: false,
                }),
                Err(e) => {
                    error!(worker = index, error = %e, "Failed to spawn IO worker");
                    inner.stop_requested.store(true, Ordering::Release);
                    inner.wake.notify_waiters();
                    // This worker and every one after it never started.
                    inner.worker_exited();
                    for _ in runtimes.by_ref() {
                        inner.worker_exited();
                    }
                    return Err(e.into());
                }
            }
        }

        Ok(())
    }

    /// Spawn a tracked task on the next worker, round-robin.
    ///
    /// Before the first `run`, the task is held back and dispatched when the
    /// workers start.
    pub fn spawn<F>(&self, fut: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.inner.spawn(fut)
    }

    /// Release the guard, request stop and wake every worker. Non-blocking.
    pub fn stop_async(&self) {
        self.inner.guard.store(false, Ordering::Release);
        self.inner.stop_requested.store(true, Ordering::Release);
        self.inner.wake.notify_waiters();
    }

    /// Release the guard so workers exit once pending work drains.
    pub fn reset_guard(&self) -> Result<()> {
        if !self.is_running() {
            return Err(Error::NotRunning("io context"));
        }
        if !self.inner.guard_installed.load(Ordering::Acquire) {
            return Err(Error::NoGuard);
        }
        self.inner.guard.store(false, Ordering::Release);
        self.inner.wake.notify_waiters();
        Ok(())
    }

    /// Block until every worker thread has exited.
    pub fn wait_for_stop(&self) -> Result<()> {
        if self.is_worker_thread() {
            return Err(Error::WouldDeadlock("IoContext::wait_for_stop"));
        }
        self.inner.join_workers();
        Ok(())
    }

    /// Join the workers and report each worker's terminal failure at most once.
    pub fn future_get_once(&self) -> Result<()> {
        if self.is_worker_thread() {
            return Err(Error::WouldDeadlock("IoContext::future_get_once"));
        }
        self.inner.join_workers();

        let mut state = self.inner.lock_state();
        let mut failures = std::mem::take(&mut state.unreported);
        for slot in state.workers.iter_mut() {
            if slot.reported || slot.outcome.is_none() {
                continue;
            }
            slot.reported = true;
            failures.extend(slot.failure());
        }
        drop(state);

        match AggregateError::from_failures(failures) {
            Some(err) => Err(err.into()),
            None => Ok(()),
        }
    }
}

impl Drop for IoContext {
    fn drop(&mut self) {
        self.stop_async();
        if !self.is_worker_thread() {
            self.inner.join_workers();
        }
        let deferred: Vec<_> = self.inner.lock_state().deferred.drain(..).collect();
        drop(deferred);
    }
}

impl IoHandle {
    /// See `IoContext::spawn`.
    pub fn spawn<F>(&self, fut: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.inner.spawn(fut)
    }

    /// Spawn on the calling worker when called from one of this context's
    /// workers; otherwise behaves like `spawn`.
    pub fn spawn_local<F>(&self, fut: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.inner.spawn_local(fut)
    }

    pub fn is_worker_thread(&self) -> bool {
        self.inner.is_worker_thread()
    }
}

fn worker_main(inner: Arc<ContextInner>, index: usize, rt: Runtime) -> WorkerOutcome {
    REACTOR_WORKER.with(|w| w.set(Some((inner.id, index))));
    debug!(context = inner.id, worker = index, "IO worker started");

    let result = catch_unwind(AssertUnwindSafe(|| {
        rt.block_on(inner.wait_until_done());
        // Tasks still parked on this worker are cancelled here.
        drop(rt);
    }));

    debug!(context = inner.id, worker = index, "IO worker exiting");
    inner.worker_exited();
    result.map_err(panic_message)
}

/// Turns a panic inside the wrapped future into an `Err` for the task.
struct CatchUnwind<F>(Pin<Box<F>>);

impl<F: Future> Future for CatchUnwind<F> {
    type Output = thread::Result<F::Output>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let fut = self.0.as_mut();
        match catch_unwind(AssertUnwindSafe(|| fut.poll(cx))) {
            Ok(Poll::Pending) => Poll::Pending,
            Ok(Poll::Ready(v)) => Poll::Ready(Ok(v)),
            Err(payload) => Poll::Ready(Err(payload)),
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "worker panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::time::Duration;
    use tokio_test::{assert_err, assert_ok};

    #[test]
    fn test_double_run_is_rejected() {
        let ctx = IoContext::with_workers(2);
        assert_ok!(ctx.run(true));
        assert!(ctx.is_running());

        let err = ctx.run(true).unwrap_err();
        assert!(matches!(err, Error::AlreadyRunning(_)));
        assert!(err.is_logic());

        ctx.stop_async();
        assert_ok!(ctx.wait_for_stop());
        assert!(!ctx.is_running());
    }

    #[test]
    fn test_restart_after_stop() {
        let ctx = IoContext::with_workers(1);
        assert_ok!(ctx.run(true));
        ctx.stop_async();
        assert_ok!(ctx.wait_for_stop());

        assert_ok!(ctx.run(true));
        let (tx, rx) = mpsc::channel();
        assert_ok!(ctx.spawn(async move { tx.send(1).unwrap() }));
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), 1);
        ctx.stop_async();
        assert_ok!(ctx.wait_for_stop());
    }

    #[test]
    fn test_unguarded_run_exits_when_idle() {
        let (tx, rx) = mpsc::channel();
        let ctx = IoContext::new(3, move || tx.send(()).unwrap());
        assert_ok!(ctx.run(false));
        assert_ok!(ctx.wait_for_stop());

        assert!(!ctx.is_running());
        rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(rx.try_recv().is_err(), "on_stopped must fire exactly once");
    }

    #[test]
    fn test_deferred_work_keeps_unguarded_context_alive() {
        let ctx = IoContext::with_workers(2);
        let (tx, rx) = mpsc::channel();
        assert_ok!(ctx.spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            tx.send("done").unwrap();
        }));

        assert_ok!(ctx.run(false));
        let err = ctx.reset_guard().unwrap_err();
        assert!(matches!(err, Error::NoGuard));

        assert_ok!(ctx.wait_for_stop());
        assert_eq!(rx.try_recv().unwrap(), "done");
    }

    #[test]
    fn test_reset_guard_lets_workers_drain() {
        let (stopped_tx, stopped_rx) = mpsc::channel();
        let ctx = IoContext::new(2, move || stopped_tx.send(()).unwrap());

        assert!(matches!(ctx.reset_guard(), Err(Error::NotRunning(_))));

        assert_ok!(ctx.run(true));
        let (tx, rx) = mpsc::channel();
        assert_ok!(ctx.spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            tx.send(()).unwrap();
        }));

        // Guard still held: workers stay up after the task completes.
        rx.recv_timeout(Duration::from_secs(5)).unwrap();
        std::thread::sleep(Duration::from_millis(50));
        assert!(ctx.is_running());

        assert_ok!(ctx.reset_guard());
        assert_ok!(ctx.wait_for_stop());
        stopped_rx.recv_timeout(Duration::from_secs(5)).unwrap();
    }

    #[test]
    fn test_wait_for_stop_from_worker_is_rejected() {
        let ctx = Arc::new(IoContext::with_workers(1));
        assert_ok!(ctx.run(true));

        let (tx, rx) = mpsc::channel();
        let inner_ctx = Arc::clone(&ctx);
        assert_ok!(ctx.spawn(async move {
            let wait = inner_ctx.wait_for_stop();
            let get = inner_ctx.future_get_once();
            tx.send((
                matches!(wait, Err(Error::WouldDeadlock(_))),
                matches!(get, Err(Error::WouldDeadlock(_))),
                on_reactor_worker(),
            ))
            .unwrap();
        }));

        assert_eq!(
            rx.recv_timeout(Duration::from_secs(5)).unwrap(),
            (true, true, true)
        );
        assert!(!on_reactor_worker());
        ctx.stop_async();
        assert_ok!(ctx.wait_for_stop());
    }

    #[test]
    fn test_spawn_local_stays_on_worker() {
        let ctx = IoContext::with_workers(4);
        assert_ok!(ctx.run(true));

        let handle = ctx.handle();
        let (tx, rx) = mpsc::channel();
        assert_ok!(ctx.spawn(async move {
            let outer = thread::current().id();
            let tx2 = tx.clone();
            handle
                .spawn_local(async move {
                    tx2.send(thread::current().id()).unwrap();
                })
                .unwrap();
            tx.send(outer).unwrap();
        }));

        let a = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        let b = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(a, b);

        ctx.stop_async();
        assert_ok!(ctx.wait_for_stop());
    }

    #[test]
    fn test_spawn_after_stop_fails() {
        let ctx = IoContext::with_workers(1);
        assert_ok!(ctx.run(true));
        ctx.stop_async();
        assert_ok!(ctx.wait_for_stop());

        assert_err!(ctx.spawn(async {}));
    }

    #[test]
    fn test_future_get_once_clean_stop() {
        let ctx = IoContext::with_workers(2);
        assert_ok!(ctx.run(true));
        ctx.stop_async();
        assert_ok!(ctx.future_get_once());
        assert_ok!(ctx.future_get_once());
    }

    #[test]
    fn test_task_panic_is_reported_once() {
        let ctx = IoContext::with_workers(2);
        assert_ok!(ctx.run(true));
        let (tx, rx) = mpsc::channel();
        assert_ok!(ctx.spawn(async move {
            tx.send(()).unwrap();
            panic!("task boom");
        }));
        rx.recv_timeout(Duration::from_secs(5)).unwrap();
        // The panicking task's guard drops while unwinding; give it a moment.
        std::thread::sleep(Duration::from_millis(50));
        assert!(ctx.is_running(), "a task panic must not take the worker down");

        ctx.stop_async();
        match ctx.future_get_once() {
            Err(Error::Aggregate(agg)) => {
                assert_eq!(agg.failures().len(), 1);
                assert!(agg.failures()[0].message.contains("task boom"));
            }
            other => panic!("expected aggregate error, got {other:?}"),
        }
        assert_ok!(ctx.future_get_once());
    }

    #[test]
    fn test_uncollected_failure_survives_restart() {
        let ctx = IoContext::with_workers(1);
        assert_ok!(ctx.run(true));
        assert_ok!(ctx.spawn(async {
            panic!("first run");
        }));
        std::thread::sleep(Duration::from_millis(50));
        ctx.stop_async();
        assert_ok!(ctx.wait_for_stop());

        assert_ok!(ctx.run(true));
        ctx.stop_async();
        match ctx.future_get_once() {
            Err(Error::Aggregate(agg)) => {
                assert_eq!(agg.failures().len(), 1);
                assert!(agg.failures()[0].message.contains("first run"));
            }
            other => panic!("expected aggregate error, got {other:?}"),
        }
        assert_ok!(ctx.future_get_once());
    }

    #[test]
    fn test_stop_cancels_parked_tasks() {
        struct DropFlag(mpsc::Sender<()>);
        impl Drop for DropFlag {
            fn drop(&mut self) {
                let _ = self.0.send(());
            }
        }

        let ctx = IoContext::with_workers(1);
        assert_ok!(ctx.run(true));
        let (tx, rx) = mpsc::channel();
        let flag = DropFlag(tx);
        assert_ok!(ctx.spawn(async move {
            let _flag = flag;
            std::future::pending::<()>().await;
        }));

        ctx.stop_async();
        assert_ok!(ctx.wait_for_stop());
        rx.recv_timeout(Duration::from_secs(5)).unwrap();
    }
}
