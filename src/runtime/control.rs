//! Execution contexts that live outside the reactor.
//!
//! Anything that blocks until reactor-hosted work completes must run here:
//! either on a dedicated control thread (`spawn_control`) or on the
//! auxiliary worker pool (`AuxPool`). Neither ever shares a thread with an
//! `IoContext` worker.

use crate::error::{Error, Result};
use crate::runtime::context::on_reactor_worker;
use std::cell::Cell;
use std::io;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use tracing::{debug, error};

static NEXT_POOL_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static CONTROL_THREAD: Cell<bool> = const { Cell::new(false) };
    static AUX_POOL: Cell<Option<u64>> = const { Cell::new(None) };
}

/// Whether the calling thread was started by `spawn_control`.
pub fn is_control_thread() -> bool {
    CONTROL_THREAD.with(|c| c.get())
}

/// A dedicated thread for blocking teardown logic.
#[derive(Debug)]
pub struct ControlThread {
    handle: thread::JoinHandle<()>,
}

/// Run `f` on a fresh control thread named `ctl-<name>`.
pub fn spawn_control<F>(name: &str, f: F) -> io::Result<ControlThread>
where
    F: FnOnce() + Send + 'static,
{
    let handle = thread::Builder::new()
        .name(format!("ctl-{name}"))
        .spawn(move || {
            CONTROL_THREAD.with(|c| c.set(true));
            f();
        })?;
    Ok(ControlThread { handle })
}

impl ControlThread {
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Block until the control thread exits. A panic inside it is logged, not
    /// propagated.
    pub fn join(self) -> Result<()> {
        if self.handle.thread().id() == thread::current().id() {
            return Err(Error::WouldDeadlock("ControlThread::join"));
        }
        let name = self.handle.thread().name().unwrap_or("ctl").to_string();
        if self.handle.join().is_err() {
            error!(thread = %name, "Control thread panicked");
        }
        Ok(())
    }
}

type Job = Box<dyn FnOnce() + Send + 'static>;

struct PoolShared {
    receiver: Mutex<mpsc::Receiver<Job>>,
    pending: Mutex<usize>,
    idle: Condvar,
}

impl PoolShared {
    fn finish_one(&self) {
        let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        *pending = pending.saturating_sub(1);
        if *pending == 0 {
            self.idle.notify_all();
        }
    }
}

/// Fixed-size pool of plain OS threads for deferred, possibly blocking jobs.
pub struct AuxPool {
    id: u64,
    sender: Mutex<Option<mpsc::Sender<Job>>>,
    shared: Arc<PoolShared>,
    threads: Mutex<Vec<thread::JoinHandle<()>>>,
}

impl AuxPool {
    /// Start `size` threads (at least one) named `aux-<i>`.
    pub fn new(size: usize) -> io::Result<Self> {
        let id = NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = mpsc::channel::<Job>();
        let shared = Arc::new(PoolShared {
            receiver: Mutex::new(receiver),
            pending: Mutex::new(0),
            idle: Condvar::new(),
        });

        let mut threads = Vec::with_capacity(size.max(1));
        for i in 0..size.max(1) {
            let shared = Arc::clone(&shared);
            let handle = thread::Builder::new()
                .name(format!("aux-{i}"))
                .spawn(move || {
                    AUX_POOL.with(|p| p.set(Some(id)));
                    aux_loop(&shared);
                })?;
            threads.push(handle);
        }

        Ok(Self {
            id,
            sender: Mutex::new(Some(sender)),
            shared,
            threads: Mutex::new(threads),
        })
    }

    /// Queue a job. Fails once the pool has been shut down.
    pub fn execute<F>(&self, job: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        let sender = self.sender.lock().unwrap_or_else(|e| e.into_inner());
        let Some(sender) = sender.as_ref() else {
            return Err(Error::NotRunning("auxiliary pool"));
        };

        *self.shared.pending.lock().unwrap_or_else(|e| e.into_inner()) += 1;
        if sender.send(Box::new(job)).is_err() {
            self.shared.finish_one();
            return Err(Error::NotRunning("auxiliary pool"));
        }
        Ok(())
    }

    /// Whether the calling thread belongs to this pool.
    pub fn is_pool_thread(&self) -> bool {
        AUX_POOL.with(|p| p.get()) == Some(self.id)
    }

    /// Number of queued or running jobs.
    pub fn pending(&self) -> usize {
        *self.shared.pending.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Block until every queued job has run.
    pub fn wait_idle(&self) -> Result<()> {
        if self.is_pool_thread() || on_reactor_worker() {
            return Err(Error::WouldDeadlock("AuxPool::wait_idle"));
        }
        let mut pending = self.shared.pending.lock().unwrap_or_else(|e| e.into_inner());
        while *pending > 0 {
            pending = self
                .shared
                .idle
                .wait(pending)
                .unwrap_or_else(|e| e.into_inner());
        }
        Ok(())
    }

    /// Stop accepting jobs, let queued ones finish, and join the threads.
    ///
    /// Joining is skipped when called from one of the pool's own threads.
    pub fn shutdown(&self) {
        drop(self.sender.lock().unwrap_or_else(|e| e.into_inner()).take());

        if self.is_pool_thread() {
            return;
        }
        let threads: Vec<_> = self
            .threads
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
            .collect();
        for handle in threads {
            let _ = handle.join();
        }
    }
}

impl Drop for AuxPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn aux_loop(shared: &PoolShared) {
    loop {
        let job = {
            let receiver = shared.receiver.lock().unwrap_or_else(|e| e.into_inner());
            receiver.recv()
        };
        let Ok(job) = job else {
            debug!("Auxiliary worker exiting");
            return;
        };
        if catch_unwind(AssertUnwindSafe(job)).is_err() {
            error!("Auxiliary job panicked");
        }
        shared.finish_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[test]
    fn test_control_thread_marker() {
        assert!(!is_control_thread());
        let (tx, rx) = mpsc::channel();
        let ctl = spawn_control("marker", move || {
            tx.send(is_control_thread()).unwrap();
        })
        .unwrap();
        assert!(rx.recv().unwrap());
        ctl.join().unwrap();
    }

    #[test]
    fn test_aux_pool_runs_and_drains() {
        let pool = AuxPool::new(2).unwrap();
        let counter = Arc::new(AtomicUsize::new(0));

        for _ in 0..50 {
            let counter = Arc::clone(&counter);
            pool.execute(move || {
                thread::sleep(Duration::from_millis(1));
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        }

        pool.wait_idle().unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 50);
        assert_eq!(pool.pending(), 0);
    }

    #[test]
    fn test_aux_pool_survives_panicking_job() {
        let pool = AuxPool::new(1).unwrap();
        pool.execute(|| panic!("job failure")).unwrap();

        let (tx, rx) = mpsc::channel();
        pool.execute(move || tx.send(42).unwrap()).unwrap();
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), 42);
        pool.wait_idle().unwrap();
    }

    #[test]
    fn test_wait_idle_from_pool_thread_is_rejected() {
        let pool = Arc::new(AuxPool::new(1).unwrap());
        let (tx, rx) = mpsc::channel();
        let inner = Arc::clone(&pool);
        pool.execute(move || {
            let res = inner.wait_idle();
            tx.send(matches!(res, Err(Error::WouldDeadlock(_)))).unwrap();
        })
        .unwrap();
        assert!(rx.recv_timeout(Duration::from_secs(5)).unwrap());
        pool.wait_idle().unwrap();
    }

    #[test]
    fn test_execute_after_shutdown() {
        let pool = AuxPool::new(1).unwrap();
        pool.shutdown();
        assert!(matches!(pool.execute(|| {}), Err(Error::NotRunning(_))));
    }
}
