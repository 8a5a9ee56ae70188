//! TCP server: acceptors, session registry and shutdown orchestration.
//!
//! Accept loops and session tasks run on the `IoContext` workers. Everything
//! that waits for those tasks to finish runs elsewhere:
//! - `stop_async` hands the whole shutdown sequence to a control thread
//! - a closed session is reported to the handler, then erased from the
//!   registry, on the auxiliary pool

mod acceptor;
mod handler;
mod session;

pub use handler::{CallbackHandler, ServerHandler};
pub use session::TcpSession;

use crate::endpoint::EndPoint;
use crate::error::{Error, Result};
use crate::runtime::sockopt::Keepalive;
use crate::runtime::{on_reactor_worker, spawn_control, AuxPool, ControlThread, IoContext};
use acceptor::Acceptor;
use bytes::Bytes;
use session::SessionObserver;
use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::thread;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tracing::{debug, error, info, warn};

/// Identifier of a live session. Never reused by the same `TcpServer`.
pub type SessionId = u64;

/// Read buffer size per session
const DEFAULT_READ_BUFFER_SIZE: usize = 16 * 1024;

/// Pause after a failed accept (e.g. descriptor exhaustion)
const ACCEPT_BACKOFF: Duration = Duration::from_millis(10);

/// Tuning knobs for a `TcpServer`.
#[derive(Debug, Clone)]
pub struct ServerOptions {
    /// Maximum bytes per `on_data_available` chunk.
    pub read_buffer_size: usize,
    /// Listen backlog for every acceptor.
    pub listen_backlog: i32,
    /// Threads in the auxiliary pool that delivers disconnects.
    pub aux_workers: usize,
    /// Set TCP_NODELAY on accepted sockets.
    pub nodelay: bool,
    /// How often the shutdown thread re-checks the session count.
    pub shutdown_poll_interval: Duration,
    /// After this long, sessions still open during shutdown are force-closed.
    /// `None` waits for them indefinitely.
    pub shutdown_grace: Option<Duration>,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
            listen_backlog: 1024,
            aux_workers: 1,
            nodelay: false,
            shutdown_poll_interval: Duration::from_millis(10),
            shutdown_grace: None,
        }
    }
}

/// One-shot flag with a blocking wait.
#[derive(Default)]
struct Latch {
    set: Mutex<bool>,
    cv: Condvar,
}

impl Latch {
    fn set(&self) {
        *self.set.lock().unwrap_or_else(|e| e.into_inner()) = true;
        self.cv.notify_all();
    }

    fn wait(&self) {
        let mut set = self.set.lock().unwrap_or_else(|e| e.into_inner());
        while !*set {
            set = self.cv.wait(set).unwrap_or_else(|e| e.into_inner());
        }
    }
}

/// State of one `start`..`stop` cycle.
struct ServerShared {
    context: IoContext,
    handler: Arc<dyn ServerHandler>,
    options: ServerOptions,
    sessions: RwLock<HashMap<SessionId, Arc<TcpSession>>>,
    acceptors: Vec<Arc<Acceptor>>,
    running_acceptors: AtomicUsize,
    acceptors_stopped: Latch,
    stopping: AtomicBool,
    next_id: Arc<AtomicU64>,
    aux: Arc<AuxPool>,
}

impl ServerShared {
    fn read_sessions(&self) -> RwLockReadGuard<'_, HashMap<SessionId, Arc<TcpSession>>> {
        self.sessions.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write_sessions(&self) -> RwLockWriteGuard<'_, HashMap<SessionId, Arc<TcpSession>>> {
        self.sessions.write().unwrap_or_else(|e| e.into_inner())
    }

    fn session(&self, id: SessionId) -> Result<Arc<TcpSession>> {
        self.read_sessions()
            .get(&id)
            .cloned()
            .ok_or(Error::UnknownSession(id))
    }

    fn clients_count(&self) -> usize {
        self.read_sessions().len()
    }

    fn disconnect_all(&self) {
        for session in self.read_sessions().values() {
            session.stop_async();
        }
    }

    fn accept_session(self: &Arc<Self>, stream: TcpStream, peer: SocketAddr) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;

        if self.options.nodelay {
            if let Err(e) = stream.set_nodelay(true) {
                debug!(session = id, error = %e, "Failed to set TCP_NODELAY");
            }
        }

        let observer: Arc<dyn SessionObserver> = Arc::clone(self) as Arc<dyn SessionObserver>;
        let session = Arc::new(TcpSession::new(
            id,
            stream,
            observer,
            self.options.read_buffer_size,
        ));
        self.write_sessions().insert(id, Arc::clone(&session));
        debug!(session = id, peer = %peer, "New connection");

        self.handler.on_session_created(&session);
        session.start(&self.context.handle());
    }

    fn finish_session(&self, id: SessionId, error: Option<io::Error>) {
        let handler = &self.handler;
        if catch_unwind(AssertUnwindSafe(|| handler.on_session_disconnected(id, error))).is_err() {
            error!(session = id, "Disconnect handler panicked");
        }
        self.write_sessions().remove(&id);
        debug!(session = id, "Session removed");
    }

    /// Full shutdown sequence. Runs on a control thread only.
    fn shutdown(&self) {
        info!(sessions = self.clients_count(), "Server stopping");

        for acceptor in &self.acceptors {
            acceptor.close();
        }
        self.acceptors_stopped.wait();
        debug!("All accept loops stopped");

        self.disconnect_all();

        let started = Instant::now();
        let mut forced = false;
        loop {
            let remaining = self.clients_count();
            if remaining == 0 {
                break;
            }
            if let Some(grace) = self.options.shutdown_grace {
                if !forced && started.elapsed() >= grace {
                    warn!(remaining, "Shutdown grace period elapsed, closing sessions");
                    for session in self.read_sessions().values() {
                        session.close();
                    }
                    forced = true;
                }
            }
            thread::sleep(self.options.shutdown_poll_interval);
        }

        self.context.stop_async();
        info!("Server shutdown complete, stopping IO context");
    }
}

impl SessionObserver for ServerShared {
    fn session_data(&self, session: &TcpSession, data: &[u8]) {
        self.handler.on_data_available(session, data);
    }

    fn session_stopped(self: Arc<Self>, id: SessionId, error: Option<io::Error>) {
        let shared = Arc::clone(&self);
        if let Err(e) = self.aux.execute(move || shared.finish_session(id, error)) {
            error!(session = id, error = %e, "Failed to defer session removal");
        }
    }
}

/// Decrements the running-acceptor count when an accept loop ends, however
/// it ends; the last one releases the shutdown latch.
struct AcceptLoopExit {
    shared: Arc<ServerShared>,
}

impl Drop for AcceptLoopExit {
    fn drop(&mut self) {
        if self.shared.running_acceptors.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.shared.acceptors_stopped.set();
        }
    }
}

async fn accept_loop(shared: Arc<ServerShared>, acceptor: Arc<Acceptor>, _exit: AcceptLoopExit) {
    let listener = match acceptor.listen() {
        Ok(listener) => listener,
        Err(e) => {
            if !acceptor.is_closed() {
                error!(endpoint = %acceptor.endpoint(), error = %e, "Failed to register listener");
            }
            return;
        }
    };
    debug!(endpoint = %acceptor.endpoint(), local = %acceptor.local_addr(), "Accept loop started");

    while let Some(accepted) = acceptor.accept(&listener).await {
        match accepted {
            Ok((stream, peer)) => shared.accept_session(stream, peer),
            Err(e) => {
                warn!(endpoint = %acceptor.endpoint(), error = %e, "Failed to accept connection");
                tokio::time::sleep(ACCEPT_BACKOFF).await;
            }
        }
    }
    debug!(endpoint = %acceptor.endpoint(), "Accept loop stopped");
}

/// Multi-endpoint TCP server.
pub struct TcpServer {
    options: ServerOptions,
    next_id: Arc<AtomicU64>,
    aux: Mutex<Option<Arc<AuxPool>>>,
    current: RwLock<Option<Arc<ServerShared>>>,
    control: Mutex<Option<ControlThread>>,
    start_lock: Mutex<()>,
}

impl TcpServer {
    pub fn new(options: ServerOptions) -> Self {
        Self {
            options,
            next_id: Arc::new(AtomicU64::new(0)),
            aux: Mutex::new(None),
            current: RwLock::new(None),
            control: Mutex::new(None),
            start_lock: Mutex::new(()),
        }
    }

    /// Bind every endpoint, start `thread_count` reactor workers and begin
    /// accepting.
    ///
    /// Bind failures are returned synchronously and leave the server stopped.
    pub fn start<H: ServerHandler>(
        &self,
        endpoints: &[EndPoint],
        handler: H,
        thread_count: usize,
    ) -> Result<()> {
        self.start_shared(endpoints, Arc::new(handler), thread_count)
    }

    /// Like `start`, for a handler the caller keeps a reference to.
    pub fn start_shared(
        &self,
        endpoints: &[EndPoint],
        handler: Arc<dyn ServerHandler>,
        thread_count: usize,
    ) -> Result<()> {
        let _starting = lock(&self.start_lock);
        if self.is_running() {
            return Err(Error::AlreadyRunning("tcp server"));
        }
        // The previous cycle's shutdown thread is past its last step by now.
        let ctl = lock(&self.control).take();
        if let Some(ctl) = ctl {
            ctl.join()?;
        }
        if let Some(previous) = self.shared() {
            if let Err(e) = previous.context.future_get_once() {
                error!(error = %e, "Previous server run reported errors");
            }
        }

        let acceptors = endpoints
            .iter()
            .map(|ep| Acceptor::bind(ep, self.options.listen_backlog).map(Arc::new))
            .collect::<Result<Vec<_>>>()?;

        let aux = self.aux_pool()?;
        let stop_handler = Arc::clone(&handler);
        let context = IoContext::new(thread_count, move || {
            info!("Server stopped listening");
            stop_handler.on_stopped_listening();
        });

        let shared = Arc::new(ServerShared {
            context,
            handler: Arc::clone(&handler),
            options: self.options.clone(),
            sessions: RwLock::new(HashMap::new()),
            running_acceptors: AtomicUsize::new(acceptors.len()),
            acceptors,
            acceptors_stopped: Latch::default(),
            stopping: AtomicBool::new(false),
            next_id: Arc::clone(&self.next_id),
            aux,
        });
        if shared.acceptors.is_empty() {
            shared.acceptors_stopped.set();
        }

        shared.context.run(true)?;
        for acceptor in &shared.acceptors {
            let exit = AcceptLoopExit {
                shared: Arc::clone(&shared),
            };
            let spawned = shared.context.spawn(accept_loop(
                Arc::clone(&shared),
                Arc::clone(acceptor),
                exit,
            ));
            if let Err(e) = spawned {
                shared.context.stop_async();
                if let Err(wait) = shared.context.wait_for_stop() {
                    warn!(error = %wait, "Could not wait for IO context after failed start");
                }
                return Err(e);
            }
        }

        let listening: Vec<String> = shared
            .acceptors
            .iter()
            .map(|a| a.local_addr().to_string())
            .collect();
        *write(&self.current) = Some(Arc::clone(&shared));
        info!(endpoints = ?listening, threads = shared.context.worker_count(), "Server listening");

        handler.on_started_listening();
        Ok(())
    }

    fn aux_pool(&self) -> Result<Arc<AuxPool>> {
        let mut aux = lock(&self.aux);
        if let Some(pool) = aux.as_ref() {
            return Ok(Arc::clone(pool));
        }
        let pool = Arc::new(AuxPool::new(self.options.aux_workers)?);
        *aux = Some(Arc::clone(&pool));
        Ok(pool)
    }

    fn shared(&self) -> Option<Arc<ServerShared>> {
        read(&self.current).clone()
    }

    fn running_shared(&self) -> Result<Arc<ServerShared>> {
        self.shared().ok_or(Error::NotRunning("tcp server"))
    }

    pub fn is_running(&self) -> bool {
        self.shared().is_some_and(|s| s.context.is_running())
    }

    /// Addresses of the acceptors that are still open.
    pub fn local_endpoints(&self) -> Vec<SocketAddr> {
        self.shared()
            .map(|s| {
                s.acceptors
                    .iter()
                    .filter(|a| !a.is_closed())
                    .map(|a| a.local_addr())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Queue a copy of `data` on session `id`.
    pub fn write(&self, id: SessionId, data: &[u8]) -> Result<()> {
        self.session(id)?.write(data)
    }

    /// Queue `data` on session `id` without copying.
    pub fn write_bytes(&self, id: SessionId, data: Bytes) -> Result<()> {
        self.session(id)?.write_bytes(data)
    }

    /// Ask one session to flush and close. Other sessions are unaffected.
    pub fn disconnect(&self, id: SessionId) -> Result<()> {
        self.session(id)?.stop_async();
        Ok(())
    }

    pub fn disconnect_all(&self) {
        if let Some(shared) = self.shared() {
            shared.disconnect_all();
        }
    }

    pub fn session(&self, id: SessionId) -> Result<Arc<TcpSession>> {
        match self.shared() {
            Some(shared) => shared.session(id),
            None => Err(Error::UnknownSession(id)),
        }
    }

    pub fn clients_count(&self) -> usize {
        self.shared().map(|s| s.clients_count()).unwrap_or(0)
    }

    /// Apply keep-alive settings to every open acceptor.
    pub fn set_keepalive(&self, keepalive: Option<&Keepalive>) -> Result<()> {
        let shared = self.running_shared()?;
        for acceptor in shared.acceptors.iter().filter(|a| !a.is_closed()) {
            acceptor.set_keepalive(keepalive)?;
        }
        Ok(())
    }

    /// Apply receive/send timeouts to every open acceptor.
    pub fn set_timeout(&self, timeout: Option<Duration>) -> Result<()> {
        let shared = self.running_shared()?;
        for acceptor in shared.acceptors.iter().filter(|a| !a.is_closed()) {
            acceptor.set_timeout(timeout)?;
        }
        Ok(())
    }

    /// Begin shutdown on a control thread. Returns immediately; repeated
    /// calls are no-ops.
    pub fn stop_async(&self) {
        let Some(shared) = self.shared() else {
            return;
        };
        if shared
            .stopping
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }

        let worker = Arc::clone(&shared);
        match spawn_control("server-stop", move || worker.shutdown()) {
            Ok(ctl) => *lock(&self.control) = Some(ctl),
            Err(e) => {
                error!(error = %e, "Failed to spawn shutdown thread, stopping IO context");
                shared.context.stop_async();
            }
        }
    }

    /// Block until the server has fully stopped and every disconnect has been
    /// delivered, then report worker failures.
    ///
    /// Must not be called from a reactor worker or a disconnect callback.
    pub fn join(&self) -> Result<()> {
        if on_reactor_worker() {
            return Err(Error::WouldDeadlock("TcpServer::join"));
        }
        if lock(&self.aux).as_ref().is_some_and(|aux| aux.is_pool_thread()) {
            return Err(Error::WouldDeadlock("TcpServer::join"));
        }

        let ctl = lock(&self.control).take();
        if let Some(ctl) = ctl {
            ctl.join()?;
        }

        let Some(shared) = self.shared() else {
            return Ok(());
        };
        shared.context.wait_for_stop()?;
        shared.aux.wait_idle()?;
        shared.context.future_get_once()
    }

    /// `stop_async` followed by `join`.
    pub fn stop(&self) -> Result<()> {
        self.stop_async();
        self.join()
    }
}

impl Default for TcpServer {
    fn default() -> Self {
        Self::new(ServerOptions::default())
    }
}

impl Drop for TcpServer {
    fn drop(&mut self) {
        if self.is_running() {
            self.stop_async();
        }
        let on_aux = lock(&self.aux).as_ref().is_some_and(|aux| aux.is_pool_thread());
        if on_reactor_worker() || on_aux {
            warn!("TcpServer dropped on an engine thread, not waiting for shutdown");
            return;
        }
        if let Err(e) = self.join() {
            error!(error = %e, "Server shutdown reported errors");
        }
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

fn read<T>(l: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    l.read().unwrap_or_else(|e| e.into_inner())
}

fn write<T>(l: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    l.write().unwrap_or_else(|e| e.into_inner())
}
