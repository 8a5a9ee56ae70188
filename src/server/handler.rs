//! Event interface between the server and the application.

use super::session::TcpSession;
use super::SessionId;
use std::io;

/// Receives server and session lifecycle events.
///
/// Every method has a no-op default. All methods except
/// `on_session_disconnected` run on a reactor worker and must not block.
/// `on_session_disconnected` runs on the auxiliary pool, exactly once per
/// session, so blocking cleanup is fine there.
pub trait ServerHandler: Send + Sync + 'static {
    /// All acceptors are bound and their accept loops are scheduled.
    fn on_started_listening(&self) {}

    /// The IO context has fully stopped.
    fn on_stopped_listening(&self) {}

    /// A connection was accepted; its reader and writer have not started yet.
    fn on_session_created(&self, _session: &TcpSession) {}

    /// One chunk of bytes, in the order it was read from the socket.
    fn on_data_available(&self, _session: &TcpSession, _data: &[u8]) {}

    /// The session is fully closed. `error` is its first I/O failure, if any.
    fn on_session_disconnected(&self, _id: SessionId, _error: Option<io::Error>) {}
}

type Callback = Box<dyn Fn() + Send + Sync>;
type SessionCallback = Box<dyn Fn(&TcpSession) + Send + Sync>;
type DataCallback = Box<dyn Fn(&TcpSession, &[u8]) + Send + Sync>;
type DisconnectCallback = Box<dyn Fn(SessionId, Option<io::Error>) + Send + Sync>;

/// `ServerHandler` assembled from optional closures.
#[derive(Default)]
pub struct CallbackHandler {
    started: Option<Callback>,
    stopped: Option<Callback>,
    created: Option<SessionCallback>,
    data: Option<DataCallback>,
    disconnected: Option<DisconnectCallback>,
}

impl CallbackHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_started_listening(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
        self.started = Some(Box::new(f));
        self
    }

    pub fn on_stopped_listening(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
        self.stopped = Some(Box::new(f));
        self
    }

    pub fn on_session_created(mut self, f: impl Fn(&TcpSession) + Send + Sync + 'static) -> Self {
        self.created = Some(Box::new(f));
        self
    }

    pub fn on_data_available(
        mut self,
        f: impl Fn(&TcpSession, &[u8]) + Send + Sync + 'static,
    ) -> Self {
        self.data = Some(Box::new(f));
        self
    }

    pub fn on_session_disconnected(
        mut self,
        f: impl Fn(SessionId, Option<io::Error>) + Send + Sync + 'static,
    ) -> Self {
        self.disconnected = Some(Box::new(f));
        self
    }
}

impl ServerHandler for CallbackHandler {
    fn on_started_listening(&self) {
        if let Some(f) = &self.started {
            f();
        }
    }

    fn on_stopped_listening(&self) {
        if let Some(f) = &self.stopped {
            f();
        }
    }

    fn on_session_created(&self, session: &TcpSession) {
        if let Some(f) = &self.created {
            f(session);
        }
    }

    fn on_data_available(&self, session: &TcpSession, data: &[u8]) {
        if let Some(f) = &self.data {
            f(session, data);
        }
    }

    fn on_session_disconnected(&self, id: SessionId, error: Option<io::Error>) {
        if let Some(f) = &self.disconnected {
            f(id, error);
        }
    }
}
