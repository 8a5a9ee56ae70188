//! Listening sockets, one per configured endpoint.

use crate::endpoint::EndPoint;
use crate::error::{Error, Result};
use crate::runtime::sockopt::{self, Keepalive};
use socket2::{Domain, Protocol, SockRef, Socket, Type};
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Notify;

/// A bound, listening socket and the signal that ends its accept loop.
pub(crate) struct Acceptor {
    endpoint: EndPoint,
    local_addr: SocketAddr,
    /// Handed to the accept loop when it starts.
    listener: Mutex<Option<std::net::TcpListener>>,
    /// Duplicate of the listening handle, used for socket options.
    options: Mutex<Option<Socket>>,
    shutdown: Notify,
    closed: AtomicBool,
}

impl Acceptor {
    /// Bind and listen synchronously.
    pub(crate) fn bind(endpoint: &EndPoint, backlog: i32) -> Result<Self> {
        let bind_err = |source: io::Error| Error::Bind {
            endpoint: endpoint.clone(),
            source,
        };

        let addr = endpoint.to_socket_addr().map_err(bind_err)?;
        let listener = create_listener(addr, backlog).map_err(bind_err)?;
        let local_addr = listener.local_addr().map_err(bind_err)?;
        let options = Socket::from(listener.try_clone().map_err(bind_err)?);

        Ok(Self {
            endpoint: endpoint.clone(),
            local_addr,
            listener: Mutex::new(Some(listener)),
            options: Mutex::new(Some(options)),
            shutdown: Notify::new(),
            closed: AtomicBool::new(false),
        })
    }

    pub(crate) fn endpoint(&self) -> &EndPoint {
        &self.endpoint
    }

    pub(crate) fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Register the listening socket with the calling worker's reactor.
    /// Must be called from inside a reactor task, and only once.
    pub(crate) fn listen(&self) -> io::Result<TcpListener> {
        let listener = lock(&self.listener).take().ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotConnected, "acceptor already closed")
        })?;
        TcpListener::from_std(listener)
    }

    /// Next inbound connection, or `None` once the acceptor is closed.
    pub(crate) async fn accept(
        &self,
        listener: &TcpListener,
    ) -> Option<io::Result<(TcpStream, SocketAddr)>> {
        if self.is_closed() {
            return None;
        }
        tokio::select! {
            biased;
            _ = self.shutdown.notified() => None,
            res = listener.accept() => Some(res),
        }
    }

    /// Stop accepting. Idempotent; the listening socket is released once the
    /// accept loop observes the signal.
    pub(crate) fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        drop(lock(&self.options).take());
        drop(lock(&self.listener).take());
        self.shutdown.notify_one();
    }

    pub(crate) fn set_keepalive(&self, keepalive: Option<&Keepalive>) -> io::Result<()> {
        self.with_socket(|s| sockopt::set_keepalive(SockRef::from(s), keepalive))
    }

    pub(crate) fn set_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        self.with_socket(|s| sockopt::set_timeout(SockRef::from(s), timeout))
    }

    fn with_socket<T>(&self, f: impl FnOnce(&Socket) -> io::Result<T>) -> io::Result<T> {
        match lock(&self.options).as_ref() {
            Some(sock) => f(sock),
            None => Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "acceptor is closed",
            )),
        }
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

/// Create a non-blocking listening socket.
fn create_listener(addr: SocketAddr, backlog: i32) -> io::Result<std::net::TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;

    #[cfg(unix)]
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(backlog)?;

    Ok(socket.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bind_ephemeral() {
        let acceptor = Acceptor::bind(&EndPoint::new("127.0.0.1", 0), 128).unwrap();
        assert_ne!(acceptor.local_addr().port(), 0);
        assert_eq!(acceptor.endpoint().port, 0);
        assert!(!acceptor.is_closed());

        acceptor.set_keepalive(Some(&Keepalive::default())).unwrap();
        acceptor.set_timeout(Some(Duration::from_secs(3))).unwrap();
    }

    #[test]
    fn test_bind_in_use() {
        let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = taken.local_addr().unwrap().port();

        let err = Acceptor::bind(&EndPoint::new("127.0.0.1", port), 128).err().unwrap();
        assert!(matches!(err, Error::Bind { ref endpoint, .. } if endpoint.port == port));
    }

    #[test]
    fn test_bind_invalid_ip() {
        let err = Acceptor::bind(&EndPoint::new("999.1.1.1", 80), 128).err().unwrap();
        match err {
            Error::Bind { source, .. } => assert_eq!(source.kind(), io::ErrorKind::InvalidInput),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_close_releases_options_handle() {
        let acceptor = Acceptor::bind(&EndPoint::new("127.0.0.1", 0), 16).unwrap();
        acceptor.close();
        acceptor.close();
        assert!(acceptor.is_closed());

        let err = acceptor.set_timeout(None).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotConnected);
        assert!(acceptor.listen().is_err());
    }
}
