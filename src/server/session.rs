//! Per-connection session: one reader task, one writer task, one socket.
//!
//! Both tasks share the socket through an `Arc<TcpStream>` and drive it with
//! readiness-based `try_read`/`try_write`. Each task holds a strong reference
//! to the session for its whole lifetime and marks itself finished on exit
//! (including cancellation). The disconnect event fires once, after both
//! tasks have finished.

use super::SessionId;
use crate::error::{Error, Result};
use crate::runtime::sockopt::{self, Keepalive};
use crate::runtime::IoHandle;
use bytes::{Bytes, BytesMut};
use socket2::SockRef;
use std::collections::VecDeque;
use std::io;
use std::net::{Shutdown, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::Notify;
use tracing::{debug, trace};

/// Receiver of a session's data and its single disconnect report.
pub(crate) trait SessionObserver: Send + Sync + 'static {
    fn session_data(&self, session: &TcpSession, data: &[u8]);

    /// Called exactly once, from whichever task finishes last. Must not block.
    fn session_stopped(self: Arc<Self>, id: SessionId, error: Option<io::Error>);
}

/// One accepted TCP connection.
pub struct TcpSession {
    id: SessionId,
    stream: Mutex<Option<Arc<TcpStream>>>,
    queue: Mutex<VecDeque<Bytes>>,
    writer_wake: Notify,
    stop_requested: AtomicBool,
    closed: AtomicBool,
    reader_done: AtomicBool,
    writer_done: AtomicBool,
    disconnect_fired: AtomicBool,
    first_error: Mutex<Option<io::Error>>,
    bytes_received: AtomicU64,
    bytes_sent: AtomicU64,
    read_buffer_size: usize,
    observer: Arc<dyn SessionObserver>,
}

enum WriterStep {
    Write(Bytes),
    Wait,
    Exit,
}

impl TcpSession {
    pub(crate) fn new(
        id: SessionId,
        stream: TcpStream,
        observer: Arc<dyn SessionObserver>,
        read_buffer_size: usize,
    ) -> Self {
        Self {
            id,
            stream: Mutex::new(Some(Arc::new(stream))),
            queue: Mutex::new(VecDeque::new()),
            writer_wake: Notify::new(),
            stop_requested: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            reader_done: AtomicBool::new(false),
            writer_done: AtomicBool::new(false),
            disconnect_fired: AtomicBool::new(false),
            first_error: Mutex::new(None),
            bytes_received: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            read_buffer_size: read_buffer_size.max(1),
            observer,
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Spawn the reader and writer on the calling reactor worker.
    pub(crate) fn start(self: &Arc<Self>, io: &IoHandle) {
        let reader_exit = TaskExit::reader(Arc::clone(self));
        let writer_exit = TaskExit::writer(Arc::clone(self));

        let Some(stream) = self.lock_stream().clone() else {
            return;
        };

        let session = Arc::clone(self);
        let read_stream = Arc::clone(&stream);
        if let Err(e) = io.spawn_local(async move {
            let _exit = reader_exit;
            session.read_loop(&read_stream).await;
        }) {
            debug!(session = self.id, error = %e, "Failed to spawn reader");
        }

        let session = Arc::clone(self);
        if let Err(e) = io.spawn_local(async move {
            let _exit = writer_exit;
            session.write_loop(&stream).await;
        }) {
            debug!(session = self.id, error = %e, "Failed to spawn writer");
        }
    }

    /// Queue a copy of `data` for sending.
    pub fn write(&self, data: &[u8]) -> Result<()> {
        self.write_bytes(Bytes::copy_from_slice(data))
    }

    /// Queue `data` for sending. Rejected once a local stop was requested;
    /// a peer-side close that has not been observed yet is not detected here.
    pub fn write_bytes(&self, data: Bytes) -> Result<()> {
        let mut queue = self.lock_queue();
        if self.stop_requested.load(Ordering::Acquire) {
            return Err(Error::SessionStopping(self.id));
        }
        if data.is_empty() {
            return Ok(());
        }
        queue.push_back(data);
        drop(queue);

        self.writer_wake.notify_one();
        Ok(())
    }

    /// Ask the session to flush its queue and close. Non-blocking, idempotent.
    pub fn stop_async(&self) {
        {
            let _queue = self.lock_queue();
            self.stop_requested.store(true, Ordering::Release);
        }
        self.writer_wake.notify_one();
    }

    /// Shut down and release the socket, then fire the disconnect event if
    /// both tasks are done. Safe to call any number of times from any thread.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            if let Some(stream) = self.lock_stream().take() {
                if let Err(e) = SockRef::from(&*stream).shutdown(Shutdown::Both) {
                    trace!(session = self.id, error = %e, "Shutdown failed");
                }
            }
            debug!(session = self.id, "Session closing");
        }
        self.writer_wake.notify_one();

        if self.reader_done.load(Ordering::SeqCst)
            && self.writer_done.load(Ordering::SeqCst)
            && !self.disconnect_fired.swap(true, Ordering::SeqCst)
        {
            let error = self
                .first_error
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .take();
            debug!(
                session = self.id,
                bytes_received = self.bytes_received(),
                bytes_sent = self.bytes_sent(),
                error = ?error,
                "Session closed"
            );
            Arc::clone(&self.observer).session_stopped(self.id, error);
        }
    }

    pub fn local_endpoint(&self) -> io::Result<SocketAddr> {
        self.with_socket(|s| s.local_addr())
    }

    pub fn remote_endpoint(&self) -> io::Result<SocketAddr> {
        self.with_socket(|s| s.peer_addr())
    }

    pub fn set_keepalive(&self, keepalive: Option<&Keepalive>) -> io::Result<()> {
        self.with_socket(|s| sockopt::set_keepalive(SockRef::from(s), keepalive))
    }

    pub fn set_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        self.with_socket(|s| sockopt::set_timeout(SockRef::from(s), timeout))
    }

    pub fn set_nodelay(&self, nodelay: bool) -> io::Result<()> {
        self.with_socket(|s| s.set_nodelay(nodelay))
    }

    pub fn is_stop_requested(&self) -> bool {
        self.stop_requested.load(Ordering::Acquire)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn bytes_received(&self) -> u64 {
        self.bytes_received.load(Ordering::Relaxed)
    }

    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent.load(Ordering::Relaxed)
    }

    fn with_socket<T>(&self, f: impl FnOnce(&TcpStream) -> io::Result<T>) -> io::Result<T> {
        match self.lock_stream().as_deref() {
            Some(stream) => f(stream),
            None => Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "session socket is closed",
            )),
        }
    }

    fn lock_stream(&self) -> MutexGuard<'_, Option<Arc<TcpStream>>> {
        self.stream.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_queue(&self) -> MutexGuard<'_, VecDeque<Bytes>> {
        self.queue.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn record_error(&self, err: io::Error) {
        // Errors after a local stop or close are the expected fallout of it.
        if self.stop_requested.load(Ordering::Acquire) || self.closed.load(Ordering::SeqCst) {
            trace!(session = self.id, error = %err, "Ignoring error after local stop");
            return;
        }
        let mut slot = self.first_error.lock().unwrap_or_else(|e| e.into_inner());
        if slot.is_none() {
            debug!(session = self.id, error = %err, "Session I/O error");
            *slot = Some(err);
        }
    }

    async fn read_loop(&self, stream: &TcpStream) {
        let mut buf = BytesMut::with_capacity(self.read_buffer_size);
        loop {
            if let Err(e) = stream.readable().await {
                self.record_error(e);
                return;
            }

            buf.clear();
            buf.reserve(self.read_buffer_size);
            match stream.try_read_buf(&mut buf) {
                Ok(0) => {
                    trace!(session = self.id, "Read EOF");
                    return;
                }
                Ok(n) => {
                    self.bytes_received.fetch_add(n as u64, Ordering::Relaxed);
                    trace!(session = self.id, bytes = n, "Read chunk");
                    self.observer.session_data(self, &buf[..n]);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                Err(e) => {
                    self.record_error(e);
                    return;
                }
            }
        }
    }

    async fn write_loop(&self, stream: &TcpStream) {
        loop {
            if self.closed.load(Ordering::SeqCst) {
                return;
            }

            let step = {
                let mut queue = self.lock_queue();
                match queue.pop_front() {
                    Some(buf) => WriterStep::Write(buf),
                    None if self.stop_requested.load(Ordering::Acquire) => WriterStep::Exit,
                    None => WriterStep::Wait,
                }
            };

            match step {
                WriterStep::Write(buf) => {
                    if let Err(e) = write_all(stream, &buf).await {
                        self.record_error(e);
                        return;
                    }
                    self.bytes_sent.fetch_add(buf.len() as u64, Ordering::Relaxed);
                    trace!(session = self.id, bytes = buf.len(), "Wrote buffer");
                }
                WriterStep::Wait => self.writer_wake.notified().await,
                WriterStep::Exit => return,
            }
        }
    }
}

impl Drop for TcpSession {
    fn drop(&mut self) {
        if !self.closed.load(Ordering::SeqCst) {
            self.stop_requested.store(true, Ordering::Release);
            self.close();
        }
    }
}

impl std::fmt::Debug for TcpSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpSession")
            .field("id", &self.id)
            .field("stop_requested", &self.is_stop_requested())
            .field("closed", &self.is_closed())
            .field("bytes_received", &self.bytes_received())
            .field("bytes_sent", &self.bytes_sent())
            .finish()
    }
}

async fn write_all(stream: &TcpStream, mut buf: &[u8]) -> io::Result<()> {
    while !buf.is_empty() {
        stream.writable().await?;
        match stream.try_write(buf) {
            Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
            Ok(n) => buf = &buf[n..],
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

#[derive(Clone, Copy)]
enum Half {
    Reader,
    Writer,
}

/// Marks one task finished and closes the session when dropped, whether the
/// task returned normally, panicked or was cancelled before its first poll.
struct TaskExit {
    session: Arc<TcpSession>,
    half: Half,
}

impl TaskExit {
    fn reader(session: Arc<TcpSession>) -> Self {
        Self {
            session,
            half: Half::Reader,
        }
    }

    fn writer(session: Arc<TcpSession>) -> Self {
        Self {
            session,
            half: Half::Writer,
        }
    }
}

impl Drop for TaskExit {
    fn drop(&mut self) {
        match self.half {
            Half::Reader => self.session.reader_done.store(true, Ordering::SeqCst),
            Half::Writer => self.session.writer_done.store(true, Ordering::SeqCst),
        }
        self.session.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::IoContext;
    use std::io::{Read, Write};
    use std::net::TcpListener;
    use std::sync::mpsc;
    use std::time::Instant;

    #[derive(Default)]
    struct Recorder {
        data: Mutex<Vec<u8>>,
        stopped: Mutex<Vec<(SessionId, Option<io::ErrorKind>)>>,
    }

    impl SessionObserver for Recorder {
        fn session_data(&self, _session: &TcpSession, data: &[u8]) {
            self.data.lock().unwrap().extend_from_slice(data);
        }

        fn session_stopped(self: Arc<Self>, id: SessionId, error: Option<io::Error>) {
            self.stopped
                .lock()
                .unwrap()
                .push((id, error.map(|e| e.kind())));
        }
    }

    struct Harness {
        ctx: IoContext,
        recorder: Arc<Recorder>,
        session: Arc<TcpSession>,
        client: std::net::TcpStream,
    }

    fn harness() -> Harness {
        let ctx = IoContext::with_workers(1);
        ctx.run(true).unwrap();

        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let client = std::net::TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server_side, _) = listener.accept().unwrap();
        server_side.set_nonblocking(true).unwrap();

        let recorder = Arc::new(Recorder::default());
        let observer: Arc<dyn SessionObserver> = recorder.clone();
        let io = ctx.handle();
        let (tx, rx) = mpsc::channel();
        ctx.spawn(async move {
            let stream = TcpStream::from_std(server_side).unwrap();
            let session = Arc::new(TcpSession::new(1, stream, observer, 4096));
            session.start(&io);
            tx.send(session).unwrap();
        })
        .unwrap();
        let session = rx.recv_timeout(Duration::from_secs(5)).unwrap();

        Harness {
            ctx,
            recorder,
            session,
            client,
        }
    }

    fn wait_until(mut cond: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !cond() {
            assert!(Instant::now() < deadline, "condition not met in time");
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn test_writes_arrive_in_order() {
        let mut h = harness();
        let sizes = [10usize, 20, 5, 1, 1000];
        let mut expected = Vec::new();
        for (i, size) in sizes.iter().enumerate() {
            let chunk = vec![b'a' + i as u8; *size];
            expected.extend_from_slice(&chunk);
            h.session.write(&chunk).unwrap();
        }

        let mut received = vec![0u8; expected.len()];
        h.client.read_exact(&mut received).unwrap();
        assert_eq!(received, expected);

        wait_until(|| h.session.bytes_sent() == expected.len() as u64);
        h.ctx.stop_async();
        h.ctx.wait_for_stop().unwrap();
    }

    #[test]
    fn test_data_is_delivered() {
        let mut h = harness();
        h.client.write_all(b"HELLO").unwrap();

        wait_until(|| h.recorder.data.lock().unwrap().len() == 5);
        assert_eq!(&h.recorder.data.lock().unwrap()[..], b"HELLO");
        assert_eq!(h.session.bytes_received(), 5);

        h.ctx.stop_async();
        h.ctx.wait_for_stop().unwrap();
    }

    #[test]
    fn test_peer_close_fires_disconnect_once() {
        let h = harness();
        drop(h.client);

        wait_until(|| !h.recorder.stopped.lock().unwrap().is_empty());
        assert!(h.session.is_closed());

        // Extra closes must not re-fire the event.
        h.session.close();
        h.session.close();
        std::thread::sleep(Duration::from_millis(50));

        let stopped = h.recorder.stopped.lock().unwrap().clone();
        assert_eq!(stopped, vec![(1, None)]);

        h.ctx.stop_async();
        h.ctx.wait_for_stop().unwrap();
    }

    #[test]
    fn test_stop_flushes_then_rejects_writes() {
        let mut h = harness();
        h.session.write(b"bye").unwrap();
        h.session.stop_async();
        h.session.stop_async();

        let err = h.session.write(b"late").unwrap_err();
        assert!(matches!(err, Error::SessionStopping(1)));

        let mut received = Vec::new();
        h.client
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        h.client.read_to_end(&mut received).unwrap();
        assert_eq!(received, b"bye");

        wait_until(|| h.recorder.stopped.lock().unwrap().len() == 1);
        assert_eq!(h.recorder.stopped.lock().unwrap()[0], (1, None));

        h.ctx.stop_async();
        h.ctx.wait_for_stop().unwrap();
    }

    #[test]
    fn test_endpoints_only_while_open() {
        let h = harness();
        assert_eq!(
            h.session.remote_endpoint().unwrap(),
            h.client.local_addr().unwrap()
        );
        assert_eq!(
            h.session.local_endpoint().unwrap(),
            h.client.peer_addr().unwrap()
        );
        h.session.set_nodelay(true).unwrap();
        h.session.set_timeout(Some(Duration::from_secs(1))).unwrap();

        h.session.close();
        let err = h.session.local_endpoint().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotConnected);

        wait_until(|| h.recorder.stopped.lock().unwrap().len() == 1);
        h.ctx.stop_async();
        h.ctx.wait_for_stop().unwrap();
    }

    #[test]
    fn test_concurrent_close_fires_once() {
        let h = harness();
        let threads: Vec<_> = (0..8)
            .map(|_| {
                let session = Arc::clone(&h.session);
                std::thread::spawn(move || session.close())
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }

        wait_until(|| h.recorder.stopped.lock().unwrap().len() == 1);
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(h.recorder.stopped.lock().unwrap().len(), 1);

        h.ctx.stop_async();
        h.ctx.wait_for_stop().unwrap();
    }

    #[test]
    fn test_context_stop_cancels_tasks_and_fires() {
        let h = harness();
        h.ctx.stop_async();
        h.ctx.wait_for_stop().unwrap();

        assert_eq!(h.recorder.stopped.lock().unwrap().len(), 1);
        assert!(h.session.is_closed());
    }
}
