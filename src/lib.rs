//! tcp-engine: a multi-threaded asynchronous TCP server engine.
//!
//! Features:
//! - Accepts on any number of endpoints, multiplexed over a fixed pool of
//!   reactor worker threads
//! - Per-connection sessions with a FIFO write queue and exactly-once
//!   disconnect notification
//! - Shutdown that never blocks a reactor worker on work only that worker
//!   could finish
//!
//! ```no_run
//! use tcp_engine::{CallbackHandler, EndPoint, ServerOptions, TcpServer};
//!
//! let server = TcpServer::new(ServerOptions::default());
//! let echo = CallbackHandler::new().on_data_available(|session, data| {
//!     let _ = session.write(data);
//! });
//! server.start(&[EndPoint::new("127.0.0.1", 7000)], echo, 4)?;
//! // ...
//! server.stop()?;
//! # Ok::<(), tcp_engine::Error>(())
//! ```

pub mod config;
pub mod endpoint;
pub mod error;
pub mod runtime;
pub mod server;

pub use endpoint::EndPoint;
pub use error::{AggregateError, Error, Result, WorkerFailure};
pub use runtime::{IoContext, IoHandle, Keepalive};
pub use server::{CallbackHandler, ServerHandler, ServerOptions, SessionId, TcpServer, TcpSession};
