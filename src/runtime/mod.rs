//! Execution runtime for the server engine.
//!
//! - `context`: reactor worker pool (`IoContext`), one current-thread tokio
//!   runtime per worker thread
//! - `control`: control threads and the auxiliary pool, for work that blocks
//!   on reactor-hosted tasks and so must never run on a reactor worker
//! - `sockopt`: keep-alive and timeout setters for native socket handles

pub mod context;
pub mod control;
pub mod sockopt;

pub use context::{IoContext, IoHandle};
pub use control::{spawn_control, AuxPool, ControlThread};
pub use sockopt::Keepalive;

pub(crate) use context::on_reactor_worker;
