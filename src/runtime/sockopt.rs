//! Socket option helpers.
//!
//! Stateless setters applied to a native socket handle through
//! `socket2::SockRef`, so they work for std, tokio and socket2 sockets alike.

use socket2::{SockRef, TcpKeepalive};
use std::io;
use std::time::Duration;

/// TCP keep-alive parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Keepalive {
    /// Idle time before the first probe.
    pub idle: Duration,
    /// Delay between unanswered probes.
    pub interval: Duration,
    /// Unanswered probes before the connection is dropped.
    pub retries: u32,
}

impl Default for Keepalive {
    fn default() -> Self {
        Self {
            idle: Duration::from_secs(60),
            interval: Duration::from_secs(10),
            retries: 5,
        }
    }
}

/// Enable keep-alive with the given parameters, or disable it with `None`.
///
/// Interval and retry count are only applied on platforms that expose them.
pub fn set_keepalive(sock: SockRef<'_>, keepalive: Option<&Keepalive>) -> io::Result<()> {
    let Some(ka) = keepalive else {
        return sock.set_keepalive(false);
    };

    let params = TcpKeepalive::new().with_time(ka.idle);

    #[cfg(any(target_os = "linux", target_os = "macos", target_os = "windows"))]
    let params = params.with_interval(ka.interval);

    #[cfg(any(target_os = "linux", target_os = "macos"))]
    let params = params.with_retries(ka.retries);

    sock.set_tcp_keepalive(&params)
}

/// Set both the receive and send timeout. `None` clears them.
pub fn set_timeout(sock: SockRef<'_>, timeout: Option<Duration>) -> io::Result<()> {
    sock.set_read_timeout(timeout)?;
    sock.set_write_timeout(timeout)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    #[test]
    fn test_keepalive_on_off() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let sock = SockRef::from(&listener);

        let ka = Keepalive {
            idle: Duration::from_secs(30),
            interval: Duration::from_secs(5),
            retries: 3,
        };
        set_keepalive(SockRef::from(&listener), Some(&ka)).unwrap();
        assert!(sock.keepalive().unwrap());

        #[cfg(target_os = "linux")]
        {
            assert_eq!(sock.keepalive_time().unwrap(), Duration::from_secs(30));
            assert_eq!(sock.keepalive_interval().unwrap(), Duration::from_secs(5));
            assert_eq!(sock.keepalive_retries().unwrap(), 3);
        }

        set_keepalive(SockRef::from(&listener), None).unwrap();
        assert!(!sock.keepalive().unwrap());
    }

    #[test]
    fn test_timeout_set_and_clear() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let sock = SockRef::from(&listener);

        set_timeout(SockRef::from(&listener), Some(Duration::from_secs(2))).unwrap();
        assert_eq!(sock.read_timeout().unwrap(), Some(Duration::from_secs(2)));
        assert_eq!(sock.write_timeout().unwrap(), Some(Duration::from_secs(2)));

        set_timeout(SockRef::from(&listener), None).unwrap();
        assert_eq!(sock.read_timeout().unwrap(), None);
        assert_eq!(sock.write_timeout().unwrap(), None);
    }
}
