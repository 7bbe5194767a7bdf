// src/config.rs
use crate::docroot::{ContentTypePolicy, DEFAULT_INDEX};
use crate::error::{EtudeError, EtudeResult};
use crate::pool::{DEFAULT_MAX_QUEUE, DEFAULT_THREADS};
use crate::syscalls::EPOLLET;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_PORT: u16 = 9006;
pub const DEFAULT_MAX_CONNECTIONS: usize = 65_536;
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(15);

/// Readiness delivery for one kind of socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Trigger {
    /// Reported while the socket stays ready; one read per event is enough.
    #[default]
    Level,
    /// Reported on transitions only; the socket must be drained each event.
    Edge,
}

impl Trigger {
    pub(crate) fn epoll_flags(self) -> u32 {
        match self {
            Trigger::Level => 0,
            Trigger::Edge => EPOLLET,
        }
    }
}

/// Trigger modes for the listening socket and for client sockets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TriggerMode {
    pub listen: Trigger,
    pub conn: Trigger,
}

impl TriggerMode {
    /// The `-m` codes: 0 LT+LT, 1 LT+ET, 2 ET+LT, 3 ET+ET (listen first).
    pub fn from_code(code: u8) -> Option<Self> {
        let (listen, conn) = match code {
            0 => (Trigger::Level, Trigger::Level),
            1 => (Trigger::Level, Trigger::Edge),
            2 => (Trigger::Edge, Trigger::Level),
            3 => (Trigger::Edge, Trigger::Edge),
            _ => return None,
        };
        Some(Self { listen, conn })
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub addr: SocketAddr,
    pub root: PathBuf,
    pub index: String,
    pub threads: usize,
    pub max_queue_depth: usize,
    pub trigger: TriggerMode,
    /// Connections idle longer than this are closed; in-flight ones never are.
    pub idle_timeout: Duration,
    pub max_connections: usize,
    pub content_type: ContentTypePolicy,
    pub pin_workers: bool,
    /// How long `serve` waits for workers after the dispatcher stops.
    pub shutdown_grace: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            addr: SocketAddr::from((Ipv4Addr::LOCALHOST, DEFAULT_PORT)),
            root: PathBuf::from("./root"),
            index: DEFAULT_INDEX.to_string(),
            threads: DEFAULT_THREADS,
            max_queue_depth: DEFAULT_MAX_QUEUE,
            trigger: TriggerMode::default(),
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            content_type: ContentTypePolicy::default(),
            pin_workers: false,
            shutdown_grace: Duration::from_secs(2),
        }
    }
}

impl ServerConfig {
    pub fn new(addr: SocketAddr, root: impl Into<PathBuf>) -> Self {
        Self {
            addr,
            root: root.into(),
            ..Self::default()
        }
    }

    pub fn index(mut self, name: impl Into<String>) -> Self {
        self.index = name.into();
        self
    }

    pub fn threads(mut self, threads: usize) -> Self {
        self.threads = threads;
        self
    }

    pub fn max_queue_depth(mut self, depth: usize) -> Self {
        self.max_queue_depth = depth;
        self
    }

    pub fn trigger(mut self, mode: TriggerMode) -> Self {
        self.trigger = mode;
        self
    }

    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    pub fn max_connections(mut self, max: usize) -> Self {
        self.max_connections = max;
        self
    }

    pub fn content_type(mut self, policy: ContentTypePolicy) -> Self {
        self.content_type = policy;
        self
    }

    pub fn pin_workers(mut self, pin: bool) -> Self {
        self.pin_workers = pin;
        self
    }

    pub fn shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    pub fn validate(&self) -> EtudeResult<()> {
        if self.threads == 0 {
            return Err(EtudeError::config("thread count must be at least 1"));
        }
        if self.max_queue_depth == 0 {
            return Err(EtudeError::config("queue depth must be at least 1"));
        }
        if self.max_connections == 0 {
            return Err(EtudeError::config("connection limit must be at least 1"));
        }
        if self.idle_timeout.is_zero() {
            return Err(EtudeError::config("idle timeout must be non-zero"));
        }
        if self.index.is_empty() || self.index.contains('/') {
            return Err(EtudeError::config(format!(
                "index file {:?} must be a bare file name",
                self.index
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = ServerConfig::default();
        assert_eq!(config.addr.port(), 9006);
        assert_eq!(config.threads, 8);
        assert_eq!(config.max_queue_depth, 10_000);
        assert_eq!(config.idle_timeout, Duration::from_secs(15));
        config.validate().unwrap();
    }

    #[test]
    fn test_builder_and_validation() {
        let addr: SocketAddr = "0.0.0.0:8080".parse().unwrap();
        let config = ServerConfig::new(addr, "/srv/www").threads(0);
        assert!(matches!(config.validate(), Err(EtudeError::Config(_))));

        let config = ServerConfig::new(addr, "/srv/www")
            .threads(2)
            .max_queue_depth(0);
        assert!(config.validate().is_err());

        let config = ServerConfig::new(addr, "/srv/www").index("a/b.html");
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_trigger_codes() {
        assert_eq!(TriggerMode::from_code(0), Some(TriggerMode::default()));
        let mode = TriggerMode::from_code(2).unwrap();
        assert_eq!(mode.listen, Trigger::Edge);
        assert_eq!(mode.conn, Trigger::Level);
        assert_eq!(TriggerMode::from_code(4), None);
        assert_eq!(Trigger::Edge.epoll_flags(), EPOLLET);
    }
}
