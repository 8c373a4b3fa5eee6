// src/config.rs
use crate::error::{EtudeError, EtudeResult};
use crate::processor::MIN_REQUEST_LEN;
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::PathBuf;

pub const DEFAULT_HOST: &str = "0.0.0.0";
pub const DEFAULT_PORT: u16 = 8080;
pub const DEFAULT_BUFFER_SIZE: usize = 4096;
pub const DEFAULT_BACKLOG: i32 = 65535;
pub const DEFAULT_DOCUMENT_ROOT: &str = "..";
pub const DEFAULT_MAX_EVENTS: usize = 1024;
pub const DEFAULT_RING_ENTRIES: u32 = 256;

/// Sizing of the thread pool's pending-connection queue, in descriptors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueConfig {
    pub initial_capacity: usize,
    pub grow_step: usize,
    pub shrink_threshold: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            initial_capacity: 65536,
            grow_step: 256,
            shrink_threshold: 256,
        }
    }
}

/// Listen parameters, document root and worker sizing shared by both
/// architectures.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Worker threads for the pool, or rings for the io_uring pipeline.
    pub workers: usize,
    /// Upper bound on the bytes taken from a connection in its single read.
    pub buffer_size: usize,
    pub backlog: i32,
    pub document_root: PathBuf,
    /// Readiness events drained per `epoll_wait`.
    pub max_events: usize,
    /// Submission queue entries per io_uring instance.
    pub ring_entries: u32,
    pub queue: QueueConfig,
    pub pin_workers: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            workers: num_cpus::get(),
            buffer_size: DEFAULT_BUFFER_SIZE,
            backlog: DEFAULT_BACKLOG,
            document_root: PathBuf::from(DEFAULT_DOCUMENT_ROOT),
            max_events: DEFAULT_MAX_EVENTS,
            ring_entries: DEFAULT_RING_ENTRIES,
            queue: QueueConfig::default(),
            pin_workers: true,
        }
    }
}

impl ServerConfig {
    pub fn bind(mut self, host: &str, port: u16) -> Self {
        self.host = host.to_string();
        self.port = port;
        self
    }

    pub fn workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn document_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.document_root = root.into();
        self
    }

    pub fn buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = buffer_size;
        self
    }

    pub fn ring_entries(mut self, entries: u32) -> Self {
        self.ring_entries = entries;
        self
    }

    pub fn pin_workers(mut self, pin: bool) -> Self {
        self.pin_workers = pin;
        self
    }

    /// Resolve `host:port`. Literal addresses are preferred; names go through
    /// the system resolver and the first result wins.
    pub fn socket_addr(&self) -> EtudeResult<SocketAddr> {
        let host_port = if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        };

        if let Ok(addr) = host_port.parse() {
            return Ok(addr);
        }
        host_port
            .to_socket_addrs()
            .ok()
            .and_then(|mut addrs| addrs.next())
            .ok_or(EtudeError::Address(host_port))
    }

    pub fn validate(&self) -> EtudeResult<()> {
        if self.workers == 0 {
            return Err(EtudeError::Config("workers must be at least 1".into()));
        }
        if self.buffer_size < MIN_REQUEST_LEN {
            return Err(EtudeError::Config(format!(
                "buffer size {} cannot hold a {}-byte request",
                self.buffer_size, MIN_REQUEST_LEN
            )));
        }
        if self.buffer_size > u32::MAX as usize {
            return Err(EtudeError::Config("buffer size exceeds 4 GiB".into()));
        }
        if self.max_events == 0 {
            return Err(EtudeError::Config("max events must be at least 1".into()));
        }
        if self.ring_entries == 0 {
            return Err(EtudeError::Config("ring entries must be at least 1".into()));
        }
        if self.queue.grow_step == 0 {
            return Err(EtudeError::Config("queue grow step must be at least 1".into()));
        }
        self.socket_addr()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_fixed_server_parameters() {
        let config = ServerConfig::default();
        assert_eq!(config.port, 8080);
        assert_eq!(config.buffer_size, 4096);
        assert_eq!(config.document_root, PathBuf::from(".."));
        assert!(config.workers >= 1);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builder_overrides() {
        let config = ServerConfig::default()
            .bind("127.0.0.1", 0)
            .workers(3)
            .document_root("/srv/www")
            .pin_workers(false);
        assert_eq!(config.socket_addr().unwrap(), "127.0.0.1:0".parse().unwrap());
        assert_eq!(config.workers, 3);
        assert_eq!(config.document_root, PathBuf::from("/srv/www"));
        assert!(!config.pin_workers);
    }

    #[test]
    fn test_ipv6_host_is_bracketed() {
        let config = ServerConfig::default().bind("::1", 9000);
        assert_eq!(config.socket_addr().unwrap(), "[::1]:9000".parse().unwrap());
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        assert!(matches!(
            ServerConfig::default().workers(0).validate(),
            Err(EtudeError::Config(_))
        ));
        assert!(matches!(
            ServerConfig::default().buffer_size(4).validate(),
            Err(EtudeError::Config(_))
        ));
        assert!(matches!(
            ServerConfig::default().ring_entries(0).validate(),
            Err(EtudeError::Config(_))
        ));
        assert!(matches!(
            ServerConfig::default().bind("not an address", 1).validate(),
            Err(EtudeError::Address(_))
        ));
    }
}
