// src/server.rs
use crate::config::ServerConfig;
use crate::error::{EtudeError, EtudeResult};
use crate::pipeline::UringServer;
use crate::pool::PoolServer;
use crate::syscalls;
use std::io;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, warn};

/// Pause between accept attempts while the process is out of descriptors.
pub(crate) const ACCEPT_BACKOFF: Duration = Duration::from_millis(20);

/// Which I/O architecture drives the connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Architecture {
    /// Readiness loop feeding a fixed thread pool through a shared queue.
    ThreadPool,
    /// One io_uring per worker, each connection a completion-driven state machine.
    Uring,
}

pub struct Server {
    config: ServerConfig,
}

impl Server {
    pub fn new(config: ServerConfig) -> Self {
        Self { config }
    }

    /// Bind and serve until a fatal error. Never returns `Ok` in practice.
    pub fn serve(self, architecture: Architecture) -> EtudeResult<()> {
        match architecture {
            Architecture::ThreadPool => PoolServer::bind(self.config)?.serve(),
            Architecture::Uring => UringServer::bind(self.config)?.serve(),
        }
    }
}

/// Spawn worker `index` of `role`, pinned round-robin to a core when asked.
pub(crate) fn spawn_worker<F>(role: &str, index: usize, pin: bool, body: F) -> EtudeResult<JoinHandle<()>>
where
    F: FnOnce() + Send + 'static,
{
    let core_id = if pin {
        let core_ids = core_affinity::get_core_ids().unwrap_or_default();
        if core_ids.is_empty() {
            None
        } else {
            Some(core_ids[index % core_ids.len()])
        }
    } else {
        None
    };

    let name = format!("etude-{}-{}", role, index);
    let handle = thread::Builder::new()
        .name(name.clone())
        .spawn(move || {
            if let Some(id) = core_id {
                if core_affinity::set_for_current(id) {
                    debug!("{} pinned to CPU {}", name, id.id);
                } else {
                    warn!("{} failed to pin to CPU {}", name, id.id);
                }
            }
            body();
        })
        .map_err(EtudeError::Io)?;

    Ok(handle)
}

/// Accept failure policy shared by both acceptors.
///
/// Ordinary failures belong to one connection and are skipped. Resource
/// exhaustion leaves the connection queued, so the acceptor sleeps before the
/// next attempt and warns once per episode.
#[derive(Debug, Default)]
pub(crate) struct AcceptBackoff {
    exhausted: bool,
}

impl AcceptBackoff {
    pub(crate) fn accepted(&mut self) {
        if self.exhausted {
            debug!("accepting again after descriptor exhaustion");
            self.exhausted = false;
        }
    }

    /// Log `err` and sleep if it signals exhaustion. Returns whether it slept.
    pub(crate) fn failed(&mut self, err: &io::Error) -> bool {
        if !syscalls::is_resource_exhaustion(err) {
            warn!("accept failed: {}", err);
            return false;
        }

        if !self.exhausted {
            warn!("accept failed: {}; backing off until descriptors are released", err);
            self.exhausted = true;
        }
        thread::sleep(ACCEPT_BACKOFF);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn test_backoff_sleeps_only_on_exhaustion() {
        let mut backoff = AcceptBackoff::default();

        let start = Instant::now();
        assert!(!backoff.failed(&io::Error::from_raw_os_error(libc::ECONNABORTED)));
        assert!(!backoff.exhausted);

        for _ in 0..3 {
            assert!(backoff.failed(&io::Error::from_raw_os_error(libc::EMFILE)));
        }
        assert!(backoff.exhausted);
        assert!(start.elapsed() >= ACCEPT_BACKOFF * 3);

        backoff.accepted();
        assert!(!backoff.exhausted);
    }

    #[test]
    fn test_spawn_worker_names_thread() {
        let handle = spawn_worker("test", 3, false, || {
            assert_eq!(thread::current().name(), Some("etude-test-3"));
        })
        .unwrap();
        handle.join().unwrap();
    }
}
