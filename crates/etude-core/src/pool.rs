// src/pool.rs
//! Readiness-driven dispatcher feeding a fixed pool of blocking workers.
//!
//! One thread owns the epoll set. The listener stays registered for the life
//! of the server; every accepted connection is registered once, and the first
//! time it turns readable it is unregistered and handed to the pool. Workers
//! do one blocking read, answer, and close, so no connection is ever seen twice.

use crate::config::{QueueConfig, ServerConfig};
use crate::error::EtudeResult;
use crate::processor::RequestProcessor;
use crate::queue::GrowableQueue;
use crate::server::{AcceptBackoff, spawn_worker};
use crate::syscalls::{self, EPOLLIN, Epoll, epoll_event};
use std::net::{SocketAddr, TcpListener};
use std::os::fd::{AsRawFd, FromRawFd, IntoRawFd, OwnedFd, RawFd};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use tracing::{debug, info, warn};

/// Connections that are readable and waiting for a worker.
///
/// Each `push` wakes exactly one waiter, so every signal is backed by an
/// element that some worker will take.
pub struct WorkQueue {
    pending: Mutex<GrowableQueue<RawFd>>,
    available: Condvar,
}

impl WorkQueue {
    pub fn new(config: QueueConfig) -> Self {
        Self {
            pending: Mutex::new(GrowableQueue::new(
                config.initial_capacity,
                config.grow_step,
                config.shrink_threshold,
            )),
            available: Condvar::new(),
        }
    }

    pub fn push(&self, fd: RawFd) {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .enqueue(fd);
        self.available.notify_one();
    }

    /// Block until a descriptor is available. The lock is released on return,
    /// before the caller touches the connection.
    pub fn pop(&self) -> RawFd {
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        loop {
            if let Some(fd) = pending.dequeue() {
                return fd;
            }
            pending = self
                .available
                .wait(pending)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    pub fn len(&self) -> usize {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub struct PoolServer {
    config: ServerConfig,
    listener: TcpListener,
    queue: Arc<WorkQueue>,
    processor: Arc<RequestProcessor>,
}

impl PoolServer {
    /// Validate the configuration and open the listening socket.
    pub fn bind(config: ServerConfig) -> EtudeResult<Self> {
        config.validate()?;
        let addr = config.socket_addr()?;
        let listener = TcpListener::from(syscalls::create_listen_socket(&addr, config.backlog, true)?);
        info!("Listening on {} (thread pool, {} workers)", listener.local_addr()?, config.workers);

        Ok(Self {
            queue: Arc::new(WorkQueue::new(config.queue)),
            processor: Arc::new(RequestProcessor::new(config.document_root.clone())),
            listener,
            config,
        })
    }

    pub fn local_addr(&self) -> EtudeResult<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Start the workers and run the dispatch loop on the calling thread.
    /// Returns only if waiting for readiness fails.
    pub fn serve(self) -> EtudeResult<()> {
        syscalls::ignore_sigpipe();
        let epoll = Epoll::new()?;

        for i in 0..self.config.workers {
            let queue = self.queue.clone();
            let processor = self.processor.clone();
            let buffer_size = self.config.buffer_size;
            spawn_worker("worker", i, self.config.pin_workers, move || {
                worker_loop(&queue, &processor, buffer_size)
            })?;
        }

        self.dispatch(&epoll)
    }

    fn dispatch(&self, epoll: &Epoll) -> EtudeResult<()> {
        let listen_fd = self.listener.as_raw_fd();
        epoll.add(listen_fd, listen_fd as u64, EPOLLIN)?;

        let mut events = vec![epoll_event { events: 0, u64: 0 }; self.config.max_events];
        let mut backoff = AcceptBackoff::default();

        loop {
            let n = epoll.wait(&mut events, -1)?;

            for event in &events[..n] {
                let token = event.u64;

                if token == listen_fd as u64 {
                    self.accept_one(epoll, listen_fd, &mut backoff);
                    continue;
                }

                let fd = token as RawFd;
                // Unregister first so the descriptor cannot be reported again
                // while a worker owns it.
                if let Err(e) = epoll.delete(fd) {
                    warn!("failed to unregister connection {}: {}", fd, e);
                }
                self.queue.push(fd);
            }
        }
    }

    fn accept_one(&self, epoll: &Epoll, listen_fd: RawFd, backoff: &mut AcceptBackoff) {
        match syscalls::accept_connection(listen_fd) {
            Ok(Some(conn)) => {
                backoff.accepted();
                let fd = conn.into_raw_fd();
                if let Err(e) = epoll.add(fd, fd as u64, EPOLLIN) {
                    warn!("failed to register connection {}: {}", fd, e);
                    // SAFETY: registration failed, so ownership never left us.
                    drop(unsafe { OwnedFd::from_raw_fd(fd) });
                }
            }
            Ok(None) => {}
            // The listener stays readable, so the next wait retries after the pause.
            Err(e) => {
                backoff.failed(&e);
            }
        }
    }
}

fn worker_loop(queue: &WorkQueue, processor: &RequestProcessor, buffer_size: usize) {
    let mut buffer = vec![0u8; buffer_size];

    loop {
        let fd = queue.pop();
        // SAFETY: the dispatcher hands over sole ownership of every queued descriptor.
        let conn = unsafe { OwnedFd::from_raw_fd(fd) };
        handle_connection(conn.as_raw_fd(), &mut buffer, processor);
    }
}

/// Serve one request on `fd` with a single read. The caller closes `fd`.
pub(crate) fn handle_connection(fd: RawFd, buffer: &mut [u8], processor: &RequestProcessor) {
    let n = match syscalls::read_blocking(fd, buffer) {
        Ok(n) => n,
        Err(e) => {
            debug!("read on connection {} failed: {}", fd, e);
            0
        }
    };

    let response = processor.process(&buffer[..n]);
    if let Err(e) = syscalls::writev_all(fd, &response.segments()) {
        debug!("write on connection {} failed: {}", fd, e);
    }
}
