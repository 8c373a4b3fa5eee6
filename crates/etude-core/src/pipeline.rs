// src/pipeline.rs
//! Completion-driven request pipeline on top of one io_uring per worker.
//!
//! Every connection is an [`AsyncRequest`] that walks a strict stage sequence:
//!
//! ```text
//! Read ──found──> ReadFile ──> Write ──> (dropped)
//!   └──missing──────────────> Write ──> (dropped)
//! ```
//!
//! The request is boxed and its pointer rides along as the submission's user
//! data, so whichever operation is outstanding owns it. The worker rebuilds the
//! box from the completion, advances the stage and either submits again or
//! drops it, which closes the file and socket and frees the buffers.

use crate::config::ServerConfig;
use crate::error::{EtudeError, EtudeResult};
use crate::processor::{Lookup, NOT_FOUND_RESPONSE, RequestProcessor, ok_headers, open_regular};
use crate::ring::Ring;
use crate::server::{AcceptBackoff, spawn_worker};
use crate::syscalls;
use io_uring::{opcode, squeue, types};
use libc::c_void;
use std::fs::File;
use std::net::{SocketAddr, TcpListener};
use std::os::fd::{AsRawFd, OwnedFd};
use std::path::Path;
use std::ptr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// Waiting for the request bytes from the client.
    Read,
    /// Waiting for the whole file to land in the body buffer.
    ReadFile,
    /// Waiting for the response to go out; terminal.
    Write,
}

/// What the worker does with a request after a completion.
pub enum Transition {
    Submit(Box<AsyncRequest>),
    Finished(Box<AsyncRequest>),
}

const EMPTY_IOVEC: libc::iovec = libc::iovec {
    iov_base: ptr::null_mut(),
    iov_len: 0,
};

/// Per-connection state.
///
/// `buffers` holds the request buffer while reading, headers and body while
/// serving a file, and nothing while sending the 404.
pub struct AsyncRequest {
    stage: Stage,
    socket: OwnedFd,
    file: Option<File>,
    buffers: Vec<Vec<u8>>,
    iovecs: [libc::iovec; 2],
}

impl AsyncRequest {
    pub fn new(socket: OwnedFd, buffer_size: usize) -> Box<Self> {
        Box::new(Self {
            stage: Stage::Read,
            socket,
            file: None,
            buffers: vec![vec![0u8; buffer_size]],
            iovecs: [EMPTY_IOVEC; 2],
        })
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    pub fn buffers(&self) -> &[Vec<u8>] {
        &self.buffers
    }

    pub fn has_file(&self) -> bool {
        self.file.is_some()
    }

    /// Build the submission entry for the current stage. The entry borrows
    /// raw pointers into `self`, which must not move until it completes.
    pub(crate) fn prepare(&mut self) -> squeue::Entry {
        let socket = types::Fd(self.socket.as_raw_fd());

        match self.stage {
            Stage::Read => {
                let buf = &mut self.buffers[0];
                opcode::Read::new(socket, buf.as_mut_ptr(), buf.len() as u32).build()
            }
            Stage::ReadFile => {
                // A missing file yields EBADF, which the completion turns into a 404.
                let fd = self.file.as_ref().map_or(-1, |f| f.as_raw_fd());
                let body = &mut self.buffers[1];
                opcode::Read::new(types::Fd(fd), body.as_mut_ptr(), body.len() as u32)
                    .offset(0)
                    .build()
            }
            Stage::Write if self.buffers.is_empty() => opcode::Write::new(
                socket,
                NOT_FOUND_RESPONSE.as_ptr(),
                NOT_FOUND_RESPONSE.len() as u32,
            )
            .build(),
            Stage::Write => {
                for (iov, buf) in self.iovecs.iter_mut().zip(&self.buffers) {
                    *iov = libc::iovec {
                        iov_base: buf.as_ptr() as *mut c_void,
                        iov_len: buf.len(),
                    };
                }
                let count = self.buffers.len().min(self.iovecs.len());
                opcode::Writev::new(socket, self.iovecs.as_ptr(), count as u32).build()
            }
        }
    }

    /// Advance the state machine with the completion `result` (bytes
    /// transferred, or a negated errno).
    pub fn complete(mut self: Box<Self>, result: i32, processor: &RequestProcessor) -> Transition {
        match self.stage {
            Stage::Read => {
                let read = if result < 0 {
                    debug!("read on connection {} failed: errno {}", self.socket.as_raw_fd(), -result);
                    0
                } else {
                    result as usize
                };

                let mut request = self.buffers.pop().unwrap_or_default();
                request.truncate(read);
                request.shrink_to_fit();

                match processor.lookup(&request) {
                    Lookup::Found { path, size } => self.begin_file(&path, size),
                    Lookup::NotFound => self.begin_not_found(),
                }
                Transition::Submit(self)
            }
            Stage::ReadFile => {
                let expected = self.buffers.get(1).map_or(0, Vec::len);
                if result < 0 || result as usize != expected {
                    warn!("file read returned {} of {} bytes, answering 404", result, expected);
                    self.begin_not_found();
                } else {
                    self.stage = Stage::Write;
                }
                Transition::Submit(self)
            }
            Stage::Write => {
                let expected = if self.buffers.is_empty() {
                    NOT_FOUND_RESPONSE.len()
                } else {
                    self.buffers.iter().map(Vec::len).sum()
                };
                if result < 0 {
                    debug!("write on connection {} failed: errno {}", self.socket.as_raw_fd(), -result);
                } else if result as usize != expected {
                    debug!("short write on connection {}: {} of {} bytes", self.socket.as_raw_fd(), result, expected);
                }
                Transition::Finished(self)
            }
        }
    }

    fn begin_file(&mut self, path: &Path, size: u64) {
        if size > u32::MAX as u64 {
            warn!("{} is too large for a single read ({} bytes)", path.display(), size);
            self.begin_not_found();
            return;
        }

        match open_regular(path) {
            Ok(file) => {
                self.file = Some(file);
                self.buffers = vec![ok_headers(size), vec![0u8; size as usize]];
                self.stage = Stage::ReadFile;
            }
            Err(e) => {
                warn!("failed to open {}: {}", path.display(), e);
                self.begin_not_found();
            }
        }
    }

    fn begin_not_found(&mut self) {
        self.file = None;
        self.buffers.clear();
        self.stage = Stage::Write;
    }
}

pub struct UringServer {
    config: ServerConfig,
    listener: TcpListener,
    rings: Vec<Arc<Ring>>,
    next_ring: AtomicUsize,
    processor: Arc<RequestProcessor>,
}

impl UringServer {
    /// Validate the configuration, create one ring per worker and open the
    /// listening socket.
    pub fn bind(config: ServerConfig) -> EtudeResult<Self> {
        config.validate()?;

        let rings = (0..config.workers)
            .map(|_| Ring::new(config.ring_entries).map(Arc::new))
            .collect::<EtudeResult<Vec<_>>>()?;

        let addr = config.socket_addr()?;
        let listener = TcpListener::from(syscalls::create_listen_socket(&addr, config.backlog, false)?);
        info!("Listening on {} (io_uring, {} rings)", listener.local_addr()?, rings.len());

        Ok(Self {
            processor: Arc::new(RequestProcessor::new(config.document_root.clone())),
            next_ring: AtomicUsize::new(0),
            rings,
            listener,
            config,
        })
    }

    pub fn local_addr(&self) -> EtudeResult<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Start one worker per ring and run the blocking accept loop on the
    /// calling thread. Returns once every ring worker has stopped.
    pub fn serve(self) -> EtudeResult<()> {
        syscalls::ignore_sigpipe();

        for (i, ring) in self.rings.iter().enumerate() {
            let ring = ring.clone();
            let processor = self.processor.clone();
            spawn_worker("ring", i, self.config.pin_workers, move || {
                ring_loop(i, &ring, &processor)
            })?;
        }

        let listen_fd = self.listener.as_raw_fd();
        let mut backoff = AcceptBackoff::default();
        loop {
            match syscalls::accept_connection(listen_fd) {
                Ok(Some(socket)) => {
                    backoff.accepted();
                    let ring = self.next_ring().ok_or(EtudeError::RingsStopped)?;
                    let request = AsyncRequest::new(socket, self.config.buffer_size);
                    if let Err(e) = ring.submit(request) {
                        warn!("dropping connection: {}", e);
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    backoff.failed(&e);
                }
            }
        }
    }

    /// Round-robin over the rings whose worker is still reaping. `None` when
    /// all of them have stopped.
    fn next_ring(&self) -> Option<&Ring> {
        let start = self.next_ring.fetch_add(1, Ordering::Relaxed);
        (0..self.rings.len())
            .map(|offset| &*self.rings[(start + offset) % self.rings.len()])
            .find(|ring| ring.is_alive())
    }
}

fn ring_loop(index: usize, ring: &Ring, processor: &RequestProcessor) {
    loop {
        let cqe = match ring.wait_one() {
            Ok(cqe) => cqe,
            Err(e) => {
                error!("ring {} stopped: {}", index, e);
                ring.mark_dead();
                return;
            }
        };

        // SAFETY: every submission on this ring carries a pointer produced by
        // `Box::into_raw` in `Ring::submit`, and each completes exactly once.
        let request = unsafe { Box::from_raw(cqe.user_data() as *mut AsyncRequest) };

        match request.complete(cqe.result(), processor) {
            Transition::Submit(next) => {
                if let Err(e) = ring.submit(next) {
                    warn!("ring {}: {}", index, e);
                }
            }
            Transition::Finished(done) => drop(done),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::io::Read;
    use std::os::unix::net::UnixStream;
    use tempfile::TempDir;

    fn setup() -> (TempDir, RequestProcessor) {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("index.html"), b"hello docs").unwrap();
        let processor = RequestProcessor::new(dir.path());
        (dir, processor)
    }

    /// Pretend the kernel delivered `bytes` into the request buffer.
    fn complete_read(mut request: Box<AsyncRequest>, bytes: &[u8], processor: &RequestProcessor) -> Transition {
        request.buffers[0][..bytes.len()].copy_from_slice(bytes);
        request.complete(bytes.len() as i32, processor)
    }

    fn expect_submit(transition: Transition) -> Box<AsyncRequest> {
        match transition {
            Transition::Submit(request) => request,
            Transition::Finished(_) => panic!("request finished early"),
        }
    }

    #[test]
    fn test_existing_file_walks_read_readfile_write() {
        let (_dir, processor) = setup();
        let (ours, mut theirs) = UnixStream::pair().unwrap();
        let mut stages = Vec::new();

        let request = AsyncRequest::new(OwnedFd::from(ours), 4096);
        stages.push(request.stage());

        let mut request = expect_submit(complete_read(
            request,
            b"GET /index.html HTTP/1.1\r\nHost: x\r\n\r\n",
            &processor,
        ));
        stages.push(request.stage());
        assert!(request.has_file());
        assert_eq!(request.buffers().len(), 2);
        assert_eq!(request.buffers()[1].len(), 10);

        request.buffers[1].copy_from_slice(b"hello docs");
        let mut request = expect_submit(request.complete(10, &processor));
        stages.push(request.stage());

        let _ = request.prepare();
        assert_eq!(request.iovecs[0].iov_len, request.buffers[0].len());
        assert_eq!(request.iovecs[1].iov_len, 10);
        let wire = request.buffers().concat();
        assert_eq!(
            wire,
            b"HTTP/1.1 200 OK\r\nConnection: close\r\nContent-Type: text/javascript\r\nContent-Length: 10\r\n\r\nhello docs"
        );

        match request.complete(wire.len() as i32, &processor) {
            Transition::Finished(done) => drop(done),
            Transition::Submit(_) => panic!("write must be terminal"),
        }
        assert_eq!(stages, [Stage::Read, Stage::ReadFile, Stage::Write]);

        // dropping the finished request closed the client socket
        let mut rest = Vec::new();
        theirs.read_to_end(&mut rest).unwrap();
        assert!(rest.is_empty());
    }

    #[test]
    fn test_missing_file_skips_straight_to_write() {
        let (_dir, processor) = setup();
        let (ours, _theirs) = UnixStream::pair().unwrap();

        let request = AsyncRequest::new(OwnedFd::from(ours), 4096);
        let mut request = expect_submit(complete_read(
            request,
            b"GET /missing.txt HTTP/1.1\r\n\r\n",
            &processor,
        ));

        assert_eq!(request.stage(), Stage::Write);
        assert!(!request.has_file());
        assert!(request.buffers().is_empty());
        let _ = request.prepare();

        assert!(matches!(
            request.complete(NOT_FOUND_RESPONSE.len() as i32, &processor),
            Transition::Finished(_)
        ));
    }

    #[test]
    fn test_truncated_request_is_answered_with_404() {
        let (_dir, processor) = setup();
        let (ours, _theirs) = UnixStream::pair().unwrap();

        let request = AsyncRequest::new(OwnedFd::from(ours), 4096);
        let request = expect_submit(complete_read(request, b"GET /index.html HTTP/1.1\r\n", &processor));
        assert_eq!(request.stage(), Stage::Write);
        assert!(request.buffers().is_empty());
    }

    #[test]
    fn test_failed_socket_read_is_answered_with_404() {
        let (_dir, processor) = setup();
        let (ours, _theirs) = UnixStream::pair().unwrap();

        let request = AsyncRequest::new(OwnedFd::from(ours), 4096);
        let request = expect_submit(request.complete(-libc::ECONNRESET, &processor));
        assert_eq!(request.stage(), Stage::Write);
        assert!(request.buffers().is_empty());
    }

    #[test]
    fn test_short_file_read_falls_back_to_404() {
        let (_dir, processor) = setup();
        let (ours, _theirs) = UnixStream::pair().unwrap();

        let request = AsyncRequest::new(OwnedFd::from(ours), 4096);
        let request = expect_submit(complete_read(
            request,
            b"GET /index.html HTTP/1.1\r\n\r\n",
            &processor,
        ));
        assert_eq!(request.stage(), Stage::ReadFile);

        let request = expect_submit(request.complete(4, &processor));
        assert_eq!(request.stage(), Stage::Write);
        assert!(!request.has_file());
        assert!(request.buffers().is_empty());
    }

    #[test]
    fn test_next_ring_skips_stopped_workers() {
        let (dir, _processor) = setup();
        let config = ServerConfig::default()
            .bind("127.0.0.1", 0)
            .workers(3)
            .document_root(dir.path())
            .ring_entries(8)
            .pin_workers(false);
        let server = match UringServer::bind(config) {
            Ok(server) => server,
            Err(e) => {
                eprintln!("skipping: io_uring unavailable: {}", e);
                return;
            }
        };

        server.rings[1].mark_dead();
        for _ in 0..6 {
            let ring = server.next_ring().unwrap();
            assert!(!ptr::eq(ring, &*server.rings[1]));
        }

        server.rings[0].mark_dead();
        server.rings[2].mark_dead();
        assert!(server.next_ring().is_none());
    }

    #[test]
    fn test_empty_file_is_served_with_zero_length() {
        let (dir, processor) = setup();
        fs::write(dir.path().join("empty.js"), b"").unwrap();
        let (ours, _theirs) = UnixStream::pair().unwrap();

        let request = AsyncRequest::new(OwnedFd::from(ours), 4096);
        let request = expect_submit(complete_read(
            request,
            b"GET /empty.js HTTP/1.1\r\n\r\n",
            &processor,
        ));
        assert_eq!(request.stage(), Stage::ReadFile);

        let request = expect_submit(request.complete(0, &processor));
        assert_eq!(request.stage(), Stage::Write);
        assert_eq!(request.buffers()[0], ok_headers(0));
        assert!(request.buffers()[1].is_empty());
    }
}
