// src/ring.rs
use crate::error::{EtudeError, EtudeResult};
use crate::pipeline::AsyncRequest;
use io_uring::{IoUring, cqueue};
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};
use std::thread;
use std::time::Duration;
use tracing::warn;

const SUBMIT_RETRIES: u32 = 8;
const SUBMIT_RETRY_DELAY: Duration = Duration::from_millis(1);

/// One io_uring instance owned by one worker.
///
/// Any thread may push, serialised by `submit_lock`; only the owning worker
/// reaps completions.
pub struct Ring {
    uring: IoUring,
    submit_lock: Mutex<()>,
    alive: AtomicBool,
}

// SAFETY: the submission queue is only written while holding `submit_lock`,
// and the completion queue only read from the owning worker's `wait_one`.
unsafe impl Send for Ring {}
unsafe impl Sync for Ring {}

impl Ring {
    pub fn new(entries: u32) -> EtudeResult<Self> {
        Ok(Self {
            uring: IoUring::new(entries)?,
            submit_lock: Mutex::new(()),
            alive: AtomicBool::new(true),
        })
    }

    /// False once the owning worker has stopped reaping completions.
    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    pub(crate) fn mark_dead(&self) {
        self.alive.store(false, Ordering::Release);
    }

    /// Queue the operation for the request's current stage and hand the
    /// request to the kernel. It comes back through `wait_one` as user data.
    ///
    /// If the submission queue is full the request is dropped here, which
    /// closes its descriptors.
    pub fn submit(&self, request: Box<AsyncRequest>) -> EtudeResult<()> {
        let _guard = self.submit_lock.lock().unwrap_or_else(PoisonError::into_inner);

        let raw = Box::into_raw(request);
        // SAFETY: `raw` is live and uniquely owned; the buffers and iovecs the
        // entry points at stay at fixed heap addresses until the completion
        // rebuilds the box.
        let entry = unsafe { (*raw).prepare() }.user_data(raw as u64);

        // SAFETY: we hold the submission lock, so no other thread is pushing.
        let pushed = unsafe { self.uring.submission_shared().push(&entry) };
        if pushed.is_err() {
            // SAFETY: the entry never reached the kernel, ownership is still ours.
            drop(unsafe { Box::from_raw(raw) });
            return Err(EtudeError::SubmissionQueueFull);
        }

        // Once pushed the entry belongs to the ring; it cannot be taken back.
        let mut attempts = 0;
        loop {
            match self.uring.submit() {
                Ok(_) => return Ok(()),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e)
                    if attempts < SUBMIT_RETRIES
                        && matches!(e.raw_os_error(), Some(libc::EAGAIN | libc::EBUSY)) =>
                {
                    attempts += 1;
                    thread::sleep(SUBMIT_RETRY_DELAY);
                }
                Err(e) => {
                    warn!("io_uring submit failed: {}; left for the worker's next wait", e);
                    return Ok(());
                }
            }
        }
    }

    /// Block until exactly one completion is available and take it. Entries
    /// pushed but not yet submitted are flushed on the way in.
    pub fn wait_one(&self) -> EtudeResult<cqueue::Entry> {
        loop {
            // SAFETY: only the owning worker reads this ring's completion queue.
            let next = unsafe { self.uring.completion_shared() }.next();
            if let Some(cqe) = next {
                return Ok(cqe);
            }

            match self.uring.submitter().submit_and_wait(1) {
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                // completion queue overflow: reap before entering again
                Err(e) if e.raw_os_error() == Some(libc::EBUSY) => {}
                Err(e) => return Err(e.into()),
            }
        }
    }
}
