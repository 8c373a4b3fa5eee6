// src/error.rs
use std::io;
use thiserror::Error;

/// Central error type for the etude engine.
///
/// Only startup and worker-fatal failures travel through this type. A failure
/// that belongs to a single connection is logged and answered locally.
#[derive(Debug, Error)]
pub enum EtudeError {
    /// Underlying I/O error from the OS or network.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    /// Rejected server configuration.
    #[error("invalid configuration: {0}")]
    Config(String),
    /// Host/port pair that does not parse into a socket address.
    #[error("invalid listen address `{0}`")]
    Address(String),
    /// A ring had no free submission slot; the request was released.
    #[error("io_uring submission queue is full")]
    SubmissionQueueFull,
    /// Every io_uring worker has stopped reaping completions.
    #[error("all io_uring workers have stopped")]
    RingsStopped,
}

pub type EtudeResult<T> = Result<T, EtudeError>;
