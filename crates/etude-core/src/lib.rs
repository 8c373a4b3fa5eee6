// src/lib.rs
//! Static-file HTTP engine with two interchangeable I/O architectures:
//! an epoll dispatcher feeding a blocking thread pool, and an io_uring
//! pipeline driving each connection as a completion state machine.
//!
//! Both answer a single request per connection and then close it.

pub mod config;
pub mod error;
pub mod logging;
pub mod pipeline;
pub mod pool;
pub mod processor;
pub mod queue;
pub mod ring;
pub mod server;
pub mod syscalls;

pub use config::{QueueConfig, ServerConfig};
pub use error::{EtudeError, EtudeResult};
pub use pipeline::{AsyncRequest, Stage, UringServer};
pub use pool::PoolServer;
pub use processor::{Lookup, RequestProcessor, Response};
pub use queue::GrowableQueue;
pub use server::{Architecture, Server};
