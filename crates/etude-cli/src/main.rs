use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use etude_core::config::{
    DEFAULT_BUFFER_SIZE, DEFAULT_DOCUMENT_ROOT, DEFAULT_HOST, DEFAULT_PORT, DEFAULT_RING_ENTRIES,
};
use etude_core::{Architecture, Server, ServerConfig, logging};
use std::path::PathBuf;

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[derive(Parser)]
#[command(name = "etude")]
#[command(about = "Serve the files of one directory over HTTP, one request per connection")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// epoll acceptor feeding a pool of blocking workers
    Epoll(ServeArgs),
    /// One io_uring per worker, completion-driven
    Uring(ServeArgs),
}

#[derive(Args, Debug)]
struct ServeArgs {
    /// Address to listen on
    #[arg(long, default_value = DEFAULT_HOST)]
    host: String,
    #[arg(long, default_value_t = DEFAULT_PORT)]
    port: u16,
    /// Worker threads (pool) or rings (uring); defaults to the CPU count
    #[arg(long)]
    workers: Option<usize>,
    /// Directory the request's final path segment is looked up in
    #[arg(long, default_value = DEFAULT_DOCUMENT_ROOT)]
    root: PathBuf,
    /// Bytes taken from each connection in its single read
    #[arg(long, default_value_t = DEFAULT_BUFFER_SIZE)]
    buffer_size: usize,
    #[arg(long, default_value_t = DEFAULT_RING_ENTRIES)]
    ring_entries: u32,
    /// Do not pin workers to CPU cores
    #[arg(long)]
    no_pin: bool,
    /// Fallback level when RUST_LOG is unset
    #[arg(long, default_value = "info")]
    log_level: String,
    /// Emit logs as JSON lines
    #[arg(long)]
    log_json: bool,
}

impl ServeArgs {
    fn config(&self) -> ServerConfig {
        let mut config = ServerConfig::default()
            .bind(&self.host, self.port)
            .document_root(self.root.clone())
            .buffer_size(self.buffer_size)
            .ring_entries(self.ring_entries)
            .pin_workers(!self.no_pin);
        if let Some(workers) = self.workers {
            config = config.workers(workers);
        }
        config
    }
}

fn main() {
    if let Err(err) = run(Cli::parse()) {
        eprintln!("[FATAL] {:#}", err);
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> anyhow::Result<()> {
    let (architecture, args) = match cli.command {
        Commands::Epoll(args) => (Architecture::ThreadPool, args),
        Commands::Uring(args) => (Architecture::Uring, args),
    };

    if args.log_json {
        logging::init_logging_json(&args.log_level)?;
    } else {
        logging::init_logging_with_level(&args.log_level)?;
    }

    let config = args.config();
    tracing::info!(
        "Starting etude ({:?}) serving {}",
        architecture,
        config.document_root.display()
    );

    Server::new(config)
        .serve(architecture)
        .with_context(|| format!("{:?} server failed", architecture))
}
