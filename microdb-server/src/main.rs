use std::error::Error;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use clap::Parser;
use serde_derive::{Deserialize, Serialize};
use signal_hook::consts::signal::{SIGINT, SIGTERM};
use signal_hook::iterator::Signals;
use tracing::info;

use microdb::listener::{Listener, ServiceConfig, DEFAULT_POLL_INTERVAL};

/// Serves QUERY/ADD/MODIFY/DELETE commands over a CSV-shaped record file,
/// admitting at most N concurrent clients with an M-slot waiting queue.
#[derive(Parser)]
#[command(name = "microdb-server")]
struct Opts {
    /// TCP port to listen on.
    port: u16,
    /// Path of the record file.
    csv_path: PathBuf,
    /// Maximum concurrent client handlers (N).
    #[arg(value_parser = clap::value_parser!(u64).range(1..))]
    max_clients: u64,
    /// Capacity of the waiting queue (M); also the kernel listen backlog.
    max_waiting: u64,
    /// TOML file overriding service tunables.
    #[arg(short = 'c', long = "config")]
    config: Option<PathBuf>,
}

#[derive(Debug, Serialize, Deserialize)]
struct ServerTuning {
    poll_interval_ms: u64,
}

impl Default for ServerTuning {
    fn default() -> Self {
        ServerTuning {
            poll_interval_ms: DEFAULT_POLL_INTERVAL.as_millis() as u64,
        }
    }
}

fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt::init();
    let opts = Opts::parse();

    let tuning: ServerTuning = match &opts.config {
        Some(path) => confy::load_path(path)?,
        None => ServerTuning::default(),
    };

    let mut cfg = ServiceConfig::new(
        &opts.csv_path,
        opts.max_clients as usize,
        opts.max_waiting as usize,
    );
    cfg.poll_interval = Duration::from_millis(tuning.poll_interval_ms);

    let mut listener = Listener::bind(opts.port, cfg)?;

    let shutdown = Arc::new(AtomicBool::new(false));
    let mut signals = Signals::new([SIGINT, SIGTERM])?;
    {
        let shutdown = Arc::clone(&shutdown);
        thread::spawn(move || {
            for _ in signals.forever() {
                shutdown.store(true, Ordering::SeqCst);
            }
        });
    }

    info!(
        port = opts.port,
        csv = %opts.csv_path.display(),
        max_clients = opts.max_clients,
        max_waiting = opts.max_waiting,
        "server starting"
    );
    listener.run(&shutdown)?;
    info!("server stopped");
    Ok(())
}
