use std::error::Error;
use std::fs::File;
use std::io::BufWriter;
use std::path::PathBuf;
use std::process::{Child, Command};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use clap::Parser;
use signal_hook::consts::signal::{SIGINT, SIGTERM};
use signal_hook::iterator::Signals;
use tracing::{error, info, warn};

use shmpipe::coordinator;
use shmpipe::seg::{SegConfig, SegmentService};

/// Generates a CSV of random records with N cooperating generator
/// processes feeding one coordinator through a shared-memory slot.
#[derive(Parser)]
#[command(name = "gencsv")]
struct Opts {
    /// Number of generator processes to spawn.
    #[arg(value_parser = clap::value_parser!(u32).range(1..))]
    n_generators: u32,
    /// Total number of records to produce.
    #[arg(value_parser = clap::value_parser!(u32).range(1..))]
    total_records: u32,
    /// Output CSV path.
    output_path: PathBuf,
    /// TOML file overriding the shared-memory link location.
    #[arg(short = 'c', long = "config")]
    config: Option<PathBuf>,
    /// Keep the IPC resources alive until ENTER is pressed, for manual
    /// inspection with ipcs/ls.
    #[arg(long)]
    pause_before_cleanup: bool,
}

fn worker_exe() -> Result<PathBuf, Box<dyn Error>> {
    let me = std::env::current_exe()?;
    let dir = me
        .parent()
        .ok_or("cannot locate the directory of the current executable")?;
    Ok(dir.join("genworker"))
}

fn spawn_workers(
    exe: &PathBuf,
    cfg: &SegConfig,
    seg: &SegmentService,
    n_generators: u32,
) -> Result<Vec<Child>, Box<dyn Error>> {
    let mut children: Vec<Child> = Vec::with_capacity(n_generators as usize);
    for child_index in 1..=n_generators {
        let spawned = Command::new(exe)
            .arg("--child-index")
            .arg(child_index.to_string())
            .arg("--data-dir")
            .arg(&cfg.data_dir)
            .arg("--link-name")
            .arg(&cfg.link_name)
            .spawn();
        match spawned {
            Ok(child) => children.push(child),
            Err(e) => {
                error!(child_index, error = %e, "failed to spawn generator process");
                // Workers that never started will never retire themselves;
                // take them out of the active count so the pipeline can
                // still wind down.
                let unspawned = n_generators - children.len() as u32;
                seg.with_state(|s| {
                    s.active_generators = s.active_generators.saturating_sub(unspawned)
                })?;
                coordinator::request_shutdown(seg, n_generators)?;
                for mut child in children {
                    let _ = child.wait();
                }
                return Err(Box::new(e));
            }
        }
    }
    Ok(children)
}

fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt::init();
    let opts = Opts::parse();

    if opts.output_path.extension().is_none() {
        warn!(
            path = %opts.output_path.display(),
            "output file has no extension, .csv is recommended"
        );
    }

    let seg_cfg: SegConfig = match &opts.config {
        Some(path) => confy::load_path(path)?,
        None => SegConfig::default(),
    };

    let file = File::create(&opts.output_path)?;
    let mut sink = BufWriter::new(file);
    coordinator::write_header(&mut sink)?;

    let seg = SegmentService::create(&seg_cfg, opts.total_records, opts.n_generators)?;

    let closing = Arc::new(AtomicBool::new(false));
    let mut signals = Signals::new([SIGINT, SIGTERM])?;
    {
        let closing = Arc::clone(&closing);
        thread::spawn(move || {
            for _ in signals.forever() {
                closing.store(true, Ordering::SeqCst);
            }
        });
    }

    let exe = worker_exe()?;
    let mut children = spawn_workers(&exe, &seg_cfg, &seg, opts.n_generators)?;

    let run_result = coordinator::run(&seg, &mut sink, &closing);
    if let Err(e) = coordinator::request_shutdown(&seg, opts.n_generators) {
        warn!(error = %e, "shutdown request failed");
    }
    for child in &mut children {
        match child.wait() {
            Ok(status) if !status.success() => {
                warn!(pid = child.id(), %status, "generator exited abnormally")
            }
            Ok(_) => {}
            Err(e) => warn!(pid = child.id(), error = %e, "failed to reap generator"),
        }
    }

    let written = run_result?;
    info!(
        records = written,
        generators = opts.n_generators,
        path = %opts.output_path.display(),
        "csv generated"
    );

    if opts.pause_before_cleanup {
        println!("Paused with IPC resources still in place. Press ENTER to clean up and exit.");
        let mut line = String::new();
        std::io::stdin().read_line(&mut line)?;
    }
    Ok(())
}
