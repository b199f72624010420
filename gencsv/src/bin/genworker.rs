use std::error::Error;

use clap::Parser;
use tracing::debug;

use shmpipe::generator;
use shmpipe::seg::{SegConfig, SegmentService};

/// Internal generator worker spawned by `gencsv`; attaches to the
/// coordinator's shared-memory segment and runs one generator loop.
#[derive(Parser)]
#[command(name = "genworker")]
struct Opts {
    /// 1-based index of this generator, recorded in every produced line.
    #[arg(long, value_parser = clap::value_parser!(u32).range(1..))]
    child_index: u32,
    /// Directory holding the segment's file link.
    #[arg(long)]
    data_dir: String,
    /// Name of the segment's file link.
    #[arg(long)]
    link_name: String,
}

fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt::init();
    let opts = Opts::parse();
    let cfg = SegConfig::builder()
        .data_dir(opts.data_dir)
        .link_name(opts.link_name)
        .build();
    let seg = SegmentService::open(&cfg)?;
    generator::run(&seg, opts.child_index)?;
    debug!(child_index = opts.child_index, "generator finished");
    Ok(())
}
