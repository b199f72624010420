use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tracing::{debug, info};

use crate::seg::SegmentService;
use crate::PipeError;

pub static CSV_HEADER: &str = "ID,Nombre,Edad,Ciudad,Fuente";

/// Bound on one full-slot wait; a timeout doubles as the idle pause before
/// the termination conditions are sampled again.
const IDLE_WAIT: Duration = Duration::from_millis(10);

pub fn write_header(sink: &mut impl Write) -> Result<(), PipeError> {
    sink.write_all(CSV_HEADER.as_bytes())?;
    sink.write_all(b"\n")?;
    sink.flush()?;
    Ok(())
}

/// The consume loop. Drains the slot into `sink` one record at a time and
/// returns once every identifier has been handed out, every generator has
/// retired and every record has been persisted, or once `closing` is set
/// by the signal thread.
///
/// Records land in `sink` in publication order; identifier order is not
/// guaranteed.
pub fn run(
    seg: &SegmentService,
    sink: &mut impl Write,
    closing: &AtomicBool,
) -> Result<u32, PipeError> {
    let mut written = 0u32;
    loop {
        if closing.load(Ordering::Relaxed) {
            info!("interrupt observed, winding down");
            break;
        }
        if !seg.wait_full(IDLE_WAIT)? {
            let done = seg.with_state(|state| {
                state.next_id > state.total_records
                    && state.active_generators == 0
                    && state.total_written >= state.total_records
            })?;
            if done {
                break;
            }
            continue;
        }

        let (line, id) = seg.with_state(|state| {
            let line = state.record_text().to_vec();
            state.total_written += 1;
            (line, state.published_id)
        })?;
        sink.write_all(&line)?;
        sink.write_all(b"\n")?;
        sink.flush()?;
        written += 1;
        debug!(id, written, "record persisted");

        seg.signal_empty()?;
    }
    Ok(written)
}

/// Sets the terminate flag and posts one free-slot permit per generator so
/// none is left blocked on an empty-slot wait.
pub fn request_shutdown(seg: &SegmentService, generators: u32) -> Result<(), PipeError> {
    seg.with_state(|state| state.terminate = 1)?;
    for _ in 0..generators {
        seg.signal_empty()?;
    }
    Ok(())
}
