use std::thread;
use std::time::Duration;

use rand::Rng;
use tracing::debug;

use crate::seg::SegmentService;
use crate::PipeError;

/// Identifiers reserved per mutex acquisition. Fixed: trades per-id mutex
/// traffic for fairness between generators.
pub const BATCH_SIZE: u32 = 10;
/// Pause between batches to diffuse contention.
pub const BATCH_PAUSE: Duration = Duration::from_millis(50);
/// Bound on one empty-slot wait; every wake re-checks the terminate flag.
const EMPTY_WAIT: Duration = Duration::from_millis(50);

static NAMES: &[&str] = &[
    "Ana", "Luis", "Mica", "Tomas", "Sofia", "Lucas", "Valen", "Agus", "Cesar", "Lauti",
];
static CITIES: &[&str] = &[
    "Buenos Aires",
    "Cordoba",
    "Rosario",
    "La Plata",
    "Salta",
    "Mendoza",
    "Mar del Plata",
];

/// Formats one record line: `<id>,<name>,<age>,<city>,Gen<child_index>`.
pub fn random_record(id: u32, child_index: u32, rng: &mut impl Rng) -> String {
    let name = NAMES[rng.random_range(0..NAMES.len())];
    let age = rng.random_range(18..=78);
    let city = CITIES[rng.random_range(0..CITIES.len())];
    format!("{},{},{},{},Gen{}", id, name, age, city, child_index)
}

/// One reserved run of identifiers: `[start, start + block)`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Batch {
    pub start: u32,
    pub block: u32,
}

/// Reserves the next identifier batch under the mutex. `None` means the
/// generator should wind down: either `terminate` is set or the id space
/// is exhausted.
pub fn claim_batch(seg: &SegmentService) -> Result<Option<Batch>, PipeError> {
    seg.with_state(|state| {
        if state.terminate != 0 {
            return None;
        }
        let remain = state.total_records as i64 - state.next_id as i64 + 1;
        if remain <= 0 {
            return None;
        }
        let start = state.next_id;
        let block = (remain as u32).min(BATCH_SIZE);
        state.next_id += block;
        Some(Batch { start, block })
    })
}

enum Publish {
    Done,
    Retry,
    Abort,
}

/// Publishes one record through the slot. `Ok(false)` means the terminate
/// flag was observed and nothing was published.
pub(crate) fn publish(seg: &SegmentService, id: u32, line: &str) -> Result<bool, PipeError> {
    loop {
        let acquired = seg.wait_empty(EMPTY_WAIT)?;
        let outcome = seg.with_state(|state| {
            if state.terminate != 0 {
                Publish::Abort
            } else if acquired {
                state.store_record(id, line.as_bytes());
                Publish::Done
            } else {
                Publish::Retry
            }
        });
        let outcome = match outcome {
            Ok(o) => o,
            Err(e) => {
                // The free permit was consumed but nothing was published;
                // hand the slot to the consumer so the permit count stays
                // balanced.
                if acquired {
                    let _ = seg.signal_full();
                }
                return Err(e);
            }
        };
        match outcome {
            Publish::Done => {
                seg.signal_full()?;
                return Ok(true);
            }
            Publish::Abort => return Ok(false),
            Publish::Retry => continue,
        }
    }
}

fn retire(seg: &SegmentService) -> Result<(), PipeError> {
    seg.with_state(|state| {
        state.active_generators = state.active_generators.saturating_sub(1);
    })
}

/// The generator loop: claim a batch, publish each id ascending, pause,
/// repeat until the id space is exhausted or terminate is requested. The
/// active-generator count is decremented exactly once on every exit path.
pub fn run(seg: &SegmentService, child_index: u32) -> Result<(), PipeError> {
    let mut rng = rand::rng();
    let result: Result<(), PipeError> = (|| {
        while let Some(batch) = claim_batch(seg)? {
            debug!(child_index, start = batch.start, block = batch.block, "batch reserved");
            for id in batch.start..batch.start + batch.block {
                let line = random_record(id, child_index, &mut rng);
                if !publish(seg, id, &line)? {
                    return Ok(());
                }
            }
            thread::sleep(BATCH_PAUSE);
        }
        Ok(())
    })();
    match retire(seg) {
        Ok(()) => result,
        Err(e) => result.and(Err(e)),
    }
}
