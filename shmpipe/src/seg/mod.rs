use std::mem;
use std::time::Duration;

use raw_sync::events::*;
use raw_sync::locks::*;
use raw_sync::Timeout;
use shared_memory::*;

use serde_derive::{Deserialize, Serialize};

use crate::PipeError;

/// Physical capacity of the slot's record buffer.
pub const RECORD_CAPACITY: usize = 512;
/// Longest record line the slot accepts; anything longer is truncated.
pub const MAX_RECORD_LEN: usize = RECORD_CAPACITY - 1;

pub static DEFAULT_LINK_NAME: &str = "gencsv-pipeline";

// Each sync primitive gets a fixed-size region at the head of the segment.
// 128 bytes covers the pthread mutex/condvar footprints on every supported
// platform.
const REGION_HEAD: usize = 128;

const MUTEX_OFFSET: usize = 0;
const EMPTY_EVENT_OFFSET: usize = REGION_HEAD;
const FULL_EVENT_OFFSET: usize = 2 * REGION_HEAD;
const STATE_OFFSET: usize = 3 * REGION_HEAD;

// A blocked mutex acquisition longer than this means a peer died inside the
// critical section; surface it as an error instead of hanging.
const LOCK_TIMEOUT: Duration = Duration::from_secs(30);

/// The process-shared pipeline state. Lives at a fixed offset inside the
/// segment; every access goes through [`SegmentService::with_state`] so the
/// in-segment mutex is always held around it.
#[repr(C)]
pub struct SharedState {
    /// Next identifier to hand out, 1-based. `total_records + 1` once the
    /// id space is exhausted.
    pub next_id: u32,
    pub total_records: u32,
    /// Records the coordinator has appended and flushed.
    pub total_written: u32,
    /// Sticky shutdown request, 0 or 1.
    pub terminate: u32,
    /// Generator processes that have not yet run their exit path.
    pub active_generators: u32,
    /// Identifier of the record currently in `record`; only meaningful
    /// while the full event is signaled.
    pub published_id: u32,
    pub record_len: u32,
    pub record: [u8; RECORD_CAPACITY],
}

impl SharedState {
    /// Copies `line` into the slot, truncating at [`MAX_RECORD_LEN`].
    pub fn store_record(&mut self, id: u32, line: &[u8]) {
        let len = line.len().min(MAX_RECORD_LEN);
        self.record[..len].copy_from_slice(&line[..len]);
        self.record[len] = 0;
        self.record_len = len as u32;
        self.published_id = id;
    }

    pub fn record_text(&self) -> &[u8] {
        &self.record[..(self.record_len as usize).min(MAX_RECORD_LEN)]
    }
}

const SIZE_OF_STATE: usize = mem::size_of::<SharedState>();

fn map_size() -> usize {
    STATE_OFFSET + SIZE_OF_STATE
}

fn link_path(cfg: &SegConfig) -> String {
    format!("{}/{}", &cfg.data_dir, &cfg.link_name)
}

/// Where the segment's file link lives. Two processes attach to the same
/// pipeline by using the same config.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct SegConfig {
    pub data_dir: String,
    pub link_name: String,
}

impl Default for SegConfig {
    fn default() -> Self {
        SegConfig {
            data_dir: String::from("."),
            link_name: String::from(DEFAULT_LINK_NAME),
        }
    }
}

impl SegConfig {
    pub fn builder() -> SegConfigBuilder {
        SegConfigBuilder {
            inner: SegConfig::default(),
        }
    }
}

pub struct SegConfigBuilder {
    inner: SegConfig,
}

impl SegConfigBuilder {
    pub fn data_dir(mut self, dir: impl Into<String>) -> Self {
        self.inner.data_dir = dir.into();
        self
    }

    pub fn link_name(mut self, name: impl Into<String>) -> Self {
        self.inner.link_name = name.into();
        self
    }

    pub fn build(self) -> SegConfig {
        self.inner
    }
}

/// One attachment to the pipeline segment.
///
/// The coordinator constructs it with [`SegmentService::create`], which also
/// initializes the mutex, the event pair and the state; generators attach
/// with [`SegmentService::open`]. The creator's mapping owns the segment and
/// unlinks it on drop.
pub struct SegmentService {
    shmem: Box<Shmem>,
}

impl SegmentService {
    pub fn create(cfg: &SegConfig, total_records: u32, generators: u32) -> Result<Self, PipeError> {
        let shmem = match ShmemConf::new()
            .size(map_size())
            .flink(link_path(cfg))
            .create()
        {
            Ok(m) => Box::new(m),
            // A link left behind by a dead run is reclaimed and
            // reinitialized below, matching the create-or-attach key scheme.
            Err(ShmemError::LinkExists) => Box::new(ShmemConf::new().flink(link_path(cfg)).open()?),
            Err(e) => return Err(PipeError::SharedMemory(e)),
        };

        if shmem.len() < map_size() {
            return Err(PipeError::Logic(format!(
                "existing segment is too small ({} < {} bytes)",
                shmem.len(),
                map_size()
            )));
        }
        let service = SegmentService { shmem };
        service.init(total_records, generators)?;
        Ok(service)
    }

    pub fn open(cfg: &SegConfig) -> Result<Self, PipeError> {
        let shmem = Box::new(ShmemConf::new().flink(link_path(cfg)).open()?);
        Ok(SegmentService { shmem })
    }

    fn init(&self, total_records: u32, generators: u32) -> Result<(), PipeError> {
        let base = self.shmem.as_ptr();
        unsafe {
            std::ptr::write_bytes(base, 0, map_size());
            Mutex::new(base.add(MUTEX_OFFSET), base.add(STATE_OFFSET)).map_err(PipeError::Sync)?;
            let (empty, _) = Event::new(base.add(EMPTY_EVENT_OFFSET), true).map_err(PipeError::Sync)?;
            Event::new(base.add(FULL_EVENT_OFFSET), true).map_err(PipeError::Sync)?;
            // The slot starts free: empty=1, full=0.
            empty.set(EventState::Signaled).map_err(PipeError::Sync)?;
        }
        self.with_state(|state| {
            state.next_id = 1;
            state.total_records = total_records;
            state.total_written = 0;
            state.terminate = 0;
            state.active_generators = generators;
            state.published_id = 0;
            state.record_len = 0;
        })
    }

    /// Runs `f` with the state borrowed under the in-segment mutex. The
    /// lock is held for the whole closure and released on return.
    pub fn with_state<R, F>(&self, f: F) -> Result<R, PipeError>
    where
        F: FnOnce(&mut SharedState) -> R,
    {
        let base = self.shmem.as_ptr();
        let (mutex, _) = unsafe { Mutex::from_existing(base.add(MUTEX_OFFSET), base.add(STATE_OFFSET)) }
            .map_err(PipeError::Sync)?;
        let guard = mutex
            .try_lock(Timeout::Val(LOCK_TIMEOUT))
            .map_err(PipeError::Sync)?;
        let state = unsafe { &mut *((*guard) as *mut SharedState) };
        Ok(f(state))
    }

    /// Waits for the slot to become free. `Ok(true)` means the free permit
    /// was consumed; `Ok(false)` that the wait timed out.
    pub fn wait_empty(&self, timeout: Duration) -> Result<bool, PipeError> {
        self.wait_event(EMPTY_EVENT_OFFSET, timeout)
    }

    /// Waits for a published record. Same contract as [`Self::wait_empty`].
    pub fn wait_full(&self, timeout: Duration) -> Result<bool, PipeError> {
        self.wait_event(FULL_EVENT_OFFSET, timeout)
    }

    pub fn signal_empty(&self) -> Result<(), PipeError> {
        self.signal_event(EMPTY_EVENT_OFFSET)
    }

    pub fn signal_full(&self) -> Result<(), PipeError> {
        self.signal_event(FULL_EVENT_OFFSET)
    }

    fn wait_event(&self, offset: usize, timeout: Duration) -> Result<bool, PipeError> {
        let base = self.shmem.as_ptr();
        let (event, _) =
            unsafe { Event::from_existing(base.add(offset)) }.map_err(PipeError::Sync)?;
        // raw_sync reports a timed-out wait as an error; fold it into the
        // caller's retry path.
        Ok(event.wait(Timeout::Val(timeout)).is_ok())
    }

    fn signal_event(&self, offset: usize) -> Result<(), PipeError> {
        let base = self.shmem.as_ptr();
        let (event, _) =
            unsafe { Event::from_existing(base.add(offset)) }.map_err(PipeError::Sync)?;
        event.set(EventState::Signaled).map_err(PipeError::Sync)
    }
}
