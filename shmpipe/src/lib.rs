//! A single-slot shared-memory pipeline (`shmpipe`) between multiple record
//! generator processes and one coordinator process.
//!
//! # Overview
//! This crate provides the shared state and the two actor loops of a bounded
//! producer/consumer pipeline:
//!
//! - [`SegConfig`](seg::SegConfig): where the shared-memory segment's file
//!   link lives. Use [`SegConfig::builder()`](seg::SegConfig::builder) to
//!   construct.
//! - [`SegmentService`](seg::SegmentService): creates or attaches to the
//!   segment and mediates every access to the shared [`SharedState`](seg::SharedState).
//! - [`generator`]: the producer loop. Reserves identifier batches, formats
//!   record lines and publishes them into the slot.
//! - [`coordinator`]: the consumer loop. Drains the slot into a CSV sink and
//!   decides termination.
//!
//! # Concurrency model
//!
//! The segment holds one mutex, two auto-reset events and a fixed-layout
//! state struct:
//!
//! - Every field of `SharedState` is read and written only under the
//!   in-segment mutex, through [`SegmentService::with_state`].
//! - The slot is a one-element bounded buffer. The `empty` event counts free
//!   capacity (0 or 1) and the `full` event counts published items (0 or 1);
//!   outside the publishing/consuming critical sections their signaled
//!   counts sum to exactly 1.
//! - The coordinator is the sole consumer of `full`; any generator may be a
//!   producer. A generator that acquires `empty` while `terminate` is set
//!   must exit without publishing.
//!
//! Actors are separate OS processes attaching to the same segment through
//! its file link; the same APIs also work for multiple attachments inside
//! one process, which is how the crate tests itself.

pub mod coordinator;
pub mod errors;
pub mod generator;
pub mod seg;

pub use errors::PipeError;

#[cfg(test)]
mod tests;
