//! Port buffer boundary.
//!
//! Storage and allocation belong to the graph wiring, not to the executor.
//! The executor sees an output port as an [`OutputBuffer`] (the single
//! writer side) and an input port as an [`InputReader`] (one of possibly
//! many read cursors on an upstream buffer). Both are shared between the
//! producer and its consumers, so every method takes `&self` and
//! implementations guard their metadata with their own lock.
//!
//! Lock discipline: a method that reads more than one field (the
//! snapshots) or runs a blocked callback must do so under the buffer's
//! lock, and must not call back into the executor while holding it.

use crate::tag::Tag;

/// Free space and done flag of an output buffer, read under one lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutputSnapshot {
    /// Items that can be written without overrunning the slowest reader.
    pub space_available: usize,
    /// Downstream has finished; nothing written here will be read.
    pub done: bool,
}

/// Readable items and done flag of an input reader, read under one lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InputSnapshot {
    /// Items written upstream and not yet consumed by this reader.
    pub items_available: usize,
    /// Upstream has finished; no further items will arrive.
    pub done: bool,
}

/// Writer side of a port buffer.
pub trait OutputBuffer: Send + Sync {
    /// Items that can currently be written.
    fn space_available(&self) -> usize;

    /// Total buffer capacity in items.
    fn capacity(&self) -> usize;

    /// Whether the buffer has been marked done.
    fn done(&self) -> bool;

    /// Mark the writer finished.
    fn set_done(&self, done: bool);

    /// Space and done flag taken atomically.
    fn snapshot(&self) -> OutputSnapshot;

    /// Absolute count of items written so far.
    fn nitems_written(&self) -> u64;

    /// Advance the write cursor by `nitems`.
    fn produce(&self, nitems: usize);

    /// Publish a tag for readers of this buffer.
    fn add_item_tag(&self, tag: Tag);

    /// Bookkeeping hook: the owning block is inside a call.
    fn set_active(&self, _active: bool) {}

    /// Bookkeeping hook run once at the end of every work call.
    fn post_work(&self) {}

    /// Ask the buffer to relieve a full condition in place.
    ///
    /// Implementations check whether a blocked callback is installed and
    /// ready for `output_multiple` items and run it, all under their lock.
    /// Returns true when space may have been freed and the caller should
    /// look again.
    fn unblock_output(&self, _output_multiple: usize) -> bool {
        false
    }

    /// Informational blocked notice: the block ran but wrote nothing.
    fn notify_output_blocked(&self, _output_multiple: usize) {}
}

/// Reader side of a port buffer.
pub trait InputReader: Send + Sync {
    /// Items ready to be consumed.
    fn items_available(&self) -> usize;

    /// Whether upstream has finished.
    fn done(&self) -> bool;

    /// Mark this reader finished so upstream can observe it.
    fn set_done(&self, done: bool);

    /// Available items and done flag taken atomically.
    fn snapshot(&self) -> InputSnapshot;

    /// Largest number of items this reader could ever see at once.
    fn max_possible_items_available(&self) -> usize;

    /// Absolute count of items consumed so far.
    fn nitems_read(&self) -> u64;

    /// Advance the read cursor by `nitems`.
    fn consume(&self, nitems: usize);

    /// Tags with `start <= offset < end`, in publication order.
    fn tags_in_range(&self, start: u64, end: u64) -> Vec<Tag>;

    /// Bookkeeping hook: the owning block is inside a call.
    fn set_active(&self, _active: bool) {}

    /// Bookkeeping hook run once at the end of every work call.
    fn post_work(&self) {}

    /// Ask the buffer to relieve an empty condition in place.
    ///
    /// `items_required` is what the block needs, `items_available` what
    /// it last saw. Readiness check and callback run under the buffer's
    /// lock. Returns true when the caller should look again.
    fn unblock_input(&self, _items_required: usize, _items_available: usize) -> bool {
        false
    }
}
