//! Executor proof harness: in-memory buffers, stock blocks and a single-thread driver.
//!
//! [`CountingBuffer`] keeps only counters, tags and flags; it models the
//! occupancy rules of a ring buffer without storing samples. The stock
//! blocks and [`Harness`] drive executors the way an outer scheduler
//! would, one call per block per round.

use crate::block::{Block, BlockSettings, WorkIo, WorkStatus};
use crate::buffer::{InputReader, InputSnapshot, OutputBuffer, OutputSnapshot};
use crate::executor::{BlockExecutor, ExecState};
use crate::rate::RelativeRate;
use crate::tag::Tag;
use parking_lot::Mutex;
use std::sync::Arc;

/// Write counter and per-reader read counters of a [`CountingBuffer`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Occupancy {
    /// Items written.
    pub written: u64,
    /// Items read, one entry per reader.
    pub read: Vec<u64>,
}

/// Output blocked callback: `(occupancy, output_multiple, informational) -> retry`.
pub type OutputBlockedFn = Box<dyn FnMut(&mut Occupancy, usize, bool) -> bool + Send>;

/// Input blocked callback: `(occupancy, items_required, items_available) -> retry`.
pub type InputBlockedFn = Box<dyn FnMut(&mut Occupancy, usize, usize) -> bool + Send>;

#[derive(Default)]
struct ReaderSlot {
    done: bool,
    active: bool,
    post_work_calls: usize,
    callback: Option<InputBlockedFn>,
}

#[derive(Default)]
struct BufferState {
    occupancy: Occupancy,
    readers: Vec<ReaderSlot>,
    writer_done: bool,
    active: bool,
    post_work_calls: usize,
    tags: Vec<Tag>,
    callback: Option<OutputBlockedFn>,
}

impl BufferState {
    fn space_available(&self, capacity: usize) -> usize {
        let written = self.occupancy.written;
        let backlog = self
            .occupancy
            .read
            .iter()
            .map(|&read| written - read)
            .max()
            .unwrap_or(0);
        capacity.saturating_sub(backlog as usize)
    }

    fn downstream_done(&self) -> bool {
        self.writer_done || (!self.readers.is_empty() && self.readers.iter().all(|r| r.done))
    }
}

/// Single-writer, multi-reader buffer that tracks counts but stores no samples.
pub struct CountingBuffer {
    capacity: usize,
    state: Mutex<BufferState>,
}

impl CountingBuffer {
    /// New buffer holding at most `capacity` unread items per reader.
    pub fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            capacity,
            state: Mutex::new(BufferState::default()),
        })
    }

    /// Attach a reader starting at the current write position.
    pub fn add_reader(self: &Arc<Self>) -> Arc<CountingReader> {
        let mut state = self.state.lock();
        let index = state.readers.len();
        let start = state.occupancy.written;
        state.occupancy.read.push(start);
        state.readers.push(ReaderSlot::default());
        Arc::new(CountingReader {
            buffer: Arc::clone(self),
            index,
        })
    }

    /// Install the output blocked callback.
    pub fn set_blocked_callback(&self, callback: OutputBlockedFn) {
        self.state.lock().callback = Some(callback);
    }

    /// All tags published so far, in publication order.
    pub fn tags(&self) -> Vec<Tag> {
        self.state.lock().tags.clone()
    }

    /// Whether the writer is inside a call.
    pub fn is_active(&self) -> bool {
        self.state.lock().active
    }

    /// End-of-call bookkeeping runs seen by the writer side.
    pub fn post_work_calls(&self) -> usize {
        self.state.lock().post_work_calls
    }
}

impl OutputBuffer for CountingBuffer {
    fn space_available(&self) -> usize {
        self.state.lock().space_available(self.capacity)
    }

    fn capacity(&self) -> usize {
        self.capacity
    }

    fn done(&self) -> bool {
        self.state.lock().downstream_done()
    }

    fn set_done(&self, done: bool) {
        self.state.lock().writer_done = done;
    }

    fn snapshot(&self) -> OutputSnapshot {
        let state = self.state.lock();
        OutputSnapshot {
            space_available: state.space_available(self.capacity),
            done: state.downstream_done(),
        }
    }

    fn nitems_written(&self) -> u64 {
        self.state.lock().occupancy.written
    }

    fn produce(&self, nitems: usize) {
        self.state.lock().occupancy.written += nitems as u64;
    }

    fn add_item_tag(&self, tag: Tag) {
        self.state.lock().tags.push(tag);
    }

    fn set_active(&self, active: bool) {
        self.state.lock().active = active;
    }

    fn post_work(&self) {
        let mut state = self.state.lock();
        state.active = false;
        state.post_work_calls += 1;
    }

    fn unblock_output(&self, output_multiple: usize) -> bool {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        match state.callback.as_mut() {
            Some(callback) => callback(&mut state.occupancy, output_multiple, false),
            None => false,
        }
    }

    fn notify_output_blocked(&self, output_multiple: usize) {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        if let Some(callback) = state.callback.as_mut() {
            callback(&mut state.occupancy, output_multiple, true);
        }
    }
}

/// One read cursor on a [`CountingBuffer`].
pub struct CountingReader {
    buffer: Arc<CountingBuffer>,
    index: usize,
}

impl CountingReader {
    /// The buffer this reader consumes from.
    pub fn buffer(&self) -> &Arc<CountingBuffer> {
        &self.buffer
    }

    /// Install the input blocked callback for this reader.
    pub fn set_blocked_callback(&self, callback: InputBlockedFn) {
        self.buffer.state.lock().readers[self.index].callback = Some(callback);
    }

    /// Whether the reading block is inside a call.
    pub fn is_active(&self) -> bool {
        self.buffer.state.lock().readers[self.index].active
    }

    /// End-of-call bookkeeping runs seen by this reader.
    pub fn post_work_calls(&self) -> usize {
        self.buffer.state.lock().readers[self.index].post_work_calls
    }
}

impl InputReader for CountingReader {
    fn items_available(&self) -> usize {
        let state = self.buffer.state.lock();
        (state.occupancy.written - state.occupancy.read[self.index]) as usize
    }

    fn done(&self) -> bool {
        self.buffer.state.lock().writer_done
    }

    fn set_done(&self, done: bool) {
        self.buffer.state.lock().readers[self.index].done = done;
    }

    fn snapshot(&self) -> InputSnapshot {
        let state = self.buffer.state.lock();
        InputSnapshot {
            items_available: (state.occupancy.written - state.occupancy.read[self.index]) as usize,
            done: state.writer_done,
        }
    }

    fn max_possible_items_available(&self) -> usize {
        self.buffer.capacity
    }

    fn nitems_read(&self) -> u64 {
        self.buffer.state.lock().occupancy.read[self.index]
    }

    fn consume(&self, nitems: usize) {
        let mut state = self.buffer.state.lock();
        let read = state.occupancy.read[self.index] + nitems as u64;
        debug_assert!(read <= state.occupancy.written, "consumed past the write cursor");
        state.occupancy.read[self.index] = read;
    }

    fn tags_in_range(&self, start: u64, end: u64) -> Vec<Tag> {
        self.buffer
            .state
            .lock()
            .tags
            .iter()
            .filter(|tag| tag.offset >= start && tag.offset < end)
            .cloned()
            .collect()
    }

    fn set_active(&self, active: bool) {
        self.buffer.state.lock().readers[self.index].active = active;
    }

    fn post_work(&self) {
        let mut state = self.buffer.state.lock();
        let slot = &mut state.readers[self.index];
        slot.active = false;
        slot.post_work_calls += 1;
    }

    fn unblock_input(&self, items_required: usize, items_available: usize) -> bool {
        let mut guard = self.buffer.state.lock();
        let state = &mut *guard;
        match state.readers[self.index].callback.as_mut() {
            Some(callback) => callback(&mut state.occupancy, items_required, items_available),
            None => false,
        }
    }
}

/// Source emitting `limit` items (or forever), plus any scheduled tags.
pub struct CountingSource {
    settings: BlockSettings,
    limit: Option<u64>,
    produced: u64,
    pending_tags: Vec<Tag>,
}

impl CountingSource {
    /// Source that finishes after `limit` items; `None` runs forever.
    pub fn new(limit: Option<u64>) -> Self {
        Self {
            settings: BlockSettings::new(),
            limit,
            produced: 0,
            pending_tags: Vec::new(),
        }
    }

    /// Tags to publish once the stream reaches their offsets.
    pub fn with_tags(mut self, mut tags: Vec<Tag>) -> Self {
        tags.sort_by_key(|tag| tag.offset);
        self.pending_tags = tags;
        self
    }

    /// Replace the scheduling settings.
    pub fn with_settings(mut self, settings: BlockSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Items produced so far.
    pub fn produced(&self) -> u64 {
        self.produced
    }
}

impl Block for CountingSource {
    fn name(&self) -> &str {
        "counting_source"
    }

    fn num_inputs(&self) -> usize {
        0
    }

    fn num_outputs(&self) -> usize {
        1
    }

    fn settings(&self) -> &BlockSettings {
        &self.settings
    }

    fn settings_mut(&mut self) -> &mut BlockSettings {
        &mut self.settings
    }

    fn general_work(&mut self, noutput_items: usize, io: &mut WorkIo<'_>) -> WorkStatus {
        let mut n = noutput_items as u64;
        if let Some(limit) = self.limit {
            if self.produced >= limit {
                return WorkStatus::Done;
            }
            n = n.min(limit - self.produced);
        }
        let end = self.produced + n;
        while self.pending_tags.first().is_some_and(|tag| tag.offset < end) {
            let tag = self.pending_tags.remove(0);
            io.add_item_tag(0, tag);
        }
        self.produced = end;
        WorkStatus::Produced(n as usize)
    }
}

/// Sink consuming up to `noutput_items` on every input.
pub struct CountingSink {
    settings: BlockSettings,
    ninputs: usize,
    consumed: u64,
}

impl CountingSink {
    /// Sink with `ninputs` inputs.
    pub fn new(ninputs: usize) -> Self {
        Self {
            settings: BlockSettings::new(),
            ninputs,
            consumed: 0,
        }
    }

    /// Items consumed from input 0.
    pub fn consumed(&self) -> u64 {
        self.consumed
    }
}

impl Block for CountingSink {
    fn name(&self) -> &str {
        "counting_sink"
    }

    fn num_inputs(&self) -> usize {
        self.ninputs
    }

    fn num_outputs(&self) -> usize {
        0
    }

    fn settings(&self) -> &BlockSettings {
        &self.settings
    }

    fn settings_mut(&mut self) -> &mut BlockSettings {
        &mut self.settings
    }

    fn general_work(&mut self, noutput_items: usize, io: &mut WorkIo<'_>) -> WorkStatus {
        let available = io.ninput_items().to_vec();
        for (port, avail) in available.into_iter().enumerate() {
            let n = avail.min(noutput_items);
            io.consume(port, n);
            if port == 0 {
                self.consumed += n as u64;
            }
        }
        WorkStatus::Produced(0)
    }
}

/// Fixed-rate resampler: every `decimation` inputs become `interpolation` outputs.
pub struct RateBlock {
    settings: BlockSettings,
    ninputs: usize,
    noutputs: usize,
    interpolation: usize,
    decimation: usize,
}

impl RateBlock {
    /// Resampler by `interpolation / decimation` with the given port counts.
    pub fn new(ninputs: usize, noutputs: usize, interpolation: usize, decimation: usize) -> Self {
        let rate = RelativeRate::ratio(interpolation as u64, decimation as u64)
            .unwrap_or_default();
        let mut settings = BlockSettings::new()
            .with_fixed_rate(true)
            .with_relative_rate(rate);
        if interpolation > 1 {
            settings = settings.with_output_multiple(interpolation);
        }
        Self {
            settings,
            ninputs,
            noutputs,
            interpolation,
            decimation,
        }
    }

    /// Replace the scheduling settings.
    pub fn with_settings(mut self, settings: BlockSettings) -> Self {
        self.settings = settings;
        self
    }
}

impl Block for RateBlock {
    fn name(&self) -> &str {
        "rate_block"
    }

    fn num_inputs(&self) -> usize {
        self.ninputs
    }

    fn num_outputs(&self) -> usize {
        self.noutputs
    }

    fn settings(&self) -> &BlockSettings {
        &self.settings
    }

    fn settings_mut(&mut self) -> &mut BlockSettings {
        &mut self.settings
    }

    fn fixed_rate_ninput_to_noutput(&self, ninput: usize) -> usize {
        ninput / self.decimation * self.interpolation
    }

    fn fixed_rate_noutput_to_ninput(&self, noutput: usize) -> usize {
        noutput.div_ceil(self.interpolation) * self.decimation
    }

    fn general_work(&mut self, noutput_items: usize, io: &mut WorkIo<'_>) -> WorkStatus {
        let blocks = noutput_items / self.interpolation;
        io.consume_each(blocks * self.decimation);
        WorkStatus::Produced(blocks * self.interpolation)
    }
}

/// Anything the harness can call once per round.
pub trait Runnable {
    /// One scheduling attempt with the given ceiling.
    fn run_once_with(&mut self, max_noutput_items: usize) -> ExecState;
}

impl<B: Block> Runnable for BlockExecutor<B> {
    fn run_once_with(&mut self, max_noutput_items: usize) -> ExecState {
        self.run_one_iteration(max_noutput_items)
    }
}

/// What a [`Harness`] run ended with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HarnessReport {
    /// Rounds executed.
    pub rounds: usize,
    /// Last state returned by each executor, in insertion order.
    pub states: Vec<ExecState>,
}

impl HarnessReport {
    /// Whether every executor reached [`ExecState::Done`].
    pub fn all_done(&self) -> bool {
        self.states.iter().all(|s| *s == ExecState::Done)
    }
}

/// Single-thread round-robin driver for a set of executors.
pub struct Harness {
    executors: Vec<Box<dyn Runnable>>,
    max_noutput_items: usize,
}

impl Harness {
    /// Driver offering each executor at most `max_noutput_items` per call.
    pub fn new(max_noutput_items: usize) -> Self {
        Self {
            executors: Vec::new(),
            max_noutput_items,
        }
    }

    /// Add an executor; it runs after those already added.
    pub fn add(&mut self, executor: impl Runnable + 'static) {
        self.executors.push(Box::new(executor));
    }

    /// Run rounds until every executor is done, a round makes no progress,
    /// or `max_rounds` is reached.
    pub fn run(&mut self, max_rounds: usize) -> HarnessReport {
        let mut states = vec![ExecState::Ready; self.executors.len()];
        let mut rounds = 0;
        while rounds < max_rounds {
            rounds += 1;
            let mut progressed = false;
            for (executor, state) in self.executors.iter_mut().zip(states.iter_mut()) {
                if *state == ExecState::Done {
                    continue;
                }
                *state = executor.run_once_with(self.max_noutput_items);
                progressed |= matches!(
                    state,
                    ExecState::Ready | ExecState::ReadyNoOutput | ExecState::Done
                );
            }
            if !progressed || states.iter().all(|s| *s == ExecState::Done) {
                break;
            }
        }
        HarnessReport { rounds, states }
    }
}
