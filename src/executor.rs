//! Block executor: decides, for one block, whether one unit of work can run now.
//!
//! Each call to [`BlockExecutor::run_one_iteration`] snapshots the block's
//! buffers, sizes the call from free output space, the forecast and the
//! rate parameters, runs the work function, moves tags across the rate
//! conversion and reports an [`ExecState`]. Nothing ever waits: when work
//! is impossible the state says why, and the outer scheduler decides when
//! to come back.
//!
//! Fatal misconfiguration finishes the block instead of unwinding, so one
//! broken block cannot take the graph down with it.

use crate::block::{Block, BlockShape, WorkIo, WorkStatus};
use crate::buffer::{InputReader, OutputBuffer};
use crate::error::{ExecError, Result};
use crate::invariant_ppt::{
    assert_invariant, BLOCK_STARTED, BLOCK_STOPPED, PORT_ARITY_MATCHES, SHAPE_CLASSIFIED,
};
use crate::propagate::propagate_tags;
use crate::space::{min_available_space, round_down, round_up, OutputSpace, SpaceRequest};
use std::sync::Arc;
use tracing::{debug, error, trace, warn};

/// Ceiling used by [`BlockExecutor::run_once`] when the block sets none.
pub const DEFAULT_MAX_NOUTPUT_ITEMS: usize = 8192;

/// What one scheduling attempt achieved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecState {
    /// Work ran and at least one output received items.
    Ready,
    /// Work ran but wrote nothing (it may have consumed input).
    ReadyNoOutput,
    /// Not enough input; retry after upstream produces.
    BlockedOnInput,
    /// Not enough output space; retry after downstream consumes.
    BlockedOnOutput,
    /// Terminal: the block must not be called again.
    Done,
}

/// Executor-wide configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutorConfig {
    /// Ceiling for [`BlockExecutor::run_once`] when the block has no
    /// `max_noutput_items` of its own.
    pub default_max_noutput_items: usize,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            default_max_noutput_items: DEFAULT_MAX_NOUTPUT_ITEMS,
        }
    }
}

/// Decision reached before the work function runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    Work(usize),
    Blocked(ExecState),
    Finish,
}

/// Drives one block against its port buffers.
///
/// `start()` runs at construction and `stop()` on drop. The scratch
/// vectors are reset at the top of every call; only the block's own
/// [`BlockSettings`](crate::block::BlockSettings) carry state between calls.
pub struct BlockExecutor<B: Block> {
    block: B,
    shape: BlockShape,
    inputs: Vec<Arc<dyn InputReader>>,
    outputs: Vec<Arc<dyn OutputBuffer>>,
    config: ExecutorConfig,
    ninput_items: Vec<usize>,
    ninput_items_required: Vec<i64>,
    input_done: Vec<bool>,
    start_nitems_read: Vec<u64>,
    start_nitems_written: Vec<u64>,
    produced: Vec<usize>,
    fault: Option<ExecError>,
}

impl<B: Block> BlockExecutor<B> {
    /// Wire `block` to its buffers, validate its settings and start it.
    pub fn new(
        mut block: B,
        inputs: Vec<Arc<dyn InputReader>>,
        outputs: Vec<Arc<dyn OutputBuffer>>,
        config: ExecutorConfig,
    ) -> Result<Self> {
        let (ninputs, noutputs) = (inputs.len(), outputs.len());
        if block.num_inputs() != ninputs || block.num_outputs() != noutputs {
            return Err(ExecError::PortArity {
                expected_in: block.num_inputs(),
                expected_out: block.num_outputs(),
                got_in: ninputs,
                got_out: noutputs,
            });
        }
        assert_invariant(
            PORT_ARITY_MATCHES,
            true,
            "Buffers match declared ports",
            Some("BlockExecutor::new"),
        );

        let shape = BlockShape::classify(ninputs, noutputs).ok_or(ExecError::NoPorts)?;
        assert_invariant(
            SHAPE_CLASSIFIED,
            true,
            "Block shape fixed at construction",
            Some("BlockExecutor::new"),
        );

        block.settings().validate()?;

        if !block.start() {
            return Err(ExecError::StartFailed(block.name().to_owned()));
        }
        assert_invariant(BLOCK_STARTED, true, "Block started once", Some("BlockExecutor::new"));
        debug!(block = %block.name(), ?shape, ninputs, noutputs, "executor started");

        Ok(Self {
            block,
            shape,
            inputs,
            outputs,
            config,
            ninput_items: vec![0; ninputs],
            ninput_items_required: vec![0; ninputs],
            input_done: vec![false; ninputs],
            start_nitems_read: vec![0; ninputs],
            start_nitems_written: vec![0; noutputs],
            produced: vec![0; noutputs],
            fault: None,
        })
    }

    /// The driven block.
    pub fn block(&self) -> &B {
        &self.block
    }

    /// Mutable access to the driven block between calls.
    pub fn block_mut(&mut self) -> &mut B {
        &mut self.block
    }

    /// Shape fixed at construction.
    pub fn shape(&self) -> BlockShape {
        self.shape
    }

    /// Executor configuration.
    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    /// The fatal error that finished the block, if any.
    pub fn fault(&self) -> Option<&ExecError> {
        self.fault.as_ref()
    }

    /// One attempt using the block's own ceiling, or the configured default.
    pub fn run_once(&mut self) -> ExecState {
        let max = self
            .block
            .settings()
            .max_noutput_items()
            .unwrap_or(self.config.default_max_noutput_items);
        self.run_one_iteration(max)
    }

    /// One scheduling attempt producing at most `max_noutput_items` items.
    pub fn run_one_iteration(&mut self, max_noutput_items: usize) -> ExecState {
        if self.block.settings().done() {
            error!(block = %self.block.name(), "called after finishing");
            let name = self.block.name().to_owned();
            self.fault.get_or_insert(ExecError::AlreadyDone(name));
            return ExecState::Done;
        }

        self.reset_scratch();
        // At least one multiple per call.
        let multiple = self.block.settings().output_multiple();
        let ceiling = round_down(max_noutput_items, multiple).max(multiple);

        let step = match self.shape {
            BlockShape::Source => self.plan_source(ceiling),
            BlockShape::Sink => self.plan_sink(ceiling),
            BlockShape::Regular => self.plan_regular(ceiling),
        };

        match step {
            Ok(Step::Work(noutput_items)) => self.call_work(noutput_items),
            Ok(Step::Blocked(state)) => state,
            Ok(Step::Finish) => self.finish(None),
            Err(err) => self.finish(Some(err)),
        }
    }

    fn reset_scratch(&mut self) {
        self.ninput_items.fill(0);
        self.ninput_items_required.fill(0);
        self.input_done.fill(false);
        self.produced.fill(0);
    }

    fn plan_source(&mut self, ceiling: usize) -> Result<Step> {
        match self.feasible_output()? {
            Step::Work(space) => Ok(Step::Work(space.min(ceiling))),
            other => Ok(other),
        }
    }

    fn plan_sink(&mut self, ceiling: usize) -> Result<Step> {
        let multiple = self.block.settings().output_multiple();
        let rate = self.block.settings().relative_rate().as_f64();
        let estimate =
            move |avail: usize| round_down((avail as f64 * rate) as usize, multiple).min(ceiling);

        let mut max_avail = self.snapshot_inputs();
        if self.exhausted_input(multiple) {
            return Ok(Step::Finish);
        }

        let mut noutput_items = estimate(max_avail);
        if noutput_items == 0 {
            let mut retry = false;
            for port in 0..self.inputs.len() {
                let avail = self.ninput_items[port];
                if estimate(avail) == 0 && self.inputs[port].unblock_input(avail + 1, avail) {
                    debug!(block = %self.block.name(), port, "input unblocked by callback");
                    let snapshot = self.inputs[port].snapshot();
                    self.ninput_items[port] = snapshot.items_available;
                    self.input_done[port] = snapshot.done;
                    retry = true;
                }
            }
            if retry {
                max_avail = self.ninput_items.iter().copied().max().unwrap_or(0);
                if self.exhausted_input(multiple) {
                    return Ok(Step::Finish);
                }
                noutput_items = estimate(max_avail);
            }
            if noutput_items == 0 {
                trace!(block = %self.block.name(), "sink blocked on input");
                return Ok(Step::Blocked(ExecState::BlockedOnInput));
            }
        }
        Ok(Step::Work(noutput_items))
    }

    fn plan_regular(&mut self, ceiling: usize) -> Result<Step> {
        let settings = self.block.settings();
        let multiple = settings.output_multiple();
        let multiple_set = settings.output_multiple_set();
        let fixed_rate = settings.fixed_rate();

        'retry: loop {
            let max_avail = self.snapshot_inputs();
            let space = match self.feasible_output()? {
                Step::Work(space) => space,
                other => return Ok(other),
            };

            let mut noutput_items = space;
            if fixed_rate {
                // Try to consume everything that is already waiting.
                let mut wanted = self.block.fixed_rate_ninput_to_noutput(max_avail);
                if multiple_set {
                    wanted = round_down(wanted, multiple);
                }
                if wanted > 0 && wanted <= noutput_items {
                    noutput_items = wanted;
                }
            }
            noutput_items = self.align(noutput_items.min(ceiling));

            loop {
                self.ninput_items_required.fill(0);
                self.block.forecast(noutput_items, &mut self.ninput_items_required);

                if let Some((port, &required)) = self
                    .ninput_items_required
                    .iter()
                    .enumerate()
                    .find(|&(_, &required)| required < 0)
                {
                    return Err(ExecError::NegativeForecast { port, required });
                }

                let short = self
                    .ninput_items_required
                    .iter()
                    .zip(&self.ninput_items)
                    .position(|(&required, &avail)| as_items(required) > avail);
                let Some(port) = short else {
                    return Ok(Step::Work(noutput_items));
                };

                if noutput_items > multiple {
                    noutput_items = self.align(round_up(noutput_items / 2, multiple));
                    trace!(block = %self.block.name(), noutput_items, "shrinking request");
                    continue;
                }

                let required = as_items(self.ninput_items_required[port]);
                let available = self.ninput_items[port];
                if self.inputs[port].unblock_input(required, available) {
                    debug!(
                        block = %self.block.name(),
                        port,
                        required,
                        "input unblocked by callback"
                    );
                    continue 'retry;
                }
                if self.input_done[port] {
                    warn!(
                        block = %self.block.name(),
                        port,
                        required,
                        available,
                        "upstream finished short of the forecast"
                    );
                    return Ok(Step::Finish);
                }
                let max_possible = self.inputs[port].max_possible_items_available();
                if required > max_possible {
                    return Err(ExecError::ImpossibleInput {
                        port,
                        required,
                        max_possible,
                    });
                }

                let settings = self.block.settings_mut();
                if settings.is_unaligned() {
                    settings.set_alignment_debt(0);
                }
                trace!(block = %self.block.name(), port, required, available, "blocked on input");
                return Ok(Step::Blocked(ExecState::BlockedOnInput));
            }
        }
    }

    /// Largest writable quantity, running output unblock callbacks as needed.
    fn feasible_output(&self) -> Result<Step> {
        let settings = self.block.settings();
        let request = SpaceRequest {
            output_multiple: settings.output_multiple(),
            output_multiple_set: settings.output_multiple_set(),
            min_noutput_items: settings.min_noutput_items(),
        };

        let mut resume_port = 0;
        let mut carried = usize::MAX;
        loop {
            match min_available_space(&self.outputs, request, resume_port)? {
                OutputSpace::Available(space) => return Ok(Step::Work(space.min(carried))),
                OutputSpace::Finished => {
                    warn!(block = %self.block.name(), "downstream finished");
                    return Ok(Step::Finish);
                }
                OutputSpace::Blocked { port, best } => {
                    carried = carried.min(best);
                    if self.outputs[port].unblock_output(request.output_multiple) {
                        debug!(block = %self.block.name(), port, "output unblocked by callback");
                        resume_port = port;
                        continue;
                    }
                    trace!(block = %self.block.name(), port, "blocked on output");
                    return Ok(Step::Blocked(ExecState::BlockedOnOutput));
                }
            }
        }
    }

    /// Take each input's availability and done flag; returns the largest availability.
    fn snapshot_inputs(&mut self) -> usize {
        let mut max_avail = 0;
        for (port, input) in self.inputs.iter().enumerate() {
            let snapshot = input.snapshot();
            self.ninput_items[port] = snapshot.items_available;
            self.input_done[port] = snapshot.done;
            max_avail = max_avail.max(snapshot.items_available);
        }
        max_avail
    }

    fn exhausted_input(&self, multiple: usize) -> bool {
        let exhausted = self
            .ninput_items
            .iter()
            .zip(&self.input_done)
            .position(|(&avail, &done)| done && avail < multiple);
        if let Some(port) = exhausted {
            warn!(block = %self.block.name(), port, "upstream finished");
        }
        exhausted.is_some()
    }

    /// Trim a request so the output stream returns to an alignment boundary.
    fn align(&self, noutput_items: usize) -> usize {
        let settings = self.block.settings();
        let alignment = settings.alignment();
        if settings.output_multiple_set() || alignment <= 1 {
            return noutput_items;
        }
        if settings.is_unaligned() {
            noutput_items.min(settings.unaligned())
        } else if noutput_items >= alignment {
            round_down(noutput_items, alignment)
        } else {
            noutput_items
        }
    }

    /// Carry the alignment debt forward by what the block actually produced.
    fn settle_alignment(&mut self, produced: usize) {
        let settings = self.block.settings_mut();
        let alignment = settings.alignment();
        if settings.output_multiple_set() || alignment <= 1 {
            return;
        }
        let phase = (alignment - settings.unaligned() % alignment) % alignment;
        let next = (phase + produced % alignment) % alignment;
        settings.set_alignment_debt((alignment - next) % alignment);
    }

    fn call_work(&mut self, noutput_items: usize) -> ExecState {
        for input in &self.inputs {
            input.set_active(true);
        }
        for output in &self.outputs {
            output.set_active(true);
        }
        for (start, input) in self.start_nitems_read.iter_mut().zip(&self.inputs) {
            *start = input.nitems_read();
        }
        for (start, output) in self.start_nitems_written.iter_mut().zip(&self.outputs) {
            *start = output.nitems_written();
        }

        trace!(block = %self.block.name(), noutput_items, "calling work");
        let status = {
            let mut io = WorkIo::new(
                &self.ninput_items,
                &self.start_nitems_read,
                &self.start_nitems_written,
                &self.inputs,
                &self.outputs,
                &mut self.produced,
            );
            self.block.general_work(noutput_items, &mut io)
        };

        let produced = match status {
            WorkStatus::Done => {
                debug!(block = %self.block.name(), "work reported done");
                return self.finish(None);
            }
            WorkStatus::AlreadyProduced => None,
            WorkStatus::Produced(n) => Some(n),
        };

        if self.shape == BlockShape::Regular {
            let n = produced.unwrap_or_else(|| self.produced.iter().copied().max().unwrap_or(0));
            self.settle_alignment(n);
        }

        let settings = self.block.settings();
        if let Err(err) = propagate_tags(
            settings.tag_propagation_policy(),
            &self.inputs,
            &self.outputs,
            &self.start_nitems_read,
            settings.relative_rate(),
        ) {
            return self.finish(Some(err));
        }

        if let Some(n) = produced {
            for (output, count) in self.outputs.iter().zip(self.produced.iter_mut()) {
                output.produce(n);
                *count += n;
            }
        }

        for input in &self.inputs {
            input.post_work();
        }
        for output in &self.outputs {
            output.post_work();
        }

        let nproduced = self.produced.iter().copied().max().unwrap_or(0);
        if self.block.settings().update_rate() {
            let first = (self.inputs.first(), self.start_nitems_read.first());
            if let (Some(input), Some(&start)) = first {
                let consumed = input.nitems_read() - start;
                if nproduced > 0 && consumed > 0 {
                    let rate = self
                        .block
                        .settings()
                        .relative_rate()
                        .observed(nproduced as u64, consumed);
                    self.block.settings_mut().set_relative_rate(rate);
                }
            }
        }

        if nproduced > 0 {
            return ExecState::Ready;
        }

        let multiple = self.block.settings().output_multiple();
        for output in &self.outputs {
            output.notify_output_blocked(multiple);
        }
        ExecState::ReadyNoOutput
    }

    fn finish(&mut self, err: Option<ExecError>) -> ExecState {
        match err {
            Some(err) => {
                error!(block = %self.block.name(), error = %err, "finishing block on fatal error");
                self.fault = Some(err);
            }
            None => debug!(block = %self.block.name(), "block finished"),
        }
        self.block.settings_mut().set_done(true);
        for output in &self.outputs {
            output.set_active(false);
            output.set_done(true);
        }
        for input in &self.inputs {
            input.set_active(false);
            input.set_done(true);
        }
        ExecState::Done
    }
}

impl<B: Block> Drop for BlockExecutor<B> {
    fn drop(&mut self) {
        if !self.block.stop() {
            warn!(block = %self.block.name(), "block failed to stop cleanly");
        }
        assert_invariant(BLOCK_STOPPED, true, "Block stopped once", Some("BlockExecutor::drop"));
    }
}

fn as_items(required: i64) -> usize {
    usize::try_from(required).unwrap_or(usize::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::BlockSettings;
    use crate::harness::{CountingBuffer, CountingReader};
    use crate::rate::RelativeRate;

    /// Regular block that consumes `noutput_items`, produces `produce` (or the
    /// same amount) and records each request.
    struct Passthrough {
        settings: BlockSettings,
        requests: Vec<usize>,
        produce: Option<usize>,
    }

    impl Passthrough {
        fn new(settings: BlockSettings) -> Self {
            Self {
                settings,
                requests: Vec::new(),
                produce: None,
            }
        }
    }

    impl Block for Passthrough {
        fn name(&self) -> &str {
            "copy"
        }
        fn num_inputs(&self) -> usize {
            1
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
            self.requests.push(noutput_items);
            io.consume_each(noutput_items);
            WorkStatus::Produced(self.produce.unwrap_or(noutput_items))
        }
    }

    type Wiring = (
        Arc<CountingBuffer>,
        Arc<CountingReader>,
        Arc<CountingBuffer>,
        Arc<CountingReader>,
    );

    fn wire(capacity: usize) -> Wiring {
        let upstream = CountingBuffer::new(capacity);
        let input = upstream.add_reader();
        let downstream = CountingBuffer::new(capacity);
        let tap = downstream.add_reader();
        (upstream, input, downstream, tap)
    }

    fn executor(
        block: Passthrough,
        input: &Arc<CountingReader>,
        output: &Arc<CountingBuffer>,
    ) -> BlockExecutor<Passthrough> {
        BlockExecutor::new(
            block,
            vec![input.clone() as Arc<dyn InputReader>],
            vec![output.clone() as Arc<dyn OutputBuffer>],
            ExecutorConfig::default(),
        )
        .unwrap()
    }

    #[test]
    fn ceiling_rounds_down_to_multiple() {
        let (upstream, input, downstream, _tap) = wire(4096);
        upstream.produce(1000);
        let block = Passthrough::new(BlockSettings::new().with_output_multiple(8));
        let mut exec = executor(block, &input, &downstream);
        assert_eq!(exec.run_one_iteration(100), ExecState::Ready);
        assert_eq!(exec.block().requests, vec![96]);
    }

    #[test]
    fn alignment_rounds_down_when_aligned() {
        let (upstream, input, downstream, _tap) = wire(4096);
        upstream.produce(1000);
        let block = Passthrough::new(BlockSettings::new().with_alignment(16));
        let mut exec = executor(block, &input, &downstream);
        exec.run_one_iteration(100);
        assert_eq!(exec.block().requests, vec![96]);
        assert!(!exec.block().settings().is_unaligned());
    }

    #[test]
    fn short_call_carries_alignment_debt_then_repays_it() {
        let (upstream, input, downstream, _tap) = wire(4096);
        upstream.produce(10);
        let block = Passthrough::new(BlockSettings::new().with_alignment(16));
        let mut exec = executor(block, &input, &downstream);

        // 96 -> 48 -> 16 -> 8 fits in 10
        assert_eq!(exec.run_one_iteration(100), ExecState::Ready);
        assert_eq!(exec.block().requests, vec![8]);
        assert!(exec.block().settings().is_unaligned());
        assert_eq!(exec.block().settings().unaligned(), 8);

        upstream.produce(100);
        assert_eq!(exec.run_one_iteration(100), ExecState::Ready);
        assert_eq!(exec.block().requests, vec![8, 8]);
        assert!(!exec.block().settings().is_unaligned());

        // 86 available: 96 -> 48
        exec.run_one_iteration(100);
        assert_eq!(exec.block().requests, vec![8, 8, 48]);
        assert!(!exec.block().settings().is_unaligned());
    }

    #[test]
    fn forecast_shortfall_halves_request() {
        let (upstream, input, downstream, _tap) = wire(4096);
        upstream.produce(300);
        let mut exec = executor(Passthrough::new(BlockSettings::new()), &input, &downstream);
        assert_eq!(exec.run_one_iteration(1024), ExecState::Ready);
        // 1024 -> 512 -> 256 fits in 300 available
        assert_eq!(exec.block().requests, vec![256]);
    }

    #[test]
    fn blocked_on_input_resets_alignment_correction() {
        let (upstream, input, downstream, _tap) = wire(4096);
        upstream.produce(8);
        let block = Passthrough::new(BlockSettings::new().with_alignment(16));
        let mut exec = executor(block, &input, &downstream);
        exec.run_one_iteration(100);
        assert!(exec.block().settings().is_unaligned());

        assert_eq!(exec.run_one_iteration(100), ExecState::BlockedOnInput);
        assert!(!exec.block().settings().is_unaligned());
        assert_eq!(exec.block().settings().unaligned(), 0);
    }

    #[test]
    fn update_rate_tracks_observed_ratio() {
        let (upstream, input, downstream, _tap) = wire(4096);
        upstream.produce(100);
        let mut block = Passthrough::new(
            BlockSettings::new()
                .with_update_rate(true)
                .with_relative_rate(RelativeRate::ratio(1, 1).unwrap()),
        );
        block.produce = Some(25);
        let mut exec = executor(block, &input, &downstream);
        assert_eq!(exec.run_one_iteration(100), ExecState::Ready);
        assert_eq!(
            exec.block().settings().relative_rate(),
            &RelativeRate::ratio(1, 4).unwrap()
        );
    }

    #[test]
    fn zero_output_keeps_rate() {
        let (upstream, input, downstream, _tap) = wire(4096);
        upstream.produce(100);
        let mut block = Passthrough::new(BlockSettings::new().with_update_rate(true));
        block.produce = Some(0);
        let mut exec = executor(block, &input, &downstream);
        assert_eq!(exec.run_one_iteration(100), ExecState::ReadyNoOutput);
        assert!(exec.block().settings().relative_rate().is_unity());
    }

    #[test]
    fn calling_a_finished_block_is_reported() {
        let (upstream, input, downstream, _tap) = wire(64);
        upstream.set_done(true);
        let mut exec = executor(Passthrough::new(BlockSettings::new()), &input, &downstream);
        assert_eq!(exec.run_one_iteration(16), ExecState::Done);
        assert_eq!(exec.fault(), None);
        assert_eq!(exec.run_one_iteration(16), ExecState::Done);
        assert_eq!(exec.fault(), Some(&ExecError::AlreadyDone("copy".into())));
    }

    #[test]
    fn arity_mismatch_rejected() {
        let (_upstream, input, _downstream, _tap) = wire(64);
        let result = BlockExecutor::new(
            Passthrough::new(BlockSettings::new()),
            vec![input as Arc<dyn InputReader>],
            Vec::new(),
            ExecutorConfig::default(),
        );
        assert!(matches!(result, Err(ExecError::PortArity { got_out: 0, .. })));
    }
}
