//! Block definitions consumed by the executor.
//!
//! A block is one stage of a streaming graph. Implementors supply the
//! work and forecast functions; the persistent scheduling parameters live
//! in [`BlockSettings`], which the executor reads every call and mutates
//! for the alignment carry, the relative rate and the done flag.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use crate::buffer::{InputReader, OutputBuffer};
use crate::error::SettingsError;
use crate::invariant_ppt::{assert_invariant, SETTINGS_VALIDATED};
use crate::rate::RelativeRate;
use crate::tag::Tag;
use std::sync::Arc;

/// How tags move from inputs to outputs after a work call.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TagPropagationPolicy {
    /// Tags are dropped at this block.
    None,
    /// Every input's tags go to every output.
    #[default]
    AllToAll,
    /// Input `i`'s tags go to output `i` only.
    OneToOne,
    /// The block moves tags itself inside its work function.
    Custom,
    /// Tag handling is delegated to an enclosing container.
    Delegated,
}

/// Outcome of one call to [`Block::general_work`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkStatus {
    /// Wrote this many items to every output; the executor advances them.
    Produced(usize),
    /// The block advanced its outputs itself through [`WorkIo::produce`].
    AlreadyProduced,
    /// The block will never produce again.
    Done,
}

/// Port-count shape of a block, fixed at executor construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockShape {
    /// Outputs only.
    Source,
    /// Inputs only.
    Sink,
    /// Both inputs and outputs.
    Regular,
}

impl BlockShape {
    /// Classify by port counts. A block with no ports has no shape.
    pub fn classify(ninputs: usize, noutputs: usize) -> Option<Self> {
        match (ninputs, noutputs) {
            (0, 0) => None,
            (0, _) => Some(BlockShape::Source),
            (_, 0) => Some(BlockShape::Sink),
            _ => Some(BlockShape::Regular),
        }
    }
}

/// Persistent scheduling parameters of a block.
#[derive(Debug, Clone, PartialEq)]
pub struct BlockSettings {
    output_multiple: usize,
    output_multiple_set: bool,
    min_noutput_items: usize,
    max_noutput_items: Option<usize>,
    alignment: usize,
    unaligned: usize,
    is_unaligned: bool,
    fixed_rate: bool,
    relative_rate: RelativeRate,
    update_rate: bool,
    tag_propagation_policy: TagPropagationPolicy,
    done: bool,
}

impl Default for BlockSettings {
    fn default() -> Self {
        Self {
            output_multiple: 1,
            output_multiple_set: false,
            min_noutput_items: 0,
            max_noutput_items: None,
            alignment: 1,
            unaligned: 0,
            is_unaligned: false,
            fixed_rate: false,
            relative_rate: RelativeRate::default(),
            update_rate: false,
            tag_propagation_policy: TagPropagationPolicy::default(),
            done: false,
        }
    }
}

impl BlockSettings {
    /// Default settings: unit multiple, no alignment, rate 1, all-to-all tags.
    pub fn new() -> Self {
        Self::default()
    }

    /// Require every call to produce a multiple of `multiple` items.
    pub fn with_output_multiple(mut self, multiple: usize) -> Self {
        self.output_multiple = multiple;
        self.output_multiple_set = true;
        self
    }

    /// Smallest output quantity worth a call.
    pub fn with_min_noutput_items(mut self, min: usize) -> Self {
        self.min_noutput_items = min;
        self
    }

    /// Per-block ceiling used by
    /// [`BlockExecutor::run_once`](crate::executor::BlockExecutor::run_once).
    pub fn with_max_noutput_items(mut self, max: usize) -> Self {
        self.max_noutput_items = Some(max);
        self
    }

    /// Preferred alignment width for vectorized kernels.
    pub fn with_alignment(mut self, alignment: usize) -> Self {
        self.alignment = alignment;
        self
    }

    /// Declare a fixed input/output ratio so the executor can size calls from input.
    pub fn with_fixed_rate(mut self, fixed_rate: bool) -> Self {
        self.fixed_rate = fixed_rate;
        self
    }

    /// Initial relative rate.
    pub fn with_relative_rate(mut self, rate: RelativeRate) -> Self {
        self.relative_rate = rate;
        self
    }

    /// Recompute the relative rate from observed produce/consume counts.
    pub fn with_update_rate(mut self, update_rate: bool) -> Self {
        self.update_rate = update_rate;
        self
    }

    /// Tag propagation policy.
    pub fn with_tag_propagation_policy(mut self, policy: TagPropagationPolicy) -> Self {
        self.tag_propagation_policy = policy;
        self
    }

    /// Check the settings for values no schedule could satisfy.
    pub fn validate(&self) -> Result<(), SettingsError> {
        if self.output_multiple == 0 {
            return Err(SettingsError::ZeroOutputMultiple);
        }
        if self.alignment == 0 {
            return Err(SettingsError::ZeroAlignment);
        }
        if self.max_noutput_items == Some(0) {
            return Err(SettingsError::ZeroMaxOutput);
        }
        self.relative_rate.validate()?;
        assert_invariant(SETTINGS_VALIDATED, true, "Block settings validated", Some("validate"));
        Ok(())
    }

    /// Output granularity; 1 unless set.
    pub fn output_multiple(&self) -> usize {
        self.output_multiple
    }

    /// Whether the block explicitly asked for an output multiple.
    pub fn output_multiple_set(&self) -> bool {
        self.output_multiple_set
    }

    /// Smallest output quantity worth a call.
    pub fn min_noutput_items(&self) -> usize {
        self.min_noutput_items
    }

    /// Per-block ceiling, if any.
    pub fn max_noutput_items(&self) -> Option<usize> {
        self.max_noutput_items
    }

    /// Alignment width.
    pub fn alignment(&self) -> usize {
        self.alignment
    }

    /// Items still owed before the output stream is realigned.
    pub fn unaligned(&self) -> usize {
        self.unaligned
    }

    /// Whether an alignment correction is in progress.
    pub fn is_unaligned(&self) -> bool {
        self.is_unaligned
    }

    /// Whether the block has a fixed input/output ratio.
    pub fn fixed_rate(&self) -> bool {
        self.fixed_rate
    }

    /// Current relative rate.
    pub fn relative_rate(&self) -> &RelativeRate {
        &self.relative_rate
    }

    /// Replace the relative rate.
    pub fn set_relative_rate(&mut self, rate: RelativeRate) {
        self.relative_rate = rate;
    }

    /// Whether the executor recomputes the rate after each call.
    pub fn update_rate(&self) -> bool {
        self.update_rate
    }

    /// Tag propagation policy.
    pub fn tag_propagation_policy(&self) -> TagPropagationPolicy {
        self.tag_propagation_policy
    }

    /// Whether the block has finished.
    pub fn done(&self) -> bool {
        self.done
    }

    pub(crate) fn set_done(&mut self, done: bool) {
        self.done = done;
    }

    /// Record the outstanding alignment debt; zero clears the correction.
    pub(crate) fn set_alignment_debt(&mut self, debt: usize) {
        self.unaligned = debt;
        self.is_unaligned = debt != 0;
    }
}

/// A processing block driven by [`BlockExecutor`](crate::executor::BlockExecutor).
pub trait Block: Send {
    /// Name used in logs and as the source id of emitted tags.
    fn name(&self) -> &str;

    /// Number of input ports.
    fn num_inputs(&self) -> usize;

    /// Number of output ports.
    fn num_outputs(&self) -> usize;

    /// Scheduling parameters.
    fn settings(&self) -> &BlockSettings;

    /// Mutable scheduling parameters.
    fn settings_mut(&mut self) -> &mut BlockSettings;

    /// Input items each port needs to produce `noutput_items`.
    ///
    /// A negative entry marks a broken rate parameterization and finishes
    /// the block.
    fn forecast(&self, noutput_items: usize, ninput_items_required: &mut [i64]) {
        let needed = self.fixed_rate_noutput_to_ninput(noutput_items);
        ninput_items_required.fill(i64::try_from(needed).unwrap_or(i64::MAX));
    }

    /// Output items produced by consuming `ninput` items (fixed-rate blocks).
    fn fixed_rate_ninput_to_noutput(&self, ninput: usize) -> usize {
        self.settings().relative_rate().outputs_for(ninput)
    }

    /// Input items consumed to produce `noutput` items (fixed-rate blocks).
    fn fixed_rate_noutput_to_ninput(&self, noutput: usize) -> usize {
        self.settings().relative_rate().inputs_for(noutput)
    }

    /// Do one unit of work.
    fn general_work(&mut self, noutput_items: usize, io: &mut WorkIo<'_>) -> WorkStatus;

    /// Called once before the first work call. Returning false rejects the block.
    fn start(&mut self) -> bool {
        true
    }

    /// Called once when the executor is dropped.
    fn stop(&mut self) -> bool {
        true
    }
}

/// Port access handed to [`Block::general_work`] for one call.
///
/// Positions are the absolute read/write counters captured at call entry;
/// they locate the items this call may touch in whatever storage the
/// buffers use.
pub struct WorkIo<'a> {
    ninput_items: &'a [usize],
    read_positions: &'a [u64],
    write_positions: &'a [u64],
    inputs: &'a [Arc<dyn InputReader>],
    outputs: &'a [Arc<dyn OutputBuffer>],
    produced: &'a mut [usize],
}

impl<'a> WorkIo<'a> {
    pub(crate) fn new(
        ninput_items: &'a [usize],
        read_positions: &'a [u64],
        write_positions: &'a [u64],
        inputs: &'a [Arc<dyn InputReader>],
        outputs: &'a [Arc<dyn OutputBuffer>],
        produced: &'a mut [usize],
    ) -> Self {
        Self {
            ninput_items,
            read_positions,
            write_positions,
            inputs,
            outputs,
            produced,
        }
    }

    /// Number of inputs.
    pub fn ninputs(&self) -> usize {
        self.inputs.len()
    }

    /// Number of outputs.
    pub fn noutputs(&self) -> usize {
        self.outputs.len()
    }

    /// Items available on each input at call entry.
    pub fn ninput_items(&self) -> &[usize] {
        self.ninput_items
    }

    /// Absolute index of the first readable item on `port`.
    pub fn read_position(&self, port: usize) -> u64 {
        self.read_positions[port]
    }

    /// Absolute index of the first writable item on `port`.
    pub fn write_position(&self, port: usize) -> u64 {
        self.write_positions[port]
    }

    /// Reader for input `port`.
    pub fn input(&self, port: usize) -> &dyn InputReader {
        &*self.inputs[port]
    }

    /// Buffer for output `port`.
    pub fn output(&self, port: usize) -> &dyn OutputBuffer {
        &*self.outputs[port]
    }

    /// Mark `nitems` of input `port` consumed.
    pub fn consume(&mut self, port: usize, nitems: usize) {
        self.inputs[port].consume(nitems);
    }

    /// Mark `nitems` consumed on every input.
    pub fn consume_each(&mut self, nitems: usize) {
        for input in self.inputs {
            input.consume(nitems);
        }
    }

    /// Advance output `port` by `nitems`; pair with [`WorkStatus::AlreadyProduced`].
    pub fn produce(&mut self, port: usize, nitems: usize) {
        self.outputs[port].produce(nitems);
        self.produced[port] += nitems;
    }

    /// Publish a tag on output `port`.
    pub fn add_item_tag(&mut self, port: usize, tag: Tag) {
        self.outputs[port].add_item_tag(tag);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RateError;

    #[test]
    fn shape_classification() {
        assert_eq!(BlockShape::classify(0, 1), Some(BlockShape::Source));
        assert_eq!(BlockShape::classify(2, 0), Some(BlockShape::Sink));
        assert_eq!(BlockShape::classify(1, 3), Some(BlockShape::Regular));
        assert_eq!(BlockShape::classify(0, 0), None);
    }

    #[test]
    fn settings_builder_marks_multiple() {
        let settings = BlockSettings::new();
        assert!(!settings.output_multiple_set());
        assert_eq!(settings.output_multiple(), 1);

        let settings = settings.with_output_multiple(4).with_min_noutput_items(8);
        assert!(settings.output_multiple_set());
        assert_eq!(settings.output_multiple(), 4);
        assert_eq!(settings.min_noutput_items(), 8);
        assert_eq!(settings.validate(), Ok(()));
    }

    #[test]
    fn settings_validation() {
        assert_eq!(
            BlockSettings::new().with_output_multiple(0).validate(),
            Err(SettingsError::ZeroOutputMultiple)
        );
        assert_eq!(
            BlockSettings::new().with_alignment(0).validate(),
            Err(SettingsError::ZeroAlignment)
        );
        assert_eq!(
            BlockSettings::new().with_max_noutput_items(0).validate(),
            Err(SettingsError::ZeroMaxOutput)
        );
        assert_eq!(
            BlockSettings::new()
                .with_relative_rate(RelativeRate::Float(0.0))
                .validate(),
            Err(SettingsError::Rate(RateError::NotPositive(0.0)))
        );
    }

    #[test]
    fn alignment_debt_toggles_flag() {
        let mut settings = BlockSettings::new().with_alignment(8);
        settings.set_alignment_debt(3);
        assert!(settings.is_unaligned());
        assert_eq!(settings.unaligned(), 3);
        settings.set_alignment_debt(0);
        assert!(!settings.is_unaligned());
    }
}
