//! Tag propagation across a block's rate conversion.
//!
//! After a call consumes items `[start, end)` on an input, the tags in
//! that window reappear on the outputs at `rate.rescale(offset)`. The
//! window comes from the read positions captured at call entry, so each
//! tag moves exactly once.

use crate::block::TagPropagationPolicy;
use crate::buffer::{InputReader, OutputBuffer};
use crate::error::{ExecError, Result};
use crate::rate::RelativeRate;
use crate::tag::Tag;
use std::sync::Arc;

/// Move this call's tags from `inputs` to `outputs` according to `policy`.
///
/// `start_nitems_read[i]` is input `i`'s read counter at call entry; the
/// window ends at its current counter. Fails without touching any output
/// when the policy cannot be applied to this port layout.
pub fn propagate_tags(
    policy: TagPropagationPolicy,
    inputs: &[Arc<dyn InputReader>],
    outputs: &[Arc<dyn OutputBuffer>],
    start_nitems_read: &[u64],
    rate: &RelativeRate,
) -> Result<()> {
    if outputs.is_empty() {
        return Ok(());
    }

    match policy {
        TagPropagationPolicy::AllToAll => {
            for (input, &start) in inputs.iter().zip(start_nitems_read) {
                for tag in window_tags(input.as_ref(), start, rate) {
                    for output in outputs {
                        output.add_item_tag(tag.clone());
                    }
                }
            }
            Ok(())
        }
        TagPropagationPolicy::OneToOne => {
            if inputs.len() != outputs.len() {
                return Err(ExecError::PortCountMismatch {
                    ninputs: inputs.len(),
                    noutputs: outputs.len(),
                });
            }
            for ((input, output), &start) in inputs.iter().zip(outputs).zip(start_nitems_read) {
                for tag in window_tags(input.as_ref(), start, rate) {
                    output.add_item_tag(tag);
                }
            }
            Ok(())
        }
        TagPropagationPolicy::None
        | TagPropagationPolicy::Custom
        | TagPropagationPolicy::Delegated => Ok(()),
    }
}

fn window_tags(input: &dyn InputReader, start: u64, rate: &RelativeRate) -> Vec<Tag> {
    let tags = input.tags_in_range(start, input.nitems_read());
    if rate.is_unity() {
        return tags;
    }
    tags.iter()
        .map(|tag| tag.with_offset(rate.rescale(tag.offset)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::harness::CountingBuffer;
    use crate::tag::TagValue;

    struct Wiring {
        upstream: Vec<Arc<CountingBuffer>>,
        inputs: Vec<Arc<dyn InputReader>>,
        downstream: Vec<Arc<CountingBuffer>>,
        outputs: Vec<Arc<dyn OutputBuffer>>,
    }

    fn wire(ninputs: usize, noutputs: usize) -> Wiring {
        let upstream: Vec<_> = (0..ninputs).map(|_| CountingBuffer::new(1024)).collect();
        let inputs = upstream
            .iter()
            .map(|b| b.add_reader() as Arc<dyn InputReader>)
            .collect();
        let downstream: Vec<_> = (0..noutputs).map(|_| CountingBuffer::new(1024)).collect();
        let outputs = downstream
            .iter()
            .map(|b| b.clone() as Arc<dyn OutputBuffer>)
            .collect();
        Wiring {
            upstream,
            inputs,
            downstream,
            outputs,
        }
    }

    fn tag(offset: u64, key: &str) -> Tag {
        Tag::new(offset, key, TagValue::None)
    }

    #[test]
    fn all_to_all_rescales_by_rate() {
        let w = wire(1, 2);
        w.upstream[0].produce(100);
        w.upstream[0].add_item_tag(tag(10, "a"));
        w.upstream[0].add_item_tag(tag(33, "b"));
        w.inputs[0].consume(100);

        let rate = RelativeRate::ratio(1, 2).unwrap();
        propagate_tags(TagPropagationPolicy::AllToAll, &w.inputs, &w.outputs, &[0], &rate).unwrap();

        for out in &w.downstream {
            let offsets: Vec<u64> = out.tags().iter().map(|t| t.offset).collect();
            assert_eq!(offsets, vec![5, 17]);
        }
    }

    #[test]
    fn window_excludes_unconsumed_and_earlier_tags() {
        let w = wire(1, 1);
        w.upstream[0].produce(100);
        w.upstream[0].add_item_tag(tag(5, "before"));
        w.upstream[0].add_item_tag(tag(20, "inside"));
        w.upstream[0].add_item_tag(tag(60, "after"));
        w.inputs[0].consume(10);
        let start = w.inputs[0].nitems_read();
        w.inputs[0].consume(40);

        propagate_tags(
            TagPropagationPolicy::AllToAll,
            &w.inputs,
            &w.outputs,
            &[start],
            &RelativeRate::default(),
        )
        .unwrap();

        let keys: Vec<String> = w.downstream[0].tags().into_iter().map(|t| t.key).collect();
        assert_eq!(keys, vec!["inside".to_string()]);
    }

    #[test]
    fn one_to_one_routes_by_index() {
        let w = wire(2, 2);
        for (i, up) in w.upstream.iter().enumerate() {
            up.produce(10);
            up.add_item_tag(tag(i as u64, &format!("in{i}")));
        }
        for input in &w.inputs {
            input.consume(10);
        }

        propagate_tags(
            TagPropagationPolicy::OneToOne,
            &w.inputs,
            &w.outputs,
            &[0, 0],
            &RelativeRate::default(),
        )
        .unwrap();

        assert_eq!(w.downstream[0].tags(), vec![tag(0, "in0")]);
        assert_eq!(w.downstream[1].tags(), vec![tag(1, "in1")]);
    }

    #[test]
    fn one_to_one_mismatch_leaves_outputs_untouched() {
        let w = wire(1, 2);
        w.upstream[0].produce(10);
        w.upstream[0].add_item_tag(tag(3, "x"));
        w.inputs[0].consume(10);

        let err = propagate_tags(
            TagPropagationPolicy::OneToOne,
            &w.inputs,
            &w.outputs,
            &[0],
            &RelativeRate::default(),
        )
        .unwrap_err();

        assert_eq!(err, ExecError::PortCountMismatch { ninputs: 1, noutputs: 2 });
        assert!(w.downstream.iter().all(|b| b.tags().is_empty()));
    }

    #[test]
    fn custom_policies_and_sinks_are_noops() {
        let w = wire(1, 1);
        w.upstream[0].produce(10);
        w.upstream[0].add_item_tag(tag(3, "x"));
        w.inputs[0].consume(10);

        for policy in [
            TagPropagationPolicy::None,
            TagPropagationPolicy::Custom,
            TagPropagationPolicy::Delegated,
        ] {
            propagate_tags(policy, &w.inputs, &w.outputs, &[0], &RelativeRate::default()).unwrap();
        }
        assert!(w.downstream[0].tags().is_empty());

        let no_outputs: Vec<Arc<dyn OutputBuffer>> = Vec::new();
        propagate_tags(
            TagPropagationPolicy::OneToOne,
            &w.inputs,
            &no_outputs,
            &[0],
            &RelativeRate::default(),
        )
        .unwrap();
    }
}
