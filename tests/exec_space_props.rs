//! Property tests for the feasible-output-space scan.

use proptest::prelude::*;
use sigflow::harness::CountingBuffer;
use sigflow::space::{min_available_space, OutputSpace, SpaceRequest};
use sigflow::{ExecError, OutputBuffer};
use std::sync::Arc;

fn port() -> impl Strategy<Value = (usize, usize)> {
    (1usize..4096).prop_flat_map(|capacity| (Just(capacity), 0..=capacity))
}

proptest! {
    #[test]
    fn space_is_a_legal_multiple_within_every_cap(
        ports in prop::collection::vec(port(), 1..5),
        multiple in 1usize..64,
        floor in 0usize..128,
        multiple_set in any::<bool>(),
    ) {
        let buffers: Vec<_> = ports
            .iter()
            .map(|&(capacity, backlog)| {
                let buffer = CountingBuffer::new(capacity);
                let _reader = buffer.add_reader();
                buffer.produce(backlog);
                buffer
            })
            .collect();
        let outputs: Vec<Arc<dyn OutputBuffer>> =
            buffers.iter().map(|b| b.clone() as Arc<dyn OutputBuffer>).collect();
        let request = SpaceRequest {
            output_multiple: multiple,
            output_multiple_set: multiple_set,
            min_noutput_items: floor,
        };

        match min_available_space(&outputs, request, 0) {
            Ok(OutputSpace::Available(n)) => {
                prop_assert!(n >= floor.max(1));
                for &(capacity, backlog) in &ports {
                    prop_assert!(n <= capacity - backlog);
                    prop_assert!(n <= capacity / 2);
                }
                if multiple_set {
                    prop_assert_eq!(n % multiple, 0);
                }
            }
            Ok(OutputSpace::Blocked { port, best }) => {
                prop_assert!(port < ports.len());
                let (capacity, backlog) = ports[port];
                let space = capacity - backlog;
                let rounded = space / multiple * multiple;
                let avail = if rounded == 0 && space > 0 && !multiple_set {
                    space
                } else {
                    rounded
                };
                prop_assert!(avail < floor.max(1));
                if port == 0 {
                    prop_assert_eq!(best, usize::MAX);
                }
            }
            Ok(OutputSpace::Finished) => prop_assert!(false, "no reader is done"),
            Err(ExecError::BufferTooSmall { port, capacity, .. }) => {
                prop_assert_eq!(capacity, ports[port].0);
                prop_assert!((capacity / 2) / multiple * multiple < floor.max(1));
            }
            Err(other) => prop_assert!(false, "unexpected error {other}"),
        }
    }

    #[test]
    fn undersized_buffer_always_fatal(capacity in 1usize..64, extra in 1usize..64) {
        let buffer = CountingBuffer::new(capacity);
        let _reader = buffer.add_reader();
        let outputs: Vec<Arc<dyn OutputBuffer>> = vec![buffer];
        let request = SpaceRequest {
            output_multiple: 1,
            output_multiple_set: false,
            min_noutput_items: capacity / 2 + extra,
        };
        let is_too_small = matches!(
            min_available_space(&outputs, request, 0),
            Err(ExecError::BufferTooSmall { .. })
        );
        prop_assert!(is_too_small);
    }
}
