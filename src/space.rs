//! Feasible output space: how much a block may write this call.

use crate::buffer::OutputBuffer;
use crate::error::{ExecError, Result};
use std::sync::Arc;

/// Result of scanning the output buffers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputSpace {
    /// A blocking output's reader side is done; the block can never write again.
    Finished,
    /// Output `port` is below the floor. `best` is the running minimum over
    /// the ports scanned before it, to be folded in when the scan resumes.
    Blocked {
        /// First port that blocked.
        port: usize,
        /// Minimum cap over ports `resume_port..port`.
        best: usize,
    },
    /// Largest legal output quantity; a multiple of `output_multiple`.
    Available(usize),
}

/// Output granularity and floor used by [`min_available_space`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpaceRequest {
    /// Granularity of every output quantity.
    pub output_multiple: usize,
    /// Whether the block explicitly asked for `output_multiple`.
    pub output_multiple_set: bool,
    /// Smallest quantity worth a call; zero means one.
    pub min_noutput_items: usize,
}

pub(crate) fn round_down(n: usize, multiple: usize) -> usize {
    (n / multiple) * multiple
}

pub(crate) fn round_up(n: usize, multiple: usize) -> usize {
    n.div_ceil(multiple).saturating_mul(multiple)
}

/// Scan `outputs[resume_port..]` for the largest quantity every buffer can take.
///
/// Each port is capped at its free space and at half its capacity, both
/// rounded down to the multiple. A port whose best-case cap is below the
/// floor can never satisfy the block and is reported as
/// [`ExecError::BufferTooSmall`].
pub fn min_available_space(
    outputs: &[Arc<dyn OutputBuffer>],
    request: SpaceRequest,
    resume_port: usize,
) -> Result<OutputSpace> {
    let multiple = request.output_multiple.max(1);
    let floor = request.min_noutput_items.max(1);
    let mut min_space = usize::MAX;

    for (port, buffer) in outputs.iter().enumerate().skip(resume_port) {
        let snapshot = buffer.snapshot();

        let mut avail = round_down(snapshot.space_available, multiple);
        if avail == 0 && snapshot.space_available > 0 && !request.output_multiple_set {
            avail = snapshot.space_available;
        }

        let best = round_down(buffer.capacity() / 2, multiple);
        if best < floor {
            return Err(ExecError::BufferTooSmall {
                port,
                capacity: buffer.capacity(),
                min_noutput_items: floor,
            });
        }

        let n = avail.min(best);
        if n < floor {
            if snapshot.done {
                return Ok(OutputSpace::Finished);
            }
            return Ok(OutputSpace::Blocked {
                port,
                best: min_space,
            });
        }
        min_space = min_space.min(n);
    }

    Ok(OutputSpace::Available(min_space))
}
