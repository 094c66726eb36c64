//! Error types for the block executor.
//!
//! Fatal conditions never unwind out of
//! [`BlockExecutor::run_one_iteration`](crate::executor::BlockExecutor::run_one_iteration):
//! the executor records them, finishes the block, and reports
//! [`ExecState::Done`](crate::executor::ExecState::Done). Backpressure is not
//! an error and is reported through the state enum instead.

/// Result alias used throughout the executor.
pub type Result<T> = std::result::Result<T, ExecError>;

/// Rejected relative-rate parameters.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RateError {
    /// Float rate was zero, negative, NaN or infinite.
    #[error("relative rate must be positive and finite, got {0}")]
    NotPositive(f64),

    /// Exact rate had a zero numerator or denominator.
    #[error("relative rate ratio {interpolation}/{decimation} must have non-zero terms")]
    ZeroTerm {
        /// Numerator (items produced).
        interpolation: u64,
        /// Denominator (items consumed).
        decimation: u64,
    },
}

/// Rejected [`BlockSettings`](crate::block::BlockSettings).
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SettingsError {
    /// `output_multiple` must be at least one.
    #[error("output_multiple must be >= 1")]
    ZeroOutputMultiple,

    /// `alignment` must be at least one.
    #[error("alignment must be >= 1")]
    ZeroAlignment,

    /// A per-block ceiling of zero would never allow work.
    #[error("max_noutput_items must be >= 1 when set")]
    ZeroMaxOutput,

    /// The relative rate is unusable.
    #[error(transparent)]
    Rate(#[from] RateError),
}

/// Errors raised while constructing or running a block executor.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ExecError {
    /// Downstream buffer can never hold `min_noutput_items`.
    #[error(
        "output {port}: buffer of {capacity} items is too small \
         for min_noutput_items = {min_noutput_items}"
    )]
    BufferTooSmall {
        /// Output port index.
        port: usize,
        /// Buffer capacity in items.
        capacity: usize,
        /// Floor the block asked for.
        min_noutput_items: usize,
    },

    /// Forecast asked for a negative number of input items.
    #[error("input {port}: forecast returned negative requirement {required}")]
    NegativeForecast {
        /// Input port index.
        port: usize,
        /// The value returned by forecast.
        required: i64,
    },

    /// Forecast asked for more input than the port can ever hold.
    #[error(
        "input {port}: requires {required} items \
         but at most {max_possible} can ever be available"
    )]
    ImpossibleInput {
        /// Input port index.
        port: usize,
        /// Items the block requires.
        required: usize,
        /// Largest amount the buffer can ever deliver.
        max_possible: usize,
    },

    /// ONE_TO_ONE tag propagation needs matching port counts.
    #[error(
        "one-to-one tag propagation needs ninputs == noutputs, \
         got {ninputs} inputs and {noutputs} outputs"
    )]
    PortCountMismatch {
        /// Number of inputs.
        ninputs: usize,
        /// Number of outputs.
        noutputs: usize,
    },

    /// Buffers handed to the executor do not match the block's declared ports.
    #[error(
        "block declares {expected_in} inputs / {expected_out} outputs \
         but was wired with {got_in} / {got_out}"
    )]
    PortArity {
        /// Declared inputs.
        expected_in: usize,
        /// Declared outputs.
        expected_out: usize,
        /// Wired inputs.
        got_in: usize,
        /// Wired outputs.
        got_out: usize,
    },

    /// A block with neither inputs nor outputs cannot be scheduled.
    #[error("block has no ports")]
    NoPorts,

    /// `Block::start` returned false.
    #[error("block `{0}` failed to start")]
    StartFailed(String),

    /// Invalid block settings.
    #[error(transparent)]
    Settings(#[from] SettingsError),

    /// The scheduler called a block that already finished.
    #[error("block `{0}` was called after it finished")]
    AlreadyDone(String),
}
