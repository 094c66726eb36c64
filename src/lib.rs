//! Per-iteration block executor for streaming dataflow graphs.
//!
//! A graph is a set of blocks joined by buffers. An outer scheduler calls
//! [`BlockExecutor::run_one_iteration`] repeatedly; each call decides how
//! much the block may produce, runs its work once, moves stream tags
//! across the block's rate and reports an [`ExecState`].

pub mod block;
pub mod buffer;
pub mod error;
pub mod executor;
#[doc(hidden)]
pub mod harness;
#[doc(hidden)]
pub mod invariant_ppt;
pub mod propagate;
pub mod rate;
pub mod space;
pub mod tag;

pub use block::{Block, BlockSettings, BlockShape, TagPropagationPolicy, WorkIo, WorkStatus};
pub use buffer::{InputReader, InputSnapshot, OutputBuffer, OutputSnapshot};
pub use error::{ExecError, RateError, Result, SettingsError};
pub use executor::{BlockExecutor, ExecState, ExecutorConfig, DEFAULT_MAX_NOUTPUT_ITEMS};
pub use rate::RelativeRate;
pub use tag::{Tag, TagValue};
