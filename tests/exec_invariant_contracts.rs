//! Contract tests for construction-time invariant signaling.
//!
//! One test owns the global invariant log so clearing it cannot race
//! with another test in this binary.

use sigflow::harness::{CountingBuffer, CountingSink, CountingSource};
use sigflow::invariant_ppt::{
    clear_invariant_log, contract_test, BLOCK_STARTED, BLOCK_STOPPED, PORT_ARITY_MATCHES,
    SETTINGS_VALIDATED, SHAPE_CLASSIFIED,
};
use sigflow::{BlockExecutor, ExecState, ExecutorConfig, InputReader, OutputBuffer};
use std::sync::Arc;

#[test]
fn executor_lifecycle_signals_every_setup_invariant() {
    clear_invariant_log();

    let buffer = CountingBuffer::new(128);
    let reader = buffer.add_reader();
    let mut source = BlockExecutor::new(
        CountingSource::new(Some(32)),
        Vec::new(),
        vec![buffer.clone() as Arc<dyn OutputBuffer>],
        ExecutorConfig::default(),
    )
    .unwrap();
    let mut sink = BlockExecutor::new(
        CountingSink::new(1),
        vec![reader as Arc<dyn InputReader>],
        Vec::new(),
        ExecutorConfig::default(),
    )
    .unwrap();

    contract_test(
        "executor construction",
        &[SETTINGS_VALIDATED, PORT_ARITY_MATCHES, SHAPE_CLASSIFIED, BLOCK_STARTED],
    );

    assert_eq!(source.run_once(), ExecState::Ready);
    assert_eq!(sink.run_once(), ExecState::ReadyNoOutput);
    drop(source);
    drop(sink);

    contract_test("executor teardown", &[BLOCK_STOPPED]);
}
