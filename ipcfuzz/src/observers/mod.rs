//! The coverage-agent facade: what the fuzzer observes about the target,
//! regardless of which instrumentation backend feeds it.

use serde::{Deserialize, Serialize};

use crate::{Error, TraceStage};

/// One executed basic block, as reported by the instrumentation agent.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CoverageBlock {
    /// Module the block belongs to
    pub module: String,
    /// Start address
    pub block_start: u64,
    /// End address
    pub block_end: u64,
}

/// Binds an RPC method to the instrumentation target inside the process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandlerSpec {
    /// RPC path the handler serves
    pub method: String,
    /// Module the handler function lives in
    pub module: String,
    /// Function name to instrument
    pub handler: String,
}

/// A session with the dynamic-instrumentation agent.
///
/// All calls are blocking with the timeouts owned by the implementation.
/// `start` is re-entrant across iterations: an attached session is reused.
pub trait CoverageAgent: Send {
    /// Attach to the process by name, inject the agent, bind the handler
    /// as the coverage target and begin feeding.
    fn start(&mut self, process_name: &str, handler: &HandlerSpec) -> Result<(), Error>;

    /// The coverage collected since the last clear, in execution order.
    fn get_coverage(&mut self) -> Result<Vec<CoverageBlock>, Error>;

    /// Duration of the last instrumented invocation, microseconds.
    fn get_last_exec_time(&mut self) -> Result<u64, Error>;

    /// Drops collected coverage.
    fn clear_coverage(&mut self) -> Result<(), Error>;

    /// Unloads the agent from the target.
    fn unload(&mut self) -> Result<(), Error>;

    /// Tears the whole session down.
    fn stop(&mut self) -> Result<(), Error>;
}

/// Agent used when instrumentation is disabled: observes nothing, never
/// fails.
#[derive(Debug, Default)]
pub struct NopCoverageAgent;

impl CoverageAgent for NopCoverageAgent {
    fn start(&mut self, _process_name: &str, _handler: &HandlerSpec) -> Result<(), Error> {
        Ok(())
    }

    fn get_coverage(&mut self) -> Result<Vec<CoverageBlock>, Error> {
        Ok(Vec::new())
    }

    fn get_last_exec_time(&mut self) -> Result<u64, Error> {
        Ok(0)
    }

    fn clear_coverage(&mut self) -> Result<(), Error> {
        Ok(())
    }

    fn unload(&mut self) -> Result<(), Error> {
        Ok(())
    }

    fn stop(&mut self) -> Result<(), Error> {
        Ok(())
    }
}

/// Compares two coverage sequences as ordered fingerprints.
///
/// A different length, or different block boundaries at any index, means
/// the target walked a different path.
#[must_use]
pub fn is_new_path(known: &[CoverageBlock], observed: &[CoverageBlock]) -> bool {
    if known.len() != observed.len() {
        return true;
    }
    known.iter().zip(observed.iter()).any(|(a, b)| {
        a.block_start != b.block_start || a.block_end != b.block_end
    })
}

/// The first block of `observed` that differs from `known`, if any.
/// Part of the crash signature.
#[must_use]
pub fn first_coverage_delta<'a>(
    known: &[CoverageBlock],
    observed: &'a [CoverageBlock],
) -> Option<&'a CoverageBlock> {
    observed.iter().enumerate().find_map(|(i, block)| {
        match known.get(i) {
            Some(old) if old.block_start == block.block_start && old.block_end == block.block_end => {
                None
            }
            _ => Some(block),
        }
    })
}

/// Convenience constructor for a [`Error::TraceFailed`]
#[must_use]
pub fn trace_failed(stage: TraceStage, reason: impl Into<String>) -> Error {
    Error::TraceFailed {
        stage,
        reason: reason.into(),
    }
}
