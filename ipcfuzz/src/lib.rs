/*!
Welcome to `ipcfuzz`, a grey-box, coverage-guided fuzzer for RPC services
that speak a length-prefixed, schema-typed IPC protocol.

A fuzzing run is seeded from a packet capture of a real client/server
session: captured frames are re-typed against a compiled schema set, mined
for temporal and value-level dependencies, ranked by an energy score, and
then mutated and re-sent while a dynamic-instrumentation agent reports the
basic blocks the target executed.
*/

pub mod analysis;
pub mod bolts;
pub mod capture;
pub mod corpus;
pub mod events;
pub mod executors;
pub mod fuzzer;
pub mod mutators;
pub mod observers;
pub mod schema;
pub mod stats;

use std::{fmt, io, num::ParseIntError};

/// The stage of a coverage-agent interaction that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraceStage {
    /// Attaching to the target and injecting the agent
    Attach,
    /// Binding the instrumentation handler
    SetTarget,
    /// Starting the coverage feed
    StartFeed,
    /// Fetching coverage blocks
    GetCoverage,
    /// Fetching the last execution time
    GetExecTime,
    /// Clearing collected coverage
    Clear,
    /// Unloading the agent / detaching
    Unload,
}

impl fmt::Display for TraceStage {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            TraceStage::Attach => write!(f, "attach"),
            TraceStage::SetTarget => write!(f, "set-target"),
            TraceStage::StartFeed => write!(f, "start-feed"),
            TraceStage::GetCoverage => write!(f, "get-coverage"),
            TraceStage::GetExecTime => write!(f, "get-exec-time"),
            TraceStage::Clear => write!(f, "clear"),
            TraceStage::Unload => write!(f, "unload"),
        }
    }
}

/// Main error enum for the fuzzer
#[derive(Debug)]
pub enum Error {
    /// Transport or OS-level failure reaching the target
    Network(String),
    /// The target answered with a non-OK RPC status
    RpcStatus(String),
    /// Any other failure out of the RPC layer
    Unknown(String),
    /// The schema rejected a field mutation, carries the field name
    MutationFailed(String),
    /// A coverage-agent call failed
    TraceFailed {
        /// Which call failed
        stage: TraceStage,
        /// What the agent reported
        reason: String,
    },
    /// The capture file could not be read as a packet stream
    BadCapture(String),
    /// The schema files failed to compile
    BadSchema(String),
    /// The startup dry run did not come back clean
    DryRunFailed(String),
    /// The capture yielded no decodable message
    EmptyCorpus,
    /// Serialization error
    Serialize(String),
    /// File related error
    File(io::Error),
    /// Something is not right
    IllegalState(String),
    /// A parameter was wrong
    IllegalArgument(String),
    /// Shutting down, not an error
    ShuttingDown,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Network(s) => write!(f, "Network error: {s}"),
            Self::RpcStatus(s) => write!(f, "RPC status error: {s}"),
            Self::Unknown(s) => write!(f, "Unknown RPC error: {s}"),
            Self::MutationFailed(field) => write!(f, "Mutation rejected for field {field}"),
            Self::TraceFailed { stage, reason } => {
                write!(f, "Coverage agent failed at {stage}: {reason}")
            }
            Self::BadCapture(s) => write!(f, "Bad capture: {s}"),
            Self::BadSchema(s) => write!(f, "Bad schema: {s}"),
            Self::DryRunFailed(s) => write!(f, "Dry run failed: {s}"),
            Self::EmptyCorpus => write!(f, "The capture yielded no decodable message"),
            Self::Serialize(s) => write!(f, "Error in serialization: {s}"),
            Self::File(err) => write!(f, "File IO error: {err}"),
            Self::IllegalState(s) => write!(f, "Illegal state: {s}"),
            Self::IllegalArgument(s) => write!(f, "Illegal argument: {s}"),
            Self::ShuttingDown => write!(f, "Shutting down"),
        }
    }
}

impl std::error::Error for Error {}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Self::File(err)
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialize(format!("{err}"))
    }
}

impl From<ParseIntError> for Error {
    fn from(err: ParseIntError) -> Self {
        Self::IllegalArgument(format!("{err}"))
    }
}
