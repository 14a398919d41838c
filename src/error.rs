// THEORY:
// Every fallible operation in the engine reports through a single `EngineError`.
// The variants mirror the lifecycle: configuration problems stop a session from
// ever starting, state problems only reject the offending call, and collaborator
// problems (wrong-sized frames, a failing output stream) abort the current step
// without corrupting what has already been accumulated. End-of-stream is not in
// here on purpose: it is an ordinary `Ok(false)` from `step_frame`.

use crate::pipeline::SessionState;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("invalid configuration: {reason}")]
    InvalidConfig { reason: String },

    #[error(
        "grid of resolution {resolution} does not cover the {frame_width}x{frame_height} frame: \
         corner ({corner_x}, {corner_y}) maps to cell ({cell_x}, {cell_y})"
    )]
    GridCoverage {
        resolution: usize,
        frame_width: u32,
        frame_height: u32,
        corner_x: u32,
        corner_y: u32,
        cell_x: i64,
        cell_y: i64,
    },

    #[error("cannot {operation} while the session is {state:?}")]
    InvalidState {
        operation: &'static str,
        state: SessionState,
    },

    #[error("{what} is {actual_width}x{actual_height}, session expects {expected_width}x{expected_height}")]
    FrameSizeMismatch {
        what: &'static str,
        expected_width: u32,
        expected_height: u32,
        actual_width: u32,
        actual_height: u32,
    },

    #[error("output sink error: {0}")]
    Sink(#[from] std::io::Error),

    #[error("configuration file error: {0}")]
    Config(#[from] toml::de::Error),

    #[error("malformed record on line {line}: {reason}")]
    MalformedRecord { line: usize, reason: String },

    #[error("the engine loop has shut down")]
    EngineClosed,
}

impl EngineError {
    pub(crate) fn invalid_config(reason: impl Into<String>) -> Self {
        EngineError::InvalidConfig {
            reason: reason.into(),
        }
    }
}

pub type EngineResult<T> = Result<T, EngineError>;
