// THEORY:
// This file is the entry point of the `herd_vision` library crate. It exposes the
// grid aggregation and streaming statistics engine: give it a stream of aligned
// frames and a motion estimator, and it emits, step by step, where the herd is,
// how fast and how coherently it moves, and at the end of the run how speed
// relates to local density and which way the herd tends to flow through each cell.
//
// `pipeline::Session` is the primary interface; `pipeline::extract_still` covers
// the single-image case, density only. `engine_loop` runs a session on a
// worker so it can be driven and edited from async code. The `core_modules` hold
// the individual building blocks and are public for callers that want to use them
// on their own, for example to preview a grid before starting a session.

pub mod config;
pub mod core_modules;
pub mod engine_loop;
pub mod error;
pub mod pipeline;

pub use crate::config::SessionConfig;
pub use crate::core_modules::accessibility::PixelRect;
pub use crate::core_modules::frame_source::{FrameSource, FrameTriple, VecFrameSource};
pub use crate::core_modules::motion_field::{MotionEstimator, MotionField};
pub use crate::core_modules::output_sink::{FileSink, MemorySink, RecordSink};
pub use crate::core_modules::records::{
    CellRecord, CellSummary, DensityCellRecord, SessionMetadata, SessionSummary, StepRecord, StillRecord,
};
pub use crate::engine_loop::{EngineHandle, spawn_engine};
pub use crate::error::{EngineError, EngineResult};
pub use crate::pipeline::{Session, SessionState, extract_still};
