// THEORY:
// The building blocks of the engine, leaves first. Each module owns exactly one
// concern and knows nothing about the session lifecycle; `pipeline::Session` is
// the only place where they are wired together.

pub mod accessibility;
pub mod accumulators;
pub mod agent_mask;
pub mod cell_stats;
pub mod coordinate_map;
pub mod frame_source;
pub mod frame_window;
pub mod motion_field;
pub mod order_params;
pub mod output_sink;
pub mod records;
