// THEORY:
// The `pipeline` module is the top-level API of the engine. A `Session` owns one
// extraction run from start to finish: it pulls frames through the smoothing
// window, turns each centered frame into a step record, remembers what it needs
// for the end-of-session summary, and writes everything to its sink.
//
// Key architectural principles:
// 1.  **Explicit Lifecycle**: Every operation checks the `SessionState` first and
//     rejects calls that make no sense in that state with `InvalidState`. The state
//     machine is `Uninitialized → Initialized → {Stepping ⇄ Paused} → Finished |
//     Aborted`, and `initialize` can restart it from anywhere.
// 2.  **Two Lifetimes**: Session-scoped data (map, window, accessibility,
//     accumulators) lives in `ActiveSession` and is rebuilt by `initialize`. Step-
//     scoped data (mask, cell grid, order parameters) is produced fresh by every
//     step and only kept around as the read-only `StepSnapshot`.
// 3.  **All Or Nothing Steps**: A step is written before it touches the
//     accumulators, so a failing sink leaves them as they were after the previous
//     step. A wrong-sized frame is stopped at the window's door: it costs one
//     `FrameSizeMismatch` and is gone, and the next step carries on without it.
// 4.  **Between Steps Only**: All mutation goes through `&mut self`, so an obstacle
//     edit can never interleave with a running step. `engine_loop` builds on this.

use crate::config::SessionConfig;
use crate::core_modules::accessibility::{AccessibilityGrid, PixelRect};
use crate::core_modules::accumulators::SessionAccumulators;
use crate::core_modules::agent_mask::{self, AgentMask};
use crate::core_modules::cell_stats::{AggregationParams, CellStatsGrid, PixelCountCorrection};
use crate::core_modules::coordinate_map::GridCoordinateMap;
use crate::core_modules::frame_source::FrameSource;
use crate::core_modules::frame_window::FrameWindowBuffer;
use crate::core_modules::motion_field::MotionEstimator;
use crate::core_modules::order_params::OrderParameters;
use crate::core_modules::output_sink::RecordSink;
use crate::core_modules::records::{
    CellRecord, CellSummary, DensityCellRecord, SessionMetadata, SessionSummary, StepRecord, StillRecord,
};
use crate::error::{EngineError, EngineResult};
use image::RgbImage;
use tracing::{debug, info, warn};

/// Where a session is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    Uninitialized,
    Initialized,
    Stepping,
    Paused,
    /// The frame stream ran out; the summary has been written.
    Finished,
    /// The session was stopped before the end of the stream.
    Aborted,
}

/// The step-scoped results of the most recent step.
#[derive(Debug, Clone)]
pub struct StepSnapshot {
    pub mask: AgentMask,
    pub cells: CellStatsGrid,
    pub order: OrderParameters,
    pub record: StepRecord,
}

/// Session-scoped state, rebuilt by every `initialize`.
#[derive(Debug)]
struct ActiveSession {
    config: SessionConfig,
    map: GridCoordinateMap,
    window: FrameWindowBuffer,
    accessibility: AccessibilityGrid,
    accumulators: SessionAccumulators,
    /// Masked pixels in the reference frame passed to `initialize`.
    baseline_pixel_count: u64,
    /// Index the next step record will carry.
    step_index: u64,
    finalized: bool,
}

impl ActiveSession {
    fn aggregation_params(&self, current_total: u64) -> AggregationParams {
        AggregationParams {
            body_length: self.config.body_length,
            frame_time: self.config.frame_time,
            pixels_per_agent: self.config.pixels_per_agent,
            correction: self.config.constant_total_pixel_count.then_some(PixelCountCorrection {
                baseline_total: self.baseline_pixel_count,
                current_total,
            }),
        }
    }

    fn summaries(&self) -> (SessionSummary, CellSummary) {
        let (average_speed_mean, average_speed_std) = self.accumulators.average_speed_summary();
        let session = SessionSummary {
            average_speed_mean,
            average_speed_std,
            buckets: self.accumulators.density_buckets().into_iter().map(Into::into).collect(),
        };
        let cells = CellSummary {
            inaccessible: self.accessibility.inaccessible_cells(),
            guidance: self.accumulators.guidance_field(),
        };
        (session, cells)
    }
}

/// Writes both summaries and marks the session as finalized.
fn write_summaries<K: RecordSink + ?Sized>(active: &mut ActiveSession, sink: &mut K) -> EngineResult<()> {
    let (session, cells) = active.summaries();
    sink.write_session_summary(&session)?;
    sink.write_cell_summary(&cells)?;
    active.finalized = true;
    info!(
        steps = active.accumulators.step_count(),
        overall_average_speed = session.average_speed_mean,
        buckets = session.buckets.len(),
        inaccessible_cells = cells.inaccessible.len(),
        guidance_cells = cells.guidance.len(),
        "session finalized"
    );
    Ok(())
}

/// Extracts agent density from a single still image.
///
/// There is no window and no motion here: the image is classified once, agents are
/// counted per cell, and the sink receives a session header without a frame time
/// followed by one density-only block.
pub fn extract_still<K: RecordSink + ?Sized>(
    config: &SessionConfig,
    image: &RgbImage,
    sink: &mut K,
) -> EngineResult<StillRecord> {
    config.validate()?;
    let (width, height) = image.dimensions();
    let map = GridCoordinateMap::build(width, height, config.body_length, config.resolution)
        .inspect_err(|error| warn!(%error, "cannot build the grid for this image"))?;

    let mask = agent_mask::classify(image, config.body_color, config.color_threshold);
    let cells = CellStatsGrid::count_agents(&mask, &map, config.pixels_per_agent);
    let still = StillRecord {
        cells: cells
            .occupied()
            .map(|((x, y), stats)| DensityCellRecord::from_stats(x, y, stats))
            .collect(),
    };

    sink.write_metadata(&SessionMetadata {
        resolution: map.resolution(),
        ground_size: map.ground_size(),
        frame_time: None,
        total_frame_count: None,
        frame_width: width,
        frame_height: height,
    })?;
    sink.write_still(&still)?;

    info!(
        masked_pixels = mask.count(),
        occupied_cells = still.cells.len(),
        "still image extracted"
    );
    Ok(still)
}

/// One extraction session over a frame source, a motion estimator and a record sink.
pub struct Session<S, E, K> {
    source: S,
    estimator: E,
    sink: K,
    state: SessionState,
    active: Option<ActiveSession>,
    last: Option<StepSnapshot>,
}

impl<S, E, K> Session<S, E, K>
where
    S: FrameSource,
    E: MotionEstimator,
    K: RecordSink,
{
    pub fn new(source: S, estimator: E, sink: K) -> Self {
        Self {
            source,
            estimator,
            sink,
            state: SessionState::Uninitialized,
            active: None,
            last: None,
        }
    }

    /// Starts a new session on `reference_frame`, discarding any previous one.
    /// On error the previous session, if any, is left untouched.
    pub fn initialize(&mut self, config: SessionConfig, reference_frame: &RgbImage) -> EngineResult<()> {
        config.validate()?;
        let (width, height) = reference_frame.dimensions();
        let map = GridCoordinateMap::build(width, height, config.body_length, config.resolution)
            .inspect_err(|error| warn!(%error, "cannot build the grid for this session"))?;

        let baseline_pixel_count =
            agent_mask::classify(reference_frame, config.body_color, config.color_threshold).count();
        let metadata = SessionMetadata {
            resolution: map.resolution(),
            ground_size: map.ground_size(),
            frame_time: Some(config.frame_time),
            total_frame_count: self.source.frame_count_hint(),
            frame_width: width,
            frame_height: height,
        };
        self.sink.write_metadata(&metadata)?;

        info!(
            resolution = map.resolution(),
            ground_size = map.ground_size(),
            frame_width = width,
            frame_height = height,
            window = config.smooth_window_size,
            baseline_pixel_count,
            "session initialized"
        );

        self.active = Some(ActiveSession {
            window: FrameWindowBuffer::new(config.smooth_window_size, width, height),
            accessibility: AccessibilityGrid::new(map.resolution()),
            accumulators: SessionAccumulators::new(map.resolution()),
            config,
            map,
            baseline_pixel_count,
            step_index: 0,
            finalized: false,
        });
        self.last = None;
        self.state = SessionState::Initialized;
        Ok(())
    }

    /// Runs one step. Returns `Ok(false)` once the frame stream is exhausted.
    pub fn step_frame(&mut self) -> EngineResult<bool> {
        match self.state {
            SessionState::Uninitialized | SessionState::Paused => {
                return Err(self.invalid_state("step"));
            }
            SessionState::Finished | SessionState::Aborted => return Ok(false),
            SessionState::Initialized | SessionState::Stepping => {}
        }
        let Some(active) = self.active.as_mut() else {
            return Err(EngineError::InvalidState {
                operation: "step",
                state: self.state,
            });
        };

        if !active.window.advance(&mut self.source, &mut self.estimator)? {
            info!(steps = active.step_index, "frame stream exhausted");
            self.state = SessionState::Finished;
            if !active.finalized {
                write_summaries(active, &mut self.sink)?;
            }
            return Ok(false);
        }
        self.state = SessionState::Stepping;

        let Some(reference) = active.window.reference() else {
            return Ok(false);
        };
        let Some(field) = active.window.smoothed_motion_field() else {
            return Ok(false);
        };

        let config = &active.config;
        let mask = agent_mask::classify(
            &reference.frames.background_subtracted,
            config.body_color,
            config.color_threshold,
        );
        let params = active.aggregation_params(mask.count());
        let cells = CellStatsGrid::aggregate(&mask, &field, &active.map, &params);
        let order = OrderParameters::compute(&mask, &field, config.body_length, config.frame_time);

        let record = StepRecord {
            step_index: active.step_index,
            average_speed: order.average_speed,
            polarization: order.polarization_magnitude(),
            angular_momentum: order.angular_momentum_magnitude(),
            cells: cells
                .occupied()
                .map(|((x, y), stats)| CellRecord::from_stats(x, y, stats))
                .collect(),
        };
        self.sink.write_step(&record)?;
        active.accumulators.record_step(&cells, &order);

        debug!(
            step = active.step_index,
            masked_pixels = order.sample_count,
            occupied_cells = record.cells.len(),
            average_speed = order.average_speed,
            polarization = record.polarization,
            angular_momentum = order.angular_momentum,
            "step complete"
        );

        active.step_index += 1;
        self.last = Some(StepSnapshot {
            mask,
            cells,
            order,
            record,
        });
        Ok(true)
    }

    /// Marks every grid cell touched by `rect` as inaccessible. Returns how many cells changed.
    pub fn add_obstacle(&mut self, rect: PixelRect) -> EngineResult<usize> {
        match self.state {
            SessionState::Initialized | SessionState::Stepping | SessionState::Paused => {}
            _ => return Err(self.invalid_state("add an obstacle")),
        }
        let state = self.state;
        let Some(active) = self.active.as_mut() else {
            return Err(EngineError::InvalidState {
                operation: "add an obstacle",
                state,
            });
        };
        let newly_blocked = active.accessibility.block(rect, &active.map);
        info!(
            x = rect.x,
            y = rect.y,
            width = rect.width,
            height = rect.height,
            newly_blocked,
            "obstacle added"
        );
        Ok(newly_blocked)
    }

    pub fn pause(&mut self) -> EngineResult<()> {
        match self.state {
            SessionState::Initialized | SessionState::Stepping => {
                self.state = SessionState::Paused;
                debug!("session paused");
                Ok(())
            }
            _ => Err(self.invalid_state("pause")),
        }
    }

    pub fn resume(&mut self) -> EngineResult<()> {
        match self.state {
            SessionState::Paused => {
                self.state = SessionState::Stepping;
                debug!("session resumed");
                Ok(())
            }
            _ => Err(self.invalid_state("resume")),
        }
    }

    /// Writes the session and cell summaries. Before the end of the stream this
    /// aborts the session; the summaries then cover the completed steps only.
    pub fn finalize(&mut self) -> EngineResult<()> {
        let state = self.state;
        let Some(active) = self.active.as_mut().filter(|active| !active.finalized) else {
            return Err(EngineError::InvalidState {
                operation: "finalize",
                state,
            });
        };
        write_summaries(active, &mut self.sink)?;
        if state != SessionState::Finished {
            self.state = SessionState::Aborted;
        }
        Ok(())
    }

    /// Stops the session without writing summaries.
    pub fn abort(&mut self) -> EngineResult<()> {
        match self.state {
            SessionState::Initialized | SessionState::Stepping | SessionState::Paused => {
                self.state = SessionState::Aborted;
                info!("session aborted");
                Ok(())
            }
            _ => Err(self.invalid_state("abort")),
        }
    }

    fn invalid_state(&self, operation: &'static str) -> EngineError {
        EngineError::InvalidState {
            operation,
            state: self.state,
        }
    }
}

impl<S, E, K> Session<S, E, K> {
    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn config(&self) -> Option<&SessionConfig> {
        self.active.as_ref().map(|active| &active.config)
    }

    pub fn coordinate_map(&self) -> Option<&GridCoordinateMap> {
        self.active.as_ref().map(|active| &active.map)
    }

    pub fn accessibility(&self) -> Option<&AccessibilityGrid> {
        self.active.as_ref().map(|active| &active.accessibility)
    }

    pub fn accumulators(&self) -> Option<&SessionAccumulators> {
        self.active.as_ref().map(|active| &active.accumulators)
    }

    pub fn baseline_pixel_count(&self) -> Option<u64> {
        self.active.as_ref().map(|active| active.baseline_pixel_count)
    }

    /// Number of steps completed since the last `initialize`.
    pub fn steps_completed(&self) -> u64 {
        self.active.as_ref().map_or(0, |active| active.step_index)
    }

    pub fn is_finalized(&self) -> bool {
        self.active.as_ref().is_some_and(|active| active.finalized)
    }

    pub fn last_step(&self) -> Option<&StepSnapshot> {
        self.last.as_ref()
    }

    pub fn last_mask(&self) -> Option<&AgentMask> {
        self.last.as_ref().map(|last| &last.mask)
    }

    pub fn last_cells(&self) -> Option<&CellStatsGrid> {
        self.last.as_ref().map(|last| &last.cells)
    }

    pub fn last_order_parameters(&self) -> Option<OrderParameters> {
        self.last.as_ref().map(|last| last.order)
    }

    pub fn last_record(&self) -> Option<&StepRecord> {
        self.last.as_ref().map(|last| &last.record)
    }

    pub fn sink(&self) -> &K {
        &self.sink
    }

    pub fn sink_mut(&mut self) -> &mut K {
        &mut self.sink
    }

    pub fn into_sink(self) -> K {
        self.sink
    }
}
