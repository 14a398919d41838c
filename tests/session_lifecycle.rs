use herd_vision::core_modules::frame_source::{FrameTriple, VecFrameSource};
use herd_vision::{
    DensityCellRecord, EngineError, MemorySink, MotionEstimator, MotionField, PixelRect, Session, SessionConfig,
    SessionState, extract_still,
};
use image::{Rgb, RgbImage};

const AGENT: Rgb<u8> = Rgb([250, 250, 250]);

/// Returns the same field for every frame pair.
struct FixedEstimator(MotionField);

impl MotionEstimator for FixedEstimator {
    fn estimate(&mut self, _previous: &RgbImage, _current: &RgbImage) -> MotionField {
        self.0.clone()
    }
}

fn config(resolution: i32, body_length: f64, frame_time: f64, window: usize) -> SessionConfig {
    SessionConfig {
        body_color: [250, 250, 250],
        color_threshold: 5.0,
        pixels_per_agent: 1.0,
        body_length,
        smooth_window_size: window,
        resolution,
        frame_time,
        constant_total_pixel_count: false,
    }
}

fn frame_with(width: u32, height: u32, agents: impl IntoIterator<Item = (u32, u32)>) -> RgbImage {
    let mut frame = RgbImage::new(width, height);
    for (x, y) in agents {
        frame.put_pixel(x, y, AGENT);
    }
    frame
}

fn session_over(
    frames: Vec<RgbImage>,
    field: MotionField,
) -> Session<VecFrameSource, FixedEstimator, MemorySink> {
    let source = VecFrameSource::new(frames.into_iter().map(FrameTriple::uniform));
    Session::new(source, FixedEstimator(field), MemorySink::new())
}

#[test]
fn single_pixel_is_converted_to_ground_units() {
    let frame = frame_with(20, 20, [(3, 3)]);
    let mut session = session_over(vec![frame.clone()], MotionField::uniform(20, 20, [5.0, 0.0]));
    session.initialize(config(2, 10.0, 0.1, 1), &frame).unwrap();
    assert!(session.step_frame().unwrap());

    let cell = session.last_cells().unwrap().get(0, 0).unwrap();
    assert!((cell.velocity_mean[0] - 5.0).abs() < 1e-9);
    assert!(cell.velocity_mean[1].abs() < 1e-9);
    assert!(cell.velocity_variance[0].abs() < 1e-9);
    assert!(cell.velocity_variance[1].abs() < 1e-9);

    let record = session.last_record().unwrap();
    assert_eq!(record.step_index, 0);
    assert!((record.average_speed - 5.0).abs() < 1e-9);
    assert_eq!(record.cells.len(), 1);
    assert_eq!((record.cells[0].x, record.cells[0].y, record.cells[0].agent_count), (0, 0, 1));
}

#[test]
fn two_pixels_in_one_cell_give_mean_and_variance() {
    let frame = frame_with(4, 4, [(0, 0), (1, 0)]);
    let mut field = MotionField::zeros(4, 4);
    field.set(0, 0, [5.0, 0.0]);
    field.set(1, 0, [3.0, 0.0]);
    let mut session = session_over(vec![frame.clone()], field);
    session.initialize(config(2, 1.0, 1.0, 1), &frame).unwrap();
    session.step_frame().unwrap();

    let record = session.last_record().unwrap();
    assert_eq!(record.cells.len(), 1);
    assert!((record.cells[0].velocity_mean[0] - 4.0).abs() < 1e-9);
    assert!((record.cells[0].velocity_variance[0] - 1.0).abs() < 1e-9);
}

#[test]
fn orthogonal_motion_half_polarizes() {
    let frame = frame_with(4, 4, [(0, 0), (3, 3)]);
    let mut field = MotionField::zeros(4, 4);
    field.set(0, 0, [1.0, 0.0]);
    field.set(3, 3, [0.0, 1.0]);
    let mut session = session_over(vec![frame.clone()], field);
    session.initialize(config(2, 1.0, 1.0, 1), &frame).unwrap();
    session.step_frame().unwrap();

    let order = session.last_order_parameters().unwrap();
    assert!((order.polarization[0] - 0.5).abs() < 1e-9);
    assert!((order.polarization[1] - 0.5).abs() < 1e-9);
    assert!((session.last_record().unwrap().polarization - 0.70710678).abs() < 1e-4);
}

#[test]
fn constant_total_flag_rescales_against_the_reference_frame() {
    // 100 agent pixels in the reference frame.
    let reference = frame_with(20, 20, (0..5).flat_map(|y| (0..20).map(move |x| (x, y))));
    // 80 in the step frame: 10 in cell (0, 0) and 70 in cell (1, 1).
    let step = frame_with(
        20,
        20,
        (0..10)
            .map(|x| (x, 0))
            .chain((10..17).flat_map(|y| (10..20).map(move |x| (x, y)))),
    );
    let mut session = session_over(vec![step], MotionField::zeros(20, 20));
    let mut config = config(2, 1.0, 1.0, 1);
    config.constant_total_pixel_count = true;
    session.initialize(config, &reference).unwrap();
    assert_eq!(session.baseline_pixel_count(), Some(100));
    session.step_frame().unwrap();

    let cell = session.last_cells().unwrap().get(0, 0).unwrap();
    assert_eq!(cell.pixel_count, 10);
    assert!((cell.corrected_pixel_count - 12.5).abs() < 1e-9);
    // 12.5 rounds half-to-even.
    assert_eq!(session.last_record().unwrap().cells[0].agent_count, 12);
}

#[test]
fn obstacle_shows_up_in_the_cell_summary() {
    let frame = frame_with(4, 4, [(0, 0)]);
    let mut session = session_over(vec![frame.clone(); 2], MotionField::zeros(4, 4));
    session.initialize(config(2, 1.0, 1.0, 1), &frame).unwrap();
    session.step_frame().unwrap();
    assert_eq!(session.add_obstacle(PixelRect::new(2, 2, 2, 2)).unwrap(), 1);
    session.finalize().unwrap();

    let summary = &session.sink().cell_summaries[0];
    assert_eq!(summary.inaccessible, vec![(1, 1)]);
}

#[test]
fn window_cold_start_centers_on_the_middle_frame() {
    // Frame i has its only agent at (i, 0).
    let frames: Vec<RgbImage> = (0..5).map(|i| frame_with(8, 8, [(i, 0)])).collect();
    let mut session = session_over(frames.clone(), MotionField::zeros(8, 8));
    session.initialize(config(4, 1.0, 1.0, 3), &frames[0]).unwrap();

    let mut centers = Vec::new();
    while session.step_frame().unwrap() {
        let mask = session.last_mask().unwrap();
        centers.push(mask.iter_agents().next().unwrap());
    }
    assert_eq!(centers, vec![(1, 0), (2, 0), (3, 0)]);
    assert_eq!(session.state(), SessionState::Finished);

    let indices: Vec<u64> = session.sink().steps.iter().map(|s| s.step_index).collect();
    assert_eq!(indices, vec![0, 1, 2]);
}

#[test]
fn stream_shorter_than_the_window_finishes_without_steps() {
    let frames: Vec<RgbImage> = (0..2).map(|_| frame_with(4, 4, [(0, 0)])).collect();
    let mut session = session_over(frames.clone(), MotionField::zeros(4, 4));
    session.initialize(config(2, 1.0, 1.0, 3), &frames[0]).unwrap();
    assert!(!session.step_frame().unwrap());
    assert_eq!(session.state(), SessionState::Finished);

    let summary = &session.sink().session_summaries[0];
    assert_eq!(summary.average_speed_mean, 0.0);
    assert!(summary.buckets.is_empty());
}

#[test]
fn finalize_is_idempotent_and_aborts_an_unfinished_session() {
    let frame = frame_with(4, 4, [(0, 0), (1, 1)]);
    let mut session = session_over(vec![frame.clone(); 4], MotionField::uniform(4, 4, [1.0, 0.0]));
    session.initialize(config(2, 1.0, 1.0, 1), &frame).unwrap();
    session.step_frame().unwrap();
    session.step_frame().unwrap();

    session.finalize().unwrap();
    assert_eq!(session.state(), SessionState::Aborted);
    let before = session.sink().clone();

    assert!(matches!(
        session.finalize(),
        Err(EngineError::InvalidState {
            operation: "finalize",
            ..
        })
    ));
    assert_eq!(session.sink(), &before);
    assert!(!session.step_frame().unwrap());

    // Only the two completed steps are summarized.
    assert_eq!(session.accumulators().unwrap().step_count(), 2);
    let summary = &before.session_summaries[0];
    assert!((summary.average_speed_mean - 1.0).abs() < 1e-9);
    assert_eq!(summary.average_speed_std, 0.0);
    // Two agents in cell (0, 0): bucket 2 gets both samples.
    assert_eq!(summary.buckets.len(), 3);
    assert!((summary.buckets[2].mean_speed - 1.0).abs() < 1e-9);
}

#[test]
fn pixels_are_conserved_across_cells() {
    let agents: Vec<(u32, u32)> = (0..30)
        .flat_map(|y| (0..40).map(move |x| (x, y)))
        .filter(|(x, y)| (x * 7 + y * 3) % 5 == 0)
        .collect();
    let frame = frame_with(40, 30, agents.iter().copied());
    let mut session = session_over(vec![frame.clone()], MotionField::uniform(40, 30, [0.5, -0.25]));
    session.initialize(config(6, 4.0, 0.5, 1), &frame).unwrap();
    session.step_frame().unwrap();

    let cells = session.last_cells().unwrap();
    assert_eq!(cells.total_pixel_count(), agents.len() as u64);
    assert_eq!(session.last_mask().unwrap().count(), agents.len() as u64);
    let polarization = session.last_order_parameters().unwrap().polarization_magnitude();
    assert!((0.0..=1.0 + 1e-12).contains(&polarization));
}

#[test]
fn reinitialize_starts_a_clean_session() {
    let frame = frame_with(4, 4, [(0, 0)]);
    let mut session = session_over(vec![frame.clone(); 3], MotionField::zeros(4, 4));
    session.initialize(config(2, 1.0, 1.0, 1), &frame).unwrap();
    session.add_obstacle(PixelRect::new(0, 0, 4, 4)).unwrap();
    session.step_frame().unwrap();

    session.initialize(config(2, 1.0, 1.0, 1), &frame).unwrap();
    assert_eq!(session.state(), SessionState::Initialized);
    assert!(session.accessibility().unwrap().inaccessible_cells().is_empty());
    assert_eq!(session.steps_completed(), 0);
    assert!(session.last_record().is_none());
    assert_eq!(session.sink().metadata.len(), 2);
}

#[test]
fn even_smoothing_window_is_rejected() {
    let frame = frame_with(4, 4, std::iter::empty());
    let mut session = session_over(vec![], MotionField::zeros(4, 4));
    let mut bad = config(2, 1.0, 1.0, 1);
    bad.smooth_window_size = 4;
    assert!(matches!(
        session.initialize(bad, &frame),
        Err(EngineError::InvalidConfig { .. })
    ));
    assert_eq!(session.state(), SessionState::Uninitialized);
}

#[test]
fn one_wrong_sized_frame_costs_one_step() {
    // Frame i has its only agent at (i, 0); frame 3 is a stray 6x4 image.
    let mut frames: Vec<RgbImage> = (0..8).map(|i| frame_with(8, 8, [(i, 0)])).collect();
    frames[3] = frame_with(6, 4, std::iter::empty());
    let mut session = session_over(frames.clone(), MotionField::zeros(8, 8));
    session.initialize(config(4, 1.0, 1.0, 5), &frames[0]).unwrap();

    assert!(matches!(
        session.step_frame(),
        Err(EngineError::FrameSizeMismatch {
            actual_width: 6,
            actual_height: 4,
            ..
        })
    ));
    assert_eq!(session.state(), SessionState::Initialized);
    assert!(session.sink().steps.is_empty());

    let mut centers = Vec::new();
    while session.step_frame().unwrap() {
        centers.push(session.last_mask().unwrap().iter_agents().next().unwrap());
    }
    assert_eq!(centers, vec![(2, 0), (4, 0), (5, 0)]);
    assert_eq!(session.state(), SessionState::Finished);
    let indices: Vec<u64> = session.sink().steps.iter().map(|s| s.step_index).collect();
    assert_eq!(indices, vec![0, 1, 2]);
}

#[test]
fn obstacle_outside_the_frame_blocks_nothing() {
    let frame = frame_with(4, 4, [(0, 0)]);
    let mut session = session_over(vec![frame.clone(); 2], MotionField::zeros(4, 4));
    session.initialize(config(2, 1.0, 1.0, 1), &frame).unwrap();
    session.step_frame().unwrap();

    assert_eq!(session.add_obstacle(PixelRect::new(10, 10, 5, 5)).unwrap(), 0);
    assert_eq!(session.add_obstacle(PixelRect::new(-8, 0, 8, 4)).unwrap(), 0);
    session.finalize().unwrap();

    let summary = &session.sink().cell_summaries[0];
    assert!(summary.inaccessible.is_empty());
    assert!(!summary.to_string().lines().any(|line| line.starts_with("NAG ")));
}

#[test]
fn still_image_reports_density_only() {
    // Three agent pixels in cell (0, 0) and one in cell (1, 1), two pixels per agent.
    let image = frame_with(4, 4, [(0, 0), (1, 0), (1, 1), (3, 3)]);
    let mut still_config = config(2, 1.0, 1.0, 1);
    still_config.pixels_per_agent = 2.0;
    let mut sink = MemorySink::new();

    let still = extract_still(&still_config, &image, &mut sink).unwrap();
    // 1.5 and 0.5 agents round half-to-even.
    assert_eq!(
        still.cells,
        vec![
            DensityCellRecord { x: 0, y: 0, agent_count: 2 },
            DensityCellRecord { x: 1, y: 1, agent_count: 0 },
        ]
    );
    assert_eq!(sink.stills, vec![still]);
    assert!(sink.steps.is_empty());
    assert_eq!(sink.metadata.len(), 1);
    assert_eq!(sink.metadata[0].frame_time, None);
    assert_eq!(sink.metadata[0].total_frame_count, None);
}

#[test]
fn still_image_with_a_bad_config_writes_nothing() {
    let image = frame_with(4, 4, [(0, 0)]);
    let mut bad = config(2, 1.0, 1.0, 1);
    bad.pixels_per_agent = 0.0;
    let mut sink = MemorySink::new();
    assert!(matches!(
        extract_still(&bad, &image, &mut sink),
        Err(EngineError::InvalidConfig { .. })
    ));
    assert_eq!(sink, MemorySink::new());
}
