// This file is an example of how to use the `herd_vision` library.
// It renders a small synthetic herd walking across a meadow, runs it through an
// engine loop, marks an obstacle part-way through, and writes the three record
// streams to the output directory.
//
//     cargo run -- [config.toml] [output-dir]

use herd_vision::{
    EngineHandle, FileSink, MotionEstimator, MotionField, PixelRect, Session, SessionConfig, VecFrameSource,
    spawn_engine,
};
use herd_vision::core_modules::frame_source::FrameTriple;
use image::{Rgb, RgbImage};
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::EnvFilter;

const FRAME_WIDTH: u32 = 160;
const FRAME_HEIGHT: u32 = 120;
const FRAME_COUNT: u32 = 48;
const HERD_SPEED: u32 = 2;
const FENCE_STEP: u64 = 10;
const MEADOW: Rgb<u8> = Rgb([40, 70, 35]);
const COAT: Rgb<u8> = Rgb([230, 225, 215]);

/// Stand-in for a dense optical-flow estimator: the whole scene drifts at the herd's speed.
struct DriftEstimator {
    drift: [f32; 2],
}

impl MotionEstimator for DriftEstimator {
    fn estimate(&mut self, previous: &RgbImage, current: &RgbImage) -> MotionField {
        if previous == current {
            return MotionField::zeros(current.width(), current.height());
        }
        MotionField::uniform(current.width(), current.height(), self.drift)
    }
}

fn default_config() -> SessionConfig {
    SessionConfig {
        body_color: [230, 225, 215],
        color_threshold: 30.0,
        pixels_per_agent: 9.0,
        body_length: 6.0,
        smooth_window_size: 5,
        resolution: 8,
        frame_time: 1.0 / 24.0,
        constant_total_pixel_count: false,
    }
}

/// Twelve 3x3 animals in a loose block, shifted `HERD_SPEED` pixels right per frame.
fn render_frame(index: u32) -> RgbImage {
    let mut frame = RgbImage::from_pixel(FRAME_WIDTH, FRAME_HEIGHT, MEADOW);
    for animal in 0..12 {
        let x0 = 10 + (animal % 4) * 9 + (animal / 4) * 2 + index * HERD_SPEED;
        let y0 = 45 + (animal / 4) * 10;
        for dy in 0..3 {
            for dx in 0..3 {
                let (x, y) = (x0 + dx, y0 + dy);
                if x < FRAME_WIDTH && y < FRAME_HEIGHT {
                    frame.put_pixel(x, y, COAT);
                }
            }
        }
    }
    frame
}

/// Steps the engine to the end of the stream. Once a record reaches `fence_step` the operator
/// pauses, marks `fence` as an obstacle and lets the herd continue. Streams too short to get
/// there simply run to completion. Returns the number of steps driven.
async fn drive_with_fence(
    handle: &EngineHandle,
    fence_step: u64,
    fence: PixelRect,
) -> Result<u64, Box<dyn std::error::Error>> {
    let (play_tx, play_rx) = watch::channel(true);
    let mut driver = tokio::spawn({
        let handle = handle.clone();
        async move { handle.drive(play_rx).await }
    });

    let mut records = handle.subscribe();
    let mut fenced = false;
    let steps = loop {
        tokio::select! {
            finished = &mut driver => break finished??,
            changed = records.changed(), if !fenced => {
                if changed.is_err() {
                    break (&mut driver).await??;
                }
                let reached = records.borrow_and_update().as_ref().is_some_and(|r| r.step_index >= fence_step);
                if reached {
                    play_tx.send_replace(false);
                    let blocked = handle.add_obstacle(fence).await?;
                    info!(blocked, "fence added");
                    play_tx.send_replace(true);
                    fenced = true;
                }
            }
        }
    };
    Ok(steps)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let mut args = std::env::args().skip(1);
    let config = match args.next() {
        Some(path) => SessionConfig::from_file(path)?,
        None => default_config(),
    };
    let output_dir = args.next().unwrap_or_else(|| "extraction_output".to_string());
    std::fs::create_dir_all(&output_dir)?;

    info!("Herd Vision Engine - Example Runner");

    let source = VecFrameSource::new((0..FRAME_COUNT).map(|i| FrameTriple::uniform(render_frame(i))));
    let estimator = DriftEstimator {
        drift: [HERD_SPEED as f32, 0.0],
    };
    let sink = FileSink::create(&output_dir, "herd")?;
    let mut session = Session::new(source, estimator, sink);
    session.initialize(config, &render_frame(0))?;

    let (handle, worker) = spawn_engine(session);
    let steps = drive_with_fence(&handle, FENCE_STEP, PixelRect::new(140, 0, 20, FRAME_HEIGHT)).await?;

    handle.shutdown().await?;
    let session = worker.await?;

    if let Some(record) = session.last_record() {
        info!(
            steps,
            state = ?session.state(),
            last_average_speed = record.average_speed,
            last_polarization = record.polarization,
            "extraction complete"
        );
    }
    info!(frame = %session.sink().paths().frame.display(), "records written");
    Ok(())
}
