// THEORY:
// Records are the engine's only persisted output: plain-text, whitespace-separated
// lines grouped into three streams. The frame stream grows one block per step, the
// meta stream holds the session header and the end-of-session summary, and the
// cell stream holds the accessibility map and the guidance field.
//
// Key architectural principles:
// 1.  **Typed Both Ways**: Every line has a typed record with a `Display` impl that
//     writes it and a parser that reads it back. Floats use Rust's shortest
//     round-trip formatting, so reading a stream back yields the exact values.
// 2.  **Rounded Agent Count**: The frame stream stores `rint(agentCount)` with
//     half-to-even rounding. A `CellRecord` keeps that rounded integer, not the raw
//     estimate; the raw value stays on the step's `CellStatsGrid`.
// 3.  **Strict Parsing**: A line that does not match its grammar is an error that
//     names the 1-based line number. Nothing is skipped silently.
// 4.  **Still Images**: A single still image has no motion. It gets its own
//     density-only block, `Frame 1` followed by `Data x y count` lines, and its
//     session header carries no frame time.

use crate::core_modules::accumulators::{DensityBucket, GuidanceCell};
use crate::core_modules::cell_stats::CellStats;
use crate::error::{EngineError, EngineResult};
use std::fmt;
use std::str::FromStr;

/// Session header written at `initialize`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SessionMetadata {
    pub resolution: usize,
    /// Extent of the ground square, in body lengths.
    pub ground_size: f64,
    /// Seconds per frame. `None` for a still image.
    pub frame_time: Option<f64>,
    /// Frames in the stream, when the frame source knows it up front.
    pub total_frame_count: Option<u64>,
    pub frame_width: u32,
    pub frame_height: u32,
}

impl fmt::Display for SessionMetadata {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Resolution {}", self.resolution)?;
        writeln!(f, "GroundSize {}", self.ground_size)?;
        if let Some(frame_time) = self.frame_time {
            writeln!(f, "FrameTime {frame_time}")?;
        }
        if let Some(total_frame_count) = self.total_frame_count {
            writeln!(f, "TotalFrameCount {total_frame_count}")?;
        }
        writeln!(f, "FrameSize {} {}", self.frame_width, self.frame_height)
    }
}

/// One `Data` line: a cell holding at least half an agent.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CellRecord {
    pub x: usize,
    pub y: usize,
    /// Agent count rounded half-to-even.
    pub agent_count: i64,
    pub velocity_mean: [f64; 2],
    pub velocity_variance: [f64; 2],
    pub angle_mean: f64,
    pub angle_variance: f64,
}

impl CellRecord {
    pub fn from_stats(x: usize, y: usize, stats: &CellStats) -> Self {
        Self {
            x,
            y,
            agent_count: stats.agent_count.round_ties_even() as i64,
            velocity_mean: stats.velocity_mean,
            velocity_variance: stats.velocity_variance,
            angle_mean: stats.angle_mean,
            angle_variance: stats.angle_variance(),
        }
    }
}

impl fmt::Display for CellRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Data {} {} {} {} {} {} {} {} {}",
            self.x,
            self.y,
            self.agent_count,
            self.velocity_mean[0],
            self.velocity_variance[0],
            self.velocity_mean[1],
            self.velocity_variance[1],
            self.angle_mean,
            self.angle_variance
        )
    }
}

/// Everything written for one step: a `Frame` header and its `Data` lines.
#[derive(Debug, Clone, PartialEq)]
pub struct StepRecord {
    /// 0-based index of the step within the session.
    pub step_index: u64,
    pub average_speed: f64,
    /// Polarization magnitude.
    pub polarization: f64,
    /// Pseudo-angular-momentum magnitude.
    pub angular_momentum: f64,
    /// Occupied cells, row by row.
    pub cells: Vec<CellRecord>,
}

impl fmt::Display for StepRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "Frame {} AverageSpeed {} Polarization {} AngularMomentum {}",
            self.step_index, self.average_speed, self.polarization, self.angular_momentum
        )?;
        for cell in &self.cells {
            writeln!(f, "{cell}")?;
        }
        Ok(())
    }
}

/// Frame number the density block of a still image carries.
pub const STILL_FRAME_NUMBER: u64 = 1;

/// One density-only `Data` line of a still image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DensityCellRecord {
    pub x: usize,
    pub y: usize,
    /// Agent count rounded half-to-even.
    pub agent_count: i64,
}

impl DensityCellRecord {
    pub fn from_stats(x: usize, y: usize, stats: &CellStats) -> Self {
        Self {
            x,
            y,
            agent_count: stats.agent_count.round_ties_even() as i64,
        }
    }
}

/// The density block of a still image.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StillRecord {
    /// Occupied cells, row by row.
    pub cells: Vec<DensityCellRecord>,
}

impl fmt::Display for StillRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Frame {STILL_FRAME_NUMBER}")?;
        for cell in &self.cells {
            writeln!(f, "Data {} {} {}", cell.x, cell.y, cell.agent_count)?;
        }
        Ok(())
    }
}

/// One row of the speed-vs-density table.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BucketRecord {
    /// `floor(agentCount)` of the cells in this bucket.
    pub index: usize,
    pub mean_speed: f64,
    pub standard_error: f64,
}

impl From<DensityBucket> for BucketRecord {
    fn from(bucket: DensityBucket) -> Self {
        Self {
            index: bucket.index,
            mean_speed: bucket.mean_speed,
            standard_error: bucket.standard_error,
        }
    }
}

/// End-of-session speed statistics.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSummary {
    pub average_speed_mean: f64,
    /// Population standard deviation of the per-step average speeds.
    pub average_speed_std: f64,
    pub buckets: Vec<BucketRecord>,
}

impl fmt::Display for SessionSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "OverallAverageSpeed {} OverallAverageSpeedSTD {}",
            self.average_speed_mean, self.average_speed_std
        )?;
        writeln!(f, "SpeedVSDensity")?;
        for bucket in &self.buckets {
            writeln!(f, "{} {} {}", bucket.index, bucket.mean_speed, bucket.standard_error)?;
        }
        writeln!(f, "SDEND")
    }
}

/// End-of-session spatial summary.
#[derive(Debug, Clone, PartialEq)]
pub struct CellSummary {
    /// Blocked cells, row by row.
    pub inaccessible: Vec<(usize, usize)>,
    /// Time-averaged flow of every visited cell, row by row.
    pub guidance: Vec<GuidanceCell>,
}

impl fmt::Display for CellSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "NonAccessibleGrid")?;
        for (x, y) in &self.inaccessible {
            writeln!(f, "NAG {x} {y}")?;
        }
        writeln!(f, "NAGEND")?;
        writeln!(f, "GuidanceField")?;
        for cell in &self.guidance {
            writeln!(f, "GF {} {} {} {}", cell.x, cell.y, cell.flow[0], cell.flow[1])?;
        }
        writeln!(f, "GFEND")
    }
}

/// The parsed content of a meta stream.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetaStream {
    pub metadata: Vec<SessionMetadata>,
    pub summaries: Vec<SessionSummary>,
}

/// Tokens of one line, with enough context to report a parse error.
struct Line<'a> {
    number: usize,
    tokens: std::str::SplitWhitespace<'a>,
}

impl<'a> Line<'a> {
    fn new(number: usize, text: &'a str) -> Self {
        Self {
            number,
            tokens: text.split_whitespace(),
        }
    }

    fn error(&self, reason: impl Into<String>) -> EngineError {
        EngineError::MalformedRecord {
            line: self.number,
            reason: reason.into(),
        }
    }

    fn keyword(&mut self, expected: &str) -> EngineResult<()> {
        match self.tokens.next() {
            Some(token) if token == expected => Ok(()),
            Some(token) => Err(self.error(format!("expected `{expected}`, found `{token}`"))),
            None => Err(self.error(format!("expected `{expected}`, found end of line"))),
        }
    }

    fn value<T: FromStr>(&mut self, name: &str) -> EngineResult<T> {
        let token = self
            .tokens
            .next()
            .ok_or_else(|| self.error(format!("missing {name}")))?;
        token
            .parse()
            .map_err(|_| self.error(format!("invalid {name} `{token}`")))
    }

    fn finish(mut self) -> EngineResult<()> {
        match self.tokens.next() {
            None => Ok(()),
            Some(token) => Err(self.error(format!("unexpected trailing token `{token}`"))),
        }
    }
}

/// Non-blank lines with their 1-based line numbers.
fn lines(text: &str) -> impl Iterator<Item = (usize, &str)> {
    text.lines()
        .enumerate()
        .map(|(i, line)| (i + 1, line))
        .filter(|(_, line)| !line.trim().is_empty())
}

fn first_token(line: &str) -> &str {
    line.split_whitespace().next().unwrap_or_default()
}

/// Reads a frame stream back into step records.
pub fn parse_step_stream(text: &str) -> EngineResult<Vec<StepRecord>> {
    let mut steps: Vec<StepRecord> = Vec::new();
    for (number, text) in lines(text) {
        let mut line = Line::new(number, text);
        match first_token(text) {
            "Frame" => {
                line.keyword("Frame")?;
                let step_index = line.value("step index")?;
                line.keyword("AverageSpeed")?;
                let average_speed = line.value("average speed")?;
                line.keyword("Polarization")?;
                let polarization = line.value("polarization")?;
                line.keyword("AngularMomentum")?;
                let angular_momentum = line.value("angular momentum")?;
                line.finish()?;
                steps.push(StepRecord {
                    step_index,
                    average_speed,
                    polarization,
                    angular_momentum,
                    cells: Vec::new(),
                });
            }
            "Data" => {
                line.keyword("Data")?;
                let x = line.value("cell x")?;
                let y = line.value("cell y")?;
                let agent_count = line.value("agent count")?;
                let x_mean = line.value("x velocity mean")?;
                let x_variance = line.value("x velocity variance")?;
                let y_mean = line.value("y velocity mean")?;
                let y_variance = line.value("y velocity variance")?;
                let cell = CellRecord {
                    x,
                    y,
                    agent_count,
                    velocity_mean: [x_mean, y_mean],
                    velocity_variance: [x_variance, y_variance],
                    angle_mean: line.value("angle mean")?,
                    angle_variance: line.value("angle variance")?,
                };
                let Some(step) = steps.last_mut() else {
                    return Err(line.error("`Data` line before any `Frame` header"));
                };
                line.finish()?;
                step.cells.push(cell);
            }
            other => return Err(line.error(format!("unknown record `{other}`"))),
        }
    }
    Ok(steps)
}

/// Reads the frame stream of still-image extractions back into density blocks.
pub fn parse_still_stream(text: &str) -> EngineResult<Vec<StillRecord>> {
    let mut stills: Vec<StillRecord> = Vec::new();
    for (number, text) in lines(text) {
        let mut line = Line::new(number, text);
        match first_token(text) {
            "Frame" => {
                line.keyword("Frame")?;
                let frame: u64 = line.value("frame number")?;
                if frame != STILL_FRAME_NUMBER {
                    return Err(line.error(format!("still image block numbered {frame}")));
                }
                line.finish()?;
                stills.push(StillRecord::default());
            }
            "Data" => {
                line.keyword("Data")?;
                let cell = DensityCellRecord {
                    x: line.value("cell x")?,
                    y: line.value("cell y")?,
                    agent_count: line.value("agent count")?,
                };
                line.finish()?;
                let Some(still) = stills.last_mut() else {
                    return Err(Line::new(number, text).error("`Data` line before any `Frame` header"));
                };
                still.cells.push(cell);
            }
            other => return Err(line.error(format!("unknown record `{other}`"))),
        }
    }
    Ok(stills)
}

/// Reads a meta stream back into session headers and summaries.
pub fn parse_meta_stream(text: &str) -> EngineResult<MetaStream> {
    let mut stream = MetaStream::default();
    let mut open_summary: Option<SessionSummary> = None;
    let mut in_bucket_table = false;

    for (number, text) in lines(text) {
        let mut line = Line::new(number, text);

        if in_bucket_table {
            if first_token(text) == "SDEND" {
                line.keyword("SDEND")?;
                line.finish()?;
                if let Some(summary) = open_summary.take() {
                    stream.summaries.push(summary);
                }
                in_bucket_table = false;
                continue;
            }
            let bucket = BucketRecord {
                index: line.value("bucket index")?,
                mean_speed: line.value("bucket mean speed")?,
                standard_error: line.value("bucket standard error")?,
            };
            line.finish()?;
            if let Some(summary) = open_summary.as_mut() {
                summary.buckets.push(bucket);
            }
            continue;
        }

        match first_token(text) {
            "Resolution" => {
                line.keyword("Resolution")?;
                let resolution = line.value("resolution")?;
                line.finish()?;
                stream.metadata.push(SessionMetadata {
                    resolution,
                    ground_size: 0.0,
                    frame_time: None,
                    total_frame_count: None,
                    frame_width: 0,
                    frame_height: 0,
                });
            }
            "GroundSize" | "FrameTime" | "TotalFrameCount" | "FrameSize" => {
                let Some(metadata) = stream.metadata.last_mut() else {
                    return Err(line.error("session header line before `Resolution`"));
                };
                match first_token(text) {
                    "GroundSize" => {
                        line.keyword("GroundSize")?;
                        metadata.ground_size = line.value("ground size")?;
                    }
                    "FrameTime" => {
                        line.keyword("FrameTime")?;
                        metadata.frame_time = Some(line.value("frame time")?);
                    }
                    "TotalFrameCount" => {
                        line.keyword("TotalFrameCount")?;
                        metadata.total_frame_count = Some(line.value("total frame count")?);
                    }
                    _ => {
                        line.keyword("FrameSize")?;
                        metadata.frame_width = line.value("frame width")?;
                        metadata.frame_height = line.value("frame height")?;
                    }
                }
                line.finish()?;
            }
            "OverallAverageSpeed" => {
                line.keyword("OverallAverageSpeed")?;
                let average_speed_mean = line.value("overall average speed")?;
                line.keyword("OverallAverageSpeedSTD")?;
                let average_speed_std = line.value("overall average speed std")?;
                line.finish()?;
                open_summary = Some(SessionSummary {
                    average_speed_mean,
                    average_speed_std,
                    buckets: Vec::new(),
                });
            }
            "SpeedVSDensity" => {
                line.keyword("SpeedVSDensity")?;
                line.finish()?;
                if open_summary.is_none() {
                    return Err(Line::new(number, text).error("`SpeedVSDensity` without `OverallAverageSpeed`"));
                }
                in_bucket_table = true;
            }
            other => return Err(line.error(format!("unknown record `{other}`"))),
        }
    }

    if open_summary.is_some() {
        return Err(EngineError::MalformedRecord {
            line: text.lines().count(),
            reason: "session summary is missing `SDEND`".to_string(),
        });
    }
    Ok(stream)
}

/// Reads a cell stream back into cell summaries.
pub fn parse_cell_stream(text: &str) -> EngineResult<Vec<CellSummary>> {
    #[derive(Clone, Copy)]
    enum Section {
        None,
        Inaccessible,
        Guidance,
    }

    let mut summaries: Vec<CellSummary> = Vec::new();
    let mut section = Section::None;

    for (number, text) in lines(text) {
        let mut line = Line::new(number, text);
        let token = first_token(text);
        match (section, token) {
            (Section::None, "NonAccessibleGrid") => {
                summaries.push(CellSummary {
                    inaccessible: Vec::new(),
                    guidance: Vec::new(),
                });
                section = Section::Inaccessible;
            }
            (Section::Inaccessible, "NAG") => {
                line.keyword("NAG")?;
                let cell = (line.value("cell x")?, line.value("cell y")?);
                line.finish()?;
                if let Some(summary) = summaries.last_mut() {
                    summary.inaccessible.push(cell);
                }
                continue;
            }
            (Section::Inaccessible, "NAGEND") => section = Section::None,
            (Section::None, "GuidanceField") if !summaries.is_empty() => section = Section::Guidance,
            (Section::Guidance, "GF") => {
                line.keyword("GF")?;
                let cell = GuidanceCell {
                    x: line.value("cell x")?,
                    y: line.value("cell y")?,
                    flow: [line.value("flow x")?, line.value("flow y")?],
                };
                line.finish()?;
                if let Some(summary) = summaries.last_mut() {
                    summary.guidance.push(cell);
                }
                continue;
            }
            (Section::Guidance, "GFEND") => section = Section::None,
            _ => return Err(line.error(format!("unexpected record `{token}`"))),
        }
        line.keyword(token)?;
        line.finish()?;
    }

    if !matches!(section, Section::None) {
        return Err(EngineError::MalformedRecord {
            line: text.lines().count(),
            reason: "cell summary section is not closed".to_string(),
        });
    }
    Ok(summaries)
}
