// THEORY:
// `CellStatsGrid` is the heart of every step. It takes the agent mask, the
// smoothed motion field and the coordinate map, and condenses millions of pixels
// into one small record per grid cell: how many agent pixels landed there, how
// fast and how coherently they moved.
//
// Key architectural principles:
// 1.  **Step-Scoped**: A grid is built from scratch for one step and then frozen.
//     Nothing in here survives into the next step; cross-step memory lives in
//     `SessionAccumulators`. The reset boundary is simply "a new grid".
// 2.  **Two Passes**: The first pass accumulates raw sums (count, Σv, Σv²) and
//     turns them into velocity moments. The second pass needs those means: it
//     measures how far each pixel's motion direction deviates from its cell's mean
//     and folds the angle into a Welford running mean / M2.
// 3.  **Two Variance Forms**: Velocity variance uses the direct sum-of-squares form
//     and is then divided by the pixels-per-agent constant, an empirical correction
//     from pixel-level to agent-level spread. Angle variance is Welford's M2 / n
//     and is not rescaled. The two forms stay separate.
// 4.  **Guarded Arithmetic**: An empty cell reads as all zeros. No division by a
//     zero count ever reaches the output, so NaN never does either.

use crate::core_modules::agent_mask::AgentMask;
use crate::core_modules::coordinate_map::GridCoordinateMap;
use crate::core_modules::motion_field::MotionField;

/// Vectors shorter than this have no meaningful direction.
pub const DEGENERATE_MOTION_EPSILON: f64 = 1e-3;

/// Cells with at least this many estimated agents are reported and bucketed.
pub const OCCUPIED_AGENT_COUNT: f64 = 0.5;

/// The statistics of one grid cell for one step.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct CellStats {
    /// Agent pixels that mapped into this cell.
    pub pixel_count: u32,
    /// Σv over those pixels, in ground units per second.
    pub velocity_sum: [f64; 2],
    /// Σv² over those pixels.
    pub velocity_square_sum: [f64; 2],
    /// Mean velocity, ground units per second.
    pub velocity_mean: [f64; 2],
    /// Per-axis velocity variance, rescaled to agent level.
    pub velocity_variance: [f64; 2],
    /// Running mean of the deviation angle, in degrees.
    pub angle_mean: f64,
    /// Welford's running sum of squared angle deviations.
    pub angle_m2: f64,
    /// Number of angle samples folded into `angle_mean`.
    pub angle_visits: u32,
    /// `pixel_count` after the optional total-pixel-count drift correction.
    pub corrected_pixel_count: f64,
    /// Estimated number of agents in the cell.
    pub agent_count: f64,
}

impl CellStats {
    fn add_velocity(&mut self, velocity: [f64; 2]) {
        self.pixel_count += 1;
        for axis in 0..2 {
            self.velocity_sum[axis] += velocity[axis];
            self.velocity_square_sum[axis] += velocity[axis] * velocity[axis];
        }
    }

    fn finish_velocity(&mut self, pixels_per_agent: f64) {
        if self.pixel_count == 0 {
            return;
        }
        let n = self.pixel_count as f64;
        for axis in 0..2 {
            let mean = self.velocity_sum[axis] / n;
            self.velocity_mean[axis] = mean;
            self.velocity_variance[axis] = (self.velocity_square_sum[axis] / n - mean * mean) / pixels_per_agent;
        }
    }

    /// Welford's online update.
    fn push_angle(&mut self, angle: f64) {
        self.angle_visits += 1;
        let delta = angle - self.angle_mean;
        self.angle_mean += delta / self.angle_visits as f64;
        self.angle_m2 += delta * (angle - self.angle_mean);
    }

    pub fn angle_variance(&self) -> f64 {
        if self.angle_visits == 0 {
            0.0
        } else {
            self.angle_m2 / self.angle_visits as f64
        }
    }

    /// Magnitude of the mean velocity.
    pub fn speed(&self) -> f64 {
        self.velocity_mean[0].hypot(self.velocity_mean[1])
    }

    pub fn is_occupied(&self) -> bool {
        self.agent_count >= OCCUPIED_AGENT_COUNT
    }
}

/// Rescales per-step pixel counts so the frame total matches a baseline.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PixelCountCorrection {
    /// Masked pixels in the session's reference frame.
    pub baseline_total: u64,
    /// Masked pixels in the current step.
    pub current_total: u64,
}

impl PixelCountCorrection {
    /// `baseline / current`, or zero when the current step has no masked pixels.
    pub fn factor(&self) -> f64 {
        if self.current_total == 0 {
            0.0
        } else {
            self.baseline_total as f64 / self.current_total as f64
        }
    }
}

/// Scales and calibration for one aggregation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AggregationParams {
    pub body_length: f64,
    pub frame_time: f64,
    pub pixels_per_agent: f64,
    pub correction: Option<PixelCountCorrection>,
}

/// The per-cell statistics of one step, row-major.
#[derive(Debug, Clone, PartialEq)]
pub struct CellStatsGrid {
    resolution: usize,
    cells: Vec<CellStats>,
}

impl CellStatsGrid {
    /// An all-zero grid.
    pub fn new(resolution: usize) -> Self {
        Self {
            resolution,
            cells: vec![CellStats::default(); resolution * resolution],
        }
    }

    /// Aggregates one step. Pixels outside the motion field or the grid are skipped.
    pub fn aggregate(
        mask: &AgentMask,
        field: &MotionField,
        map: &GridCoordinateMap,
        params: &AggregationParams,
    ) -> Self {
        let mut grid = Self::new(map.resolution());
        let to_ground = 1.0 / params.body_length / params.frame_time;

        let samples = move || {
            mask.iter_agents().filter_map(move |(x, y)| {
                if x >= field.width() || y >= field.height() {
                    return None;
                }
                let index = map.cell_index_of(x, y)?;
                let flow = field.get(x, y);
                Some((index, [flow[0] as f64, flow[1] as f64]))
            })
        };

        for (index, flow) in samples() {
            grid.cells[index].add_velocity([flow[0] * to_ground, flow[1] * to_ground]);
        }
        for cell in grid.cells.iter_mut() {
            cell.finish_velocity(params.pixels_per_agent);
        }

        for (index, flow) in samples() {
            let cell = &mut grid.cells[index];
            let angle = deviation_angle(flow, cell.velocity_mean);
            cell.push_angle(angle);
        }

        let factor = params.correction.map_or(1.0, |correction| correction.factor());
        for cell in grid.cells.iter_mut() {
            cell.corrected_pixel_count = cell.pixel_count as f64 * factor;
            cell.agent_count = cell.corrected_pixel_count / params.pixels_per_agent;
        }

        grid
    }

    /// Counts agent pixels per cell with no motion involved. Only `pixel_count`,
    /// `corrected_pixel_count` and `agent_count` are filled in.
    pub fn count_agents(mask: &AgentMask, map: &GridCoordinateMap, pixels_per_agent: f64) -> Self {
        let mut grid = Self::new(map.resolution());
        for index in mask.iter_agents().filter_map(|(x, y)| map.cell_index_of(x, y)) {
            grid.cells[index].pixel_count += 1;
        }
        for cell in grid.cells.iter_mut() {
            cell.corrected_pixel_count = cell.pixel_count as f64;
            cell.agent_count = cell.corrected_pixel_count / pixels_per_agent;
        }
        grid
    }

    pub fn resolution(&self) -> usize {
        self.resolution
    }

    pub fn get(&self, x: usize, y: usize) -> Option<&CellStats> {
        if x < self.resolution && y < self.resolution {
            self.cells.get(y * self.resolution + x)
        } else {
            None
        }
    }

    pub fn cells(&self) -> &[CellStats] {
        &self.cells
    }

    /// Every cell with its `(x, y)` coordinates, row by row.
    pub fn iter(&self) -> impl Iterator<Item = ((usize, usize), &CellStats)> {
        let resolution = self.resolution.max(1);
        self.cells
            .iter()
            .enumerate()
            .map(move |(i, cell)| ((i % resolution, i / resolution), cell))
    }

    /// Cells holding at least half an agent, row by row.
    pub fn occupied(&self) -> impl Iterator<Item = ((usize, usize), &CellStats)> {
        self.iter().filter(|(_, cell)| cell.is_occupied())
    }

    /// Σ raw pixel counts over the grid.
    pub fn total_pixel_count(&self) -> u64 {
        self.cells.iter().map(|cell| cell.pixel_count as u64).sum()
    }
}

/// Angle in degrees between a pixel's motion and its cell's mean velocity.
/// Zero when either vector is too short to have a direction.
pub fn deviation_angle(motion: [f64; 2], mean: [f64; 2]) -> f64 {
    let motion_magnitude = motion[0].hypot(motion[1]);
    let mean_magnitude = mean[0].hypot(mean[1]);
    if motion_magnitude <= DEGENERATE_MOTION_EPSILON || mean_magnitude <= DEGENERATE_MOTION_EPSILON {
        return 0.0;
    }
    let cosine = (motion[0] * mean[0] + motion[1] * mean[1]) / (motion_magnitude * mean_magnitude);
    cosine.clamp(-1.0, 1.0).acos().to_degrees()
}

#[cfg(test)]
mod tests {
    use super::*;

    const EPS: f64 = 1e-9;

    fn params(body_length: f64, frame_time: f64, pixels_per_agent: f64) -> AggregationParams {
        AggregationParams {
            body_length,
            frame_time,
            pixels_per_agent,
            correction: None,
        }
    }

    /// A 4x4 frame on a 2x2 grid: each cell covers a 2x2 pixel block.
    fn small_map() -> GridCoordinateMap {
        GridCoordinateMap::build(4, 4, 1.0, 2).unwrap()
    }

    fn mask_with(points: &[(u32, u32)]) -> AgentMask {
        let mut pixels = vec![false; 16];
        for (x, y) in points {
            pixels[(y * 4 + x) as usize] = true;
        }
        AgentMask::from_pixels(4, 4, pixels)
    }

    #[test]
    fn single_pixel_converts_to_ground_units() {
        let map = GridCoordinateMap::build(4, 4, 10.0, 2).unwrap();
        let mask = mask_with(&[(0, 0)]);
        let field = MotionField::uniform(4, 4, [5.0, 0.0]);

        let grid = CellStatsGrid::aggregate(&mask, &field, &map, &params(10.0, 0.1, 1.0));
        let cell = grid.get(0, 0).unwrap();
        assert_eq!(cell.pixel_count, 1);
        assert!((cell.velocity_mean[0] - 5.0).abs() < EPS);
        assert!(cell.velocity_mean[1].abs() < EPS);
        assert!(cell.velocity_variance[0].abs() < EPS);
        assert!(cell.velocity_variance[1].abs() < EPS);
        assert_eq!(cell.angle_mean, 0.0);
    }

    #[test]
    fn two_pixels_give_direct_variance() {
        let map = small_map();
        let mask = mask_with(&[(0, 0), (1, 0)]);
        let mut field = MotionField::zeros(4, 4);
        field.set(0, 0, [5.0, 0.0]);
        field.set(1, 0, [3.0, 0.0]);

        let grid = CellStatsGrid::aggregate(&mask, &field, &map, &params(1.0, 1.0, 1.0));
        let cell = grid.get(0, 0).unwrap();
        assert!((cell.velocity_mean[0] - 4.0).abs() < EPS);
        assert!((cell.velocity_variance[0] - 1.0).abs() < EPS);
    }

    #[test]
    fn velocity_variance_is_scaled_by_pixels_per_agent() {
        let map = small_map();
        let mask = mask_with(&[(0, 0), (1, 0)]);
        let mut field = MotionField::zeros(4, 4);
        field.set(0, 0, [5.0, 0.0]);
        field.set(1, 0, [3.0, 0.0]);

        let grid = CellStatsGrid::aggregate(&mask, &field, &map, &params(1.0, 1.0, 4.0));
        let cell = grid.get(0, 0).unwrap();
        assert!((cell.velocity_variance[0] - 0.25).abs() < EPS);
        assert!((cell.agent_count - 0.5).abs() < EPS);
    }

    #[test]
    fn angle_statistics_follow_welford() {
        let map = small_map();
        // Mean of (1,0) and (0,1) is (0.5,0.5): each pixel deviates by 45 degrees.
        let mask = mask_with(&[(2, 2), (3, 3)]);
        let mut field = MotionField::zeros(4, 4);
        field.set(2, 2, [1.0, 0.0]);
        field.set(3, 3, [0.0, 1.0]);

        let grid = CellStatsGrid::aggregate(&mask, &field, &map, &params(1.0, 1.0, 1.0));
        let cell = grid.get(1, 1).unwrap();
        assert_eq!(cell.angle_visits, 2);
        assert!((cell.angle_mean - 45.0).abs() < 1e-6);
        assert!(cell.angle_variance().abs() < 1e-6);
    }

    #[test]
    fn opposite_motion_has_no_direction_and_zero_angle() {
        let map = small_map();
        let mask = mask_with(&[(0, 0), (1, 1)]);
        let mut field = MotionField::zeros(4, 4);
        field.set(0, 0, [2.0, 0.0]);
        field.set(1, 1, [-2.0, 0.0]);

        let grid = CellStatsGrid::aggregate(&mask, &field, &map, &params(1.0, 1.0, 1.0));
        let cell = grid.get(0, 0).unwrap();
        assert_eq!(cell.velocity_mean, [0.0, 0.0]);
        assert_eq!(cell.angle_mean, 0.0);
        assert!((cell.velocity_variance[0] - 4.0).abs() < EPS);
    }

    #[test]
    fn pixel_count_correction_rescales_agent_count() {
        let map = GridCoordinateMap::build(10, 10, 1.0, 1).unwrap();
        let mask = mask_with_count(10, 10, 10);
        let field = MotionField::zeros(10, 10);
        let mut p = params(1.0, 1.0, 1.0);
        p.correction = Some(PixelCountCorrection {
            baseline_total: 100,
            current_total: 80,
        });

        let grid = CellStatsGrid::aggregate(&mask, &field, &map, &p);
        let cell = grid.get(0, 0).unwrap();
        assert_eq!(cell.pixel_count, 10);
        assert!((cell.corrected_pixel_count - 12.5).abs() < EPS);
        assert!((cell.agent_count - 12.5).abs() < EPS);
    }

    fn mask_with_count(width: u32, height: u32, count: usize) -> AgentMask {
        let mut pixels = vec![false; (width * height) as usize];
        pixels.iter_mut().take(count).for_each(|p| *p = true);
        AgentMask::from_pixels(width, height, pixels)
    }

    #[test]
    fn counting_agrees_with_full_aggregation() {
        let map = small_map();
        let mask = mask_with(&[(0, 0), (1, 0), (1, 1), (3, 2)]);
        let field = MotionField::uniform(4, 4, [1.0, 2.0]);

        let counted = CellStatsGrid::count_agents(&mask, &map, 2.0);
        let aggregated = CellStatsGrid::aggregate(&mask, &field, &map, &params(1.0, 1.0, 2.0));
        for ((at, a), (_, b)) in counted.iter().zip(aggregated.iter()) {
            assert_eq!(a.pixel_count, b.pixel_count, "cell {at:?}");
            assert!((a.agent_count - b.agent_count).abs() < EPS, "cell {at:?}");
        }
        assert_eq!(counted.get(0, 0).unwrap().agent_count, 1.5);
        assert_eq!(counted.get(1, 1).unwrap().agent_count, 0.5);
        assert_eq!(counted.get(0, 0).unwrap().velocity_mean, [0.0, 0.0]);
    }

    #[test]
    fn zero_current_total_reads_zero() {
        let correction = PixelCountCorrection {
            baseline_total: 50,
            current_total: 0,
        };
        assert_eq!(correction.factor(), 0.0);
    }

    #[test]
    fn pixel_counts_are_conserved() {
        let map = GridCoordinateMap::build(16, 12, 2.0, 4).unwrap();
        let mut pixels = vec![false; 16 * 12];
        for (i, p) in pixels.iter_mut().enumerate() {
            *p = i % 3 == 0;
        }
        let mask = AgentMask::from_pixels(16, 12, pixels);
        let field = MotionField::uniform(16, 12, [1.0, -1.0]);

        let grid = CellStatsGrid::aggregate(&mask, &field, &map, &params(2.0, 0.5, 3.0));
        assert_eq!(grid.total_pixel_count(), mask.count());
        for cell in grid.cells().iter().filter(|c| c.pixel_count > 0) {
            assert!(cell.velocity_variance[0] >= -1e-9);
            assert!(cell.velocity_variance[1] >= -1e-9);
        }
    }

    #[test]
    fn empty_cells_read_zero() {
        let map = small_map();
        let grid = CellStatsGrid::aggregate(&mask_with(&[]), &MotionField::zeros(4, 4), &map, &params(1.0, 1.0, 1.0));
        for cell in grid.cells() {
            assert_eq!(*cell, CellStats::default());
            assert_eq!(cell.angle_variance(), 0.0);
        }
        assert_eq!(grid.occupied().count(), 0);
    }

    #[test]
    fn deviation_angle_handles_degenerate_vectors() {
        assert_eq!(deviation_angle([0.0, 0.0], [1.0, 0.0]), 0.0);
        assert_eq!(deviation_angle([1.0, 0.0], [0.0, 0.0005]), 0.0);
        assert!((deviation_angle([1.0, 0.0], [-3.0, 0.0]) - 180.0).abs() < 1e-9);
        assert!((deviation_angle([0.0, 2.0], [5.0, 0.0]) - 90.0).abs() < 1e-9);
    }
}
