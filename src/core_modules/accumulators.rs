// THEORY:
// `SessionAccumulators` is the session's long-term memory. Where a `CellStatsGrid`
// lives for exactly one step, the accumulators see every step and only produce
// their results when the session is finalized.
//
// They gather three things:
// 1.  **Speed History**: the average speed of every step, summarized as mean and
//     population standard deviation.
// 2.  **Speed vs. Density**: for each occupied cell of each step, its mean speed is
//     filed under the integer part of its agent count. The bucket list grows on
//     demand; a bucket is summarized as mean and standard error of the mean.
// 3.  **Guidance Field**: the cumulative mean flow per cell and how often the cell
//     was visited, averaged into a time-mean flow field at the end.

use crate::core_modules::cell_stats::CellStatsGrid;
use crate::core_modules::order_params::OrderParameters;

/// Summary of one speed-vs-density bucket.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DensityBucket {
    /// `floor(agentCount)` of the cells filed here.
    pub index: usize,
    pub mean_speed: f64,
    /// Population standard deviation over √n; zero below two samples.
    pub standard_error: f64,
    pub samples: usize,
}

/// Time-averaged flow of one visited cell.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GuidanceCell {
    pub x: usize,
    pub y: usize,
    pub flow: [f64; 2],
}

/// Cross-step accumulators of one session.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionAccumulators {
    resolution: usize,
    /// One entry per completed step.
    average_speeds: Vec<f64>,
    /// Speed samples indexed by integer agent count.
    speed_density_buckets: Vec<Vec<f64>>,
    /// Σ over steps of (cell mean velocity × pixel count).
    cumulative_flow: Vec<[f64; 2]>,
    /// Σ over steps of pixel count.
    visit_counts: Vec<u64>,
}

impl SessionAccumulators {
    pub fn new(resolution: usize) -> Self {
        let cell_count = resolution * resolution;
        Self {
            resolution,
            average_speeds: Vec::new(),
            speed_density_buckets: Vec::new(),
            cumulative_flow: vec![[0.0, 0.0]; cell_count],
            visit_counts: vec![0; cell_count],
        }
    }

    /// Folds one completed step into the accumulators.
    pub fn record_step(&mut self, cells: &CellStatsGrid, order: &OrderParameters) {
        self.average_speeds.push(order.average_speed);

        // The cell mean is added once per agent pixel in the cell, so the time
        // average is weighted by pixel count rather than by steps.
        for ((cell, flow), visits) in cells
            .cells()
            .iter()
            .zip(self.cumulative_flow.iter_mut())
            .zip(self.visit_counts.iter_mut())
        {
            if cell.pixel_count == 0 {
                continue;
            }
            let pixels = cell.pixel_count as f64;
            flow[0] += cell.velocity_mean[0] * pixels;
            flow[1] += cell.velocity_mean[1] * pixels;
            *visits += cell.pixel_count as u64;
        }

        for (_, cell) in cells.occupied() {
            let bucket = cell.agent_count.floor() as usize;
            if self.speed_density_buckets.len() <= bucket {
                self.speed_density_buckets.resize_with(bucket + 1, Vec::new);
            }
            self.speed_density_buckets[bucket].push(cell.speed());
        }
    }

    pub fn step_count(&self) -> usize {
        self.average_speeds.len()
    }

    pub fn average_speeds(&self) -> &[f64] {
        &self.average_speeds
    }

    /// Mean and population standard deviation of the per-step average speeds.
    pub fn average_speed_summary(&self) -> (f64, f64) {
        mean_and_std(&self.average_speeds)
    }

    /// One summary per bucket, including empty buckets below the largest one.
    pub fn density_buckets(&self) -> Vec<DensityBucket> {
        self.speed_density_buckets
            .iter()
            .enumerate()
            .map(|(index, samples)| {
                let (mean_speed, std) = mean_and_std(samples);
                let standard_error = if samples.len() < 2 {
                    0.0
                } else {
                    std / (samples.len() as f64).sqrt()
                };
                DensityBucket {
                    index,
                    mean_speed,
                    standard_error,
                    samples: samples.len(),
                }
            })
            .collect()
    }

    /// Time-averaged flow of every visited cell, row by row.
    pub fn guidance_field(&self) -> Vec<GuidanceCell> {
        self.cumulative_flow
            .iter()
            .zip(&self.visit_counts)
            .enumerate()
            .filter(|(_, (_, visits))| **visits > 0)
            .map(|(i, (flow, visits))| GuidanceCell {
                x: i % self.resolution,
                y: i / self.resolution,
                flow: [flow[0] / *visits as f64, flow[1] / *visits as f64],
            })
            .collect()
    }

    pub fn visit_count(&self, x: usize, y: usize) -> u64 {
        if x < self.resolution && y < self.resolution {
            self.visit_counts[y * self.resolution + x]
        } else {
            0
        }
    }
}

/// Mean and population standard deviation; zeros for an empty slice.
pub fn mean_and_std(values: &[f64]) -> (f64, f64) {
    if values.is_empty() {
        return (0.0, 0.0);
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
    (mean, variance.sqrt())
}
