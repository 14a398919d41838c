// THEORY:
// The `GridCoordinateMap` is the spatial backbone of a session. It answers one
// question for every pixel of the reference frame: which grid cell does this pixel
// belong to? The answer is computed once, when the session starts, and reused by
// every step and every obstacle edit.
//
// Key architectural principles:
// 1.  **Ground Coordinates**: The grid lives in a frame-centered coordinate system
//     measured in body lengths. The longer side of the frame spans the whole grid,
//     the shorter side is centered inside it. This makes the grid independent of
//     the camera's absolute pixel resolution.
// 2.  **Separable Lookup**: The mapping is affine and independent per axis, so the
//     cached "index arrays" are one array of cell columns (one entry per pixel
//     column) and one array of cell rows (one entry per pixel row). A per-pixel
//     lookup is two array reads.
// 3.  **Exact Edges**: The index is evaluated in pixel space. Dividing by the body
//     length and multiplying back cancels algebraically, and skipping it keeps the
//     first pixel of the long side at exactly zero instead of a rounding error below.
// 4.  **Coverage Guard**: A session refuses to start when any frame corner falls
//     outside the grid. The mapping is monotonic, so the corners bound every pixel.

use crate::error::{EngineError, EngineResult};

/// The cached pixel → grid-cell mapping for one session.
#[derive(Debug, Clone, PartialEq)]
pub struct GridCoordinateMap {
    /// Width of the reference frame in pixels.
    frame_width: u32,
    /// Height of the reference frame in pixels.
    frame_height: u32,
    /// Cells per side of the square grid.
    resolution: usize,
    /// Side length of the whole grid in ground units (body lengths).
    ground_size: f64,
    /// Side length of a single cell in ground units.
    cell_width: f64,
    /// Cell column for every pixel column. May be out of range for exotic inputs.
    column_cells: Vec<i64>,
    /// Cell row for every pixel row.
    row_cells: Vec<i64>,
}

impl GridCoordinateMap {
    /// Builds and validates the mapping for a frame of the given size.
    pub fn build(frame_width: u32, frame_height: u32, body_length: f64, resolution: i32) -> EngineResult<Self> {
        if resolution <= 0 {
            return Err(EngineError::invalid_config(format!(
                "resolution must be positive, got {resolution}"
            )));
        }
        if !(body_length.is_finite() && body_length > 0.0) {
            return Err(EngineError::invalid_config(format!(
                "body length must be positive, got {body_length}"
            )));
        }
        if frame_width == 0 || frame_height == 0 {
            return Err(EngineError::invalid_config(format!(
                "reference frame must not be empty, got {frame_width}x{frame_height}"
            )));
        }

        let resolution = resolution as usize;
        let longer_side = frame_width.max(frame_height);
        let ground_size = longer_side as f64 / body_length;
        let cell_width = ground_size / resolution as f64;

        let map = Self {
            frame_width,
            frame_height,
            resolution,
            ground_size,
            cell_width,
            column_cells: Self::axis_cells(frame_width, longer_side, resolution),
            row_cells: Self::axis_cells(frame_height, longer_side, resolution),
        };
        map.verify_coverage()?;
        Ok(map)
    }

    /// `floor(((p - extent/2) / bodyLength + groundSize/2) / cellWidth)` for every `p` on one axis.
    fn axis_cells(extent: u32, longer_side: u32, resolution: usize) -> Vec<i64> {
        let half_extent = extent as f64 / 2.0;
        let half_ground = longer_side as f64 / 2.0;
        (0..extent)
            .map(|p| {
                let offset = p as f64 - half_extent + half_ground;
                (offset * resolution as f64 / longer_side as f64).floor() as i64
            })
            .collect()
    }

    /// Checks that all four frame corners land inside the grid.
    pub fn verify_coverage(&self) -> EngineResult<()> {
        let last_x = self.frame_width - 1;
        let last_y = self.frame_height - 1;
        for (corner_x, corner_y) in [(0, 0), (last_x, 0), (0, last_y), (last_x, last_y)] {
            let (cell_x, cell_y) = self.raw_cell(corner_x, corner_y);
            if !self.in_range(cell_x) || !self.in_range(cell_y) {
                return Err(EngineError::GridCoverage {
                    resolution: self.resolution,
                    frame_width: self.frame_width,
                    frame_height: self.frame_height,
                    corner_x,
                    corner_y,
                    cell_x,
                    cell_y,
                });
            }
        }
        Ok(())
    }

    #[inline]
    fn in_range(&self, index: i64) -> bool {
        index >= 0 && (index as usize) < self.resolution
    }

    /// The unchecked cell coordinates of a pixel inside the frame.
    #[inline]
    pub fn raw_cell(&self, px: u32, py: u32) -> (i64, i64) {
        (self.column_cells[px as usize], self.row_cells[py as usize])
    }

    /// The cell of a pixel, or `None` when the pixel is outside the frame or its cell is outside the grid.
    #[inline]
    pub fn cell_of(&self, px: u32, py: u32) -> Option<(usize, usize)> {
        if px >= self.frame_width || py >= self.frame_height {
            return None;
        }
        let (cell_x, cell_y) = self.raw_cell(px, py);
        if self.in_range(cell_x) && self.in_range(cell_y) {
            Some((cell_x as usize, cell_y as usize))
        } else {
            None
        }
    }

    /// Flat row-major index of a pixel's cell.
    #[inline]
    pub fn cell_index_of(&self, px: u32, py: u32) -> Option<usize> {
        self.cell_of(px, py).map(|(x, y)| y * self.resolution + x)
    }

    /// Cell columns touched by pixel columns `[start, end)`, in range only.
    pub(crate) fn columns_in(&self, start: u32, end: u32) -> impl Iterator<Item = usize> + '_ {
        Self::distinct_in_range(&self.column_cells[start as usize..end as usize], self.resolution)
    }

    /// Cell rows touched by pixel rows `[start, end)`, in range only.
    pub(crate) fn rows_in(&self, start: u32, end: u32) -> impl Iterator<Item = usize> + '_ {
        Self::distinct_in_range(&self.row_cells[start as usize..end as usize], self.resolution)
    }

    // The axis arrays are monotonic, so deduplicating neighbours is enough.
    fn distinct_in_range(cells: &[i64], resolution: usize) -> impl Iterator<Item = usize> + '_ {
        cells
            .iter()
            .enumerate()
            .filter(move |(i, cell)| *i == 0 || cells[i - 1] != **cell)
            .filter(move |(_, cell)| **cell >= 0 && (**cell as usize) < resolution)
            .map(|(_, cell)| *cell as usize)
    }

    pub fn frame_width(&self) -> u32 {
        self.frame_width
    }

    pub fn frame_height(&self) -> u32 {
        self.frame_height
    }

    pub fn resolution(&self) -> usize {
        self.resolution
    }

    pub fn cell_count(&self) -> usize {
        self.resolution * self.resolution
    }

    pub fn ground_size(&self) -> f64 {
        self.ground_size
    }

    pub fn cell_width(&self) -> f64 {
        self.cell_width
    }
}

/// The largest resolution whose cells are still at least one body length wide.
pub fn resolution_limit(frame_width: u32, frame_height: u32, body_length: f64) -> usize {
    if !(body_length.is_finite() && body_length > 0.0) {
        return 0;
    }
    (frame_width.max(frame_height) as f64 / body_length).floor() as usize
}
