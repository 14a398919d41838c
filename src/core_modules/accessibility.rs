// THEORY:
// The accessibility grid records where agents cannot go: fences, rocks, water.
// An operator marks obstacles as pixel rectangles on the frame while the session is
// paused; the grid translates them into blocked cells through the session's cached
// coordinate map. Blocking is one-way. Only a new session starts with a clean grid.

use crate::core_modules::coordinate_map::GridCoordinateMap;

/// A rectangle in frame pixel coordinates. May extend past the frame on any side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PixelRect {
    pub x: i64,
    pub y: i64,
    pub width: u32,
    pub height: u32,
}

impl PixelRect {
    pub fn new(x: i64, y: i64, width: u32, height: u32) -> Self {
        Self { x, y, width, height }
    }

    /// The part of the rectangle inside a `frame_width` x `frame_height` frame, as half-open ranges.
    pub fn clip(&self, frame_width: u32, frame_height: u32) -> Option<((u32, u32), (u32, u32))> {
        let clip_axis = |start: i64, length: u32, extent: u32| -> Option<(u32, u32)> {
            let begin = start.max(0);
            let end = (start + length as i64).min(extent as i64);
            (begin < end).then_some((begin as u32, end as u32))
        };
        Some((
            clip_axis(self.x, self.width, frame_width)?,
            clip_axis(self.y, self.height, frame_height)?,
        ))
    }
}

/// Per-cell accessible / blocked flags, row-major.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessibilityGrid {
    resolution: usize,
    accessible: Vec<bool>,
}

impl AccessibilityGrid {
    /// A grid where every cell is accessible.
    pub fn new(resolution: usize) -> Self {
        Self {
            resolution,
            accessible: vec![true; resolution * resolution],
        }
    }

    /// Blocks every in-range cell covered by `rect`. Returns how many cells changed.
    pub fn block(&mut self, rect: PixelRect, map: &GridCoordinateMap) -> usize {
        let Some(((x_begin, x_end), (y_begin, y_end))) = rect.clip(map.frame_width(), map.frame_height()) else {
            return 0;
        };

        let columns: Vec<usize> = map.columns_in(x_begin, x_end).collect();
        let mut newly_blocked = 0;
        for cell_y in map.rows_in(y_begin, y_end) {
            for &cell_x in &columns {
                let slot = &mut self.accessible[cell_y * self.resolution + cell_x];
                if *slot {
                    *slot = false;
                    newly_blocked += 1;
                }
            }
        }
        newly_blocked
    }

    pub fn is_accessible(&self, x: usize, y: usize) -> bool {
        x < self.resolution && y < self.resolution && self.accessible[y * self.resolution + x]
    }

    /// Blocked cells as `(x, y)`, row by row.
    pub fn inaccessible_cells(&self) -> Vec<(usize, usize)> {
        self.accessible
            .iter()
            .enumerate()
            .filter(|(_, accessible)| !**accessible)
            .map(|(i, _)| (i % self.resolution, i / self.resolution))
            .collect()
    }

    pub fn resolution(&self) -> usize {
        self.resolution
    }
}
