// THEORY:
// The agent mask is the engine's only notion of "where the animals are". It is a
// binary image with the reference frame's dimensions: a pixel is an agent pixel
// when its color is close enough to the calibrated body color.
//
// Classification is strictly single-pixel: no neighbours, no history. That makes
// it a pure function of (frame, color, threshold) and trivially parallel. Large
// frames are classified row by row on the rayon pool; each row writes a disjoint
// slice of the mask, so the result is identical to a serial scan.

use image::RgbImage;
use rayon::prelude::*;

/// Frames smaller than this are classified on the calling thread.
const PARALLEL_MIN_PIXELS: usize = 1 << 16;

/// A binary agent / not-agent classification of one frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentMask {
    width: u32,
    height: u32,
    /// Row-major, one entry per pixel.
    pixels: Vec<bool>,
}

impl AgentMask {
    /// Builds a mask from a row-major pixel vector. Missing entries read as "not agent".
    pub fn from_pixels(width: u32, height: u32, mut pixels: Vec<bool>) -> Self {
        pixels.resize(width as usize * height as usize, false);
        Self { width, height, pixels }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    #[inline]
    pub fn is_agent(&self, x: u32, y: u32) -> bool {
        x < self.width && y < self.height && self.pixels[(y * self.width + x) as usize]
    }

    /// Total number of agent pixels.
    pub fn count(&self) -> u64 {
        self.pixels.iter().filter(|p| **p).count() as u64
    }

    /// Coordinates of every agent pixel, row by row.
    pub fn iter_agents(&self) -> impl Iterator<Item = (u32, u32)> + '_ {
        let width = self.width.max(1);
        self.pixels
            .iter()
            .enumerate()
            .filter(|(_, is_agent)| **is_agent)
            .map(move |(i, _)| ((i as u32) % width, (i as u32) / width))
    }

    pub fn as_slice(&self) -> &[bool] {
        &self.pixels
    }
}

/// Euclidean distance between two RGB colors.
#[inline]
pub fn color_distance(rgb: [u8; 3], reference: [u8; 3]) -> f64 {
    let dr = rgb[0] as f64 - reference[0] as f64;
    let dg = rgb[1] as f64 - reference[1] as f64;
    let db = rgb[2] as f64 - reference[2] as f64;
    (dr * dr + dg * dg + db * db).sqrt()
}

/// Classifies every pixel of `frame`: agent iff its distance to `reference_color` is below `threshold`.
pub fn classify(frame: &RgbImage, reference_color: [u8; 3], threshold: f64) -> AgentMask {
    let (width, height) = frame.dimensions();
    let pixel_count = width as usize * height as usize;
    let mut pixels = vec![false; pixel_count];
    if pixel_count == 0 {
        return AgentMask { width, height, pixels };
    }

    let raw = &frame.as_raw()[..pixel_count * 3];
    if pixel_count >= PARALLEL_MIN_PIXELS {
        let row = width as usize;
        pixels
            .par_chunks_mut(row)
            .zip(raw.par_chunks(row * 3))
            .for_each(|(out, bytes)| classify_row(bytes, out, reference_color, threshold));
    } else {
        classify_row(raw, &mut pixels, reference_color, threshold);
    }

    AgentMask { width, height, pixels }
}

fn classify_row(bytes: &[u8], out: &mut [bool], reference_color: [u8; 3], threshold: f64) {
    for (slot, rgb) in out.iter_mut().zip(bytes.chunks_exact(3)) {
        *slot = color_distance([rgb[0], rgb[1], rgb[2]], reference_color) < threshold;
    }
}
