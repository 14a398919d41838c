// THEORY:
// A `MotionField` is the dense displacement estimate between two consecutive
// stabilized frames: one 2D vector per pixel, in pixels per frame. The engine
// never computes one itself. Producing it is the job of an external estimator,
// which plugs in through the `MotionEstimator` trait.

use image::RgbImage;

/// A dense per-pixel displacement field in pixels per frame.
#[derive(Debug, Clone, PartialEq)]
pub struct MotionField {
    width: u32,
    height: u32,
    /// Row-major `[dx, dy]` per pixel.
    vectors: Vec<[f32; 2]>,
}

impl MotionField {
    /// A field with no motion anywhere.
    pub fn zeros(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            vectors: vec![[0.0, 0.0]; width as usize * height as usize],
        }
    }

    /// A field with the same displacement at every pixel.
    pub fn uniform(width: u32, height: u32, vector: [f32; 2]) -> Self {
        Self {
            width,
            height,
            vectors: vec![vector; width as usize * height as usize],
        }
    }

    /// Wraps a row-major vector buffer. Returns `None` when the length does not match the size.
    pub fn from_vectors(width: u32, height: u32, vectors: Vec<[f32; 2]>) -> Option<Self> {
        (vectors.len() == width as usize * height as usize).then_some(Self { width, height, vectors })
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    #[inline]
    pub fn get(&self, x: u32, y: u32) -> [f32; 2] {
        self.vectors[(y * self.width + x) as usize]
    }

    #[inline]
    pub fn set(&mut self, x: u32, y: u32, vector: [f32; 2]) {
        self.vectors[(y * self.width + x) as usize] = vector;
    }

    pub fn as_slice(&self) -> &[[f32; 2]] {
        &self.vectors
    }

    /// Element-wise arithmetic mean of equally sized fields. `None` for an empty input.
    pub fn mean<'a, I>(fields: I) -> Option<Self>
    where
        I: IntoIterator<Item = &'a MotionField>,
    {
        let mut fields = fields.into_iter();
        let first = fields.next()?;
        let mut sums: Vec<[f64; 2]> = first.vectors.iter().map(|v| [v[0] as f64, v[1] as f64]).collect();
        let mut count = 1usize;

        for field in fields {
            for (sum, v) in sums.iter_mut().zip(&field.vectors) {
                sum[0] += v[0] as f64;
                sum[1] += v[1] as f64;
            }
            count += 1;
        }

        let n = count as f64;
        Some(Self {
            width: first.width,
            height: first.height,
            vectors: sums.into_iter().map(|s| [(s[0] / n) as f32, (s[1] / n) as f32]).collect(),
        })
    }
}

/// The dense motion-field estimator collaborator.
pub trait MotionEstimator {
    /// Estimates the per-pixel displacement from `previous` to `current` (pixels / frame).
    fn estimate(&mut self, previous: &RgbImage, current: &RgbImage) -> MotionField;
}

impl<E: MotionEstimator + ?Sized> MotionEstimator for Box<E> {
    fn estimate(&mut self, previous: &RgbImage, current: &RgbImage) -> MotionField {
        (**self).estimate(previous, current)
    }
}
