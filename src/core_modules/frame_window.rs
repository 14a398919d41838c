// THEORY:
// Instantaneous motion estimates are noisy. The `FrameWindowBuffer` keeps the last
// W aligned frames together with the motion field that led into each of them, and
// hands the engine two things per step: the element-wise mean of those fields, and
// the frame sitting in the middle of the window, which the mean is centered on.
//
// Key architectural principles:
// 1.  **Fill, Then Slide**: The buffer is a fixed-capacity FIFO with an explicit
//     "not yet full" state. During cold start it only appends; once full, every
//     push evicts the oldest entry. Nothing is pre-filled with fake frames.
// 2.  **Centered Reference**: The reference is always the entry at index W/2, so
//     the smoothed field is symmetric in time around the frame being measured.
// 3.  **Pull Model**: `advance` pulls as many triples as it needs from the frame
//     source. The first missing triple ends the stream; that is a normal outcome.
// 4.  **Gatekeeper**: Every triple and every motion field is size-checked before it
//     enters the window. A rejected frame is dropped on the spot, so it can never
//     poison the windows that follow it.

use crate::core_modules::frame_source::{FrameSource, FrameTriple};
use crate::core_modules::motion_field::{MotionEstimator, MotionField};
use crate::error::{EngineError, EngineResult};
use std::collections::VecDeque;
use tracing::warn;

/// One slot of the window: a frame triple and the motion field that ends on it.
#[derive(Debug, Clone)]
pub struct WindowEntry {
    pub frames: FrameTriple,
    pub motion: MotionField,
}

/// A fixed-capacity sliding window of frames and their motion fields.
#[derive(Debug, Clone)]
pub struct FrameWindowBuffer {
    /// The smoothing window size W.
    capacity: usize,
    /// Every frame and motion field must have this (width, height).
    frame_size: (u32, u32),
    /// Oldest entry at the front.
    entries: VecDeque<WindowEntry>,
}

impl FrameWindowBuffer {
    pub fn new(capacity: usize, frame_width: u32, frame_height: u32) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            frame_size: (frame_width, frame_height),
            entries: VecDeque::with_capacity(capacity),
        }
    }

    /// Appends an entry, evicting the oldest one when the window is already full.
    /// Returns whether the window is full after the push. A wrong-sized entry is
    /// rejected and the window is left unchanged.
    pub fn push(&mut self, frames: FrameTriple, motion: MotionField) -> EngineResult<bool> {
        self.check_triple(&frames)?;
        self.check_size("motion field", (motion.width(), motion.height()))?;
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(WindowEntry { frames, motion });
        Ok(self.is_ready())
    }

    /// Pulls triples from `source` until one new entry has been pushed into a full window.
    /// Returns `Ok(false)` as soon as the source runs dry.
    ///
    /// A wrong-sized triple or motion field is consumed and reported as
    /// `FrameSizeMismatch`; the next call carries on with the following frame.
    pub fn advance<S, E>(&mut self, source: &mut S, estimator: &mut E) -> EngineResult<bool>
    where
        S: FrameSource + ?Sized,
        E: MotionEstimator + ?Sized,
    {
        loop {
            let Some(frames) = source.next_triple() else {
                return Ok(false);
            };
            self.check_triple(&frames)?;
            // The very first frame has no predecessor and is paired with itself.
            let motion = match self.entries.back() {
                Some(previous) => estimator.estimate(&previous.frames.stabilized, &frames.stabilized),
                None => estimator.estimate(&frames.stabilized, &frames.stabilized),
            };
            if self.push(frames, motion)? {
                return Ok(true);
            }
        }
    }

    fn check_triple(&self, frames: &FrameTriple) -> EngineResult<()> {
        if frames.is_aligned() && frames.dimensions() == self.frame_size {
            return Ok(());
        }
        self.check_size("original frame", frames.origin.dimensions())?;
        self.check_size("stabilized frame", frames.stabilized.dimensions())?;
        self.check_size("background-subtracted frame", frames.background_subtracted.dimensions())
    }

    fn check_size(&self, what: &'static str, (width, height): (u32, u32)) -> EngineResult<()> {
        let (expected_width, expected_height) = self.frame_size;
        if (width, height) == self.frame_size {
            return Ok(());
        }
        warn!(what, width, height, expected_width, expected_height, "size mismatch, frame dropped");
        Err(EngineError::FrameSizeMismatch {
            what,
            expected_width,
            expected_height,
            actual_width: width,
            actual_height: height,
        })
    }

    pub fn is_ready(&self) -> bool {
        self.entries.len() == self.capacity
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn center_index(&self) -> usize {
        self.capacity / 2
    }

    /// The entry at the center index, once the window holds that many entries.
    pub fn reference(&self) -> Option<&WindowEntry> {
        self.entries.get(self.center_index())
    }

    /// Element-wise mean of every motion field currently in the window.
    pub fn smoothed_motion_field(&self) -> Option<MotionField> {
        MotionField::mean(self.entries.iter().map(|entry| &entry.motion))
    }

    pub fn entries(&self) -> impl Iterator<Item = &WindowEntry> {
        self.entries.iter()
    }
}
