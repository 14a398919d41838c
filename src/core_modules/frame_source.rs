// THEORY:
// Upstream of the engine sit the decoder, the stabilizer and the background
// subtractor. Together they produce, per logical frame, three aligned images:
// the original, the stabilized one and the background-subtracted one. The engine
// only sees them through `FrameSource`, and treats the first missing triple as the
// end of the stream.

use image::RgbImage;
use std::collections::VecDeque;

/// The three aligned images of one logical frame.
#[derive(Debug, Clone, PartialEq)]
pub struct FrameTriple {
    /// The frame as decoded from the source video.
    pub origin: RgbImage,
    /// The frame after feature-based stabilization. Motion is estimated on these.
    pub stabilized: RgbImage,
    /// The stabilized frame with the static background removed. Agents are classified on these.
    pub background_subtracted: RgbImage,
}

impl FrameTriple {
    pub fn new(origin: RgbImage, stabilized: RgbImage, background_subtracted: RgbImage) -> Self {
        Self {
            origin,
            stabilized,
            background_subtracted,
        }
    }

    /// A triple where all three images are the same frame.
    pub fn uniform(frame: RgbImage) -> Self {
        Self {
            origin: frame.clone(),
            stabilized: frame.clone(),
            background_subtracted: frame,
        }
    }

    pub fn dimensions(&self) -> (u32, u32) {
        self.background_subtracted.dimensions()
    }

    /// True when all three images share the same size.
    pub fn is_aligned(&self) -> bool {
        let size = self.origin.dimensions();
        self.stabilized.dimensions() == size && self.background_subtracted.dimensions() == size
    }
}

/// The upstream frame collaborator.
pub trait FrameSource {
    /// The next aligned triple, or `None` once any of the three streams is exhausted.
    fn next_triple(&mut self) -> Option<FrameTriple>;

    /// How many triples are left, if the source knows. Live feeds usually don't.
    fn frame_count_hint(&self) -> Option<u64> {
        None
    }
}

impl<S: FrameSource + ?Sized> FrameSource for Box<S> {
    fn next_triple(&mut self) -> Option<FrameTriple> {
        (**self).next_triple()
    }

    fn frame_count_hint(&self) -> Option<u64> {
        (**self).frame_count_hint()
    }
}

/// An in-memory frame source, mostly for batch drivers and tests.
#[derive(Debug, Clone, Default)]
pub struct VecFrameSource {
    frames: VecDeque<FrameTriple>,
}

impl VecFrameSource {
    pub fn new(frames: impl IntoIterator<Item = FrameTriple>) -> Self {
        Self {
            frames: frames.into_iter().collect(),
        }
    }

    pub fn push(&mut self, triple: FrameTriple) {
        self.frames.push_back(triple);
    }

    pub fn remaining(&self) -> usize {
        self.frames.len()
    }
}

impl FrameSource for VecFrameSource {
    fn next_triple(&mut self) -> Option<FrameTriple> {
        self.frames.pop_front()
    }

    fn frame_count_hint(&self) -> Option<u64> {
        Some(self.frames.len() as u64)
    }
}
