// THEORY:
// `SessionConfig` is the immutable contract between the caller's calibration step
// and the engine. It is plain data: the color rule that separates agents from the
// background, the scales that turn pixels into ground units, and the shape of the
// spatial grid and temporal window. Validation lives here so that `initialize`
// can reject a bad session before any state is built.

use crate::error::{EngineError, EngineResult};
use serde::{Deserialize, Serialize};
use std::path::Path;

const DEFAULT_SMOOTH_WINDOW_SIZE: usize = 9;

/// Calibration and grid parameters for one extraction session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionConfig {
    /// The RGB color of an agent's body, as sampled by the calibration UI.
    pub body_color: [u8; 3],
    /// A pixel is an agent pixel when its Euclidean RGB distance to `body_color` is below this.
    pub color_threshold: f64,
    /// How many masked pixels make up one agent.
    pub pixels_per_agent: f64,
    /// Pixels per ground unit (one body length).
    pub body_length: f64,
    /// Number of motion fields averaged per step. Must be odd so the reference frame is centered.
    #[serde(default = "default_smooth_window_size")]
    pub smooth_window_size: usize,
    /// Cells per side of the square grid.
    pub resolution: i32,
    /// Seconds per frame.
    pub frame_time: f64,
    /// Rescale per-step pixel counts so the total matches the reference frame's.
    #[serde(default)]
    pub constant_total_pixel_count: bool,
}

fn default_smooth_window_size() -> usize {
    DEFAULT_SMOOTH_WINDOW_SIZE
}

impl SessionConfig {
    pub fn from_toml_str(content: &str) -> EngineResult<Self> {
        let config: SessionConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> EngineResult<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn validate(&self) -> EngineResult<()> {
        if self.resolution <= 0 {
            return Err(EngineError::invalid_config(format!(
                "resolution must be positive, got {}",
                self.resolution
            )));
        }
        if !(self.body_length.is_finite() && self.body_length > 0.0) {
            return Err(EngineError::invalid_config(format!(
                "body length must be positive, got {}",
                self.body_length
            )));
        }
        if !(self.frame_time.is_finite() && self.frame_time > 0.0) {
            return Err(EngineError::invalid_config(format!(
                "frame time must be positive, got {}",
                self.frame_time
            )));
        }
        if !(self.pixels_per_agent.is_finite() && self.pixels_per_agent > 0.0) {
            return Err(EngineError::invalid_config(format!(
                "pixels per agent must be positive, got {}",
                self.pixels_per_agent
            )));
        }
        if self.smooth_window_size == 0 || self.smooth_window_size % 2 == 0 {
            return Err(EngineError::invalid_config(format!(
                "smoothing window must be odd and at least 1, got {}",
                self.smooth_window_size
            )));
        }
        if !self.color_threshold.is_finite() {
            return Err(EngineError::invalid_config("color threshold must be finite"));
        }
        Ok(())
    }
}
