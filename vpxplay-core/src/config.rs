//! Player configuration

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::demuxer::FALLBACK_FPS;
use crate::presenter::AlphaComposite;

/// Playback settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlayerConfig {
    /// Frame rate used when the track has none
    pub fallback_fps: u32,
    /// How long one loop iteration waits on an in-flight decode
    pub decode_wait: Duration,
    /// Where alpha frames go in the overlay
    pub alpha_composite: AlphaComposite,
    /// libvpx decoder threads, 0 = library default
    pub decoder_threads: u32,
    pub window_title: String,
}

impl Default for PlayerConfig {
    fn default() -> Self {
        Self {
            fallback_fps: FALLBACK_FPS,
            decode_wait: Duration::from_millis(5),
            alpha_composite: AlphaComposite::Mask,
            decoder_threads: 0,
            window_title: "vpxplay".to_string(),
        }
    }
}

impl PlayerConfig {
    /// Pacing interval for a track rate, substituting `fallback_fps` for 0.
    pub fn frame_interval(&self, fps: u32) -> Duration {
        let fps = if fps == 0 { self.fallback_fps.max(1) } else { fps };
        crate::sync::frame_interval(fps)
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.window_title = title.into();
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = PlayerConfig::default();
        assert_eq!(config.fallback_fps, 24);
        assert_eq!(config.decode_wait, Duration::from_millis(5));
        assert_eq!(config.alpha_composite, AlphaComposite::Mask);
    }

    #[test]
    fn test_frame_interval_uses_fallback_for_zero() {
        let config = PlayerConfig::default();
        assert_eq!(config.frame_interval(25), Duration::from_millis(40));
        assert_eq!(config.frame_interval(0), config.frame_interval(24));
    }

    #[test]
    fn test_title_builder() {
        let config = PlayerConfig::default().with_title("clip.webm");
        assert_eq!(config.window_title, "clip.webm");
    }
}
