//! Which frames to capture and where to write them.

use std::collections::HashSet;
use std::path::PathBuf;

/// Screenshot capture configuration.
#[derive(Debug, Clone, Default)]
pub struct CaptureConfig {
    pub enabled: bool,
    /// Output path pattern, `{}` is replaced by the frame number.
    pub output_pattern: String,
    pub frames: HashSet<u64>,
    pub exit_after_capture: bool,
}

impl CaptureConfig {
    pub fn output_path(&self, frame: u64) -> PathBuf {
        PathBuf::from(self.output_pattern.replace("{}", &frame.to_string()))
    }

    pub fn should_capture(&self, frame: u64) -> bool {
        self.enabled && self.frames.contains(&frame)
    }

    /// Whether every requested frame lies behind `current_frame`.
    pub fn all_captured(&self, current_frame: u64) -> bool {
        if !self.enabled || self.frames.is_empty() {
            return false;
        }
        let last = self.frames.iter().max().copied().unwrap_or(0);
        current_frame > last
    }

    /// Fill in the defaults once capture was switched on.
    pub fn finish(mut self) -> Self {
        if self.enabled {
            if self.output_pattern.is_empty() {
                self.output_pattern = "screenshot_{}.png".to_string();
            }
            if self.frames.is_empty() {
                self.frames.insert(0);
            }
        }
        self
    }
}

/// Parse frame indices like "0,5,10-15,20". Ranges are inclusive.
pub fn parse_frame_indices(s: &str) -> HashSet<u64> {
    let mut frames = HashSet::new();
    for part in s.split(',').map(str::trim) {
        if let Some((start, end)) = part.split_once('-') {
            if let (Ok(start), Ok(end)) = (start.parse::<u64>(), end.parse::<u64>()) {
                frames.extend(start..=end);
            }
        } else if let Ok(frame) = part.parse::<u64>() {
            frames.insert(frame);
        }
    }
    frames
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_mixed() {
        assert_eq!(parse_frame_indices("0,5-7,10"), HashSet::from([0, 5, 6, 7, 10]));
        assert_eq!(parse_frame_indices("3"), HashSet::from([3]));
        assert!(parse_frame_indices("x,-").is_empty());
    }

    #[test]
    fn enabled_capture_gets_defaults() {
        let config = CaptureConfig {
            enabled: true,
            ..CaptureConfig::default()
        }
        .finish();
        assert_eq!(config.output_path(0), PathBuf::from("screenshot_0.png"));
        assert!(config.should_capture(0));
        assert!(!config.all_captured(0));
        assert!(config.all_captured(1));
    }
}
