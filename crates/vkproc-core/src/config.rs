//! Backend configuration.

use serde::{Deserialize, Serialize};

/// How much validation and debug output the Vulkan instance enables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub enum DebugLevel {
    #[default]
    Off,
    /// Validation layer with the debug messenger.
    Minimal,
    /// Adds synchronization and best-practice validation.
    AffectsPerformance,
    /// Everything, including verbose messenger output.
    All,
}

impl DebugLevel {
    /// Whether the validation layer and debug messenger are requested.
    pub const fn wants_validation(self) -> bool {
        !matches!(self, Self::Off)
    }

    /// Whether the extra validation features are requested.
    pub const fn wants_validation_features(self) -> bool {
        matches!(self, Self::AffectsPerformance | Self::All)
    }

    /// Whether verbose lifecycle messages should be logged.
    pub const fn is_verbose(self) -> bool {
        matches!(self, Self::All)
    }
}

/// Options recognised by the backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendConfig {
    /// Application name reported to the driver.
    pub app_name: String,
    pub debug_level: DebugLevel,
    pub vsync: bool,
    /// Requested multisample count; odd bits are ignored.
    pub multisampling: u32,
    /// `"auto"` or an exact adapter name.
    pub gpu_name: String,
    /// Texture LOD bias in thousandths.
    pub texture_lod_bias: i32,
    /// Total recording threads including the main thread.
    pub thread_count: usize,
    /// Initial canvas size used when the surface leaves the extent undefined.
    pub canvas_width: u32,
    pub canvas_height: u32,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            app_name: "vkproc".to_string(),
            debug_level: if cfg!(debug_assertions) {
                DebugLevel::Minimal
            } else {
                DebugLevel::Off
            },
            vsync: true,
            multisampling: 0,
            gpu_name: Self::AUTO_GPU.to_string(),
            texture_lod_bias: 0,
            thread_count: 1,
            canvas_width: 1280,
            canvas_height: 720,
        }
    }
}

impl BackendConfig {
    /// Adapter name meaning "pick the best adapter".
    pub const AUTO_GPU: &'static str = "auto";

    /// Create a config with the given application name.
    pub fn new(app_name: impl Into<String>) -> Self {
        Self {
            app_name: app_name.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub const fn with_debug_level(mut self, debug_level: DebugLevel) -> Self {
        self.debug_level = debug_level;
        self
    }

    #[must_use]
    pub const fn with_vsync(mut self, vsync: bool) -> Self {
        self.vsync = vsync;
        self
    }

    #[must_use]
    pub const fn with_multisampling(mut self, samples: u32) -> Self {
        self.multisampling = samples;
        self
    }

    #[must_use]
    pub fn with_gpu_name(mut self, gpu_name: impl Into<String>) -> Self {
        self.gpu_name = gpu_name.into();
        self
    }

    #[must_use]
    pub const fn with_texture_lod_bias(mut self, bias: i32) -> Self {
        self.texture_lod_bias = bias;
        self
    }

    #[must_use]
    pub const fn with_thread_count(mut self, thread_count: usize) -> Self {
        self.thread_count = thread_count;
        self
    }

    #[must_use]
    pub const fn with_canvas_size(mut self, width: u32, height: u32) -> Self {
        self.canvas_width = width;
        self.canvas_height = height;
        self
    }

    /// The preferred adapter name, or `None` for automatic selection.
    pub fn preferred_gpu(&self) -> Option<&str> {
        let name = self.gpu_name.trim();
        (!name.is_empty() && name != Self::AUTO_GPU).then_some(name)
    }

    /// Multisample request with odd bits dropped.
    pub const fn even_multisampling(&self) -> u32 {
        self.multisampling & !1
    }

    /// Clamp the configured thread count against the available hardware threads.
    ///
    /// One or fewer means single threaded. Otherwise the main thread needs at
    /// least two workers next to it, and never more threads than the hardware has.
    pub fn effective_thread_count(&self, hardware_threads: usize) -> usize {
        if self.thread_count <= 1 {
            1
        } else {
            self.thread_count.clamp(3, hardware_threads.max(3))
        }
    }

    /// Texture LOD bias in mip levels.
    #[allow(clippy::cast_precision_loss)]
    pub fn lod_bias(&self) -> f32 {
        self.texture_lod_bias as f32 / 1000.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn thread_count_clamps_into_supported_range() {
        let config = BackendConfig::default();
        assert_eq!(config.clone().with_thread_count(0).effective_thread_count(8), 1);
        assert_eq!(config.clone().with_thread_count(1).effective_thread_count(8), 1);
        assert_eq!(config.clone().with_thread_count(2).effective_thread_count(8), 3);
        assert_eq!(config.clone().with_thread_count(4).effective_thread_count(8), 4);
        assert_eq!(config.clone().with_thread_count(32).effective_thread_count(8), 8);
        assert_eq!(config.with_thread_count(6).effective_thread_count(2), 3);
    }

    #[test]
    fn auto_gpu_means_no_preference() {
        assert_eq!(BackendConfig::default().preferred_gpu(), None);
        let config = BackendConfig::default().with_gpu_name("Test GPU");
        assert_eq!(config.preferred_gpu(), Some("Test GPU"));
    }

    #[test]
    fn multisampling_drops_odd_bit() {
        assert_eq!(BackendConfig::default().with_multisampling(7).even_multisampling(), 6);
        assert_eq!(BackendConfig::default().with_multisampling(1).even_multisampling(), 0);
    }
}
