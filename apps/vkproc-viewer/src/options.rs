//! Command line options.

use std::path::PathBuf;

use vkproc_core::{BackendConfig, DebugLevel};

use crate::capture::{parse_frame_indices, CaptureConfig};

pub const WIDTH: u32 = 1280;
pub const HEIGHT: u32 = 720;

/// Everything the viewer reads from the command line.
#[derive(Debug, Clone)]
pub struct ViewerOptions {
    pub backend: BackendConfig,
    pub shader_dir: PathBuf,
    pub capture: CaptureConfig,
    pub help: bool,
}

impl Default for ViewerOptions {
    fn default() -> Self {
        Self {
            backend: BackendConfig::new("vkproc viewer").with_canvas_size(WIDTH, HEIGHT),
            shader_dir: std::env::var_os("VKPROC_SHADER_DIR").map_or_else(|| PathBuf::from("shaders"), PathBuf::from),
            capture: CaptureConfig::default(),
            help: false,
        }
    }
}

impl ViewerOptions {
    pub fn from_args() -> Self {
        let args: Vec<String> = std::env::args().collect();
        Self::parse_args(&args)
    }

    /// Parse a full argument list, program name first. Unknown flags are ignored.
    pub fn parse_args(args: &[String]) -> Self {
        let mut options = Self::default();
        let mut args = args.iter().skip(1);
        while let Some(arg) = args.next() {
            match arg.as_str() {
                "-h" | "--help" => options.help = true,
                "--vsync" => options.backend.vsync = true,
                "--no-vsync" => options.backend.vsync = false,
                "--threads" => {
                    if let Some(count) = args.next().and_then(|v| v.parse().ok()) {
                        options.backend.thread_count = count;
                    }
                }
                "--msaa" => {
                    if let Some(samples) = args.next().and_then(|v| v.parse().ok()) {
                        options.backend.multisampling = samples;
                    }
                }
                "--gpu" => {
                    if let Some(name) = args.next() {
                        options.backend.gpu_name.clone_from(name);
                    }
                }
                "--lod-bias" => {
                    if let Some(bias) = args.next().and_then(|v| v.parse().ok()) {
                        options.backend.texture_lod_bias = bias;
                    }
                }
                "--debug" => {
                    if let Some(level) = args.next() {
                        options.backend.debug_level = parse_debug_level(level);
                    }
                }
                "--shaders" => {
                    if let Some(dir) = args.next() {
                        options.shader_dir = PathBuf::from(dir);
                    }
                }
                "-S" | "--screenshot" => options.capture.enabled = true,
                "-o" | "--output" => {
                    if let Some(pattern) = args.next() {
                        options.capture.output_pattern.clone_from(pattern);
                    }
                }
                "-f" | "--frames" => {
                    if let Some(frames) = args.next() {
                        options.capture.frames = parse_frame_indices(frames);
                    }
                }
                "--exit-after" => options.capture.exit_after_capture = true,
                _ => {}
            }
        }
        options.capture = options.capture.finish();
        options
    }
}

fn parse_debug_level(level: &str) -> DebugLevel {
    match level {
        "1" | "minimal" => DebugLevel::Minimal,
        "2" | "performance" => DebugLevel::AffectsPerformance,
        "3" | "all" => DebugLevel::All,
        _ => DebugLevel::Off,
    }
}

pub fn print_help() {
    eprintln!(
        "vkproc viewer

USAGE:
    cargo run -p vkproc-viewer -- [OPTIONS]

BACKEND OPTIONS:
    --vsync / --no-vsync    Toggle vsync (default: on, V toggles at runtime)
    --threads <N>           Recording threads, 1 = single threaded (default: 1)
    --msaa <N>              Requested sample count (default: 0)
    --gpu <NAME>            Adapter name or \"auto\" (default: auto)
    --lod-bias <N>          Texture LOD bias in 1/1000 mip levels
    --debug <LEVEL>         off | minimal | performance | all
    --shaders <DIR>         Directory with the compiled *.spv shaders
                            Default: $VKPROC_SHADER_DIR or ./shaders

SCREENSHOT OPTIONS:
    -S, --screenshot        Enable screenshot capture mode
    -o, --output <PATTERN>  Output path pattern (use {{}} for frame number)
    -f, --frames <FRAMES>   Frame indices to capture, e.g. \"0,10,20\" or \"0-5\"
    --exit-after            Exit after capturing all specified frames

ENVIRONMENT VARIABLES:
    RUST_LOG                Set log level (e.g., info, debug, trace)"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> ViewerOptions {
        let args: Vec<String> = std::iter::once("vkproc-viewer")
            .chain(args.iter().copied())
            .map(String::from)
            .collect();
        ViewerOptions::parse_args(&args)
    }

    #[test]
    fn backend_flags_reach_the_config() {
        let options = parse(&["--threads", "4", "--msaa", "8", "--no-vsync", "--gpu", "Radeon", "--debug", "all"]);
        assert_eq!(options.backend.thread_count, 4);
        assert_eq!(options.backend.multisampling, 8);
        assert!(!options.backend.vsync);
        assert_eq!(options.backend.gpu_name, "Radeon");
        assert_eq!(options.backend.debug_level, DebugLevel::All);
        assert_eq!((options.backend.canvas_width, options.backend.canvas_height), (WIDTH, HEIGHT));
    }

    #[test]
    fn screenshot_flags_enable_capture() {
        let options = parse(&["-S", "-f", "2-3", "--exit-after"]);
        assert!(options.capture.should_capture(2));
        assert!(options.capture.exit_after_capture);
        assert_eq!(options.capture.output_pattern, "screenshot_{}.png");
        assert!(!parse(&[]).capture.enabled);
    }

    #[test]
    fn missing_values_keep_defaults() {
        let options = parse(&["--threads", "many", "--shaders"]);
        assert_eq!(options.backend.thread_count, BackendConfig::default().thread_count);
        assert!(!options.help);
    }
}
