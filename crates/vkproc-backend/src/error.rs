//! Backend errors and the sticky error/warning accumulator.

use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use thiserror::Error;
use vkproc_gpu::GpuError;

/// Errors raised while processing commands.
#[derive(Error, Debug)]
pub enum BackendError {
    /// Error from the Vulkan layer.
    #[error(transparent)]
    Gpu(#[from] GpuError),

    /// Memory ran out even after flushing pending frees.
    #[error("Out of memory: {reason} ({usage})")]
    OutOfMemory {
        /// What was being allocated.
        reason: String,
        /// Memory usage summary at the time of failure.
        usage: String,
    },

    /// A command referenced a slot that holds nothing.
    #[error("Invalid {kind} index {index}")]
    InvalidHandle {
        /// Table the index points into.
        kind: &'static str,
        /// The offending index.
        index: usize,
    },

    /// A shader could not be found or read.
    #[error("Shader {name} unavailable: {reason}")]
    Shader {
        /// Base name of the shader.
        name: String,
        /// Why it could not be loaded.
        reason: String,
    },

    /// A fatal error was recorded earlier; commands are refused.
    #[error("Backend stopped after an earlier error: {0}")]
    Stopped(String),
}

impl BackendError {
    /// Whether flushing pending frees and retrying could help.
    pub const fn is_out_of_memory(&self) -> bool {
        match self {
            Self::Gpu(err) => err.is_out_of_memory(),
            Self::OutOfMemory { .. } => true,
            _ => false,
        }
    }
}

/// Result type alias.
pub type Result<T> = std::result::Result<T, BackendError>;

/// Category of a fatal error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Init,
    OutOfMemoryImage,
    OutOfMemoryBuffer,
    OutOfMemoryStaging,
    RenderRecording,
    RenderSubmit,
    SwapFailed,
    Unknown,
}

/// Category of a warning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WarningKind {
    /// Something failed while the backend was still starting.
    InitFailed,
    /// A missing layer, extension or similar absorbed problem.
    Unknown,
}

#[derive(Debug, Default)]
struct Messages {
    errors: Vec<String>,
    error_kind: Option<ErrorKind>,
    warnings: Vec<String>,
    warning_kind: Option<WarningKind>,
    can_assert: bool,
}

/// Sticky, deduplicating record of errors and warnings.
///
/// Shared between the main thread and the recording workers. Once an error
/// is recorded after startup, [`Self::has_error`] stays true until
/// [`Self::reset`].
#[derive(Debug, Default)]
pub struct ErrorState {
    has_error: AtomicBool,
    messages: Mutex<Messages>,
}

impl ErrorState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Once set, errors become fatal instead of init warnings.
    pub fn set_can_assert(&self, can_assert: bool) {
        self.messages.lock().can_assert = can_assert;
    }

    /// Record an error.
    ///
    /// Before the backend reaches steady state the message is downgraded to
    /// an [`WarningKind::InitFailed`] warning.
    pub fn set_error(&self, kind: ErrorKind, message: &str, extra: Option<&str>) {
        let mut messages = self.messages.lock();
        push_unique(&mut messages.errors, message);
        if let Some(extra) = extra {
            push_unique(&mut messages.errors, extra);
        }

        if messages.can_assert {
            match extra {
                Some(extra) => tracing::error!("vulkan error: {message}: {extra}"),
                None => tracing::error!("vulkan error: {message}"),
            }
            messages.error_kind = Some(kind);
            self.has_error.store(true, Ordering::Release);
        } else {
            drop(messages);
            self.set_warning(WarningKind::InitFailed, message);
            if let Some(extra) = extra {
                self.set_warning(WarningKind::InitFailed, extra);
            }
        }
    }

    /// Record a warning; duplicates are dropped.
    pub fn set_warning(&self, kind: WarningKind, message: &str) {
        tracing::warn!("vulkan warning: {message}");
        let mut messages = self.messages.lock();
        push_unique(&mut messages.warnings, message);
        messages.warning_kind = Some(kind);
    }

    #[inline]
    pub fn has_error(&self) -> bool {
        self.has_error.load(Ordering::Acquire)
    }

    pub fn error_kind(&self) -> Option<ErrorKind> {
        self.messages.lock().error_kind
    }

    pub fn warning_kind(&self) -> Option<WarningKind> {
        self.messages.lock().warning_kind
    }

    /// Every error message, newest last, joined into one line.
    pub fn error_string(&self) -> String {
        self.messages.lock().errors.join(": ")
    }

    pub fn warnings(&self) -> Vec<String> {
        self.messages.lock().warnings.clone()
    }

    /// Forget everything; used at shutdown.
    pub fn reset(&self) {
        let mut messages = self.messages.lock();
        let can_assert = messages.can_assert;
        *messages = Messages {
            can_assert,
            ..Messages::default()
        };
        self.has_error.store(false, Ordering::Release);
    }
}

fn push_unique(list: &mut Vec<String>, message: &str) {
    if !list.iter().any(|m| m == message) {
        list.push(message.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errors_before_startup_become_warnings() {
        let state = ErrorState::new();
        state.set_error(ErrorKind::Init, "no device", None);
        assert!(!state.has_error());
        assert_eq!(state.warnings(), vec!["no device".to_string()]);
        assert_eq!(state.warning_kind(), Some(WarningKind::InitFailed));
    }

    #[test]
    fn errors_after_startup_are_sticky() {
        let state = ErrorState::new();
        state.set_can_assert(true);
        state.set_error(ErrorKind::RenderSubmit, "submit failed", Some("device lost"));
        assert!(state.has_error());
        assert_eq!(state.error_kind(), Some(ErrorKind::RenderSubmit));
        assert_eq!(state.error_string(), "submit failed: device lost");

        state.reset();
        assert!(!state.has_error());
        assert!(state.error_string().is_empty());
    }

    #[test]
    fn messages_are_deduplicated() {
        let state = ErrorState::new();
        state.set_can_assert(true);
        state.set_error(ErrorKind::SwapFailed, "present failed", None);
        state.set_error(ErrorKind::SwapFailed, "present failed", None);
        state.set_warning(WarningKind::Unknown, "layer missing");
        state.set_warning(WarningKind::Unknown, "layer missing");
        assert_eq!(state.error_string(), "present failed");
        assert_eq!(state.warnings().len(), 1);
    }

    #[test]
    fn out_of_memory_is_detected_through_gpu_errors() {
        let err = BackendError::from(GpuError::OutOfMemory("image heap".into()));
        assert!(err.is_out_of_memory());
        assert!(!BackendError::InvalidHandle {
            kind: "texture",
            index: 3
        }
        .is_out_of_memory());
    }
}
