//! Shared memory usage counters.
//!
//! A [`MemoryUsage`] handle is created once per backend and cloned into every
//! component that allocates. The front end may keep a clone to read the
//! counters for diagnostics.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Category a byte count is charged to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemoryUsageKind {
    Staging,
    Buffer,
    Texture,
    Stream,
}

#[derive(Debug, Default)]
struct Counters {
    staging: AtomicU64,
    buffer: AtomicU64,
    texture: AtomicU64,
    stream: AtomicU64,
}

/// Cheaply clonable handle to the live memory usage counters.
#[derive(Debug, Clone, Default)]
pub struct MemoryUsage {
    counters: Arc<Counters>,
}

impl MemoryUsage {
    /// Fresh counters, all zero.
    pub fn new() -> Self {
        Self::default()
    }

    fn counter(&self, kind: MemoryUsageKind) -> &AtomicU64 {
        match kind {
            MemoryUsageKind::Staging => &self.counters.staging,
            MemoryUsageKind::Buffer => &self.counters.buffer,
            MemoryUsageKind::Texture => &self.counters.texture,
            MemoryUsageKind::Stream => &self.counters.stream,
        }
    }

    /// Charge `bytes` to a category.
    pub fn add(&self, kind: MemoryUsageKind, bytes: u64) {
        self.counter(kind).fetch_add(bytes, Ordering::Relaxed);
    }

    /// Release `bytes` from a category, saturating at zero.
    pub fn sub(&self, kind: MemoryUsageKind, bytes: u64) {
        let counter = self.counter(kind);
        let _ = counter.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |current| {
            Some(current.saturating_sub(bytes))
        });
    }

    /// Current byte count of a category.
    pub fn get(&self, kind: MemoryUsageKind) -> u64 {
        self.counter(kind).load(Ordering::Relaxed)
    }

    /// Reset every counter, used at backend shutdown.
    pub fn reset(&self) {
        for kind in [
            MemoryUsageKind::Staging,
            MemoryUsageKind::Buffer,
            MemoryUsageKind::Texture,
            MemoryUsageKind::Stream,
        ] {
            self.counter(kind).store(0, Ordering::Relaxed);
        }
    }

    /// Human readable summary attached to out-of-memory errors.
    pub fn summary(&self) -> String {
        format!(
            "Staging: {} KB, Buffer: {} KB, Texture: {} KB, Stream: {} KB",
            self.get(MemoryUsageKind::Staging) / 1024,
            self.get(MemoryUsageKind::Buffer) / 1024,
            self.get(MemoryUsageKind::Texture) / 1024,
            self.get(MemoryUsageKind::Stream) / 1024,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clones_share_counters() {
        let usage = MemoryUsage::new();
        let reader = usage.clone();
        usage.add(MemoryUsageKind::Texture, 4096);
        assert_eq!(reader.get(MemoryUsageKind::Texture), 4096);
    }

    #[test]
    fn sub_saturates_at_zero() {
        let usage = MemoryUsage::new();
        usage.add(MemoryUsageKind::Stream, 10);
        usage.sub(MemoryUsageKind::Stream, 20);
        assert_eq!(usage.get(MemoryUsageKind::Stream), 0);
    }

    #[test]
    fn summary_reports_kilobytes() {
        let usage = MemoryUsage::new();
        usage.add(MemoryUsageKind::Staging, 2048);
        usage.add(MemoryUsageKind::Buffer, 1024 * 1024);
        assert_eq!(
            usage.summary(),
            "Staging: 2 KB, Buffer: 1024 KB, Texture: 0 KB, Stream: 0 KB"
        );
        usage.reset();
        assert_eq!(usage.get(MemoryUsageKind::Buffer), 0);
    }
}
