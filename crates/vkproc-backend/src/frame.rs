//! Frame-in-flight bookkeeping.
//!
//! Swapchain images are not acquired in a fixed order, so besides the
//! rotating sync slots the tracker remembers which slot's fence last
//! guarded each image. Before an image is reused its fence is waited on,
//! and images that have not been acquired for a whole swapchain rotation
//! get their per-frame data released too.

use vkproc_gpu::{FrameFence, Result};

pub struct FrameTracker<F: FrameFence> {
    fences: Vec<F>,
    image_fences: Vec<Option<usize>>,
    last_used: Vec<u64>,
    frame_counter: u64,
    sync_slot: usize,
}

impl<F: FrameFence> FrameTracker<F> {
    /// One fence per sync slot; the slot count equals the image count.
    pub fn new(fences: Vec<F>) -> Self {
        let count = fences.len();
        Self {
            fences,
            image_fences: vec![None; count],
            last_used: vec![0; count],
            frame_counter: 0,
            sync_slot: 0,
        }
    }

    pub fn image_count(&self) -> usize {
        self.fences.len()
    }

    pub const fn sync_slot(&self) -> usize {
        self.sync_slot
    }

    pub const fn frame_counter(&self) -> u64 {
        self.frame_counter
    }

    /// Fence signaled by the submission of the current sync slot.
    pub fn current_fence(&self) -> &F {
        &self.fences[self.sync_slot]
    }

    /// Make `image` the frame's target.
    ///
    /// Waits until the GPU is done with the image's previous frame, then
    /// releases the data of images idle for longer than one rotation
    /// through `cleanup`, each after its own fence has signaled.
    pub fn begin_image(&mut self, image: usize, mut cleanup: impl FnMut(usize)) -> Result<()> {
        if let Some(slot) = self.image_fences[image] {
            self.fences[slot].wait()?;
        }
        self.image_fences[image] = Some(self.sync_slot);

        self.frame_counter += 1;
        self.last_used[image] = self.frame_counter;

        let rotation = self.fences.len() as u64;
        for other in 0..self.fences.len() {
            if self.frame_counter - self.last_used[other] <= rotation {
                continue;
            }
            if let Some(slot) = self.image_fences[other] {
                self.fences[slot].wait()?;
                cleanup(other);
                self.image_fences[other] = None;
            }
            self.last_used[other] = self.frame_counter;
        }
        Ok(())
    }

    /// Move to the next sync slot after presenting.
    pub fn advance(&mut self) {
        self.sync_slot = (self.sync_slot + 1) % self.fences.len().max(1);
    }

    /// Replace the fences after the image count changed.
    pub fn reset(&mut self, fences: Vec<F>) {
        *self = Self::new(fences);
    }

    /// Wait for every in-flight frame.
    pub fn wait_all(&self) -> Result<()> {
        for slot in self.image_fences.iter().flatten() {
            self.fences[*slot].wait()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Event {
        Wait(usize),
        Cleanup(usize),
    }

    struct MockFence {
        id: usize,
        events: Arc<Mutex<Vec<Event>>>,
    }

    impl FrameFence for MockFence {
        fn wait(&self) -> Result<()> {
            self.events.lock().push(Event::Wait(self.id));
            Ok(())
        }

        fn reset(&self) -> Result<()> {
            Ok(())
        }
    }

    fn tracker(count: usize) -> (FrameTracker<MockFence>, Arc<Mutex<Vec<Event>>>) {
        let events = Arc::new(Mutex::new(Vec::new()));
        let fences = (0..count)
            .map(|id| MockFence {
                id,
                events: Arc::clone(&events),
            })
            .collect();
        (FrameTracker::new(fences), events)
    }

    #[test]
    fn first_use_of_an_image_does_not_wait() {
        let (mut frames, events) = tracker(3);
        frames.begin_image(1, |_| {}).unwrap();
        assert!(events.lock().is_empty());
        assert_eq!(frames.frame_counter(), 1);
    }

    #[test]
    fn reused_image_waits_on_the_fence_of_its_last_frame() {
        let (mut frames, events) = tracker(2);
        frames.begin_image(0, |_| {}).unwrap();
        frames.advance();
        frames.begin_image(1, |_| {}).unwrap();
        frames.advance();
        frames.begin_image(0, |_| {}).unwrap();
        assert_eq!(*events.lock(), vec![Event::Wait(0)]);
        assert_eq!(frames.sync_slot(), 0);
    }

    #[test]
    fn stale_images_are_cleaned_after_their_fence() {
        let (mut frames, events) = tracker(2);
        frames.begin_image(1, |_| {}).unwrap();
        frames.advance();

        // Image 1 then sits idle while image 0 is acquired repeatedly.
        for _ in 0..3 {
            let log = Arc::clone(&events);
            frames
                .begin_image(0, |image| log.lock().push(Event::Cleanup(image)))
                .unwrap();
            frames.advance();
        }

        let events = events.lock().clone();
        let cleanup = events
            .iter()
            .position(|e| *e == Event::Cleanup(1))
            .expect("idle image cleaned");
        assert_eq!(events[cleanup - 1], Event::Wait(0));
        assert_eq!(events.iter().filter(|e| **e == Event::Cleanup(1)).count(), 1);
    }

    #[test]
    fn reset_forgets_in_flight_frames() {
        let (mut frames, events) = tracker(2);
        frames.begin_image(0, |_| {}).unwrap();
        let (fresh, _) = tracker(3);
        frames.reset(fresh.fences);
        assert_eq!(frames.image_count(), 3);
        frames.begin_image(0, |_| {}).unwrap();
        assert!(events.lock().is_empty());
    }
}
