//! Frame-delayed cleanup lists.
//!
//! With one frame slot per swapchain image, a resource released while slot
//! `n` is being recorded may still be read by the GPU until slot `n`'s fence
//! signals. Released resources are therefore parked in the slot's list and
//! handed back only when the slot is cleaned up, after that fence wait.

/// One list of pending items per frame slot.
#[derive(Debug)]
pub struct FrameDelayed<T> {
    slots: Vec<Vec<T>>,
}

impl<T> Default for FrameDelayed<T> {
    fn default() -> Self {
        Self { slots: Vec::new() }
    }
}

impl<T> FrameDelayed<T> {
    pub fn new(frame_slots: usize) -> Self {
        Self {
            slots: (0..frame_slots).map(|_| Vec::new()).collect(),
        }
    }

    /// Park `item` until `frame_slot` is cleaned up.
    ///
    /// Out of range slots fall back to the last slot so nothing is lost.
    pub fn push(&mut self, frame_slot: usize, item: T) {
        let len = self.slots.len();
        if len == 0 {
            self.slots.push(Vec::new());
        }
        let slot = frame_slot.min(self.slots.len() - 1);
        self.slots[slot].push(item);
    }

    /// Take everything parked for `frame_slot`.
    pub fn take(&mut self, frame_slot: usize) -> Vec<T> {
        self.slots
            .get_mut(frame_slot)
            .map(std::mem::take)
            .unwrap_or_default()
    }

    /// Take everything from every slot.
    pub fn take_all(&mut self) -> Vec<T> {
        self.slots.iter_mut().flat_map(std::mem::take).collect()
    }

    /// Change the slot count. Pending items of removed slots move to the result.
    pub fn resize(&mut self, frame_slots: usize) -> Vec<T> {
        let spilled = if frame_slots < self.slots.len() {
            self.slots.drain(frame_slots..).flatten().collect()
        } else {
            Vec::new()
        };
        self.slots.resize_with(frame_slots, Vec::new);
        spilled
    }

    pub fn pending_count(&self, frame_slot: usize) -> usize {
        self.slots.get(frame_slot).map_or(0, Vec::len)
    }

    pub fn total_pending(&self) -> usize {
        self.slots.iter().map(Vec::len).sum()
    }

    pub fn frame_slots(&self) -> usize {
        self.slots.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn items_stay_in_their_slot() {
        let mut delayed = FrameDelayed::new(3);
        delayed.push(0, "a");
        delayed.push(2, "b");
        delayed.push(2, "c");

        assert!(delayed.take(1).is_empty());
        assert_eq!(delayed.take(2), vec!["b", "c"]);
        assert_eq!(delayed.pending_count(2), 0);
        assert_eq!(delayed.total_pending(), 1);
    }

    #[test]
    fn shrinking_spills_removed_slots() {
        let mut delayed = FrameDelayed::new(3);
        delayed.push(0, 1);
        delayed.push(2, 3);
        let spilled = delayed.resize(2);
        assert_eq!(spilled, vec![3]);
        assert_eq!(delayed.frame_slots(), 2);
        assert_eq!(delayed.take_all(), vec![1]);
    }

    #[test]
    fn out_of_range_push_lands_in_last_slot() {
        let mut delayed = FrameDelayed::new(2);
        delayed.push(7, 'x');
        assert_eq!(delayed.pending_count(1), 1);
    }
}
