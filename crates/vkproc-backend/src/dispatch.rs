//! Command classification and thread assignment.

use vkproc_core::CommandKind;

/// Outcome of running one command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunCommandResult {
    Handled,
    /// Not a command this backend processes; the caller may handle it.
    Unhandled,
    Error,
}

/// Whether a command kind records draw calls.
pub const fn is_render_command(kind: CommandKind) -> bool {
    matches!(
        kind,
        CommandKind::Clear
            | CommandKind::Render
            | CommandKind::RenderTex3D
            | CommandKind::RenderTileLayer
            | CommandKind::RenderBorderTile
            | CommandKind::RenderQuadLayer
            | CommandKind::RenderText
            | CommandKind::RenderQuadContainer
            | CommandKind::RenderQuadContainerEx
            | CommandKind::RenderQuadContainerAsSpriteMultiple
    )
}

/// Where a command is recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Assignment {
    /// 0 is the main thread.
    pub thread_index: usize,
    /// Worker whose slice is complete and may start recording.
    pub wake: Option<usize>,
}

/// Splits a batch of commands into contiguous slices, one per worker.
///
/// Command `p` of a batch of `n` belongs to slice `p * workers / n`, so
/// slices never interleave and concatenating worker buffers in ascending
/// order preserves submission order. Non-render commands stay on the main
/// thread. Once the last command of a batch has been seen every further
/// render command of the frame also goes to the main thread, because main
/// thread buffers are executed after all worker buffers.
#[derive(Debug, Clone)]
pub struct ThreadAssigner {
    workers: usize,
    command_count: usize,
    position: usize,
    slice: usize,
    main_only: bool,
}

impl ThreadAssigner {
    pub const fn new(workers: usize) -> Self {
        Self {
            workers,
            command_count: 0,
            position: 0,
            slice: 0,
            main_only: false,
        }
    }

    pub const fn workers(&self) -> usize {
        self.workers
    }

    /// Start a batch of `command_count` commands.
    pub fn start_batch(&mut self, command_count: usize) {
        self.command_count = command_count;
        self.position = 0;
    }

    /// Start a new frame: slices begin at the first worker again.
    pub fn reset_slices(&mut self) {
        self.slice = 0;
        self.main_only = false;
    }

    /// Assign the next command of the batch.
    pub fn next(&mut self, is_render: bool) -> Assignment {
        let position = self.position;
        self.position += 1;

        let main = Assignment {
            thread_index: 0,
            wake: None,
        };
        if self.command_count > 0 && position + 1 >= self.command_count {
            self.main_only = true;
        }
        if !is_render || self.workers == 0 || self.main_only || self.command_count == 0 {
            return main;
        }

        let slice = position * self.workers / self.command_count;
        let mut wake = None;
        if slice > self.slice {
            // The previous slice will receive nothing more.
            wake = Some(self.slice + 1);
            self.slice = slice;
        }
        Assignment {
            thread_index: self.slice + 1,
            wake,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assign(assigner: &mut ThreadAssigner, renders: &[bool]) -> Vec<Assignment> {
        assigner.start_batch(renders.len());
        renders.iter().map(|&r| assigner.next(r)).collect()
    }

    #[test]
    fn render_kinds_are_classified() {
        assert!(is_render_command(CommandKind::Clear));
        assert!(is_render_command(CommandKind::RenderQuadContainerAsSpriteMultiple));
        assert!(!is_render_command(CommandKind::Swap));
        assert!(!is_render_command(CommandKind::TextureCreate));
        assert_eq!(
            CommandKind::ALL
                .iter()
                .filter(|&&k| is_render_command(k))
                .count(),
            10
        );
    }

    #[test]
    fn single_threaded_keeps_everything_on_main() {
        let mut assigner = ThreadAssigner::new(0);
        let out = assign(&mut assigner, &[true, true, false, true]);
        assert!(out.iter().all(|a| a.thread_index == 0 && a.wake.is_none()));
    }

    #[test]
    fn batch_is_split_into_contiguous_slices() {
        // 10 commands, 3 workers, non-render commands at 2 and 6.
        let mut assigner = ThreadAssigner::new(3);
        let renders = [true, true, false, true, true, true, false, true, true, true];
        let out = assign(&mut assigner, &renders);

        let threads: Vec<usize> = out.iter().map(|a| a.thread_index).collect();
        assert_eq!(threads, vec![1, 1, 0, 1, 2, 2, 0, 3, 3, 0]);

        let wakes: Vec<(usize, usize)> = out
            .iter()
            .enumerate()
            .filter_map(|(p, a)| a.wake.map(|w| (p, w)))
            .collect();
        assert_eq!(wakes, vec![(4, 1), (7, 2)]);
    }

    #[test]
    fn later_batches_of_a_frame_stay_on_main() {
        let mut assigner = ThreadAssigner::new(2);
        assign(&mut assigner, &[true, true, true, true]);
        let second = assign(&mut assigner, &[true, true]);
        assert!(second.iter().all(|a| a.thread_index == 0));

        assigner.reset_slices();
        let next_frame = assign(&mut assigner, &[true, true, true, true]);
        assert_eq!(next_frame[0].thread_index, 1);
    }

    #[test]
    fn retried_command_keeps_its_batch_position() {
        let renders = [true; 8];
        let mut uninterrupted = ThreadAssigner::new(3);
        let expected: Vec<usize> = assign(&mut uninterrupted, &renders)
            .iter()
            .map(|a| a.thread_index)
            .collect();

        // Command 3 runs out of memory; frames are flushed and it is retried
        // with the assignment it already holds.
        let mut assigner = ThreadAssigner::new(3);
        assigner.start_batch(renders.len());
        let mut threads = Vec::new();
        for position in 0..renders.len() {
            let assignment = assigner.next(true);
            if position == 3 {
                assigner.reset_slices();
            }
            threads.push(assignment.thread_index);
        }
        assert_eq!(threads, expected);
        assert_eq!(threads.last(), Some(&0));
    }

    #[test]
    fn worker_order_never_goes_backwards() {
        let mut assigner = ThreadAssigner::new(5);
        let renders = vec![true; 37];
        let out = assign(&mut assigner, &renders);
        let workers: Vec<usize> = out
            .iter()
            .map(|a| a.thread_index)
            .filter(|&t| t != 0)
            .collect();
        assert!(workers.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(out.last().map(|a| a.thread_index), Some(0));
    }
}
