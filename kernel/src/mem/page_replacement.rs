use super::frame_allocator::FrameId;
use alloc::collections::VecDeque;

/// Chooses which assigned frame gives up its page when the pool is full.
pub trait PageReplacementPolicy {
    /// `frame` now backs a user page and becomes a candidate for eviction.
    fn frame_assigned(&mut self, frame: FrameId);

    /// `frame` was freed and must no longer be offered as a victim.
    fn frame_released(&mut self, frame: FrameId);

    /// Removes and returns the next victim for which `evictable` holds, or
    /// `None` if there is no such frame.
    fn select_victim(&mut self, evictable: &dyn Fn(FrameId) -> bool) -> Option<FrameId>;
}

/// First in, first out: the frame assigned longest ago is evicted first.
#[derive(Default)]
pub struct Fifo {
    queue: VecDeque<FrameId>,
}

impl PageReplacementPolicy for Fifo {
    fn frame_assigned(&mut self, frame: FrameId) {
        debug_assert!(!self.queue.contains(&frame));
        self.queue.push_back(frame);
    }

    fn frame_released(&mut self, frame: FrameId) {
        self.queue.retain(|&f| f != frame);
    }

    fn select_victim(&mut self, evictable: &dyn Fn(FrameId) -> bool) -> Option<FrameId> {
        let position = self.queue.iter().position(|&frame| evictable(frame))?;
        self.queue.remove(position)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn oldest_first() {
        let mut fifo = Fifo::default();
        for i in [3, 1, 2] {
            fifo.frame_assigned(FrameId(i));
        }
        assert_eq!(fifo.select_victim(&|_| true), Some(FrameId(3)));
        assert_eq!(fifo.select_victim(&|_| true), Some(FrameId(1)));
        fifo.frame_assigned(FrameId(3));
        assert_eq!(fifo.select_victim(&|_| true), Some(FrameId(2)));
        assert_eq!(fifo.select_victim(&|_| true), Some(FrameId(3)));
        assert_eq!(fifo.select_victim(&|_| true), None);
    }

    #[test]
    fn skipped_frames_keep_their_place() {
        let mut fifo = Fifo::default();
        for i in 0..3 {
            fifo.frame_assigned(FrameId(i));
        }
        assert_eq!(fifo.select_victim(&|f| f != FrameId(0)), Some(FrameId(1)));
        assert_eq!(fifo.select_victim(&|_| true), Some(FrameId(0)));
    }

    #[test]
    fn released_frames_are_forgotten() {
        let mut fifo = Fifo::default();
        fifo.frame_assigned(FrameId(0));
        fifo.frame_assigned(FrameId(1));
        fifo.frame_released(FrameId(0));
        assert_eq!(fifo.select_victim(&|_| true), Some(FrameId(1)));
        assert_eq!(fifo.select_victim(&|_| true), None);
    }
}
