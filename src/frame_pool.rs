use alloc::collections::VecDeque;
use core::{cell::RefCell, marker::PhantomData};

use embassy_sync::blocking_mutex;

use crate::DefaultRawMutex;

/// The shared pool, that frames are handed back to once a station lets go of them.
///
/// Stations drop frames in a few places: when a stale or duplicate frame is rejected by a
/// reorder controller, and when the queues of a station are drained during release. In all of
/// these cases the frame is passed to [FramePool::recycle] instead of just being dropped.
pub trait FramePool {
    /// The frame type managed by this pool.
    type Frame;
    /// Return a frame to the pool.
    fn recycle(&self, frame: Self::Frame);
}
impl<P: FramePool> FramePool for &P {
    type Frame = P::Frame;
    fn recycle(&self, frame: Self::Frame) {
        (**self).recycle(frame)
    }
}

/// A [FramePool], that just drops the frames.
///
/// This is useful, if the frame type already returns itself to where it came from when it is
/// dropped.
pub struct DropFrames<F>(PhantomData<fn(F)>);
impl<F> DropFrames<F> {
    pub const fn new() -> Self {
        Self(PhantomData)
    }
}
impl<F> Default for DropFrames<F> {
    fn default() -> Self {
        Self::new()
    }
}
impl<F> FramePool for DropFrames<F> {
    type Frame = F;
    fn recycle(&self, frame: Self::Frame) {
        drop(frame);
    }
}

/// A free list of preallocated frames.
///
/// Frames are taken from the front and recycled to the back, so buffers are reused in a round
/// robin fashion.
pub struct FreeFrameQueue<F> {
    free: blocking_mutex::Mutex<DefaultRawMutex, RefCell<VecDeque<F>>>,
}
impl<F> FreeFrameQueue<F> {
    /// Create an empty queue.
    pub const fn new() -> Self {
        Self {
            free: blocking_mutex::Mutex::new(RefCell::new(VecDeque::new())),
        }
    }
    /// Create a queue, which is already populated with the frames.
    pub fn with_frames(frames: impl IntoIterator<Item = F>) -> Self {
        Self {
            free: blocking_mutex::Mutex::new(RefCell::new(frames.into_iter().collect())),
        }
    }
    /// Take the first free frame out of the queue.
    pub fn take_first(&self) -> Option<F> {
        self.free.lock(|free| free.borrow_mut().pop_front())
    }
    /// The number of frames currently in the queue.
    pub fn len(&self) -> usize {
        self.free.lock(|free| free.borrow().len())
    }
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
    /// Drop all frames in the queue.
    pub fn clear(&self) {
        self.free.lock(|free| free.borrow_mut().clear());
    }
}
impl<F> Default for FreeFrameQueue<F> {
    fn default() -> Self {
        Self::new()
    }
}
impl<F> FramePool for FreeFrameQueue<F> {
    type Frame = F;
    fn recycle(&self, frame: Self::Frame) {
        self.free.lock(|free| free.borrow_mut().push_back(frame));
        trace!("Returned frame to the free queue.");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frames_are_reused_round_robin() {
        let queue = FreeFrameQueue::with_frames([1u8, 2, 3]);
        assert_eq!(queue.len(), 3);
        let first = queue.take_first().unwrap();
        assert_eq!(first, 1);
        queue.recycle(first);
        assert_eq!(queue.take_first(), Some(2));
        assert_eq!(queue.take_first(), Some(3));
        assert_eq!(queue.take_first(), Some(1));
        assert!(queue.is_empty());
    }

    #[test]
    fn recycle_through_reference() {
        let queue = FreeFrameQueue::new();
        let by_ref = &queue;
        by_ref.recycle(7u32);
        assert_eq!(queue.len(), 1);
        queue.clear();
        assert!(queue.is_empty());
    }
}
