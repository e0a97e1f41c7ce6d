//! Receive reordering for BlockAck sessions.
//!
//! Every station has one [ReorderController] per traffic identifier. While a BlockAck session is
//! active, frames may arrive out of order inside the negotiated window. The controller buffers
//! them sorted by sequence number and releases them as soon as the gap in front of them has been
//! closed. If the gap is never closed, the expiry timer forces the window forward, so the latency
//! added by reordering stays bounded.
//!
//! Sequence numbers are 12 bits wide and compared modulo 4096.

use alloc::collections::VecDeque;

use embassy_time::{Duration, Instant};

use crate::frame_pool::FramePool;

/// The number of traffic identifiers and therefore reorder controllers per station.
pub const TID_COUNT: usize = 16;
/// Mask for the 12 bit sequence number space.
pub const SEQ_MASK: u16 = 0xfff;
/// Marker for an expected sequence number, that hasn't been established yet.
pub const SEQ_UNSET: u16 = 0xffff;
/// The largest BlockAck window.
pub const MAX_WINDOW_SIZE: u16 = 64;
/// How long a frame may sit in the buffer, before the window is forced forward.
pub const DEFAULT_REORDER_TIMEOUT: Duration = Duration::from_millis(50);

/// A traffic identifier.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Tid(u8);
impl Tid {
    /// Create a new TID, if it's in range.
    pub const fn new(tid: u8) -> Option<Self> {
        if (tid as usize) < TID_COUNT {
            Some(Self(tid))
        } else {
            None
        }
    }
    pub const fn into_bits(self) -> u8 {
        self.0
    }
    pub const fn index(self) -> usize {
        self.0 as usize
    }
    /// Iterate over all TIDs.
    pub fn all() -> impl Iterator<Item = Tid> {
        (0..TID_COUNT as u8).map(Tid)
    }
}

/// Check if `a` comes before `b` in the sequence number space.
#[inline]
pub const fn seq_less(a: u16, b: u16) -> bool {
    a.wrapping_sub(b) & 0x800 != 0
}

/// The state of a [ReorderController].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ReorderState {
    /// No BlockAck session. Frames pass straight through.
    Disabled,
    /// A window is active and frames may be buffered.
    Armed,
}

/// Why a frame was not accepted by the controller.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum RejectReason {
    /// The sequence number lies before the start of the window.
    Stale,
    /// A frame with that sequence number is already buffered.
    Duplicate,
}

/// A frame, that was rejected by [ReorderController::submit].
#[derive(Debug)]
pub struct Rejected<F> {
    pub frame: F,
    pub reason: RejectReason,
}

/// Reordering state for one traffic identifier of one station.
pub struct ReorderController<F> {
    enabled: bool,
    /// The next sequence number to be indicated to the upper layer.
    indicate_seq: u16,
    /// The last sequence number inside the window.
    window_end: u16,
    window_size: u16,
    /// Buffered frames, sorted by sequence number.
    pending: VecDeque<(u16, F)>,
    deadline: Option<Instant>,
    timeout: Duration,
    /// The generation of the station, that currently owns this controller.
    owner: Option<u32>,
}
impl<F> ReorderController<F> {
    pub const fn new(timeout: Duration) -> Self {
        Self {
            enabled: false,
            indicate_seq: SEQ_UNSET,
            window_end: SEQ_UNSET,
            window_size: MAX_WINDOW_SIZE,
            pending: VecDeque::new(),
            deadline: None,
            timeout,
            owner: None,
        }
    }
    pub fn state(&self) -> ReorderState {
        if self.enabled {
            ReorderState::Armed
        } else {
            ReorderState::Disabled
        }
    }
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }
    /// The next expected sequence number, if one was established yet.
    pub fn expected_seq(&self) -> Option<u16> {
        (self.indicate_seq != SEQ_UNSET).then_some(self.indicate_seq)
    }
    /// The last sequence number inside the window, if one was established yet.
    pub fn window_end(&self) -> Option<u16> {
        (self.window_end != SEQ_UNSET).then_some(self.window_end)
    }
    pub fn window_size(&self) -> u16 {
        self.window_size
    }
    /// The number of frames currently buffered.
    pub fn buffered(&self) -> usize {
        self.pending.len()
    }
    pub fn timer_armed(&self) -> bool {
        self.deadline.is_some()
    }
    /// The instant at which the expiry timer fires.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }
    pub(crate) fn owner(&self) -> Option<u32> {
        self.owner
    }
    pub(crate) fn claim(&mut self, generation: u32) {
        self.owner = Some(generation);
    }
    /// Start or stop a BlockAck session.
    ///
    /// Starting a session resets the window, so the next frame establishes the base. If frames
    /// are still buffered from a previous session, the window keeps its start and only its size
    /// changes. Stopping a session releases everything, that's still buffered, in sequence order,
    /// so the returned iterator should be consumed completely.
    pub fn set_session(
        &mut self,
        enabled: bool,
        window_size: u16,
        now: Instant,
    ) -> InOrder<'_, F> {
        debug_assert!((1..=MAX_WINDOW_SIZE).contains(&window_size));
        if enabled {
            if self.pending.is_empty() {
                self.indicate_seq = SEQ_UNSET;
                self.window_end = SEQ_UNSET;
            }
            self.window_size = window_size;
            if self.indicate_seq != SEQ_UNSET {
                self.window_end = self.indicate_seq.wrapping_add(window_size - 1) & SEQ_MASK;
            }
        }
        self.enabled = enabled;
        InOrder::new(self, None, now, !enabled)
    }
    /// Submit a received frame.
    ///
    /// The returned iterator yields the frames, that can now be indicated in order. Frames that
    /// aren't consumed stay at the front of the buffer, and are returned on the next call.
    pub fn submit(
        &mut self,
        frame: F,
        seq: u16,
        now: Instant,
    ) -> Result<InOrder<'_, F>, Rejected<F>> {
        let seq = seq & SEQ_MASK;
        if !self.enabled {
            return Ok(InOrder::new(self, Some(frame), now, false));
        }
        if self.indicate_seq == SEQ_UNSET {
            self.indicate_seq = seq;
        }
        if seq_less(seq, self.indicate_seq) {
            return Err(Rejected {
                frame,
                reason: RejectReason::Stale,
            });
        }
        let window_end = self.indicate_seq.wrapping_add(self.window_size - 1) & SEQ_MASK;
        if seq == self.indicate_seq {
            self.indicate_seq = self.indicate_seq.wrapping_add(1) & SEQ_MASK;
        } else if seq_less(window_end, seq) {
            // The frame lies beyond the window, so we slide it forward, until the frame is the
            // last one in it.
            self.indicate_seq = seq.wrapping_add(1).wrapping_sub(self.window_size) & SEQ_MASK;
        }
        self.window_end = self.indicate_seq.wrapping_add(self.window_size - 1) & SEQ_MASK;

        let mut position = self.pending.len();
        for (i, (buffered_seq, _)) in self.pending.iter().enumerate() {
            if *buffered_seq == seq {
                return Err(Rejected {
                    frame,
                    reason: RejectReason::Duplicate,
                });
            }
            if seq_less(seq, *buffered_seq) {
                position = i;
                break;
            }
        }
        self.pending.insert(position, (seq, frame));
        Ok(InOrder::new(self, None, now, false))
    }
    /// Fire the expiry timer, if it is due.
    ///
    /// The window is forced forward to the lowest buffered sequence number and the in order run
    /// starting there is released.
    pub fn expire(&mut self, now: Instant) -> Option<InOrder<'_, F>> {
        match self.deadline {
            Some(deadline) if deadline <= now => {}
            _ => return None,
        }
        self.deadline = None;
        let lowest = self.pending.front()?.0;
        trace!(
            "Reorder timer expired, forcing window from {} to {}.",
            self.indicate_seq,
            lowest
        );
        self.indicate_seq = lowest;
        self.window_end = self.indicate_seq.wrapping_add(self.window_size - 1) & SEQ_MASK;
        Some(InOrder::new(self, None, now, false))
    }
    /// Cancel the timer, drop all buffered frames and clear the window.
    pub fn reset(&mut self, frame_pool: &impl FramePool<Frame = F>) {
        self.deadline = None;
        for (_, frame) in self.pending.drain(..) {
            frame_pool.recycle(frame);
        }
        self.enabled = false;
        self.indicate_seq = SEQ_UNSET;
        self.window_end = SEQ_UNSET;
        self.window_size = MAX_WINDOW_SIZE;
        self.owner = None;
    }
    /// Arm or cancel the timer, depending on whether frames are still buffered.
    fn settle(&mut self, now: Instant) {
        if self.pending.is_empty() {
            self.deadline = None;
        } else if self.deadline.is_none() {
            self.deadline = Some(now + self.timeout);
        }
    }
}

/// Frames released by a [ReorderController] in sequence order.
///
/// Once this is dropped, the expiry timer of the controller is armed if frames remain buffered,
/// and cancelled otherwise.
pub struct InOrder<'a, F> {
    controller: &'a mut ReorderController<F>,
    passthrough: Option<F>,
    now: Instant,
    drain_all: bool,
}
impl<'a, F> InOrder<'a, F> {
    fn new(
        controller: &'a mut ReorderController<F>,
        passthrough: Option<F>,
        now: Instant,
        drain_all: bool,
    ) -> Self {
        Self {
            controller,
            passthrough,
            now,
            drain_all,
        }
    }
}
impl<F> Iterator for InOrder<'_, F> {
    type Item = F;
    fn next(&mut self) -> Option<F> {
        if let Some(frame) = self.passthrough.take() {
            return Some(frame);
        }
        let controller = &mut *self.controller;
        let (seq, _) = controller.pending.front()?;
        let seq = *seq;
        if self.drain_all {
            controller.indicate_seq = seq;
        } else if seq_less(controller.indicate_seq, seq) {
            return None;
        }
        if seq == controller.indicate_seq {
            controller.indicate_seq = controller.indicate_seq.wrapping_add(1) & SEQ_MASK;
        }
        controller.pending.pop_front().map(|(_, frame)| frame)
    }
}
impl<F> Drop for InOrder<'_, F> {
    fn drop(&mut self) {
        if self.drain_all {
            self.controller.deadline = None;
        } else {
            self.controller.settle(self.now);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame_pool::FreeFrameQueue;
    use alloc::vec::Vec;

    const TIMEOUT: Duration = DEFAULT_REORDER_TIMEOUT;

    fn at(ms: u64) -> Instant {
        Instant::from_millis(ms)
    }
    fn armed() -> ReorderController<u16> {
        let mut controller = ReorderController::new(TIMEOUT);
        assert_eq!(controller.set_session(true, 64, at(0)).count(), 0);
        controller
    }
    fn submit(controller: &mut ReorderController<u16>, seq: u16, now: Instant) -> Vec<u16> {
        controller
            .submit(seq, seq, now)
            .map(|in_order| in_order.collect())
            .unwrap_or_default()
    }
    /// Heap's algorithm, so we don't need a random number generator.
    fn permutations(items: &mut [u16], k: usize, out: &mut Vec<Vec<u16>>) {
        if k == 1 {
            out.push(items.to_vec());
            return;
        }
        permutations(items, k - 1, out);
        for i in 0..k - 1 {
            if k % 2 == 0 {
                items.swap(i, k - 1);
            } else {
                items.swap(0, k - 1);
            }
            permutations(items, k - 1, out);
        }
    }

    #[test]
    fn disabled_passes_through() {
        let mut controller = ReorderController::new(TIMEOUT);
        assert_eq!(controller.state(), ReorderState::Disabled);
        for seq in [7, 3, 3, 100] {
            assert_eq!(submit(&mut controller, seq, at(0)), [seq]);
        }
        assert_eq!(controller.buffered(), 0);
        assert!(!controller.timer_armed());
    }

    #[test]
    fn first_frame_establishes_base() {
        let mut controller = armed();
        assert_eq!(controller.expected_seq(), None);
        assert_eq!(submit(&mut controller, 0, at(0)), [0]);
        assert_eq!(controller.expected_seq(), Some(1));
        assert_eq!(controller.window_end(), Some(64));

        let mut controller = armed();
        assert_eq!(submit(&mut controller, 1234, at(0)), [1234]);
        assert_eq!(controller.expected_seq(), Some(1235));
    }

    #[test]
    fn every_permutation_is_released_in_order() {
        let base = 200;
        let mut items: Vec<u16> = (base..base + 5).collect();
        let mut all = Vec::new();
        permutations(&mut items, 5, &mut all);
        assert_eq!(all.len(), 120);
        for permutation in all {
            let mut controller = armed();
            // Establish the window right in front of the permutation.
            assert_eq!(submit(&mut controller, base - 1, at(0)), [base - 1]);
            let mut released = Vec::new();
            for seq in &permutation {
                released.extend(submit(&mut controller, *seq, at(1)));
            }
            assert_eq!(released, (base..base + 5).collect::<Vec<_>>(), "{permutation:?}");
            assert_eq!(controller.buffered(), 0);
            assert!(!controller.timer_armed());
            assert_eq!(controller.expected_seq(), Some(base + 5));
        }
    }

    #[test]
    fn permutation_across_wraparound() {
        let mut controller = armed();
        assert_eq!(submit(&mut controller, 4093, at(0)), [4093]);
        let mut released = Vec::new();
        for seq in [1, 4095, 0, 4094] {
            released.extend(submit(&mut controller, seq, at(1)));
        }
        assert_eq!(released, [4094, 4095, 0, 1]);
        assert_eq!(controller.expected_seq(), Some(2));
    }

    #[test]
    fn already_indicated_frames_are_stale() {
        let mut controller = armed();
        assert_eq!(submit(&mut controller, 10, at(0)), [10]);
        assert_eq!(submit(&mut controller, 11, at(0)), [11]);
        let rejected = controller.submit(10, 10, at(0)).err().unwrap();
        assert_eq!(rejected.reason, RejectReason::Stale);
        assert_eq!(rejected.frame, 10);
        assert_eq!(controller.expected_seq(), Some(12));
    }

    #[test]
    fn buffered_duplicates_are_rejected() {
        let mut controller = armed();
        assert_eq!(submit(&mut controller, 10, at(0)), [10]);
        assert!(submit(&mut controller, 13, at(0)).is_empty());
        let rejected = controller.submit(13, 13, at(0)).err().unwrap();
        assert_eq!(rejected.reason, RejectReason::Duplicate);
        assert_eq!(controller.buffered(), 1);
    }

    #[test]
    fn timer_forces_progress() {
        let base = 500;
        let mut controller = armed();
        assert_eq!(submit(&mut controller, base - 1, at(0)), [base - 1]);
        assert!(submit(&mut controller, base + 2, at(10)).is_empty());
        assert!(submit(&mut controller, base + 3, at(20)).is_empty());
        assert_eq!(controller.buffered(), 2);
        // The timer was started by the first buffered frame and isn't pushed out by later ones.
        assert_eq!(controller.deadline(), Some(at(10) + TIMEOUT));

        assert!(controller.expire(at(59)).is_none());
        let released: Vec<_> = controller.expire(at(60)).unwrap().collect();
        assert_eq!(released, [base + 2, base + 3]);
        assert_eq!(controller.expected_seq(), Some(base + 4));
        assert!(!controller.timer_armed());

        // The late frames are now stale.
        let rejected = controller.submit(base, base, at(61)).err().unwrap();
        assert_eq!(rejected.reason, RejectReason::Stale);
    }

    #[test]
    fn timer_rearms_while_frames_remain() {
        let mut controller = armed();
        assert_eq!(submit(&mut controller, 0, at(0)), [0]);
        assert!(submit(&mut controller, 2, at(0)).is_empty());
        assert!(submit(&mut controller, 5, at(0)).is_empty());

        let released: Vec<_> = controller.expire(at(50)).unwrap().collect();
        assert_eq!(released, [2]);
        assert_eq!(controller.buffered(), 1);
        assert_eq!(controller.deadline(), Some(at(50) + TIMEOUT));

        let released: Vec<_> = controller.expire(at(100)).unwrap().collect();
        assert_eq!(released, [5]);
        assert!(!controller.timer_armed());
        assert_eq!(controller.expected_seq(), Some(6));
    }

    #[test]
    fn closing_the_gap_cancels_the_timer() {
        let mut controller = armed();
        assert_eq!(submit(&mut controller, 0, at(0)), [0]);
        assert!(submit(&mut controller, 2, at(0)).is_empty());
        assert!(controller.timer_armed());
        assert_eq!(submit(&mut controller, 1, at(1)), [1, 2]);
        assert!(!controller.timer_armed());
        assert!(controller.expire(at(1000)).is_none());
    }

    #[test]
    fn frames_beyond_the_window_slide_it() {
        let mut controller = armed();
        assert_eq!(submit(&mut controller, 0, at(0)), [0]);
        assert!(submit(&mut controller, 3, at(0)).is_empty());
        // 100 is outside of [1, 64], so the window moves to [37, 100] and 3 is released.
        assert_eq!(submit(&mut controller, 100, at(0)), [3]);
        assert_eq!(controller.expected_seq(), Some(37));
        assert_eq!(controller.window_end(), Some(100));
        assert_eq!(controller.buffered(), 1);
    }

    #[test]
    fn unconsumed_frames_are_released_later() {
        let mut controller = armed();
        assert_eq!(submit(&mut controller, 0, at(0)), [0]);
        assert!(submit(&mut controller, 2, at(0)).is_empty());
        {
            let mut in_order = controller.submit(1, 1, at(0)).ok().unwrap();
            assert_eq!(in_order.next(), Some(1));
        }
        assert!(controller.timer_armed());
        assert_eq!(submit(&mut controller, 3, at(0)), [2, 3]);
    }

    #[test]
    fn stopping_the_session_flushes_everything() {
        let mut controller = armed();
        assert_eq!(submit(&mut controller, 0, at(0)), [0]);
        assert!(submit(&mut controller, 5, at(0)).is_empty());
        assert!(submit(&mut controller, 3, at(0)).is_empty());
        let released: Vec<_> = controller.set_session(false, 64, at(1)).collect();
        assert_eq!(released, [3, 5]);
        assert_eq!(controller.state(), ReorderState::Disabled);
        assert!(!controller.timer_armed());
    }

    #[test]
    fn renegotiating_the_window_keeps_its_start() {
        let mut controller = armed();
        assert_eq!(submit(&mut controller, 0, at(0)), [0]);
        assert!(submit(&mut controller, 5, at(0)).is_empty());
        assert_eq!(controller.window_end(), Some(64));

        assert_eq!(controller.set_session(true, 16, at(1)).count(), 0);
        assert_eq!(controller.window_size(), 16);
        assert_eq!(controller.expected_seq(), Some(1));
        assert_eq!(controller.window_end(), Some(16));
        assert_eq!(controller.buffered(), 1);

        // The smaller window slides sooner.
        assert_eq!(submit(&mut controller, 30, at(2)), [5]);
        assert_eq!(controller.expected_seq(), Some(15));
        assert_eq!(controller.window_end(), Some(30));
    }

    #[test]
    fn reset_recycles_buffered_frames() {
        let frame_pool = FreeFrameQueue::new();
        let mut controller = armed();
        controller.claim(3);
        assert_eq!(submit(&mut controller, 0, at(0)), [0]);
        assert!(submit(&mut controller, 2, at(0)).is_empty());
        assert!(submit(&mut controller, 4, at(0)).is_empty());
        controller.reset(&frame_pool);
        assert_eq!(frame_pool.len(), 2);
        assert_eq!(controller.buffered(), 0);
        assert!(!controller.timer_armed());
        assert_eq!(controller.expected_seq(), None);
        assert_eq!(controller.owner(), None);
        assert_eq!(controller.state(), ReorderState::Disabled);
    }

    #[test]
    fn tid_range() {
        assert!(Tid::new(15).is_some());
        assert!(Tid::new(16).is_none());
        assert_eq!(Tid::all().count(), TID_COUNT);
    }
}
