use core::{future::poll_fn, task::Poll};

use portable_atomic::{AtomicBool, Ordering};

use atomic_waker::AtomicWaker;

/// A coalescing wake-up signal for the reorder timer driver.
///
/// Any number of kicks before the driver gets to run again collapse into a single wake up,
/// since the driver recomputes the earliest deadline from scratch anyways.
pub struct TimerKick {
    waker: AtomicWaker,
    kicked: AtomicBool,
}
impl TimerKick {
    pub const fn new() -> Self {
        Self {
            waker: AtomicWaker::new(),
            kicked: AtomicBool::new(false),
        }
    }
    /// Signal, that a timer was armed.
    pub fn kick(&self) {
        self.kicked.store(true, Ordering::Release);
        self.waker.wake();
    }
    /// Forget any pending kick.
    pub fn reset(&self) {
        self.kicked.store(false, Ordering::Relaxed);
    }
    /// Check if a kick is pending, without consuming it.
    pub fn is_kicked(&self) -> bool {
        self.kicked.load(Ordering::Acquire)
    }
    /// Asynchronously wait for the next kick.
    pub async fn wait(&self) {
        poll_fn(|cx| {
            if self.kicked.swap(false, Ordering::Acquire) {
                return Poll::Ready(());
            }
            self.waker.register(cx.waker());
            // A kick may have raced the registration.
            if self.kicked.swap(false, Ordering::Acquire) {
                Poll::Ready(())
            } else {
                Poll::Pending
            }
        })
        .await
    }
}
impl Default for TimerKick {
    fn default() -> Self {
        Self::new()
    }
}
