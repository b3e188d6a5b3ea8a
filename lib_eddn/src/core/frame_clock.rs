//! # Frame Clock
//!
//! Paces render flushes. The queue asks for "one callback on the next frame"
//! and never schedules more than one at a time; what a frame means is up to
//! the implementation. [`TickFrameClock`] runs callbacks on a fixed period
//! from the tokio runtime; [`ManualFrameClock`] holds them until a test
//! fires the frame by hand.

use std::sync::{Arc, Mutex};
use std::time::Duration;

/// A pending frame callback.
pub type FrameCallback = Box<dyn FnOnce() + Send>;

pub trait FrameClock: Send + Sync {
    /// Runs `callback` once, on the next frame.
    fn request_frame(&self, callback: FrameCallback);
}

/// Frame source backed by the tokio timer: each requested frame fires after
/// one period, on a spawned task.
pub struct TickFrameClock {
    period: Duration,
}

impl TickFrameClock {
    pub fn new(period: Duration) -> Self {
        Self { period }
    }

    /// Roughly display cadence, for terminal refresh.
    pub fn sixty_hz() -> Self {
        Self::new(Duration::from_millis(16))
    }
}

impl FrameClock for TickFrameClock {
    fn request_frame(&self, callback: FrameCallback) {
        let period = self.period;
        tokio::spawn(async move {
            tokio::time::sleep(period).await;
            callback();
        });
    }
}

/// Test clock: frames only happen when [`fire`](ManualFrameClock::fire) is
/// called, so a test controls exactly how many flushes run and when.
#[derive(Default)]
pub struct ManualFrameClock {
    pending: Arc<Mutex<Vec<FrameCallback>>>,
}

impl ManualFrameClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of callbacks waiting for a frame.
    pub fn pending(&self) -> usize {
        self.pending.lock().expect("FrameClock lock poisoned").len()
    }

    /// Runs every callback queued so far. Callbacks requested during the
    /// firing wait for the next frame.
    pub fn fire(&self) {
        let drained: Vec<FrameCallback> = {
            let mut pending = self.pending.lock().expect("FrameClock lock poisoned");
            std::mem::take(&mut *pending)
        };
        for callback in drained {
            callback();
        }
    }
}

impl FrameClock for ManualFrameClock {
    fn request_frame(&self, callback: FrameCallback) {
        self.pending
            .lock()
            .expect("FrameClock lock poisoned")
            .push(callback);
    }
}
