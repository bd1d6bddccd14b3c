//! Resettable one-shot timers for the transport event loop.
//!
//! The hello and delayed-ack timers must sit in the event multiplexer
//! whether or not they are running. A disarmed timer pends forever so
//! its select branch simply never completes, keeping the loop uniform.

use std::future::pending;
use std::pin::Pin;
use std::time::Duration;

use tokio::time::{sleep, Instant, Sleep};

/// Placeholder deadline for a timer that has never been armed.
const IDLE_DEADLINE: Duration = Duration::from_secs(3600);

/// A one-shot timer that can be rearmed and stopped.
#[derive(Debug)]
pub(crate) struct EventTimer {
    sleep: Pin<Box<Sleep>>,
    armed: bool,
}

impl EventTimer {
    /// Create a stopped timer.
    pub(crate) fn new() -> Self {
        Self {
            sleep: Box::pin(sleep(IDLE_DEADLINE)),
            armed: false,
        }
    }

    /// Arm (or rearm) the timer to fire after `after`.
    pub(crate) fn reset(&mut self, after: Duration) {
        self.sleep.as_mut().reset(Instant::now() + after);
        self.armed = true;
    }

    /// Disarm the timer.
    pub(crate) fn stop(&mut self) {
        self.armed = false;
    }

    /// Wait for the timer to fire, disarming it on expiry.
    ///
    /// A disarmed timer never completes; cancelling the future (losing
    /// the select race) leaves the deadline and armed state untouched.
    pub(crate) async fn fired(&mut self) {
        if !self.armed {
            pending::<()>().await;
        }
        self.sleep.as_mut().await;
        self.armed = false;
    }
}
