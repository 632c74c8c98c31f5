//! Timer/timeout utility implemented using `tokio::time::Sleep`.

use std::pin::Pin;

use crate::utils::FedError;

use tokio::time::{self, Duration, Instant, Sleep};

/// Timer utility for signalling after a given timeout. Supports restarting
/// with a different duration, e.g. for idle-connection detection where every
/// received frame pushes the deadline further away.
///
/// Must be used within the context of a tokio runtime.
#[derive(Debug)]
pub struct Timer {
    /// Inner `tokio::time::Sleep` future, wrapped in a pinned box to support
    /// await multiple times.
    sleep: Pin<Box<Sleep>>,

    /// Timeout duration used by the last kick-off.
    last_dur: Duration,
}

impl Timer {
    /// Creates a new timer that times out after the given duration.
    pub fn new(dur: Duration) -> Self {
        Timer {
            sleep: Box::pin(time::sleep(dur)),
            last_dur: dur,
        }
    }

    /// Get the last timeout duration used.
    pub fn get_dur(&self) -> Duration {
        self.last_dur
    }

    /// Restarts the timer with the given duration.
    pub fn restart(&mut self, dur: Duration) -> Result<(), FedError> {
        if dur.is_zero() {
            return Err(FedError::msg(format!(
                "invalid timeout duration {} ns",
                dur.as_nanos()
            )));
        }

        self.last_dur = dur;
        self.sleep.as_mut().reset(Instant::now() + dur);
        Ok(())
    }

    /// Restarts the timer with the last used duration.
    pub fn rearm(&mut self) {
        let dur = self.last_dur;
        self.sleep.as_mut().reset(Instant::now() + dur);
    }

    /// Waits for the timer to timeout. Typically, this should be used as a
    /// branch of a `tokio::select!`.
    pub async fn timeout(&mut self) {
        self.sleep.as_mut().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn timer_restart() -> Result<(), FedError> {
        let mut timer = Timer::new(Duration::from_millis(50));
        assert_eq!(timer.get_dur(), Duration::from_millis(50));
        // round 1 with 200ms timeout
        let mut start = Instant::now();
        timer.restart(Duration::from_millis(200))?;
        timer.timeout().await;
        let mut finish = Instant::now();
        assert!(finish.duration_since(start) >= Duration::from_millis(200));
        // round 2 rearmed with the same duration
        start = Instant::now();
        timer.rearm();
        timer.timeout().await;
        finish = Instant::now();
        assert!(finish.duration_since(start) >= Duration::from_millis(200));
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn timer_zero_restart() {
        let mut timer = Timer::new(Duration::from_millis(10));
        assert!(timer.restart(Duration::ZERO).is_err());
    }
}
