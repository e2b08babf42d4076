//! Bounded reachability polling with exponential backoff.

use std::time::Duration;

use tokio::time::{sleep, Instant};
use tracing::debug;

use super::{Device, DeviceSession, DeviceTransport};
use crate::metrics;

/// Exponential delay sequence capped at `max`.
#[derive(Debug, Clone)]
pub struct Backoff {
    current: Duration,
    max: Duration,
    multiplier: f64,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration, multiplier: f64) -> Self {
        Self {
            current: initial.min(max),
            max,
            multiplier: multiplier.max(1.0),
        }
    }

    /// Return the current delay and advance to the next one.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = self.current.mul_f64(self.multiplier).min(self.max);
        delay
    }

    /// Sleep for the next step, never past `deadline`.
    /// Returns false once the deadline has been reached.
    pub async fn wait(&mut self, deadline: Instant) -> bool {
        let now = Instant::now();
        if now >= deadline {
            return false;
        }
        sleep(self.next_delay().min(deadline - now)).await;
        true
    }
}

/// Poll until the device answers the reachability probe or `deadline` passes.
pub async fn wait_until_reachable(
    transport: &dyn DeviceTransport,
    device: &Device,
    backoff: &mut Backoff,
    deadline: Instant,
) -> bool {
    loop {
        metrics::REACHABILITY_POLLS.inc();
        if transport.reachable(device).await {
            return true;
        }
        if !backoff.wait(deadline).await {
            return false;
        }
    }
}

/// Poll until a fresh session can be opened, or `deadline` passes.
pub async fn reconnect_until(
    transport: &dyn DeviceTransport,
    device: &Device,
    backoff: &mut Backoff,
    deadline: Instant,
) -> Option<DeviceSession> {
    loop {
        metrics::REACHABILITY_POLLS.inc();
        if transport.reachable(device).await {
            match transport.connect(device).await {
                Ok(session) => return Some(session),
                Err(e) => debug!(device_id = %device.id, "Reconnect attempt failed: {}", e),
            }
        }
        if !backoff.wait(deadline).await {
            return None;
        }
    }
}
