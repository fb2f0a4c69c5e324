//! Keep-alive ticker, active only while the session is connected.

use std::time::Duration;

use tokio::time::{Instant, Interval, MissedTickBehavior};

/// Periodic keep-alive emitter owned by the supervisor task.
///
/// The monitor does not send anything itself; the owner awaits
/// [`tick`](HeartbeatMonitor::tick) alongside its other work and sends the
/// keep-alive frame when it resolves.
#[derive(Debug)]
pub struct HeartbeatMonitor {
    period: Duration,
    ticker: Option<Interval>,
}

impl HeartbeatMonitor {
    pub fn new(period: Duration) -> Self {
        Self {
            period,
            ticker: None,
        }
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    /// Start ticking. Any previous ticker is discarded first, so the monitor
    /// never runs twice.
    pub fn start(&mut self) {
        let mut ticker = tokio::time::interval_at(Instant::now() + self.period, self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        self.ticker = Some(ticker);
    }

    pub fn stop(&mut self) {
        self.ticker = None;
    }

    pub fn is_active(&self) -> bool {
        self.ticker.is_some()
    }

    /// Resolve at the next keep-alive deadline. Pends forever while stopped.
    pub async fn tick(&mut self) {
        match self.ticker.as_mut() {
            Some(ticker) => {
                ticker.tick().await;
            }
            None => std::future::pending::<()>().await,
        }
    }
}
