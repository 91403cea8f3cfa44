//! RLC Timers
//!
//! Engines own one [`RlcTimer`] per protocol timer and only start, stop and
//! query it. Starting a timer posts a [`TimerRequest`] to the
//! [`TimerService`], which sleeps on the tokio runtime and posts a
//! [`TimerExpiry`] back to whoever owns the engine. The owner feeds the
//! expiry through the same locked entry point as PDU and SDU operations.
//!
//! Every start or stop draws a fresh generation from a process-wide counter,
//! so an expiry posted for an earlier start is recognised as stale and
//! ignored. This holds across entities too: a bearer removed and added again
//! on the same LCID never matches an expiry armed by its predecessor.

use common::Lcid;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

/// RLC protocol timers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerId {
    /// t-Reordering (UM and AM receive side)
    Reordering,
    /// t-PollRetransmit (AM transmit side)
    PollRetransmit,
    /// t-StatusProhibit (AM receive side)
    StatusProhibit,
}

/// Request to arm a timer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimerRequest {
    /// Owning logical channel
    pub lcid: Lcid,
    /// Which timer
    pub timer: TimerId,
    /// Generation the expiry must match
    pub generation: u64,
    /// Time until expiry
    pub duration: Duration,
}

/// Expiry notification posted by the timer service
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerExpiry {
    /// Owning logical channel
    pub lcid: Lcid,
    /// Which timer
    pub timer: TimerId,
    /// Generation at the time the timer was started
    pub generation: u64,
}

static NEXT_GENERATION: AtomicU64 = AtomicU64::new(1);

fn next_generation() -> u64 {
    NEXT_GENERATION.fetch_add(1, Ordering::Relaxed)
}

/// Sender side of the timer request queue
pub type TimerSender = mpsc::UnboundedSender<TimerRequest>;

/// Single-shot timer handle owned by an engine
#[derive(Debug)]
pub struct RlcTimer {
    lcid: Lcid,
    id: TimerId,
    duration: Duration,
    running: bool,
    generation: u64,
    requests: Option<TimerSender>,
}

impl RlcTimer {
    /// Create a stopped timer with zero duration
    pub fn new(lcid: Lcid, id: TimerId) -> Self {
        Self {
            lcid,
            id,
            duration: Duration::ZERO,
            running: false,
            generation: next_generation(),
            requests: None,
        }
    }

    /// Route start requests to a timer service
    pub fn attach(&mut self, requests: TimerSender) {
        self.requests = Some(requests);
    }

    /// Set the duration used by subsequent starts
    pub fn set_duration(&mut self, duration: Duration) {
        self.duration = duration;
    }

    /// Configured duration
    pub fn duration(&self) -> Duration {
        self.duration
    }

    /// Whether the timer is armed
    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Current generation
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Arm the timer, restarting it if already running
    pub fn start(&mut self) {
        self.generation = next_generation();
        self.running = true;
        trace!("{} {:?} started for {:?} (generation {})", self.lcid, self.id, self.duration, self.generation);

        if let Some(requests) = &self.requests {
            let request = TimerRequest {
                lcid: self.lcid,
                timer: self.id,
                generation: self.generation,
                duration: self.duration,
            };
            if requests.send(request).is_err() {
                warn!("{} timer service gone, {:?} will not fire", self.lcid, self.id);
            }
        }
    }

    /// Disarm the timer
    pub fn stop(&mut self) {
        if self.running {
            trace!("{} {:?} stopped", self.lcid, self.id);
        }
        self.running = false;
        self.generation = next_generation();
    }

    /// Consume an expiry. Returns true only if it belongs to the current run.
    pub fn expire(&mut self, generation: u64) -> bool {
        if self.running && generation == self.generation {
            self.running = false;
            true
        } else {
            debug!("{} ignoring stale {:?} expiry (generation {}, current {})",
                   self.lcid, self.id, generation, self.generation);
            false
        }
    }
}

/// Tokio-backed timer service
pub struct TimerService {
    requests: mpsc::UnboundedReceiver<TimerRequest>,
    expiries: mpsc::UnboundedSender<TimerExpiry>,
}

impl TimerService {
    /// Create a service posting expiries into `expiries`, returning the
    /// sender engines use to arm timers
    pub fn new(expiries: mpsc::UnboundedSender<TimerExpiry>) -> (Self, TimerSender) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { requests: rx, expiries }, tx)
    }

    /// Serve timer requests until every request sender is dropped
    pub async fn run(mut self) {
        debug!("Timer service started");
        while let Some(request) = self.requests.recv().await {
            let expiries = self.expiries.clone();
            tokio::spawn(async move {
                tokio::time::sleep(request.duration).await;
                let expiry = TimerExpiry {
                    lcid: request.lcid,
                    timer: request.timer,
                    generation: request.generation,
                };
                // Receiver gone means the stack is shutting down
                let _ = expiries.send(expiry);
            });
        }
        debug!("Timer service stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stale_generation_ignored() {
        let mut timer = RlcTimer::new(Lcid(3), TimerId::Reordering);
        timer.start();
        let first = timer.generation();
        timer.start();
        assert!(!timer.expire(first));
        assert!(timer.is_running());
        assert!(timer.expire(timer.generation()));
        assert!(!timer.is_running());
    }

    #[test]
    fn test_stopped_timer_does_not_expire() {
        let mut timer = RlcTimer::new(Lcid(3), TimerId::PollRetransmit);
        timer.start();
        let generation = timer.generation();
        timer.stop();
        assert!(!timer.expire(generation));
    }

    #[test]
    fn test_generations_unique_across_timers() {
        let mut old = RlcTimer::new(Lcid(3), TimerId::Reordering);
        old.start();
        let stale = old.generation();

        let mut new = RlcTimer::new(Lcid(3), TimerId::Reordering);
        new.start();
        assert_ne!(new.generation(), stale);
        assert!(!new.expire(stale));
        assert!(new.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_service_posts_expiry() {
        let (expiry_tx, mut expiry_rx) = mpsc::unbounded_channel();
        let (service, requests) = TimerService::new(expiry_tx);
        tokio::spawn(service.run());

        let mut timer = RlcTimer::new(Lcid(1), TimerId::StatusProhibit);
        timer.attach(requests);
        timer.set_duration(Duration::from_millis(35));
        timer.start();

        let expiry = expiry_rx.recv().await.unwrap();
        assert_eq!(expiry.timer, TimerId::StatusProhibit);
        assert_eq!(expiry.lcid, Lcid(1));
        assert!(timer.expire(expiry.generation));
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_leaves_only_latest_expiry_valid() {
        let (expiry_tx, mut expiry_rx) = mpsc::unbounded_channel();
        let (service, requests) = TimerService::new(expiry_tx);
        tokio::spawn(service.run());

        let mut timer = RlcTimer::new(Lcid(4), TimerId::Reordering);
        timer.attach(requests);
        timer.set_duration(Duration::from_millis(50));
        timer.start();
        tokio::time::sleep(Duration::from_millis(20)).await;
        timer.start();

        let first = expiry_rx.recv().await.unwrap();
        assert!(!timer.expire(first.generation));
        let second = expiry_rx.recv().await.unwrap();
        assert!(timer.expire(second.generation));
    }
}
