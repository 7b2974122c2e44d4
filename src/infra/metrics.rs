//! Lock-free link statistics
//!
//! Counters are bumped from the supervisor's hot path with Relaxed atomics and
//! read only for the periodic summary. They are statistics, not coordination.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::info;

pub struct LinkStats {
    notifications: AtomicU64,
    decode_failures: AtomicU64,
    quiet_polls: AtomicU64,
    link_losses: AtomicU64,
    reconnect_attempts: AtomicU64,
    sessions: AtomicU64,
    started_at: Instant,
}

impl Default for LinkStats {
    fn default() -> Self {
        Self::new()
    }
}

impl LinkStats {
    pub fn new() -> Self {
        Self {
            notifications: AtomicU64::new(0),
            decode_failures: AtomicU64::new(0),
            quiet_polls: AtomicU64::new(0),
            link_losses: AtomicU64::new(0),
            reconnect_attempts: AtomicU64::new(0),
            sessions: AtomicU64::new(0),
            started_at: Instant::now(),
        }
    }

    #[inline]
    pub fn record_notification(&self) {
        self.notifications.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_decode_failure(&self) {
        self.decode_failures.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_quiet_poll(&self) {
        self.quiet_polls.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_link_loss(&self) {
        self.link_losses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_reconnect_attempt(&self) {
        self.reconnect_attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_session(&self) {
        self.sessions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> LinkSummary {
        LinkSummary {
            notifications: self.notifications.load(Ordering::Relaxed),
            decode_failures: self.decode_failures.load(Ordering::Relaxed),
            quiet_polls: self.quiet_polls.load(Ordering::Relaxed),
            link_losses: self.link_losses.load(Ordering::Relaxed),
            reconnect_attempts: self.reconnect_attempts.load(Ordering::Relaxed),
            sessions: self.sessions.load(Ordering::Relaxed),
            uptime_secs: self.started_at.elapsed().as_secs(),
        }
    }
}

/// Point-in-time copy of [`LinkStats`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkSummary {
    pub notifications: u64,
    pub decode_failures: u64,
    pub quiet_polls: u64,
    pub link_losses: u64,
    pub reconnect_attempts: u64,
    pub sessions: u64,
    pub uptime_secs: u64,
}

impl LinkSummary {
    pub fn log(&self) {
        info!(
            notifications = %self.notifications,
            decode_failures = %self.decode_failures,
            quiet_polls = %self.quiet_polls,
            link_losses = %self.link_losses,
            reconnect_attempts = %self.reconnect_attempts,
            sessions = %self.sessions,
            uptime_secs = %self.uptime_secs,
            "link_summary"
        );
    }
}
