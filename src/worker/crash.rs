use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use crate::config::CrashConfig;

/// Decides how long to wait before respawning after an abnormal exit.
///
/// Crashes closer together than `interval * (count + 1)` are counted; once
/// `count` of them accumulate the next respawn waits `delay` instead of
/// `interval` and the counter starts over.
#[derive(Debug)]
pub struct CrashGuard {
    config: CrashConfig,
    last_crash: Option<Instant>,
    events: u32,
    exiting: CancellationToken,
}

impl CrashGuard {
    pub fn new(config: CrashConfig, exiting: CancellationToken) -> Self {
        Self {
            config,
            last_crash: None,
            events: 0,
            exiting,
        }
    }

    /// Delay before the next respawn, or `None` once shutdown has begun.
    pub fn respawn_delay(&mut self) -> Option<Duration> {
        self.respawn_delay_at(Instant::now())
    }

    pub fn respawn_delay_at(&mut self, now: Instant) -> Option<Duration> {
        if self.exiting.is_cancelled() {
            return None;
        }

        let in_window = self
            .last_crash
            .map(|last| now.saturating_duration_since(last) < self.config.window())
            .unwrap_or(false);
        if in_window {
            self.events += 1;
        } else {
            self.events = 0;
        }
        self.last_crash = Some(now);

        if self.config.count > 0 && self.events >= self.config.count {
            tracing::warn!(
                delay_ms = self.config.delay_ms,
                crashes = self.events,
                "Crash loop detected, throttling respawn"
            );
            self.events = 0;
            return Some(self.config.delay());
        }
        Some(self.config.interval())
    }

    /// Crashes counted in the current window
    pub fn crash_events(&self) -> u32 {
        self.events
    }

    pub fn is_exiting(&self) -> bool {
        self.exiting.is_cancelled()
    }
}
