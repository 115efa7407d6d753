//! Periodic resource announcements
//!
//! A heartbeat re-announces one resource a little after half its TTL has
//! passed, so a single missed announce never lets the resource expire.
//! Between announces a shorter check regenerates the descriptor and announces
//! early if it changed.

use deskgate_proto::{Clock, Resource, ResourceError};
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::descriptor::DescriptorSource;
use crate::registry::{Announcer, RegistryError};

#[derive(Debug, Error)]
pub enum HeartbeatError {
    #[error("Invalid heartbeat configuration: {0}")]
    Config(String),

    #[error("Failed to build descriptor: {0}")]
    Descriptor(#[from] ResourceError),

    #[error("Directory error: {0}")]
    Registry(#[from] RegistryError),

    #[error("Invalid TTL: {0}")]
    Ttl(String),
}

/// Called after every announce attempt with its error, if any
pub type OnHeartbeat = Arc<dyn Fn(Option<&HeartbeatError>) + Send + Sync>;

/// What a heartbeat announces
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatMode {
    WindowsDesktopService,
    WindowsDesktop,
}

impl std::fmt::Display for HeartbeatMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HeartbeatMode::WindowsDesktopService => write!(f, "windows_desktop_service"),
            HeartbeatMode::WindowsDesktop => write!(f, "windows_desktop"),
        }
    }
}

pub struct HeartbeatConfig {
    pub mode: HeartbeatMode,
    pub source: Arc<dyn DescriptorSource>,
    pub announcer: Arc<dyn Announcer>,
    pub clock: Arc<dyn Clock>,
    pub announce_ttl: Duration,
    pub check_period: Duration,
    pub on_heartbeat: OnHeartbeat,
}

/// Announce period for a TTL: half the TTL plus up to a tenth of it as jitter
pub fn announce_period(ttl: Duration) -> Duration {
    let jitter_max = ttl / 10;
    let jitter = if jitter_max.is_zero() {
        Duration::ZERO
    } else {
        rand::thread_rng().gen_range(Duration::ZERO..jitter_max)
    };
    ttl / 2 + jitter
}

pub struct Heartbeat {
    mode: HeartbeatMode,
    source: Arc<dyn DescriptorSource>,
    announcer: Arc<dyn Announcer>,
    clock: Arc<dyn Clock>,
    ttl: chrono::Duration,
    announce_ttl: Duration,
    check_period: Duration,
    on_heartbeat: OnHeartbeat,
    last_announced: Option<Resource>,
    last_success: Option<chrono::DateTime<chrono::Utc>>,
}

impl Heartbeat {
    pub fn new(config: HeartbeatConfig) -> Result<Self, HeartbeatError> {
        if config.announce_ttl.is_zero() {
            return Err(HeartbeatError::Config("announce TTL must be positive".to_string()));
        }
        if config.check_period.is_zero() {
            return Err(HeartbeatError::Config("check period must be positive".to_string()));
        }
        let ttl = chrono::Duration::from_std(config.announce_ttl)
            .map_err(|e| HeartbeatError::Ttl(e.to_string()))?;

        Ok(Self {
            mode: config.mode,
            source: config.source,
            announcer: config.announcer,
            clock: config.clock,
            ttl,
            announce_ttl: config.announce_ttl,
            check_period: config.check_period,
            on_heartbeat: config.on_heartbeat,
            last_announced: None,
            last_success: None,
        })
    }

    pub fn mode(&self) -> HeartbeatMode {
        self.mode
    }

    /// Announce until `cancel` fires
    ///
    /// The first announce happens immediately. Failures are reported through
    /// the callback and retried on the next tick.
    pub async fn run(mut self, cancel: CancellationToken) {
        info!(mode = %self.mode, "Starting heartbeat");

        let mut next_announce = Instant::now();
        let mut check = tokio::time::interval_at(Instant::now() + self.check_period, self.check_period);
        check.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!(mode = %self.mode, "Heartbeat stopped");
                    return;
                }
                _ = tokio::time::sleep_until(next_announce) => {
                    self.announce().await;
                    next_announce = Instant::now() + announce_period(self.announce_ttl);
                }
                _ = check.tick() => {
                    if self.check().await {
                        self.announce().await;
                        next_announce = Instant::now() + announce_period(self.announce_ttl);
                    }
                }
            }
        }
    }

    async fn announce(&mut self) {
        let result = self.try_announce().await;
        if let Err(e) = &result {
            warn!(mode = %self.mode, "Heartbeat failed: {}", e);
        }
        (self.on_heartbeat)(result.as_ref().err());
    }

    async fn try_announce(&mut self) -> Result<(), HeartbeatError> {
        let mut resource = self.source.descriptor().await?;
        let now = self.clock.now();
        resource.set_expiry(now + self.ttl);
        self.announcer.upsert_resource(resource.clone()).await?;

        debug!(
            mode = %self.mode,
            resource = %resource.name(),
            expiry = ?resource.expiry(),
            "Announced resource"
        );
        self.last_announced = Some(resource);
        self.last_success = Some(now);
        Ok(())
    }

    /// Returns true when the descriptor changed since the last announce
    async fn check(&mut self) -> bool {
        if let Some(last_success) = self.last_success {
            if self.clock.now() - last_success > self.ttl {
                warn!(
                    mode = %self.mode,
                    last_success = %last_success,
                    "Last successful heartbeat is older than the announce TTL"
                );
            }
        }

        let current = match self.source.descriptor().await {
            Ok(current) => current,
            Err(e) => {
                warn!(mode = %self.mode, "Heartbeat check failed: {}", e);
                return false;
            }
        };
        match &self.last_announced {
            Some(last) => !last.same_content(&current),
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_announce_period_bounds() {
        let ttl = Duration::from_secs(600);
        for _ in 0..200 {
            let period = announce_period(ttl);
            assert!(period >= Duration::from_secs(300));
            assert!(period < Duration::from_secs(360));
        }
    }

    #[test]
    fn test_announce_period_tiny_ttl() {
        assert_eq!(announce_period(Duration::from_nanos(5)), Duration::from_nanos(2));
    }
}
