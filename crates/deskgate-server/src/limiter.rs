//! Per-IP concurrent connection limit

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::net::IpAddr;
use std::sync::Arc;
use thiserror::Error;
use tracing::trace;

#[derive(Debug, Error, PartialEq, Eq)]
#[error("Too many connections from {ip} (max {max})")]
pub struct LimitExceeded {
    pub ip: IpAddr,
    pub max: u32,
}

/// Counts open connections per client IP
///
/// A limit of 0 disables the check but connections are still counted.
#[derive(Debug)]
pub struct ConnectionLimiter {
    max_per_ip: u32,
    counts: Arc<DashMap<IpAddr, u32>>,
}

impl ConnectionLimiter {
    pub fn new(max_per_ip: u32) -> Self {
        Self {
            max_per_ip,
            counts: Arc::new(DashMap::new()),
        }
    }

    pub fn max_per_ip(&self) -> u32 {
        self.max_per_ip
    }

    /// Take a slot for `ip`; the slot is released when the guard drops
    pub fn acquire(&self, ip: IpAddr) -> Result<ConnectionGuard, LimitExceeded> {
        let mut count = self.counts.entry(ip).or_insert(0);
        if self.max_per_ip > 0 && *count >= self.max_per_ip {
            return Err(LimitExceeded {
                ip,
                max: self.max_per_ip,
            });
        }
        *count += 1;
        trace!(client_ip = %ip, count = *count, "Acquired connection slot");

        Ok(ConnectionGuard {
            counts: self.counts.clone(),
            ip,
        })
    }

    /// Open connections for `ip`
    pub fn count(&self, ip: IpAddr) -> u32 {
        self.counts.get(&ip).map(|count| *count).unwrap_or(0)
    }
}

/// Holds one connection slot
#[derive(Debug)]
pub struct ConnectionGuard {
    counts: Arc<DashMap<IpAddr, u32>>,
    ip: IpAddr,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        if let Entry::Occupied(mut entry) = self.counts.entry(self.ip) {
            let count = entry.get_mut();
            *count = count.saturating_sub(1);
            if *count == 0 {
                entry.remove();
            }
        }
        trace!(client_ip = %self.ip, "Released connection slot");
    }
}
