//! Port allocation across independent processes.
//!
//! The allocator and the eventual binder are different processes, so "free" can only be
//! established by a transient bind probe. The per-port lock keeps two concurrent allocators
//! from both passing the probe for the same port before the proxy binds it; it is held only
//! until the caller drops the [`PortLease`] (right after spawning).
use std::net::TcpListener;
use std::ops::Range;
use std::path::PathBuf;
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, instrument};

use crate::errors::{Result, SlashError};
use crate::lock::FileLock;

/// A claimed port plus the allocation lock guarding it; dropping releases the lock.
#[derive(Debug)]
pub struct PortLease {
    port: u16,
    _lock: FileLock,
}

impl PortLease {
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Release the allocation lock explicitly (same as dropping).
    pub fn release(self) -> u16 {
        self.port
    }
}

#[derive(Debug, Clone)]
pub struct PortAllocator {
    lock_dir: PathBuf,
    backoff: Duration,
}

impl PortAllocator {
    pub fn new(lock_dir: impl Into<PathBuf>, backoff: Duration) -> Self {
        PortAllocator {
            lock_dir: lock_dir.into(),
            backoff,
        }
    }

    pub fn lock_path(&self, port: u16) -> PathBuf {
        self.lock_dir.join(format!("port_{port}.lock"))
    }

    /// Claim a random port from `range`. `deadline == None` retries forever.
    #[instrument(level = "debug", skip(self), err)]
    pub fn acquire(&self, range: Range<u16>, deadline: Option<Duration>) -> Result<PortLease> {
        if range.is_empty() {
            return Err(SlashError::Message(format!(
                "empty port range {}..{}",
                range.start, range.end
            )));
        }
        let started = Instant::now();
        loop {
            if let Some(limit) = deadline {
                if started.elapsed() >= limit {
                    return Err(SlashError::PortTimeout {
                        range,
                        waited: started.elapsed(),
                    });
                }
            }
            let port = random_port(&range);
            let Some(lock) = FileLock::try_acquire(&self.lock_path(port))? else {
                // another allocator is probing this port
                continue;
            };
            if is_port_free(port) {
                debug!("claimed port {port}");
                return Ok(PortLease { port, _lock: lock });
            }
            drop(lock);
            thread::sleep(self.backoff);
        }
    }
}

/// Bind/close probe on all interfaces.
pub fn is_port_free(port: u16) -> bool {
    TcpListener::bind(("0.0.0.0", port)).is_ok()
}

fn random_port(range: &Range<u16>) -> u16 {
    let mut buf = [0u8; 4];
    let span = u32::from(range.end - range.start);
    if getrandom::getrandom(&mut buf).is_err() {
        // Fall back to clock jitter; uniformity is not important here
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.subsec_nanos())
            .unwrap_or(0)
            ^ std::process::id();
        buf = nanos.to_le_bytes();
    }
    range.start + (u32::from_le_bytes(buf) % span) as u16
}
