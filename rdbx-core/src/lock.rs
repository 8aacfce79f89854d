//! Distributed lock descriptors.
//!
//! A lock is identified by its key. Holding it means owning the token stored
//! under that key. An optional idempotency value lives under a separate key
//! derived with [`value_key`], so readers can observe it without touching the
//! lock itself.
//!
//! # Lifecycle
//!
//! ```text
//! (free) ─── try_lock(token) ──→ Held ─── unlock(token) ──→ Released
//!                                 │
//!                          unlock rejected: adopt current token, retry
//!                                 │
//!                         attempts exhausted ──→ Abandoned
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use crate::config::DEFAULT_LOCK_LEASE;

/// Key under which the idempotency value of lock `key` is stored.
pub fn value_key(key: &str) -> String {
    format!("{key}.value")
}

// ============================================================================
// LOCK OPTIONS
// ============================================================================

/// Options accepted when requesting a lock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockOptions {
    /// Lease after which the lock service expires the lock on its own.
    pub lease: Duration,
    /// Idempotency value recorded under `<key>.value` for the lease.
    pub value: Option<String>,
    /// Release the lock once the transactional action completes.
    pub auto_release: bool,
}

impl Default for LockOptions {
    fn default() -> Self {
        Self {
            lease: DEFAULT_LOCK_LEASE,
            value: None,
            auto_release: false,
        }
    }
}

impl LockOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_lease(mut self, lease: Duration) -> Self {
        self.lease = lease;
        self
    }

    pub fn with_value(mut self, value: impl Into<String>) -> Self {
        self.value = Some(value.into());
        self
    }

    pub fn with_auto_release(mut self, auto_release: bool) -> Self {
        self.auto_release = auto_release;
        self
    }
}

// ============================================================================
// LOCK STATUS
// ============================================================================

/// Where a held lock is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LockStatus {
    Held,
    Released,
    /// Release was given up after the retry budget ran out.
    Abandoned,
}

impl fmt::Display for LockStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LockStatus::Held => "held",
            LockStatus::Released => "released",
            LockStatus::Abandoned => "abandoned",
        };
        f.write_str(s)
    }
}

// ============================================================================
// LOCK DESCRIPTOR
// ============================================================================

/// Snapshot of an acquired lock.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LockDescriptor {
    pub name: String,
    pub lease: Duration,
    pub value: Option<String>,
    pub auto_release: bool,
    pub acquired_at: DateTime<Utc>,
    pub status: LockStatus,
    /// Most recent error seen while operating on the lock.
    pub last_error: Option<String>,
}

impl LockDescriptor {
    /// Descriptor for a lock that was just acquired.
    pub fn acquired(name: impl Into<String>, options: &LockOptions) -> Self {
        Self {
            name: name.into(),
            lease: options.lease,
            value: options.value.clone(),
            auto_release: options.auto_release,
            acquired_at: Utc::now(),
            status: LockStatus::Held,
            last_error: None,
        }
    }

    pub fn value_key(&self) -> String {
        value_key(&self.name)
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        let lease = chrono::Duration::from_std(self.lease).unwrap_or(chrono::Duration::MAX);
        self.acquired_at.checked_add_signed(lease).unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    /// Whether the lease has run out, so the service may have expired the key.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at()
    }

    /// Remaining lease, `None` once expired.
    pub fn remaining(&self, now: DateTime<Utc>) -> Option<Duration> {
        let expires_at = self.expires_at();
        if now >= expires_at {
            None
        } else {
            (expires_at - now).to_std().ok()
        }
    }
}
