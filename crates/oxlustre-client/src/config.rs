//! Client configuration.
//!
//! Defaults suit a client talking to remote services over a real network.
//! Use [`ClientConfig::local()`] for in-process clusters, where long RPC
//! timeouts only slow down failure paths.

use crate::error::{ClientError, ClientResult};
use oxlustre_core::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default RPC timeout for network services (30 seconds).
pub const DEFAULT_RPC_TIMEOUT: Duration = Duration::from_secs(30);

/// RPC timeout for in-process services (2 seconds).
pub const LOCAL_RPC_TIMEOUT: Duration = Duration::from_secs(2);

/// Largest link count a directory or file may reach.
pub const DEFAULT_MAX_LINK_COUNT: u32 = 32000;

/// Caller identity applied to creates and permission-sensitive operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Credentials {
    pub uid: u32,
    pub gid: u32,
    pub umask: u32,
    /// May set arbitrary timestamps on files it does not own.
    pub privileged: bool,
}

impl Default for Credentials {
    fn default() -> Self {
        Self {
            uid: 0,
            gid: 0,
            umask: 0o022,
            privileged: true,
        }
    }
}

/// Configuration options for a mounted session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Timeout for one RPC attempt.
    ///
    /// Default: 30 seconds (network) or 2 seconds (local).
    #[serde(with = "humantime_serde")]
    pub rpc_timeout: Duration,

    /// How often an idempotent request is resent after a transport failure.
    pub max_resends: u32,

    #[serde(with = "humantime_serde")]
    pub resend_delay: Duration,

    /// Unused locks kept per lock namespace before the oldest is cancelled.
    pub lock_lru_size: usize,

    /// Stripe count for newly allocated files (clamped to the number of targets).
    pub default_stripe_count: u32,

    pub default_stripe_size: u64,

    pub max_link_count: u32,

    /// Size ceiling enforced by truncate.
    pub max_file_bytes: u64,

    /// How long an aggregated statfs result may be reused.
    #[serde(with = "humantime_serde")]
    pub statfs_max_age: Duration,

    pub credentials: Credentials,

    /// Name prefix of the mounted filesystem's devices.
    pub profile: String,
}

impl Default for ClientConfig {
    /// Returns the default configuration for network services.
    fn default() -> Self {
        Self {
            rpc_timeout: DEFAULT_RPC_TIMEOUT,
            max_resends: 3,
            resend_delay: Duration::from_millis(100),
            lock_lru_size: 128,
            default_stripe_count: 1,
            default_stripe_size: 1 << 20,
            max_link_count: DEFAULT_MAX_LINK_COUNT,
            max_file_bytes: i64::MAX as u64,
            statfs_max_age: Duration::from_secs(1),
            credentials: Credentials::default(),
            profile: "lustre".to_string(),
        }
    }
}

impl ClientConfig {
    /// Creates a configuration for in-process services.
    ///
    /// Short RPC timeout and resend delay, and no statfs reuse.
    pub fn local() -> Self {
        Self {
            rpc_timeout: LOCAL_RPC_TIMEOUT,
            resend_delay: Duration::from_millis(5),
            statfs_max_age: Duration::ZERO,
            ..Default::default()
        }
    }

    /// Parse a JSON document. Missing fields take their defaults.
    pub fn from_json(raw: &str) -> ClientResult<Self> {
        serde_json::from_str(raw).map_err(|e| ClientError::Config(e.to_string()))
    }

    /// The resend policy every RPC client of the session uses.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            timeout: self.rpc_timeout,
            max_resends: self.max_resends,
            resend_delay: self.resend_delay,
        }
    }

    #[must_use]
    pub fn rpc_timeout(mut self, timeout: Duration) -> Self {
        self.rpc_timeout = timeout;
        self
    }

    #[must_use]
    pub fn max_resends(mut self, resends: u32) -> Self {
        self.max_resends = resends;
        self
    }

    #[must_use]
    pub fn lock_lru_size(mut self, size: usize) -> Self {
        self.lock_lru_size = size;
        self
    }

    /// Sets the layout of newly allocated files.
    #[must_use]
    pub fn default_striping(mut self, count: u32, size: u64) -> Self {
        self.default_stripe_count = count;
        self.default_stripe_size = size;
        self
    }

    #[must_use]
    pub fn max_link_count(mut self, count: u32) -> Self {
        self.max_link_count = count;
        self
    }

    #[must_use]
    pub fn max_file_bytes(mut self, bytes: u64) -> Self {
        self.max_file_bytes = bytes;
        self
    }

    #[must_use]
    pub fn statfs_max_age(mut self, age: Duration) -> Self {
        self.statfs_max_age = age;
        self
    }

    #[must_use]
    pub fn credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = credentials;
        self
    }
}
