//! Cache policies and the comment directive that carries them
//!
//! A command opts into caching by carrying a single comment line such as
//!
//! ```text
//! -- EFCachePolicy[PostsController.Index] --> Absolute|00:30:00|tenant-7|Tags,Users|True
//! ```
//!
//! The line is parsed into a [`CachePolicy`] right away. Nothing past this module sees
//! the raw text.

pub mod directive;
pub mod timespan;

pub use directive::{is_explicitly_cacheable, parse_policy, strip_policy_directive, CACHE_POLICY_MARKER};

use crate::error::{CacheError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// How a cached result expires
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum ExpirationMode {
    /// Expires a fixed time after insertion
    #[default]
    Absolute,

    /// Expires after a period without reads; every hit restarts the window
    Sliding,

    /// Never expires; only invalidation or a clear removes it
    NeverRemove,
}

impl fmt::Display for ExpirationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExpirationMode::Absolute => write!(f, "Absolute"),
            ExpirationMode::Sliding => write!(f, "Sliding"),
            ExpirationMode::NeverRemove => write!(f, "NeverRemove"),
        }
    }
}

impl FromStr for ExpirationMode {
    type Err = CacheError;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if s.eq_ignore_ascii_case("Absolute") {
            Ok(ExpirationMode::Absolute)
        } else if s.eq_ignore_ascii_case("Sliding") {
            Ok(ExpirationMode::Sliding)
        } else if s.eq_ignore_ascii_case("NeverRemove") {
            Ok(ExpirationMode::NeverRemove)
        } else {
            Err(CacheError::InvalidExpirationMode(s.to_string()))
        }
    }
}

/// Expiration and dependency settings for one cached result
///
/// Policies are values: the `with_*` methods consume and return a new policy, and
/// there are no setters on a shared instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachePolicy {
    expiration_mode: ExpirationMode,
    timeout: Option<Duration>,
    salt_key: String,
    extra_dependencies: BTreeSet<String>,
    is_cacheable: bool,
}

impl Default for CachePolicy {
    fn default() -> Self {
        Self {
            expiration_mode: ExpirationMode::Absolute,
            timeout: None,
            salt_key: String::new(),
            extra_dependencies: BTreeSet::new(),
            is_cacheable: true,
        }
    }
}

impl CachePolicy {
    /// Create a policy with the given mode and timeout. The timeout is truncated to
    /// whole 100ns ticks, the finest unit a directive can carry.
    pub fn new(expiration_mode: ExpirationMode, timeout: Option<Duration>) -> Self {
        Self {
            expiration_mode,
            timeout: timeout.map(timespan::truncate_to_ticks),
            ..Default::default()
        }
    }

    /// Absolute expiration after `timeout`
    pub fn absolute(timeout: Duration) -> Self {
        Self::new(ExpirationMode::Absolute, Some(timeout))
    }

    /// Sliding expiration with a `timeout` window
    pub fn sliding(timeout: Duration) -> Self {
        Self::new(ExpirationMode::Sliding, Some(timeout))
    }

    /// Cached until invalidated
    pub fn never_remove() -> Self {
        Self::new(ExpirationMode::NeverRemove, None)
    }

    pub fn with_salt_key(mut self, salt_key: impl Into<String>) -> Self {
        self.salt_key = salt_key.into();
        self
    }

    pub fn with_extra_dependencies<I, S>(mut self, dependencies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.extra_dependencies = dependencies.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_cacheable(mut self, is_cacheable: bool) -> Self {
        self.is_cacheable = is_cacheable;
        self
    }

    pub fn expiration_mode(&self) -> ExpirationMode {
        self.expiration_mode
    }

    /// Configured timeout; meaningless for [`ExpirationMode::NeverRemove`]
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    pub fn salt_key(&self) -> &str {
        &self.salt_key
    }

    pub fn extra_dependencies(&self) -> &BTreeSet<String> {
        &self.extra_dependencies
    }

    pub fn is_cacheable(&self) -> bool {
        self.is_cacheable
    }

    /// Timeout to apply, substituting `default_ttl` when the policy names none.
    /// `None` means the entry never expires.
    pub fn effective_timeout(&self, default_ttl: Duration) -> Option<Duration> {
        match self.expiration_mode {
            ExpirationMode::NeverRemove => None,
            ExpirationMode::Absolute | ExpirationMode::Sliding => {
                Some(self.timeout.unwrap_or(default_ttl))
            }
        }
    }

    /// Render this policy as a directive comment line tagged with `origin`.
    ///
    /// Parsing the line back yields an equal policy. Salts and dependencies that
    /// cannot survive the trip (separators, line breaks, surrounding whitespace) are
    /// rejected with [`CacheError::MalformedDirective`].
    pub fn to_directive(&self, origin: &str) -> Result<String> {
        directive::encode_policy(self, origin)
    }
}
