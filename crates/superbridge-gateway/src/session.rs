//! Chat session identity.
//!
//! The gateway never stores conversation history; the upstream keys it by
//! [`SessionId`]. A [`ChatSession`] only travels with one call.

use std::collections::HashSet;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Label sent upstream when the caller does not provide one.
pub const DEFAULT_CLIENT_LABEL: &str = "superbridge";

const RANDOM_MIN: i64 = 10_000_000;
const RANDOM_MAX: i64 = 99_999_999;
const MAX_ALLOCATION_ATTEMPTS: usize = 64;

/// Upstream conversation key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(i64);

impl SessionId {
    /// Wrap a caller-supplied id.
    #[must_use]
    pub const fn new(id: i64) -> Self {
        Self(id)
    }

    /// Raw value.
    #[must_use]
    pub const fn get(self) -> i64 {
        self.0
    }

    /// A random eight-digit id.
    #[must_use]
    pub fn random() -> Self {
        Self(fastrand::i64(RANDOM_MIN..=RANDOM_MAX))
    }

    /// A random eight-digit id not contained in `taken`.
    ///
    /// Gives up after a bounded number of draws and returns the last one; with
    /// ninety million candidates a collision streak that long means `taken` is
    /// not a real history listing.
    #[must_use]
    pub fn random_excluding(taken: &HashSet<i64>) -> Self {
        let mut candidate = Self::random();
        for _ in 1..MAX_ALLOCATION_ATTEMPTS {
            if !taken.contains(&candidate.0) {
                break;
            }
            candidate = Self::random();
        }
        candidate
    }
}

impl From<i64> for SessionId {
    fn from(id: i64) -> Self {
        Self(id)
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identity of one chat call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatSession {
    /// Upstream conversation key.
    pub session_id: SessionId,
    /// Client label forwarded upstream.
    pub client_label: String,
}

impl ChatSession {
    /// Create a session with an explicit label.
    #[must_use]
    pub fn new(session_id: impl Into<SessionId>, client_label: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            client_label: client_label.into(),
        }
    }

    /// Create a session with [`DEFAULT_CLIENT_LABEL`].
    #[must_use]
    pub fn with_default_label(session_id: impl Into<SessionId>) -> Self {
        Self::new(session_id, DEFAULT_CLIENT_LABEL)
    }
}
