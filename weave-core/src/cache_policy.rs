//! Cache policies and expiration instants.
//!
//! A source declares how long its answers stay valid through a
//! [`CachePolicy`]. The federation layer turns that into an [`Expiration`]
//! relative to a single "now" captured per operation, so every contribution
//! of one operation is stamped against the same instant.

use chrono::Duration as ChronoDuration;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::Timestamp;

/// How long information from a source may be cached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CachePolicy {
    pub time_to_live: Duration,
}

impl CachePolicy {
    pub fn new(time_to_live: Duration) -> Self {
        Self { time_to_live }
    }

    pub fn from_secs(secs: u64) -> Self {
        Self::new(Duration::from_secs(secs))
    }

    pub fn from_millis(millis: u64) -> Self {
        Self::new(Duration::from_millis(millis))
    }

    /// Expiration of information obtained at `now` under this policy.
    ///
    /// A time-to-live too large to represent never expires.
    pub fn expires_at(&self, now: Timestamp) -> Expiration {
        ChronoDuration::from_std(self.time_to_live)
            .ok()
            .and_then(|ttl| now.checked_add_signed(ttl))
            .map(Expiration::At)
            .unwrap_or(Expiration::Never)
    }
}

/// When cached information stops being valid.
///
/// Ordered so that any instant sorts before `Never`; the earliest of a set
/// of expirations is therefore its minimum.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
pub enum Expiration {
    At(Timestamp),
    #[default]
    Never,
}

impl Expiration {
    /// Expiration under an optional policy; no policy never expires.
    pub fn from_policy(policy: Option<&CachePolicy>, now: Timestamp) -> Self {
        policy
            .map(|p| p.expires_at(now))
            .unwrap_or(Expiration::Never)
    }

    /// `instant >= expires_at`.
    pub fn is_expired(&self, instant: Timestamp) -> bool {
        match self {
            Expiration::At(at) => instant >= *at,
            Expiration::Never => false,
        }
    }

    pub fn instant(&self) -> Option<Timestamp> {
        match self {
            Expiration::At(at) => Some(*at),
            Expiration::Never => None,
        }
    }

    /// Earliest of the given expirations; `Never` for an empty set.
    pub fn earliest<I>(expirations: I) -> Self
    where
        I: IntoIterator<Item = Expiration>,
    {
        expirations.into_iter().min().unwrap_or(Expiration::Never)
    }

    /// Time left before expiry as seen from `now`, or `None` when expired.
    pub fn remaining(&self, now: Timestamp) -> Option<Duration> {
        match self {
            Expiration::Never => Some(Duration::MAX),
            Expiration::At(at) if now >= *at => None,
            Expiration::At(at) => (*at - now).to_std().ok(),
        }
    }
}
