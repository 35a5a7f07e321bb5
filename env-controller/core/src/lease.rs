use chrono::{DateTime, SecondsFormat, TimeDelta, Utc};
use std::time::Duration;

/// How long an environment lives when its request carries no expiration.
pub const DEFAULT_LEASE: Duration = Duration::from_secs(15 * 60);

/// The state of a request's lease, as observed at some instant.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Lease {
    /// No expiration has been stamped yet.
    Unset,

    /// The request is live until `expires_at`.
    Active { expires_at: DateTime<Utc> },

    /// The request must be deleted.
    Expired(Expired),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Expired {
    Passed(DateTime<Utc>),

    /// An unreadable expiration is treated as already passed so that a bad
    /// write can never keep an environment alive forever.
    Malformed(String),
}

// === impl Lease ===

impl Lease {
    /// Interprets a stored RFC3339 expiration at `now`. Expiration is
    /// inclusive: a lease that expires exactly at `now` is expired.
    pub fn observe(expiration: Option<&str>, now: DateTime<Utc>) -> Self {
        let value = match expiration {
            None => return Self::Unset,
            Some(v) if v.is_empty() => return Self::Unset,
            Some(v) => v,
        };

        match DateTime::parse_from_rfc3339(value) {
            Ok(expires_at) => {
                let expires_at = expires_at.with_timezone(&Utc);
                if now >= expires_at {
                    Self::Expired(Expired::Passed(expires_at))
                } else {
                    Self::Active { expires_at }
                }
            }
            Err(error) => Self::Expired(Expired::Malformed(error.to_string())),
        }
    }

    /// The time remaining until the lease must be revisited, if any.
    pub fn remaining(&self, now: DateTime<Utc>) -> Option<Duration> {
        match self {
            Self::Active { expires_at } => (*expires_at - now).to_std().ok(),
            _ => None,
        }
    }
}

/// Computes the expiration for a fresh lease, returning both the instant and
/// its RFC3339 encoding.
///
/// The stored value has second precision, so the returned instant is the
/// truncated one that a later `observe` will read back.
pub fn stamp(now: DateTime<Utc>, lease: Duration) -> (DateTime<Utc>, String) {
    let lease = TimeDelta::from_std(lease).unwrap_or(TimeDelta::MAX);
    let expires_at = now.checked_add_signed(lease).unwrap_or(DateTime::<Utc>::MAX_UTC);
    let encoded = expires_at.to_rfc3339_opts(SecondsFormat::Secs, true);
    let expires_at = DateTime::parse_from_rfc3339(&encoded)
        .map(|t| t.with_timezone(&Utc))
        .unwrap_or(expires_at);
    (expires_at, encoded)
}

impl std::fmt::Display for Expired {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Passed(at) => write!(f, "expiration passed at {at}"),
            Self::Malformed(error) => write!(f, "expiration is malformed: {error}"),
        }
    }
}
