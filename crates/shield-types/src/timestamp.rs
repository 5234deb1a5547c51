//! Unix timestamp utilities for challenge and intent validity windows.
//!
//! Challenge expiries, debit-intent deadlines, and credit-state `updatedAt`
//! fields are all seconds since the Unix epoch. Values serialize as
//! stringified integers so JavaScript agents never lose precision on 64-bit
//! values.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt::{Display, Formatter};
use std::ops::Add;
use std::time::SystemTime;

/// Seconds since the Unix epoch.
///
/// # Example
///
/// ```
/// use shield_types::timestamp::UnixTimestamp;
///
/// let issued = UnixTimestamp::from_secs(1_700_000_000);
/// let expiry = issued + 300;
/// assert_eq!(expiry.as_secs(), 1_700_000_300);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Ord, Eq, Hash)]
pub struct UnixTimestamp(u64);

impl Serialize for UnixTimestamp {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0.to_string())
    }
}

impl<'de> Deserialize<'de> for UnixTimestamp {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        let secs = s
            .parse::<u64>()
            .map_err(|_| serde::de::Error::custom("timestamp must be a non-negative integer"))?;
        Ok(UnixTimestamp(secs))
    }
}

impl Display for UnixTimestamp {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Add<u64> for UnixTimestamp {
    type Output = Self;

    fn add(self, rhs: u64) -> Self::Output {
        UnixTimestamp(self.0.saturating_add(rhs))
    }
}

impl From<u64> for UnixTimestamp {
    fn from(secs: u64) -> Self {
        UnixTimestamp(secs)
    }
}

impl UnixTimestamp {
    pub fn from_secs(secs: u64) -> Self {
        Self(secs)
    }

    /// Current system time.
    ///
    /// # Panics
    ///
    /// Panics if the system clock is set before the Unix epoch.
    pub fn now() -> Self {
        let now = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .expect("system clock before the Unix epoch")
            .as_secs();
        Self(now)
    }

    pub fn as_secs(&self) -> u64 {
        self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serializes_as_string() {
        let ts = UnixTimestamp::from_secs(1_700_000_000);
        assert_eq!(serde_json::to_string(&ts).unwrap(), "\"1700000000\"");
        let back: UnixTimestamp = serde_json::from_str("\"1700000000\"").unwrap();
        assert_eq!(back, ts);
    }

    #[test]
    fn test_rejects_non_numeric() {
        assert!(serde_json::from_str::<UnixTimestamp>("\"soon\"").is_err());
    }
}
