/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

use serde_derive::{Deserialize, Serialize};
use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

// Typesafe way to manage timestamps. Milliseconds since the unix epoch,
// which is what the server stamps on every accepted write.
#[derive(
    Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Deserialize, Serialize, Default,
)]
pub struct Timestamp(pub u64);

impl Timestamp {
    pub fn now() -> Self {
        SystemTime::now().into()
    }

    /// Returns None if `other` is later than `self` (Duration may not
    /// represent negative timespans in rust).
    #[inline]
    pub fn duration_since(self, other: Timestamp) -> Option<Duration> {
        SystemTime::from(self).duration_since(other.into()).ok()
    }

    pub fn as_millis(self) -> u64 {
        self.0
    }

    pub fn as_millis_i64(self) -> i64 {
        self.0 as i64
    }
}

impl From<Timestamp> for u64 {
    #[inline]
    fn from(ts: Timestamp) -> Self {
        ts.0
    }
}

impl From<SystemTime> for Timestamp {
    #[inline]
    fn from(st: SystemTime) -> Self {
        let d = st.duration_since(UNIX_EPOCH).unwrap_or_default();
        Timestamp(d.as_secs() * 1000 + u64::from(d.subsec_nanos()) / 1_000_000)
    }
}

impl From<Timestamp> for SystemTime {
    #[inline]
    fn from(ts: Timestamp) -> Self {
        UNIX_EPOCH + Duration::from_millis(ts.into())
    }
}

impl From<u64> for Timestamp {
    #[inline]
    fn from(ts: u64) -> Self {
        Timestamp(ts)
    }
}

impl fmt::Display for Timestamp {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(feature = "rusqlite_support")]
mod rusqlite_support {
    use super::Timestamp;
    use rusqlite::{
        types::{FromSql, FromSqlResult, ToSql, ToSqlOutput, ValueRef},
        Result as RusqliteResult,
    };

    impl ToSql for Timestamp {
        fn to_sql(&self) -> RusqliteResult<ToSqlOutput<'_>> {
            Ok(ToSqlOutput::from(self.0 as i64)) // hrm - no u64 in rusqlite
        }
    }

    impl FromSql for Timestamp {
        fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
            value.as_i64().map(|v| Timestamp(v as u64)) // hrm - no u64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ordering() {
        let early = Timestamp(1000);
        let late = Timestamp(2000);
        assert!(early < late);
        assert_eq!(late.duration_since(early), Some(Duration::from_secs(1)));
        assert_eq!(early.duration_since(late), None);
    }

    #[test]
    fn test_now_is_reasonable() {
        // Anything after 2020-01-01 and the conversion roundtrips.
        let now = Timestamp::now();
        assert!(now.as_millis() > 1_577_836_800_000);
        assert_eq!(Timestamp::from(SystemTime::from(now)), now);
    }
}
