//! Windows FILETIME timestamps as used by ADS notifications.

use serde::{Deserialize, Serialize};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// 100 ns ticks between 1601-01-01 and 1970-01-01.
const EPOCH_OFFSET_TICKS: u64 = 116_444_736_000_000_000;
const TICKS_PER_SECOND: u64 = 10_000_000;

/// Timestamp in 100 ns ticks since 1601-01-01 UTC.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct FileTime(pub u64);

impl FileTime {
    /// Current wall-clock time.
    #[must_use]
    pub fn now() -> Self {
        Self::from_system_time(SystemTime::now())
    }

    /// Convert from a `SystemTime`; times before the FILETIME epoch clamp to zero.
    #[must_use]
    pub fn from_system_time(time: SystemTime) -> Self {
        let ticks = match time.duration_since(UNIX_EPOCH) {
            Ok(since) => EPOCH_OFFSET_TICKS.saturating_add(duration_ticks(since)),
            Err(before) => EPOCH_OFFSET_TICKS.saturating_sub(duration_ticks(before.duration())),
        };
        Self(ticks)
    }

    /// Convert to a `SystemTime`.
    #[must_use]
    pub fn to_system_time(self) -> SystemTime {
        if self.0 >= EPOCH_OFFSET_TICKS {
            UNIX_EPOCH + ticks_duration(self.0 - EPOCH_OFFSET_TICKS)
        } else {
            UNIX_EPOCH - ticks_duration(EPOCH_OFFSET_TICKS - self.0)
        }
    }

    /// Raw tick count.
    #[must_use]
    pub fn ticks(self) -> u64 {
        self.0
    }
}

fn duration_ticks(duration: Duration) -> u64 {
    duration
        .as_secs()
        .saturating_mul(TICKS_PER_SECOND)
        .saturating_add(u64::from(duration.subsec_nanos() / 100))
}

fn ticks_duration(ticks: u64) -> Duration {
    let nanos = u32::try_from((ticks % TICKS_PER_SECOND) * 100).unwrap_or(0);
    Duration::new(ticks / TICKS_PER_SECOND, nanos)
}
