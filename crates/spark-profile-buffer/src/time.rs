//! 进程内单调时间戳。
//!
//! - `TimeStamp` 以进程首次取时刻为零点，单位为纳秒；
//! - [`TimeStamp::now`] 只保证单调不减，[`TimeStamp::unique_now`] 额外保证全进程严格递增，
//!   分块的完成时间戳使用后者，因此已释放链表按完成时间排序时不会出现并列。

use core::fmt;
use core::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;
use std::time::{Duration, Instant};

static ORIGIN: OnceLock<Instant> = OnceLock::new();
static LAST_UNIQUE: AtomicU64 = AtomicU64::new(0);

/// 相对进程零点的纳秒时间戳。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TimeStamp(u64);

impl TimeStamp {
    /// 零点时间戳，早于任何 `now()` 的返回值或与其相等。
    pub const ZERO: TimeStamp = TimeStamp(0);

    pub const fn from_nanos(nanos: u64) -> Self {
        TimeStamp(nanos)
    }

    pub const fn as_nanos(self) -> u64 {
        self.0
    }

    /// 当前时刻（单调不减）。
    pub fn now() -> Self {
        let origin = *ORIGIN.get_or_init(Instant::now);
        let nanos = origin.elapsed().as_nanos();
        TimeStamp(u64::try_from(nanos).unwrap_or(u64::MAX))
    }

    /// 当前时刻，且严格大于此前任何一次 `unique_now()` 的返回值。
    ///
    /// 时钟分辨率不足时，通过原子 `fetch_update` 把结果推到上一次结果 + 1ns。
    pub fn unique_now() -> Self {
        let now = Self::now().0;
        let previous = LAST_UNIQUE
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |prev| {
                Some(now.max(prev.saturating_add(1)))
            })
            .unwrap_or_else(|prev| prev);
        TimeStamp(now.max(previous.saturating_add(1)))
    }

    /// 两个时间戳之间的间隔；`earlier` 晚于 `self` 时返回零。
    pub fn saturating_duration_since(self, earlier: TimeStamp) -> Duration {
        Duration::from_nanos(self.0.saturating_sub(earlier.0))
    }
}

impl fmt::Display for TimeStamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}ns", self.0)
    }
}
