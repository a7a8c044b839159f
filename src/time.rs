//! 時刻コラボレータ
//!
//! 合成ファイルシステムの mtime (マウント時刻) に使う壁時計。
//! 実際のRTC/TSCドライバは `ClockSource` を実装して `set_clock_source` で登録する。
//! 未登録の場合は単調増加するtickカウンタを秒として返す。

use core::sync::atomic::{AtomicU64, Ordering};
use spin::RwLock;

/// ナノ秒単位の時間
pub type Nanoseconds = u64;

/// 1秒のナノ秒数
pub const NANOS_PER_SEC: u64 = 1_000_000_000;

/// 秒 + ナノ秒
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Hash)]
pub struct TimeSpec {
    pub seconds: i64,
    pub nanoseconds: u32,
}

impl TimeSpec {
    pub const ZERO: TimeSpec = TimeSpec { seconds: 0, nanoseconds: 0 };

    pub const fn from_seconds(seconds: i64) -> Self {
        TimeSpec { seconds, nanoseconds: 0 }
    }

    pub const fn from_nanos(nanos: Nanoseconds) -> Self {
        TimeSpec {
            seconds: (nanos / NANOS_PER_SEC) as i64,
            nanoseconds: (nanos % NANOS_PER_SEC) as u32,
        }
    }
}

/// 壁時計の提供元
pub trait ClockSource: Send + Sync {
    fn now(&self) -> TimeSpec;
}

static CLOCK: RwLock<Option<&'static dyn ClockSource>> = RwLock::new(None);
static FALLBACK_TICKS: AtomicU64 = AtomicU64::new(0);

/// 壁時計を登録する
pub fn set_clock_source(source: &'static dyn ClockSource) {
    *CLOCK.write() = Some(source);
}

/// 現在時刻
pub fn now() -> TimeSpec {
    if let Some(source) = *CLOCK.read() {
        return source.now();
    }
    let tick = FALLBACK_TICKS.fetch_add(1, Ordering::Relaxed);
    TimeSpec::from_seconds(tick as i64)
}
