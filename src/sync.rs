// ============================================================================
// src/sync.rs - 共有レジストリ用の同期ヘルパー
// ============================================================================
//!
//! プロセス全体で共有されるインスタンスリスト (coredumpインスタンス等) を
//! 1つのMutexの背後に置き、スコープ付きのアクセス (`with`) と
//! 早期終了可能なイテレーション (`for_each`) だけを公開する。
//!
//! `spin::Mutex` は再入できない。`with` のクロージャ内から同じリストに
//! 触れるとデッドロックする。`for_each` はロックを外したスナップショットを
//! 走査するので、コールバックから登録・解除・`with` を呼んでもよい。

use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use spin::Mutex;

/// コールバック駆動のイテレーションを続けるか止めるか
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IterationDecision {
    Continue,
    Break,
}

/// 弱参照で保持するインスタンスリスト
///
/// 登録側がライフサイクル (登録/解除) を管理する。リストは所有権を持たないため、
/// 解除を忘れたインスタンスも破棄時に自動的に無効エントリになる。
pub struct InstanceList<T> {
    entries: Mutex<Vec<Weak<T>>>,
}

impl<T> InstanceList<T> {
    pub const fn new() -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
        }
    }

    /// インスタンスを登録
    pub fn register(&self, instance: &Arc<T>) {
        let mut entries = self.entries.lock();
        entries.retain(|weak| weak.strong_count() > 0);
        entries.push(Arc::downgrade(instance));
    }

    /// インスタンスを解除
    ///
    /// 登録されていなければ false
    pub fn unregister(&self, instance: &T) -> bool {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|weak| weak.strong_count() > 0 && !core::ptr::eq(weak.as_ptr(), instance));
        entries.len() != before
    }

    /// ロックを保持したまま生きているインスタンスの一覧を渡す
    ///
    /// `f` から同じリストを操作してはならない (再入するとデッドロック)。
    pub fn with<R>(&self, f: impl FnOnce(&[Arc<T>]) -> R) -> R {
        let entries = self.entries.lock();
        let live: Vec<Arc<T>> = entries.iter().filter_map(Weak::upgrade).collect();
        f(&live)
    }

    /// 登録順に走査する。`Break` で打ち切り
    ///
    /// 呼び出し時点のスナップショットをロック外で走査する。
    /// 走査中の登録・解除はこの走査には反映されない。
    pub fn for_each(&self, mut f: impl FnMut(&Arc<T>) -> IterationDecision) {
        for instance in self.snapshot() {
            if f(&instance) == IterationDecision::Break {
                break;
            }
        }
    }

    /// 生きているインスタンス数
    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .iter()
            .filter(|weak| weak.strong_count() > 0)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn snapshot(&self) -> Vec<Arc<T>> {
        self.entries.lock().iter().filter_map(Weak::upgrade).collect()
    }
}

impl<T> Default for InstanceList<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_and_iterate_with_break() {
        let list = InstanceList::new();
        let a = Arc::new(1u32);
        let b = Arc::new(2u32);
        let c = Arc::new(3u32);
        list.register(&a);
        list.register(&b);
        list.register(&c);

        let mut seen = Vec::new();
        list.for_each(|value| {
            seen.push(**value);
            if **value == 2 {
                IterationDecision::Break
            } else {
                IterationDecision::Continue
            }
        });
        assert_eq!(seen, [1, 2]);
    }

    #[test]
    fn test_for_each_callback_may_touch_the_list() {
        let list = InstanceList::new();
        let a = Arc::new(1u32);
        let b = Arc::new(2u32);
        let late = Arc::new(3u32);
        list.register(&a);
        list.register(&b);

        let mut seen = Vec::new();
        list.for_each(|value| {
            seen.push(**value);
            if **value == 1 {
                list.unregister(&b);
                list.register(&late);
            }
            assert!(list.with(|instances| !instances.is_empty()));
            IterationDecision::Continue
        });
        assert_eq!(seen, [1, 2]);
        list.with(|instances| {
            let values: Vec<u32> = instances.iter().map(|v| **v).collect();
            assert_eq!(values, [1, 3]);
        });
    }

    #[test]
    fn test_unregister() {
        let list = InstanceList::new();
        let a = Arc::new(7u8);
        list.register(&a);
        assert!(list.unregister(&a));
        assert!(!list.unregister(&a));
        assert!(list.is_empty());
    }

    #[test]
    fn test_dropped_instances_are_skipped() {
        let list = InstanceList::new();
        let a = Arc::new(1u8);
        {
            let b = Arc::new(2u8);
            list.register(&b);
        }
        list.register(&a);
        assert_eq!(list.len(), 1);
        list.with(|instances| assert_eq!(*instances[0], 1));
    }
}
