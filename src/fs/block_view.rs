// ============================================================================
// src/fs/block_view.rs - Windowed Block Index Cache
// ============================================================================
//!
//! inodeごとの 論理ブロック番号 → 物理ブロック番号 キャッシュ
//!
//! ## 設計
//! - 16384エントリ単位のウィンドウ `[first_block, first_block + WINDOW)` だけを保持
//! - ウィンドウ外の論理ブロックが要求されたら、そのブロックを含むウィンドウを
//!   `BlockListProvider::compute_block_list` で作り直す
//! - 1つのMutexを操作全体 (ensure → 参照/割り当て → ポインタ書き込み) の間保持する。
//!   同じinodeに対するポインタ書き込みはこのロックの取得順で全順序になる
//! - 穴 (未割り当て) は 0 で表す

use core::sync::atomic::{AtomicU64, Ordering};
use hashbrown::HashMap;
use spin::Mutex;

use crate::error::{FsError, FsResult};
use crate::fs::config::BLOCK_VIEW_WINDOW_SIZE;

/// 論理→物理ブロックの対応を提供するバックエンド側のインターフェース
pub trait BlockListProvider {
    /// `[first, first + count)` の割り当て済みブロックを列挙する (穴は含めない)
    fn compute_block_list(&self, first: u64, count: u64) -> FsResult<HashMap<u64, u64>>;

    /// 論理ブロック `logical` 用に物理ブロックを1つ確保する (ポインタはまだ書かない)
    fn allocate_block(&self, logical: u64, zero_new_block: bool) -> FsResult<u64>;

    /// 論理ブロック `logical` のポインタを永続化する。0 は割り当て解除
    fn write_block_pointer(&self, logical: u64, physical: u64) -> FsResult<()>;

    /// `allocate_block` で確保したがどこからも参照されていないブロックを返却する
    fn free_block(&self, physical: u64) -> FsResult<()>;
}

/// キャッシュ統計
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BlockViewStats {
    pub hits: u64,
    pub misses: u64,
    pub refreshes: u64,
    pub allocations: u64,
}

struct WindowState {
    first_block: u64,
    initialized: bool,
    blocks: HashMap<u64, u64>,
}

impl WindowState {
    fn contains(&self, logical: u64) -> bool {
        self.initialized
            && logical >= self.first_block
            && logical - self.first_block < BLOCK_VIEW_WINDOW_SIZE
    }
}

/// ウィンドウ化されたブロックインデックスキャッシュ
pub struct BlockView {
    state: Mutex<WindowState>,
    hits: AtomicU64,
    misses: AtomicU64,
    refreshes: AtomicU64,
    allocations: AtomicU64,
}

impl BlockView {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(WindowState {
                first_block: 0,
                initialized: false,
                blocks: HashMap::new(),
            }),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            refreshes: AtomicU64::new(0),
            allocations: AtomicU64::new(0),
        }
    }

    /// 現在のウィンドウ先頭 (未初期化なら None)
    pub fn window_start(&self) -> Option<u64> {
        let state = self.state.lock();
        state.initialized.then_some(state.first_block)
    }

    /// `logical` を含むウィンドウがロード済みであることを保証する
    pub fn ensure_block(&self, provider: &dyn BlockListProvider, logical: u64) -> FsResult<()> {
        let mut state = self.state.lock();
        self.ensure_locked(&mut state, provider, logical, false)
    }

    /// キャッシュされた物理ブロック番号。穴なら 0
    pub fn get_block(&self, provider: &dyn BlockListProvider, logical: u64) -> FsResult<u64> {
        let mut state = self.state.lock();
        self.ensure_locked(&mut state, provider, logical, false)?;
        let physical = state.blocks.get(&logical).copied().unwrap_or(0);
        self.record_lookup(logical, physical);
        Ok(physical)
    }

    /// 物理ブロック番号を返す。未割り当てなら確保してポインタを書き込む
    ///
    /// `allow_cache == false` の場合は参照前にウィンドウを作り直す。
    /// 戻り値は決して 0 にならない。ポインタの書き込みに失敗した場合、
    /// 確保したブロックは `free_block` で返却してからエラーを返す。
    pub fn get_or_allocate_block(
        &self,
        provider: &dyn BlockListProvider,
        logical: u64,
        zero_new_block: bool,
        allow_cache: bool,
    ) -> FsResult<u64> {
        let mut state = self.state.lock();
        self.ensure_locked(&mut state, provider, logical, !allow_cache)?;

        let cached = state.blocks.get(&logical).copied().unwrap_or(0);
        self.record_lookup(logical, cached);
        if cached != 0 {
            return Ok(cached);
        }

        state
            .blocks
            .try_reserve(1)
            .map_err(|_| FsError::OutOfMemory)?;
        let physical = provider.allocate_block(logical, zero_new_block)?;
        assert!(physical != 0, "block allocator returned the null block");
        if let Err(error) = provider.write_block_pointer(logical, physical) {
            if let Err(free_error) = provider.free_block(physical) {
                log::warn!(
                    "block_view: block {} for logical {} leaked ({})",
                    physical,
                    logical,
                    free_error
                );
            }
            return Err(error);
        }
        state.blocks.insert(logical, physical);
        self.allocations.fetch_add(1, Ordering::Relaxed);
        Ok(physical)
    }

    /// ポインタを書き込み、ウィンドウ内であればキャッシュにも反映する
    pub fn write_block_pointer(
        &self,
        provider: &dyn BlockListProvider,
        logical: u64,
        physical: u64,
    ) -> FsResult<()> {
        let mut state = self.state.lock();
        Self::write_pointer_locked(&mut state, provider, logical, physical)
    }

    /// ポインタを 0 にし、直前の物理ブロック番号を返す (穴なら 0)
    ///
    /// 参照とクリアを同じロック区間で行う。
    pub fn clear_block_pointer(
        &self,
        provider: &dyn BlockListProvider,
        logical: u64,
    ) -> FsResult<u64> {
        let mut state = self.state.lock();
        self.ensure_locked(&mut state, provider, logical, false)?;
        let previous = state.blocks.get(&logical).copied().unwrap_or(0);
        if previous != 0 {
            Self::write_pointer_locked(&mut state, provider, logical, 0)?;
        }
        Ok(previous)
    }

    /// キャッシュを破棄する (次回アクセスで再計算)
    pub fn invalidate(&self) {
        let mut state = self.state.lock();
        state.initialized = false;
        state.blocks.clear();
    }

    pub fn stats(&self) -> BlockViewStats {
        BlockViewStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            refreshes: self.refreshes.load(Ordering::Relaxed),
            allocations: self.allocations.load(Ordering::Relaxed),
        }
    }

    fn ensure_locked(
        &self,
        state: &mut WindowState,
        provider: &dyn BlockListProvider,
        logical: u64,
        force: bool,
    ) -> FsResult<()> {
        if !force && state.contains(logical) {
            return Ok(());
        }
        let first = logical - logical % BLOCK_VIEW_WINDOW_SIZE;
        let blocks = provider.compute_block_list(first, BLOCK_VIEW_WINDOW_SIZE)?;
        log::debug!(
            "block_view: window [{}..{}) loaded with {} mapped blocks",
            first,
            first + BLOCK_VIEW_WINDOW_SIZE,
            blocks.len()
        );
        state.first_block = first;
        state.blocks = blocks;
        state.initialized = true;
        self.refreshes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn write_pointer_locked(
        state: &mut WindowState,
        provider: &dyn BlockListProvider,
        logical: u64,
        physical: u64,
    ) -> FsResult<()> {
        provider.write_block_pointer(logical, physical)?;
        if state.contains(logical) {
            if physical == 0 {
                state.blocks.remove(&logical);
            } else {
                state
                    .blocks
                    .try_reserve(1)
                    .map_err(|_| FsError::OutOfMemory)?;
                state.blocks.insert(logical, physical);
            }
        }
        Ok(())
    }

    fn record_lookup(&self, logical: u64, physical: u64) {
        if physical != 0 {
            self.hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
        }
        #[cfg(feature = "verbose_logging")]
        log::trace!("block_view: {} -> {}", logical, physical);
        #[cfg(not(feature = "verbose_logging"))]
        let _ = logical;
    }
}

impl Default for BlockView {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(feature = "stats")]
impl Drop for BlockView {
    fn drop(&mut self) {
        log::debug!("block_view: {:?}", self.stats());
    }
}
