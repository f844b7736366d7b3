//! 异步分块请求的交接槽与分块销毁记账。
//!
//! 两者都会被管理器在缓冲锁之外（或缓冲持锁调用管理器期间）回调，因此只使用自身的自旋锁或原子量，
//! 从不触碰缓冲主状态。

use core::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use spin::Mutex;

use crate::chunk::{Chunk, ChunkList};
use crate::index::BufferIndex;

enum RequestState {
    Unused,
    Requested,
    Fulfilled(Option<Box<Chunk>>),
}

/// 至多一个在途请求的交接槽。
///
/// 每个会话使用独立的槽；会话结束后才到达的应答落入已被遗弃的旧槽，随槽一起释放。
pub(super) struct RequestSlot {
    state: Mutex<RequestState>,
}

impl RequestSlot {
    pub(super) fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(RequestState::Unused),
        })
    }

    /// 进入“已请求”状态；已有在途请求或尚未取走的分块时返回 `false`。
    pub(super) fn begin_request(&self) -> bool {
        let mut state = self.state.lock();
        match *state {
            RequestState::Requested | RequestState::Fulfilled(Some(_)) => false,
            RequestState::Unused | RequestState::Fulfilled(None) => {
                *state = RequestState::Requested;
                true
            }
        }
    }

    pub(super) fn is_pending(&self) -> bool {
        matches!(*self.state.lock(), RequestState::Requested)
    }

    pub(super) fn fulfill(&self, chunk: Option<Box<Chunk>>) {
        *self.state.lock() = RequestState::Fulfilled(chunk);
    }

    /// 取走已应答的分块，槽回到空闲状态；请求仍在途时返回 `None`。
    pub(super) fn take_fulfilled(&self) -> Option<Box<Chunk>> {
        let mut state = self.state.lock();
        match core::mem::replace(&mut *state, RequestState::Unused) {
            RequestState::Fulfilled(chunk) => chunk,
            other => {
                *state = other;
                None
            }
        }
    }
}

/// 管理器销毁分块时累积的影响：被淘汰区间的上界与丢失的块数量。
#[derive(Default)]
pub(super) struct DestroyedLedger {
    destroyed_range_end: AtomicU64,
    cleared_block_count: AtomicU64,
}

impl DestroyedLedger {
    pub(super) fn record(&self, destroyed: &ChunkList) {
        for chunk in destroyed.iter() {
            let end = chunk.range_start() + chunk.buffer_bytes() as BufferIndex;
            self.destroyed_range_end.fetch_max(end, Ordering::AcqRel);
            self.cleared_block_count
                .fetch_add(u64::from(chunk.block_count()), Ordering::AcqRel);
        }
    }

    pub(super) fn destroyed_range_end(&self) -> BufferIndex {
        self.destroyed_range_end.load(Ordering::Acquire)
    }

    pub(super) fn cleared_block_count(&self) -> u64 {
        self.cleared_block_count.load(Ordering::Acquire)
    }

    pub(super) fn reset_cleared_block_count(&self) {
        self.cleared_block_count.store(0, Ordering::Release);
    }
}
