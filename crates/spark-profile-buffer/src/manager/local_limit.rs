//! 带本地字节上限的多分块管理器。

use std::collections::VecDeque;

use spin::Mutex;
use tracing::{debug, trace};

use crate::chunk::{Chunk, ChunkList};
use crate::manager::{ChunkDestroyedCallback, ChunkManager, ChunkRequestCallback};

/// 在固定预算内按需供给等尺寸分块，预算不足时淘汰最旧的已释放分块。
///
/// # 模块角色（Why）
/// - 长时间运行的采集只关心“最近一段”数据：新分块挤掉最早完成的分块，保持内存占用有界；
/// - 被淘汰的分块先通过销毁回调告知使用方，再进入回收池，下一次供给时直接复用，避免反复分配。
///
/// # 核心机制（How）
/// - `spin::Mutex` 保护全部记账状态：未释放字节、已释放字节、按完成时间排序的已释放链表、回收池与请求队列；
/// - 供给前循环淘汰已释放链表头部，直到 `已释放 + 未释放 + 分块尺寸 <= 预算` 或链表为空；
/// - 一批淘汰只调用一次销毁回调，且在释放锁之后调用；
/// - `request_chunk` 只入队，`fulfill_chunk_requests` 处理进入时的队列长度，回调中的新请求留给下一次。
///
/// # 契约说明（What）
/// - 已发放且未报告销毁的分块字节数之和始终不超过 `max_total_size()`；预算内无法腾出空间时 `get_chunk` 返回 `None`；
/// - 每个发放的分块容量相同，等于 `Chunk::rounded_buffer_bytes(min_chunk_bytes)`；
/// - 已释放链表始终按完成时间升序，完成时间相同者先到先排。
///
/// # 设计权衡（Trade-offs）
/// - 回收池中的分块不计入预算：它们已向使用方报告销毁，只是内存尚未归还分配器；
/// - 在未释放分块已占满预算时直接拒绝，而不是超额分配，使预算成为硬上限。
pub struct LocalLimitChunkManager {
    max_total_bytes: usize,
    chunk_bytes: usize,
    state: Mutex<LocalLimitState>,
}

#[derive(Default)]
struct LocalLimitState {
    unreleased_bytes: usize,
    released_bytes: usize,
    released: ChunkList,
    recycled: ChunkList,
    requests: VecDeque<ChunkRequestCallback>,
    destroyed_callback: Option<ChunkDestroyedCallback>,
}

impl LocalLimitState {
    /// 从已释放链表头部摘下分块，直到可以再容纳 `incoming` 字节。
    fn evict_oldest(&mut self, max_total_bytes: usize, incoming: usize) -> ChunkList {
        let mut evicted = ChunkList::new();
        while self.released_bytes + self.unreleased_bytes + incoming > max_total_bytes {
            let Some(oldest) = self.released.pop_front() else {
                break;
            };
            self.released_bytes = self.released_bytes.saturating_sub(oldest.buffer_bytes());
            evicted.push_back(oldest);
        }
        evicted
    }
}

impl LocalLimitChunkManager {
    /// 以总预算 `max_total_bytes` 与最小分块尺寸 `min_chunk_bytes` 构造。
    pub fn new(max_total_bytes: usize, min_chunk_bytes: usize) -> Self {
        Self {
            max_total_bytes,
            chunk_bytes: Chunk::rounded_buffer_bytes(min_chunk_bytes),
            state: Mutex::new(LocalLimitState::default()),
        }
    }

    /// 每个发放分块的实际缓冲字节数。
    pub fn chunk_buffer_bytes(&self) -> usize {
        self.chunk_bytes
    }

    /// 已发放但尚未归还的字节数。
    pub fn unreleased_bytes(&self) -> usize {
        self.state.lock().unreleased_bytes
    }

    /// 已归还且尚未销毁的字节数。
    pub fn released_bytes(&self) -> usize {
        self.state.lock().released_bytes
    }

    fn notify_destroyed(evicted: &ChunkList, callback: Option<&ChunkDestroyedCallback>) {
        if evicted.is_empty() {
            return;
        }
        debug!(
            chunks = evicted.len(),
            bytes = evicted.total_buffer_bytes(),
            "local-limit manager destroyed released chunks"
        );
        if let Some(callback) = callback {
            callback(evicted);
        }
    }

    fn recycle(&self, evicted: ChunkList) {
        if !evicted.is_empty() {
            self.state.lock().recycled.append(evicted);
        }
    }
}

impl ChunkManager for LocalLimitChunkManager {
    fn max_total_size(&self) -> usize {
        self.max_total_bytes
    }

    fn get_chunk(&self) -> Option<Box<Chunk>> {
        let (mut evicted, pooled, granted, callback) = {
            let mut state = self.state.lock();
            let evicted = state.evict_oldest(self.max_total_bytes, self.chunk_bytes);
            let granted = state.released_bytes + state.unreleased_bytes + self.chunk_bytes
                <= self.max_total_bytes;
            let pooled = if granted {
                state.unreleased_bytes += self.chunk_bytes;
                state.recycled.pop_front()
            } else {
                None
            };
            (evicted, pooled, granted, state.destroyed_callback.clone())
        };

        Self::notify_destroyed(&evicted, callback.as_ref());

        let chunk = if granted {
            let reused = pooled.or_else(|| evicted.pop_front());
            Some(match reused {
                Some(mut chunk) => {
                    chunk.mark_recycled();
                    chunk
                }
                None => Chunk::create(self.chunk_bytes),
            })
        } else {
            trace!(
                max_total_bytes = self.max_total_bytes,
                chunk_bytes = self.chunk_bytes,
                "local-limit manager refused a chunk"
            );
            None
        };

        self.recycle(evicted);
        chunk
    }

    fn request_chunk(&self, callback: ChunkRequestCallback) {
        self.state.lock().requests.push_back(callback);
    }

    fn fulfill_chunk_requests(&self) {
        let pending = self.state.lock().requests.len();
        for _ in 0..pending {
            let Some(callback) = self.state.lock().requests.pop_front() else {
                break;
            };
            let chunk = self.get_chunk();
            trace!(fulfilled = chunk.is_some(), "local-limit chunk request served");
            callback(chunk);
        }
    }

    fn release_chunk(&self, chunks: ChunkList) {
        if chunks.is_empty() {
            return;
        }
        let (evicted, callback) = {
            let mut state = self.state.lock();
            for chunk in chunks {
                let bytes = chunk.buffer_bytes();
                state.unreleased_bytes = state.unreleased_bytes.saturating_sub(bytes);
                state.released_bytes += bytes;
                state.released.insert_by_done_timestamp(chunk);
            }
            trace!(
                released_bytes = state.released_bytes,
                unreleased_bytes = state.unreleased_bytes,
                "local-limit manager received chunks"
            );
            let evicted = state.evict_oldest(self.max_total_bytes, 0);
            let callback = state.destroyed_callback.clone();
            (evicted, callback)
        };
        Self::notify_destroyed(&evicted, callback.as_ref());
        self.recycle(evicted);
    }

    fn set_chunk_destroyed_callback(&self, callback: Option<ChunkDestroyedCallback>) {
        self.state.lock().destroyed_callback = callback;
    }

    fn get_extant_released_chunks(&self) -> ChunkList {
        let mut state = self.state.lock();
        state.released_bytes = 0;
        core::mem::take(&mut state.released)
    }

    fn peek_extant_released_chunks(&self, visitor: &mut dyn FnMut(&ChunkList)) {
        let state = self.state.lock();
        visitor(&state.released);
    }

    fn forget_unreleased_chunks(&self) {
        self.state.lock().unreleased_bytes = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn refuses_when_unreleased_chunks_fill_the_budget() {
        let manager = LocalLimitChunkManager::new(64, 32);
        let a = manager.get_chunk().expect("预算内第一块");
        let b = manager.get_chunk().expect("预算内第二块");
        assert!(manager.get_chunk().is_none(), "未释放分块已占满预算");
        assert_eq!(manager.unreleased_bytes(), 64);
        drop((a, b));
    }

    #[test]
    fn release_moves_bytes_between_ledgers() {
        let manager = LocalLimitChunkManager::new(1024, 100);
        let mut chunk = manager.get_chunk().expect("首块必然成功");
        let bytes = chunk.buffer_bytes();
        assert_eq!(bytes, manager.chunk_buffer_bytes());
        chunk.reserve_initial_block_as_tail(0);
        chunk.mark_done();
        manager.release_chunk(ChunkList::from(chunk));
        assert_eq!(manager.unreleased_bytes(), 0);
        assert_eq!(manager.released_bytes(), bytes);
        let released = manager.get_extant_released_chunks();
        assert_eq!(released.len(), 1);
        assert_eq!(manager.released_bytes(), 0);
    }
}
