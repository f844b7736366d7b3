//! 单分块管理器：整个生命周期只管理一个分块。

use spin::Mutex;

use crate::chunk::{Chunk, ChunkList};
use crate::manager::{ChunkDestroyedCallback, ChunkManager, ChunkRequestCallback};

/// 只持有一个分块的管理器。
///
/// # 教案式说明
/// - **意图 (Why)**：定长部署（例如一次性采集）只需要一块缓冲，写满即止，不做淘汰；
/// - **契约 (What)**：
///   - 首次 `get_chunk`/`request_chunk` 交出分块，之后所有请求失败，直到 [`reset`](Self::reset)；
///   - 分块归还后进入已释放槽位，但不会再次被交出；
///   - 销毁回调只被保存，永远不会被调用；
///   - `request_chunk` 立即调用回调，`fulfill_chunk_requests` 不做任何事。
pub struct SingleChunkManager {
    inner: Mutex<SingleInner>,
}

struct SingleInner {
    initial_chunk: Option<Box<Chunk>>,
    released_chunk: ChunkList,
    buffer_bytes: usize,
    // 保存以满足接口，单分块从不销毁。
    _destroyed_callback: Option<ChunkDestroyedCallback>,
}

impl SingleChunkManager {
    /// 分配一个容量至少为 `min_buffer_bytes` 的分块并托管。
    pub fn new(min_buffer_bytes: usize) -> Self {
        Self::with_chunk(Chunk::create(min_buffer_bytes))
    }

    /// 托管调用方提供的分块；已完成的分块会先被回收。
    pub fn with_chunk(chunk: Box<Chunk>) -> Self {
        let manager = Self {
            inner: Mutex::new(SingleInner {
                initial_chunk: None,
                released_chunk: ChunkList::new(),
                buffer_bytes: 0,
                _destroyed_callback: None,
            }),
        };
        manager.reset(Some(chunk));
        manager
    }

    /// 原子地替换托管分块，并丢弃已释放槽位。
    ///
    /// 新分块在交出前被回收（必要时先标记完成）；`max_total_size` 随之变为其容量，传入 `None` 时为 0。
    pub fn reset(&self, chunk: Option<Box<Chunk>>) {
        let chunk = chunk.map(|mut chunk| {
            if !chunk.is_done() {
                chunk.mark_done();
            }
            chunk.mark_recycled();
            chunk
        });
        let stale = {
            let mut inner = self.inner.lock();
            inner.buffer_bytes = chunk.as_ref().map_or(0, |c| c.buffer_bytes());
            inner.initial_chunk = chunk;
            core::mem::take(&mut inner.released_chunk)
        };
        drop(stale);
    }
}

impl ChunkManager for SingleChunkManager {
    fn max_total_size(&self) -> usize {
        self.inner.lock().buffer_bytes
    }

    fn get_chunk(&self) -> Option<Box<Chunk>> {
        self.inner.lock().initial_chunk.take()
    }

    fn request_chunk(&self, callback: ChunkRequestCallback) {
        let chunk = self.get_chunk();
        callback(chunk);
    }

    fn fulfill_chunk_requests(&self) {}

    fn release_chunk(&self, chunks: ChunkList) {
        if chunks.is_empty() {
            return;
        }
        assert_eq!(
            chunks.len(),
            1,
            "SingleChunkManager can only receive its one chunk"
        );
        let mut inner = self.inner.lock();
        assert!(
            inner.released_chunk.is_empty(),
            "SingleChunkManager already holds a released chunk"
        );
        inner.released_chunk = chunks;
    }

    fn set_chunk_destroyed_callback(&self, callback: Option<ChunkDestroyedCallback>) {
        self.inner.lock()._destroyed_callback = callback;
    }

    fn get_extant_released_chunks(&self) -> ChunkList {
        core::mem::take(&mut self.inner.lock().released_chunk)
    }

    fn peek_extant_released_chunks(&self, visitor: &mut dyn FnMut(&ChunkList)) {
        let inner = self.inner.lock();
        visitor(&inner.released_chunk);
    }

    fn forget_unreleased_chunks(&self) {}
}
