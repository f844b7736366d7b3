//! # controlled 模块说明
//!
//! ## 角色定位（Why）
//! - 上层（例如跨进程的内存协调者）需要观察缓冲占用的变化：有多少字节仍在写入、多少字节已归还、
//!   最旧的存活数据完成于何时；
//! - [`ControlledChunkManager`] 包装任意 [`ChunkManager`]，在每次改变状态的操作之后发出一次 [`Update`]，
//!   [`Update::fold`] 让消费者可以合并高频更新而不丢失信息。
//!
//! ## 协议（What）
//! - 设置回调时立即发出一次快照，快照的“新释放”列表包含当前全部已释放分块，作为同步起点；
//! - 之后 `get_chunk` 成功、请求被满足、`release_chunk`、`get_extant_released_chunks`、
//!   `forget_unreleased_chunks` 各发出恰好一次快照；
//! - 替换或清除回调时，旧回调收到 [`Update::Final`]，此后不会再收到任何更新；
//! - [`ControlledChunkManager::subscribe`] 返回的 [`UpdateSubscription`] 在 `clear()` 或 `Drop` 时完成同样的收尾。

use std::sync::{Arc, Weak};

use spin::Mutex;
use tracing::trace;

use crate::chunk::{Chunk, ChunkList};
use crate::manager::{ChunkDestroyedCallback, ChunkManager, ChunkRequestCallback};
use crate::time::TimeStamp;

/// 单个已释放分块的元数据。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ChunkMetadata {
    pub done_timestamp: TimeStamp,
    pub buffer_bytes: usize,
}

impl ChunkMetadata {
    /// 提取已完成分块的元数据；未完成分块返回 `None`。
    pub fn of(chunk: &Chunk) -> Option<Self> {
        chunk.done_timestamp().map(|done_timestamp| ChunkMetadata {
            done_timestamp,
            buffer_bytes: chunk.buffer_bytes(),
        })
    }
}

/// 一次占用快照。
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct UpdateSnapshot {
    pub unreleased_bytes: usize,
    pub released_bytes: usize,
    /// 已释放且未销毁分块中最早的完成时间；没有这样的分块时为 `None`。
    pub oldest_done_timestamp: Option<TimeStamp>,
    /// 自上一次快照以来新释放的分块，按释放顺序排列。
    pub newly_released_chunks: Vec<ChunkMetadata>,
}

/// 占用通知。
///
/// # 教案式说明
/// - **意图 (Why)**：三态和类型把“无事发生”“收尾”“真实快照”区分开，合并逻辑是一个纯函数；
/// - **契约 (What)**：
///   - 默认值为 [`Update::NotAnUpdate`]；
///   - `fold` 满足：把 `B` 合并进 `A` 与依次观察 `A`、`B` 得到相同的字节计数、最旧时间戳，
///     且新释放列表为两者拼接后剔除早于新最旧时间戳的条目；
///   - 合并 `Final` 得到 `Final`，`Final` 之后的任何更新都被忽略。
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum Update {
    #[default]
    NotAnUpdate,
    Final,
    Snapshot(UpdateSnapshot),
}

impl Update {
    pub fn snapshot(
        unreleased_bytes: usize,
        released_bytes: usize,
        oldest_done_timestamp: Option<TimeStamp>,
        newly_released_chunks: Vec<ChunkMetadata>,
    ) -> Self {
        Update::Snapshot(UpdateSnapshot {
            unreleased_bytes,
            released_bytes,
            oldest_done_timestamp,
            newly_released_chunks,
        })
    }

    pub fn is_not_update(&self) -> bool {
        matches!(self, Update::NotAnUpdate)
    }

    pub fn is_final(&self) -> bool {
        matches!(self, Update::Final)
    }

    pub fn as_snapshot(&self) -> Option<&UpdateSnapshot> {
        match self {
            Update::Snapshot(snapshot) => Some(snapshot),
            _ => None,
        }
    }

    /// 回到 `NotAnUpdate`。
    pub fn clear(&mut self) {
        *self = Update::NotAnUpdate;
    }

    /// 把更晚的 `newer` 合并进 `self`。
    pub fn fold(&mut self, newer: Update) {
        match newer {
            Update::NotAnUpdate => {}
            _ if self.is_final() => {}
            Update::Final => *self = Update::Final,
            Update::Snapshot(newer) => match self {
                Update::Snapshot(current) => {
                    current.unreleased_bytes = newer.unreleased_bytes;
                    current.released_bytes = newer.released_bytes;
                    current.oldest_done_timestamp = newer.oldest_done_timestamp;
                    if let Some(oldest) = newer.oldest_done_timestamp {
                        current
                            .newly_released_chunks
                            .retain(|metadata| metadata.done_timestamp >= oldest);
                    }
                    current
                        .newly_released_chunks
                        .extend(newer.newly_released_chunks);
                }
                _ => *self = Update::Snapshot(newer),
            },
        }
    }
}

/// 接收占用通知的回调。
pub type UpdateCallback = Arc<dyn Fn(Update) + Send + Sync>;

struct ControlledState {
    unreleased_bytes: usize,
    update_callback: Option<UpdateCallback>,
    generation: u64,
}

struct ControlledCore<M> {
    inner: M,
    state: Mutex<ControlledState>,
}

impl<M: ChunkManager> ControlledCore<M> {
    fn released_view(
        &self,
        newly_from_released: bool,
    ) -> (usize, Option<TimeStamp>, Vec<ChunkMetadata>) {
        let mut view = (0, None, Vec::new());
        self.inner.peek_extant_released_chunks(&mut |released: &ChunkList| {
            view.0 = released.total_buffer_bytes();
            view.1 = released.first().and_then(Chunk::done_timestamp);
            if newly_from_released {
                view.2 = released.iter().filter_map(ChunkMetadata::of).collect();
            }
        });
        view
    }

    /// 在锁内更新未释放字节，锁外发出快照。
    fn notify(&self, adjust: impl FnOnce(&mut usize), newly_released: Vec<ChunkMetadata>) {
        let (released_bytes, oldest, _) = self.released_view(false);
        let (unreleased_bytes, callback) = {
            let mut state = self.state.lock();
            adjust(&mut state.unreleased_bytes);
            (state.unreleased_bytes, state.update_callback.clone())
        };
        if let Some(callback) = callback {
            callback(Update::snapshot(
                unreleased_bytes,
                released_bytes,
                oldest,
                newly_released,
            ));
        }
    }

    fn on_chunk_granted(&self, chunk: Option<&Chunk>) {
        if let Some(chunk) = chunk {
            let bytes = chunk.buffer_bytes();
            self.notify(|unreleased| *unreleased += bytes, Vec::new());
        }
    }

    /// 替换回调，返回新回调的代号。
    fn replace_callback(&self, callback: Option<UpdateCallback>) -> u64 {
        let (previous, generation, unreleased_bytes) = {
            let mut state = self.state.lock();
            state.generation += 1;
            let previous = core::mem::replace(&mut state.update_callback, callback.clone());
            (previous, state.generation, state.unreleased_bytes)
        };
        if let Some(previous) = previous {
            previous(Update::Final);
        }
        if let Some(callback) = callback {
            let (released_bytes, oldest, newly) = self.released_view(true);
            callback(Update::snapshot(unreleased_bytes, released_bytes, oldest, newly));
        }
        generation
    }
}

/// 订阅端可见的取消接口，擦除管理器类型。
trait UpdateSource: Send + Sync {
    fn unsubscribe(&self, generation: u64);
}

impl<M: ChunkManager> UpdateSource for ControlledCore<M> {
    fn unsubscribe(&self, generation: u64) {
        let previous = {
            let mut state = self.state.lock();
            if state.generation != generation {
                return;
            }
            state.generation += 1;
            state.update_callback.take()
        };
        if let Some(previous) = previous {
            previous(Update::Final);
        }
    }
}

/// 为任意管理器附加占用通知。
///
/// # 核心机制（How）
/// - 自身只记录未释放字节；已释放字节与最旧完成时间通过 `peek_extant_released_chunks` 从内层读取；
/// - 异步请求的回调被包装：内层满足请求时先发出更新，再把分块交给原回调；
/// - 所有通知都在释放内部锁之后发出，回调可以重入管理器。
pub struct ControlledChunkManager<M: ChunkManager + 'static> {
    core: Arc<ControlledCore<M>>,
}

impl<M: ChunkManager + 'static> ControlledChunkManager<M> {
    pub fn new(inner: M) -> Self {
        Self {
            core: Arc::new(ControlledCore {
                inner,
                state: Mutex::new(ControlledState {
                    unreleased_bytes: 0,
                    update_callback: None,
                    generation: 0,
                }),
            }),
        }
    }

    /// 被包装的管理器。
    pub fn inner(&self) -> &M {
        &self.core.inner
    }

    /// 设置或清除更新回调。
    ///
    /// 旧回调（若有）先收到 [`Update::Final`]；新回调（若有）随即收到一次初始快照。
    pub fn set_update_callback(&self, callback: Option<UpdateCallback>) {
        self.core.replace_callback(callback);
    }

    /// 设置更新回调并返回订阅句柄，句柄清除或析构时回调收到 [`Update::Final`]。
    ///
    /// 若之后有新的回调替换了本订阅，句柄的清除不再产生任何效果。
    pub fn subscribe(
        &self,
        callback: impl Fn(Update) + Send + Sync + 'static,
    ) -> UpdateSubscription {
        let generation = self.core.replace_callback(Some(Arc::new(callback)));
        let core: Arc<dyn UpdateSource> = self.core.clone();
        let source = Arc::downgrade(&core);
        UpdateSubscription {
            source: Some(source),
            generation,
        }
    }
}

impl<M: ChunkManager + 'static> ChunkManager for ControlledChunkManager<M> {
    fn max_total_size(&self) -> usize {
        self.core.inner.max_total_size()
    }

    fn get_chunk(&self) -> Option<Box<Chunk>> {
        let chunk = self.core.inner.get_chunk();
        self.core.on_chunk_granted(chunk.as_deref());
        chunk
    }

    fn request_chunk(&self, callback: ChunkRequestCallback) {
        let core = Arc::clone(&self.core);
        self.core.inner.request_chunk(Box::new(move |chunk| {
            core.on_chunk_granted(chunk.as_deref());
            callback(chunk);
        }));
    }

    fn fulfill_chunk_requests(&self) {
        self.core.inner.fulfill_chunk_requests();
    }

    fn release_chunk(&self, chunks: ChunkList) {
        if chunks.is_empty() {
            return;
        }
        let newly_released: Vec<ChunkMetadata> =
            chunks.iter().filter_map(ChunkMetadata::of).collect();
        let bytes = chunks.total_buffer_bytes();
        trace!(chunks = chunks.len(), bytes, "controlled manager releasing chunks");
        self.core.inner.release_chunk(chunks);
        self.core.notify(
            |unreleased| *unreleased = unreleased.saturating_sub(bytes),
            newly_released,
        );
    }

    fn set_chunk_destroyed_callback(&self, callback: Option<ChunkDestroyedCallback>) {
        self.core.inner.set_chunk_destroyed_callback(callback);
    }

    fn get_extant_released_chunks(&self) -> ChunkList {
        let released = self.core.inner.get_extant_released_chunks();
        self.core.notify(|_| {}, Vec::new());
        released
    }

    fn peek_extant_released_chunks(&self, visitor: &mut dyn FnMut(&ChunkList)) {
        self.core.inner.peek_extant_released_chunks(visitor);
    }

    fn forget_unreleased_chunks(&self) {
        self.core.inner.forget_unreleased_chunks();
        self.core.notify(|unreleased| *unreleased = 0, Vec::new());
    }
}

/// 更新回调的订阅句柄。
#[must_use = "dropping the subscription immediately sends the final update"]
pub struct UpdateSubscription {
    source: Option<Weak<dyn UpdateSource>>,
    generation: u64,
}

impl UpdateSubscription {
    /// 结束订阅；回调收到 [`Update::Final`]。重复调用无效果。
    pub fn clear(&mut self) {
        if let Some(source) = self.source.take().and_then(|weak| weak.upgrade()) {
            source.unsubscribe(self.generation);
        }
    }
}

impl Drop for UpdateSubscription {
    fn drop(&mut self) {
        self.clear();
    }
}
