//! # chunked_buffer 模块说明
//!
//! ## 角色定位（Why）
//! - [`ChunkedBuffer`] 是剖析器的记录底座：高频接收任意长度的带帧字节块，在有界内存内保留最近的数据，
//!   并以稳定的全局索引支持定点读取与顺序遍历；
//! - 分块的供给、回收与字节预算全部交给 [`ChunkManager`]，缓冲只负责全局索引空间与块的帧格式。
//!
//! ## 核心机制（How）
//! - **两种宏观状态**：未挂接管理器时处于会话外，所有写入干净地失败、所有读取看到“空”；
//!   挂接后进入会话，`buffer_length()` 报告管理器的预算；
//! - **分块流水线**：持有一个当前分块与一个后继分块队列，并始终保持一个在途的异步请求，
//!   当前分块写满时后继分块通常已就绪；
//! - **跨界写入**：块（ULEB128 长度前缀 + 负载）放不进当前分块的剩余空间时，剩余空间写块头，
//!   后继分块开头写块尾；一个块至多跨两个分块；
//! - **有损但一致的淘汰**：管理器销毁分块时通过回调记账，下一次操作开始时把 `range_start`
//!   推过被销毁的区间，被淘汰的块对之后的读取而言如同从未写入。
//!
//! ## 契约（What）
//! - `[range_start, range_end)` 恰好是存活可读的索引集合，`range_start <= range_end`；
//! - 成功写入返回的块索引严格递增；
//! - 容量拒绝与会话外调用都以 `None`/`false`/空索引表达，从不 panic；
//! - 写入回调、读取回调在缓冲锁内执行，回调中不得重入同一缓冲或其管理器；
//! - 读取回调同时运行在管理器的已释放链表锁（`spin::Mutex`）内：共享同一管理器的其他缓冲在读取期间
//!   自旋等待，耗时的序列化应先 [`get_all_chunks`](ChunkedBuffer::get_all_chunks) 再离线遍历。
//!
//! ## 设计权衡（Trade-offs）
//! - 线程安全模式在类型层面选择（[`WithMutex`] / [`WithoutMutex`]），单线程拥有者不付出加锁成本；
//! - 一个块必须严格小于单个分块，换取读写两端最多处理两段字节的简单模型。

mod reader;
mod request;
mod thread_safety;

pub use reader::{BlockIter, Reader};
pub use thread_safety::{ThreadSafety, ThreadSafetyKind, WithMutex, WithoutMutex};

use core::fmt;
use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, trace};

use crate::chunk::{Chunk, ChunkList, ReserveReturn};
use crate::config::BufferConfig;
use crate::entry::{EntryReader, EntryWriter, Serialize};
use crate::error::{BufferError, Result};
use crate::index::{BlockIndex, BufferIndex};
use crate::leb128;
use crate::manager::{ChunkDestroyedCallback, ChunkManager};
use request::{DestroyedLedger, RequestSlot};

/// 缓冲状态快照。
///
/// `cleared_block_count` 统计因分块被管理器销毁而丢失的块，`failed_put_bytes` 统计被拒绝写入的块字节
/// （长度前缀 + 负载）；三个计数器在 `clear`/会话切换时归零。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct State {
    pub range_start: BufferIndex,
    pub range_end: BufferIndex,
    pub pushed_block_count: u64,
    pub cleared_block_count: u64,
    pub failed_put_bytes: u64,
}

/// 分块、追加写的记录缓冲。
///
/// # 教案式说明
/// - **意图 (Why)**：多个写线程以块为单位追加记录，读者按全局索引遍历，内存总量由管理器封顶；
/// - **逻辑 (How)**：全部状态收拢在一个内部结构中，由 `S` 选择的单元（互斥锁或 `RefCell`）保护，
///   每个公开方法在一次加锁内完成；
/// - **契约 (What)**：
///   - [`put`](Self::put) 的回调要么拿到恰好容纳声明长度的写入器，要么拿到 `None`；
///   - [`read_at`](Self::read_at) 对空索引或早于 `range_start` 的索引读取首个存活块，
///     对不早于 `range_end` 的索引给出 `None`；
///   - 丢弃缓冲等价于先调用 [`reset_chunk_manager`](Self::reset_chunk_manager)。
pub struct ChunkedBuffer<S: ThreadSafety = WithMutex> {
    inner: S::Cell<Inner>,
}

struct Inner {
    manager: Option<Arc<dyn ChunkManager>>,
    current: Option<Box<Chunk>>,
    next_chunks: ChunkList,
    requested: Arc<RequestSlot>,
    ledger: Arc<DestroyedLedger>,
    range_start: BufferIndex,
    range_end: BufferIndex,
    next_chunk_range_start: BufferIndex,
    pushed_block_count: u64,
    failed_put_bytes: u64,
}

enum Placement {
    Fits { filled: bool },
    Spans,
    Refused { filled: bool },
}

impl Inner {
    fn new() -> Self {
        Self {
            manager: None,
            current: None,
            next_chunks: ChunkList::new(),
            requested: RequestSlot::new(),
            ledger: Arc::default(),
            range_start: 1,
            range_end: 1,
            next_chunk_range_start: 1,
            pushed_block_count: 0,
            failed_put_bytes: 0,
        }
    }

    /// 把管理器报告的销毁区间并入 `range_start`。
    fn sync_destroyed(&mut self) {
        let destroyed_end = self.ledger.destroyed_range_end();
        if destroyed_end > self.range_start {
            self.range_start = destroyed_end;
            self.range_end = self.range_end.max(destroyed_end);
        }
    }

    fn state(&mut self) -> State {
        self.sync_destroyed();
        State {
            range_start: self.range_start,
            range_end: self.range_end,
            pushed_block_count: self.pushed_block_count,
            cleared_block_count: self.ledger.cleared_block_count(),
            failed_put_bytes: self.failed_put_bytes,
        }
    }

    fn set_chunk_manager(&mut self, manager: Arc<dyn ChunkManager>) {
        self.reset_chunk_manager();
        self.range_start = self.next_chunk_range_start;
        self.range_end = self.next_chunk_range_start;

        let ledger = Arc::clone(&self.ledger);
        let on_destroyed: ChunkDestroyedCallback =
            Arc::new(move |destroyed: &ChunkList| ledger.record(destroyed));
        manager.set_chunk_destroyed_callback(Some(on_destroyed));

        let first = manager.get_chunk();
        let max_total_bytes = manager.max_total_size();
        self.manager = Some(manager);
        if let Some(chunk) = first {
            let chunk = self.take_into_use(chunk);
            self.current = Some(chunk);
        }
        self.request_chunk();
        debug!(
            range_start = self.range_start,
            max_total_bytes,
            has_chunk = self.current.is_some(),
            "chunked buffer attached to a chunk manager"
        );
    }

    fn detach(&mut self) -> bool {
        let Some(manager) = self.manager.take() else {
            return false;
        };
        manager.forget_unreleased_chunks();
        manager.set_chunk_destroyed_callback(None);
        true
    }

    fn reset_chunk_manager(&mut self) {
        self.sync_destroyed();
        let was_attached = self.detach();
        self.current = None;
        self.next_chunks = ChunkList::new();
        self.requested = RequestSlot::new();
        self.ledger = Arc::default();
        self.range_start = self.range_end;
        self.pushed_block_count = 0;
        self.failed_put_bytes = 0;
        if was_attached {
            debug!(
                range_start = self.range_start,
                "chunked buffer detached from its chunk manager"
            );
        }
    }

    /// 为即将开始写入的分块分配全局索引区间。
    fn take_into_use(&mut self, mut chunk: Box<Chunk>) -> Box<Chunk> {
        chunk.set_range_start(self.next_chunk_range_start);
        self.next_chunk_range_start += chunk.buffer_bytes() as BufferIndex;
        chunk.reserve_initial_block_as_tail(0);
        chunk
    }

    fn request_chunk(&mut self) {
        let Some(manager) = &self.manager else {
            return;
        };
        if !self.requested.begin_request() {
            return;
        }
        let slot = Arc::clone(&self.requested);
        manager.request_chunk(Box::new(move |chunk| slot.fulfill(chunk)));
    }

    fn collect_requested_chunk(&mut self) {
        if let Some(chunk) = self.requested.take_fulfilled() {
            self.next_chunks.push_back(chunk);
        }
    }

    /// 确保后继队列非空：先催促在途请求，再退回同步获取。
    fn ensure_next_chunk(&mut self) -> bool {
        if self.next_chunks.is_empty() {
            let Some(manager) = self.manager.clone() else {
                return false;
            };
            if self.requested.is_pending() {
                manager.fulfill_chunk_requests();
            }
            self.collect_requested_chunk();
            if self.next_chunks.is_empty()
                && let Some(chunk) = manager.get_chunk()
            {
                self.next_chunks.push_back(chunk);
            }
        }
        !self.next_chunks.is_empty()
    }

    fn promote_next_chunk(&mut self) {
        if let Some(chunk) = self.next_chunks.pop_front() {
            let chunk = if chunk.range_start() == 0 {
                self.take_into_use(chunk)
            } else {
                chunk
            };
            self.current = Some(chunk);
        }
    }

    fn ensure_current_chunk(&mut self) -> bool {
        if self.current.is_none() && self.ensure_next_chunk() {
            self.promote_next_chunk();
        }
        self.current.is_some()
    }

    /// 封存写满的当前分块交还管理器，并把后继分块提升为当前分块。
    fn retire_current_chunk(&mut self) {
        if let Some(mut filled) = self.current.take() {
            filled.mark_done();
            if let Some(manager) = &self.manager {
                trace!(
                    range_start = filled.range_start(),
                    block_count = filled.block_count(),
                    "chunked buffer released a filled chunk"
                );
                manager.release_chunk(ChunkList::from(filled));
            }
        }
        self.collect_requested_chunk();
        self.promote_next_chunk();
        if self.next_chunks.is_empty() {
            self.request_chunk();
        }
    }

    fn place(&mut self, block_bytes: usize) -> Placement {
        if !self.ensure_current_chunk() {
            return Placement::Refused { filled: false };
        }
        let (remaining, capacity) = match self.current.as_deref() {
            Some(current) => (current.remaining_bytes(), current.buffer_bytes()),
            None => return Placement::Refused { filled: false },
        };
        if block_bytes <= remaining {
            Placement::Fits {
                filled: block_bytes == remaining,
            }
        } else if block_bytes >= capacity {
            Placement::Refused { filled: false }
        } else if self.ensure_next_chunk() {
            Placement::Spans
        } else {
            // 放不下的块同样使当前分块视为已满，之后更小的块也不会再落进来。
            Placement::Refused { filled: true }
        }
    }

    fn reserve_and_put<R>(
        &mut self,
        entry_bytes: impl FnOnce() -> usize,
        callback: impl FnOnce(Option<&mut EntryWriter<'_>>) -> R,
    ) -> R {
        if self.manager.is_none() {
            return callback(None);
        }
        self.sync_destroyed();
        let entry_bytes = entry_bytes();
        let prefix_bytes = leb128::encoded_size(entry_bytes as u64);
        let Some(block_bytes) = prefix_bytes.checked_add(entry_bytes) else {
            let block_bytes = (prefix_bytes as u64).saturating_add(entry_bytes as u64);
            self.failed_put_bytes = self.failed_put_bytes.saturating_add(block_bytes);
            trace!(block_bytes, "chunked buffer refused a block");
            return callback(None);
        };
        self.collect_requested_chunk();

        let mut current_filled = false;
        let mut reservation = None;
        match self.place(block_bytes) {
            Placement::Fits { filled } => {
                current_filled = filled;
                if let Some(current) = self.current.as_deref_mut() {
                    let ReserveReturn { block_index, span } = current.reserve_block(block_bytes);
                    reservation = Some((block_index, span, <&mut [u8]>::default()));
                }
            }
            Placement::Spans => {
                current_filled = true;
                if let (Some(current), Some(next)) =
                    (self.current.as_deref_mut(), self.next_chunks.first_mut())
                {
                    let tail_bytes = block_bytes - current.remaining_bytes();
                    next.set_range_start(self.next_chunk_range_start);
                    self.next_chunk_range_start += next.buffer_bytes() as BufferIndex;
                    let ReserveReturn { block_index, span } = current.reserve_block(block_bytes);
                    let tail = next.reserve_initial_block_as_tail(tail_bytes);
                    reservation = Some((block_index, span, tail));
                }
            }
            Placement::Refused { filled } => current_filled = filled,
        }

        let result = match reservation {
            Some((block_index, first, second)) => {
                let next_block_index =
                    BlockIndex::from_index(block_index.to_index() + block_bytes as BufferIndex);
                let mut writer = EntryWriter::new(first, second, block_index, next_block_index);
                writer.write_uleb128(entry_bytes as u64);
                let result = callback(Some(&mut writer));
                self.range_end = next_block_index.to_index();
                self.pushed_block_count += 1;
                result
            }
            None => {
                self.failed_put_bytes = self.failed_put_bytes.saturating_add(block_bytes as u64);
                trace!(
                    block_bytes,
                    current_filled, "chunked buffer refused a block"
                );
                callback(None)
            }
        };

        if current_filled {
            self.retire_current_chunk();
        }
        result
    }

    fn read<R>(&mut self, f: impl FnOnce(Option<&Reader<'_>>) -> R) -> R {
        let Some(manager) = self.manager.clone() else {
            return f(None);
        };
        self.sync_destroyed();
        let current = self.current.as_deref();
        let (range_start, range_end) = (self.range_start, self.range_end);

        let mut pending = Some(f);
        let mut result = None;
        manager.peek_extant_released_chunks(&mut |released: &ChunkList| {
            if let Some(f) = pending.take() {
                let chunks = released.iter().chain(current).collect();
                result = Some(f(Some(&Reader::new(chunks, range_start, range_end))));
            }
        });
        if let Some(f) = pending.take() {
            // 管理器没有调用访问者：只有当前分块可读。
            return f(Some(&Reader::new(
                current.into_iter().collect(),
                range_start,
                range_end,
            )));
        }
        result.unwrap_or_else(|| unreachable!("read callback consumed without a result"))
    }

    fn get_all_chunks(&mut self) -> ChunkList {
        let Some(manager) = self.manager.clone() else {
            return ChunkList::new();
        };
        self.sync_destroyed();
        self.collect_requested_chunk();

        let mut chunks = manager.get_extant_released_chunks();
        let live = self
            .current
            .take()
            .into_iter()
            .chain(core::mem::take(&mut self.next_chunks));
        for mut chunk in live {
            if !chunk.is_done() {
                chunk.mark_done();
            }
            chunks.push_back(chunk);
        }
        manager.forget_unreleased_chunks();

        self.range_start = self.next_chunk_range_start;
        self.range_end = self.next_chunk_range_start;
        self.ensure_current_chunk();
        self.request_chunk();
        debug!(
            detached_chunks = chunks.len(),
            range_start = self.range_start,
            "chunked buffer detached all chunks"
        );
        chunks
    }

    fn clear(&mut self) {
        self.range_start = self.next_chunk_range_start;
        self.range_end = self.next_chunk_range_start;
        self.pushed_block_count = 0;
        self.failed_put_bytes = 0;
        self.ledger.reset_cleared_block_count();

        let Some(manager) = self.manager.clone() else {
            return;
        };
        let mut released = manager.get_extant_released_chunks();
        for chunk in released.iter_mut() {
            chunk.mark_recycled();
        }
        let recycled = released.len();
        self.next_chunks.append(released);

        match self.current.take() {
            Some(mut current) => {
                if !current.is_done() {
                    current.mark_done();
                }
                current.mark_recycled();
                let current = self.take_into_use(current);
                self.current = Some(current);
            }
            None => {
                self.ensure_current_chunk();
            }
        }
        debug!(
            range_start = self.range_start,
            recycled, "chunked buffer cleared"
        );
    }

    fn is_index_in_current_chunk(&self, index: BufferIndex) -> bool {
        self.current.as_deref().is_some_and(|current| {
            current.range_start() <= index
                && index < current.range_start() + current.offset_past_last_block() as BufferIndex
        })
    }
}

impl<S: ThreadSafety> ChunkedBuffer<S> {
    /// 构造会话外的空缓冲。
    pub fn new() -> Self {
        Self {
            inner: S::new_cell(Inner::new()),
        }
    }

    /// 构造并立即挂接管理器。
    pub fn with_chunk_manager(manager: Arc<dyn ChunkManager>) -> Self {
        let buffer = Self::new();
        buffer.set_chunk_manager(manager);
        buffer
    }

    /// 按配置构造一个挂接本地上限管理器的缓冲。
    ///
    /// 配置中的线程安全模式必须与类型参数 `S` 一致。
    pub fn from_config(config: &BufferConfig) -> Result<Self> {
        if config.thread_safety != S::KIND {
            return Err(BufferError::InvalidConfig {
                field: "thread_safety",
                reason: format!(
                    "configured {:?} but the buffer type is {:?}",
                    config.thread_safety,
                    S::KIND
                ),
            });
        }
        let manager = config.build_local_limit_manager()?;
        Ok(Self::with_chunk_manager(Arc::new(manager)))
    }

    fn with_inner<R>(&self, f: impl FnOnce(&mut Inner) -> R) -> R {
        S::lock(&self.inner, f)
    }

    /// 挂接管理器进入会话；已有会话先被重置，当前内容全部丢弃。
    pub fn set_chunk_manager(&self, manager: Arc<dyn ChunkManager>) {
        self.with_inner(|inner| inner.set_chunk_manager(manager));
    }

    /// 脱离管理器回到会话外；`range_start` 移到原 `range_end`，计数器归零。
    pub fn reset_chunk_manager(&self) {
        self.with_inner(Inner::reset_chunk_manager);
    }

    /// 会话内为管理器的字节预算，会话外为 `None`。
    pub fn buffer_length(&self) -> Option<usize> {
        self.with_inner(|inner| inner.manager.as_ref().map(|m| m.max_total_size()))
    }

    pub fn state(&self) -> State {
        self.with_inner(Inner::state)
    }

    /// 写入一个 `entry_bytes` 字节的块。
    ///
    /// 回调拿到 `Some(writer)` 时，块的长度前缀已写好，写入器恰好剩余 `entry_bytes` 字节；
    /// 会话外或容量不足时拿到 `None`。
    pub fn put<R>(
        &self,
        entry_bytes: usize,
        callback: impl FnOnce(Option<&mut EntryWriter<'_>>) -> R,
    ) -> R {
        self.reserve_and_put(|| entry_bytes, callback)
    }

    /// 同 [`put`](Self::put)，但长度只在确实尝试写入时才计算；会话外不会调用 `entry_bytes`。
    pub fn reserve_and_put<R>(
        &self,
        entry_bytes: impl FnOnce() -> usize,
        callback: impl FnOnce(Option<&mut EntryWriter<'_>>) -> R,
    ) -> R {
        self.with_inner(|inner| inner.reserve_and_put(entry_bytes, callback))
    }

    /// 以原始字节为负载写入一个块，失败时返回空索引。
    pub fn put_from(&self, bytes: &[u8]) -> BlockIndex {
        self.put(bytes.len(), |writer| match writer {
            Some(writer) => {
                writer.write_bytes(bytes);
                writer.current_block_index()
            }
            None => BlockIndex::NULL,
        })
    }

    /// 以 [`Serialize`] 编码的单个值为负载写入一个块。
    pub fn put_object<T: Serialize + ?Sized>(&self, value: &T) -> BlockIndex {
        self.reserve_and_put(
            || value.serialized_bytes(),
            |writer| match writer {
                Some(writer) => {
                    writer.write_object(value);
                    writer.current_block_index()
                }
                None => BlockIndex::NULL,
            },
        )
    }

    /// 把若干值（以元组给出）依次编码进同一个块。
    pub fn put_objects<T: Serialize>(&self, values: T) -> BlockIndex {
        self.put_object(&values)
    }

    /// 以整个缓冲的只读视图调用 `f`；会话外传入 `None`。
    ///
    /// # 锁语义
    /// 视图借用了管理器持有的已释放分块，`f` 因此在管理器锁内执行。其间同一管理器上的
    /// `get_chunk`/`release_chunk`（包括其他缓冲的写入）会自旋等待，`f` 应尽快返回，
    /// 且不得调用该管理器。
    pub fn read<R>(&self, f: impl FnOnce(Option<&Reader<'_>>) -> R) -> R {
        self.with_inner(|inner| inner.read(f))
    }

    /// 读取一个块，索引规则见 [`Reader::iter_from`]。
    pub fn read_at<R>(
        &self,
        block_index: BlockIndex,
        f: impl FnOnce(Option<&mut EntryReader<'_>>) -> R,
    ) -> R {
        self.read(|reader| match reader.and_then(|r| r.at(block_index)) {
            Some(mut entry) => f(Some(&mut entry)),
            None => f(None),
        })
    }

    /// 按索引递增顺序访问每个存活块恰好一次。
    ///
    /// 锁语义同 [`read`](Self::read)：`f` 在管理器锁内执行。
    pub fn read_each(&self, f: impl FnMut(&mut EntryReader<'_>)) {
        self.read(|reader| {
            if let Some(reader) = reader {
                reader.for_each(f);
            }
        });
    }

    /// 同 [`read_each`](Self::read_each)，并把块索引一并交给回调。
    pub fn read_each_indexed(&self, mut f: impl FnMut(&mut EntryReader<'_>, BlockIndex)) {
        self.read_each(|entry| {
            let block_index = entry.current_block_index();
            f(entry, block_index);
        });
    }

    /// 遍历一串已分离分块（例如 [`get_all_chunks`](Self::get_all_chunks) 的结果）中的全部块。
    pub fn read_each_in_chunks(chunks: &ChunkList, f: impl FnMut(&mut EntryReader<'_>)) {
        Reader::new(chunks.iter().collect(), 0, BufferIndex::MAX).for_each(f);
    }

    /// 分离全部分块交给调用方，缓冲换上新的当前分块继续写入；会话外返回空列表。
    pub fn get_all_chunks(&self) -> ChunkList {
        self.with_inner(Inner::get_all_chunks)
    }

    /// 按顺序复制 `other` 的全部存活块，每个块在本缓冲中获得新索引；`other` 保持不变。
    pub fn append_contents<O: ThreadSafety>(&self, other: &ChunkedBuffer<O>) {
        let mut blocks: Vec<Bytes> = Vec::new();
        other.read_each(|entry| blocks.push(Bytes::from(entry.read_remaining())));
        for block in &blocks {
            self.put_from(block);
        }
    }

    /// 丢弃全部内容：`range_start` 跳到下一个分块对齐区间，计数器归零，已释放分块被收回复用。
    pub fn clear(&self) {
        self.with_inner(Inner::clear);
    }

    /// `index` 是否落在正在接收写入的分块的已用区域内。
    pub fn is_index_in_current_chunk(&self, index: BufferIndex) -> bool {
        self.with_inner(|inner| inner.is_index_in_current_chunk(index))
    }
}

impl<S: ThreadSafety> Default for ChunkedBuffer<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S: ThreadSafety> Drop for ChunkedBuffer<S> {
    fn drop(&mut self) {
        self.with_inner(Inner::detach);
    }
}

impl<S: ThreadSafety> fmt::Debug for ChunkedBuffer<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChunkedBuffer")
            .field("thread_safety", &S::KIND)
            .field("state", &self.state())
            .finish()
    }
}
