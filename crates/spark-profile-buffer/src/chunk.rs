//! # chunk 模块说明
//!
//! ## 角色定位（Why）
//! - [`Chunk`] 是一段物理连续的定长字节缓冲，承载零个或多个块片段；缓冲的全局索引空间由若干分块拼接而成；
//! - [`ChunkList`] 是分块的单一所有者序列：一个分块任意时刻只属于一个列表（缓冲的活动列表、
//!   管理器的已释放列表或调用方持有的分离快照），移交通过移动语义完成，无需引用计数。
//!
//! ## 生命周期（What）
//! `create` → 填充（`reserve_*` 只前移偏移）→ `mark_done`（冻结）→ `mark_recycled`（重置头部，可复用）
//! → `Drop`（释放内存）。`mark_recycled` 之前必须 `mark_done`，重复 `mark_done` 属于编程错误。
//!
//! ## 设计权衡（Trade-offs）
//! - 列表用 `VecDeque<Box<Chunk>>` 表达，不在分块内部嵌入 next 指针：头部弹出与尾部拼接都是 O(1)，
//!   且所有权在类型层面唯一；
//! - 容量向上取整到 16 字节倍数，与分配器粒度对齐，调用方只依赖 `buffer_bytes() >= min`。

use core::fmt;
use std::collections::VecDeque;

use crate::index::{BlockIndex, BufferIndex};
use crate::time::TimeStamp;

/// 分块缓冲容量的取整粒度。
pub const BUFFER_ALIGNMENT: usize = 16;

#[derive(Clone, Copy, Debug, Default)]
struct ChunkHeader {
    offset_first_block: usize,
    offset_past_last_block: usize,
    start_timestamp: TimeStamp,
    done_timestamp: Option<TimeStamp>,
    block_count: u32,
    range_start: BufferIndex,
    process_id: u32,
}

/// `reserve_block` 的结果：块首字节的全局索引与本分块内可写的字节片。
///
/// `span.len()` 可能小于请求长度，差额需要写入后继分块。
pub struct ReserveReturn<'a> {
    pub block_index: BlockIndex,
    pub span: &'a mut [u8],
}

/// 一个定长分块。
pub struct Chunk {
    header: ChunkHeader,
    buffer: Box<[u8]>,
}

impl Chunk {
    /// 分配容量至少为 `min_buffer_bytes` 的空分块（最小 [`BUFFER_ALIGNMENT`] 字节）。
    ///
    /// 分配失败由全局分配器终止进程，调用方不得传入不受控的尺寸。
    pub fn create(min_buffer_bytes: usize) -> Box<Chunk> {
        let buffer_bytes = Self::rounded_buffer_bytes(min_buffer_bytes);
        Box::new(Chunk {
            header: ChunkHeader {
                start_timestamp: TimeStamp::now(),
                ..ChunkHeader::default()
            },
            buffer: vec![0u8; buffer_bytes].into_boxed_slice(),
        })
    }

    /// `create(min_buffer_bytes)` 实际分配的缓冲字节数。
    pub const fn rounded_buffer_bytes(min_buffer_bytes: usize) -> usize {
        let min = if min_buffer_bytes == 0 { 1 } else { min_buffer_bytes };
        min.next_multiple_of(BUFFER_ALIGNMENT)
    }

    /// 头部元数据占用的字节数。
    pub const fn sizeof_chunk_metadata() -> usize {
        core::mem::size_of::<ChunkHeader>()
    }

    /// 分块总占用：缓冲字节 + 头部元数据。
    pub fn chunk_bytes(&self) -> usize {
        self.buffer_bytes() + Self::sizeof_chunk_metadata()
    }

    pub fn buffer_bytes(&self) -> usize {
        self.buffer.len()
    }

    pub fn remaining_bytes(&self) -> usize {
        self.buffer_bytes() - self.header.offset_past_last_block
    }

    pub fn offset_first_block(&self) -> usize {
        self.header.offset_first_block
    }

    pub fn offset_past_last_block(&self) -> usize {
        self.header.offset_past_last_block
    }

    /// 块头部起始于本分块的块数量。
    pub fn block_count(&self) -> u32 {
        self.header.block_count
    }

    pub fn start_timestamp(&self) -> TimeStamp {
        self.header.start_timestamp
    }

    /// 完成时间戳；尚未 `mark_done` 时为 `None`。
    pub fn done_timestamp(&self) -> Option<TimeStamp> {
        self.header.done_timestamp
    }

    pub fn is_done(&self) -> bool {
        self.header.done_timestamp.is_some()
    }

    /// 本分块首字节对应的全局索引。
    pub fn range_start(&self) -> BufferIndex {
        self.header.range_start
    }

    pub fn set_range_start(&mut self, range_start: BufferIndex) {
        self.header.range_start = range_start;
    }

    pub fn process_id(&self) -> u32 {
        self.header.process_id
    }

    pub fn set_process_id(&mut self, process_id: u32) {
        self.header.process_id = process_id;
    }

    /// 整个缓冲的只读视图（含尚未写入的尾部）。
    pub fn buffer(&self) -> &[u8] {
        &self.buffer
    }

    /// 在偏移 0 处占用 `length` 字节作为前驱分块中某个块的尾部，不计入块数量。
    ///
    /// # Panics
    /// 分块已有内容、已完成，或 `length` 超过缓冲容量。
    pub fn reserve_initial_block_as_tail(&mut self, length: usize) -> &mut [u8] {
        assert!(!self.is_done(), "reserve on a chunk already marked done");
        assert_eq!(
            self.header.offset_past_last_block, 0,
            "initial tail must be the first reservation in a chunk"
        );
        assert!(
            length <= self.buffer_bytes(),
            "initial tail longer than the chunk buffer"
        );
        self.header.offset_first_block = length;
        self.header.offset_past_last_block = length;
        &mut self.buffer[..length]
    }

    /// 在已用区域之后占用至多 `length` 字节作为一个新块。
    ///
    /// 剩余空间不足时只返回剩余部分（可能为空），从不失败，块数量总是加一。
    pub fn reserve_block(&mut self, length: usize) -> ReserveReturn<'_> {
        assert!(!self.is_done(), "reserve on a chunk already marked done");
        let start = self.header.offset_past_last_block;
        let end = start + length.min(self.remaining_bytes());
        self.header.offset_past_last_block = end;
        self.header.block_count += 1;
        ReserveReturn {
            block_index: BlockIndex::from_index(self.header.range_start + start as BufferIndex),
            span: &mut self.buffer[start..end],
        }
    }

    /// 记录完成时间戳并冻结分块。
    ///
    /// # Panics
    /// 在未经 `mark_recycled` 的情况下重复调用。
    pub fn mark_done(&mut self) {
        assert!(
            !self.is_done(),
            "Chunk::mark_done called on a chunk already marked done"
        );
        self.header.done_timestamp = Some(TimeStamp::unique_now());
    }

    /// 重置头部以便复用；容量与进程标识保持不变。
    ///
    /// # Panics
    /// 分块尚未 `mark_done`。
    pub fn mark_recycled(&mut self) {
        assert!(
            self.is_done(),
            "Chunk::mark_recycled called before mark_done"
        );
        self.header.offset_first_block = 0;
        self.header.offset_past_last_block = 0;
        self.header.block_count = 0;
        self.header.range_start = 0;
        self.header.done_timestamp = None;
        self.header.start_timestamp = TimeStamp::now();
    }
}

impl fmt::Debug for Chunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Chunk")
            .field("buffer_bytes", &self.buffer_bytes())
            .field("offset_first_block", &self.header.offset_first_block)
            .field("offset_past_last_block", &self.header.offset_past_last_block)
            .field("block_count", &self.header.block_count)
            .field("range_start", &self.header.range_start)
            .field("done_timestamp", &self.header.done_timestamp)
            .finish()
    }
}

/// 分块的独占序列。
///
/// # 教案式说明
/// - **意图 (Why)**：在释放、分离、回收等交接点整体移交一串分块；
/// - **契约 (What)**：
///   - [`pop_front`](Self::pop_front) 交出首个分块（对应“释放 next”）；
///   - [`append`](Self::append) 把另一列表整体接到尾部（对应“设置 last”），O(1) 摊还；
///   - [`insert_by_done_timestamp`](Self::insert_by_done_timestamp) 维持按完成时间升序，
///     时间相同时新分块排在已有分块之后（先进先出）。
#[derive(Debug, Default)]
pub struct ChunkList {
    chunks: VecDeque<Box<Chunk>>,
}

impl ChunkList {
    pub const fn new() -> Self {
        Self {
            chunks: VecDeque::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn first(&self) -> Option<&Chunk> {
        self.chunks.front().map(|c| &**c)
    }

    pub fn first_mut(&mut self) -> Option<&mut Chunk> {
        self.chunks.front_mut().map(|c| &mut **c)
    }

    pub fn last(&self) -> Option<&Chunk> {
        self.chunks.back().map(|c| &**c)
    }

    pub fn push_back(&mut self, chunk: Box<Chunk>) {
        self.chunks.push_back(chunk);
    }

    pub fn pop_front(&mut self) -> Option<Box<Chunk>> {
        self.chunks.pop_front()
    }

    pub fn append(&mut self, mut other: ChunkList) {
        if self.chunks.is_empty() {
            *self = other;
        } else {
            self.chunks.append(&mut other.chunks);
        }
    }

    /// 按完成时间戳插入一个已完成分块。
    ///
    /// # Panics
    /// 分块尚未 `mark_done`。
    pub fn insert_by_done_timestamp(&mut self, chunk: Box<Chunk>) {
        let done = chunk
            .done_timestamp()
            .unwrap_or_else(|| panic!("only done chunks can be ordered by done timestamp"));
        let position = self
            .chunks
            .partition_point(|existing| existing.done_timestamp().is_some_and(|d| d <= done));
        self.chunks.insert(position, chunk);
    }

    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &Chunk> + ExactSizeIterator {
        self.chunks.iter().map(|c| &**c)
    }

    pub fn iter_mut(&mut self) -> impl DoubleEndedIterator<Item = &mut Chunk> + ExactSizeIterator {
        self.chunks.iter_mut().map(|c| &mut **c)
    }

    /// 所有分块 `buffer_bytes()` 之和。
    pub fn total_buffer_bytes(&self) -> usize {
        self.iter().map(Chunk::buffer_bytes).sum()
    }
}

impl From<Box<Chunk>> for ChunkList {
    fn from(chunk: Box<Chunk>) -> Self {
        let mut list = ChunkList::new();
        list.push_back(chunk);
        list
    }
}

impl FromIterator<Box<Chunk>> for ChunkList {
    fn from_iter<I: IntoIterator<Item = Box<Chunk>>>(iter: I) -> Self {
        ChunkList {
            chunks: iter.into_iter().collect(),
        }
    }
}

impl IntoIterator for ChunkList {
    type Item = Box<Chunk>;
    type IntoIter = std::collections::vec_deque::IntoIter<Box<Chunk>>;

    fn into_iter(self) -> Self::IntoIter {
        self.chunks.into_iter()
    }
}
