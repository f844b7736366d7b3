use bytes::Buf;

use crate::chunk::Chunk;
use crate::entry::EntryReader;
use crate::index::{BlockIndex, BufferIndex};
use crate::leb128;

/// 在一串分块上按全局索引顺序遍历块。
///
/// # 教案式说明
/// - **意图 (Why)**：块可能从一个分块的尾部跨进后继分块的开头，遍历需要把两段拼回一个负载；
/// - **逻辑 (How)**：
///   - 游标由“分块序号 + 分块内偏移”构成，进入新分块时从 `offset_first_block` 开始，跳过前驱块的尾部；
///   - 长度前缀通过 `Buf::chain` 在本分块已用区域与后继分块尾部区域上增量解码，前缀本身也可以跨界；
///   - 后继分块只有在全局索引与本分块首尾相接时才被视为同一块的延续；
/// - **契约 (What)**：
///   - 只产出索引落在 `[range_start, range_end)` 内的块，严格递增；
///   - 产出的读取器携带下一个存活块的索引，最后一个存活块为空索引；
///   - 遇到不完整的块（后继分块缺失或前缀损坏）时停止遍历。
#[derive(Clone)]
pub struct BlockIter<'a> {
    chunks: &'a [&'a Chunk],
    chunk: usize,
    offset: usize,
    range_start: BufferIndex,
    range_end: BufferIndex,
}

struct RawBlock<'a> {
    block_index: BufferIndex,
    first: &'a [u8],
    second: &'a [u8],
}

impl<'a> BlockIter<'a> {
    pub(crate) fn new(chunks: &'a [&'a Chunk], range_start: BufferIndex, range_end: BufferIndex) -> Self {
        Self {
            chunks,
            chunk: 0,
            offset: chunks.first().map_or(0, |c| c.offset_first_block()),
            range_start,
            range_end,
        }
    }

    fn exhausted(chunks: &'a [&'a Chunk]) -> Self {
        Self {
            chunks,
            chunk: chunks.len(),
            offset: 0,
            range_start: 0,
            range_end: 0,
        }
    }

    /// 从首个索引不小于 `index` 的块开始。
    fn seek(mut self, index: BufferIndex) -> Self {
        if let Some(position) = self.chunks.iter().position(|c| {
            c.range_start() != 0 && index < c.range_start() + c.buffer_bytes() as BufferIndex
        }) {
            self.chunk = position;
            self.offset = self.chunks[position].offset_first_block();
        }
        let mut probe = self.clone();
        while let Some(block) = probe.next_raw() {
            if block.block_index >= index {
                break;
            }
            self = probe.clone();
        }
        self
    }

    fn next_raw(&mut self) -> Option<RawBlock<'a>> {
        loop {
            let chunk = *self.chunks.get(self.chunk)?;
            let used_end = chunk.offset_past_last_block();
            if self.offset >= used_end {
                self.chunk += 1;
                self.offset = self.chunks.get(self.chunk)?.offset_first_block();
                continue;
            }

            let following = self
                .chunks
                .get(self.chunk + 1)
                .copied()
                .filter(|n| n.range_start() == chunk.range_start() + chunk.buffer_bytes() as BufferIndex);
            let used = &chunk.buffer()[self.offset..used_end];
            let tail: &'a [u8] = following.map_or(&[][..], |n| &n.buffer()[..n.offset_first_block()]);

            let entry_bytes = leb128::read::<u64, _>(&mut used.chain(tail)).ok()?;
            let entry_bytes = usize::try_from(entry_bytes).ok()?;
            let header_end = self.offset + leb128::encoded_size(entry_bytes as u64);
            let block_end = header_end.checked_add(entry_bytes)?;
            let block_index = chunk.range_start() + self.offset as BufferIndex;

            if block_end <= used_end {
                self.offset = block_end;
                return Some(RawBlock {
                    block_index,
                    first: &chunk.buffer()[header_end..block_end],
                    second: &[],
                });
            }

            let next = following?;
            if block_end - used_end != next.offset_first_block() {
                return None;
            }
            let first = &chunk.buffer()[header_end.min(used_end)..used_end];
            let second = &next.buffer()[header_end.saturating_sub(used_end)..next.offset_first_block()];
            self.chunk += 1;
            self.offset = next.offset_first_block();
            return Some(RawBlock {
                block_index,
                first,
                second,
            });
        }
    }

    fn next_live(&mut self) -> Option<RawBlock<'a>> {
        while let Some(block) = self.next_raw() {
            if block.block_index >= self.range_end {
                self.chunk = self.chunks.len();
                return None;
            }
            if block.block_index >= self.range_start {
                return Some(block);
            }
        }
        None
    }
}

impl<'a> Iterator for BlockIter<'a> {
    type Item = EntryReader<'a>;

    fn next(&mut self) -> Option<EntryReader<'a>> {
        let block = self.next_live()?;
        let next_block_index = self
            .clone()
            .next_live()
            .map_or(BlockIndex::NULL, |b| BlockIndex::from_index(b.block_index));
        Some(EntryReader::new(
            block.first,
            block.second,
            BlockIndex::from_index(block.block_index),
            next_block_index,
        ))
    }
}

/// 整个缓冲的只读视图，由 [`ChunkedBuffer::read`](super::ChunkedBuffer::read) 提供。
///
/// 视图存在期间缓冲与管理器均处于锁定状态，回调内不得再调用它们。
pub struct Reader<'a> {
    chunks: Vec<&'a Chunk>,
    range_start: BufferIndex,
    range_end: BufferIndex,
}

impl<'a> Reader<'a> {
    pub(crate) fn new(chunks: Vec<&'a Chunk>, range_start: BufferIndex, range_end: BufferIndex) -> Self {
        Self {
            chunks,
            range_start,
            range_end,
        }
    }

    /// 从第一个存活块开始遍历。
    pub fn iter(&self) -> BlockIter<'_> {
        BlockIter::new(&self.chunks, self.range_start, self.range_end)
    }

    /// 从 `block_index` 开始遍历：空索引或早于存活区间时从第一个存活块开始，越过区间末尾时为空。
    pub fn iter_from(&self, block_index: BlockIndex) -> BlockIter<'_> {
        let index = block_index.to_index();
        if block_index.is_null() || index < self.range_start {
            self.iter()
        } else if index >= self.range_end {
            BlockIter::exhausted(&self.chunks)
        } else {
            self.iter().seek(index)
        }
    }

    /// 按 [`iter_from`](Self::iter_from) 的规则定位一个块。
    pub fn at(&self, block_index: BlockIndex) -> Option<EntryReader<'_>> {
        self.iter_from(block_index).next()
    }

    pub fn for_each(&self, mut f: impl FnMut(&mut EntryReader<'_>)) {
        for mut entry in self.iter() {
            f(&mut entry);
        }
    }

    /// 存活区间的起点。
    pub fn range_start(&self) -> BufferIndex {
        self.range_start
    }

    /// 存活区间的终点（不含）。
    pub fn range_end(&self) -> BufferIndex {
        self.range_end
    }
}

impl<'r> IntoIterator for &'r Reader<'_> {
    type Item = EntryReader<'r>;
    type IntoIter = BlockIter<'r>;

    fn into_iter(self) -> BlockIter<'r> {
        self.iter()
    }
}
