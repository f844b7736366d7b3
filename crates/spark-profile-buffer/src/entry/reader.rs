use bytes::Buf;

use crate::entry::Deserialize;
use crate::error::Result;
use crate::index::BlockIndex;
use crate::leb128;

/// 指向一个块负载的只读视图，负载可能由两个字节片拼成。
///
/// 复制一个读取器（`Clone`）即可在不影响原读取器的情况下预读。
#[derive(Clone, Debug)]
pub struct EntryReader<'a> {
    first: &'a [u8],
    second: &'a [u8],
    position: usize,
    block_index: BlockIndex,
    next_block_index: BlockIndex,
}

impl<'a> EntryReader<'a> {
    pub(crate) fn new(
        first: &'a [u8],
        second: &'a [u8],
        block_index: BlockIndex,
        next_block_index: BlockIndex,
    ) -> Self {
        Self {
            first,
            second,
            position: 0,
            block_index,
            next_block_index,
        }
    }

    /// 尚未读取的负载字节数。
    pub fn remaining_bytes(&self) -> usize {
        self.first.len() + self.second.len() - self.position
    }

    pub fn current_block_index(&self) -> BlockIndex {
        self.block_index
    }

    /// 下一个存活块的索引；本块是最后一个存活块时为空。
    pub fn next_block_index(&self) -> BlockIndex {
        self.next_block_index
    }

    fn current_span(&self) -> &'a [u8] {
        let (first, second): (&'a [u8], &'a [u8]) = (self.first, self.second);
        if self.position < first.len() {
            &first[self.position..]
        } else {
            &second[self.position - first.len()..]
        }
    }

    /// 读满 `out`。
    ///
    /// # Panics
    /// `out.len()` 超过 [`remaining_bytes`](Self::remaining_bytes)。
    pub fn read_bytes(&mut self, out: &mut [u8]) {
        assert!(
            out.len() <= self.remaining_bytes(),
            "EntryReader underflow: reading {} bytes with {} remaining",
            out.len(),
            self.remaining_bytes()
        );
        let mut filled = 0;
        while filled < out.len() {
            let span = self.current_span();
            let n = span.len().min(out.len() - filled);
            out[filled..filled + n].copy_from_slice(&span[..n]);
            self.position += n;
            filled += n;
        }
    }

    /// 读取剩余全部负载。
    pub fn read_remaining(&mut self) -> Vec<u8> {
        let mut out = vec![0u8; self.remaining_bytes()];
        self.read_bytes(&mut out);
        out
    }

    pub fn read_uleb128(&mut self) -> Result<u64> {
        leb128::read(self)
    }

    /// 按 [`Deserialize`] 解码一个值并前移读取位置。
    pub fn read_object<T: Deserialize>(&mut self) -> Result<T> {
        T::deserialize(self)
    }

    /// 解码一个值但不前移读取位置。
    pub fn peek_object<T: Deserialize>(&self) -> Result<T> {
        self.clone().read_object()
    }
}

impl Buf for EntryReader<'_> {
    fn remaining(&self) -> usize {
        self.remaining_bytes()
    }

    fn chunk(&self) -> &[u8] {
        self.current_span()
    }

    fn advance(&mut self, cnt: usize) {
        assert!(
            cnt <= self.remaining_bytes(),
            "EntryReader::advance past the end of the block"
        );
        self.position += cnt;
    }
}
