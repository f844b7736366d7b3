use bytes::BufMut;
use bytes::buf::UninitSlice;

use crate::entry::Serialize;
use crate::index::BlockIndex;
use crate::leb128;

/// 指向一个块负载的写入视图。
///
/// # 教案式说明
/// - **意图 (Why)**：负载可能跨越两个分块，写入端无需关心切分位置；
/// - **契约 (What)**：
///   - 可写字节数恰好等于 `put` 时声明的负载长度，超出写入直接 panic；
///   - [`current_block_index`](Self::current_block_index) 是本块的索引，写入完成后即可用于 `read_at`；
///   - 回调返回后写入视图失效，未写满的字节保持分块中原有内容。
pub struct EntryWriter<'a> {
    first: &'a mut [u8],
    second: &'a mut [u8],
    position: usize,
    block_index: BlockIndex,
    next_block_index: BlockIndex,
}

impl<'a> EntryWriter<'a> {
    pub(crate) fn new(
        first: &'a mut [u8],
        second: &'a mut [u8],
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

    /// 尚未写入的负载字节数。
    pub fn remaining_bytes(&self) -> usize {
        self.first.len() + self.second.len() - self.position
    }

    pub fn current_block_index(&self) -> BlockIndex {
        self.block_index
    }

    /// 下一个块将获得的索引。
    pub fn next_block_index(&self) -> BlockIndex {
        self.next_block_index
    }

    fn current_span(&mut self) -> &mut [u8] {
        let split = self.first.len();
        if self.position < split {
            &mut self.first[self.position..]
        } else {
            &mut self.second[self.position - split..]
        }
    }

    /// 写入原始字节。
    ///
    /// # Panics
    /// `bytes.len()` 超过 [`remaining_bytes`](Self::remaining_bytes)。
    pub fn write_bytes(&mut self, mut bytes: &[u8]) {
        assert!(
            bytes.len() <= self.remaining_bytes(),
            "EntryWriter overflow: writing {} bytes with {} remaining",
            bytes.len(),
            self.remaining_bytes()
        );
        while !bytes.is_empty() {
            let span = self.current_span();
            let n = span.len().min(bytes.len());
            span[..n].copy_from_slice(&bytes[..n]);
            self.position += n;
            bytes = &bytes[n..];
        }
    }

    pub fn write_uleb128(&mut self, value: u64) {
        let (scratch, len) = leb128::encode(value);
        self.write_bytes(&scratch[..len]);
    }

    /// 按 [`Serialize`] 编码写入一个值。
    pub fn write_object<T: Serialize + ?Sized>(&mut self, value: &T) {
        value.serialize(self);
    }
}

// SAFETY: `chunk_mut` 只暴露已初始化的分块字节，`advance_mut` 在推进前校验不超过当前字节片的剩余长度，
// 因此写指针永远落在 `first ++ second` 之内。
#[allow(unsafe_code)]
unsafe impl BufMut for EntryWriter<'_> {
    fn remaining_mut(&self) -> usize {
        self.remaining_bytes()
    }

    fn chunk_mut(&mut self) -> &mut UninitSlice {
        UninitSlice::new(self.current_span())
    }

    unsafe fn advance_mut(&mut self, cnt: usize) {
        let available = self.current_span().len();
        assert!(
            cnt <= available,
            "EntryWriter::advance_mut beyond current span: {cnt} > {available}"
        );
        self.position += cnt;
    }

    fn put_slice(&mut self, src: &[u8]) {
        self.write_bytes(src);
    }
}
