//! 全局索引与块索引。
//!
//! 全局索引（[`BufferIndex`]）是跨所有分块的字节位置编号，从 1 开始严格递增，0 保留为“无块”哨兵。
//! [`BlockIndex`] 是指向某个块长度前缀首字节的不透明句柄。

use core::fmt;

/// 全局字节位置；1 起始，0 表示“无”。
pub type BufferIndex = u64;

/// 块句柄。
///
/// # 契约说明（What）
/// - 与原始索引双向无损转换：[`from_index`](Self::from_index) / [`to_index`](Self::to_index)；
/// - 默认值为空句柄，[`is_null`](Self::is_null) 为真，且在排序中小于任何非空句柄；
/// - 同一缓冲连续成功写入得到的句柄严格递增。
#[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BlockIndex(BufferIndex);

impl BlockIndex {
    /// 空句柄。
    pub const NULL: BlockIndex = BlockIndex(0);

    pub const fn from_index(index: BufferIndex) -> Self {
        BlockIndex(index)
    }

    pub const fn to_index(self) -> BufferIndex {
        self.0
    }

    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    /// 非空时返回 `Some(self)`，便于与 `Option` 组合子衔接。
    pub const fn non_null(self) -> Option<BlockIndex> {
        if self.is_null() { None } else { Some(self) }
    }
}

impl fmt::Debug for BlockIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_null() {
            f.write_str("BlockIndex(null)")
        } else {
            write!(f, "BlockIndex({})", self.0)
        }
    }
}

impl From<BlockIndex> for BufferIndex {
    fn from(index: BlockIndex) -> Self {
        index.0
    }
}
