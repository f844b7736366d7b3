//! # entry 模块说明
//!
//! ## 角色定位（Why）
//! - 一个块的负载可能被切成两段：当前分块的尾部与后继分块的开头；写入端与读取端都需要把这两段当作一段连续字节；
//! - [`EntryWriter`] 与 [`EntryReader`] 分别持有至多两个字节片，并实现 `bytes::BufMut` / `bytes::Buf`，
//!   任何基于 `bytes` 的编码器都可以直接写入或读取一个块；
//! - [`Serialize`] / [`Deserialize`] 为常用类型提供负载编码，供 `put_object`/`read_object` 使用。
//!
//! ## 编码约定（What）
//! - 定长数值按小端序原样写入；
//! - 变长序列（`str`、`[T]`）先写 ULEB128 元素个数，再依次写元素；
//! - `Option<T>` 先写 1 字节标记（0 = `None`，1 = `Some`），元组按字段顺序拼接。

mod reader;
mod serialize;
mod writer;

pub use reader::EntryReader;
pub use serialize::{Deserialize, Serialize};
pub use writer::EntryWriter;
