#![deny(unsafe_code)]

//! `spark-profile-buffer` 提供采样剖析器的记录底座：分块、追加写、内存有界的字节块缓冲。
//!
//! # 模块定位（Why）
//! - 剖析器的采样与埋点以极高频率产生变长二进制记录，来自多个写线程；
//!   它们需要一个总内存有界、满了就淘汰最旧数据、又能按稳定索引回读的存储；
//! - 本 crate 只定义记录如何成帧、存放、淘汰与取回，不解释记录内容。
//!
//! # 设计概要（How）
//! - [`leb128`]：ULEB128 变长整数编解码，块长度前缀的帧格式；
//! - [`chunk`]：定长分块与单一所有权的分块列表；
//! - [`manager`]：分块供给与淘汰策略（单分块、本地上限）以及占用通知外壳；
//! - [`chunked_buffer`]：跨分块的全局索引空间与 `put`/`read` 操作；
//! - [`entry`]：块负载的读写视图与常用类型的编码；
//! - [`config`]、[`error`]：可由 TOML 加载的容量配置与统一错误类型。
//!
//! # 使用示例
//! ```
//! use std::sync::Arc;
//! use spark_profile_buffer::{ChunkedBuffer, LocalLimitChunkManager};
//!
//! let buffer: ChunkedBuffer = ChunkedBuffer::with_chunk_manager(Arc::new(
//!     LocalLimitChunkManager::new(4096, 256),
//! ));
//! let index = buffer.put_objects((42u32, "sample"));
//! assert!(!index.is_null());
//! buffer.read_at(index, |entry| {
//!     let entry = entry.expect("刚写入的块存活");
//!     assert_eq!(entry.read_object::<u32>().expect("u32"), 42);
//!     assert_eq!(entry.read_object::<String>().expect("字符串"), "sample");
//! });
//! ```

pub mod chunk;
pub mod chunked_buffer;
pub mod config;
pub mod entry;
pub mod error;
pub mod index;
pub mod leb128;
pub mod manager;
pub mod time;

pub use chunk::{Chunk, ChunkList};
pub use chunked_buffer::{
    ChunkedBuffer, Reader, State, ThreadSafety, ThreadSafetyKind, WithMutex, WithoutMutex,
};
pub use config::BufferConfig;
pub use entry::{Deserialize, EntryReader, EntryWriter, Serialize};
pub use error::{BufferError, Result};
pub use index::{BlockIndex, BufferIndex};
pub use manager::ChunkManager;
pub use manager::controlled::{ControlledChunkManager, Update, UpdateSubscription};
pub use manager::local_limit::LocalLimitChunkManager;
pub use manager::single::SingleChunkManager;
pub use time::TimeStamp;
