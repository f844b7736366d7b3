//! # manager 模块说明
//!
//! ## 角色定位（Why）
//! - 分块管理器负责分块的供给与回收，并独自执行字节预算；缓冲只把拒绝当作普通失败；
//! - 不同部署对供给策略有不同要求：固定单分块（[`single`]）、带本地上限的多分块（[`local_limit`]），
//!   以及在任意管理器外层附加占用通知（[`controlled`]）。
//!
//! ## 契约（What）
//! - 所有方法均以 `&self` 调用，内部可变性由实现自行保护，管理器以 `Arc<dyn ChunkManager>` 共享；
//! - 回调（请求回调、销毁回调）一律在释放内部锁之后调用，因此回调可以重入 `get_chunk`/`request_chunk`；
//! - `request_chunk` 的回调恰好调用一次：要么在本次调用中立即调用，要么在之后的
//!   `fulfill_chunk_requests` 中调用；一次 `fulfill_chunk_requests` 只处理进入时已排队的请求，
//!   处理期间新增的请求由下一次调用处理（先进先出）；
//! - `peek_extant_released_chunks` 的访问者在持锁状态下运行，不得回调管理器。

pub mod controlled;
pub mod local_limit;
pub mod single;

use std::sync::Arc;

use crate::chunk::{Chunk, ChunkList};

/// 异步分块请求的回调；参数为 `None` 表示请求失败。
pub type ChunkRequestCallback = Box<dyn FnOnce(Option<Box<Chunk>>) + Send>;

/// 分块被永久销毁时的回调，每批调用一次，参数为本批销毁的分块（按完成时间升序）。
pub type ChunkDestroyedCallback = Arc<dyn Fn(&ChunkList) + Send + Sync>;

/// 分块供给与回收策略。
pub trait ChunkManager: Send + Sync {
    /// 固定的字节预算。
    fn max_total_size(&self) -> usize;

    /// 同步获取一个可写分块；预算或槽位耗尽时返回 `None`。
    fn get_chunk(&self) -> Option<Box<Chunk>>;

    /// 登记一次异步请求。
    fn request_chunk(&self, callback: ChunkRequestCallback);

    /// 处理进入时已排队的请求。
    fn fulfill_chunk_requests(&self);

    /// 归还一个或多个已完成分块；空列表为无操作。
    ///
    /// 每个分块按完成时间戳插入已释放链表，必要时销毁最旧的已释放分块以回到预算之内。
    fn release_chunk(&self, chunks: ChunkList);

    /// 设置或清除销毁回调。
    fn set_chunk_destroyed_callback(&self, callback: Option<ChunkDestroyedCallback>);

    /// 分离并返回按完成时间升序排列的已释放分块。
    fn get_extant_released_chunks(&self) -> ChunkList;

    /// 只读访问已释放分块链表。
    fn peek_extant_released_chunks(&self, visitor: &mut dyn FnMut(&ChunkList));

    /// 放弃对仍在使用中分块的记账，不触发销毁回调。
    fn forget_unreleased_chunks(&self);
}
