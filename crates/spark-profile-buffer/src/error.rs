//! # error 模块说明
//!
//! ## 角色定位（Why）
//! - 缓冲核心的大部分失败都是“容量拒绝”或“会话外空操作”，它们按契约以 `false`/`None`/空 `BlockIndex`
//!   表达，不走错误通道；
//! - 只有来自外部输入的路径（解码调用方提供的 LEB128 字节、按类型解码块负载、解析配置）才需要可描述的错误值，
//!   本模块集中定义这些错误。
//!
//! ## 设计要求（What）
//! - 统一派生 `thiserror::Error`，便于上层用 `?` 直接传播或交给 `anyhow` 之类的框架；
//! - 生命周期误用（重复 `mark_done` 等）属于编程错误，直接断言失败，不在此处建模。

use thiserror::Error;

/// 本 crate 的结果别名。
pub type Result<T, E = BufferError> = core::result::Result<T, E>;

/// 缓冲核心对外暴露的错误域。
///
/// # 教案式说明
/// - **意图 (Why)**：覆盖 LEB128 解码、负载解码与配置校验三类外部输入错误，保持热路径（`put`/`read_at`）零分配。
/// - **契约 (What)**：所有变体均为 `Send + Sync + 'static`，可跨线程传播；`Display` 文本为英文稳定描述。
#[derive(Clone, Debug, Eq, PartialEq, Error)]
pub enum BufferError {
    /// 输入在 LEB128 编码结束前耗尽。
    #[error("ULEB128 input ended before the final byte")]
    Leb128Truncated,

    /// 编码长度或数值超出目标整数类型（最多 `max_bytes` 字节）。
    #[error("ULEB128 encoding exceeds the target integer type (at most {max_bytes} bytes)")]
    Leb128Overflow { max_bytes: usize },

    /// 块负载无法按请求的类型解码。
    #[error("invalid payload for `{type_name}`: {reason}")]
    InvalidPayload {
        type_name: &'static str,
        reason: &'static str,
    },

    /// 配置字段未通过校验。
    #[error("invalid buffer configuration `{field}`: {reason}")]
    InvalidConfig {
        field: &'static str,
        reason: String,
    },

    /// TOML 文本无法解析为配置结构。
    #[error("failed to parse buffer configuration: {0}")]
    ConfigParse(String),
}

impl From<toml::de::Error> for BufferError {
    fn from(err: toml::de::Error) -> Self {
        BufferError::ConfigParse(err.to_string())
    }
}
