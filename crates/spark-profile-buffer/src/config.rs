//! # config 模块说明
//!
//! ## 角色定位（Why）
//! - 缓冲核心对外只有两个可调参数：总字节预算与最小分块尺寸；另有线程安全模式决定缓冲类型；
//! - 以 `serde` + `toml` 承载这些参数，部署方可以把它们放进既有的配置文件中。
//!
//! ## 契约（What）
//! - 缺省值：1 MiB 预算、64 KiB 分块、`guarded`；TOML 中缺失的字段取缺省值；
//! - [`BufferConfig::validate`] 拒绝零尺寸分块、小于单个分块（按 16 字节取整后）的预算以及超过 [`MAX_CHUNK_BYTES`] 的分块；
//! - `build_*` 方法总是先校验再构造管理器。
//!
//! ```toml
//! max_total_bytes = 1048576
//! min_chunk_bytes = 65536
//! thread_safety = "unsynchronized"
//! ```

use serde::{Deserialize, Serialize};

use crate::chunk::Chunk;
use crate::chunked_buffer::ThreadSafetyKind;
use crate::error::{BufferError, Result};
use crate::manager::local_limit::LocalLimitChunkManager;
use crate::manager::single::SingleChunkManager;

/// 单个分块允许的最大缓冲字节数（256 MiB）。
pub const MAX_CHUNK_BYTES: usize = 256 * 1024 * 1024;

const DEFAULT_MAX_TOTAL_BYTES: usize = 1024 * 1024;
const DEFAULT_MIN_CHUNK_BYTES: usize = 64 * 1024;

/// 缓冲容量配置。
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BufferConfig {
    /// 管理器的总字节预算。
    pub max_total_bytes: usize,
    /// 每个分块的最小缓冲字节数，实际容量向上取整到 16 字节倍数。
    pub min_chunk_bytes: usize,
    pub thread_safety: ThreadSafetyKind,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            max_total_bytes: DEFAULT_MAX_TOTAL_BYTES,
            min_chunk_bytes: DEFAULT_MIN_CHUNK_BYTES,
            thread_safety: ThreadSafetyKind::default(),
        }
    }
}

impl BufferConfig {
    /// 解析并校验 TOML 文本。
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: BufferConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// 序列化为 TOML 文本。
    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string(self).map_err(|err| BufferError::ConfigParse(err.to_string()))
    }

    pub fn validate(&self) -> Result<()> {
        if self.min_chunk_bytes == 0 {
            return Err(BufferError::InvalidConfig {
                field: "min_chunk_bytes",
                reason: "must be greater than zero".to_owned(),
            });
        }
        if self.min_chunk_bytes > MAX_CHUNK_BYTES {
            return Err(BufferError::InvalidConfig {
                field: "min_chunk_bytes",
                reason: format!("{} exceeds the limit of {MAX_CHUNK_BYTES}", self.min_chunk_bytes),
            });
        }
        // 分块容量按对齐向上取整，预算至少要容纳一个取整后的分块。
        let chunk_bytes = Chunk::rounded_buffer_bytes(self.min_chunk_bytes);
        if self.max_total_bytes < chunk_bytes {
            return Err(BufferError::InvalidConfig {
                field: "max_total_bytes",
                reason: format!(
                    "{} cannot hold a single chunk of {chunk_bytes} bytes",
                    self.max_total_bytes
                ),
            });
        }
        Ok(())
    }

    /// 构造在 `max_total_bytes` 预算内供给分块的管理器。
    pub fn build_local_limit_manager(&self) -> Result<LocalLimitChunkManager> {
        self.validate()?;
        Ok(LocalLimitChunkManager::new(
            self.max_total_bytes,
            self.min_chunk_bytes,
        ))
    }

    /// 构造只持有一个 `min_chunk_bytes` 分块的管理器，预算字段被忽略。
    pub fn build_single_manager(&self) -> Result<SingleChunkManager> {
        self.validate()?;
        Ok(SingleChunkManager::new(self.min_chunk_bytes))
    }
}
