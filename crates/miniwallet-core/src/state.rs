//! 引擎连接与激活状态模型。
//!
//! 内容：
//! - [`ConnectionState`]：与引擎进程的连接状态
//! - [`EngineStatus`]：单个引擎的激活状态
//! - [`ActiveEngineSelection`]：当前激活引擎（落盘到 `active-engine.json`）
//!
//! 作者：迷你钱包项目组
//! 创建时间：2026-10-18
//! 修改时间：2026-10-18

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

/// 与引擎进程的连接状态。
///
/// 状态迁移：
/// - `Disconnected` → `Connecting` → `Connected`
/// - 任意状态 → `Disconnected`（进程死亡或主动断开）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

impl ConnectionState {
    pub fn is_connected(self) -> bool {
        matches!(self, ConnectionState::Connected)
    }
}

/// 单个引擎的激活状态。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineStatus {
    Inactive,
    Activating,
    Active,
}

/// 当前激活引擎。
///
/// 字段说明：
/// - `engine_id`：引擎标识（通常为区块链小程序的 app_id）
/// - `selected_at`：选择时间（UTC）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveEngineSelection {
    pub engine_id: String,
    pub selected_at: OffsetDateTime,
}

impl ActiveEngineSelection {
    /// 以当前 UTC 时间创建选择记录。
    pub fn new(engine_id: impl Into<String>) -> Self {
        Self {
            engine_id: engine_id.into(),
            selected_at: OffsetDateTime::now_utc(),
        }
    }
}
