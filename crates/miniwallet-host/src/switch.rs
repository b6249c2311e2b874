//! 引擎切换状态机。
//!
//! 每个引擎的状态：`Inactive` / `Activating` / `Active`，同一时刻至多一个 `Active`。
//! 切换请求通过异步互斥串行执行，后到的请求排队等待前一次完成或失败。
//!
//! 作者：迷你钱包项目组
//! 创建时间：2026-10-18
//! 修改时间：2026-10-18

use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use miniwallet_core::ipc::EngineRequest;
use miniwallet_core::paths;
use miniwallet_core::state::{ActiveEngineSelection, EngineStatus};
use thiserror::Error;
use tokio::sync::watch;
use tokio_stream::wrappers::WatchStream;
use tracing::{debug, info, warn};

use crate::engine::{EngineConnection, EngineError};
use crate::prefs::write_atomic;

/// 激活指定引擎的一方。
#[async_trait]
pub trait EngineActivator: Send + Sync {
    async fn activate(&self, engine_id: &str) -> Result<(), EngineError>;
}

#[async_trait]
impl EngineActivator for EngineConnection {
    async fn activate(&self, engine_id: &str) -> Result<(), EngineError> {
        self.connect().await?;
        self.send(EngineRequest::Activate {
            engine_id: engine_id.to_string(),
        })
        .await
    }
}

/// 切换错误。
#[derive(Debug, Error)]
pub enum SwitchError {
    #[error("非法的引擎标识: {0}")]
    InvalidEngineId(String),
    #[error("激活引擎失败 ({engine_id}): {source}")]
    Activation {
        engine_id: String,
        #[source]
        source: EngineError,
    },
    #[error("保存当前引擎选择失败: {0}")]
    Persist(#[source] io::Error),
    #[error("切换任务异常结束: {0}")]
    Interrupted(String),
}

/// 引擎切换器。
pub struct EngineSwitch {
    inner: Arc<SwitchInner>,
}

struct SwitchInner {
    activator: Arc<dyn EngineActivator>,
    selection_path: PathBuf,
    gate: tokio::sync::Mutex<()>,
    statuses: Mutex<HashMap<String, EngineStatus>>,
    active: watch::Sender<Option<String>>,
}

impl EngineSwitch {
    /// 参数：
    /// - `selection_path`：当前选择的持久化位置（通常为 [`paths::active_engine_file`]）
    pub fn new(activator: Arc<dyn EngineActivator>, selection_path: impl Into<PathBuf>) -> Self {
        let (active, _) = watch::channel(None);
        Self {
            inner: Arc::new(SwitchInner {
                activator,
                selection_path: selection_path.into(),
                gate: tokio::sync::Mutex::new(()),
                statuses: Mutex::new(HashMap::new()),
                active,
            }),
        }
    }

    /// 切换到指定引擎。
    ///
    /// 流程：
    /// 1) 目标已是 `Active`：直接成功
    /// 2) 原引擎 → `Inactive`，目标 → `Activating`
    /// 3) 激活目标并持久化选择，目标 → `Active`
    ///
    /// 说明：
    /// - 切换在独立任务中执行；调用方超时或取消只是不再等待结果，
    ///   切换本身仍会完成或整体回滚，不会停在中间状态
    ///
    /// 异常处理：
    /// - 激活或持久化失败：目标回到 `Inactive`，原引擎恢复为 `Active`
    pub async fn switch_to(&self, engine_id: &str) -> Result<(), SwitchError> {
        if !paths::is_valid_app_id(engine_id) {
            return Err(SwitchError::InvalidEngineId(engine_id.to_string()));
        }
        let inner = self.inner.clone();
        let engine_id = engine_id.to_string();
        tokio::spawn(async move { inner.run_switch(&engine_id).await })
            .await
            .map_err(|e| SwitchError::Interrupted(e.to_string()))?
    }

    /// 启动时恢复持久化的选择。
    ///
    /// 返回值：
    /// - 恢复成功：被激活的引擎标识
    /// - 没有可用的持久化选择：`None`
    pub async fn restore(&self) -> Result<Option<String>, SwitchError> {
        let Some(selection) = self.load_selection().await else {
            return Ok(None);
        };
        self.switch_to(&selection.engine_id).await?;
        Ok(Some(selection.engine_id))
    }

    /// 读取持久化的选择；文件缺失或损坏时返回 `None`。
    pub async fn load_selection(&self) -> Option<ActiveEngineSelection> {
        let path = &self.inner.selection_path;
        let bytes = match tokio::fs::read(path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return None,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "读取引擎选择失败");
                return None;
            }
        };
        match serde_json::from_slice(&bytes) {
            Ok(selection) => Some(selection),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "引擎选择文件已损坏，忽略");
                None
            }
        }
    }

    pub fn status(&self, engine_id: &str) -> EngineStatus {
        self.inner
            .lock_statuses()
            .get(engine_id)
            .copied()
            .unwrap_or(EngineStatus::Inactive)
    }

    pub fn active_engine(&self) -> Option<String> {
        self.inner.active_engine()
    }

    /// 当前激活引擎序列：先给出当前值，之后每次变化给出一次（切换中为 `None`）。
    pub fn observe_active(&self) -> BoxStream<'static, Option<String>> {
        WatchStream::new(self.inner.active.subscribe()).boxed()
    }
}

impl SwitchInner {
    async fn run_switch(&self, engine_id: &str) -> Result<(), SwitchError> {
        let _gate = self.gate.lock().await;

        let previous = self.active_engine();
        if previous.as_deref() == Some(engine_id) {
            debug!(engine_id = %engine_id, "目标引擎已处于激活状态");
            return Ok(());
        }

        if let Some(prev) = &previous {
            self.set_status(prev, EngineStatus::Inactive);
        }
        self.set_status(engine_id, EngineStatus::Activating);
        self.active.send_replace(None);
        info!(from = ?previous, to = %engine_id, "开始切换引擎");

        if let Err(source) = self.activator.activate(engine_id).await {
            warn!(engine_id = %engine_id, error = %source, "激活引擎失败，恢复原引擎");
            self.rollback(engine_id, previous.as_deref(), false).await;
            return Err(SwitchError::Activation {
                engine_id: engine_id.to_string(),
                source,
            });
        }

        if let Err(e) = self.persist(engine_id).await {
            warn!(engine_id = %engine_id, error = %e, "保存引擎选择失败，恢复原引擎");
            self.rollback(engine_id, previous.as_deref(), true).await;
            return Err(SwitchError::Persist(e));
        }

        self.set_status(engine_id, EngineStatus::Active);
        self.active.send_replace(Some(engine_id.to_string()));
        info!(engine_id = %engine_id, "引擎切换完成");
        Ok(())
    }

    async fn rollback(&self, failed: &str, previous: Option<&str>, reactivate_previous: bool) {
        self.set_status(failed, EngineStatus::Inactive);
        let Some(prev) = previous else {
            return;
        };
        if reactivate_previous {
            if let Err(e) = self.activator.activate(prev).await {
                warn!(engine_id = %prev, error = %e, "重新激活原引擎失败");
            }
        }
        self.set_status(prev, EngineStatus::Active);
        self.active.send_replace(Some(prev.to_string()));
    }

    async fn persist(&self, engine_id: &str) -> io::Result<()> {
        let selection = ActiveEngineSelection::new(engine_id);
        let bytes = serde_json::to_vec_pretty(&selection)?;
        write_atomic(&self.selection_path, &bytes).await
    }

    fn active_engine(&self) -> Option<String> {
        self.active.borrow().clone()
    }

    fn set_status(&self, engine_id: &str, status: EngineStatus) {
        self.lock_statuses().insert(engine_id.to_string(), status);
    }

    fn lock_statuses(&self) -> std::sync::MutexGuard<'_, HashMap<String, EngineStatus>> {
        self.statuses.lock().unwrap_or_else(|e| e.into_inner())
    }
}
