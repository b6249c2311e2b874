//! 桥接路由：渲染端请求 ⇄ 引擎回复。
//!
//! 约定：
//! - 请求 ID 由调用方选择，同一时刻在途的请求 ID 必须唯一；重复使用返回
//!   [`BridgeError::DuplicateRequestId`]
//! - 负载原样转发，不解析业务内容
//! - 每个请求 ID 恰好交付一次；链路丢失时经该链路发出的在途请求以
//!   [`BridgeError::ServiceDisconnected`] 结束，新链路上的请求不受迟到的丢失事件影响
//! - 调用方丢弃 [`PendingResponse`] 即放弃该请求，迟到的回复被静默丢弃
//! - 路由本身不设超时，需要超时的调用方自行包装 `tokio::time::timeout`
//!
//! 作者：迷你钱包项目组
//! 创建时间：2026-10-18
//! 修改时间：2026-10-18

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll};

use async_trait::async_trait;
use miniwallet_core::error::BridgeError;
use miniwallet_core::ipc::{self, BridgeResponse, EngineReply, EngineRequest};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::engine::{EngineConnection, EngineEvent};

type Completion = oneshot::Sender<Result<BridgeResponse, BridgeError>>;

struct PendingEntry {
    token: u64,
    /// 发出请求所用的链路代次。
    generation: u64,
    completion: Completion,
}

#[derive(Default)]
struct PendingTable {
    next_token: u64,
    entries: HashMap<String, PendingEntry>,
}

#[derive(Clone, Default)]
struct SharedTable(Arc<Mutex<PendingTable>>);

impl SharedTable {
    fn lock(&self) -> MutexGuard<'_, PendingTable> {
        self.0.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// 仅当条目仍属于 `token` 对应的那次请求时才移除。
    fn remove_if_owned(&self, request_id: &str, token: u64) -> bool {
        let mut table = self.lock();
        match table.entries.get(request_id) {
            Some(entry) if entry.token == token => {
                table.entries.remove(request_id);
                true
            }
            _ => false,
        }
    }

    fn retag(&self, request_id: &str, token: u64, generation: u64) {
        if let Some(entry) = self.lock().entries.get_mut(request_id) {
            if entry.token == token {
                entry.generation = generation;
            }
        }
    }

    fn complete(&self, reply: EngineReply) {
        let entry = self.lock().entries.remove(reply.request_id());
        match entry {
            Some(entry) => {
                let _ = entry.completion.send(Ok(BridgeResponse::from_reply(reply)));
            }
            None => debug!(
                request_id = %reply.request_id(),
                "请求已放弃或不存在，丢弃迟到的回复"
            ),
        }
    }

    /// 结束经第 `generation` 代（及更早）链路发出的请求。
    fn fail_link(&self, generation: u64) {
        let lost: Vec<_> = {
            let mut table = self.lock();
            let ids: Vec<String> = table
                .entries
                .iter()
                .filter(|(_, entry)| entry.generation <= generation)
                .map(|(id, _)| id.clone())
                .collect();
            ids.into_iter()
                .filter_map(|id| table.entries.remove(&id))
                .collect()
        };
        if !lost.is_empty() {
            warn!(pending = lost.len(), generation, "引擎链路已断开，结束其上的在途请求");
        }
        for entry in lost {
            let _ = entry.completion.send(Err(BridgeError::ServiceDisconnected));
        }
    }

    fn fail_all(&self) {
        let drained: Vec<_> = self.lock().entries.drain().collect();
        if !drained.is_empty() {
            warn!(pending = drained.len(), "引擎连接已断开，结束所有在途请求");
        }
        for (_, entry) in drained {
            let _ = entry.completion.send(Err(BridgeError::ServiceDisconnected));
        }
    }
}

/// 在途请求的结果；`await` 得到响应，丢弃即放弃。
pub struct PendingResponse {
    request_id: String,
    token: u64,
    receiver: oneshot::Receiver<Result<BridgeResponse, BridgeError>>,
    table: SharedTable,
    done: bool,
}

impl PendingResponse {
    pub fn request_id(&self) -> &str {
        &self.request_id
    }
}

impl Future for PendingResponse {
    type Output = Result<BridgeResponse, BridgeError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match Pin::new(&mut this.receiver).poll(cx) {
            Poll::Ready(result) => {
                this.done = true;
                Poll::Ready(result.unwrap_or(Err(BridgeError::ServiceDisconnected)))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for PendingResponse {
    fn drop(&mut self) {
        if !self.done && self.table.remove_if_owned(&self.request_id, self.token) {
            debug!(request_id = %self.request_id, "调用方已放弃请求");
        }
    }
}

/// 渲染端：执行路由生成的脚本片段。
#[async_trait]
pub trait RenderSurface: Send + Sync {
    async fn evaluate_script(&self, script: String);
}

/// 桥接路由。
pub struct BridgeRouter {
    engine: EngineConnection,
    table: SharedTable,
    dispatcher: JoinHandle<()>,
}

impl BridgeRouter {
    /// 创建路由并启动事件分发任务。
    ///
    /// 参数：
    /// - `events`：[`EngineConnection::new`] 返回的事件接收端
    pub fn new(engine: EngineConnection, events: mpsc::UnboundedReceiver<EngineEvent>) -> Self {
        let table = SharedTable::default();
        let dispatcher = tokio::spawn(run_dispatcher(events, table.clone()));
        Self {
            engine,
            table,
            dispatcher,
        }
    }

    /// 提交一次桥接请求。
    ///
    /// 返回值：
    /// - 成功：在途请求，`await` 后得到响应
    ///
    /// 异常处理：
    /// - 引擎未连接或发送失败：[`BridgeError::ServiceDisconnected`]
    /// - 请求 ID 仍在途：[`BridgeError::DuplicateRequestId`]
    pub async fn handle_request(
        &self,
        request_id: impl Into<String>,
        payload: impl Into<String>,
    ) -> Result<PendingResponse, BridgeError> {
        let request_id = request_id.into();
        if !self.engine.state().is_connected() {
            return Err(BridgeError::ServiceDisconnected);
        }

        let generation = self.engine.generation();
        let (completion, receiver) = oneshot::channel();
        let token = {
            let mut table = self.table.lock();
            if table.entries.contains_key(&request_id) {
                return Err(BridgeError::DuplicateRequestId(request_id));
            }
            table.next_token += 1;
            let token = table.next_token;
            let entry = PendingEntry {
                token,
                generation,
                completion,
            };
            table.entries.insert(request_id.clone(), entry);
            token
        };
        let pending = PendingResponse {
            request_id: request_id.clone(),
            token,
            receiver,
            table: self.table.clone(),
            done: false,
        };

        let request = EngineRequest::Call {
            request_id,
            payload: payload.into(),
        };
        match self.engine.send_tracked(request).await {
            Ok(used) if used != generation => self.table.retag(&pending.request_id, token, used),
            Ok(_) => {}
            Err(e) => {
                debug!(request_id = %pending.request_id, error = %e, "转发请求失败");
                // pending 被丢弃时会移除登记
                return Err(BridgeError::ServiceDisconnected);
            }
        }
        Ok(pending)
    }

    /// 处理一次请求并把结果以脚本片段交付给渲染端。
    ///
    /// 说明：
    /// - 路由错误同样渲染为 JSON-RPC 错误对象交付，渲染端不会一直等待
    pub async fn dispatch(&self, request_id: &str, payload: String, surface: &dyn RenderSurface) {
        let result = match self.handle_request(request_id, payload).await {
            Ok(pending) => pending.await,
            Err(e) => Err(e),
        };
        let response = result.unwrap_or_else(|e| BridgeResponse {
            request_id: request_id.to_string(),
            body: error_body(request_id, &e),
        });
        surface.evaluate_script(response.render_script()).await;
    }

    /// 当前在途请求数。
    pub fn pending_count(&self) -> usize {
        self.table.lock().entries.len()
    }
}

impl Drop for BridgeRouter {
    fn drop(&mut self) {
        self.dispatcher.abort();
        self.table.fail_all();
    }
}

async fn run_dispatcher(mut events: mpsc::UnboundedReceiver<EngineEvent>, table: SharedTable) {
    while let Some(event) = events.recv().await {
        match event {
            EngineEvent::Reply(reply) => table.complete(reply),
            EngineEvent::LinkLost { generation } => table.fail_link(generation),
        }
    }
    table.fail_all();
}

fn error_body(request_id: &str, error: &BridgeError) -> serde_json::Value {
    match error {
        BridgeError::Parse(detail) => ipc::parse_error_response(request_id, detail),
        other => ipc::error_response(request_id, ipc::ENGINE_ERROR_CODE, &other.to_string()),
    }
}
