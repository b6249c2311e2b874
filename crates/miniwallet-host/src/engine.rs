//! 区块链引擎连接管理。
//!
//! 引擎运行在独立进程中，宿主只通过外部提供的通道（[`EngineConnector`]）与之交换消息。
//!
//! 状态机：
//! - `Disconnected` → `Connecting` → `Connected`
//! - 任意状态 → `Disconnected`（引擎死亡或主动断开）
//!
//! 约定：
//! - `connect` 幂等：连接中/已连接时复用同一次绑定结果，不会重复绑定
//! - 引擎死亡只处理一次（以连接代次 generation 去重），可按策略自动重连
//! - 收到的回复与“链路丢失”事件按到达顺序写入同一个事件通道，供桥接路由消费
//!
//! 作者：迷你钱包项目组
//! 创建时间：2026-10-18
//! 修改时间：2026-10-18

use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use futures::future::{self, BoxFuture, FutureExt, Shared};
use futures::stream::{self, BoxStream, StreamExt};
use miniwallet_core::ipc::{EngineReply, EngineRequest};
use miniwallet_core::state::ConnectionState;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::BroadcastStream;
use tracing::{debug, info, warn};

use crate::config::ReconnectPolicy;

/// 引擎连接错误。
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    #[error("绑定引擎服务失败: {0}")]
    BindFailed(String),
    #[error("引擎服务未连接")]
    NotConnected,
    #[error("连接已被主动断开")]
    Disconnected,
}

/// 一次成功绑定得到的通道。
///
/// 字段说明：
/// - `outbound`：发往引擎的消息
/// - `inbound`：引擎回传的消息；发送端关闭视为引擎死亡
/// - `death`：平台死亡通知；收到信号或发送端被丢弃都视为引擎死亡
pub struct EngineLink {
    pub outbound: mpsc::Sender<EngineRequest>,
    pub inbound: mpsc::Receiver<EngineReply>,
    pub death: oneshot::Receiver<()>,
}

/// 进程边界通道的提供方（传输机制由平台实现）。
#[async_trait]
pub trait EngineConnector: Send + Sync + 'static {
    async fn bind(&self) -> Result<EngineLink, EngineError>;
}

/// 交给桥接路由的事件。
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    Reply(EngineReply),
    /// 第 `generation` 代链路已失效，经该链路发出且未完成的请求都不会再有回复。
    LinkLost { generation: u64 },
}

type BindFuture = Shared<BoxFuture<'static, Result<(), EngineError>>>;

#[derive(Default)]
struct Slot {
    generation: u64,
    outbound: Option<mpsc::Sender<EngineRequest>>,
    pending_bind: Option<BindFuture>,
    pump: Option<JoinHandle<()>>,
    reconnect: Option<JoinHandle<()>>,
}

struct Inner {
    connector: Arc<dyn EngineConnector>,
    policy: ReconnectPolicy,
    state: watch::Sender<ConnectionState>,
    transitions: broadcast::Sender<ConnectionState>,
    events: mpsc::UnboundedSender<EngineEvent>,
    slot: Mutex<Slot>,
}

/// 引擎连接（可廉价克隆，所有克隆共享同一连接）。
#[derive(Clone)]
pub struct EngineConnection {
    inner: Arc<Inner>,
}

impl EngineConnection {
    /// 创建连接管理器。
    ///
    /// 返回值：
    /// - 连接管理器
    /// - 事件接收端（交给 [`crate::router::BridgeRouter`]）
    pub fn new(
        connector: Arc<dyn EngineConnector>,
        policy: ReconnectPolicy,
    ) -> (Self, mpsc::UnboundedReceiver<EngineEvent>) {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let (transitions, _) = broadcast::channel(64);
        let (events, events_rx) = mpsc::unbounded_channel();
        let inner = Inner {
            connector,
            policy,
            state,
            transitions,
            events,
            slot: Mutex::new(Slot::default()),
        };
        (Self { inner: Arc::new(inner) }, events_rx)
    }

    /// 当前连接状态。
    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    /// 建立连接（幂等）。
    ///
    /// 返回值：
    /// - 已连接：立即成功
    /// - 连接中：等待同一次绑定的结果
    ///
    /// 异常处理：
    /// - 按重连策略重试后仍失败：[`EngineError::BindFailed`]
    /// - 绑定期间被 `disconnect`：[`EngineError::Disconnected`]
    pub async fn connect(&self) -> Result<(), EngineError> {
        let bind = {
            let mut slot = self.lock_slot();
            if slot.outbound.is_some() {
                return Ok(());
            }
            match &slot.pending_bind {
                Some(pending) => pending.clone(),
                None => {
                    slot.generation += 1;
                    let generation = slot.generation;
                    self.set_state(ConnectionState::Connecting);
                    let this = self.clone();
                    let task = tokio::spawn(async move { this.run_bind(generation).await });
                    let shared = async move {
                        task.await
                            .unwrap_or_else(|e| Err(EngineError::BindFailed(format!("绑定任务异常退出: {e}"))))
                    }
                    .boxed()
                    .shared();
                    slot.pending_bind = Some(shared.clone());
                    shared
                }
            }
        };
        bind.await
    }

    async fn run_bind(&self, generation: u64) -> Result<(), EngineError> {
        let attempts = self.inner.policy.max_attempts.max(1);
        let mut last_error = EngineError::BindFailed("未尝试绑定".into());
        for attempt in 1..=attempts {
            match self.inner.connector.bind().await {
                Ok(link) => return self.install_link(generation, link),
                Err(e) => {
                    warn!(attempt, max_attempts = attempts, error = %e, "绑定引擎服务失败");
                    last_error = e;
                }
            }
            if self.lock_slot().generation != generation {
                return Err(EngineError::Disconnected);
            }
            if attempt < attempts {
                tokio::time::sleep(self.inner.policy.delay()).await;
            }
        }

        let mut slot = self.lock_slot();
        if slot.generation != generation {
            return Err(EngineError::Disconnected);
        }
        slot.pending_bind = None;
        self.set_state(ConnectionState::Disconnected);
        Err(last_error)
    }

    fn install_link(&self, generation: u64, link: EngineLink) -> Result<(), EngineError> {
        let mut slot = self.lock_slot();
        if slot.generation != generation {
            debug!("绑定完成时连接已被断开，丢弃本次链路");
            return Err(EngineError::Disconnected);
        }
        slot.pending_bind = None;
        slot.outbound = Some(link.outbound);
        let this = self.clone();
        slot.pump = Some(tokio::spawn(this.pump(generation, link.inbound, link.death)));
        self.set_state(ConnectionState::Connected);
        info!(generation, "引擎服务已连接");
        Ok(())
    }

    /// 转发回复，直到链路关闭或收到死亡通知。
    async fn pump(
        self,
        generation: u64,
        mut inbound: mpsc::Receiver<EngineReply>,
        mut death: oneshot::Receiver<()>,
    ) {
        loop {
            tokio::select! {
                biased;
                reply = inbound.recv() => match reply {
                    Some(reply) => {
                        let _ = self.inner.events.send(EngineEvent::Reply(reply));
                    }
                    None => break,
                },
                _ = &mut death => break,
            }
        }
        self.mark_dead(generation);
    }

    /// 处理引擎死亡；同一代次只生效一次。
    fn mark_dead(&self, generation: u64) {
        let mut slot = self.lock_slot();
        if slot.generation != generation || slot.outbound.is_none() {
            return;
        }
        slot.outbound = None;
        slot.pump = None;
        self.set_state(ConnectionState::Disconnected);
        let _ = self.inner.events.send(EngineEvent::LinkLost { generation });
        warn!(generation, "引擎进程已断开");

        if self.inner.policy.auto_reconnect {
            let this = self.clone();
            let delay = self.inner.policy.delay();
            slot.reconnect = Some(tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                if let Err(e) = this.connect().await {
                    warn!(error = %e, "自动重连引擎服务失败");
                }
            }));
        }
    }

    /// 主动断开（无条件进入 `Disconnected`）。
    pub fn disconnect(&self) {
        let mut slot = self.lock_slot();
        let lost = slot.generation;
        slot.generation += 1;
        let was_connected = slot.outbound.take().is_some();
        slot.pending_bind = None;
        if let Some(pump) = slot.pump.take() {
            pump.abort();
        }
        if let Some(reconnect) = slot.reconnect.take() {
            reconnect.abort();
        }
        if was_connected {
            let _ = self.inner.events.send(EngineEvent::LinkLost { generation: lost });
        }
        self.set_state(ConnectionState::Disconnected);
        info!("引擎服务已断开");
    }

    /// 向引擎发送消息。
    ///
    /// 异常处理：
    /// - 未连接或通道已关闭：[`EngineError::NotConnected`]
    pub async fn send(&self, request: EngineRequest) -> Result<(), EngineError> {
        self.send_tracked(request).await.map(|_| ())
    }

    /// 发送消息并返回所用链路的代次。
    pub async fn send_tracked(&self, request: EngineRequest) -> Result<u64, EngineError> {
        let (generation, outbound) = {
            let slot = self.lock_slot();
            let outbound = slot.outbound.clone().ok_or(EngineError::NotConnected)?;
            (slot.generation, outbound)
        };
        outbound.send(request).await.map_err(|_| EngineError::NotConnected)?;
        Ok(generation)
    }

    /// 当前（或正在建立的）链路代次。
    pub fn generation(&self) -> u64 {
        self.lock_slot().generation
    }

    /// 连接状态序列：先给出当前状态，之后每次迁移给出一次。
    pub fn observe_state(&self) -> BoxStream<'static, ConnectionState> {
        let transitions = BroadcastStream::new(self.inner.transitions.subscribe());
        let current = self.state();
        stream::once(future::ready(current))
            .chain(transitions.filter_map(|item| future::ready(item.ok())))
            .boxed()
    }

    /// 连通性序列（`true` 表示已连接），相邻重复值会被合并。
    pub fn observe_connection(&self) -> BoxStream<'static, bool> {
        let mut last = None;
        self.observe_state()
            .map(ConnectionState::is_connected)
            .filter(move |connected| {
                let changed = last != Some(*connected);
                last = Some(*connected);
                future::ready(changed)
            })
            .boxed()
    }

    fn set_state(&self, next: ConnectionState) {
        let changed = self.inner.state.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        });
        if changed {
            let _ = self.inner.transitions.send(next);
        }
    }

    fn lock_slot(&self) -> MutexGuard<'_, Slot> {
        self.inner.slot.lock().unwrap_or_else(|e| e.into_inner())
    }
}


#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    async fn next<T>(stream: &mut BoxStream<'static, T>) -> T {
        tokio::time::timeout(Duration::from_secs(5), stream.next())
            .await
            .expect("timed out waiting for stream item")
            .expect("stream ended")
    }

    #[tokio::test]
    async fn concurrent_connects_share_one_bind() {
        let (connector, _engines) = FakeConnector::new();
        let (conn, _events) = EngineConnection::new(connector.clone(), fast_policy(false));

        let (a, b, c) = tokio::join!(conn.connect(), conn.connect(), conn.connect());
        assert!(a.is_ok() && b.is_ok() && c.is_ok());
        assert_eq!(connector.bind_count(), 1);
        assert_eq!(conn.state(), ConnectionState::Connected);

        conn.connect().await.unwrap();
        assert_eq!(connector.bind_count(), 1);
    }

    #[tokio::test]
    async fn observe_connection_replays_current_then_transitions() {
        let (connector, _engines) = FakeConnector::new();
        let (conn, _events) = EngineConnection::new(connector, fast_policy(false));

        let mut states = conn.observe_state();
        let mut connected = conn.observe_connection();
        assert_eq!(next(&mut states).await, ConnectionState::Disconnected);
        assert!(!next(&mut connected).await);

        conn.connect().await.unwrap();
        assert_eq!(next(&mut states).await, ConnectionState::Connecting);
        assert_eq!(next(&mut states).await, ConnectionState::Connected);
        assert!(next(&mut connected).await);

        conn.disconnect();
        assert_eq!(next(&mut states).await, ConnectionState::Disconnected);
        assert!(!next(&mut connected).await);

        // 重新订阅立即拿到当前状态
        let mut late = conn.observe_connection();
        assert!(!next(&mut late).await);
    }

    #[tokio::test]
    async fn engine_death_is_handled_exactly_once() {
        let (connector, mut engines) = FakeConnector::new();
        let (conn, mut events) = EngineConnection::new(connector, fast_policy(false));
        conn.connect().await.unwrap();
        let mut engine = engines.recv().await.unwrap();
        let mut states = conn.observe_state();
        assert_eq!(next(&mut states).await, ConnectionState::Connected);

        // 死亡通知与通道关闭同时发生
        engine.kill();
        drop(engine);

        assert_eq!(next(&mut states).await, ConnectionState::Disconnected);
        assert_eq!(events.recv().await, Some(EngineEvent::LinkLost { generation: 1 }));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(events.try_recv().is_err(), "LinkLost must be emitted once");
        assert_eq!(conn.state(), ConnectionState::Disconnected);
        let request = EngineRequest::Activate {
            engine_id: "x".into(),
        };
        assert_eq!(conn.send(request).await, Err(EngineError::NotConnected));
    }

    #[tokio::test]
    async fn replies_before_death_are_delivered_first() {
        let (connector, mut engines) = FakeConnector::new();
        let (conn, mut events) = EngineConnection::new(connector, fast_policy(false));
        conn.connect().await.unwrap();
        let mut engine = engines.recv().await.unwrap();

        let reply = EngineReply::Response {
            request_id: "R1".into(),
            body: "{}".into(),
        };
        engine.replies.send(reply.clone()).await.unwrap();
        engine.kill();

        assert_eq!(events.recv().await, Some(EngineEvent::Reply(reply)));
        assert_eq!(events.recv().await, Some(EngineEvent::LinkLost { generation: 1 }));
    }

    #[tokio::test]
    async fn reconnects_after_death_when_enabled() {
        let (connector, mut engines) = FakeConnector::new();
        let (conn, _events) = EngineConnection::new(connector.clone(), fast_policy(true));
        conn.connect().await.unwrap();
        let mut first = engines.recv().await.unwrap();
        first.kill();

        let second = tokio::time::timeout(Duration::from_secs(5), engines.recv())
            .await
            .expect("reconnect timed out");
        assert!(second.is_some());
        let mut states = conn.observe_state();
        loop {
            if next(&mut states).await == ConnectionState::Connected {
                break;
            }
        }
        assert_eq!(connector.bind_count(), 2);
        assert_eq!(conn.generation(), 2);
        let request = EngineRequest::Activate {
            engine_id: "x".into(),
        };
        assert_eq!(conn.send_tracked(request).await, Ok(2));
    }

    #[tokio::test]
    async fn bind_retries_then_succeeds() {
        let (connector, _engines) = FakeConnector::new();
        connector.fail_first.store(2, Ordering::SeqCst);
        let (conn, _events) = EngineConnection::new(connector.clone(), fast_policy(false));
        conn.connect().await.unwrap();
        assert_eq!(connector.bind_count(), 3);
    }

    #[tokio::test]
    async fn bind_gives_up_after_max_attempts() {
        let (connector, _engines) = FakeConnector::new();
        connector.fail_first.store(10, Ordering::SeqCst);
        let (conn, _events) = EngineConnection::new(connector.clone(), fast_policy(false));
        assert!(matches!(conn.connect().await, Err(EngineError::BindFailed(_))));
        assert_eq!(connector.bind_count(), 3);
        assert_eq!(conn.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn disconnect_is_unconditional() {
        let (connector, _engines) = FakeConnector::new();
        let (conn, mut events) = EngineConnection::new(connector, fast_policy(false));
        conn.disconnect();
        assert_eq!(conn.state(), ConnectionState::Disconnected);
        let before = conn.generation();
        conn.connect().await.unwrap();
        conn.disconnect();
        conn.disconnect();
        assert_eq!(conn.state(), ConnectionState::Disconnected);
        assert_eq!(events.recv().await, Some(EngineEvent::LinkLost { generation: before + 1 }));
        assert!(events.try_recv().is_err());
    }
}
