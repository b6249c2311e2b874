//! 已安装小程序扫描与缓存。
//!
//! 缓存规则：
//! - 缓存是进程内唯一的一个槽位（`Arc<ScanCache>`），整体替换，从不原地修改
//! - 未过期（默认 5 分钟）且未要求强制刷新时直接返回缓存
//! - `clear_cache` 无条件清空槽位并发出“应用列表已变化”通知
//! - 每次清空使缓存代数加一；扫描只在代数未变时写回结果，清空前已开始的扫描不会覆盖清空
//!
//! 作者：迷你钱包项目组
//! 创建时间：2026-10-18
//! 修改时间：2026-10-18

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use miniwallet_core::error::MiniAppError;
use miniwallet_core::manifest::MiniApp;
use tokio::sync::{watch, Mutex};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::store::PackageSource;

/// 默认缓存有效期。
pub const DEFAULT_SCAN_TTL: Duration = Duration::from_secs(5 * 60);

/// 一次扫描的结果快照。
#[derive(Debug)]
pub struct ScanCache {
    pub apps: Arc<Vec<MiniApp>>,
    pub scanned_at: Instant,
}

/// 小程序扫描器。
pub struct AppScanner {
    source: Arc<dyn PackageSource>,
    ttl: Duration,
    cache: RwLock<Option<Arc<ScanCache>>>,
    generation: AtomicU64,
    rescan_gate: Mutex<()>,
    changes: watch::Sender<u64>,
}

impl AppScanner {
    pub fn new(source: Arc<dyn PackageSource>, ttl: Duration) -> Self {
        let (changes, _) = watch::channel(0);
        Self {
            source,
            ttl,
            cache: RwLock::new(None),
            generation: AtomicU64::new(0),
            rescan_gate: Mutex::new(()),
            changes,
        }
    }

    /// 扫描已安装小程序。
    ///
    /// 参数：
    /// - `force_refresh`：为 `true` 时忽略缓存
    ///
    /// 返回值：
    /// - 成功：按 app_id 排序的记录列表（与缓存共享同一份 `Arc`）
    ///
    /// 异常处理：
    /// - 安装根目录中没有任何包：[`MiniAppError::NoAppsInstalled`]（不更新缓存）
    /// - 枚举失败：[`MiniAppError::ScanFailed`]
    /// - 单个清单失败：记录日志并跳过该应用
    pub async fn scan(&self, force_refresh: bool) -> Result<Arc<Vec<MiniApp>>, MiniAppError> {
        if !force_refresh {
            if let Some(cached) = self.fresh_cache() {
                debug!(count = cached.apps.len(), "命中扫描缓存");
                return Ok(cached.apps.clone());
            }
        }

        let _gate = self.rescan_gate.lock().await;
        // 排队期间其他任务可能已完成刷新
        if !force_refresh {
            if let Some(cached) = self.fresh_cache() {
                return Ok(cached.apps.clone());
            }
        }

        let generation = self.generation.load(Ordering::SeqCst);
        let ids = self.source.list_installed_ids().await?;
        if ids.is_empty() {
            info!("安装目录中没有任何小程序");
            return Err(MiniAppError::NoAppsInstalled);
        }

        let mut apps = Vec::with_capacity(ids.len());
        for app_id in &ids {
            match self.source.load_manifest(app_id).await {
                Ok(manifest) => {
                    let icon = self.source.icon_path(app_id).await;
                    apps.push(MiniApp::from_manifest(&manifest, icon));
                }
                Err(e) => warn!(app_id = %app_id, error = %e, "加载小程序清单失败，已跳过"),
            }
        }

        let snapshot = Arc::new(ScanCache {
            apps: Arc::new(apps),
            scanned_at: Instant::now(),
        });
        {
            let mut slot = self.cache.write().unwrap_or_else(|e| e.into_inner());
            if self.generation.load(Ordering::SeqCst) == generation {
                *slot = Some(snapshot.clone());
            } else {
                debug!("扫描期间缓存已被清空，结果不写回缓存");
            }
        }
        info!(found = ids.len(), loaded = snapshot.apps.len(), "小程序扫描完成");
        Ok(snapshot.apps.clone())
    }

    /// 清空缓存，下次扫描必定重新读取磁盘。
    pub fn clear_cache(&self) {
        {
            let mut slot = self.cache.write().unwrap_or_else(|e| e.into_inner());
            self.generation.fetch_add(1, Ordering::SeqCst);
            *slot = None;
        }
        self.changes.send_modify(|generation| *generation = generation.wrapping_add(1));
        debug!("扫描缓存已清空");
    }

    /// 判断某个小程序是否已安装（直接读取磁盘，不走缓存）。
    pub async fn is_installed(&self, app_id: &str) -> Result<bool, MiniAppError> {
        Ok(self.source.list_installed_ids().await?.iter().any(|id| id == app_id))
    }

    /// 订阅“应用列表已变化”通知；新订阅者立即可读到最近一次的变更序号。
    pub fn subscribe_changes(&self) -> watch::Receiver<u64> {
        self.changes.subscribe()
    }

    fn fresh_cache(&self) -> Option<Arc<ScanCache>> {
        let guard = self.cache.read().unwrap_or_else(|e| e.into_inner());
        guard
            .as_ref()
            .filter(|cache| cache.scanned_at.elapsed() < self.ttl)
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use miniwallet_core::manifest::MiniAppManifest;

    /// 内存包源：统计磁盘访问次数。
    struct FakeSource {
        manifests: std::sync::Mutex<Vec<(String, Option<String>)>>,
        list_calls: AtomicUsize,
    }

    impl FakeSource {
        fn new(entries: &[(&str, Option<&str>)]) -> Arc<Self> {
            Arc::new(Self {
                manifests: std::sync::Mutex::new(
                    entries
                        .iter()
                        .map(|(id, json)| (id.to_string(), json.map(str::to_string)))
                        .collect(),
                ),
                list_calls: AtomicUsize::new(0),
            })
        }

        fn calls(&self) -> usize {
            self.list_calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl PackageSource for FakeSource {
        async fn list_installed_ids(&self) -> Result<Vec<String>, MiniAppError> {
            self.list_calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.manifests.lock().unwrap().iter().map(|(id, _)| id.clone()).collect())
        }

        async fn load_manifest(&self, app_id: &str) -> Result<MiniAppManifest, MiniAppError> {
            let guard = self.manifests.lock().unwrap();
            match guard.iter().find(|(id, _)| id == app_id) {
                Some((_, Some(json))) => MiniAppManifest::parse(json.as_bytes()),
                _ => Err(MiniAppError::ManifestNotFound(app_id.to_string())),
            }
        }

        async fn icon_path(&self, _app_id: &str) -> Option<PathBuf> {
            None
        }
    }

    const X: &str =
        r#"{"app_id":"x","name":"X","version":"1.0","type":"blockchain","pages":["index"]}"#;

    /// 第一次枚举时停在中途，等待测试放行；用于构造“扫描进行中”的时序。
    struct StallingSource {
        ids: std::sync::Mutex<Vec<String>>,
        stall_once: std::sync::atomic::AtomicBool,
        entered: tokio::sync::Notify,
        release: tokio::sync::Notify,
    }

    #[async_trait]
    impl PackageSource for StallingSource {
        async fn list_installed_ids(&self) -> Result<Vec<String>, MiniAppError> {
            let ids = self.ids.lock().unwrap().clone();
            if self.stall_once.swap(false, Ordering::SeqCst) {
                self.entered.notify_one();
                self.release.notified().await;
            }
            Ok(ids)
        }

        async fn load_manifest(&self, app_id: &str) -> Result<MiniAppManifest, MiniAppError> {
            let json = format!(
                r#"{{"app_id":"{app_id}","name":"{app_id}","version":"1.0","type":"app"}}"#
            );
            MiniAppManifest::parse(json.as_bytes())
        }

        async fn icon_path(&self, _app_id: &str) -> Option<PathBuf> {
            None
        }
    }

    #[tokio::test]
    async fn empty_install_root_is_no_apps_installed() {
        let scanner = AppScanner::new(FakeSource::new(&[]), DEFAULT_SCAN_TTL);
        assert!(matches!(scanner.scan(false).await, Err(MiniAppError::NoAppsInstalled)));
    }

    #[tokio::test]
    async fn broken_manifest_is_skipped() {
        let source = FakeSource::new(&[("x", Some(X)), ("broken", Some("{")), ("missing", None)]);
        let scanner = AppScanner::new(source, DEFAULT_SCAN_TTL);
        let apps = scanner.scan(false).await.unwrap();
        assert_eq!(apps.len(), 1);
        assert_eq!(apps[0].app_id, "x");
        assert_eq!(apps[0].entry_point, "index.html");
    }

    #[tokio::test(start_paused = true)]
    async fn cache_is_reused_within_ttl_and_refreshed_after() {
        let source = FakeSource::new(&[("x", Some(X))]);
        let scanner = AppScanner::new(source.clone(), DEFAULT_SCAN_TTL);

        let first = scanner.scan(false).await.unwrap();
        let second = scanner.scan(false).await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(source.calls(), 1);

        tokio::time::advance(DEFAULT_SCAN_TTL + Duration::from_secs(1)).await;
        let third = scanner.scan(false).await.unwrap();
        assert_eq!(source.calls(), 2);
        assert_eq!(*first, *third);
    }

    #[tokio::test]
    async fn clear_cache_forces_rescan_and_notifies() {
        let source = FakeSource::new(&[("x", Some(X))]);
        let scanner = AppScanner::new(source.clone(), DEFAULT_SCAN_TTL);
        let mut changes = scanner.subscribe_changes();

        scanner.scan(false).await.unwrap();
        scanner.clear_cache();
        scanner.scan(false).await.unwrap();
        assert_eq!(source.calls(), 2);
        assert!(changes.has_changed().unwrap());
        assert_eq!(*changes.borrow_and_update(), 1);

        scanner.scan(true).await.unwrap();
        assert_eq!(source.calls(), 3);
    }

    #[tokio::test]
    async fn no_apps_does_not_replace_existing_cache() {
        let source = FakeSource::new(&[("x", Some(X))]);
        let scanner = AppScanner::new(source.clone(), DEFAULT_SCAN_TTL);
        scanner.scan(false).await.unwrap();
        source.manifests.lock().unwrap().clear();

        assert!(matches!(scanner.scan(true).await, Err(MiniAppError::NoAppsInstalled)));
        assert_eq!(scanner.scan(false).await.unwrap().len(), 1);
        assert!(!scanner.is_installed("x").await.unwrap());
    }

    #[tokio::test]
    async fn scan_in_flight_during_clear_does_not_repopulate_cache() {
        let source = Arc::new(StallingSource {
            ids: std::sync::Mutex::new(vec!["old".to_string()]),
            stall_once: std::sync::atomic::AtomicBool::new(true),
            entered: tokio::sync::Notify::new(),
            release: tokio::sync::Notify::new(),
        });
        let scanner = Arc::new(AppScanner::new(source.clone(), DEFAULT_SCAN_TTL));

        let in_flight = tokio::spawn({
            let scanner = scanner.clone();
            async move { scanner.scan(true).await }
        });
        source.entered.notified().await;
        *source.ids.lock().unwrap() = vec!["new".to_string()];
        scanner.clear_cache();
        source.release.notify_one();

        let stale = in_flight.await.unwrap().unwrap();
        assert_eq!(stale[0].app_id, "old");

        let apps = scanner.scan(false).await.unwrap();
        let ids: Vec<_> = apps.iter().map(|app| app.app_id.as_str()).collect();
        assert_eq!(ids, vec!["new"]);
    }
}
